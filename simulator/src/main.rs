mod device;

use clap::Parser;
use device::{control_reply, SimDevice};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "device-simulator", about = "Publishes simulated device traffic")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "MQTT_TOPIC_PREFIX", default_value = "iot/devices")]
    prefix: String,

    /// Number of simulated devices
    #[arg(long, env = "DEVICES", default_value_t = 9)]
    devices: usize,

    /// Milliseconds between telemetry rounds
    #[arg(long, env = "INTERVAL_MS", default_value_t = 1000)]
    interval_ms: u64,

    /// Send a status message every this many rounds
    #[arg(long, env = "STATUS_EVERY", default_value_t = 30)]
    status_every: u64,

    /// Print a device registry TOML for the ingestor and exit
    #[arg(long)]
    print_devices: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let prefix = args.prefix.trim_end_matches('/').to_string();

    let mut rng = rand::thread_rng();
    let mut devices: Vec<SimDevice> = (0..args.devices)
        .map(|i| SimDevice::new(i, &prefix, &mut rng))
        .collect();

    if args.print_devices {
        for device in &devices {
            println!("[[devices]]");
            println!("id = \"{}\"", device.id);
            println!("name = \"Simulated {}\"", device.id);
            println!("device_type = \"{}\"", device.kind.as_str());
            println!("topic = \"{}\"\n", device.topic);
        }
        return Ok(());
    }

    info!("Starting device simulator");
    info!(
        "Broker: {}:{}, Devices: {}, Interval: {}ms",
        args.broker, args.port, args.devices, args.interval_ms
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    // Control messages are answered from a separate task so the event loop
    // never waits on its own request queue.
    let (control_tx, mut control_rx) = mpsc::channel::<(String, Vec<u8>)>(1000);

    let control_topics = [format!("{}/+/ping", prefix), format!("{}/+/commands", prefix)];
    let subscriber = client.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    for topic in &control_topics {
                        if let Err(e) = subscriber.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                            error!("Failed to subscribe to {}: {}", topic, e);
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = (publish.topic, publish.payload.to_vec());
                    if control_tx.try_send(message).is_err() {
                        warn!("Control queue full, dropping message");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT eventloop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let responder = client.clone();
    tokio::spawn(async move {
        while let Some((topic, payload)) = control_rx.recv().await {
            let Some((reply_topic, reply)) = control_reply(&topic, &payload) else {
                debug!("No reply needed for {}", topic);
                continue;
            };
            info!("Answering {} on {}", topic, reply_topic);
            if let Err(e) = publish(&responder, &reply_topic, &reply).await {
                warn!("Failed to publish reply: {}", e);
            }
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms));
    let mut round = 0u64;
    let status_every = args.status_every.max(1);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                round += 1;
                for device in devices.iter_mut() {
                    let message = if round % status_every == 0 {
                        device.status(&mut rng)
                    } else {
                        device.telemetry(&mut rng)
                    };
                    if let Err(e) = publish(&client, &device.topic, &message).await {
                        warn!("Failed to publish for {}: {}", device.id, e);
                    }
                    if let Some(alert) = device.alert(&mut rng) {
                        if let Err(e) = publish(&client, &device.topic, &alert).await {
                            warn!("Failed to publish alert for {}: {}", device.id, e);
                        }
                    }
                }
                if round % 60 == 0 {
                    info!("Published {} rounds for {} devices", round, devices.len());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    if let Err(e) = client.disconnect().await {
        warn!("Failed to disconnect cleanly: {}", e);
    }
    Ok(())
}

async fn publish(client: &AsyncClient, topic: &str, message: &Value) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(message)?;
    client
        .publish(topic, QoS::AtLeastOnce, false, payload)
        .await?;
    Ok(())
}
