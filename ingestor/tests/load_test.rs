// Live tests against a broker on localhost:1883. Run with `--ignored`.

use chrono::Utc;
use iot_alerting::config::BrokerConfig;
use iot_alerting::mqtt::{Broker, BrokerManager, PublishOptions};
use rand::Rng;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn telemetry_payload(device_index: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let envelope = json!({
        "type": "telemetry",
        "data": {
            "moisture": rng.gen_range(5.0..60.0),
            "temperature": rng.gen_range(15.0..45.0),
        },
        "battery": {
            "level": rng.gen_range(5.0..100.0),
            "charging": device_index % 4 == 0,
        },
        "signalStrength": rng.gen_range(-90.0..-40.0),
        "timestamp": Utc::now(),
    });
    serde_json::to_vec(&envelope).unwrap()
}

fn config(prefix: &str) -> BrokerConfig {
    BrokerConfig {
        topic_prefix: prefix.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
#[ignore]
async fn test_connect_subscribe_and_receive() {
    let prefix = format!("load-test/{}", uuid::Uuid::new_v4());
    let (tx, mut rx) = mpsc::channel(100);
    let manager = BrokerManager::new(config(&prefix), tx);

    manager.connect().await.unwrap();
    assert!(manager.is_connected().await);
    // Second connect reuses the live connection
    manager.connect().await.unwrap();

    let topic = format!("{}/dev-0", prefix);
    manager
        .publish(&topic, telemetry_payload(0), PublishOptions::at_least_once())
        .await
        .unwrap();

    let message = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no message within 5s")
        .unwrap();
    assert_eq!(message.topic, topic);

    manager.disconnect().await.unwrap();
    assert!(!manager.is_connected().await);
}

#[tokio::test]
#[ignore]
async fn test_request_times_out_without_responder() {
    let prefix = format!("load-test/{}", uuid::Uuid::new_v4());
    let (tx, _rx) = mpsc::channel(100);
    let manager = BrokerManager::new(config(&prefix), tx);

    let reply = manager
        .request(
            &format!("{}/dev-0/ping", prefix),
            b"{\"type\":\"ping\"}".to_vec(),
            &format!("{}/dev-0/pong", prefix),
            Duration::from_millis(500),
        )
        .await
        .unwrap();
    assert!(reply.is_none());
    assert!(manager.replies().is_empty().await);

    manager.disconnect().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_1000_messages_per_second() {
    println!("\n🚀 Starting Load Test: 1000 msg/s");

    let test_duration_secs = 10;
    let target_rate = 1000;
    let total_messages = test_duration_secs * target_rate;

    let (tx, _rx) = mpsc::channel(total_messages);
    let manager = BrokerManager::new(config("load-test/devices"), tx);
    manager.connect().await.unwrap();

    sleep(Duration::from_millis(500)).await;

    let start = Instant::now();
    let mut sent_count = 0;
    let mut error_count = 0;

    let burst_size = 100;
    let delay_per_burst = Duration::from_micros((burst_size * 1_000_000) / target_rate as u64);

    for batch_start in (0..total_messages).step_by(burst_size as usize) {
        for i in batch_start..std::cmp::min(batch_start + burst_size as usize, total_messages) {
            let device_index = i % 10;
            let topic = format!("load-test/devices/load-test-dev-{}", device_index);

            match manager
                .publish(
                    &topic,
                    telemetry_payload(device_index),
                    PublishOptions::at_least_once(),
                )
                .await
            {
                Ok(()) => sent_count += 1,
                Err(e) => {
                    error_count += 1;
                    if error_count < 10 {
                        eprintln!("Send error: {}", e);
                    }
                }
            }
        }

        sleep(delay_per_burst).await;
    }

    let duration = start.elapsed();
    let actual_rate = sent_count as f64 / duration.as_secs_f64();

    println!("\n📈 Results:");
    println!("  Total Sent:     {}", sent_count);
    println!("  Errors:         {}", error_count);
    println!("  Duration:       {:.2}s", duration.as_secs_f64());
    println!("  Actual Rate:    {:.2} msg/s", actual_rate);

    manager.disconnect().await.unwrap();

    assert!(
        actual_rate >= 900.0,
        "Throughput too low: {:.2} msg/s (expected >= 900)",
        actual_rate
    );
    assert_eq!(error_count, 0, "Too many errors: {}", error_count);
}
