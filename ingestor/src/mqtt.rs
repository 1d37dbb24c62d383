use crate::config::BrokerConfig;
use crate::errors::{Error, Result};
use crate::metrics::{CHANNEL_FULL_TOTAL, MESSAGES_TOTAL};
use crate::request::{wait_for_reply, PendingReplies};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 1000;
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// A message received on one of our subscriptions.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl PublishOptions {
    pub fn at_least_once() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }
}

/// Outbound side of the broker, as seen by the command dispatcher.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()>;

    /// Publish `payload` to `topic` and wait for one message on
    /// `reply_topic`. Returns `Ok(None)` when nothing arrives in time.
    async fn request(
        &self,
        topic: &str,
        payload: Vec<u8>,
        reply_topic: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>>;
}

struct Connection {
    client: AsyncClient,
    task: JoinHandle<()>,
}

/// Owns the process's single broker connection.
pub struct BrokerManager {
    config: BrokerConfig,
    connection: Mutex<Option<Connection>>,
    connecting: Mutex<()>,
    inbound: mpsc::Sender<InboundMessage>,
    replies: Arc<PendingReplies>,
}

impl BrokerManager {
    /// Inbound publishes are forwarded to `inbound` once connected.
    pub fn new(config: BrokerConfig, inbound: mpsc::Sender<InboundMessage>) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
            connecting: Mutex::new(()),
            inbound,
            replies: Arc::new(PendingReplies::new()),
        }
    }

    pub fn replies(&self) -> Arc<PendingReplies> {
        self.replies.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| !c.task.is_finished())
    }

    async fn live_client(&self) -> Option<AsyncClient> {
        let guard = self.connection.lock().await;
        match guard.as_ref() {
            Some(connection) if !connection.task.is_finished() => Some(connection.client.clone()),
            Some(_) => {
                warn!("MQTT event loop has stopped, establishing a new connection");
                None
            }
            None => None,
        }
    }

    /// Connect and subscribe to the device wildcard. Returns the existing
    /// client if a connection is already up, and fails fast while another
    /// caller is still connecting.
    pub async fn connect(&self) -> Result<AsyncClient> {
        if let Some(client) = self.live_client().await {
            return Ok(client);
        }
        let Ok(_connecting) = self.connecting.try_lock() else {
            return Err(Error::Connection(
                "a connection attempt is already in progress".to_string(),
            ));
        };
        // The previous attempt may have succeeded while we waited for the slot
        if let Some(client) = self.live_client().await {
            return Ok(client);
        }

        let client_id = self
            .config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("iot-alerting-{}", uuid::Uuid::new_v4()));
        info!(
            "Connecting to MQTT broker at {}:{} as {}",
            self.config.host, self.config.port, client_id
        );

        let mut mqtt_options = MqttOptions::new(client_id, &self.config.host, self.config.port);
        mqtt_options.set_keep_alive(self.config.keep_alive);
        mqtt_options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        let driver = EventLoopDriver {
            client: client.clone(),
            subscription: self.config.subscription(),
            inbound: self.inbound.clone(),
            replies: self.replies.clone(),
            reconnect_interval: self.config.reconnect_interval,
            ready: Some(ready_tx),
            connected_once: false,
        };
        let task = tokio::spawn(driver.run(eventloop));

        let outcome = match tokio::time::timeout(self.config.connect_timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Connection(
                "event loop stopped before the subscription completed".to_string(),
            )),
            Err(_) => Err(Error::Connection(format!(
                "timed out after {:?} connecting to {}:{}",
                self.config.connect_timeout, self.config.host, self.config.port
            ))),
        };

        match outcome {
            Ok(()) => {
                info!("Subscribed to {} with QoS 1", self.config.subscription());
                *self.connection.lock().await = Some(Connection {
                    client: client.clone(),
                    task,
                });
                Ok(client)
            }
            Err(e) => {
                task.abort();
                Err(e)
            }
        }
    }

    /// Close the connection if there is one.
    pub async fn disconnect(&self) -> Result<()> {
        let connection = self.connection.lock().await.take();
        let Some(mut connection) = connection else {
            return Ok(());
        };

        if let Err(e) = connection.client.disconnect().await {
            warn!("Failed to send MQTT disconnect: {}", e);
        }
        if tokio::time::timeout(DISCONNECT_GRACE, &mut connection.task)
            .await
            .is_err()
        {
            connection.task.abort();
        }
        info!("Disconnected from MQTT broker");
        Ok(())
    }

    /// Publish, connecting first if needed.
    pub async fn publish_bytes(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<()> {
        let client = self.connect().await?;
        client
            .publish(topic, options.qos, options.retain, payload)
            .await?;
        debug!("Published to topic: {}", topic);
        Ok(())
    }

    async fn exchange(
        &self,
        client: &AsyncClient,
        topic: &str,
        payload: Vec<u8>,
        reply_topic: &str,
        rx: oneshot::Receiver<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        client.subscribe(reply_topic, QoS::AtLeastOnce).await?;
        client.publish(topic, QoS::AtLeastOnce, false, payload).await?;
        Ok(wait_for_reply(rx, timeout).await)
    }
}

#[async_trait]
impl Broker for BrokerManager {
    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()> {
        self.publish_bytes(topic, payload, options).await
    }

    async fn request(
        &self,
        topic: &str,
        payload: Vec<u8>,
        reply_topic: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let client = self.connect().await?;
        let (waiter, rx) = self.replies.register(reply_topic).await;

        let outcome = self
            .exchange(&client, topic, payload, reply_topic, rx, timeout)
            .await;

        // Deregister whatever the outcome
        self.replies.remove(reply_topic, waiter).await;
        if let Err(e) = client.unsubscribe(reply_topic).await {
            debug!("Failed to unsubscribe from {}: {}", reply_topic, e);
        }
        outcome
    }
}

struct EventLoopDriver {
    client: AsyncClient,
    subscription: String,
    inbound: mpsc::Sender<InboundMessage>,
    replies: Arc<PendingReplies>,
    reconnect_interval: Duration,
    ready: Option<oneshot::Sender<Result<()>>>,
    connected_once: bool,
}

impl EventLoopDriver {
    async fn run(mut self, mut eventloop: EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    MESSAGES_TOTAL.inc();
                    debug!(
                        "Received message on topic {}, size: {} bytes",
                        publish.topic,
                        publish.payload.len()
                    );
                    self.dispatch(publish.topic, publish.payload.to_vec()).await;
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if self.connected_once {
                        info!("Reconnected to MQTT broker: {:?}", ack.code);
                    } else {
                        info!("Connected to MQTT broker: {:?}", ack.code);
                    }
                    self.connected_once = true;

                    // Clean sessions drop subscriptions, so subscribe on every connect
                    if let Err(e) = self
                        .client
                        .try_subscribe(self.subscription.clone(), QoS::AtLeastOnce)
                    {
                        error!("Failed to subscribe to {}: {}", self.subscription, e);
                        self.signal_ready(Err(Error::Mqtt(e)));
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        error!("Broker refused subscription (pkid {})", ack.pkid);
                        self.signal_ready(Err(Error::Connection(format!(
                            "broker refused subscription to {}",
                            self.subscription
                        ))));
                    } else {
                        debug!("Subscription acknowledged");
                        self.signal_ready(Ok(()));
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("MQTT broker closed the connection");
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("MQTT disconnect sent, stopping event loop");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT error: {}", e);
                    // rumqttc reconnects on the next poll
                    warn!(
                        "MQTT connection offline, reconnecting in {:?}",
                        self.reconnect_interval
                    );
                    tokio::time::sleep(self.reconnect_interval).await;
                    info!("Reconnecting to MQTT broker");
                }
            }
        }
    }

    fn signal_ready(&mut self, result: Result<()>) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(result);
        }
    }

    async fn dispatch(&self, topic: String, payload: Vec<u8>) {
        if self.replies.complete(&topic, &payload).await {
            debug!("Delivered reply on {}", topic);
            return;
        }

        match self.inbound.try_send(InboundMessage { topic, payload }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                CHANNEL_FULL_TOTAL.inc();
                debug!("Channel full, using blocking send");
                if self.inbound.send(message).await.is_err() {
                    error!("Router channel closed, dropping message");
                }
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                error!(
                    "Router channel closed, dropping message on {}",
                    message.topic
                );
            }
        }
    }
}
