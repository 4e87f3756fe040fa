use std::env;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{error, info, warn};

/// How long to wait before retrying a failed broker connection.
pub const RECONNECT_PERIOD: Duration = Duration::from_millis(500);

const KEEP_ALIVE: Duration = Duration::from_secs(5);
const EVENT_BUFFER_SIZE: usize = 64;

const ROBOT_ID_VAR: &str = "<robot_id>";
const OPERATION_VAR: &str = "<operation>";

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("topic pattern '{pattern}' must contain the substring '{missing}'")]
    InvalidTopicPattern { pattern: String, missing: &'static str },
    #[error("failed to queue broker request: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Per-robot topic layout generated from a pattern containing the literals
/// `<robot_id>` and `<operation>`, e.g. `ota/<robot_id>/<operation>`.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    pattern: String,
}

impl TopicPattern {
    /// Patterns missing either substitution are rejected at construction,
    /// before any connection is attempted.
    pub fn new(pattern: &str) -> Result<Self, BrokerError> {
        for missing in [ROBOT_ID_VAR, OPERATION_VAR] {
            if !pattern.contains(missing) {
                return Err(BrokerError::InvalidTopicPattern {
                    pattern: pattern.to_string(),
                    missing,
                });
            }
        }

        Ok(Self {
            pattern: pattern.to_string(),
        })
    }

    fn render(&self, robot_id: &str, operation: &str) -> String {
        self.pattern
            .replace(ROBOT_ID_VAR, robot_id)
            .replace(OPERATION_VAR, operation)
    }

    /// Topic the cloud publishes deploy messages on (cloud -> daemon).
    pub fn deploy(&self, robot_id: &str) -> String {
        self.render(robot_id, "deploy")
    }

    /// Topic a daemon publishes its state snapshots on (daemon -> cloud).
    pub fn state(&self, robot_id: &str) -> String {
        self.render(robot_id, "state")
    }

    /// Topic the cloud publishes acks on (cloud -> daemon).
    pub fn ack(&self, robot_id: &str) -> String {
        self.render(robot_id, "ack")
    }

    /// Wildcard subscription matching the state topic of every robot.
    pub fn state_subscription(&self) -> String {
        self.render("+", "state")
    }

    /// Recover the robot id from a concrete state topic, or `None` when the
    /// topic does not match the pattern.
    pub fn robot_id_from_state(&self, topic: &str) -> Option<String> {
        let rendered = self.pattern.replace(OPERATION_VAR, "state");
        let (prefix, suffix) = rendered.split_once(ROBOT_ID_VAR)?;

        let robot_id = topic.strip_prefix(prefix)?.strip_suffix(suffix)?;

        // A single `+` level never matches across separators.
        (!robot_id.is_empty() && !robot_id.contains('/')).then(|| robot_id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerTransport {
    Tcp,
    Websockets,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub transport: BrokerTransport,
    pub ws_path: Option<String>,
    pub topic_pattern: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            transport: BrokerTransport::Tcp,
            ws_path: None,
            topic_pattern: "ota/<robot_id>/<operation>".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Environment overrides, kept compatible with the deployment manifests.
    pub fn apply_env(&mut self) {
        if let Ok(host) = env::var("MQTT_HOST") {
            self.host = host;
        }
        if let Some(port) = env::var("MQTT_PORT").ok().and_then(|raw| raw.parse().ok()) {
            self.port = port;
        }
    }

    pub fn topic_pattern(&self) -> Result<TopicPattern, BrokerError> {
        TopicPattern::new(&self.topic_pattern)
    }
}

/// A publish received on one of the subscribed topics.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
}

/// The publish seam, so orchestration code can be exercised without a
/// running broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
}

/// Handle to a durable broker connection.
///
/// The network loop runs on its own task: it retries failed connections
/// forever with a fixed backoff, re-subscribes after every successful
/// (re)connect and forwards publishes to the receiver handed out by
/// [`Broker::connect`]. Losing the connection therefore never surfaces to
/// callers; publishes are queued on the client and flushed once the loop
/// is connected again.
#[derive(Clone)]
pub struct Broker {
    client: AsyncClient,
}

impl Broker {
    /// Connect to the broker and subscribe to `subscriptions`. Must be
    /// called from within a tokio runtime.
    pub fn connect(
        config: &BrokerConfig,
        client_id: &str,
        subscriptions: Vec<String>,
    ) -> (Self, mpsc::Receiver<Message>) {
        let mut options = match config.transport {
            BrokerTransport::Tcp => MqttOptions::new(client_id, &config.host, config.port),
            BrokerTransport::Websockets => {
                let path = config.ws_path.as_deref().unwrap_or("");
                let url = format!("ws://{}:{}{}", config.host, config.port, path);
                let mut options = MqttOptions::new(client_id, url, config.port);
                options.set_transport(Transport::Ws);
                options
            }
        };
        options.set_keep_alive(KEEP_ALIVE);

        let (client, event_loop) = AsyncClient::new(options, EVENT_BUFFER_SIZE);
        let (message_send, message_recv) = mpsc::channel(EVENT_BUFFER_SIZE);

        tokio::spawn(network_loop(
            event_loop,
            client.clone(),
            subscriptions,
            message_send,
        ));

        (Self { client }, message_recv)
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(BrokerError::from)
    }
}

#[async_trait]
impl Publisher for Broker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        Broker::publish(self, topic, payload).await
    }
}

async fn network_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    subscriptions: Vec<String>,
    messages: mpsc::Sender<Message>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("connected to broker");

                // Sessions are not persistent, so every reconnect needs the
                // subscriptions re-established.
                for topic in &subscriptions {
                    if let Err(error) = client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                        error!(
                            topic = topic.as_str(),
                            error = &error as &dyn std::error::Error,
                            "failed to subscribe"
                        );
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = Message {
                    topic: publish.topic,
                    payload: publish.payload,
                };

                // Receiver dropped means the process is shutting down.
                if messages.send(message).await.is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(error) => {
                warn!(
                    error = %error,
                    "lost connection to broker, retrying in {RECONNECT_PERIOD:?}"
                );
                time::sleep(RECONNECT_PERIOD).await;
            }
        }
    }
}
