//! Fan-out of channel messages to connected clients.
//!
//! The [`Messenger`] sits between the broker and the registry. Messages
//! published through it go to the broker when one is configured, and come
//! back through the channel subscriptions; without a broker they are
//! broadcast locally right away.
//!
//! Every client receives the same envelope:
//!
//! ```text
//! {"channel": "<name>", "message": <decoded JSON>}
//! ```
//!
//! Broadcasts never wait on a slow client: a frame that cannot be written
//! right away joins the client's outbound queue and goes out after the write
//! in progress. A client whose socket fails is evicted.

use crate::broker::{is_bracketed_json, Broker, BrokerMessage};
use crate::channel::{Channel, ChannelHandle, STATE_CHANNEL};
use crate::client::{Client, SendOutcome};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::frame::{self, Opcode};
use crate::registry::ClientRegistry;
use crate::scheduler::{suspend, Scheduler};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Per-broadcast delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Clients that received the frame.
    pub delivered: usize,
    /// Clients whose frame waits behind a write in progress.
    pub queued: usize,
    /// Clients passed over because their handshake is not done.
    pub skipped: usize,
    /// Clients evicted after a failed write.
    pub evicted: usize,
}

/// Payload of the `state` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OnlineCount {
    /// Registered connections.
    pub num_clients: usize,
    /// Distinct fingerprints among them.
    pub num_online: usize,
}

/// Publishes to channels and broadcasts to clients.
pub struct Messenger {
    registry: Arc<ClientRegistry>,
    broker: Option<Arc<Broker>>,
    channels: DashMap<String, Arc<dyn Channel>>,
    read_poll: Duration,
}

impl Messenger {
    /// Creates a messenger over an existing registry and optional broker.
    pub fn new(registry: Arc<ClientRegistry>, broker: Option<Broker>, read_poll: Duration) -> Self {
        Self {
            registry,
            broker: broker.map(Arc::new),
            channels: DashMap::new(),
            read_poll,
        }
    }

    /// Connects to the configured broker, if any.
    pub async fn connect(registry: Arc<ClientRegistry>, config: &ServerConfig) -> Result<Self> {
        let broker = match &config.broker {
            Some(broker) => Some(Broker::connect(broker).await?),
            None => {
                info!("running without broker, publishes stay local");
                None
            }
        };
        Ok(Self::new(registry, broker, config.read_poll()))
    }

    /// Client registry.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Returns `true` when publishes go through a broker.
    pub fn has_broker(&self) -> bool {
        self.broker.is_some()
    }

    /// Registers channels and queues one subscription task per channel.
    pub fn start(self: &Arc<Self>, channels: Vec<Arc<dyn Channel>>, scheduler: &Scheduler) {
        for channel in channels {
            let name = channel.name();
            if name == STATE_CHANNEL {
                warn!("channel name [{}] is reserved, skipping", name);
                continue;
            }
            if self.channels.insert(name.clone(), channel).is_some() {
                warn!("channel [{}] registered twice", name);
                continue;
            }

            if let Some(broker) = &self.broker {
                scheduler.enqueue(
                    format!("subscribe:{name}"),
                    run_subscription(self.clone(), broker.clone(), name.clone()),
                );
            }
            debug!("channel [{}] registered", name);
        }
    }

    /// Names of registered channels.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Publishing handle for a registered channel.
    pub fn channel(self: &Arc<Self>, name: &str) -> Option<ChannelHandle> {
        self.channels
            .contains_key(name)
            .then(|| ChannelHandle::new(name.to_string(), self.clone()))
    }

    /// Publishes a message on a channel.
    ///
    /// With a broker the message reaches clients through the subscription
    /// loop, on this node and every other one. Without a broker it is
    /// broadcast locally.
    pub async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        match &self.broker {
            Some(broker) => {
                let written = broker.publish(channel, message).await?;
                debug!(channel, bytes = written, "published to broker");
            }
            None => {
                self.broadcast(channel, message);
            }
        }
        Ok(())
    }

    /// Sends a message to every established client.
    ///
    /// `message` is decoded as JSON for the envelope; text that is not JSON
    /// is carried as a JSON string.
    pub fn broadcast(&self, channel: &str, message: &str) -> BroadcastReport {
        let value = serde_json::from_str::<Value>(message)
            .unwrap_or_else(|_| Value::String(message.to_string()));
        self.broadcast_value(channel, value)
    }

    /// Sends an already decoded message to every established client.
    pub fn broadcast_value(&self, channel: &str, message: Value) -> BroadcastReport {
        let envelope = json!({ "channel": channel, "message": message });
        let frame = frame::encode(envelope.to_string().as_bytes(), Opcode::Text);
        let mut report = BroadcastReport::default();

        for client in self.registry.snapshot() {
            if !client.is_established() {
                report.skipped += 1;
                continue;
            }
            match client.send_or_queue(frame.clone()) {
                Ok(SendOutcome::Sent) => report.delivered += 1,
                Ok(SendOutcome::Queued | SendOutcome::Busy) => report.queued += 1,
                Err(e) => {
                    warn!(client = %client.id(), error = %e, "broadcast failed, evicting client");
                    self.evict(&client);
                    report.evicted += 1;
                }
            }
        }

        debug!(
            "Broadcast on [{}] complete: {} delivered, {} queued, {} skipped, {} evicted",
            channel, report.delivered, report.queued, report.skipped, report.evicted
        );
        report
    }

    /// Current connection and unique-visitor counts.
    pub fn online_count(&self) -> OnlineCount {
        OnlineCount {
            num_clients: self.registry.len(),
            num_online: self.registry.unique_count(),
        }
    }

    /// Broadcasts [`online_count`](Self::online_count) on the `state` channel.
    pub fn broadcast_online_count(&self) -> BroadcastReport {
        let count = self.online_count();
        self.broadcast_value(
            STATE_CHANNEL,
            json!({ "num_clients": count.num_clients, "num_online": count.num_online }),
        )
    }

    /// Removes a client from the registry and marks it closing.
    ///
    /// The socket is released once the client's tasks notice and return.
    pub fn evict(&self, client: &Client) -> bool {
        let removed = self.registry.remove(client.id());
        if client.begin_closing() || removed {
            info!(client = %client.id(), "client evicted");
        }
        removed
    }

    fn deliver(&self, message: BrokerMessage) {
        if !is_bracketed_json(&message.payload) {
            debug!(channel = %message.channel, "ignoring non-JSON broker payload");
            return;
        }
        self.broadcast(&message.channel, &message.payload);
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("registry", &self.registry)
            .field("broker", &self.broker.is_some())
            .field("channels", &self.channel_names())
            .finish()
    }
}

async fn run_subscription(messenger: Arc<Messenger>, broker: Arc<Broker>, channel: String) {
    match broker.subscribe(&channel).await {
        Ok(_) => info!("subscribed to [{}]", channel),
        Err(e) => {
            error!(channel = %channel, error = %e, "subscribe failed");
            return;
        }
    }

    loop {
        match broker.next_messages(messenger.read_poll).await {
            Ok(messages) => {
                for message in messages {
                    messenger.deliver(message);
                }
            }
            Err(e) => {
                error!(channel = %channel, error = %e, "subscription ended");
                return;
            }
        }
        suspend().await;
    }
}
