//! Named broadcast channels spanning the windows of one session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use tandem_common::{Error, Result};

/// Default capacity of each named channel.
///
/// Large enough for bursty UI updates; a slower subscriber that falls further
/// behind observes a lag and logs it.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Publish/subscribe medium carrying serialized messages.
///
/// Delivery reaches every subscriber, including the publisher's own
/// subscription, in publish order per publisher.
pub trait BroadcastChannel: Send + Sync {
    /// Channel name.
    fn name(&self) -> &str;

    /// Publish a message without waiting for delivery.
    ///
    /// # Returns
    /// Number of subscribers the message was queued for.
    ///
    /// # Errors
    /// - No subscriber is listening
    fn publish(&self, message: String) -> Result<usize>;

    /// Subscribe to messages published from now on.
    fn subscribe(&self) -> broadcast::Receiver<String>;
}

/// Hub handing out named in-process channels.
///
/// Windows that join the same name on the same hub share one channel.
#[derive(Clone)]
pub struct BroadcastHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    capacity: usize,
}

impl BroadcastHub {
    /// Create a hub with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a hub whose channels buffer `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Join the channel called `name`, creating it on first use.
    pub fn join(&self, name: &str) -> ChannelHandle {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let tx = channels
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(channel = name, "Creating broadcast channel");
                broadcast::channel(self.capacity).0
            })
            .clone();

        ChannelHandle {
            name: name.to_string(),
            tx,
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One window's handle on a named channel.
#[derive(Clone)]
pub struct ChannelHandle {
    name: String,
    tx: broadcast::Sender<String>,
}

impl ChannelHandle {
    /// Number of live subscriptions on this channel.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl BroadcastChannel for ChannelHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, message: String) -> Result<usize> {
        match self.tx.send(message) {
            Ok(count) => {
                trace!(channel = %self.name, "Broadcast queued for {} subscribers", count);
                Ok(count)
            }
            Err(_) => Err(Error::Broadcast(format!(
                "No subscribers on channel '{}'",
                self.name
            ))),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("name", &self.name)
            .field("subscriber_count", &self.tx.receiver_count())
            .finish()
    }
}
