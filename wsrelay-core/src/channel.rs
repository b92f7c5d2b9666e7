//! Named pub/sub channels.
//!
//! A channel is a type implementing [`Channel`]. Its name defaults to the
//! snake_case form of the type name, so `struct LiveStreams;` becomes the
//! `live_streams` channel:
//!
//! ```
//! use wsrelay_core::channel::Channel;
//!
//! struct PriceUpdates;
//! impl Channel for PriceUpdates {}
//!
//! assert_eq!(PriceUpdates.name(), "price_updates");
//! ```
//!
//! The name `state` is reserved for the online-count broadcast and cannot be
//! used by a registered channel.

use crate::error::Result;
use crate::messenger::Messenger;
use serde::Serialize;
use std::sync::Arc;

/// Channel carrying `{num_clients, num_online}` after every connect and disconnect.
pub const STATE_CHANNEL: &str = "state";

/// A pub/sub channel clients receive broadcasts on.
pub trait Channel: Send + Sync + 'static {
    /// Wire name of the channel.
    fn name(&self) -> String {
        channel_name_of::<Self>()
    }
}

/// Derives a channel name from a type: the last path segment, without
/// generic arguments, in snake_case.
pub fn channel_name_of<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    let ident = base.rsplit("::").next().unwrap_or(base);
    to_snake_case(ident)
}

fn to_snake_case(ident: &str) -> String {
    let chars: Vec<char> = ident.chars().collect();
    let mut out = String::with_capacity(ident.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev_lower = i > 0 && (chars[i - 1].is_lowercase() || chars[i - 1].is_ascii_digit());
            let acronym_end = i > 0
                && chars[i - 1].is_uppercase()
                && chars.get(i + 1).is_some_and(|next| next.is_lowercase());
            if prev_lower || acronym_end {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }

    out
}

/// Live stream announcements.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveStreams;

impl Channel for LiveStreams {}

/// Channels every runtime subscribes to unless told otherwise.
pub fn builtin() -> Vec<Arc<dyn Channel>> {
    vec![Arc::new(LiveStreams)]
}

/// Publishing side of a registered channel.
#[derive(Clone)]
pub struct ChannelHandle {
    name: String,
    messenger: Arc<Messenger>,
}

impl ChannelHandle {
    pub(crate) fn new(name: String, messenger: Arc<Messenger>) -> Self {
        Self { name, messenger }
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serializes `message` to JSON and publishes it.
    pub async fn publish<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.publish_raw(&json).await
    }

    /// Publishes an already encoded message.
    pub async fn publish_raw(&self, message: &str) -> Result<()> {
        self.messenger.publish(&self.name, message).await
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("name", &self.name)
            .finish()
    }
}
