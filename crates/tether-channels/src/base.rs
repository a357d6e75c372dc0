use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use tether_core::bus::{InboundMessage, OutboundMessage};

/// Trait that all chat channel implementations must satisfy.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name (e.g. "telegram", "web").
    fn name(&self) -> &str;

    /// Start listening for messages. Sends inbound messages through the provided sender.
    async fn start(&self, inbound_tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Stop the channel and clean up resources.
    async fn stop(&self) -> Result<()>;

    /// Send a message through this channel.
    async fn send(&self, msg: &OutboundMessage) -> Result<()>;

    /// Check if a sender is allowed to use this gateway.
    fn is_allowed(&self, sender_id: &str) -> bool;

    /// Whether the channel currently has a live connection to its platform.
    fn is_connected(&self) -> bool {
        false
    }

    /// Pairing code for channels that link via a scannable code.
    fn pairing_code(&self) -> Option<String> {
        None
    }
}
