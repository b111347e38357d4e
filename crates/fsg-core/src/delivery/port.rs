use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    Result,
};

/// Outbound side of the gateway: copy archived content to a destination and
/// take delivered content down again.
#[async_trait]
pub trait DeliveryPort: Send + Sync {
    /// Copy the archived item at `location` into `destination`, returning the
    /// handle of the delivered copy.
    async fn deliver(
        &self,
        location: MessageRef,
        destination: ChatId,
        caption: Option<&str>,
    ) -> Result<MessageRef>;

    /// Plain text notice (auto-delete warnings, partial-failure reports).
    async fn send_notice(&self, destination: ChatId, text: &str) -> Result<MessageRef>;

    /// Remove a delivered message. "Already gone" surfaces as an error too; the
    /// caller decides whether that matters.
    async fn remove(&self, delivered: MessageRef) -> Result<()>;
}
