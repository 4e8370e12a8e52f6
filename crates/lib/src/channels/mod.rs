//! Communication channel (Telegram).
//!
//! The connector long-polls (or receives webhooks) and normalizes updates into
//! inbound events for the dispatcher. `ChannelHandle` is the outbound seam so the
//! dispatcher and tests do not depend on the concrete Telegram client.

mod inbound;
mod telegram;

pub use inbound::{DocumentRef, EventKind, InboundEvent, MessageEvent};
pub use telegram::{backoff_delay, ChannelError, TelegramChannel, TelegramUpdate};

use async_trait::async_trait;

/// Handle to a running channel (stop, outbound sends).
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Channel id (e.g. "telegram").
    fn id(&self) -> &str;

    /// Stop the channel connector.
    fn stop(&self);

    /// Send a text message to a chat. `business_connection_id` routes the message
    /// through a Telegram Business connection.
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        business_connection_id: Option<&str>,
    ) -> Result<(), ChannelError>;

    /// Best-effort "typing" indicator; never retried.
    async fn send_typing(
        &self,
        chat_id: i64,
        business_connection_id: Option<&str>,
    ) -> Result<(), ChannelError>;

    /// Fetch the raw bytes of an uploaded document (chat-export files).
    async fn download_document(&self, file_id: &str) -> Result<Vec<u8>, ChannelError>;

    /// Deliver a reply: one retry on failure, then log and swallow. Permanent
    /// delivery failures (e.g. blocked by the recipient) are not fatal.
    async fn deliver(&self, chat_id: i64, text: &str, business_connection_id: Option<&str>) {
        if self
            .send_message(chat_id, text, business_connection_id)
            .await
            .is_ok()
        {
            return;
        }
        if let Err(e) = self.send_message(chat_id, text, business_connection_id).await {
            log::warn!("channel {}: delivery failed after retry: {}", self.id(), e);
        }
    }
}
