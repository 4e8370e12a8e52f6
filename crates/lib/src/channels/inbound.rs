//! Inbound event from the channel: delivered to the dispatcher for handling.

/// A normalized Telegram update. `update_id` doubles as the de-duplication key
/// for idempotent session writes.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub update_id: i64,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    /// Direct message to the bot (owner command surface).
    Message(MessageEvent),
    /// Business connection established, changed, or removed.
    ConnectionUpdate {
        connection_id: String,
        owner_id: i64,
        enabled: bool,
    },
    /// Message in a chat the bot is connected to via Telegram Business.
    BusinessMessage(MessageEvent),
}

/// One inbound message, direct or business.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub sender_id: i64,
    pub sender_username: Option<String>,
    pub chat_id: i64,
    pub text: Option<String>,
    pub document: Option<DocumentRef>,
    /// Set on business messages; replies must be routed through this connection.
    pub business_connection_id: Option<String>,
}

/// Reference to an uploaded document (fetched on demand via getFile).
#[derive(Debug, Clone)]
pub struct DocumentRef {
    pub file_id: String,
    pub file_name: Option<String>,
}
