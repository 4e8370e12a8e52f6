//! Event dispatcher: command surface, upload mode, and the business auto-reply
//! pipeline.
//!
//! One dispatcher task consumes the inbound queue, so events are applied in
//! delivery order and no two events for the same correspondent ever race. Handled
//! events are recorded against the session with the update id as de-dup key;
//! unrecognized input takes the fallback path and writes nothing.

use crate::agent;
use crate::channels::{ChannelHandle, DocumentRef, EventKind, InboundEvent, MessageEvent};
use crate::llm::ChatBackend;
use crate::store::{Session, StateStore, StoreError, MIN_CORPUS_SIZE, SETTING_ENABLED};
use crate::style;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::RwLock;

/// Owner command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Status,
    Teach,
    Cancel,
    Clear,
    Enable,
    Disable,
}

/// Parse a slash command from message text. Accepts an optional bot mention
/// (`/start@my_bot`) and is case-insensitive; anything else is None.
pub fn parse_command(text: &str) -> Option<Command> {
    let first = text.trim().split_whitespace().next()?;
    let name = first.split('@').next().unwrap_or(first).to_ascii_lowercase();
    match name.as_str() {
        "/start" => Some(Command::Start),
        "/help" => Some(Command::Help),
        "/status" => Some(Command::Status),
        "/teach" => Some(Command::Teach),
        "/cancel" => Some(Command::Cancel),
        "/clear" => Some(Command::Clear),
        "/on" => Some(Command::Enable),
        "/off" => Some(Command::Disable),
        _ => None,
    }
}

const HELP_TEXT: &str = "commands:\n\
    /status - corpus size, auto-reply state, connections\n\
    /teach - upload chat exports (JSON) to learn your style\n\
    /clear - wipe the corpus and turn auto-replies off\n\
    /on - enable auto-replies (needs 10+ corpus messages)\n\
    /off - disable auto-replies\n\
    /cancel - leave upload mode";

const TEACH_TEXT: &str = "send me JSON files with your chat exports.\n\n\
    how to export:\n\
    1. Telegram Desktop -> open a dialog\n\
    2. three dots -> Export chat history\n\
    3. format: JSON\n\
    4. send the files here\n\n\
    /cancel to stop";

/// Session-state key: the owner is in upload mode.
const STATE_AWAITING_UPLOAD: &str = "awaitingUpload";

fn state_idle() -> serde_json::Value {
    serde_json::json!({})
}

fn state_awaiting() -> serde_json::Value {
    serde_json::json!({ STATE_AWAITING_UPLOAD: true })
}

fn awaiting_upload(session: Option<&Session>) -> bool {
    session
        .and_then(|s| s.state.get(STATE_AWAITING_UPLOAD))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn already_applied(session: Option<&Session>, update_id: i64) -> bool {
    session
        .and_then(|s| s.last_update_id)
        .is_some_and(|last| last >= update_id)
}

/// Routes inbound events to handlers. Holds the business-connection cache that
/// mirrors the `business_connections` table.
pub struct Dispatcher {
    store: Arc<dyn StateStore>,
    channel: Arc<dyn ChannelHandle>,
    backend: Arc<dyn ChatBackend>,
    owner_username: String,
    model: String,
    connections: RwLock<HashMap<String, i64>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        channel: Arc<dyn ChannelHandle>,
        backend: Arc<dyn ChatBackend>,
        owner_username: String,
        model: String,
        connections: HashMap<String, i64>,
    ) -> Self {
        Self {
            store,
            channel,
            backend,
            owner_username,
            model,
            connections: RwLock::new(connections),
        }
    }

    /// Consume the inbound queue until it closes. Sequential by design: the
    /// per-correspondent ordering guarantee falls out of the single consumer.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<InboundEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(event).await;
        }
        log::info!("dispatcher: inbound queue closed, stopping");
    }

    pub async fn handle_event(&self, event: InboundEvent) {
        match event.kind {
            EventKind::Message(msg) => self.handle_message(event.update_id, msg).await,
            EventKind::ConnectionUpdate {
                connection_id,
                owner_id,
                enabled,
            } => {
                self.handle_connection_update(connection_id, owner_id, enabled)
                    .await
            }
            EventKind::BusinessMessage(msg) => {
                self.handle_business_message(event.update_id, msg).await
            }
        }
    }

    fn is_owner(&self, msg: &MessageEvent) -> bool {
        msg.sender_username
            .as_deref()
            .is_some_and(|u| u.eq_ignore_ascii_case(&self.owner_username))
    }

    /// Direct messages: the owner command surface. Everyone else is ignored.
    async fn handle_message(&self, update_id: i64, msg: MessageEvent) {
        if !self.is_owner(&msg) {
            log::debug!("dispatch: ignoring direct message from non-owner {}", msg.sender_id);
            return;
        }
        let external_id = msg.sender_id.to_string();
        let session = match self.store.session(&external_id).await {
            Ok(s) => s,
            Err(e) => {
                log::warn!("dispatch: session lookup failed, dropping event: {}", e);
                return;
            }
        };
        if already_applied(session.as_ref(), update_id) {
            log::debug!("dispatch: update {} already applied, skipping", update_id);
            return;
        }
        let awaiting = awaiting_upload(session.as_ref());

        match self.handle_owner_action(&msg, awaiting).await {
            Ok(Some(new_state)) => {
                if let Err(e) = self
                    .store
                    .record_event(&external_id, update_id, &new_state)
                    .await
                {
                    log::warn!("dispatch: recording event {} failed: {}", update_id, e);
                }
            }
            // Fallback path: nothing recognized, nothing written.
            Ok(None) => {
                log::debug!("dispatch: no handler for update {}, ignoring", update_id);
            }
            Err(e) => {
                log::warn!("dispatch: dropping event {} after store error: {}", update_id, e);
            }
        }
    }

    /// Execute the owner's command. Returns the new session state for recording,
    /// or None when the event is unrecognized (fallback, no write).
    async fn handle_owner_action(
        &self,
        msg: &MessageEvent,
        awaiting: bool,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        if awaiting {
            if let Some(doc) = &msg.document {
                return self.handle_upload(msg, doc).await.map(Some);
            }
            if msg.text.as_deref().and_then(parse_command) == Some(Command::Cancel) {
                self.channel.deliver(msg.chat_id, "cancelled", None).await;
                return Ok(Some(state_idle()));
            }
            // Anything else while waiting for a file: leave upload mode untouched.
            return Ok(None);
        }

        let Some(command) = msg.text.as_deref().and_then(parse_command) else {
            return Ok(None);
        };
        match command {
            Command::Start => {
                let greeting = format!(
                    "hey @{}!\n\nI'm your stand-in for Telegram Business.\n\n\
                     what I can do:\n\
                     - learn your style from chat exports (JSON)\n\
                     - answer for you, in your voice\n\
                     - keep everything in PostgreSQL\n\n{}",
                    self.owner_username, HELP_TEXT
                );
                self.channel.deliver(msg.chat_id, &greeting, None).await;
                Ok(Some(state_idle()))
            }
            Command::Help => {
                self.channel.deliver(msg.chat_id, HELP_TEXT, None).await;
                Ok(Some(state_idle()))
            }
            Command::Status => {
                let count = self.store.style_message_count().await?;
                let enabled = self.store.setting(SETTING_ENABLED).await?;
                let enabled_text = if enabled.as_deref() == Some("true") {
                    "on"
                } else {
                    "off"
                };
                let readiness = if count >= MIN_CORPUS_SIZE {
                    "ready".to_string()
                } else {
                    format!("needs at least {} messages", MIN_CORPUS_SIZE)
                };
                let connections = self.connections.read().await.len();
                let status = format!(
                    "status:\n\
                     corpus: {} messages ({})\n\
                     auto-replies: {}\n\
                     business connections: {}",
                    count, readiness, enabled_text, connections
                );
                self.channel.deliver(msg.chat_id, &status, None).await;
                Ok(Some(state_idle()))
            }
            Command::Teach => {
                self.channel.deliver(msg.chat_id, TEACH_TEXT, None).await;
                Ok(Some(state_awaiting()))
            }
            Command::Cancel => {
                self.channel.deliver(msg.chat_id, "nothing to cancel", None).await;
                Ok(Some(state_idle()))
            }
            Command::Clear => {
                self.store.clear_style_messages().await?;
                self.store.set_setting(SETTING_ENABLED, "false").await?;
                self.channel
                    .deliver(msg.chat_id, "corpus wiped, auto-replies off", None)
                    .await;
                Ok(Some(state_idle()))
            }
            Command::Enable => {
                let count = self.store.style_message_count().await?;
                if count < MIN_CORPUS_SIZE {
                    let warning = format!(
                        "teach me first: {} messages in the corpus, need at least {}",
                        count, MIN_CORPUS_SIZE
                    );
                    self.channel.deliver(msg.chat_id, &warning, None).await;
                    return Ok(Some(state_idle()));
                }
                self.store.set_setting(SETTING_ENABLED, "true").await?;
                self.channel
                    .deliver(
                        msg.chat_id,
                        "auto-replies ON. business messages get answered in your voice now",
                        None,
                    )
                    .await;
                Ok(Some(state_idle()))
            }
            Command::Disable => {
                self.store.set_setting(SETTING_ENABLED, "false").await?;
                self.channel.deliver(msg.chat_id, "auto-replies OFF", None).await;
                Ok(Some(state_idle()))
            }
        }
    }

    /// Chat-export upload: download, parse, extend the corpus. Always leaves
    /// upload mode; malformed files only produce a short note to the owner.
    async fn handle_upload(
        &self,
        msg: &MessageEvent,
        doc: &DocumentRef,
    ) -> Result<serde_json::Value, StoreError> {
        if !doc
            .file_name
            .as_deref()
            .is_some_and(|n| n.to_ascii_lowercase().ends_with(".json"))
        {
            self.channel
                .deliver(msg.chat_id, "that's not a JSON file, try again or /cancel", None)
                .await;
            return Ok(state_awaiting());
        }

        let bytes = match self.channel.download_document(&doc.file_id).await {
            Ok(b) => b,
            Err(e) => {
                log::warn!("dispatch: export download failed: {}", e);
                self.channel
                    .deliver(msg.chat_id, "couldn't fetch the file, try again", None)
                    .await;
                return Ok(state_awaiting());
            }
        };
        let export: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("dispatch: export is not valid JSON: {}", e);
                self.channel
                    .deliver(msg.chat_id, "couldn't parse that file as JSON", None)
                    .await;
                return Ok(state_idle());
            }
        };
        let messages = style::extract_messages(&export);
        if messages.is_empty() {
            self.channel
                .deliver(msg.chat_id, "no messages found in that file", None)
                .await;
            return Ok(state_idle());
        }

        self.store.add_style_messages(&messages).await?;
        let total = self.store.style_message_count().await?;
        let readiness = if total >= MIN_CORPUS_SIZE {
            "you can /on auto-replies now"
        } else {
            "keep feeding me examples"
        };
        let summary = format!(
            "learned {} messages, {} total. {}",
            messages.len(),
            total,
            readiness
        );
        self.channel.deliver(msg.chat_id, &summary, None).await;
        Ok(state_idle())
    }

    /// Business connection added, changed, or removed.
    async fn handle_connection_update(&self, connection_id: String, owner_id: i64, enabled: bool) {
        let result = if enabled {
            self.connections
                .write()
                .await
                .insert(connection_id.clone(), owner_id);
            self.store
                .save_business_connection(&connection_id, owner_id)
                .await
        } else {
            self.connections.write().await.remove(&connection_id);
            self.store.delete_business_connection(&connection_id).await
        };
        if let Err(e) = result {
            log::warn!("dispatch: persisting connection {} failed: {}", connection_id, e);
            return;
        }
        log::info!(
            "business connection {} {} (owner {}), {} total",
            connection_id,
            if enabled { "enabled" } else { "removed" },
            owner_id,
            self.connections.read().await.len()
        );
    }

    /// A message in a connected business chat: reply in the owner's style when
    /// auto-replies are on and the corpus is big enough.
    async fn handle_business_message(&self, update_id: i64, msg: MessageEvent) {
        let Some(connection_id) = msg.business_connection_id.clone() else {
            return;
        };
        let Some(owner_id) = self.connections.read().await.get(&connection_id).copied() else {
            log::warn!("dispatch: message for unknown connection {}", connection_id);
            return;
        };
        if msg.sender_id == owner_id {
            log::debug!("dispatch: owner wrote in the chat themselves, skipping");
            return;
        }
        let Some(text) = msg.text.clone() else {
            log::debug!("dispatch: non-text business message, skipping");
            return;
        };

        // Record the correspondent's session first; a redelivered update stops here.
        let external_id = msg.sender_id.to_string();
        let session = match self.store.get_or_create_session(&external_id).await {
            Ok(s) => s,
            Err(e) => {
                log::warn!("dispatch: dropping business event {} after store error: {}", update_id, e);
                return;
            }
        };
        if already_applied(Some(&session), update_id) {
            log::debug!("dispatch: business update {} already applied, skipping", update_id);
            return;
        }
        let applied = match self
            .store
            .record_event(&external_id, update_id, &session.state)
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                log::warn!("dispatch: dropping business event {} after store error: {}", update_id, e);
                return;
            }
        };
        if !applied {
            log::debug!("dispatch: business update {} already applied, skipping", update_id);
            return;
        }

        let enabled = match self.store.setting(SETTING_ENABLED).await {
            Ok(v) => v,
            Err(e) => {
                log::warn!("dispatch: dropping business event {} after store error: {}", update_id, e);
                return;
            }
        };
        if enabled.as_deref() != Some("true") {
            log::debug!("dispatch: auto-replies disabled, skipping");
            return;
        }
        let count = match self.store.style_message_count().await {
            Ok(c) => c,
            Err(e) => {
                log::warn!("dispatch: dropping business event {} after store error: {}", update_id, e);
                return;
            }
        };
        if count < MIN_CORPUS_SIZE {
            log::debug!("dispatch: corpus too small ({}), skipping reply", count);
            return;
        }

        if let Err(e) = self.channel.send_typing(msg.chat_id, Some(&connection_id)).await {
            log::debug!("dispatch: typing action failed: {}", e);
        }

        let reply = match agent::run_reply_turn(
            self.store.as_ref(),
            self.backend.as_ref(),
            &self.model,
            &self.owner_username,
            &text,
        )
        .await
        {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("dispatch: dropping business event {} after store error: {}", update_id, e);
                return;
            }
        };
        self.channel
            .deliver(msg.chat_id, &reply, Some(&connection_id))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MemoryStore, RecordingChannel, StubBackend};

    fn owner_message(update_id: i64, text: &str) -> InboundEvent {
        InboundEvent {
            update_id,
            kind: EventKind::Message(MessageEvent {
                sender_id: 42,
                sender_username: Some("alice".to_string()),
                chat_id: 42,
                text: Some(text.to_string()),
                document: None,
                business_connection_id: None,
            }),
        }
    }

    fn owner_document(update_id: i64, file_name: &str) -> InboundEvent {
        InboundEvent {
            update_id,
            kind: EventKind::Message(MessageEvent {
                sender_id: 42,
                sender_username: Some("alice".to_string()),
                chat_id: 42,
                text: None,
                document: Some(DocumentRef {
                    file_id: "f1".to_string(),
                    file_name: Some(file_name.to_string()),
                }),
                business_connection_id: None,
            }),
        }
    }

    fn business_message(update_id: i64, sender_id: i64, text: &str) -> InboundEvent {
        InboundEvent {
            update_id,
            kind: EventKind::BusinessMessage(MessageEvent {
                sender_id,
                sender_username: None,
                chat_id: sender_id,
                text: Some(text.to_string()),
                document: None,
                business_connection_id: Some("conn-1".to_string()),
            }),
        }
    }

    fn connection_update(update_id: i64, enabled: bool) -> InboundEvent {
        InboundEvent {
            update_id,
            kind: EventKind::ConnectionUpdate {
                connection_id: "conn-1".to_string(),
                owner_id: 42,
                enabled,
            },
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        channel: Arc<RecordingChannel>,
        backend: Arc<StubBackend>,
        dispatcher: Arc<Dispatcher>,
    }

    fn harness_with(channel: RecordingChannel, backend: StubBackend) -> Harness {
        let store = Arc::new(MemoryStore::default());
        let channel = Arc::new(channel);
        let backend = Arc::new(backend);
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            channel.clone(),
            backend.clone(),
            "alice".to_string(),
            "test-model".to_string(),
            HashMap::new(),
        ));
        Harness {
            store,
            channel,
            backend,
            dispatcher,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingChannel::default(), StubBackend::replying("styled reply"))
    }

    #[test]
    fn parses_commands_with_mention_and_case() {
        assert_eq!(parse_command("/start"), Some(Command::Start));
        assert_eq!(parse_command("/START"), Some(Command::Start));
        assert_eq!(parse_command("/on@standin_bot"), Some(Command::Enable));
        assert_eq!(parse_command("  /status extra words"), Some(Command::Status));
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/unknown"), None);
        assert_eq!(parse_command(""), None);
    }

    #[tokio::test]
    async fn start_creates_session_and_greets() {
        let h = harness();
        h.dispatcher.handle_event(owner_message(1, "/start")).await;

        let session = h
            .store
            .session("42")
            .await
            .expect("lookup")
            .expect("session created");
        assert_eq!(session.last_update_id, Some(1));

        let sent = h.channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].chat_id, 42);
        assert!(sent[0].text.contains("@alice"));
    }

    #[tokio::test]
    async fn redelivered_update_is_applied_once() {
        let h = harness();
        h.dispatcher.handle_event(owner_message(5, "/teach")).await;
        h.dispatcher.handle_event(owner_message(5, "/teach")).await;

        assert_eq!(h.channel.sent().len(), 1);
        let session = h.store.session("42").await.expect("lookup").expect("session");
        assert_eq!(session.last_update_id, Some(5));
    }

    #[tokio::test]
    async fn unknown_text_writes_nothing() {
        let h = harness();
        h.dispatcher
            .handle_event(owner_message(1, "just chatting"))
            .await;

        assert_eq!(h.store.session_count(), 0);
        assert!(h.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn non_owner_direct_message_is_ignored() {
        let h = harness();
        let event = InboundEvent {
            update_id: 1,
            kind: EventKind::Message(MessageEvent {
                sender_id: 7,
                sender_username: Some("mallory".to_string()),
                chat_id: 7,
                text: Some("/start".to_string()),
                document: None,
                business_connection_id: None,
            }),
        };
        h.dispatcher.handle_event(event).await;

        assert_eq!(h.store.session_count(), 0);
        assert!(h.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn events_apply_in_delivery_order() {
        let h = harness();
        h.dispatcher.handle_event(owner_message(1, "/teach")).await;
        h.dispatcher.handle_event(owner_message(2, "/cancel")).await;

        let session = h.store.session("42").await.expect("lookup").expect("session");
        assert_eq!(session.last_update_id, Some(2));
        assert_eq!(
            session.state.get(STATE_AWAITING_UPLOAD).and_then(|v| v.as_bool()),
            None
        );
    }

    #[tokio::test]
    async fn upload_extends_corpus_and_leaves_upload_mode() {
        let export = serde_json::json!({
            "messages": [
                { "text": "first" },
                { "text": "second" }
            ]
        });
        let channel = RecordingChannel::with_document(export.to_string().as_bytes());
        let h = harness_with(channel, StubBackend::replying("unused"));

        h.dispatcher.handle_event(owner_message(1, "/teach")).await;
        h.dispatcher
            .handle_event(owner_document(2, "export.json"))
            .await;

        assert_eq!(h.store.style_messages().await.expect("corpus").len(), 2);
        let session = h.store.session("42").await.expect("lookup").expect("session");
        assert!(!awaiting_upload(Some(&session)));
        let summary = &h.channel.sent()[1];
        assert!(summary.text.contains("learned 2 messages"));
    }

    #[tokio::test]
    async fn non_json_upload_keeps_upload_mode() {
        let channel = RecordingChannel::with_document(b"not json");
        let h = harness_with(channel, StubBackend::replying("unused"));

        h.dispatcher.handle_event(owner_message(1, "/teach")).await;
        h.dispatcher.handle_event(owner_document(2, "export.txt")).await;

        assert!(h.store.style_messages().await.expect("corpus").is_empty());
        let session = h.store.session("42").await.expect("lookup").expect("session");
        assert!(awaiting_upload(Some(&session)));
    }

    #[tokio::test]
    async fn enable_requires_minimum_corpus() {
        let h = harness();
        h.dispatcher.handle_event(owner_message(1, "/on")).await;

        assert_ne!(
            h.store.setting(SETTING_ENABLED).await.expect("setting").as_deref(),
            Some("true")
        );
        assert!(h.channel.sent()[0].text.contains("teach me first"));
    }

    #[tokio::test]
    async fn business_message_gets_styled_reply() {
        let h = harness();
        h.store
            .seed_corpus(&["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"]);
        h.store.seed_setting(SETTING_ENABLED, "true");

        h.dispatcher.handle_event(connection_update(1, true)).await;
        h.dispatcher.handle_event(business_message(2, 7, "hello")).await;

        let sent = h.channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "styled reply");
        assert_eq!(sent[0].business_connection_id.as_deref(), Some("conn-1"));

        // The correspondent got a session record.
        let session = h.store.session("7").await.expect("lookup").expect("session");
        assert_eq!(session.last_update_id, Some(2));

        let (_, messages) = h.backend.last_request().expect("request");
        assert!(messages[0].content.contains("@alice"));
    }

    #[tokio::test]
    async fn business_reply_skipped_when_disabled() {
        let h = harness();
        h.store
            .seed_corpus(&["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"]);
        h.store.seed_setting(SETTING_ENABLED, "false");

        h.dispatcher.handle_event(connection_update(1, true)).await;
        h.dispatcher.handle_event(business_message(2, 7, "hello")).await;

        assert!(h.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn business_message_from_owner_is_skipped() {
        let h = harness();
        h.store.seed_setting(SETTING_ENABLED, "true");
        h.dispatcher.handle_event(connection_update(1, true)).await;
        // owner_id of conn-1 is 42
        h.dispatcher.handle_event(business_message(2, 42, "my own note")).await;

        assert!(h.channel.sent().is_empty());
        assert_eq!(h.store.session_count(), 0);
    }

    #[tokio::test]
    async fn redelivered_business_message_replies_once() {
        let h = harness();
        h.store
            .seed_corpus(&["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"]);
        h.store.seed_setting(SETTING_ENABLED, "true");

        h.dispatcher.handle_event(connection_update(1, true)).await;
        h.dispatcher.handle_event(business_message(2, 7, "hello")).await;
        h.dispatcher.handle_event(business_message(2, 7, "hello")).await;

        assert_eq!(h.channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn removed_connection_stops_replies() {
        let h = harness();
        h.store
            .seed_corpus(&["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"]);
        h.store.seed_setting(SETTING_ENABLED, "true");

        h.dispatcher.handle_event(connection_update(1, true)).await;
        h.dispatcher.handle_event(connection_update(2, false)).await;
        h.dispatcher.handle_event(business_message(3, 7, "hello")).await;

        assert!(h.channel.sent().is_empty());
        assert!(h
            .store
            .business_connections()
            .await
            .expect("connections")
            .is_empty());
    }

    #[tokio::test]
    async fn store_failure_drops_event_but_next_one_succeeds() {
        let h = harness();
        h.store.fail_next_ops(10);
        h.dispatcher.handle_event(owner_message(1, "/start")).await;
        assert!(h.channel.sent().is_empty());

        // Store healed; the dispatcher kept running.
        h.store.fail_next_ops(0);
        h.dispatcher.handle_event(owner_message(2, "/start")).await;
        assert_eq!(h.channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn delivery_retries_once_then_swallows() {
        let h = harness();
        h.channel.fail_next_sends(1);
        h.dispatcher.handle_event(owner_message(1, "/help")).await;
        // First send failed, retry landed.
        assert_eq!(h.channel.sent().len(), 1);

        h.channel.fail_next_sends(2);
        h.dispatcher.handle_event(owner_message(2, "/help")).await;
        // Both attempts failed; swallowed without crashing, session still recorded.
        assert_eq!(h.channel.sent().len(), 1);
        let session = h.store.session("42").await.expect("lookup").expect("session");
        assert_eq!(session.last_update_id, Some(2));
    }

    #[tokio::test]
    async fn run_drains_queue_then_stops_on_close() {
        let h = harness();
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(h.dispatcher.clone().run(rx));

        tx.send(owner_message(1, "/start")).await.expect("send");
        drop(tx);
        handle.await.expect("dispatcher task");

        assert_eq!(h.channel.sent().len(), 1);
    }
}
