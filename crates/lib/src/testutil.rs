//! Test doubles shared by unit tests: in-memory store, recording channel, stub LLM.

use crate::channels::{ChannelError, ChannelHandle};
use crate::llm::{ChatBackend, ChatChoice, ChatMessage, ChatResponse, LlmError};
use crate::store::{BusinessConnectionRecord, Session, StateStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// In-memory `StateStore` with optional failure injection.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    /// Remaining operations that fail with a database error before healing.
    fail_ops: AtomicU32,
}

#[derive(Default)]
struct MemoryInner {
    sessions: HashMap<String, Session>,
    corpus: Vec<String>,
    settings: HashMap<String, String>,
    connections: HashMap<String, i64>,
}

impl MemoryStore {
    pub fn fail_next_ops(&self, n: u32) {
        self.fail_ops.store(n, Ordering::SeqCst);
    }

    pub fn seed_corpus(&self, messages: &[&str]) {
        let mut g = self.inner.lock().expect("lock");
        g.corpus.extend(messages.iter().map(|m| m.to_string()));
    }

    pub fn seed_setting(&self, key: &str, value: &str) {
        let mut g = self.inner.lock().expect("lock");
        g.settings.insert(key.to_string(), value.to_string());
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().expect("lock").sessions.len()
    }

    fn gate(&self) -> Result<(), StoreError> {
        let remaining = self.fail_ops.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_ops.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn blank_session(external_id: &str) -> Session {
        let now = Utc::now();
        Session {
            external_id: external_id.to_string(),
            first_seen: now,
            last_seen: now,
            state: serde_json::json!({}),
            last_update_id: None,
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn session(&self, external_id: &str) -> Result<Option<Session>, StoreError> {
        self.gate()?;
        Ok(self
            .inner
            .lock()
            .expect("lock")
            .sessions
            .get(external_id)
            .cloned())
    }

    async fn get_or_create_session(&self, external_id: &str) -> Result<Session, StoreError> {
        self.gate()?;
        let mut g = self.inner.lock().expect("lock");
        let session = g
            .sessions
            .entry(external_id.to_string())
            .or_insert_with(|| Self::blank_session(external_id));
        session.last_seen = Utc::now();
        Ok(session.clone())
    }

    async fn record_event(
        &self,
        external_id: &str,
        update_id: i64,
        state: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        self.gate()?;
        let mut g = self.inner.lock().expect("lock");
        let session = g
            .sessions
            .entry(external_id.to_string())
            .or_insert_with(|| Self::blank_session(external_id));
        if session.last_update_id.is_some_and(|last| last >= update_id) {
            return Ok(false);
        }
        session.last_seen = Utc::now();
        session.state = state.clone();
        session.last_update_id = Some(update_id);
        Ok(true)
    }

    async fn add_style_messages(&self, messages: &[String]) -> Result<(), StoreError> {
        self.gate()?;
        let mut g = self.inner.lock().expect("lock");
        g.corpus.extend(messages.iter().cloned());
        Ok(())
    }

    async fn style_messages(&self) -> Result<Vec<String>, StoreError> {
        self.gate()?;
        Ok(self.inner.lock().expect("lock").corpus.clone())
    }

    async fn style_message_count(&self) -> Result<i64, StoreError> {
        self.gate()?;
        Ok(self.inner.lock().expect("lock").corpus.len() as i64)
    }

    async fn clear_style_messages(&self) -> Result<(), StoreError> {
        self.gate()?;
        self.inner.lock().expect("lock").corpus.clear();
        Ok(())
    }

    async fn setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.gate()?;
        Ok(self.inner.lock().expect("lock").settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.gate()?;
        self.inner
            .lock()
            .expect("lock")
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn business_connections(&self) -> Result<Vec<BusinessConnectionRecord>, StoreError> {
        self.gate()?;
        Ok(self
            .inner
            .lock()
            .expect("lock")
            .connections
            .iter()
            .map(|(id, owner)| BusinessConnectionRecord {
                connection_id: id.clone(),
                owner_id: *owner,
            })
            .collect())
    }

    async fn save_business_connection(
        &self,
        connection_id: &str,
        owner_id: i64,
    ) -> Result<(), StoreError> {
        self.gate()?;
        self.inner
            .lock()
            .expect("lock")
            .connections
            .insert(connection_id.to_string(), owner_id);
        Ok(())
    }

    async fn delete_business_connection(&self, connection_id: &str) -> Result<(), StoreError> {
        self.gate()?;
        self.inner
            .lock()
            .expect("lock")
            .connections
            .remove(connection_id);
        Ok(())
    }
}

/// One outbound message captured by [`RecordingChannel`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub chat_id: i64,
    pub text: String,
    pub business_connection_id: Option<String>,
}

/// `ChannelHandle` that records sends instead of hitting the network.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<SentMessage>>,
    /// Bytes returned for any document download.
    document: Mutex<Option<Vec<u8>>>,
    /// Remaining sends that fail before healing (for delivery-retry tests).
    fail_sends: AtomicU32,
}

impl RecordingChannel {
    pub fn with_document(bytes: &[u8]) -> Self {
        let channel = Self::default();
        *channel.document.lock().expect("lock") = Some(bytes.to_vec());
        channel
    }

    pub fn fail_next_sends(&self, n: u32) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ChannelHandle for RecordingChannel {
    fn id(&self) -> &str {
        "recording"
    }

    fn stop(&self) {}

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        business_connection_id: Option<&str>,
    ) -> Result<(), ChannelError> {
        let remaining = self.fail_sends.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_sends.store(remaining - 1, Ordering::SeqCst);
            return Err(ChannelError::Api("injected send failure".to_string()));
        }
        self.sent.lock().expect("lock").push(SentMessage {
            chat_id,
            text: text.to_string(),
            business_connection_id: business_connection_id.map(|s| s.to_string()),
        });
        Ok(())
    }

    async fn send_typing(
        &self,
        _chat_id: i64,
        _business_connection_id: Option<&str>,
    ) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn download_document(&self, _file_id: &str) -> Result<Vec<u8>, ChannelError> {
        self.document
            .lock()
            .expect("lock")
            .clone()
            .ok_or_else(|| ChannelError::Api("no document configured".to_string()))
    }
}

/// `ChatBackend` stub: fixed reply or forced failure; captures the last request.
pub struct StubBackend {
    reply: Option<String>,
    last: Mutex<Option<(String, Vec<ChatMessage>)>>,
}

impl StubBackend {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            last: Mutex::new(None),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            last: Mutex::new(None),
        }
    }

    pub fn last_request(&self) -> Option<(String, Vec<ChatMessage>)> {
        self.last.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ChatBackend for StubBackend {
    async fn chat(&self, model: &str, messages: Vec<ChatMessage>) -> Result<ChatResponse, LlmError> {
        *self.last.lock().expect("lock") = Some((model.to_string(), messages));
        match &self.reply {
            Some(reply) => Ok(ChatResponse {
                choices: vec![ChatChoice {
                    message: ChatMessage {
                        role: "assistant".to_string(),
                        content: reply.clone(),
                    },
                }],
            }),
            None => Err(LlmError::Api("injected llm failure".to_string())),
        }
    }
}
