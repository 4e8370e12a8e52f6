//! Telegram channel: long-poll getUpdates and Bot API calls.

use crate::channels::inbound::{DocumentRef, EventKind, InboundEvent, MessageEvent};
use crate::channels::ChannelHandle;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;

/// Update kinds the bot asks Telegram to deliver.
const ALLOWED_UPDATES: [&str; 3] = ["message", "business_connection", "business_message"];

/// Cap for the reconnect backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("telegram request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("telegram api error: {0}")]
    Api(String),
    /// Bot token rejected. Unrecoverable; terminates the process.
    #[error("telegram auth rejected: {0}")]
    Auth(String),
}

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

/// Telegram update payload (getUpdates result item or webhook POST body).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub business_connection: Option<TelegramBusinessConnection>,
    #[serde(default)]
    pub business_message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub document: Option<TelegramDocument>,
    #[serde(default)]
    pub business_connection_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramDocument {
    pub file_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramBusinessConnection {
    pub id: String,
    pub user: TelegramUser,
    #[serde(default)]
    pub is_enabled: bool,
}

#[derive(Debug, Deserialize)]
struct GetFileResponse {
    ok: bool,
    #[serde(default)]
    result: Option<TelegramFile>,
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    #[serde(default)]
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetMeResponse {
    ok: bool,
    #[serde(default)]
    result: Option<TelegramUser>,
}

impl TelegramUpdate {
    /// Normalize one update into an inbound event. Updates with no usable payload
    /// (e.g. edited messages we did not subscribe to) yield None.
    pub fn into_event(self) -> Option<InboundEvent> {
        let update_id = self.update_id;
        if let Some(conn) = self.business_connection {
            return Some(InboundEvent {
                update_id,
                kind: EventKind::ConnectionUpdate {
                    connection_id: conn.id,
                    owner_id: conn.user.id,
                    enabled: conn.is_enabled,
                },
            });
        }
        if let Some(msg) = self.business_message {
            return Some(InboundEvent {
                update_id,
                kind: EventKind::BusinessMessage(message_event(msg)),
            });
        }
        if let Some(msg) = self.message {
            return Some(InboundEvent {
                update_id,
                kind: EventKind::Message(message_event(msg)),
            });
        }
        None
    }
}

fn message_event(msg: TelegramMessage) -> MessageEvent {
    MessageEvent {
        sender_id: msg.from.as_ref().map(|u| u.id).unwrap_or(msg.chat.id),
        sender_username: msg.from.and_then(|u| u.username),
        chat_id: msg.chat.id,
        text: msg.text,
        document: msg.document.map(|d| DocumentRef {
            file_id: d.file_id,
            file_name: d.file_name,
        }),
        business_connection_id: msg.business_connection_id,
    }
}

/// Reconnect delay after `failures` consecutive poll errors: 1 s doubling, capped.
pub fn backoff_delay(failures: u32) -> Duration {
    let secs = 1u64.checked_shl(failures.min(10)).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

/// Telegram channel connector: long-polls for updates and sends replies.
pub struct TelegramChannel {
    id: String,
    token: String,
    api_base: String,
    running: AtomicBool,
    client: reqwest::Client,
}

impl TelegramChannel {
    /// `api_base` overrides the Bot API host (tests, local gateways).
    pub fn new(token: String, api_base: Option<String>) -> Self {
        let api_base = api_base
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| TELEGRAM_API_BASE.to_string());
        Self {
            id: "telegram".to_string(),
            token,
            api_base,
            running: AtomicBool::new(false),
            client: reqwest::Client::new(),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    /// Call a Bot API method with a JSON body; maps 401/403 to `ChannelError::Auth`.
    async fn call(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, ChannelError> {
        let res = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await?;
        let status = res.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let body = res.text().await.unwrap_or_default();
            return Err(ChannelError::Auth(format!("{} {} {}", method, status, body)));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ChannelError::Api(format!("{} {} {}", method, status, body)));
        }
        Ok(res)
    }

    /// Validate the bot token at startup. An auth error here is fatal.
    pub async fn get_me(&self) -> Result<TelegramUser, ChannelError> {
        let res = self.call("getMe", json!({})).await?;
        let data: GetMeResponse = res.json().await?;
        if !data.ok {
            return Err(ChannelError::Api("getMe returned ok: false".to_string()));
        }
        data.result
            .ok_or_else(|| ChannelError::Api("getMe returned no result".to_string()))
    }

    /// Start the getUpdates long-poll loop. Transport errors back off exponentially;
    /// an auth error reports through `fatal_tx` and stops the loop.
    pub fn start_inbound(
        self: Arc<Self>,
        inbound_tx: mpsc::Sender<InboundEvent>,
        fatal_tx: mpsc::Sender<ChannelError>,
    ) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("telegram channel: starting getUpdates long-poll loop");
        tokio::spawn(async move {
            run_get_updates_loop(self, inbound_tx, fatal_tx).await;
        })
    }

    /// Call Telegram getUpdates (long poll). Returns (updates, next_offset).
    async fn get_updates(
        &self,
        offset: Option<i64>,
    ) -> Result<(Vec<TelegramUpdate>, Option<i64>), ChannelError> {
        let mut body = json!({
            "timeout": LONG_POLL_TIMEOUT,
            "allowed_updates": ALLOWED_UPDATES,
        });
        if let Some(off) = offset {
            body["offset"] = json!(off);
        }
        let res = self.call("getUpdates", body).await?;
        let data: GetUpdatesResponse = res.json().await?;
        if !data.ok {
            return Err(ChannelError::Api("getUpdates returned ok: false".to_string()));
        }
        let next_offset = data
            .result
            .iter()
            .map(|u| u.update_id)
            .max()
            .map(|id| id + 1);
        Ok((data.result, next_offset))
    }

    /// Set webhook URL (and optional secret). When set, Telegram POSTs updates to the URL instead of getUpdates.
    pub async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), ChannelError> {
        let mut body = json!({ "url": url, "allowed_updates": ALLOWED_UPDATES });
        if let Some(s) = secret {
            body["secret_token"] = serde_json::Value::String(s.to_string());
        }
        self.call("setWebhook", body).await?;
        Ok(())
    }

    /// Remove webhook so the bot can use getUpdates again.
    pub async fn delete_webhook(&self) -> Result<(), ChannelError> {
        self.call("deleteWebhook", json!({})).await?;
        Ok(())
    }

    /// Resolve a file_id to a download path, then fetch the bytes.
    async fn get_file(&self, file_id: &str) -> Result<Vec<u8>, ChannelError> {
        let res = self.call("getFile", json!({ "file_id": file_id })).await?;
        let data: GetFileResponse = res.json().await?;
        let file_path = if data.ok {
            data.result.and_then(|f| f.file_path)
        } else {
            None
        };
        let file_path = file_path
            .ok_or_else(|| ChannelError::Api("getFile returned no file_path".to_string()))?;
        let url = format!("{}/file/bot{}/{}", self.api_base, self.token, file_path);
        let res = self.client.get(&url).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            return Err(ChannelError::Api(format!("file download failed: {}", status)));
        }
        Ok(res.bytes().await?.to_vec())
    }
}

async fn run_get_updates_loop(
    channel: Arc<TelegramChannel>,
    inbound_tx: mpsc::Sender<InboundEvent>,
    fatal_tx: mpsc::Sender<ChannelError>,
) {
    let mut offset: Option<i64> = None;
    let mut failures: u32 = 0;
    while channel.running() {
        match channel.get_updates(offset).await {
            Ok((updates, next)) => {
                failures = 0;
                offset = next;
                for update in updates {
                    let Some(event) = update.into_event() else { continue };
                    if inbound_tx.send(event).await.is_err() {
                        log::debug!("telegram: inbound channel closed, stopping loop");
                        return;
                    }
                }
            }
            Err(e @ ChannelError::Auth(_)) => {
                log::error!("telegram getUpdates: {}", e);
                let _ = fatal_tx.try_send(e);
                return;
            }
            Err(e) => {
                let delay = backoff_delay(failures);
                failures = failures.saturating_add(1);
                log::warn!(
                    "telegram getUpdates error (retrying in {:?}): {}",
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    log::info!("telegram channel: getUpdates loop stopped");
}

#[async_trait]
impl ChannelHandle for TelegramChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        business_connection_id: Option<&str>,
    ) -> Result<(), ChannelError> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if let Some(conn) = business_connection_id {
            body["business_connection_id"] = serde_json::Value::String(conn.to_string());
        }
        self.call("sendMessage", body).await?;
        Ok(())
    }

    async fn send_typing(
        &self,
        chat_id: i64,
        business_connection_id: Option<&str>,
    ) -> Result<(), ChannelError> {
        let mut body = json!({ "chat_id": chat_id, "action": "typing" });
        if let Some(conn) = business_connection_id {
            body["business_connection_id"] = serde_json::Value::String(conn.to_string());
        }
        self.call("sendChatAction", body).await?;
        Ok(())
    }

    async fn download_document(&self, file_id: &str) -> Result<Vec<u8>, ChannelError> {
        self.get_file(file_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_direct_message_update() {
        let raw = r#"{
            "update_id": 10,
            "message": {
                "message_id": 1,
                "from": { "id": 42, "username": "alice" },
                "chat": { "id": 42, "type": "private" },
                "text": "/start"
            }
        }"#;
        let update: TelegramUpdate = serde_json::from_str(raw).expect("parse");
        let event = update.into_event().expect("event");
        assert_eq!(event.update_id, 10);
        match event.kind {
            EventKind::Message(msg) => {
                assert_eq!(msg.sender_id, 42);
                assert_eq!(msg.sender_username.as_deref(), Some("alice"));
                assert_eq!(msg.text.as_deref(), Some("/start"));
                assert!(msg.business_connection_id.is_none());
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn decodes_business_message_update() {
        let raw = r#"{
            "update_id": 11,
            "business_message": {
                "message_id": 2,
                "business_connection_id": "conn-1",
                "from": { "id": 7 },
                "chat": { "id": 7, "type": "private" },
                "text": "hello"
            }
        }"#;
        let update: TelegramUpdate = serde_json::from_str(raw).expect("parse");
        match update.into_event().expect("event").kind {
            EventKind::BusinessMessage(msg) => {
                assert_eq!(msg.business_connection_id.as_deref(), Some("conn-1"));
                assert_eq!(msg.sender_id, 7);
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn decodes_business_connection_update() {
        let raw = r#"{
            "update_id": 12,
            "business_connection": {
                "id": "conn-1",
                "user": { "id": 99, "username": "alice" },
                "is_enabled": true
            }
        }"#;
        let update: TelegramUpdate = serde_json::from_str(raw).expect("parse");
        match update.into_event().expect("event").kind {
            EventKind::ConnectionUpdate {
                connection_id,
                owner_id,
                enabled,
            } => {
                assert_eq!(connection_id, "conn-1");
                assert_eq!(owner_id, 99);
                assert!(enabled);
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn document_message_carries_file_reference() {
        let raw = r#"{
            "update_id": 13,
            "message": {
                "message_id": 3,
                "from": { "id": 42, "username": "alice" },
                "chat": { "id": 42, "type": "private" },
                "document": { "file_id": "f1", "file_name": "export.json" }
            }
        }"#;
        let update: TelegramUpdate = serde_json::from_str(raw).expect("parse");
        match update.into_event().expect("event").kind {
            EventKind::Message(msg) => {
                let doc = msg.document.expect("document");
                assert_eq!(doc.file_id, "f1");
                assert_eq!(doc.file_name.as_deref(), Some("export.json"));
                assert!(msg.text.is_none());
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn empty_update_yields_no_event() {
        let update: TelegramUpdate = serde_json::from_str(r#"{"update_id": 14}"#).expect("parse");
        assert!(update.into_event().is_none());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(5), Duration::from_secs(32));
        assert_eq!(backoff_delay(6), Duration::from_secs(60));
        assert_eq!(backoff_delay(31), Duration::from_secs(60));
    }
}
