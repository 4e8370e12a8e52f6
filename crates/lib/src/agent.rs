//! Reply agent: one auto-reply turn in the owner's style.
//!
//! Loads the style corpus, builds the mimicry system prompt, and asks the LLM for
//! a completion. LLM failures degrade to a canned line so the correspondent still
//! gets an answer; store failures propagate so the caller can drop the event.

use crate::llm::{ChatBackend, ChatMessage};
use crate::store::{StateStore, StoreError};
use crate::style;

/// Sent when the LLM call fails or returns nothing.
pub const FALLBACK_REPLY: &str = "sorry, glitched for a second";

/// Run one reply turn for an inbound business message.
pub async fn run_reply_turn(
    store: &dyn StateStore,
    backend: &dyn ChatBackend,
    model: &str,
    owner: &str,
    text: &str,
) -> Result<String, StoreError> {
    let corpus = store.style_messages().await?;
    let prompt = style::build_style_prompt(owner, &corpus);
    let messages = vec![ChatMessage::system(prompt), ChatMessage::user(text)];
    match backend.chat(model, messages).await {
        Ok(res) => {
            let content = res.content().trim();
            if content.is_empty() {
                log::warn!("agent: model returned empty content, using fallback");
                Ok(FALLBACK_REPLY.to_string())
            } else {
                Ok(content.to_string())
            }
        }
        Err(e) => {
            log::warn!("agent: completion failed: {}", e);
            Ok(FALLBACK_REPLY.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MemoryStore, StubBackend};

    #[tokio::test]
    async fn reply_uses_model_content() {
        let store = MemoryStore::default();
        store.seed_corpus(&["yo", "sup"]);
        let backend = StubBackend::replying("hey man");
        let reply = run_reply_turn(&store, &backend, "m", "alice", "hello")
            .await
            .expect("turn");
        assert_eq!(reply, "hey man");
        let (model, messages) = backend.last_request().expect("request");
        assert_eq!(model, "m");
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.contains("@alice"));
        assert!(messages[0].content.contains("- yo"));
        assert_eq!(messages[1].content, "hello");
    }

    #[tokio::test]
    async fn llm_failure_degrades_to_fallback() {
        let store = MemoryStore::default();
        let backend = StubBackend::failing();
        let reply = run_reply_turn(&store, &backend, "m", "alice", "hello")
            .await
            .expect("turn");
        assert_eq!(reply, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn store_failure_propagates() {
        let store = MemoryStore::default();
        store.fail_next_ops(1);
        let backend = StubBackend::replying("unused");
        let out = run_reply_turn(&store, &backend, "m", "alice", "hello").await;
        assert!(out.is_err());
    }
}
