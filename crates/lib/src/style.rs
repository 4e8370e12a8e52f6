//! Style corpus extraction and prompt construction.
//!
//! The owner teaches the bot by uploading Telegram Desktop chat exports (JSON).
//! `extract_messages` pulls the plain message texts out of an export;
//! `build_style_prompt` turns a sample of the corpus into the system prompt that
//! makes the model answer in the owner's voice.

/// How many corpus messages are quoted verbatim in the prompt.
const PROMPT_SAMPLE_SIZE: usize = 20;

/// Extract message texts from a Telegram Desktop chat export.
///
/// Accepts either the full export object (`{"messages": [...]}`) or a bare array
/// of message objects. A message's `text` field is a plain string or a list that
/// mixes strings with `{"type": ..., "text": ...}` entity objects; entity
/// fragments are joined with spaces. Empty and whitespace-only texts are skipped.
pub fn extract_messages(export: &serde_json::Value) -> Vec<String> {
    let messages = match export {
        serde_json::Value::Object(obj) => match obj.get("messages") {
            Some(serde_json::Value::Array(list)) => list.as_slice(),
            // A single message object without a "messages" list.
            _ => std::slice::from_ref(export),
        },
        serde_json::Value::Array(list) => list.as_slice(),
        _ => return Vec::new(),
    };

    let mut out = Vec::new();
    for msg in messages {
        let Some(obj) = msg.as_object() else { continue };
        let Some(text_value) = obj.get("text") else { continue };
        let text = flatten_text(text_value);
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
    }
    out
}

/// Flatten an export `text` field: plain string, or list of strings and
/// `{"text": ...}` entity objects.
fn flatten_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(parts) => {
            let fragments: Vec<String> = parts
                .iter()
                .map(|part| match part {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Object(obj) => obj
                        .get("text")
                        .and_then(|t| t.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    other => other.to_string(),
                })
                .collect();
            fragments.join(" ")
        }
        _ => String::new(),
    }
}

/// Build the mimicry system prompt from the owner's corpus.
///
/// Quotes up to [`PROMPT_SAMPLE_SIZE`] example messages and instructs the model to
/// copy the owner's slang, casing, and punctuation. An empty corpus yields a bland
/// fallback prompt so the agent still produces something sensible.
pub fn build_style_prompt(owner: &str, corpus: &[String]) -> String {
    if corpus.is_empty() {
        return "You are a friendly assistant. Keep replies short.".to_string();
    }

    let examples = corpus
        .iter()
        .take(PROMPT_SAMPLE_SIZE)
        .map(|m| format!("- {m}"))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You must answer EXACTLY in the style of @{owner}. These are examples of their messages:\n\
         \n\
         {examples}\n\
         \n\
         IMPORTANT - COPY THEIR STYLE COMPLETELY:\n\
         - Use their slang and their pet words\n\
         - Write without capital letters if they do\n\
         - Skip trailing periods if they do\n\
         - Be as informal and relaxed as they are\n\
         - Keep it short and to the point\n\
         - Do NOT use emoji unless they do\n\
         - Do NOT be polite if they were not\n\
         \n\
         You are NOT an AI. You are simply @{owner}."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_from_full_export_object() {
        let export = json!({
            "name": "chat",
            "messages": [
                { "id": 1, "text": "hey" },
                { "id": 2, "text": "whats up" }
            ]
        });
        assert_eq!(extract_messages(&export), vec!["hey", "whats up"]);
    }

    #[test]
    fn extracts_from_bare_array() {
        let export = json!([{ "text": "one" }, { "text": "two" }]);
        assert_eq!(extract_messages(&export), vec!["one", "two"]);
    }

    #[test]
    fn joins_entity_fragments() {
        let export = json!({
            "messages": [
                { "text": ["check", { "type": "link", "text": "https://example.com" }, "out"] }
            ]
        });
        assert_eq!(extract_messages(&export), vec!["check https://example.com out"]);
    }

    #[test]
    fn skips_empty_and_missing_texts() {
        let export = json!({
            "messages": [
                { "text": "   " },
                { "photo": "photo.jpg" },
                { "text": "kept" }
            ]
        });
        assert_eq!(extract_messages(&export), vec!["kept"]);
    }

    #[test]
    fn non_object_messages_are_ignored() {
        let export = json!({ "messages": ["not an object", 42, { "text": "ok" }] });
        assert_eq!(extract_messages(&export), vec!["ok"]);
    }

    #[test]
    fn scalar_export_yields_nothing() {
        assert!(extract_messages(&json!("just a string")).is_empty());
    }

    #[test]
    fn prompt_quotes_samples_and_owner() {
        let corpus = vec!["yo".to_string(), "nah man".to_string()];
        let prompt = build_style_prompt("alice", &corpus);
        assert!(prompt.contains("@alice"));
        assert!(prompt.contains("- yo"));
        assert!(prompt.contains("- nah man"));
    }

    #[test]
    fn prompt_caps_sample_size() {
        let corpus: Vec<String> = (0..100).map(|i| format!("msg{i}")).collect();
        let prompt = build_style_prompt("alice", &corpus);
        assert!(prompt.contains("- msg19"));
        assert!(!prompt.contains("- msg20\n"));
    }

    #[test]
    fn empty_corpus_gets_fallback_prompt() {
        let prompt = build_style_prompt("alice", &[]);
        assert!(prompt.contains("friendly assistant"));
        assert!(!prompt.contains("@alice"));
    }
}
