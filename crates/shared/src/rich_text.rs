//! Minimal helpers over the rich-text document carried in message `content`.
//!
//! The document itself is opaque to the sync engine; these helpers only look
//! for text runs (`{"type": "text", "text": ...}` nodes) in depth-first order.

use serde_json::{json, Value};

/// Returns the first non-blank text run in `document`.
///
/// A bare JSON string is treated as a single text run.
pub fn first_text_run(document: &Value) -> Option<String> {
    match document {
        Value::String(text) => non_blank(text),
        Value::Array(nodes) => nodes.iter().find_map(first_text_run),
        Value::Object(node) => {
            let is_text_node = node
                .get("type")
                .and_then(Value::as_str)
                .map_or(true, |kind| kind == "text");
            if is_text_node {
                if let Some(text) = node.get("text").and_then(Value::as_str).and_then(non_blank) {
                    return Some(text);
                }
            }
            node.get("content").and_then(first_text_run)
        }
        _ => None,
    }
}

fn non_blank(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Wraps plain text into a `doc > paragraph > text` document.
pub fn plain_text_document(text: &str) -> Value {
    let paragraph = if text.is_empty() {
        json!({ "type": "paragraph" })
    } else {
        json!({ "type": "paragraph", "content": [{ "type": "text", "text": text }] })
    };
    json!({ "type": "doc", "content": [paragraph] })
}
