//! Maps raw server message payloads into [`ChatMessage`].
//!
//! The backend has emitted several shapes over time: authors keyed by `id` or
//! by the legacy `_id`, replies either pre-flattened (`replyPreview`) or as a
//! nested copy of the quoted message (`replyTo`). Every field has a default, so
//! normalization never fails, and normalizing a canonical record is a no-op.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use shared::{
    domain::{Author, ChatMessage, MessageId, MessageKind, Reaction, ReplyPreview, UserId},
    rich_text::{first_text_run, plain_text_document},
};

pub const UNKNOWN_AUTHOR_NAME: &str = "Usuario";
pub const REPLY_PLACEHOLDER_TEXT: &str = "Mensaje";

pub fn normalize_message(raw: &Value) -> ChatMessage {
    let kind = message_kind(raw);
    let (media_url, filename) = if kind.is_media() {
        let media_url = string_field(raw, &["mediaUrl", "media_url", "fileUrl"]).unwrap_or_default();
        let filename = string_field(raw, &["filename", "fileName"])
            .unwrap_or_else(|| filename_from_url(&media_url));
        (Some(media_url), Some(filename))
    } else {
        (None, None)
    };

    let content = match raw.get("content") {
        Some(content) if !content.is_null() => content.clone(),
        _ => plain_text_document(&string_field(raw, &["text"]).unwrap_or_default()),
    };

    let created_at = timestamp_field(raw, &["createdAt", "created_at"]).unwrap_or_default();
    let updated_at = timestamp_field(raw, &["updatedAt", "updated_at"]).unwrap_or(created_at);

    ChatMessage {
        id: MessageId(string_field(raw, &["id", "_id"]).unwrap_or_default()),
        author: author_field(raw),
        content,
        kind,
        media_url,
        filename,
        reactions: reactions_field(raw),
        reply_preview: reply_preview_field(raw),
        created_at,
        updated_at,
    }
}

fn message_kind(raw: &Value) -> MessageKind {
    if let Some(kind) = string_field(raw, &["kind", "type"]).and_then(|k| MessageKind::parse_lenient(&k)) {
        return kind;
    }
    if string_field(raw, &["mediaUrl", "media_url", "fileUrl"]).is_some() {
        MessageKind::File
    } else {
        MessageKind::Text
    }
}

fn author_field(raw: &Value) -> Author {
    let Some(author) = ["author", "sender", "user"]
        .iter()
        .find_map(|key| raw.get(*key).filter(|v| !v.is_null()))
    else {
        return unknown_author(String::new());
    };

    match author {
        Value::Object(_) => {
            let name = string_field(author, &["name", "displayName"])
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_AUTHOR_NAME.to_string());
            Author {
                id: UserId(string_field(author, &["id", "_id"]).unwrap_or_default()),
                name,
                username: string_field(author, &["username"]).unwrap_or_default(),
                avatar_url: string_field(author, &["avatarUrl", "avatar"]).unwrap_or_default(),
            }
        }
        other => unknown_author(scalar_to_string(other).unwrap_or_default()),
    }
}

fn unknown_author(id: String) -> Author {
    Author {
        id: UserId(id),
        name: UNKNOWN_AUTHOR_NAME.to_string(),
        username: String::new(),
        avatar_url: String::new(),
    }
}

fn reactions_field(raw: &Value) -> Vec<Reaction> {
    let Some(entries) = raw.get("reactions").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut reactions: Vec<Reaction> = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(emoji) = string_field(entry, &["emoji"]).filter(|e| !e.is_empty()) else {
            continue;
        };
        let user_id = match entry.get("userId").or_else(|| entry.get("user")) {
            Some(user @ Value::Object(_)) => string_field(user, &["id", "_id"]),
            Some(other) => scalar_to_string(other),
            None => None,
        };
        let Some(user_id) = user_id.filter(|id| !id.is_empty()).map(UserId) else {
            continue;
        };

        // last write wins per user, keeping the first position
        if let Some(existing) = reactions.iter_mut().find(|r| r.user_id == user_id) {
            existing.emoji = emoji;
        } else {
            reactions.push(Reaction { emoji, user_id });
        }
    }
    reactions
}

fn reply_preview_field(raw: &Value) -> Option<ReplyPreview> {
    let reply = ["replyPreview", "replyTo"]
        .iter()
        .find_map(|key| raw.get(*key).filter(|v| !v.is_null()))?;

    if let Some(id) = scalar_to_string(reply) {
        if id.is_empty() {
            return None;
        }
        return Some(ReplyPreview {
            id: MessageId(id),
            username: String::new(),
            text_preview: REPLY_PLACEHOLDER_TEXT.to_string(),
        });
    }

    let id = string_field(reply, &["id", "_id"]).filter(|id| !id.is_empty())?;

    if let Some(text_preview) = string_field(reply, &["textPreview"]) {
        return Some(ReplyPreview {
            id: MessageId(id),
            username: string_field(reply, &["username"]).unwrap_or_default(),
            text_preview,
        });
    }

    let username = string_field(reply, &["username"])
        .or_else(|| {
            ["author", "sender", "user"]
                .iter()
                .filter_map(|key| reply.get(*key))
                .find_map(|author| string_field(author, &["username"]))
        })
        .unwrap_or_default();
    let text_preview = reply
        .get("content")
        .and_then(first_text_run)
        .or_else(|| string_field(reply, &["text"]).filter(|t| !t.trim().is_empty()))
        .unwrap_or_else(|| REPLY_PLACEHOLDER_TEXT.to_string());

    Some(ReplyPreview {
        id: MessageId(id),
        username,
        text_preview,
    })
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(scalar_to_string))
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn timestamp_field(value: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter().find_map(|key| match value.get(*key)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    })
}

fn filename_from_url(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
#[path = "tests/normalizer_tests.rs"]
mod tests;
