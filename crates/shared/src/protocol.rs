use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, MessageKind, UserId, UserSummary};

/// Events pushed by the chat server over the persistent connection.
///
/// Message payloads stay untyped here; they are mapped into
/// [`crate::domain::ChatMessage`] by the client's normalizer, which tolerates
/// the various author and reply shapes the server emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    NewMessage(serde_json::Value),
    MessageUpdated(serde_json::Value),
    OnlineUsers(Vec<UserSummary>),
    UserTyping(TypingPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub username: String,
    pub is_typing: bool,
}

/// Frames the client writes to the persistent connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientFrame {
    Auth(Handshake),
    Typing(bool),
}

/// First frame on every (re)connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub token: String,
    pub user: HandshakeUser,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeUser {
    pub id: UserId,
    pub username: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: serde_json::Value,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    #[serde(alias = "mediaUrl", alias = "fileUrl")]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub limit: u32,
}
