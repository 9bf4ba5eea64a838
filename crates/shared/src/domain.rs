use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    File,
}

impl MessageKind {
    /// Case-insensitive parse of the kind names the server has used over time.
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "TEXT" => Some(Self::Text),
            "IMAGE" => Some(Self::Image),
            "VIDEO" => Some(Self::Video),
            "AUDIO" => Some(Self::Audio),
            "FILE" => Some(Self::File),
            _ => None,
        }
    }

    pub fn is_media(self) -> bool {
        self != Self::Text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub id: UserId,
    pub name: String,
    pub username: String,
    pub avatar_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    pub user_id: UserId,
}

/// Point-in-time snapshot of a quoted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPreview {
    pub id: MessageId,
    pub username: String,
    pub text_preview: String,
}

/// Canonical message record held by the local log.
///
/// Records are replaced wholesale, never patched field by field.
/// `media_url` and `filename` are present iff `kind` is not [`MessageKind::Text`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub author: Author,
    pub content: serde_json::Value,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_preview: Option<ReplyPreview>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn reaction_of(&self, user_id: &UserId) -> Option<&Reaction> {
        self.reactions.iter().find(|r| &r.user_id == user_id)
    }

    /// Returns a copy with `user_id`'s reaction toggled to `emoji`.
    pub fn with_reaction_toggled(&self, user_id: &UserId, emoji: &str) -> Self {
        let mut next = self.clone();
        next.reactions = toggle_reaction(&self.reactions, user_id, emoji);
        next
    }
}

/// Applies one reaction pick from `user_id`, keeping at most one entry per user.
///
/// Same emoji as the current entry removes it, a different emoji replaces it in
/// place, and no entry appends a new one.
pub fn toggle_reaction(reactions: &[Reaction], user_id: &UserId, emoji: &str) -> Vec<Reaction> {
    let mut next: Vec<Reaction> = Vec::with_capacity(reactions.len() + 1);
    let mut handled = false;
    for reaction in reactions {
        if &reaction.user_id != user_id {
            next.push(reaction.clone());
            continue;
        }
        if handled {
            // stray duplicate for this user
            continue;
        }
        handled = true;
        if reaction.emoji != emoji {
            next.push(Reaction {
                emoji: emoji.to_string(),
                user_id: user_id.clone(),
            });
        }
    }
    if !handled {
        next.push(Reaction {
            emoji: emoji.to_string(),
            user_id: user_id.clone(),
        });
    }
    next
}

/// Directory / presence record for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    #[serde(alias = "_id")]
    pub id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, alias = "avatar")]
    pub avatar_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub id: UserId,
    pub name: String,
    pub username: String,
    pub avatar_url: String,
    pub is_online: bool,
}

impl PresenceEntry {
    pub fn from_user(user: &UserSummary, is_online: bool) -> Self {
        Self {
            id: user.id.clone(),
            name: user.name.clone(),
            username: user.username.clone(),
            avatar_url: user.avatar_url.clone(),
            is_online,
        }
    }
}
