use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::{MessageId, MessageKind, UserSummary},
    error::ApiException,
    protocol::{HistoryQuery, ReactionRequest, SendMessageRequest, UploadResponse},
};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LocalAttachment {
    pub kind: MessageKind,
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl LocalAttachment {
    pub async fn from_path(kind: MessageKind, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read attachment '{}'", path.display()))?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("attachment path has no file name: {}", path.display()))?;
        Ok(Self {
            kind,
            filename,
            mime_type: None,
            bytes,
        })
    }
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn history(&self, limit: u32) -> Result<Vec<Value>>;
    async fn directory(&self) -> Result<Vec<UserSummary>>;
    async fn post_message(&self, request: &SendMessageRequest) -> Result<Value>;
    async fn patch_reaction(&self, message_id: &MessageId, emoji: &str) -> Result<Value>;
    async fn upload(&self, attachment: &LocalAttachment) -> Result<String>;
}

pub struct HttpChatApi {
    http: Client,
    server_url: String,
    token: String,
}

impl HttpChatApi {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), server_url, token)
    }

    pub fn with_client(http: Client, server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        if self.token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.token)
        }
    }
}

async fn read_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow::Error::new(ApiException::from_response(status.as_u16(), &body))
            .context(format!("{what} failed")));
    }
    response
        .json::<T>()
        .await
        .with_context(|| format!("{what} returned an unreadable body"))
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn history(&self, limit: u32) -> Result<Vec<Value>> {
        let limit = limit.clamp(1, 100);
        let response = self
            .authorized(self.http.get(format!("{}/chat/messages", self.server_url)))
            .query(&HistoryQuery { limit })
            .send()
            .await
            .context("history request failed")?;
        let body: Value = read_json(response, "history request").await?;
        let messages = match body {
            Value::Array(items) => items,
            Value::Object(mut object) => match object.remove("messages") {
                Some(Value::Array(items)) => items,
                _ => return Err(anyhow!("history response has no message array")),
            },
            _ => return Err(anyhow!("history response has no message array")),
        };
        debug!(count = messages.len(), limit, "api: history fetched");
        Ok(messages)
    }

    async fn directory(&self) -> Result<Vec<UserSummary>> {
        let response = self
            .authorized(self.http.get(format!("{}/users", self.server_url)))
            .send()
            .await
            .context("directory request failed")?;
        read_json(response, "directory request").await
    }

    async fn post_message(&self, request: &SendMessageRequest) -> Result<Value> {
        let response = self
            .authorized(self.http.post(format!("{}/chat/messages", self.server_url)))
            .json(request)
            .send()
            .await
            .context("send message request failed")?;
        read_json(response, "send message request").await
    }

    async fn patch_reaction(&self, message_id: &MessageId, emoji: &str) -> Result<Value> {
        let response = self
            .authorized(self.http.patch(format!(
                "{}/chat/messages/{}/reaction",
                self.server_url, message_id
            )))
            .json(&ReactionRequest {
                emoji: emoji.to_string(),
            })
            .send()
            .await
            .context("reaction request failed")?;
        read_json(response, "reaction request").await
    }

    async fn upload(&self, attachment: &LocalAttachment) -> Result<String> {
        let kind = serde_json::to_value(attachment.kind)?
            .as_str()
            .unwrap_or("FILE")
            .to_string();
        let response = self
            .authorized(self.http.post(format!("{}/chat/upload", self.server_url)))
            .query(&[
                ("kind", kind),
                ("filename", attachment.filename.clone()),
                (
                    "mime_type",
                    attachment
                        .mime_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                ),
            ])
            .body(attachment.bytes.clone())
            .send()
            .await
            .context("upload request failed")?;
        let body: UploadResponse = read_json(response, "upload request").await?;
        Ok(body.url)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
