use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use shared::domain::ChatMessage;
use storage::Storage;

use crate::normalizer::normalize_message;

pub const MESSAGE_CACHE_NAMESPACE: &str = "chat/messages";

#[async_trait]
pub trait MessageCache: Send + Sync {
    async fn load(&self) -> Result<Option<Vec<ChatMessage>>>;
    async fn save(&self, messages: &[ChatMessage]) -> Result<()>;
}

pub struct NoopMessageCache;

#[async_trait]
impl MessageCache for NoopMessageCache {
    async fn load(&self) -> Result<Option<Vec<ChatMessage>>> {
        Ok(None)
    }

    async fn save(&self, _messages: &[ChatMessage]) -> Result<()> {
        Ok(())
    }
}

pub struct DurableMessageCache {
    store: Storage,
}

impl DurableMessageCache {
    pub async fn initialize(database_url: &str) -> Result<Self> {
        let store = Storage::new(database_url)
            .await
            .with_context(|| format!("failed to initialize message cache at '{database_url}'"))?;
        Ok(Self::new(store))
    }

    pub fn new(store: Storage) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageCache for DurableMessageCache {
    async fn load(&self) -> Result<Option<Vec<ChatMessage>>> {
        let Some(snapshot) = self.store.get_snapshot(MESSAGE_CACHE_NAMESPACE).await? else {
            return Ok(None);
        };
        // records written by older builds are re-normalized rather than rejected
        let records: Vec<Value> = serde_json::from_str(&snapshot.payload)
            .with_context(|| format!("corrupt message snapshot in '{MESSAGE_CACHE_NAMESPACE}'"))?;
        Ok(Some(records.iter().map(normalize_message).collect()))
    }

    async fn save(&self, messages: &[ChatMessage]) -> Result<()> {
        let payload = serde_json::to_string(messages).context("failed to encode message snapshot")?;
        self.store.put_snapshot(MESSAGE_CACHE_NAMESPACE, &payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn round_trips_the_ordered_log() {
        let cache = DurableMessageCache::initialize("sqlite::memory:")
            .await
            .expect("cache");
        assert!(cache.load().await.expect("empty load").is_none());

        let messages = vec![
            normalize_message(&json!({ "id": "m2", "createdAt": "2024-05-01T10:00:00Z" })),
            normalize_message(&json!({ "id": "m1", "kind": "IMAGE", "mediaUrl": "x/y.png" })),
        ];
        cache.save(&messages).await.expect("save");
        assert_eq!(cache.load().await.expect("load"), Some(messages));
    }

    #[tokio::test]
    async fn save_overwrites_rather_than_merges() {
        let cache = DurableMessageCache::initialize("sqlite::memory:")
            .await
            .expect("cache");
        cache
            .save(&[normalize_message(&json!({ "id": "a" }))])
            .await
            .expect("first save");
        cache
            .save(&[normalize_message(&json!({ "id": "b" }))])
            .await
            .expect("second save");

        let loaded = cache.load().await.expect("load").expect("snapshot");
        let ids: Vec<&str> = loaded.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_reported() {
        let store = Storage::new("sqlite::memory:").await.expect("db");
        store
            .put_snapshot(MESSAGE_CACHE_NAMESPACE, "{not json")
            .await
            .expect("write");
        let cache = DurableMessageCache::new(store);
        assert!(cache.load().await.is_err());
    }
}
