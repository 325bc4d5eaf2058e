//! Transient notices shown once and cleared by the client.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Event name the client sends to clear a notice.
pub const CLEAR_FLASH_EVENT: &str = "lv:clear-flash";

/// Storage for notices, keyed by session.
#[async_trait]
pub trait FlashStore: Send + Sync {
    async fn get_all(&self, session_key: &str) -> BTreeMap<String, String>;
    async fn put(&self, session_key: &str, key: &str, message: &str);
    async fn clear(&self, session_key: &str, key: &str);
}

/// In-process flash store.
#[derive(Debug, Clone, Default)]
pub struct MemoryFlashStore {
    sessions: Arc<RwLock<HashMap<String, BTreeMap<String, String>>>>,
}

impl MemoryFlashStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl FlashStore for MemoryFlashStore {
    async fn get_all(&self, session_key: &str) -> BTreeMap<String, String> {
        self.sessions
            .read()
            .await
            .get(session_key)
            .cloned()
            .unwrap_or_default()
    }

    async fn put(&self, session_key: &str, key: &str, message: &str) {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_key.to_string())
            .or_default()
            .insert(key.to_string(), message.to_string());
    }

    async fn clear(&self, session_key: &str, key: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(flash) = sessions.get_mut(session_key) {
            flash.remove(key);
            if flash.is_empty() {
                sessions.remove(session_key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryFlashStore::new();
        store.put("s1", "info", "Saved").await;
        store.put("s1", "error", "Oops").await;
        store.put("s2", "info", "Other").await;

        let flash = store.get_all("s1").await;
        assert_eq!(flash.len(), 2);
        assert_eq!(flash["info"], "Saved");
        assert_eq!(store.get_all("s2").await["info"], "Other");
    }

    #[tokio::test]
    async fn test_clear_removes_empty_session() {
        let store = MemoryFlashStore::new();
        store.put("s1", "info", "Saved").await;
        store.clear("s1", "info").await;
        store.clear("s1", "info").await;
        assert!(store.get_all("s1").await.is_empty());
        assert_eq!(store.session_count().await, 0);
    }
}
