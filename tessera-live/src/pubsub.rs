//! Topic-based fan-out between views.
//!
//! Each topic owns one tokio broadcast channel. Subscribers get an independent
//! receiver buffering up to `capacity` messages; lagging receivers drop the
//! oldest messages rather than blocking publishers.
//!
//! ```text
//! view A ── broadcast("chat") ──► TopicGroup("chat") ──┬──► view A
//!                                                      ├──► view B
//!                                                      └──► view C
//! ```
//!
//! The hub is an ordinary value: construct one per server (or per test) and
//! hand it to the views through [`crate::manager::Services`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

/// Publish/subscribe collaborator.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Subscribe to `topic`. Dropping the receiver ends the subscription.
    async fn subscribe(&self, topic: &str) -> broadcast::Receiver<Arc<Value>>;

    /// Publish to every current subscriber; returns how many received it.
    async fn broadcast(&self, topic: &str, payload: Value) -> usize;

    /// Release the topic once nobody listens anymore.
    async fn unsubscribe(&self, topic: &str);
}

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub messages_sent: u64,
    pub messages_undelivered: u64,
    pub active_topics: usize,
}

struct TopicGroup {
    sender: broadcast::Sender<Arc<Value>>,
}

impl TopicGroup {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

/// In-process [`PubSub`] backed by tokio broadcast channels.
pub struct BroadcastHub {
    topics: Arc<RwLock<HashMap<String, Arc<TopicGroup>>>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_undelivered: AtomicU64,
}

impl BroadcastHub {
    /// `capacity` bounds how many messages each subscriber may lag behind.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
            messages_sent: AtomicU64::new(0),
            messages_undelivered: AtomicU64::new(0),
        }
    }

    async fn get_or_create(&self, topic: &str) -> Arc<TopicGroup> {
        // Fast path: read lock
        {
            let topics = self.topics.read().await;
            if let Some(group) = topics.get(topic) {
                return group.clone();
            }
        }

        let mut topics = self.topics.write().await;
        // Double-check after acquiring write lock
        if let Some(group) = topics.get(topic) {
            return group.clone();
        }
        let group = Arc::new(TopicGroup::new(self.capacity));
        topics.insert(topic.to_string(), group.clone());
        group
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map_or(0, |group| group.sender.receiver_count())
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_undelivered: self.messages_undelivered.load(Ordering::Relaxed),
            active_topics: self.topic_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl PubSub for BroadcastHub {
    async fn subscribe(&self, topic: &str) -> broadcast::Receiver<Arc<Value>> {
        self.get_or_create(topic).await.sender.subscribe()
    }

    async fn broadcast(&self, topic: &str, payload: Value) -> usize {
        let group = self.topics.read().await.get(topic).cloned();
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        match group {
            Some(group) => group.sender.send(Arc::new(payload)).unwrap_or(0),
            None => {
                self.messages_undelivered.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    async fn unsubscribe(&self, topic: &str) {
        let mut topics = self.topics.write().await;
        if topics
            .get(topic)
            .is_some_and(|group| group.sender.receiver_count() == 0)
        {
            topics.remove(topic);
        }
    }
}
