//! In-process notification fan-out, one broadcast channel per chat topic.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use telecare_domain::events::ChatEvent;
use telecare_domain::ports::BoxFuture;
use telecare_domain::ports::notify::NotificationChannel;

/// Topic channels are created lazily on first use and kept for the process
/// lifetime. Pushes to a topic with no live subscribers are dropped.
#[derive(Clone)]
pub struct LocalNotificationChannel {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<ChatEvent>>>>,
    capacity: usize,
}

impl LocalNotificationChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    async fn sender(&self, topic_id: &str) -> broadcast::Sender<ChatEvent> {
        if let Some(sender) = self.topics.read().await.get(topic_id) {
            return sender.clone();
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(topic_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub async fn subscribe(&self, topic_id: &str) -> broadcast::Receiver<ChatEvent> {
        self.sender(topic_id).await.subscribe()
    }
}

impl NotificationChannel for LocalNotificationChannel {
    fn push(&self, topic_id: &str, event: &ChatEvent) -> BoxFuture<'_, ()> {
        let topic_id = topic_id.to_string();
        let event = event.clone();
        Box::pin(async move {
            let sender = self.sender(&topic_id).await;
            if sender.send(event).is_err() {
                debug!(topic_id = %topic_id, "event dropped, no subscribers");
            }
        })
    }
}
