use super::BoxFuture;
use crate::events::ChatEvent;

/// Push transport for chat-scoped events.
///
/// Delivery is best-effort: a push to a topic with no subscribers is a
/// no-op, and this layer adds no delivery guarantee beyond what the
/// underlying transport provides.
pub trait NotificationChannel: Send + Sync {
    fn push(&self, topic_id: &str, event: &ChatEvent) -> BoxFuture<'_, ()>;
}
