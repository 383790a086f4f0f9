use chatlog_core::TimelineEntry;
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Published after every successful cache commit.
#[derive(Debug, Clone)]
pub struct CacheUpdated {
    pub conversation_id: String,
    pub entries: Arc<Vec<TimelineEntry>>,
}

/// Typed publish/subscribe channel for cache updates.
///
/// Delivery reaches every subscriber alive at publish time; nothing is
/// retained for later subscribers.
#[derive(Clone)]
pub struct CacheEvents {
    sender: broadcast::Sender<CacheUpdated>,
}

impl CacheEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdated> {
        self.sender.subscribe()
    }

    pub fn publish(&self, conversation_id: &str, entries: Vec<TimelineEntry>) {
        let event = CacheUpdated {
            conversation_id: conversation_id.to_string(),
            entries: Arc::new(entries),
        };
        // No receivers is not an error.
        let _ = self.sender.send(event);
    }
}

impl Default for CacheEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_updates() {
        let events = CacheEvents::new();
        let mut first = events.subscribe();
        let mut second = events.subscribe();

        events.publish("alice", Vec::new());

        let a = first.recv().await.expect("first subscriber");
        let b = second.recv().await.expect("second subscriber");
        assert_eq!(a.conversation_id, "alice");
        assert_eq!(b.conversation_id, "alice");
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        CacheEvents::new().publish("alice", Vec::new());
    }
}
