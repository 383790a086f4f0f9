use chatlog_config::NotificationConfig;
use chatlog_core::{ConversationSummary, TimelineEntry};
use chatlog_notify::{NotificationSink, NotificationTrigger};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Feeds committed refreshes through the notification trigger and hands
/// the resulting requests to a sink.
pub struct Notifier {
    trigger: Mutex<NotificationTrigger>,
    sink: Arc<dyn NotificationSink>,
    names: RwLock<HashMap<String, String>>,
}

impl Notifier {
    pub fn new(config: NotificationConfig, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            trigger: Mutex::new(NotificationTrigger::new(config)),
            sink,
            names: RwLock::new(HashMap::new()),
        }
    }

    pub async fn update_config(&self, config: NotificationConfig) {
        self.trigger.lock().await.update_config(config);
    }

    pub async fn remember_names(&self, conversations: &[ConversationSummary]) {
        let mut names = self.names.write().await;
        for conversation in conversations {
            names.insert(conversation.id.clone(), conversation.display_name.clone());
        }
    }

    /// Returns how many notifications were delivered.
    pub async fn on_fetch(
        &self,
        conversation_id: &str,
        previous: Option<&[TimelineEntry]>,
        fetched: &[TimelineEntry],
    ) -> usize {
        let name = self.names.read().await.get(conversation_id).cloned();
        let requests = self
            .trigger
            .lock()
            .await
            .evaluate(conversation_id, name.as_deref(), previous, fetched);

        for request in &requests {
            self.sink.deliver(request);
        }
        requests.len()
    }
}
