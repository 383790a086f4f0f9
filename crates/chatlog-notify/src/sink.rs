use crate::NotificationRequest;

pub trait NotificationSink: Send + Sync {
    fn deliver(&self, request: &NotificationRequest);
}

/// Writes notification requests to the log instead of a desktop surface.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn deliver(&self, request: &NotificationRequest) {
        tracing::info!(
            kind = ?request.kind,
            conversation = %request.conversation_id,
            seq = request.key.seq,
            title = %request.title,
            body = %request.body,
            "notification requested"
        );
    }
}
