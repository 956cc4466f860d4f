use async_trait::async_trait;

use crate::services::contracts::{NotificationDispatcher, PublishNotification};

/// Dispatcher that records notifications in the log stream. Stands in until a
/// real delivery channel (email, push) is wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for LogNotificationDispatcher {
    async fn dispatch(&self, notification: &PublishNotification) -> anyhow::Result<()> {
        tracing::info!(
            kind = %notification.kind,
            exam_id = %notification.exam_id,
            total_success = notification.stats.total_success,
            total_errors = notification.stats.total_errors,
            "Publish notification dispatched"
        );
        metrics::counter!("notifications_dispatched_total").increment(1);
        Ok(())
    }
}
