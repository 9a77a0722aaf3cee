//! Notify module - Turn farm events into user-facing notifications

use crate::events::FarmEvent;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// Outbound toast/native notification sink
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str, body: &str) {
        tracing::info!(target: "drop_farmer::notify", "{}: {}", title, body);
    }
}

/// Title and body for an event, `None` for events that are not notified
pub fn render(event: &FarmEvent) -> Option<(String, String)> {
    match event {
        FarmEvent::ConditionFulfilled { farm_id } => Some((
            "Condition fulfilled".to_string(),
            format!("{} reached its farming goal and stopped checking", farm_id),
        )),
        FarmEvent::AttentionRequired { farm_id, reason } => Some((
            "Attention required".to_string(),
            format!("{} needs attention: {}", farm_id, reason),
        )),
        FarmEvent::StatusChanged { .. } => None,
    }
}

/// Forward events from `rx` to `notifier` until the bus closes
pub fn spawn_dispatcher(
    mut rx: broadcast::Receiver<FarmEvent>,
    notifier: Arc<dyn Notifier>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some((title, body)) = render(&event) {
                        notifier.notify(&title, &body);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Notification dispatcher lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("Notification dispatcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl Notifier for Recorder {
        fn notify(&self, title: &str, body: &str) {
            self.sent.lock().unwrap().push((title.to_string(), body.to_string()));
        }
    }

    #[test]
    fn test_render() {
        let (title, body) = render(&FarmEvent::AttentionRequired {
            farm_id: "valorant".to_string(),
            reason: "timed out".to_string(),
        })
        .unwrap();
        assert_eq!(title, "Attention required");
        assert!(body.contains("valorant"));
        assert!(body.contains("timed out"));
    }

    #[tokio::test]
    async fn test_dispatcher_forwards_until_closed() {
        let bus = EventBus::new(8);
        let recorder = Arc::new(Recorder::default());
        let handle = spawn_dispatcher(bus.subscribe(), recorder.clone());

        bus.condition_fulfilled("league-of-legends");
        bus.attention_required("valorant", "boom");
        drop(bus);
        handle.await.unwrap();

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "Condition fulfilled");
        assert_eq!(sent[1].0, "Attention required");
    }
}
