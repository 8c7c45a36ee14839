use tokio::sync::broadcast;
use tracing::trace;

use switchboard_proto::wire::JobEvent;

/// Fan-out bus for dashboard observers. Publishing never blocks the message
/// handling path; each subscriber reads at its own pace and a lagging one
/// drops old events instead of stalling the relay.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget publish. Having no subscribers is not an error.
    pub fn publish(&self, event: JobEvent) {
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!(observers = delivered, "published job event");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_proto::records::JobStatus;

    fn update(job_id: &str) -> JobEvent {
        JobEvent::JobUpdate {
            job_id: job_id.into(),
            status: JobStatus::Ready,
            message: None,
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.publish(update("j1"));
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(update("j1"));

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                JobEvent::JobUpdate { job_id, .. } => assert_eq!(job_id, "j1"),
            }
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(update(&format!("j{i}")));
        }

        // The first read observes the lag, later reads see recent events.
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert!(rx.recv().await.is_ok());
    }
}
