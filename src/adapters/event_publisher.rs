//! Event Publisher Adapters
//!
//! Sinks for [`DomainEvent`]s: a tracing sink for operators, a collector
//! for tests, a broadcast channel for in-process subscribers, and a fan-out
//! that feeds several sinks at once.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::events::DomainEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Writes every event to the tracing subscriber.
///
/// Failures (repair failed, escalation, audit failures, failed or expired
/// recoveries) are always logged at `warn`. Everything else goes out at
/// `info` or `debug` depending on how the sink was built.
#[derive(Debug, Clone, Default)]
pub struct TracingEventPublisher {
    verbose: bool,
}

impl TracingEventPublisher {
    /// Routine events at `debug`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Routine events at `info`.
    pub fn verbose() -> Self {
        Self { verbose: true }
    }

    fn is_alarm(event: &DomainEvent) -> bool {
        match event {
            DomainEvent::RedundancyEscalated { .. }
            | DomainEvent::RepairFailed { .. }
            | DomainEvent::RecoveryExpired { .. }
            | DomainEvent::RecoveryFailed { .. }
            | DomainEvent::AuditFailed { .. } => true,
            DomainEvent::EmergencyRecovery { success, .. } => !success,
            _ => false,
        }
    }
}

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let kind = event.event_type();
        let file_id = event.file_id().unwrap_or("-");
        let recovery_id = event.recovery_id().map(|id| id.to_string());
        let recovery_id = recovery_id.as_deref().unwrap_or("-");
        let body = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        if Self::is_alarm(&event) {
            warn!(event_type = kind, file_id, recovery_id, event = %body, "Domain event");
        } else if self.verbose {
            info!(event_type = kind, file_id, recovery_id, event = %body, "Domain event");
        } else {
            debug!(event_type = kind, file_id, recovery_id, event = %body, "Domain event");
        }
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// Keeps every published event in order. Test and simulation sink.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<DomainEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.matching(|e| e.event_type() == event_type)
    }

    pub fn count_of_type(&self, event_type: &str) -> usize {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }

    /// Everything that happened to one file.
    pub fn for_file(&self, file_id: &str) -> Vec<DomainEvent> {
        self.matching(|e| e.file_id() == Some(file_id))
    }

    /// Everything that happened in one recovery session.
    pub fn for_recovery(&self, recovery_id: Uuid) -> Vec<DomainEvent> {
        self.matching(|e| e.recovery_id() == Some(recovery_id))
    }

    fn matching(&self, keep: impl Fn(&DomainEvent) -> bool) -> Vec<DomainEvent> {
        self.events.read().iter().filter(|e| keep(e)).cloned().collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        self.events.write().extend(events);
        Ok(())
    }
}

/// Fan-out publisher backed by a tokio broadcast channel.
///
/// Subscribers that fall more than `capacity` events behind observe
/// `RecvError::Lagged` and skip ahead. Publishing with no subscribers is
/// not an error.
#[derive(Debug, Clone)]
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<DomainEvent>,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        for event in events {
            let _ = self.sender.send(event);
        }
        Ok(())
    }
}

/// Delivers each event to every sink.
///
/// A failing sink does not starve the others: delivery continues and the
/// first error is returned once all sinks have been tried.
#[derive(Default, Clone)]
pub struct FanoutEventPublisher {
    sinks: Vec<Arc<dyn EventPublisher>>,
}

impl FanoutEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventPublisher>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

impl std::fmt::Debug for FanoutEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutEventPublisher")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[async_trait]
impl EventPublisher for FanoutEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.publish_all(vec![event]).await
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish_all(events.clone()).await {
                warn!(error = %e, "Event sink rejected events");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct Broken;

    #[async_trait]
    impl EventPublisher for Broken {
        async fn publish(&self, _event: DomainEvent) -> Result<()> {
            Err(Error::Internal("sink offline".into()))
        }

        async fn publish_all(&self, _events: Vec<DomainEvent>) -> Result<()> {
            Err(Error::Internal("sink offline".into()))
        }
    }

    #[tokio::test]
    async fn test_tracing_publisher_accepts_everything() {
        let publisher = TracingEventPublisher::verbose();
        publisher
            .publish(DomainEvent::shard_stored("file-1", 1, "node-a", "blob-1"))
            .await
            .unwrap();
        publisher
            .publish(DomainEvent::redundancy_escalated("file-1", 1, 3))
            .await
            .unwrap();
    }

    #[test]
    fn test_alarm_classification() {
        assert!(TracingEventPublisher::is_alarm(&DomainEvent::redundancy_escalated("f", 1, 3)));
        assert!(TracingEventPublisher::is_alarm(&DomainEvent::emergency_recovery("f", 1, 4, false)));
        assert!(!TracingEventPublisher::is_alarm(&DomainEvent::emergency_recovery("f", 3, 3, true)));
        assert!(!TracingEventPublisher::is_alarm(&DomainEvent::shard_retrieved("f", 1, "n")));
    }

    #[tokio::test]
    async fn test_collector_queries() {
        let collector = InMemoryEventCollector::new();
        assert!(collector.is_empty());

        let recovery_id = Uuid::new_v4();
        collector
            .publish_all(vec![
                DomainEvent::shard_stored("file-1", 1, "a", "s1"),
                DomainEvent::shard_stored("file-2", 2, "b", "s2"),
                DomainEvent::recovery_completed(recovery_id, "alice"),
            ])
            .await
            .unwrap();

        assert_eq!(collector.len(), 3);
        assert_eq!(collector.count_of_type("ShardStored"), 2);
        assert_eq!(collector.events_of_type("RepairFailed").len(), 0);
        assert_eq!(collector.for_file("file-2").len(), 1);
        assert_eq!(collector.for_recovery(recovery_id).len(), 1);

        collector.clear();
        assert!(collector.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_publisher() {
        let publisher = BroadcastEventPublisher::new(16);

        // No subscribers yet
        publisher
            .publish(DomainEvent::recovery_completed(Uuid::new_v4(), "alice"))
            .await
            .unwrap();

        let mut rx1 = publisher.subscribe();
        let mut rx2 = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 2);

        let event = DomainEvent::shard_retrieved("file-9", 3, "node-c");
        publisher.publish(event.clone()).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_fanout_survives_broken_sink() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let fanout = FanoutEventPublisher::new()
            .with_sink(Arc::new(Broken))
            .with_sink(collector.clone());
        assert_eq!(fanout.sink_count(), 2);

        let result = fanout
            .publish(DomainEvent::shard_stored("test", 1, "a", "s"))
            .await;
        assert!(matches!(result, Err(Error::Internal(_))));
        assert_eq!(collector.len(), 1);
        assert!(format!("{:?}", fanout).contains("sinks: 2"));
    }
}
