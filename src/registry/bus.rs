// src/registry/bus.rs
// In-process event bus: one broadcast channel, topic filtering on the
// consumer side. Publication is at-least-once; consumers dedupe by
// (entity_ref, version).

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::model::{EntityKind, EntityRef, StateChange};

#[derive(Debug, Clone, Default)]
pub struct TopicFilter {
    pub kind: Option<EntityKind>,
    pub entity: Option<EntityRef>,
}

impl TopicFilter {
    pub fn all() -> Self {
        TopicFilter::default()
    }

    pub fn for_kind(kind: EntityKind) -> Self {
        TopicFilter { kind: Some(kind), entity: None }
    }

    pub fn for_entity(entity: EntityRef) -> Self {
        TopicFilter { kind: None, entity: Some(entity) }
    }

    pub fn matches(&self, event: &StateChange) -> bool {
        if let Some(kind) = self.kind {
            if event.entity_ref.kind != kind {
                return false;
            }
        }
        if let Some(entity) = &self.entity {
            if &event.entity_ref != entity {
                return false;
            }
        }
        true
    }
}

pub struct EventBus {
    tx: broadcast::Sender<Arc<StateChange>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        EventBus { tx }
    }

    pub fn publish(&self, event: Arc<StateChange>) {
        // No receivers is fine; the log still has the event.
        let _ = self.tx.send(event);
    }

    pub fn receiver(&self) -> broadcast::Receiver<Arc<StateChange>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StateChangeSource;
    use chrono::Utc;

    fn event(entity: EntityRef, version: u64) -> StateChange {
        StateChange {
            entity_ref: entity,
            version,
            prev: None,
            next: serde_json::json!({}),
            detected_at: Utc::now(),
            source: StateChangeSource::Orchestrator,
        }
    }

    #[test]
    fn filters_match_by_kind_and_entity() {
        let lab_event = event(EntityRef::lab("l1"), 1);
        assert!(TopicFilter::all().matches(&lab_event));
        assert!(TopicFilter::for_kind(EntityKind::Lab).matches(&lab_event));
        assert!(!TopicFilter::for_kind(EntityKind::Vm).matches(&lab_event));
        assert!(TopicFilter::for_entity(EntityRef::lab("l1")).matches(&lab_event));
        assert!(!TopicFilter::for_entity(EntityRef::lab("l2")).matches(&lab_event));
    }

    #[tokio::test]
    async fn published_events_reach_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.receiver();
        bus.publish(Arc::new(event(EntityRef::lab("l1"), 1)));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.version, 1);
    }
}
