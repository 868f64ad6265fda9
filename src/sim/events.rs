//! Event Pipeline
//!
//! Systems raise events while simulating. Because a predicted tick may be
//! simulated several times (once per rollback) and then be overruled by the
//! verified simulation, delivery follows a small state machine per
//! [`EventKey`]:
//!
//! ```text
//!   synced   ── raised on verified tick ──► Deliver
//!            ── raised on predicted tick ─► dropped
//!
//!   unsynced ── first raise (any tick) ───► Deliver ─► pending
//!   pending  ── tick verified, raised again in verified sim ─► Confirm
//!            ── tick verified, not raised / outside window ──► Cancel
//! ```
//!
//! Pending events are resolved in key order, so every confirm or cancel for
//! tick `T` fires after all events of ticks `< T` resolved.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::core::hash::ChecksumAccumulator;
use crate::sim::frame::Tick;

/// Event type identifier.
pub type EventTypeId = u16;

/// A gameplay event type.
pub trait Event: fmt::Debug + Send + Sync + 'static {
    /// Unique type id.
    const ID: EventTypeId;
    /// Synced events are only delivered from verified ticks and never
    /// confirmed or canceled.
    const SYNCED: bool = false;
    /// Fold the identifying fields into the content hash.
    fn hash_content(&self, hasher: &mut ChecksumAccumulator);
}

/// Object-safe view of an [`Event`].
pub trait DynEvent: fmt::Debug + Send + Sync {
    /// Type id.
    fn event_type(&self) -> EventTypeId;
    /// See [`Event::SYNCED`].
    fn is_synced(&self) -> bool;
    /// For downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<E: Event> DynEvent for E {
    fn event_type(&self) -> EventTypeId {
        E::ID
    }

    fn is_synced(&self) -> bool {
        E::SYNCED
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Identity of one event occurrence. Ordered by tick first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    /// Tick the event was raised on.
    pub tick: Tick,
    /// Event type.
    pub event_type: EventTypeId,
    /// Hash of the event's identifying content.
    pub content_hash: u64,
}

impl EventKey {
    /// Key of `event` raised on `tick`.
    pub fn of<E: Event>(tick: Tick, event: &E) -> Self {
        let mut hasher = ChecksumAccumulator::new();
        event.hash_content(&mut hasher);
        Self {
            tick,
            event_type: E::ID,
            content_hash: hasher.finish(),
        }
    }
}

/// An event as raised by a frame.
#[derive(Debug, Clone)]
pub struct RaisedEvent {
    /// Identity.
    pub key: EventKey,
    /// Whether the event type is synced.
    pub synced: bool,
    /// Payload.
    pub event: Arc<dyn DynEvent>,
}

impl RaisedEvent {
    /// Wrap a typed event raised on `tick`.
    pub fn new<E: Event>(tick: Tick, event: E) -> Self {
        Self {
            key: EventKey::of(tick, &event),
            synced: E::SYNCED,
            event: Arc::new(event),
        }
    }

    /// Downcast the payload.
    pub fn downcast<E: Event>(&self) -> Option<&E> {
        self.event.as_any().downcast_ref::<E>()
    }
}

// =============================================================================
// TYPE REGISTRY
// =============================================================================

#[derive(Debug, Clone)]
struct EventTypeInfo {
    name: String,
    parent: Option<EventTypeId>,
}

/// Event type names and parent links.
///
/// Subscribing to a base type also receives every derived type.
#[derive(Debug, Clone, Default)]
pub struct EventTypeRegistry {
    types: BTreeMap<EventTypeId, EventTypeInfo>,
}

impl EventTypeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type id.
    pub fn register(&mut self, id: EventTypeId, name: impl Into<String>, parent: Option<EventTypeId>) -> &mut Self {
        self.types.insert(
            id,
            EventTypeInfo {
                name: name.into(),
                parent,
            },
        );
        self
    }

    /// Register a typed event.
    pub fn register_event<E: Event>(&mut self, name: impl Into<String>, parent: Option<EventTypeId>) -> &mut Self {
        self.register(E::ID, name, parent)
    }

    /// Registered name.
    pub fn name(&self, id: EventTypeId) -> Option<&str> {
        self.types.get(&id).map(|t| t.name.as_str())
    }

    /// Parent type.
    pub fn parent(&self, id: EventTypeId) -> Option<EventTypeId> {
        self.types.get(&id).and_then(|t| t.parent)
    }

    /// True if `id` is `base` or derives from it.
    pub fn is_a(&self, id: EventTypeId, base: EventTypeId) -> bool {
        let mut current = Some(id);
        // Parent chains longer than the registry mean a cycle.
        for _ in 0..=self.types.len() {
            match current {
                Some(ty) if ty == base => return true,
                Some(ty) => current = self.parent(ty),
                None => return false,
            }
        }
        false
    }
}

// =============================================================================
// PIPELINE
// =============================================================================

/// What to do with an event.
#[derive(Debug, Clone)]
pub enum EventAction {
    /// First delivery.
    Deliver(RaisedEvent),
    /// Pending unsynced event held up by verification.
    Confirm(RaisedEvent),
    /// Pending unsynced event dropped by verification.
    Cancel(RaisedEvent),
}

impl EventAction {
    /// The event this action is about.
    pub fn event(&self) -> &RaisedEvent {
        match self {
            EventAction::Deliver(e) | EventAction::Confirm(e) | EventAction::Cancel(e) => e,
        }
    }
}

/// Tracks unsynced events between first delivery and resolution.
#[derive(Debug)]
pub struct EventPipeline {
    pending: BTreeMap<EventKey, RaisedEvent>,
    verified_raised: BTreeMap<Tick, BTreeSet<EventKey>>,
    last_verified: Option<Tick>,
    rollback_window: i32,
}

impl EventPipeline {
    /// Pipeline for a session with the given rollback window.
    pub fn new(rollback_window: i32) -> Self {
        Self {
            pending: BTreeMap::new(),
            verified_raised: BTreeMap::new(),
            last_verified: None,
            rollback_window,
        }
    }

    /// Unresolved unsynced events.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Last resolved tick.
    pub fn last_verified(&self) -> Option<Tick> {
        self.last_verified
    }

    /// Feed the events raised by one simulation of `tick`.
    pub fn on_simulated(&mut self, tick: Tick, verified: bool, raised: Vec<RaisedEvent>) -> Vec<EventAction> {
        let mut actions = Vec::new();
        for event in raised {
            if event.synced {
                if verified {
                    actions.push(EventAction::Deliver(event));
                }
                continue;
            }

            if verified {
                self.verified_raised.entry(tick).or_default().insert(event.key);
            }
            if self.pending.contains_key(&event.key) || self.is_resolved(event.key.tick) {
                continue;
            }
            self.pending.insert(event.key, event.clone());
            actions.push(EventAction::Deliver(event));
        }
        actions
    }

    fn is_resolved(&self, tick: Tick) -> bool {
        self.last_verified.is_some_and(|last| tick <= last)
    }

    /// Resolve every pending event of ticks up to and including `tick`.
    pub fn on_verified(&mut self, tick: Tick) -> Vec<EventAction> {
        let oldest_allowed = tick.saturating_sub(self.rollback_window);
        let keep = self.pending.split_off(&EventKey {
            tick: tick.saturating_add(1),
            event_type: 0,
            content_hash: 0,
        });
        let due = std::mem::replace(&mut self.pending, keep);

        let mut actions = Vec::with_capacity(due.len());
        for (key, event) in due {
            let confirmed = key.tick >= oldest_allowed
                && self
                    .verified_raised
                    .get(&key.tick)
                    .is_some_and(|keys| keys.contains(&key));
            actions.push(if confirmed {
                EventAction::Confirm(event)
            } else {
                EventAction::Cancel(event)
            });
        }

        self.verified_raised = self.verified_raised.split_off(&tick.saturating_add(1));
        self.last_verified = Some(tick);
        actions
    }

    /// Cancel everything pending, e.g. on resync or shutdown.
    pub fn cancel_all(&mut self) -> Vec<EventAction> {
        self.verified_raised.clear();
        std::mem::take(&mut self.pending)
            .into_values()
            .map(EventAction::Cancel)
            .collect()
    }

    /// Forget resolution history, after a resync to `tick`.
    pub fn reset_to(&mut self, tick: Tick) {
        self.pending.clear();
        self.verified_raised.clear();
        self.last_verified = Some(tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Hit {
        target: u32,
    }

    impl Event for Hit {
        const ID: EventTypeId = 1;
        fn hash_content(&self, hasher: &mut ChecksumAccumulator) {
            hasher.update_u32(self.target);
        }
    }

    #[derive(Debug)]
    struct Score;

    impl Event for Score {
        const ID: EventTypeId = 2;
        const SYNCED: bool = true;
        fn hash_content(&self, _hasher: &mut ChecksumAccumulator) {}
    }

    fn kinds(actions: &[EventAction]) -> Vec<&'static str> {
        actions
            .iter()
            .map(|a| match a {
                EventAction::Deliver(_) => "deliver",
                EventAction::Confirm(_) => "confirm",
                EventAction::Cancel(_) => "cancel",
            })
            .collect()
    }

    #[test]
    fn test_registry_hierarchy() {
        let mut registry = EventTypeRegistry::new();
        registry.register(1, "Damage", None).register(2, "CriticalDamage", Some(1));
        assert!(registry.is_a(2, 1));
        assert!(registry.is_a(1, 1));
        assert!(!registry.is_a(1, 2));
        assert_eq!(registry.name(2), Some("CriticalDamage"));

        registry.register(1, "Damage", Some(2));
        assert!(!registry.is_a(1, 3));
    }

    #[test]
    fn test_synced_only_from_verified() {
        let mut pipeline = EventPipeline::new(10);
        assert!(pipeline.on_simulated(1, false, vec![RaisedEvent::new(1, Score)]).is_empty());
        let actions = pipeline.on_simulated(1, true, vec![RaisedEvent::new(1, Score)]);
        assert_eq!(kinds(&actions), vec!["deliver"]);
        assert!(pipeline.on_verified(1).is_empty());
    }

    #[test]
    fn test_unsynced_delivered_once_then_confirmed() {
        let mut pipeline = EventPipeline::new(10);
        let hit = || vec![RaisedEvent::new(3, Hit { target: 7 })];

        assert_eq!(kinds(&pipeline.on_simulated(3, false, hit())), vec!["deliver"]);
        assert!(pipeline.on_simulated(3, false, hit()).is_empty());
        assert!(pipeline.on_simulated(3, true, hit()).is_empty());
        assert_eq!(kinds(&pipeline.on_verified(3)), vec!["confirm"]);
        assert_eq!(pipeline.pending_count(), 0);
    }

    #[test]
    fn test_mispredicted_event_canceled() {
        let mut pipeline = EventPipeline::new(10);
        pipeline.on_simulated(3, false, vec![RaisedEvent::new(3, Hit { target: 1 })]);

        let verified = pipeline.on_simulated(3, true, vec![RaisedEvent::new(3, Hit { target: 2 })]);
        assert_eq!(kinds(&verified), vec!["deliver"]);

        let resolved = pipeline.on_verified(3);
        let mut resolved_kinds = kinds(&resolved);
        resolved_kinds.sort_unstable();
        assert_eq!(resolved_kinds, vec!["cancel", "confirm"]);
        let canceled: Vec<_> = resolved
            .iter()
            .filter(|a| matches!(a, EventAction::Cancel(_)))
            .map(|a| a.event().downcast::<Hit>().unwrap().target)
            .collect();
        assert_eq!(canceled, vec![1]);
    }

    #[test]
    fn test_head_of_line_order() {
        let mut pipeline = EventPipeline::new(10);
        pipeline.on_simulated(5, false, vec![RaisedEvent::new(5, Hit { target: 5 })]);
        pipeline.on_simulated(4, false, vec![RaisedEvent::new(4, Hit { target: 4 })]);
        pipeline.on_simulated(4, true, vec![RaisedEvent::new(4, Hit { target: 4 })]);

        // Only tick 4 is due; tick 5 stays pending.
        let actions = pipeline.on_verified(4);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].event().key.tick, 4);
        assert_eq!(pipeline.pending_count(), 1);
    }

    #[test]
    fn test_outside_window_canceled() {
        let mut pipeline = EventPipeline::new(2);
        pipeline.on_simulated(1, false, vec![RaisedEvent::new(1, Hit { target: 1 })]);
        pipeline.on_simulated(1, true, vec![RaisedEvent::new(1, Hit { target: 1 })]);
        let actions = pipeline.on_verified(10);
        assert_eq!(kinds(&actions), vec!["cancel"]);
    }

    #[test]
    fn test_cancel_all() {
        let mut pipeline = EventPipeline::new(10);
        pipeline.on_simulated(1, false, vec![RaisedEvent::new(1, Hit { target: 1 })]);
        pipeline.on_simulated(2, false, vec![RaisedEvent::new(2, Hit { target: 1 })]);
        assert_eq!(kinds(&pipeline.cancel_all()), vec!["cancel", "cancel"]);
        assert_eq!(pipeline.pending_count(), 0);
    }

    proptest! {
        #[test]
        fn prop_unsynced_resolved_exactly_once_in_order(
            predicted in proptest::collection::vec(proptest::collection::vec(0u32..4, 0..3), 1..8),
            verified in proptest::collection::vec(proptest::collection::vec(0u32..4, 0..3), 1..8),
        ) {
            let ticks = predicted.len().min(verified.len());
            let mut pipeline = EventPipeline::new(64);
            let mut delivered = BTreeSet::new();
            let mut resolved = BTreeSet::new();
            let mut last_resolved_tick = i32::MIN;

            let raise = |tick: usize, targets: &[u32]| {
                targets
                    .iter()
                    .map(|&t| RaisedEvent::new(tick as Tick, Hit { target: t }))
                    .collect::<Vec<_>>()
            };

            let record = |actions: Vec<EventAction>,
                              delivered: &mut BTreeSet<EventKey>,
                              resolved: &mut BTreeSet<EventKey>,
                              last: &mut i32| {
                for action in actions {
                    let key = action.event().key;
                    match action {
                        EventAction::Deliver(_) => prop_assert!(delivered.insert(key)),
                        EventAction::Confirm(_) | EventAction::Cancel(_) => {
                            prop_assert!(delivered.contains(&key));
                            prop_assert!(resolved.insert(key));
                            prop_assert!(key.tick >= *last);
                            *last = key.tick;
                        }
                    }
                }
                Ok(())
            };

            // Predict everything twice, then verify tick by tick.
            for _ in 0..2 {
                for tick in 0..ticks {
                    let actions = pipeline.on_simulated(tick as Tick, false, raise(tick, &predicted[tick]));
                    record(actions, &mut delivered, &mut resolved, &mut last_resolved_tick)?;
                }
            }
            for tick in 0..ticks {
                let actions = pipeline.on_simulated(tick as Tick, true, raise(tick, &verified[tick]));
                record(actions, &mut delivered, &mut resolved, &mut last_resolved_tick)?;
                let actions = pipeline.on_verified(tick as Tick);
                record(actions, &mut delivered, &mut resolved, &mut last_resolved_tick)?;
            }

            prop_assert_eq!(pipeline.pending_count(), 0);
            prop_assert_eq!(&delivered, &resolved);
        }
    }
}
