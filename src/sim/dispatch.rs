//! Dispatchers
//!
//! Two publish/subscribe channels out of the simulation:
//! - [`EventDispatcher`] for gameplay events, honoring the event type
//!   hierarchy (a base-type subscriber receives derived types).
//! - [`CallbackDispatcher`] for session lifecycle callbacks.
//!
//! Handler errors are logged and never interrupt the session.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::error;

use crate::sim::events::{DynEvent, Event, EventKey, EventTypeId, EventTypeRegistry};
use crate::sim::frame::{Frame, Tick};
use crate::sim::players::PlayerRef;

/// Handle returned by `subscribe`.
pub type SubscriptionId = u64;

type EventHandler = Box<dyn FnMut(Tick, &dyn DynEvent) -> anyhow::Result<()> + Send>;

struct EventSubscription {
    id: SubscriptionId,
    event_type: EventTypeId,
    handler: EventHandler,
}

/// Gameplay event subscriptions.
#[derive(Default)]
pub struct EventDispatcher {
    next_id: SubscriptionId,
    subscriptions: Vec<EventSubscription>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl EventDispatcher {
    /// No subscriptions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a type and everything derived from it.
    pub fn subscribe<F>(&mut self, event_type: EventTypeId, handler: F) -> SubscriptionId
    where
        F: FnMut(Tick, &dyn DynEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.next_id += 1;
        self.subscriptions.push(EventSubscription {
            id: self.next_id,
            event_type,
            handler: Box::new(handler),
        });
        self.next_id
    }

    /// Subscribe to exactly `E`, receiving it typed.
    pub fn subscribe_typed<E, F>(&mut self, mut handler: F) -> SubscriptionId
    where
        E: Event,
        F: FnMut(Tick, &E) -> anyhow::Result<()> + Send + 'static,
    {
        self.subscribe(E::ID, move |tick, event| match event.as_any().downcast_ref::<E>() {
            Some(typed) => handler(tick, typed),
            None => Ok(()),
        })
    }

    /// Remove a subscription. Returns false if unknown.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        self.subscriptions.len() != before
    }

    /// Deliver an event to every matching subscriber in subscription order.
    /// Returns the number of handlers called.
    pub fn publish(&mut self, registry: &EventTypeRegistry, tick: Tick, event: &dyn DynEvent) -> usize {
        let event_type = event.event_type();
        let mut delivered = 0;
        for sub in &mut self.subscriptions {
            if !registry.is_a(event_type, sub.event_type) {
                continue;
            }
            delivered += 1;
            if let Err(e) = (sub.handler)(tick, event) {
                error!(subscription = sub.id, event_type, tick, "Event handler failed: {:#}", e);
            }
        }
        delivered
    }
}

// =============================================================================
// CALLBACKS
// =============================================================================

/// Session lifecycle callbacks.
#[derive(Debug, Clone)]
pub enum Callback {
    /// Context and frames created, systems initialized.
    GameInit,
    /// First tick is about to run.
    GameStarted {
        /// Start tick.
        tick: Tick,
    },
    /// Verified frame replaced from server data.
    GameResynced {
        /// Restored tick.
        tick: Tick,
    },
    /// Session destroyed.
    GameDestroyed,
    /// A tick was simulated.
    SimulateFinished {
        /// Tick.
        tick: Tick,
        /// Whether the frame was verified.
        verified: bool,
    },
    /// Checksum of a verified tick.
    ChecksumComputed {
        /// Tick.
        tick: Tick,
        /// Checksum.
        checksum: u64,
    },
    /// A peer disagrees with the local checksum.
    ChecksumError {
        /// Tick.
        tick: Tick,
        /// Local checksum.
        local: u64,
        /// Remote checksum.
        remote: u64,
        /// Serialized local frame of that tick, if a snapshot was kept.
        dump: Option<Arc<Vec<u8>>>,
    },
    /// Input of a player became verified.
    InputConfirmed {
        /// Tick.
        tick: Tick,
        /// Player.
        player: PlayerRef,
    },
    /// Transport disconnected.
    PluginDisconnect {
        /// Reason given by the server.
        reason: String,
    },
    /// Pending unsynced event confirmed.
    EventConfirmed {
        /// Event identity.
        key: EventKey,
        /// Payload.
        event: Arc<dyn DynEvent>,
    },
    /// Pending unsynced event canceled.
    EventCanceled {
        /// Event identity.
        key: EventKey,
        /// Payload.
        event: Arc<dyn DynEvent>,
    },
}

/// [`Callback`] discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallbackKind {
    /// [`Callback::GameInit`].
    GameInit,
    /// [`Callback::GameStarted`].
    GameStarted,
    /// [`Callback::GameResynced`].
    GameResynced,
    /// [`Callback::GameDestroyed`].
    GameDestroyed,
    /// [`Callback::SimulateFinished`].
    SimulateFinished,
    /// [`Callback::ChecksumComputed`].
    ChecksumComputed,
    /// [`Callback::ChecksumError`].
    ChecksumError,
    /// [`Callback::InputConfirmed`].
    InputConfirmed,
    /// [`Callback::PluginDisconnect`].
    PluginDisconnect,
    /// [`Callback::EventConfirmed`].
    EventConfirmed,
    /// [`Callback::EventCanceled`].
    EventCanceled,
}

impl Callback {
    /// Discriminant.
    pub fn kind(&self) -> CallbackKind {
        match self {
            Callback::GameInit => CallbackKind::GameInit,
            Callback::GameStarted { .. } => CallbackKind::GameStarted,
            Callback::GameResynced { .. } => CallbackKind::GameResynced,
            Callback::GameDestroyed => CallbackKind::GameDestroyed,
            Callback::SimulateFinished { .. } => CallbackKind::SimulateFinished,
            Callback::ChecksumComputed { .. } => CallbackKind::ChecksumComputed,
            Callback::ChecksumError { .. } => CallbackKind::ChecksumError,
            Callback::InputConfirmed { .. } => CallbackKind::InputConfirmed,
            Callback::PluginDisconnect { .. } => CallbackKind::PluginDisconnect,
            Callback::EventConfirmed { .. } => CallbackKind::EventConfirmed,
            Callback::EventCanceled { .. } => CallbackKind::EventCanceled,
        }
    }
}

type CallbackHandler = Box<dyn FnMut(&Callback, Option<&Frame>) -> anyhow::Result<()> + Send>;

/// Lifecycle callback subscriptions.
#[derive(Default)]
pub struct CallbackDispatcher {
    next_id: SubscriptionId,
    handlers: BTreeMap<CallbackKind, Vec<(SubscriptionId, CallbackHandler)>>,
}

impl std::fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackDispatcher")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CallbackDispatcher {
    /// No subscriptions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one callback kind. The frame, when given, is the one the
    /// callback concerns.
    pub fn subscribe<F>(&mut self, kind: CallbackKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&Callback, Option<&Frame>) -> anyhow::Result<()> + Send + 'static,
    {
        self.next_id += 1;
        self.handlers
            .entry(kind)
            .or_default()
            .push((self.next_id, Box::new(handler)));
        self.next_id
    }

    /// Remove a subscription.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for list in self.handlers.values_mut() {
            let before = list.len();
            list.retain(|(sub, _)| *sub != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Call every handler of the callback's kind.
    pub fn publish(&mut self, callback: &Callback, frame: Option<&Frame>) {
        let Some(list) = self.handlers.get_mut(&callback.kind()) else {
            return;
        };
        for (id, handler) in list.iter_mut() {
            if let Err(e) = handler(callback, frame) {
                error!(subscription = *id, kind = ?callback.kind(), "Callback handler failed: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::ChecksumAccumulator;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct Damage(u32);

    impl Event for Damage {
        const ID: EventTypeId = 10;
        fn hash_content(&self, hasher: &mut ChecksumAccumulator) {
            hasher.update_u32(self.0);
        }
    }

    #[derive(Debug)]
    struct Critical(u32);

    impl Event for Critical {
        const ID: EventTypeId = 11;
        fn hash_content(&self, hasher: &mut ChecksumAccumulator) {
            hasher.update_u32(self.0);
        }
    }

    #[test]
    fn test_base_subscriber_receives_derived() {
        let mut registry = EventTypeRegistry::new();
        registry
            .register_event::<Damage>("Damage", None)
            .register_event::<Critical>("Critical", Some(Damage::ID));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        let log = seen.clone();
        dispatcher.subscribe(Damage::ID, move |tick, event| {
            log.lock().unwrap().push((tick, event.event_type()));
            Ok(())
        });
        let typed = seen.clone();
        dispatcher.subscribe_typed::<Critical, _>(move |tick, event| {
            typed.lock().unwrap().push((tick, event.0 as u16));
            Ok(())
        });

        assert_eq!(dispatcher.publish(&registry, 1, &Damage(5)), 1);
        assert_eq!(dispatcher.publish(&registry, 2, &Critical(7)), 2);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 10), (2, 11), (2, 7)]);
    }

    #[test]
    fn test_handler_error_does_not_stop_others() {
        let registry = EventTypeRegistry::new();
        let count = Arc::new(Mutex::new(0));
        let mut dispatcher = EventDispatcher::new();
        dispatcher.subscribe(Damage::ID, |_, _| anyhow::bail!("handler failed"));
        let c = count.clone();
        let id = dispatcher.subscribe(Damage::ID, move |_, _| {
            *c.lock().unwrap() += 1;
            Ok(())
        });

        dispatcher.publish(&registry, 0, &Damage(1));
        assert_eq!(*count.lock().unwrap(), 1);

        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        dispatcher.publish(&registry, 0, &Damage(1));
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_callback_dispatch_by_kind() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut callbacks = CallbackDispatcher::new();
        let log = seen.clone();
        callbacks.subscribe(CallbackKind::ChecksumComputed, move |cb, frame| {
            assert!(frame.is_none());
            if let Callback::ChecksumComputed { tick, checksum } = cb {
                log.lock().unwrap().push((*tick, *checksum));
            }
            Ok(())
        });

        callbacks.publish(&Callback::GameStarted { tick: 0 }, None);
        callbacks.publish(&Callback::ChecksumComputed { tick: 60, checksum: 9 }, None);
        assert_eq!(*seen.lock().unwrap(), vec![(60, 9)]);
        assert_eq!(Callback::GameInit.kind(), CallbackKind::GameInit);
    }
}
