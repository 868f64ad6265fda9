//! Game Host
//!
//! The host-facing side of a session: where callbacks and gameplay events
//! are subscribed, and where tick code can request a shutdown.

use tracing::trace;

use crate::session::cancel::{ShutdownCause, ShutdownHandle};
use crate::sim::dispatch::{Callback, CallbackDispatcher, EventDispatcher};
use crate::sim::events::{EventAction, EventTypeRegistry};
use crate::sim::frame::Frame;

/// Dispatchers and shutdown access for one session.
#[derive(Debug, Default)]
pub struct Game {
    callbacks: CallbackDispatcher,
    events: EventDispatcher,
    shutdown: ShutdownHandle,
}

impl Game {
    /// Fresh dispatchers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Host with an existing shutdown handle.
    pub fn with_shutdown(shutdown: ShutdownHandle) -> Self {
        Self {
            shutdown,
            ..Self::default()
        }
    }

    /// Lifecycle callbacks.
    pub fn callbacks(&mut self) -> &mut CallbackDispatcher {
        &mut self.callbacks
    }

    /// Gameplay events.
    pub fn events(&mut self) -> &mut EventDispatcher {
        &mut self.events
    }

    /// Handle for deferred shutdown requests.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Ask the runner to shut down after the current update.
    pub fn request_shutdown(&self, cause: ShutdownCause) {
        self.shutdown.request(cause);
    }

    /// Publish a lifecycle callback.
    pub fn publish(&mut self, callback: Callback, frame: Option<&Frame>) {
        self.callbacks.publish(&callback, frame);
    }

    /// Apply pipeline decisions: deliveries go to event subscribers,
    /// confirmations and cancellations to callbacks.
    pub fn apply_event_actions(&mut self, registry: &EventTypeRegistry, actions: Vec<EventAction>) {
        for action in actions {
            match action {
                EventAction::Deliver(raised) => {
                    trace!(tick = raised.key.tick, event_type = raised.key.event_type, "Event delivered");
                    self.events.publish(registry, raised.key.tick, raised.event.as_ref());
                }
                EventAction::Confirm(raised) => {
                    self.callbacks.publish(
                        &Callback::EventConfirmed {
                            key: raised.key,
                            event: raised.event,
                        },
                        None,
                    );
                }
                EventAction::Cancel(raised) => {
                    self.callbacks.publish(
                        &Callback::EventCanceled {
                            key: raised.key,
                            event: raised.event,
                        },
                        None,
                    );
                }
            }
        }
    }
}
