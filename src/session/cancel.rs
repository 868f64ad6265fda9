//! Cancellation and Shutdown Requests
//!
//! - [`CancelSource`] / [`CancelToken`]: cooperative cancellation over a
//!   tokio `watch` channel. Tokens are cheap to clone and can be awaited.
//! - [`ShutdownHandle`]: lets code running inside a tick (callbacks, event
//!   handlers) ask for a shutdown that the runner performs once control
//!   returns to it.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShutdownCause {
    /// Requested by the host.
    Ok,
    /// Error while driving the session.
    SessionError,
    /// Transport disconnected.
    NetworkError,
    /// Start did not complete in time.
    OperationTimedOut,
    /// Start was canceled.
    OperationCanceled,
    /// Simulation stopped on its own (e.g. replay ended).
    SimulationStopped,
    /// Peers disagreed on a checksum.
    ChecksumError,
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownCause::Ok => "ok",
            ShutdownCause::SessionError => "session error",
            ShutdownCause::NetworkError => "network error",
            ShutdownCause::OperationTimedOut => "operation timed out",
            ShutdownCause::OperationCanceled => "operation canceled",
            ShutdownCause::SimulationStopped => "simulation stopped",
            ShutdownCause::ChecksumError => "checksum error",
        };
        f.write_str(name)
    }
}

/// Owner side of a cancellation signal.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSource {
    /// Not yet canceled.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A token observing this source.
    pub fn token(&self) -> CancelToken {
        CancelToken { rx: self.tx.subscribe() }
    }

    /// Signal every token. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// True once canceled.
    pub fn is_canceled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observer side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never canceled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// True once the source canceled.
    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the source cancels. Pends forever if the source is
    /// dropped without canceling.
    pub async fn canceled(&mut self) {
        if self.rx.wait_for(|canceled| *canceled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Deferred shutdown request shared between the runner and tick code.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    requested: Arc<Mutex<Option<ShutdownCause>>>,
}

impl ShutdownHandle {
    /// No request pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a shutdown. The first request wins.
    pub fn request(&self, cause: ShutdownCause) {
        let mut requested = self.requested.lock().unwrap_or_else(PoisonError::into_inner);
        if requested.is_none() {
            *requested = Some(cause);
        }
    }

    /// True if a request is pending.
    pub fn is_requested(&self) -> bool {
        self.requested.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Take the pending request.
    pub fn take(&self) -> Option<ShutdownCause> {
        self.requested.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}
