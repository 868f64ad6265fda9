//! Session Runner
//!
//! Lifecycle wrapper around a [`DeterministicSession`]:
//!
//! ```text
//!   NotStarted ──start──► Starting ──session running──► Running
//!                            │                            │
//!                            └──────────► ShuttingDown ◄──┘
//!                                             │
//!                                             ▼
//!                                          Shutdown
//! ```
//!
//! Errors, disconnects, checksum mismatches (when configured) and deferred
//! requests from tick code all end in [`SessionRunner::shutdown`], which
//! always tears down in the same order: destroy the session, notify the
//! host, close the transport. A request made through the
//! [`ShutdownHandle`] while [`SessionRunner::start_async`] is waiting ends
//! the start on its next step.

use std::fmt;
use std::time::Duration;

use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::session::cancel::{CancelToken, ShutdownCause, ShutdownHandle};
use crate::session::deterministic::{DeterministicSession, SessionError, SessionParams};
use crate::sim::config::InstantReplaySettings;

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Nothing built yet.
    NotStarted,
    /// Session built, waiting to be started and unpaused.
    Starting,
    /// Simulating.
    Running,
    /// Teardown in progress.
    ShuttingDown,
    /// Torn down.
    Shutdown,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Runner errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunnerError {
    /// The session failed.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    /// Operation not valid in the current state.
    #[error("Invalid runner state: {0}")]
    InvalidState(RunnerState),
    /// The runner shut down.
    #[error("Runner shut down: {0}")]
    Shutdown(ShutdownCause),
}

/// What to run.
pub struct RunnerArguments {
    /// Session to build.
    pub session: SessionParams,
    /// Treat a checksum mismatch as fatal.
    pub shutdown_on_checksum_error: bool,
    /// Record a full replay from the first tick.
    pub record_replay: bool,
    /// Keep instant replay snapshots.
    pub instant_replay: Option<InstantReplaySettings>,
}

impl RunnerArguments {
    /// Run `session` with default options.
    pub fn new(session: SessionParams) -> Self {
        Self {
            session,
            shutdown_on_checksum_error: false,
            record_replay: false,
            instant_replay: None,
        }
    }
}

type ShutdownCallback = Box<dyn FnMut(ShutdownCause) + Send>;

/// Drives one session from start to shutdown.
pub struct SessionRunner {
    id: Uuid,
    state: RunnerState,
    session: Option<DeterministicSession>,
    shutdown: ShutdownHandle,
    shutdown_cause: Option<ShutdownCause>,
    shutdown_on_checksum_error: bool,
    on_shutdown: Option<ShutdownCallback>,
}

impl fmt::Debug for SessionRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRunner")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("session", &self.session)
            .field("shutdown_cause", &self.shutdown_cause)
            .finish()
    }
}

impl Default for SessionRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRunner {
    /// Idle runner.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: RunnerState::NotStarted,
            session: None,
            shutdown: ShutdownHandle::new(),
            shutdown_cause: None,
            shutdown_on_checksum_error: false,
            on_shutdown: None,
        }
    }

    /// Unique id, attached to runner logs.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Why the runner shut down.
    pub fn shutdown_cause(&self) -> Option<ShutdownCause> {
        self.shutdown_cause
    }

    /// The session, until shutdown.
    pub fn session(&self) -> Option<&DeterministicSession> {
        self.session.as_ref()
    }

    /// Mutable session, until shutdown.
    pub fn session_mut(&mut self) -> Option<&mut DeterministicSession> {
        self.session.as_mut()
    }

    /// Handle for deferred shutdown requests. Valid after [`start`](Self::start);
    /// the session's own handle is adopted there, so clone it from the
    /// game beforehand to reach a pending [`start_async`](Self::start_async).
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Called once with the cause, after the session is destroyed and
    /// before the transport closes.
    pub fn set_on_shutdown<F>(&mut self, callback: F)
    where
        F: FnMut(ShutdownCause) + Send + 'static,
    {
        self.on_shutdown = Some(Box::new(callback));
    }

    /// Build the session. Returns in `Running` when the session could start
    /// right away, otherwise in `Starting`.
    pub fn start(&mut self, args: RunnerArguments) -> Result<(), RunnerError> {
        if self.state != RunnerState::NotStarted {
            return Err(RunnerError::InvalidState(self.state));
        }
        self.state = RunnerState::Starting;
        self.shutdown_on_checksum_error = args.shutdown_on_checksum_error;
        self.shutdown = args.session.game.shutdown_handle();
        info!(runner = %self.id, mode = %args.session.mode, "Runner starting");

        let mut session = match DeterministicSession::new(args.session) {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to create session: {}", e);
                self.shutdown(ShutdownCause::SessionError);
                return Err(e.into());
            }
        };
        let setup = (|| -> Result<(), SessionError> {
            if args.record_replay {
                session.start_recording_replay()?;
            }
            if let Some(settings) = args.instant_replay {
                session.start_recording_instant_replay_snapshots(settings)?;
            }
            Ok(())
        })();
        let running = session.is_running();
        self.session = Some(session);
        if let Err(e) = setup {
            error!("Failed to configure session: {}", e);
            self.shutdown(ShutdownCause::SessionError);
            return Err(e.into());
        }

        if running {
            self.state = RunnerState::Running;
            info!("Runner running");
        }
        Ok(())
    }

    /// [`start`](Self::start), then service until the session runs. Ends in
    /// `Shutdown` with `OperationCanceled` or `OperationTimedOut` when
    /// `cancel` fires or `timeout` passes first, or with the requested cause
    /// when the shutdown handle is used meanwhile.
    #[instrument(skip(self, args, cancel), fields(runner = %self.id))]
    pub async fn start_async(
        &mut self,
        args: RunnerArguments,
        timeout: Duration,
        mut cancel: CancelToken,
    ) -> Result<(), RunnerError> {
        let step = args.session.context.session.tick_duration();
        self.start(args)?;
        if self.state == RunnerState::Running {
            return Ok(());
        }

        let outcome = {
            let wait = async {
                loop {
                    match self.service(step) {
                        Ok(()) => {}
                        Err(RunnerError::Shutdown(cause)) => return Err(cause),
                        Err(_) => return Err(ShutdownCause::SessionError),
                    }
                    match self.state {
                        RunnerState::Running => return Ok(()),
                        RunnerState::Starting => {}
                        _ => return Err(self.shutdown_cause.unwrap_or(ShutdownCause::SessionError)),
                    }
                    tokio::time::sleep(step).await;
                }
            };
            tokio::select! {
                _ = cancel.canceled() => Err(ShutdownCause::OperationCanceled),
                result = tokio::time::timeout(timeout, wait) => match result {
                    Ok(result) => result,
                    Err(_) => Err(ShutdownCause::OperationTimedOut),
                },
            }
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(cause) => {
                warn!(%cause, "Start did not complete");
                self.shutdown(cause);
                Err(RunnerError::Shutdown(self.shutdown_cause.unwrap_or(cause)))
            }
        }
    }

    /// Advance the session by `dt` and act on whatever it reported.
    pub fn service(&mut self, dt: Duration) -> Result<(), RunnerError> {
        match self.state {
            RunnerState::Starting | RunnerState::Running => {}
            RunnerState::Shutdown => {
                return Err(RunnerError::Shutdown(
                    self.shutdown_cause.unwrap_or(ShutdownCause::Ok),
                ))
            }
            state => return Err(RunnerError::InvalidState(state)),
        }
        let Some(session) = self.session.as_mut() else {
            return Err(RunnerError::InvalidState(self.state));
        };

        if let Err(e) = session.service(dt) {
            error!("Session update failed: {}", e);
            self.shutdown(ShutdownCause::SessionError);
            return Err(e.into());
        }

        let checksum_error = session.take_checksum_error();
        let cause = if let Some(cause) = self.shutdown.take() {
            Some(cause)
        } else if session.disconnect_reason().is_some() {
            Some(ShutdownCause::NetworkError)
        } else if checksum_error.is_some() && self.shutdown_on_checksum_error {
            Some(ShutdownCause::ChecksumError)
        } else if session.is_simulation_finished() {
            Some(ShutdownCause::SimulationStopped)
        } else {
            None
        };
        let running = session.is_running();

        if let Some(cause) = cause {
            self.shutdown(cause);
        } else if self.state == RunnerState::Starting && running {
            self.state = RunnerState::Running;
            info!("Runner running");
        }
        Ok(())
    }

    /// Tear down. Only the first call has an effect.
    pub fn shutdown(&mut self, cause: ShutdownCause) {
        if matches!(self.state, RunnerState::ShuttingDown | RunnerState::Shutdown) {
            return;
        }
        info!(runner = %self.id, %cause, from = %self.state, "Runner shutting down");
        self.state = RunnerState::ShuttingDown;
        self.shutdown_cause = Some(cause);

        let communicator = self.session.take().and_then(DeterministicSession::destroy);
        if let Some(callback) = self.on_shutdown.as_mut() {
            callback(cause);
        }
        if let Some(mut communicator) = communicator {
            communicator.disconnect();
        }

        self.state = RunnerState::Shutdown;
        info!(runner = %self.id, %cause, "Runner shut down");
    }

    /// [`shutdown`](Self::shutdown), then yield so spawned transport tasks
    /// observe the closed channels.
    pub async fn shutdown_async(&mut self, cause: ShutdownCause) {
        self.shutdown(cause);
        tokio::task::yield_now().await;
    }
}
