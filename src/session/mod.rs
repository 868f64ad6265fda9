//! Session layer (non-deterministic).
//!
//! Wall-clock time, transports and lifecycle. Nothing here runs inside a
//! tick; it decides which ticks run and with what input.

pub mod cancel;
pub mod communicator;
pub mod deterministic;
pub mod game;
pub mod protocol;
pub mod runner;

pub use cancel::{CancelSource, CancelToken, ShutdownCause, ShutdownHandle};
pub use communicator::{ChannelCommunicator, Communicator, LocalRelay};
pub use deterministic::{DeterministicSession, GameMode, InputSource, SessionError, SessionParams};
pub use game::Game;
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use runner::{RunnerArguments, RunnerError, RunnerState, SessionRunner};
