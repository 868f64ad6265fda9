//! # Lockstep Engine
//!
//! Deterministic simulation core for lockstep multiplayer with prediction,
//! rollback and checksum verification.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      LOCKSTEP ENGINE                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── fixed.rs    - Q16.16 fixed-point arithmetic             │
//! │  ├── rng.rs      - Deterministic Xorshift128+ PRNG           │
//! │  ├── hash.rs     - FNV-1a checksums, SHA-256 config digests  │
//! │  ├── heap.rs     - Paged frame heap with leak tracking       │
//! │  └── stream.rs   - Three-mode bit stream                     │
//! │                                                              │
//! │  sim/            - Simulation (deterministic)                │
//! │  ├── frame.rs    - Frame: entities, players, input, state    │
//! │  ├── context.rs  - Shared per-session context                │
//! │  ├── system.rs   - System hierarchy and signals              │
//! │  ├── scheduler.rs- Task graph over a worker pool             │
//! │  ├── tick.rs     - One tick of the simulation                │
//! │  ├── serializer.rs - Checksums and gzip frame data           │
//! │  ├── events.rs   - Event confirm/cancel pipeline             │
//! │  ├── snapshot.rs - Verified frame ring buffers               │
//! │  └── replay.rs   - Input history, replay files, playback     │
//! │                                                              │
//! │  session/        - Session (non-deterministic)               │
//! │  ├── deterministic.rs - Prediction and rollback driver       │
//! │  ├── runner.rs   - Async lifecycle state machine             │
//! │  ├── communicator.rs - Transport and in-process relay        │
//! │  └── protocol.rs - Message types                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! The `core/` and `sim/` modules are **deterministic**:
//! - No floating-point arithmetic in tick code
//! - No HashMap (uses BTreeMap for sorted iteration)
//! - No system time dependencies
//! - All randomness from the seeded Xorshift128+ in the frame globals
//! - Parallel task results are applied in task order
//!
//! Given identical inputs and runtime config, every peer produces frames
//! with identical checksums.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod session;
pub mod sim;

// Re-export commonly used types
pub use core::fixed::{Fixed, FIXED_HALF, FIXED_ONE, FIXED_SCALE};
pub use core::rng::DeterministicRng;
pub use session::{
    DeterministicSession, GameMode, RunnerArguments, RunnerState, SessionParams, SessionRunner, ShutdownCause,
};
pub use sim::config::MAX_PLAYERS;
pub use sim::{Frame, FrameContext, FrameContextParams, FrameSerializer, PlayerRef, System, Tick, TickInputs};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
