//! Core deterministic primitives.
//!
//! Everything here is bit-exact across platforms: no floats inside a tick,
//! no hash-ordered containers, no wall-clock reads.

pub mod fixed;
pub mod rng;
pub mod hash;
pub mod heap;
pub mod stream;

// Re-export core types
pub use fixed::{Fixed, FIXED_ONE, FIXED_HALF, FIXED_SCALE};
pub use rng::DeterministicRng;
pub use hash::ChecksumAccumulator;
pub use heap::{FrameHeap, HeapConfig, HeapError, HeapPtr, HeapTrackingMode};
pub use stream::{BitStream, Serializable, StreamError, StreamMode};
