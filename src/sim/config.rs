//! Session Configuration
//!
//! Three layers, all serde structs with defaults:
//! - [`SimulationConfig`]: engine tuning, loaded as an asset.
//! - [`SessionConfig`]: tick rate, rollback window, checksum cadence.
//! - [`RuntimeConfig`]: per-match values (seed, map) that every peer must
//!   agree on. Its digest is exchanged when joining.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::fixed::{to_fixed, Fixed};
use crate::core::hash::{config_digest, Digest256};
use crate::core::heap::{HeapConfig, HeapTrackingMode, MAX_PAGE_SHIFT, MIN_PAGE_SHIFT};
use crate::core::stream::{BitStream, Serializable, StreamError};
use crate::sim::assets::AssetGuid;

/// Maximum players per session.
pub const MAX_PLAYERS: u32 = 64;

/// Configuration errors. Always fatal to session construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Player count outside `1..=MAX_PLAYERS`.
    #[error("Invalid player count {count} (allowed 1..={max})")]
    InvalidPlayerCount {
        /// Requested count.
        count: u32,
        /// Upper bound.
        max: u32,
    },
    /// Update rate of zero.
    #[error("Update rate must be at least 1 Hz")]
    InvalidUpdateRate,
    /// Rollback window of zero or less.
    #[error("Rollback window must be at least 1 tick")]
    InvalidRollbackWindow,
    /// Negative checksum interval or input delay.
    #[error("Invalid session timing: {0}")]
    InvalidTiming(String),
    /// Heap geometry rejected.
    #[error("Invalid heap configuration: {0}")]
    InvalidHeap(String),
    /// Runtime config names a simulation config that is not loaded.
    #[error("Simulation config asset {0} not found")]
    MissingSimulationConfig(AssetGuid),
    /// An asset could not be decoded into the expected config type.
    #[error("Config asset {guid} is invalid: {reason}")]
    InvalidAsset {
        /// Offending asset.
        guid: AssetGuid,
        /// Decoder message.
        reason: String,
    },
    /// Systems config references an unregistered system.
    #[error("Unknown system type '{0}'")]
    UnknownSystem(String),
    /// Systems config requested but no factory supplied.
    #[error("Systems config {0} requires a system factory")]
    MissingSystemFactory(AssetGuid),
    /// Worker pool could not be built.
    #[error("Failed to build worker pool: {0}")]
    ThreadPool(String),
    /// Config could not be encoded for hashing.
    #[error("Failed to encode config: {0}")]
    Encode(String),
}

// =============================================================================
// SIMULATION CONFIG
// =============================================================================

/// Entity registry sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitiesConfig {
    /// Slots reserved up front.
    pub initial_capacity: u32,
    /// Hard cap on live plus free slots.
    pub max_entities: u32,
}

impl Default for EntitiesConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 256,
            max_entities: 4096,
        }
    }
}

/// Physics parameters stored in the frame globals.
///
/// The solver itself is an external collaborator; the core only carries the
/// settings so they are rolled back and checksummed with everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsSettings {
    /// Gravity X (Q16.16).
    pub gravity_x: Fixed,
    /// Gravity Y (Q16.16).
    pub gravity_y: Fixed,
    /// Solver iterations per tick.
    pub solver_iterations: u32,
}

impl Default for PhysicsSettings {
    fn default() -> Self {
        Self {
            gravity_x: 0,
            gravity_y: to_fixed(-9.81),
            solver_iterations: 4,
        }
    }
}

impl Serializable for PhysicsSettings {
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        stream.serialize_i32(&mut self.gravity_x)?;
        stream.serialize_i32(&mut self.gravity_y)?;
        stream.serialize_u32(&mut self.solver_iterations)
    }
}

/// Engine tuning, loaded from the asset named by [`RuntimeConfig::simulation_config`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Entity registry sizing.
    pub entities: EntitiesConfig,
    /// Physics settings copied into the globals at start.
    pub physics: PhysicsSettings,
    /// Worker threads for array and threaded tasks (clamped to at least 1).
    pub thread_count: usize,
    /// Seconds of verified frames kept for checksum-error diagnostics.
    pub checksum_snapshot_history_length_seconds: u32,
    /// Heap instrumentation.
    pub heap_tracking_mode: HeapTrackingMode,
    /// log2 of the heap page size.
    pub heap_page_shift: u32,
    /// Heap page count.
    pub heap_page_count: usize,
    /// Extra heap pages.
    pub heap_extra_count: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            entities: EntitiesConfig::default(),
            physics: PhysicsSettings::default(),
            thread_count: 2,
            checksum_snapshot_history_length_seconds: 3,
            heap_tracking_mode: HeapTrackingMode::DetectLeaks,
            heap_page_shift: 15,
            heap_page_count: 256,
            heap_extra_count: 0,
        }
    }
}

impl SimulationConfig {
    /// Worker thread count, never zero.
    #[inline]
    pub fn worker_threads(&self) -> usize {
        self.thread_count.max(1)
    }

    /// Heap geometry for every frame of the session.
    pub fn heap_config(&self) -> HeapConfig {
        HeapConfig {
            page_shift: self.heap_page_shift,
            page_count: self.heap_page_count,
            extra_count: self.heap_extra_count,
            tracking: self.heap_tracking_mode,
        }
    }

    /// Validate heap geometry and entity limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_PAGE_SHIFT..=MAX_PAGE_SHIFT).contains(&self.heap_page_shift) {
            return Err(ConfigError::InvalidHeap(format!(
                "page shift {} outside {}..={}",
                self.heap_page_shift, MIN_PAGE_SHIFT, MAX_PAGE_SHIFT
            )));
        }
        if self.heap_page_count == 0 {
            return Err(ConfigError::InvalidHeap("page count must be at least 1".into()));
        }
        self.heap_config()
            .validate()
            .map_err(|e| ConfigError::InvalidHeap(e.to_string()))?;
        if self.entities.max_entities == 0 {
            return Err(ConfigError::InvalidHeap("max_entities must be at least 1".into()));
        }
        Ok(())
    }
}

// =============================================================================
// SESSION CONFIG
// =============================================================================

/// Deterministic session parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Player slots in the session.
    pub player_count: u32,
    /// Simulation rate (Hz).
    pub update_fps: u32,
    /// Maximum ticks predicted past the verified frame.
    pub rollback_window: i32,
    /// Verified ticks between checksums (0 disables).
    pub checksum_interval: i32,
    /// Ticks between polling local input and the tick it applies to.
    pub input_delay: i32,
    /// Never predict; only simulate confirmed input.
    pub lockstep: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            player_count: 1,
            update_fps: 60,
            rollback_window: 60,
            checksum_interval: 60,
            input_delay: 0,
            lockstep: false,
        }
    }
}

impl SessionConfig {
    /// Validate ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.player_count == 0 || self.player_count > MAX_PLAYERS {
            return Err(ConfigError::InvalidPlayerCount {
                count: self.player_count,
                max: MAX_PLAYERS,
            });
        }
        if self.update_fps == 0 {
            return Err(ConfigError::InvalidUpdateRate);
        }
        if self.rollback_window <= 0 {
            return Err(ConfigError::InvalidRollbackWindow);
        }
        if self.checksum_interval < 0 {
            return Err(ConfigError::InvalidTiming("negative checksum interval".into()));
        }
        if self.input_delay < 0 {
            return Err(ConfigError::InvalidTiming("negative input delay".into()));
        }
        Ok(())
    }

    /// Wall-clock duration of one tick.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.update_fps.max(1) as u64)
    }

    /// Convert seconds to ticks at the update rate.
    pub fn seconds_to_ticks(&self, seconds: u32) -> i32 {
        (seconds as u64 * self.update_fps as u64).min(i32::MAX as u64) as i32
    }
}

// =============================================================================
// RUNTIME CONFIG
// =============================================================================

/// Per-match configuration every peer must agree on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// RNG seed for the globals.
    pub seed: u64,
    /// Initial map asset.
    pub map: AssetGuid,
    /// Simulation config asset.
    pub simulation_config: AssetGuid,
    /// Optional systems config asset; when absent the host supplies systems directly.
    pub systems_config: Option<AssetGuid>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            map: AssetGuid::INVALID,
            simulation_config: AssetGuid(1),
            systems_config: None,
        }
    }
}

impl RuntimeConfig {
    /// Encode for the wire and replay files.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        bincode::serialize(self).map_err(|e| ConfigError::Encode(e.to_string()))
    }

    /// Domain-separated SHA-256 over the encoded config.
    pub fn digest(&self) -> Result<Digest256, ConfigError> {
        Ok(config_digest(&self.to_bytes()?))
    }
}

/// Instant replay recording parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstantReplaySettings {
    /// Ticks between replay snapshots.
    pub snapshot_interval: i32,
    /// Seconds of history to keep.
    pub length_seconds: u32,
}

impl Default for InstantReplaySettings {
    fn default() -> Self {
        Self {
            snapshot_interval: 60,
            length_seconds: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulation_defaults() {
        let config = SimulationConfig::default();
        assert_eq!(config.entities.initial_capacity, 256);
        assert_eq!(config.entities.max_entities, 4096);
        assert_eq!(config.thread_count, 2);
        assert_eq!(config.checksum_snapshot_history_length_seconds, 3);
        assert_eq!(config.heap_tracking_mode, HeapTrackingMode::DetectLeaks);
        assert_eq!(config.heap_config().page_size(), 32 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_thread_count_clamped() {
        let config = SimulationConfig {
            thread_count: 0,
            ..Default::default()
        };
        assert_eq!(config.worker_threads(), 1);
    }

    #[test]
    fn test_heap_validation() {
        let mut config = SimulationConfig {
            heap_page_shift: 9,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidHeap(_))));
        config.heap_page_shift = 25;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidHeap(_))));
        config.heap_page_shift = 12;
        config.heap_page_count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidHeap(_))));
    }

    #[test]
    fn test_session_validation() {
        assert!(SessionConfig::default().validate().is_ok());

        let zero_players = SessionConfig { player_count: 0, ..Default::default() };
        assert_eq!(
            zero_players.validate(),
            Err(ConfigError::InvalidPlayerCount { count: 0, max: MAX_PLAYERS })
        );

        let too_many = SessionConfig { player_count: 65, ..Default::default() };
        assert!(matches!(too_many.validate(), Err(ConfigError::InvalidPlayerCount { .. })));

        let no_fps = SessionConfig { update_fps: 0, ..Default::default() };
        assert_eq!(no_fps.validate(), Err(ConfigError::InvalidUpdateRate));

        let no_window = SessionConfig { rollback_window: 0, ..Default::default() };
        assert_eq!(no_window.validate(), Err(ConfigError::InvalidRollbackWindow));
    }

    #[test]
    fn test_tick_duration() {
        let config = SessionConfig { update_fps: 50, ..Default::default() };
        assert_eq!(config.tick_duration(), Duration::from_millis(20));
        assert_eq!(config.seconds_to_ticks(3), 150);
    }

    #[test]
    fn test_runtime_digest() {
        let a = RuntimeConfig { seed: 1, ..Default::default() };
        let b = RuntimeConfig { seed: 2, ..Default::default() };
        assert_eq!(a.digest().unwrap(), a.clone().digest().unwrap());
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"player_count": 4}"#).unwrap();
        assert_eq!(config.player_count, 4);
        assert_eq!(config.update_fps, 60);
        assert_eq!(config.rollback_window, 60);
    }
}
