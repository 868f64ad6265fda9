//! Replays
//!
//! - [`InputHistory`]: verified input per tick, the source of every replay.
//! - [`ReplayFile`]: everything needed to rerun a match offline.
//! - [`InstantReplay`]: short in-session playback seeded from snapshots.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::sim::checksum::ChecksumFile;
use crate::sim::config::{RuntimeConfig, SessionConfig};
use crate::sim::context::FrameContext;
use crate::sim::frame::{Frame, FrameError, Tick};
use crate::sim::input::TickInputs;
use crate::sim::players::PlayerRef;
use crate::sim::serializer::FrameSerializer;
use crate::sim::snapshot::Snapshot;
use crate::sim::tick::simulate;

/// Replay and record file errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    /// bincode encode failure.
    #[error("Failed to encode replay data: {0}")]
    Encode(String),
    /// bincode decode failure.
    #[error("Failed to decode replay data: {0}")]
    Decode(String),
    /// JSON failure.
    #[error("Replay JSON error: {0}")]
    Json(String),
    /// Input recorded out of order.
    #[error("Expected input for tick {expected}, got {got}")]
    NonConsecutive {
        /// Next tick the history accepts.
        expected: Tick,
        /// Tick offered.
        got: Tick,
    },
    /// No recorded input for a tick the replay must simulate.
    #[error("No input recorded for tick {0}")]
    MissingInput(Tick),
    /// No snapshot at or before a tick.
    #[error("No snapshot at or before tick {0}")]
    NoSnapshot(Tick),
    /// Replay range is empty or reversed.
    #[error("Invalid replay range {start}..={end}")]
    InvalidRange {
        /// First tick.
        start: Tick,
        /// Last tick.
        end: Tick,
    },
    /// Frame restore or simulation failure.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Input source for replays.
pub trait ReplayInputProvider {
    /// True if input for `tick` is available.
    fn can_simulate(&self, tick: Tick) -> bool;

    /// Full input of `tick`.
    fn tick_inputs(&self, tick: Tick) -> Option<&TickInputs>;

    /// One player's input bytes at `tick`.
    fn input(&self, tick: Tick, player: PlayerRef) -> Option<&[u8]> {
        self.tick_inputs(tick)?.inputs.get(&player).map(Vec::as_slice)
    }
}

// =============================================================================
// INPUT HISTORY
// =============================================================================

/// Consecutive verified inputs, optionally bounded.
#[derive(Debug, Clone, Default)]
pub struct InputHistory {
    capacity: Option<usize>,
    ticks: VecDeque<TickInputs>,
}

impl InputHistory {
    /// Keep every tick.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Keep the newest `capacity` ticks.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            ticks: VecDeque::new(),
        }
    }

    /// First kept tick.
    pub fn first_tick(&self) -> Option<Tick> {
        self.ticks.front().map(|t| t.tick)
    }

    /// Last kept tick.
    pub fn last_tick(&self) -> Option<Tick> {
        self.ticks.back().map(|t| t.tick)
    }

    /// Kept tick count.
    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    /// True if nothing is kept.
    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// Append the next tick's input.
    pub fn record(&mut self, inputs: TickInputs) -> Result<(), ReplayError> {
        if let Some(last) = self.last_tick() {
            if inputs.tick != last + 1 {
                return Err(ReplayError::NonConsecutive {
                    expected: last + 1,
                    got: inputs.tick,
                });
            }
        }
        if self.capacity.is_some_and(|cap| self.ticks.len() == cap) {
            self.ticks.pop_front();
        }
        self.ticks.push_back(inputs);
        Ok(())
    }

    /// Copy of the ticks in `from..=to` that are kept.
    pub fn range(&self, from: Tick, to: Tick) -> InputHistory {
        InputHistory {
            capacity: None,
            ticks: self
                .ticks
                .iter()
                .filter(|t| t.tick >= from && t.tick <= to)
                .cloned()
                .collect(),
        }
    }

    /// Iterate oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &TickInputs> {
        self.ticks.iter()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.ticks.clear();
    }
}

impl ReplayInputProvider for InputHistory {
    fn can_simulate(&self, tick: Tick) -> bool {
        self.tick_inputs(tick).is_some()
    }

    fn tick_inputs(&self, tick: Tick) -> Option<&TickInputs> {
        let first = self.first_tick()?;
        let index = usize::try_from(tick.checked_sub(first)?).ok()?;
        self.ticks.get(index)
    }
}

// =============================================================================
// REPLAY FILE
// =============================================================================

/// A recorded match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayFile {
    /// Session parameters.
    pub session: SessionConfig,
    /// Match parameters.
    pub runtime: RuntimeConfig,
    /// Tick of the first recorded input.
    pub initial_tick: Tick,
    /// Serialized frame at `initial_tick - 1` when the recording started mid-match.
    pub initial_frame: Option<Vec<u8>>,
    /// Verified input, consecutive from `initial_tick`.
    pub inputs: Vec<TickInputs>,
    /// Checksums to verify against while replaying.
    pub checksums: Option<ChecksumFile>,
}

impl ReplayFile {
    /// Build from a recorded history.
    pub fn from_history(
        session: SessionConfig,
        runtime: RuntimeConfig,
        initial_frame: Option<Vec<u8>>,
        history: &InputHistory,
        checksums: Option<ChecksumFile>,
    ) -> Self {
        Self {
            session,
            runtime,
            initial_tick: history.first_tick().unwrap_or(0),
            initial_frame,
            inputs: history.iter().cloned().collect(),
            checksums,
        }
    }

    /// Recorded inputs as a provider.
    pub fn input_history(&self) -> Result<InputHistory, ReplayError> {
        let mut history = InputHistory::unbounded();
        for inputs in &self.inputs {
            history.record(inputs.clone())?;
        }
        Ok(history)
    }

    /// bincode encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ReplayError> {
        bincode::serialize(self).map_err(|e| ReplayError::Encode(e.to_string()))
    }

    /// Decode from [`to_bytes`](Self::to_bytes) output.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ReplayError> {
        bincode::deserialize(bytes).map_err(|e| ReplayError::Decode(e.to_string()))
    }

    /// Human-readable export.
    pub fn to_json(&self) -> Result<String, ReplayError> {
        serde_json::to_string_pretty(self).map_err(|e| ReplayError::Json(e.to_string()))
    }

    /// Parse [`to_json`](Self::to_json) output.
    pub fn from_json(json: &str) -> Result<Self, ReplayError> {
        serde_json::from_str(json).map_err(|e| ReplayError::Json(e.to_string()))
    }
}

// =============================================================================
// INSTANT REPLAY
// =============================================================================

/// Playback of a recent tick range on a private frame.
pub struct InstantReplay {
    frame: Frame,
    serializer: FrameSerializer,
    snapshots: Vec<Snapshot>,
    inputs: InputHistory,
    start: Tick,
    end: Tick,
    looping: bool,
    tick_duration: Duration,
    accumulator: Duration,
    finished: bool,
}

impl std::fmt::Debug for InstantReplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantReplay")
            .field("tick", &self.frame.number())
            .field("start", &self.start)
            .field("end", &self.end)
            .field("looping", &self.looping)
            .field("finished", &self.finished)
            .finish()
    }
}

impl InstantReplay {
    /// Prepare playback of `start..=end` and seek to `start`.
    ///
    /// `snapshots` must be in tick order; `inputs` must cover every tick
    /// between the seeding snapshot and `end`.
    pub fn new(
        context: &Arc<FrameContext>,
        snapshots: Vec<Snapshot>,
        inputs: InputHistory,
        start: Tick,
        end: Tick,
        looping: bool,
    ) -> Result<Self, ReplayError> {
        if start > end {
            return Err(ReplayError::InvalidRange { start, end });
        }
        let mut replay = Self {
            frame: context.create_frame()?,
            serializer: FrameSerializer::new(),
            snapshots,
            inputs,
            start,
            end,
            looping,
            tick_duration: context.session().tick_duration(),
            accumulator: Duration::ZERO,
            finished: false,
        };
        replay.seek_frame(start)?;
        info!(start, end, looping, "Instant replay started");
        Ok(replay)
    }

    /// Replay frame at the current playback tick.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Current playback tick.
    pub fn tick(&self) -> Tick {
        self.frame.number()
    }

    /// First tick.
    pub fn start(&self) -> Tick {
        self.start
    }

    /// Last tick.
    pub fn end(&self) -> Tick {
        self.end
    }

    /// True once a non-looping replay reached its end.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Restart from the beginning after the end instead of stopping.
    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    /// Position in `0.0..=1.0`.
    pub fn normalized_time(&self) -> f32 {
        let span = self.end - self.start;
        if span <= 0 {
            return 1.0;
        }
        (self.tick() - self.start) as f32 / span as f32
    }

    /// Jump to the tick at normalized position `t`.
    pub fn seek_normalized_time(&mut self, t: f32) -> Result<(), ReplayError> {
        let span = (self.end - self.start) as f32;
        let tick = self.start + (t.clamp(0.0, 1.0) * span).round() as Tick;
        self.seek_frame(tick)
    }

    /// Jump to `tick` (clamped to the range): restore the closest earlier
    /// snapshot, then simulate forward with recorded input.
    pub fn seek_frame(&mut self, tick: Tick) -> Result<(), ReplayError> {
        self.seek(tick)?;
        self.accumulator = Duration::ZERO;
        Ok(())
    }

    fn seek(&mut self, tick: Tick) -> Result<(), ReplayError> {
        let tick = tick.clamp(self.start, self.end);
        let snapshot = self
            .snapshots
            .iter()
            .rev()
            .find(|s| s.tick <= tick)
            .ok_or(ReplayError::NoSnapshot(tick))?;

        let current = self.frame.number();
        let can_continue = current >= snapshot.tick && current <= tick;
        if !can_continue {
            let data = Arc::clone(&snapshot.data);
            self.serializer.deserialize(&mut self.frame, &data)?;
            self.frame.set_verified(true);
            debug!(snapshot = snapshot.tick, target = tick, "Replay seeded from snapshot");
        }
        self.simulate_to(tick)?;
        self.finished = false;
        Ok(())
    }

    fn simulate_to(&mut self, tick: Tick) -> Result<(), ReplayError> {
        while self.frame.number() < tick {
            let next = self.frame.number() + 1;
            let inputs = self.inputs.tick_inputs(next).ok_or(ReplayError::MissingInput(next))?;
            simulate(&mut self.frame, inputs)?;
        }
        Ok(())
    }

    /// Advance playback by wall-clock `dt`. Returns false once finished.
    pub fn update(&mut self, dt: Duration) -> Result<bool, ReplayError> {
        if self.finished {
            return Ok(false);
        }
        self.accumulator += dt;
        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            if self.tick() >= self.end {
                if self.looping {
                    self.seek(self.start)?;
                    continue;
                }
                self.finished = true;
                info!(end = self.end, "Instant replay finished");
                break;
            }
            let next = self.tick() + 1;
            self.simulate_to(next)?;
        }
        Ok(!self.finished)
    }
}
