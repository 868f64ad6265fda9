//! Snapshot Ring Buffers
//!
//! Bounded histories of serialized verified frames. Two consumers want them:
//! checksum-error diagnostics (dump the exact tick a peer disagreed on) and
//! instant replay (seed playback from the closest earlier snapshot).
//!
//! Sizing is derived, never given directly: a consumer asks for a window
//! and a sampling interval, and [`plan_buffers`] decides whether one buffer
//! can serve both.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::sim::frame::{Frame, FrameError, Tick};
use crate::sim::serializer::FrameSerializer;

/// Snapshot errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    /// Ticks must strictly increase.
    #[error("Snapshot for tick {tick} is not after the newest tick {newest}")]
    NonMonotonic {
        /// Newest stored tick.
        newest: Tick,
        /// Rejected tick.
        tick: Tick,
    },
    /// Interval or window of zero or less.
    #[error("Invalid snapshot request: interval {interval}, window {window}")]
    InvalidRequest {
        /// Requested interval.
        interval: i32,
        /// Requested window.
        window: i32,
    },
    /// Frame could not be serialized.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

/// One stored frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Frame tick.
    pub tick: Tick,
    /// Frame checksum.
    pub checksum: u64,
    /// Full-frame encoding (see [`FrameSerializer::serialize`]).
    pub data: Arc<Vec<u8>>,
}

/// How a lookup matches ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotLookup {
    /// Only the exact tick.
    Exact,
    /// Newest snapshot at or before the tick.
    ClosestAtOrBefore,
    /// Smallest distance either way; earlier wins ties.
    Closest,
}

/// Required snapshots = `ceil(window / interval) + 1`.
pub fn capacity_for(window: i32, interval: i32) -> usize {
    if interval <= 0 {
        return 1;
    }
    let window = window.max(0) as i64;
    let interval = interval as i64;
    ((window + interval - 1) / interval + 1) as usize
}

/// A consumer's request: sample every `interval` ticks, cover `window` ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRequest {
    /// Ticks between samples.
    pub interval: i32,
    /// Ticks of history.
    pub window: i32,
}

impl SnapshotRequest {
    /// Validate and build.
    pub fn new(interval: i32, window: i32) -> Result<Self, SnapshotError> {
        if interval <= 0 || window <= 0 {
            return Err(SnapshotError::InvalidRequest { interval, window });
        }
        Ok(Self { interval, window })
    }

    /// Buffer capacity this request needs on its own.
    pub fn capacity(&self) -> usize {
        capacity_for(self.window, self.interval)
    }
}

/// Geometry of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGeometry {
    /// Sampling interval.
    pub interval: i32,
    /// Capacity.
    pub capacity: usize,
}

impl From<SnapshotRequest> for BufferGeometry {
    fn from(request: SnapshotRequest) -> Self {
        Self {
            interval: request.interval,
            capacity: request.capacity(),
        }
    }
}

/// Result of [`plan_buffers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPlan {
    /// Nobody wants snapshots.
    None,
    /// One buffer serves every consumer.
    Shared(BufferGeometry),
    /// Independent buffers per consumer.
    Separate {
        /// Checksum history buffer.
        checksum: Option<BufferGeometry>,
        /// Replay buffer.
        replay: Option<BufferGeometry>,
    },
}

/// Decide buffer layout for the two consumers.
///
/// When one interval divides the other, every sample of the coarser one is
/// also a sample of the finer, so one buffer at the finer interval covering
/// the longer window serves both.
pub fn plan_buffers(checksum: Option<SnapshotRequest>, replay: Option<SnapshotRequest>) -> BufferPlan {
    match (checksum, replay) {
        (None, None) => BufferPlan::None,
        (Some(c), Some(r)) => {
            let (fine, coarse) = if c.interval <= r.interval {
                (c.interval, r.interval)
            } else {
                (r.interval, c.interval)
            };
            if coarse % fine == 0 {
                let window = c.window.max(r.window);
                BufferPlan::Shared(BufferGeometry {
                    interval: fine,
                    capacity: capacity_for(window, fine),
                })
            } else {
                BufferPlan::Separate {
                    checksum: Some(c.into()),
                    replay: Some(r.into()),
                }
            }
        }
        (c, r) => BufferPlan::Separate {
            checksum: c.map(Into::into),
            replay: r.map(Into::into),
        },
    }
}

// =============================================================================
// BUFFER
// =============================================================================

/// Ring of snapshots with strictly increasing ticks.
#[derive(Debug, Clone)]
pub struct SnapshotBuffer {
    interval: i32,
    capacity: usize,
    entries: VecDeque<Snapshot>,
}

impl SnapshotBuffer {
    /// Empty buffer.
    pub fn new(geometry: BufferGeometry) -> Self {
        let capacity = geometry.capacity.max(1);
        Self {
            interval: geometry.interval.max(1),
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Sampling interval.
    pub fn interval(&self) -> i32 {
        self.interval
    }

    /// Capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stored snapshots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if `tick` falls on the sampling grid.
    pub fn is_sample_tick(&self, tick: Tick) -> bool {
        tick.rem_euclid(self.interval) == 0
    }

    /// Oldest stored tick.
    pub fn oldest(&self) -> Option<Tick> {
        self.entries.front().map(|s| s.tick)
    }

    /// Newest stored tick.
    pub fn newest(&self) -> Option<Tick> {
        self.entries.back().map(|s| s.tick)
    }

    /// Append, evicting the oldest entry when full.
    pub fn push(&mut self, snapshot: Snapshot) -> Result<(), SnapshotError> {
        if let Some(newest) = self.newest() {
            if snapshot.tick <= newest {
                return Err(SnapshotError::NonMonotonic {
                    newest,
                    tick: snapshot.tick,
                });
            }
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(snapshot);
        Ok(())
    }

    /// Look up a snapshot.
    pub fn find(&self, tick: Tick, lookup: SnapshotLookup) -> Option<&Snapshot> {
        let pos = self.entries.partition_point(|s| s.tick < tick);
        match lookup {
            SnapshotLookup::Exact => self.entries.get(pos).filter(|s| s.tick == tick),
            SnapshotLookup::ClosestAtOrBefore => match self.entries.get(pos) {
                Some(s) if s.tick == tick => Some(s),
                _ => pos.checked_sub(1).and_then(|i| self.entries.get(i)),
            },
            SnapshotLookup::Closest => {
                let after = self.entries.get(pos);
                let before = pos.checked_sub(1).and_then(|i| self.entries.get(i));
                match (before, after) {
                    (Some(b), Some(a)) => {
                        if (a.tick as i64 - tick as i64) < (tick as i64 - b.tick as i64) {
                            Some(a)
                        } else {
                            Some(b)
                        }
                    }
                    (b, a) => b.or(a),
                }
            }
        }
    }

    /// Iterate oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.entries.iter()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// =============================================================================
// SNAPSHOT SET
// =============================================================================

enum Buffers {
    None,
    Shared(SnapshotBuffer),
    Separate {
        checksum: Option<SnapshotBuffer>,
        replay: Option<SnapshotBuffer>,
    },
}

/// The session's snapshot buffers.
pub struct SnapshotSet {
    checksum_request: Option<SnapshotRequest>,
    replay_request: Option<SnapshotRequest>,
    buffers: Buffers,
    replay_started: bool,
}

impl std::fmt::Debug for SnapshotSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotSet")
            .field("checksum", &self.checksum_request)
            .field("replay", &self.replay_request)
            .field("plan", &self.plan())
            .finish()
    }
}

impl Default for SnapshotSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotSet {
    /// No buffers.
    pub fn new() -> Self {
        Self {
            checksum_request: None,
            replay_request: None,
            buffers: Buffers::None,
            replay_started: false,
        }
    }

    /// Current layout.
    pub fn plan(&self) -> BufferPlan {
        plan_buffers(self.checksum_request, self.replay_request)
    }

    /// Keep verified frames for checksum-error dumps. Rebuilds the buffers.
    pub fn set_checksum_request(&mut self, request: Option<SnapshotRequest>) {
        self.checksum_request = request;
        self.rebuild();
    }

    /// Keep verified frames for instant replay. Rebuilds the buffers.
    pub fn set_replay_request(&mut self, request: Option<SnapshotRequest>) {
        self.replay_request = request;
        self.replay_started = false;
        self.rebuild();
    }

    /// True if instant replay snapshots are being recorded.
    pub fn is_recording_replay(&self) -> bool {
        self.replay_request.is_some()
    }

    fn rebuild(&mut self) {
        let plan = self.plan();
        debug!(?plan, "Snapshot buffers rebuilt");
        self.buffers = match plan {
            BufferPlan::None => Buffers::None,
            BufferPlan::Shared(geometry) => Buffers::Shared(SnapshotBuffer::new(geometry)),
            BufferPlan::Separate { checksum, replay } => Buffers::Separate {
                checksum: checksum.map(SnapshotBuffer::new),
                replay: replay.map(SnapshotBuffer::new),
            },
        };
    }

    fn checksum_buffer(&self) -> Option<&SnapshotBuffer> {
        match &self.buffers {
            Buffers::Shared(b) if self.checksum_request.is_some() => Some(b),
            Buffers::Separate { checksum, .. } => checksum.as_ref(),
            _ => None,
        }
    }

    fn replay_buffer(&self) -> Option<&SnapshotBuffer> {
        match &self.buffers {
            Buffers::Shared(b) if self.replay_request.is_some() => Some(b),
            Buffers::Separate { replay, .. } => replay.as_ref(),
            _ => None,
        }
    }

    /// Offer a frame. Only verified frames on a buffer's sampling grid are
    /// stored; the first replay sample is taken regardless of the grid.
    /// Returns true if anything was stored.
    pub fn record(&mut self, frame: &mut Frame, serializer: &mut FrameSerializer) -> Result<bool, SnapshotError> {
        if !frame.is_verified() {
            return Ok(false);
        }
        let tick = frame.number();
        let first_replay = self.replay_request.is_some() && !self.replay_started;

        let (want_shared, want_checksum, want_replay) = match &self.buffers {
            Buffers::None => return Ok(false),
            Buffers::Shared(b) => (b.is_sample_tick(tick) || first_replay, false, false),
            Buffers::Separate { checksum, replay } => (
                false,
                checksum.as_ref().is_some_and(|b| b.is_sample_tick(tick)),
                replay.as_ref().is_some_and(|b| b.is_sample_tick(tick) || first_replay),
            ),
        };
        if !(want_shared || want_checksum || want_replay) {
            return Ok(false);
        }

        let checksum = serializer.checksum(frame)?;
        let snapshot = Snapshot {
            tick,
            checksum,
            data: Arc::new(serializer.serialize(frame)?),
        };

        match &mut self.buffers {
            Buffers::Shared(b) => b.push(snapshot)?,
            Buffers::Separate { checksum, replay } => {
                if want_checksum {
                    if let Some(b) = checksum {
                        b.push(snapshot.clone())?;
                    }
                }
                if want_replay {
                    if let Some(b) = replay {
                        b.push(snapshot)?;
                    }
                }
            }
            Buffers::None => {}
        }
        if want_replay || (want_shared && self.replay_request.is_some()) {
            self.replay_started = true;
        }
        Ok(true)
    }

    /// Snapshot of exactly `tick` for checksum diagnostics.
    pub fn checksum_snapshot(&self, tick: Tick) -> Option<&Snapshot> {
        self.checksum_buffer()?.find(tick, SnapshotLookup::Exact)
    }

    /// Replay snapshot matching `lookup`.
    pub fn replay_snapshot(&self, tick: Tick, lookup: SnapshotLookup) -> Option<&Snapshot> {
        self.replay_buffer()?.find(tick, lookup)
    }

    /// Copies of every replay snapshot, oldest first. Data is shared.
    pub fn replay_snapshots(&self) -> Vec<Snapshot> {
        self.replay_buffer()
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Oldest and newest replay ticks.
    pub fn replay_range(&self) -> Option<(Tick, Tick)> {
        let buffer = self.replay_buffer()?;
        Some((buffer.oldest()?, buffer.newest()?))
    }

    /// Drop all snapshots, keeping the layout.
    pub fn clear(&mut self) {
        match &mut self.buffers {
            Buffers::None => {}
            Buffers::Shared(b) => b.clear(),
            Buffers::Separate { checksum, replay } => {
                if let Some(b) = checksum {
                    b.clear();
                }
                if let Some(b) = replay {
                    b.clear();
                }
            }
        }
        self.replay_started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::context::tests::test_context;
    use proptest::prelude::*;

    fn snapshot(tick: Tick) -> Snapshot {
        Snapshot {
            tick,
            checksum: tick as u64,
            data: Arc::new(Vec::new()),
        }
    }

    #[test]
    fn test_capacity_formula() {
        assert_eq!(capacity_for(120, 60), 3);
        assert_eq!(capacity_for(121, 60), 4);
        assert_eq!(capacity_for(1, 60), 2);
    }

    #[test]
    fn test_plan_shares_divisible_intervals() {
        let checksum = SnapshotRequest::new(60, 180).unwrap();
        let replay = SnapshotRequest::new(30, 120).unwrap();
        assert_eq!(
            plan_buffers(Some(checksum), Some(replay)),
            BufferPlan::Shared(BufferGeometry {
                interval: 30,
                capacity: 7
            })
        );

        let odd = SnapshotRequest::new(45, 120).unwrap();
        assert!(matches!(plan_buffers(Some(checksum), Some(odd)), BufferPlan::Separate { .. }));
        assert_eq!(plan_buffers(None, None), BufferPlan::None);
    }

    #[test]
    fn test_invalid_request() {
        assert!(SnapshotRequest::new(0, 10).is_err());
        assert!(SnapshotRequest::new(10, 0).is_err());
    }

    #[test]
    fn test_push_evicts_and_rejects_out_of_order() {
        let mut buffer = SnapshotBuffer::new(BufferGeometry {
            interval: 10,
            capacity: 3,
        });
        for tick in [0, 10, 20, 30] {
            buffer.push(snapshot(tick)).unwrap();
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.oldest(), Some(10));

        let err = buffer.push(snapshot(30)).unwrap_err();
        assert_eq!(err, SnapshotError::NonMonotonic { newest: 30, tick: 30 });
    }

    #[test]
    fn test_lookup_modes() {
        let mut buffer = SnapshotBuffer::new(BufferGeometry {
            interval: 10,
            capacity: 8,
        });
        for tick in [10, 20, 30] {
            buffer.push(snapshot(tick)).unwrap();
        }

        assert_eq!(buffer.find(20, SnapshotLookup::Exact).map(|s| s.tick), Some(20));
        assert!(buffer.find(25, SnapshotLookup::Exact).is_none());
        assert_eq!(buffer.find(25, SnapshotLookup::ClosestAtOrBefore).map(|s| s.tick), Some(20));
        assert_eq!(buffer.find(5, SnapshotLookup::ClosestAtOrBefore), None);
        assert_eq!(buffer.find(99, SnapshotLookup::ClosestAtOrBefore).map(|s| s.tick), Some(30));
        assert_eq!(buffer.find(26, SnapshotLookup::Closest).map(|s| s.tick), Some(30));
        assert_eq!(buffer.find(25, SnapshotLookup::Closest).map(|s| s.tick), Some(20));
        assert_eq!(buffer.find(-4, SnapshotLookup::Closest).map(|s| s.tick), Some(10));
    }

    #[test]
    fn test_record_only_verified_on_grid() {
        let context = test_context();
        let mut frame = context.create_frame().unwrap();
        let mut serializer = FrameSerializer::new();
        let mut set = SnapshotSet::new();
        set.set_checksum_request(Some(SnapshotRequest::new(10, 30).unwrap()));

        frame.set_number(10);
        assert!(!set.record(&mut frame, &mut serializer).unwrap());

        frame.set_verified(true);
        assert!(set.record(&mut frame, &mut serializer).unwrap());
        frame.set_number(11);
        assert!(!set.record(&mut frame, &mut serializer).unwrap());

        let stored = set.checksum_snapshot(10).unwrap();
        assert_eq!(stored.checksum, {
            frame.set_number(10);
            serializer.checksum(&mut frame).unwrap()
        });
        assert!(set.replay_range().is_none());
    }

    #[test]
    fn test_first_replay_sample_unconditional() {
        let context = test_context();
        let mut frame = context.create_frame().unwrap();
        frame.set_verified(true);
        let mut serializer = FrameSerializer::new();
        let mut set = SnapshotSet::new();
        set.set_replay_request(Some(SnapshotRequest::new(10, 100).unwrap()));

        frame.set_number(7);
        assert!(set.record(&mut frame, &mut serializer).unwrap());
        frame.set_number(8);
        assert!(!set.record(&mut frame, &mut serializer).unwrap());
        frame.set_number(10);
        assert!(set.record(&mut frame, &mut serializer).unwrap());
        assert_eq!(set.replay_range(), Some((7, 10)));

        set.clear();
        assert!(set.replay_range().is_none());
    }

    proptest! {
        #[test]
        fn prop_capacity_covers_window(window in 1i32..10_000, interval in 1i32..600) {
            let capacity = capacity_for(window, interval) as i64;
            prop_assert!((capacity - 1) * interval as i64 >= window as i64);
            prop_assert!((capacity - 2) * (interval as i64) < window as i64);
        }

        #[test]
        fn prop_shared_buffer_covers_both(
            ci in 1i32..120, cw in 1i32..2_000, rf in 1i32..6, rw in 1i32..2_000,
        ) {
            let checksum = SnapshotRequest::new(ci, cw).unwrap();
            let replay = SnapshotRequest::new(ci * rf, rw).unwrap();
            match plan_buffers(Some(checksum), Some(replay)) {
                BufferPlan::Shared(geometry) => {
                    prop_assert!(geometry.capacity >= checksum.capacity());
                    prop_assert!(geometry.capacity >= replay.capacity());
                    prop_assert_eq!(geometry.interval, ci);
                }
                other => prop_assert!(false, "expected shared plan, got {:?}", other),
            }
        }
    }
}
