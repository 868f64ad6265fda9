//! Checksum Records
//!
//! - [`ChecksumHistory`]: local checksums of recent verified ticks, matched
//!   against checksums reported by peers (which may arrive before or after
//!   the local one).
//! - [`ChecksumFile`]: `(tick, checksum)` pairs recorded for offline
//!   verification, e.g. alongside a replay.
//! - [`ChecksumVerifier`]: replays a [`ChecksumFile`] against a live session.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::sim::frame::Tick;
use crate::sim::replay::ReplayError;

/// Outcome of comparing two checksums for the same tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumVerdict {
    /// Both sides agree.
    Match,
    /// Divergence.
    Mismatch {
        /// Checksum computed here.
        local: u64,
        /// Checksum from the peer or file.
        remote: u64,
    },
    /// Nothing to compare against (yet).
    Unknown,
}

// =============================================================================
// HISTORY
// =============================================================================

/// Recent local checksums and early remote ones.
#[derive(Debug, Clone)]
pub struct ChecksumHistory {
    capacity: usize,
    local: VecDeque<(Tick, u64)>,
    remote: BTreeMap<Tick, u64>,
}

impl ChecksumHistory {
    /// Keep at most `capacity` local checksums (and as many pending remote ones).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            local: VecDeque::with_capacity(capacity),
            remote: BTreeMap::new(),
        }
    }

    /// Local checksum of `tick`, if still kept.
    pub fn local(&self, tick: Tick) -> Option<u64> {
        self.local
            .binary_search_by_key(&tick, |(t, _)| *t)
            .ok()
            .map(|i| self.local[i].1)
    }

    /// Newest local tick.
    pub fn newest(&self) -> Option<Tick> {
        self.local.back().map(|(t, _)| *t)
    }

    /// Remote checksums still waiting for the local tick.
    pub fn pending_remote(&self) -> usize {
        self.remote.len()
    }

    /// Record a local checksum, resolving any remote one already received.
    pub fn record_local(&mut self, tick: Tick, checksum: u64) -> ChecksumVerdict {
        if self.newest().is_some_and(|newest| tick <= newest) {
            warn!(tick, "Ignoring out-of-order local checksum");
            return ChecksumVerdict::Unknown;
        }
        if self.local.len() == self.capacity {
            self.local.pop_front();
        }
        self.local.push_back((tick, checksum));

        match self.remote.remove(&tick) {
            Some(remote) => compare(checksum, remote),
            None => ChecksumVerdict::Unknown,
        }
    }

    /// Record a peer checksum. Compared immediately if the local one is
    /// known, otherwise held until [`record_local`](Self::record_local).
    pub fn record_remote(&mut self, tick: Tick, checksum: u64) -> ChecksumVerdict {
        if let Some(local) = self.local(tick) {
            return compare(local, checksum);
        }
        let too_old = self.local.front().is_some_and(|(oldest, _)| tick < *oldest)
            || self.newest().is_some_and(|newest| tick <= newest);
        if too_old {
            debug!(tick, "Remote checksum for a tick no longer kept");
            return ChecksumVerdict::Unknown;
        }
        self.remote.insert(tick, checksum);
        while self.remote.len() > self.capacity {
            self.remote.pop_first();
        }
        ChecksumVerdict::Unknown
    }

    /// Forget everything (resync).
    pub fn clear(&mut self) {
        self.local.clear();
        self.remote.clear();
    }
}

fn compare(local: u64, remote: u64) -> ChecksumVerdict {
    if local == remote {
        ChecksumVerdict::Match
    } else {
        ChecksumVerdict::Mismatch { local, remote }
    }
}

// =============================================================================
// FILE
// =============================================================================

/// One recorded checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumEntry {
    /// Tick.
    pub tick: Tick,
    /// Checksum.
    pub checksum: u64,
}

/// Recorded checksums in tick order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumFile {
    /// Entries, strictly increasing by tick.
    pub entries: Vec<ChecksumEntry>,
}

impl ChecksumFile {
    const MIN_GROWTH: usize = 64;

    /// Empty file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a checksum. Non-increasing ticks are ignored.
    pub fn record(&mut self, tick: Tick, checksum: u64) {
        if self.entries.last().is_some_and(|last| tick <= last.tick) {
            return;
        }
        if self.entries.len() == self.entries.capacity() {
            let grow = self.entries.capacity().max(Self::MIN_GROWTH);
            self.entries.reserve_exact(grow);
        }
        self.entries.push(ChecksumEntry { tick, checksum });
    }

    /// Checksum recorded for `tick`.
    pub fn get(&self, tick: Tick) -> Option<u64> {
        self.entries
            .binary_search_by_key(&tick, |e| e.tick)
            .ok()
            .map(|i| self.entries[i].checksum)
    }

    /// Entry count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// bincode encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ReplayError> {
        bincode::serialize(self).map_err(|e| ReplayError::Encode(e.to_string()))
    }

    /// Decode from [`to_bytes`](Self::to_bytes) output.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ReplayError> {
        bincode::deserialize(bytes).map_err(|e| ReplayError::Decode(e.to_string()))
    }
}

/// Checks live checksums against a recorded file.
#[derive(Debug, Clone)]
pub struct ChecksumVerifier {
    file: ChecksumFile,
    verified: usize,
    mismatches: Vec<(Tick, ChecksumVerdict)>,
}

impl ChecksumVerifier {
    /// Verify against `file`.
    pub fn new(file: ChecksumFile) -> Self {
        Self {
            file,
            verified: 0,
            mismatches: Vec::new(),
        }
    }

    /// Compare a locally computed checksum.
    pub fn verify(&mut self, tick: Tick, checksum: u64) -> ChecksumVerdict {
        let verdict = match self.file.get(tick) {
            Some(recorded) => compare(checksum, recorded),
            None => ChecksumVerdict::Unknown,
        };
        match verdict {
            ChecksumVerdict::Match => self.verified += 1,
            ChecksumVerdict::Mismatch { .. } => self.mismatches.push((tick, verdict)),
            ChecksumVerdict::Unknown => {}
        }
        verdict
    }

    /// Ticks that matched.
    pub fn verified(&self) -> usize {
        self.verified
    }

    /// Ticks that did not.
    pub fn mismatches(&self) -> &[(Tick, ChecksumVerdict)] {
        &self.mismatches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_before_local() {
        let mut history = ChecksumHistory::new(4);
        assert_eq!(history.record_remote(60, 7), ChecksumVerdict::Unknown);
        assert_eq!(history.pending_remote(), 1);
        assert_eq!(
            history.record_local(60, 8),
            ChecksumVerdict::Mismatch { local: 8, remote: 7 }
        );
        assert_eq!(history.pending_remote(), 0);
    }

    #[test]
    fn test_remote_after_local() {
        let mut history = ChecksumHistory::new(2);
        history.record_local(0, 1);
        history.record_local(60, 2);
        history.record_local(120, 3);
        assert_eq!(history.local(0), None);
        assert_eq!(history.record_remote(60, 2), ChecksumVerdict::Match);
        assert_eq!(history.record_remote(0, 9), ChecksumVerdict::Unknown);
        assert_eq!(history.pending_remote(), 0);
    }

    #[test]
    fn test_file_grows_and_looks_up() {
        let mut file = ChecksumFile::new();
        for tick in 0..200 {
            file.record(tick, tick as u64 * 3);
        }
        file.record(10, 0);
        assert_eq!(file.len(), 200);
        assert_eq!(file.get(150), Some(450));
        assert_eq!(file.get(500), None);

        let decoded = ChecksumFile::from_bytes(&file.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, file);
        assert!(ChecksumFile::from_bytes(&[1, 2]).is_err());
    }

    #[test]
    fn test_verifier_counts() {
        let mut file = ChecksumFile::new();
        file.record(60, 1);
        file.record(120, 2);
        let mut verifier = ChecksumVerifier::new(file);

        assert_eq!(verifier.verify(60, 1), ChecksumVerdict::Match);
        assert_eq!(verifier.verify(90, 1), ChecksumVerdict::Unknown);
        assert_eq!(
            verifier.verify(120, 5),
            ChecksumVerdict::Mismatch { local: 5, remote: 2 }
        );
        assert_eq!(verifier.verified(), 1);
        assert_eq!(verifier.mismatches().len(), 1);
    }
}
