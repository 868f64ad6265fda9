//! Frame Globals
//!
//! The fixed-shape record every frame carries next to its entities: delta
//! time, RNG, current map, per-system enabled bits and physics settings.

use crate::core::fixed::{delta_time_for_fps, Fixed};
use crate::core::rng::DeterministicRng;
use crate::core::stream::{BitStream, Serializable, StreamError};
use crate::sim::assets::AssetGuid;
use crate::sim::config::PhysicsSettings;

/// One bit per system runtime index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemBits {
    words: Vec<u64>,
}

impl SystemBits {
    /// All-clear bitset able to hold `len` systems.
    pub fn with_len(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
        }
    }

    /// Set or clear a bit, growing as needed.
    pub fn set(&mut self, index: usize, value: bool) {
        let word = index / 64;
        if word >= self.words.len() {
            if !value {
                return;
            }
            self.words.resize(word + 1, 0);
        }
        let mask = 1u64 << (index % 64);
        if value {
            self.words[word] |= mask;
        } else {
            self.words[word] &= !mask;
        }
    }

    /// Read a bit. Out-of-range indices read as clear.
    pub fn get(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|w| w & (1u64 << (index % 64)) != 0)
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

impl Serializable for SystemBits {
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        let mut len = self.words.len();
        stream.serialize_len(&mut len)?;
        if stream.is_reading() {
            if len > stream.remaining() / 8 {
                return Err(StreamError::UnexpectedEof {
                    needed: len * 8,
                    remaining: stream.remaining(),
                });
            }
            self.words.clear();
            self.words.resize(len, 0);
        }
        for word in &mut self.words {
            stream.serialize_u64(word)?;
        }
        Ok(())
    }
}

/// Per-frame global state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Globals {
    /// Seconds per tick (Q16.16).
    pub delta_time: Fixed,
    /// Simulation RNG.
    pub rng: DeterministicRng,
    /// Current map asset.
    pub map: AssetGuid,
    /// System enabled bits.
    pub systems: SystemBits,
    /// Physics settings for the external solver.
    pub physics: PhysicsSettings,
}

impl Default for Globals {
    fn default() -> Self {
        Self {
            delta_time: delta_time_for_fps(60),
            rng: DeterministicRng::new(0),
            map: AssetGuid::INVALID,
            systems: SystemBits::default(),
            physics: PhysicsSettings::default(),
        }
    }
}

impl Serializable for Globals {
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        stream.serialize_i32(&mut self.delta_time)?;
        self.rng.serialize(stream)?;
        self.map.serialize(stream)?;
        self.systems.serialize(stream)?;
        self.physics.serialize(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_bits() {
        let mut bits = SystemBits::with_len(3);
        assert!(!bits.get(2));
        bits.set(2, true);
        bits.set(70, true);
        assert!(bits.get(2));
        assert!(bits.get(70));
        assert_eq!(bits.count_ones(), 2);
        bits.set(2, false);
        assert!(!bits.get(2));
        assert!(!bits.get(500));
    }

    #[test]
    fn test_globals_round_trip() {
        let mut globals = Globals {
            map: AssetGuid(44),
            ..Default::default()
        };
        globals.systems.set(1, true);
        globals.rng.next_u64();

        let mut writer = BitStream::writer();
        globals.serialize(&mut writer).unwrap();

        let mut restored = Globals::default();
        let mut reader = BitStream::reader(writer.into_bytes());
        restored.serialize(&mut reader).unwrap();
        assert_eq!(restored, globals);
    }
}
