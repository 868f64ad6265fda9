//! Player Map
//!
//! Player metadata keyed by player ref, shared between frames copy-on-write:
//! copying a frame clones an `Arc`, and the first mutation in either frame
//! detaches it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::stream::{BitStream, Serializable, StreamError};

/// Player slot key (0-based).
pub type PlayerRef = i32;

/// Metadata of one joined player.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerEntry {
    /// Transport-level actor id.
    pub actor_id: i32,
    /// Slot within the client that owns the player.
    pub slot: i32,
    /// Encoded runtime player payload.
    pub data: Vec<u8>,
}

/// Persistent map from player ref to [`PlayerEntry`].
#[derive(Debug, Clone, Default)]
pub struct PlayerMap {
    inner: Arc<BTreeMap<PlayerRef, PlayerEntry>>,
}

impl PartialEq for PlayerMap {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner == other.inner
    }
}

impl Eq for PlayerMap {}

impl PlayerMap {
    /// Look up a player.
    pub fn get(&self, player: PlayerRef) -> Option<&PlayerEntry> {
        self.inner.get(&player)
    }

    /// True if the player has joined.
    pub fn contains(&self, player: PlayerRef) -> bool {
        self.inner.contains_key(&player)
    }

    /// Insert or replace, detaching shared storage.
    pub fn insert(&mut self, player: PlayerRef, entry: PlayerEntry) -> Option<PlayerEntry> {
        Arc::make_mut(&mut self.inner).insert(player, entry)
    }

    /// Remove a player, detaching shared storage only if present.
    pub fn remove(&mut self, player: PlayerRef) -> Option<PlayerEntry> {
        if !self.inner.contains_key(&player) {
            return None;
        }
        Arc::make_mut(&mut self.inner).remove(&player)
    }

    /// Joined player count.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True if nobody joined.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Players in ref order.
    pub fn iter(&self) -> impl Iterator<Item = (PlayerRef, &PlayerEntry)> {
        self.inner.iter().map(|(k, v)| (*k, v))
    }

    /// True if both maps point at the same storage.
    pub fn shares_storage_with(&self, other: &PlayerMap) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Serializable for PlayerMap {
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        let mut count = self.inner.len();
        stream.serialize_len(&mut count)?;

        if stream.is_reading() {
            let mut map = BTreeMap::new();
            for _ in 0..count {
                let mut key: PlayerRef = 0;
                let mut entry = PlayerEntry::default();
                stream.serialize_i32(&mut key)?;
                stream.serialize_i32(&mut entry.actor_id)?;
                stream.serialize_i32(&mut entry.slot)?;
                stream.serialize_bytes(&mut entry.data)?;
                map.insert(key, entry);
            }
            self.inner = Arc::new(map);
            return Ok(());
        }

        // Walk shared storage without detaching it.
        for (key, entry) in self.inner.iter() {
            let (mut key, mut actor, mut slot) = (*key, entry.actor_id, entry.slot);
            stream.serialize_i32(&mut key)?;
            stream.serialize_i32(&mut actor)?;
            stream.serialize_i32(&mut slot)?;
            stream.put_bytes(&entry.data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(actor: i32) -> PlayerEntry {
        PlayerEntry {
            actor_id: actor,
            slot: 0,
            data: vec![actor as u8; 3],
        }
    }

    #[test]
    fn test_copy_on_write() {
        let mut a = PlayerMap::default();
        a.insert(0, entry(10));

        let mut b = a.clone();
        assert!(a.shares_storage_with(&b));

        b.insert(1, entry(11));
        assert!(!a.shares_storage_with(&b));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn test_remove_missing_keeps_sharing() {
        let mut a = PlayerMap::default();
        a.insert(0, entry(1));
        let mut b = a.clone();
        assert!(b.remove(5).is_none());
        assert!(a.shares_storage_with(&b));
    }

    #[test]
    fn test_serialize_round_trip() {
        let mut map = PlayerMap::default();
        map.insert(2, entry(7));
        map.insert(0, entry(5));

        let mut writer = BitStream::writer();
        Serializable::serialize(&mut map, &mut writer).unwrap();

        let mut restored = PlayerMap::default();
        let mut reader = BitStream::reader(writer.into_bytes());
        Serializable::serialize(&mut restored, &mut reader).unwrap();

        assert_eq!(restored, map);
        assert_eq!(restored.iter().map(|(k, _)| k).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_block_layout() {
        let mut map = PlayerMap::default();
        map.insert(3, PlayerEntry { actor_id: 4, slot: 1, data: vec![9] });

        let mut writer = BitStream::writer();
        Serializable::serialize(&mut map, &mut writer).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(&3i32.to_le_bytes());
        expected.extend_from_slice(&4i32.to_le_bytes());
        expected.extend_from_slice(&1i32.to_le_bytes());
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.push(9);
        assert_eq!(writer.bytes(), expected.as_slice());
    }
}
