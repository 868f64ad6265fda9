//! Entity Registry
//!
//! Entities are versioned slot indices. Destroying an entity bumps its slot's
//! version, so stale [`EntityRef`]s are detected instead of aliasing a new
//! entity. Freed slots are reused last-in first-out, which keeps creation
//! order (and therefore every checksum) identical across peers.
//!
//! Component data lives in the frame heap; the registry only maps
//! `(entity, component id)` to a [`HeapPtr`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::heap::HeapPtr;
use crate::core::stream::{BitStream, Serializable, StreamError};
use crate::sim::config::EntitiesConfig;
use crate::sim::frame::FrameError;

/// Component type identifier.
pub type ComponentId = u16;

/// Reference to an entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Slot index.
    pub index: u32,
    /// Slot version at creation time.
    pub version: u32,
}

impl EntityRef {
    /// The null reference (version 0 is never live).
    pub const NONE: EntityRef = EntityRef { index: 0, version: 0 };
}

impl Serializable for EntityRef {
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        stream.serialize_u32(&mut self.index)?;
        stream.serialize_u32(&mut self.version)
    }
}

/// Fixed-size component stored in the frame heap.
///
/// Encoding is explicit so the byte layout, and therefore the checksum, does
/// not depend on the compiler's struct layout.
pub trait Component: Sized + Send + Sync + 'static {
    /// Unique component id.
    const ID: ComponentId;
    /// Encoded size in bytes.
    const SIZE: usize;
    /// Write exactly `SIZE` bytes.
    fn encode(&self, out: &mut [u8]);
    /// Read from exactly `SIZE` bytes.
    fn decode(bytes: &[u8]) -> Self;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Slot {
    version: u32,
    alive: bool,
    components: BTreeMap<ComponentId, HeapPtr>,
}

/// Slot table of all entities in a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    alive: u32,
    max_entities: u32,
}

impl EntityRegistry {
    /// Empty registry sized from config.
    pub fn new(config: &EntitiesConfig) -> Self {
        Self {
            slots: Vec::with_capacity(config.initial_capacity.min(config.max_entities) as usize),
            free: Vec::new(),
            alive: 0,
            max_entities: config.max_entities,
        }
    }

    /// Live entity count.
    #[inline]
    pub fn count(&self) -> u32 {
        self.alive
    }

    /// Entity cap.
    #[inline]
    pub fn max_entities(&self) -> u32 {
        self.max_entities
    }

    /// Create an entity.
    pub fn create(&mut self) -> Result<EntityRef, FrameError> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() as u32 >= self.max_entities {
                    return Err(FrameError::EntityCapacity(self.max_entities));
                }
                self.slots.push(Slot {
                    version: 1,
                    ..Slot::default()
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.alive = true;
        self.alive += 1;
        Ok(EntityRef {
            index,
            version: slot.version,
        })
    }

    /// Destroy an entity, returning its component allocations for the caller to free.
    pub fn destroy(&mut self, entity: EntityRef) -> Result<Vec<HeapPtr>, FrameError> {
        let slot = self.live_slot_mut(entity)?;
        slot.alive = false;
        slot.version = slot.version.wrapping_add(1).max(1);
        let ptrs = std::mem::take(&mut slot.components).into_values().collect();
        self.free.push(entity.index);
        self.alive -= 1;
        Ok(ptrs)
    }

    /// True if `entity` refers to a live entity.
    pub fn exists(&self, entity: EntityRef) -> bool {
        self.slots
            .get(entity.index as usize)
            .is_some_and(|s| s.alive && s.version == entity.version)
    }

    fn live_slot(&self, entity: EntityRef) -> Result<&Slot, FrameError> {
        self.slots
            .get(entity.index as usize)
            .filter(|s| s.alive && s.version == entity.version)
            .ok_or(FrameError::InvalidEntity(entity))
    }

    fn live_slot_mut(&mut self, entity: EntityRef) -> Result<&mut Slot, FrameError> {
        self.slots
            .get_mut(entity.index as usize)
            .filter(|s| s.alive && s.version == entity.version)
            .ok_or(FrameError::InvalidEntity(entity))
    }

    /// Heap location of a component, if attached.
    pub fn component(&self, entity: EntityRef, id: ComponentId) -> Result<Option<HeapPtr>, FrameError> {
        Ok(self.live_slot(entity)?.components.get(&id).copied())
    }

    /// Attach a component allocation. Returns the replaced one, if any.
    pub fn insert_component(
        &mut self,
        entity: EntityRef,
        id: ComponentId,
        ptr: HeapPtr,
    ) -> Result<Option<HeapPtr>, FrameError> {
        Ok(self.live_slot_mut(entity)?.components.insert(id, ptr))
    }

    /// Detach a component allocation.
    pub fn remove_component(&mut self, entity: EntityRef, id: ComponentId) -> Result<Option<HeapPtr>, FrameError> {
        Ok(self.live_slot_mut(entity)?.components.remove(&id))
    }

    /// Live entities in slot order.
    pub fn iter(&self) -> impl Iterator<Item = EntityRef> + '_ {
        self.slots.iter().enumerate().filter(|(_, s)| s.alive).map(|(i, s)| EntityRef {
            index: i as u32,
            version: s.version,
        })
    }

    /// Live entities carrying component `id`, in slot order.
    pub fn with_component(&self, id: ComponentId) -> Vec<(EntityRef, HeapPtr)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.alive)
            .filter_map(|(i, s)| {
                s.components.get(&id).map(|ptr| {
                    (
                        EntityRef {
                            index: i as u32,
                            version: s.version,
                        },
                        *ptr,
                    )
                })
            })
            .collect()
    }

    /// Add every component allocation to `roots`.
    pub fn heap_roots(&self, roots: &mut BTreeSet<HeapPtr>) {
        for slot in self.slots.iter().filter(|s| s.alive) {
            roots.extend(slot.components.values().copied());
        }
    }

    /// Drop all entities. Component memory is the caller's to reset.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.alive = 0;
    }
}

impl Serializable for EntityRegistry {
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        let mut slot_count = self.slots.len();
        stream.serialize_len(&mut slot_count)?;
        if stream.is_reading() {
            if slot_count > self.max_entities as usize {
                return Err(StreamError::Invalid(format!(
                    "{slot_count} entity slots exceeds cap {}",
                    self.max_entities
                )));
            }
            self.slots.clear();
            self.slots.resize_with(slot_count, Slot::default);
        }

        for slot in &mut self.slots {
            stream.serialize_u32(&mut slot.version)?;
            stream.serialize_bool(&mut slot.alive)?;
            let mut count = slot.components.len();
            stream.serialize_len(&mut count)?;
            if stream.is_reading() {
                slot.components.clear();
                for _ in 0..count {
                    let mut id: ComponentId = 0;
                    let mut ptr = HeapPtr::default();
                    stream.serialize_u16(&mut id)?;
                    Serializable::serialize(&mut ptr, stream)?;
                    slot.components.insert(id, ptr);
                }
            } else {
                for (id, ptr) in slot.components.iter_mut() {
                    let mut id = *id;
                    stream.serialize_u16(&mut id)?;
                    Serializable::serialize(ptr, stream)?;
                }
            }
        }

        let mut free_count = self.free.len();
        stream.serialize_len(&mut free_count)?;
        if stream.is_reading() {
            self.free.clear();
            self.free.resize(free_count, 0);
        }
        for index in &mut self.free {
            stream.serialize_u32(index)?;
        }

        stream.serialize_u32(&mut self.alive)?;
        if stream.is_reading() {
            let live = self.slots.iter().filter(|s| s.alive).count() as u32;
            if live != self.alive || self.free.iter().any(|&i| i as usize >= self.slots.len()) {
                return Err(StreamError::Invalid("inconsistent entity registry".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(max: u32) -> EntityRegistry {
        EntityRegistry::new(&EntitiesConfig {
            initial_capacity: 4,
            max_entities: max,
        })
    }

    #[test]
    fn test_create_destroy_reuses_slot_lifo() {
        let mut reg = registry(8);
        let a = reg.create().unwrap();
        let b = reg.create().unwrap();
        assert_eq!(reg.count(), 2);

        reg.destroy(a).unwrap();
        reg.destroy(b).unwrap();
        assert!(!reg.exists(a));

        // Last freed is first reused, with a bumped version.
        let c = reg.create().unwrap();
        assert_eq!(c.index, b.index);
        assert_eq!(c.version, b.version + 1);
        assert!(!reg.exists(b));
        assert!(reg.exists(c));
    }

    #[test]
    fn test_capacity() {
        let mut reg = registry(2);
        reg.create().unwrap();
        reg.create().unwrap();
        assert!(matches!(reg.create(), Err(FrameError::EntityCapacity(2))));
    }

    #[test]
    fn test_stale_ref_rejected() {
        let mut reg = registry(4);
        let a = reg.create().unwrap();
        reg.destroy(a).unwrap();
        assert!(matches!(reg.destroy(a), Err(FrameError::InvalidEntity(_))));
        assert!(reg.component(a, 1).is_err());
    }

    #[test]
    fn test_components_and_roots() {
        let mut reg = registry(4);
        let a = reg.create().unwrap();
        let b = reg.create().unwrap();
        let ptr = HeapPtr { page: 0, offset: 8, len: 4 };
        reg.insert_component(a, 7, ptr).unwrap();

        assert_eq!(reg.component(a, 7).unwrap(), Some(ptr));
        assert_eq!(reg.component(b, 7).unwrap(), None);
        assert_eq!(reg.with_component(7), vec![(a, ptr)]);

        let mut roots = BTreeSet::new();
        reg.heap_roots(&mut roots);
        assert!(roots.contains(&ptr));

        assert_eq!(reg.destroy(a).unwrap(), vec![ptr]);
    }

    #[test]
    fn test_serialize_round_trip() {
        let mut reg = registry(16);
        let a = reg.create().unwrap();
        let b = reg.create().unwrap();
        reg.insert_component(b, 3, HeapPtr { page: 1, offset: 0, len: 12 }).unwrap();
        reg.destroy(a).unwrap();

        let mut writer = BitStream::writer();
        Serializable::serialize(&mut reg, &mut writer).unwrap();

        let mut restored = registry(16);
        let mut reader = BitStream::reader(writer.into_bytes());
        Serializable::serialize(&mut restored, &mut reader).unwrap();

        assert_eq!(restored, reg);
        assert_eq!(restored.create().unwrap(), reg.create().unwrap());
    }
}
