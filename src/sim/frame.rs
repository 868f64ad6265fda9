//! Frame
//!
//! A `Frame` is the entire simulated world at one tick: globals, entity
//! registry, component heap, players, the input applied this tick, dynamic
//! assets and the per-project user state. Everything here is deterministic
//! and takes part in serialization and checksums, except the list of events
//! raised during the current simulation.
//!
//! Frames are never created directly by systems. The session allocates one
//! per buffer slot from the shared [`FrameContext`] and copies between them
//! on rollback.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::core::fixed::{delta_time_for_fps, Fixed};
use crate::core::heap::{FrameHeap, HeapError, HeapPtr};
use crate::core::rng::DeterministicRng;
use crate::core::stream::{BitStream, Serializable, StreamError};
use crate::sim::assets::{AssetError, AssetGuid, DynamicAssetDb};
use crate::sim::command::DeterministicCommand;
use crate::sim::context::FrameContext;
use crate::sim::entity::{Component, ComponentId, EntityRef, EntityRegistry};
use crate::sim::events::{Event, EventTypeRegistry, RaisedEvent};
use crate::sim::globals::{Globals, SystemBits};
use crate::sim::input::{FrameInputs, InputDecode, PlayerJoin, TickInputs};
use crate::sim::players::{PlayerEntry, PlayerMap, PlayerRef};
use crate::sim::system::{Signal, SystemIndex};

/// Simulation tick number.
pub type Tick = i32;

/// Errors raised by frame operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Heap failure. Out of memory is a configuration error.
    #[error("Heap error: {0}")]
    Heap(#[from] HeapError),

    /// Malformed serialized data.
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Entity cap reached.
    #[error("Entity capacity {0} reached")]
    EntityCapacity(u32),

    /// Stale or unknown entity reference.
    #[error("Invalid entity {0:?}")]
    InvalidEntity(EntityRef),

    /// Entity lacks the component.
    #[error("Entity {entity:?} has no component {component}")]
    MissingComponent {
        /// Entity queried.
        entity: EntityRef,
        /// Component id.
        component: ComponentId,
    },

    /// Deserialized state does not match its embedded checksum.
    #[error("Checksum mismatch: expected {expected:#018x}, computed {actual:#018x}")]
    ChecksumMismatch {
        /// Checksum carried by the data.
        expected: u64,
        /// Checksum of the restored frame.
        actual: u64,
    },

    /// gzip failure.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Serialized frame uses a data mode this build does not read.
    #[error("Unsupported frame data mode {0}")]
    UnsupportedMode(i32),

    /// Input for the wrong tick.
    #[error("Expected input for tick {expected}, got {got}")]
    TickMismatch {
        /// Tick the frame simulates next.
        expected: Tick,
        /// Tick of the supplied input.
        got: Tick,
    },

    /// Asset lookup or decode failure.
    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),
}

// =============================================================================
// USER STATE
// =============================================================================

/// Per-project state stored next to the entity data.
///
/// Implementations must serialize every field that influences simulation.
pub trait UserState: Send + Sync + 'static {
    /// Walk all fields through the stream.
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError>;
    /// Deep copy.
    fn clone_state(&self) -> Box<dyn UserState>;
    /// Heap allocations owned by this state, for leak detection.
    fn heap_roots(&self, _roots: &mut BTreeSet<HeapPtr>) {}
    /// Downcast access.
    fn as_any(&self) -> &dyn Any;
    /// Mutable downcast access.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// User state with no fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyUserState;

impl UserState for EmptyUserState {
    fn serialize(&mut self, _stream: &mut BitStream) -> Result<(), StreamError> {
        Ok(())
    }

    fn clone_state(&self) -> Box<dyn UserState> {
        Box::new(*self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Per-project layout registered at startup.
pub trait StateLayout: Send + Sync + 'static {
    /// Fresh user state for a new frame.
    fn create_user_state(&self) -> Box<dyn UserState> {
        Box::new(EmptyUserState)
    }

    /// Register event types and their parents.
    fn register_events(&self, _registry: &mut EventTypeRegistry) {}
}

/// Layout with no user state and no event hierarchy.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultLayout;

impl StateLayout for DefaultLayout {}

// =============================================================================
// FRAME
// =============================================================================

/// World state at one tick.
pub struct Frame {
    number: Tick,
    verified: bool,
    globals: Globals,
    entities: EntityRegistry,
    heap: FrameHeap,
    players: PlayerMap,
    inputs: FrameInputs,
    assets: DynamicAssetDb,
    user: Box<dyn UserState>,
    raised: Vec<RaisedEvent>,
    context: Arc<FrameContext>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("number", &self.number)
            .field("verified", &self.verified)
            .field("entities", &self.entities.count())
            .field("players", &self.players.len())
            .field("heap_pages", &self.heap.used_pages())
            .finish()
    }
}

impl Frame {
    /// Allocate an empty frame. Its number is `-1` until something is
    /// simulated or restored into it.
    pub fn new(context: Arc<FrameContext>) -> Result<Self, FrameError> {
        let heap = FrameHeap::new(context.heap_config())?;
        let entities = EntityRegistry::new(&context.simulation().entities);
        let user = context.layout().create_user_state();
        let globals = Globals {
            systems: SystemBits::with_len(context.systems().len()),
            ..Globals::default()
        };
        Ok(Self {
            number: -1,
            verified: false,
            globals,
            entities,
            heap,
            players: PlayerMap::default(),
            inputs: FrameInputs::default(),
            assets: DynamicAssetDb::default(),
            user,
            raised: Vec::new(),
            context,
        })
    }

    /// Set the globals derived from the session and runtime configs.
    pub fn initialize_globals(&mut self) {
        let session = self.context.session();
        let runtime = self.context.runtime();
        self.globals.delta_time = delta_time_for_fps(session.update_fps);
        self.globals.rng = DeterministicRng::new(runtime.seed);
        self.globals.map = runtime.map;
        self.globals.physics = self.context.simulation().physics;
    }

    /// Shared session context.
    #[inline]
    pub fn context(&self) -> &Arc<FrameContext> {
        &self.context
    }

    /// Tick number.
    #[inline]
    pub fn number(&self) -> Tick {
        self.number
    }

    pub(crate) fn set_number(&mut self, tick: Tick) {
        self.number = tick;
    }

    /// True if simulated from confirmed input only.
    #[inline]
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// True if this frame is a prediction.
    #[inline]
    pub fn is_predicted(&self) -> bool {
        !self.verified
    }

    pub(crate) fn set_verified(&mut self, verified: bool) {
        self.verified = verified;
    }

    // =========================================================================
    // GLOBALS
    // =========================================================================

    /// Globals record.
    #[inline]
    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    /// Mutable globals. Main-thread only.
    #[inline]
    pub fn globals_mut(&mut self) -> &mut Globals {
        &mut self.globals
    }

    /// Seconds per tick.
    #[inline]
    pub fn delta_time(&self) -> Fixed {
        self.globals.delta_time
    }

    /// Simulation RNG.
    #[inline]
    pub fn rng(&mut self) -> &mut DeterministicRng {
        &mut self.globals.rng
    }

    /// Current map.
    #[inline]
    pub fn map(&self) -> AssetGuid {
        self.globals.map
    }

    /// Change map and signal subscribed systems.
    pub fn set_map(&mut self, map: AssetGuid) {
        let previous = self.globals.map;
        if previous == map {
            return;
        }
        self.globals.map = map;
        self.signal(Signal::MapChanged { previous });
    }

    // =========================================================================
    // ENTITIES
    // =========================================================================

    /// Entity registry.
    #[inline]
    pub fn entities(&self) -> &EntityRegistry {
        &self.entities
    }

    /// Frame heap.
    #[inline]
    pub fn heap(&self) -> &FrameHeap {
        &self.heap
    }

    /// Mutable frame heap, for user state allocations.
    #[inline]
    pub fn heap_mut(&mut self) -> &mut FrameHeap {
        &mut self.heap
    }

    /// Create an entity.
    pub fn create(&mut self) -> Result<EntityRef, FrameError> {
        self.entities.create()
    }

    /// Destroy an entity and free its components.
    pub fn destroy(&mut self, entity: EntityRef) -> Result<(), FrameError> {
        for ptr in self.entities.destroy(entity)? {
            self.heap.free(ptr)?;
        }
        Ok(())
    }

    /// True if the entity is live.
    #[inline]
    pub fn exists(&self, entity: EntityRef) -> bool {
        self.entities.exists(entity)
    }

    /// Add or overwrite a component.
    #[track_caller]
    pub fn set<C: Component>(&mut self, entity: EntityRef, value: &C) -> Result<(), FrameError> {
        let ptr = match self.entities.component(entity, C::ID)? {
            Some(ptr) => ptr,
            None => {
                let ptr = self.heap.allocate(C::SIZE)?;
                self.entities.insert_component(entity, C::ID, ptr)?;
                ptr
            }
        };
        let bytes = self.heap.bytes_mut(ptr)?;
        value.encode(&mut bytes[..C::SIZE]);
        Ok(())
    }

    /// Add a component. Same as [`set`](Self::set).
    #[track_caller]
    pub fn add<C: Component>(&mut self, entity: EntityRef, value: C) -> Result<(), FrameError> {
        self.set(entity, &value)
    }

    /// Read a component.
    pub fn get<C: Component>(&self, entity: EntityRef) -> Result<C, FrameError> {
        self.try_get(entity)?.ok_or(FrameError::MissingComponent {
            entity,
            component: C::ID,
        })
    }

    /// Read a component if present.
    pub fn try_get<C: Component>(&self, entity: EntityRef) -> Result<Option<C>, FrameError> {
        match self.entities.component(entity, C::ID)? {
            Some(ptr) => Ok(Some(C::decode(&self.heap.bytes(ptr)?[..C::SIZE]))),
            None => Ok(None),
        }
    }

    /// True if the entity is live and has the component.
    pub fn has<C: Component>(&self, entity: EntityRef) -> bool {
        matches!(self.entities.component(entity, C::ID), Ok(Some(_)))
    }

    /// Remove a component. Returns false if it was not attached.
    pub fn remove<C: Component>(&mut self, entity: EntityRef) -> Result<bool, FrameError> {
        match self.entities.remove_component(entity, C::ID)? {
            Some(ptr) => {
                self.heap.free(ptr)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Every live entity with component `C`, in slot order, with its value.
    pub fn filter<C: Component>(&self) -> Result<Vec<(EntityRef, C)>, FrameError> {
        self.entities
            .with_component(C::ID)
            .into_iter()
            .map(|(entity, ptr)| Ok((entity, C::decode(&self.heap.bytes(ptr)?[..C::SIZE]))))
            .collect()
    }

    /// Live entities with component `C`, in slot order.
    pub fn entities_with<C: Component>(&self) -> Vec<EntityRef> {
        self.entities
            .with_component(C::ID)
            .into_iter()
            .map(|(entity, _)| entity)
            .collect()
    }

    // =========================================================================
    // PLAYERS & INPUT
    // =========================================================================

    /// Player map.
    #[inline]
    pub fn players(&self) -> &PlayerMap {
        &self.players
    }

    /// One player's metadata.
    pub fn player(&self, player: PlayerRef) -> Option<&PlayerEntry> {
        self.players.get(player)
    }

    /// Decode a player's runtime payload.
    pub fn player_data<T: DeserializeOwned>(&self, player: PlayerRef) -> Result<Option<T>, FrameError> {
        match self.players.get(player) {
            Some(entry) if !entry.data.is_empty() => {
                Ok(Some(self.context.asset_serializer().bytes_to_object(&entry.data)?))
            }
            _ => Ok(None),
        }
    }

    pub(crate) fn add_player(&mut self, join: &PlayerJoin) {
        let entry = PlayerEntry {
            actor_id: join.actor_id,
            slot: join.player,
            data: join.data.clone(),
        };
        let fresh = self.players.insert(join.player, entry).is_none();
        if fresh {
            self.signal(Signal::PlayerAdded { player: join.player });
        }
    }

    pub(crate) fn remove_player(&mut self, player: PlayerRef) {
        if self.players.remove(player).is_some() {
            self.signal(Signal::PlayerRemoved { player });
        }
    }

    pub(crate) fn apply_inputs(&mut self, tick_inputs: &TickInputs) {
        self.inputs.assign(tick_inputs);
    }

    /// Decoded input of a player for this tick. Missing or malformed input
    /// yields `I::default()`.
    pub fn input<I: InputDecode>(&self, player: PlayerRef) -> I {
        let Some(bytes) = self.inputs.input(player) else {
            return I::default();
        };
        match I::decode(bytes) {
            Some(input) => input,
            None => {
                warn!(tick = self.number, player, len = bytes.len(), "Malformed input, using default");
                I::default()
            }
        }
    }

    /// Raw input bytes of a player for this tick.
    pub fn raw_input(&self, player: PlayerRef) -> Option<&[u8]> {
        self.inputs.input(player)
    }

    /// Command a player issued this tick. Undecodable commands are dropped.
    pub fn command(&self, player: PlayerRef) -> Option<Box<dyn DeterministicCommand>> {
        let bytes = self.inputs.command(player)?;
        match self.context.commands().decode(bytes) {
            Ok(command) => Some(command),
            Err(e) => {
                warn!(tick = self.number, player, "Dropping command: {}", e);
                None
            }
        }
    }

    // =========================================================================
    // EVENTS & SIGNALS
    // =========================================================================

    /// Raise a gameplay event on the current tick.
    pub fn raise<E: Event>(&mut self, event: E) {
        self.raised.push(RaisedEvent::new(self.number, event));
    }

    /// Drain events raised since the last call.
    pub fn take_raised(&mut self) -> Vec<RaisedEvent> {
        std::mem::take(&mut self.raised)
    }

    fn signal(&mut self, signal: Signal) {
        let context = Arc::clone(&self.context);
        context.systems().dispatch_signal(self, &signal);
    }

    // =========================================================================
    // SYSTEMS
    // =========================================================================

    /// Runtime index of a system by name.
    pub fn system_index(&self, name: &str) -> Option<SystemIndex> {
        self.context.systems().index_of(name)
    }

    /// Enable a system. Fires `on_enabled` when its hierarchy state flips.
    pub fn enable_system(&mut self, index: SystemIndex) {
        let context = Arc::clone(&self.context);
        context.systems().enable(self, index);
    }

    /// Disable a system. Fires `on_disabled` when its hierarchy state flips.
    pub fn disable_system(&mut self, index: SystemIndex) {
        let context = Arc::clone(&self.context);
        context.systems().disable(self, index);
    }

    /// The system's own enabled bit.
    pub fn is_system_enabled_self(&self, index: SystemIndex) -> bool {
        self.globals.systems.get(index)
    }

    /// Own bit and every ancestor's bit set.
    pub fn is_system_enabled_in_hierarchy(&self, index: SystemIndex) -> bool {
        self.context.systems().is_enabled_in_hierarchy(self, index)
    }

    // =========================================================================
    // ASSETS & USER STATE
    // =========================================================================

    /// Dynamic assets created during simulation.
    #[inline]
    pub fn dynamic_assets(&self) -> &DynamicAssetDb {
        &self.assets
    }

    /// Mutable dynamic assets.
    #[inline]
    pub fn dynamic_assets_mut(&mut self) -> &mut DynamicAssetDb {
        &mut self.assets
    }

    /// Look up and decode an asset, dynamic assets first.
    pub fn find_asset<T: DeserializeOwned>(&self, guid: AssetGuid) -> Result<T, FrameError> {
        let serializer = self.context.asset_serializer();
        if let Some(bytes) = self.assets.get(guid) {
            return Ok(serializer.bytes_to_object(bytes)?);
        }
        let bytes = self
            .context
            .resources()
            .get_asset(guid)
            .ok_or(AssetError::NotFound(guid))?;
        Ok(serializer.bytes_to_object(&bytes)?)
    }

    /// Typed user state.
    pub fn user_state<T: UserState>(&self) -> Option<&T> {
        self.user.as_any().downcast_ref::<T>()
    }

    /// Mutable typed user state.
    pub fn user_state_mut<T: UserState>(&mut self) -> Option<&mut T> {
        self.user.as_any_mut().downcast_mut::<T>()
    }

    /// Heap allocations reachable from entities and user state.
    pub fn heap_roots(&self) -> BTreeSet<HeapPtr> {
        let mut roots = BTreeSet::new();
        self.entities.heap_roots(&mut roots);
        self.user.heap_roots(&mut roots);
        roots
    }

    pub(crate) fn begin_tick(&mut self, tick: Tick) {
        self.heap.begin_tick(tick);
    }

    pub(crate) fn report_leaks(&self) -> usize {
        let leaks = self.heap.report_leaks(&self.heap_roots());
        if leaks > 0 {
            debug!(tick = self.number, leaks, "Heap leak check");
        }
        leaks
    }

    /// True if the point is inside the prediction area, or the frame is verified.
    ///
    /// Systems may skip expensive work outside the area on predicted frames.
    pub fn in_prediction_area(&self, x: Fixed, y: Fixed) -> bool {
        if self.verified {
            return true;
        }
        self.context.prediction_area().map_or(true, |area| area.contains(x, y))
    }

    // =========================================================================
    // COPY & SERIALIZATION
    // =========================================================================

    /// Make this frame a deep copy of `other`. Players are shared copy-on-write.
    pub fn copy_from(&mut self, other: &Frame) -> Result<(), FrameError> {
        self.number = other.number;
        self.verified = other.verified;
        self.globals.clone_from(&other.globals);
        self.entities.clone_from(&other.entities);
        self.heap.copy_from(&other.heap)?;
        self.players = other.players.clone();
        self.inputs.clone_from(&other.inputs);
        self.assets.clone_from(&other.assets);
        self.user = other.user.clone_state();
        self.raised.clear();
        Ok(())
    }

    /// Walk the player block.
    pub fn serialize_players(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        self.players.serialize(stream)
    }

    /// Walk the state block: globals, entities, heap, input, user state.
    pub fn serialize_state(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        self.globals.serialize(stream)?;
        self.entities.serialize(stream)?;
        self.heap.serialize(stream)?;
        self.inputs.serialize(stream)?;
        self.user.serialize(stream)
    }

    /// Walk the dynamic asset block.
    pub fn serialize_assets(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        self.assets.serialize(stream)
    }
}
