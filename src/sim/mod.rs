//! Deterministic simulation.
//!
//! Everything a tick touches lives here: the [`Frame`] and its shared
//! [`FrameContext`], the system tree and task scheduler that mutate it, the
//! serializer that checksums it, and the bookkeeping that follows a verified
//! tick (events, snapshots, checksums, replay input).

pub mod assets;
pub mod checksum;
pub mod command;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod entity;
pub mod events;
pub mod frame;
pub mod globals;
pub mod input;
pub mod players;
pub mod replay;
pub mod scheduler;
pub mod serializer;
pub mod snapshot;
pub mod system;
pub mod tick;

pub use assets::{AssetGuid, AssetError, AssetSerializer, InMemoryResources, ResourceManager};
pub use checksum::{ChecksumFile, ChecksumHistory, ChecksumVerdict, ChecksumVerifier};
pub use command::{CommandFactory, DeterministicCommand};
pub use config::{ConfigError, InstantReplaySettings, RuntimeConfig, SessionConfig, SimulationConfig};
pub use context::{FrameContext, FrameContextParams, PredictionArea};
pub use dispatch::{Callback, CallbackDispatcher, CallbackKind, EventDispatcher};
pub use entity::{Component, EntityRef};
pub use events::{Event, EventKey, EventPipeline, EventTypeRegistry, RaisedEvent};
pub use frame::{Frame, FrameError, StateLayout, Tick, UserState};
pub use input::{InputDecode, PlayerJoin, TickInputs};
pub use players::PlayerRef;
pub use replay::{InputHistory, InstantReplay, ReplayError, ReplayFile, ReplayInputProvider};
pub use scheduler::{TaskContext, TaskHandle};
pub use serializer::FrameSerializer;
pub use snapshot::{SnapshotError, SnapshotLookup, SnapshotRequest, SnapshotSet};
pub use system::{Signal, SignalKind, System, SystemDescriptor, SystemFactory, SystemSetup};
pub use tick::{simulate, TickResult};
