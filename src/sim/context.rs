//! Frame Context
//!
//! Session-wide, read-mostly state shared by every frame through an `Arc`:
//! configuration, asset access, the command and asset serializers, the
//! system tree, event type table, worker pool and profiler.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::fixed::Fixed;
use crate::core::heap::HeapConfig;
use crate::sim::assets::{AssetSerializer, InMemoryResources, ResourceManager};
use crate::sim::command::CommandFactory;
use crate::sim::config::{ConfigError, RuntimeConfig, SessionConfig, SimulationConfig};
use crate::sim::events::EventTypeRegistry;
use crate::sim::frame::{DefaultLayout, Frame, FrameError, StateLayout};
use crate::sim::scheduler::Profiler;
use crate::sim::system::{SystemFactory, SystemSetup, SystemTree, SystemsConfig};

/// Circle outside which predicted frames may skip work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionArea {
    /// Center X (Q16.16).
    pub center_x: Fixed,
    /// Center Y (Q16.16).
    pub center_y: Fixed,
    /// Radius (Q16.16).
    pub radius: Fixed,
}

impl PredictionArea {
    /// True if the point is inside or on the circle.
    pub fn contains(&self, x: Fixed, y: Fixed) -> bool {
        // Compare squared distances at Q32.32 so large offsets cannot wrap.
        let dx = i128::from(x) - i128::from(self.center_x);
        let dy = i128::from(y) - i128::from(self.center_y);
        let radius = i128::from(self.radius);
        dx * dx + dy * dy <= radius * radius
    }
}

/// Everything needed to build a [`FrameContext`].
pub struct FrameContextParams {
    /// Session config.
    pub session: SessionConfig,
    /// Simulation config.
    pub simulation: SimulationConfig,
    /// Runtime config.
    pub runtime: RuntimeConfig,
    /// Asset service.
    pub resources: Arc<dyn ResourceManager>,
    /// Command registry.
    pub commands: CommandFactory,
    /// Systems to run.
    pub systems: SystemSetup,
    /// Per-project state layout.
    pub layout: Arc<dyn StateLayout>,
}

impl FrameContextParams {
    /// Params with no systems, no commands and the default layout.
    pub fn new(session: SessionConfig, simulation: SimulationConfig, runtime: RuntimeConfig) -> Self {
        Self {
            session,
            simulation,
            runtime,
            resources: Arc::new(InMemoryResources::new()),
            commands: CommandFactory::new(),
            systems: SystemSetup::new(),
            layout: Arc::new(DefaultLayout),
        }
    }

    /// Params whose simulation config, and systems when the runtime config
    /// names a systems asset, are loaded from `resources`.
    pub fn from_assets(
        session: SessionConfig,
        runtime: RuntimeConfig,
        resources: Arc<dyn ResourceManager>,
        factory: Option<&SystemFactory>,
    ) -> Result<Self, ConfigError> {
        resources.load_all_assets().map_err(|e| ConfigError::InvalidAsset {
            guid: runtime.simulation_config,
            reason: e.to_string(),
        })?;

        let serializer = AssetSerializer;
        let bytes = resources
            .get_asset(runtime.simulation_config)
            .ok_or(ConfigError::MissingSimulationConfig(runtime.simulation_config))?;
        let simulation: SimulationConfig =
            serializer
                .bytes_to_object(&bytes)
                .map_err(|e| ConfigError::InvalidAsset {
                    guid: runtime.simulation_config,
                    reason: e.to_string(),
                })?;

        let systems = match runtime.systems_config {
            None => SystemSetup::new(),
            Some(guid) => {
                let factory = factory.ok_or(ConfigError::MissingSystemFactory(guid))?;
                let bytes = resources.get_asset(guid).ok_or_else(|| ConfigError::InvalidAsset {
                    guid,
                    reason: "not found".into(),
                })?;
                let config: SystemsConfig = serializer
                    .bytes_to_object(&bytes)
                    .map_err(|e| ConfigError::InvalidAsset {
                        guid,
                        reason: e.to_string(),
                    })?;
                factory.resolve(&config)?
            }
        };

        Ok(Self {
            session,
            simulation,
            runtime,
            resources,
            commands: CommandFactory::new(),
            systems,
            layout: Arc::new(DefaultLayout),
        })
    }
}

/// Shared per-session context.
pub struct FrameContext {
    session: SessionConfig,
    simulation: SimulationConfig,
    runtime: RuntimeConfig,
    resources: Arc<dyn ResourceManager>,
    asset_serializer: AssetSerializer,
    commands: CommandFactory,
    systems: SystemTree,
    layout: Arc<dyn StateLayout>,
    event_types: EventTypeRegistry,
    pool: ThreadPool,
    profiler: Profiler,
    prediction_area: Mutex<Option<PredictionArea>>,
    heap: HeapConfig,
}

impl fmt::Debug for FrameContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameContext")
            .field("session", &self.session)
            .field("runtime", &self.runtime)
            .field("systems", &self.systems)
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl FrameContext {
    /// Validate configuration and build the context.
    pub fn new(params: FrameContextParams) -> Result<Arc<Self>, ConfigError> {
        params.session.validate()?;
        params.simulation.validate()?;

        let threads = params.simulation.worker_threads();
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("lockstep-worker-{i}"))
            .build()
            .map_err(|e| ConfigError::ThreadPool(e.to_string()))?;

        let mut event_types = EventTypeRegistry::new();
        params.layout.register_events(&mut event_types);

        let systems = SystemTree::new(params.systems);
        info!(
            players = params.session.player_count,
            fps = params.session.update_fps,
            systems = systems.len(),
            threads,
            "Frame context created"
        );

        Ok(Arc::new(Self {
            heap: params.simulation.heap_config(),
            session: params.session,
            simulation: params.simulation,
            runtime: params.runtime,
            resources: params.resources,
            asset_serializer: AssetSerializer,
            commands: params.commands,
            systems,
            layout: params.layout,
            event_types,
            pool,
            profiler: Profiler::default(),
            prediction_area: Mutex::new(None),
        }))
    }

    /// Allocate a frame bound to this context.
    pub fn create_frame(self: &Arc<Self>) -> Result<Frame, FrameError> {
        Frame::new(Arc::clone(self))
    }

    /// Session config.
    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    /// Simulation config.
    pub fn simulation(&self) -> &SimulationConfig {
        &self.simulation
    }

    /// Runtime config.
    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Asset service.
    pub fn resources(&self) -> &Arc<dyn ResourceManager> {
        &self.resources
    }

    /// Asset serializer.
    pub fn asset_serializer(&self) -> &AssetSerializer {
        &self.asset_serializer
    }

    /// Command registry.
    pub fn commands(&self) -> &CommandFactory {
        &self.commands
    }

    /// System tree.
    pub fn systems(&self) -> &SystemTree {
        &self.systems
    }

    /// State layout.
    pub fn layout(&self) -> &Arc<dyn StateLayout> {
        &self.layout
    }

    /// Event type table.
    pub fn event_types(&self) -> &EventTypeRegistry {
        &self.event_types
    }

    /// Worker pool.
    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Task profiler.
    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Heap geometry of every frame.
    pub fn heap_config(&self) -> HeapConfig {
        self.heap
    }

    /// Current prediction area.
    pub fn prediction_area(&self) -> Option<PredictionArea> {
        *self.prediction_area.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set or clear the prediction area. Only affects predicted frames.
    pub fn set_prediction_area(&self, area: Option<PredictionArea>) {
        *self.prediction_area.lock().unwrap_or_else(PoisonError::into_inner) = area;
    }
}
