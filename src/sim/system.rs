//! System Hierarchy
//!
//! Systems are stateless behaviors arranged in a tree. Each gets a runtime
//! index at session start (depth-first, self before children). The enabled
//! flag of a system lives in the frame ([`SystemBits`](crate::sim::globals::SystemBits)),
//! so one system object serves every frame and enabling is rolled back like
//! any other state.
//!
//! A system is enabled in hierarchy when its own bit and every ancestor's bit
//! are set. `on_enabled`/`on_disabled` fire only when that value flips.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::sim::assets::AssetGuid;
use crate::sim::config::ConfigError;
use crate::sim::frame::Frame;
use crate::sim::players::PlayerRef;
use crate::sim::scheduler::{TaskContext, TaskHandle};

/// Runtime index of a system.
pub type SystemIndex = usize;

/// Notifications dispatched to subscribed systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// A player joined.
    PlayerAdded {
        /// Joined player.
        player: PlayerRef,
    },
    /// A player left.
    PlayerRemoved {
        /// Departed player.
        player: PlayerRef,
    },
    /// The map changed.
    MapChanged {
        /// Map before the change.
        previous: AssetGuid,
    },
}

/// Signal discriminant, used to declare subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SignalKind {
    /// [`Signal::PlayerAdded`].
    PlayerAdded,
    /// [`Signal::PlayerRemoved`].
    PlayerRemoved,
    /// [`Signal::MapChanged`].
    MapChanged,
}

impl Signal {
    /// Discriminant.
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::PlayerAdded { .. } => SignalKind::PlayerAdded,
            Signal::PlayerRemoved { .. } => SignalKind::PlayerRemoved,
            Signal::MapChanged { .. } => SignalKind::MapChanged,
        }
    }
}

/// A unit of simulation logic.
///
/// Errors returned from any hook are logged and the tick continues without
/// that system's contribution.
pub trait System: Send + Sync + 'static {
    /// Name used in logs, profiles and systems configs.
    fn name(&self) -> &str;

    /// Initial enabled bit.
    fn start_enabled(&self) -> bool {
        true
    }

    /// Called once per session on the initial frame.
    fn on_init(&self, _frame: &mut Frame) -> anyhow::Result<()> {
        Ok(())
    }

    /// Hierarchy state flipped to enabled.
    fn on_enabled(&self, _frame: &mut Frame) -> anyhow::Result<()> {
        Ok(())
    }

    /// Hierarchy state flipped to disabled.
    fn on_disabled(&self, _frame: &mut Frame) -> anyhow::Result<()> {
        Ok(())
    }

    /// Per-tick work for the default main-thread schedule.
    fn update(&self, _frame: &mut Frame) -> anyhow::Result<()> {
        Ok(())
    }

    /// Contribute tasks for this tick. The returned handle marks the end of
    /// this system's work; the next system runs after it even if it failed.
    fn schedule<'a>(
        &'a self,
        _frame: &Frame,
        tasks: &mut TaskContext<'a>,
        after: TaskHandle,
    ) -> anyhow::Result<TaskHandle> {
        Ok(tasks.add_main_thread(self.name(), after, move |frame| self.update(frame)))
    }

    /// Signals this system wants.
    fn signals(&self) -> &[SignalKind] {
        &[]
    }

    /// Handle a subscribed signal.
    fn on_signal(&self, _frame: &mut Frame, _signal: &Signal) -> anyhow::Result<()> {
        Ok(())
    }
}

// =============================================================================
// SETUP
// =============================================================================

/// A system plus its children, before indices are assigned.
pub struct SystemDescriptor {
    system: Box<dyn System>,
    start_disabled: bool,
    children: Vec<SystemDescriptor>,
}

impl fmt::Debug for SystemDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemDescriptor")
            .field("name", &self.system.name())
            .field("start_disabled", &self.start_disabled)
            .field("children", &self.children)
            .finish()
    }
}

impl SystemDescriptor {
    /// Wrap a system.
    pub fn new(system: impl System) -> Self {
        Self::boxed(Box::new(system))
    }

    /// Wrap a boxed system.
    pub fn boxed(system: Box<dyn System>) -> Self {
        Self {
            system,
            start_disabled: false,
            children: Vec::new(),
        }
    }

    /// Add a child.
    pub fn with_child(mut self, child: SystemDescriptor) -> Self {
        self.children.push(child);
        self
    }

    /// Start with the enabled bit cleared.
    pub fn start_disabled(mut self) -> Self {
        self.start_disabled = true;
        self
    }
}

/// Root systems in registration order.
#[derive(Debug, Default)]
pub struct SystemSetup {
    roots: Vec<SystemDescriptor>,
}

impl SystemSetup {
    /// Empty setup.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: append a root.
    pub fn with(mut self, root: SystemDescriptor) -> Self {
        self.roots.push(root);
        self
    }

    /// Append a root.
    pub fn push(&mut self, root: SystemDescriptor) {
        self.roots.push(root);
    }

    /// True if no systems were added.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// One entry of a systems config asset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemEntry {
    /// Registered system name.
    pub system: String,
    /// Start with the enabled bit cleared.
    pub start_disabled: bool,
    /// Child entries.
    pub children: Vec<SystemEntry>,
}

/// Systems config asset: the tree to build at session start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemsConfig {
    /// Root entries.
    pub entries: Vec<SystemEntry>,
}

type SystemCtor = Box<dyn Fn() -> Box<dyn System> + Send + Sync>;

/// Name → constructor registry for resolving a [`SystemsConfig`].
#[derive(Default)]
pub struct SystemFactory {
    ctors: BTreeMap<String, SystemCtor>,
}

impl fmt::Debug for SystemFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemFactory")
            .field("systems", &self.ctors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SystemFactory {
    /// Empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor.
    pub fn register<F>(&mut self, name: impl Into<String>, ctor: F) -> &mut Self
    where
        F: Fn() -> Box<dyn System> + Send + Sync + 'static,
    {
        self.ctors.insert(name.into(), Box::new(ctor));
        self
    }

    /// Register a `Default`-constructible system.
    pub fn register_default<S: System + Default>(&mut self, name: impl Into<String>) -> &mut Self {
        self.register(name, || Box::new(S::default()))
    }

    /// Build the setup a config describes.
    pub fn resolve(&self, config: &SystemsConfig) -> Result<SystemSetup, ConfigError> {
        let mut setup = SystemSetup::new();
        for entry in &config.entries {
            setup.push(self.resolve_entry(entry)?);
        }
        Ok(setup)
    }

    fn resolve_entry(&self, entry: &SystemEntry) -> Result<SystemDescriptor, ConfigError> {
        let ctor = self
            .ctors
            .get(&entry.system)
            .ok_or_else(|| ConfigError::UnknownSystem(entry.system.clone()))?;
        let mut descriptor = SystemDescriptor::boxed(ctor());
        descriptor.start_disabled = entry.start_disabled;
        for child in &entry.children {
            descriptor.children.push(self.resolve_entry(child)?);
        }
        Ok(descriptor)
    }
}

// =============================================================================
// TREE
// =============================================================================

struct Node {
    system: Box<dyn System>,
    parent: Option<SystemIndex>,
    children: Vec<SystemIndex>,
    start_enabled: bool,
}

/// Indexed system tree, immutable after construction.
pub struct SystemTree {
    nodes: Vec<Node>,
    signals: BTreeMap<SignalKind, Vec<SystemIndex>>,
}

impl fmt::Debug for SystemTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.nodes.iter().map(|n| n.system.name()))
            .finish()
    }
}

impl SystemTree {
    /// Assign indices depth-first and build the signal lists.
    pub fn new(setup: SystemSetup) -> Self {
        let mut nodes = Vec::new();
        for root in setup.roots {
            Self::flatten(root, None, &mut nodes);
        }

        let mut signals: BTreeMap<SignalKind, Vec<SystemIndex>> = BTreeMap::new();
        for (index, node) in nodes.iter().enumerate() {
            for kind in node.system.signals() {
                let list = signals.entry(*kind).or_default();
                if !list.contains(&index) {
                    list.push(index);
                }
            }
        }

        Self { nodes, signals }
    }

    fn flatten(descriptor: SystemDescriptor, parent: Option<SystemIndex>, nodes: &mut Vec<Node>) {
        let index = nodes.len();
        let start_enabled = descriptor.system.start_enabled() && !descriptor.start_disabled;
        nodes.push(Node {
            system: descriptor.system,
            parent,
            children: Vec::new(),
            start_enabled,
        });
        if let Some(parent) = parent {
            nodes[parent].children.push(index);
        }
        for child in descriptor.children {
            Self::flatten(child, Some(index), nodes);
        }
    }

    /// System count.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if there are no systems.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// System name by index.
    pub fn name(&self, index: SystemIndex) -> Option<&str> {
        self.nodes.get(index).map(|n| n.system.name())
    }

    /// First system with the given name.
    pub fn index_of(&self, name: &str) -> Option<SystemIndex> {
        self.nodes.iter().position(|n| n.system.name() == name)
    }

    /// Parent index.
    pub fn parent(&self, index: SystemIndex) -> Option<SystemIndex> {
        self.nodes.get(index).and_then(|n| n.parent)
    }

    /// Subscribers of a signal, in index order.
    pub fn subscribers(&self, kind: SignalKind) -> &[SystemIndex] {
        self.signals.get(&kind).map_or(&[], Vec::as_slice)
    }

    /// Set start bits, then run `on_init` for every system and `on_enabled`
    /// for every system enabled in hierarchy.
    pub fn initialize(&self, frame: &mut Frame) {
        for (index, node) in self.nodes.iter().enumerate() {
            frame.globals_mut().systems.set(index, node.start_enabled);
        }
        for index in 0..self.nodes.len() {
            self.call(index, "on_init", |system| system.on_init(frame));
        }
        for index in 0..self.nodes.len() {
            if self.is_enabled_in_hierarchy(frame, index) {
                self.call(index, "on_enabled", |system| system.on_enabled(frame));
            }
        }
    }

    /// Own bit and every ancestor's bit set.
    pub fn is_enabled_in_hierarchy(&self, frame: &Frame, index: SystemIndex) -> bool {
        let bits = &frame.globals().systems;
        let mut current = Some(index);
        while let Some(i) = current {
            if i >= self.nodes.len() || !bits.get(i) {
                return false;
            }
            current = self.nodes[i].parent;
        }
        true
    }

    /// Set the bit. Fires `on_enabled` on the system and its enabled
    /// descendants if the hierarchy state flipped.
    pub fn enable(&self, frame: &mut Frame, index: SystemIndex) {
        if index >= self.nodes.len() {
            warn!(index, "enable: no such system");
            return;
        }
        if frame.globals().systems.get(index) {
            return;
        }
        frame.globals_mut().systems.set(index, true);
        if self.is_enabled_in_hierarchy(frame, index) {
            self.fire_enabled(frame, index);
        }
    }

    /// Clear the bit. Fires `on_disabled` on enabled descendants, then the
    /// system, if the hierarchy state flipped.
    pub fn disable(&self, frame: &mut Frame, index: SystemIndex) {
        if index >= self.nodes.len() {
            warn!(index, "disable: no such system");
            return;
        }
        if !frame.globals().systems.get(index) {
            return;
        }
        let was_enabled = self.is_enabled_in_hierarchy(frame, index);
        frame.globals_mut().systems.set(index, false);
        if was_enabled {
            self.fire_disabled(frame, index);
        }
    }

    fn fire_enabled(&self, frame: &mut Frame, index: SystemIndex) {
        self.call(index, "on_enabled", |system| system.on_enabled(frame));
        for &child in &self.nodes[index].children {
            if frame.globals().systems.get(child) {
                self.fire_enabled(frame, child);
            }
        }
    }

    fn fire_disabled(&self, frame: &mut Frame, index: SystemIndex) {
        for &child in &self.nodes[index].children {
            if frame.globals().systems.get(child) {
                self.fire_disabled(frame, child);
            }
        }
        self.call(index, "on_disabled", |system| system.on_disabled(frame));
    }

    /// Deliver a signal to subscribed systems that are enabled in hierarchy.
    pub fn dispatch_signal(&self, frame: &mut Frame, signal: &Signal) {
        for &index in self.subscribers(signal.kind()) {
            if self.is_enabled_in_hierarchy(frame, index) {
                self.call(index, "on_signal", |system| system.on_signal(frame, signal));
            }
        }
    }

    /// Let every system enabled in hierarchy add its tasks, chained in index
    /// order after `begin`. A system whose `schedule` fails contributes
    /// nothing. Each system's tasks end in a settle barrier, so a task that
    /// fails during the tick does not skip the systems after it.
    pub fn schedule_all<'a>(&'a self, frame: &Frame, tasks: &mut TaskContext<'a>, begin: TaskHandle) -> TaskHandle {
        let mut last = begin;
        for (index, node) in self.nodes.iter().enumerate() {
            if !self.is_enabled_in_hierarchy(frame, index) {
                continue;
            }
            let mark = tasks.len();
            match node.system.schedule(frame, tasks, last) {
                Ok(handle) => last = tasks.settle(node.system.name(), handle),
                Err(e) => {
                    tasks.truncate(mark);
                    error!(system = node.system.name(), index, "Scheduling failed: {:#}", e);
                }
            }
        }
        last
    }

    fn call<F>(&self, index: SystemIndex, hook: &'static str, f: F)
    where
        F: FnOnce(&dyn System) -> anyhow::Result<()>,
    {
        let system = self.nodes[index].system.as_ref();
        debug!(system = system.name(), index, hook, "System hook");
        if let Err(e) = f(system) {
            error!(system = system.name(), index, hook, "System hook failed: {:#}", e);
        }
    }
}
