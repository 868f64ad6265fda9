//! Deterministic Session
//!
//! Owns the frame buffers and drives them:
//!
//! ```text
//!   confirmed input ──► verified ──copy──► predicted ──► predicted ... target
//!                          │                  ▲
//!                          │                  └── local input + last known
//!                          │                      remote input
//!                          ├──► events confirm/cancel
//!                          ├──► checksum ──► peers / checksum file
//!                          └──► snapshots ──► checksum dumps / instant replay
//! ```
//!
//! Whenever new confirmed input advances the verified frame, the predicted
//! frame is discarded and resimulated from it (rollback). Predicted ticks
//! never run further than the rollback window past the verified frame.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::hash::checksum_hex;
use crate::session::communicator::Communicator;
use crate::session::game::Game;
use crate::session::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::sim::checksum::{ChecksumFile, ChecksumHistory, ChecksumVerdict, ChecksumVerifier};
use crate::sim::command::{CommandError, DeterministicCommand};
use crate::sim::config::{ConfigError, InstantReplaySettings};
use crate::sim::context::{FrameContext, FrameContextParams};
use crate::sim::dispatch::Callback;
use crate::sim::events::EventPipeline;
use crate::sim::frame::{Frame, FrameError, Tick};
use crate::sim::input::{PlayerJoin, TickInputs};
use crate::sim::players::PlayerRef;
use crate::sim::replay::{InputHistory, InstantReplay, ReplayError, ReplayFile, ReplayInputProvider};
use crate::sim::serializer::FrameSerializer;
use crate::sim::snapshot::{capacity_for, SnapshotError, SnapshotRequest, SnapshotSet};
use crate::sim::tick::simulate;

/// How the session gets confirmed input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameMode {
    /// Local input is confirmed immediately. No prediction.
    Local,
    /// Input is confirmed by a relay; local ticks are predicted.
    Multiplayer,
    /// Input comes from a recording.
    Replay,
}

impl fmt::Display for GameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameMode::Local => f.write_str("local"),
            GameMode::Multiplayer => f.write_str("multiplayer"),
            GameMode::Replay => f.write_str("replay"),
        }
    }
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Bad configuration.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    /// Frame failure (including checksum mismatch on restore).
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    /// Transport or message failure.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Snapshot failure.
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    /// Replay failure.
    #[error("Replay error: {0}")]
    Replay(#[from] ReplayError),
    /// Command could not be encoded.
    #[error("Command error: {0}")]
    Command(#[from] CommandError),
    /// Multiplayer session without a communicator.
    #[error("Multiplayer mode requires a communicator")]
    MissingCommunicator,
    /// Replay session without a replay file.
    #[error("Replay mode requires a replay file")]
    MissingReplay,
    /// Start requested twice.
    #[error("Session already started")]
    AlreadyStarted,
    /// Player is not controlled by this session.
    #[error("Player {0} is not a local player")]
    NotLocalPlayer(PlayerRef),
    /// Operation not available in this mode.
    #[error("{operation} is not supported in {mode} mode")]
    UnsupportedInMode {
        /// Operation name.
        operation: &'static str,
        /// Session mode.
        mode: GameMode,
    },
    /// Instant replay requested with nothing recorded.
    #[error("No instant replay snapshots recorded")]
    NoReplaySnapshots,
}

/// Source of local player input.
pub trait InputSource: Send {
    /// Encoded input of `player` for `tick`. Errors are logged and the
    /// player gets empty input.
    fn poll_input(&mut self, tick: Tick, player: PlayerRef) -> anyhow::Result<Vec<u8>>;
}

impl<F> InputSource for F
where
    F: FnMut(Tick, PlayerRef) -> anyhow::Result<Vec<u8>> + Send,
{
    fn poll_input(&mut self, tick: Tick, player: PlayerRef) -> anyhow::Result<Vec<u8>> {
        self(tick, player)
    }
}

/// Everything needed to build a session.
pub struct SessionParams {
    /// Mode.
    pub mode: GameMode,
    /// Frame context inputs.
    pub context: FrameContextParams,
    /// Callback host.
    pub game: Game,
    /// Players controlled here.
    pub local_players: Vec<PlayerJoin>,
    /// Local input.
    pub input_source: Option<Box<dyn InputSource>>,
    /// Transport (multiplayer).
    pub communicator: Option<Box<dyn Communicator>>,
    /// Recording to play (replay).
    pub replay: Option<ReplayFile>,
    /// Serialized frame to start from (local).
    pub start_frame: Option<Vec<u8>>,
}

impl SessionParams {
    /// Params for `mode` with no players, input or transport.
    pub fn new(mode: GameMode, context: FrameContextParams) -> Self {
        Self {
            mode,
            context,
            game: Game::new(),
            local_players: Vec::new(),
            input_source: None,
            communicator: None,
            replay: None,
            start_frame: None,
        }
    }

    /// Builder: add a local player.
    pub fn with_local_player(mut self, join: PlayerJoin) -> Self {
        self.local_players.push(join);
        self
    }

    /// Builder: set the input source.
    pub fn with_input<S: InputSource + 'static>(mut self, source: S) -> Self {
        self.input_source = Some(Box::new(source));
        self
    }

    /// Builder: set the transport.
    pub fn with_communicator<C: Communicator + 'static>(mut self, communicator: C) -> Self {
        self.communicator = Some(Box::new(communicator));
        self
    }
}

/// A running deterministic simulation.
pub struct DeterministicSession {
    mode: GameMode,
    context: Arc<FrameContext>,

    verified: Frame,
    predicted: Frame,
    predicted_previous: Frame,
    previous_update_predicted: Frame,

    serializer: FrameSerializer,
    pipeline: EventPipeline,
    game: Game,
    snapshots: SnapshotSet,
    checksums: ChecksumHistory,
    checksum_recording: Option<ChecksumFile>,
    checksum_verifier: Option<ChecksumVerifier>,
    checksum_error: Option<Tick>,

    history: InputHistory,
    recording: Option<Vec<u8>>,
    replay_inputs: Option<Box<dyn ReplayInputProvider + Send>>,
    replay_finished: bool,

    confirmed: BTreeMap<Tick, TickInputs>,
    local_inputs: BTreeMap<Tick, TickInputs>,
    last_confirmed: BTreeMap<PlayerRef, Vec<u8>>,
    local_players: Vec<PlayerJoin>,
    pending_joins: Vec<PlayerJoin>,
    pending_commands: BTreeMap<PlayerRef, Vec<u8>>,
    input_source: Option<Box<dyn InputSource>>,
    communicator: Option<Box<dyn Communicator>>,

    started: bool,
    paused: bool,
    disconnected: Option<String>,
    last_sent: Tick,
    accumulator: Duration,
}

impl fmt::Debug for DeterministicSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeterministicSession")
            .field("mode", &self.mode)
            .field("verified", &self.verified.number())
            .field("predicted", &self.predicted.number())
            .field("started", &self.started)
            .field("paused", &self.paused)
            .finish()
    }
}

impl DeterministicSession {
    /// Build the context and frames. Local and replay sessions start
    /// immediately; multiplayer sessions send their joins and wait for the
    /// relay's start message.
    pub fn new(params: SessionParams) -> Result<Self, SessionError> {
        let SessionParams {
            mode,
            context,
            game,
            local_players,
            input_source,
            communicator,
            replay,
            start_frame,
        } = params;

        if mode == GameMode::Multiplayer && communicator.is_none() {
            return Err(SessionError::MissingCommunicator);
        }
        if mode == GameMode::Replay && replay.is_none() {
            return Err(SessionError::MissingReplay);
        }

        let context = FrameContext::new(context)?;
        let session = *context.session();

        let mut snapshots = SnapshotSet::new();
        let mut checksum_capacity = 1;
        if mode == GameMode::Multiplayer && session.checksum_interval > 0 {
            let seconds = context.simulation().checksum_snapshot_history_length_seconds;
            let window = session.seconds_to_ticks(seconds).max(1);
            snapshots.set_checksum_request(Some(SnapshotRequest::new(session.checksum_interval, window)?));
            checksum_capacity = capacity_for(window, session.checksum_interval);
        }

        let mut this = Self {
            mode,
            verified: context.create_frame()?,
            predicted: context.create_frame()?,
            predicted_previous: context.create_frame()?,
            previous_update_predicted: context.create_frame()?,
            serializer: FrameSerializer::new(),
            pipeline: EventPipeline::new(session.rollback_window),
            game,
            snapshots,
            checksums: ChecksumHistory::new(checksum_capacity),
            checksum_recording: None,
            checksum_verifier: None,
            checksum_error: None,
            history: InputHistory::bounded(session.rollback_window as usize),
            recording: None,
            replay_inputs: None,
            replay_finished: false,
            confirmed: BTreeMap::new(),
            local_inputs: BTreeMap::new(),
            last_confirmed: BTreeMap::new(),
            pending_joins: Vec::new(),
            local_players,
            pending_commands: BTreeMap::new(),
            input_source,
            communicator,
            started: false,
            paused: false,
            disconnected: None,
            last_sent: -1,
            accumulator: Duration::ZERO,
            context,
        };
        this.verified.set_verified(true);
        info!(%mode, players = this.local_players.len(), "Session created");
        this.game.publish(Callback::GameInit, None);

        match mode {
            GameMode::Local => {
                this.pending_joins = this.local_players.clone();
                this.start(0, start_frame.as_deref())?;
            }
            GameMode::Multiplayer => {
                let joins = this.local_players.clone();
                for join in joins {
                    this.send_join(join)?;
                }
            }
            GameMode::Replay => {
                let replay = replay.ok_or(SessionError::MissingReplay)?;
                this.replay_inputs = Some(Box::new(replay.input_history()?));
                this.checksum_verifier = replay.checksums.clone().map(ChecksumVerifier::new);
                this.start(replay.initial_tick, replay.initial_frame.as_deref())?;
            }
        }
        Ok(this)
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Mode.
    pub fn mode(&self) -> GameMode {
        self.mode
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<FrameContext> {
        &self.context
    }

    /// Latest frame simulated from confirmed input only.
    pub fn verified_frame(&self) -> &Frame {
        &self.verified
    }

    /// Latest predicted frame (equal to the verified frame outside multiplayer).
    pub fn predicted_frame(&self) -> &Frame {
        &self.predicted
    }

    /// Predicted frame one tick before [`predicted_frame`](Self::predicted_frame).
    pub fn predicted_previous_frame(&self) -> &Frame {
        &self.predicted_previous
    }

    /// Predicted frame as it was before the last update.
    pub fn previous_update_predicted_frame(&self) -> &Frame {
        &self.previous_update_predicted
    }

    /// Callback host.
    pub fn game(&self) -> &Game {
        &self.game
    }

    /// Mutable callback host, for subscribing.
    pub fn game_mut(&mut self) -> &mut Game {
        &mut self.game
    }

    /// True once the first tick can be simulated.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// True while the relay paused time.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Started, not paused and not disconnected.
    pub fn is_running(&self) -> bool {
        self.started && !self.paused && self.disconnected.is_none()
    }

    /// Disconnect reason, once the transport closed.
    pub fn disconnect_reason(&self) -> Option<&str> {
        self.disconnected.as_deref()
    }

    /// Tick of the last checksum mismatch, clearing it.
    pub fn take_checksum_error(&mut self) -> Option<Tick> {
        self.checksum_error.take()
    }

    /// True once a replay ran out of input.
    pub fn is_simulation_finished(&self) -> bool {
        self.replay_finished
    }

    /// Unresolved unsynced events.
    pub fn pending_event_count(&self) -> usize {
        self.pipeline.pending_count()
    }

    /// Recorded verified input.
    pub fn input_history(&self) -> &InputHistory {
        &self.history
    }

    /// Checksum verification state, when verifying against a file.
    pub fn checksum_verifier(&self) -> Option<&ChecksumVerifier> {
        self.checksum_verifier.as_ref()
    }

    fn current_tick(&self) -> Tick {
        match self.mode {
            GameMode::Multiplayer => self.predicted.number().max(self.verified.number()),
            _ => self.verified.number(),
        }
    }

    fn prediction_limit(&self, target: Tick) -> Tick {
        target.min(self.verified.number() + self.context.session().rollback_window)
    }

    // =========================================================================
    // START / PLAYERS / COMMANDS
    // =========================================================================

    fn start(&mut self, tick: Tick, frame_data: Option<&[u8]>) -> Result<(), SessionError> {
        if self.started {
            return Err(SessionError::AlreadyStarted);
        }
        let tick = match frame_data {
            Some(data) => {
                let restored = self.serializer.deserialize(&mut self.verified, data)?;
                if restored + 1 != tick {
                    debug!(requested = tick, restored, "Starting after restored frame");
                }
                restored + 1
            }
            None => {
                self.verified.initialize_globals();
                self.context.systems().initialize(&mut self.verified);
                self.verified.set_number(tick - 1);
                tick
            }
        };
        self.verified.set_verified(true);
        self.reset_predictions()?;
        self.pipeline.reset_to(tick - 1);
        self.last_sent = tick - 1;
        self.started = true;

        match self.context.runtime().digest() {
            Ok(digest) => info!(tick, mode = %self.mode, config = %hex::encode(&digest[..8]), "Session started"),
            Err(e) => warn!(tick, "Session started, config digest unavailable: {}", e),
        }
        self.game.publish(Callback::GameStarted { tick }, Some(&self.verified));
        Ok(())
    }

    fn reset_predictions(&mut self) -> Result<(), FrameError> {
        self.predicted.copy_from(&self.verified)?;
        if self.mode == GameMode::Multiplayer {
            self.predicted.set_verified(false);
        }
        self.predicted_previous.copy_from(&self.predicted)?;
        self.previous_update_predicted.copy_from(&self.predicted)?;
        Ok(())
    }

    fn send_join(&mut self, join: PlayerJoin) -> Result<(), SessionError> {
        let digest = self.context.runtime().digest()?;
        let communicator = self.communicator.as_mut().ok_or(SessionError::MissingCommunicator)?;
        communicator.send(&ClientMessage::Join {
            player: join.player,
            actor_id: join.actor_id,
            data: join.data,
            config_digest: digest,
        })?;
        Ok(())
    }

    /// Add a locally controlled player. Local sessions apply the join on the
    /// next tick; multiplayer sessions ask the relay.
    pub fn add_player(&mut self, join: PlayerJoin) -> Result<(), SessionError> {
        match self.mode {
            GameMode::Local => self.pending_joins.push(join.clone()),
            GameMode::Multiplayer => self.send_join(join.clone())?,
            GameMode::Replay => {
                return Err(SessionError::UnsupportedInMode {
                    operation: "add_player",
                    mode: self.mode,
                })
            }
        }
        self.local_players.push(join);
        Ok(())
    }

    /// Queue a command for a local player's next input.
    pub fn send_command(&mut self, player: PlayerRef, command: &mut dyn DeterministicCommand) -> Result<(), SessionError> {
        if !self.local_players.iter().any(|j| j.player == player) {
            return Err(SessionError::NotLocalPlayer(player));
        }
        let bytes = self.context.commands().encode(command)?;
        if self.pending_commands.insert(player, bytes).is_some() {
            debug!(player, "Replacing unsent command");
        }
        Ok(())
    }

    // =========================================================================
    // UPDATE
    // =========================================================================

    /// Advance by wall-clock time.
    pub fn service(&mut self, dt: Duration) -> Result<(), SessionError> {
        if !self.is_running() {
            self.accumulator = Duration::ZERO;
            return self.update_to(self.current_tick());
        }
        let step = self.context.session().tick_duration();
        let max_ticks = self.context.session().rollback_window;
        self.accumulator += dt;
        let mut ticks = 0;
        while self.accumulator >= step {
            self.accumulator -= step;
            ticks += 1;
            if ticks == max_ticks {
                self.accumulator = Duration::ZERO;
                break;
            }
        }
        self.update_to(self.current_tick() + ticks)
    }

    /// Poll the network and simulate up to `target`.
    pub fn update_to(&mut self, target: Tick) -> Result<(), SessionError> {
        self.poll_network()?;
        if !self.is_running() {
            return Ok(());
        }
        match self.mode {
            GameMode::Local => self.advance_local(target),
            GameMode::Replay => self.advance_replay(target),
            GameMode::Multiplayer => {
                self.send_local_inputs(target)?;
                let advanced = self.advance_confirmed()?;
                self.predict(target, advanced)
            }
        }
    }

    fn poll_local_inputs(&mut self, tick: Tick) -> TickInputs {
        let mut inputs = TickInputs::new(tick);
        for join in &self.local_players {
            let player = join.player;
            let bytes = match self.input_source.as_mut() {
                Some(source) => source.poll_input(tick, player).unwrap_or_else(|e| {
                    error!(tick, player, "Input poll failed: {:#}", e);
                    Vec::new()
                }),
                None => Vec::new(),
            };
            inputs.inputs.insert(player, bytes);
            if let Some(command) = self.pending_commands.remove(&player) {
                inputs.commands.insert(player, command);
            }
        }
        inputs
    }

    fn advance_local(&mut self, target: Tick) -> Result<(), SessionError> {
        self.previous_update_predicted.copy_from(&self.predicted)?;
        let mut advanced = false;
        while self.verified.number() < target {
            let tick = self.verified.number() + 1;
            let mut inputs = self.poll_local_inputs(tick);
            inputs.joins = std::mem::take(&mut self.pending_joins);
            self.simulate_verified(inputs)?;
            advanced = true;
        }
        if advanced {
            self.predicted_previous.copy_from(&self.predicted)?;
            self.predicted.copy_from(&self.verified)?;
        }
        Ok(())
    }

    fn advance_replay(&mut self, target: Tick) -> Result<(), SessionError> {
        self.previous_update_predicted.copy_from(&self.predicted)?;
        let mut advanced = false;
        while self.verified.number() < target {
            let next = self.verified.number() + 1;
            let inputs = match self.replay_inputs.as_ref().and_then(|p| p.tick_inputs(next)) {
                Some(inputs) => inputs.clone(),
                None => {
                    if !self.replay_finished {
                        info!(tick = self.verified.number(), "Replay input exhausted");
                        self.replay_finished = true;
                    }
                    break;
                }
            };
            self.simulate_verified(inputs)?;
            advanced = true;
        }
        if advanced {
            self.predicted_previous.copy_from(&self.predicted)?;
            self.predicted.copy_from(&self.verified)?;
        }
        Ok(())
    }

    fn send_local_inputs(&mut self, target: Tick) -> Result<(), SessionError> {
        let limit = self.prediction_limit(target) + self.context.session().input_delay;
        while self.last_sent < limit {
            let tick = self.last_sent + 1;
            let inputs = self.poll_local_inputs(tick);
            if let Some(communicator) = self.communicator.as_mut() {
                for (&player, input) in &inputs.inputs {
                    let message = ClientMessage::Input {
                        tick,
                        player,
                        input: input.clone(),
                        command: inputs.commands.get(&player).cloned(),
                    };
                    match communicator.send(&message) {
                        Ok(()) => {}
                        Err(ProtocolError::QueueFull) => warn!(tick, player, "Send queue full, input dropped"),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            self.local_inputs.insert(tick, inputs);
            self.last_sent = tick;
        }
        Ok(())
    }

    fn advance_confirmed(&mut self) -> Result<bool, SessionError> {
        let mut advanced = false;
        while let Some(inputs) = self.confirmed.remove(&(self.verified.number() + 1)) {
            self.simulate_verified(inputs)?;
            advanced = true;
        }
        if advanced {
            let verified = self.verified.number();
            self.local_inputs = self.local_inputs.split_off(&(verified + 1));
        }
        Ok(advanced)
    }

    fn predicted_inputs(&self, tick: Tick) -> TickInputs {
        let mut inputs = self
            .local_inputs
            .get(&tick)
            .cloned()
            .unwrap_or_else(|| TickInputs::new(tick));
        for (&player, last) in &self.last_confirmed {
            inputs.inputs.entry(player).or_insert_with(|| last.clone());
        }
        inputs
    }

    fn predict(&mut self, target: Tick, advanced: bool) -> Result<(), SessionError> {
        self.previous_update_predicted.copy_from(&self.predicted)?;
        let verified = self.verified.number();
        let target = if self.context.session().lockstep {
            verified
        } else {
            self.prediction_limit(target)
        };

        if advanced || self.predicted.number() < verified {
            self.predicted.copy_from(&self.verified)?;
            self.predicted.set_verified(false);
            self.predicted_previous.copy_from(&self.predicted)?;
        }

        while self.predicted.number() < target {
            let tick = self.predicted.number() + 1;
            let inputs = self.predicted_inputs(tick);
            if tick == target {
                self.predicted_previous.copy_from(&self.predicted)?;
            }
            let result = simulate(&mut self.predicted, &inputs)?;
            let actions = self.pipeline.on_simulated(tick, false, result.events);
            self.game.apply_event_actions(self.context.event_types(), actions);
            self.game.publish(
                Callback::SimulateFinished { tick, verified: false },
                Some(&self.predicted),
            );
        }
        Ok(())
    }

    fn simulate_verified(&mut self, inputs: TickInputs) -> Result<(), SessionError> {
        let tick = inputs.tick;
        let result = simulate(&mut self.verified, &inputs)?;

        for player in &inputs.leaves {
            self.last_confirmed.remove(player);
        }
        for (&player, bytes) in &inputs.inputs {
            self.last_confirmed.insert(player, bytes.clone());
            self.game.publish(Callback::InputConfirmed { tick, player }, None);
        }

        let mut actions = self.pipeline.on_simulated(tick, true, result.events);
        actions.extend(self.pipeline.on_verified(tick));
        self.game.apply_event_actions(self.context.event_types(), actions);
        self.game.publish(
            Callback::SimulateFinished { tick, verified: true },
            Some(&self.verified),
        );

        self.snapshots.record(&mut self.verified, &mut self.serializer)?;
        self.record_checksum(tick)?;

        if self.history.last_tick().is_some_and(|last| last + 1 != tick) {
            self.history.clear();
        }
        self.history.record(inputs)?;
        Ok(())
    }

    fn record_checksum(&mut self, tick: Tick) -> Result<(), SessionError> {
        let interval = self.context.session().checksum_interval;
        if interval <= 0 || tick.rem_euclid(interval) != 0 {
            return Ok(());
        }
        let checksum = self.serializer.checksum(&mut self.verified)?;
        debug!(tick, checksum = %checksum_hex(checksum), "Checksum computed");
        self.game
            .publish(Callback::ChecksumComputed { tick, checksum }, Some(&self.verified));

        if let Some(file) = self.checksum_recording.as_mut() {
            file.record(tick, checksum);
        }
        if let Some(verifier) = self.checksum_verifier.as_mut() {
            let verdict = verifier.verify(tick, checksum);
            self.handle_verdict(tick, verdict);
        }
        if self.mode == GameMode::Multiplayer {
            if let Some(communicator) = self.communicator.as_mut() {
                if let Err(e) = communicator.send(&ClientMessage::Checksum { tick, checksum }) {
                    warn!(tick, "Failed to send checksum: {}", e);
                }
            }
            let verdict = self.checksums.record_local(tick, checksum);
            self.handle_verdict(tick, verdict);
        }
        Ok(())
    }

    fn handle_verdict(&mut self, tick: Tick, verdict: ChecksumVerdict) {
        let ChecksumVerdict::Mismatch { local, remote } = verdict else {
            return;
        };
        let dump = self.snapshots.checksum_snapshot(tick).map(|s| Arc::clone(&s.data));
        error!(
            tick,
            local = %checksum_hex(local),
            remote = %checksum_hex(remote),
            dump = dump.is_some(),
            "Checksum mismatch"
        );
        self.checksum_error = Some(tick);
        self.game.publish(
            Callback::ChecksumError {
                tick,
                local,
                remote,
                dump,
            },
            None,
        );
    }

    // =========================================================================
    // NETWORK
    // =========================================================================

    fn poll_network(&mut self) -> Result<(), SessionError> {
        let Some(communicator) = self.communicator.as_mut() else {
            return Ok(());
        };
        let mut received = Vec::new();
        loop {
            match communicator.try_receive() {
                Ok(Some(message)) => received.push(message),
                Ok(None) => break,
                Err(e) => warn!("Dropping malformed message: {}", e),
            }
        }
        let lost = !communicator.is_connected();

        for message in received {
            self.handle_message(message)?;
        }
        if lost && self.disconnected.is_none() {
            self.on_disconnect("transport closed".into());
        }
        Ok(())
    }

    fn handle_message(&mut self, message: ServerMessage) -> Result<(), SessionError> {
        match message {
            ServerMessage::Start { tick, frame_data } => {
                if self.started {
                    warn!(tick, "Ignoring duplicate start");
                    return Ok(());
                }
                self.start(tick, frame_data.as_deref())?;
            }
            ServerMessage::Inputs(inputs) => {
                if inputs.tick > self.verified.number() {
                    self.confirmed.insert(inputs.tick, inputs);
                }
            }
            ServerMessage::Checksum { tick, checksum } => {
                let verdict = self.checksums.record_remote(tick, checksum);
                self.handle_verdict(tick, verdict);
            }
            ServerMessage::Resync { frame_data, .. } => self.resync(&frame_data)?,
            ServerMessage::Pause => {
                info!("Session paused");
                self.paused = true;
            }
            ServerMessage::Resume => {
                info!("Session resumed");
                self.paused = false;
            }
            ServerMessage::Disconnect { reason } => self.on_disconnect(reason),
        }
        Ok(())
    }

    fn on_disconnect(&mut self, reason: String) {
        warn!(%reason, "Disconnected");
        self.game.publish(
            Callback::PluginDisconnect {
                reason: reason.clone(),
            },
            None,
        );
        self.disconnected = Some(reason);
    }

    /// Replace the verified frame with server data. Pending events are
    /// canceled and snapshot and checksum history is dropped.
    pub fn resync(&mut self, frame_data: &[u8]) -> Result<(), SessionError> {
        let tick = self.serializer.deserialize(&mut self.verified, frame_data)?;
        self.verified.set_verified(true);

        let actions = self.pipeline.cancel_all();
        self.game.apply_event_actions(self.context.event_types(), actions);
        self.pipeline.reset_to(tick);

        self.snapshots.clear();
        self.checksums.clear();
        self.history.clear();
        self.confirmed.retain(|t, _| *t > tick);
        self.local_inputs.retain(|t, _| *t > tick);
        self.last_sent = self.last_sent.max(tick);
        self.reset_predictions()?;
        self.started = true;

        warn!(tick, "Resynced from server frame");
        self.game.publish(Callback::GameResynced { tick }, Some(&self.verified));
        Ok(())
    }

    // =========================================================================
    // RECORDING / REPLAY
    // =========================================================================

    /// Keep verified snapshots so [`start_instant_replay`](Self::start_instant_replay)
    /// can play back recent ticks.
    pub fn start_recording_instant_replay_snapshots(&mut self, settings: InstantReplaySettings) -> Result<(), SessionError> {
        let window = self.context.session().seconds_to_ticks(settings.length_seconds);
        let request = SnapshotRequest::new(settings.snapshot_interval, window)?;
        self.snapshots.set_replay_request(Some(request));
        if self.recording.is_none() {
            let keep = window as usize + settings.snapshot_interval as usize + 1;
            self.history = InputHistory::bounded(keep.max(self.context.session().rollback_window as usize));
        }
        info!(interval = request.interval, window = request.window, "Recording instant replay snapshots");
        Ok(())
    }

    /// Stop keeping replay snapshots.
    pub fn stop_recording_instant_replay_snapshots(&mut self) {
        self.snapshots.set_replay_request(None);
    }

    /// Play back from the oldest replay snapshot to the verified tick.
    pub fn start_instant_replay(&self, looping: bool) -> Result<InstantReplay, SessionError> {
        let (oldest, _) = self.snapshots.replay_range().ok_or(SessionError::NoReplaySnapshots)?;
        let end = self.verified.number();
        let inputs = self.history.range(oldest + 1, end);
        Ok(InstantReplay::new(
            &self.context,
            self.snapshots.replay_snapshots(),
            inputs,
            oldest,
            end,
            looping,
        )?)
    }

    /// Record every verified input and checksum from now on.
    pub fn start_recording_replay(&mut self) -> Result<(), SessionError> {
        let frame = self.serializer.serialize(&mut self.verified)?;
        self.recording = Some(frame);
        self.history = InputHistory::unbounded();
        self.checksum_recording = Some(ChecksumFile::new());
        info!(tick = self.verified.number(), "Recording replay");
        Ok(())
    }

    /// The recording so far, if recording.
    pub fn replay_file(&self) -> Option<ReplayFile> {
        let initial_frame = self.recording.clone()?;
        Some(ReplayFile::from_history(
            *self.context.session(),
            self.context.runtime().clone(),
            Some(initial_frame),
            &self.history,
            self.checksum_recording.clone(),
        ))
    }

    /// Compare every computed checksum with `file`.
    pub fn start_verifying_checksums(&mut self, file: ChecksumFile) {
        self.checksum_verifier = Some(ChecksumVerifier::new(file));
    }

    /// Cancel pending events and tear down. Returns the transport so the
    /// caller can release it last.
    pub fn destroy(mut self) -> Option<Box<dyn Communicator>> {
        let actions = self.pipeline.cancel_all();
        self.game.apply_event_actions(self.context.event_types(), actions);
        self.game.publish(Callback::GameDestroyed, None);
        info!(tick = self.verified.number(), "Session destroyed");
        self.communicator.take()
    }
}
