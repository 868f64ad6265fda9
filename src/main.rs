//! Lockstep Engine Demo
//!
//! Runs a small drifting-particles game three ways: a local session that
//! records a replay, the replay played back with checksum verification, and
//! two peers predicting against an in-process relay.

use std::time::Duration;

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use lockstep::{
    core::{
        fixed::{fixed_mul, Fixed, FIXED_ONE},
        hash::{checksum_hex, ChecksumAccumulator},
        heap::HeapTrackingMode,
    },
    session::{
        CancelToken, DeterministicSession, GameMode, LocalRelay, RunnerArguments, SessionParams, SessionRunner,
        ShutdownCause,
    },
    sim::{
        config::{RuntimeConfig, SessionConfig, SimulationConfig},
        entity::ComponentId,
        events::EventTypeId,
        input::InputDecode,
        system::{Signal, SignalKind},
        CallbackKind, Component, Event, Frame, FrameContextParams, FrameSerializer, PlayerJoin, PlayerRef, System,
        SystemDescriptor, SystemSetup, Tick,
    },
    VERSION,
};

const DEMO_TICKS: Tick = 600;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Lockstep Engine v{}", VERSION);

    let replay = demo_local().await?;
    demo_replay(replay)?;
    demo_multiplayer()?;
    Ok(())
}

// =============================================================================
// DEMO GAME
// =============================================================================

/// Particle owned by a player.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Particle {
    owner: PlayerRef,
    x: Fixed,
    y: Fixed,
}

impl Component for Particle {
    const ID: ComponentId = 1;
    const SIZE: usize = 12;

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.owner.to_le_bytes());
        out[4..8].copy_from_slice(&self.x.to_le_bytes());
        out[8..12].copy_from_slice(&self.y.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        let read = |range: std::ops::Range<usize>| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[range]);
            i32::from_le_bytes(raw)
        };
        Particle {
            owner: read(0..4),
            x: read(4..8),
            y: read(8..12),
        }
    }
}

/// Joystick direction, one signed byte per axis.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Steer {
    dx: i8,
    dy: i8,
}

impl InputDecode for Steer {
    fn decode(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [dx, dy] => Some(Steer {
                dx: *dx as i8,
                dy: *dy as i8,
            }),
            _ => None,
        }
    }

    fn encode(&self) -> Vec<u8> {
        vec![self.dx as u8, self.dy as u8]
    }
}

/// Raised when a particle leaves the unit box.
#[derive(Debug)]
struct LeftArena {
    owner: PlayerRef,
}

impl Event for LeftArena {
    const ID: EventTypeId = 1;

    fn hash_content(&self, hasher: &mut ChecksumAccumulator) {
        hasher.update_i32(self.owner);
    }
}

struct Drift;

impl System for Drift {
    fn name(&self) -> &str {
        "Drift"
    }

    fn signals(&self) -> &[SignalKind] {
        &[SignalKind::PlayerAdded]
    }

    fn on_signal(&self, frame: &mut Frame, signal: &Signal) -> anyhow::Result<()> {
        if let Signal::PlayerAdded { player } = *signal {
            let entity = frame.create()?;
            frame.add(
                entity,
                Particle {
                    owner: player,
                    x: 0,
                    y: 0,
                },
            )?;
        }
        Ok(())
    }

    fn update(&self, frame: &mut Frame) -> anyhow::Result<()> {
        let speed = fixed_mul(FIXED_ONE / 64, frame.delta_time() * 60);
        for (entity, mut particle) in frame.filter::<Particle>()? {
            let steer = frame.input::<Steer>(particle.owner);
            let jitter = frame.rng().next_int_range(-256, 256);
            particle.x += speed * steer.dx.signum() as i32 + jitter;
            particle.y += speed * steer.dy.signum() as i32 - jitter;
            if particle.x.abs() > FIXED_ONE || particle.y.abs() > FIXED_ONE {
                frame.raise(LeftArena { owner: particle.owner });
                particle.x = 0;
                particle.y = 0;
            }
            frame.set(entity, &particle)?;
        }
        Ok(())
    }
}

fn steer_for(tick: Tick, player: PlayerRef) -> Vec<u8> {
    let phase = (tick / 30 + player) % 4;
    let (dx, dy) = match phase {
        0 => (1, 0),
        1 => (0, 1),
        2 => (-1, 0),
        _ => (0, -1),
    };
    Steer { dx, dy }.encode()
}

fn context_params(players: u32) -> FrameContextParams {
    let session = SessionConfig {
        player_count: players,
        checksum_interval: 30,
        rollback_window: 8,
        ..Default::default()
    };
    let simulation = SimulationConfig {
        thread_count: 2,
        heap_page_shift: 12,
        heap_page_count: 64,
        heap_tracking_mode: HeapTrackingMode::DetectLeaks,
        ..Default::default()
    };
    let mut params = FrameContextParams::new(session, simulation, RuntimeConfig { seed: 12345, ..Default::default() });
    params.systems = SystemSetup::new().with(SystemDescriptor::new(Drift));
    params
}

fn session_params(mode: GameMode, players: u32, local: PlayerRef) -> SessionParams {
    let mut params = SessionParams::new(mode, context_params(players))
        .with_local_player(PlayerJoin {
            player: local,
            actor_id: local + 1,
            data: Vec::new(),
        })
        .with_input(|tick: Tick, player: PlayerRef| Ok::<_, anyhow::Error>(steer_for(tick, player)));
    params.game.events().subscribe_typed::<LeftArena, _>(|tick, event| {
        info!(tick, owner = event.owner, "Particle left the arena");
        Ok(())
    });
    params
}

fn frame_checksum(frame: &Frame) -> anyhow::Result<u64> {
    let mut copy = frame.context().create_frame()?;
    copy.copy_from(frame)?;
    Ok(FrameSerializer::new().checksum(&mut copy)?)
}

// =============================================================================
// DEMOS
// =============================================================================

/// Local session under a runner, recording a replay.
async fn demo_local() -> anyhow::Result<lockstep::sim::ReplayFile> {
    info!("=== Local Session ===");
    let mut runner = SessionRunner::new();
    runner.set_on_shutdown(|cause| info!(%cause, "Local runner stopped"));

    let mut args = RunnerArguments::new(session_params(GameMode::Local, 1, 0));
    args.record_replay = true;
    runner
        .start_async(args, Duration::from_secs(1), CancelToken::never())
        .await?;

    let step = Duration::from_millis(16);
    let mut replay = None;
    while let Some(session) = runner.session() {
        if session.verified_frame().number() >= DEMO_TICKS {
            replay = session.replay_file();
            info!(
                tick = session.verified_frame().number(),
                checksum = %checksum_hex(frame_checksum(session.verified_frame())?),
                "Local session finished"
            );
            break;
        }
        runner.service(step)?;
    }
    runner.shutdown_async(ShutdownCause::Ok).await;
    replay.ok_or_else(|| anyhow::anyhow!("replay was not recorded"))
}

/// Play a recording back and check every recorded checksum.
fn demo_replay(file: lockstep::sim::ReplayFile) -> anyhow::Result<()> {
    info!("=== Replay ===");
    let bytes = file.to_bytes()?;
    info!(inputs = file.inputs.len(), bytes = bytes.len(), "Replay encoded");

    let mut params = session_params(GameMode::Replay, 1, 0);
    params.replay = Some(lockstep::sim::ReplayFile::from_bytes(&bytes)?);
    let mut session = DeterministicSession::new(params)?;
    while !session.is_simulation_finished() {
        session.update_to(session.verified_frame().number() + 60)?;
    }

    let verifier = session
        .checksum_verifier()
        .ok_or_else(|| anyhow::anyhow!("replay carried no checksums"))?;
    if verifier.mismatches().is_empty() {
        info!(verified = verifier.verified(), "DETERMINISM VERIFIED: replay checksums match");
    } else {
        warn!(mismatches = verifier.mismatches().len(), "DETERMINISM FAILURE: replay diverged");
    }
    Ok(())
}

/// Two predicting peers behind an in-process relay.
fn demo_multiplayer() -> anyhow::Result<()> {
    info!("=== Multiplayer ===");
    let mut relay = LocalRelay::new(2);
    let mut peers = Vec::new();
    for player in 0..2 {
        let mut params = session_params(GameMode::Multiplayer, 2, player).with_communicator(relay.connect());
        params.game.callbacks().subscribe(CallbackKind::ChecksumError, move |cb, _| {
            warn!(player, ?cb, "Peer reported a checksum error");
            Ok(())
        });
        peers.push(DeterministicSession::new(params)?);
    }

    let step = peers[0].context().session().tick_duration();
    let mut rounds = 0;
    while peers.iter().any(|p| p.verified_frame().number() < DEMO_TICKS / 2) && rounds < 10_000 {
        for peer in &mut peers {
            peer.service(step)?;
        }
        relay.pump();
        rounds += 1;
    }

    for (player, peer) in peers.iter().enumerate() {
        info!(
            player,
            verified = peer.verified_frame().number(),
            predicted = peer.predicted_frame().number(),
            "Peer state"
        );
    }
    let tick = peers.iter().map(|p| p.verified_frame().number()).min().unwrap_or(-1);
    info!(tick, "Peers converged on verified input");

    for peer in peers {
        if let Some(mut communicator) = peer.destroy() {
            communicator.disconnect();
        }
    }
    relay.close("demo finished");
    Ok(())
}
