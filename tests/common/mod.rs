//! Shared game for the integration tests.
//!
//! One `Counter` entity per player. A player's input byte is added to its
//! counter every tick, and a nonzero input raises an unsynced `Pushed`
//! event, so predictions that guess input wrong produce events that must be
//! canceled later.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use lockstep::core::hash::ChecksumAccumulator;
use lockstep::core::heap::HeapTrackingMode;
use lockstep::session::{GameMode, SessionParams};
use lockstep::sim::config::{RuntimeConfig, SessionConfig, SimulationConfig};
use lockstep::sim::entity::ComponentId;
use lockstep::sim::events::EventTypeId;
use lockstep::sim::system::{Signal, SignalKind};
use lockstep::sim::{
    Callback, CallbackKind, Component, Event, Frame, FrameContextParams, FrameSerializer, PlayerJoin, PlayerRef,
    System, SystemDescriptor, SystemSetup, Tick,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counter {
    pub owner: PlayerRef,
    pub total: i32,
}

impl Component for Counter {
    const ID: ComponentId = 1;
    const SIZE: usize = 8;

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.owner.to_le_bytes());
        out[4..8].copy_from_slice(&self.total.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut owner = [0u8; 4];
        let mut total = [0u8; 4];
        owner.copy_from_slice(&bytes[0..4]);
        total.copy_from_slice(&bytes[4..8]);
        Counter {
            owner: i32::from_le_bytes(owner),
            total: i32::from_le_bytes(total),
        }
    }
}

#[derive(Debug)]
pub struct Pushed {
    pub player: PlayerRef,
}

impl Event for Pushed {
    const ID: EventTypeId = 1;

    fn hash_content(&self, hasher: &mut ChecksumAccumulator) {
        hasher.update_i32(self.player);
    }
}

/// Counts input. `salt` adds extra RNG draws so peers can be made to diverge.
pub struct Counting {
    pub salt: u32,
}

impl System for Counting {
    fn name(&self) -> &str {
        "Counting"
    }

    fn signals(&self) -> &[SignalKind] {
        &[SignalKind::PlayerAdded]
    }

    fn on_signal(&self, frame: &mut Frame, signal: &Signal) -> anyhow::Result<()> {
        if let Signal::PlayerAdded { player } = *signal {
            let entity = frame.create()?;
            frame.add(entity, Counter { owner: player, total: 0 })?;
        }
        Ok(())
    }

    fn update(&self, frame: &mut Frame) -> anyhow::Result<()> {
        for _ in 0..self.salt {
            let _ = frame.rng().next_u32();
        }
        for (entity, mut counter) in frame.filter::<Counter>()? {
            let push = frame.raw_input(counter.owner).and_then(|b| b.first().copied()).unwrap_or(0);
            if push != 0 {
                counter.total += push as i32 + frame.rng().next_int(3) as i32;
                frame.set(entity, &counter)?;
                frame.raise(Pushed { player: counter.owner });
            }
        }
        Ok(())
    }
}

pub fn context_params(players: u32, rollback_window: i32, checksum_interval: i32, salt: u32) -> FrameContextParams {
    let session = SessionConfig {
        player_count: players,
        rollback_window,
        checksum_interval,
        ..Default::default()
    };
    let simulation = SimulationConfig {
        thread_count: 1,
        heap_page_shift: 12,
        heap_page_count: 32,
        heap_tracking_mode: HeapTrackingMode::DetectLeaks,
        checksum_snapshot_history_length_seconds: 1,
        ..Default::default()
    };
    let runtime = RuntimeConfig {
        seed: 77,
        ..Default::default()
    };
    let mut params = FrameContextParams::new(session, simulation, runtime);
    params.systems = SystemSetup::new().with(SystemDescriptor::new(Counting { salt }));
    params
}

/// Session for `local`, whose input for each tick comes from `input`.
pub fn session_params<F>(mode: GameMode, context: FrameContextParams, local: PlayerRef, input: F) -> SessionParams
where
    F: Fn(Tick) -> u8 + Send + 'static,
{
    SessionParams::new(mode, context)
        .with_local_player(PlayerJoin {
            player: local,
            actor_id: local + 100,
            data: Vec::new(),
        })
        .with_input(move |tick: Tick, _player: PlayerRef| Ok::<_, anyhow::Error>(vec![input(tick)]))
}

/// Everything a session reported, in order.
#[derive(Debug, Default)]
pub struct Recorder {
    pub delivered: Vec<Tick>,
    pub confirmed: Vec<Tick>,
    pub canceled: Vec<Tick>,
    pub checksums: BTreeMap<Tick, u64>,
    pub checksum_errors: Vec<(Tick, bool)>,
}

/// Subscribe a recorder to `params`.
pub fn record(params: &mut SessionParams) -> Arc<Mutex<Recorder>> {
    let recorder = Arc::new(Mutex::new(Recorder::default()));

    let r = recorder.clone();
    params.game.events().subscribe_typed::<Pushed, _>(move |tick, _| {
        r.lock().unwrap().delivered.push(tick);
        Ok(())
    });
    for kind in [
        CallbackKind::EventConfirmed,
        CallbackKind::EventCanceled,
        CallbackKind::ChecksumComputed,
        CallbackKind::ChecksumError,
    ] {
        let r = recorder.clone();
        params.game.callbacks().subscribe(kind, move |cb, _| {
            let mut r = r.lock().unwrap();
            match cb {
                Callback::EventConfirmed { key, .. } => r.confirmed.push(key.tick),
                Callback::EventCanceled { key, .. } => r.canceled.push(key.tick),
                Callback::ChecksumComputed { tick, checksum } => {
                    r.checksums.insert(*tick, *checksum);
                }
                Callback::ChecksumError { tick, dump, .. } => r.checksum_errors.push((*tick, dump.is_some())),
                _ => {}
            }
            Ok(())
        });
    }
    recorder
}

/// Checksum of a frame without touching it.
pub fn checksum_of(frame: &Frame) -> u64 {
    let mut copy = frame.context().create_frame().unwrap();
    copy.copy_from(frame).unwrap();
    FrameSerializer::new().checksum(&mut copy).unwrap()
}
