//! Player Input
//!
//! Input travels as opaque bytes; only the game's input type knows its
//! layout. A [`TickInputs`] is everything confirmed for one tick: per-player
//! input, at most one command per player, and player joins/leaves.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::stream::{BitStream, Serializable, StreamError};
use crate::sim::frame::Tick;
use crate::sim::players::PlayerRef;

/// Game-defined input type.
///
/// `decode` returning `None` (malformed bytes) makes the frame fall back to
/// `Default`, so one bad payload never stops the tick.
pub trait InputDecode: Default + Sized {
    /// Parse input bytes.
    fn decode(bytes: &[u8]) -> Option<Self>;
    /// Produce input bytes.
    fn encode(&self) -> Vec<u8>;
}

/// A player joining at a given tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerJoin {
    /// Player slot.
    pub player: PlayerRef,
    /// Transport actor id.
    pub actor_id: i32,
    /// Encoded runtime player payload.
    pub data: Vec<u8>,
}

/// Confirmed input for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickInputs {
    /// Tick the input applies to.
    pub tick: Tick,
    /// Input bytes per player.
    pub inputs: BTreeMap<PlayerRef, Vec<u8>>,
    /// Encoded command per player.
    pub commands: BTreeMap<PlayerRef, Vec<u8>>,
    /// Players joining this tick.
    pub joins: Vec<PlayerJoin>,
    /// Players leaving this tick.
    pub leaves: Vec<PlayerRef>,
}

impl TickInputs {
    /// Empty input for `tick`.
    pub fn new(tick: Tick) -> Self {
        Self {
            tick,
            ..Default::default()
        }
    }

    /// Builder: set a player's input.
    pub fn with_input(mut self, player: PlayerRef, bytes: Vec<u8>) -> Self {
        self.inputs.insert(player, bytes);
        self
    }

    /// Builder: add a join.
    pub fn with_join(mut self, join: PlayerJoin) -> Self {
        self.joins.push(join);
        self
    }
}

/// Input applied to the frame for its current tick. Part of the state block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameInputs {
    pub(crate) inputs: BTreeMap<PlayerRef, Vec<u8>>,
    pub(crate) commands: BTreeMap<PlayerRef, Vec<u8>>,
}

impl FrameInputs {
    /// Replace with the input of a new tick.
    pub fn assign(&mut self, tick_inputs: &TickInputs) {
        self.inputs.clone_from(&tick_inputs.inputs);
        self.commands.clone_from(&tick_inputs.commands);
    }

    /// Raw input bytes.
    pub fn input(&self, player: PlayerRef) -> Option<&[u8]> {
        self.inputs.get(&player).map(Vec::as_slice)
    }

    /// Raw command bytes.
    pub fn command(&self, player: PlayerRef) -> Option<&[u8]> {
        self.commands.get(&player).map(Vec::as_slice)
    }
}

fn serialize_map(map: &mut BTreeMap<PlayerRef, Vec<u8>>, stream: &mut BitStream) -> Result<(), StreamError> {
    let mut count = map.len();
    stream.serialize_len(&mut count)?;
    if stream.is_reading() {
        map.clear();
        for _ in 0..count {
            let mut player: PlayerRef = 0;
            let mut bytes = Vec::new();
            stream.serialize_i32(&mut player)?;
            stream.serialize_bytes(&mut bytes)?;
            map.insert(player, bytes);
        }
    } else {
        for (player, bytes) in map.iter_mut() {
            let mut player = *player;
            stream.serialize_i32(&mut player)?;
            stream.serialize_bytes(bytes)?;
        }
    }
    Ok(())
}

impl Serializable for FrameInputs {
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        serialize_map(&mut self.inputs, stream)?;
        serialize_map(&mut self.commands, stream)
    }
}
