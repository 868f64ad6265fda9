//! Communicator
//!
//! The session never blocks on the network. A [`Communicator`] is polled
//! once per update for whatever arrived and queues outgoing messages
//! without waiting.
//!
//! [`ChannelCommunicator`] carries bincode frames over tokio channels;
//! [`LocalRelay`] is the matching in-process server that orders input for
//! every connected session.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

use crate::core::hash::Digest256;
use crate::session::cancel::CancelToken;
use crate::session::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::sim::frame::Tick;
use crate::sim::input::{PlayerJoin, TickInputs};
use crate::sim::players::PlayerRef;

/// Queue depth per direction.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Transport used by a multiplayer session.
pub trait Communicator: Send {
    /// True while the transport is usable.
    fn is_connected(&self) -> bool;

    /// Queue a message for the relay.
    fn send(&mut self, message: &ClientMessage) -> Result<(), ProtocolError>;

    /// Next received message, if any. Never waits.
    fn try_receive(&mut self) -> Result<Option<ServerMessage>, ProtocolError>;

    /// Close the transport.
    fn disconnect(&mut self);
}

// =============================================================================
// CHANNEL COMMUNICATOR
// =============================================================================

/// Communicator over a pair of bounded tokio channels.
#[derive(Debug)]
pub struct ChannelCommunicator {
    outgoing: Option<mpsc::Sender<Vec<u8>>>,
    incoming: mpsc::Receiver<Vec<u8>>,
    connected: bool,
}

impl ChannelCommunicator {
    /// Wrap the two channel ends.
    pub fn new(outgoing: mpsc::Sender<Vec<u8>>, incoming: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            outgoing: Some(outgoing),
            incoming,
            connected: true,
        }
    }
}

impl Communicator for ChannelCommunicator {
    fn is_connected(&self) -> bool {
        self.connected && self.outgoing.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn send(&mut self, message: &ClientMessage) -> Result<(), ProtocolError> {
        let tx = self.outgoing.as_ref().ok_or(ProtocolError::Disconnected)?;
        match tx.try_send(message.to_bytes()?) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ProtocolError::QueueFull),
            Err(TrySendError::Closed(_)) => {
                self.connected = false;
                Err(ProtocolError::Disconnected)
            }
        }
    }

    fn try_receive(&mut self) -> Result<Option<ServerMessage>, ProtocolError> {
        match self.incoming.try_recv() {
            Ok(bytes) => ServerMessage::from_bytes(&bytes).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.connected = false;
                Ok(None)
            }
        }
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.outgoing = None;
        self.incoming.close();
    }
}

// =============================================================================
// LOCAL RELAY
// =============================================================================

struct RelayClient {
    to_client: mpsc::Sender<Vec<u8>>,
    from_client: mpsc::Receiver<Vec<u8>>,
    player: Option<PlayerRef>,
    closed: bool,
}

/// In-process relay: admits players, then confirms a tick as soon as every
/// joined player sent input for it, and forwards checksums between peers.
pub struct LocalRelay {
    player_count: usize,
    clients: Vec<RelayClient>,
    digest: Option<Digest256>,
    started: bool,
    next_tick: Tick,
    joined: BTreeMap<PlayerRef, PlayerJoin>,
    pending_joins: Vec<PlayerJoin>,
    inputs: BTreeMap<Tick, BTreeMap<PlayerRef, (Vec<u8>, Option<Vec<u8>>)>>,
}

impl std::fmt::Debug for LocalRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRelay")
            .field("player_count", &self.player_count)
            .field("clients", &self.clients.len())
            .field("started", &self.started)
            .field("next_tick", &self.next_tick)
            .finish()
    }
}

impl LocalRelay {
    /// Relay that starts once `player_count` players joined.
    pub fn new(player_count: usize) -> Self {
        Self {
            player_count: player_count.max(1),
            clients: Vec::new(),
            digest: None,
            started: false,
            next_tick: 0,
            joined: BTreeMap::new(),
            pending_joins: Vec::new(),
            inputs: BTreeMap::new(),
        }
    }

    /// Open a connection for one session.
    pub fn connect(&mut self) -> ChannelCommunicator {
        let (to_relay, from_client) = mpsc::channel(CHANNEL_CAPACITY);
        let (to_client, from_relay) = mpsc::channel(CHANNEL_CAPACITY);
        self.clients.push(RelayClient {
            to_client,
            from_client,
            player: None,
            closed: false,
        });
        ChannelCommunicator::new(to_relay, from_relay)
    }

    /// True once the start message went out.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Next tick waiting for input.
    pub fn next_tick(&self) -> Tick {
        self.next_tick
    }

    /// Handle everything received so far and confirm every complete tick.
    /// Returns the number of ticks confirmed.
    pub fn pump(&mut self) -> usize {
        for index in 0..self.clients.len() {
            loop {
                let received = match self.clients[index].from_client.try_recv() {
                    Ok(bytes) => bytes,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.clients[index].closed = true;
                        break;
                    }
                };
                match ClientMessage::from_bytes(&received) {
                    Ok(message) => self.handle(index, message),
                    Err(e) => warn!(client = index, "Dropping malformed message: {}", e),
                }
            }
        }
        self.confirm_ready_ticks()
    }

    fn handle(&mut self, index: usize, message: ClientMessage) {
        match message {
            ClientMessage::Join {
                player,
                actor_id,
                data,
                config_digest,
            } => {
                let digest = *self.digest.get_or_insert(config_digest);
                if digest != config_digest {
                    warn!(player, "Config digest mismatch, rejecting join");
                    self.send_to(
                        index,
                        &ServerMessage::Disconnect {
                            reason: "config mismatch".into(),
                        },
                    );
                    return;
                }
                if self.joined.contains_key(&player) {
                    warn!(player, "Player slot already taken");
                    self.send_to(
                        index,
                        &ServerMessage::Disconnect {
                            reason: format!("player slot {player} taken"),
                        },
                    );
                    return;
                }
                self.clients[index].player = Some(player);
                let join = PlayerJoin { player, actor_id, data };
                self.joined.insert(player, join.clone());
                self.pending_joins.push(join);
                debug!(player, joined = self.joined.len(), "Player joined relay");

                if !self.started && self.joined.len() >= self.player_count {
                    self.started = true;
                    info!(players = self.joined.len(), "Relay starting session");
                    self.broadcast(&ServerMessage::Start {
                        tick: self.next_tick,
                        frame_data: None,
                    });
                }
            }
            ClientMessage::Input {
                tick,
                player,
                input,
                command,
            } => {
                if tick < self.next_tick {
                    debug!(tick, player, "Late input dropped");
                    return;
                }
                self.inputs.entry(tick).or_default().entry(player).or_insert((input, command));
            }
            ClientMessage::Checksum { tick, checksum } => {
                for other in 0..self.clients.len() {
                    if other != index {
                        self.send_to(other, &ServerMessage::Checksum { tick, checksum });
                    }
                }
            }
        }
    }

    fn confirm_ready_ticks(&mut self) -> usize {
        if !self.started {
            return 0;
        }
        let mut confirmed = 0;
        loop {
            let tick = self.next_tick;
            let complete = self
                .inputs
                .get(&tick)
                .is_some_and(|by_player| self.joined.keys().all(|p| by_player.contains_key(p)));
            if !complete {
                break;
            }
            let mut tick_inputs = TickInputs::new(tick);
            for (player, (input, command)) in self.inputs.remove(&tick).unwrap_or_default() {
                tick_inputs.inputs.insert(player, input);
                if let Some(command) = command {
                    tick_inputs.commands.insert(player, command);
                }
            }
            tick_inputs.joins = std::mem::take(&mut self.pending_joins);
            self.broadcast(&ServerMessage::Inputs(tick_inputs));
            self.next_tick += 1;
            confirmed += 1;
        }
        confirmed
    }

    /// Tell every client to replace its verified frame.
    pub fn resync(&mut self, tick: Tick, frame_data: Vec<u8>) {
        self.inputs.retain(|t, _| *t > tick);
        self.next_tick = self.next_tick.max(tick + 1);
        self.broadcast(&ServerMessage::Resync { tick, frame_data });
    }

    /// Send pause or resume to everyone.
    pub fn set_paused(&mut self, paused: bool) {
        let message = if paused {
            ServerMessage::Pause
        } else {
            ServerMessage::Resume
        };
        self.broadcast(&message);
    }

    /// Disconnect every client.
    pub fn close(&mut self, reason: &str) {
        self.broadcast(&ServerMessage::Disconnect {
            reason: reason.to_string(),
        });
        self.clients.clear();
    }

    fn send_to(&mut self, index: usize, message: &ServerMessage) {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode relay message: {}", e);
                return;
            }
        };
        let client = &mut self.clients[index];
        if client.closed {
            return;
        }
        match client.to_client.try_send(bytes) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!(client = index, "Client queue full, message dropped"),
            Err(TrySendError::Closed(_)) => client.closed = true,
        }
    }

    fn broadcast(&mut self, message: &ServerMessage) {
        for index in 0..self.clients.len() {
            self.send_to(index, message);
        }
    }

    /// Pump on a fixed interval until canceled.
    #[instrument(skip(self, cancel))]
    pub async fn run(mut self, period: Duration, mut cancel: CancelToken) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.canceled() => {
                    info!("Relay stopped");
                    self.close("relay stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.pump();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(player: PlayerRef, digest: Digest256) -> ClientMessage {
        ClientMessage::Join {
            player,
            actor_id: player + 100,
            data: Vec::new(),
            config_digest: digest,
        }
    }

    fn input(tick: Tick, player: PlayerRef, byte: u8) -> ClientMessage {
        ClientMessage::Input {
            tick,
            player,
            input: vec![byte],
            command: None,
        }
    }

    fn drain(client: &mut ChannelCommunicator) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Some(message) = client.try_receive().unwrap() {
            out.push(message);
        }
        out
    }

    #[test]
    fn test_relay_starts_and_confirms() {
        let mut relay = LocalRelay::new(2);
        let mut a = relay.connect();
        let mut b = relay.connect();

        a.send(&join(0, [1; 32])).unwrap();
        relay.pump();
        assert!(!relay.is_started());
        b.send(&join(1, [1; 32])).unwrap();
        relay.pump();
        assert!(relay.is_started());
        assert_eq!(drain(&mut a), vec![ServerMessage::Start { tick: 0, frame_data: None }]);
        drain(&mut b);

        a.send(&input(0, 0, 5)).unwrap();
        assert_eq!(relay.pump(), 0);
        b.send(&input(0, 1, 6)).unwrap();
        b.send(&input(1, 1, 7)).unwrap();
        assert_eq!(relay.pump(), 1);

        match drain(&mut a).as_slice() {
            [ServerMessage::Inputs(inputs)] => {
                assert_eq!(inputs.tick, 0);
                assert_eq!(inputs.inputs.len(), 2);
                assert_eq!(inputs.joins.len(), 2);
            }
            other => panic!("Unexpected messages: {other:?}"),
        }
        assert_eq!(relay.next_tick(), 1);
    }

    #[test]
    fn test_digest_mismatch_rejected() {
        let mut relay = LocalRelay::new(2);
        let mut a = relay.connect();
        let mut b = relay.connect();
        a.send(&join(0, [1; 32])).unwrap();
        b.send(&join(1, [2; 32])).unwrap();
        relay.pump();

        assert!(!relay.is_started());
        assert!(matches!(drain(&mut b).as_slice(), [ServerMessage::Disconnect { .. }]));
    }

    #[test]
    fn test_checksum_forwarded_to_peers_only() {
        let mut relay = LocalRelay::new(1);
        let mut a = relay.connect();
        let mut b = relay.connect();
        a.send(&ClientMessage::Checksum { tick: 60, checksum: 9 }).unwrap();
        relay.pump();
        assert!(drain(&mut a).is_empty());
        assert_eq!(drain(&mut b), vec![ServerMessage::Checksum { tick: 60, checksum: 9 }]);
    }

    #[test]
    fn test_disconnect_closes_channel() {
        let mut relay = LocalRelay::new(1);
        let mut a = relay.connect();
        assert!(a.is_connected());
        a.disconnect();
        assert!(!a.is_connected());
        assert_eq!(a.send(&input(0, 0, 0)), Err(ProtocolError::Disconnected));
        drop(relay);
    }

    #[tokio::test]
    async fn test_relay_task_stops_on_cancel() {
        let mut relay = LocalRelay::new(1);
        let mut a = relay.connect();
        let source = crate::session::cancel::CancelSource::new();
        let task = tokio::spawn(relay.run(Duration::from_millis(1), source.token()));

        a.send(&join(0, [0; 32])).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        source.cancel();
        task.await.unwrap();

        let messages = drain(&mut a);
        assert_eq!(messages.first(), Some(&ServerMessage::Start { tick: 0, frame_data: None }));
        assert!(matches!(messages.last(), Some(ServerMessage::Disconnect { .. })));
    }
}
