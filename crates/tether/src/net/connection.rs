use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use glam::Vec2;
use log::warn;

use crate::replication::ReplicationQueue;
use crate::world::EntityHandle;

use super::sequence::{PacketBuffer, SequenceBuffer};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const RECEIVE_WINDOW: usize = 256;
const SEND_WINDOW: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    SynReceived,
    Connected,
    Disconnecting,
}

pub struct PlayerConnection {
    pub addr: SocketAddr,
    pub player_id: i32,
    pub state: ConnectionState,
    /// Client-chosen handshake key, echoed in syn-ack and ack.
    pub sequence_key: u32,
    /// Server-chosen handshake key, echoed in ack.
    pub ack_key: u32,
    pub received_inputs: SequenceBuffer,
    /// Recently sent replication payloads, for reply routing and future
    /// ack-driven resends.
    pub sent_packets: PacketBuffer,
    pub queue: ReplicationQueue,
    pub entity: Option<EntityHandle>,
    pub interest: HashSet<EntityHandle>,
    pub view_position: Vec2,
    pub last_receive_time: Instant,
}

impl PlayerConnection {
    fn new(
        addr: SocketAddr,
        player_id: i32,
        sequence_key: u32,
        ack_key: u32,
        queue_capacity: usize,
        tick_duration: f32,
    ) -> Self {
        Self {
            addr,
            player_id,
            state: ConnectionState::SynReceived,
            sequence_key,
            ack_key,
            received_inputs: SequenceBuffer::new(RECEIVE_WINDOW),
            sent_packets: PacketBuffer::new(SEND_WINDOW),
            queue: ReplicationQueue::new(queue_capacity, tick_duration),
            entity: None,
            interest: HashSet::new(),
            view_position: Vec2::ZERO,
            last_receive_time: Instant::now(),
        }
    }

    /// Key for the placeholder payload scrambling, agreed by the handshake.
    pub fn scramble_key(&self) -> u32 {
        self.sequence_key ^ self.ack_key
    }

    /// The ack must echo both handshake keys; a mismatch rejects the
    /// transition and leaves the connection state untouched.
    pub fn try_complete_handshake(&mut self, sequence_key: u32, ack_key: u32) -> bool {
        if sequence_key != self.sequence_key || ack_key != self.ack_key {
            warn!(
                "handshake key mismatch from {} (player {})",
                self.addr, self.player_id
            );
            return false;
        }
        self.state = ConnectionState::Connected;
        true
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_receive_time.elapsed() > timeout
    }

    pub fn touch(&mut self) {
        self.last_receive_time = Instant::now();
    }
}

pub struct ConnectionTable {
    by_addr: HashMap<SocketAddr, i32>,
    players: HashMap<i32, PlayerConnection>,
    next_player_id: i32,
    max_players: usize,
    timeout: Duration,
    queue_capacity: usize,
    tick_duration: f32,
}

impl ConnectionTable {
    pub fn new(max_players: usize, queue_capacity: usize, tick_duration: f32) -> Self {
        Self {
            by_addr: HashMap::new(),
            players: HashMap::new(),
            next_player_id: 1,
            max_players,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            queue_capacity,
            tick_duration,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// A repeated syn from a known address restarts that handshake; a new
    /// address allocates a player slot or is denied when full.
    pub fn get_or_create_pending(
        &mut self,
        addr: SocketAddr,
        sequence_key: u32,
        ack_key: u32,
    ) -> Result<&mut PlayerConnection, &'static str> {
        if let Some(&player_id) = self.by_addr.get(&addr) {
            let connection = self.players.get_mut(&player_id).unwrap();
            if connection.sequence_key != sequence_key {
                connection.sequence_key = sequence_key;
                connection.ack_key = ack_key;
                connection.state = ConnectionState::SynReceived;
            }
            return Ok(connection);
        }

        if self.players.len() >= self.max_players {
            return Err("server full");
        }

        let player_id = self.next_player_id;
        self.next_player_id += 1;

        let connection = PlayerConnection::new(
            addr,
            player_id,
            sequence_key,
            ack_key,
            self.queue_capacity,
            self.tick_duration,
        );
        self.players.insert(player_id, connection);
        self.by_addr.insert(addr, player_id);

        Ok(self.players.get_mut(&player_id).unwrap())
    }

    pub fn get(&self, player_id: i32) -> Option<&PlayerConnection> {
        self.players.get(&player_id)
    }

    pub fn get_mut(&mut self, player_id: i32) -> Option<&mut PlayerConnection> {
        self.players.get_mut(&player_id)
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&PlayerConnection> {
        self.by_addr.get(addr).and_then(|id| self.players.get(id))
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut PlayerConnection> {
        if let Some(&id) = self.by_addr.get(addr) {
            self.players.get_mut(&id)
        } else {
            None
        }
    }

    pub fn remove(&mut self, player_id: i32) -> Option<PlayerConnection> {
        if let Some(connection) = self.players.remove(&player_id) {
            self.by_addr.remove(&connection.addr);
            Some(connection)
        } else {
            None
        }
    }

    pub fn remove_by_addr(&mut self, addr: &SocketAddr) -> Option<PlayerConnection> {
        if let Some(player_id) = self.by_addr.remove(addr) {
            self.players.remove(&player_id)
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlayerConnection> {
        self.players.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PlayerConnection> {
        self.players.values_mut()
    }

    /// Removes every timed-out connection and hands them back so callers
    /// can release whatever the players owned.
    pub fn cleanup_timed_out(&mut self) -> Vec<PlayerConnection> {
        let timed_out: Vec<i32> = self
            .players
            .iter()
            .filter(|(_, c)| c.is_timed_out(self.timeout))
            .map(|(&id, _)| id)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.players
            .values()
            .filter(|c| c.state == ConnectionState::Connected)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.players.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn table() -> ConnectionTable {
        ConnectionTable::new(2, 16, 1.0 / 60.0)
    }

    #[test]
    fn handshake_completes_with_matching_keys() {
        let mut table = table();
        {
            let connection = table.get_or_create_pending(addr(5000), 111, 222).unwrap();
            assert_eq!(connection.state, ConnectionState::SynReceived);
            assert!(connection.try_complete_handshake(111, 222));
            assert_eq!(connection.state, ConnectionState::Connected);
        }
        assert_eq!(table.connected_count(), 1);
    }

    #[test]
    fn key_mismatch_leaves_state_unchanged() {
        let mut table = table();
        {
            let connection = table.get_or_create_pending(addr(5001), 111, 222).unwrap();
            assert!(!connection.try_complete_handshake(111, 999));
            assert!(!connection.try_complete_handshake(999, 222));
            assert_eq!(connection.state, ConnectionState::SynReceived);
        }
        assert_eq!(table.connected_count(), 0);
    }

    #[test]
    fn table_denies_when_full() {
        let mut table = table();
        table.get_or_create_pending(addr(5002), 1, 2).unwrap();
        table.get_or_create_pending(addr(5003), 3, 4).unwrap();

        let denied = table.get_or_create_pending(addr(5004), 5, 6);
        assert_eq!(denied.err(), Some("server full"));
    }

    #[test]
    fn repeated_syn_restarts_handshake() {
        let mut table = table();
        {
            let connection = table.get_or_create_pending(addr(5005), 1, 2).unwrap();
            assert!(connection.try_complete_handshake(1, 2));
        }

        let connection = table.get_or_create_pending(addr(5005), 42, 43).unwrap();
        assert_eq!(connection.state, ConnectionState::SynReceived);
        assert_eq!(connection.sequence_key, 42);
        assert_eq!(table.total_count(), 1);
    }

    #[test]
    fn remove_frees_the_slot() {
        let mut table = table();
        let player_id = table.get_or_create_pending(addr(5006), 1, 2).unwrap().player_id;
        assert!(table.remove(player_id).is_some());
        assert!(table.get_by_addr(&addr(5006)).is_none());
        assert_eq!(table.total_count(), 0);
    }
}
