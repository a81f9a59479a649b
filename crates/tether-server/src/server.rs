use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use glam::Vec2;
use log::{debug, error, info, warn};

use tether::net::wire;
use tether::{
    xor_scramble, ClientPacket, ComponentChange, ComponentKind, ComponentKinds,
    ComponentRegistry, ConnectionState, ConnectionTable, EntityHandle, EntityStore, FieldMask,
    FrameNumber, InterestGrid, Movement, NetworkEndpoint, PacketAssembler, PlayerConnection,
    PlayerTag, PriorityCalculator, PriorityTag, ReplicationPacket, ServerPacket, Transform,
    MAX_PACKET_SIZE, PACKET_HEADER_SIZE,
};

use crate::config::ServerConfig;
use crate::events::{DisconnectReason, ServerEvent};

const PLAYER_SPEED: f32 = 40.0;
const RECV_POLL: Duration = Duration::from_millis(20);

fn generate_key() -> u32 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    Instant::now().hash(&mut hasher);
    hasher.finish() as u32
}

fn spawn_position(player_id: i32) -> Vec2 {
    let angle = player_id as f32 * 0.7;
    Vec2::new(angle.cos(), angle.sin()) * 8.0
}

/// Everything one world instance owns. The tick scheduler and the network
/// receive thread share this behind a single mutex; a datagram is handled
/// under the same lock that guards a full collect-prioritize-pack tick.
pub struct ServerCore {
    endpoint: NetworkEndpoint,
    connections: ConnectionTable,
    store: EntityStore,
    grid: InterestGrid,
    calculator: PriorityCalculator,
    assembler: PacketAssembler,
    config: ServerConfig,
    frame: FrameNumber,
    collected_version: u64,
    scratch: Vec<EntityHandle>,
    pending_events: VecDeque<ServerEvent>,
}

impl ServerCore {
    pub fn new(endpoint: NetworkEndpoint, config: ServerConfig) -> Self {
        let tick_duration = 1.0 / config.tick_rate as f32;
        let mut connections =
            ConnectionTable::new(config.max_clients, config.queue_capacity, tick_duration);
        connections.set_timeout(Duration::from_secs(config.client_timeout_secs));

        Self {
            endpoint,
            connections,
            store: EntityStore::new(),
            grid: InterestGrid::new(config.interest_cell_size),
            calculator: PriorityCalculator::new(config.rings),
            assembler: PacketAssembler::new(MAX_PACKET_SIZE, ComponentRegistry::standard()),
            config,
            frame: 0,
            collected_version: 0,
            scratch: Vec::new(),
            pending_events: VecDeque::new(),
        }
    }

    pub fn clone_socket(&self) -> io::Result<UdpSocket> {
        self.endpoint.clone_socket()
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn frame(&self) -> FrameNumber {
        self.frame
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn connected_count(&self) -> usize {
        self.connections.connected_count()
    }

    pub fn entity_count(&self) -> usize {
        self.store.len()
    }

    pub fn handle_datagram(&mut self, data: &[u8], addr: SocketAddr) {
        let (header, body) = match wire::split_body(data) {
            Ok(split) => split,
            Err(e) => {
                warn!("dropping malformed packet from {}: {}", addr, e);
                return;
            }
        };

        // post-handshake payloads are scrambled; the clear header is enough
        // to find the connection that knows the key
        let key = self
            .connections
            .get_by_addr(&addr)
            .filter(|c| c.state == ConnectionState::Connected)
            .map(|c| c.scramble_key());

        let packet = match key {
            Some(key) => {
                let mut body = body.to_vec();
                xor_scramble(&mut body, key);
                wire::decode_client_body(header.tag, &body)
            }
            None => wire::decode_client_body(header.tag, body),
        };

        let packet = match packet {
            Ok(packet) => packet,
            Err(e) => {
                warn!("dropping malformed packet from {}: {}", addr, e);
                return;
            }
        };

        self.handle_packet(packet, addr);

        if let Some(connection) = self.connections.get_by_addr_mut(&addr) {
            connection.touch();
        }
    }

    fn handle_packet(&mut self, packet: ClientPacket, addr: SocketAddr) {
        match packet {
            ClientPacket::ConnectSyn { sequence_key } => {
                self.pending_events
                    .push_back(ServerEvent::ClientConnecting { addr });

                let ack_key = generate_key();
                match self
                    .connections
                    .get_or_create_pending(addr, sequence_key, ack_key)
                {
                    Ok(connection) => {
                        let player_id = connection.player_id;
                        let sequence_key = connection.sequence_key;
                        let ack_key = connection.ack_key;
                        self.send_packet(
                            player_id,
                            addr,
                            &ServerPacket::ConnectSynAck {
                                sequence_key,
                                ack_key,
                            },
                            None,
                        );
                    }
                    Err(reason) => {
                        self.send_packet(
                            0,
                            addr,
                            &ServerPacket::Disconnect {
                                reason: reason.to_string(),
                            },
                            None,
                        );
                        self.pending_events.push_back(ServerEvent::ConnectionDenied {
                            addr,
                            reason: reason.to_string(),
                        });
                    }
                }
            }

            ClientPacket::ConnectAck {
                sequence_key,
                ack_key,
            } => {
                let Some(connection) = self.connections.get_by_addr_mut(&addr) else {
                    return;
                };
                if connection.state == ConnectionState::Connected {
                    return;
                }
                if !connection.try_complete_handshake(sequence_key, ack_key) {
                    return;
                }
                let player_id = connection.player_id;

                let entity = self.store.spawn();
                let position = spawn_position(player_id);
                self.store.set_transform(
                    entity,
                    Transform {
                        position,
                        rotation: 0.0,
                    },
                );
                self.store.set_movement(entity, Movement::default());
                self.store.set_player(entity, PlayerTag { player_id });
                self.grid.add_or_update(entity, position);

                if let Some(connection) = self.connections.get_mut(player_id) {
                    connection.entity = Some(entity);
                }
                self.pending_events
                    .push_back(ServerEvent::ClientConnected { player_id, addr });
            }

            ClientPacket::Input { frame: _, input } => {
                let Some(connection) = self.connections.get_by_addr_mut(&addr) else {
                    return;
                };
                if connection.state != ConnectionState::Connected {
                    return;
                }
                // stale duplicates arrive often under jitter; drop quietly
                if connection.received_inputs.has_packet(input.sequence) {
                    return;
                }
                connection.received_inputs.insert(input.sequence);
                let Some(entity) = connection.entity else {
                    return;
                };

                let direction = Vec2::new(input.move_x, input.move_y);
                let velocity = if direction.length_squared() > 1.0 {
                    direction.normalize() * PLAYER_SPEED
                } else {
                    direction * PLAYER_SPEED
                };
                self.store.set_movement(entity, Movement { velocity });
            }

            ClientPacket::Ping { timestamp } => {
                let Some(connection) = self.connections.get_by_addr(&addr) else {
                    return;
                };
                let player_id = connection.player_id;
                let key = (connection.state == ConnectionState::Connected)
                    .then(|| connection.scramble_key());
                self.send_packet(player_id, addr, &ServerPacket::Pong { timestamp }, key);
            }

            ClientPacket::Disconnect => {
                if let Some(connection) = self.connections.remove_by_addr(&addr) {
                    if let Some(entity) = connection.entity {
                        self.despawn_entity(entity);
                    }
                    self.pending_events
                        .push_back(ServerEvent::ClientDisconnected {
                            player_id: connection.player_id,
                            reason: DisconnectReason::Graceful,
                        });
                }
            }
        }
    }

    fn despawn_entity(&mut self, entity: EntityHandle) {
        self.store.despawn(entity);
        self.grid.remove(entity);
        // queue entries for the entity drain out of every player's pool
        // on the next interest pass
    }

    fn send_packet(
        &mut self,
        player_id: i32,
        addr: SocketAddr,
        packet: &ServerPacket,
        scramble_key: Option<u32>,
    ) {
        let mut bytes = wire::encode_server_packet(packet, player_id, self.assembler.registry());
        if let Some(key) = scramble_key {
            xor_scramble(&mut bytes[PACKET_HEADER_SIZE..], key);
        }
        if let Err(e) = self.endpoint.send_to(&bytes, addr) {
            self.pending_events.push_back(ServerEvent::Error {
                message: format!("failed to send to {}: {}", addr, e),
            });
        }
    }

    /// One full tick: simulate, collect changes, refresh interest, score
    /// and queue per player, pack and ship, sweep timeouts.
    pub fn tick(&mut self, dt: f32) {
        self.store.integrate(dt);

        let changes = self.store.changed_since(self.collected_version);
        self.collected_version = self.store.version();

        for (entity, kinds) in &changes {
            if kinds.contains(ComponentKinds::TRANSFORM) {
                if let Some(transform) = self.store.transform(*entity) {
                    self.grid.add_or_update(*entity, transform.position);
                }
            }
        }

        let frame = self.frame;
        let Self {
            connections,
            store,
            grid,
            calculator,
            assembler,
            endpoint,
            scratch,
            pending_events,
            ..
        } = self;

        for connection in connections
            .iter_mut()
            .filter(|c| c.state == ConnectionState::Connected)
        {
            let Some(observer) = connection.entity else {
                continue;
            };
            if !store.contains(observer) {
                continue;
            }
            let observer_position = store
                .transform(observer)
                .map(|t| t.position)
                .unwrap_or(Vec2::ZERO);
            connection.view_position = observer_position;

            grid.entities_of_interest(observer, scratch);
            let interest: HashSet<EntityHandle> = scratch.iter().copied().collect();

            // entities that fell out of range release their pooled slot
            let gone: Vec<EntityHandle> = connection
                .interest
                .difference(&interest)
                .copied()
                .collect();
            for entity in gone {
                connection.queue.remove(entity);
            }
            connection.interest = interest;

            for (entity, kinds) in &changes {
                if !connection.interest.contains(entity) {
                    continue;
                }
                let Some(net) = store.network_id(*entity) else {
                    continue;
                };
                let Some(transform) = store.transform(*entity) else {
                    continue;
                };
                let tag = if store.player(*entity).is_some() {
                    PriorityTag::High
                } else {
                    PriorityTag::Normal
                };
                let score = calculator.score(observer_position, transform.position, tag);

                let mut changed = Vec::new();
                for kind in ComponentKind::ALL {
                    if kinds.contains(kind.into()) {
                        if let Some(data) = store.component_data(*entity, kind) {
                            changed.push(ComponentChange {
                                fields: FieldMask::set_all(kind.field_count()),
                                data,
                            });
                        }
                    }
                }
                if !changed.is_empty() {
                    connection
                        .queue
                        .add_entity_changes(*entity, net, &changed, score);
                }
            }

            if let Some(packet) = assembler.assemble(&mut connection.queue, frame, dt) {
                send_replication(endpoint, assembler, pending_events, connection, packet);
            }
        }

        self.frame = self.frame.wrapping_add(1);

        for connection in self.connections.cleanup_timed_out() {
            if let Some(entity) = connection.entity {
                self.despawn_entity(entity);
            }
            self.pending_events
                .push_back(ServerEvent::ClientDisconnected {
                    player_id: connection.player_id,
                    reason: DisconnectReason::Timeout,
                });
        }
    }
}

fn send_replication(
    endpoint: &mut NetworkEndpoint,
    assembler: &PacketAssembler,
    pending_events: &mut VecDeque<ServerEvent>,
    connection: &mut PlayerConnection,
    packet: ReplicationPacket,
) {
    let frame = packet.frame;
    let mut bytes = wire::encode_server_packet(
        &ServerPacket::Replication(packet),
        connection.player_id,
        assembler.registry(),
    );
    xor_scramble(&mut bytes[PACKET_HEADER_SIZE..], connection.scramble_key());
    connection
        .sent_packets
        .insert(frame, bytes.clone(), connection.addr);
    if let Err(e) = endpoint.send_to(&bytes, connection.addr) {
        pending_events.push_back(ServerEvent::Error {
            message: format!("failed to send to {}: {}", connection.addr, e),
        });
    }
}

pub struct GameServer {
    core: Arc<Mutex<ServerCore>>,
    running: Arc<AtomicBool>,
    tick_duration: Duration,
    local_addr: SocketAddr,
}

impl GameServer {
    pub fn new(bind_addr: &str, config: ServerConfig) -> io::Result<Self> {
        let endpoint = NetworkEndpoint::bind(bind_addr)?;
        let running = endpoint.running();
        let local_addr = endpoint.local_addr();
        let tick_duration = Duration::from_secs_f64(1.0 / config.tick_rate as f64);

        Ok(Self {
            core: Arc::new(Mutex::new(ServerCore::new(endpoint, config))),
            running,
            tick_duration,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Blocks until shutdown. The receive thread and the tick scheduler
    /// lock the same core; two ticks can never overlap, and network state
    /// is never touched concurrently with a tick.
    pub fn run(&self) -> io::Result<()> {
        let socket = self.core.lock().unwrap().clone_socket()?;
        socket.set_nonblocking(false)?;
        socket.set_read_timeout(Some(RECV_POLL))?;

        let rx_core = Arc::clone(&self.core);
        let rx_running = Arc::clone(&self.running);
        let receiver = thread::spawn(move || {
            let mut buffer = [0u8; MAX_PACKET_SIZE];
            // one receive may still complete after shutdown is requested;
            // handling it against the core is a harmless no-op
            while rx_running.load(Ordering::SeqCst) {
                match socket.recv_from(&mut buffer) {
                    Ok((size, addr)) => {
                        rx_core.lock().unwrap().handle_datagram(&buffer[..size], addr);
                    }
                    Err(ref e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("receive failed: {}", e);
                        break;
                    }
                }
            }
        });

        let mut last_tick = Instant::now();
        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            let dt = (now - last_tick).as_secs_f32();
            last_tick = now;

            {
                let mut core = self.core.lock().unwrap();
                core.tick(dt);
                if core.frame() % 300 == 0 {
                    debug!(
                        "frame {}: {}/{} players, {} entities",
                        core.frame(),
                        core.connected_count(),
                        core.config().max_clients,
                        core.entity_count()
                    );
                }
                for event in core.drain_events() {
                    log_event(&event);
                }
            }

            let elapsed = last_tick.elapsed();
            if elapsed < self.tick_duration {
                thread::sleep(self.tick_duration - elapsed);
            }
        }

        receiver.join().ok();
        Ok(())
    }
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::ClientConnecting { addr } => {
            info!("connection request from {}", addr);
        }
        ServerEvent::ClientConnected { player_id, addr } => {
            info!("player {} connected from {}", player_id, addr);
        }
        ServerEvent::ClientDisconnected { player_id, reason } => {
            info!("player {} {}", player_id, reason.as_str());
        }
        ServerEvent::ConnectionDenied { addr, reason } => {
            warn!("connection denied to {}: {}", addr, reason);
        }
        ServerEvent::Error { message } => {
            error!("{}", message);
        }
    }
}
