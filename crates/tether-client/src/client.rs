use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use glam::Vec2;
use log::{debug, info, warn};

use tether::net::wire;
use tether::{
    frame_compare, xor_scramble, ClientPacket, ComponentData, ComponentRegistry, EntityHandle,
    EntityStore, FrameNumber, InputButtons, InputFrame, NetworkEndpoint, NetworkEntity,
    PacketJitterBuffer, ReplicationPacket, RollbackEngine, ServerPacket, MAX_PACKET_SIZE,
    PACKET_HEADER_SIZE,
};

use crate::prediction::PredictedWorld;

const JITTER_CAPACITY: usize = 64;
const ROLLBACK_RING: usize = 64;
const HANDSHAKE_ATTEMPTS: u32 = 5;
const HANDSHAKE_WAIT: Duration = Duration::from_millis(500);
const RECV_POLL: Duration = Duration::from_millis(20);
/// Once this many newer frames sit buffered behind a missing one, it was
/// lost; the consumer gives up on it and moves the window forward.
const SKIP_THRESHOLD: usize = 8;

fn generate_key() -> u32 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    Instant::now().hash(&mut hasher);
    hasher.finish() as u32
}

pub struct GameClient {
    endpoint: NetworkEndpoint,
    server_addr: SocketAddr,
    registry: ComponentRegistry,
    player_id: i32,
    sequence_key: u32,
    ack_key: u32,
    jitter: Arc<Mutex<PacketJitterBuffer>>,
    synced: Arc<AtomicBool>,
    mirror: EntityStore,
    net_entities: HashMap<u32, (u16, EntityHandle)>,
    world: PredictedWorld,
    engine: RollbackEngine<PredictedWorld>,
    local_tick: FrameNumber,
    frame_offset: FrameNumber,
    offset_known: bool,
    input_sequence: u16,
    own_net_id: Option<u32>,
}

impl GameClient {
    pub fn new(server_addr: SocketAddr) -> io::Result<Self> {
        let endpoint = NetworkEndpoint::bind("0.0.0.0:0")?;
        let world = PredictedWorld::new(Vec2::ZERO);
        let engine = RollbackEngine::new(&world, ROLLBACK_RING);

        Ok(Self {
            endpoint,
            server_addr,
            registry: ComponentRegistry::standard(),
            player_id: 0,
            sequence_key: generate_key(),
            ack_key: 0,
            jitter: Arc::new(Mutex::new(PacketJitterBuffer::new(JITTER_CAPACITY))),
            synced: Arc::new(AtomicBool::new(false)),
            mirror: EntityStore::new(),
            net_entities: HashMap::new(),
            world,
            engine,
            local_tick: 0,
            frame_offset: 0,
            offset_known: false,
            input_sequence: 0,
            own_net_id: None,
        })
    }

    fn scramble_key(&self) -> u32 {
        self.sequence_key ^ self.ack_key
    }

    /// syn -> syn-ack -> ack. The syn-ack must echo our key; anything else
    /// is ignored and the syn retried.
    pub fn connect(&mut self) -> io::Result<()> {
        for attempt in 0..HANDSHAKE_ATTEMPTS {
            let syn = wire::encode_client_packet(
                &ClientPacket::ConnectSyn {
                    sequence_key: self.sequence_key,
                },
                0,
            );
            self.endpoint.send_to(&syn, self.server_addr)?;

            let deadline = Instant::now() + HANDSHAKE_WAIT;
            while Instant::now() < deadline {
                for (datagram, addr) in self.endpoint.receive()? {
                    if addr != self.server_addr {
                        continue;
                    }
                    let Ok((header, body)) = wire::split_body(&datagram) else {
                        continue;
                    };
                    let Ok(packet) = wire::decode_server_body(header.tag, body, &self.registry)
                    else {
                        continue;
                    };
                    match packet {
                        ServerPacket::ConnectSynAck {
                            sequence_key,
                            ack_key,
                        } => {
                            if sequence_key != self.sequence_key {
                                warn!("syn-ack echoed the wrong key, ignoring");
                                continue;
                            }
                            self.ack_key = ack_key;
                            self.player_id = header.player_id;

                            let ack = wire::encode_client_packet(
                                &ClientPacket::ConnectAck {
                                    sequence_key,
                                    ack_key,
                                },
                                self.player_id,
                            );
                            self.endpoint.send_to(&ack, self.server_addr)?;
                            info!("connected as player {}", self.player_id);
                            return Ok(());
                        }
                        ServerPacket::Disconnect { reason } => {
                            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, reason));
                        }
                        _ => {}
                    }
                }
                thread::sleep(Duration::from_millis(10));
            }
            debug!("handshake attempt {} timed out", attempt + 1);
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))
    }

    pub fn run(&mut self, tick_rate: u32, duration: Option<Duration>) -> io::Result<()> {
        let running = self.endpoint.running();
        self.spawn_receiver(Arc::clone(&running))?;

        let dt = 1.0 / tick_rate as f32;
        let tick_duration = Duration::from_secs_f64(1.0 / tick_rate as f64);
        let started = Instant::now();

        while running.load(Ordering::SeqCst) {
            let tick_start = Instant::now();
            self.tick(dt);

            if duration.is_some_and(|limit| started.elapsed() >= limit) {
                break;
            }
            let elapsed = tick_start.elapsed();
            if elapsed < tick_duration {
                thread::sleep(tick_duration - elapsed);
            }
        }

        // best-effort goodbye
        let mut bytes = wire::encode_client_packet(&ClientPacket::Disconnect, self.player_id);
        xor_scramble(&mut bytes[PACKET_HEADER_SIZE..], self.scramble_key());
        let _ = self.endpoint.send_to(&bytes, self.server_addr);
        self.endpoint.shutdown();
        Ok(())
    }

    fn spawn_receiver(&self, running: Arc<AtomicBool>) -> io::Result<()> {
        let socket = self.endpoint.clone_socket()?;
        socket.set_nonblocking(false)?;
        socket.set_read_timeout(Some(RECV_POLL))?;

        let jitter = Arc::clone(&self.jitter);
        let synced = Arc::clone(&self.synced);
        let key = self.scramble_key();
        let registry = self.registry.clone();
        let server_addr = self.server_addr;

        thread::spawn(move || {
            let mut buffer = [0u8; MAX_PACKET_SIZE];
            // one receive may still complete after shutdown; it is dropped
            while running.load(Ordering::SeqCst) {
                let (size, addr) = match socket.recv_from(&mut buffer) {
                    Ok(received) => received,
                    Err(ref e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        warn!("receive failed: {}", e);
                        break;
                    }
                };
                if addr != server_addr {
                    continue;
                }
                let Ok((header, body)) = wire::split_body(&buffer[..size]) else {
                    warn!("dropping malformed packet from server");
                    continue;
                };

                let mut body = body.to_vec();
                xor_scramble(&mut body, key);
                match wire::decode_server_body(header.tag, &body, &registry) {
                    Ok(ServerPacket::Replication(packet)) => {
                        let mut jitter = jitter.lock().unwrap();
                        if !synced.load(Ordering::SeqCst) {
                            jitter.reset(packet.frame.wrapping_sub(1));
                            synced.store(true, Ordering::SeqCst);
                        }
                        jitter.add_packet(packet.frame, &body);
                    }
                    Ok(ServerPacket::Disconnect { reason }) => {
                        info!("server closed the connection: {}", reason);
                        running.store(false, Ordering::SeqCst);
                    }
                    Ok(_) => {}
                    Err(e) => debug!("dropping undecodable packet: {}", e),
                }
            }
        });
        Ok(())
    }

    fn tick(&mut self, dt: f32) {
        // the final ack may be lost; repeat it for a moment, the server
        // ignores extras once connected
        if self.local_tick < 60 {
            let ack = wire::encode_client_packet(
                &ClientPacket::ConnectAck {
                    sequence_key: self.sequence_key,
                    ack_key: self.ack_key,
                },
                self.player_id,
            );
            let _ = self.endpoint.send_to(&ack, self.server_addr);
        }

        let input = self.sample_input();
        self.engine.update(&mut self.world, &input, dt);
        self.engine.fixed_update(&mut self.world, dt);
        self.local_tick = self.local_tick.wrapping_add(1);

        let mut bytes = wire::encode_client_packet(
            &ClientPacket::Input {
                frame: self.local_tick,
                input,
            },
            self.player_id,
        );
        xor_scramble(&mut bytes[PACKET_HEADER_SIZE..], self.scramble_key());
        if let Err(e) = self.endpoint.send_to(&bytes, self.server_addr) {
            warn!("input send failed: {}", e);
        }

        if self.synced.load(Ordering::SeqCst) {
            self.consume_replication();
        }

        if self.local_tick % 120 == 0 {
            info!(
                "tick {}: predicted {:?}, {} mirrored entities",
                self.local_tick,
                self.world.position(),
                self.mirror.len()
            );
        }
    }

    /// Drains the jitter buffer in frame order. Frames only come out in
    /// order; a frame that never arrives is skipped once enough newer ones
    /// are queued behind it.
    fn consume_replication(&mut self) {
        for _ in 0..JITTER_CAPACITY {
            let payload = {
                let mut jitter = self.jitter.lock().unwrap();
                let expected = jitter.last_read_frame().wrapping_add(1);
                match jitter.try_read(expected) {
                    Some(payload) => Some(payload),
                    None if jitter.len() >= SKIP_THRESHOLD => jitter
                        .oldest_frame()
                        .and_then(|oldest| jitter.try_read(oldest)),
                    None => None,
                }
            };
            let Some(payload) = payload else {
                break;
            };

            match wire::decode_replication_packet(&payload, &self.registry) {
                Ok(packet) => self.apply_replication(packet),
                Err(e) => warn!("dropping malformed replication payload: {}", e),
            }
        }
    }

    fn apply_replication(&mut self, packet: ReplicationPacket) {
        for update in &packet.entities {
            let handle = self.mirror_entity(update.entity);
            for component in &update.components {
                self.mirror
                    .apply_component(handle, &component.data, component.fields);
                if let ComponentData::Player { id } = component.data {
                    if id == self.player_id {
                        self.own_net_id = Some(update.entity.id);
                    }
                }
            }
        }

        let Some(own_id) = self.own_net_id else {
            return;
        };
        let Some(update) = packet.entities.iter().find(|u| u.entity.id == own_id) else {
            return;
        };
        let Some(authoritative) = update.components.iter().find_map(|c| match c.data {
            ComponentData::Transform { x, y, .. } => Some(Vec2::new(x, y)),
            _ => None,
        }) else {
            return;
        };

        self.reconcile(packet.frame, authoritative);
    }

    /// Resolves a wire identity to a mirror entity; a changed generation
    /// means the old entity is gone and a fresh one takes the id.
    fn mirror_entity(&mut self, net: NetworkEntity) -> EntityHandle {
        if let Some(&(generation, handle)) = self.net_entities.get(&net.id) {
            if generation == net.generation {
                return handle;
            }
            self.mirror.despawn(handle);
        }
        let handle = self.mirror.spawn();
        self.net_entities.insert(net.id, (net.generation, handle));
        handle
    }

    /// Rewind to the corrected frame, overwrite with the authoritative
    /// state, replay buffered local inputs forward.
    fn reconcile(&mut self, frame: FrameNumber, authoritative: Vec2) {
        if !self.offset_known {
            self.frame_offset = self.local_tick.wrapping_sub(frame);
            self.offset_known = true;
        }
        let local_at_frame = frame.wrapping_add(self.frame_offset);
        let distance = frame_compare(self.local_tick, local_at_frame);

        if distance <= 0 {
            self.world.set_position(authoritative);
            return;
        }
        let distance = distance as usize;
        if distance >= ROLLBACK_RING {
            // too old to replay; snap and let prediction rebuild
            self.world.set_position(authoritative);
            return;
        }

        self.engine.rewind(&mut self.world, distance);
        self.world.set_position(authoritative);
        self.engine.play_forward(&mut self.world, distance);
    }

    fn sample_input(&mut self) -> InputFrame {
        self.input_sequence = self.input_sequence.wrapping_add(1);
        let mut input = InputFrame::new(self.input_sequence);

        // wander in a slow circle so there is always something to replicate
        let angle = self.local_tick as f32 * 0.05;
        input.move_x = angle.cos();
        input.move_y = angle.sin();
        if (self.local_tick / 120) % 2 == 0 {
            input.buttons |= InputButtons::FORWARD;
        }
        input
    }
}
