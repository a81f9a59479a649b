use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::Duration;

use tether::net::wire;
use tether::{
    ClientPacket, ComponentChange, ComponentData, ComponentRegistry, ConnectionState,
    ConnectionTable, EntityStore, FieldMask, NetPriority, NetworkEndpoint, PacketAssembler,
    PacketJitterBuffer, ReplicationQueue, ServerPacket, MAX_PACKET_SIZE,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(10, Ordering::SeqCst)
}

fn wait_for_datagrams(
    endpoint: &mut NetworkEndpoint,
    timeout_ms: u64,
) -> Option<Vec<(Vec<u8>, SocketAddr)>> {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        let received = endpoint.receive().unwrap();
        if !received.is_empty() {
            return Some(received);
        }
        thread::sleep(Duration::from_millis(1));
    }
    None
}

fn loopback_pair() -> (NetworkEndpoint, NetworkEndpoint, SocketAddr, SocketAddr) {
    let port = next_port();
    let server_addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let client_addr: SocketAddr = format!("127.0.0.1:{}", port + 1).parse().unwrap();
    let server = NetworkEndpoint::bind(server_addr).unwrap();
    let client = NetworkEndpoint::bind(client_addr).unwrap();
    (server, client, server_addr, client_addr)
}

fn score(priority: f32) -> NetPriority {
    NetPriority {
        priority,
        relevance: 1.0,
        remaining_queue_time: 0.0,
    }
}

#[test]
fn handshake_full_flow() {
    let (mut server, mut client, server_addr, _) = loopback_pair();
    let registry = ComponentRegistry::standard();
    let mut connections = ConnectionTable::new(8, 32, 1.0 / 60.0);

    let client_key = 0x1234_5678u32;
    let server_key = 0x9ABC_DEF0u32;

    let syn = wire::encode_client_packet(
        &ClientPacket::ConnectSyn {
            sequence_key: client_key,
        },
        0,
    );
    client.send_to(&syn, server_addr).unwrap();

    // server side: create the pending connection and answer with both keys
    let received = wait_for_datagrams(&mut server, 200).expect("no syn received");
    let (datagram, from_addr) = &received[0];
    let (header, body) = wire::split_body(datagram).unwrap();
    match wire::decode_client_body(header.tag, body).unwrap() {
        ClientPacket::ConnectSyn { sequence_key } => {
            assert_eq!(sequence_key, client_key);
            let connection = connections
                .get_or_create_pending(*from_addr, sequence_key, server_key)
                .unwrap();
            let response = wire::encode_server_packet(
                &ServerPacket::ConnectSynAck {
                    sequence_key: connection.sequence_key,
                    ack_key: connection.ack_key,
                },
                connection.player_id,
                &registry,
            );
            server.send_to(&response, *from_addr).unwrap();
        }
        other => panic!("expected syn, got {:?}", other),
    }

    // client side: check the echo and acknowledge
    let received = wait_for_datagrams(&mut client, 200).expect("no syn-ack received");
    let (datagram, _) = &received[0];
    let (header, body) = wire::split_body(datagram).unwrap();
    let player_id = header.player_id;
    match wire::decode_server_body(header.tag, body, &registry).unwrap() {
        ServerPacket::ConnectSynAck {
            sequence_key,
            ack_key,
        } => {
            assert_eq!(sequence_key, client_key);
            assert_eq!(ack_key, server_key);
            let ack = wire::encode_client_packet(
                &ClientPacket::ConnectAck {
                    sequence_key,
                    ack_key,
                },
                player_id,
            );
            client.send_to(&ack, server_addr).unwrap();
        }
        other => panic!("expected syn-ack, got {:?}", other),
    }

    let received = wait_for_datagrams(&mut server, 200).expect("no ack received");
    let (datagram, from_addr) = &received[0];
    let (header, body) = wire::split_body(datagram).unwrap();
    match wire::decode_client_body(header.tag, body).unwrap() {
        ClientPacket::ConnectAck {
            sequence_key,
            ack_key,
        } => {
            let connection = connections.get_by_addr_mut(from_addr).unwrap();
            assert!(connection.try_complete_handshake(sequence_key, ack_key));
        }
        other => panic!("expected ack, got {:?}", other),
    }

    assert_eq!(connections.connected_count(), 1);
}

#[test]
fn mismatched_ack_leaves_connection_pending() {
    let (mut server, mut client, server_addr, _) = loopback_pair();
    let mut connections = ConnectionTable::new(8, 32, 1.0 / 60.0);

    let syn = wire::encode_client_packet(&ClientPacket::ConnectSyn { sequence_key: 7 }, 0);
    client.send_to(&syn, server_addr).unwrap();

    let received = wait_for_datagrams(&mut server, 200).expect("no syn received");
    let (_, from_addr) = &received[0];
    connections
        .get_or_create_pending(*from_addr, 7, 99)
        .unwrap();

    let bad_ack = wire::encode_client_packet(
        &ClientPacket::ConnectAck {
            sequence_key: 7,
            ack_key: 1000,
        },
        1,
    );
    client.send_to(&bad_ack, server_addr).unwrap();

    let received = wait_for_datagrams(&mut server, 200).expect("no ack received");
    let (datagram, from_addr) = &received[0];
    let (header, body) = wire::split_body(datagram).unwrap();
    if let ClientPacket::ConnectAck {
        sequence_key,
        ack_key,
    } = wire::decode_client_body(header.tag, body).unwrap()
    {
        let connection = connections.get_by_addr_mut(from_addr).unwrap();
        assert!(!connection.try_complete_handshake(sequence_key, ack_key));
        assert_eq!(connection.state, ConnectionState::SynReceived);
    } else {
        panic!("expected ack");
    }

    assert_eq!(connections.connected_count(), 0);
}

#[test]
fn out_of_order_replication_reassembles_in_frame_order() {
    let (mut server, mut client, _, client_addr) = loopback_pair();
    let registry = ComponentRegistry::standard();
    let assembler = PacketAssembler::new(MAX_PACKET_SIZE, ComponentRegistry::standard());

    let mut store = EntityStore::new();
    let entity = store.spawn();
    let net = store.network_id(entity).unwrap();
    let mut queue = ReplicationQueue::new(32, 1.0 / 60.0);

    // one packet per frame, each carrying a fresh x value
    let mut packets = Vec::new();
    for frame in 1u16..=3 {
        queue.add_entity_changes(
            entity,
            net,
            &[ComponentChange {
                fields: FieldMask::set_all(3),
                data: ComponentData::Transform {
                    x: frame as f32 * 10.0,
                    y: 0.0,
                    rotation: 0.0,
                },
            }],
            score(1.0),
        );
        let packet = assembler
            .assemble(&mut queue, frame, 1.0 / 60.0)
            .expect("entry should pack");
        packets.push(wire::encode_server_packet(
            &ServerPacket::Replication(packet),
            1,
            &registry,
        ));
    }

    // deliver out of order: 3, 1, 2
    for index in [2usize, 0, 1] {
        server.send_to(&packets[index], client_addr).unwrap();
    }

    let mut jitter = PacketJitterBuffer::new(16);
    let mut buffered = 0;
    while buffered < 3 {
        let received = wait_for_datagrams(&mut client, 500).expect("missing replication packets");
        for (datagram, _) in received {
            let (header, body) = wire::split_body(&datagram).unwrap();
            match wire::decode_server_body(header.tag, body, &registry).unwrap() {
                ServerPacket::Replication(packet) => {
                    assert!(jitter.add_packet(packet.frame, body));
                    buffered += 1;
                }
                other => panic!("expected replication, got {:?}", other),
            }
        }
    }

    // frames come back out strictly in order regardless of arrival order
    for frame in 1u16..=3 {
        let payload = jitter.try_read(frame).expect("frame should be buffered");
        let packet = wire::decode_replication_packet(&payload, &registry).unwrap();
        assert_eq!(packet.frame, frame);
        assert_eq!(packet.entities.len(), 1);
        assert_eq!(packet.entities[0].entity, net);
        match packet.entities[0].components[0].data {
            ComponentData::Transform { x, .. } => assert_eq!(x, frame as f32 * 10.0),
            _ => panic!("expected transform"),
        }
    }
    assert!(jitter.try_read(4).is_none());
}

#[test]
fn ping_pong_roundtrip() {
    let (mut server, mut client, server_addr, _) = loopback_pair();
    let registry = ComponentRegistry::standard();

    let ping = wire::encode_client_packet(&ClientPacket::Ping { timestamp: 424242 }, 3);
    client.send_to(&ping, server_addr).unwrap();

    let received = wait_for_datagrams(&mut server, 200).expect("no ping received");
    let (datagram, from_addr) = &received[0];
    let (header, body) = wire::split_body(datagram).unwrap();
    match wire::decode_client_body(header.tag, body).unwrap() {
        ClientPacket::Ping { timestamp } => {
            let pong =
                wire::encode_server_packet(&ServerPacket::Pong { timestamp }, 3, &registry);
            server.send_to(&pong, *from_addr).unwrap();
        }
        other => panic!("expected ping, got {:?}", other),
    }

    let received = wait_for_datagrams(&mut client, 200).expect("no pong received");
    let (datagram, _) = &received[0];
    let (header, body) = wire::split_body(datagram).unwrap();
    match wire::decode_server_body(header.tag, body, &registry).unwrap() {
        ServerPacket::Pong { timestamp } => assert_eq!(timestamp, 424242),
        other => panic!("expected pong, got {:?}", other),
    }
}

#[test]
fn oversized_packet_is_refused() {
    let (mut server, _, _, client_addr) = loopback_pair();
    let oversized = vec![0u8; MAX_PACKET_SIZE + 1];
    assert!(server.send_to(&oversized, client_addr).is_err());
}
