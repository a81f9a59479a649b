//! Hand-rolled wire codec: little-endian fixed-width integers, IEEE-754
//! 32-bit floats, explicit type tags. Field masks are never serialized
//! directly; only the derived field count and explicit field indices go
//! on the wire.

use thiserror::Error;

use crate::replication::{ComponentData, ComponentRegistry, FieldMask};
use crate::world::NetworkEntity;

use super::protocol::{
    ClientPacket, ComponentUpdate, EntityUpdate, InputButtons, InputFrame, ReplicationPacket,
    ServerPacket, PACKET_HEADER_SIZE,
};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("payload truncated at byte {offset}")]
    Truncated { offset: usize },
    #[error("unknown packet type {tag}")]
    UnknownPacketType { tag: u8 },
    #[error("unknown component id {id}")]
    UnknownComponent { id: u16 },
    #[error("field index {index} out of range for component {id}")]
    UnknownField { id: u16, index: u8 },
    #[error("invalid utf-8 in string payload")]
    InvalidString,
}

/// Byte destination for the encoder. `MeasureSink` lets the packet
/// assembler run the exact same encode pass to size an entry without
/// building the bytes.
pub trait WireSink {
    fn put(&mut self, bytes: &[u8]);
    fn written(&self) -> usize;

    fn put_u8(&mut self, v: u8) {
        self.put(&[v]);
    }
    fn put_u16(&mut self, v: u16) {
        self.put(&v.to_le_bytes());
    }
    fn put_u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }
    fn put_i32(&mut self, v: i32) {
        self.put(&v.to_le_bytes());
    }
    fn put_u64(&mut self, v: u64) {
        self.put(&v.to_le_bytes());
    }
    fn put_f32(&mut self, v: f32) {
        self.put(&v.to_le_bytes());
    }
    fn put_str(&mut self, s: &str) {
        self.put_u16(s.len() as u16);
        self.put(s.as_bytes());
    }
}

impl WireSink for Vec<u8> {
    fn put(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
    fn written(&self) -> usize {
        self.len()
    }
}

#[derive(Debug, Default)]
pub struct MeasureSink {
    len: usize,
}

impl MeasureSink {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl WireSink for MeasureSink {
    fn put(&mut self, bytes: &[u8]) {
        self.len += bytes.len();
    }
    fn written(&self) -> usize {
        self.len
    }
}

pub struct PayloadReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.offset + n > self.data.len() {
            return Err(WireError::Truncated {
                offset: self.offset,
            });
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }
    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }
    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    pub fn read_str(&mut self) -> Result<String, WireError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidString)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

const CLIENT_CONNECT_SYN: u8 = 1;
const CLIENT_CONNECT_ACK: u8 = 2;
const CLIENT_INPUT: u8 = 3;
const CLIENT_PING: u8 = 4;
const CLIENT_DISCONNECT: u8 = 5;

const SERVER_CONNECT_SYN_ACK: u8 = 1;
const SERVER_REPLICATION: u8 = 2;
const SERVER_PONG: u8 = 3;
const SERVER_DISCONNECT: u8 = 4;

#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub tag: u8,
    pub player_id: i32,
}

/// Reads the clear-text prefix; the remainder of the datagram may still be
/// scrambled and is decoded separately once the connection key is known.
pub fn decode_header(data: &[u8]) -> Result<PacketHeader, WireError> {
    let mut reader = PayloadReader::new(data);
    let tag = reader.read_u8()?;
    let player_id = reader.read_i32()?;
    Ok(PacketHeader { tag, player_id })
}

fn put_header(sink: &mut impl WireSink, tag: u8, player_id: i32) {
    sink.put_u8(tag);
    sink.put_i32(player_id);
}

pub fn encode_client_packet(packet: &ClientPacket, player_id: i32) -> Vec<u8> {
    let mut buf = Vec::new();
    match packet {
        ClientPacket::ConnectSyn { sequence_key } => {
            put_header(&mut buf, CLIENT_CONNECT_SYN, player_id);
            buf.put_u32(*sequence_key);
        }
        ClientPacket::ConnectAck {
            sequence_key,
            ack_key,
        } => {
            put_header(&mut buf, CLIENT_CONNECT_ACK, player_id);
            buf.put_u32(*sequence_key);
            buf.put_u32(*ack_key);
        }
        ClientPacket::Input { frame, input } => {
            put_header(&mut buf, CLIENT_INPUT, player_id);
            buf.put_u32(*frame as u32);
            buf.put_u16(input.sequence);
            buf.put_u8(input.buttons.bits());
            buf.put_f32(input.move_x);
            buf.put_f32(input.move_y);
        }
        ClientPacket::Ping { timestamp } => {
            put_header(&mut buf, CLIENT_PING, player_id);
            buf.put_u64(*timestamp);
        }
        ClientPacket::Disconnect => {
            put_header(&mut buf, CLIENT_DISCONNECT, player_id);
        }
    }
    buf
}

pub fn decode_client_body(tag: u8, body: &[u8]) -> Result<ClientPacket, WireError> {
    let mut reader = PayloadReader::new(body);
    match tag {
        CLIENT_CONNECT_SYN => Ok(ClientPacket::ConnectSyn {
            sequence_key: reader.read_u32()?,
        }),
        CLIENT_CONNECT_ACK => Ok(ClientPacket::ConnectAck {
            sequence_key: reader.read_u32()?,
            ack_key: reader.read_u32()?,
        }),
        CLIENT_INPUT => {
            let frame = reader.read_u32()? as u16;
            let sequence = reader.read_u16()?;
            let buttons = InputButtons::from_bits_truncate(reader.read_u8()?);
            let move_x = reader.read_f32()?;
            let move_y = reader.read_f32()?;
            Ok(ClientPacket::Input {
                frame,
                input: InputFrame {
                    sequence,
                    buttons,
                    move_x,
                    move_y,
                },
            })
        }
        CLIENT_PING => Ok(ClientPacket::Ping {
            timestamp: reader.read_u64()?,
        }),
        CLIENT_DISCONNECT => Ok(ClientPacket::Disconnect),
        tag => Err(WireError::UnknownPacketType { tag }),
    }
}

pub fn encode_server_packet(
    packet: &ServerPacket,
    player_id: i32,
    registry: &ComponentRegistry,
) -> Vec<u8> {
    let mut buf = Vec::new();
    match packet {
        ServerPacket::ConnectSynAck {
            sequence_key,
            ack_key,
        } => {
            put_header(&mut buf, SERVER_CONNECT_SYN_ACK, player_id);
            buf.put_u32(*sequence_key);
            buf.put_u32(*ack_key);
        }
        ServerPacket::Replication(replication) => {
            put_header(&mut buf, SERVER_REPLICATION, player_id);
            encode_replication_packet(replication, registry, &mut buf);
        }
        ServerPacket::Pong { timestamp } => {
            put_header(&mut buf, SERVER_PONG, player_id);
            buf.put_u64(*timestamp);
        }
        ServerPacket::Disconnect { reason } => {
            put_header(&mut buf, SERVER_DISCONNECT, player_id);
            buf.put_str(reason);
        }
    }
    buf
}

pub fn decode_server_body(
    tag: u8,
    body: &[u8],
    registry: &ComponentRegistry,
) -> Result<ServerPacket, WireError> {
    let mut reader = PayloadReader::new(body);
    match tag {
        SERVER_CONNECT_SYN_ACK => Ok(ServerPacket::ConnectSynAck {
            sequence_key: reader.read_u32()?,
            ack_key: reader.read_u32()?,
        }),
        SERVER_REPLICATION => Ok(ServerPacket::Replication(decode_replication_packet(
            body, registry,
        )?)),
        SERVER_PONG => Ok(ServerPacket::Pong {
            timestamp: reader.read_u64()?,
        }),
        SERVER_DISCONNECT => Ok(ServerPacket::Disconnect {
            reason: reader.read_str()?,
        }),
        tag => Err(WireError::UnknownPacketType { tag }),
    }
}

/// Convenience split of a full datagram into header and body slice.
pub fn split_body(data: &[u8]) -> Result<(PacketHeader, &[u8]), WireError> {
    let header = decode_header(data)?;
    Ok((header, &data[PACKET_HEADER_SIZE..]))
}

pub fn encode_replication_packet(
    packet: &ReplicationPacket,
    registry: &ComponentRegistry,
    sink: &mut impl WireSink,
) {
    sink.put_u32(packet.frame as u32);
    sink.put_u8(packet.entities.len() as u8);
    for update in &packet.entities {
        encode_entity_update(update, registry, sink);
    }
}

pub fn decode_replication_packet(
    body: &[u8],
    registry: &ComponentRegistry,
) -> Result<ReplicationPacket, WireError> {
    let mut reader = PayloadReader::new(body);
    let frame = reader.read_u32()? as u16;
    let entity_count = reader.read_u8()?;
    let mut entities = Vec::with_capacity(entity_count as usize);
    for _ in 0..entity_count {
        entities.push(decode_entity_update(&mut reader, registry)?);
    }
    Ok(ReplicationPacket { frame, entities })
}

/// Per-entity block: `[id:u32][generation:u16][componentCount:u8]` then per
/// component `[wireId:u16][fieldCount:u8]` and one `fieldIndex:u8` + typed
/// value per set bit. The field count always equals the mask population.
pub fn encode_entity_update(
    update: &EntityUpdate,
    registry: &ComponentRegistry,
    sink: &mut impl WireSink,
) {
    sink.put_u32(update.entity.id);
    sink.put_u16(update.entity.generation);
    sink.put_u8(update.components.len() as u8);
    for component in &update.components {
        sink.put_u16(registry.wire_id(component.kind));
        sink.put_u8(component.fields.count() as u8);
        component.data.encode_fields(component.fields, sink);
    }
}

pub fn decode_entity_update(
    reader: &mut PayloadReader<'_>,
    registry: &ComponentRegistry,
) -> Result<EntityUpdate, WireError> {
    let entity = NetworkEntity {
        id: reader.read_u32()?,
        generation: reader.read_u16()?,
    };
    let component_count = reader.read_u8()?;
    let mut components = Vec::with_capacity(component_count as usize);
    for _ in 0..component_count {
        let wire_id = reader.read_u16()?;
        let kind = registry
            .kind_for(wire_id)
            .ok_or(WireError::UnknownComponent { id: wire_id })?;
        let field_count = reader.read_u8()?;
        let mut fields = FieldMask::EMPTY;
        let mut data = ComponentData::empty(kind);
        for _ in 0..field_count {
            let index = reader.read_u8()?;
            if !data.decode_field(index, reader)? {
                return Err(WireError::UnknownField {
                    id: wire_id,
                    index,
                });
            }
            fields.set(index);
        }
        components.push(ComponentUpdate { kind, fields, data });
    }
    Ok(EntityUpdate { entity, components })
}
