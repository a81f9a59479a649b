mod connection;
mod endpoint;
mod jitter;
mod protocol;
mod sequence;
pub mod wire;

pub use connection::{ConnectionState, ConnectionTable, PlayerConnection};
pub use endpoint::{NetworkEndpoint, NetworkStats};
pub use jitter::PacketJitterBuffer;
pub use protocol::{
    frame_compare, frame_newer, xor_scramble, ClientPacket, ComponentUpdate, EntityUpdate,
    FrameNumber, InputButtons, InputFrame, ReplicationPacket, ServerPacket, DEFAULT_PORT,
    DEFAULT_TICK_RATE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE,
};
pub use sequence::{PacketBuffer, SequenceBuffer, StoredPacket};
pub use wire::WireError;
