pub mod net;
pub mod replication;
pub mod rollback;
pub mod world;

pub use net::{
    ClientPacket, ComponentUpdate, ConnectionState, ConnectionTable, EntityUpdate, FrameNumber,
    InputButtons, InputFrame, NetworkEndpoint, NetworkStats, PacketBuffer, PacketJitterBuffer,
    PlayerConnection, ReplicationPacket, SequenceBuffer, ServerPacket, WireError, DEFAULT_PORT,
    DEFAULT_TICK_RATE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE,
};
pub use net::{frame_compare, frame_newer, xor_scramble};
pub use replication::{
    ComponentChange, ComponentData, ComponentKind, ComponentKinds, ComponentRegistry,
    DistanceRings, FieldMask, InterestGrid, NetPriority, PacketAssembler, PriorityCalculator,
    PriorityTag, ReplicationQueue,
};
pub use rollback::{InputSample, RewindableWorld, RollbackEngine};
pub use world::{EntityHandle, EntityStore, Movement, NetworkEntity, PlayerTag, Transform};
