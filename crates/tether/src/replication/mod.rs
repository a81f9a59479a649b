mod assembler;
mod component;
mod interest;
mod priority;
mod queue;

pub use assembler::PacketAssembler;
pub use component::{
    ComponentData, ComponentKind, ComponentKinds, ComponentRegistry, FieldMask,
    COMPONENT_KIND_COUNT,
};
pub use interest::InterestGrid;
pub use priority::{DistanceRings, NetPriority, PriorityCalculator, PriorityTag};
pub use queue::{ComponentChange, QueueEntry, ReplicationQueue, DISPATCH_DELAY_TICKS};
