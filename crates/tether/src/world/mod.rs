mod entity;
mod store;

pub use entity::{EntityHandle, Movement, NetworkEntity, PlayerTag, Transform};
pub use store::EntityStore;
