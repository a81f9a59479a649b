use glam::Vec2;

use crate::replication::{ComponentData, ComponentKind, ComponentKinds, FieldMask};

use super::entity::{EntityHandle, Movement, NetworkEntity, PlayerTag, Transform};

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    alive: bool,
}

#[derive(Debug, Clone, Default)]
struct EntityRecord {
    transform: Option<Transform>,
    movement: Option<Movement>,
    player: Option<PlayerTag>,
    changed_at: [u64; 3],
}

/// Generation-tagged entity arena with per-component change versions.
/// Stands in for the external component store: stable handles, typed
/// read/write, and a "changed since version V" query. Deep-clones for
/// rollback snapshots.
#[derive(Debug, Clone)]
pub struct EntityStore {
    slots: Vec<Slot>,
    records: Vec<EntityRecord>,
    net_ids: Vec<NetworkEntity>,
    free: Vec<u32>,
    next_net_id: u32,
    version: u64,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            records: Vec::new(),
            net_ids: Vec::new(),
            free: Vec::new(),
            next_net_id: 1,
            version: 0,
        }
    }

    pub fn spawn(&mut self) -> EntityHandle {
        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.alive = true;
                self.records[index as usize] = EntityRecord::default();
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    alive: true,
                });
                self.records.push(EntityRecord::default());
                self.net_ids.push(NetworkEntity { id: 0, generation: 0 });
                (self.slots.len() - 1) as u32
            }
        };

        let generation = self.slots[index as usize].generation;
        self.net_ids[index as usize] = NetworkEntity {
            id: self.next_net_id,
            generation: generation as u16,
        };
        self.next_net_id += 1;

        EntityHandle::new(index, generation)
    }

    pub fn despawn(&mut self, handle: EntityHandle) -> bool {
        if !self.contains(handle) {
            return false;
        }
        let slot = &mut self.slots[handle.index() as usize];
        slot.alive = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index());
        true
    }

    pub fn contains(&self, handle: EntityHandle) -> bool {
        self.slots
            .get(handle.index() as usize)
            .is_some_and(|slot| slot.alive && slot.generation == handle.generation())
    }

    pub fn network_id(&self, handle: EntityHandle) -> Option<NetworkEntity> {
        if self.contains(handle) {
            Some(self.net_ids[handle.index() as usize])
        } else {
            None
        }
    }

    fn record(&self, handle: EntityHandle) -> Option<&EntityRecord> {
        if self.contains(handle) {
            Some(&self.records[handle.index() as usize])
        } else {
            None
        }
    }

    fn bump(&mut self, handle: EntityHandle, kind: ComponentKind) {
        self.version += 1;
        self.records[handle.index() as usize].changed_at[kind.slot()] = self.version;
    }

    pub fn transform(&self, handle: EntityHandle) -> Option<&Transform> {
        self.record(handle).and_then(|r| r.transform.as_ref())
    }

    pub fn set_transform(&mut self, handle: EntityHandle, transform: Transform) -> bool {
        if !self.contains(handle) {
            return false;
        }
        self.records[handle.index() as usize].transform = Some(transform);
        self.bump(handle, ComponentKind::Transform);
        true
    }

    pub fn movement(&self, handle: EntityHandle) -> Option<&Movement> {
        self.record(handle).and_then(|r| r.movement.as_ref())
    }

    pub fn set_movement(&mut self, handle: EntityHandle, movement: Movement) -> bool {
        if !self.contains(handle) {
            return false;
        }
        self.records[handle.index() as usize].movement = Some(movement);
        self.bump(handle, ComponentKind::Movement);
        true
    }

    pub fn player(&self, handle: EntityHandle) -> Option<&PlayerTag> {
        self.record(handle).and_then(|r| r.player.as_ref())
    }

    pub fn set_player(&mut self, handle: EntityHandle, player: PlayerTag) -> bool {
        if !self.contains(handle) {
            return false;
        }
        self.records[handle.index() as usize].player = Some(player);
        self.bump(handle, ComponentKind::Player);
        true
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Every live entity with at least one component written after
    /// `version`, with the set of kinds that changed.
    pub fn changed_since(&self, version: u64) -> Vec<(EntityHandle, ComponentKinds)> {
        let mut changed = Vec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.alive {
                continue;
            }
            let record = &self.records[index];
            let mut kinds = ComponentKinds::empty();
            for kind in ComponentKind::ALL {
                if record.changed_at[kind.slot()] > version {
                    kinds |= kind.into();
                }
            }
            if !kinds.is_empty() {
                changed.push((EntityHandle::new(index as u32, slot.generation), kinds));
            }
        }
        changed
    }

    pub fn entities(&self) -> impl Iterator<Item = EntityHandle> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.alive
                .then(|| EntityHandle::new(index as u32, slot.generation))
        })
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.alive).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one component as wire data, if present.
    pub fn component_data(&self, handle: EntityHandle, kind: ComponentKind) -> Option<ComponentData> {
        let record = self.record(handle)?;
        match kind {
            ComponentKind::Transform => record.transform.map(|t| ComponentData::Transform {
                x: t.position.x,
                y: t.position.y,
                rotation: t.rotation,
            }),
            ComponentKind::Movement => record.movement.map(|m| ComponentData::Movement {
                vx: m.velocity.x,
                vy: m.velocity.y,
            }),
            ComponentKind::Player => record.player.map(|p| ComponentData::Player {
                id: p.player_id,
            }),
        }
    }

    /// Masked write of wire data into the stored component, creating it if
    /// absent. This is the client-mirror path for incoming updates.
    pub fn apply_component(
        &mut self,
        handle: EntityHandle,
        data: &ComponentData,
        fields: FieldMask,
    ) -> bool {
        if !self.contains(handle) {
            return false;
        }
        let record = &mut self.records[handle.index() as usize];
        match data {
            ComponentData::Transform { x, y, rotation } => {
                let transform = record.transform.get_or_insert_with(Transform::default);
                if fields.contains(0) {
                    transform.position.x = *x;
                }
                if fields.contains(1) {
                    transform.position.y = *y;
                }
                if fields.contains(2) {
                    transform.rotation = *rotation;
                }
            }
            ComponentData::Movement { vx, vy } => {
                let movement = record.movement.get_or_insert_with(Movement::default);
                if fields.contains(0) {
                    movement.velocity.x = *vx;
                }
                if fields.contains(1) {
                    movement.velocity.y = *vy;
                }
            }
            ComponentData::Player { id } => {
                let player = record.player.get_or_insert_with(PlayerTag::default);
                if fields.contains(0) {
                    player.player_id = *id;
                }
            }
        }
        self.bump(handle, data.kind());
        true
    }

    /// One kinematic step: positions advance by velocity. Touches only
    /// entities that carry both transform and movement.
    pub fn integrate(&mut self, dt: f32) {
        let moving: Vec<EntityHandle> = self
            .entities()
            .filter(|&h| {
                self.movement(h).is_some_and(|m| m.velocity != Vec2::ZERO)
                    && self.transform(h).is_some()
            })
            .collect();

        for handle in moving {
            let velocity = self.movement(handle).unwrap().velocity;
            let mut transform = *self.transform(handle).unwrap();
            transform.position += velocity * dt;
            self.set_transform(handle, transform);
        }
    }
}
