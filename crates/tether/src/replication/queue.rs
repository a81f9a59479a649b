use std::collections::HashMap;

use log::warn;

use crate::world::{EntityHandle, NetworkEntity};

use super::component::{ComponentData, ComponentKind, FieldMask, COMPONENT_KIND_COUNT};
use super::priority::NetPriority;

/// Dispatch delay table in ticks, highest-priority bucket first.
pub const DISPATCH_DELAY_TICKS: [u32; 4] = [0, 4, 8, 20];

#[derive(Debug, Clone, Copy)]
pub struct ComponentChange {
    pub fields: FieldMask,
    pub data: ComponentData,
}

#[derive(Debug, Clone)]
struct Accumulated {
    fields: FieldMask,
    data: ComponentData,
}

/// One tracked entity: at most one accumulated record per component kind.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub entity: EntityHandle,
    pub net: NetworkEntity,
    pub priority: NetPriority,
    components: [Option<Accumulated>; COMPONENT_KIND_COUNT],
}

impl QueueEntry {
    pub fn components(&self) -> impl Iterator<Item = (ComponentKind, FieldMask, &ComponentData)> {
        ComponentKind::ALL.into_iter().filter_map(|kind| {
            self.components[kind.slot()]
                .as_ref()
                .map(|acc| (kind, acc.fields, &acc.data))
        })
    }
}

/// Per-player accumulator of pending deltas with dispatch-readiness
/// timers, backed by a fixed pool. Pool exhaustion drops the new change
/// set — back-pressure through loss, never blocking.
pub struct ReplicationQueue {
    slots: Vec<Option<QueueEntry>>,
    free: Vec<usize>,
    index: HashMap<EntityHandle, usize>,
    tick_duration: f32,
}

impl ReplicationQueue {
    pub fn new(capacity: usize, tick_duration: f32) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            index: HashMap::new(),
            tick_duration,
        }
    }

    fn priority_bucket(priority: f32) -> usize {
        if priority >= 0.75 {
            0
        } else if priority >= 0.5 {
            1
        } else if priority >= 0.25 {
            2
        } else {
            3
        }
    }

    pub fn add_entity_changes(
        &mut self,
        entity: EntityHandle,
        net: NetworkEntity,
        changes: &[ComponentChange],
        score: NetPriority,
    ) {
        if let Some(&slot) = self.index.get(&entity) {
            let entry = self.slots[slot].as_mut().unwrap();
            // Keep the running dispatch timer: resetting it on every touch
            // would starve entities that change every tick.
            let remaining = entry.priority.remaining_queue_time;
            entry.priority = NetPriority {
                remaining_queue_time: remaining,
                ..score
            };

            for change in changes {
                let kind = change.data.kind();
                let incoming = change.fields.intersect(FieldMask::set_all(kind.field_count()));
                match &mut entry.components[kind.slot()] {
                    Some(accumulated) => {
                        accumulated.fields.merge(incoming);
                        accumulated.data.merge_from(&change.data, incoming);
                    }
                    // first sight of this component, no baseline exists
                    None => {
                        entry.components[kind.slot()] = Some(Accumulated {
                            fields: FieldMask::set_all(kind.field_count()),
                            data: change.data,
                        });
                    }
                }
            }
            return;
        }

        let Some(slot) = self.free.pop() else {
            warn!(
                "replication pool exhausted, dropping changes for {:?}",
                entity
            );
            return;
        };

        let mut components: [Option<Accumulated>; COMPONENT_KIND_COUNT] = Default::default();
        for change in changes {
            let kind = change.data.kind();
            // no baseline exists yet, every field replicates
            components[kind.slot()] = Some(Accumulated {
                fields: FieldMask::set_all(kind.field_count()),
                data: change.data,
            });
        }

        let bucket = Self::priority_bucket(score.priority);
        self.slots[slot] = Some(QueueEntry {
            entity,
            net,
            priority: NetPriority {
                remaining_queue_time: self.tick_duration * DISPATCH_DELAY_TICKS[bucket] as f32,
                ..score
            },
            components,
        });
        self.index.insert(entity, slot);
    }

    pub fn remove(&mut self, entity: EntityHandle) -> bool {
        if let Some(slot) = self.index.remove(&entity) {
            self.slots[slot] = None;
            self.free.push(slot);
            true
        } else {
            false
        }
    }

    pub fn get(&self, entity: EntityHandle) -> Option<&QueueEntry> {
        self.index
            .get(&entity)
            .and_then(|&slot| self.slots[slot].as_ref())
    }

    pub fn take(&mut self, entity: EntityHandle) -> Option<QueueEntry> {
        let slot = self.index.remove(&entity)?;
        let entry = self.slots[slot].take();
        self.free.push(slot);
        entry
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    /// Entities ready for dispatch, most urgent first.
    pub fn ready(&self) -> Vec<EntityHandle> {
        let mut ready: Vec<&QueueEntry> = self
            .iter()
            .filter(|entry| entry.priority.remaining_queue_time <= 0.0)
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .priority
                .partial_cmp(&a.priority.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ready.into_iter().map(|entry| entry.entity).collect()
    }

    /// Ages every waiting entry toward readiness. The timer only ever
    /// decreases until dispatch.
    pub fn age(&mut self, dt: f32) {
        for entry in self.slots.iter_mut().flatten() {
            if entry.priority.remaining_queue_time > 0.0 {
                entry.priority.remaining_queue_time -= dt;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::EntityStore;

    const TICK: f32 = 1.0 / 60.0;

    fn score(priority: f32) -> NetPriority {
        NetPriority {
            priority,
            relevance: 1.0,
            remaining_queue_time: 0.0,
        }
    }

    fn transform_change(x: f32, fields: FieldMask) -> ComponentChange {
        ComponentChange {
            fields,
            data: ComponentData::Transform {
                x,
                y: 0.0,
                rotation: 0.0,
            },
        }
    }

    fn spawn(store: &mut EntityStore) -> (EntityHandle, NetworkEntity) {
        let entity = store.spawn();
        let net = store.network_id(entity).unwrap();
        (entity, net)
    }

    #[test]
    fn readd_preserves_timer_but_takes_new_priority() {
        let mut store = EntityStore::new();
        let (entity, net) = spawn(&mut store);
        let mut queue = ReplicationQueue::new(16, TICK);

        queue.add_entity_changes(
            entity,
            net,
            &[transform_change(1.0, FieldMask::set_all(3))],
            score(0.5),
        );
        let first_remaining = queue.get(entity).unwrap().priority.remaining_queue_time;
        assert_eq!(first_remaining, TICK * DISPATCH_DELAY_TICKS[1] as f32);

        queue.add_entity_changes(
            entity,
            net,
            &[transform_change(2.0, FieldMask::set_all(3))],
            score(1.0),
        );

        let entry = queue.get(entity).unwrap();
        assert_eq!(entry.priority.remaining_queue_time, first_remaining);
        assert_eq!(entry.priority.priority, 1.0);
    }

    #[test]
    fn first_add_marks_all_fields() {
        let mut store = EntityStore::new();
        let (entity, net) = spawn(&mut store);
        let mut queue = ReplicationQueue::new(16, TICK);

        // caller claims only field 0 changed, but with no baseline the
        // whole component replicates
        let mut narrow = FieldMask::EMPTY;
        narrow.set(0);
        queue.add_entity_changes(entity, net, &[transform_change(5.0, narrow)], score(1.0));

        let entry = queue.get(entity).unwrap();
        let (_, fields, _) = entry.components().next().unwrap();
        assert_eq!(fields, FieldMask::set_all(3));
    }

    #[test]
    fn merge_unions_masks_and_overwrites_values() {
        let mut store = EntityStore::new();
        let (entity, net) = spawn(&mut store);
        let mut queue = ReplicationQueue::new(16, TICK);

        queue.add_entity_changes(entity, net, &[transform_change(1.0, FieldMask::set_all(3))], score(1.0));

        let mut only_x = FieldMask::EMPTY;
        only_x.set(0);
        queue.add_entity_changes(
            entity,
            net,
            &[ComponentChange {
                fields: only_x,
                data: ComponentData::Transform {
                    x: 42.0,
                    y: 99.0,
                    rotation: 99.0,
                },
            }],
            score(1.0),
        );

        let entry = queue.get(entity).unwrap();
        let (kind, fields, data) = entry.components().next().unwrap();
        assert_eq!(kind, ComponentKind::Transform);
        assert_eq!(fields, FieldMask::set_all(3));
        match data {
            ComponentData::Transform { x, y, .. } => {
                assert_eq!(*x, 42.0);
                // only field 0 was masked in; y kept the accumulated value
                assert_eq!(*y, 0.0);
            }
            _ => panic!("expected transform data"),
        }
    }

    #[test]
    fn highest_priority_dispatches_immediately() {
        let mut store = EntityStore::new();
        let (entity, net) = spawn(&mut store);
        let mut queue = ReplicationQueue::new(16, TICK);

        queue.add_entity_changes(entity, net, &[transform_change(1.0, FieldMask::set_all(3))], score(1.0));
        assert_eq!(queue.ready(), vec![entity]);
    }

    #[test]
    fn aging_reaches_readiness() {
        let mut store = EntityStore::new();
        let (entity, net) = spawn(&mut store);
        // whole-second ticks keep the countdown arithmetic exact
        let mut queue = ReplicationQueue::new(16, 1.0);

        queue.add_entity_changes(entity, net, &[transform_change(1.0, FieldMask::set_all(3))], score(0.6));
        assert!(queue.ready().is_empty());

        for _ in 0..DISPATCH_DELAY_TICKS[1] {
            queue.age(1.0);
        }
        assert_eq!(queue.ready(), vec![entity]);
    }

    #[test]
    fn ready_orders_by_priority() {
        let mut store = EntityStore::new();
        let (a, net_a) = spawn(&mut store);
        let (b, net_b) = spawn(&mut store);
        let mut queue = ReplicationQueue::new(16, TICK);

        queue.add_entity_changes(a, net_a, &[transform_change(1.0, FieldMask::set_all(3))], score(0.8));
        queue.add_entity_changes(b, net_b, &[transform_change(2.0, FieldMask::set_all(3))], score(0.9));

        assert_eq!(queue.ready(), vec![b, a]);
    }

    #[test]
    fn pool_exhaustion_drops_new_entities() {
        let mut store = EntityStore::new();
        let (a, net_a) = spawn(&mut store);
        let (b, net_b) = spawn(&mut store);
        let mut queue = ReplicationQueue::new(1, TICK);

        queue.add_entity_changes(a, net_a, &[transform_change(1.0, FieldMask::set_all(3))], score(1.0));
        queue.add_entity_changes(b, net_b, &[transform_change(2.0, FieldMask::set_all(3))], score(1.0));

        assert_eq!(queue.len(), 1);
        assert!(queue.get(b).is_none());

        // freeing the slot makes room again
        assert!(queue.remove(a));
        queue.add_entity_changes(b, net_b, &[transform_change(2.0, FieldMask::set_all(3))], score(1.0));
        assert!(queue.get(b).is_some());
    }
}
