use crate::net::wire::{self, MeasureSink};
use crate::net::{ComponentUpdate, EntityUpdate, FrameNumber, ReplicationPacket, PACKET_HEADER_SIZE};

use super::component::ComponentRegistry;
use super::queue::{QueueEntry, ReplicationQueue};

// frame:u32 + entityCount:u8
const REPLICATION_PREFIX_SIZE: usize = 5;

/// Packs ready queue entries into an MTU-bounded replication packet each
/// network tick. Entry sizes come from a dry-run pass of the same encoder
/// against a counting sink.
pub struct PacketAssembler {
    max_packet_size: usize,
    registry: ComponentRegistry,
}

impl PacketAssembler {
    pub fn new(max_packet_size: usize, registry: ComponentRegistry) -> Self {
        assert!(max_packet_size > PACKET_HEADER_SIZE + REPLICATION_PREFIX_SIZE);
        Self {
            max_packet_size,
            registry,
        }
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Drains as many ready entries as fit, most urgent first. Entries that
    /// do not fit stay queued for the next tick; entries still waiting age
    /// by `dt`. Returns `None` when nothing was packed.
    pub fn assemble(
        &self,
        queue: &mut ReplicationQueue,
        frame: FrameNumber,
        dt: f32,
    ) -> Option<ReplicationPacket> {
        let budget = self.max_packet_size - PACKET_HEADER_SIZE - REPLICATION_PREFIX_SIZE;
        let mut used = 0usize;
        let mut entities = Vec::new();

        for entity in queue.ready() {
            if entities.len() == u8::MAX as usize {
                break;
            }
            let Some(entry) = queue.get(entity) else {
                continue;
            };
            let update = entry_to_update(entry);

            let mut measure = MeasureSink::new();
            wire::encode_entity_update(&update, &self.registry, &mut measure);
            if used + measure.len() > budget {
                // out of budget; whatever is left retries next tick
                break;
            }

            used += measure.len();
            entities.push(update);
            queue.take(entity);
        }

        queue.age(dt);

        if entities.is_empty() {
            None
        } else {
            Some(ReplicationPacket { frame, entities })
        }
    }
}

fn entry_to_update(entry: &QueueEntry) -> EntityUpdate {
    EntityUpdate {
        entity: entry.net,
        components: entry
            .components()
            .map(|(kind, fields, data)| ComponentUpdate {
                kind,
                fields,
                data: *data,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::{ComponentChange, ComponentData, FieldMask, NetPriority};
    use crate::world::{EntityHandle, EntityStore, NetworkEntity};

    const TICK: f32 = 1.0 / 60.0;

    fn score(priority: f32) -> NetPriority {
        NetPriority {
            priority,
            relevance: 1.0,
            remaining_queue_time: 0.0,
        }
    }

    fn transform_change() -> ComponentChange {
        ComponentChange {
            fields: FieldMask::set_all(3),
            data: ComponentData::Transform {
                x: 1.0,
                y: 2.0,
                rotation: 3.0,
            },
        }
    }

    fn spawn(store: &mut EntityStore) -> (EntityHandle, NetworkEntity) {
        let entity = store.spawn();
        let net = store.network_id(entity).unwrap();
        (entity, net)
    }

    #[test]
    fn packed_entries_leave_the_queue() {
        let mut store = EntityStore::new();
        let (entity, net) = spawn(&mut store);
        let mut queue = ReplicationQueue::new(16, TICK);
        let assembler = PacketAssembler::new(1200, ComponentRegistry::standard());

        queue.add_entity_changes(entity, net, &[transform_change()], score(1.0));

        let packet = assembler.assemble(&mut queue, 7, TICK).unwrap();
        assert_eq!(packet.frame, 7);
        assert_eq!(packet.entities.len(), 1);
        assert_eq!(packet.entities[0].entity, net);
        assert!(queue.is_empty());

        assert!(assembler.assemble(&mut queue, 8, TICK).is_none());
    }

    #[test]
    fn unready_entries_are_not_packed_but_age() {
        let mut store = EntityStore::new();
        let (entity, net) = spawn(&mut store);
        // whole-second ticks keep the countdown arithmetic exact
        let mut queue = ReplicationQueue::new(16, 1.0);
        let assembler = PacketAssembler::new(1200, ComponentRegistry::standard());

        // priority 0.6 waits in the second bucket
        queue.add_entity_changes(entity, net, &[transform_change()], score(0.6));
        for frame in 0..4u16 {
            assert!(assembler.assemble(&mut queue, frame, 1.0).is_none());
        }
        let packet = assembler.assemble(&mut queue, 4, 1.0);
        assert!(packet.is_some());
    }

    #[test]
    fn budget_cuts_off_and_retries_next_tick() {
        let mut store = EntityStore::new();
        let mut queue = ReplicationQueue::new(64, TICK);
        // entity block: 7 bytes prefix + 3 bytes component header + 3
        // fields of 5 bytes = 25; budget below 50 fits exactly one
        let assembler = PacketAssembler::new(PACKET_HEADER_SIZE + 5 + 40, ComponentRegistry::standard());

        let entities: Vec<_> = (0..3).map(|_| spawn(&mut store)).collect();
        for (entity, net) in &entities {
            queue.add_entity_changes(*entity, *net, &[transform_change()], score(1.0));
        }

        let first = assembler.assemble(&mut queue, 0, TICK).unwrap();
        assert_eq!(first.entities.len(), 1);
        assert_eq!(queue.len(), 2);

        let second = assembler.assemble(&mut queue, 1, TICK).unwrap();
        assert_eq!(second.entities.len(), 1);
        let third = assembler.assemble(&mut queue, 2, TICK).unwrap();
        assert_eq!(third.entities.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn packet_round_trips_through_the_codec() {
        let mut store = EntityStore::new();
        let (entity, net) = spawn(&mut store);
        let mut queue = ReplicationQueue::new(16, TICK);
        let assembler = PacketAssembler::new(1200, ComponentRegistry::standard());

        queue.add_entity_changes(entity, net, &[transform_change()], score(1.0));
        let packet = assembler.assemble(&mut queue, 3, TICK).unwrap();

        let mut bytes = Vec::new();
        wire::encode_replication_packet(&packet, assembler.registry(), &mut bytes);
        let decoded = wire::decode_replication_packet(&bytes, assembler.registry()).unwrap();
        assert_eq!(decoded, packet);
    }
}
