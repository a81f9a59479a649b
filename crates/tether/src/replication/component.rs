use bitflags::bitflags;

use crate::net::wire::{PayloadReader, WireError, WireSink};

pub const COMPONENT_KIND_COUNT: usize = 3;

/// Positional presence mask: bit `i` set means field `i` is present or
/// changed. At most 32 fields per component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldMask(pub u32);

impl FieldMask {
    pub const EMPTY: FieldMask = FieldMask(0);

    pub fn set_all(count: u8) -> Self {
        if count >= 32 {
            FieldMask(u32::MAX)
        } else {
            FieldMask((1u32 << count) - 1)
        }
    }

    pub fn set(&mut self, index: u8) {
        self.0 |= 1 << index;
    }

    pub fn contains(self, index: u8) -> bool {
        self.0 & (1 << index) != 0
    }

    pub fn merge(&mut self, other: FieldMask) {
        self.0 |= other.0;
    }

    pub fn intersect(self, other: FieldMask) -> FieldMask {
        FieldMask(self.0 & other.0)
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ComponentKind {
    Transform = 0,
    Movement = 1,
    Player = 2,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; COMPONENT_KIND_COUNT] = [
        ComponentKind::Transform,
        ComponentKind::Movement,
        ComponentKind::Player,
    ];

    pub fn slot(self) -> usize {
        self as usize
    }

    pub fn field_count(self) -> u8 {
        match self {
            ComponentKind::Transform => 3,
            ComponentKind::Movement => 2,
            ComponentKind::Player => 1,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ComponentKinds: u8 {
        const TRANSFORM = 1 << 0;
        const MOVEMENT = 1 << 1;
        const PLAYER = 1 << 2;
    }
}

impl From<ComponentKind> for ComponentKinds {
    fn from(kind: ComponentKind) -> Self {
        match kind {
            ComponentKind::Transform => ComponentKinds::TRANSFORM,
            ComponentKind::Movement => ComponentKinds::MOVEMENT,
            ComponentKind::Player => ComponentKinds::PLAYER,
        }
    }
}

/// Replicated component payload, one variant per kind. Which fields are
/// meaningful travels separately as a `FieldMask`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComponentData {
    Transform { x: f32, y: f32, rotation: f32 },
    Movement { vx: f32, vy: f32 },
    Player { id: i32 },
}

impl ComponentData {
    pub fn kind(&self) -> ComponentKind {
        match self {
            ComponentData::Transform { .. } => ComponentKind::Transform,
            ComponentData::Movement { .. } => ComponentKind::Movement,
            ComponentData::Player { .. } => ComponentKind::Player,
        }
    }

    pub fn empty(kind: ComponentKind) -> Self {
        match kind {
            ComponentKind::Transform => ComponentData::Transform {
                x: 0.0,
                y: 0.0,
                rotation: 0.0,
            },
            ComponentKind::Movement => ComponentData::Movement { vx: 0.0, vy: 0.0 },
            ComponentKind::Player => ComponentData::Player { id: 0 },
        }
    }

    /// Overwrites the fields named by `mask` with values from `incoming`.
    /// Both sides must hold the same variant.
    pub fn merge_from(&mut self, incoming: &ComponentData, mask: FieldMask) {
        match (self, incoming) {
            (
                ComponentData::Transform { x, y, rotation },
                ComponentData::Transform {
                    x: nx,
                    y: ny,
                    rotation: nr,
                },
            ) => {
                if mask.contains(0) {
                    *x = *nx;
                }
                if mask.contains(1) {
                    *y = *ny;
                }
                if mask.contains(2) {
                    *rotation = *nr;
                }
            }
            (
                ComponentData::Movement { vx, vy },
                ComponentData::Movement { vx: nvx, vy: nvy },
            ) => {
                if mask.contains(0) {
                    *vx = *nvx;
                }
                if mask.contains(1) {
                    *vy = *nvy;
                }
            }
            (ComponentData::Player { id }, ComponentData::Player { id: nid }) => {
                if mask.contains(0) {
                    *id = *nid;
                }
            }
            _ => debug_assert!(false, "component kind mismatch in merge"),
        }
    }

    /// Writes `fieldIndex:u8` + typed value for every set bit, in index
    /// order. Callers keep masks inside the component's field range.
    pub fn encode_fields(&self, mask: FieldMask, sink: &mut impl WireSink) {
        match self {
            ComponentData::Transform { x, y, rotation } => {
                if mask.contains(0) {
                    sink.put_u8(0);
                    sink.put_f32(*x);
                }
                if mask.contains(1) {
                    sink.put_u8(1);
                    sink.put_f32(*y);
                }
                if mask.contains(2) {
                    sink.put_u8(2);
                    sink.put_f32(*rotation);
                }
            }
            ComponentData::Movement { vx, vy } => {
                if mask.contains(0) {
                    sink.put_u8(0);
                    sink.put_f32(*vx);
                }
                if mask.contains(1) {
                    sink.put_u8(1);
                    sink.put_f32(*vy);
                }
            }
            ComponentData::Player { id } => {
                if mask.contains(0) {
                    sink.put_u8(0);
                    sink.put_i32(*id);
                }
            }
        }
    }

    /// Reads one field value into place. Returns `Ok(false)` when the index
    /// does not exist for this kind.
    pub fn decode_field(
        &mut self,
        index: u8,
        reader: &mut PayloadReader<'_>,
    ) -> Result<bool, WireError> {
        match self {
            ComponentData::Transform { x, y, rotation } => match index {
                0 => *x = reader.read_f32()?,
                1 => *y = reader.read_f32()?,
                2 => *rotation = reader.read_f32()?,
                _ => return Ok(false),
            },
            ComponentData::Movement { vx, vy } => match index {
                0 => *vx = reader.read_f32()?,
                1 => *vy = reader.read_f32()?,
                _ => return Ok(false),
            },
            ComponentData::Player { id } => match index {
                0 => *id = reader.read_i32()?,
                _ => return Ok(false),
            },
        }
        Ok(true)
    }
}

/// Wire-id table built once at startup and threaded through explicitly;
/// component identifiers never live in process-wide counters.
#[derive(Debug, Clone)]
pub struct ComponentRegistry {
    wire_ids: [u16; COMPONENT_KIND_COUNT],
}

impl ComponentRegistry {
    pub fn standard() -> Self {
        Self {
            wire_ids: [1, 2, 3],
        }
    }

    pub fn wire_id(&self, kind: ComponentKind) -> u16 {
        self.wire_ids[kind.slot()]
    }

    pub fn kind_for(&self, wire_id: u16) -> Option<ComponentKind> {
        ComponentKind::ALL
            .into_iter()
            .find(|kind| self.wire_ids[kind.slot()] == wire_id)
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_population() {
        let mask = FieldMask::set_all(3);
        assert_eq!(mask.count(), 3);
        assert!(mask.contains(0));
        assert!(mask.contains(2));
        assert!(!mask.contains(3));

        let mut partial = FieldMask::EMPTY;
        partial.set(1);
        partial.set(5);
        assert_eq!(partial.count(), 2);
    }

    #[test]
    fn mask_merge_is_union() {
        let mut a = FieldMask::EMPTY;
        a.set(0);
        let mut b = FieldMask::EMPTY;
        b.set(2);
        a.merge(b);
        assert!(a.contains(0));
        assert!(a.contains(2));
        assert_eq!(a.count(), 2);
    }

    #[test]
    fn merge_overwrites_only_masked_fields() {
        let mut data = ComponentData::Transform {
            x: 1.0,
            y: 2.0,
            rotation: 3.0,
        };
        let incoming = ComponentData::Transform {
            x: 10.0,
            y: 20.0,
            rotation: 30.0,
        };
        let mut mask = FieldMask::EMPTY;
        mask.set(1);
        data.merge_from(&incoming, mask);

        assert_eq!(
            data,
            ComponentData::Transform {
                x: 1.0,
                y: 20.0,
                rotation: 3.0,
            }
        );
    }

    #[test]
    fn registry_lookup_both_ways() {
        let registry = ComponentRegistry::standard();
        for kind in ComponentKind::ALL {
            let id = registry.wire_id(kind);
            assert_eq!(registry.kind_for(id), Some(kind));
        }
        assert_eq!(registry.kind_for(999), None);
    }

    #[test]
    fn changed_kind_set_conversion() {
        let kinds: ComponentKinds =
            ComponentKinds::from(ComponentKind::Transform) | ComponentKind::Player.into();
        assert!(kinds.contains(ComponentKinds::TRANSFORM));
        assert!(kinds.contains(ComponentKinds::PLAYER));
        assert!(!kinds.contains(ComponentKinds::MOVEMENT));
    }
}
