use glam::Vec2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityTag {
    Low,
    Normal,
    High,
}

impl PriorityTag {
    fn base(self) -> f32 {
        match self {
            PriorityTag::Low => 0.5,
            PriorityTag::Normal => 1.0,
            PriorityTag::High => 2.0,
        }
    }
}

/// Squared ring thresholds, innermost first.
#[derive(Debug, Clone, Copy)]
pub struct DistanceRings {
    pub near_sq: f32,
    pub mid_sq: f32,
    pub far_sq: f32,
}

impl Default for DistanceRings {
    fn default() -> Self {
        Self {
            near_sq: 16.0 * 16.0,
            mid_sq: 64.0 * 64.0,
            far_sq: 128.0 * 128.0,
        }
    }
}

// Nearest ring weighs highest and the falloff is monotonic; everything
// beyond the outer ring keeps a floor so distant entities still trickle
// through eventually.
const RING_WEIGHTS: [f32; 4] = [1.0, 0.5, 0.25, 0.1];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetPriority {
    pub priority: f32,
    pub relevance: f32,
    pub remaining_queue_time: f32,
}

pub struct PriorityCalculator {
    rings: DistanceRings,
}

impl PriorityCalculator {
    pub fn new(rings: DistanceRings) -> Self {
        Self { rings }
    }

    pub fn score(&self, observer: Vec2, target: Vec2, tag: PriorityTag) -> NetPriority {
        let distance_sq = observer.distance_squared(target);
        let ring = if distance_sq <= self.rings.near_sq {
            0
        } else if distance_sq <= self.rings.mid_sq {
            1
        } else if distance_sq <= self.rings.far_sq {
            2
        } else {
            3
        };

        NetPriority {
            priority: (tag.base() * RING_WEIGHTS[ring]).clamp(0.0, 1.0),
            // extension point: size and occlusion terms would land here
            relevance: 1.0,
            remaining_queue_time: 0.0,
        }
    }
}
