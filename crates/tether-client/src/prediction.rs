use glam::Vec2;

use tether::{EntityHandle, EntityStore, InputFrame, Movement, RewindableWorld, Transform};

// Must match the server's movement rules or prediction drifts every tick.
const PLAYER_SPEED: f32 = 40.0;

/// The locally simulated world: the player's own entity driven by sampled
/// inputs. Snapshots are deep copies of the backing store, so rollback
/// history never aliases live state.
pub struct PredictedWorld {
    store: EntityStore,
    player: EntityHandle,
}

impl PredictedWorld {
    pub fn new(spawn: Vec2) -> Self {
        let mut store = EntityStore::new();
        let player = store.spawn();
        store.set_transform(
            player,
            Transform {
                position: spawn,
                rotation: 0.0,
            },
        );
        store.set_movement(player, Movement::default());
        Self { store, player }
    }

    pub fn position(&self) -> Vec2 {
        self.store
            .transform(self.player)
            .map(|t| t.position)
            .unwrap_or(Vec2::ZERO)
    }

    /// Authoritative correction entry point, applied between rewind and
    /// replay.
    pub fn set_position(&mut self, position: Vec2) {
        let mut transform = self
            .store
            .transform(self.player)
            .copied()
            .unwrap_or_default();
        transform.position = position;
        self.store.set_transform(self.player, transform);
    }

    fn velocity_for(input: &InputFrame) -> Vec2 {
        let direction = Vec2::new(input.move_x, input.move_y);
        if direction.length_squared() > 1.0 {
            direction.normalize() * PLAYER_SPEED
        } else {
            direction * PLAYER_SPEED
        }
    }
}

impl RewindableWorld for PredictedWorld {
    type State = EntityStore;
    type Input = InputFrame;

    fn capture(&self) -> EntityStore {
        self.store.clone()
    }

    fn restore(&mut self, state: &EntityStore) {
        self.store = state.clone();
    }

    fn fixed_step(&mut self, dt: f32) {
        self.store.integrate(dt);
    }

    fn apply_input(&mut self, input: &InputFrame, dt: f32) {
        let velocity = Self::velocity_for(input);
        self.store.set_movement(self.player, Movement { velocity });
        self.store.integrate(dt);
    }
}
