//! Snapshot-ring rollback: rewind to a past tick, apply an authoritative
//! correction, replay captured inputs forward to restore predicted state.

use log::debug;

/// A simulation that can be checkpointed and deterministically re-driven.
/// `capture` must deep-copy: aliased state would corrupt history silently.
pub trait RewindableWorld {
    type State: Clone;
    type Input: Clone;

    fn capture(&self) -> Self::State;
    fn restore(&mut self, state: &Self::State);
    /// Fixed-step advance. During replay this runs once per tick for the
    /// tick's remaining fraction after the recorded inputs.
    fn fixed_step(&mut self, dt: f32);
    /// Variable-step advance driven by one input sample.
    fn apply_input(&mut self, input: &Self::Input, dt: f32);
}

#[derive(Debug, Clone)]
pub struct InputSample<I> {
    /// Simulation time the sample was taken at.
    pub capture_time: f64,
    /// Variable-step duration the sample was applied for.
    pub delta: f32,
    pub input: I,
}

#[derive(Debug, Clone)]
struct SnapshotSlot<S, I> {
    /// Tick timestamp: simulation time at which this state was captured.
    tick_time: f64,
    /// Duration of the tick this slot opened; recorded when sealed.
    tick_dt: f32,
    state: S,
    inputs: Vec<InputSample<I>>,
}

/// Fixed ring of N world snapshots plus the inputs captured while each was
/// open. Rewind and replay distances are bounded by N; exceeding them is a
/// programmer error, not a recoverable condition.
pub struct RollbackEngine<W: RewindableWorld> {
    slots: Vec<SnapshotSlot<W::State, W::Input>>,
    cursor: usize,
    fixed_time: f64,
    game_time: f64,
}

impl<W: RewindableWorld> RollbackEngine<W> {
    pub fn new(world: &W, size: usize) -> Self {
        assert!(size >= 2, "snapshot ring needs at least two slots");
        let slots = (0..size)
            .map(|_| SnapshotSlot {
                tick_time: 0.0,
                tick_dt: 0.0,
                state: world.capture(),
                inputs: Vec::new(),
            })
            .collect();
        Self {
            slots,
            cursor: 0,
            fixed_time: 0.0,
            game_time: 0.0,
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn tick_time(&self) -> f64 {
        self.fixed_time
    }

    pub fn pending_inputs(&self) -> usize {
        self.slots[self.cursor].inputs.len()
    }

    /// Completes the current tick: runs the fixed step for whatever part
    /// of `dt` the variable updates did not cover, seals the open
    /// snapshot, advances the ring, and deep-copies fresh world state into
    /// the new slot with an empty input list.
    pub fn fixed_update(&mut self, world: &mut W, dt: f32) {
        let consumed: f64 = self.slots[self.cursor]
            .inputs
            .iter()
            .map(|sample| sample.delta as f64)
            .sum();
        world.fixed_step(((dt as f64 - consumed).max(0.0)) as f32);

        self.slots[self.cursor].tick_dt = dt;
        self.fixed_time = self.slots[self.cursor].tick_time + dt as f64;
        self.game_time = self.fixed_time;

        self.cursor = (self.cursor + 1) % self.slots.len();
        let slot = &mut self.slots[self.cursor];
        slot.state = world.capture();
        slot.tick_time = self.fixed_time;
        slot.tick_dt = 0.0;
        slot.inputs.clear();
    }

    /// Variable-step update: records the input sample into the open
    /// snapshot, then drives the simulation with it.
    pub fn update(&mut self, world: &mut W, input: &W::Input, dt: f32) {
        self.slots[self.cursor].inputs.push(InputSample {
            capture_time: self.game_time,
            delta: dt,
            input: input.clone(),
        });
        world.apply_input(input, dt);
        self.game_time += dt as f64;
    }

    /// Moves the cursor back `k` slots, restores that snapshot's state and
    /// resets both simulation clocks to its tick time.
    pub fn rewind(&mut self, world: &mut W, k: usize) {
        assert!(
            k < self.slots.len(),
            "rewind distance {} outside snapshot ring of {}",
            k,
            self.slots.len()
        );
        self.cursor = (self.cursor + self.slots.len() - k) % self.slots.len();
        let slot = &self.slots[self.cursor];
        world.restore(&slot.state);
        self.fixed_time = slot.tick_time;
        self.game_time = slot.tick_time;
        debug!("rewound {} ticks to t={}", k, slot.tick_time);
    }

    /// Replays `k` ticks from the live world state: each stored input for
    /// its recorded delta, then one fixed step for the tick's remaining
    /// fraction. Replay reads a copy of each input list; stored history is
    /// never mutated, and a state edit made after `rewind` persists
    /// because nothing is re-restored.
    pub fn play_forward(&mut self, world: &mut W, k: usize) {
        assert!(
            k < self.slots.len(),
            "replay distance {} outside snapshot ring of {}",
            k,
            self.slots.len()
        );
        for _ in 0..k {
            let inputs = self.slots[self.cursor].inputs.clone();
            let tick_dt = self.slots[self.cursor].tick_dt;
            let tick_time = self.slots[self.cursor].tick_time;

            let mut consumed = 0.0f64;
            for sample in &inputs {
                world.apply_input(&sample.input, sample.delta);
                consumed += sample.delta as f64;
            }
            world.fixed_step(((tick_dt as f64 - consumed).max(0.0)) as f32);

            self.fixed_time = tick_time + tick_dt as f64;
            self.game_time = self.fixed_time;

            self.cursor = (self.cursor + 1) % self.slots.len();
            // refresh the re-simulated checkpoint; recorded inputs stay
            // because later replay steps still need them
            let slot = &mut self.slots[self.cursor];
            slot.state = world.capture();
            slot.tick_time = self.fixed_time;
        }
    }
}
