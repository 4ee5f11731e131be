//! The simulation unit and its state.
//!
//! A [`Simulation`] is the steppable unit the controller schedules: a root
//! entity tree, the context it lives in, a cycle counter, the behaviors that
//! advance it and, once something has been recorded, its snapshot history.

use crate::behavior::{Behavior, CycleContext};
use crate::codec::{EncodeError, SnapshotCodec};
use crate::context::Context;
use crate::entity::Entity;
use crate::history::{History, Recordable};
use crate::registry::ROOT_SPECIES;
use crate::unit::{Steppable, StepError};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Simulation state
// ---------------------------------------------------------------------------

/// Mutable simulation state tracked alongside the entity tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SimState {
    /// Number of completed cycles. Incremented by 1 for each step.
    pub cycle: u64,
}

impl SimState {
    /// Create a new simulation state starting at cycle 0.
    pub fn new() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Simulation {
    name: String,
    context: Arc<Context>,
    root: Entity,
    state: SimState,
    behaviors: Vec<Box<dyn Behavior>>,
    history: Option<History>,
}

impl Simulation {
    /// A simulation with an empty root entity and no behaviors.
    pub fn new(name: impl Into<String>, context: Arc<Context>) -> Self {
        Self {
            name: name.into(),
            context,
            root: Entity::new(ROOT_SPECIES, 0),
            state: SimState::new(),
            behaviors: Vec::new(),
            history: None,
        }
    }

    pub fn with_root(mut self, root: Entity) -> Self {
        self.root = root;
        self
    }

    pub fn with_behavior(mut self, behavior: impl Behavior + 'static) -> Self {
        self.add_behavior(behavior);
        self
    }

    /// Append a behavior; behaviors run in the order they were added.
    pub fn add_behavior(&mut self, behavior: impl Behavior + 'static) {
        self.behaviors.push(Box::new(behavior));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context_handle(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn root(&self) -> &Entity {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Entity {
        &mut self.root
    }

    pub fn cycle(&self) -> u64 {
        self.state.cycle
    }

    pub fn set_cycle(&mut self, cycle: u64) {
        self.state.cycle = cycle;
    }

    pub fn state(&self) -> &SimState {
        &self.state
    }

    pub fn history(&self) -> Option<&History> {
        self.history.as_ref()
    }

    pub fn behavior_names(&self) -> Vec<&str> {
        self.behaviors.iter().map(|b| b.name()).collect()
    }

    /// FNV-1a hash of the encoded state, for comparing snapshots.
    pub fn state_hash(&self, codec: &dyn SnapshotCodec) -> Result<u64, EncodeError> {
        let bytes = codec.encode_entity(&self.root, self.state.cycle)?;
        let mut hash = StateHash::new();
        hash.write_u64(self.state.cycle);
        hash.write(&bytes);
        Ok(hash.finish())
    }
}

impl Steppable for Simulation {
    /// Run every behavior for the current cycle, then advance the cycle.
    /// A failing behavior leaves the cycle where it was.
    fn step(&mut self) -> Result<bool, StepError> {
        let cycle = self.state.cycle;
        let mut keep_running = true;
        let mut ctx = CycleContext {
            root: &mut self.root,
            context: &self.context,
            cycle,
        };
        for behavior in &mut self.behaviors {
            match behavior.on_cycle(&mut ctx) {
                Ok(true) => {}
                Ok(false) => keep_running = false,
                Err(StepError::Message(reason)) => {
                    return Err(StepError::Behavior {
                        behavior: behavior.name().to_string(),
                        cycle,
                        reason,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        self.state.cycle += 1;
        Ok(keep_running)
    }
}

impl Recordable for Simulation {
    fn context(&self) -> &Context {
        &self.context
    }

    fn root(&self) -> &Entity {
        &self.root
    }

    fn cycle(&self) -> u64 {
        self.state.cycle
    }

    fn history(&self) -> Option<&History> {
        self.history.as_ref()
    }

    fn history_mut(&mut self) -> &mut Option<History> {
        &mut self.history
    }

    fn install(&mut self, root: Entity, cycle: u64) {
        self.root = root;
        self.state.cycle = cycle;
    }
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// A simple deterministic hash of simulation state.
///
/// Uses FNV-1a (64-bit) for speed and simplicity. Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(pub u64);

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}
