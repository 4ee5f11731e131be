//! Model behaviors.
//!
//! A [`Simulation`](crate::sim::Simulation) advances by running its behaviors
//! in order, once per cycle. Behaviors keep their state in the entity tree
//! they are handed, not in themselves: only the tree is recorded, so state
//! held elsewhere would not roll back.

use crate::context::Context;
use crate::entity::Entity;
use crate::unit::StepError;

// ---------------------------------------------------------------------------
// Behavior trait
// ---------------------------------------------------------------------------

/// A step of model logic run once per cycle.
pub trait Behavior: std::fmt::Debug + Send {
    /// The human-readable name of this behavior, used in errors and logs.
    fn name(&self) -> &str;

    /// Run for one cycle. Return `Ok(false)` to halt the simulation after
    /// this cycle.
    ///
    /// A [`StepError::Message`] is reported as a failure of this behavior at
    /// the current cycle.
    fn on_cycle(&mut self, ctx: &mut CycleContext<'_>) -> Result<bool, StepError>;
}

// ---------------------------------------------------------------------------
// CycleContext
// ---------------------------------------------------------------------------

/// Mutable context passed to behaviors during `on_cycle`.
pub struct CycleContext<'a> {
    /// The simulation's root entity.
    pub root: &'a mut Entity,
    /// Context the simulation runs in.
    pub context: &'a Context,
    /// The cycle being computed. Starts at 0.
    pub cycle: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TypeRegistry;
    use crate::value::Value;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Stamp;

    impl Behavior for Stamp {
        fn name(&self) -> &str {
            "stamp"
        }

        fn on_cycle(&mut self, ctx: &mut CycleContext<'_>) -> Result<bool, StepError> {
            ctx.root.set("last_cycle", Value::Int(ctx.cycle as i64));
            Ok(ctx.cycle < 2)
        }
    }

    #[test]
    fn behavior_writes_into_root() {
        let context = Context::new("test", Arc::new(TypeRegistry::builtin()));
        let mut root = Entity::new("simulation", 0);
        let mut stamp = Stamp;
        for cycle in 0..3 {
            let mut ctx = CycleContext {
                root: &mut root,
                context: &context,
                cycle,
            };
            assert_eq!(stamp.on_cycle(&mut ctx).unwrap(), cycle < 2);
        }
        assert_eq!(root.get("last_cycle"), Some(&Value::Int(2)));
    }
}
