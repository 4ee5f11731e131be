//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use crate::behavior::{Behavior, CycleContext};
use crate::context::Context;
use crate::entity::Entity;
use crate::failure::{FailureHandler, TaskFailure};
use crate::reference::EntityRef;
use crate::registry::{ROOT_SPECIES, TypeRegistry, TypeRegistryBuilder};
use crate::sim::Simulation;
use crate::unit::{Steppable, StepError};
use crate::value::{MapValue, Shape, ShapeKind, Point, TypeDesc, Value};
use parking_lot::Mutex;
use std::sync::Arc;

// ===========================================================================
// Contexts
// ===========================================================================

/// Species known to [`test_registry`].
pub const TEST_SPECIES: &[&str] = &["ant", "nest", "egg"];

pub fn test_registry() -> TypeRegistry {
    let mut b = TypeRegistryBuilder::with_builtins();
    for species in TEST_SPECIES {
        b.register_species(species);
    }
    b.build().expect("test registry builds")
}

pub fn test_context() -> Arc<Context> {
    Context::new("test", Arc::new(test_registry()))
}

// ===========================================================================
// Entity graphs
// ===========================================================================

pub fn ant(index: u32) -> EntityRef {
    EntityRef::root().child("ant", index)
}

pub fn nest() -> EntityRef {
    EntityRef::root().child("nest", 0)
}

/// A colony with one nest and `ants` ants.
///
/// Every ant references the nest and the next ant (wrapping, so the ants
/// form a reference cycle). Ant 0 owns one egg that references it back.
/// Attributes cover every value kind except context handles.
pub fn build_colony(ants: u32) -> Entity {
    let mut root = Entity::new(ROOT_SPECIES, 0);
    root.set("name", Value::from("colony"));
    root.set("energy", Value::Int(0));
    root.set(
        "ants",
        Value::list(TypeDesc::simple("ant"), (0..ants).map(|i| Value::Entity(ant(i))).collect()),
    );
    root.set(
        "region",
        Value::Shape(
            Shape::new(
                ShapeKind::Polygon,
                vec![
                    Point::new(0.0, 0.0, 0.0),
                    Point::new(10.0, 0.0, 0.0),
                    Point::new(10.0, 10.0, 0.0),
                    Point::new(0.0, 0.0, 0.0),
                ],
            )
            .with_depth(2.5)
            .with_owner(EntityRef::root()),
        ),
    );
    root.set(
        "kind",
        Value::Type(TypeDesc::map_of(TypeDesc::simple("string"), TypeDesc::simple("int"))),
    );

    let home = root.ensure_population("nest").spawn();
    home.set("capacity", Value::Int(50));
    home.set("open", Value::Bool(true));
    home.set("position", Value::Shape(Shape::point(5.0, 5.0).with_owner(nest())));

    let population = root.ensure_population("ant");
    for i in 0..ants {
        let a = population.spawn();
        a.set("energy", Value::Float(1.5 * i as f64));
        a.set("home", Value::Entity(nest()));
        a.set("friend", Value::Entity(ant((i + 1) % ants)));
        let mut memory = MapValue::new(TypeDesc::simple("string"), TypeDesc::simple("int"), false);
        memory.insert(Value::from("seen"), Value::Int(i as i64));
        memory.insert(Value::from("carried"), Value::Int(0));
        a.set("memory", Value::Map(memory));
        a.set(
            "trail",
            Value::list(
                TypeDesc::simple("geometry"),
                vec![Value::Shape(Shape::point(i as f64, i as f64 + 0.25))],
            ),
        );
        a.set("note", Value::Nil);
        if i == 0 {
            let egg = a.ensure_population("egg").spawn();
            egg.set("mother", Value::Entity(ant(0)));
            egg.set("weight", Value::Float(0.125));
        }
    }
    root
}

/// Two ants referencing each other and nothing else.
pub fn build_pair() -> Entity {
    let mut root = Entity::new(ROOT_SPECIES, 0);
    let ants = root.ensure_population("ant");
    ants.spawn().set("partner", Value::Entity(ant(1)));
    ants.spawn().set("partner", Value::Entity(ant(0)));
    root
}

/// A simulation over a three-ant colony, with no behaviors.
pub fn test_simulation() -> Simulation {
    Simulation::new("test", test_context()).with_root(build_colony(3))
}

// ===========================================================================
// Behaviors
// ===========================================================================

/// Increments an integer attribute of the root every cycle.
#[derive(Debug)]
pub struct CounterBehavior {
    attribute: String,
}

impl CounterBehavior {
    pub fn new(attribute: &str) -> Self {
        Self {
            attribute: attribute.to_string(),
        }
    }
}

impl Behavior for CounterBehavior {
    fn name(&self) -> &str {
        "counter"
    }

    fn on_cycle(&mut self, ctx: &mut CycleContext<'_>) -> Result<bool, StepError> {
        let current = ctx.root.get(&self.attribute).and_then(Value::as_int).unwrap_or(0);
        ctx.root.set(self.attribute.as_str(), Value::Int(current + 1));
        Ok(true)
    }
}

/// Spawns one member of `species` under the root every cycle.
#[derive(Debug)]
pub struct SpawnBehavior {
    species: String,
}

impl SpawnBehavior {
    pub fn new(species: &str) -> Self {
        Self {
            species: species.to_string(),
        }
    }
}

impl Behavior for SpawnBehavior {
    fn name(&self) -> &str {
        "spawn"
    }

    fn on_cycle(&mut self, ctx: &mut CycleContext<'_>) -> Result<bool, StepError> {
        let cycle = ctx.cycle as i64;
        ctx.root
            .ensure_population(&self.species)
            .spawn()
            .set("born", Value::Int(cycle));
        Ok(true)
    }
}

/// Fails at one specific cycle.
#[derive(Debug)]
pub struct FailingBehavior {
    cycle: u64,
}

impl FailingBehavior {
    pub fn at_cycle(cycle: u64) -> Self {
        Self { cycle }
    }
}

impl Behavior for FailingBehavior {
    fn name(&self) -> &str {
        "failing"
    }

    fn on_cycle(&mut self, ctx: &mut CycleContext<'_>) -> Result<bool, StepError> {
        if ctx.cycle == self.cycle {
            return Err(StepError::msg("scripted failure"));
        }
        Ok(true)
    }
}

/// Asks the simulation to halt once `cycle` has been computed.
#[derive(Debug)]
pub struct HaltBehavior {
    cycle: u64,
}

impl HaltBehavior {
    pub fn at_cycle(cycle: u64) -> Self {
        Self { cycle }
    }
}

impl Behavior for HaltBehavior {
    fn name(&self) -> &str {
        "halt"
    }

    fn on_cycle(&mut self, ctx: &mut CycleContext<'_>) -> Result<bool, StepError> {
        Ok(ctx.cycle < self.cycle)
    }
}

// ===========================================================================
// Units and handlers
// ===========================================================================

/// The smallest possible unit: counts its own steps.
#[derive(Debug, Default)]
pub struct CountingUnit {
    pub count: u64,
}

impl Steppable for CountingUnit {
    fn step(&mut self) -> Result<bool, StepError> {
        self.count += 1;
        Ok(true)
    }
}

/// Records every failure it is handed.
#[derive(Debug, Default)]
pub struct CollectingHandler {
    failures: Mutex<Vec<TaskFailure>>,
}

impl CollectingHandler {
    pub fn failures(&self) -> Vec<TaskFailure> {
        self.failures.lock().clone()
    }
}

impl FailureHandler for CollectingHandler {
    fn on_failure(&self, failure: &TaskFailure) {
        self.failures.lock().push(failure.clone());
    }
}
