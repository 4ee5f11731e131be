//! Property-based tests for stepback core.
//!
//! Uses proptest to generate random entity trees and record/restore
//! sequences, then verify the codec and history invariants hold.

use std::sync::Arc;

use proptest::prelude::*;
use stepback_core::codec::{BinaryCodec, JsonCodec, SnapshotCodec};
use stepback_core::entity::Entity;
use stepback_core::history::{History, HistoryNode, Recorder, Restore};
use stepback_core::sim::Simulation;
use stepback_core::test_utils::*;
use stepback_core::value::{MapValue, TypeDesc, Value};

// ===========================================================================
// Generators
// ===========================================================================

fn arb_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Nil),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        (-1.0e9..1.0e9f64).prop_map(Value::Float),
        "[a-z]{0,12}".prop_map(Value::Str),
    ]
}

fn arb_value() -> impl Strategy<Value = Value> {
    arb_leaf().prop_recursive(3, 24, 6, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..6)
                .prop_map(|items| Value::list(TypeDesc::unknown(), items)),
            (proptest::collection::vec(("[a-z]{1,6}", inner), 0..5), any::<bool>()).prop_map(
                |(entries, ordered)| {
                    let mut map = MapValue::new(TypeDesc::simple("string"), TypeDesc::unknown(), ordered);
                    for (k, v) in entries {
                        map.insert(Value::Str(k), v);
                    }
                    Value::Map(map)
                }
            ),
        ]
    })
}

/// A colony of up to `max_ants` ants with random extra attributes, each ant
/// referencing a random other ant.
fn arb_colony(max_ants: u32) -> impl Strategy<Value = Entity> {
    (1..=max_ants).prop_flat_map(|n| {
        (
            proptest::collection::vec((arb_value(), 0..n), n as usize),
            arb_value(),
        )
            .prop_map(move |(ants, extra)| {
                let mut root = build_colony(n);
                root.set("extra", extra);
                let population = root.population_mut("ant").expect("colony has ants");
                for (i, (value, target)) in ants.into_iter().enumerate() {
                    let member = population.get_mut(i as u32).expect("ant exists");
                    member.set("payload", value);
                    member.set("rival", Value::Entity(ant(target)));
                }
                root
            })
    })
}

// ===========================================================================
// Properties
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn binary_round_trip_is_identity(root in arb_colony(8), cycle in any::<u64>()) {
        let ctx = test_context();
        let bytes = BinaryCodec.encode_entity(&root, cycle).unwrap();
        let decoded = BinaryCodec.decode_unit(&ctx, &bytes).unwrap();
        prop_assert_eq!(decoded.cycle, cycle);
        prop_assert_eq!(decoded.entity, root);
    }

    #[test]
    fn json_round_trip_is_identity(root in arb_colony(4)) {
        let ctx = test_context();
        let bytes = JsonCodec.encode_entity(&root, 0).unwrap();
        let decoded = JsonCodec.decode_unit(&ctx, &bytes).unwrap();
        prop_assert_eq!(decoded.entity, root);
    }

    #[test]
    fn truncated_payloads_never_panic(root in arb_colony(4), cut in 0usize..4096) {
        let ctx = test_context();
        let bytes = BinaryCodec.encode_entity(&root, 0).unwrap();
        let cut = cut % bytes.len();
        match BinaryCodec.decode_entity(&ctx, &bytes[..cut]) {
            Err(e) => prop_assert!(e.is_structural(), "{e}"),
            Ok(decoded) => prop_assert_ne!(decoded.entity, root),
        }
    }

    #[test]
    fn history_cycles_stay_strictly_increasing(
        cycles in proptest::collection::vec(0u64..20, 1..40),
        max_depth in proptest::option::of(1usize..8),
    ) {
        let mut history = History::with_max_depth(max_depth);
        for &c in &cycles {
            history.push(Arc::new(HistoryNode::new(c, vec![c as u8])));
            let recorded = history.cycles();
            prop_assert!(recorded.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(recorded.last().copied(), Some(c));
            if let Some(max) = max_depth {
                prop_assert!(recorded.len() <= max);
            }
        }
    }

    #[test]
    fn restores_walk_back_in_lifo_order(steps in 1u64..12, values in proptest::collection::vec(any::<i64>(), 12)) {
        let rec = Recorder::new(Arc::new(BinaryCodec));
        let mut sim = Simulation::new("lifo", test_context());
        for c in 0..=steps {
            sim.set_cycle(c);
            sim.root_mut().set("value", Value::Int(values[c as usize % values.len()]));
            rec.record(&mut sim).unwrap();
        }
        for expected in (0..steps).rev() {
            prop_assert_eq!(rec.restore(&mut sim).unwrap(), Restore::Restored { cycle: expected });
            prop_assert_eq!(
                sim.root().get("value"),
                Some(&Value::Int(values[expected as usize % values.len()]))
            );
        }
        prop_assert_eq!(rec.restore(&mut sim).unwrap(), Restore::Nothing);
    }
}
