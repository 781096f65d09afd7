//! Property tests over the dimension model and the aggregation law.

use cubist::area::Set;
use cubist::cell::CellValue;
use cubist::dimension::{Dimension, ElementKind};
use cubist::engine::{Engine, SYSTEM_SESSION};
use cubist::splash::SplashMode;
use cubist::Config;
use proptest::prelude::*;
use tempfile::TempDir;

/// A random batch of structural operations on one dimension.
#[derive(Debug, Clone)]
enum DimOp {
    Add(u8),
    Delete(u8),
    Move(u8, u8),
    Link { parent: u8, child: u8, weight: u8 },
    Unlink { parent: u8 },
}

fn dim_op() -> impl Strategy<Value = DimOp> {
    prop_oneof![
        (0u8..40).prop_map(DimOp::Add),
        (0u8..40).prop_map(DimOp::Delete),
        (0u8..40, 0u8..40).prop_map(|(a, b)| DimOp::Move(a, b)),
        (0u8..40, 0u8..40, 1u8..4).prop_map(|(parent, child, weight)| DimOp::Link {
            parent,
            child,
            weight
        }),
        (0u8..40).prop_map(|parent| DimOp::Unlink { parent }),
    ]
}

fn apply_ops(dim: &mut Dimension, ops: &[DimOp]) {
    for op in ops {
        match op {
            DimOp::Add(n) => {
                let _ = dim.add_element(&format!("e{n}"), ElementKind::Numeric);
            }
            DimOp::Delete(n) => {
                if let Ok(e) = dim.element_by_name(&format!("e{n}")) {
                    let id = e.id;
                    let _ = dim.delete_element(id);
                }
            }
            DimOp::Move(n, pos) => {
                if let Ok(e) = dim.element_by_name(&format!("e{n}")) {
                    let id = e.id;
                    let _ = dim.move_element(id, u32::from(*pos) % (dim.len().max(1) as u32));
                }
            }
            DimOp::Link {
                parent,
                child,
                weight,
            } => {
                let parent = dim.element_by_name(&format!("e{parent}")).map(|e| e.id);
                let child = dim.element_by_name(&format!("e{child}")).map(|e| e.id);
                if let (Ok(parent), Ok(child)) = (parent, child) {
                    let _ = dim.add_children(parent, &[(child, f64::from(*weight))]);
                }
            }
            DimOp::Unlink { parent } => {
                if let Ok(e) = dim.element_by_name(&format!("e{parent}")) {
                    let id = e.id;
                    let _ = dim.remove_children(id, None);
                }
            }
        }
    }
}

proptest! {
    /// Invariant: positions are always a permutation of 0..n-1.
    #[test]
    fn prop_positions_are_a_permutation(ops in proptest::collection::vec(dim_op(), 1..60)) {
        let mut dim = Dimension::new(0, "d").unwrap();
        apply_ops(&mut dim, &ops);
        let mut positions: Vec<u32> = dim
            .ids_by_position()
            .iter()
            .map(|id| dim.element(*id).unwrap().position)
            .collect();
        positions.sort_unstable();
        let expected: Vec<u32> = (0..dim.len() as u32).collect();
        prop_assert_eq!(positions, expected);
    }

    /// Invariant: the parent/child relation never contains a cycle, and
    /// elements are consolidated exactly when they have children.
    #[test]
    fn prop_no_cycles_and_kind_matches_children(ops in proptest::collection::vec(dim_op(), 1..60)) {
        let mut dim = Dimension::new(0, "d").unwrap();
        apply_ops(&mut dim, &ops);
        // the topological order covers every element only when acyclic
        prop_assert_eq!(dim.topological_order().len(), dim.len());
        for id in dim.ids_by_position() {
            let kind = dim.element(*id).unwrap().kind;
            let has_children = !dim.children(*id).is_empty();
            prop_assert_eq!(kind == ElementKind::Consolidated, has_children);
        }
    }

    /// Invariant: base expansion weights multiply along paths and sum over
    /// distinct paths; leaves map to themselves with weight 1.
    #[test]
    fn prop_base_expansion_is_weighted_leaf_set(ops in proptest::collection::vec(dim_op(), 1..60)) {
        let mut dim = Dimension::new(0, "d").unwrap();
        apply_ops(&mut dim, &ops);
        for id in dim.ids_by_position() {
            let base = dim.base_elements(*id).unwrap();
            if dim.is_base(*id) {
                prop_assert_eq!(base.as_slice(), &[(*id, 1.0)]);
            } else {
                // recompute by brute-force path walk
                let mut expected = std::collections::HashMap::new();
                let mut stack = vec![(*id, 1.0)];
                while let Some((current, weight)) = stack.pop() {
                    let children = dim.children(current);
                    if children.is_empty() {
                        *expected.entry(current).or_insert(0.0) += weight;
                    } else {
                        for (child, w) in children {
                            stack.push((*child, weight * w));
                        }
                    }
                }
                for (leaf, weight) in base.iter() {
                    let want = expected.get(leaf).copied().unwrap_or(0.0);
                    prop_assert!((weight - want).abs() < 1e-9);
                }
                prop_assert_eq!(base.len(), expected.len());
            }
        }
    }

    /// Law: a consolidated read equals the weighted sum of its base cells,
    /// for random cell contents.
    #[test]
    fn prop_consolidated_read_is_weighted_sum(values in proptest::collection::vec(0.0f64..100.0, 6)) {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = temp.path().to_path_buf();
        config.engine.pool_size = 2;
        let engine = Engine::new(config).unwrap();

        let d1 = engine.create_dimension("D1").unwrap();
        let mut leaves = Vec::new();
        for i in 0..values.len() {
            leaves.push(engine.add_element(d1, &format!("l{i}"), ElementKind::Numeric).unwrap());
        }
        let mid = engine.add_element(d1, "mid", ElementKind::Numeric).unwrap();
        let top = engine.add_element(d1, "top", ElementKind::Numeric).unwrap();
        // mid = 2*l0 + l1 + l2; top = mid + l3 + 3*l4 + l5
        engine.add_children(d1, mid, &[(leaves[0], 2.0), (leaves[1], 1.0), (leaves[2], 1.0)]).unwrap();
        engine.add_children(d1, top, &[(mid, 1.0), (leaves[3], 1.0), (leaves[4], 3.0), (leaves[5], 1.0)]).unwrap();
        let cube = engine.create_cube("K", &[d1]).unwrap();

        for (leaf, value) in leaves.iter().zip(values.iter()) {
            engine.cell_replace(cube, &[*leaf], CellValue::Numeric(*value), SplashMode::Equal, SYSTEM_SESSION).unwrap();
        }
        let expected_mid = 2.0 * values[0] + values[1] + values[2];
        let expected_top = expected_mid + values[3] + 3.0 * values[4] + values[5];
        let got_mid = engine.cell_value(cube, &[mid]).unwrap().value.as_f64();
        let got_top = engine.cell_value(cube, &[top]).unwrap().value.as_f64();
        prop_assert!((got_mid - expected_mid).abs() < 1e-6);
        prop_assert!((got_top - expected_top).abs() < 1e-6);
    }

    /// Set intersection agrees with the naive definition.
    #[test]
    fn prop_set_intersection(a in proptest::collection::vec(0u32..64, 0..32),
                             b in proptest::collection::vec(0u32..64, 0..32)) {
        let sa = Set::from_ids(a.clone());
        let sb = Set::from_ids(b.clone());
        let both = sa.intersect(&sb);
        for id in 0..64u32 {
            let expected = a.contains(&id) && b.contains(&id);
            prop_assert_eq!(both.contains(id), expected);
        }
    }
}
