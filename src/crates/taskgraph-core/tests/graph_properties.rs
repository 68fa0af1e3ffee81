//! Property tests: arbitrary sequences of graph mutations must never leave
//! a cycle committed, and a rejected mutation must never change what is
//! observable about the graph.

use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use taskgraph_core::{Graph, Unit};

#[derive(Debug, Clone)]
enum Op {
    AddTasks(usize),
    Precedence(Vec<usize>),
    Remove(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..3).prop_map(Op::AddTasks),
        prop::collection::vec(0usize..6, 0..4).prop_map(Op::Precedence),
        (0usize..6).prop_map(Op::Remove),
    ]
}

fn fresh_unit(n: usize) -> Arc<Unit> {
    Arc::new(Unit::new(None, Some(format!("u{n}")), Vec::new(), HashMap::new()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn graph_stays_acyclic_under_arbitrary_mutations(ops in prop::collection::vec(op_strategy(), 0..20)) {
        let mut graph = Graph::new();
        let mut pool: Vec<Arc<Unit>> = Vec::new();

        for op in ops {
            match op {
                Op::AddTasks(count) => {
                    let fresh: Vec<Arc<Unit>> = (0..count).map(|_| fresh_unit(pool.len())).collect();
                    let _ = graph.add_tasks(&fresh);
                    pool.extend(fresh);
                }
                Op::Precedence(indices) => {
                    let units: Vec<Arc<Unit>> = indices
                        .into_iter()
                        .filter_map(|i| pool.get(i).cloned())
                        .collect();
                    let before = graph.edges();
                    let before_len = graph.len();
                    if let Err(_) = graph.add_precedence(&units) {
                        prop_assert_eq!(graph.edges(), before);
                        prop_assert_eq!(graph.len(), before_len);
                    }
                }
                Op::Remove(i) => {
                    if let Some(unit) = pool.get(i).cloned() {
                        graph.remove_tasks(&[unit]);
                    }
                }
            }
            prop_assert!(graph.verify_constraints().is_none());
        }
    }

    #[test]
    fn rejected_add_tasks_leaves_graph_unchanged(count in 1usize..3) {
        let mut graph = Graph::new();
        let p = fresh_unit(0);
        let c = fresh_unit(1);
        // c depends on p, but p is never added: add_tasks(c) must be rejected.
        c.set_args(
            vec![taskgraph_core::DepRef::new(&p, None::<String>).into()],
            HashMap::new(),
        );
        let extras: Vec<Arc<Unit>> = (0..count).map(|i| fresh_unit(2 + i)).collect();
        graph.add_tasks(&extras).unwrap();
        let before_edges = graph.edges();
        let before_len = graph.len();

        let err = graph.add_tasks(&[c]);
        prop_assert!(err.is_err());
        prop_assert_eq!(graph.edges(), before_edges);
        prop_assert_eq!(graph.len(), before_len);
    }
}
