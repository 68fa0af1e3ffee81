//! Scheduler throughput over two graph shapes: wide/shallow (many
//! independent units, maximal concurrency) and narrow/deep (a single
//! precedence chain, no concurrency to exploit).

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::HashMap;
use std::sync::Arc;
use taskgraph_core::{Graph, SchedulingMode, Unit};

fn noop_unit(name: String) -> Arc<Unit> {
    Arc::new(Unit::new(None, Some(name), Vec::new(), HashMap::new()))
}

fn wide_graph(width: usize) -> Graph {
    let units: Vec<Arc<Unit>> = (0..width).map(|i| noop_unit(format!("w{i}"))).collect();
    Graph::with_units(&units).expect("wide graph is acyclic by construction")
}

fn deep_graph(depth: usize) -> Graph {
    let units: Vec<Arc<Unit>> = (0..depth).map(|i| noop_unit(format!("d{i}"))).collect();
    let mut graph = Graph::with_units(&units).expect("deep graph is acyclic by construction");
    graph
        .add_precedence(&units)
        .expect("a linear chain cannot introduce a cycle");
    graph
}

fn wide_shallow(c: &mut Criterion) {
    let mut group = c.benchmark_group("wide_shallow");
    for width in [8usize, 32, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            b.iter(|| {
                let graph = wide_graph(width);
                graph.start(SchedulingMode::Concurrent).unwrap();
                graph.wait(None);
            });
        });
    }
    group.finish();
}

fn narrow_deep(c: &mut Criterion) {
    let mut group = c.benchmark_group("narrow_deep");
    for depth in [8usize, 32, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                let graph = deep_graph(depth);
                graph.start(SchedulingMode::Concurrent).unwrap();
                graph.wait(None);
            });
        });
    }
    group.finish();
}

fn serial_baseline(c: &mut Criterion) {
    let mut group = c.benchmark_group("serial_baseline");
    group.bench_function("wide_64_serial", |b| {
        b.iter(|| {
            let graph = wide_graph(64);
            graph.start(SchedulingMode::Serial).unwrap();
            graph.wait(None);
        });
    });
    group.finish();
}

criterion_group!(benches, wide_shallow, narrow_deep, serial_baseline);
criterion_main!(benches);
