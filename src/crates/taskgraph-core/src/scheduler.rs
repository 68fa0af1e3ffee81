//! The scheduler: a coordinator thread that drives a [`crate::graph::Graph`]
//! snapshot to completion, launching one OS thread per unit invocation.

use crate::error::GraphError;
use crate::graph::Graph;
use crate::unit::{ArgSlot, HookToken, Unit, UnitId};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Which order the scheduler launches ready units in. `Concurrent` is the
/// default; `Serial` trades throughput for a fully deterministic run, useful
/// when debugging a graph by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingMode {
    #[default]
    Concurrent,
    Serial,
}

/// The state a unit completion writes to: its successful result, or its
/// thrown value. `ResultsStore` and `ErrorLog` are two handles onto the same
/// `Inner` behind one lock, so a unit's completion has a single
/// linearization point regardless of which handle a reader goes through.
#[derive(Debug, Default)]
struct Inner {
    results: HashMap<UnitId, Value>,
    errors: Vec<Value>,
}

/// Mutex-protected mapping from unit id to its successful return value.
/// The scheduler is the sole writer; [`crate::depref::DepRef`] resolution
/// and [`ResultsStore::snapshot`] are the readers.
#[derive(Debug, Clone, Default)]
pub struct ResultsStore {
    inner: Arc<Mutex<Inner>>,
}

impl ResultsStore {
    /// A fresh, standalone store not paired with any `ErrorLog`. Production
    /// code obtains a results/errors pair sharing one lock via
    /// [`shared_store`]; this constructor is for tests exercising
    /// `ResultsStore` in isolation.
    pub fn new() -> Self {
        ResultsStore::default()
    }

    /// True iff `id`'s unit has a stored successful result.
    pub fn contains(&self, id: UnitId) -> bool {
        self.inner.lock().results.contains_key(&id)
    }

    /// The stored result for `id`, if any.
    pub fn get(&self, id: UnitId) -> Option<Value> {
        self.inner.lock().results.get(&id).cloned()
    }

    fn insert(&self, id: UnitId, value: Value) {
        self.inner.lock().results.insert(id, value);
    }

    /// A snapshot of every successful result recorded so far.
    pub fn snapshot(&self) -> HashMap<UnitId, Value> {
        self.inner.lock().results.clone()
    }
}

/// Append-only list of thrown values collected from failed unit invocations,
/// in arrival order.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    inner: Arc<Mutex<Inner>>,
}

impl ErrorLog {
    /// A fresh, standalone log not paired with any `ResultsStore`. See
    /// [`ResultsStore::new`].
    pub fn new() -> Self {
        ErrorLog::default()
    }

    fn push(&self, value: Value) {
        self.inner.lock().errors.push(value);
    }

    /// A snapshot of every failure recorded so far.
    pub fn snapshot(&self) -> Vec<Value> {
        self.inner.lock().errors.clone()
    }
}

/// Build a results store and error log sharing a single lock, per the
/// "one lock guarding both results and errors" policy: a unit completion is
/// one linearization point, not two independently-ordered ones.
fn shared_store() -> (ResultsStore, ErrorLog) {
    let inner = Arc::new(Mutex::new(Inner::default()));
    (
        ResultsStore {
            inner: Arc::clone(&inner),
        },
        ErrorLog { inner },
    )
}

/// A completion notice posted to the coordinator's event queue. The payload
/// itself was already written to the results store or error log by the hook
/// that sent it, under the same mutex; this message only wakes the
/// coordinator up to re-scan the frontier.
enum Event {
    Finished(UnitId),
}

fn resolve_args(
    unit: &Unit,
    results: &ResultsStore,
) -> Result<(Vec<Value>, HashMap<String, Value>), GraphError> {
    let mut args = Vec::new();
    for slot in unit.args_snapshot() {
        args.push(match slot {
            ArgSlot::Literal(v) => v,
            ArgSlot::Dep(dep) => dep.resolve(results)?,
        });
    }
    let mut kwargs = HashMap::new();
    for (key, slot) in unit.kwargs_snapshot() {
        let value = match slot {
            ArgSlot::Literal(v) => v,
            ArgSlot::Dep(dep) => dep.resolve(results)?,
        };
        kwargs.insert(key, value);
    }
    Ok((args, kwargs))
}

fn deps_ready(unit: &Unit, results: &ResultsStore) -> bool {
    unit.args_snapshot().iter().all(|slot| match slot {
        ArgSlot::Literal(_) => true,
        ArgSlot::Dep(dep) => dep.is_ready(results),
    }) && unit.kwargs_snapshot().values().all(|slot| match slot {
        ArgSlot::Literal(_) => true,
        ArgSlot::Dep(dep) => dep.is_ready(results),
    })
}

/// Owns the shared state of one run of a graph snapshot: the results store,
/// error log, cancellation flag, and the coordinator thread driving them.
pub struct ControlLoop {
    results: ResultsStore,
    errors: ErrorLog,
    cancelled: Arc<AtomicBool>,
    done: Arc<(Mutex<bool>, Condvar)>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl ControlLoop {
    /// Launch the coordinator thread for `graph` in `mode`. `graph` is a
    /// snapshot; later mutations to the caller's original graph do not
    /// affect this run.
    ///
    /// # Errors
    ///
    /// [`GraphError::EmptyGraph`] if `graph` has no units. The coordinator
    /// thread is not spawned in that case.
    pub fn start(graph: Graph, mode: SchedulingMode) -> Result<Arc<Self>, GraphError> {
        if graph.is_empty() {
            return Err(GraphError::EmptyGraph);
        }
        let (results, errors) = shared_store();
        let control = Arc::new(ControlLoop {
            results,
            errors,
            cancelled: Arc::new(AtomicBool::new(false)),
            done: Arc::new((Mutex::new(false), Condvar::new())),
            coordinator: Mutex::new(None),
        });

        let worker_control = Arc::clone(&control);
        let handle = std::thread::Builder::new()
            .name("taskgraph-coordinator".to_string())
            .spawn(move || {
                tracing::info!("scheduler starting");
                match mode {
                    SchedulingMode::Concurrent => worker_control.run_concurrent(graph),
                    SchedulingMode::Serial => worker_control.run_serial(graph),
                }
                tracing::info!("scheduler finished");
                let (lock, cvar) = &*worker_control.done;
                *lock.lock() = true;
                cvar.notify_all();
            })
            .expect("failed to spawn coordinator thread");
        *control.coordinator.lock() = Some(handle);
        Ok(control)
    }

    /// Request cancellation. Units already running finish normally; no new
    /// unit is started after the scheduler next checks the flag.
    pub fn cancel(&self) {
        tracing::info!("cancellation requested");
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Block until the run's coordinator thread has finished, or `timeout`
    /// elapses. Returns `true` if the run had finished by the time this
    /// call returns.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let (lock, cvar) = &*self.done;
        let mut finished = lock.lock();
        match timeout {
            None => {
                while !*finished {
                    cvar.wait(&mut finished);
                }
            }
            Some(t) => {
                let deadline = Instant::now() + t;
                while !*finished {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    cvar.wait_for(&mut finished, remaining);
                }
            }
        }
        drop(finished);
        if let Some(handle) = self.coordinator.lock().take() {
            let _ = handle.join();
        }
        true
    }

    /// A snapshot of every successful result recorded so far.
    pub fn results(&self) -> HashMap<UnitId, Value> {
        self.results.snapshot()
    }

    /// A snapshot of every failure recorded so far.
    pub fn errors(&self) -> Vec<Value> {
        self.errors.snapshot()
    }

    fn register(
        &self,
        unit: &Arc<Unit>,
        tx: &crossbeam_channel::Sender<Event>,
    ) -> (HookToken, HookToken) {
        let results = self.results.clone();
        let tx_ok = tx.clone();
        let success = Arc::new(move |id, value: Value| {
            tracing::debug!(unit_id = %id, "unit succeeded");
            results.insert(id, value);
            let _ = tx_ok.send(Event::Finished(id));
        });

        let errors = self.errors.clone();
        let tx_err = tx.clone();
        let failure = Arc::new(move |id, thrown: Value| {
            tracing::error!(unit_id = %id, "unit failed");
            errors.push(thrown);
            let _ = tx_err.send(Event::Finished(id));
        });

        let tok_ok = unit
            .add_hook("on_success", success)
            .expect("on_success is a recognized hook event");
        let tok_err = unit
            .add_hook("on_exception", failure)
            .expect("on_exception is a recognized hook event");
        (tok_ok, tok_err)
    }

    /// Resolve `unit`'s current arguments and record it as stranded (a
    /// `GraphError` appended to the error log) if resolution fails, without
    /// spawning a worker. Returns `Some(args)` on success.
    fn try_resolve(
        &self,
        unit: &Unit,
    ) -> Option<(Vec<Value>, HashMap<String, Value>)> {
        match resolve_args(unit, &self.results) {
            Ok(resolved) => Some(resolved),
            Err(err) => {
                tracing::error!(unit_id = %unit.id(), error = %err, "DepRef resolution failed");
                self.errors.push(err.to_value());
                None
            }
        }
    }

    fn run_concurrent(&self, graph: Graph) {
        let (tx, rx) = crossbeam_channel::unbounded::<Event>();
        let mut remaining = graph.predecessor_counts();
        let mut frontier: HashSet<UnitId> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut running: HashSet<UnitId> = HashSet::new();
        let mut registered: Vec<(Arc<Unit>, &'static str, HookToken)> = Vec::new();

        loop {
            let candidates: Vec<UnitId> = frontier.iter().copied().collect();
            for id in candidates {
                let unit = graph.unit(id).expect("frontier id not in snapshot").clone();
                if self.cancelled.load(Ordering::SeqCst) {
                    tracing::warn!(unit_id = %id, "unit stranded by cancellation");
                    frontier.remove(&id);
                    continue;
                }
                if !deps_ready(&unit, &self.results) {
                    tracing::warn!(unit_id = %id, "unit stranded: producer failed");
                    frontier.remove(&id);
                    self.release_successors(&graph, id, &mut remaining, &mut frontier);
                    continue;
                }
                match self.try_resolve(&unit) {
                    Some((args, kwargs)) => {
                        tracing::debug!(unit_id = %id, "starting unit from frontier");
                        let (tok_ok, tok_err) = self.register(&unit, &tx);
                        registered.push((Arc::clone(&unit), "on_success", tok_ok));
                        registered.push((Arc::clone(&unit), "on_exception", tok_err));
                        unit.start(args, kwargs);
                        frontier.remove(&id);
                        running.insert(id);
                    }
                    None => {
                        frontier.remove(&id);
                        self.release_successors(&graph, id, &mut remaining, &mut frontier);
                    }
                }
            }

            if frontier.is_empty() && running.is_empty() {
                break;
            }
            // Stranding a unit inside the loop above can release a further,
            // already-satisfiable successor into `frontier` without starting
            // any new worker. Re-scan immediately instead of blocking on
            // `rx.recv()`, which would only ever be woken by a worker
            // finishing — and there may be none running.
            if !frontier.is_empty() {
                continue;
            }

            match rx.recv() {
                Ok(Event::Finished(id)) => {
                    running.remove(&id);
                    self.release_successors(&graph, id, &mut remaining, &mut frontier);
                }
                Err(_) => break,
            }
        }

        for id in running {
            if let Some(unit) = graph.unit(id) {
                unit.wait(None);
            }
        }
        while let Ok(Event::Finished(id)) = rx.try_recv() {
            tracing::debug!(unit_id = %id, "drained late completion");
        }
        for (unit, event, token) in registered {
            let _ = unit.remove_hook(event, token);
        }
    }

    fn release_successors(
        &self,
        graph: &Graph,
        id: UnitId,
        remaining: &mut HashMap<UnitId, usize>,
        frontier: &mut HashSet<UnitId>,
    ) {
        for succ in graph.distinct_successors(id) {
            if let Some(count) = remaining.get_mut(&succ) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    frontier.insert(succ);
                }
            }
        }
    }

    fn run_serial(&self, graph: Graph) {
        let (tx, _rx) = crossbeam_channel::unbounded::<Event>();
        for id in graph.topological_order() {
            if self.cancelled.load(Ordering::SeqCst) {
                tracing::warn!(unit_id = %id, "unit stranded by cancellation");
                continue;
            }
            let unit = graph.unit(id).expect("topological id not in snapshot").clone();
            if !deps_ready(&unit, &self.results) {
                tracing::warn!(unit_id = %id, "unit stranded: producer failed");
                continue;
            }
            let Some((args, kwargs)) = self.try_resolve(&unit) else {
                continue;
            };
            tracing::debug!(unit_id = %id, "starting unit (serial)");
            let (tok_ok, tok_err) = self.register(&unit, &tx);
            unit.start(args, kwargs);
            unit.wait(None);
            let _ = unit.remove_hook("on_success", tok_ok);
            let _ = unit.remove_hook("on_exception", tok_err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    #[test]
    fn results_store_round_trips() {
        let store = ResultsStore::new();
        let id = crate::unit::Unit::new(None, None, Vec::new(), HashMap::new()).id();
        assert!(!store.contains(id));
        store.insert(id, Value::from(1));
        assert!(store.contains(id));
        assert_eq!(store.get(id), Some(Value::from(1)));
    }

    #[test]
    fn error_log_preserves_arrival_order() {
        let log = ErrorLog::new();
        log.push(Value::from("a"));
        log.push(Value::from("b"));
        assert_eq!(log.snapshot(), vec![Value::from("a"), Value::from("b")]);
    }

    #[test]
    fn empty_graph_fails_to_start() {
        let graph = Graph::new();
        let err = ControlLoop::start(graph, SchedulingMode::Concurrent);
        assert!(matches!(err, Err(GraphError::EmptyGraph)));
    }

    #[test]
    fn single_noop_unit_runs_to_completion() {
        let unit = Arc::new(Unit::new(None, None, Vec::new(), HashMap::new()));
        let graph = Graph::with_units(&[Arc::clone(&unit)]).unwrap();
        let control = ControlLoop::start(graph, SchedulingMode::Concurrent).unwrap();
        control.wait(None);
        assert_eq!(control.results().len(), 1);
        assert!(control.errors().is_empty());
    }

    #[test]
    fn failing_unit_is_recorded_in_errors_only() {
        let callable: crate::unit::Callable =
            Arc::new(|_args, _kwargs| Err(Value::from("boom")));
        let unit = Arc::new(Unit::new(Some(callable), None, Vec::new(), HashMap::new()));
        let graph = Graph::with_units(&[Arc::clone(&unit)]).unwrap();
        let control = ControlLoop::start(graph, SchedulingMode::Concurrent).unwrap();
        control.wait(None);
        assert!(control.results().is_empty());
        assert_eq!(control.errors().len(), 1);
    }

    #[test]
    fn stranded_unit_releases_ordering_only_successor() {
        use crate::depref::DepRef;
        let fail_callable: crate::unit::Callable =
            Arc::new(|_args, _kwargs| Err(Value::from("boom")));
        let p = Arc::new(Unit::new(
            Some(fail_callable),
            Some("p".into()),
            Vec::new(),
            HashMap::new(),
        ));
        let c = Arc::new(Unit::new(None, Some("c".into()), Vec::new(), HashMap::new()));
        c.set_args(
            vec![ArgSlot::Dep(DepRef::new(&p, None::<String>))],
            HashMap::new(),
        );
        let d = Arc::new(Unit::new(None, Some("d".into()), Vec::new(), HashMap::new()));

        let mut graph =
            Graph::with_units(&[Arc::clone(&p), Arc::clone(&c), Arc::clone(&d)]).unwrap();
        graph
            .add_precedence(&[Arc::clone(&c), Arc::clone(&d)])
            .unwrap();

        let control = ControlLoop::start(graph, SchedulingMode::Concurrent).unwrap();
        assert!(
            control.wait(Some(Duration::from_secs(2))),
            "scheduler deadlocked on a stranded unit's ordering-only successor"
        );
        assert!(control.results().contains_key(&d.id()));
        assert!(!control.results().contains_key(&c.id()));
        assert_eq!(control.errors().len(), 1);
    }

    #[test]
    fn serial_mode_runs_every_unit() {
        let flag = Arc::new(StdAtomicBool::new(false));
        let flag_clone = Arc::clone(&flag);
        let callable: crate::unit::Callable = Arc::new(move |_args, _kwargs| {
            flag_clone.store(true, Ordering::SeqCst);
            Ok(Value::Null)
        });
        let unit = Arc::new(Unit::new(Some(callable), None, Vec::new(), HashMap::new()));
        let graph = Graph::with_units(&[Arc::clone(&unit)]).unwrap();
        let control = ControlLoop::start(graph, SchedulingMode::Serial).unwrap();
        control.wait(None);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_before_wait_strands_unstarted_units() {
        let a_callable: crate::unit::Callable = Arc::new(|_args, _kwargs| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(Value::Null)
        });
        let a = Arc::new(Unit::new(Some(a_callable), Some("a".into()), Vec::new(), HashMap::new()));
        let b = Arc::new(Unit::new(None, Some("b".into()), Vec::new(), HashMap::new()));
        let mut graph = Graph::with_units(&[Arc::clone(&a), Arc::clone(&b)]).unwrap();
        graph
            .add_precedence(&[Arc::clone(&a), Arc::clone(&b)])
            .unwrap();
        let control = ControlLoop::start(graph, SchedulingMode::Concurrent).unwrap();
        control.cancel();
        control.wait(None);
        assert!(!control.results().contains_key(&b.id()));
        assert!(control.errors().is_empty());
    }
}
