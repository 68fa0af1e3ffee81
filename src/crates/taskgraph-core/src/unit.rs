//! [`Unit`]: the basic schedulable computation.
//!
//! A `Unit` wraps a callable, its positional/keyword argument slots (each
//! either a literal value or a [`crate::depref::DepRef`]), and a small set of
//! lifecycle hooks. `Unit` does not know about the [`crate::graph::Graph`] it
//! may belong to; the graph only inspects a unit's argument slots to derive
//! `data` edges.

use crate::error::UnitError;
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Process-unique identifier for a [`Unit`], assigned at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(0);

fn next_unit_id() -> UnitId {
    UnitId(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Process-unique identifier for a single worker-thread invocation of a
/// [`Unit`]. A unit started and restarted gets a distinct `WorkerId` each
/// time, which is what the test suite uses to tell two runs of the same unit
/// apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(0);

fn next_worker_id() -> WorkerId {
    WorkerId(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
}

/// A unit's callable: takes resolved positional and keyword arguments,
/// returns the produced value on success or a thrown value on failure.
///
/// Both the return value and the thrown value are carried as
/// [`serde_json::Value`] so that [`crate::depref::DepRef`] field selectors
/// can index into object-shaped outputs without a generic type parameter on
/// `Unit` itself.
pub type Callable =
    Arc<dyn Fn(&[Value], &HashMap<String, Value>) -> Result<Value, Value> + Send + Sync>;

/// An argument slot: either a literal value or a reference to another unit's
/// (possibly field-selected) output.
#[derive(Clone)]
pub enum ArgSlot {
    /// A value known at construction time.
    Literal(Value),
    /// A value to be resolved from a producer unit's output at start time.
    Dep(crate::depref::DepRef),
}

impl From<Value> for ArgSlot {
    fn from(v: Value) -> Self {
        ArgSlot::Literal(v)
    }
}

impl From<crate::depref::DepRef> for ArgSlot {
    fn from(d: crate::depref::DepRef) -> Self {
        ArgSlot::Dep(d)
    }
}

/// The two lifecycle events a [`Unit`] fires hooks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    /// Fired once, on the worker thread, when the callable returns.
    OnSuccess,
    /// Fired once, on the worker thread, when the callable throws (returns
    /// `Err`, or panics).
    OnException,
}

impl HookEvent {
    fn parse(name: &str) -> Result<Self, UnitError> {
        match name {
            "on_success" => Ok(HookEvent::OnSuccess),
            "on_exception" => Ok(HookEvent::OnException),
            other => Err(UnitError::UnknownHook {
                hook: other.to_string(),
            }),
        }
    }
}

/// A hook callback: invoked with the unit id and the success value or thrown
/// value.
pub type HookFn = Arc<dyn Fn(UnitId, Value) + Send + Sync>;

/// Opaque token returned by [`Unit::add_hook`], used to remove that
/// registration later. Closures have no identity comparison in Rust, so a
/// token stands in for the set-membership-by-identity semantics described
/// for the original hook registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookToken(u64);

static NEXT_HOOK_TOKEN: AtomicU64 = AtomicU64::new(0);

/// A running or finished worker-thread invocation of a [`Unit`].
pub struct Worker {
    id: WorkerId,
    unit_id: UnitId,
    done: Arc<(Mutex<bool>, Condvar)>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// The process-wide identifier of this worker-thread invocation.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// The id of the [`Unit`] this worker is executing.
    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    /// Block until this worker terminates, or until `timeout` elapses.
    /// Returns `true` if the worker had terminated by the time this call
    /// returns, `false` on timeout.
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
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        true
    }
}

/// A schedulable computation: a name, a callable, argument slots, and
/// lifecycle hooks.
pub struct Unit {
    id: UnitId,
    name: String,
    callable: Callable,
    args: Mutex<Vec<ArgSlot>>,
    kwargs: Mutex<HashMap<String, ArgSlot>>,
    hooks: Mutex<HashMap<HookEvent, HashMap<HookToken, HookFn>>>,
    worker: Mutex<Option<Arc<Worker>>>,
}

impl Unit {
    /// Build a new unit. Pass `None` for `callable` to get a no-op unit that
    /// returns [`Value::Null`].
    pub fn new(
        callable: Option<Callable>,
        name: Option<String>,
        args: Vec<ArgSlot>,
        kwargs: HashMap<String, ArgSlot>,
    ) -> Self {
        let id = next_unit_id();
        let callable: Callable = callable.unwrap_or_else(|| {
            Arc::new(|_args: &[Value], _kwargs: &HashMap<String, Value>| Ok(Value::Null))
        });
        let name = name.unwrap_or_else(|| format!("lambda:{id}"));
        Unit {
            id,
            name,
            callable,
            args: Mutex::new(args),
            kwargs: Mutex::new(kwargs),
            hooks: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
        }
    }

    /// This unit's process-unique identifier.
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// This unit's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the argument slots wholesale. Does not validate `DepRef`
    /// targets (that is the graph's job on its next mutation) and does not
    /// touch hook registrations.
    pub fn set_args(&self, args: Vec<ArgSlot>, kwargs: HashMap<String, ArgSlot>) {
        *self.args.lock() = args;
        *self.kwargs.lock() = kwargs;
    }

    /// A snapshot of the current positional argument slots.
    pub fn args_snapshot(&self) -> Vec<ArgSlot> {
        self.args.lock().clone()
    }

    /// A snapshot of the current keyword argument slots.
    pub fn kwargs_snapshot(&self) -> HashMap<String, ArgSlot> {
        self.kwargs.lock().clone()
    }

    /// Register a hook for `event` ("on_success" or "on_exception"),
    /// returning a token that can later be passed to [`Unit::remove_hook`].
    pub fn add_hook(&self, event: &str, f: HookFn) -> Result<HookToken, UnitError> {
        let event = HookEvent::parse(event)?;
        let token = HookToken(NEXT_HOOK_TOKEN.fetch_add(1, Ordering::Relaxed));
        self.hooks
            .lock()
            .entry(event)
            .or_default()
            .insert(token, f);
        Ok(token)
    }

    /// Remove a previously registered hook. A token that is not currently
    /// registered (already removed, or for the wrong unit) is a silent
    /// no-op, except that an unrecognized event name is still a [`UnitError`].
    pub fn remove_hook(&self, event: &str, token: HookToken) -> Result<(), UnitError> {
        let event = HookEvent::parse(event)?;
        if let Some(set) = self.hooks.lock().get_mut(&event) {
            set.remove(&token);
        }
        Ok(())
    }

    fn trigger_hooks(&self, event: HookEvent, value: Value) {
        let hooks: Vec<HookFn> = self
            .hooks
            .lock()
            .get(&event)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        for hook in hooks {
            hook(self.id, value.clone());
        }
    }

    /// Spawn a fresh worker thread invoking the callable with `args`/`kwargs`
    /// (already resolved by the caller — a `Unit` never resolves its own
    /// `DepRef` slots). Returns immediately; the worker handle is also
    /// stored so that [`Unit::wait`] can observe the most recent run.
    pub fn start(self: &Arc<Self>, args: Vec<Value>, kwargs: HashMap<String, Value>) -> WorkerId {
        let worker_id = next_worker_id();
        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let unit = Arc::clone(self);
        let done_for_thread = Arc::clone(&done);

        tracing::debug!(unit_id = %unit.id, worker_id = %worker_id, unit = %unit.name, "starting worker");

        let handle = std::thread::Builder::new()
            .name(format!("taskgraph-worker-{worker_id}"))
            .spawn(move || {
                let callable = Arc::clone(&unit.callable);
                let outcome = catch_unwind(AssertUnwindSafe(|| callable(&args, &kwargs)));
                match outcome {
                    Ok(Ok(value)) => {
                        tracing::debug!(unit_id = %unit.id, worker_id = %worker_id, "unit succeeded");
                        unit.trigger_hooks(HookEvent::OnSuccess, value);
                    }
                    Ok(Err(thrown)) => {
                        tracing::error!(unit_id = %unit.id, worker_id = %worker_id, "unit raised an error");
                        unit.trigger_hooks(HookEvent::OnException, thrown);
                    }
                    Err(panic) => {
                        let message = panic_message(panic);
                        tracing::error!(unit_id = %unit.id, worker_id = %worker_id, panic = %message, "unit panicked");
                        unit.trigger_hooks(
                            HookEvent::OnException,
                            serde_json::json!({"panic": message}),
                        );
                    }
                }
                let (lock, cvar) = &*done_for_thread;
                *lock.lock() = true;
                cvar.notify_all();
            })
            .expect("failed to spawn worker thread");

        let worker = Arc::new(Worker {
            id: worker_id,
            unit_id: self.id,
            done,
            handle: Mutex::new(Some(handle)),
        });
        *self.worker.lock() = Some(worker);
        worker_id
    }

    /// Block until the most recently started worker terminates (or
    /// `timeout` elapses). Returns `false` if there is no worker yet, or if
    /// `timeout` elapsed first.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let worker = self.worker.lock().clone();
        match worker {
            Some(worker) => worker.wait(timeout),
            None => false,
        }
    }

    /// The most recently started worker, if any.
    pub fn worker(&self) -> Option<Arc<Worker>> {
        self.worker.lock().clone()
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unit[{}]", self.name)
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unit panicked with a non-string payload".to_string()
    }
}
