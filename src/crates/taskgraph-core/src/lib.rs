//! A concurrent task-graph orchestration engine.
//!
//! Build [`Unit`]s, wire them together with [`DepRef`]s and ordering
//! constraints on a [`Graph`], then call [`Graph::start`] to run the whole
//! thing: independent units execute on their own OS thread, a single
//! coordinator thread resolves the partial order and routes completed
//! outputs to the units waiting on them, and [`Graph::results`] /
//! [`Graph::errors`] expose the aggregated outcome once [`Graph::wait`]
//! returns.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use serde_json::Value;
//! use taskgraph_core::{Callable, DepRef, Graph, SchedulingMode, Unit};
//!
//! let say_hello: Callable = Arc::new(|_args: &[Value], _kwargs: &HashMap<String, Value>| {
//!     Ok(Value::from("hello"))
//! });
//! let producer = Arc::new(Unit::new(Some(say_hello), Some("producer".to_string()), Vec::new(), HashMap::new()));
//! let consumer = Arc::new(Unit::new(None, Some("consumer".to_string()), Vec::new(), HashMap::new()));
//! consumer.set_args(vec![DepRef::new(&producer, None::<String>).into()], HashMap::new());
//!
//! let graph = Graph::with_units(&[producer, consumer]).unwrap();
//! graph.start(SchedulingMode::Concurrent).unwrap();
//! graph.wait(None);
//! assert!(graph.errors().is_empty());
//! ```

pub mod depref;
pub mod error;
pub mod graph;
pub mod scheduler;
pub mod unit;

pub use depref::DepRef;
pub use error::{GraphError, Result, UnitError};
pub use graph::{EdgeKind, Graph};
pub use scheduler::{ErrorLog, ResultsStore, SchedulingMode};
pub use unit::{ArgSlot, Callable, HookEvent, HookFn, HookToken, Unit, UnitId, Worker, WorkerId};
