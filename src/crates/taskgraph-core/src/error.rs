//! Error types for unit misuse and graph construction/execution failures.
//!
//! # Error Hierarchy
//!
//! ```text
//! UnitError
//! └── UnknownHook       - add_hook/remove_hook called with an unrecognized event name
//!
//! GraphError
//! ├── UnknownProducer    - a DepRef points at a unit not yet in the graph
//! ├── CycleDetected       - a mutation would make the graph non-acyclic
//! ├── EmptyGraph          - start() called with zero nodes
//! ├── PrecedenceArity     - add_precedence() called with fewer than two units
//! └── MissingField        - a DepRef field selector has no match in the producer's output
//! ```

use serde::Serialize;

/// Errors raised synchronously by misuse of the [`crate::unit::Unit`] API.
///
/// Unlike [`GraphError`], a `UnitError` is never stored in the scheduler's
/// error list (it is returned directly from `add_hook`/`remove_hook`), so it
/// carries no `Serialize` impl.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UnitError {
    /// `add_hook`/`remove_hook` called with an event name other than
    /// `on_success` or `on_exception`.
    #[error("unknown hook \"{hook}\"")]
    UnknownHook {
        /// The offending hook name.
        hook: String,
    },
}

/// Errors raised by graph construction or surfaced from a run.
///
/// Tagged internally by variant name (`kind`) so a consumer of
/// [`GraphError::to_value`] can recover the structured fields (`producer`,
/// `field`) of a variant, not just its rendered message.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[serde(tag = "kind")]
pub enum GraphError {
    /// A `DepRef` slot on a unit passed to `add_tasks` points at a producer
    /// that is not (yet) a member of the graph.
    #[error(
        "DepRef wrapping unrecognized task \"{producer}\": producer must be added to the graph"
    )]
    UnknownProducer {
        /// Display name of the dangling producer.
        producer: String,
    },

    /// Committing the mutation would introduce a cycle. The mutation is
    /// rolled back before this error is returned.
    #[error("Cycle detected. Ordering and data constraints must not introduce cycles; a task graph must remain acyclic.")]
    CycleDetected,

    /// `start()` was called on a graph with no nodes.
    #[error("Called start() on an empty graph. An empty graph cannot be started.")]
    EmptyGraph,

    /// `add_precedence()` was called with fewer than two units.
    #[error("add_precedence called with fewer than two arguments; precedence constraints must be expressed in terms of 2 or more units")]
    PrecedenceArity,

    /// A `DepRef` field selector did not match a key in the producer's
    /// returned value.
    #[error("DepRef field \"{field}\" not found in output of task \"{producer}\"")]
    MissingField {
        /// Display name of the producer whose output was indexed.
        producer: String,
        /// The selector that failed to resolve.
        field: String,
    },
}

impl GraphError {
    /// Render this error as a JSON payload suitable for the errors list,
    /// which stores [`serde_json::Value`] rather than a typed error so that
    /// it can sit alongside callable-thrown values of arbitrary shape. Goes
    /// through the derived [`Serialize`] impl, so the variant's own fields
    /// (e.g. `producer`, `field`) survive the conversion instead of being
    /// flattened into a message string.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("GraphError always serializes")
    }
}

/// Convenience alias matching the `Result<T, GraphError>` convention used
/// throughout graph construction and scheduling.
pub type Result<T, E = GraphError> = std::result::Result<T, E>;
