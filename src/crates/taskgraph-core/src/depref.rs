//! [`DepRef`]: a declaration that an argument slot should be filled from
//! another unit's output.

use crate::error::GraphError;
use crate::scheduler::ResultsStore;
use crate::unit::{Unit, UnitId};
use serde_json::Value;

/// A reference to a producer unit's output, optionally narrowed to one field
/// of that output.
///
/// `DepRef` holds the producer's id and a snapshot of its name (for error
/// messages), not a live pointer to the `Unit` itself — the graph and
/// scheduler keep an arena of units keyed by id, and `DepRef` only ever
/// needs the id to look the producer's result up in the results store.
#[derive(Debug, Clone)]
pub struct DepRef {
    producer_id: UnitId,
    producer_name: String,
    field: Option<String>,
}

impl DepRef {
    /// Build a reference to `producer`'s whole output, or (if `field` is
    /// given) to one key of it.
    pub fn new(producer: &Unit, field: Option<impl Into<String>>) -> Self {
        DepRef {
            producer_id: producer.id(),
            producer_name: producer.name().to_string(),
            field: field.map(Into::into),
        }
    }

    /// The id of the producer unit this reference depends on.
    pub fn producer_id(&self) -> UnitId {
        self.producer_id
    }

    /// The field selector, if this reference narrows to one key of the
    /// producer's output.
    pub fn field(&self) -> Option<&str> {
        self.field.as_deref()
    }

    /// Display name of the producer, snapshotted at construction time. Used
    /// in error messages when the producer itself is not reachable (e.g. it
    /// is not yet a member of the graph).
    pub fn producer_name(&self) -> &str {
        &self.producer_name
    }

    /// True iff the producer has a stored result in `results`.
    pub fn is_ready(&self, results: &ResultsStore) -> bool {
        results.contains(self.producer_id)
    }

    /// Resolve this reference's value. Precondition: [`DepRef::is_ready`].
    ///
    /// If there is no field selector, returns the producer's output
    /// verbatim. If there is one, the output must be a JSON object
    /// containing that key, or a [`GraphError::MissingField`] is raised.
    pub fn resolve(&self, results: &ResultsStore) -> Result<Value, GraphError> {
        let value = results
            .get(self.producer_id)
            .expect("DepRef::resolve called before is_ready");
        match &self.field {
            None => Ok(value),
            Some(field) => match value.as_object().and_then(|m| m.get(field)) {
                Some(v) => Ok(v.clone()),
                None => Err(GraphError::MissingField {
                    producer: self.producer_name.clone(),
                    field: field.clone(),
                }),
            },
        }
    }
}
