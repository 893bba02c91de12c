//! Scalar values and the core identifier/map aliases

use automerge::ScalarValue as AmScalar;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for an entity; the merge key for its register
pub type EntityId = Uuid;

/// Label of the replica that created or last mutated a register
pub type ReplicaId = String;

/// Flat map of field name to scalar value
pub type AttrMap = BTreeMap<String, Scalar>;

/// relationship-type -> target entity -> relation attributes
pub type RelationshipMap = BTreeMap<String, BTreeMap<EntityId, AttrMap>>;

/// A scalar value carried by an entity field or a relation attribute.
///
/// The variant is the wire type: callers choose it explicitly at every
/// write boundary, and it is preserved verbatim through merge. Nothing
/// in the crate infers a wire type from an ambient runtime type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Boolean(bool),
    Number(f64),
    Text(String),
}

impl Scalar {
    pub fn number(n: f64) -> Self {
        Scalar::Number(n)
    }

    pub fn boolean(b: bool) -> Self {
        Scalar::Boolean(b)
    }

    pub fn text(s: impl Into<String>) -> Self {
        Scalar::Text(s.into())
    }

    /// Convert to the automerge scalar representation.
    pub(crate) fn to_automerge(&self) -> AmScalar {
        match self {
            Scalar::Number(n) => AmScalar::F64(*n),
            Scalar::Boolean(b) => AmScalar::Boolean(*b),
            Scalar::Text(s) => AmScalar::Str(s.as_str().into()),
        }
    }

    /// Read back from an automerge scalar.
    ///
    /// Integers written by foreign peers are widened to `Number`; value
    /// kinds with no counterpart here (bytes, counters, null) yield
    /// `None` and are simply absent from the flattened view.
    pub(crate) fn from_automerge(value: &AmScalar) -> Option<Scalar> {
        match value {
            AmScalar::F64(n) => Some(Scalar::Number(*n)),
            AmScalar::Int(i) => Some(Scalar::Number(*i as f64)),
            AmScalar::Uint(u) => Some(Scalar::Number(*u as f64)),
            AmScalar::Boolean(b) => Some(Scalar::Boolean(*b)),
            AmScalar::Str(s) => Some(Scalar::Text(s.to_string())),
            _ => None,
        }
    }
}

impl From<f64> for Scalar {
    fn from(n: f64) -> Self {
        Scalar::Number(n)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Boolean(b)
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Text(s)
    }
}
