//! Per-entity convergent registers
//!
//! Each building entity is backed by one automerge document wrapping its
//! scalar fields, its relationships to other entities, and a little
//! creation metadata. The document's full edit history is what travels
//! between replicas, so merges converge no matter the delivery order.

pub mod entity;
pub mod value;

pub use entity::{EntityRegister, RegisterError, RegisterState};
pub use value::{AttrMap, EntityId, RelationshipMap, ReplicaId, Scalar};
