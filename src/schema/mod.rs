//! Schema validation for building entities
//!
//! A static rule table gatekeeps local writes: which entity types exist,
//! which fields they require, and which relationship types they may carry
//! toward which target types. Validation runs only at the local mutation
//! boundary; merges are deliberately never re-validated, so convergence
//! stays unconditional even against differently-versioned peers.

pub mod rules;

pub use rules::{EntityRule, SchemaValidator, SchemaViolation};
