//! The replication wire message
//!
//! One explicit tagged structure, decoded exactly once at the receive
//! boundary. The flattened `data`/`relationships` views exist for
//! consumers that never decode the causal log; `crdt_data` is the only
//! field required for a correct merge.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::register::{AttrMap, EntityId, EntityRegister, RegisterError, RelationshipMap, ReplicaId};

/// Advisory label for what triggered a publish. Not required for merge
/// correctness; consumers use it for tracing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    AddRelationship,
    Broadcast,
}

/// One replication message, produced per publish event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BusMessage {
    pub operation_type: OperationType,
    /// Unique per message, for tracing and consumer-side dedup.
    pub operation_id: Uuid,
    /// Human/process label of the publisher.
    pub author: String,
    pub id: EntityId,
    pub entity_type: String,
    /// Originating replica; receivers drop their own messages by this.
    pub replica_id: ReplicaId,
    /// Advisory wall-clock seconds.
    pub timestamp: f64,
    /// Cached flattened field view.
    pub data: AttrMap,
    /// Cached flattened relationship view.
    pub relationships: RelationshipMap,
    /// The authoritative causal log, base64-encoded on the wire.
    #[serde(with = "base64_blob")]
    pub crdt_data: Vec<u8>,
}

impl BusMessage {
    /// Build a message from a register's current state.
    pub fn from_register(
        operation_type: OperationType,
        author: &str,
        replica_id: &str,
        register: &mut EntityRegister,
    ) -> Result<Self, RegisterError> {
        let state = register.state()?;
        Ok(Self {
            operation_type,
            operation_id: Uuid::new_v4(),
            author: author.to_string(),
            id: register.id(),
            entity_type: register.entity_type().to_string(),
            replica_id: replica_id.to_string(),
            timestamp: register.timestamp()?,
            data: state.data,
            relationships: state.relationships,
            crdt_data: register.serialize(),
        })
    }

    /// The topic this message belongs on: one per entity type, shared by
    /// every entity of that type.
    pub fn topic(&self, namespace: &str) -> String {
        format!("{}/{}", namespace, self.entity_type)
    }
}

mod base64_blob {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
