// IFC Databus - Replicated Building-Data Bus

pub mod bus;
pub mod register;
pub mod schema;

pub use bus::memory::{MemoryBroker, MemoryTransport};
pub use bus::message::{BusMessage, OperationType};
pub use bus::transport::{MessageHandler, Transport, TransportError};
pub use bus::{Bus, BusError, ChangeEvent, ChangeOrigin};
pub use register::{
    AttrMap, EntityId, EntityRegister, RegisterError, RegisterState, RelationshipMap, ReplicaId,
    Scalar,
};
pub use schema::{EntityRule, SchemaValidator, SchemaViolation};
