//! The replication bus
//!
//! A bus owns one [`ReplicaStore`] and a transport connection. Local
//! mutations are validated, applied to the entity's register, then
//! serialized and published on the topic bound to the entity type.
//! Inbound messages are decoded once at the boundary, adopted or merged,
//! and re-broadcast only when the merge changed observable state so that
//! replicas not directly connected still converge without loops.

pub mod audit;
pub mod memory;
pub mod message;
pub mod store;
pub mod transport;

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::register::{AttrMap, EntityId, EntityRegister, RegisterError, RegisterState, ReplicaId};
use crate::schema::{SchemaValidator, SchemaViolation};

use audit::AuditLog;
use message::{BusMessage, OperationType};
use store::ReplicaStore;
use transport::{MessageHandler, Transport, TransportError};

/// Recover the guard even from a poisoned mutex: register mutations are
/// single automerge transactions, so the document behind a poisoned lock
/// is still internally consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error(transparent)]
    Schema(#[from] SchemaViolation),

    #[error("entity {0} not found")]
    EntityNotFound(EntityId),

    #[error("entity {0} already exists on this replica")]
    EntityExists(EntityId),

    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error("message decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("audit log error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a change came from, as seen by this bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Emitted on the change channel for every applied mutation.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub entity_id: EntityId,
    pub entity_type: String,
    pub operation: OperationType,
    pub origin: ChangeOrigin,
}

/// The replication bus for one replica.
pub struct Bus {
    replica_id: ReplicaId,
    author: String,
    namespace: String,
    validator: SchemaValidator,
    transport: Arc<dyn Transport>,
    store: ReplicaStore,
    advertised: Mutex<HashSet<String>>,
    subscribed: Mutex<Vec<String>>,
    audit: Option<AuditLog>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Bus {
    pub fn new(replica_id: impl Into<ReplicaId>, transport: Arc<dyn Transport>) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            replica_id: replica_id.into(),
            author: default_author(),
            namespace: "ifc".to_string(),
            validator: SchemaValidator::ifc(),
            transport,
            store: ReplicaStore::new(),
            advertised: Mutex::new(HashSet::new()),
            subscribed: Mutex::new(Vec::new()),
            audit: None,
            changes,
        }
    }

    /// Replace the default IFC rule table.
    pub fn with_validator(mut self, validator: SchemaValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Topic namespace; topics are `"<namespace>/<entity_type>"`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Human/process label stamped on outbound messages.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Record every published message in an append-only log under `dir`.
    pub fn with_audit_log(mut self, dir: impl AsRef<Path>) -> Result<Self, BusError> {
        self.audit = Some(AuditLog::create(dir)?);
        Ok(self)
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    /// Subscribe to the topic of every entity type the validator knows.
    ///
    /// Takes `&Arc<Self>` because the transport holds weak handles back
    /// to the bus for delivery.
    pub fn connect(self: &Arc<Self>) -> Result<(), BusError> {
        // Idempotent: subscribing twice would double every delivery.
        if !lock(&self.subscribed).is_empty() {
            return Ok(());
        }
        for entity_type in self.validator.entity_types() {
            let topic = format!("{}/{}", self.namespace, entity_type);
            let bus = Arc::downgrade(self);
            let handler: MessageHandler = Arc::new(move |payload: &[u8]| {
                if let Some(bus) = bus.upgrade() {
                    bus.handle_message(payload);
                }
            });
            self.transport.subscribe(&topic, handler)?;
            lock(&self.subscribed).push(topic);
        }
        log::info!(
            "bus {} subscribed to {} topics",
            self.replica_id,
            lock(&self.subscribed).len()
        );
        Ok(())
    }

    /// Withdraw all subscriptions and advertisements.
    pub fn disconnect(&self) -> Result<(), BusError> {
        for topic in lock(&self.subscribed).drain(..) {
            self.transport.unsubscribe(&topic)?;
        }
        for topic in lock(&self.advertised).drain() {
            self.transport.unadvertise(&topic)?;
        }
        Ok(())
    }

    /// Publish a new entity under a freshly generated id.
    pub fn publish_entity(&self, entity_type: &str, data: &AttrMap) -> Result<EntityId, BusError> {
        self.publish_entity_with_id(Uuid::new_v4(), entity_type, data)
    }

    /// Publish a new entity under a caller-supplied id (e.g. preserved
    /// from an imported IFC file). On a validation failure nothing is
    /// stored and nothing is published.
    pub fn publish_entity_with_id(
        &self,
        id: EntityId,
        entity_type: &str,
        data: &AttrMap,
    ) -> Result<EntityId, BusError> {
        self.validator.validate_entity(entity_type, data)?;
        let mut register = EntityRegister::create_with_id(id, entity_type, &self.replica_id, data)?;
        let outbound = self.outbound(OperationType::Create, &mut register)?;
        if self.store.try_insert(register).is_err() {
            // Replacing the existing register would discard its history.
            return Err(BusError::EntityExists(id));
        }
        self.send(outbound)?;
        self.notify(id, entity_type, OperationType::Create, ChangeOrigin::Local);
        Ok(id)
    }

    /// Update fields of a locally known entity and re-publish it.
    pub fn update_entity(&self, id: EntityId, data: &AttrMap) -> Result<(), BusError> {
        let entry = self.store.get(id).ok_or(BusError::EntityNotFound(id))?;
        let (entity_type, outbound) = {
            let mut register = lock(&entry);
            let entity_type = register.entity_type().to_string();
            // Validate against the union of existing and new fields, so a
            // partial update cannot strip a required field.
            let mut merged = register.data()?;
            merged.extend(data.clone());
            self.validator.validate_entity(&entity_type, &merged)?;
            register.update(data)?;
            (entity_type, self.outbound(OperationType::Update, &mut register)?)
        };
        self.send(outbound)?;
        self.notify(id, &entity_type, OperationType::Update, ChangeOrigin::Local);
        Ok(())
    }

    /// Relate two locally known entities and re-publish the source.
    pub fn add_relationship(
        &self,
        source_id: EntityId,
        rel_type: &str,
        target_id: EntityId,
        attrs: &AttrMap,
    ) -> Result<(), BusError> {
        let source = self
            .store
            .get(source_id)
            .ok_or(BusError::EntityNotFound(source_id))?;
        let target = self
            .store
            .get(target_id)
            .ok_or(BusError::EntityNotFound(target_id))?;
        // Read the target type in its own scope: source and target may be
        // the same entity, and the register mutex is not reentrant.
        let target_type = lock(&target).entity_type().to_string();
        let (entity_type, outbound) = {
            let mut register = lock(&source);
            let entity_type = register.entity_type().to_string();
            self.validator
                .validate_relationship(&entity_type, rel_type, &target_type)?;
            register.add_relationship(rel_type, target_id, attrs)?;
            (
                entity_type,
                self.outbound(OperationType::AddRelationship, &mut register)?,
            )
        };
        self.send(outbound)?;
        self.notify(
            source_id,
            &entity_type,
            OperationType::AddRelationship,
            ChangeOrigin::Local,
        );
        Ok(())
    }

    pub fn has_entity(&self, id: EntityId) -> bool {
        self.store.contains(id)
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.store.ids()
    }

    /// Observable snapshot of a locally known entity.
    pub fn entity_state(&self, id: EntityId) -> Result<RegisterState, BusError> {
        let entry = self.store.get(id).ok_or(BusError::EntityNotFound(id))?;
        let register = lock(&entry);
        Ok(register.state()?)
    }

    /// Change notifications for every applied local or remote mutation.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Entry point for the transport's delivery callback.
    ///
    /// Total: any decode or processing failure is logged and the message
    /// dropped, without retry and without taking the bus down.
    pub fn handle_message(&self, payload: &[u8]) {
        if let Err(err) = self.process_message(payload) {
            log::warn!("bus {}: dropping inbound message: {}", self.replica_id, err);
        }
    }

    fn process_message(&self, payload: &[u8]) -> Result<(), BusError> {
        let msg: BusMessage = serde_json::from_slice(payload)?;
        if msg.replica_id == self.replica_id {
            return Ok(());
        }

        let mut incoming = EntityRegister::deserialize(&msg.crdt_data)?;
        if incoming.id() != msg.id {
            return Err(BusError::MalformedMessage(format!(
                "message id {} does not match causal log id {}",
                msg.id,
                incoming.id()
            )));
        }

        let id = msg.id;
        let entity_type = incoming.entity_type().to_string();
        match self.store.try_insert(incoming) {
            Ok(_) => {
                // First sighting: adopt the remote state as-is.
                log::debug!(
                    "bus {}: created entity {} ({}) from {}",
                    self.replica_id,
                    id,
                    entity_type,
                    msg.replica_id
                );
                self.notify(id, &entity_type, msg.operation_type, ChangeOrigin::Remote);
                Ok(())
            }
            Err(mut incoming) => {
                let entry = self.store.get(id).ok_or(BusError::EntityNotFound(id))?;
                let rebroadcast = {
                    let mut register = lock(&entry);
                    let before = register.state()?;
                    register.merge(&mut incoming)?;
                    if register.state()? != before {
                        Some(self.outbound(OperationType::Broadcast, &mut register)?)
                    } else {
                        None
                    }
                };
                // Re-broadcast only when the merge changed observable
                // state; replaying the same message again falls through
                // here, which is what keeps gossip loop-free.
                if let Some(outbound) = rebroadcast {
                    self.send(outbound)?;
                    self.notify(id, &entity_type, msg.operation_type, ChangeOrigin::Remote);
                }
                Ok(())
            }
        }
    }

    /// Serialize a register into its wire message and topic. Called while
    /// the register lock is held; the actual publish happens after the
    /// lock is released so re-entrant transports cannot deadlock.
    fn outbound(
        &self,
        operation_type: OperationType,
        register: &mut EntityRegister,
    ) -> Result<(String, Vec<u8>), BusError> {
        let msg =
            BusMessage::from_register(operation_type, &self.author, &self.replica_id, register)?;
        let topic = msg.topic(&self.namespace);
        Ok((topic, serde_json::to_vec(&msg)?))
    }

    fn send(&self, (topic, payload): (String, Vec<u8>)) -> Result<(), BusError> {
        if lock(&self.advertised).insert(topic.clone()) {
            self.transport.advertise(&topic)?;
        }
        self.transport.publish(&topic, &payload)?;
        if let Some(audit) = &self.audit {
            if let Err(err) = audit.append(&payload) {
                log::warn!("bus {}: audit log write failed: {}", self.replica_id, err);
            }
        }
        log::debug!(
            "bus {}: published {} bytes to {}",
            self.replica_id,
            payload.len(),
            topic
        );
        Ok(())
    }

    fn notify(
        &self,
        entity_id: EntityId,
        entity_type: &str,
        operation: OperationType,
        origin: ChangeOrigin,
    ) {
        // Nobody listening is fine.
        let _ = self.changes.send(ChangeEvent {
            entity_id,
            entity_type: entity_type.to_string(),
            operation,
            origin,
        });
    }
}

fn default_author() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
