//! In-process register store
//!
//! Maps entity ids to their registers. Each bus owns exactly one store;
//! nothing here is global. Registers sit behind their own mutex so
//! read-then-write sequences on one entity are serialized while
//! different entities proceed fully in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::register::{EntityId, EntityRegister};

use super::lock;

#[derive(Default)]
pub struct ReplicaStore {
    registers: Mutex<HashMap<EntityId, Arc<Mutex<EntityRegister>>>>,
}

impl ReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        lock(&self.registers).contains_key(&id)
    }

    pub fn get(&self, id: EntityId) -> Option<Arc<Mutex<EntityRegister>>> {
        lock(&self.registers).get(&id).cloned()
    }

    /// Insert a register for an unseen id. When the id is already present
    /// the register is handed back untouched so the caller can merge it
    /// instead; the check and the insert happen under one map lock.
    pub fn try_insert(
        &self,
        register: EntityRegister,
    ) -> Result<Arc<Mutex<EntityRegister>>, EntityRegister> {
        let mut map = lock(&self.registers);
        match map.entry(register.id()) {
            std::collections::hash_map::Entry::Occupied(_) => Err(register),
            std::collections::hash_map::Entry::Vacant(slot) => {
                Ok(slot.insert(Arc::new(Mutex::new(register))).clone())
            }
        }
    }

    pub fn ids(&self) -> Vec<EntityId> {
        lock(&self.registers).keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.registers).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.registers).is_empty()
    }
}
