//! The EntityRegister: one convergent document per building entity
//!
//! The register wraps an automerge document whose root carries the entity
//! metadata (`id`, `entity_type`, `replica_id`, `timestamp`) next to two
//! map objects: `data` for scalar fields and `relationships` for the
//! nested relationship graph. All conflict resolution is delegated to
//! automerge's own history merge; this wrapper never re-writes fields
//! after a merge, it only reads state back for caching and display.

use automerge::transaction::{CommitOptions, Transactable};
use automerge::{ActorId, AutoCommit, ObjId, ObjType, ReadDoc, Value as AmValue, ROOT};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use super::value::{AttrMap, EntityId, RelationshipMap, Scalar};

/// Errors raised by register operations
#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("automerge backend error: {0}")]
    Backend(#[from] automerge::AutomergeError),

    /// Attempted to merge registers for two different entities. This is a
    /// programming error upstream and is never silently ignored.
    #[error("cannot merge register {theirs} into register {ours}: ids differ")]
    IdMismatch { ours: EntityId, theirs: EntityId },

    #[error("malformed causal log: {0}")]
    MalformedLog(String),
}

/// Observable state of a register: the flattened fields and relationships.
///
/// Two registers holding the same entity are converged exactly when their
/// observable states compare equal; the bus uses this as its
/// "did the merge change anything" guard.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegisterState {
    pub data: AttrMap,
    pub relationships: RelationshipMap,
}

/// A convergent register for a single building entity
pub struct EntityRegister {
    id: EntityId,
    entity_type: String,
    doc: AutoCommit,
}

/// Advisory wall-clock seconds. Never used for conflict resolution.
fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn instance_actor() -> ActorId {
    ActorId::from(Uuid::new_v4().as_bytes().to_vec())
}

/// Read a root-level text field. Extracts through the scalar variant:
/// automerge's `Display` for strings renders them quoted, so stringifying
/// the scalar directly would corrupt every metadata read-back.
fn text_at(doc: &AutoCommit, key: &str) -> Result<Option<String>, RegisterError> {
    Ok(match doc.get(ROOT, key)? {
        Some((AmValue::Scalar(s), _)) => match Scalar::from_automerge(s.as_ref()) {
            Some(Scalar::Text(text)) => Some(text),
            _ => None,
        },
        _ => None,
    })
}

impl EntityRegister {
    /// Create a register with a freshly generated entity id.
    pub fn create(
        entity_type: &str,
        replica_id: &str,
        fields: &AttrMap,
    ) -> Result<Self, RegisterError> {
        Self::create_with_id(Uuid::new_v4(), entity_type, replica_id, fields)
    }

    /// Create a register with a caller-supplied entity id, e.g. one derived
    /// from an existing IFC GlobalId.
    ///
    /// The document skeleton (id, entity type, the `data` and
    /// `relationships` maps) is written by a deterministic actor derived
    /// from the entity id and committed at a fixed time, so two replicas
    /// that independently create the same entity produce an identical
    /// bootstrap change. Their field maps are then the same automerge
    /// object and merge field-wise instead of one shadowing the other.
    pub fn create_with_id(
        id: EntityId,
        entity_type: &str,
        replica_id: &str,
        fields: &AttrMap,
    ) -> Result<Self, RegisterError> {
        let mut doc = AutoCommit::new();
        doc.set_actor(ActorId::from(id.as_bytes().to_vec()));
        doc.put(ROOT, "id", id.to_string())?;
        doc.put(ROOT, "entity_type", entity_type)?;
        doc.put_object(ROOT, "data", ObjType::Map)?;
        doc.put_object(ROOT, "relationships", ObjType::Map)?;
        doc.commit_with(CommitOptions::default().with_time(0));
        doc.set_actor(instance_actor());

        let mut register = Self {
            id,
            entity_type: entity_type.to_string(),
            doc,
        };
        register.doc.put(ROOT, "replica_id", replica_id)?;
        register.touch()?;
        if !fields.is_empty() {
            register.update(fields)?;
        }
        Ok(register)
    }

    /// Reconstruct a register from a serialized causal log.
    ///
    /// The log carries the full edit history, so the result can merge
    /// correctly with any causally related copy regardless of transport
    /// delay, reordering, or duplication. A fresh actor is installed so
    /// that local mutations on this copy never collide with the sender's.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, RegisterError> {
        let mut doc = AutoCommit::load(bytes)?;
        doc.set_actor(instance_actor());

        let id = text_at(&doc, "id")?
            .ok_or_else(|| RegisterError::MalformedLog("missing entity id".into()))?;
        let id = Uuid::parse_str(&id)
            .map_err(|_| RegisterError::MalformedLog("unparseable entity id".into()))?;
        let entity_type = text_at(&doc, "entity_type")?
            .ok_or_else(|| RegisterError::MalformedLog("missing entity type".into()))?;
        let register = Self {
            id,
            entity_type,
            doc,
        };
        // Both map objects must exist for the register to be usable.
        register.data_root()?;
        register.rels_root()?;
        Ok(register)
    }

    /// Serialize the full causal log (not a snapshot) for transmission.
    pub fn serialize(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// A same-history copy with its own actor, as another replica would
    /// hold after receiving this register's state.
    pub fn fork(&mut self) -> Self {
        let mut doc = self.doc.fork();
        doc.set_actor(instance_actor());
        Self {
            id: self.id,
            entity_type: self.entity_type.clone(),
            doc,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// The schema tag. Immutable after creation.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Label of the replica that created this register. Informational only.
    pub fn replica_id(&self) -> Result<String, RegisterError> {
        Ok(text_at(&self.doc, "replica_id")?.unwrap_or_default())
    }

    /// Advisory wall-clock timestamp of the last local mutation.
    pub fn timestamp(&self) -> Result<f64, RegisterError> {
        match self.doc.get(ROOT, "timestamp")? {
            Some((AmValue::Scalar(s), _)) => {
                Ok(Scalar::from_automerge(s.as_ref()).map_or(0.0, |v| match v {
                    Scalar::Number(n) => n,
                    _ => 0.0,
                }))
            }
            _ => Ok(0.0),
        }
    }

    /// Flattened view of the scalar fields.
    pub fn data(&self) -> Result<AttrMap, RegisterError> {
        let data = self.data_root()?;
        self.read_attr_map(&data)
    }

    /// Flattened view of the relationship graph.
    pub fn relationships(&self) -> Result<RelationshipMap, RegisterError> {
        let rels = self.rels_root()?;
        let mut out = RelationshipMap::new();
        for rel_type in self.doc.keys(&rels).collect::<Vec<_>>() {
            let bucket = match self.doc.get(&rels, rel_type.as_str())? {
                Some((AmValue::Object(ObjType::Map), obj)) => obj,
                _ => continue,
            };
            let mut targets = BTreeMap::new();
            for target_key in self.doc.keys(&bucket).collect::<Vec<_>>() {
                let target_id = match Uuid::parse_str(&target_key) {
                    Ok(id) => id,
                    Err(_) => continue,
                };
                let attrs_obj = match self.doc.get(&bucket, target_key.as_str())? {
                    Some((AmValue::Object(ObjType::Map), obj)) => obj,
                    _ => continue,
                };
                targets.insert(target_id, self.read_attr_map(&attrs_obj)?);
            }
            if !targets.is_empty() {
                out.insert(rel_type, targets);
            }
        }
        Ok(out)
    }

    /// Observable (data, relationships) snapshot.
    pub fn state(&self) -> Result<RegisterState, RegisterError> {
        Ok(RegisterState {
            data: self.data()?,
            relationships: self.relationships()?,
        })
    }

    /// Write a batch of scalar fields and refresh the advisory timestamp.
    pub fn update(&mut self, fields: &AttrMap) -> Result<(), RegisterError> {
        let data = self.data_root()?;
        for (key, value) in fields {
            self.doc.put(&data, key.as_str(), value.to_automerge())?;
        }
        self.touch()
    }

    /// Add or overwrite the relation (rel_type, target).
    ///
    /// A repeated add for the same pair replaces that relation's
    /// attributes rather than accumulating a second edge. The existing
    /// attribute map object is reused (cleared and refilled) so that
    /// concurrent attribute edits on other replicas still merge per key.
    pub fn add_relationship(
        &mut self,
        rel_type: &str,
        target: EntityId,
        attrs: &AttrMap,
    ) -> Result<(), RegisterError> {
        let rels = self.rels_root()?;
        let bucket = match self.doc.get(&rels, rel_type)? {
            Some((AmValue::Object(ObjType::Map), obj)) => obj,
            _ => self.doc.put_object(&rels, rel_type, ObjType::Map)?,
        };
        let target_key = target.to_string();
        let slot = match self.doc.get(&bucket, target_key.as_str())? {
            Some((AmValue::Object(ObjType::Map), obj)) => {
                for stale in self.doc.keys(&obj).collect::<Vec<_>>() {
                    self.doc.delete(&obj, stale.as_str())?;
                }
                obj
            }
            _ => self.doc.put_object(&bucket, target_key.as_str(), ObjType::Map)?,
        };
        for (key, value) in attrs {
            self.doc.put(&slot, key.as_str(), value.to_automerge())?;
        }
        self.touch()
    }

    /// Delete the relation (rel_type, target); drops the relationship-type
    /// bucket when it becomes empty. No-op if the relation is absent.
    pub fn remove_relationship(
        &mut self,
        rel_type: &str,
        target: EntityId,
    ) -> Result<(), RegisterError> {
        let rels = self.rels_root()?;
        let bucket = match self.doc.get(&rels, rel_type)? {
            Some((AmValue::Object(ObjType::Map), obj)) => obj,
            _ => return Ok(()),
        };
        let target_key = target.to_string();
        match self.doc.get(&bucket, target_key.as_str())? {
            Some(_) => {
                self.doc.delete(&bucket, target_key.as_str())?;
                if self.doc.keys(&bucket).next().is_none() {
                    self.doc.delete(&rels, rel_type)?;
                }
                self.touch()
            }
            None => Ok(()),
        }
    }

    /// Fold another register's history into this one.
    ///
    /// Commutative, associative and idempotent; both copies reach the
    /// identical observable state no matter which side initiates.
    /// Resolution is entirely automerge's; nothing is written back here.
    pub fn merge(&mut self, other: &mut EntityRegister) -> Result<(), RegisterError> {
        if other.id != self.id {
            return Err(RegisterError::IdMismatch {
                ours: self.id,
                theirs: other.id,
            });
        }
        self.doc.merge(&mut other.doc)?;
        Ok(())
    }

    fn touch(&mut self) -> Result<(), RegisterError> {
        self.doc.put(ROOT, "timestamp", now_seconds())?;
        Ok(())
    }

    fn read_attr_map(&self, obj: &ObjId) -> Result<AttrMap, RegisterError> {
        let mut out = AttrMap::new();
        for key in self.doc.keys(obj).collect::<Vec<_>>() {
            if let Some((AmValue::Scalar(value), _)) = self.doc.get(obj, key.as_str())? {
                if let Some(scalar) = Scalar::from_automerge(value.as_ref()) {
                    out.insert(key, scalar);
                }
            }
        }
        Ok(out)
    }

    /// Resolve the `data` map on every access rather than caching the
    /// object id: after merging with a foreign document the surviving
    /// object may not be the one this copy created.
    fn data_root(&self) -> Result<ObjId, RegisterError> {
        match self.doc.get(ROOT, "data")? {
            Some((AmValue::Object(ObjType::Map), obj)) => Ok(obj),
            _ => Err(RegisterError::MalformedLog("missing data map".into())),
        }
    }

    fn rels_root(&self) -> Result<ObjId, RegisterError> {
        match self.doc.get(ROOT, "relationships")? {
            Some((AmValue::Object(ObjType::Map), obj)) => Ok(obj),
            _ => Err(RegisterError::MalformedLog("missing relationships map".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wall_fields() -> AttrMap {
        AttrMap::from([
            ("name".to_string(), Scalar::text("W1")),
            ("height".to_string(), Scalar::number(3.0)),
            ("width".to_string(), Scalar::number(2.0)),
        ])
    }

    #[test]
    fn test_create_and_read_back() {
        let reg = EntityRegister::create("IfcWall", "replica_a", &wall_fields()).unwrap();

        assert_eq!(reg.entity_type(), "IfcWall");
        assert_eq!(reg.replica_id().unwrap(), "replica_a");
        assert!(reg.timestamp().unwrap() > 0.0);

        let data = reg.data().unwrap();
        assert_eq!(data.get("height"), Some(&Scalar::Number(3.0)));
        assert_eq!(data.get("name"), Some(&Scalar::Text("W1".to_string())));
        assert!(reg.relationships().unwrap().is_empty());
    }

    #[test]
    fn test_update_preserves_scalar_tags() {
        let mut reg = EntityRegister::create("IfcWall", "a", &AttrMap::new()).unwrap();
        reg.update(&AttrMap::from([
            ("insulated".to_string(), Scalar::boolean(true)),
            ("height".to_string(), Scalar::number(3.5)),
            ("material".to_string(), Scalar::text("Concrete")),
        ]))
        .unwrap();

        let data = reg.data().unwrap();
        assert_eq!(data.get("insulated"), Some(&Scalar::Boolean(true)));
        assert_eq!(data.get("height"), Some(&Scalar::Number(3.5)));
        assert_eq!(data.get("material"), Some(&Scalar::Text("Concrete".to_string())));
    }

    #[test]
    fn test_relationship_add_overwrite_remove() {
        let mut wall = EntityRegister::create("IfcWall", "a", &wall_fields()).unwrap();
        let window = Uuid::new_v4();

        wall.add_relationship(
            "HasOpenings",
            window,
            &AttrMap::from([("position".to_string(), Scalar::text("center"))]),
        )
        .unwrap();

        let rels = wall.relationships().unwrap();
        let attrs = &rels["HasOpenings"][&window];
        assert_eq!(attrs.get("position"), Some(&Scalar::Text("center".to_string())));

        // A repeated add overwrites that triple's attributes.
        wall.add_relationship(
            "HasOpenings",
            window,
            &AttrMap::from([("offset".to_string(), Scalar::number(0.4))]),
        )
        .unwrap();
        let rels = wall.relationships().unwrap();
        let attrs = &rels["HasOpenings"][&window];
        assert_eq!(attrs.get("position"), None);
        assert_eq!(attrs.get("offset"), Some(&Scalar::Number(0.4)));

        // Removing the last target drops the whole bucket.
        wall.remove_relationship("HasOpenings", window).unwrap();
        assert!(wall.relationships().unwrap().is_empty());

        // Removing again is a no-op.
        wall.remove_relationship("HasOpenings", window).unwrap();
    }

    #[test]
    fn test_serialize_round_trip() {
        let mut reg = EntityRegister::create("IfcWall", "a", &wall_fields()).unwrap();
        let window = Uuid::new_v4();
        reg.add_relationship(
            "HasOpenings",
            window,
            &AttrMap::from([("position".to_string(), Scalar::text("center"))]),
        )
        .unwrap();

        let bytes = reg.serialize();
        let restored = EntityRegister::deserialize(&bytes).unwrap();

        assert_eq!(restored.id(), reg.id());
        assert_eq!(restored.entity_type(), "IfcWall");
        assert_eq!(restored.state().unwrap(), reg.state().unwrap());
    }

    #[test]
    fn test_text_fields_survive_without_added_quoting() {
        let mut reg = EntityRegister::create(
            "IfcWall",
            "replica_a",
            &AttrMap::from([("name".to_string(), Scalar::text("W1"))]),
        )
        .unwrap();

        let restored = EntityRegister::deserialize(&reg.serialize()).unwrap();
        assert_eq!(restored.entity_type(), "IfcWall");
        assert_eq!(restored.replica_id().unwrap(), "replica_a");
        assert_eq!(
            restored.data().unwrap().get("name"),
            Some(&Scalar::Text("W1".to_string()))
        );
    }

    #[test]
    fn test_merge_resolves_conflicting_writes_identically() {
        // Same id, same key, different values written while offline: the
        // winner is arbitrary but must be the same on both sides,
        // whichever direction merges first.
        let id = Uuid::new_v4();
        let mut a = EntityRegister::create_with_id(
            id,
            "IfcWall",
            "a",
            &AttrMap::from([("material".to_string(), Scalar::text("Brick"))]),
        )
        .unwrap();
        let mut b = EntityRegister::create_with_id(
            id,
            "IfcWall",
            "b",
            &AttrMap::from([("material".to_string(), Scalar::text("Concrete"))]),
        )
        .unwrap();

        let mut b_for_a = EntityRegister::deserialize(&b.serialize()).unwrap();
        let mut a_for_b = EntityRegister::deserialize(&a.serialize()).unwrap();
        a.merge(&mut b_for_a).unwrap();
        b.merge(&mut a_for_b).unwrap();

        assert_eq!(a.state().unwrap(), b.state().unwrap());
        assert!(matches!(
            a.data().unwrap().get("material"),
            Some(Scalar::Text(_))
        ));
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(EntityRegister::deserialize(b"not a causal log").is_err());
    }

    #[test]
    fn test_merge_rejects_different_ids() {
        let mut a = EntityRegister::create("IfcWall", "a", &AttrMap::new()).unwrap();
        let mut b = EntityRegister::create("IfcWall", "b", &AttrMap::new()).unwrap();

        match a.merge(&mut b) {
            Err(RegisterError::IdMismatch { ours, theirs }) => {
                assert_eq!(ours, a.id());
                assert_eq!(theirs, b.id());
            }
            other => panic!("expected IdMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_concurrent_updates_converge_without_loss() {
        // Replica A creates a wall; replica B holds a prior copy.
        let mut a = EntityRegister::create("IfcWall", "a", &wall_fields()).unwrap();
        let mut b = a.fork();

        a.update(&AttrMap::from([("height".to_string(), Scalar::number(3.5))]))
            .unwrap();
        b.update(&AttrMap::from([(
            "material".to_string(),
            Scalar::text("Concrete"),
        )]))
        .unwrap();

        // Exchange state in both directions, with duplication.
        let mut b_for_a = EntityRegister::deserialize(&b.serialize()).unwrap();
        let mut a_for_b = EntityRegister::deserialize(&a.serialize()).unwrap();
        a.merge(&mut b_for_a).unwrap();
        b.merge(&mut a_for_b).unwrap();

        let expected = AttrMap::from([
            ("name".to_string(), Scalar::text("W1")),
            ("height".to_string(), Scalar::number(3.5)),
            ("width".to_string(), Scalar::number(2.0)),
            ("material".to_string(), Scalar::text("Concrete")),
        ]);
        assert_eq!(a.data().unwrap(), expected);
        assert_eq!(b.data().unwrap(), expected);
        assert_eq!(a.state().unwrap(), b.state().unwrap());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut a = EntityRegister::create("IfcWall", "a", &wall_fields()).unwrap();
        let mut b = a.fork();
        b.update(&AttrMap::from([(
            "material".to_string(),
            Scalar::text("Brick"),
        )]))
        .unwrap();

        let bytes = b.serialize();
        let mut first = EntityRegister::deserialize(&bytes).unwrap();
        a.merge(&mut first).unwrap();
        let after_first = a.state().unwrap();

        let mut second = EntityRegister::deserialize(&bytes).unwrap();
        a.merge(&mut second).unwrap();
        assert_eq!(a.state().unwrap(), after_first);
    }

    #[test]
    fn test_independent_creations_with_same_id_converge() {
        // Two replicas derive the same id from an external identifier and
        // create the entity independently, while offline.
        let id = Uuid::new_v4();
        let mut a = EntityRegister::create_with_id(
            id,
            "IfcWall",
            "a",
            &AttrMap::from([("height".to_string(), Scalar::number(3.0))]),
        )
        .unwrap();
        let mut b = EntityRegister::create_with_id(
            id,
            "IfcWall",
            "b",
            &AttrMap::from([("material".to_string(), Scalar::text("Concrete"))]),
        )
        .unwrap();

        let mut b_for_a = EntityRegister::deserialize(&b.serialize()).unwrap();
        let mut a_for_b = EntityRegister::deserialize(&a.serialize()).unwrap();
        a.merge(&mut b_for_a).unwrap();
        b.merge(&mut a_for_b).unwrap();

        // The deterministic bootstrap makes both field maps the same
        // object, so neither creation's fields are shadowed.
        assert_eq!(a.state().unwrap(), b.state().unwrap());
        let data = a.data().unwrap();
        assert_eq!(data.get("height"), Some(&Scalar::Number(3.0)));
        assert_eq!(data.get("material"), Some(&Scalar::Text("Concrete".to_string())));
    }

    #[test]
    fn test_relationship_union_on_merge() {
        let mut a = EntityRegister::create("IfcWall", "a", &wall_fields()).unwrap();
        let mut b = a.fork();

        let window = Uuid::new_v4();
        let other_wall = Uuid::new_v4();
        b.add_relationship("connects", other_wall, &AttrMap::new()).unwrap();
        a.add_relationship(
            "HasOpenings",
            window,
            &AttrMap::from([("position".to_string(), Scalar::text("center"))]),
        )
        .unwrap();

        // B merges A's state without A knowing about B's edge.
        let mut a_for_b = EntityRegister::deserialize(&a.serialize()).unwrap();
        b.merge(&mut a_for_b).unwrap();

        let rels = b.relationships().unwrap();
        assert_eq!(
            rels["HasOpenings"][&window].get("position"),
            Some(&Scalar::Text("center".to_string()))
        );
        assert!(rels["connects"].contains_key(&other_wall));
    }
}
