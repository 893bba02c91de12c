//! The entity rule table and its validator

use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::register::AttrMap;

/// A rejected local mutation. Never stored, never published.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("{entity_type} is missing required field: {field}")]
    MissingRequiredField { entity_type: String, field: String },

    #[error("invalid relationship type for {source_type}: {rel_type}")]
    UnknownRelationship {
        source_type: String,
        rel_type: String,
    },

    #[error("invalid target type for relationship {rel_type}: {target_type}")]
    InvalidRelationshipTarget {
        rel_type: String,
        target_type: String,
    },
}

/// Rules for one entity type: required/allowed scalar fields plus the
/// allowed relationship types with their allowed target-type sets.
///
/// Only required-field presence is enforced; the allowed-field set is
/// informational, kept because schema-aware clients use it to build
/// editing surfaces. That leniency mirrors the behavior replicas in the
/// field already rely on.
#[derive(Clone, Debug, Default)]
pub struct EntityRule {
    required_fields: HashSet<String>,
    allowed_fields: HashSet<String>,
    allowed_relationships: HashMap<String, HashSet<String>>,
}

impl EntityRule {
    /// A rule that starts with the fields every entity may carry.
    pub fn new() -> Self {
        Self::default().allow(["type", "globalId", "description"])
    }

    /// Mark fields as required (and therefore allowed).
    pub fn require<'a>(mut self, fields: impl IntoIterator<Item = &'a str>) -> Self {
        for field in fields {
            self.required_fields.insert(field.to_string());
            self.allowed_fields.insert(field.to_string());
        }
        self
    }

    /// Mark fields as allowed.
    pub fn allow<'a>(mut self, fields: impl IntoIterator<Item = &'a str>) -> Self {
        for field in fields {
            self.allowed_fields.insert(field.to_string());
        }
        self
    }

    /// Allow a relationship type toward the given target entity types.
    pub fn relationship<'a>(
        mut self,
        rel_type: &str,
        targets: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        self.allowed_relationships
            .entry(rel_type.to_string())
            .or_default()
            .extend(targets.into_iter().map(str::to_string));
        self
    }

    pub fn allowed_fields(&self) -> &HashSet<String> {
        &self.allowed_fields
    }

    fn validate_data(&self, entity_type: &str, data: &AttrMap) -> Result<(), SchemaViolation> {
        for field in &self.required_fields {
            if !data.contains_key(field) {
                return Err(SchemaViolation::MissingRequiredField {
                    entity_type: entity_type.to_string(),
                    field: field.clone(),
                });
            }
        }
        Ok(())
    }

    fn validate_relationship(
        &self,
        source_type: &str,
        rel_type: &str,
        target_type: &str,
    ) -> Result<(), SchemaViolation> {
        let targets = self.allowed_relationships.get(rel_type).ok_or_else(|| {
            SchemaViolation::UnknownRelationship {
                source_type: source_type.to_string(),
                rel_type: rel_type.to_string(),
            }
        })?;
        if !targets.contains(target_type) {
            return Err(SchemaViolation::InvalidRelationshipTarget {
                rel_type: rel_type.to_string(),
                target_type: target_type.to_string(),
            });
        }
        Ok(())
    }
}

/// Static rule table mapping an entity-type tag to its rule.
///
/// Pure and stateless; one instance is shared by a bus for the lifetime
/// of the process.
#[derive(Clone, Debug, Default)]
pub struct SchemaValidator {
    rules: HashMap<String, EntityRule>,
}

impl SchemaValidator {
    /// An empty validator; every entity type is unknown.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule for an entity type.
    pub fn with_rule(mut self, entity_type: &str, rule: EntityRule) -> Self {
        self.rules.insert(entity_type.to_string(), rule);
        self
    }

    /// All entity types this validator knows; drives topic subscription.
    pub fn entity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.rules.keys().cloned().collect();
        types.sort();
        types
    }

    /// Check an entity's data against its type's rule.
    pub fn validate_entity(&self, entity_type: &str, data: &AttrMap) -> Result<(), SchemaViolation> {
        let rule = self
            .rules
            .get(entity_type)
            .ok_or_else(|| SchemaViolation::UnknownEntityType(entity_type.to_string()))?;
        rule.validate_data(entity_type, data)
    }

    /// Check that source_type may carry rel_type toward target_type.
    pub fn validate_relationship(
        &self,
        source_type: &str,
        rel_type: &str,
        target_type: &str,
    ) -> Result<(), SchemaViolation> {
        let rule = self
            .rules
            .get(source_type)
            .ok_or_else(|| SchemaViolation::UnknownEntityType(source_type.to_string()))?;
        rule.validate_relationship(source_type, rel_type, target_type)
    }

    /// The rule table for the IFC building entities the bus replicates:
    /// building elements, spaces, materials, property sets, and the
    /// placement/geometry entities meshes reference.
    pub fn ifc() -> Self {
        Self::new()
            .with_rule(
                "IfcTriangulatedFaceSet",
                EntityRule::new()
                    .require(["coordinates", "coordIndex"])
                    .allow(["closed", "PnIndex"]),
            )
            .with_rule(
                "IfcCartesianPointList3D",
                EntityRule::new().require(["coordList"]),
            )
            .with_rule(
                "IfcShapeRepresentation",
                EntityRule::new().require([
                    "representationIdentifier",
                    "representationType",
                    "items",
                ]),
            )
            .with_rule(
                "IfcProductDefinitionShape",
                EntityRule::new().require(["representations"]),
            )
            .with_rule(
                "IfcLocalPlacement",
                EntityRule::new()
                    .require(["relativePlacement"])
                    .allow(["placementRelTo"]),
            )
            .with_rule(
                "IfcAxis2Placement3D",
                EntityRule::new()
                    .require(["location"])
                    .allow(["axis", "refDirection"]),
            )
            .with_rule("IfcCartesianPoint", EntityRule::new().require(["coordinates"]))
            .with_rule("IfcDirection", EntityRule::new().require(["directionRatios"]))
            .with_rule(
                "IfcPropertySet",
                EntityRule::new().require(["name", "hasProperties"]),
            )
            .with_rule(
                "IfcPropertySingleValue",
                EntityRule::new().require(["name", "nominalValue"]),
            )
            .with_rule("IfcText", EntityRule::new().require(["value"]))
            .with_rule(
                "IfcRelAssociates",
                EntityRule::new()
                    .require(["relatedObjects", "relatingPropertyDefinition"])
                    .allow(["name"]),
            )
            .with_rule(
                "IfcClassificationReference",
                EntityRule::new()
                    .require(["identification", "name"])
                    .allow(["location"]),
            )
            .with_rule(
                "IfcRelAssociatesClassification",
                EntityRule::new()
                    .require(["type", "relatedObjects"])
                    .allow(["name", "relatingClassification"]),
            )
            .with_rule(
                "IfcWall",
                EntityRule::new()
                    .allow([
                        "data",
                        "name",
                        "height",
                        "width",
                        "materialLayers",
                        "layerSetName",
                        "thermal_resistance",
                        "relatedObjects",
                        "material",
                        "objectPlacement",
                        "representation",
                    ])
                    .relationship("HasOpenings", ["IfcWindow", "IfcDoor"])
                    .relationship("connects", ["IfcWall"])
                    .relationship("bounds", ["IfcSpace"])
                    .relationship("associatedTo", ["IfcRelAssociatesMaterial"]),
            )
            .with_rule(
                "IfcWall_data",
                EntityRule::new().require(["type", "version", "schemaIdentifier", "data"]),
            )
            .with_rule(
                "IfcMaterialLayerSet",
                EntityRule::new().require(["associatedTo", "materialLayers", "layerSetName"]),
            )
            .with_rule(
                "IfcRelAssociatesMaterial",
                EntityRule::new()
                    .require(["type", "relatedObjects"])
                    .allow(["name", "relatingMaterial"]),
            )
            .with_rule("IfcWallType", EntityRule::new().require(["type", "ref"]))
            .with_rule(
                "IfcMaterialLayer",
                EntityRule::new()
                    .require(["type", "layerThickness", "isVentilated", "name"])
                    .allow(["material"]),
            )
            .with_rule("IfcMaterial", EntityRule::new().require(["type", "name"]))
            .with_rule(
                "IfcWindow",
                EntityRule::new()
                    .require(["name", "height", "width"])
                    .allow(["material"])
                    .relationship("fills", ["IfcWall"])
                    .relationship("hosts", ["IfcWindowStyle"]),
            )
            .with_rule(
                "IfcSpace",
                EntityRule::new()
                    .require(["Area"])
                    .allow(["Name", "Description", "Height", "Volume"])
                    .relationship("bounded_by", ["IfcWall"])
                    .relationship("contains", ["IfcWindow", "IfcDoor", "IfcFurnishingElement"]),
            )
            .with_rule(
                "IfcDoor",
                EntityRule::new()
                    .require(["Width", "Height"])
                    .allow(["Name", "Description", "Thickness", "Position"])
                    .relationship("fills", ["IfcWall"])
                    .relationship("hosts", ["IfcDoorStyle"]),
            )
    }
}
