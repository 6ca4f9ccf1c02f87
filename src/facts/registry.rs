//! Fact type registry: descriptors, groups and reserved-name enforcement.
//!
//! Registries are expected to be frozen before the game starts; interest
//! expansion performed at worker registration is not revisited when new types
//! appear later.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::facts::fields::FieldSpec;
use crate::utilities::errors::RegistrationError;

/// Field names that collide with the public record surface.
static RESERVED_FIELD_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "id",
        "factType",
        "factGroups",
        "creator",
        "created",
        "tainted",
        "save",
        "load",
        "parentObjects",
        "parentFacts",
        "parentHyps",
        "childObjects",
        "childFacts",
        "childHyps",
        "addParentObject",
        "addParentFact",
        "addParentHyp",
        "remParentObject",
        "remParentFact",
        "remParentHyp",
        "addChildObject",
        "addChildFact",
        "addChildHyp",
        "remChildObject",
        "remChildFact",
        "remChildHyp",
    ]
    .into_iter()
    .collect()
});

/// Whether `name` may not be used as a declared field name.
pub fn is_reserved_field_name(name: &str) -> bool {
    if RESERVED_FIELD_NAMES.contains(name) {
        return true;
    }
    // The underscore-framed space is kept for internal bookkeeping.
    name.len() > 2 && name.starts_with('_') && name.ends_with('_')
}

/// Declaration of a fact type: its unique name, the groups it belongs to and
/// its field schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactTypeDescriptor {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

impl FactTypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groups: Vec::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }
}

/// Registry of fact type descriptors and group memberships.
#[derive(Debug, Default)]
pub struct FactRegistry {
    types: HashMap<String, FactTypeDescriptor>,
    groups: HashMap<String, BTreeSet<String>>,
}

impl FactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor.
    ///
    /// Re-registering an identical declaration is a no-op; re-registering a
    /// different declaration under the same name fails. Each declared field is
    /// validated against the reserved-name set, and defaults and allowed
    /// values are checked against their own declared kind.
    pub fn register(&mut self, descriptor: FactTypeDescriptor) -> Result<(), RegistrationError> {
        if let Some(existing) = self.types.get(&descriptor.name) {
            if *existing == descriptor {
                log::debug!("fact type '{}' re-registered identically", descriptor.name);
                return Ok(());
            }
            return Err(RegistrationError::DuplicateFactType {
                name: descriptor.name.clone(),
            });
        }

        for (field, spec) in &descriptor.fields {
            if is_reserved_field_name(field) {
                return Err(RegistrationError::ReservedFieldName {
                    name: descriptor.name.clone(),
                    field: field.clone(),
                });
            }
            if let Some(default) = &spec.default {
                spec.check(field, default)
                    .map_err(|e| RegistrationError::InvalidFieldSchema {
                        name: descriptor.name.clone(),
                        field: field.clone(),
                        detail: format!("default value: {e}"),
                    })?;
            }
            if let Some(allowed) = &spec.allowed_values {
                for value in allowed {
                    if !spec.kind.accepts(value) {
                        return Err(RegistrationError::InvalidFieldSchema {
                            name: descriptor.name.clone(),
                            field: field.clone(),
                            detail: format!(
                                "allowed value of shape {} does not match kind {}",
                                value.shape(),
                                spec.kind
                            ),
                        });
                    }
                }
            }
        }

        log::debug!("registering fact type '{}'", descriptor.name);
        for group in &descriptor.groups {
            self.groups
                .entry(group.clone())
                .or_default()
                .insert(descriptor.name.clone());
        }
        self.types.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Whether `name` is a registered concrete type.
    pub fn is_type(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Whether `name` is a registered group.
    pub fn is_group(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// The descriptor for a concrete type.
    pub fn descriptor(&self, name: &str) -> Option<&FactTypeDescriptor> {
        self.types.get(name)
    }

    /// Expand a type-or-group name into the concrete types it covers.
    ///
    /// Identity for concrete types; the member set for groups. A group with
    /// no members fails with `EmptyGroup`, an unknown name with
    /// `UnknownInterest`.
    pub fn expand(&self, name: &str) -> Result<Vec<String>, RegistrationError> {
        if self.types.contains_key(name) {
            return Ok(vec![name.to_string()]);
        }
        match self.groups.get(name) {
            Some(members) if members.is_empty() => Err(RegistrationError::EmptyGroup {
                name: name.to_string(),
            }),
            Some(members) => Ok(members.iter().cloned().collect()),
            None => Err(RegistrationError::UnknownInterest {
                name: name.to_string(),
            }),
        }
    }

    /// Expand a list of type-or-group names, deduplicating the result.
    pub fn expand_all<I, S>(&self, names: I) -> Result<Vec<String>, RegistrationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut resolved = BTreeSet::new();
        for name in names {
            resolved.extend(self.expand(name.as_ref())?);
        }
        Ok(resolved.into_iter().collect())
    }

    /// Names of all registered concrete types, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::fields::FieldKind;

    fn hash_type(name: &str) -> FactTypeDescriptor {
        FactTypeDescriptor::new(name)
            .with_group("hash")
            .with_field("value", FieldSpec::new(FieldKind::String).required())
    }

    #[test]
    fn registers_and_expands_groups() {
        let mut registry = FactRegistry::new();
        registry.register(hash_type("md5")).unwrap();
        registry.register(hash_type("sha1")).unwrap();

        assert_eq!(registry.expand("md5").unwrap(), vec!["md5"]);
        assert_eq!(registry.expand("hash").unwrap(), vec!["md5", "sha1"]);
    }

    #[test]
    fn identical_re_registration_is_idempotent() {
        let mut registry = FactRegistry::new();
        registry.register(hash_type("md5")).unwrap();
        registry.register(hash_type("md5")).unwrap();
        assert_eq!(registry.type_names(), vec!["md5"]);
    }

    #[test]
    fn conflicting_re_registration_fails() {
        let mut registry = FactRegistry::new();
        registry.register(hash_type("md5")).unwrap();
        let conflicting = FactTypeDescriptor::new("md5")
            .with_field("digest", FieldSpec::new(FieldKind::String));
        let err = registry.register(conflicting).unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::DuplicateFactType { name } if name == "md5"
        ));
    }

    #[test]
    fn reserved_field_names_are_rejected() {
        let mut registry = FactRegistry::new();
        for field in ["id", "parentObjects", "tainted", "_secret_"] {
            let descriptor = FactTypeDescriptor::new("bad")
                .with_field(field, FieldSpec::new(FieldKind::String));
            let err = registry.register(descriptor).unwrap_err();
            assert!(
                matches!(err, RegistrationError::ReservedFieldName { .. }),
                "expected rejection for field '{field}'"
            );
        }
        // A bare underscore is not a framed name.
        assert!(!is_reserved_field_name("_"));
        assert!(!is_reserved_field_name("value"));
    }

    #[test]
    fn default_must_match_declared_kind() {
        let mut registry = FactRegistry::new();
        let descriptor = FactTypeDescriptor::new("sized").with_field(
            "size",
            FieldSpec::new(FieldKind::Int).with_default("big"),
        );
        let err = registry.register(descriptor).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidFieldSchema { .. }));
    }

    #[test]
    fn unknown_names_fail_expansion() {
        let registry = FactRegistry::new();
        assert!(matches!(
            registry.expand("nosuch").unwrap_err(),
            RegistrationError::UnknownInterest { .. }
        ));
    }

    #[test]
    fn expand_all_deduplicates_across_names() {
        let mut registry = FactRegistry::new();
        registry.register(hash_type("md5")).unwrap();
        registry.register(hash_type("sha1")).unwrap();
        let expanded = registry.expand_all(["hash", "md5"]).unwrap();
        assert_eq!(expanded, vec!["md5", "sha1"]);
    }
}
