//! Fact records and the fact-type registry.
//!
//! A [`Fact`] is built by a worker against a registered
//! [`FactTypeDescriptor`], populated with typed fields and parent links, then
//! handed to the console. Adding it to the blackboard seals it; any mutation
//! after that point is a programmer error surfaced as
//! [`BoardError::Immutable`]. The same record shape doubles as a hypothesis
//! when its `tainted` flag is set.

pub mod fields;
pub mod registry;

use chrono::{DateTime, Utc};

use crate::board::entry::{EntryKind, EntryRef, Relations};
use crate::utilities::errors::BoardError;

pub use fields::{FieldKind, FieldSpec, FieldValue};
pub use registry::{is_reserved_field_name, FactRegistry, FactTypeDescriptor};

use std::collections::BTreeMap;

/// A typed record destined for (or read from) the fact or hyp table.
#[derive(Debug, Clone)]
pub struct Fact {
    descriptor: FactTypeDescriptor,
    fields: BTreeMap<String, FieldValue>,
    relations: Relations,
    id: Option<u64>,
    creator: Option<String>,
    created: Option<DateTime<Utc>>,
    tainted: bool,
    sealed: bool,
}

impl Fact {
    /// Build a fresh record of a registered type, with defaults applied.
    pub fn new(registry: &FactRegistry, type_name: &str) -> Result<Self, BoardError> {
        let descriptor = registry
            .descriptor(type_name)
            .ok_or_else(|| BoardError::UnknownFactType {
                name: type_name.to_string(),
            })?
            .clone();

        let mut fields = BTreeMap::new();
        for (name, spec) in &descriptor.fields {
            if let Some(default) = &spec.default {
                fields.insert(name.clone(), default.clone());
            }
        }

        Ok(Self {
            descriptor,
            fields,
            relations: Relations::new(),
            id: None,
            creator: None,
            created: None,
            tainted: false,
            sealed: false,
        })
    }

    fn ensure_mutable(&self, what: &str) -> Result<(), BoardError> {
        if self.sealed {
            return Err(BoardError::Immutable {
                detail: format!("{what} after the record was added"),
            });
        }
        Ok(())
    }

    /// Assign a field value, checked against the declared schema.
    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) -> Result<(), BoardError> {
        self.ensure_mutable("set field")?;
        let spec = self
            .descriptor
            .fields
            .get(field)
            .ok_or_else(|| BoardError::UnknownField {
                type_name: self.descriptor.name.clone(),
                field: field.to_string(),
            })?;
        let value = value.into();
        spec.check(field, &value)?;
        self.fields.insert(field.to_string(), value);
        Ok(())
    }

    /// Read a field value, if set.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// All populated fields.
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn add_parent_object(&mut self, id: u64) -> Result<(), BoardError> {
        self.ensure_mutable("add parent")?;
        self.relations.add_parent(EntryRef::object(id));
        Ok(())
    }

    pub fn add_parent_fact(&mut self, id: u64) -> Result<(), BoardError> {
        self.ensure_mutable("add parent")?;
        self.relations.add_parent(EntryRef::fact(id));
        Ok(())
    }

    pub fn add_parent_hyp(&mut self, id: u64) -> Result<(), BoardError> {
        self.ensure_mutable("add parent")?;
        self.relations.add_parent(EntryRef::hyp(id));
        Ok(())
    }

    pub fn fact_type(&self) -> &str {
        &self.descriptor.name
    }

    pub fn fact_groups(&self) -> &[String] {
        &self.descriptor.groups
    }

    pub fn descriptor(&self) -> &FactTypeDescriptor {
        &self.descriptor
    }

    /// Table id; `None` until the record has been added.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn creator(&self) -> Option<&str> {
        self.creator.as_deref()
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.created
    }

    pub fn tainted(&self) -> bool {
        self.tainted
    }

    pub fn relations(&self) -> &Relations {
        &self.relations
    }

    pub fn parent_objects(&self) -> &[u64] {
        &self.relations.parent_objects
    }

    pub fn parent_facts(&self) -> &[u64] {
        &self.relations.parent_facts
    }

    pub fn parent_hyps(&self) -> &[u64] {
        &self.relations.parent_hyps
    }

    pub fn child_objects(&self) -> &[u64] {
        &self.relations.child_objects
    }

    pub fn child_facts(&self) -> &[u64] {
        &self.relations.child_facts
    }

    pub fn child_hyps(&self) -> &[u64] {
        &self.relations.child_hyps
    }

    /// Which table this record belongs to, per its taint state.
    pub fn entry_kind(&self) -> EntryKind {
        if self.tainted {
            EntryKind::Hyp
        } else {
            EntryKind::Fact
        }
    }

    pub(crate) fn taint(&mut self) {
        self.tainted = true;
    }

    pub(crate) fn untaint(&mut self) {
        self.tainted = false;
    }

    pub(crate) fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Check required fields and mark the record immutable; called by the
    /// store under its table lock.
    pub(crate) fn seal(
        &mut self,
        id: u64,
        creator: &str,
        created: DateTime<Utc>,
    ) -> Result<(), BoardError> {
        self.ensure_mutable("re-add")?;
        for (name, spec) in &self.descriptor.fields {
            if spec.required && !self.fields.contains_key(name) {
                return Err(BoardError::MissingField {
                    type_name: self.descriptor.name.clone(),
                    field: name.clone(),
                });
            }
        }
        self.id = Some(id);
        self.creator = Some(creator.to_string());
        self.created = Some(created);
        self.sealed = true;
        Ok(())
    }

    /// Reassemble a sealed view from stored parts; used by store reads.
    pub(crate) fn from_parts(
        descriptor: FactTypeDescriptor,
        fields: BTreeMap<String, FieldValue>,
        relations: Relations,
        id: u64,
        creator: String,
        created: DateTime<Utc>,
        tainted: bool,
    ) -> Self {
        Self {
            descriptor,
            fields,
            relations,
            id: Some(id),
            creator: Some(creator),
            created: Some(created),
            tainted,
            sealed: true,
        }
    }

}

/// Install the stock fact types shipped with the engine: the `hash` group
/// (`md5`, `sha1`, `sha256`, `ssdeep`) and `mimetype`.
pub fn register_builtin_types(registry: &mut FactRegistry) -> Result<(), crate::utilities::errors::RegistrationError> {
    for name in ["md5", "sha1", "sha256", "ssdeep"] {
        registry.register(
            FactTypeDescriptor::new(name)
                .with_group("hash")
                .with_field(
                    "value",
                    FieldSpec::new(FieldKind::String)
                        .required()
                        .with_help("hex digest of the object bytes"),
                ),
        )?;
    }
    registry.register(
        FactTypeDescriptor::new("mimetype")
            .with_field("mimetype", FieldSpec::new(FieldKind::String).required())
            .with_field("filetype", FieldSpec::new(FieldKind::String)),
    )?;
    Ok(())
}
