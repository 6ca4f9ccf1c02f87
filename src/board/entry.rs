//! Entry identity and the parent/child relation lists shared by all three
//! tables.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which table an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Object,
    Fact,
    Hyp,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object => write!(f, "object"),
            Self::Fact => write!(f, "fact"),
            Self::Hyp => write!(f, "hyp"),
        }
    }
}

/// A `(kind, id)` pair naming one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryRef {
    pub kind: EntryKind,
    pub id: u64,
}

impl EntryRef {
    pub fn new(kind: EntryKind, id: u64) -> Self {
        Self { kind, id }
    }

    pub fn object(id: u64) -> Self {
        Self::new(EntryKind::Object, id)
    }

    pub fn fact(id: u64) -> Self {
        Self::new(EntryKind::Fact, id)
    }

    pub fn hyp(id: u64) -> Self {
        Self::new(EntryKind::Hyp, id)
    }
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Parent and child id lists of a single entry, one list per kind.
///
/// Edges are maintained symmetrically by the store: when an entry is added
/// with parent `p`, the matching child list on `p` gains the new id. Lists
/// stay sorted and deduplicated so snapshots are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relations {
    #[serde(default)]
    pub parent_objects: Vec<u64>,
    #[serde(default)]
    pub parent_facts: Vec<u64>,
    #[serde(default)]
    pub parent_hyps: Vec<u64>,
    #[serde(default)]
    pub child_objects: Vec<u64>,
    #[serde(default)]
    pub child_facts: Vec<u64>,
    #[serde(default)]
    pub child_hyps: Vec<u64>,
}

fn insert_sorted(list: &mut Vec<u64>, id: u64) {
    if let Err(pos) = list.binary_search(&id) {
        list.insert(pos, id);
    }
}

fn remove_sorted(list: &mut Vec<u64>, id: u64) {
    if let Ok(pos) = list.binary_search(&id) {
        list.remove(pos);
    }
}

impl Relations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.parent_objects.is_empty()
            && self.parent_facts.is_empty()
            && self.parent_hyps.is_empty()
            && self.child_objects.is_empty()
            && self.child_facts.is_empty()
            && self.child_hyps.is_empty()
    }

    pub fn has_parents(&self) -> bool {
        !(self.parent_objects.is_empty()
            && self.parent_facts.is_empty()
            && self.parent_hyps.is_empty())
    }

    pub fn parents(&self, kind: EntryKind) -> &[u64] {
        match kind {
            EntryKind::Object => &self.parent_objects,
            EntryKind::Fact => &self.parent_facts,
            EntryKind::Hyp => &self.parent_hyps,
        }
    }

    pub fn children(&self, kind: EntryKind) -> &[u64] {
        match kind {
            EntryKind::Object => &self.child_objects,
            EntryKind::Fact => &self.child_facts,
            EntryKind::Hyp => &self.child_hyps,
        }
    }

    /// All parents as entry refs.
    pub fn parent_refs(&self) -> Vec<EntryRef> {
        let mut refs = Vec::new();
        for &id in &self.parent_objects {
            refs.push(EntryRef::object(id));
        }
        for &id in &self.parent_facts {
            refs.push(EntryRef::fact(id));
        }
        for &id in &self.parent_hyps {
            refs.push(EntryRef::hyp(id));
        }
        refs
    }

    pub fn add_parent(&mut self, parent: EntryRef) {
        let list = match parent.kind {
            EntryKind::Object => &mut self.parent_objects,
            EntryKind::Fact => &mut self.parent_facts,
            EntryKind::Hyp => &mut self.parent_hyps,
        };
        insert_sorted(list, parent.id);
    }

    pub fn remove_parent(&mut self, parent: EntryRef) {
        let list = match parent.kind {
            EntryKind::Object => &mut self.parent_objects,
            EntryKind::Fact => &mut self.parent_facts,
            EntryKind::Hyp => &mut self.parent_hyps,
        };
        remove_sorted(list, parent.id);
    }

    pub fn add_child(&mut self, child: EntryRef) {
        let list = match child.kind {
            EntryKind::Object => &mut self.child_objects,
            EntryKind::Fact => &mut self.child_facts,
            EntryKind::Hyp => &mut self.child_hyps,
        };
        insert_sorted(list, child.id);
    }

    pub fn remove_child(&mut self, child: EntryRef) {
        let list = match child.kind {
            EntryKind::Object => &mut self.child_objects,
            EntryKind::Fact => &mut self.child_facts,
            EntryKind::Hyp => &mut self.child_hyps,
        };
        remove_sorted(list, child.id);
    }

    pub fn has_parent(&self, parent: EntryRef) -> bool {
        self.parents(parent.kind).binary_search(&parent.id).is_ok()
    }

    pub fn has_child(&self, child: EntryRef) -> bool {
        self.children(child.kind).binary_search(&child.id).is_ok()
    }
}
