//! The blackboard: thread-safe object, fact and hyp tables plus the
//! relationship graph between them.
//!
//! Every mutation commits under table write locks acquired in a fixed order
//! (objects, then facts, then hyps) and publishes a [`PostEvent`] to the
//! scheduler before the locks are released, so events leave the store in id
//! order. Reads take short read-lock sections and hand out detached views.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

use chrono::Utc;

use crate::board::entry::{EntryKind, EntryRef, Relations};
use crate::board::object::{digest_bytes, ObjectRecord, ObjectTable};
use crate::board::table::{RecordTable, StoredRecord};
use crate::events::{EventSender, PostEvent};
use crate::facts::{Fact, FactRegistry, FactTypeDescriptor};
use crate::utilities::errors::BoardError;

/// A detached view of one committed entry, as delivered to workers and
/// waiters.
#[derive(Debug, Clone)]
pub enum Posted {
    Object(ObjectRecord),
    Fact(Fact),
    Hyp(Fact),
}

impl Posted {
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::Object(_) => EntryKind::Object,
            Self::Fact(_) => EntryKind::Fact,
            Self::Hyp(_) => EntryKind::Hyp,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Self::Object(record) => record.id(),
            Self::Fact(fact) | Self::Hyp(fact) => fact.id().unwrap_or(0),
        }
    }

    pub fn entry(&self) -> EntryRef {
        EntryRef::new(self.kind(), self.id())
    }

    /// Concrete fact type; `None` for objects.
    pub fn type_name(&self) -> Option<&str> {
        match self {
            Self::Object(_) => None,
            Self::Fact(fact) | Self::Hyp(fact) => Some(fact.fact_type()),
        }
    }

    pub fn as_fact(&self) -> Option<&Fact> {
        match self {
            Self::Fact(fact) | Self::Hyp(fact) => Some(fact),
            Self::Object(_) => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRecord> {
        match self {
            Self::Object(record) => Some(record),
            _ => None,
        }
    }
}

/// Predicate over committed entries, shared by backlog scans and live
/// notification matching.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScanFilter {
    pub kind: EntryKind,
    /// Concrete type names to match; `None` matches any (objects carry no
    /// type).
    pub types: Option<BTreeSet<String>>,
    /// Restrict to children of this entry.
    pub parent: Option<EntryRef>,
    /// Only entries with id strictly greater than this.
    pub since_id: Option<u64>,
}

impl ScanFilter {
    pub fn for_types(kind: EntryKind, types: impl IntoIterator<Item = String>) -> Self {
        Self {
            kind,
            types: Some(types.into_iter().collect()),
            parent: None,
            since_id: None,
        }
    }

    pub fn for_children(kind: EntryKind, parent: EntryRef) -> Self {
        Self {
            kind,
            types: None,
            parent: Some(parent),
            since_id: None,
        }
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = String>) -> Self {
        self.types = Some(types.into_iter().collect());
        self
    }

    pub fn since(mut self, since_id: Option<u64>) -> Self {
        self.since_id = since_id;
        self
    }

    fn matches_type(&self, type_name: Option<&str>) -> bool {
        match (&self.types, type_name) {
            (None, _) => true,
            (Some(types), Some(name)) => types.contains(name),
            (Some(_), None) => false,
        }
    }

    fn matches_id(&self, id: u64) -> bool {
        self.since_id.map_or(true, |since| id > since)
    }

    fn matches_parents(&self, relations: &Relations) -> bool {
        self.parent.map_or(true, |parent| relations.has_parent(parent))
    }

    /// Whether a live event satisfies this filter.
    pub fn matches_event(&self, event: &PostEvent) -> bool {
        event.kind == self.kind
            && self.matches_type(event.type_name.as_deref())
            && self.matches_id(event.id)
            && self.matches_parents(&event.parents)
    }
}

/// Everything the snapshot codec needs from the store.
#[derive(Debug)]
pub(crate) struct BoardDump {
    pub objects: Vec<ObjectRecord>,
    pub facts: Vec<StoredRecord>,
    pub hyps: Vec<StoredRecord>,
    pub fact_next_id: u64,
    pub hyp_next_id: u64,
}

/// The shared blackboard.
#[derive(Debug)]
pub struct Blackboard {
    registry: Arc<FactRegistry>,
    objects: RwLock<ObjectTable>,
    facts: RwLock<RecordTable>,
    hyps: RwLock<RecordTable>,
    event_tx: EventSender,
    event_seq: AtomicU64,
}

/// Write guards over all three tables, in canonical lock order.
struct Tables<'a> {
    objects: RwLockWriteGuard<'a, ObjectTable>,
    facts: RwLockWriteGuard<'a, RecordTable>,
    hyps: RwLockWriteGuard<'a, RecordTable>,
}

impl Blackboard {
    pub fn new(registry: Arc<FactRegistry>, event_tx: EventSender) -> Self {
        Self {
            registry,
            objects: RwLock::new(ObjectTable::new()),
            facts: RwLock::new(RecordTable::new(false)),
            hyps: RwLock::new(RecordTable::new(true)),
            event_tx,
            event_seq: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<FactRegistry> {
        &self.registry
    }

    fn lock_all(&self) -> Tables<'_> {
        Tables {
            objects: self.objects.write().unwrap(),
            facts: self.facts.write().unwrap(),
            hyps: self.hyps.write().unwrap(),
        }
    }

    fn read_all(
        &self,
    ) -> (
        RwLockReadGuard<'_, ObjectTable>,
        RwLockReadGuard<'_, RecordTable>,
        RwLockReadGuard<'_, RecordTable>,
    ) {
        (
            self.objects.read().unwrap(),
            self.facts.read().unwrap(),
            self.hyps.read().unwrap(),
        )
    }

    fn emit(&self, mut event: PostEvent) {
        event.seq = self.event_seq.fetch_add(1, Ordering::SeqCst);
        // The receiver only disappears once the game is torn down.
        if self.event_tx.send(event).is_err() {
            log::debug!("post event dropped: scheduler gone");
        }
    }

    fn check_parents(tables: &Tables<'_>, relations: &Relations) -> Result<(), BoardError> {
        for parent in relations.parent_refs() {
            let exists = match parent.kind {
                EntryKind::Object => tables.objects.get(parent.id).is_some(),
                EntryKind::Fact => tables.facts.get(parent.id).is_some(),
                EntryKind::Hyp => tables.hyps.get(parent.id).is_some(),
            };
            if !exists {
                return Err(BoardError::NotFound {
                    kind: parent.kind,
                    id: parent.id,
                });
            }
        }
        Ok(())
    }

    fn add_child_edges(tables: &mut Tables<'_>, parents: &Relations, child: EntryRef) {
        for parent in parents.parent_refs() {
            match parent.kind {
                EntryKind::Object => {
                    if let Some(record) = tables.objects.get_mut(parent.id) {
                        record.relations.add_child(child);
                    }
                }
                EntryKind::Fact => {
                    if let Some(record) = tables.facts.get_mut(parent.id) {
                        record.relations.add_child(child);
                    }
                }
                EntryKind::Hyp => {
                    if let Some(record) = tables.hyps.get_mut(parent.id) {
                        record.relations.add_child(child);
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Add an object, or merge into an existing one with identical bytes.
    ///
    /// Returns the object id and whether the bytes were new. The event is
    /// emitted either way; a dedup hit carries `deduped = true`.
    pub fn add_object(
        &self,
        data: Vec<u8>,
        creator: &str,
        parents: Relations,
        metadata: BTreeMap<String, String>,
    ) -> Result<(u64, bool), BoardError> {
        let mut tables = self.lock_all();
        Self::check_parents(&tables, &parents)?;

        let digest = digest_bytes(&data);
        let (id, was_new, event_parents) = match tables.objects.find_by_digest(&digest) {
            Some(existing) => {
                // Merge the requested parents into the existing record.
                let record = tables
                    .objects
                    .get_mut(existing)
                    .expect("digest index points at a live record");
                for parent in parents.parent_refs() {
                    record.relations.add_parent(parent);
                }
                for (key, value) in metadata {
                    record.add_metadata(&key, value);
                }
                let merged = record.relations().clone();
                Self::add_child_edges(&mut tables, &parents, EntryRef::object(existing));
                log::debug!("object {existing} deduplicated for creator '{creator}'");
                (existing, false, merged)
            }
            None => {
                let id = tables.objects.next_id();
                let mut record =
                    ObjectRecord::new(id, data, creator.to_string(), Utc::now(), metadata);
                record.relations = parents.clone();
                tables.objects.insert(record);
                Self::add_child_edges(&mut tables, &parents, EntryRef::object(id));
                log::debug!("object {id} added by '{creator}'");
                (id, true, parents)
            }
        };

        self.emit(PostEvent {
            seq: 0,
            kind: EntryKind::Object,
            type_name: None,
            id,
            groups: Vec::new(),
            parents: event_parents,
            deduped: !was_new,
        });
        Ok((id, was_new))
    }

    /// Commit a fact. Seals the passed record and returns its id.
    pub fn add_fact(&self, fact: &mut Fact, creator: &str) -> Result<u64, BoardError> {
        if fact.tainted() {
            return Err(BoardError::TaintMismatch);
        }
        self.commit_record(fact, creator, EntryKind::Fact)
    }

    /// Commit a hyp. Taints and seals the passed record and returns its id.
    pub fn add_hyp(&self, hyp: &mut Fact, creator: &str) -> Result<u64, BoardError> {
        hyp.taint();
        self.commit_record(hyp, creator, EntryKind::Hyp)
    }

    fn commit_record(
        &self,
        fact: &mut Fact,
        creator: &str,
        kind: EntryKind,
    ) -> Result<u64, BoardError> {
        if !self.registry.is_type(fact.fact_type()) {
            return Err(BoardError::UnknownFactType {
                name: fact.fact_type().to_string(),
            });
        }

        let mut tables = self.lock_all();
        Self::check_parents(&tables, fact.relations())?;

        let table = match kind {
            EntryKind::Fact => &mut tables.facts,
            EntryKind::Hyp => &mut tables.hyps,
            EntryKind::Object => unreachable!("objects are not records"),
        };

        let created = Utc::now();
        let id = table.next_id();
        fact.seal(id, creator, created)?;

        let record = StoredRecord {
            id,
            type_name: fact.fact_type().to_string(),
            groups: fact.fact_groups().to_vec(),
            fields: fact.fields().clone(),
            creator: creator.to_string(),
            created,
            tainted: kind == EntryKind::Hyp,
            relations: fact.relations().clone(),
        };
        let parents = record.relations.clone();
        let groups = record.groups.clone();
        let type_name = record.type_name.clone();
        table.insert(record);

        Self::add_child_edges(&mut tables, &parents, EntryRef::new(kind, id));
        log::debug!("{kind} {id} ('{type_name}') added by '{creator}'");

        self.emit(PostEvent {
            seq: 0,
            kind,
            type_name: Some(type_name),
            id,
            groups,
            parents,
            deduped: false,
        });
        Ok(id)
    }

    /// Move a hyp to the fact table under a fresh fact id.
    ///
    /// Fields and relations are carried verbatim; every edge that referenced
    /// the hyp is rewired to the new fact, and the fact event is emitted so
    /// interest-holders and waiters observe the promotion.
    pub fn promote_hyp(&self, hyp_id: u64) -> Result<u64, BoardError> {
        let mut tables = self.lock_all();

        let mut record = tables.hyps.remove(hyp_id).ok_or(BoardError::NotFound {
            kind: EntryKind::Hyp,
            id: hyp_id,
        })?;

        record.tainted = false;
        let relations = record.relations.clone();
        let groups = record.groups.clone();
        let type_name = record.type_name.clone();
        let fact_id = tables.facts.insert(record);

        let old = EntryRef::hyp(hyp_id);
        let new = EntryRef::fact(fact_id);
        let rewire = |relations: &mut Relations, is_parent_edge: bool| {
            if is_parent_edge {
                relations.remove_child(old);
                relations.add_child(new);
            } else {
                relations.remove_parent(old);
                relations.add_parent(new);
            }
        };
        for parent in relations.parent_refs() {
            match parent.kind {
                EntryKind::Object => {
                    if let Some(entry) = tables.objects.get_mut(parent.id) {
                        rewire(&mut entry.relations, true);
                    }
                }
                EntryKind::Fact => {
                    if let Some(entry) = tables.facts.get_mut(parent.id) {
                        rewire(&mut entry.relations, true);
                    }
                }
                EntryKind::Hyp => {
                    if let Some(entry) = tables.hyps.get_mut(parent.id) {
                        rewire(&mut entry.relations, true);
                    }
                }
            }
        }
        for kind in [EntryKind::Object, EntryKind::Fact, EntryKind::Hyp] {
            for &child in relations.children(kind).to_vec().iter() {
                match kind {
                    EntryKind::Object => {
                        if let Some(entry) = tables.objects.get_mut(child) {
                            rewire(&mut entry.relations, false);
                        }
                    }
                    EntryKind::Fact => {
                        if let Some(entry) = tables.facts.get_mut(child) {
                            rewire(&mut entry.relations, false);
                        }
                    }
                    EntryKind::Hyp => {
                        if let Some(entry) = tables.hyps.get_mut(child) {
                            rewire(&mut entry.relations, false);
                        }
                    }
                }
            }
        }

        log::info!("hyp {hyp_id} promoted to fact {fact_id} ('{type_name}')");
        let parents = relations.clone();
        self.emit(PostEvent {
            seq: 0,
            kind: EntryKind::Fact,
            type_name: Some(type_name),
            id: fact_id,
            groups,
            parents,
            deduped: false,
        });
        Ok(fact_id)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    fn fact_view(&self, record: &StoredRecord) -> Fact {
        let descriptor = self
            .registry
            .descriptor(&record.type_name)
            .cloned()
            .unwrap_or_else(|| FactTypeDescriptor::new(record.type_name.clone()));
        Fact::from_parts(
            descriptor,
            record.fields.clone(),
            record.relations.clone(),
            record.id,
            record.creator.clone(),
            record.created,
            record.tainted,
        )
    }

    pub fn get_object(&self, id: u64) -> Result<ObjectRecord, BoardError> {
        self.objects
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(BoardError::NotFound {
                kind: EntryKind::Object,
                id,
            })
    }

    pub fn get_fact(&self, id: u64) -> Result<Fact, BoardError> {
        let facts = self.facts.read().unwrap();
        facts
            .get(id)
            .map(|record| self.fact_view(record))
            .ok_or(BoardError::NotFound {
                kind: EntryKind::Fact,
                id,
            })
    }

    pub fn get_hyp(&self, id: u64) -> Result<Fact, BoardError> {
        let hyps = self.hyps.read().unwrap();
        hyps.get(id)
            .map(|record| self.fact_view(record))
            .ok_or(BoardError::NotFound {
                kind: EntryKind::Hyp,
                id,
            })
    }

    /// Resolve an entry reference into a detached view.
    pub fn resolve(&self, entry: EntryRef) -> Result<Posted, BoardError> {
        match entry.kind {
            EntryKind::Object => self.get_object(entry.id).map(Posted::Object),
            EntryKind::Fact => self.get_fact(entry.id).map(Posted::Fact),
            EntryKind::Hyp => self.get_hyp(entry.id).map(Posted::Hyp),
        }
    }

    pub fn all_objects(&self) -> Vec<ObjectRecord> {
        self.objects.read().unwrap().records.to_vec()
    }

    /// All facts of the given concrete types, in id order.
    pub fn all_facts(&self, types: &[String]) -> Vec<Fact> {
        let facts = self.facts.read().unwrap();
        let mut ids: Vec<u64> = types
            .iter()
            .flat_map(|t| facts.column(t).to_vec())
            .collect();
        ids.sort_unstable();
        ids.iter()
            .filter_map(|id| facts.get(*id))
            .map(|record| self.fact_view(record))
            .collect()
    }

    /// All hyps of the given concrete types, in id order.
    pub fn all_hyps(&self, types: &[String]) -> Vec<Fact> {
        let hyps = self.hyps.read().unwrap();
        let mut ids: Vec<u64> = types.iter().flat_map(|t| hyps.column(t).to_vec()).collect();
        ids.sort_unstable();
        ids.iter()
            .filter_map(|id| hyps.get(*id))
            .map(|record| self.fact_view(record))
            .collect()
    }

    /// List entries of a kind, optionally restricted to one concrete type.
    pub fn list(&self, kind: EntryKind, type_name: Option<&str>) -> Vec<Posted> {
        match kind {
            EntryKind::Object => self.all_objects().into_iter().map(Posted::Object).collect(),
            EntryKind::Fact | EntryKind::Hyp => {
                let guard = if kind == EntryKind::Fact {
                    self.facts.read().unwrap()
                } else {
                    self.hyps.read().unwrap()
                };
                let wrap = |fact: Fact| match kind {
                    EntryKind::Fact => Posted::Fact(fact),
                    _ => Posted::Hyp(fact),
                };
                match type_name {
                    Some(name) => guard
                        .column(name)
                        .iter()
                        .filter_map(|id| guard.get(*id))
                        .map(|record| wrap(self.fact_view(record)))
                        .collect(),
                    None => guard
                        .iter()
                        .map(|record| wrap(self.fact_view(record)))
                        .collect(),
                }
            }
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn fact_count(&self) -> usize {
        self.facts.read().unwrap().len()
    }

    pub fn hyp_count(&self) -> usize {
        self.hyps.read().unwrap().len()
    }

    // -----------------------------------------------------------------------
    // Waiter support
    // -----------------------------------------------------------------------

    /// Scan the backlog matching `filter` and register a waiter atomically.
    ///
    /// The callback runs while the table read locks are held, receiving the
    /// matching backlog in id order together with the table's next id (the
    /// waiter's watermark); no commit can interleave between the scan and the
    /// registration. Fails fast with `NotFound` if the filter names a parent
    /// that does not exist.
    pub fn scan_and_register<F>(&self, filter: &ScanFilter, register: F) -> Result<(), BoardError>
    where
        F: FnOnce(Vec<Posted>, u64),
    {
        let (objects, facts, hyps) = self.read_all();

        if let Some(parent) = filter.parent {
            let exists = match parent.kind {
                EntryKind::Object => objects.get(parent.id).is_some(),
                EntryKind::Fact => facts.get(parent.id).is_some(),
                EntryKind::Hyp => hyps.get(parent.id).is_some(),
            };
            if !exists {
                return Err(BoardError::NotFound {
                    kind: parent.kind,
                    id: parent.id,
                });
            }
        }

        let (backlog, next_id) = match filter.kind {
            EntryKind::Object => {
                let matching = objects
                    .records
                    .iter()
                    .filter(|record| {
                        filter.matches_id(record.id())
                            && filter.matches_parents(record.relations())
                    })
                    .cloned()
                    .map(Posted::Object)
                    .collect();
                (matching, objects.next_id())
            }
            EntryKind::Fact | EntryKind::Hyp => {
                let table = if filter.kind == EntryKind::Fact {
                    &facts
                } else {
                    &hyps
                };
                let wrap = |fact: Fact| match filter.kind {
                    EntryKind::Fact => Posted::Fact(fact),
                    _ => Posted::Hyp(fact),
                };
                let matching = table
                    .iter()
                    .filter(|record| {
                        filter.matches_type(Some(&record.type_name))
                            && filter.matches_id(record.id)
                            && filter.matches_parents(&record.relations)
                    })
                    .map(|record| wrap(self.fact_view(record)))
                    .collect();
                (matching, table.next_id())
            }
        };

        register(backlog, next_id);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Snapshot support
    // -----------------------------------------------------------------------

    pub(crate) fn dump(&self) -> BoardDump {
        let (objects, facts, hyps) = self.read_all();
        BoardDump {
            objects: objects.records.to_vec(),
            facts: facts.iter().cloned().collect(),
            hyps: hyps.iter().cloned().collect(),
            fact_next_id: facts.next_id(),
            hyp_next_id: hyps.next_id(),
        }
    }

    pub(crate) fn restore(
        registry: Arc<FactRegistry>,
        event_tx: EventSender,
        dump: BoardDump,
    ) -> Result<Self, crate::utilities::errors::SnapshotError> {
        use crate::utilities::errors::SnapshotError;

        let board = Self::new(registry.clone(), event_tx);
        {
            let mut tables = board.lock_all();
            for record in dump.objects {
                if record.id() != tables.objects.next_id() {
                    return Err(SnapshotError::Corrupt {
                        detail: format!("object ids are not dense at {}", record.id()),
                    });
                }
                tables.objects.insert(record);
            }
            for record in dump.facts {
                if !registry.is_type(&record.type_name) {
                    return Err(SnapshotError::UnknownFactType {
                        name: record.type_name,
                    });
                }
                tables.facts.insert_saved(record);
            }
            for record in dump.hyps {
                if !registry.is_type(&record.type_name) {
                    return Err(SnapshotError::UnknownFactType {
                        name: record.type_name,
                    });
                }
                tables.hyps.insert_saved(record);
            }
            tables.facts.set_next_id(dump.fact_next_id);
            tables.hyps.set_next_id(dump.hyp_next_id);
        }
        Ok(board)
    }
}
