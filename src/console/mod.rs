//! Per-clone console facades.
//!
//! A console is the only interface a worker has to the engine: blackboard
//! reads and writes, the wait primitives, memory slots, temp directories and
//! print routing. NPCs and BackStories get write-oriented consoles; Players
//! additionally read and wait.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;

use crate::board::{Blackboard, EntryKind, EntryRef, ObjectRecord, Posted, Relations, ScanFilter};
use crate::facts::Fact;
use crate::temporary::CloneDirectoryHandler;
use crate::utilities::errors::{BoardError, WaitError};
use crate::utilities::logger::Logger;
use crate::waits::{EntryStream, ParkCallback, PendingWait, WaitOwner, WaitRegistry};

/// Template-shared memory: one map per worker template, guarded by a
/// per-template lock.
pub type SharedMemory = Arc<Mutex<BTreeMap<String, Value>>>;

/// Clone-private data slots.
pub type CloneData = Arc<Mutex<BTreeMap<String, Value>>>;

/// Everything a console needs to talk to the engine.
pub(crate) struct ConsoleCore {
    pub(crate) board: Arc<Blackboard>,
    pub(crate) waits: Arc<WaitRegistry>,
    pub(crate) owner: WaitOwner,
    pub(crate) identity: String,
    pub(crate) logger: Arc<Logger>,
    pub(crate) dirs: Arc<CloneDirectoryHandler>,
    pub(crate) park: Option<Arc<dyn ParkCallback>>,
}

impl ConsoleCore {
    fn creator(&self) -> &str {
        &self.owner.template
    }

    fn print(&self, message: &str) {
        self.logger.entity_print(&self.identity, message);
    }

    fn add_object(
        &self,
        data: Vec<u8>,
        parents: Relations,
        metadata: BTreeMap<String, String>,
    ) -> Result<u64, BoardError> {
        let (id, _was_new) = self
            .board
            .add_object(data, self.creator(), parents, metadata)?;
        Ok(id)
    }

    fn add_fact(&self, fact: &mut Fact, require_parentage: bool) -> Result<u64, BoardError> {
        if require_parentage && !fact.relations().has_parents() {
            return Err(BoardError::MissingParentage);
        }
        self.board.add_fact(fact, self.creator())
    }

    fn add_hyp(&self, hyp: &mut Fact, require_parentage: bool) -> Result<u64, BoardError> {
        if require_parentage && !hyp.relations().has_parents() {
            return Err(BoardError::MissingParentage);
        }
        self.board.add_hyp(hyp, self.creator())
    }

    fn subscribe(&self, filter: ScanFilter) -> Result<EntryStream, BoardError> {
        let stream = self
            .waits
            .subscribe(&self.board, self.owner.clone(), filter)?;
        Ok(match &self.park {
            Some(park) => stream.with_park(park.clone()),
            None => stream,
        })
    }

    fn subscribe_once(&self, filter: ScanFilter) -> Result<PendingWait, BoardError> {
        let pending = self
            .waits
            .subscribe_once(&self.board, self.owner.clone(), filter)?;
        Ok(match &self.park {
            Some(park) => pending.with_park(park.clone()),
            None => pending,
        })
    }

    fn expand_types<S: AsRef<str>>(
        &self,
        names: &[S],
    ) -> Result<Vec<String>, crate::utilities::errors::RegistrationError> {
        self.board.registry().expand_all(names)
    }
}

/// Lazy sequence of facts (or hyps) delivered to a waiting clone.
#[derive(Debug)]
pub struct FactStream {
    inner: EntryStream,
}

impl FactStream {
    /// Next matching record; `Cancelled` once the game quiesces.
    pub async fn next(&mut self) -> Result<Fact, WaitError> {
        loop {
            match self.inner.next().await? {
                Posted::Fact(fact) | Posted::Hyp(fact) => return Ok(fact),
                Posted::Object(_) => continue,
            }
        }
    }
}

/// Lazy sequence of objects delivered to a waiting clone.
pub struct ObjectStream {
    inner: EntryStream,
}

impl ObjectStream {
    pub async fn next(&mut self) -> Result<ObjectRecord, WaitError> {
        loop {
            match self.inner.next().await? {
                Posted::Object(record) => return Ok(record),
                _ => continue,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// NPC console
// ---------------------------------------------------------------------------

/// Console handed to an NPC alongside each object.
pub struct NpcConsole {
    core: ConsoleCore,
    memory: SharedMemory,
}

impl NpcConsole {
    pub(crate) fn new(core: ConsoleCore, memory: SharedMemory) -> Self {
        Self { core, memory }
    }

    /// Worker-level memory, shared across every invocation of this NPC.
    pub fn memory(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.memory.lock().unwrap()
    }

    /// Build a fresh record of a registered fact type.
    pub fn new_fact(&self, type_name: &str) -> anyhow::Result<Fact> {
        Ok(Fact::new(self.core.board.registry(), type_name)?)
    }

    pub fn add_object(&mut self, data: Vec<u8>) -> anyhow::Result<u64> {
        Ok(self
            .core
            .add_object(data, Relations::new(), BTreeMap::new())?)
    }

    pub fn add_object_with(
        &mut self,
        data: Vec<u8>,
        parents: Relations,
        metadata: BTreeMap<String, String>,
    ) -> anyhow::Result<u64> {
        Ok(self.core.add_object(data, parents, metadata)?)
    }

    pub fn add_fact(&mut self, fact: &mut Fact) -> anyhow::Result<u64> {
        Ok(self.core.add_fact(fact, true)?)
    }

    pub fn add_hyp(&mut self, hyp: &mut Fact) -> anyhow::Result<u64> {
        Ok(self.core.add_hyp(hyp, true)?)
    }

    pub fn my_directory(&self) -> anyhow::Result<std::path::PathBuf> {
        Ok(self.core.dirs.my_dir()?)
    }

    pub fn create_temp_directory(&self) -> anyhow::Result<std::path::PathBuf> {
        Ok(self.core.dirs.temp_dir()?)
    }

    pub fn print(&self, message: &str) {
        self.core.print(message);
    }
}

// ---------------------------------------------------------------------------
// BackStory console
// ---------------------------------------------------------------------------

/// Console handed to a BackStory alongside each seed fact.
pub struct BackStoryConsole {
    core: ConsoleCore,
    memory: SharedMemory,
}

impl BackStoryConsole {
    pub(crate) fn new(core: ConsoleCore, memory: SharedMemory) -> Self {
        Self { core, memory }
    }

    pub fn memory(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.memory.lock().unwrap()
    }

    /// Build a fresh record of a registered fact type.
    pub fn new_fact(&self, type_name: &str) -> anyhow::Result<Fact> {
        Ok(Fact::new(self.core.board.registry(), type_name)?)
    }

    pub fn add_object(&mut self, data: Vec<u8>) -> anyhow::Result<u64> {
        Ok(self
            .core
            .add_object(data, Relations::new(), BTreeMap::new())?)
    }

    /// Seed facts have no parents yet, so parentage is not required here.
    pub fn add_fact(&mut self, fact: &mut Fact) -> anyhow::Result<u64> {
        Ok(self.core.add_fact(fact, false)?)
    }

    pub fn add_hyp(&mut self, hyp: &mut Fact) -> anyhow::Result<u64> {
        Ok(self.core.add_hyp(hyp, false)?)
    }

    pub fn my_directory(&self) -> anyhow::Result<std::path::PathBuf> {
        Ok(self.core.dirs.my_dir()?)
    }

    pub fn create_temp_directory(&self) -> anyhow::Result<std::path::PathBuf> {
        Ok(self.core.dirs.temp_dir()?)
    }

    pub fn print(&self, message: &str) {
        self.core.print(message);
    }
}

// ---------------------------------------------------------------------------
// Player console
// ---------------------------------------------------------------------------

/// Console handed to a player clone.
pub struct PlayerConsole {
    core: ConsoleCore,
    memory: SharedMemory,
    data: CloneData,
    /// True when the clone was triggered by a hyp; deriving untainted facts
    /// then requires explicit acknowledgement.
    tainted: bool,
}

impl PlayerConsole {
    pub(crate) fn new(
        core: ConsoleCore,
        memory: SharedMemory,
        data: CloneData,
        tainted: bool,
    ) -> Self {
        Self {
            core,
            memory,
            data,
            tainted,
        }
    }

    /// `(template, serial)` identity of this clone.
    pub fn id(&self) -> (String, u64) {
        (self.core.owner.template.clone(), self.core.owner.serial)
    }

    /// Template-level memory, shared across all clones of this player.
    pub fn memory(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.memory.lock().unwrap()
    }

    /// Clone-private data slots.
    pub fn data(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.data.lock().unwrap()
    }

    /// Build a fresh record of a registered fact type.
    pub fn new_fact(&self, type_name: &str) -> anyhow::Result<Fact> {
        Ok(Fact::new(self.core.board.registry(), type_name)?)
    }

    pub fn print(&self, message: &str) {
        self.core.print(message);
    }

    pub fn my_directory(&self) -> anyhow::Result<std::path::PathBuf> {
        Ok(self.core.dirs.my_dir()?)
    }

    pub fn create_temp_directory(&self) -> anyhow::Result<std::path::PathBuf> {
        Ok(self.core.dirs.temp_dir()?)
    }

    // -- reads --------------------------------------------------------------

    pub fn get_object(&self, id: u64) -> anyhow::Result<ObjectRecord> {
        Ok(self.core.board.get_object(id)?)
    }

    pub fn get_all_objects(&self) -> Vec<ObjectRecord> {
        self.core.board.all_objects()
    }

    pub fn get_fact(&self, id: u64) -> anyhow::Result<Fact> {
        Ok(self.core.board.get_fact(id)?)
    }

    pub fn get_hyp(&self, id: u64) -> anyhow::Result<Fact> {
        Ok(self.core.board.get_hyp(id)?)
    }

    /// All facts of the given types or groups, in id order.
    pub fn get_all_facts<S: AsRef<str>>(&self, types: &[S]) -> anyhow::Result<Vec<Fact>> {
        let expanded = self.core.expand_types(types)?;
        Ok(self.core.board.all_facts(&expanded))
    }

    /// All hyps of the given types or groups, in id order.
    pub fn get_all_hyps<S: AsRef<str>>(&self, types: &[S]) -> anyhow::Result<Vec<Fact>> {
        let expanded = self.core.expand_types(types)?;
        Ok(self.core.board.all_hyps(&expanded))
    }

    // -- writes -------------------------------------------------------------

    pub fn add_object(&mut self, data: Vec<u8>) -> anyhow::Result<u64> {
        Ok(self
            .core
            .add_object(data, Relations::new(), BTreeMap::new())?)
    }

    pub fn add_object_with(
        &mut self,
        data: Vec<u8>,
        parents: Relations,
        metadata: BTreeMap<String, String>,
    ) -> anyhow::Result<u64> {
        Ok(self.core.add_object(data, parents, metadata)?)
    }

    /// Add a fact. Fails `TaintedLineage` when this clone was triggered by a
    /// hyp; use [`add_fact_from_tainted`](Self::add_fact_from_tainted) to
    /// acknowledge the derivation.
    pub fn add_fact(&mut self, fact: &mut Fact) -> anyhow::Result<u64> {
        if self.tainted {
            return Err(BoardError::TaintedLineage.into());
        }
        Ok(self.core.add_fact(fact, true)?)
    }

    /// Add a fact derived from tainted input.
    pub fn add_fact_from_tainted(&mut self, fact: &mut Fact) -> anyhow::Result<u64> {
        Ok(self.core.add_fact(fact, true)?)
    }

    pub fn add_hyp(&mut self, hyp: &mut Fact) -> anyhow::Result<u64> {
        Ok(self.core.add_hyp(hyp, true)?)
    }

    // -- waits --------------------------------------------------------------

    /// Wait on facts of the given types/groups: backlog first, then live.
    pub fn wait_on_facts<S: AsRef<str>>(
        &self,
        types: &[S],
        since_id: Option<u64>,
    ) -> anyhow::Result<FactStream> {
        let expanded = self.core.expand_types(types)?;
        let filter = ScanFilter::for_types(EntryKind::Fact, expanded).since(since_id);
        Ok(FactStream {
            inner: self.core.subscribe(filter)?,
        })
    }

    /// Wait on hyps of the given types/groups: backlog first, then live.
    pub fn wait_on_hyps<S: AsRef<str>>(
        &self,
        types: &[S],
        since_id: Option<u64>,
    ) -> anyhow::Result<FactStream> {
        let expanded = self.core.expand_types(types)?;
        let filter = ScanFilter::for_types(EntryKind::Hyp, expanded).since(since_id);
        Ok(FactStream {
            inner: self.core.subscribe(filter)?,
        })
    }

    /// Wait on facts that are children of `parent`. Fails fast with
    /// `NotFound` if the parent does not exist.
    pub fn wait_on_child_facts<S: AsRef<str>>(
        &self,
        parent: EntryRef,
        types: &[S],
    ) -> anyhow::Result<FactStream> {
        let mut filter = ScanFilter::for_children(EntryKind::Fact, parent);
        if !types.is_empty() {
            filter = filter.with_types(self.core.expand_types(types)?);
        }
        Ok(FactStream {
            inner: self.core.subscribe(filter)?,
        })
    }

    /// Wait on hyps that are children of `parent`.
    pub fn wait_on_child_hyps<S: AsRef<str>>(
        &self,
        parent: EntryRef,
        types: &[S],
    ) -> anyhow::Result<FactStream> {
        let mut filter = ScanFilter::for_children(EntryKind::Hyp, parent);
        if !types.is_empty() {
            filter = filter.with_types(self.core.expand_types(types)?);
        }
        Ok(FactStream {
            inner: self.core.subscribe(filter)?,
        })
    }

    /// Wait on objects that are children of `parent`.
    pub fn wait_on_child_objects(&self, parent: EntryRef) -> anyhow::Result<ObjectStream> {
        let filter = ScanFilter::for_children(EntryKind::Object, parent);
        Ok(ObjectStream {
            inner: self.core.subscribe(filter)?,
        })
    }

    /// Block for the next fact of the given types/groups.
    ///
    /// `last_id` has the same strictly-greater semantics as `since_id`; a
    /// zero `timeout` fires `Timeout` unless a matching entry already
    /// exists.
    pub async fn wait_till_fact<S: AsRef<str>>(
        &self,
        types: &[S],
        last_id: Option<u64>,
        timeout: Option<Duration>,
    ) -> anyhow::Result<Fact> {
        let expanded = self.core.expand_types(types)?;
        let filter = ScanFilter::for_types(EntryKind::Fact, expanded).since(last_id);
        let pending = self.core.subscribe_once(filter)?;
        match pending.recv(timeout).await? {
            Posted::Fact(fact) | Posted::Hyp(fact) => Ok(fact),
            Posted::Object(_) => Err(WaitError::Cancelled.into()),
        }
    }
}
