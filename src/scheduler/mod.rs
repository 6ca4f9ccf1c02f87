//! The Game Master: worker population, clone dispatch, quiescence and
//! save/load orchestration.
//!
//! The run loop drains the store's event queue, fans events out to the wait
//! registry and the interest index, and spawns player clones on a bounded
//! task pool. NPCs and BackStory categories are single-instance and consume
//! their queues serially. The game ends when no work is outstanding and the
//! event queue has stayed empty for the grace window; all parked waiters are
//! then cancelled.

pub mod trackers;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::board::{Blackboard, EntryKind, EntryRef, ObjectRecord, Posted, Relations};
use crate::config::Configuration;
use crate::console::{BackStoryConsole, ConsoleCore, NpcConsole, PlayerConsole};
use crate::events::{event_channel, EventReceiver, EventSender, PostEvent};
use crate::facts::{Fact, FactRegistry};
use crate::interest::InterestIndex;
use crate::snapshot::{
    CloneSnap, ObjectSnap, PlayerSnap, RecordSnap, Snapshot, SnapshotHeader, WorkerSnap,
};
use crate::temporary::TemporaryHandler;
use crate::utilities::errors::{
    BoardError, EngineError, RegistrationError, SnapshotError, WaitError,
};
use crate::utilities::logger::Logger;
use crate::waits::{WaitOwner, WaitRegistry};
use crate::workers::{BackStoryTemplate, NpcTemplate, PlayerTemplate};

use trackers::{
    ActivityMonitor, BackStoryTracker, CloneParker, CloneRecord, CloneState, NpcTracker,
    PlayerTracker,
};

/// Creator name stamped on engine-seeded entries.
const GAME_MASTER: &str = "GameMaster";

/// Runtime below this is not worth reporting.
const RUNTIME_REPORT_THRESHOLD: Duration = Duration::from_micros(90);

/// A clone queued for restart after a load.
struct ResumeClone {
    template: String,
    serial: u64,
}

/// The engine entrypoint: owns the blackboard, the worker population and the
/// dispatch loop.
pub struct GameMaster {
    config: Configuration,
    registry: Arc<FactRegistry>,
    board: Arc<Blackboard>,
    waits: Arc<WaitRegistry>,
    interests: InterestIndex,
    npcs: Vec<Arc<NpcTracker>>,
    players: BTreeMap<String, Arc<PlayerTracker>>,
    categories: BTreeMap<String, Vec<Arc<BackStoryTracker>>>,
    event_tx: EventSender,
    event_rx: Mutex<Option<EventReceiver>>,
    monitor: Arc<ActivityMonitor>,
    limiter: Arc<Semaphore>,
    temp: Arc<TemporaryHandler>,
    logger: Arc<Logger>,
    seed_facts: Mutex<Vec<Fact>>,
    pending: Mutex<Vec<JoinHandle<()>>>,
    resume: Mutex<Vec<ResumeClone>>,
    new_game_plus: bool,
}

impl GameMaster {
    pub fn new(registry: FactRegistry, config: Configuration) -> Result<Self, EngineError> {
        let temp = TemporaryHandler::new(&config.d20.temporary)?;
        let (event_tx, event_rx) = event_channel();
        let registry = Arc::new(registry);
        let board = Arc::new(Blackboard::new(registry.clone(), event_tx.clone()));
        let limiter = Arc::new(Semaphore::new(config.d20.effective_parallelism()));

        Ok(Self {
            config,
            registry,
            board,
            waits: Arc::new(WaitRegistry::new()),
            interests: InterestIndex::new(),
            npcs: Vec::new(),
            players: BTreeMap::new(),
            categories: BTreeMap::new(),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            monitor: Arc::new(ActivityMonitor::new()),
            limiter,
            temp: Arc::new(temp),
            logger: Arc::new(Logger::new(false)),
            seed_facts: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            resume: Mutex::new(Vec::new()),
            new_game_plus: false,
        })
    }

    pub fn board(&self) -> &Arc<Blackboard> {
        &self.board
    }

    pub fn registry(&self) -> &Arc<FactRegistry> {
        &self.registry
    }

    /// Enable echoing worker `print` output to stdout.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.logger = Arc::new(Logger::new(verbose));
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    fn check_unique(&self, name: &str) -> Result<(), RegistrationError> {
        let taken = self.players.contains_key(name)
            || self.npcs.iter().any(|npc| npc.name() == name)
            || self
                .categories
                .values()
                .flatten()
                .any(|backstory| backstory.name() == name);
        if taken {
            return Err(RegistrationError::DuplicateWorker {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn register_npc(&mut self, template: NpcTemplate) -> Result<(), RegistrationError> {
        template.registration.check_engine_version()?;
        self.check_unique(&template.registration.name)?;
        log::debug!("registering NPC '{}'", template.registration.name);
        self.npcs.push(Arc::new(NpcTracker::new(template)));
        Ok(())
    }

    pub fn register_player(&mut self, template: PlayerTemplate) -> Result<(), RegistrationError> {
        template.registration.check_engine_version()?;
        self.check_unique(&template.registration.name)?;
        self.interests.register(
            &self.registry,
            &template.registration.name,
            &template.registration.interests,
        )?;
        log::debug!("registering Player '{}'", template.registration.name);
        let tracker = Arc::new(PlayerTracker::new(template));
        self.players.insert(tracker.name().to_string(), tracker);
        Ok(())
    }

    pub fn register_backstory(
        &mut self,
        template: BackStoryTemplate,
    ) -> Result<(), RegistrationError> {
        template.registration.check_engine_version()?;
        self.check_unique(&template.registration.name)?;
        let weight = self
            .config
            .backstory_options(&template.registration.name)
            .get("weight")
            .and_then(|value| value.as_i64())
            .unwrap_or(template.default_weight);
        let category = template.category.clone();
        log::debug!(
            "registering BackStory '{}' in category '{category}'",
            template.registration.name
        );
        let tracker = BackStoryTracker::new(template).with_weight(weight);
        let slot = self.categories.entry(category).or_default();
        slot.push(Arc::new(tracker));
        slot.sort_by_key(|tracker| tracker.weight);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Seeding
    // -----------------------------------------------------------------------

    /// Add the root object; NPCs observe it once the game runs.
    pub fn seed_object(
        &self,
        data: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<u64, BoardError> {
        let (id, _) = self
            .board
            .add_object(data, GAME_MASTER, Relations::new(), metadata)?;
        Ok(id)
    }

    /// Queue seed facts for the BackStory categories.
    pub fn seed_facts(&self, facts: Vec<Fact>) {
        self.seed_facts.lock().unwrap().extend(facts);
    }

    /// Promote a hyp to a fact; callable out-of-band between runs.
    pub fn promote_hyp(&self, hyp_id: u64) -> Result<u64, BoardError> {
        self.board.promote_hyp(hyp_id)
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// Drive the game to quiescence.
    pub async fn run(&self) -> Result<(), EngineError> {
        let mut event_rx = self
            .event_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| EngineError::Invariant("game was already run".into()))?;

        log::debug!("starting game");
        let game_start = Instant::now();
        self.monitor.touch();

        let npc_feeds: Vec<(Arc<NpcTracker>, mpsc::UnboundedSender<ObjectRecord>)> = self
            .npcs
            .iter()
            .map(|tracker| (tracker.clone(), self.spawn_npc_pump(tracker.clone())))
            .collect();

        let mut category_feeds = BTreeMap::new();
        for (category, trackers) in &self.categories {
            category_feeds.insert(
                category.clone(),
                self.spawn_category_pump(category.clone(), trackers.clone()),
            );
        }

        // Clones restored as RUNNABLE restart from their trigger.
        for resume in std::mem::take(&mut *self.resume.lock().unwrap()) {
            self.respawn_clone(&resume.template, resume.serial);
        }

        // Seed facts engage the backstories.
        for fact in std::mem::take(&mut *self.seed_facts.lock().unwrap()) {
            for (category, feed) in &category_feeds {
                log::debug!("sending seed fact to '{category}' backstories");
                self.monitor.begin_work();
                if feed.send(fact.clone()).is_err() {
                    self.monitor.end_work();
                }
            }
        }

        let grace = self.config.d20.grace();
        loop {
            if let Some(limit) = self.config.d20.max_game() {
                if game_start.elapsed() > limit {
                    log::info!("maximum game time ({}s) reached, stopping game", limit.as_secs());
                    break;
                }
            }
            match tokio::time::timeout(Duration::from_millis(25), event_rx.recv()).await {
                Ok(Some(event)) => self.dispatch(event, &npc_feeds),
                Ok(None) => break,
                Err(_) => {
                    if self.monitor.outstanding() == 0 && self.monitor.idle_for() >= grace {
                        log::info!(
                            "no game progress for {}s, stopping game",
                            grace.as_secs()
                        );
                        break;
                    }
                }
            }
        }

        // Quiescence: wake every parked clone with a cancellation, stop the
        // single-instance pumps, then drain all tasks.
        self.waits.cancel_all();
        drop(npc_feeds);
        drop(category_feeds);
        let handles = std::mem::take(&mut *self.pending.lock().unwrap());
        for handle in handles {
            if let Err(join_error) = handle.await {
                log::error!("worker task panicked: {join_error}");
            }
        }
        self.report_runtimes();
        Ok(())
    }

    fn dispatch(
        &self,
        event: PostEvent,
        npc_feeds: &[(Arc<NpcTracker>, mpsc::UnboundedSender<ObjectRecord>)],
    ) {
        self.monitor.touch();
        let posted = match self.board.resolve(event.entry()) {
            Ok(posted) => posted,
            Err(error) => {
                // A hyp may have been promoted between commit and dispatch.
                log::warn!("event for {} no longer resolves: {error}", event.entry());
                return;
            }
        };

        self.waits.notify(&event, &posted);

        for parked in self.waits.drain_restored_matches(&event) {
            self.respawn_clone(&parked.owner.template, parked.owner.serial);
        }

        match event.kind {
            EntryKind::Object => {
                if event.deduped {
                    log::debug!("object {} deduplicated; NPCs not re-engaged", event.id);
                    return;
                }
                if let Posted::Object(record) = &posted {
                    for (tracker, feed) in npc_feeds {
                        log::debug!("sending object {} to npc {}", record.id(), tracker.name());
                        self.monitor.begin_work();
                        if feed.send(record.clone()).is_err() {
                            self.monitor.end_work();
                        }
                    }
                }
            }
            EntryKind::Fact | EntryKind::Hyp => {
                let Some(type_name) = event.type_name.as_deref() else {
                    return;
                };
                let subscribed: Vec<String> =
                    self.interests.matching(event.kind, type_name).to_vec();
                for template in subscribed {
                    if let Some(tracker) = self.players.get(&template) {
                        self.spawn_clone(tracker.clone(), posted.clone(), None);
                    }
                }
            }
        }
    }

    fn spawn_clone(
        &self,
        tracker: Arc<PlayerTracker>,
        trigger: Posted,
        existing: Option<Arc<CloneRecord>>,
    ) {
        let record = match existing {
            Some(record) => record,
            None => {
                let serial = tracker.next_serial();
                let record = Arc::new(CloneRecord::new(
                    serial,
                    trigger.entry(),
                    Arc::new(Mutex::new(BTreeMap::new())),
                ));
                tracker.insert_clone(record.clone());
                record
            }
        };
        let identity = format!("{}-{}", tracker.name(), record.serial);
        record.set_state(CloneState::Runnable, &identity, &self.monitor);
        self.monitor.begin_work();

        let board = self.board.clone();
        let waits = self.waits.clone();
        let limiter = self.limiter.clone();
        let monitor = self.monitor.clone();
        let logger = self.logger.clone();
        let temp = self.temp.clone();
        let tainted = matches!(trigger, Posted::Hyp(_));

        let handle = tokio::spawn(async move {
            let permit = limiter.clone().acquire_owned().await.ok();
            record.set_state(CloneState::Running, &identity, &monitor);

            let dirs = match temp.clone_handler(tracker.name(), record.serial) {
                Ok(dirs) => Arc::new(dirs),
                Err(error) => {
                    log::error!("unable to create directories for {identity}: {error}");
                    record.set_error(error.to_string());
                    record.set_state(CloneState::Done, &identity, &monitor);
                    monitor.end_work();
                    return;
                }
            };

            let parker = Arc::new(CloneParker {
                record: record.clone(),
                monitor: monitor.clone(),
                identity: identity.clone(),
                limiter,
                permit: Mutex::new(permit),
            });
            let core = ConsoleCore {
                board,
                waits,
                owner: WaitOwner {
                    template: tracker.name().to_string(),
                    serial: record.serial,
                    trigger: record.trigger,
                },
                identity: identity.clone(),
                logger,
                dirs,
                park: Some(parker.clone()),
            };
            let mut console =
                PlayerConsole::new(core, tracker.memory.clone(), record.data.clone(), tainted);

            let player = (tracker.template.ctor)();
            let start = Instant::now();
            let result = match &trigger {
                Posted::Fact(fact) => player.handle_fact(&mut console, fact.clone()).await,
                Posted::Hyp(hyp) => player.handle_hyp(&mut console, hyp.clone()).await,
                // Players are never object-triggered.
                Posted::Object(_) => Ok(()),
            };
            tracker.add_runtime(start.elapsed());

            match result {
                Ok(()) => {}
                Err(error) => {
                    if matches!(
                        error.downcast_ref::<WaitError>(),
                        Some(WaitError::Cancelled)
                    ) {
                        log::debug!("clone {identity} cancelled");
                    } else {
                        log::error!("clone {identity} failed: {error:#}");
                        record.set_error(format!("{error:#}"));
                    }
                }
            }
            record.set_state(CloneState::Done, &identity, &monitor);
            monitor.end_work();
        });
        self.pending.lock().unwrap().push(handle);
    }

    /// Restart a restored clone from its original triggering entry.
    fn respawn_clone(&self, template: &str, serial: u64) {
        let Some(tracker) = self.players.get(template) else {
            log::error!("restored clone references unknown template '{template}'");
            return;
        };
        let Some(record) = tracker.clone_record(serial) else {
            log::error!("restored clone {template}-{serial} has no record");
            return;
        };
        match self.board.resolve(record.trigger) {
            Ok(trigger) => self.spawn_clone(tracker.clone(), trigger, Some(record)),
            Err(error) => {
                log::error!("trigger for {template}-{serial} no longer resolves: {error}")
            }
        }
    }

    fn spawn_npc_pump(&self, tracker: Arc<NpcTracker>) -> mpsc::UnboundedSender<ObjectRecord> {
        let (feed, mut queue) = mpsc::unbounded_channel::<ObjectRecord>();
        let board = self.board.clone();
        let waits = self.waits.clone();
        let monitor = self.monitor.clone();
        let logger = self.logger.clone();
        let limiter = self.limiter.clone();
        let temp = self.temp.clone();

        let handle = tokio::spawn(async move {
            let dirs = match temp.clone_handler(tracker.name(), 0) {
                Ok(dirs) => Arc::new(dirs),
                Err(error) => {
                    log::error!("unable to create directories for NPC {}: {error}", tracker.name());
                    return;
                }
            };
            while let Some(object) = queue.recv().await {
                let _permit = limiter.clone().acquire_owned().await.ok();
                tracker.set_state(CloneState::Running);
                let core = ConsoleCore {
                    board: board.clone(),
                    waits: waits.clone(),
                    owner: WaitOwner {
                        template: tracker.name().to_string(),
                        serial: 0,
                        trigger: EntryRef::object(object.id()),
                    },
                    identity: tracker.name().to_string(),
                    logger: logger.clone(),
                    dirs: dirs.clone(),
                    park: None,
                };
                let mut console = NpcConsole::new(core, tracker.memory.clone());
                let start = Instant::now();
                if let Err(error) = tracker
                    .template
                    .instance
                    .handle_object(&mut console, object)
                    .await
                {
                    log::error!("error running NPC {}: {error:#}", tracker.name());
                }
                tracker.add_runtime(start.elapsed());
                tracker.set_state(CloneState::Runnable);
                monitor.end_work();
            }
            tracker.set_state(CloneState::Done);
        });
        self.pending.lock().unwrap().push(handle);
        feed
    }

    fn spawn_category_pump(
        &self,
        category: String,
        trackers: Vec<Arc<BackStoryTracker>>,
    ) -> mpsc::UnboundedSender<Fact> {
        let (feed, mut queue) = mpsc::unbounded_channel::<Fact>();
        let board = self.board.clone();
        let waits = self.waits.clone();
        let monitor = self.monitor.clone();
        let logger = self.logger.clone();
        let temp = self.temp.clone();

        let handle = tokio::spawn(async move {
            let mut handlers = Vec::new();
            for tracker in &trackers {
                match temp.clone_handler(tracker.name(), 0) {
                    Ok(dirs) => handlers.push(Arc::new(dirs)),
                    Err(error) => {
                        log::error!(
                            "unable to create directories for BackStory {}: {error}",
                            tracker.name()
                        );
                        return;
                    }
                }
            }
            while let Some(fact) = queue.recv().await {
                // Weighted order; the first consumer short-circuits the rest.
                for (tracker, dirs) in trackers.iter().zip(&handlers) {
                    let core = ConsoleCore {
                        board: board.clone(),
                        waits: waits.clone(),
                        owner: WaitOwner {
                            template: tracker.name().to_string(),
                            serial: 0,
                            trigger: EntryRef::fact(0),
                        },
                        identity: tracker.name().to_string(),
                        logger: logger.clone(),
                        dirs: dirs.clone(),
                        park: None,
                    };
                    let mut console = BackStoryConsole::new(core, tracker.memory.clone());
                    let start = Instant::now();
                    let outcome = tracker
                        .template
                        .instance
                        .handle_fact(&mut console, fact.clone())
                        .await;
                    tracker.add_runtime(start.elapsed());
                    match outcome {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(error) => {
                            log::error!(
                                "error running BackStory {} in '{category}': {error:#}",
                                tracker.name()
                            );
                        }
                    }
                }
                monitor.end_work();
            }
        });
        self.pending.lock().unwrap().push(handle);
        feed
    }

    fn report_runtimes(&self) {
        for npc in &self.npcs {
            if npc.runtime() > RUNTIME_REPORT_THRESHOLD {
                log::info!(
                    "NPC    '{}' - runtime {:.4}s over {} object(s)",
                    npc.name(),
                    npc.runtime().as_secs_f64(),
                    npc.handled()
                );
            }
        }
        for tracker in self.players.values() {
            if tracker.runtime() > RUNTIME_REPORT_THRESHOLD {
                log::info!(
                    "Player '{}' - runtime {:.4}s over {} clone(s)",
                    tracker.name(),
                    tracker.runtime().as_secs_f64(),
                    tracker.clone_count()
                );
            }
        }
    }

    /// Clones ever spawned for a template; test and inspection hook.
    pub fn clone_count(&self, template: &str) -> usize {
        self.players
            .get(template)
            .map(|tracker| tracker.clone_count())
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Save / load
    // -----------------------------------------------------------------------

    /// Capture the complete game state.
    pub fn save(&self) -> Snapshot {
        let dump = self.board.dump();
        let players = self
            .players
            .values()
            .map(|tracker| PlayerSnap {
                name: tracker.name().to_string(),
                version: tracker.template.registration.version.clone(),
                serial_counter: tracker.serial_counter(),
                memory: tracker.memory.lock().unwrap().clone(),
                clones: tracker
                    .clones
                    .lock()
                    .unwrap()
                    .values()
                    .map(|record| CloneSnap {
                        serial: record.serial,
                        state: record.state(),
                        trigger: record.trigger,
                        data: record.data.lock().unwrap().clone(),
                        error: record.error(),
                    })
                    .collect(),
            })
            .collect();

        let mut parked_waits = self.waits.parked_predicates();
        parked_waits.extend(self.waits.restored_predicates());

        Snapshot {
            header: SnapshotHeader::new(),
            objects: dump.objects.iter().map(ObjectSnap::from_record).collect(),
            facts: dump.facts.iter().map(RecordSnap::from_record).collect(),
            hyps: dump.hyps.iter().map(RecordSnap::from_record).collect(),
            fact_next_id: dump.fact_next_id,
            hyp_next_id: dump.hyp_next_id,
            registered_types: self.registry.type_names(),
            players,
            npcs: self
                .npcs
                .iter()
                .map(|tracker| WorkerSnap {
                    name: tracker.name().to_string(),
                    memory: tracker.memory.lock().unwrap().clone(),
                })
                .collect(),
            backstories: self
                .categories
                .values()
                .flatten()
                .map(|tracker| WorkerSnap {
                    name: tracker.name().to_string(),
                    memory: tracker.memory.lock().unwrap().clone(),
                })
                .collect(),
            parked_waits,
        }
    }

    /// Rebuild game state from a snapshot.
    ///
    /// All workers must already be registered; they are rebound by name.
    /// Clones saved RUNNABLE or RUNNING restart from their triggering entry
    /// when the game next runs; WAITING clones restart when an entry
    /// matching their parked predicate arrives.
    pub fn load_snapshot(&mut self, snapshot: Snapshot) -> Result<(), SnapshotError> {
        snapshot.verify_compatible()?;

        for name in &snapshot.registered_types {
            if !self.registry.is_type(name) {
                return Err(SnapshotError::UnknownFactType { name: name.clone() });
            }
        }

        let dump = snapshot.board_dump()?;
        self.board = Arc::new(Blackboard::restore(
            self.registry.clone(),
            self.event_tx.clone(),
            dump,
        )?);

        let mut resume = Vec::new();
        for saved in &snapshot.players {
            let tracker =
                self.players
                    .get(&saved.name)
                    .ok_or_else(|| SnapshotError::UnknownWorker {
                        name: saved.name.clone(),
                    })?;
            *tracker.memory.lock().unwrap() = saved.memory.clone();
            tracker.set_serial_counter(saved.serial_counter);
            for clone in &saved.clones {
                let record = Arc::new(CloneRecord::restore(
                    clone.serial,
                    clone.trigger,
                    Arc::new(Mutex::new(clone.data.clone())),
                    clone.state,
                    clone.error.clone(),
                ));
                tracker.insert_clone(record);
                if matches!(clone.state, CloneState::Runnable | CloneState::Running) {
                    resume.push(ResumeClone {
                        template: saved.name.clone(),
                        serial: clone.serial,
                    });
                }
            }
        }

        for saved in &snapshot.npcs {
            let tracker = self
                .npcs
                .iter()
                .find(|tracker| tracker.name() == saved.name)
                .ok_or_else(|| SnapshotError::UnknownWorker {
                    name: saved.name.clone(),
                })?;
            *tracker.memory.lock().unwrap() = saved.memory.clone();
        }

        for saved in &snapshot.backstories {
            let tracker = self
                .categories
                .values()
                .flatten()
                .find(|tracker| tracker.name() == saved.name)
                .ok_or_else(|| SnapshotError::UnknownWorker {
                    name: saved.name.clone(),
                })?;
            *tracker.memory.lock().unwrap() = saved.memory.clone();
        }

        self.waits.restore_parked(snapshot.parked_waits);
        *self.resume.lock().unwrap() = resume;
        self.new_game_plus = true;
        log::info!("loaded save from {}", snapshot.header.created_at);
        Ok(())
    }

    /// Whether this game was resumed from a save.
    pub fn is_new_game_plus(&self) -> bool {
        self.new_game_plus
    }

    /// Remove the run's temporary tree; skipped automatically for resumed
    /// games so on-disk state survives chained sessions.
    pub fn cleanup(&self) -> Result<(), EngineError> {
        if !self.new_game_plus {
            self.temp.cleanup()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::EntryRef;
    use crate::facts::{register_builtin_types, FactTypeDescriptor, FieldKind, FieldSpec};
    use crate::waits::ParkedWait;
    use async_trait::async_trait;
    use serde_json::json;

    fn registry() -> FactRegistry {
        let mut registry = FactRegistry::new();
        register_builtin_types(&mut registry).unwrap();
        registry
            .register(
                FactTypeDescriptor::new("trigger")
                    .with_field("reason", FieldSpec::new(FieldKind::String)),
            )
            .unwrap();
        registry
    }

    fn test_config() -> Configuration {
        let mut config = Configuration::default();
        config.d20.temporary = tempfile::tempdir().unwrap().keep();
        config.d20.grace_time = 1;
        config
    }

    fn form(name: &str) -> crate::registration::RegistrationForm {
        crate::registration::RegistrationForm::new(
            name,
            "test worker",
            "tests",
            "1.0",
            crate::version::GAME_ENGINE_VERSION_RAW,
        )
        .unwrap()
    }

    fn push_to_memory(console: &PlayerConsole, key: &str, value: serde_json::Value) {
        let mut memory = console.memory();
        memory
            .entry(key.to_string())
            .or_insert_with(|| json!([]))
            .as_array_mut()
            .unwrap()
            .push(value);
    }

    /// NPC that asserts an md5 fact for every object it sees.
    struct Md5Npc;

    #[async_trait]
    impl crate::workers::Npc for Md5Npc {
        async fn handle_object(
            &self,
            console: &mut NpcConsole,
            object: ObjectRecord,
        ) -> anyhow::Result<()> {
            {
                let mut memory = console.memory();
                let seen = memory
                    .entry("objects_seen".to_string())
                    .or_insert_with(|| json!(0));
                let next = seen.as_i64().unwrap() + 1;
                *seen = json!(next);
            }
            let digest = format!("{:x}", md5::compute(object.data()));
            let mut fact = console.new_fact("md5")?;
            fact.set("value", digest)?;
            fact.add_parent_object(object.id())?;
            console.add_fact(&mut fact)?;
            Ok(())
        }
    }

    /// NPC that asserts a sha256 fact for every object it sees.
    struct Sha256Npc;

    #[async_trait]
    impl crate::workers::Npc for Sha256Npc {
        async fn handle_object(
            &self,
            console: &mut NpcConsole,
            object: ObjectRecord,
        ) -> anyhow::Result<()> {
            let mut fact = console.new_fact("sha256")?;
            fact.set("value", crate::board::digest_bytes(object.data()))?;
            fact.add_parent_object(object.id())?;
            console.add_fact(&mut fact)?;
            Ok(())
        }
    }

    /// Player that guesses a mimetype hyp from any md5 fact.
    struct MimeGuesser;

    #[async_trait]
    impl crate::workers::Player for MimeGuesser {
        async fn handle_fact(
            &self,
            console: &mut PlayerConsole,
            fact: Fact,
        ) -> anyhow::Result<()> {
            let mut hyp = console.new_fact("mimetype")?;
            hyp.set("mimetype", "text/plain")?;
            hyp.add_parent_fact(fact.id().unwrap())?;
            console.add_hyp(&mut hyp)?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn single_object_npc_and_player_quiesce() {
        let mut gm = GameMaster::new(registry(), test_config()).unwrap();
        gm.register_npc(NpcTemplate::new(form("HashNPC"), Arc::new(Md5Npc)))
            .unwrap();
        gm.register_player(PlayerTemplate::new(
            form("MimeGuesser").with_interests(["md5".to_string()]),
            Arc::new(|| Box::new(MimeGuesser)),
        ))
        .unwrap();

        gm.seed_object(b"abc".to_vec(), BTreeMap::new()).unwrap();
        gm.run().await.unwrap();

        let board = gm.board();
        assert_eq!(board.object_count(), 1);
        assert_eq!(board.fact_count(), 1);
        assert_eq!(board.hyp_count(), 1);

        let fact = board.get_fact(0).unwrap();
        assert_eq!(
            fact.get("value").unwrap().as_str(),
            Some("900150983cd24fb0d6963f7d28e17f72")
        );
        assert_eq!(fact.parent_objects(), [0]);
        let hyp = board.get_hyp(0).unwrap();
        assert_eq!(hyp.parent_facts(), [0]);
        assert_eq!(gm.clone_count("MimeGuesser"), 1);
    }

    #[tokio::test]
    async fn dedup_runs_object_workers_once() {
        let mut gm = GameMaster::new(registry(), test_config()).unwrap();
        gm.register_npc(NpcTemplate::new(form("HashNPC"), Arc::new(Md5Npc)))
            .unwrap();

        gm.board()
            .add_object(b"x".to_vec(), "alice", Relations::new(), BTreeMap::new())
            .unwrap();
        gm.board()
            .add_object(b"x".to_vec(), "bob", Relations::new(), BTreeMap::new())
            .unwrap();
        gm.run().await.unwrap();

        assert_eq!(gm.board().object_count(), 1);
        // The NPC observed the object exactly once.
        let seen = gm.npcs[0].memory.lock().unwrap()["objects_seen"].clone();
        assert_eq!(seen, json!(1));
        assert_eq!(gm.board().fact_count(), 1);
    }

    /// Player that drains a hash-fact stream into template memory until
    /// cancellation.
    struct Collector;

    #[async_trait]
    impl crate::workers::Player for Collector {
        async fn handle_fact(
            &self,
            console: &mut PlayerConsole,
            _trigger: Fact,
        ) -> anyhow::Result<()> {
            let mut stream = console.wait_on_facts(&["hash"], None)?;
            loop {
                let fact = stream.next().await?;
                push_to_memory(console, "collected", json!(fact.id().unwrap()));
            }
        }
    }

    /// Player that adds one late md5 fact after a pause.
    struct LateProducer;

    #[async_trait]
    impl crate::workers::Player for LateProducer {
        async fn handle_fact(
            &self,
            console: &mut PlayerConsole,
            trigger: Fact,
        ) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let mut fact = console.new_fact("md5")?;
            fact.set("value", "late")?;
            fact.add_parent_fact(trigger.id().unwrap())?;
            console.add_fact(&mut fact)?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn backlog_then_live_wait_sees_everything_in_order() {
        let mut gm = GameMaster::new(registry(), test_config()).unwrap();
        gm.register_player(PlayerTemplate::new(
            form("Collector").with_interests(["trigger".to_string()]),
            Arc::new(|| Box::new(Collector)),
        ))
        .unwrap();
        gm.register_player(PlayerTemplate::new(
            form("LateProducer").with_interests(["trigger".to_string()]),
            Arc::new(|| Box::new(LateProducer)),
        ))
        .unwrap();

        // Three hash facts exist before anyone waits.
        let (object_id, _) = gm
            .board()
            .add_object(b"seed".to_vec(), GAME_MASTER, Relations::new(), BTreeMap::new())
            .unwrap();
        for value in ["a", "b", "c"] {
            let mut fact = Fact::new(gm.registry(), "md5").unwrap();
            fact.set("value", value).unwrap();
            fact.add_parent_object(object_id).unwrap();
            gm.board().add_fact(&mut fact, "seeder").unwrap();
        }
        let mut trigger = Fact::new(gm.registry(), "trigger").unwrap();
        trigger.add_parent_object(object_id).unwrap();
        gm.board().add_fact(&mut trigger, "seeder").unwrap();

        gm.run().await.unwrap();

        let memory = gm.players["Collector"].memory.lock().unwrap().clone();
        // Backlog ids 0..2 in order, then the live fact (id 4; the trigger
        // fact took id 3). The run ended, so cancellation terminated the
        // collector cleanly.
        assert_eq!(memory["collected"], json!([0, 1, 2, 4]));
    }

    /// Player that expects a timeout waiting for a fact nobody produces.
    struct TimeoutWaiter;

    #[async_trait]
    impl crate::workers::Player for TimeoutWaiter {
        async fn handle_fact(
            &self,
            console: &mut PlayerConsole,
            _trigger: Fact,
        ) -> anyhow::Result<()> {
            let started = Instant::now();
            let outcome = console
                .wait_till_fact(&["sha1"], None, Some(Duration::from_millis(100)))
                .await;
            let timed_out = matches!(
                outcome.as_ref().map_err(|e| e.downcast_ref::<WaitError>()),
                Err(Some(WaitError::Timeout))
            );
            let mut memory = console.memory();
            memory.insert("timed_out".to_string(), json!(timed_out));
            memory.insert(
                "waited_ms".to_string(),
                json!(started.elapsed().as_millis() as u64),
            );
            Ok(())
        }
    }

    #[tokio::test]
    async fn wait_till_fact_times_out_within_bounds() {
        let mut gm = GameMaster::new(registry(), test_config()).unwrap();
        gm.register_player(PlayerTemplate::new(
            form("TimeoutWaiter").with_interests(["trigger".to_string()]),
            Arc::new(|| Box::new(TimeoutWaiter)),
        ))
        .unwrap();

        let (object_id, _) = gm
            .board()
            .add_object(b"seed".to_vec(), GAME_MASTER, Relations::new(), BTreeMap::new())
            .unwrap();
        let mut trigger = Fact::new(gm.registry(), "trigger").unwrap();
        trigger.add_parent_object(object_id).unwrap();
        gm.board().add_fact(&mut trigger, "seeder").unwrap();

        gm.run().await.unwrap();

        let memory = gm.players["TimeoutWaiter"].memory.lock().unwrap().clone();
        assert_eq!(memory["timed_out"], json!(true));
        assert!(memory["waited_ms"].as_u64().unwrap() < 200);
    }

    #[tokio::test]
    async fn group_interest_spawns_on_every_member_type() {
        let mut gm = GameMaster::new(registry(), test_config()).unwrap();
        gm.register_npc(NpcTemplate::new(form("HashNPC"), Arc::new(Md5Npc)))
            .unwrap();
        gm.register_npc(NpcTemplate::new(form("Sha256NPC"), Arc::new(Sha256Npc)))
            .unwrap();
        gm.register_player(PlayerTemplate::new(
            form("HashWatcher").with_interests(["hash".to_string()]),
            Arc::new(|| Box::new(MimeGuesser)),
        ))
        .unwrap();

        gm.seed_object(b"abc".to_vec(), BTreeMap::new()).unwrap();
        gm.run().await.unwrap();

        // One md5 and one sha256 fact, each of which cloned the watcher.
        assert_eq!(gm.board().fact_count(), 2);
        assert_eq!(gm.clone_count("HashWatcher"), 2);
        assert_eq!(gm.board().hyp_count(), 2);
    }

    /// Player that records every mimetype fact it is dispatched for.
    struct MimeFan;

    #[async_trait]
    impl crate::workers::Player for MimeFan {
        async fn handle_fact(
            &self,
            console: &mut PlayerConsole,
            fact: Fact,
        ) -> anyhow::Result<()> {
            push_to_memory(
                console,
                "mimetypes",
                json!(fact.get("mimetype").unwrap().as_str().unwrap()),
            );
            Ok(())
        }
    }

    fn scenario_one_workers(gm: &mut GameMaster) {
        gm.register_npc(NpcTemplate::new(form("HashNPC"), Arc::new(Md5Npc)))
            .unwrap();
        gm.register_player(PlayerTemplate::new(
            form("MimeGuesser").with_interests(["md5".to_string()]),
            Arc::new(|| Box::new(MimeGuesser)),
        ))
        .unwrap();
    }

    #[tokio::test]
    async fn save_promote_load_wakes_mimetype_watchers() {
        let mut gm = GameMaster::new(registry(), test_config()).unwrap();
        scenario_one_workers(&mut gm);
        gm.seed_object(b"abc".to_vec(), BTreeMap::new()).unwrap();
        gm.run().await.unwrap();
        let snapshot = gm.save();

        // A fresh game with the same population plus a mimetype watcher.
        let mut resumed = GameMaster::new(registry(), test_config()).unwrap();
        scenario_one_workers(&mut resumed);
        resumed
            .register_player(PlayerTemplate::new(
                form("MimeFan").with_interests(["mimetype".to_string()]),
                Arc::new(|| Box::new(MimeFan)),
            ))
            .unwrap();
        resumed.load_snapshot(snapshot).unwrap();

        let board_hyp = resumed.board().get_hyp(0).unwrap();
        let promoted_id = resumed.promote_hyp(0).unwrap();
        let promoted = resumed.board().get_fact(promoted_id).unwrap();
        assert_eq!(promoted.fields(), board_hyp.fields());
        assert_eq!(resumed.board().hyp_count(), 0);

        resumed.run().await.unwrap();

        let memory = resumed.players["MimeFan"].memory.lock().unwrap().clone();
        assert_eq!(memory["mimetypes"], json!(["text/plain"]));
        assert_eq!(resumed.clone_count("MimeFan"), 1);
    }

    #[tokio::test]
    async fn save_load_round_trips_store_and_dedup() {
        let mut gm = GameMaster::new(registry(), test_config()).unwrap();
        scenario_one_workers(&mut gm);
        gm.seed_object(b"abc".to_vec(), BTreeMap::new()).unwrap();
        gm.run().await.unwrap();
        let snapshot = gm.save();
        assert_eq!(snapshot.registered_types.len(), 6);

        let mut resumed = GameMaster::new(registry(), test_config()).unwrap();
        scenario_one_workers(&mut resumed);
        resumed.load_snapshot(snapshot).unwrap();
        assert!(resumed.is_new_game_plus());

        let board = resumed.board();
        assert_eq!(board.object_count(), 1);
        assert_eq!(board.fact_count(), 1);
        assert_eq!(board.hyp_count(), 1);
        // Dedup index survived: identical bytes merge.
        let (id, was_new) = board
            .add_object(b"abc".to_vec(), "bob", Relations::new(), BTreeMap::new())
            .unwrap();
        assert_eq!(id, 0);
        assert!(!was_new);
        // Serial counters resume past the saved clones.
        assert_eq!(resumed.players["MimeGuesser"].serial_counter(), 1);
    }

    #[tokio::test]
    async fn load_rejects_unknown_workers() {
        let mut gm = GameMaster::new(registry(), test_config()).unwrap();
        scenario_one_workers(&mut gm);
        gm.seed_object(b"abc".to_vec(), BTreeMap::new()).unwrap();
        gm.run().await.unwrap();
        let snapshot = gm.save();

        let mut bare = GameMaster::new(registry(), test_config()).unwrap();
        let err = bare.load_snapshot(snapshot).unwrap_err();
        assert!(matches!(err, SnapshotError::UnknownWorker { .. }));
    }

    #[tokio::test]
    async fn restored_waiting_clone_restarts_on_matching_entry() {
        let mut gm = GameMaster::new(registry(), test_config()).unwrap();
        scenario_one_workers(&mut gm);
        gm.seed_object(b"abc".to_vec(), BTreeMap::new()).unwrap();
        gm.run().await.unwrap();
        let mut snapshot = gm.save();

        // Hand-craft a clone that was parked waiting for sha256 facts when
        // the save was taken.
        let saved_player = snapshot
            .players
            .iter_mut()
            .find(|p| p.name == "MimeGuesser")
            .unwrap();
        saved_player.clones.push(CloneSnap {
            serial: 7,
            state: CloneState::Waiting,
            trigger: EntryRef::fact(0),
            data: BTreeMap::new(),
            error: None,
        });
        saved_player.serial_counter = 8;
        snapshot.parked_waits.push(ParkedWait {
            owner: WaitOwner {
                template: "MimeGuesser".into(),
                serial: 7,
                trigger: EntryRef::fact(0),
            },
            filter: crate::board::ScanFilter::for_types(
                EntryKind::Fact,
                ["sha256".to_string()],
            ),
        });

        let mut resumed = GameMaster::new(registry(), test_config()).unwrap();
        scenario_one_workers(&mut resumed);
        resumed
            .register_npc(NpcTemplate::new(form("Sha256NPC"), Arc::new(Sha256Npc)))
            .unwrap();
        resumed.load_snapshot(snapshot).unwrap();
        let hyps_before = resumed.board().hyp_count();

        // A fresh object produces a sha256 fact, which matches the restored
        // predicate and restarts the parked clone from its md5 trigger.
        resumed.seed_object(b"xyz".to_vec(), BTreeMap::new()).unwrap();
        resumed.run().await.unwrap();

        let record = resumed.players["MimeGuesser"].clone_record(7).unwrap();
        assert_eq!(record.state(), CloneState::Done);
        assert!(resumed.board().hyp_count() > hyps_before);
    }

    #[tokio::test]
    async fn worker_crash_marks_clone_done_and_game_continues() {
        struct Crasher;

        #[async_trait]
        impl crate::workers::Player for Crasher {
            async fn handle_fact(
                &self,
                _console: &mut PlayerConsole,
                _fact: Fact,
            ) -> anyhow::Result<()> {
                anyhow::bail!("deliberate failure")
            }
        }

        let mut gm = GameMaster::new(registry(), test_config()).unwrap();
        gm.register_npc(NpcTemplate::new(form("HashNPC"), Arc::new(Md5Npc)))
            .unwrap();
        gm.register_player(PlayerTemplate::new(
            form("Crasher").with_interests(["md5".to_string()]),
            Arc::new(|| Box::new(Crasher)),
        ))
        .unwrap();
        gm.register_player(PlayerTemplate::new(
            form("MimeGuesser").with_interests(["md5".to_string()]),
            Arc::new(|| Box::new(MimeGuesser)),
        ))
        .unwrap();

        gm.seed_object(b"abc".to_vec(), BTreeMap::new()).unwrap();
        gm.run().await.unwrap();

        // The crash is recorded; the other player still did its work.
        let record = gm.players["Crasher"].clone_record(0).unwrap();
        assert_eq!(record.state(), CloneState::Done);
        assert!(record.error().unwrap().contains("deliberate failure"));
        assert_eq!(gm.board().hyp_count(), 1);
    }

    #[tokio::test]
    async fn backstories_consume_seed_facts_in_weight_order() {
        struct Greedy;

        #[async_trait]
        impl crate::workers::BackStory for Greedy {
            async fn handle_fact(
                &self,
                console: &mut BackStoryConsole,
                _fact: Fact,
            ) -> anyhow::Result<bool> {
                let mut memory = console.memory();
                let count = memory.entry("handled".to_string()).or_insert_with(|| json!(0));
                let next = count.as_i64().unwrap() + 1;
                *count = json!(next);
                Ok(true)
            }
        }

        struct Starved;

        #[async_trait]
        impl crate::workers::BackStory for Starved {
            async fn handle_fact(
                &self,
                console: &mut BackStoryConsole,
                _fact: Fact,
            ) -> anyhow::Result<bool> {
                console.memory().insert("handled".to_string(), json!(true));
                Ok(false)
            }
        }

        let mut gm = GameMaster::new(registry(), test_config()).unwrap();
        gm.register_backstory(
            BackStoryTemplate::new(form("Starved"), "ingest", Arc::new(Starved)).with_weight(5),
        )
        .unwrap();
        gm.register_backstory(
            BackStoryTemplate::new(form("Greedy"), "ingest", Arc::new(Greedy)).with_weight(1),
        )
        .unwrap();

        let mut seed = Fact::new(gm.registry(), "trigger").unwrap();
        seed.set("reason", "seeded").unwrap();
        gm.seed_facts(vec![seed]);
        gm.run().await.unwrap();

        let trackers = &gm.categories["ingest"];
        // Sorted by weight: Greedy first, and it consumes the fact.
        assert_eq!(trackers[0].name(), "Greedy");
        assert_eq!(
            trackers[0].memory.lock().unwrap()["handled"],
            json!(1)
        );
        assert!(trackers[1].memory.lock().unwrap().get("handled").is_none());
    }
}
