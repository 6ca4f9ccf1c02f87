//! Per-worker bookkeeping: clone records, state transitions and the
//! activity gauge the quiescence detector reads.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::board::EntryRef;
use crate::console::{CloneData, SharedMemory};
use crate::waits::ParkCallback;
use crate::workers::{BackStoryTemplate, NpcTemplate, PlayerTemplate};

/// Lifecycle of a clone: `Runnable → Running → {Waiting, Done}`, with
/// `Waiting → Running` on wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneState {
    Runnable,
    Running,
    Waiting,
    Done,
}

/// Shared gauge of outstanding work plus the transition log sequence.
///
/// `outstanding` counts work items that are neither finished nor parked:
/// spawned clones, queued NPC objects and queued seed facts. Quiescence
/// needs it at zero for a full grace window.
#[derive(Debug)]
pub struct ActivityMonitor {
    outstanding: AtomicUsize,
    transition_seq: AtomicU64,
    last_activity: Mutex<Instant>,
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityMonitor {
    pub fn new() -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            transition_seq: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Record activity; resets the grace window.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn begin_work(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    pub fn end_work(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.touch();
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// Next value of the monotonic transition sequence.
    pub fn next_seq(&self) -> u64 {
        self.transition_seq.fetch_add(1, Ordering::SeqCst)
    }
}

/// One live (or finished) clone of a player template.
#[derive(Debug)]
pub struct CloneRecord {
    pub serial: u64,
    pub trigger: EntryRef,
    pub data: CloneData,
    state: Mutex<CloneState>,
    error: Mutex<Option<String>>,
}

impl CloneRecord {
    pub fn new(serial: u64, trigger: EntryRef, data: CloneData) -> Self {
        Self {
            serial,
            trigger,
            data,
            state: Mutex::new(CloneState::Runnable),
            error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CloneState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: CloneState, identity: &str, monitor: &ActivityMonitor) {
        *self.state.lock().unwrap() = state;
        log::debug!("[{}] clone {identity} -> {state:?}", monitor.next_seq());
        monitor.touch();
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().unwrap().clone()
    }

    pub fn set_error(&self, error: String) {
        *self.error.lock().unwrap() = Some(error);
    }

    pub(crate) fn restore(
        serial: u64,
        trigger: EntryRef,
        data: CloneData,
        state: CloneState,
        error: Option<String>,
    ) -> Self {
        Self {
            serial,
            trigger,
            data,
            state: Mutex::new(state),
            error: Mutex::new(error),
        }
    }
}

/// Park hook for one clone: flips its state, releases the pool permit and
/// keeps the outstanding gauge honest while the clone blocks.
pub(crate) struct CloneParker {
    pub(crate) record: Arc<CloneRecord>,
    pub(crate) monitor: Arc<ActivityMonitor>,
    pub(crate) identity: String,
    pub(crate) limiter: Arc<Semaphore>,
    pub(crate) permit: Mutex<Option<tokio::sync::OwnedSemaphorePermit>>,
}

impl ParkCallback for CloneParker {
    fn park(&self) {
        // A parked clone gives its pool slot back so runnable clones are
        // never starved by waiters.
        self.permit.lock().unwrap().take();
        self.record
            .set_state(CloneState::Waiting, &self.identity, &self.monitor);
        self.monitor.end_work();
    }

    fn unpark(&self) {
        self.monitor.begin_work();
        self.record
            .set_state(CloneState::Running, &self.identity, &self.monitor);
        // Re-throttle opportunistically; a wake never blocks on the pool.
        if let Ok(permit) = self.limiter.clone().try_acquire_owned() {
            *self.permit.lock().unwrap() = Some(permit);
        }
    }
}

/// Tracker for a player template: clone serials, shared memory, runtime.
pub struct PlayerTracker {
    pub template: PlayerTemplate,
    pub memory: SharedMemory,
    serial_counter: AtomicU64,
    pub clones: Mutex<BTreeMap<u64, Arc<CloneRecord>>>,
    runtime: Mutex<Duration>,
}

impl PlayerTracker {
    pub fn new(template: PlayerTemplate) -> Self {
        Self {
            template,
            memory: Arc::new(Mutex::new(BTreeMap::new())),
            serial_counter: AtomicU64::new(0),
            clones: Mutex::new(BTreeMap::new()),
            runtime: Mutex::new(Duration::ZERO),
        }
    }

    pub fn name(&self) -> &str {
        &self.template.registration.name
    }

    pub fn next_serial(&self) -> u64 {
        self.serial_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn serial_counter(&self) -> u64 {
        self.serial_counter.load(Ordering::SeqCst)
    }

    pub(crate) fn set_serial_counter(&self, value: u64) {
        self.serial_counter.store(value, Ordering::SeqCst);
    }

    pub fn insert_clone(&self, record: Arc<CloneRecord>) {
        self.clones.lock().unwrap().insert(record.serial, record);
    }

    pub fn clone_record(&self, serial: u64) -> Option<Arc<CloneRecord>> {
        self.clones.lock().unwrap().get(&serial).cloned()
    }

    /// Number of clones ever spawned for this template.
    pub fn clone_count(&self) -> usize {
        self.clones.lock().unwrap().len()
    }

    pub fn add_runtime(&self, elapsed: Duration) {
        *self.runtime.lock().unwrap() += elapsed;
    }

    pub fn runtime(&self) -> Duration {
        *self.runtime.lock().unwrap()
    }
}

/// Tracker for a single-instance NPC.
pub struct NpcTracker {
    pub template: NpcTemplate,
    pub memory: SharedMemory,
    state: Mutex<CloneState>,
    runtime: Mutex<Duration>,
    /// Objects handled so far; diagnostic only.
    handled: AtomicU64,
}

impl NpcTracker {
    pub fn new(template: NpcTemplate) -> Self {
        Self {
            template,
            memory: Arc::new(Mutex::new(BTreeMap::new())),
            state: Mutex::new(CloneState::Runnable),
            runtime: Mutex::new(Duration::ZERO),
            handled: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.template.registration.name
    }

    pub fn state(&self) -> CloneState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: CloneState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn add_runtime(&self, elapsed: Duration) {
        *self.runtime.lock().unwrap() += elapsed;
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn runtime(&self) -> Duration {
        *self.runtime.lock().unwrap()
    }

    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }
}

/// Tracker for a single-instance BackStory.
pub struct BackStoryTracker {
    pub template: BackStoryTemplate,
    pub memory: SharedMemory,
    /// Effective weight after config overrides.
    pub weight: i64,
    runtime: Mutex<Duration>,
}

impl BackStoryTracker {
    pub fn new(template: BackStoryTemplate) -> Self {
        let weight = template.default_weight;
        Self {
            template,
            memory: Arc::new(Mutex::new(BTreeMap::new())),
            weight,
            runtime: Mutex::new(Duration::ZERO),
        }
    }

    pub fn name(&self) -> &str {
        &self.template.registration.name
    }

    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    pub fn add_runtime(&self, elapsed: Duration) {
        *self.runtime.lock().unwrap() += elapsed;
    }

    pub fn runtime(&self) -> Duration {
        *self.runtime.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_counts_outstanding_work() {
        let monitor = ActivityMonitor::new();
        assert_eq!(monitor.outstanding(), 0);
        monitor.begin_work();
        monitor.begin_work();
        assert_eq!(monitor.outstanding(), 2);
        monitor.end_work();
        assert_eq!(monitor.outstanding(), 1);
    }

    #[test]
    fn transition_sequence_is_monotonic() {
        let monitor = ActivityMonitor::new();
        let first = monitor.next_seq();
        let second = monitor.next_seq();
        assert!(second > first);
    }

    #[test]
    fn clone_record_tracks_state_and_error() {
        let monitor = ActivityMonitor::new();
        let record = CloneRecord::new(
            0,
            EntryRef::fact(1),
            Arc::new(Mutex::new(BTreeMap::new())),
        );
        assert_eq!(record.state(), CloneState::Runnable);
        record.set_state(CloneState::Running, "P-0", &monitor);
        record.set_state(CloneState::Done, "P-0", &monitor);
        assert_eq!(record.state(), CloneState::Done);
        assert!(record.error().is_none());
        record.set_error("boom".into());
        assert_eq!(record.error().as_deref(), Some("boom"));
    }

    #[test]
    fn player_tracker_hands_out_dense_serials() {
        struct NullPlayer;

        #[async_trait::async_trait]
        impl crate::workers::Player for NullPlayer {
            async fn handle_fact(
                &self,
                _console: &mut crate::console::PlayerConsole,
                _fact: crate::facts::Fact,
            ) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let registration = crate::registration::RegistrationForm::new(
            "P", "d", "c", "1.0", "0.1",
        )
        .unwrap();
        let template = PlayerTemplate::new(registration, Arc::new(|| Box::new(NullPlayer)));
        let tracker = PlayerTracker::new(template);
        assert_eq!(tracker.next_serial(), 0);
        assert_eq!(tracker.next_serial(), 1);
        assert_eq!(tracker.serial_counter(), 2);
    }
}
