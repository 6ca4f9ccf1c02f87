//! The wait registry: parked predicates over future blackboard entries.
//!
//! A waiter subscribes with a [`ScanFilter`]; the historical backlog is
//! emitted first, atomically under the table read locks, and a watermark (the
//! table's next id at subscription time) guarantees each later commit is
//! delivered exactly once and in id order. Cancellation closes the sink, so
//! a parked consumer observes [`WaitError::Cancelled`] at its next park
//! point.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::board::{Blackboard, EntryRef, Posted, ScanFilter};
use crate::events::PostEvent;
use crate::utilities::errors::{BoardError, WaitError};

/// Identity of the clone that owns a parked wait; carried into snapshots so
/// a load can re-arm the predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitOwner {
    /// Template name of the owning clone.
    pub template: String,
    /// Clone serial within the template.
    pub serial: u64,
    /// The entry that triggered the owning clone.
    pub trigger: EntryRef,
}

/// A parked predicate restored from a snapshot. When a matching entry
/// arrives the owning clone is restarted from its trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkedWait {
    pub owner: WaitOwner,
    pub filter: ScanFilter,
}

/// Hook invoked around the blocking section of a wait, so the scheduler can
/// track parked clones for quiescence.
pub trait ParkCallback: Send + Sync {
    fn park(&self);
    fn unpark(&self);
}

struct Waiter {
    owner: WaitOwner,
    filter: ScanFilter,
    /// Lowest live entry id this waiter may receive; everything below was
    /// covered by the backlog scan.
    watermark: AtomicU64,
    sink: mpsc::UnboundedSender<Posted>,
    single_shot: bool,
}

/// Registry of live waiters plus predicates restored from a save.
pub struct WaitRegistry {
    waiters: Mutex<Vec<Arc<Waiter>>>,
    restored: Mutex<Vec<ParkedWait>>,
    cancelled: AtomicBool,
}

impl Default for WaitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
            restored: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Subscribe to every current and future entry matching `filter`.
    ///
    /// Fails fast with `NotFound` when the filter names a parent entry that
    /// does not exist.
    pub fn subscribe(
        &self,
        board: &Blackboard,
        owner: WaitOwner,
        filter: ScanFilter,
    ) -> Result<EntryStream, BoardError> {
        let (tx, rx) = mpsc::unbounded_channel();

        if self.cancelled.load(Ordering::SeqCst) {
            // Stream is born closed; the consumer sees Cancelled immediately.
            drop(tx);
            return Ok(EntryStream { rx, park: None });
        }

        let scan = filter.clone();
        board.scan_and_register(&scan, |backlog, next_id| {
            for posted in backlog {
                let _ = tx.send(posted);
            }
            let waiter = Arc::new(Waiter {
                owner,
                filter,
                watermark: AtomicU64::new(next_id),
                sink: tx,
                single_shot: false,
            });
            self.waiters.lock().unwrap().push(waiter);
        })?;

        Ok(EntryStream { rx, park: None })
    }

    /// Subscribe for exactly one entry matching `filter`.
    ///
    /// If the backlog already holds a match, the pending wait resolves
    /// without parking.
    pub fn subscribe_once(
        &self,
        board: &Blackboard,
        owner: WaitOwner,
        filter: ScanFilter,
    ) -> Result<PendingWait, BoardError> {
        let (tx, rx) = mpsc::unbounded_channel();

        if self.cancelled.load(Ordering::SeqCst) {
            drop(tx);
            return Ok(PendingWait { rx, park: None });
        }

        let scan = filter.clone();
        board.scan_and_register(&scan, |backlog, next_id| {
            if let Some(first) = backlog.into_iter().next() {
                // Resolved from history; no waiter parked.
                let _ = tx.send(first);
                return;
            }
            let waiter = Arc::new(Waiter {
                owner,
                filter,
                watermark: AtomicU64::new(next_id),
                sink: tx,
                single_shot: true,
            });
            self.waiters.lock().unwrap().push(waiter);
        })?;

        Ok(PendingWait { rx, park: None })
    }

    /// Deliver a committed entry to every matching waiter, exactly once each.
    pub fn notify(&self, event: &PostEvent, posted: &Posted) {
        let mut waiters = self.waiters.lock().unwrap();
        waiters.retain(|waiter| {
            if !waiter.filter.matches_event(event) {
                return !waiter.sink.is_closed();
            }
            if event.id < waiter.watermark.load(Ordering::SeqCst) {
                // Already covered by this waiter's backlog scan.
                return true;
            }
            if waiter.sink.send(posted.clone()).is_err() {
                return false;
            }
            !waiter.single_shot
        });
    }

    /// Number of currently parked waiters.
    pub fn parked_count(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }

    /// Close every waiter sink; consumers observe `Cancelled` at their next
    /// park point. Further subscriptions are born closed.
    pub fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let drained = {
            let mut waiters = self.waiters.lock().unwrap();
            std::mem::take(&mut *waiters)
        };
        if !drained.is_empty() {
            log::debug!("cancelling {} parked waiter(s)", drained.len());
        }
        // Dropping the waiters drops their sinks.
    }

    /// Predicates of every currently parked waiter, for the snapshot.
    ///
    /// The watermark folds into `since_id` so a re-armed predicate does not
    /// re-match entries the waiter already observed.
    pub fn parked_predicates(&self) -> Vec<ParkedWait> {
        let waiters = self.waiters.lock().unwrap();
        waiters
            .iter()
            .map(|waiter| {
                let watermark = waiter.watermark.load(Ordering::SeqCst);
                let mut filter = waiter.filter.clone();
                if watermark > 0 {
                    let floor = watermark - 1;
                    filter.since_id = Some(filter.since_id.map_or(floor, |s| s.max(floor)));
                }
                ParkedWait {
                    owner: waiter.owner.clone(),
                    filter,
                }
            })
            .collect()
    }

    /// Re-arm predicates restored from a snapshot.
    pub fn restore_parked(&self, parked: Vec<ParkedWait>) {
        self.restored.lock().unwrap().extend(parked);
    }

    /// Remove and return restored predicates matching `event`.
    pub fn drain_restored_matches(&self, event: &PostEvent) -> Vec<ParkedWait> {
        let mut restored = self.restored.lock().unwrap();
        let mut matches = Vec::new();
        restored.retain(|parked| {
            if parked.filter.matches_event(event) {
                matches.push(parked.clone());
                false
            } else {
                true
            }
        });
        matches
    }

    /// Restored predicates still pending, for re-saving.
    pub fn restored_predicates(&self) -> Vec<ParkedWait> {
        self.restored.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for WaitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitRegistry")
            .field("parked", &self.parked_count())
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .finish()
    }
}

/// Lazy sequence of matching entries: backlog first, then live commits,
/// ending with `Cancelled` when the game quiesces.
pub struct EntryStream {
    rx: mpsc::UnboundedReceiver<Posted>,
    park: Option<Arc<dyn ParkCallback>>,
}

impl std::fmt::Debug for EntryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStream").finish()
    }
}

impl EntryStream {
    /// Attach a park/unpark hook around the blocking section.
    pub fn with_park(mut self, park: Arc<dyn ParkCallback>) -> Self {
        self.park = Some(park);
        self
    }

    /// Next matching entry; `Err(Cancelled)` once the registry shuts down.
    pub async fn next(&mut self) -> Result<Posted, WaitError> {
        if let Ok(posted) = self.rx.try_recv() {
            return Ok(posted);
        }
        if let Some(park) = &self.park {
            park.park();
        }
        let received = self.rx.recv().await;
        if let Some(park) = &self.park {
            park.unpark();
        }
        received.ok_or(WaitError::Cancelled)
    }
}

/// A single-entry wait, optionally bounded by a timeout.
pub struct PendingWait {
    rx: mpsc::UnboundedReceiver<Posted>,
    park: Option<Arc<dyn ParkCallback>>,
}

impl PendingWait {
    pub fn with_park(mut self, park: Arc<dyn ParkCallback>) -> Self {
        self.park = Some(park);
        self
    }

    /// Resolve the wait. `timeout` of zero fires `Timeout` unless a backlog
    /// match was found at subscription.
    pub async fn recv(mut self, timeout: Option<Duration>) -> Result<Posted, WaitError> {
        if let Ok(posted) = self.rx.try_recv() {
            return Ok(posted);
        }
        if let Some(park) = &self.park {
            park.park();
        }
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.rx.recv()).await {
                Ok(received) => received.ok_or(WaitError::Cancelled),
                Err(_) => Err(WaitError::Timeout),
            },
            None => self.rx.recv().await.ok_or(WaitError::Cancelled),
        };
        if let Some(park) = &self.park {
            park.unpark();
        }
        outcome
    }
}
