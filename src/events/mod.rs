//! Events published by the blackboard to the Game Master.
//!
//! Every committed mutation produces one [`PostEvent`] on an unbounded FIFO
//! channel owned by the scheduler. The event names the entry, not its
//! payload; consumers resolve the record through the store.

use serde::{Deserialize, Serialize};

use crate::board::entry::{EntryKind, EntryRef, Relations};

/// Notification that an entry was committed to a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostEvent {
    /// Monotonic emission sequence, assigned at commit.
    pub seq: u64,
    pub kind: EntryKind,
    /// Concrete fact type; `None` for objects.
    pub type_name: Option<String>,
    pub id: u64,
    /// Group memberships of the fact type, for interest matching.
    pub groups: Vec<String>,
    /// Parent lists carried by the entry at commit time.
    pub parents: Relations,
    /// True when an object add hit the dedup index. Interest dispatch skips
    /// deduped events by default; waiters still observe them.
    pub deduped: bool,
}

impl PostEvent {
    /// The `(kind, id)` pair this event announces.
    pub fn entry(&self) -> EntryRef {
        EntryRef::new(self.kind, self.id)
    }
}

/// Sender half of the store→scheduler event pipe.
pub type EventSender = tokio::sync::mpsc::UnboundedSender<PostEvent>;

/// Receiver half of the store→scheduler event pipe.
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<PostEvent>;

/// Create the event pipe.
pub fn event_channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}
