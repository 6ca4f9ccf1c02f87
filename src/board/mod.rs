//! The blackboard: the shared store of objects, facts and hypotheses.
//!
//! Entries live in arena-style tables indexed by dense ids; parent/child
//! edges are id lists resolved through the store, never owning references,
//! so the cyclic relationship graph stays safe to traverse.

pub mod entry;
pub mod object;
pub(crate) mod table;
pub mod store;

pub use entry::{EntryKind, EntryRef, Relations};
pub use object::{digest_bytes, ObjectRecord};
pub use store::{Blackboard, Posted, ScanFilter};
