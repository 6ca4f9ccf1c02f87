//! # d20
//!
//! An analyst-assistance framework that decomposes a binary artifact (or
//! seeded context) into knowledge through cooperating, event-driven workers.
//! A central blackboard holds objects, facts and hypotheses; the Game Master
//! clones interested workers whenever a new entry matches their declared
//! interests, and the game ends when no worker can make further progress.

pub mod board;
pub mod config;
pub mod console;
pub mod events;
pub mod facts;
pub mod interest;
pub mod registration;
pub mod scheduler;
pub mod screens;
pub mod snapshot;
pub mod temporary;
pub mod utilities;
pub mod version;
pub mod waits;
pub mod workers;

pub use board::{Blackboard, EntryKind, EntryRef, ObjectRecord, Posted, Relations};
pub use config::Configuration;
pub use console::{BackStoryConsole, NpcConsole, PlayerConsole};
pub use facts::{
    register_builtin_types, Fact, FactRegistry, FactTypeDescriptor, FieldKind, FieldSpec,
    FieldValue,
};
pub use registration::{InterestDecl, RegistrationForm};
pub use scheduler::GameMaster;
pub use snapshot::Snapshot;
pub use utilities::errors::{
    BoardError, EngineError, RegistrationError, SnapshotError, WaitError,
};
pub use version::{Version, GAME_ENGINE_VERSION_RAW};
pub use workers::{BackStory, BackStoryTemplate, Npc, NpcTemplate, Player, PlayerTemplate};
