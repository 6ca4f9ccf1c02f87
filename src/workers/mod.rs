//! Worker traits and templates.
//!
//! Three worker kinds react to blackboard activity: NPCs consume every new
//! object (single instance, fed serially), Players are cloned per matching
//! fact/hyp event, and BackStories consume seed facts (single instance,
//! grouped into weighted categories). Implementations return
//! `anyhow::Result`; a wait primitive's `Cancelled` error must be propagated
//! out, not caught.

use std::sync::Arc;

use async_trait::async_trait;

use crate::board::ObjectRecord;
use crate::console::{BackStoryConsole, NpcConsole, PlayerConsole};
use crate::facts::Fact;
use crate::registration::RegistrationForm;

/// Object-reactive worker. One instance per game; objects are delivered
/// serially in arrival order.
#[async_trait]
pub trait Npc: Send + Sync {
    async fn handle_object(&self, console: &mut NpcConsole, object: ObjectRecord)
        -> anyhow::Result<()>;
}

/// Fact/hyp-reactive worker. A fresh instance is constructed for every
/// matching entry.
#[async_trait]
pub trait Player: Send + Sync {
    async fn handle_fact(&self, console: &mut PlayerConsole, fact: Fact) -> anyhow::Result<()>;

    /// Invoked for hyp-side interests. Defaults to a no-op so fact-only
    /// players need not implement it.
    async fn handle_hyp(&self, console: &mut PlayerConsole, hyp: Fact) -> anyhow::Result<()> {
        let _ = (console, hyp);
        Ok(())
    }
}

/// Seed-fact-reactive worker. One instance per game; returns `true` to
/// consume the fact and short-circuit the rest of its category.
#[async_trait]
pub trait BackStory: Send + Sync {
    async fn handle_fact(&self, console: &mut BackStoryConsole, fact: Fact)
        -> anyhow::Result<bool>;
}

/// Constructor for per-clone player instances.
pub type PlayerCtor = Arc<dyn Fn() -> Box<dyn Player> + Send + Sync>;

/// Template for an NPC: declaration plus its single instance.
pub struct NpcTemplate {
    pub registration: RegistrationForm,
    pub instance: Arc<dyn Npc>,
}

impl NpcTemplate {
    pub fn new(registration: RegistrationForm, instance: Arc<dyn Npc>) -> Self {
        Self {
            registration,
            instance,
        }
    }
}

/// Template for a Player: declaration plus a constructor invoked per clone.
pub struct PlayerTemplate {
    pub registration: RegistrationForm,
    pub ctor: PlayerCtor,
}

impl PlayerTemplate {
    pub fn new(registration: RegistrationForm, ctor: PlayerCtor) -> Self {
        Self { registration, ctor }
    }
}

/// Template for a BackStory: declaration, category and weight, plus its
/// single instance.
pub struct BackStoryTemplate {
    pub registration: RegistrationForm,
    pub category: String,
    /// Position within the category; lower weights are offered seed facts
    /// first. Config may override this default.
    pub default_weight: i64,
    pub instance: Arc<dyn BackStory>,
}

impl BackStoryTemplate {
    pub fn new(
        registration: RegistrationForm,
        category: impl Into<String>,
        instance: Arc<dyn BackStory>,
    ) -> Self {
        Self {
            registration,
            category: category.into(),
            default_weight: 1,
            instance,
        }
    }

    pub fn with_weight(mut self, weight: i64) -> Self {
        self.default_weight = weight;
        self
    }
}

impl std::fmt::Debug for NpcTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NpcTemplate")
            .field("name", &self.registration.name)
            .finish()
    }
}

impl std::fmt::Debug for PlayerTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerTemplate")
            .field("name", &self.registration.name)
            .finish()
    }
}

impl std::fmt::Debug for BackStoryTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackStoryTemplate")
            .field("name", &self.registration.name)
            .field("category", &self.category)
            .field("weight", &self.default_weight)
            .finish()
    }
}
