//! Worker declaration contract.
//!
//! Every NPC, Player and BackStory announces itself through a
//! [`RegistrationForm`]: identity, versions and the interests that drive its
//! scheduling. Interest names may be concrete fact types or fact groups;
//! expansion happens when the worker is registered with the Game Master and
//! is not revisited if the type registry changes afterwards.

use serde::{Deserialize, Serialize};

use crate::version::{game_engine_version, Version};
use crate::utilities::errors::RegistrationError;

/// Interests as declared by a worker: either a flat list of fact type/group
/// names, or separate lists for facts and hyps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InterestDecl {
    Flat(Vec<String>),
    Split {
        #[serde(default)]
        facts: Vec<String>,
        #[serde(default)]
        hyps: Vec<String>,
    },
}

impl Default for InterestDecl {
    fn default() -> Self {
        Self::Flat(Vec::new())
    }
}

impl InterestDecl {
    /// Fact-side interest names (unexpanded).
    pub fn fact_names(&self) -> &[String] {
        match self {
            Self::Flat(names) => names,
            Self::Split { facts, .. } => facts,
        }
    }

    /// Hyp-side interest names (unexpanded).
    pub fn hyp_names(&self) -> &[String] {
        match self {
            Self::Flat(_) => &[],
            Self::Split { hyps, .. } => hyps,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fact_names().is_empty() && self.hyp_names().is_empty()
    }
}

/// Metadata announced by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationForm {
    pub name: String,
    pub description: String,
    pub creator: String,
    pub version: Version,
    /// Engine version the worker was written against; the worker loads iff
    /// this is not newer than the running engine.
    pub engine_version: Version,
    #[serde(default)]
    pub interests: InterestDecl,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

impl RegistrationForm {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        creator: impl Into<String>,
        version: &str,
        engine_version: &str,
    ) -> Result<Self, RegistrationError> {
        Ok(Self {
            name: name.into(),
            description: description.into(),
            creator: creator.into(),
            version: version.parse()?,
            engine_version: engine_version.parse()?,
            interests: InterestDecl::default(),
            help: None,
        })
    }

    pub fn with_interests(mut self, interests: impl IntoIterator<Item = String>) -> Self {
        self.interests = InterestDecl::Flat(interests.into_iter().collect());
        self
    }

    pub fn with_split_interests(
        mut self,
        facts: impl IntoIterator<Item = String>,
        hyps: impl IntoIterator<Item = String>,
    ) -> Self {
        self.interests = InterestDecl::Split {
            facts: facts.into_iter().collect(),
            hyps: hyps.into_iter().collect(),
        };
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Reject workers written against a newer engine than the one running.
    pub fn check_engine_version(&self) -> Result<(), RegistrationError> {
        let running = game_engine_version();
        if self.engine_version > running {
            return Err(RegistrationError::IncompatibleEngine {
                name: self.name.clone(),
                required: self.engine_version.to_string(),
                running: running.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_interests_are_fact_side_only() {
        let form = RegistrationForm::new("HashPlayer", "hashes things", "tester", "1.0", "0.1")
            .unwrap()
            .with_interests(["hash".to_string()]);
        assert_eq!(form.interests.fact_names(), ["hash"]);
        assert!(form.interests.hyp_names().is_empty());
    }

    #[test]
    fn split_interests_carry_both_sides() {
        let form = RegistrationForm::new("M", "d", "c", "1.0", "0.1")
            .unwrap()
            .with_split_interests(["md5".to_string()], ["mimetype".to_string()]);
        assert_eq!(form.interests.fact_names(), ["md5"]);
        assert_eq!(form.interests.hyp_names(), ["mimetype"]);
        assert!(!form.interests.is_empty());
    }

    #[test]
    fn future_engine_version_is_rejected() {
        let form = RegistrationForm::new("TooNew", "d", "c", "1.0", "99.0").unwrap();
        assert!(matches!(
            form.check_engine_version().unwrap_err(),
            RegistrationError::IncompatibleEngine { .. }
        ));
    }

    #[test]
    fn current_engine_version_is_accepted() {
        let form =
            RegistrationForm::new("Fine", "d", "c", "1.0", crate::version::GAME_ENGINE_VERSION_RAW)
                .unwrap();
        assert!(form.check_engine_version().is_ok());
    }

    #[test]
    fn bad_version_strings_fail_construction() {
        assert!(RegistrationForm::new("X", "d", "c", "one.two", "0.1").is_err());
    }

    #[test]
    fn interest_decl_deserializes_both_shapes() {
        let flat: InterestDecl = serde_json::from_str(r#"["hash", "mimetype"]"#).unwrap();
        assert_eq!(flat.fact_names().len(), 2);
        let split: InterestDecl =
            serde_json::from_str(r#"{"facts": ["hash"], "hyps": ["mimetype"]}"#).unwrap();
        assert_eq!(split.hyp_names(), ["mimetype"]);
    }
}
