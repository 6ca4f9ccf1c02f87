//! Configuration document types.
//!
//! The external driver owns file I/O and argument parsing; the engine fixes
//! the document shape. A configuration carries the engine section under the
//! top-level `d20` key, a `common` bag injected into every component, and
//! per-kind sections mapping component names to option bags.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::temporary::TEMPORARY_DEFAULT;

/// Engine section of the configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Extra component search paths, consumed by the external loader.
    #[serde(rename = "extra-players", alias = "extra_players")]
    pub extra_players: Vec<String>,
    #[serde(rename = "extra-npcs", alias = "extra_npcs")]
    pub extra_npcs: Vec<String>,
    #[serde(rename = "extra-backstories", alias = "extra_backstories")]
    pub extra_backstories: Vec<String>,
    #[serde(rename = "extra-screens", alias = "extra_screens")]
    pub extra_screens: Vec<String>,
    #[serde(rename = "extra-facts", alias = "extra_facts")]
    pub extra_facts: Vec<String>,

    /// Seconds the Game Master waits on an idle board before declaring
    /// quiescence. Zero is allowed but may race in-flight events.
    #[serde(rename = "graceTime")]
    pub grace_time: u64,

    /// Wall-clock cap on the whole game in seconds; zero means unlimited.
    #[serde(rename = "maxGameTime")]
    pub max_game_time: u64,

    /// Base directory for temporary files.
    pub temporary: PathBuf,

    /// Upper bound on concurrently running clones; zero means one per
    /// logical CPU.
    pub parallelism: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            extra_players: Vec::new(),
            extra_npcs: Vec::new(),
            extra_backstories: Vec::new(),
            extra_screens: Vec::new(),
            extra_facts: Vec::new(),
            grace_time: 1,
            max_game_time: 0,
            temporary: PathBuf::from(TEMPORARY_DEFAULT),
            parallelism: 0,
        }
    }
}

impl CoreConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_time)
    }

    pub fn max_game(&self) -> Option<Duration> {
        (self.max_game_time > 0).then(|| Duration::from_secs(self.max_game_time))
    }

    /// Effective clone parallelism.
    pub fn effective_parallelism(&self) -> usize {
        if self.parallelism > 0 {
            self.parallelism
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// Option bag for one component.
pub type OptionBag = BTreeMap<String, Value>;

/// The full configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub d20: CoreConfig,
    /// Options injected into every component.
    pub common: OptionBag,
    #[serde(rename = "NPCS")]
    pub npcs: BTreeMap<String, OptionBag>,
    #[serde(rename = "Players")]
    pub players: BTreeMap<String, OptionBag>,
    #[serde(rename = "BackStories")]
    pub backstories: BTreeMap<String, OptionBag>,
    #[serde(rename = "Actions")]
    pub actions: BTreeMap<String, OptionBag>,
    #[serde(rename = "Screens")]
    pub screens: BTreeMap<String, OptionBag>,
}

impl Configuration {
    /// Parse a YAML configuration document.
    pub fn from_yaml(document: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(document)
    }

    /// Options for one component of a section, with `common` merged under
    /// the component's own options (the component wins on conflicts).
    pub fn entity_options(
        section: &BTreeMap<String, OptionBag>,
        common: &OptionBag,
        name: &str,
    ) -> OptionBag {
        let mut merged = common.clone();
        if let Some(own) = section.get(name) {
            for (key, value) in own {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    pub fn npc_options(&self, name: &str) -> OptionBag {
        Self::entity_options(&self.npcs, &self.common, name)
    }

    pub fn player_options(&self, name: &str) -> OptionBag {
        Self::entity_options(&self.players, &self.common, name)
    }

    pub fn backstory_options(&self, name: &str) -> OptionBag {
        Self::entity_options(&self.backstories, &self.common, name)
    }

    pub fn screen_options(&self, name: &str) -> OptionBag {
        Self::entity_options(&self.screens, &self.common, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Configuration::default();
        assert_eq!(config.d20.grace_time, 1);
        assert_eq!(config.d20.max_game_time, 0);
        assert!(config.d20.max_game().is_none());
        assert!(config.d20.effective_parallelism() >= 1);
        assert_eq!(config.d20.temporary, PathBuf::from(TEMPORARY_DEFAULT));
    }

    #[test]
    fn parses_the_documented_yaml_shape() {
        let document = r#"
d20:
  graceTime: 3
  maxGameTime: 60
  temporary: /tmp/analysis
  extra-players:
    - /opt/players
common:
  http_proxy: http://proxy:3128
Players:
  HashPlayer:
    threshold: 5
Screens:
  json:
    exclude: [objects]
"#;
        let config = Configuration::from_yaml(document).unwrap();
        assert_eq!(config.d20.grace_time, 3);
        assert_eq!(config.d20.max_game(), Some(Duration::from_secs(60)));
        assert_eq!(config.d20.extra_players, ["/opt/players"]);
        assert_eq!(config.common["http_proxy"], "http://proxy:3128");
        assert_eq!(config.players["HashPlayer"]["threshold"], 5);
        assert!(config.screens.contains_key("json"));
    }

    #[test]
    fn component_options_override_common() {
        let document = r#"
common:
  timeout: 10
  http_proxy: http://proxy:3128
Players:
  HashPlayer:
    timeout: 30
"#;
        let config = Configuration::from_yaml(document).unwrap();
        let options = config.player_options("HashPlayer");
        assert_eq!(options["timeout"], 30);
        assert_eq!(options["http_proxy"], "http://proxy:3128");

        // A component without its own section still gets common.
        let options = config.npc_options("HashNPC");
        assert_eq!(options["timeout"], 10);
    }
}
