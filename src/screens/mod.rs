//! Output renderers ("screens") over a finished game's blackboard.
//!
//! A screen filters the three tables into a structured value and presents a
//! printable string. Stock screens render JSON and YAML; the driver picks
//! one by name from the registry.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::board::{Blackboard, EntryKind, Posted};
use crate::config::OptionBag;
use crate::facts::{Fact, FieldValue};

/// A renderer over the blackboard.
pub trait Screen: Send + Sync {
    /// Structured view of the game data, trimmed per configuration.
    fn filter(&self, board: &Blackboard) -> Value;

    /// Printable rendition; by convention built from [`filter`](Self::filter).
    fn present(&self, board: &Blackboard) -> String;
}

/// Render bytes as UTF-8 when printable, hex otherwise.
fn bytes_to_value(bytes: &[u8]) -> Value {
    match std::str::from_utf8(bytes) {
        Ok(text) if text.chars().all(|c| !c.is_control()) => Value::from(text),
        _ => Value::from(format!("0x{}", hex_string(bytes))),
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn field_to_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::String(s) => Value::from(s.clone()),
        FieldValue::Bytes(b) => bytes_to_value(b),
        FieldValue::Bool(b) => Value::from(*b),
        FieldValue::Int(i) => Value::from(*i),
        FieldValue::Float(f) => Value::from(*f),
        FieldValue::Dict(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), field_to_value(v)))
                .collect(),
        ),
        FieldValue::List(items) => Value::Array(items.iter().map(field_to_value).collect()),
    }
}

fn fact_to_value(fact: &Fact, include_core: bool) -> Value {
    let mut map = Map::new();
    for (name, value) in fact.fields() {
        map.insert(name.clone(), field_to_value(value));
    }
    if include_core {
        map.insert("id".into(), json!(fact.id()));
        map.insert("creator".into(), json!(fact.creator()));
        map.insert("tainted".into(), json!(fact.tainted()));
    }
    Value::Object(map)
}

/// Group records of one kind by type, applying exclusions.
fn records_by_type(
    board: &Blackboard,
    kind: EntryKind,
    exclude: &[String],
    include_core: bool,
) -> Value {
    let mut by_type: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for posted in board.list(kind, None) {
        if let Posted::Fact(fact) | Posted::Hyp(fact) = posted {
            let type_name = fact.fact_type().to_string();
            if exclude.iter().any(|e| type_name.contains(e.as_str())) {
                continue;
            }
            by_type
                .entry(type_name)
                .or_default()
                .push(fact_to_value(&fact, include_core));
        }
    }
    json!(by_type)
}

/// The shared filter behind the stock screens.
fn game_data(board: &Blackboard, options: &ScreenOptions) -> Value {
    let mut root = Map::new();
    if !options.exclude_objects {
        let objects: Vec<Value> = board
            .all_objects()
            .iter()
            .map(|object| {
                json!({
                    "id": object.id(),
                    "hash": object.hash(),
                    "size": object.size(),
                    "data": bytes_to_value(object.data()),
                    "metadata": object.metadata(),
                    "creator": object.creator(),
                })
            })
            .collect();
        root.insert("objects".into(), Value::Array(objects));
    }
    root.insert(
        "facts".into(),
        records_by_type(board, EntryKind::Fact, &options.exclude, options.include_core_facts),
    );
    root.insert(
        "hyps".into(),
        records_by_type(board, EntryKind::Hyp, &options.exclude, options.include_core_facts),
    );
    Value::Object(root)
}

/// Options shared by the stock screens.
#[derive(Debug, Clone, Default)]
pub struct ScreenOptions {
    /// Fact type substrings to leave out.
    pub exclude: Vec<String>,
    pub exclude_objects: bool,
    pub include_core_facts: bool,
}

impl ScreenOptions {
    /// Build from a configuration option bag.
    pub fn from_options(options: &OptionBag) -> Self {
        let exclude = options
            .get("exclude")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            exclude,
            exclude_objects: options
                .get("exclude_objects")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            include_core_facts: options
                .get("include_core_facts")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

/// JSON renderer.
#[derive(Debug, Clone, Default)]
pub struct JsonScreen {
    pub options: ScreenOptions,
}

impl JsonScreen {
    pub fn new(options: ScreenOptions) -> Self {
        Self { options }
    }
}

impl Screen for JsonScreen {
    fn filter(&self, board: &Blackboard) -> Value {
        game_data(board, &self.options)
    }

    fn present(&self, board: &Blackboard) -> String {
        serde_json::to_string_pretty(&self.filter(board)).unwrap_or_else(|error| {
            log::error!("error serializing game data to JSON: {error}");
            String::new()
        })
    }
}

/// YAML renderer.
#[derive(Debug, Clone, Default)]
pub struct YamlScreen {
    pub options: ScreenOptions,
}

impl YamlScreen {
    pub fn new(options: ScreenOptions) -> Self {
        Self { options }
    }
}

impl Screen for YamlScreen {
    fn filter(&self, board: &Blackboard) -> Value {
        game_data(board, &self.options)
    }

    fn present(&self, board: &Blackboard) -> String {
        serde_yaml::to_string(&self.filter(board)).unwrap_or_else(|error| {
            log::error!("error serializing game data to YAML: {error}");
            String::new()
        })
    }
}

/// Screen registry keyed by name, with the stock screens preloaded.
pub fn stock_screens(options: &ScreenOptions) -> BTreeMap<String, Box<dyn Screen>> {
    let mut screens: BTreeMap<String, Box<dyn Screen>> = BTreeMap::new();
    screens.insert("json".into(), Box::new(JsonScreen::new(options.clone())));
    screens.insert("yaml".into(), Box::new(YamlScreen::new(options.clone())));
    screens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::Relations;
    use crate::events::event_channel;
    use crate::facts::{register_builtin_types, FactRegistry};
    use std::sync::Arc;

    fn populated_board() -> Arc<Blackboard> {
        let mut registry = FactRegistry::new();
        register_builtin_types(&mut registry).unwrap();
        let (tx, _rx) = event_channel();
        let board = Arc::new(Blackboard::new(Arc::new(registry), tx));
        let (object_id, _) = board
            .add_object(
                b"abc".to_vec(),
                "GameMaster",
                Relations::new(),
                std::collections::BTreeMap::new(),
            )
            .unwrap();
        let mut fact = Fact::new(board.registry(), "md5").unwrap();
        fact.set("value", "900150983cd24fb0d6963f7d28e17f72").unwrap();
        fact.add_parent_object(object_id).unwrap();
        board.add_fact(&mut fact, "HashNPC").unwrap();
        let mut hyp = Fact::new(board.registry(), "mimetype").unwrap();
        hyp.set("mimetype", "text/plain").unwrap();
        hyp.add_parent_object(object_id).unwrap();
        board.add_hyp(&mut hyp, "Guesser").unwrap();
        board
    }

    #[test]
    fn json_screen_groups_by_type() {
        let board = populated_board();
        let screen = JsonScreen::default();
        let data = screen.filter(&board);
        assert_eq!(data["objects"][0]["data"], "abc");
        assert_eq!(
            data["facts"]["md5"][0]["value"],
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(data["hyps"]["mimetype"][0]["mimetype"], "text/plain");
        let printable = screen.present(&board);
        assert!(printable.contains("md5"));
    }

    #[test]
    fn exclusions_trim_types_and_objects() {
        let board = populated_board();
        let screen = JsonScreen::new(ScreenOptions {
            exclude: vec!["md5".into()],
            exclude_objects: true,
            include_core_facts: false,
        });
        let data = screen.filter(&board);
        assert!(data.get("objects").is_none());
        assert!(data["facts"].as_object().unwrap().get("md5").is_none());
        assert!(data["hyps"].as_object().unwrap().get("mimetype").is_some());
    }

    #[test]
    fn core_facts_appear_on_request() {
        let board = populated_board();
        let screen = JsonScreen::new(ScreenOptions {
            include_core_facts: true,
            ..Default::default()
        });
        let data = screen.filter(&board);
        assert_eq!(data["facts"]["md5"][0]["creator"], "HashNPC");
        assert_eq!(data["facts"]["md5"][0]["tainted"], false);
    }

    #[test]
    fn unprintable_bytes_render_as_hex() {
        assert_eq!(bytes_to_value(b"hello"), Value::from("hello"));
        assert_eq!(bytes_to_value(&[0x00, 0x90]), Value::from("0x0090"));
    }

    #[test]
    fn yaml_screen_renders_the_same_filter() {
        let board = populated_board();
        let screen = YamlScreen::default();
        let printable = screen.present(&board);
        assert!(printable.contains("mimetype: text/plain"));
    }

    #[test]
    fn stock_registry_carries_both_renderers() {
        let screens = stock_screens(&ScreenOptions::default());
        assert!(screens.contains_key("json"));
        assert!(screens.contains_key("yaml"));
    }
}
