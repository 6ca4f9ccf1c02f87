//! Save-file codec.
//!
//! A snapshot is a self-describing JSON container: a header that lets a
//! loader reject incompatible engine versions, the three tables in id order
//! (object bytes base64-encoded), id counters, the registered-type manifest,
//! per-worker state blocks and the parked wait predicates.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::board::entry::Relations;
use crate::board::object::ObjectRecord;
use crate::board::store::BoardDump;
use crate::board::EntryRef;
use crate::facts::FieldValue;
use crate::scheduler::trackers::CloneState;
use crate::utilities::errors::SnapshotError;
use crate::version::{game_engine_version, Version, GAME_ENGINE_VERSION_RAW};
use crate::waits::ParkedWait;

/// Save-file header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub engine_version: String,
    pub created_at: DateTime<Utc>,
    pub session_id: Uuid,
}

impl SnapshotHeader {
    pub fn new() -> Self {
        Self {
            engine_version: GAME_ENGINE_VERSION_RAW.to_string(),
            created_at: Utc::now(),
            session_id: Uuid::new_v4(),
        }
    }
}

impl Default for SnapshotHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// One object-table row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectSnap {
    pub id: u64,
    /// Object bytes, base64.
    pub data: String,
    pub creator: String,
    pub created: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
    pub relations: Relations,
}

impl ObjectSnap {
    pub(crate) fn from_record(record: &ObjectRecord) -> Self {
        Self {
            id: record.id(),
            data: BASE64.encode(record.data()),
            creator: record.creator().to_string(),
            created: record.created(),
            metadata: record.metadata().clone(),
            relations: record.relations().clone(),
        }
    }

    pub(crate) fn into_record(self) -> Result<ObjectRecord, SnapshotError> {
        let data = BASE64.decode(&self.data).map_err(|e| SnapshotError::Corrupt {
            detail: format!("object {}: bad base64: {e}", self.id),
        })?;
        let mut record =
            ObjectRecord::new(self.id, data, self.creator, self.created, self.metadata);
        record.relations = self.relations;
        Ok(record)
    }
}

/// One fact- or hyp-table row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSnap {
    pub id: u64,
    #[serde(rename = "type")]
    pub type_name: String,
    pub groups: Vec<String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub creator: String,
    pub created: DateTime<Utc>,
    pub tainted: bool,
    pub relations: Relations,
}

impl RecordSnap {
    pub(crate) fn from_record(record: &crate::board::table::StoredRecord) -> Self {
        Self {
            id: record.id,
            type_name: record.type_name.clone(),
            groups: record.groups.clone(),
            fields: record.fields.clone(),
            creator: record.creator.clone(),
            created: record.created,
            tainted: record.tainted,
            relations: record.relations.clone(),
        }
    }

    pub(crate) fn into_record(self) -> crate::board::table::StoredRecord {
        crate::board::table::StoredRecord {
            id: self.id,
            type_name: self.type_name,
            groups: self.groups,
            fields: self.fields,
            creator: self.creator,
            created: self.created,
            tainted: self.tainted,
            relations: self.relations,
        }
    }
}

/// Saved clone of a player template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneSnap {
    pub serial: u64,
    pub state: CloneState,
    pub trigger: EntryRef,
    pub data: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Saved state block of a player template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSnap {
    pub name: String,
    pub version: Version,
    pub serial_counter: u64,
    pub memory: BTreeMap<String, Value>,
    pub clones: Vec<CloneSnap>,
}

/// Saved state block of a single-instance worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnap {
    pub name: String,
    pub memory: BTreeMap<String, Value>,
}

/// A complete game save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub header: SnapshotHeader,
    pub objects: Vec<ObjectSnap>,
    pub facts: Vec<RecordSnap>,
    pub hyps: Vec<RecordSnap>,
    pub fact_next_id: u64,
    pub hyp_next_id: u64,
    /// Names of every registered fact type at save time.
    pub registered_types: Vec<String>,
    pub players: Vec<PlayerSnap>,
    pub npcs: Vec<WorkerSnap>,
    pub backstories: Vec<WorkerSnap>,
    pub parked_waits: Vec<ParkedWait>,
}

impl Snapshot {
    /// Reject saves written by a newer engine than the one running.
    pub fn verify_compatible(&self) -> Result<(), SnapshotError> {
        let saved: Version =
            self.header
                .engine_version
                .parse()
                .map_err(|_| SnapshotError::Corrupt {
                    detail: format!("bad engine version '{}'", self.header.engine_version),
                })?;
        let running = game_engine_version();
        if saved > running {
            return Err(SnapshotError::IncompatibleVersion {
                found: saved.to_string(),
                running: running.to_string(),
            });
        }
        if saved < running {
            log::warn!("loading save from older engine v{saved}");
        }
        Ok(())
    }

    pub(crate) fn board_dump(&self) -> Result<BoardDump, SnapshotError> {
        Ok(BoardDump {
            objects: self
                .objects
                .iter()
                .cloned()
                .map(ObjectSnap::into_record)
                .collect::<Result<Vec<_>, _>>()?,
            facts: self.facts.iter().cloned().map(RecordSnap::into_record).collect(),
            hyps: self.hyps.iter().cloned().map(RecordSnap::into_record).collect(),
            fact_next_id: self.fact_next_id,
            hyp_next_id: self.hyp_next_id,
        })
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> Result<(), SnapshotError> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        let file = std::fs::File::create(path)?;
        self.to_writer(std::io::BufWriter::new(file))
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_snapshot() -> Snapshot {
        Snapshot {
            header: SnapshotHeader::new(),
            objects: vec![],
            facts: vec![],
            hyps: vec![],
            fact_next_id: 0,
            hyp_next_id: 0,
            registered_types: vec![],
            players: vec![],
            npcs: vec![],
            backstories: vec![],
            parked_waits: vec![],
        }
    }

    #[test]
    fn header_carries_the_running_engine_version() {
        let snapshot = empty_snapshot();
        assert_eq!(snapshot.header.engine_version, GAME_ENGINE_VERSION_RAW);
        snapshot.verify_compatible().unwrap();
    }

    #[test]
    fn newer_saves_are_rejected() {
        let mut snapshot = empty_snapshot();
        snapshot.header.engine_version = "99.0.0".to_string();
        assert!(matches!(
            snapshot.verify_compatible().unwrap_err(),
            SnapshotError::IncompatibleVersion { .. }
        ));
    }

    #[test]
    fn garbage_versions_are_corrupt() {
        let mut snapshot = empty_snapshot();
        snapshot.header.engine_version = "latest".to_string();
        assert!(matches!(
            snapshot.verify_compatible().unwrap_err(),
            SnapshotError::Corrupt { .. }
        ));
    }

    #[test]
    fn object_snaps_round_trip_bytes_and_relations() {
        let mut metadata = BTreeMap::new();
        metadata.insert("filename".to_string(), "a.bin".to_string());
        let mut record = ObjectRecord::new(
            0,
            vec![0x00, 0xff, 0x90],
            "GameMaster".into(),
            Utc::now(),
            metadata,
        );
        record.relations.add_child(EntryRef::fact(2));

        let snap = ObjectSnap::from_record(&record);
        assert_eq!(snap.data, BASE64.encode([0x00, 0xff, 0x90]));
        let restored = snap.into_record().unwrap();
        assert_eq!(restored.data(), &[0x00, 0xff, 0x90]);
        assert_eq!(restored.hash(), record.hash());
        assert_eq!(restored.child_facts(), [2]);
    }

    #[test]
    fn snapshot_json_round_trips() {
        let mut snapshot = empty_snapshot();
        snapshot.registered_types = vec!["md5".into(), "mimetype".into()];
        snapshot.players.push(PlayerSnap {
            name: "HashPlayer".into(),
            version: "1.0".parse().unwrap(),
            serial_counter: 2,
            memory: BTreeMap::from([("seen".to_string(), Value::from(2))]),
            clones: vec![CloneSnap {
                serial: 1,
                state: CloneState::Waiting,
                trigger: EntryRef::fact(0),
                data: BTreeMap::new(),
                error: None,
            }],
        });

        let bytes = serde_json::to_vec(&snapshot).unwrap();
        let decoded = Snapshot::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(decoded.registered_types, snapshot.registered_types);
        assert_eq!(decoded.players[0].clones[0].state, CloneState::Waiting);
        assert_eq!(decoded.players[0].memory["seen"], Value::from(2));
    }

    #[test]
    fn corrupt_base64_is_reported() {
        let snap = ObjectSnap {
            id: 0,
            data: "!!!not-base64!!!".into(),
            creator: "x".into(),
            created: Utc::now(),
            metadata: BTreeMap::new(),
            relations: Relations::new(),
        };
        assert!(matches!(
            snap.into_record().unwrap_err(),
            SnapshotError::Corrupt { .. }
        ));
    }
}
