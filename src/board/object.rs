//! The object table: content-addressed opaque byte buffers.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::board::entry::Relations;

/// Hex SHA-256 digest of a byte buffer.
pub fn digest_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// An immutable object held in the object table.
///
/// The byte buffer is shared; cloning a record is cheap. Relations are
/// maintained by the store after insertion.
#[derive(Debug, Clone)]
pub struct ObjectRecord {
    id: u64,
    data: Arc<Vec<u8>>,
    digest: String,
    creator: String,
    created: DateTime<Utc>,
    metadata: BTreeMap<String, String>,
    pub(crate) relations: Relations,
}

impl ObjectRecord {
    pub(crate) fn new(
        id: u64,
        data: Vec<u8>,
        creator: String,
        created: DateTime<Utc>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        let digest = digest_bytes(&data);
        let mut record = Self {
            id,
            data: Arc::new(data),
            digest,
            creator,
            created,
            metadata: BTreeMap::new(),
            relations: Relations::new(),
        };
        for (key, value) in metadata {
            record.add_metadata(&key, value);
        }
        record
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Hex SHA-256 of the object bytes.
    pub fn hash(&self) -> &str {
        &self.digest
    }

    pub fn creator(&self) -> &str {
        &self.creator
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn relations(&self) -> &Relations {
        &self.relations
    }

    pub fn parent_objects(&self) -> &[u64] {
        &self.relations.parent_objects
    }

    pub fn parent_facts(&self) -> &[u64] {
        &self.relations.parent_facts
    }

    pub fn parent_hyps(&self) -> &[u64] {
        &self.relations.parent_hyps
    }

    pub fn child_objects(&self) -> &[u64] {
        &self.relations.child_objects
    }

    pub fn child_facts(&self) -> &[u64] {
        &self.relations.child_facts
    }

    pub fn child_hyps(&self) -> &[u64] {
        &self.relations.child_hyps
    }

    /// A `filename` key is split into name and directory components; other
    /// keys are stored verbatim.
    pub(crate) fn add_metadata(&mut self, key: &str, value: String) {
        if key == "filename" {
            let path = Path::new(&value);
            match path.file_name() {
                Some(name) => {
                    self.metadata
                        .insert("filename".to_string(), name.to_string_lossy().into_owned());
                    if let Some(parent) = path.parent() {
                        if !parent.as_os_str().is_empty() {
                            self.metadata.insert(
                                "filepath".to_string(),
                                parent.to_string_lossy().into_owned(),
                            );
                        }
                    }
                }
                None => {
                    self.metadata.insert("filename".to_string(), value);
                }
            }
        } else {
            self.metadata.insert(key.to_string(), value);
        }
    }
}

/// Master list of objects plus the digest → id dedup index.
#[derive(Debug, Default)]
pub(crate) struct ObjectTable {
    pub(crate) records: Vec<ObjectRecord>,
    by_digest: HashMap<String, u64>,
}

impl ObjectTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Id the next insertion will receive.
    pub(crate) fn next_id(&self) -> u64 {
        self.records.len() as u64
    }

    pub(crate) fn get(&self, id: u64) -> Option<&ObjectRecord> {
        self.records.get(id as usize)
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut ObjectRecord> {
        self.records.get_mut(id as usize)
    }

    pub(crate) fn find_by_digest(&self, digest: &str) -> Option<u64> {
        self.by_digest.get(digest).copied()
    }

    /// Insert a record whose id must equal `next_id`.
    pub(crate) fn insert(&mut self, record: ObjectRecord) {
        debug_assert_eq!(record.id(), self.next_id());
        self.by_digest.insert(record.hash().to_string(), record.id());
        self.records.push(record);
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_sha256() {
        assert_eq!(
            digest_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn filename_metadata_is_split() {
        let mut metadata = BTreeMap::new();
        metadata.insert("filename".to_string(), "/samples/evil/dropper.bin".to_string());
        let record = ObjectRecord::new(0, b"x".to_vec(), "GameMaster".into(), Utc::now(), metadata);
        assert_eq!(record.metadata()["filename"], "dropper.bin");
        assert_eq!(record.metadata()["filepath"], "/samples/evil");
    }

    #[test]
    fn plain_metadata_is_stored_verbatim() {
        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), "mail-gateway".to_string());
        let record = ObjectRecord::new(0, b"x".to_vec(), "GameMaster".into(), Utc::now(), metadata);
        assert_eq!(record.metadata()["source"], "mail-gateway");
    }

    #[test]
    fn dedup_index_finds_prior_insertions() {
        let mut table = ObjectTable::new();
        let record = ObjectRecord::new(0, b"abc".to_vec(), "a".into(), Utc::now(), BTreeMap::new());
        let digest = record.hash().to_string();
        table.insert(record);
        assert_eq!(table.find_by_digest(&digest), Some(0));
        assert_eq!(table.next_id(), 1);
    }
}
