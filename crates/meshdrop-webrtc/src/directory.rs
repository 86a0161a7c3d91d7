//! File directory gossip
//!
//! Each participant keeps a catalogue of files it knows about, its own
//! shared files plus whatever peers advertised. The full catalogue is sent
//! as a `files-list` whenever a link opens. Entries are deduplicated by
//! file name, origin and a 5 second timestamp bucket, so merging the same
//! list twice is a no-op.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::ParticipantId;

/// Width of the timestamp bucket used for deduplication (ms)
pub const DEDUP_BUCKET_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub origin_participant: ParticipantId,
    /// Relative to the holder of the directory
    #[serde(default)]
    pub is_remote: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    file_name: String,
    origin: ParticipantId,
    bucket: u64,
}

impl DedupKey {
    fn of(entry: &DirectoryEntry) -> Self {
        Self {
            file_name: entry.file_name.clone(),
            origin: entry.origin_participant.clone(),
            bucket: entry.timestamp / DEDUP_BUCKET_MS * DEDUP_BUCKET_MS,
        }
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct FileDirectory {
    local: ParticipantId,
    entries: Vec<DirectoryEntry>,
    keys: HashSet<DedupKey>,
}

impl FileDirectory {
    pub fn new(local: ParticipantId) -> Self {
        Self {
            local,
            entries: Vec::new(),
            keys: HashSet::new(),
        }
    }

    /// Record a file shared by this participant
    pub fn add_local(
        &mut self,
        file_id: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
        mime_type: impl Into<String>,
    ) -> DirectoryEntry {
        let entry = DirectoryEntry {
            file_id: file_id.into(),
            file_name: file_name.into(),
            file_size,
            mime_type: mime_type.into(),
            timestamp: now_millis(),
            origin_participant: self.local.clone(),
            is_remote: false,
        };
        self.insert(entry.clone());
        entry
    }

    /// Insert unless an entry with the same dedup key exists
    pub fn insert(&mut self, mut entry: DirectoryEntry) -> bool {
        entry.is_remote = entry.origin_participant != self.local;
        if !self.keys.insert(DedupKey::of(&entry)) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Merge a received `files-list`. Returns the entries that were new.
    pub fn merge(&mut self, entries: Vec<DirectoryEntry>) -> Vec<DirectoryEntry> {
        let mut added = Vec::new();
        for entry in entries {
            if self.insert(entry) {
                if let Some(last) = self.entries.last() {
                    added.push(last.clone());
                }
            }
        }
        added
    }

    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
