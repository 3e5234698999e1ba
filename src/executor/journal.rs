use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::Hash32;
use crate::error::JournalError;

/// The persisted result of one node execution.
///
/// A record is written once, in full, after the node's action succeeded and
/// its output was encoded. Re-executing a node replaces the record as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Fingerprint the node had when this result was produced.
    pub fingerprint: Hash32,
    /// Hash of `output`, folded into downstream fingerprints.
    pub output_hash: Hash32,
    /// CBOR-encoded output.
    pub output: Vec<u8>,
    /// Whether the next run may reuse this result.
    pub settled: bool,
}

/// All records of previous runs, keyed by node key.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Journal {
    records: BTreeMap<String, Record>,
}

impl Journal {
    /// Loads the journal at `path`. A missing journal is empty; an unreadable
    /// one is logged and discarded, which only costs a full rebuild.
    pub fn load(path: &Utf8Path) -> Self {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(_) => return Self::default(),
        };

        match ciborium::from_reader(BufReader::new(file)) {
            Ok(journal) => journal,
            Err(e) => {
                warn!(path = %path, "discarding unreadable journal: {e}");
                Self::default()
            }
        }
    }

    /// Writes the journal atomically: a temporary file is fully written and
    /// then renamed over the previous journal.
    pub fn save(&self, path: &Utf8Path) -> Result<(), JournalError> {
        let write = |path: &Utf8Path| -> std::io::Result<()> {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }

            let temp = path.with_extension("tmp");
            let mut writer = BufWriter::new(File::create(&temp)?);
            ciborium::into_writer(self, &mut writer).map_err(std::io::Error::other)?;
            writer.flush()?;
            drop(writer);

            fs::rename(&temp, path)
        };

        write(path).map_err(|source| JournalError::Write {
            path: path.to_owned(),
            source,
        })
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    pub(crate) fn commit(&mut self, key: &str, record: Record) {
        self.records.insert(key.to_string(), record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
