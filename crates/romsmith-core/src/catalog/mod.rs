//! Normalized catalog model handed in by the DAT parsing layer.
//!
//! Catalogs arrive as JSON (`{"name": ..., "entries": [...]}`) and are
//! normalized once on load: hash strings are trimmed and lowercased, and any
//! value of the wrong length or with non-hex characters is dropped.

pub mod dupe;
pub mod index;

pub use dupe::{classify, classify_optional, DupeClassification, Locality, Scope};
pub use index::{CatalogIndex, DedupeKey, DedupeMode};

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::{debug, warn};

/// Identifies which input catalog contributed an entry.
pub type SourceId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    #[default]
    Rom,
    Disk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Verified,
    BadDump,
    NoDump,
    #[default]
    Unknown,
}

/// One expected file inside a set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc32: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub set_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_description: Option<String>,
    #[serde(default)]
    pub source_id: SourceId,
    #[serde(default)]
    pub status: EntryStatus,
    #[serde(default)]
    pub kind: ItemKind,
    /// Catalog timestamp, `YYYY/MM/DD HH:MM:SS` or `YYYY-MM-DD HH:MM:SS`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

impl CatalogEntry {
    pub fn has_any_hash(&self) -> bool {
        self.crc32.is_some() || self.md5.is_some() || self.sha1.is_some() || self.sha256.is_some()
    }

    /// Pairs of (this, other) values for every algorithm, in a fixed order.
    pub(crate) fn hash_pairs<'a>(
        &'a self,
        other: &'a CatalogEntry,
    ) -> [(Option<&'a str>, Option<&'a str>); 4] {
        [
            (self.crc32.as_deref(), other.crc32.as_deref()),
            (self.md5.as_deref(), other.md5.as_deref()),
            (self.sha1.as_deref(), other.sha1.as_deref()),
            (self.sha256.as_deref(), other.sha256.as_deref()),
        ]
    }

    pub fn normalize(&mut self) {
        self.crc32 = normalize_hash(self.crc32.take(), 8, &self.name);
        self.md5 = normalize_hash(self.md5.take(), 32, &self.name);
        self.sha1 = normalize_hash(self.sha1.take(), 40, &self.name);
        self.sha256 = normalize_hash(self.sha256.take(), 64, &self.name);
    }

    pub fn modified_time(&self) -> Option<chrono::NaiveDateTime> {
        let date = self.date.as_deref()?.trim();
        ["%Y/%m/%d %H:%M:%S", "%Y-%m-%d %H:%M:%S"]
            .iter()
            .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(date, fmt).ok())
    }
}

fn normalize_hash(value: Option<String>, expected_len: usize, name: &str) -> Option<String> {
    let value = value?.trim().to_ascii_lowercase();
    if value.is_empty() {
        return None;
    }
    if value.len() != expected_len || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        warn!("Dropping malformed hash '{}' on entry '{}'", value, name);
        return None;
    }
    Some(value)
}

/// A named collection of entries, as produced by the parsing subsystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub name: String,
    #[serde(default)]
    pub entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn new(name: impl Into<String>, entries: Vec<CatalogEntry>) -> Self {
        let mut catalog = Catalog {
            name: name.into(),
            entries,
        };
        catalog.normalize();
        catalog
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let reader = BufReader::new(File::open(path)?);
        let mut catalog: Catalog = serde_json::from_reader(reader)?;
        catalog.normalize();
        debug!(
            "Loaded catalog '{}' with {} entries from {}",
            catalog.name,
            catalog.entries.len(),
            path.display()
        );
        Ok(catalog)
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn normalize(&mut self) {
        for entry in &mut self.entries {
            entry.normalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_lowercases_and_drops_malformed() {
        let mut entry = CatalogEntry {
            name: "a.rom".to_string(),
            crc32: Some(" DEADBEEF ".to_string()),
            md5: Some("xyz".to_string()),
            sha1: Some(String::new()),
            set_name: "game1".to_string(),
            ..Default::default()
        };
        entry.normalize();
        assert_eq!(entry.crc32.as_deref(), Some("deadbeef"));
        assert!(entry.md5.is_none());
        assert!(entry.sha1.is_none());
        assert!(entry.has_any_hash());
    }

    #[test]
    fn test_catalog_json_round_trip_fields() {
        let json = r#"{
            "name": "Test DAT",
            "entries": [
                {"name": "a.rom", "size": 4, "crc32": "DEADBEEF", "set_name": "game1",
                 "source_id": 1, "status": "verified", "date": "1999/01/02 03:04:05"}
            ]
        }"#;
        let mut catalog: Catalog = serde_json::from_str(json).unwrap();
        catalog.normalize();
        let entry = &catalog.entries[0];
        assert_eq!(entry.crc32.as_deref(), Some("deadbeef"));
        assert_eq!(entry.status, EntryStatus::Verified);
        assert_eq!(entry.kind, ItemKind::Rom);
        let modified = entry.modified_time().unwrap();
        assert_eq!(modified.to_string(), "1999-01-02 03:04:05");
    }
}
