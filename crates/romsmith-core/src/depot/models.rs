use crate::hasher::Hashes;
use serde::Deserialize;

/// Cross-reference rows for one stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepotRecord {
    pub crc32: String,
    pub md5: String,
    pub sha1: String,
    pub depot: String,
}

impl DepotRecord {
    /// Requires CRC32, MD5 and SHA-1 to all be present.
    pub fn from_hashes(hashes: &Hashes, depot: &str) -> Option<Self> {
        Some(Self {
            crc32: hashes.crc32.clone()?,
            md5: hashes.md5.clone()?,
            sha1: hashes.sha1.clone()?,
            depot: depot.to_string(),
        })
    }
}

/// Where a hash resolves to in the depot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepotLocation {
    pub sha1: String,
    pub depot: String,
}

/// What an ingestion batch changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// SHA-1 rows created by this batch.
    pub inserted: usize,
    /// Records whose SHA-1 was already indexed.
    pub already_present: usize,
    /// CRC or MD5 values already associated with a different SHA-1.
    pub conflicts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepotStats {
    pub crc: i64,
    pub md5: i64,
    pub sha1: i64,
    pub crcsha1: i64,
    pub md5sha1: i64,
}

/// When "only needed" ingestion treats a file as already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeededMatch {
    /// Any one of CRC32, MD5 or SHA-1 is already indexed.
    AnyHash,
    /// The SHA-1 is indexed and cross-referenced with the same CRC32 and MD5.
    #[default]
    AllHashes,
}
