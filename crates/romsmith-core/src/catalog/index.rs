use super::dupe::{classify, DupeClassification, Scope};
use super::CatalogEntry;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, warn};

/// Bucket key for catalog entries. Entries are filed under the first digest
/// they carry in the order CRC32, SHA-1, MD5, SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupeKey {
    Crc32(String),
    Sha1(String),
    Md5(String),
    Sha256(String),
}

impl DedupeKey {
    pub fn primary(entry: &CatalogEntry) -> Option<DedupeKey> {
        if let Some(crc) = &entry.crc32 {
            Some(DedupeKey::Crc32(crc.clone()))
        } else if let Some(sha1) = &entry.sha1 {
            Some(DedupeKey::Sha1(sha1.clone()))
        } else if let Some(md5) = &entry.md5 {
            Some(DedupeKey::Md5(md5.clone()))
        } else {
            entry.sha256.clone().map(DedupeKey::Sha256)
        }
    }

    /// Every bucket an entry with these digests could have been filed under.
    pub fn lookup_keys(entry: &CatalogEntry) -> Vec<DedupeKey> {
        let mut keys = Vec::with_capacity(4);
        if let Some(crc) = &entry.crc32 {
            keys.push(DedupeKey::Crc32(crc.clone()));
        }
        if let Some(sha1) = &entry.sha1 {
            keys.push(DedupeKey::Sha1(sha1.clone()));
        }
        if let Some(md5) = &entry.md5 {
            keys.push(DedupeKey::Md5(md5.clone()));
        }
        if let Some(sha256) = &entry.sha256 {
            keys.push(DedupeKey::Sha256(sha256.clone()));
        }
        keys
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupeMode {
    #[default]
    None,
    /// Drop any entry that duplicates an earlier one.
    Full,
    /// Drop only duplicates within the same set.
    Game,
}

/// Catalog entries bucketed by dedupe key.
///
/// Lookups take shard read locks; removal takes the write lock of the one
/// bucket it touches.
#[derive(Debug, Default)]
pub struct CatalogIndex {
    buckets: DashMap<DedupeKey, Vec<CatalogEntry>>,
    rejected: usize,
}

impl CatalogIndex {
    /// Build an index. Entries without any digest cannot be matched and are
    /// rejected.
    pub fn new(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        let buckets: DashMap<DedupeKey, Vec<CatalogEntry>> = DashMap::new();
        let mut rejected = 0;
        for entry in entries {
            match DedupeKey::primary(&entry) {
                Some(key) => buckets.entry(key).or_default().push(entry),
                None => {
                    warn!(
                        "Entry '{}' in set '{}' has no hash and cannot be matched",
                        entry.name, entry.set_name
                    );
                    rejected += 1;
                }
            }
        }
        debug!(
            "Catalog index built: {} buckets, {} rejected entries",
            buckets.len(),
            rejected
        );
        Self { buckets, rejected }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries refused at construction for carrying no digest.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// All entries that classify as a duplicate of `wanted`.
    pub fn lookup(&self, wanted: &CatalogEntry) -> Vec<(CatalogEntry, DupeClassification)> {
        let mut matches = Vec::new();
        for key in DedupeKey::lookup_keys(wanted) {
            if let Some(bucket) = self.buckets.get(&key) {
                for entry in bucket.value() {
                    let classification = classify(entry, wanted);
                    if classification.is_duplicate() {
                        matches.push((entry.clone(), classification));
                    }
                }
            }
        }
        matches
    }

    /// Consume one entry equal to `entry`. Only the first equal entry in the
    /// bucket is removed, so identical catalog rows are consumed one at a time.
    pub fn remove(&self, entry: &CatalogEntry) -> bool {
        let Some(key) = DedupeKey::primary(entry) else {
            return false;
        };

        let removed = match self.buckets.get_mut(&key) {
            Some(mut bucket) => match bucket.iter().position(|e| e == entry) {
                Some(pos) => {
                    bucket.remove(pos);
                    true
                }
                None => false,
            },
            None => false,
        };

        if removed {
            self.buckets.remove_if(&key, |_, bucket| bucket.is_empty());
        }
        removed
    }

    pub fn remove_all(&self, entries: &[CatalogEntry]) -> usize {
        entries.iter().filter(|e| self.remove(e)).count()
    }

    /// Remove duplicate entries within each bucket, keeping the earliest.
    pub fn remove_duplicates(&self, mode: DedupeMode) -> usize {
        if mode == DedupeMode::None {
            return 0;
        }

        let mut removed = 0;
        for mut bucket in self.buckets.iter_mut() {
            let mut kept: Vec<CatalogEntry> = Vec::with_capacity(bucket.len());
            for entry in bucket.drain(..) {
                let is_dupe = kept.iter().any(|k| match classify(k, &entry) {
                    DupeClassification::None => false,
                    DupeClassification::Duplicate { scope, .. } => {
                        mode == DedupeMode::Full || scope == Scope::All
                    }
                });
                if is_dupe {
                    removed += 1;
                } else {
                    kept.push(entry);
                }
            }
            *bucket = kept;
        }
        debug!("Removed {} duplicate catalog entries ({:?})", removed, mode);
        removed
    }

    /// Snapshot of entries still in the index, ordered by set then name.
    pub fn remaining(&self) -> Vec<CatalogEntry> {
        let mut entries: Vec<CatalogEntry> = self
            .buckets
            .iter()
            .flat_map(|b| b.value().clone())
            .collect();
        entries.sort_by(|a, b| {
            a.set_name
                .cmp(&b.set_name)
                .then_with(|| a.name.cmp(&b.name))
        });
        entries
    }
}
