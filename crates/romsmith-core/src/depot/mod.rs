//! Content-addressed depot: canonical gzip files keyed by SHA-1 plus a
//! SQLite cross reference from CRC32 and MD5 to SHA-1.

pub mod index;
pub mod ingest;
pub mod models;
pub mod store;

pub use index::DepotIndex;
pub use ingest::{ingest, IngestOptions, IngestSummary};
pub use models::{BatchOutcome, DepotLocation, DepotRecord, DepotStats, NeededMatch};
pub use store::{DepotStore, StoreOutcome};

use crate::cancel::CancelToken;
use crate::error::Error;
use crate::hasher::Hashes;
use std::path::{Path, PathBuf};

pub const DEFAULT_DATABASE_NAME: &str = "depot.sqlite";

pub struct Depot {
    store: DepotStore,
    index: DepotIndex,
    label: String,
}

impl Depot {
    /// Open a depot rooted at `root`. The index defaults to
    /// `<root>/depot.sqlite`.
    pub fn open(root: &Path, database: Option<&Path>) -> Result<Self, Error> {
        let database: PathBuf = match database {
            Some(path) => path.to_path_buf(),
            None => root.join(DEFAULT_DATABASE_NAME),
        };
        std::fs::create_dir_all(root)?;
        let index = DepotIndex::open(&database)?;
        Ok(Self::with_index(root, index))
    }

    pub fn with_index(root: &Path, index: DepotIndex) -> Self {
        Self {
            store: DepotStore::new(root),
            index,
            label: root.to_string_lossy().into_owned(),
        }
    }

    pub fn store(&self) -> &DepotStore {
        &self.store
    }

    pub fn index(&self) -> &DepotIndex {
        &self.index
    }

    /// Value recorded in the `depot` column for files stored here.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn contains(&self, hashes: &Hashes, mode: NeededMatch) -> Result<bool, Error> {
        self.index.contains(hashes, mode)
    }

    /// Store one file and index it as its own batch.
    pub fn add_file(
        &self,
        source: &Path,
        hashes: &Hashes,
        cancel: Option<&CancelToken>,
    ) -> Result<StoreOutcome, Error> {
        let record = DepotRecord::from_hashes(hashes, &self.label)
            .ok_or_else(|| Error::write(source, "depot storage needs CRC32, MD5 and SHA-1"))?;
        let outcome = self.store.store_file(source, hashes)?;
        self.index.ingest_batch(&[record], cancel)?;
        Ok(outcome)
    }
}
