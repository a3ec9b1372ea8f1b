use super::{OutputFormat, OutputWriter, WriteOutcome};
use crate::catalog::CatalogEntry;
use crate::depot::{Depot, StoreOutcome};
use crate::error::Error;
use crate::hasher::{hash_file, HashSelection};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Depot mode: every matched file is stored once by SHA-1, whatever set or
/// name the catalog gives it.
pub struct ContentAddressedWriter<'a> {
    depot: &'a Depot,
}

impl<'a> ContentAddressedWriter<'a> {
    pub fn new(depot: &'a Depot) -> Self {
        Self { depot }
    }
}

impl OutputWriter for ContentAddressedWriter<'_> {
    fn format(&self) -> OutputFormat {
        OutputFormat::ContentAddressed
    }

    fn write(&self, entry: &CatalogEntry, source: &Path) -> Result<WriteOutcome, Error> {
        let hashes = hash_file(source, HashSelection::DEPOT)?;
        let outcome = match self.depot.add_file(source, &hashes, None)? {
            StoreOutcome::Stored => WriteOutcome::Written,
            StoreOutcome::AlreadyPresent => WriteOutcome::AlreadyPresent,
        };
        debug!(
            "{}/{} -> depot {:?}",
            entry.set_name,
            entry.name,
            hashes.sha1.as_deref().unwrap_or_default()
        );
        Ok(outcome)
    }

    fn destination(&self, _entry: &CatalogEntry, source: &Path) -> Result<PathBuf, Error> {
        let hashes = hash_file(source, HashSelection::DEPOT)?;
        let sha1 = hashes
            .sha1
            .ok_or_else(|| Error::write(source, "no SHA-1 for depot placement"))?;
        self.depot.store().path_for(&sha1)
    }
}
