use super::extract::{scoped_temp_dir, ArchiveEntry, Extractor, Extractors};
use super::policy::{ArchiveKind, ScanLevels};
use crate::catalog::{CatalogEntry, ItemKind};
use crate::error::Error;
use crate::hasher::{hash_file, HashSelection, Hashes};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Source id given to lookup entries built from discovered files. Catalogs never use
/// it, so a candidate is always External to every catalog entry.
pub const CANDIDATE_SOURCE_ID: u32 = u32::MAX;

/// A file found while scanning one input: the input itself or one entry of a
/// container.
#[derive(Debug, Clone)]
pub struct CandidateFile {
    /// Filesystem path, or `<container>/<entry name>` for archive members.
    pub path: PathBuf,
    /// Final path component of the file or entry.
    pub name: String,
    pub size: u64,
    pub hashes: Hashes,
    pub container_path: Option<PathBuf>,
    local: Option<PathBuf>,
    entry: Option<ArchiveEntry>,
}

impl CandidateFile {
    fn plain(path: &Path, hashes: Hashes) -> Self {
        Self {
            path: path.to_path_buf(),
            name: file_name(path),
            size: hashes.size,
            hashes,
            container_path: None,
            local: Some(path.to_path_buf()),
            entry: None,
        }
    }

    fn member(container: &Path, entry: ArchiveEntry, hashes: Hashes, local: Option<PathBuf>) -> Self {
        let name = entry
            .name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&entry.name)
            .to_string();
        Self {
            path: container.join(&entry.name),
            name,
            // Recorded sizes can be wrong (gzip keeps only the low 32 bits).
            size: if local.is_some() { hashes.size } else { entry.size },
            hashes,
            container_path: Some(container.to_path_buf()),
            local,
            entry: Some(entry),
        }
    }

    /// Where the candidate's bytes live on disk, once available.
    pub fn local_path(&self) -> Option<&Path> {
        self.local.as_deref()
    }

    /// A catalog-shaped view used to look the candidate up.
    pub fn as_lookup_entry(&self) -> CatalogEntry {
        CatalogEntry {
            name: self.name.clone(),
            size: Some(self.size),
            crc32: self.hashes.crc32.clone(),
            md5: self.hashes.md5.clone(),
            sha1: self.hashes.sha1.clone(),
            sha256: self.hashes.sha256.clone(),
            set_name: file_stem(&self.name),
            source_id: CANDIDATE_SOURCE_ID,
            kind: ItemKind::Rom,
            ..Default::default()
        }
    }
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

/// Turns top-level inputs into hashed candidates according to the scan
/// levels.
pub struct InputScanner<'a> {
    pub levels: ScanLevels,
    pub extractors: &'a Extractors,
    pub selection: HashSelection,
    pub quick_scan: bool,
    pub temp_root: Option<PathBuf>,
}

/// Candidates of one input, plus the scratch directory holding any
/// extracted bytes. The directory is removed when this is dropped.
pub struct ScannedInput<'a> {
    pub input: PathBuf,
    pub candidates: Vec<CandidateFile>,
    extractor: Option<&'a dyn Extractor>,
    scratch: Option<TempDir>,
    temp_root: Option<PathBuf>,
}

impl<'a> InputScanner<'a> {
    /// Scan one input. Extraction and hashing run on the current rayon pool.
    ///
    /// Returns `Error::Policy` when the scan levels select no processing for
    /// the input's container type. A container that cannot be read is
    /// treated as an opaque file.
    pub fn scan(&self, input: &Path) -> Result<ScannedInput<'a>, Error> {
        let kind = ArchiveKind::detect(input)?;
        let decision = self.levels.decide(kind, input)?;

        let mut scanned = ScannedInput {
            input: input.to_path_buf(),
            candidates: Vec::new(),
            extractor: None,
            scratch: None,
            temp_root: self.temp_root.clone(),
        };
        let mut treat_as_file = decision.treat_as_file;

        if let (true, Some(kind)) = (decision.recurse, kind) {
            match self.extractors.for_kind(kind) {
                Some(extractor) => match self.enumerate(extractor, input) {
                    Ok((candidates, scratch)) => {
                        scanned.candidates = candidates;
                        scanned.scratch = scratch;
                        scanned.extractor = Some(extractor);
                    }
                    Err(e) => {
                        warn!("{}; treating it as an opaque file", e);
                        treat_as_file = true;
                    }
                },
                None => {
                    debug!(
                        "No codec for {:?}, treating {} as an opaque file",
                        kind,
                        input.display()
                    );
                    treat_as_file = true;
                }
            }
        }

        if treat_as_file {
            let hashes = hash_file(input, self.selection)?;
            scanned.candidates.insert(0, CandidateFile::plain(input, hashes));
        }
        Ok(scanned)
    }

    fn enumerate(
        &self,
        extractor: &dyn Extractor,
        input: &Path,
    ) -> Result<(Vec<CandidateFile>, Option<TempDir>), Error> {
        let entries = extractor.list(input)?;

        if self.quick_scan && entries.iter().all(|e| e.crc32.is_some()) {
            let candidates = entries
                .into_iter()
                .map(|entry| {
                    let hashes = Hashes {
                        size: entry.size,
                        crc32: entry.crc32.clone(),
                        ..Default::default()
                    };
                    CandidateFile::member(input, entry, hashes, None)
                })
                .collect();
            return Ok((candidates, None));
        }

        let scratch = scoped_temp_dir(self.temp_root.as_deref())?;
        let extracted = extractor.extract(input, &entries, scratch.path())?;
        let selection = self.selection;
        let candidates = extracted
            .into_par_iter()
            .map(|file| {
                let hashes = hash_file(&file.path, selection)
                    .map_err(|e| Error::extraction(input, e))?;
                Ok(CandidateFile::member(input, file.entry, hashes, Some(file.path)))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok((candidates, Some(scratch)))
    }
}

impl ScannedInput<'_> {
    /// Extract the listed candidates that are only known from the container
    /// index so their bytes can be written.
    pub fn materialize(&mut self, indices: &[usize]) -> Result<(), Error> {
        let pending: Vec<ArchiveEntry> = indices
            .iter()
            .filter_map(|&i| self.candidates.get(i))
            .filter(|c| c.local.is_none())
            .filter_map(|c| c.entry.clone())
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let Some(extractor) = self.extractor else {
            return Err(Error::extraction(&self.input, "no extractor for pending entries"));
        };
        if self.scratch.is_none() {
            self.scratch = Some(scoped_temp_dir(self.temp_root.as_deref())?);
        }
        let dest = match &self.scratch {
            Some(dir) => dir.path().to_path_buf(),
            None => return Err(Error::extraction(&self.input, "no scratch directory")),
        };

        for file in extractor.extract(&self.input, &pending, &dest)? {
            if let Some(candidate) = self
                .candidates
                .iter_mut()
                .find(|c| c.entry.as_ref().map(|e| e.index) == Some(file.entry.index))
            {
                candidate.local = Some(file.path);
            }
        }
        Ok(())
    }
}
