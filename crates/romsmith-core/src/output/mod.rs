//! Writers that place matched files into their rebuilt location.

pub mod depot;
pub mod folder;
pub mod tape;
pub mod zipfile;

pub use depot::ContentAddressedWriter;
pub use folder::FolderWriter;
pub use tape::TapeArchiveWriter;
pub use zipfile::ZipFamilyWriter;

use crate::catalog::CatalogEntry;
use crate::depot::Depot;
use crate::error::Error;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Folder,
    #[serde(alias = "tar")]
    TapeArchive,
    #[serde(alias = "zip")]
    ZipFamily,
    #[serde(alias = "depot")]
    ContentAddressed,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "folder" | "dir" => Ok(OutputFormat::Folder),
            "tape_archive" | "tar" => Ok(OutputFormat::TapeArchive),
            "zip_family" | "zip" => Ok(OutputFormat::ZipFamily),
            "content_addressed" | "depot" => Ok(OutputFormat::ContentAddressed),
            other => Err(Error::InvalidSetting(format!(
                "unknown output format '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The destination already held this entry with identical content.
    AlreadyPresent,
}

/// Places one matched file at the location its catalog entry calls for.
///
/// Writes are idempotent: repeating a write with the same entry and content
/// leaves the destination unchanged.
pub trait OutputWriter: Send + Sync {
    fn format(&self) -> OutputFormat;

    fn write(&self, entry: &CatalogEntry, source: &Path) -> Result<WriteOutcome, Error>;

    /// Write several entries, one result per item in order. Archive writers
    /// rewrite each destination archive once per call.
    fn write_many(&self, items: &[(&CatalogEntry, &Path)]) -> Vec<Result<WriteOutcome, Error>> {
        items
            .iter()
            .map(|(entry, source)| self.write(entry, source))
            .collect()
    }

    /// The file that holds `entry` once `source` has been written for it.
    fn destination(&self, entry: &CatalogEntry, source: &Path) -> Result<PathBuf, Error>;
}

/// Build the writer for a run. `depot` is required for
/// [`OutputFormat::ContentAddressed`].
pub fn create_writer<'a>(
    format: OutputFormat,
    out_root: &Path,
    depot: Option<&'a Depot>,
    preserve_timestamps: bool,
) -> Result<Box<dyn OutputWriter + 'a>, Error> {
    let writer: Box<dyn OutputWriter + 'a> = match format {
        OutputFormat::Folder => Box::new(FolderWriter::new(out_root, preserve_timestamps)),
        OutputFormat::TapeArchive => {
            Box::new(TapeArchiveWriter::new(out_root, preserve_timestamps))
        }
        OutputFormat::ZipFamily => Box::new(ZipFamilyWriter::new(out_root)),
        OutputFormat::ContentAddressed => {
            let depot = depot.ok_or_else(|| {
                Error::InvalidSetting("content addressed output needs a depot".to_string())
            })?;
            Box::new(ContentAddressedWriter::new(depot))
        }
    };
    Ok(writer)
}

/// Validate a `/` or `\` separated name as a relative path with no `..`,
/// root or drive prefix.
pub fn safe_relative_path(name: &str) -> Result<PathBuf, String> {
    if name.starts_with('/') || name.starts_with('\\') || name.contains(':') {
        return Err(format!("'{}' is not a relative path", name));
    }
    let mut path = PathBuf::new();
    for part in name.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return Err(format!("'{}' escapes its set", name)),
            _ => path.push(part),
        }
    }
    if path.as_os_str().is_empty() {
        return Err(format!("'{}' is empty", name));
    }
    if path.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(format!("'{}' is not a relative path", name));
    }
    Ok(path)
}

/// Normalized `/` separated member name for archive writers.
pub fn archive_member_name(name: &str) -> Result<String, String> {
    let path = safe_relative_path(name)?;
    Ok(path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/"))
}

/// `<out>/<set><extension>` for archive writers.
pub(crate) fn set_archive_path(out_root: &Path, set: &str, extension: &str) -> Result<PathBuf, Error> {
    let rel = safe_relative_path(set).map_err(|reason| Error::write(out_root.join(set), reason))?;
    let mut os: OsString = out_root.join(rel).into_os_string();
    os.push(extension);
    Ok(PathBuf::from(os))
}

/// One mutex per destination archive so concurrent writes to the same set
/// serialize while different sets proceed in parallel.
#[derive(Default)]
pub(crate) struct DestinationLocks {
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl DestinationLocks {
    pub(crate) fn lock_for(&self, dest: &Path) -> Arc<Mutex<()>> {
        self.locks.entry(dest.to_path_buf()).or_default().clone()
    }
}

pub(crate) fn hold(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

/// Whether two paths name the same file after resolving links and `..`.
/// Paths that do not exist are never the same file.
pub fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Compare two byte streams to the end of both.
pub(crate) fn same_bytes(mut a: impl Read, mut b: impl Read) -> io::Result<bool> {
    let mut ba = vec![0u8; COMPARE_BUFFER_LENGTH];
    let mut bb = vec![0u8; COMPARE_BUFFER_LENGTH];
    loop {
        let n = a.read(&mut ba)?;
        if n == 0 {
            return Ok(b.read(&mut bb[..1])? == 0);
        }
        match b.read_exact(&mut bb[..n]) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e),
        }
        if ba[..n] != bb[..n] {
            return Ok(false);
        }
    }
}

const COMPARE_BUFFER_LENGTH: usize = 64 * 1024;

/// One write routed to an archive writer's destination.
pub(crate) struct PendingMember<'a> {
    pub entry: &'a CatalogEntry,
    pub name: String,
    pub source: &'a Path,
}

/// Group `items` by their `<out>/<set><extension>` archive and hand each
/// group to `update` once. Naming failures and archive failures are
/// reported against every affected item.
pub(crate) fn write_grouped<F>(
    out_root: &Path,
    extension: &str,
    items: &[(&CatalogEntry, &Path)],
    mut update: F,
) -> Vec<Result<WriteOutcome, Error>>
where
    F: FnMut(&Path, &[PendingMember<'_>]) -> Result<Vec<WriteOutcome>, Error>,
{
    let mut results: Vec<Option<Result<WriteOutcome, Error>>> =
        items.iter().map(|_| None).collect();
    let mut groups: BTreeMap<PathBuf, Vec<(usize, PendingMember<'_>)>> = BTreeMap::new();

    for (i, &(entry, source)) in items.iter().enumerate() {
        let routed = set_archive_path(out_root, &entry.set_name, extension).and_then(|dest| {
            let name = archive_member_name(&entry.name).map_err(|reason| Error::write(&dest, reason))?;
            Ok((dest, name))
        });
        match routed {
            Ok((dest, name)) => groups.entry(dest).or_default().push((
                i,
                PendingMember {
                    entry,
                    name,
                    source,
                },
            )),
            Err(e) => results[i] = Some(Err(e)),
        }
    }

    for (dest, group) in groups {
        let (slots, members): (Vec<usize>, Vec<PendingMember<'_>>) = group.into_iter().unzip();
        match update(&dest, &members) {
            Ok(outcomes) => {
                for (slot, outcome) in slots.iter().zip(outcomes) {
                    results[*slot] = Some(Ok(outcome));
                }
            }
            Err(e) => {
                let reason = e.to_string();
                for slot in &slots {
                    results[*slot] = Some(Err(Error::write(&dest, &reason)));
                }
            }
        }
    }

    results
        .into_iter()
        .map(|r| r.unwrap_or_else(|| Err(Error::Other("write was not attempted".to_string()))))
        .collect()
}
