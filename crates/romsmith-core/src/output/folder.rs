use super::{safe_relative_path, same_bytes, OutputFormat, OutputWriter, WriteOutcome};
use crate::catalog::CatalogEntry;
use crate::error::Error;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// `<out>/<set>/<entry name>` as plain files.
pub struct FolderWriter {
    out_root: PathBuf,
    preserve_timestamps: bool,
}

impl FolderWriter {
    pub fn new(out_root: &Path, preserve_timestamps: bool) -> Self {
        Self {
            out_root: out_root.to_path_buf(),
            preserve_timestamps,
        }
    }

    pub fn path_for(&self, entry: &CatalogEntry) -> Result<PathBuf, Error> {
        let set = safe_relative_path(&entry.set_name)
            .map_err(|reason| Error::write(self.out_root.join(&entry.set_name), reason))?;
        let name = safe_relative_path(&entry.name)
            .map_err(|reason| Error::write(self.out_root.join(&entry.name), reason))?;
        Ok(self.out_root.join(set).join(name))
    }
}

impl OutputWriter for FolderWriter {
    fn format(&self) -> OutputFormat {
        OutputFormat::Folder
    }

    fn write(&self, entry: &CatalogEntry, source: &Path) -> Result<WriteOutcome, Error> {
        let dest = self.path_for(entry)?;
        if same_content(source, &dest).map_err(|e| Error::write(&dest, e))? {
            return Ok(WriteOutcome::AlreadyPresent);
        }

        let dir = dest
            .parent()
            .ok_or_else(|| Error::write(&dest, "no parent directory"))?;
        fs::create_dir_all(dir).map_err(|e| Error::write(&dest, e))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".romsmith-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| Error::write(&dest, e))?;
        let mut input = File::open(source)?;
        io::copy(&mut input, tmp.as_file_mut()).map_err(|e| Error::write(&dest, e))?;
        let file = tmp.persist(&dest).map_err(|e| Error::write(&dest, e.error))?;

        if self.preserve_timestamps {
            if let Some(modified) = entry.modified_time().and_then(to_system_time) {
                file.set_modified(modified)
                    .map_err(|e| Error::write(&dest, e))?;
            }
        }
        debug!("Wrote {}", dest.display());
        Ok(WriteOutcome::Written)
    }

    fn destination(&self, entry: &CatalogEntry, _source: &Path) -> Result<PathBuf, Error> {
        self.path_for(entry)
    }
}

fn to_system_time(time: chrono::NaiveDateTime) -> Option<SystemTime> {
    let secs = u64::try_from(time.and_utc().timestamp()).ok()?;
    UNIX_EPOCH.checked_add(Duration::from_secs(secs))
}

fn same_content(a: &Path, b: &Path) -> io::Result<bool> {
    let Ok(b_meta) = fs::metadata(b) else {
        return Ok(false);
    };
    if !b_meta.is_file() || fs::metadata(a)?.len() != b_meta.len() {
        return Ok(false);
    }
    same_bytes(
        BufReader::new(File::open(a)?),
        BufReader::new(File::open(b)?),
    )
}
