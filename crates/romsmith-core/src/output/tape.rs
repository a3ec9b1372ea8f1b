use super::{
    hold, same_bytes, set_archive_path, write_grouped, DestinationLocks, OutputFormat,
    OutputWriter, PendingMember, WriteOutcome,
};
use crate::catalog::CatalogEntry;
use crate::error::Error;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tar::{EntryType, Header};
use tempfile::NamedTempFile;
use tracing::debug;

/// Where a member of the rewritten archive comes from.
enum Content<'s> {
    /// `size` bytes at `offset` in the old archive.
    Existing { offset: u64, size: u64 },
    New(&'s Path),
}

struct Member<'s> {
    name: String,
    mtime: u64,
    content: Content<'s>,
}

/// `<out>/<set>.tar` with members sorted by name and fixed header fields.
pub struct TapeArchiveWriter {
    out_root: PathBuf,
    preserve_timestamps: bool,
    locks: DestinationLocks,
}

impl TapeArchiveWriter {
    pub fn new(out_root: &Path, preserve_timestamps: bool) -> Self {
        Self {
            out_root: out_root.to_path_buf(),
            preserve_timestamps,
            locks: DestinationLocks::default(),
        }
    }

    fn mtime_for(&self, entry: &CatalogEntry) -> u64 {
        if !self.preserve_timestamps {
            return 0;
        }
        entry
            .modified_time()
            .and_then(|t| u64::try_from(t.and_utc().timestamp()).ok())
            .unwrap_or(0)
    }

    fn update_archive(&self, dest: &Path, pending: &[PendingMember<'_>]) -> Result<Vec<WriteOutcome>, Error> {
        let lock = self.locks.lock_for(dest);
        let _guard = hold(&lock);

        let mut old = if dest.is_file() {
            Some(File::open(dest)?)
        } else {
            None
        };
        let mut members = match old.as_mut() {
            Some(file) => existing_members(file)?,
            None => Vec::new(),
        };

        let mut outcomes = Vec::with_capacity(pending.len());
        for item in pending {
            let mtime = self.mtime_for(item.entry);
            let outcome = match members.iter_mut().find(|m| m.name == item.name) {
                Some(member) => {
                    let unchanged = member.mtime == mtime
                        && match (&member.content, old.as_mut()) {
                            (Content::Existing { offset, size }, Some(file)) => {
                                region_equals(file, *offset, *size, item.source)?
                            }
                            _ => false,
                        };
                    if unchanged {
                        WriteOutcome::AlreadyPresent
                    } else {
                        member.mtime = mtime;
                        member.content = Content::New(item.source);
                        WriteOutcome::Written
                    }
                }
                None => {
                    members.push(Member {
                        name: item.name.clone(),
                        mtime,
                        content: Content::New(item.source),
                    });
                    WriteOutcome::Written
                }
            };
            outcomes.push(outcome);
        }

        if outcomes.iter().all(|o| *o == WriteOutcome::AlreadyPresent) {
            return Ok(outcomes);
        }

        members.sort_by(|a, b| a.name.cmp(&b.name));
        let tmp = write_members(dest, &members, old.as_mut())?;
        drop(old);
        tmp.persist(dest).map_err(|e| Error::write(dest, e.error))?;
        debug!("Wrote {} ({} members)", dest.display(), members.len());
        Ok(outcomes)
    }
}

impl OutputWriter for TapeArchiveWriter {
    fn format(&self) -> OutputFormat {
        OutputFormat::TapeArchive
    }

    fn write(&self, entry: &CatalogEntry, source: &Path) -> Result<WriteOutcome, Error> {
        self.write_many(&[(entry, source)])
            .pop()
            .unwrap_or_else(|| Err(Error::write(source, "nothing was written")))
    }

    fn write_many(&self, items: &[(&CatalogEntry, &Path)]) -> Vec<Result<WriteOutcome, Error>> {
        write_grouped(&self.out_root, ".tar", items, |dest, pending| {
            self.update_archive(dest, pending)
        })
    }

    fn destination(&self, entry: &CatalogEntry, _source: &Path) -> Result<PathBuf, Error> {
        set_archive_path(&self.out_root, &entry.set_name, ".tar")
    }
}

/// Regular-file members of an existing archive with the position of their
/// data.
fn existing_members<'s>(file: &mut File) -> std::io::Result<Vec<Member<'s>>> {
    file.seek(SeekFrom::Start(0))?;
    let mut archive = tar::Archive::new(BufReader::new(&*file));
    let mut members = Vec::new();
    for item in archive.entries()? {
        let item = item?;
        if !item.header().entry_type().is_file() {
            continue;
        }
        members.push(Member {
            name: item.path()?.to_string_lossy().into_owned(),
            mtime: item.header().mtime()?,
            content: Content::Existing {
                offset: item.raw_file_position(),
                size: item.size(),
            },
        });
    }
    Ok(members)
}

fn region_equals(file: &mut File, offset: u64, size: u64, source: &Path) -> std::io::Result<bool> {
    if fs::metadata(source)?.len() != size {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(offset))?;
    same_bytes(
        BufReader::new(&mut *file).take(size),
        BufReader::new(File::open(source)?),
    )
}

fn write_members(
    dest: &Path,
    members: &[Member<'_>],
    mut old: Option<&mut File>,
) -> Result<NamedTempFile, Error> {
    let dir = dest
        .parent()
        .ok_or_else(|| Error::write(dest, "no parent directory"))?;
    fs::create_dir_all(dir).map_err(|e| Error::write(dest, e))?;

    let tmp = tempfile::Builder::new()
        .prefix(".romsmith-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| Error::write(dest, e))?;
    {
        let mut builder = tar::Builder::new(BufWriter::new(tmp.as_file()));
        for member in members {
            let mut header = Header::new_ustar();
            header.set_entry_type(EntryType::Regular);
            header.set_mode(0o644);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(member.mtime);
            match member.content {
                Content::Existing { offset, size } => {
                    let file = old
                        .as_deref_mut()
                        .ok_or_else(|| Error::write(dest, "existing member without an archive"))?;
                    file.seek(SeekFrom::Start(offset))?;
                    header.set_size(size);
                    builder
                        .append_data(&mut header, &member.name, BufReader::new(&mut *file).take(size))
                        .map_err(|e| Error::write(dest, e))?;
                }
                Content::New(source) => {
                    let input = File::open(source)?;
                    header.set_size(input.metadata()?.len());
                    builder
                        .append_data(&mut header, &member.name, BufReader::new(input))
                        .map_err(|e| Error::write(dest, e))?;
                }
            }
        }
        let mut out = builder.into_inner().map_err(|e| Error::write(dest, e))?;
        out.flush().map_err(|e| Error::write(dest, e))?;
    }
    Ok(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(set: &str, name: &str) -> CatalogEntry {
        CatalogEntry {
            name: name.to_string(),
            set_name: set.to_string(),
            crc32: Some("00000000".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_members_sorted_with_fixed_headers() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.bin");
        let b = tmp.path().join("b.bin");
        fs::write(&a, b"aaaa").unwrap();
        fs::write(&b, b"bb").unwrap();

        let writer = TapeArchiveWriter::new(&tmp.path().join("out"), false);
        writer.write(&entry("Game", "z.rom"), &a).unwrap();
        writer.write(&entry("Game", "m.rom"), &b).unwrap();
        assert_eq!(
            writer.write(&entry("Game", "m.rom"), &b).unwrap(),
            WriteOutcome::AlreadyPresent
        );

        let mut archive = tar::Archive::new(File::open(tmp.path().join("out/Game.tar")).unwrap());
        let mut seen = Vec::new();
        for item in archive.entries().unwrap() {
            let mut item = item.unwrap();
            assert_eq!(item.header().mtime().unwrap(), 0);
            let name = item.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            item.read_to_end(&mut data).unwrap();
            seen.push((name, data));
        }
        assert_eq!(
            seen,
            vec![
                ("m.rom".to_string(), b"bb".to_vec()),
                ("z.rom".to_string(), b"aaaa".to_vec())
            ]
        );
    }

    #[test]
    fn test_batch_spanning_two_sets_keeps_existing_members() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        let old = tmp.path().join("old.bin");
        let new = tmp.path().join("new.bin");
        fs::write(&old, vec![1u8; 1500]).unwrap();
        fs::write(&new, b"fresh").unwrap();
        let writer = TapeArchiveWriter::new(&out, false);
        writer.write(&entry("One", "z.rom"), &old).unwrap();

        let first = entry("One", "a.rom");
        let second = entry("Two", "b.rom");
        let results = writer.write_many(&[(&first, new.as_path()), (&second, new.as_path())]);
        assert!(results.iter().all(|r| matches!(r, Ok(WriteOutcome::Written))));

        let mut archive = tar::Archive::new(File::open(out.join("One.tar")).unwrap());
        let mut seen = Vec::new();
        for item in archive.entries().unwrap() {
            let mut item = item.unwrap();
            let name = item.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            item.read_to_end(&mut data).unwrap();
            seen.push((name, data));
        }
        assert_eq!(
            seen,
            vec![
                ("a.rom".to_string(), b"fresh".to_vec()),
                ("z.rom".to_string(), vec![1u8; 1500])
            ]
        );
        assert!(out.join("Two.tar").is_file());
    }

    #[test]
    fn test_rejects_parent_components() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.bin");
        fs::write(&a, b"a").unwrap();
        let writer = TapeArchiveWriter::new(tmp.path(), false);
        assert!(matches!(
            writer.write(&entry("Game", "../x.rom"), &a),
            Err(Error::Write { .. })
        ));
    }
}
