use super::{
    hold, same_bytes, set_archive_path, write_grouped, DestinationLocks, OutputFormat,
    OutputWriter, PendingMember, WriteOutcome,
};
use crate::catalog::CatalogEntry;
use crate::error::Error;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

const DEFLATE_LEVEL: i64 = 9;

type SetArchive = ZipArchive<BufReader<File>>;

/// Where a member of the rewritten archive comes from.
enum Content<'s> {
    /// Copied without recompression from this index of the old archive.
    Existing(usize),
    New(&'s Path),
}

struct Member<'s> {
    name: String,
    content: Content<'s>,
}

/// `<out>/<set>.zip` in canonical form: members sorted by lowercase name,
/// deflate level 9 and a fixed 1996-12-24 23:32 timestamp, so the same
/// members always produce the same bytes.
pub struct ZipFamilyWriter {
    out_root: PathBuf,
    locks: DestinationLocks,
}

impl ZipFamilyWriter {
    pub fn new(out_root: &Path) -> Self {
        Self {
            out_root: out_root.to_path_buf(),
            locks: DestinationLocks::default(),
        }
    }

    /// Apply every pending member to one set archive and rewrite it at most
    /// once.
    fn update_archive(&self, dest: &Path, pending: &[PendingMember<'_>]) -> Result<Vec<WriteOutcome>, Error> {
        let lock = self.locks.lock_for(dest);
        let _guard = hold(&lock);

        let mut old = if dest.is_file() {
            Some(ZipArchive::new(BufReader::new(File::open(dest)?))?)
        } else {
            None
        };
        let mut members = match old.as_mut() {
            Some(archive) => existing_members(archive)?,
            None => Vec::new(),
        };

        let mut outcomes = Vec::with_capacity(pending.len());
        for item in pending {
            let outcome = match members.iter_mut().find(|m| m.name == item.name) {
                Some(member) => {
                    let unchanged = match (&member.content, old.as_mut()) {
                        (Content::Existing(index), Some(archive)) => {
                            member_equals(archive, *index, item.source)?
                        }
                        _ => false,
                    };
                    if unchanged {
                        WriteOutcome::AlreadyPresent
                    } else {
                        member.content = Content::New(item.source);
                        WriteOutcome::Written
                    }
                }
                None => {
                    members.push(Member {
                        name: item.name.clone(),
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

        members.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.name.cmp(&b.name))
        });
        let tmp = write_members(dest, &members, old.as_mut())?;
        drop(old);
        tmp.persist(dest).map_err(|e| Error::write(dest, e.error))?;
        debug!("Wrote {} ({} members)", dest.display(), members.len());
        Ok(outcomes)
    }
}

impl OutputWriter for ZipFamilyWriter {
    fn format(&self) -> OutputFormat {
        OutputFormat::ZipFamily
    }

    fn write(&self, entry: &CatalogEntry, source: &Path) -> Result<WriteOutcome, Error> {
        self.write_many(&[(entry, source)])
            .pop()
            .unwrap_or_else(|| Err(Error::write(source, "nothing was written")))
    }

    fn write_many(&self, items: &[(&CatalogEntry, &Path)]) -> Vec<Result<WriteOutcome, Error>> {
        write_grouped(&self.out_root, ".zip", items, |dest, pending| {
            self.update_archive(dest, pending)
        })
    }

    fn destination(&self, entry: &CatalogEntry, _source: &Path) -> Result<PathBuf, Error> {
        set_archive_path(&self.out_root, &entry.set_name, ".zip")
    }
}

fn existing_members<'s>(archive: &mut SetArchive) -> Result<Vec<Member<'s>>, Error> {
    let mut members = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let file = archive.by_index_raw(index)?;
        if file.is_dir() {
            continue;
        }
        members.push(Member {
            name: file.name().to_string(),
            content: Content::Existing(index),
        });
    }
    Ok(members)
}

fn member_equals(archive: &mut SetArchive, index: usize, source: &Path) -> Result<bool, Error> {
    let file = archive.by_index(index)?;
    if file.size() != fs::metadata(source)?.len() {
        return Ok(false);
    }
    Ok(same_bytes(file, BufReader::new(File::open(source)?))?)
}

fn canonical_options() -> Result<SimpleFileOptions, Error> {
    let timestamp = DateTime::from_date_and_time(1996, 12, 24, 23, 32, 0)
        .map_err(|e| Error::Other(format!("invalid canonical zip timestamp: {}", e)))?;
    Ok(SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(DEFLATE_LEVEL))
        .last_modified_time(timestamp)
        .unix_permissions(0o644))
}

/// Stream `members` into a temporary archive next to `dest`. Existing
/// members are copied raw from `old`.
fn write_members(
    dest: &Path,
    members: &[Member<'_>],
    mut old: Option<&mut SetArchive>,
) -> Result<NamedTempFile, Error> {
    let dir = dest
        .parent()
        .ok_or_else(|| Error::write(dest, "no parent directory"))?;
    fs::create_dir_all(dir).map_err(|e| Error::write(dest, e))?;
    let options = canonical_options()?;

    let tmp = tempfile::Builder::new()
        .prefix(".romsmith-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| Error::write(dest, e))?;
    {
        let mut zip = ZipWriter::new(BufWriter::new(tmp.as_file()));
        for member in members {
            match member.content {
                Content::Existing(index) => {
                    let archive = old
                        .as_deref_mut()
                        .ok_or_else(|| Error::write(dest, "existing member without an archive"))?;
                    let file = archive.by_index_raw(index)?;
                    zip.raw_copy_file(file).map_err(|e| Error::write(dest, e))?;
                }
                Content::New(source) => {
                    zip.start_file(member.name.as_str(), options)
                        .map_err(|e| Error::write(dest, e))?;
                    let mut input = BufReader::new(File::open(source)?);
                    io::copy(&mut input, &mut zip).map_err(|e| Error::write(dest, e))?;
                }
            }
        }
        let mut out = zip.finish().map_err(|e| Error::write(dest, e))?;
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
    fn test_members_sorted_case_insensitively() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("x.bin");
        fs::write(&source, b"data").unwrap();

        let writer = ZipFamilyWriter::new(&tmp.path().join("out"));
        for name in ["b.rom", "C.rom", "a.rom"] {
            writer.write(&entry("Game", name), &source).unwrap();
        }

        let archive = ZipArchive::new(File::open(tmp.path().join("out/Game.zip")).unwrap()).unwrap();
        let names: Vec<&str> = archive.file_names().collect();
        assert_eq!(names, vec!["a.rom", "b.rom", "C.rom"]);
    }

    #[test]
    fn test_identical_member_is_not_rewritten() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("x.bin");
        fs::write(&source, b"data").unwrap();
        let writer = ZipFamilyWriter::new(tmp.path());

        assert_eq!(
            writer.write(&entry("Game", "a.rom"), &source).unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(
            writer.write(&entry("Game", "a.rom"), &source).unwrap(),
            WriteOutcome::AlreadyPresent
        );
    }

    #[test]
    fn test_batch_rewrites_set_once_and_keeps_members() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        let sources: Vec<PathBuf> = (0..4)
            .map(|i| {
                let path = tmp.path().join(format!("{}.bin", i));
                fs::write(&path, vec![i as u8; 1000 + i]).unwrap();
                path
            })
            .collect();
        let writer = ZipFamilyWriter::new(&out);
        writer.write(&entry("Game", "d.rom"), &sources[3]).unwrap();

        let entries: Vec<CatalogEntry> = ["c.rom", "a.rom", "b.rom", "d.rom"]
            .iter()
            .map(|name| entry("Game", name))
            .collect();
        let items: Vec<(&CatalogEntry, &Path)> = entries
            .iter()
            .zip(&sources)
            .map(|(e, s)| (e, s.as_path()))
            .collect();
        let results = writer.write_many(&items);
        let outcomes: Vec<WriteOutcome> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(
            outcomes,
            vec![
                WriteOutcome::Written,
                WriteOutcome::Written,
                WriteOutcome::Written,
                WriteOutcome::AlreadyPresent
            ]
        );

        let mut archive = ZipArchive::new(File::open(out.join("Game.zip")).unwrap()).unwrap();
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        assert_eq!(names, vec!["a.rom", "b.rom", "c.rom", "d.rom"]);
        let mut data = Vec::new();
        std::io::Read::read_to_end(&mut archive.by_name("d.rom").unwrap(), &mut data).unwrap();
        assert_eq!(data, vec![3u8; 1003]);
    }

    #[test]
    fn test_destination_is_set_archive() {
        let writer = ZipFamilyWriter::new(Path::new("/out"));
        assert_eq!(
            writer.destination(&entry("Game", "a.rom"), Path::new("x")).unwrap(),
            PathBuf::from("/out/Game.zip")
        );
    }
}
