use super::policy::ArchiveKind;
use crate::error::Error;
use flate2::read::GzDecoder;
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::trace;

/// One file inside a container, as listed from its index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub index: usize,
    pub name: String,
    pub size: u64,
    /// CRC32 recorded by the container itself, when the format keeps one.
    pub crc32: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExtractedFile {
    pub entry: ArchiveEntry,
    pub path: PathBuf,
}

/// Lists and extracts the entries of one container format.
///
/// Extracted files are written to `dest` under names derived from the entry
/// index, never from the stored entry name.
pub trait Extractor: Send + Sync {
    fn list(&self, archive: &Path) -> Result<Vec<ArchiveEntry>, Error>;

    fn extract(
        &self,
        archive: &Path,
        entries: &[ArchiveEntry],
        dest: &Path,
    ) -> Result<Vec<ExtractedFile>, Error>;
}

fn extracted_path(dest: &Path, entry: &ArchiveEntry) -> PathBuf {
    dest.join(format!("entry-{:06}", entry.index))
}

pub struct ZipExtractor;

impl Extractor for ZipExtractor {
    fn list(&self, archive: &Path) -> Result<Vec<ArchiveEntry>, Error> {
        let mut zip = zip::ZipArchive::new(BufReader::new(File::open(archive)?))
            .map_err(|e| Error::extraction(archive, e))?;
        let mut entries = Vec::with_capacity(zip.len());
        for index in 0..zip.len() {
            let file = zip
                .by_index(index)
                .map_err(|e| Error::extraction(archive, e))?;
            if file.is_dir() {
                continue;
            }
            entries.push(ArchiveEntry {
                index,
                name: file.name().to_string(),
                size: file.size(),
                crc32: Some(format!("{:08x}", file.crc32())),
            });
        }
        Ok(entries)
    }

    /// Entries are extracted in parallel on the current rayon pool, each
    /// task with its own archive handle.
    fn extract(
        &self,
        archive: &Path,
        entries: &[ArchiveEntry],
        dest: &Path,
    ) -> Result<Vec<ExtractedFile>, Error> {
        entries
            .par_iter()
            .map(|entry| {
                let mut zip = zip::ZipArchive::new(BufReader::new(File::open(archive)?))
                    .map_err(|e| Error::extraction(archive, e))?;
                let mut file = zip
                    .by_index(entry.index)
                    .map_err(|e| Error::extraction(archive, e))?;
                let path = extracted_path(dest, entry);
                let mut out = File::create(&path)?;
                io::copy(&mut file, &mut out).map_err(|e| Error::extraction(archive, e))?;
                trace!("Extracted {} from {}", entry.name, archive.display());
                Ok(ExtractedFile {
                    entry: entry.clone(),
                    path,
                })
            })
            .collect()
    }
}

pub struct TarExtractor;

impl Extractor for TarExtractor {
    fn list(&self, archive: &Path) -> Result<Vec<ArchiveEntry>, Error> {
        let mut tar = tar::Archive::new(BufReader::new(File::open(archive)?));
        let mut entries = Vec::new();
        let iter = tar.entries().map_err(|e| Error::extraction(archive, e))?;
        for (index, item) in iter.enumerate() {
            let item = item.map_err(|e| Error::extraction(archive, e))?;
            if !item.header().entry_type().is_file() {
                continue;
            }
            let name = item
                .path()
                .map_err(|e| Error::extraction(archive, e))?
                .to_string_lossy()
                .into_owned();
            entries.push(ArchiveEntry {
                index,
                name,
                size: item.size(),
                crc32: None,
            });
        }
        Ok(entries)
    }

    fn extract(
        &self,
        archive: &Path,
        entries: &[ArchiveEntry],
        dest: &Path,
    ) -> Result<Vec<ExtractedFile>, Error> {
        let wanted: HashSet<usize> = entries.iter().map(|e| e.index).collect();
        let mut tar = tar::Archive::new(BufReader::new(File::open(archive)?));
        let mut extracted = Vec::with_capacity(entries.len());
        let iter = tar.entries().map_err(|e| Error::extraction(archive, e))?;
        for (index, item) in iter.enumerate() {
            if !wanted.contains(&index) {
                continue;
            }
            let mut item = item.map_err(|e| Error::extraction(archive, e))?;
            let Some(entry) = entries.iter().find(|e| e.index == index) else {
                continue;
            };
            let path = extracted_path(dest, entry);
            let mut out = File::create(&path)?;
            io::copy(&mut item, &mut out).map_err(|e| Error::extraction(archive, e))?;
            extracted.push(ExtractedFile {
                entry: entry.clone(),
                path,
            });
        }
        Ok(extracted)
    }
}

/// Single-member gzip. The trailer supplies CRC32 and size without
/// decompressing.
pub struct GzipExtractor;

impl GzipExtractor {
    fn member_name(archive: &Path, decoder: &GzDecoder<BufReader<File>>) -> String {
        decoder
            .header()
            .and_then(|h| h.filename())
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .unwrap_or_else(|| {
                archive
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
    }
}

impl Extractor for GzipExtractor {
    fn list(&self, archive: &Path) -> Result<Vec<ArchiveEntry>, Error> {
        let decoder = GzDecoder::new(BufReader::new(File::open(archive)?));
        if decoder.header().is_none() {
            return Err(Error::extraction(archive, "not a gzip stream"));
        }
        let name = Self::member_name(archive, &decoder);

        let mut file = File::open(archive)?;
        if file.metadata()?.len() < 18 {
            return Err(Error::extraction(archive, "truncated gzip stream"));
        }
        let mut trailer = [0u8; 8];
        file.seek(SeekFrom::End(-8))?;
        file.read_exact(&mut trailer)?;
        let crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let size = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);

        Ok(vec![ArchiveEntry {
            index: 0,
            name,
            size: u64::from(size),
            crc32: Some(format!("{:08x}", crc)),
        }])
    }

    fn extract(
        &self,
        archive: &Path,
        entries: &[ArchiveEntry],
        dest: &Path,
    ) -> Result<Vec<ExtractedFile>, Error> {
        let Some(entry) = entries.iter().find(|e| e.index == 0) else {
            return Ok(Vec::new());
        };
        let mut decoder = GzDecoder::new(BufReader::new(File::open(archive)?));
        let path = extracted_path(dest, entry);
        let mut out = File::create(&path)?;
        io::copy(&mut decoder, &mut out).map_err(|e| Error::extraction(archive, e))?;
        Ok(vec![ExtractedFile {
            entry: entry.clone(),
            path,
        }])
    }
}

/// The extractor set used by a run, keyed by container kind.
pub struct Extractors {
    zip: Box<dyn Extractor>,
    tar: Box<dyn Extractor>,
    gzip: Box<dyn Extractor>,
}

impl Default for Extractors {
    fn default() -> Self {
        Self {
            zip: Box::new(ZipExtractor),
            tar: Box::new(TarExtractor),
            gzip: Box::new(GzipExtractor),
        }
    }
}

impl Extractors {
    /// 7z and rar are recognised for policy purposes but have no codec here.
    pub fn for_kind(&self, kind: ArchiveKind) -> Option<&dyn Extractor> {
        match kind {
            ArchiveKind::Zip => Some(self.zip.as_ref()),
            ArchiveKind::Tar => Some(self.tar.as_ref()),
            ArchiveKind::Gzip => Some(self.gzip.as_ref()),
            ArchiveKind::SevenZip | ArchiveKind::Rar => None,
        }
    }
}

/// Private scratch directory for one archive, removed when dropped.
pub fn scoped_temp_dir(parent: Option<&Path>) -> io::Result<tempfile::TempDir> {
    match parent {
        Some(parent) => {
            fs::create_dir_all(parent)?;
            tempfile::Builder::new().prefix("romsmith-").tempdir_in(parent)
        }
        None => tempfile::Builder::new().prefix("romsmith-").tempdir(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, data) in files {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_zip_list_reports_index_crc() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("set.zip");
        write_zip(&path, &[("a.rom", b"abc"), ("b.rom", b"123456789")]);

        let entries = ZipExtractor.list(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].crc32.as_deref(), Some("352441c2"));
        assert_eq!(entries[1].crc32.as_deref(), Some("cbf43926"));
        assert_eq!(entries[1].size, 9);
    }

    #[test]
    fn test_zip_extract_subset() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("set.zip");
        write_zip(&path, &[("a.rom", b"abc"), ("sub/b.rom", b"zzz")]);
        let dest = tmp.path().join("out");
        fs::create_dir_all(&dest).unwrap();

        let entries = ZipExtractor.list(&path).unwrap();
        let extracted = ZipExtractor.extract(&path, &entries, &dest).unwrap();
        assert_eq!(extracted.len(), 2);
        for file in &extracted {
            assert!(file.path.starts_with(&dest));
        }
        assert_eq!(fs::read(&extracted[0].path).unwrap(), b"abc");
    }

    #[test]
    fn test_gzip_trailer_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.rom.gz");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(b"123456789").unwrap();
        enc.finish().unwrap();

        let entries = GzipExtractor.list(&path).unwrap();
        assert_eq!(entries[0].name, "a.rom");
        assert_eq!(entries[0].size, 9);
        assert_eq!(entries[0].crc32.as_deref(), Some("cbf43926"));

        let extracted = GzipExtractor.extract(&path, &entries, tmp.path()).unwrap();
        assert_eq!(fs::read(&extracted[0].path).unwrap(), b"123456789");
    }

    #[test]
    fn test_tar_list_and_extract() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("set.tar");
        {
            let mut builder = tar::Builder::new(File::create(&path).unwrap());
            let mut header = tar::Header::new_gnu();
            header.set_size(3);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "a.rom", &b"abc"[..]).unwrap();
            builder.finish().unwrap();
        }
        let entries = TarExtractor.list(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.rom");
        assert!(entries[0].crc32.is_none());

        let extracted = TarExtractor.extract(&path, &entries, tmp.path()).unwrap();
        assert_eq!(fs::read(&extracted[0].path).unwrap(), b"abc");
    }

    #[test]
    fn test_corrupt_zip_is_extraction_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("broken.zip");
        fs::write(&path, b"PK\x03\x04 definitely not a zip").unwrap();
        assert!(matches!(
            ZipExtractor.list(&path),
            Err(Error::Extraction { .. })
        ));
    }
}
