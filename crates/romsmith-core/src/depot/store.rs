use crate::error::Error;
use crate::hasher::Hashes;
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Operating system byte written into every stored gzip header ("unknown").
const GZIP_OS_UNKNOWN: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    AlreadyPresent,
}

/// The on-disk half of a depot: one canonical gzip file per SHA-1.
#[derive(Debug, Clone)]
pub struct DepotStore {
    root: PathBuf,
}

impl DepotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `aa/bb/cc/dd/<sha1>.gz` for a lowercase SHA-1.
    pub fn relative_path(sha1: &str) -> Result<PathBuf, Error> {
        if sha1.len() != 40 || !sha1.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidSetting(format!("'{}' is not a SHA-1", sha1)));
        }
        let sha1 = sha1.to_ascii_lowercase();
        Ok(PathBuf::from(&sha1[0..2])
            .join(&sha1[2..4])
            .join(&sha1[4..6])
            .join(&sha1[6..8])
            .join(format!("{}.gz", sha1)))
    }

    pub fn path_for(&self, sha1: &str) -> Result<PathBuf, Error> {
        Ok(self.root.join(Self::relative_path(sha1)?))
    }

    pub fn contains(&self, sha1: &str) -> bool {
        self.path_for(sha1).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Compress `source` into its canonical location unless it is already
    /// there. `hashes` must carry the CRC32, MD5 and SHA-1 of `source`.
    pub fn store_file(&self, source: &Path, hashes: &Hashes) -> Result<StoreOutcome, Error> {
        let (Some(crc32), Some(md5), Some(sha1)) = (
            hashes.crc32.as_deref(),
            hashes.md5.as_deref(),
            hashes.sha1.as_deref(),
        ) else {
            return Err(Error::write(
                source,
                "depot storage needs CRC32, MD5 and SHA-1",
            ));
        };

        let dest = self.path_for(sha1)?;
        if dest.is_file() {
            trace!("{} already stored", sha1);
            return Ok(StoreOutcome::AlreadyPresent);
        }

        let shard = dest
            .parent()
            .ok_or_else(|| Error::write(&dest, "no parent directory"))?;
        fs::create_dir_all(shard)?;

        let extra = header_extra(crc32, md5, hashes.size).map_err(|e| Error::write(&dest, e))?;
        let tmp = tempfile::Builder::new()
            .prefix(".romsmith-")
            .suffix(".tmp")
            .tempfile_in(shard)?;
        {
            let mut encoder = GzBuilder::new()
                .extra(extra)
                .mtime(0)
                .operating_system(GZIP_OS_UNKNOWN)
                .write(BufWriter::new(tmp.as_file()), Compression::best());
            let mut input = BufReader::new(File::open(source)?);
            io::copy(&mut input, &mut encoder)?;
            encoder.finish()?.flush()?;
        }
        match tmp.persist_noclobber(&dest) {
            Ok(_) => {
                debug!("Stored {} as {}", source.display(), dest.display());
                Ok(StoreOutcome::Stored)
            }
            // Another worker stored the same content first.
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                Ok(StoreOutcome::AlreadyPresent)
            }
            Err(e) => Err(Error::write(&dest, e.error)),
        }
    }

    /// Decompressed view of a stored file.
    pub fn open(&self, sha1: &str) -> Result<GzDecoder<BufReader<File>>, Error> {
        let path = self.path_for(sha1)?;
        Ok(GzDecoder::new(BufReader::new(File::open(path)?)))
    }
}

/// MD5 (16 bytes), CRC32 (4 bytes, big endian), size (8 bytes, big endian).
fn header_extra(crc32: &str, md5: &str, size: u64) -> Result<Vec<u8>, hex::FromHexError> {
    let mut extra = Vec::with_capacity(28);
    extra.extend_from_slice(&hex::decode(md5)?);
    extra.extend_from_slice(&hex::decode(crc32)?);
    extra.extend_from_slice(&size.to_be_bytes());
    Ok(extra)
}
