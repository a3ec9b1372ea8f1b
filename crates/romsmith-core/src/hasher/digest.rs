use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

const READ_BUFFER_LENGTH: usize = 64 * 1024; // 64KB

/// Which digests to compute while streaming a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashSelection {
    pub crc32: bool,
    pub md5: bool,
    pub sha1: bool,
    pub sha256: bool,
}

impl HashSelection {
    pub const ALL: HashSelection = HashSelection {
        crc32: true,
        md5: true,
        sha1: true,
        sha256: true,
    };

    /// The three digests a depot cross-references.
    pub const DEPOT: HashSelection = HashSelection {
        crc32: true,
        md5: true,
        sha1: true,
        sha256: false,
    };

    pub const CRC_ONLY: HashSelection = HashSelection {
        crc32: true,
        md5: false,
        sha1: false,
        sha256: false,
    };
}

/// Lowercase hex digests plus the byte count that produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hashes {
    pub size: u64,
    pub crc32: Option<String>,
    pub md5: Option<String>,
    pub sha1: Option<String>,
    pub sha256: Option<String>,
}

impl Hashes {
    pub fn has_any(&self) -> bool {
        self.crc32.is_some() || self.md5.is_some() || self.sha1.is_some() || self.sha256.is_some()
    }

    /// True when every digest in `selection` is present.
    pub fn covers(&self, selection: HashSelection) -> bool {
        (!selection.crc32 || self.crc32.is_some())
            && (!selection.md5 || self.md5.is_some())
            && (!selection.sha1 || self.sha1.is_some())
            && (!selection.sha256 || self.sha256.is_some())
    }
}

/// Feeds one stream of bytes to every selected digest at once.
pub struct MultiHasher {
    size: u64,
    crc32: Option<crc32fast::Hasher>,
    md5: Option<Md5>,
    sha1: Option<Sha1>,
    sha256: Option<Sha256>,
}

impl MultiHasher {
    pub fn new(selection: HashSelection) -> Self {
        Self {
            size: 0,
            crc32: selection.crc32.then(crc32fast::Hasher::new),
            md5: selection.md5.then(Md5::new),
            sha1: selection.sha1.then(Sha1::new),
            sha256: selection.sha256.then(Sha256::new),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.size += data.len() as u64;
        if let Some(h) = self.crc32.as_mut() {
            h.update(data);
        }
        if let Some(h) = self.md5.as_mut() {
            h.update(data);
        }
        if let Some(h) = self.sha1.as_mut() {
            h.update(data);
        }
        if let Some(h) = self.sha256.as_mut() {
            h.update(data);
        }
    }

    pub fn finish(self) -> Hashes {
        Hashes {
            size: self.size,
            crc32: self.crc32.map(|h| format!("{:08x}", h.finalize())),
            md5: self.md5.map(|h| hex::encode(h.finalize())),
            sha1: self.sha1.map(|h| hex::encode(h.finalize())),
            sha256: self.sha256.map(|h| hex::encode(h.finalize())),
        }
    }
}

impl Write for MultiHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn hash_reader<R: Read>(mut reader: R, selection: HashSelection) -> io::Result<Hashes> {
    let mut hasher = MultiHasher::new(selection);
    let mut buffer = vec![0; READ_BUFFER_LENGTH];
    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hasher.finish())
}

pub fn hash_file(file: &Path, selection: HashSelection) -> io::Result<Hashes> {
    let f = File::open(file)?;
    hash_reader(f, selection)
}

pub fn hash_data(data: &[u8], selection: HashSelection) -> Hashes {
    let mut hasher = MultiHasher::new(selection);
    hasher.update(data);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors_abc() {
        let hashes = hash_data(b"abc", HashSelection::ALL);
        assert_eq!(hashes.size, 3);
        assert_eq!(hashes.crc32.as_deref(), Some("352441c2"));
        assert_eq!(
            hashes.md5.as_deref(),
            Some("900150983cd24fb0d6963f7d28e17f72")
        );
        assert_eq!(
            hashes.sha1.as_deref(),
            Some("a9993e364706816aba3e25717850c26c9cd0d89d")
        );
        assert_eq!(
            hashes.sha256.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_crc_check_value() {
        let hashes = hash_data(b"123456789", HashSelection::CRC_ONLY);
        assert_eq!(hashes.crc32.as_deref(), Some("cbf43926"));
        assert!(hashes.md5.is_none());
        assert!(hashes.sha1.is_none());
    }

    #[test]
    fn test_stream_matches_one_shot() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let streamed = hash_reader(&data[..], HashSelection::DEPOT).unwrap();
        assert_eq!(streamed, hash_data(&data, HashSelection::DEPOT));
        assert!(streamed.covers(HashSelection::DEPOT));
        assert!(!streamed.covers(HashSelection::ALL));
    }

    #[test]
    fn test_empty_input() {
        let hashes = hash_data(b"", HashSelection::ALL);
        assert_eq!(hashes.size, 0);
        assert_eq!(hashes.crc32.as_deref(), Some("00000000"));
        assert_eq!(
            hashes.sha1.as_deref(),
            Some("da39a3ee5e6b4b0d3255bfef95601890afd80709")
        );
    }
}
