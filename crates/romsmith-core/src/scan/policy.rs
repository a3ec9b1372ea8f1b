use crate::error::Error;
use serde::Deserialize;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const MAGIC_HEADER_LENGTH: usize = 262;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveKind {
    Zip,
    Tar,
    Gzip,
    SevenZip,
    Rar,
}

/// The four container families that carry their own scan level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFamily {
    Zip,
    Gzip,
    SevenZip,
    Rar,
}

impl ArchiveKind {
    pub fn family(self) -> ArchiveFamily {
        match self {
            ArchiveKind::Zip | ArchiveKind::Tar => ArchiveFamily::Zip,
            ArchiveKind::Gzip => ArchiveFamily::Gzip,
            ArchiveKind::SevenZip => ArchiveFamily::SevenZip,
            ArchiveKind::Rar => ArchiveFamily::Rar,
        }
    }

    /// Detect a container by magic bytes, falling back to the extension.
    pub fn detect(path: &Path) -> io::Result<Option<ArchiveKind>> {
        let mut header = Vec::with_capacity(MAGIC_HEADER_LENGTH);
        File::open(path)?
            .take(MAGIC_HEADER_LENGTH as u64)
            .read_to_end(&mut header)?;

        if let Some(kind) = Self::from_magic(&header) {
            return Ok(Some(kind));
        }
        Ok(Self::from_extension(path))
    }

    pub fn from_magic(header: &[u8]) -> Option<ArchiveKind> {
        if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
            Some(ArchiveKind::Zip)
        } else if header.starts_with(&[0x1f, 0x8b]) {
            Some(ArchiveKind::Gzip)
        } else if header.starts_with(&[0x37, 0x7a, 0xbc, 0xaf, 0x27, 0x1c]) {
            Some(ArchiveKind::SevenZip)
        } else if header.starts_with(b"Rar!\x1a\x07") {
            Some(ArchiveKind::Rar)
        } else if header.len() >= 262 && &header[257..262] == b"ustar" {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }

    pub fn from_extension(path: &Path) -> Option<ArchiveKind> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "zip" => Some(ArchiveKind::Zip),
            "tar" => Some(ArchiveKind::Tar),
            "gz" | "tgz" => Some(ArchiveKind::Gzip),
            "7z" => Some(ArchiveKind::SevenZip),
            "rar" => Some(ArchiveKind::Rar),
            _ => None,
        }
    }
}

/// How to treat one input: as an opaque file, by recursing into it, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanDecision {
    pub treat_as_file: bool,
    pub recurse: bool,
}

impl ScanDecision {
    pub const PLAIN_FILE: ScanDecision = ScanDecision {
        treat_as_file: true,
        recurse: false,
    };
}

/// Per-family scan levels.
///
/// `0` recurses only, `1` recurses and also treats the container as a
/// candidate, `>1` treats the container as a candidate without recursing.
/// Negative levels resolve to "do nothing": inputs of that family fail
/// with a policy error while the rest of the run carries on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct ScanLevels {
    pub zip: i64,
    pub gzip: i64,
    pub sevenzip: i64,
    pub rar: i64,
}

impl ScanLevels {
    pub fn uniform(level: i64) -> Self {
        Self {
            zip: level,
            gzip: level,
            sevenzip: level,
            rar: level,
        }
    }

    pub fn level_for(&self, family: ArchiveFamily) -> i64 {
        match family {
            ArchiveFamily::Zip => self.zip,
            ArchiveFamily::Gzip => self.gzip,
            ArchiveFamily::SevenZip => self.sevenzip,
            ArchiveFamily::Rar => self.rar,
        }
    }

    /// Resolve the decision for a file of the given container kind
    /// (`None` for a plain file).
    pub fn decide(&self, kind: Option<ArchiveKind>, path: &Path) -> Result<ScanDecision, Error> {
        let Some(kind) = kind else {
            return Ok(ScanDecision::PLAIN_FILE);
        };

        let level = self.level_for(kind.family());
        let decision = ScanDecision {
            treat_as_file: level >= 1,
            recurse: level == 0 || level == 1,
        };

        if !decision.treat_as_file && !decision.recurse {
            return Err(Error::Policy {
                path: path.to_path_buf(),
                reason: format!("scan level {} for {:?} selects no processing", level, kind),
            });
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_levels_map_to_decisions() {
        let path = PathBuf::from("set.zip");
        let zip = Some(ArchiveKind::Zip);

        let d0 = ScanLevels::uniform(0).decide(zip, &path).unwrap();
        assert_eq!((d0.treat_as_file, d0.recurse), (false, true));

        let d1 = ScanLevels::uniform(1).decide(zip, &path).unwrap();
        assert_eq!((d1.treat_as_file, d1.recurse), (true, true));

        let d2 = ScanLevels::uniform(2).decide(zip, &path).unwrap();
        assert_eq!((d2.treat_as_file, d2.recurse), (true, false));

        let d9 = ScanLevels::uniform(9).decide(zip, &path).unwrap();
        assert_eq!(d9, d2);
    }

    #[test]
    fn test_plain_file_is_always_a_candidate() {
        let decision = ScanLevels::uniform(-1)
            .decide(None, Path::new("a.rom"))
            .unwrap();
        assert_eq!(decision, ScanDecision::PLAIN_FILE);
    }

    #[test]
    fn test_do_nothing_level_fails_only_its_family() {
        let levels = ScanLevels {
            rar: -1,
            ..Default::default()
        };
        assert!(levels.decide(Some(ArchiveKind::Zip), Path::new("a.zip")).is_ok());
        let err = levels
            .decide(Some(ArchiveKind::Rar), Path::new("a.rar"))
            .unwrap_err();
        assert!(matches!(err, Error::Policy { .. }));
    }

    #[test]
    fn test_families_are_independent() {
        let levels = ScanLevels {
            zip: 2,
            gzip: 0,
            sevenzip: 1,
            rar: 0,
        };
        let p = Path::new("x");
        assert!(!levels.decide(Some(ArchiveKind::Tar), p).unwrap().recurse);
        assert!(!levels.decide(Some(ArchiveKind::Gzip), p).unwrap().treat_as_file);
        let sz = levels.decide(Some(ArchiveKind::SevenZip), p).unwrap();
        assert!(sz.treat_as_file && sz.recurse);
    }

    #[test]
    fn test_magic_detection() {
        assert_eq!(ArchiveKind::from_magic(b"PK\x03\x04rest"), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::from_magic(&[0x1f, 0x8b, 8]), Some(ArchiveKind::Gzip));
        assert_eq!(ArchiveKind::from_magic(b"Rar!\x1a\x07\x00"), Some(ArchiveKind::Rar));
        assert_eq!(ArchiveKind::from_magic(b"plain rom data"), None);
        let mut tar_header = vec![0u8; 262];
        tar_header[257..262].copy_from_slice(b"ustar");
        assert_eq!(ArchiveKind::from_magic(&tar_header), Some(ArchiveKind::Tar));
        assert_eq!(
            ArchiveKind::from_extension(Path::new("Game.7Z")),
            Some(ArchiveKind::SevenZip)
        );
    }
}
