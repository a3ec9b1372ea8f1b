pub mod extract;
pub mod input;
pub mod policy;
pub mod walk;

pub use extract::{ArchiveEntry, ExtractedFile, Extractor, Extractors};
pub use input::{CandidateFile, InputScanner, ScannedInput, CANDIDATE_SOURCE_ID};
pub use policy::{ArchiveFamily, ArchiveKind, ScanDecision, ScanLevels};
pub use walk::collect_input_files;
