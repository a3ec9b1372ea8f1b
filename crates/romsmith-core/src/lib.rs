pub mod cancel;
pub mod catalog;
pub mod config;
pub mod depot;
pub mod error;
pub mod hasher;
pub mod output;
pub mod progress;
pub mod rebuild;
pub mod scan;
pub mod workers;

pub use cancel::CancelToken;
pub use catalog::{Catalog, CatalogEntry, CatalogIndex, DupeClassification, Locality, Scope};
pub use config::AppConfig;
pub use depot::{Depot, DepotIndex, NeededMatch};
pub use error::Error;
pub use output::{create_writer, OutputFormat, OutputWriter, WriteOutcome};
pub use progress::{ProgressReporter, SilentReporter};
pub use rebuild::{RebuildMode, RebuildOptions, RebuildSummary, Rebuilder};
