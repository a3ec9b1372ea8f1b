use crate::catalog::DedupeMode;
use crate::depot::{IngestOptions, NeededMatch};
use crate::error::Error;
use crate::output::OutputFormat;
use crate::rebuild::{RebuildMode, RebuildOptions};
use crate::scan::ScanLevels;
use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides, e.g. `ROMSMITH__SCAN_LEVELS__ZIP=2`.
pub const ENV_PREFIX: &str = "ROMSMITH";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DepotConfig {
    pub root: Option<PathBuf>,
    /// Defaults to `<root>/depot.sqlite`.
    pub database: Option<PathBuf>,
    pub only_needed: bool,
    pub needed_match: NeededMatch,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub root_paths: Vec<String>,
    pub ignore_patterns: Vec<String>,
    pub scan_levels: ScanLevels,
    /// Outer pool size; `0` means one per CPU.
    pub workers: usize,
    /// Inner pool size; `0` means `min(4, cpus)`.
    pub sub_workers: usize,
    pub quick_scan: bool,
    pub output_format: OutputFormat,
    pub output_root: Option<PathBuf>,
    pub delete_on_success: bool,
    pub inverse: bool,
    pub preserve_timestamps: bool,
    pub update_dat: bool,
    pub dedupe: DedupeMode,
    pub fail_fast: bool,
    pub timeout_secs: Option<u64>,
    pub temp_dir: Option<PathBuf>,
    pub depot: DepotConfig,
}

impl AppConfig {
    /// Reject settings that would make a run meaningless before it starts.
    pub fn validate(&self) -> Result<(), Error> {
        if self.output_format == OutputFormat::ContentAddressed && self.depot.root.is_none() {
            return Err(Error::InvalidSetting(
                "output_format = content_addressed needs depot.root".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    pub fn input_paths(&self) -> Vec<PathBuf> {
        non_overlapping_directories(self.root_paths.clone())
            .into_iter()
            .map(PathBuf::from)
            .collect()
    }

    pub fn rebuild_options(&self) -> RebuildOptions {
        RebuildOptions {
            mode: if self.inverse {
                RebuildMode::Inverse
            } else {
                RebuildMode::Forward
            },
            scan_levels: self.scan_levels,
            ignore_patterns: self.ignore_patterns.clone(),
            quick_scan: self.quick_scan,
            workers: self.workers,
            sub_workers: self.sub_workers,
            delete_on_success: self.delete_on_success,
            update_dat: self.update_dat,
            fail_fast: self.fail_fast,
            temp_root: self.temp_dir.clone(),
        }
    }

    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            scan_levels: self.scan_levels,
            ignore_patterns: self.ignore_patterns.clone(),
            only_needed: self.depot.only_needed,
            needed_match: self.depot.needed_match,
            workers: self.workers,
            sub_workers: self.sub_workers,
            temp_root: self.temp_dir.clone(),
            fail_fast: self.fail_fast,
        }
    }
}

/// `Config.*` in the working directory, then `ROMSMITH__*` environment
/// variables.
pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    load_configuration_from(Path::new("Config"))
}

pub fn load_configuration_from(file: &Path) -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::from(file).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("root_paths")
                .with_list_parse_key("ignore_patterns")
                .try_parsing(true),
        )
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

/// Remove directories that are subdirectories of other directories in the list.
pub fn non_overlapping_directories(dirs: Vec<String>) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();

    for dir in dirs {
        let dir_path = Path::new(&dir);
        if result.iter().any(|kept| dir_path.starts_with(kept)) {
            continue;
        }
        result.retain(|kept| !Path::new(kept).starts_with(dir_path));
        result.push(dir);
    }

    result
}
