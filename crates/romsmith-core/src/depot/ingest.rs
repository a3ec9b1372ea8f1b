use super::models::{DepotRecord, NeededMatch};
use super::store::StoreOutcome;
use super::Depot;
use crate::cancel::CancelToken;
use crate::error::Error;
use crate::hasher::HashSelection;
use crate::progress::ProgressReporter;
use crate::scan::{collect_input_files, Extractors, InputScanner, ScanLevels};
use crate::workers::WorkerPools;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub scan_levels: ScanLevels,
    pub ignore_patterns: Vec<String>,
    /// Skip files the index already knows about.
    pub only_needed: bool,
    pub needed_match: NeededMatch,
    pub workers: usize,
    pub sub_workers: usize,
    pub temp_root: Option<PathBuf>,
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IngestSummary {
    pub inputs: usize,
    /// Candidates hashed, including archive members.
    pub files: usize,
    /// Files newly compressed into the depot.
    pub stored: usize,
    /// SHA-1 rows newly created in the index.
    pub indexed: usize,
    /// Files whose SHA-1 row already existed.
    pub already_present: usize,
    /// Files skipped by only-needed mode.
    pub skipped: usize,
    /// Inputs that failed (policy, extraction or index transaction).
    pub failed: usize,
    pub conflicts: usize,
    pub cancelled: bool,
    pub duration: Duration,
}

impl IngestSummary {
    fn absorb(&mut self, input: InputTally) {
        self.files += input.files;
        self.stored += input.stored;
        self.indexed += input.indexed;
        self.already_present += input.already_present;
        self.skipped += input.skipped;
        self.conflicts += input.conflicts;
    }
}

#[derive(Debug, Default)]
struct InputTally {
    files: usize,
    stored: usize,
    indexed: usize,
    already_present: usize,
    skipped: usize,
    conflicts: usize,
}

/// Populate a depot from files, directories and archives.
///
/// Each top-level input is one index batch: its files are compressed into
/// the store first, then all of its rows are committed in one transaction.
/// A failed or cancelled batch leaves no rows behind.
pub fn ingest(
    depot: &Depot,
    roots: &[PathBuf],
    options: &IngestOptions,
    reporter: &dyn ProgressReporter,
    cancel: &CancelToken,
) -> Result<IngestSummary, Error> {
    let start = Instant::now();
    let pools = WorkerPools::new(options.workers, options.sub_workers)?;

    info!("Collecting depot inputs...");
    reporter.on_walk_start();
    let walk_start = Instant::now();
    let files = collect_input_files(roots, &options.ignore_patterns)?;
    reporter.on_walk_complete(files.len(), walk_start.elapsed().as_secs_f64());
    info!("Ingesting {} inputs into {}", files.len(), depot.label());

    let extractors = Extractors::default();
    let scanner = InputScanner {
        levels: options.scan_levels,
        extractors: &extractors,
        selection: HashSelection::DEPOT,
        quick_scan: false,
        temp_root: options.temp_root.clone(),
    };

    let total = files.len();
    let done = AtomicUsize::new(0);
    let summary = Mutex::new(IngestSummary {
        inputs: total,
        ..Default::default()
    });

    let run = pools.outer.install(|| {
        files.par_iter().try_for_each(|file| -> Result<(), Error> {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let result = pools
                .inner
                .install(|| ingest_input(depot, &scanner, file, options, cancel));

            let outcome = match result {
                Ok(tally) => {
                    lock(&summary).absorb(tally);
                    Ok(())
                }
                Err(Error::Cancelled) => {
                    debug!("Ingestion of {} cancelled", file.display());
                    Ok(())
                }
                Err(e) => {
                    lock(&summary).failed += 1;
                    if options.fail_fast {
                        error!("Ingestion of {} failed: {}", file.display(), e);
                        cancel.cancel();
                        Err(e)
                    } else {
                        warn!("Ingestion of {} failed: {}", file.display(), e);
                        Ok(())
                    }
                }
            };

            let completed = done.fetch_add(1, Ordering::Relaxed) + 1;
            reporter.on_input_complete(completed, total, &file.to_string_lossy());
            outcome
        })
    });

    let mut summary = summary.into_inner().unwrap_or_else(|e| e.into_inner());
    summary.cancelled = cancel.is_cancelled();
    summary.duration = start.elapsed();
    reporter.on_run_complete(summary.duration.as_secs_f64());
    run?;

    info!(
        "Depot ingestion finished in {:.2}s: {} stored, {} already present, {} skipped, {} failed",
        summary.duration.as_secs_f64(),
        summary.stored,
        summary.already_present,
        summary.skipped,
        summary.failed
    );
    Ok(summary)
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn ingest_input(
    depot: &Depot,
    scanner: &InputScanner<'_>,
    file: &Path,
    options: &IngestOptions,
    cancel: &CancelToken,
) -> Result<InputTally, Error> {
    let scanned = scanner.scan(file)?;
    let mut tally = InputTally::default();
    let mut records = Vec::with_capacity(scanned.candidates.len());

    for candidate in &scanned.candidates {
        tally.files += 1;
        if options.only_needed && depot.contains(&candidate.hashes, options.needed_match)? {
            debug!("{} already in depot, skipping", candidate.path.display());
            tally.skipped += 1;
            continue;
        }

        let (Some(local), Some(record)) = (
            candidate.local_path(),
            DepotRecord::from_hashes(&candidate.hashes, depot.label()),
        ) else {
            warn!("{} has no readable content, skipping", candidate.path.display());
            continue;
        };

        if depot.store().store_file(local, &candidate.hashes)? == StoreOutcome::Stored {
            tally.stored += 1;
        }
        records.push(record);
    }

    if !records.is_empty() {
        let outcome = depot.index().ingest_batch(&records, Some(cancel))?;
        tally.indexed = outcome.inserted;
        tally.already_present = outcome.already_present;
        tally.conflicts = outcome.conflicts.len();
    }
    Ok(tally)
}
