//! Match-and-rebuild pipeline.
//!
//! Each top-level input runs on the outer worker pool: the scan policy
//! decides how to treat it, candidates are hashed (or read from the
//! container index in quick-scan mode), looked up in the catalog index and
//! handed to the run's output writer.

use crate::cancel::CancelToken;
use crate::catalog::{Catalog, CatalogEntry, CatalogIndex, ItemKind};
use crate::error::Error;
use crate::hasher::HashSelection;
use crate::output::{same_file, OutputWriter, WriteOutcome};
use crate::progress::ProgressReporter;
use crate::scan::input::file_stem;
use crate::scan::{collect_input_files, CandidateFile, Extractors, InputScanner, ScanLevels};
use crate::workers::WorkerPools;
use rayon::prelude::*;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebuildMode {
    /// Write files that match the catalog.
    #[default]
    Forward,
    /// Write files that match nothing, each as its own set.
    Inverse,
}

#[derive(Debug, Clone, Default)]
pub struct RebuildOptions {
    pub mode: RebuildMode,
    pub scan_levels: ScanLevels,
    pub ignore_patterns: Vec<String>,
    /// Match archive members by the CRC32 their container records and
    /// extract only what is written.
    pub quick_scan: bool,
    pub workers: usize,
    pub sub_workers: usize,
    /// Remove a top-level input once everything it produced was written.
    pub delete_on_success: bool,
    /// Consume written entries from the index so the rest form a fixdat.
    pub update_dat: bool,
    pub fail_fast: bool,
    pub temp_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct RebuildSummary {
    pub inputs: usize,
    pub candidates: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub written: usize,
    /// Writes that found identical content already in place.
    pub skipped: usize,
    /// Inputs or writes that failed.
    pub failed: usize,
    pub deleted: usize,
    pub cancelled: bool,
    pub duration: Duration,
}

#[derive(Default)]
struct Counters {
    candidates: AtomicUsize,
    matched: AtomicUsize,
    unmatched: AtomicUsize,
    written: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    deleted: AtomicUsize,
    done: AtomicUsize,
}

impl Counters {
    fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Per-input write tally used for the delete-on-success decision.
#[derive(Debug, Default)]
struct InputOutcome {
    writes: usize,
    failed_writes: usize,
    /// Writes whose destination is the input file itself.
    onto_input: usize,
}

pub struct Rebuilder<'a> {
    index: &'a CatalogIndex,
    writer: &'a dyn OutputWriter,
    options: RebuildOptions,
    extractors: Extractors,
}

impl<'a> Rebuilder<'a> {
    pub fn new(index: &'a CatalogIndex, writer: &'a dyn OutputWriter, options: RebuildOptions) -> Self {
        Self {
            index,
            writer,
            options,
            extractors: Extractors::default(),
        }
    }

    /// Run the pipeline over every file under `inputs`.
    ///
    /// Per-input failures are counted and logged; with `fail_fast` the first
    /// one cancels the run and is returned.
    pub fn run(
        &self,
        inputs: &[PathBuf],
        reporter: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<RebuildSummary, Error> {
        let start = Instant::now();
        let pools = WorkerPools::new(self.options.workers, self.options.sub_workers)?;

        info!("Collecting inputs...");
        reporter.on_walk_start();
        let walk_start = Instant::now();
        let files = collect_input_files(inputs, &self.options.ignore_patterns)?;
        reporter.on_walk_complete(files.len(), walk_start.elapsed().as_secs_f64());
        info!(
            "Rebuilding from {} inputs ({:?} mode, {:?} output)",
            files.len(),
            self.options.mode,
            self.writer.format()
        );

        let scanner = InputScanner {
            levels: self.options.scan_levels,
            extractors: &self.extractors,
            selection: HashSelection::ALL,
            quick_scan: self.options.quick_scan,
            temp_root: self.options.temp_root.clone(),
        };

        let total = files.len();
        let counters = Counters::default();
        let run = pools.outer.install(|| {
            files.par_iter().try_for_each(|file| -> Result<(), Error> {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                let result = self.process_input(file, &scanner, &pools, &counters);
                let outcome = match result {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        Counters::add(&counters.failed, 1);
                        if self.options.fail_fast {
                            error!("Processing {} failed: {}", file.display(), e);
                            cancel.cancel();
                            Err(e)
                        } else {
                            warn!("Processing {} failed: {}", file.display(), e);
                            Ok(())
                        }
                    }
                };
                let done = counters.done.fetch_add(1, Ordering::Relaxed) + 1;
                reporter.on_input_complete(done, total, &file.to_string_lossy());
                outcome
            })
        });

        let duration = start.elapsed();
        reporter.on_run_complete(duration.as_secs_f64());
        run?;

        let summary = RebuildSummary {
            inputs: total,
            candidates: counters.candidates.load(Ordering::Relaxed),
            matched: counters.matched.load(Ordering::Relaxed),
            unmatched: counters.unmatched.load(Ordering::Relaxed),
            written: counters.written.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            deleted: counters.deleted.load(Ordering::Relaxed),
            cancelled: cancel.is_cancelled(),
            duration,
        };
        info!(
            "Rebuild finished in {:.2}s: {} matched, {} unmatched, {} written, {} skipped, {} failed",
            duration.as_secs_f64(),
            summary.matched,
            summary.unmatched,
            summary.written,
            summary.skipped,
            summary.failed
        );
        Ok(summary)
    }

    /// The catalog entries no write has satisfied, as a fixdat named
    /// `fixDAT_<name>`.
    pub fn fixdat(&self, catalog_name: &str) -> Catalog {
        Catalog {
            name: format!("fixDAT_{}", catalog_name),
            entries: self.index.remaining(),
        }
    }

    fn process_input(
        &self,
        file: &Path,
        scanner: &InputScanner<'_>,
        pools: &WorkerPools,
        counters: &Counters,
    ) -> Result<(), Error> {
        let mut scanned = pools.inner.install(|| scanner.scan(file))?;
        Counters::add(&counters.candidates, scanned.candidates.len());

        let mut planned: Vec<(usize, CatalogEntry)> = Vec::new();
        for (i, candidate) in scanned.candidates.iter().enumerate() {
            let matches = self.index.lookup(&candidate.as_lookup_entry());
            if matches.is_empty() {
                Counters::add(&counters.unmatched, 1);
                debug!("No match for {}", candidate.path.display());
            } else {
                Counters::add(&counters.matched, 1);
                debug!("{} matches {} entries", candidate.path.display(), matches.len());
            }

            match self.options.mode {
                RebuildMode::Forward => {
                    planned.extend(matches.into_iter().map(|(entry, _)| (i, entry)));
                }
                RebuildMode::Inverse if matches.is_empty() => {
                    planned.push((i, inverse_entry(candidate)));
                }
                RebuildMode::Inverse => {}
            }
        }

        let mut outcome = InputOutcome::default();
        if !planned.is_empty() {
            let needed: Vec<usize> = planned.iter().map(|(i, _)| *i).collect();
            if let Err(e) = pools.inner.install(|| scanned.materialize(&needed)) {
                warn!("{}", e);
            }

            let mut batch: Vec<(&CatalogEntry, &Path)> = Vec::with_capacity(planned.len());
            for (i, entry) in &planned {
                let candidate = &scanned.candidates[*i];
                match candidate.local_path() {
                    Some(local) => batch.push((entry, local)),
                    None => {
                        error!(
                            "{}",
                            Error::write(&candidate.path, "content could not be extracted")
                        );
                        Counters::add(&counters.failed, 1);
                        outcome.failed_writes += 1;
                    }
                }
            }

            let results = self.writer.write_many(&batch);
            for (&(entry, source), result) in batch.iter().zip(results) {
                self.record_write(file, entry, source, result, counters, &mut outcome);
            }
        }

        if !self.options.delete_on_success || outcome.writes == 0 || outcome.failed_writes > 0 {
            return Ok(());
        }
        if outcome.onto_input > 0 {
            info!(
                "Keeping {}: it is the destination of its own match",
                file.display()
            );
            return Ok(());
        }
        drop(scanned);
        match fs::remove_file(file) {
            Ok(()) => {
                Counters::add(&counters.deleted, 1);
                debug!("Removed {}", file.display());
            }
            Err(e) => warn!("Could not remove {}: {}", file.display(), e),
        }
        Ok(())
    }

    fn record_write(
        &self,
        input: &Path,
        entry: &CatalogEntry,
        source: &Path,
        result: Result<WriteOutcome, Error>,
        counters: &Counters,
        outcome: &mut InputOutcome,
    ) {
        match result {
            Ok(written) => {
                outcome.writes += 1;
                match written {
                    WriteOutcome::Written => Counters::add(&counters.written, 1),
                    WriteOutcome::AlreadyPresent => Counters::add(&counters.skipped, 1),
                }
                if self.options.update_dat && self.options.mode == RebuildMode::Forward {
                    self.index.remove(entry);
                }
                if self.options.delete_on_success && self.lands_on(input, entry, source) {
                    outcome.onto_input += 1;
                }
            }
            Err(e) => {
                error!("Writing {}/{} failed: {}", entry.set_name, entry.name, e);
                Counters::add(&counters.failed, 1);
                outcome.failed_writes += 1;
            }
        }
    }

    /// Whether the write for `entry` ended up in the input file itself, in
    /// which case the input is the only copy. An unknown destination counts
    /// as the input.
    fn lands_on(&self, input: &Path, entry: &CatalogEntry, source: &Path) -> bool {
        match self.writer.destination(entry, source) {
            Ok(dest) => same_file(input, &dest),
            Err(e) => {
                warn!(
                    "Could not resolve the destination of {}/{}: {}",
                    entry.set_name, entry.name, e
                );
                true
            }
        }
    }
}

/// A single-item set named after the file's own stem.
fn inverse_entry(candidate: &CandidateFile) -> CatalogEntry {
    CatalogEntry {
        name: candidate.name.clone(),
        size: Some(candidate.size),
        crc32: candidate.hashes.crc32.clone(),
        md5: candidate.hashes.md5.clone(),
        sha1: candidate.hashes.sha1.clone(),
        sha256: candidate.hashes.sha256.clone(),
        set_name: file_stem(&candidate.name),
        kind: ItemKind::Rom,
        ..Default::default()
    }
}
