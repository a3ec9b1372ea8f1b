mod commands;
mod logging;
mod progress;

use std::fs;
use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands, DepotCommands, RebuildArgs};
use dotenv::dotenv;
use progress::CliReporter;
use romsmith_core::catalog::{Catalog, CatalogIndex};
use romsmith_core::config::{self, AppConfig};
use romsmith_core::depot::{self, Depot, NeededMatch};
use romsmith_core::output::{create_writer, OutputFormat};
use romsmith_core::{CancelToken, Rebuilder};
use tracing::{error, info, warn};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let _guard = logging::init_logger();

    let config = match config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let args = Cli::parse();

    let result = match args.command {
        Some(Commands::Rebuild(rebuild)) => run_rebuild(config, rebuild),
        Some(Commands::Depot { depot, command }) => run_depot(config, depot, command),
        Some(Commands::PrintConfig) => {
            println!("Configuration: {:#?}", config);
            Ok(())
        }
        None => {
            let _ = Cli::command().print_long_help();
            Ok(())
        }
    };

    if let Err(err) = result {
        error!("Error: {:#}", err);
        process::exit(1);
    }
    Ok(())
}

fn cancel_token(config: &AppConfig) -> CancelToken {
    match config.timeout() {
        Some(timeout) => CancelToken::with_timeout(timeout),
        None => CancelToken::new(),
    }
}

fn input_paths(explicit: Vec<PathBuf>, config: &AppConfig) -> anyhow::Result<Vec<PathBuf>> {
    let inputs = if explicit.is_empty() {
        config.input_paths()
    } else {
        explicit
    };
    if inputs.is_empty() {
        bail!("no inputs given and root_paths is empty");
    }
    Ok(inputs)
}

fn open_depot(config: &AppConfig) -> anyhow::Result<Depot> {
    let Some(root) = config.depot.root.as_deref() else {
        bail!("no depot root configured (depot.root or --depot)");
    };
    Depot::open(root, config.depot.database.as_deref())
        .with_context(|| format!("opening depot at {}", root.display()))
}

fn run_rebuild(mut config: AppConfig, args: RebuildArgs) -> anyhow::Result<()> {
    if let Some(out) = args.out {
        config.output_root = Some(out);
    }
    if let Some(format) = args.format.as_deref() {
        config.output_format = format.parse::<OutputFormat>()?;
    }
    config.inverse |= args.inverse;
    config.quick_scan |= args.quick;
    config.delete_on_success |= args.delete;
    config.preserve_timestamps |= args.preserve_timestamps;
    config.fail_fast |= args.fail_fast;
    config.update_dat |= args.fixdat.is_some();
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(sub_workers) = args.sub_workers {
        config.sub_workers = sub_workers;
    }
    if args.timeout.is_some() {
        config.timeout_secs = args.timeout;
    }
    config.validate()?;

    let catalog = Catalog::load(&args.catalog)
        .with_context(|| format!("loading catalog {}", args.catalog.display()))?;
    let inputs = input_paths(args.inputs, &config)?;

    let depot = match config.output_format {
        OutputFormat::ContentAddressed => Some(open_depot(&config)?),
        _ => None,
    };
    let out_root = match (&config.output_root, &depot) {
        (Some(out), _) => out.clone(),
        (None, Some(depot)) => depot.store().root().to_path_buf(),
        (None, None) => bail!("no output root configured (output_root or --out)"),
    };
    fs::create_dir_all(&out_root)
        .with_context(|| format!("output root {} is not writable", out_root.display()))?;

    let index = CatalogIndex::new(catalog.entries.clone());
    let removed = index.remove_duplicates(config.dedupe);
    info!(
        "Catalog '{}': {} entries indexed, {} rejected, {} duplicates removed",
        catalog.name,
        index.len(),
        index.rejected(),
        removed
    );

    let writer = create_writer(
        config.output_format,
        &out_root,
        depot.as_ref(),
        config.preserve_timestamps,
    )?;
    let rebuilder = Rebuilder::new(&index, writer.as_ref(), config.rebuild_options());
    let reporter = CliReporter::new();
    let summary = rebuilder.run(&inputs, &reporter, &cancel_token(&config))?;

    if let Some(dir) = args.fixdat {
        let fixdat = rebuilder.fixdat(&catalog.name);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", fixdat.name));
        fixdat
            .save(&path)
            .with_context(|| format!("writing fixdat {}", path.display()))?;
        info!("{} missing entries written to {}", fixdat.entries.len(), path.display());
    }

    println!();
    info!(
        "{} matched, {} unmatched, {} candidates from {} inputs in {}",
        format!("{}", summary.matched).green(),
        format!("{}", summary.unmatched).yellow(),
        summary.candidates,
        summary.inputs,
        format!("{:.2}s", summary.duration.as_secs_f64()).green(),
    );
    info!(
        "{} written, {} already present, {} failed, {} inputs removed",
        format!("{}", summary.written).green(),
        format!("{}", summary.skipped).cyan(),
        format!("{}", summary.failed).red(),
        summary.deleted,
    );
    if summary.cancelled {
        warn!("Run was cancelled before every input was processed");
    }
    Ok(())
}

fn run_depot(
    mut config: AppConfig,
    root: Option<PathBuf>,
    command: DepotCommands,
) -> anyhow::Result<()> {
    if root.is_some() {
        config.depot.root = root;
    }
    let depot = open_depot(&config)?;

    match command {
        DepotCommands::Ingest {
            inputs,
            only_needed,
            any_hash,
        } => {
            config.depot.only_needed |= only_needed;
            if any_hash {
                config.depot.needed_match = NeededMatch::AnyHash;
            }
            let inputs = input_paths(inputs, &config)?;
            let reporter = CliReporter::new();
            let summary = depot::ingest(
                &depot,
                &inputs,
                &config.ingest_options(),
                &reporter,
                &cancel_token(&config),
            )?;

            println!();
            info!(
                "{} stored, {} indexed, {} already present, {} skipped as not needed",
                format!("{}", summary.stored).green(),
                format!("{}", summary.indexed).green(),
                format!("{}", summary.already_present).cyan(),
                format!("{}", summary.skipped).cyan(),
            );
            info!(
                "{} files from {} inputs, {} failed, {} hash conflicts",
                summary.files,
                summary.inputs,
                format!("{}", summary.failed).red(),
                format!("{}", summary.conflicts).yellow(),
            );
        }
        DepotCommands::Lookup { hash } => {
            let locations = depot.index().lookup(&hash)?;
            if locations.is_empty() {
                println!("{} not found", hash.yellow());
            }
            for location in locations {
                let path = depot::DepotStore::new(&location.depot)
                    .path_for(&location.sha1)?;
                println!("{}  {}", location.sha1.green(), path.display());
            }
        }
        DepotCommands::Stats => {
            let stats = depot.index().stats()?;
            println!("{:>10} crc", stats.crc);
            println!("{:>10} md5", stats.md5);
            println!("{:>10} sha1", stats.sha1);
            println!("{:>10} crcsha1", stats.crcsha1);
            println!("{:>10} md5sha1", stats.md5sha1);
        }
    }
    Ok(())
}
