mod archive;
mod config;
mod guard;
mod logging;
mod monitor;
mod run_dir;
mod scheduler;
mod status;
mod supervisor;

use clap::error::ErrorKind;
use clap::Parser;
use config::{ConfigError, RebooterConfig};
use guard::ActiveGroup;
use run_dir::RunDir;
use scheduler::{BatchScheduler, SchedulerSettings};
use std::path::PathBuf;
use std::time::Duration;
use supervisor::{MemoryCheck, SuperviseOptions};

/// Runs a batch worker script over a dataset under supervision: kills the
/// worker when it hangs opening an item or runs low on memory, and requeues
/// the rest of the batch.
#[derive(Parser, Debug)]
#[command(name = "rebooter", version, about)]
pub struct Cli {
    /// Output folder handed to the worker
    output_dir: PathBuf,

    /// Model config handed to the worker
    model_config: PathBuf,

    /// Statistics output handed to the worker
    stats_output: PathBuf,

    /// Progress log the worker writes and the supervisor polls
    timeout_log: PathBuf,

    /// Dataset file, one work item per line
    dataset: PathBuf,

    /// Config file path
    #[arg(short, long, default_value = "rebooter.toml")]
    config: PathBuf,

    /// Items per worker invocation (overrides config)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Seconds per wait window (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// Worker application log to watch for low memory (overrides config)
    #[arg(long)]
    app_log: Option<PathBuf>,

    /// Run directory for status, lock and archives (overrides config)
    #[arg(long)]
    run_dir: Option<PathBuf>,

    /// Print the planned batches and exit without running the worker
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (poll decisions, snapshots)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings, errors and the summary
    #[arg(short, long)]
    quiet: bool,
}

const USAGE: &str = "\
usage: rebooter <output_dir> <model_config> <stats_output> <timeout_log> <dataset> [options]

  <output_dir>    path to output folder
  <model_config>  path to model config
  <stats_output>  path to statistic output
  <timeout_log>   path to timeout logs
  <dataset>       path to dataset, one project per line

run `rebooter --help` for options";

/// Print usage for a parse failure. Usage errors are not failures of the
/// run, so the exit status is always 0.
fn usage_exit_code(err: &clap::Error) -> i32 {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            let _ = err.print();
        }
        _ => println!("{USAGE}"),
    }
    0
}

fn apply_overrides(config: &mut RebooterConfig, cli: &Cli) -> Result<(), ConfigError> {
    if let Some(size) = cli.batch_size {
        config.batch.size = size;
    }
    if let Some(secs) = cli.timeout {
        config.watchdog.timeout_secs = secs;
    }
    if let Some(ref app_log) = cli.app_log {
        config.memory.app_log = app_log.clone();
    }
    if let Some(ref run_dir) = cli.run_dir {
        config.storage.run_dir = run_dir.clone();
    }
    config.validate()
}

fn scheduler_settings(config: &RebooterConfig, cli: &Cli, run_dir: &RunDir) -> SchedulerSettings {
    let memory = config.app_log().map(|app_log| {
        MemoryCheck::from_config(app_log, run_dir.app_log_snapshot(), &config.memory)
    });
    SchedulerSettings {
        batch_size: config.batch.size,
        worker: config.worker.clone(),
        output_dir: cli.output_dir.clone(),
        model_config: cli.model_config.clone(),
        stats_output: cli.stats_output.clone(),
        supervise: SuperviseOptions {
            timeout: Duration::from_secs(config.watchdog.timeout_secs),
            progress_log: cli.timeout_log.clone(),
            opening_marker: config.watchdog.opening_marker.clone(),
            memory,
        },
        app_log: config.app_log().map(PathBuf::from),
        compress_after: config.storage.compress_after,
        keep_status: config.status.keep_on_finish,
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = RebooterConfig::load(&cli.config)?;
    apply_overrides(&mut config, &cli)?;

    let dataset = scheduler::load_dataset(&cli.dataset)
        .map_err(|e| format!("failed to read dataset {}: {e}", cli.dataset.display()))?;

    if cli.dry_run {
        let batches = scheduler::plan_batches(&dataset, config.batch.size);
        println!(
            "{} items, {} batches of up to {}",
            dataset.len(),
            batches.len(),
            config.batch.size
        );
        for (i, batch) in batches.iter().enumerate() {
            let names: Vec<&str> = batch.iter().map(|item| item.short_name()).collect();
            println!("  batch {}: {}", i + 1, names.join(", "));
        }
        return Ok(());
    }

    let run_dir = RunDir::new(&config.storage.run_dir);
    run_dir.init()?;
    logging::init(
        logging::Verbosity::from_flags(cli.verbose, cli.quiet),
        &run_dir.diagnostic_log(),
    )?;
    let _lock = run_dir.acquire_lock()?;

    tracing::info!(run_dir = %run_dir.root().display(), "rebooter starting");
    tracing::debug!(?cli, "parsed CLI arguments");
    tracing::debug!(?config, "resolved config");

    let active = ActiveGroup::new();
    let signals = guard::install_signal_handler(active.clone());

    let settings = scheduler_settings(&config, &cli, &run_dir);
    let summary = BatchScheduler::new(settings, run_dir.clone(), active)
        .run(dataset)
        .await?;
    signals.abort();

    println!(
        "Processed {}/{} items in {} batches.",
        summary.processed, summary.total, summary.batches
    );
    if !summary.abandoned.is_empty() {
        println!("Abandoned after a kill:");
        for item in &summary.abandoned {
            println!("  {item}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => std::process::exit(usage_exit_code(&e)),
    };

    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "rebooter failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("rebooter").chain(args.iter().copied()))
    }

    #[test]
    fn test_parses_five_positionals() {
        let cli = parse(&["out", "model.json", "stats.json", "timeout.log", "input.txt"]).unwrap();
        assert_eq!(cli.output_dir, PathBuf::from("out"));
        assert_eq!(cli.timeout_log, PathBuf::from("timeout.log"));
        assert_eq!(cli.dataset, PathBuf::from("input.txt"));
        assert_eq!(cli.config, PathBuf::from("rebooter.toml"));
    }

    #[test]
    fn test_missing_positionals_exit_zero() {
        let err = parse(&["out", "model.json"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 0);
    }

    #[test]
    fn test_extra_positionals_exit_zero() {
        let err = parse(&["a", "b", "c", "d", "e", "f"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 0);
    }

    #[test]
    fn test_overrides_apply_and_validate() {
        let cli = parse(&[
            "out",
            "m",
            "s",
            "t.log",
            "d.txt",
            "--batch-size",
            "2",
            "--timeout",
            "10",
            "--app-log",
            "/tmp/idea.log",
        ])
        .unwrap();
        let mut config = RebooterConfig::default();
        apply_overrides(&mut config, &cli).unwrap();
        assert_eq!(config.batch.size, 2);
        assert_eq!(config.watchdog.timeout_secs, 10);
        assert!(config.app_log().is_some());

        let cli = parse(&["out", "m", "s", "t.log", "d.txt", "--batch-size", "0"]).unwrap();
        let mut config = RebooterConfig::default();
        assert!(apply_overrides(&mut config, &cli).is_err());
    }

    #[test]
    fn test_settings_wire_timeout_log_and_memory() {
        let cli =
            parse(&["out", "m", "s", "t.log", "d.txt", "--app-log", "/tmp/idea.log"]).unwrap();
        let mut config = RebooterConfig::default();
        apply_overrides(&mut config, &cli).unwrap();
        let run_dir = RunDir::new(".rebooter");

        let settings = scheduler_settings(&config, &cli, &run_dir);
        assert_eq!(settings.supervise.progress_log, PathBuf::from("t.log"));
        assert_eq!(settings.supervise.timeout, Duration::from_secs(3));
        let memory = settings.supervise.memory.unwrap();
        assert_eq!(memory.snapshot, run_dir.app_log_snapshot());
        assert_eq!(memory.warning_threshold, 4);
        assert_eq!(settings.app_log, Some(PathBuf::from("/tmp/idea.log")));
    }
}
