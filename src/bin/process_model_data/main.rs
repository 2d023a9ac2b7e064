use std::{path::PathBuf, process::ExitCode};

use chrono::NaiveDate;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use clim_rs::{
    logging::{init_logging, RunLog},
    retrieval::{run_stamp, PipelineConfig, Processor, ProcessorOptions, RunSummary, SystemRunner, UnitState},
};
use error_stack::ResultExt;
use log::{error, info, warn};

use crate::error::ProcessError;

mod error;

fn main() -> ExitCode {
    let clargs = Cli::parse();
    init_logging(clargs.verbosity.log_level_filter());
    match main_inner(clargs) {
        Ok(summary) if summary.any_failed() => ExitCode::from(2),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn main_inner(clargs: Cli) -> error_stack::Result<RunSummary, ProcessError> {
    let end = clargs.end.unwrap_or(clargs.start);
    if end < clargs.start {
        return Err(ProcessError::use_error("--end must not be before the start date").into());
    }

    let config = PipelineConfig::from_toml_file(&clargs.config)
        .change_context_lazy(|| ProcessError::context("Error loading the pipeline configuration"))?;

    let options = ProcessorOptions {
        force_update: clargs.force,
        debug: clargs.debug,
        dry_run: clargs.dry_run,
        print_summary: clargs.summary,
        stamp: run_stamp(),
    };

    let _run_log = if clargs.no_run_log {
        None
    } else {
        let log = RunLog::start(
            &config.work_dir,
            &config.model_name,
            &options.stamp,
            clargs.verbosity.log_level_filter(),
        )
        .change_context_lazy(|| ProcessError::context("Error starting the run log"))?;
        Some(log)
    };

    let inits = config.init_times(clargs.start, end);
    if inits.is_empty() {
        warn!("no initialization times between {} and {end} after applying the skip lists", clargs.start);
    }

    let processor = Processor::new(config, SystemRunner, options)
        .change_context_lazy(|| ProcessError::context("Error setting up the pipeline"))?;
    let summary = processor.run(&inits);

    println!("{}", summary.table());
    let nfail = summary.count(UnitState::Error);
    if nfail > 0 {
        error!("{nfail} of {} units failed, see the log for details", summary.units.len());
    } else {
        info!("all {} units finished", summary.units.len());
    }
    Ok(summary)
}

/// Retrieve, merge and convert forecast model output into per-initialization
/// netCDF files.
///
/// Units (initialization, member, variable) whose outputs are already
/// complete are skipped, so this can be rerun safely after an interruption.
/// Exits with status 2 if any unit failed and 1 if the run could not start.
#[derive(Debug, clap::Parser)]
struct Cli {
    /// Path to the TOML pipeline configuration.
    config: PathBuf,

    /// First initialization date to process (YYYY-MM-DD).
    #[clap(long)]
    start: NaiveDate,

    /// Last initialization date to process; defaults to --start.
    #[clap(long)]
    end: Option<NaiveDate>,

    /// Rebuild outputs even if they are already complete.
    #[clap(short, long)]
    force: bool,

    /// Keep the scratch file after each unit.
    #[clap(long)]
    debug: bool,

    /// Print the merge, conversion and compression commands instead of running
    /// them. Record matching still runs so record counts are checked.
    #[clap(short = 'n', long)]
    dry_run: bool,

    /// Log a short summary of each output file after it is processed.
    #[clap(short, long)]
    summary: bool,

    /// Do not write a run log to the work directory.
    #[clap(long)]
    no_run_log: bool,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,
}
