use std::{path::PathBuf, process::ExitCode, str::FromStr};

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use clim_rs::{
    logging::init_logging,
    multi_read::{self, MultiReadOptions, StackAxis},
    nc_utils::{dim_names, open_dataset, require_variable, save_variable, SaveMode, SaveOptions, StorageType},
    range_reader::{read_by_dim_range, read_w2g, GriddedSubset, RangeQuery, TimeDecoding},
    timetools::day_number_to_datetime,
};
use error_stack::ResultExt;
use log::{info, warn};

use crate::error::NcRangeError;

mod error;

fn main() -> ExitCode {
    let clargs = Cli::parse();
    init_logging(clargs.verbosity.log_level_filter());
    if let Err(e) = main_inner(clargs) {
        eprintln!("ERROR: {e:?}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn main_inner(clargs: Cli) -> error_stack::Result<(), NcRangeError> {
    let files = expand_inputs(&clargs.inputs)?;
    let queries = if clargs.range.is_empty() {
        default_queries(&files, &clargs.var)?
    } else {
        clargs.range.clone()
    };

    let subset = if clargs.w2g {
        if files.len() != 1 {
            return Err(NcRangeError::use_error("--w2g reads exactly one file").into());
        }
        let subset = read_w2g(&files[0], &clargs.var, &queries, None)
            .change_context_lazy(|| NcRangeError::context("Error reading with wrap-around windows"))?;
        match subset {
            Some(s) => s,
            None => {
                warn!("no data within the requested ranges");
                return Ok(());
            }
        }
    } else if files.len() == 1 && clargs.stack.is_none() {
        read_by_dim_range(&files[0], &clargs.var, &queries, clargs.time)
            .change_context_lazy(|| NcRangeError::context("Error reading the requested range"))?
    } else {
        let mut opts = MultiReadOptions::default()
            .stacked_along(clargs.stack.unwrap_or_default().0)
            .with_time(clargs.time)
            .ignore_dim_values(&clargs.ignore_dim_values);
        if clargs.allow_missing {
            opts = opts.allow_missing_files();
        }
        if clargs.allow_varying_length {
            opts = opts.allow_varying_dim_length();
        }
        if clargs.ignore_dim_names {
            opts = opts.ignore_dim_names();
        }
        multi_read::read(&files, &clargs.var, &queries, &opts)
            .change_context_lazy(|| NcRangeError::context("Error reading from multiple files"))?
    };

    print_subset(&subset);

    if let Some(out) = &clargs.out {
        let opts = SaveOptions {
            mode: if clargs.append { SaveMode::Append } else { SaveMode::Create },
            storage: if clargs.single { StorageType::F32 } else { StorageType::F64 },
            significant_digits: clargs.digits,
            ..Default::default()
        };
        let attributes = vec![(
            "history".to_string(),
            format!("subset of {} from {} file(s) by ncrange", clargs.var, files.len()),
        )];
        save_variable(out, &subset.as_gridded_variable(&attributes), &opts)
            .change_context_lazy(|| NcRangeError::context(format!("Error saving to {}", out.display())))?;
        info!("wrote {} to {}", subset.var_name, out.display());
    }
    Ok(())
}

/// Expand glob patterns; arguments that match nothing are kept as literal
/// paths so that missing files can be reported (or tolerated) by the reader.
fn expand_inputs(inputs: &[String]) -> error_stack::Result<Vec<PathBuf>, NcRangeError> {
    let mut files = vec![];
    for input in inputs {
        let matches = glob::glob(input)
            .change_context_lazy(|| NcRangeError::use_error(format!("Invalid file pattern '{input}'")))?;
        let mut found = vec![];
        for entry in matches {
            let entry = entry.change_context_lazy(|| NcRangeError::context("Error globbing for input files"))?;
            found.push(entry);
        }
        if found.is_empty() {
            files.push(PathBuf::from(input));
        } else {
            found.sort();
            files.extend(found);
        }
    }
    if files.is_empty() {
        return Err(NcRangeError::use_error("at least one input file is required").into());
    }
    Ok(files)
}

/// Unbounded queries for every dimension of the variable in the first file that exists.
fn default_queries(files: &[PathBuf], var: &str) -> error_stack::Result<Vec<RangeQuery>, NcRangeError> {
    let path = files
        .iter()
        .find(|p| p.exists())
        .ok_or_else(|| NcRangeError::use_error("none of the input files exist"))?;
    let ds = open_dataset(path).change_context_lazy(|| NcRangeError::context("Error opening the first input file"))?;
    let v = require_variable(&ds, path, var)
        .change_context_lazy(|| NcRangeError::context("Error opening the first input file"))?;
    Ok(vec![RangeQuery::all(); dim_names(&v).len()])
}

fn print_subset(subset: &GriddedSubset) {
    let mut builder = tabled::builder::Builder::new();
    builder.push_record(["dimension", "length", "first", "last"]);
    for (idim, (name, coord)) in subset.dim_names.iter().zip(&subset.coords).enumerate() {
        let fmt = |v: Option<&f64>| match v {
            Some(&v) if subset.time_dim == Some(idim) => day_number_to_datetime(v)
                .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|_| v.to_string()),
            Some(v) => v.to_string(),
            None => "-".to_string(),
        };
        builder.push_record([
            name.clone(),
            coord.len().to_string(),
            fmt(coord.first()),
            fmt(coord.last()),
        ]);
    }
    let mut table = builder.build();
    table
        .with(tabled::settings::style::Style::blank())
        .with(tabled::settings::Alignment::left());

    let nvalid = subset.data.iter().filter(|v| v.is_finite()).count();
    println!("{} {:?} ({nvalid} of {} values finite)", subset.var_name, subset.shape(), subset.data.len());
    println!("{table}");
}

/// Wraps [`StackAxis`] so clap can parse "new" or a dimension index.
#[derive(Debug, Clone, Copy, Default)]
struct StackArg(StackAxis);

impl FromStr for StackArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("new") {
            return Ok(Self(StackAxis::New));
        }
        s.parse::<isize>()
            .map(|i| Self(StackAxis::Existing(i)))
            .map_err(|_| format!("stack axis must be 'new' or a dimension index, got '{s}'"))
    }
}

fn parse_time(s: &str) -> Result<TimeDecoding, String> {
    match s.to_ascii_lowercase().as_str() {
        "auto" => Ok(TimeDecoding::Auto),
        "off" | "none" => Ok(TimeDecoding::Off),
        other => other
            .parse::<usize>()
            .map(TimeDecoding::Dimension)
            .map_err(|_| format!("time must be 'auto', 'off' or a dimension index, got '{s}'")),
    }
}

/// Read a rectangular range of a gridded variable from one or more netCDF
/// files, print a summary, and optionally save the result.
#[derive(Debug, clap::Parser)]
struct Cli {
    /// Variable to read.
    #[clap(long)]
    var: String,

    /// Range for one dimension as MIN:MAX, in dimension order; either bound
    /// may be empty. Give it once per dimension, or not at all to read
    /// everything. Time dimensions take day numbers (days since 2000-01-01).
    #[clap(short, long, allow_hyphen_values = true)]
    range: Vec<RangeQuery>,

    /// Which dimension is time: "auto", "off" or a dimension index.
    #[clap(long, default_value = "auto", value_parser = parse_time)]
    time: TimeDecoding,

    /// Stack multiple files along a new leading dimension ("new") or along
    /// an existing dimension given by index (negative counts from the end).
    #[clap(long)]
    stack: Option<StackArg>,

    /// Fill missing files with NaN instead of failing.
    #[clap(long)]
    allow_missing: bool,

    /// Pad dimensions that differ in length between files with NaN.
    #[clap(long)]
    allow_varying_length: bool,

    /// Do not require dimension names to match between files.
    #[clap(long)]
    ignore_dim_names: bool,

    /// Dimension indices whose values need not match between files.
    #[clap(long, value_delimiter = ',')]
    ignore_dim_values: Vec<usize>,

    /// Treat ranges as windows that may wrap around the end of a dimension
    /// (e.g. longitudes 350:10). Only for a single file.
    #[clap(long)]
    w2g: bool,

    /// Save the result to this netCDF file.
    #[clap(short, long)]
    out: Option<PathBuf>,

    /// Add the variable to an existing output file instead of creating a new one.
    #[clap(long, requires = "out")]
    append: bool,

    /// Store the output as 32-bit floats.
    #[clap(long, requires = "out")]
    single: bool,

    /// Round the output to this many significant digits.
    #[clap(long, requires = "out")]
    digits: Option<u8>,

    /// Input files or glob patterns.
    #[clap(required = true)]
    inputs: Vec<String>,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,
}
