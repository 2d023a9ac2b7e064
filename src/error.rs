//! Common errors across the clim-rs crate
use std::path::PathBuf;

/// Errors related to working with day numbers and time units
#[derive(Debug, thiserror::Error)]
pub enum TimeError {
    #[error("Year {0}, month {1}, day {2} is not a valid date")]
    InvalidYearMonthDay(i32, u32, u32),
    #[error("Could not parse time units '{units}': {reason}")]
    UnparseableUnits { units: String, reason: String },
    #[error("Unsupported time unit '{0}'")]
    UnsupportedUnit(String),
    #[error("Calendar offsets in {unit} must be whole numbers, got {value}")]
    NonIntegralCalendarOffset { unit: &'static str, value: f64 },
    #[error("Day number {0} cannot be represented as a datetime")]
    OutOfRange(f64),
}

impl TimeError {
    pub(crate) fn units<U: ToString, R: ToString>(units: U, reason: R) -> Self {
        Self::UnparseableUnits {
            units: units.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised when a coordinate query cannot be resolved to indices
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Coordinate values must be strictly increasing (index {0} breaks monotonicity)")]
    NotStrictlyIncreasing(usize),
    #[error("Range bounds must be numbers, got [{start}, {end}]")]
    NanBound { start: f64, end: f64 },
    #[error("Range start ({start}) is greater than range end ({end})")]
    Inverted { start: f64, end: f64 },
    #[error("Range [{start}, {end}] lies outside the coordinate span [{first}, {last}]")]
    OutsideSpan {
        start: f64,
        end: f64,
        first: f64,
        last: f64,
    },
    #[error("Cannot take a range over an empty coordinate")]
    EmptyCoordinate,
    #[error("Got {given} range queries for a variable with {ndim} dimensions")]
    WrongQueryCount { given: usize, ndim: usize },
}

/// Errors raised while reading gridded variables
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("File {} not found", .0.display())]
    FileNotFound(PathBuf),
    #[error("Variable '{var}' not found in {}", .file.display())]
    VariableNotFound { file: PathBuf, var: String },
    #[error("No coordinate variable for dimension '{dim}' in {}", .file.display())]
    CoordinateNotFound { file: PathBuf, dim: String },
    #[error("Coordinate variable '{0}' is not one-dimensional")]
    UnsupportedCoordinate(String),
    #[error("Could not identify a time dimension among {0:?}; give its index explicitly or disable time decoding")]
    NoTimeDimension(Vec<String>),
    #[error("Time dimension index {index} is out of range for a variable with {ndim} dimensions")]
    BadTimeIndex { index: usize, ndim: usize },
    #[error("Time variable '{0}' has no units attribute")]
    MissingTimeUnits(String),
    #[error("Invalid range query for dimension '{dim}'")]
    Query { dim: String },
    #[error("Could not decode the time axis '{0}'")]
    Time(String),
    #[error("Error reading netCDF file {}", .0.display())]
    Netcdf(PathBuf),
    #[error("Dimension names differ between {} ({first:?}) and {} ({second:?})", .first_file.display(), .second_file.display())]
    DimensionNames {
        first_file: PathBuf,
        first: Vec<String>,
        second_file: PathBuf,
        second: Vec<String>,
    },
    #[error("Dimension '{dim}' values differ between {} ({first}) and {} ({second})", .first_file.display(), .second_file.display())]
    DimensionValues {
        dim: String,
        first_file: PathBuf,
        first: String,
        second_file: PathBuf,
        second: String,
    },
    #[error("Shape of '{var}' differs between {} ({first:?}) and {} ({second:?})", .first_file.display(), .second_file.display())]
    Shape {
        var: String,
        first_file: PathBuf,
        first: Vec<usize>,
        second_file: PathBuf,
        second: Vec<usize>,
    },
    #[error("Stack axis {axis} is out of range for {ndim} dimensions")]
    BadStackAxis { axis: isize, ndim: usize },
    #[error("Could not regrid {} onto the grid of {}", .from.display(), .onto.display())]
    Regrid { from: PathBuf, onto: PathBuf },
    #[error("No observation source named '{0}' is configured")]
    UnknownSource(String),
    #[error("Observation source '{0}' has no climatology file configured")]
    NoClimatologyPath(String),
    #[error("The time range must be bounded on both ends to list observation files, got {0}")]
    UnboundedTime(String),
    #[error("The climatology has no day matching {0}")]
    MissingClimDay(String),
    #[error("None of the {0} requested files exist")]
    AllFilesMissing(usize),
    #[error("No files were given to read")]
    NoFiles,
}

/// Errors raised while writing gridded variables
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("{} already exists; use append mode to add variables to it", .0.display())]
    AlreadyExists(PathBuf),
    #[error("Variable '{var}' has {ndata} dimensions but {nnames} dimension names were given")]
    DimensionCount {
        var: String,
        ndata: usize,
        nnames: usize,
    },
    #[error("Coordinate for dimension '{dim}' has length {coord} but the data has length {data}")]
    CoordinateLength {
        dim: String,
        coord: usize,
        data: usize,
    },
    #[error("Existing variable '{var}' has dimensions {existing:?} but {new:?} were given")]
    InconsistentDimensions {
        var: String,
        existing: Vec<String>,
        new: Vec<String>,
    },
    #[error("Existing variable '{var}' has shape {existing:?} but the new data has shape {new:?}")]
    InconsistentShape {
        var: String,
        existing: Vec<usize>,
        new: Vec<usize>,
    },
    #[error("Dimension '{dim}' already exists with length {existing}, cannot write length {new}")]
    InconsistentDimensionLength {
        dim: String,
        existing: usize,
        new: usize,
    },
    #[error("Error writing netCDF file {}", .0.display())]
    Netcdf(PathBuf),
}

/// Errors raised when working with climatologies and anomalies
#[derive(Debug, thiserror::Error)]
pub enum ClimatologyError {
    #[error("Axis {axis} is out of range for an array with {ndim} dimensions")]
    BadAxis { axis: usize, ndim: usize },
    #[error("Got {ntimes} times for an axis of length {len}")]
    TimeLength { ntimes: usize, len: usize },
    #[error("A climatology must have {expected} days along its day axis, this one has {actual}")]
    ClimatologyLength { expected: usize, actual: usize },
    #[error("The climatology shape {clim:?} is not compatible with the data shape {data:?}")]
    Shape { clim: Vec<usize>, data: Vec<usize> },
    #[error("The moving average window must be an odd positive number, got {0}")]
    Window(usize),
    #[error("{0} climatologies cannot be computed here, only read from files")]
    NotComputable(String),
    #[error(transparent)]
    Time(#[from] TimeError),
}

/// Fatal problems with a pipeline configuration, raised before any unit runs
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not load the configuration from {}", .0.display())]
    Load(PathBuf),
    #[error("The configuration is invalid:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
    #[error("Work directory {} is not writable", .0.display())]
    WorkDirNotWritable(PathBuf),
    #[error("Destination root {} could not be created or is not writable", .0.display())]
    DestRootNotWritable(PathBuf),
    #[error("Grid description file {} does not exist", .0.display())]
    GridFileMissing(PathBuf),
    #[error("Scratch file {} already exists", .0.display())]
    ScratchExists(PathBuf),
}
