use std::{
    fmt::Display,
    ops::Range,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use error_stack::ResultExt;
use itertools::Itertools;
use log::debug;
use ndarray::{Array1, ArrayD, ArrayViewD};
use netcdf::{AttributeValue, Extent, Extents};
use regex::Regex;

use crate::{
    error::{ReadError, WriteError},
    timetools::{day_number_to_datetime, TimeUnits},
};

/// Units written for time coordinates, which are always day numbers.
pub const DAY_NUMBER_UNITS: &str = "days since 2000-01-01 00:00:00";

/// Open a netCDF file, giving a not-found error before netCDF gets involved.
pub fn open_dataset(path: &Path) -> error_stack::Result<netcdf::File, ReadError> {
    if !path.exists() {
        return Err(ReadError::FileNotFound(path.to_path_buf()).into());
    }
    netcdf::open(path).change_context_lazy(|| ReadError::Netcdf(path.to_path_buf()))
}

pub fn require_variable<'f>(
    ds: &'f netcdf::File,
    path: &Path,
    name: &str,
) -> Result<netcdf::Variable<'f>, ReadError> {
    ds.variable(name).ok_or_else(|| ReadError::VariableNotFound {
        file: path.to_path_buf(),
        var: name.to_string(),
    })
}

pub fn dim_names(var: &netcdf::Variable) -> Vec<String> {
    var.dimensions().iter().map(|d| d.name()).collect()
}

pub fn var_shape(var: &netcdf::Variable) -> Vec<usize> {
    var.dimensions().iter().map(|d| d.len()).collect()
}

/// Length of one dimension of a variable, or 0 if the file, the variable or
/// the dimension does not exist.
///
/// Completeness checks use this, so a corrupt or unreadable file also
/// counts as empty.
pub fn var_dim_length(path: &Path, var_name: &str, dim_index: usize) -> usize {
    if !path.exists() {
        return 0;
    }
    let Ok(ds) = netcdf::open(path) else {
        debug!("could not open {} to check its length", path.display());
        return 0;
    };
    ds.variable(var_name)
        .and_then(|v| v.dimensions().get(dim_index).map(|d| d.len()))
        .unwrap_or(0)
}

/// Whether a dimension name looks like a time axis: `time`, `valid_time`,
/// `timeN` or `time_N` (case-insensitive).
pub fn is_time_name(name: &str) -> bool {
    static TIME_RE: OnceLock<Regex> = OnceLock::new();
    let re = TIME_RE.get_or_init(|| {
        Regex::new(r"(?i)^(time|valid_time|time_?\d)$").expect("time name regex is valid")
    });
    re.is_match(name)
}

/// Index of the first dimension whose name looks like a time axis.
pub fn find_time_dimension<S: AsRef<str>>(names: &[S]) -> Option<usize> {
    names.iter().position(|n| is_time_name(n.as_ref()))
}

pub fn get_string_attribute(var: &netcdf::Variable, name: &str) -> Option<String> {
    match var.attribute_value(name)?.ok()? {
        AttributeValue::Str(s) => Some(s),
        AttributeValue::Strs(v) => v.into_iter().next(),
        _ => None,
    }
}

pub fn get_numeric_attribute(var: &netcdf::Variable, name: &str) -> Option<f64> {
    attribute_as_f64(var.attribute_value(name)?.ok()?)
}

fn attribute_as_f64(value: AttributeValue) -> Option<f64> {
    let v = match value {
        AttributeValue::Uchar(v) => v as f64,
        AttributeValue::Schar(v) => v as f64,
        AttributeValue::Ushort(v) => v as f64,
        AttributeValue::Short(v) => v as f64,
        AttributeValue::Uint(v) => v as f64,
        AttributeValue::Int(v) => v as f64,
        AttributeValue::Ulonglong(v) => v as f64,
        AttributeValue::Longlong(v) => v as f64,
        AttributeValue::Float(v) => v as f64,
        AttributeValue::Double(v) => v,
        AttributeValue::Uchars(v) => *v.first()? as f64,
        AttributeValue::Schars(v) => *v.first()? as f64,
        AttributeValue::Ushorts(v) => *v.first()? as f64,
        AttributeValue::Shorts(v) => *v.first()? as f64,
        AttributeValue::Uints(v) => *v.first()? as f64,
        AttributeValue::Ints(v) => *v.first()? as f64,
        AttributeValue::Ulonglongs(v) => *v.first()? as f64,
        AttributeValue::Longlongs(v) => *v.first()? as f64,
        AttributeValue::Floats(v) => *v.first()? as f64,
        AttributeValue::Doubles(v) => *v.first()?,
        AttributeValue::Str(_) | AttributeValue::Strs(_) => return None,
    };
    Some(v)
}

/// CF packing and missing-data attributes of a variable.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CfPacking {
    pub scale_factor: Option<f64>,
    pub add_offset: Option<f64>,
    pub fill_value: Option<f64>,
    pub missing_value: Option<f64>,
}

impl CfPacking {
    pub fn from_variable(var: &netcdf::Variable) -> Self {
        Self {
            scale_factor: get_numeric_attribute(var, "scale_factor"),
            add_offset: get_numeric_attribute(var, "add_offset"),
            fill_value: get_numeric_attribute(var, "_FillValue"),
            missing_value: get_numeric_attribute(var, "missing_value"),
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    /// Replace fill/missing values with NaN, then apply scale and offset.
    pub fn unpack(&self, data: &mut ArrayD<f64>) {
        if self.is_identity() {
            return;
        }
        let scale = self.scale_factor.unwrap_or(1.0);
        let offset = self.add_offset.unwrap_or(0.0);
        data.mapv_inplace(|v| {
            if Some(v) == self.fill_value || Some(v) == self.missing_value {
                f64::NAN
            } else {
                v * scale + offset
            }
        });
    }
}

/// Read a hyperslab of a variable as `f64`, applying CF unpacking.
///
/// Any empty range gives an empty array without touching the file.
pub fn read_unpacked(
    var: &netcdf::Variable,
    ranges: Vec<Range<usize>>,
) -> netcdf::Result<ArrayD<f64>> {
    if ranges.iter().any(|r| r.is_empty()) {
        let shape = ranges.iter().map(|r| r.len()).collect_vec();
        return Ok(ArrayD::zeros(shape));
    }
    let mut data = if ranges.is_empty() {
        var.get::<f64, _>(Extents::All)?
    } else {
        let extents: Vec<Extent> = ranges.into_iter().map(Extent::from).collect();
        var.get::<f64, _>(extents)?
    };
    CfPacking::from_variable(var).unpack(&mut data);
    Ok(data)
}

/// Read a 1-D coordinate variable in full.
pub fn read_coordinate(
    ds: &netcdf::File,
    path: &Path,
    dim: &str,
) -> error_stack::Result<Array1<f64>, ReadError> {
    let var = ds.variable(dim).ok_or_else(|| ReadError::CoordinateNotFound {
        file: path.to_path_buf(),
        dim: dim.to_string(),
    })?;
    if var.dimensions().len() != 1 {
        return Err(ReadError::UnsupportedCoordinate(dim.to_string()).into());
    }
    let values = var
        .get_values::<f64, _>(Extents::All)
        .change_context_lazy(|| ReadError::Netcdf(path.to_path_buf()))
        .attach_printable_lazy(|| format!("while reading coordinate '{dim}'"))?;
    Ok(Array1::from_vec(values))
}

/// Read a time coordinate and decode it to day numbers using its `units`.
pub fn read_time_coordinate(
    ds: &netcdf::File,
    path: &Path,
    dim: &str,
) -> error_stack::Result<Array1<f64>, ReadError> {
    let raw = read_coordinate(ds, path, dim)?;
    let var = ds.variable(dim).ok_or_else(|| ReadError::CoordinateNotFound {
        file: path.to_path_buf(),
        dim: dim.to_string(),
    })?;
    let units_str =
        get_string_attribute(&var, "units").ok_or_else(|| ReadError::MissingTimeUnits(dim.to_string()))?;
    let units: TimeUnits = units_str
        .parse::<TimeUnits>()
        .change_context_lazy(|| ReadError::Time(dim.to_string()))?;
    let decoded = units
        .decode(&raw.to_vec())
        .change_context_lazy(|| ReadError::Time(dim.to_string()))?;
    Ok(Array1::from_vec(decoded))
}

/// A short description of one variable in a file, used for run summaries.
#[derive(Debug, Clone)]
pub struct VariableSummary {
    pub file: PathBuf,
    pub var_name: String,
    pub dims: Vec<(String, usize)>,
    pub time_span: Option<(f64, f64)>,
}

impl Display for VariableSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dims = self.dims.iter().map(|(n, l)| format!("{n}={l}")).join(", ");
        write!(f, "{}: {}({dims})", self.file.display(), self.var_name)?;
        if let Some((first, last)) = self.time_span {
            let fmt_time = |t: f64| {
                day_number_to_datetime(t)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|_| format!("{t}"))
            };
            write!(f, " time {} to {}", fmt_time(first), fmt_time(last))?;
        }
        Ok(())
    }
}

pub fn summarize_variable(path: &Path, var_name: &str) -> error_stack::Result<VariableSummary, ReadError> {
    let ds = open_dataset(path)?;
    let var = require_variable(&ds, path, var_name)?;
    let names = dim_names(&var);
    let dims = names.iter().cloned().zip(var_shape(&var)).collect_vec();
    let time_span = match find_time_dimension(&names) {
        Some(i) => {
            let times = read_time_coordinate(&ds, path, &names[i])?;
            times.first().copied().zip(times.last().copied())
        }
        None => None,
    };
    Ok(VariableSummary {
        file: path.to_path_buf(),
        var_name: var_name.to_string(),
        dims,
        time_span,
    })
}

// ------------------------------------------------------------------------- //
// Writing                                                                    //
// ------------------------------------------------------------------------- //

/// A gridded variable ready to be written: data plus one named coordinate
/// per dimension. Time coordinates must be day numbers.
#[derive(Debug, Clone)]
pub struct GriddedVariable<'a> {
    pub name: &'a str,
    pub data: ArrayViewD<'a, f64>,
    pub dim_names: &'a [String],
    pub coords: &'a [Array1<f64>],
    pub attributes: &'a [(String, String)],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveMode {
    /// The file must not exist yet.
    #[default]
    Create,
    /// Add to (or overwrite a variable in) an existing file, creating it if needed.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageType {
    F32,
    #[default]
    F64,
}

#[derive(Debug, Clone, Copy)]
pub struct SaveOptions {
    pub mode: SaveMode,
    pub storage: StorageType,
    /// Deflate level for the data variable; shuffle is always on when compressing.
    pub deflate_level: Option<i32>,
    /// Round data to this many significant digits before writing (lossy).
    pub significant_digits: Option<u8>,
    /// Add axis/units attributes to recognized coordinate names.
    pub cf_attributes: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            mode: SaveMode::default(),
            storage: StorageType::default(),
            deflate_level: Some(9),
            significant_digits: None,
            cf_attributes: true,
        }
    }
}

/// Write a gridded variable and its coordinates to a netCDF file.
///
/// In append mode, an existing variable of the same name must have the same
/// dimension names and shape, and existing dimensions must have the same
/// length; the data and coordinates are then overwritten.
pub fn save_variable(
    path: &Path,
    gv: &GriddedVariable,
    opts: &SaveOptions,
) -> error_stack::Result<(), WriteError> {
    let shape = gv.data.shape().to_vec();
    if gv.dim_names.len() != shape.len() || gv.coords.len() != shape.len() {
        return Err(WriteError::DimensionCount {
            var: gv.name.to_string(),
            ndata: shape.len(),
            nnames: gv.dim_names.len().min(gv.coords.len()),
        }
        .into());
    }
    for ((dim, coord), &n) in gv.dim_names.iter().zip(gv.coords).zip(&shape) {
        if coord.len() != n {
            return Err(WriteError::CoordinateLength {
                dim: dim.clone(),
                coord: coord.len(),
                data: n,
            }
            .into());
        }
    }

    let nc_err = || WriteError::Netcdf(path.to_path_buf());
    let mut ds = match (opts.mode, path.exists()) {
        (SaveMode::Create, true) => return Err(WriteError::AlreadyExists(path.to_path_buf()).into()),
        (SaveMode::Append, true) => netcdf::append(path).change_context_lazy(nc_err)?,
        (_, false) => netcdf::create(path).change_context_lazy(nc_err)?,
    };

    let existing = ds.variable(gv.name).map(|v| (dim_names(&v), var_shape(&v)));
    if let Some((existing_dims, existing_shape)) = &existing {
        if existing_dims.as_slice() != gv.dim_names {
            return Err(WriteError::InconsistentDimensions {
                var: gv.name.to_string(),
                existing: existing_dims.clone(),
                new: gv.dim_names.to_vec(),
            }
            .into());
        }
        if existing_shape != &shape {
            return Err(WriteError::InconsistentShape {
                var: gv.name.to_string(),
                existing: existing_shape.clone(),
                new: shape,
            }
            .into());
        }
    }

    for (dim, coord) in gv.dim_names.iter().zip(gv.coords) {
        write_coordinate(&mut ds, path, dim, coord, opts.cf_attributes)?;
    }

    let data = match opts.significant_digits {
        Some(n) => gv.data.mapv(|v| round_to_significant(v, n)),
        None => gv.data.to_owned(),
    };
    let dims = gv.dim_names.iter().map(|s| s.as_str()).collect_vec();

    if existing.is_none() {
        let mut var = match opts.storage {
            StorageType::F32 => ds.add_variable::<f32>(gv.name, &dims),
            StorageType::F64 => ds.add_variable::<f64>(gv.name, &dims),
        }
        .change_context_lazy(nc_err)?;
        if let Some(level) = opts.deflate_level {
            var.set_compression(level, true)
                .change_context_lazy(nc_err)
                .attach_printable("could not enable compression")?;
        }
    }

    let mut var = ds
        .variable_mut(gv.name)
        .ok_or_else(|| netcdf::Error::NotFound(gv.name.to_string()))
        .change_context_lazy(nc_err)?;
    match opts.storage {
        StorageType::F32 => var.put(data.mapv(|v| v as f32).view(), Extents::All),
        StorageType::F64 => var.put(data.view(), Extents::All),
    }
    .change_context_lazy(nc_err)
    .attach_printable_lazy(|| format!("while writing variable '{}'", gv.name))?;

    for (key, value) in gv.attributes {
        var.put_attribute(key, value.as_str())
            .change_context_lazy(nc_err)?;
    }

    debug!("wrote {} with shape {:?} to {}", gv.name, gv.data.shape(), path.display());
    Ok(())
}

fn write_coordinate(
    ds: &mut netcdf::FileMut,
    path: &Path,
    dim: &str,
    coord: &Array1<f64>,
    cf_attributes: bool,
) -> error_stack::Result<(), WriteError> {
    let nc_err = || WriteError::Netcdf(path.to_path_buf());
    match ds.dimension(dim).map(|d| d.len()) {
        Some(len) if len != coord.len() => {
            return Err(WriteError::InconsistentDimensionLength {
                dim: dim.to_string(),
                existing: len,
                new: coord.len(),
            }
            .into())
        }
        Some(_) => (),
        None => {
            ds.add_dimension(dim, coord.len()).change_context_lazy(nc_err)?;
        }
    }

    let is_new = ds.variable(dim).is_none();
    let mut var = if is_new {
        ds.add_variable::<f64>(dim, &[dim])
    } else {
        ds.variable_mut(dim).ok_or_else(|| netcdf::Error::NotFound(dim.to_string()))
    }
    .change_context_lazy(nc_err)?;

    var.put(coord.view(), Extents::All)
        .change_context_lazy(nc_err)
        .attach_printable_lazy(|| format!("while writing coordinate '{dim}'"))?;

    if is_new && cf_attributes {
        for (key, value) in coordinate_attributes(dim) {
            var.put_attribute(key, value).change_context_lazy(nc_err)?;
        }
    }
    Ok(())
}

/// Standard attributes for commonly named coordinates.
pub fn coordinate_attributes(dim: &str) -> Vec<(&'static str, &'static str)> {
    let lower = dim.to_ascii_lowercase();
    match lower.as_str() {
        "lon" | "longitude" => vec![("axis", "X"), ("units", "degrees_east")],
        "lat" | "latitude" => vec![("axis", "Y"), ("units", "degrees_north")],
        "lev" | "level" | "plev" => vec![("axis", "Z")],
        _ if is_time_name(dim) => vec![
            ("axis", "T"),
            ("units", DAY_NUMBER_UNITS),
            ("long_name", "time"),
            ("standard_name", "time"),
        ],
        _ => vec![],
    }
}

/// Round to a number of significant digits; zero and non-finite values pass through.
pub fn round_to_significant(v: f64, digits: u8) -> f64 {
    if v == 0.0 || !v.is_finite() || digits == 0 {
        return v;
    }
    let magnitude = v.abs().log10().floor() as i32;
    let factor = 10f64.powi(digits as i32 - 1 - magnitude);
    (v * factor).round() / factor
}
