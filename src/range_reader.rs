//! Read rectangular sub-ranges of gridded variables by coordinate value.
//!
//! The readers here resolve one [`RangeQuery`] per dimension against the
//! stored coordinate variables, read the matching hyperslab from the file in
//! a single call, and return the data with every dimension in ascending
//! order, regardless of how it was stored on disk.
use std::{fmt::Display, ops::Range, path::Path, str::FromStr};

use error_stack::{Report, ResultExt};
use itertools::Itertools;
use log::debug;
use ndarray::{Array1, ArrayD, Axis};

use crate::{
    error::{QueryError, ReadError, TimeError},
    indexing::{value_to_slice, w2g},
    nc_utils::{
        dim_names, find_time_dimension, get_string_attribute, is_time_name, open_dataset,
        read_coordinate, read_time_coordinate, read_unpacked, require_variable, GriddedVariable,
    },
    timetools::add_months_to_day_number,
};

/// An inclusive window of coordinate values for one dimension. Missing
/// bounds are open. Time dimensions are queried in day numbers.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RangeQuery {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl RangeQuery {
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(min: f64, max: f64) -> Self {
        Self::new(Some(min), Some(max))
    }

    fn lower(&self) -> f64 {
        self.min.unwrap_or(f64::NEG_INFINITY)
    }

    fn upper(&self) -> f64 {
        self.max.unwrap_or(f64::INFINITY)
    }
}

impl From<(Option<f64>, Option<f64>)> for RangeQuery {
    fn from(value: (Option<f64>, Option<f64>)) -> Self {
        Self::new(value.0, value.1)
    }
}

impl Display for RangeQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fmt_bound = |b: Option<f64>| b.map(|v| v.to_string()).unwrap_or_default();
        write!(f, "{}:{}", fmt_bound(self.min), fmt_bound(self.max))
    }
}

/// Parses `"MIN:MAX"`, where either side may be empty for an open bound.
impl FromStr for RangeQuery {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lo, hi) = s
            .split_once(':')
            .ok_or_else(|| format!("range '{s}' must be given as MIN:MAX"))?;
        let parse = |part: &str| -> Result<Option<f64>, String> {
            let part = part.trim();
            if part.is_empty() {
                Ok(None)
            } else {
                part.parse().map(Some).map_err(|e| format!("bad bound '{part}' in '{s}': {e}"))
            }
        };
        Ok(Self::new(parse(lo)?, parse(hi)?))
    }
}

/// How to find and decode the time axis of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeDecoding {
    /// Guess the time dimension from its name; fail if none looks like time.
    #[default]
    Auto,
    /// Decode this dimension index as time.
    Dimension(usize),
    /// Treat every coordinate as plain numbers.
    Off,
}

/// Data read from one variable, with one ascending coordinate per dimension.
#[derive(Debug, Clone)]
pub struct GriddedSubset {
    pub var_name: String,
    pub dim_names: Vec<String>,
    pub data: ArrayD<f64>,
    pub coords: Vec<Array1<f64>>,
    /// Index of the dimension whose coordinate holds day numbers, if any.
    pub time_dim: Option<usize>,
}

impl GriddedSubset {
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn as_gridded_variable<'a>(&'a self, attributes: &'a [(String, String)]) -> GriddedVariable<'a> {
        GriddedVariable {
            name: &self.var_name,
            data: self.data.view(),
            dim_names: &self.dim_names,
            coords: &self.coords,
            attributes,
        }
    }
}

fn check_query_count(names: &[String], queries: &[RangeQuery]) -> error_stack::Result<(), ReadError> {
    if names.len() != queries.len() {
        return Err(Report::new(QueryError::WrongQueryCount {
            given: queries.len(),
            ndim: names.len(),
        })
        .change_context(ReadError::Query { dim: names.join(",") }));
    }
    Ok(())
}

/// Read the part of `var_name` that lies inside `queries`, one query per
/// dimension in the variable's dimension order.
///
/// Coordinates may be stored ascending or descending; the index range is
/// resolved on the ascending view, mapped back to storage order for the
/// read, and descending axes are flipped afterwards so the returned data
/// and coordinates are always ascending.
pub fn read_by_dim_range(
    path: &Path,
    var_name: &str,
    queries: &[RangeQuery],
    time: TimeDecoding,
) -> error_stack::Result<GriddedSubset, ReadError> {
    let ds = open_dataset(path)?;
    let var = require_variable(&ds, path, var_name)?;
    let names = dim_names(&var);
    check_query_count(&names, queries)?;

    let time_dim = match time {
        TimeDecoding::Auto => Some(
            find_time_dimension(&names).ok_or_else(|| ReadError::NoTimeDimension(names.clone()))?,
        ),
        TimeDecoding::Dimension(i) if i >= names.len() => {
            return Err(ReadError::BadTimeIndex {
                index: i,
                ndim: names.len(),
            }
            .into())
        }
        TimeDecoding::Dimension(i) => Some(i),
        TimeDecoding::Off => None,
    };

    let mut storage_ranges: Vec<Range<usize>> = Vec::with_capacity(names.len());
    let mut coords = Vec::with_capacity(names.len());
    let mut flipped = Vec::new();

    for (idim, (name, query)) in names.iter().zip(queries).enumerate() {
        let stored = if time_dim == Some(idim) {
            read_time_coordinate(&ds, path, name)?
        } else {
            read_coordinate(&ds, path, name)?
        };
        let n = stored.len();
        let descending = n > 1 && stored[0] > stored[n - 1];
        let ascending = if descending {
            stored.iter().rev().copied().collect_vec()
        } else {
            stored.to_vec()
        };

        let r = value_to_slice(&ascending, query.lower(), query.upper())
            .change_context_lazy(|| ReadError::Query { dim: name.clone() })
            .attach_printable_lazy(|| format!("query was {query} on {}", path.display()))?;

        coords.push(Array1::from_iter(ascending[r.clone()].iter().copied()));
        if descending {
            storage_ranges.push((n - r.end)..(n - r.start));
            flipped.push(idim);
        } else {
            storage_ranges.push(r);
        }
    }

    debug!("reading {var_name} from {} with ranges {storage_ranges:?}", path.display());
    let mut data = read_unpacked(&var, storage_ranges)
        .change_context_lazy(|| ReadError::Netcdf(path.to_path_buf()))
        .attach_printable_lazy(|| format!("while reading variable '{var_name}'"))?;
    for idim in flipped {
        data.invert_axis(Axis(idim));
    }

    Ok(GriddedSubset {
        var_name: var_name.to_string(),
        dim_names: names,
        data: data.as_standard_layout().into_owned(),
        coords,
        time_dim,
    })
}

/// Spacing of a synthetic time axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeStep {
    Days(f64),
    Months(i32),
}

/// A time coordinate constructed from a start and a step, for files whose
/// stored time values are absent or unusable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticTimeAxis {
    pub dim: usize,
    /// Day number of the first element.
    pub start: f64,
    pub step: TimeStep,
}

impl SyntheticTimeAxis {
    pub fn values(&self, len: usize) -> Result<Array1<f64>, TimeError> {
        let values: Vec<f64> = match self.step {
            TimeStep::Days(d) => (0..len).map(|i| self.start + i as f64 * d).collect(),
            TimeStep::Months(m) => (0..len)
                .map(|i| add_months_to_day_number(self.start, m * i as i32))
                .try_collect()?,
        };
        Ok(Array1::from_vec(values))
    }
}

/// Read the part of `var_name` inside `queries`, letting windows wrap around
/// the ends of a dimension (see [`w2g`]).
///
/// Returns `Ok(None)` if any dimension has no coordinate inside its window.
/// Time-like dimensions with a `units` attribute are decoded to day numbers
/// unless `synthetic_time` replaces them.
pub fn read_w2g(
    path: &Path,
    var_name: &str,
    queries: &[RangeQuery],
    synthetic_time: Option<SyntheticTimeAxis>,
) -> error_stack::Result<Option<GriddedSubset>, ReadError> {
    let ds = open_dataset(path)?;
    let var = require_variable(&ds, path, var_name)?;
    let names = dim_names(&var);
    check_query_count(&names, queries)?;
    if let Some(st) = synthetic_time {
        if st.dim >= names.len() {
            return Err(ReadError::BadTimeIndex {
                index: st.dim,
                ndim: names.len(),
            }
            .into());
        }
    }

    let mut storage_ranges = Vec::with_capacity(names.len());
    let mut selections: Vec<(usize, Vec<usize>)> = Vec::new();
    let mut coords = Vec::with_capacity(names.len());
    let mut time_dim = None;
    let mut wrapped = Vec::new();

    for (idim, (name, query)) in names.iter().zip(queries).enumerate() {
        let stored = match synthetic_time {
            Some(st) if st.dim == idim => {
                time_dim = Some(idim);
                let len = var.dimensions()[idim].len();
                st.values(len).change_context_lazy(|| ReadError::Time(name.clone()))?
            }
            _ => {
                let coord_var = ds.variable(name);
                let has_units = coord_var
                    .as_ref()
                    .map(|v| get_string_attribute(v, "units").is_some())
                    .unwrap_or(false);
                if is_time_name(name) && has_units {
                    time_dim = Some(idim);
                    read_time_coordinate(&ds, path, name)?
                } else {
                    read_coordinate(&ds, path, name)?
                }
            }
        };

        let Some(window) = w2g(&stored.to_vec(), query.min, query.max) else {
            debug!("no data for {var_name} in {} for dimension {name}", path.display());
            return Ok(None);
        };

        if window.is_wrapped() {
            storage_ranges.push(0..stored.len());
            selections.push((idim, window.indices(stored.len())));
            wrapped.push(idim);
        } else {
            storage_ranges.push(window.start..window.end);
        }
        coords.push(window.values);
    }

    let mut data = read_unpacked(&var, storage_ranges)
        .change_context_lazy(|| ReadError::Netcdf(path.to_path_buf()))
        .attach_printable_lazy(|| format!("while reading variable '{var_name}'"))?;
    for (idim, indices) in selections {
        data = data.select(Axis(idim), &indices);
    }

    // Wrapped windows are already in read order across the seam
    for (idim, coord) in coords.iter_mut().enumerate() {
        if !wrapped.contains(&idim) && coord.len() > 1 && coord[0] > coord[1] {
            coord.invert_axis(Axis(0));
            data.invert_axis(Axis(idim));
        }
    }

    Ok(Some(GriddedSubset {
        var_name: var_name.to_string(),
        dim_names: names,
        data: data.as_standard_layout().into_owned(),
        coords: coords.into_iter().map(|c| c.as_standard_layout().into_owned()).collect(),
        time_dim,
    }))
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;
    use crate::test_utils::{index_coded_array, write_test_file, TestAxis};

    /// A (time, lat, lon) file with a descending latitude axis.
    #[fixture]
    fn grid_file() -> (TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.nc");
        write_test_file(
            &path,
            "olr",
            &[
                TestAxis::time(&[10.0, 11.0, 12.0]),
                TestAxis::new("lat", &[10.0, 5.0, 0.0, -5.0, -10.0]),
                TestAxis::new("lon", &[0.0, 90.0, 180.0, 270.0]),
            ],
            index_coded_array(&[3, 5, 4]),
        );
        (dir, path)
    }

    #[rstest]
    fn test_read_descending_axis(grid_file: (TempDir, std::path::PathBuf)) {
        let (_dir, path) = grid_file;
        let queries = [
            RangeQuery::between(11.0, 12.0),
            RangeQuery::between(-5.0, 5.0),
            RangeQuery::between(90.0, 180.0),
        ];
        let sub = read_by_dim_range(&path, "olr", &queries, TimeDecoding::Auto).unwrap();
        assert_eq!(sub.shape(), &[2, 3, 2]);
        assert_eq!(sub.time_dim, Some(0));
        assert_abs_diff_eq!(sub.coords[0], array![11.0, 12.0]);
        assert_abs_diff_eq!(sub.coords[1], array![-5.0, 0.0, 5.0]);
        assert_abs_diff_eq!(sub.coords[2], array![90.0, 180.0]);
        // lat = -5 was stored at index 3, lat = 5 at index 1
        assert_abs_diff_eq!(sub.data[[0, 0, 0]], 100.0 + 30.0 + 1.0);
        assert_abs_diff_eq!(sub.data[[1, 2, 1]], 200.0 + 10.0 + 2.0);
    }

    #[rstest]
    fn test_full_read_is_ascending_copy(grid_file: (TempDir, std::path::PathBuf)) {
        let (_dir, path) = grid_file;
        let sub = read_by_dim_range(&path, "olr", &[RangeQuery::all(); 3], TimeDecoding::Off).unwrap();
        assert_eq!(sub.shape(), &[3, 5, 4]);
        assert_eq!(sub.time_dim, None);
        let mut expected = index_coded_array(&[3, 5, 4]);
        expected.invert_axis(Axis(1));
        assert_abs_diff_eq!(sub.data, expected);
    }

    #[test]
    fn test_time_units_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hourly.nc");
        write_test_file(
            &path,
            "pr",
            &[
                TestAxis::new("lon", &[0.0, 1.0]),
                TestAxis::new("valid_time", &[0.0, 6.0, 12.0, 18.0, 24.0])
                    .with_units("hours since 2000-01-01 00:00:00"),
            ],
            index_coded_array(&[2, 5]),
        );
        let queries = [RangeQuery::all(), RangeQuery::between(0.25, 0.75)];
        let sub = read_by_dim_range(&path, "pr", &queries, TimeDecoding::Auto).unwrap();
        assert_eq!(sub.time_dim, Some(1));
        assert_abs_diff_eq!(sub.coords[1], array![0.25, 0.5, 0.75]);
        assert_abs_diff_eq!(sub.data, array![[1.0, 2.0, 3.0], [11.0, 12.0, 13.0]].into_dyn());
    }

    #[rstest]
    fn test_read_errors(grid_file: (TempDir, std::path::PathBuf)) {
        let (dir, path) = grid_file;
        let all = [RangeQuery::all(); 3];

        let err = read_by_dim_range(&dir.path().join("nope.nc"), "olr", &all, TimeDecoding::Auto).unwrap_err();
        assert!(matches!(err.current_context(), ReadError::FileNotFound(_)));

        let err = read_by_dim_range(&path, "u", &all, TimeDecoding::Auto).unwrap_err();
        assert!(matches!(err.current_context(), ReadError::VariableNotFound { .. }));

        let err = read_by_dim_range(&path, "olr", &all[..2], TimeDecoding::Auto).unwrap_err();
        assert!(matches!(err.current_context(), ReadError::Query { .. }));

        let err = read_by_dim_range(&path, "olr", &all, TimeDecoding::Dimension(3)).unwrap_err();
        assert!(matches!(err.current_context(), ReadError::BadTimeIndex { .. }));

        let outside = [RangeQuery::all(), RangeQuery::between(50.0, 60.0), RangeQuery::all()];
        let err = read_by_dim_range(&path, "olr", &outside, TimeDecoding::Auto).unwrap_err();
        assert!(matches!(err.current_context(), ReadError::Query { dim } if dim == "lat"));

        let inverted = [RangeQuery::all(), RangeQuery::between(5.0, -5.0), RangeQuery::all()];
        assert!(read_by_dim_range(&path, "olr", &inverted, TimeDecoding::Auto).is_err());
    }

    #[test]
    fn test_no_time_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static.nc");
        write_test_file(
            &path,
            "topo",
            &[TestAxis::new("lat", &[0.0, 1.0]), TestAxis::new("lon", &[0.0, 1.0, 2.0])],
            index_coded_array(&[2, 3]),
        );
        let all = [RangeQuery::all(); 2];
        let err = read_by_dim_range(&path, "topo", &all, TimeDecoding::Auto).unwrap_err();
        assert!(matches!(err.current_context(), ReadError::NoTimeDimension(_)));
        assert!(read_by_dim_range(&path, "topo", &all, TimeDecoding::Off).is_ok());
    }

    #[test]
    fn test_bad_time_units() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.nc");
        write_test_file(
            &path,
            "x",
            &[TestAxis::new("time", &[0.0, 1.0]).with_units("days after the flood")],
            array![1.0, 2.0].into_dyn(),
        );
        let err = read_by_dim_range(&path, "x", &[RangeQuery::all()], TimeDecoding::Auto).unwrap_err();
        assert!(matches!(err.current_context(), ReadError::Time(_)));
    }

    #[rstest]
    fn test_w2g_reader_wraps(grid_file: (TempDir, std::path::PathBuf)) {
        let (_dir, path) = grid_file;
        let queries = [
            RangeQuery::between(10.0, 10.0),
            RangeQuery::between(0.0, 10.0),
            RangeQuery::between(270.0, 90.0),
        ];
        let sub = read_w2g(&path, "olr", &queries, None).unwrap().unwrap();
        assert_eq!(sub.shape(), &[1, 3, 3]);
        assert_abs_diff_eq!(sub.coords[1], array![0.0, 5.0, 10.0]);
        assert_abs_diff_eq!(sub.coords[2], array![270.0, 0.0, 90.0]);
        // lat 0 is storage index 2; lon order is 270, 0, 90
        assert_abs_diff_eq!(sub.data[[0, 0, 0]], 23.0);
        assert_abs_diff_eq!(sub.data[[0, 0, 1]], 20.0);
        assert_abs_diff_eq!(sub.data[[0, 2, 2]], 1.0);
    }

    #[rstest]
    fn test_w2g_reader_no_data(grid_file: (TempDir, std::path::PathBuf)) {
        let (_dir, path) = grid_file;
        let queries = [RangeQuery::all(), RangeQuery::between(40.0, 50.0), RangeQuery::all()];
        assert!(read_w2g(&path, "olr", &queries, None).unwrap().is_none());
    }

    #[rstest]
    fn test_w2g_synthetic_time(grid_file: (TempDir, std::path::PathBuf)) {
        let (_dir, path) = grid_file;
        let start = crate::timetools::ymd_to_day_number(2001, 1, 31).unwrap();
        let axis = SyntheticTimeAxis {
            dim: 0,
            start,
            step: TimeStep::Months(1),
        };
        let feb = crate::timetools::ymd_to_day_number(2001, 2, 28).unwrap();
        let queries = [RangeQuery::between(feb, feb + 40.0), RangeQuery::all(), RangeQuery::all()];
        let sub = read_w2g(&path, "olr", &queries, Some(axis)).unwrap().unwrap();
        assert_eq!(sub.time_dim, Some(0));
        assert_eq!(sub.shape()[0], 2);
        assert_abs_diff_eq!(sub.coords[0][0], feb);
        assert_abs_diff_eq!(
            sub.coords[0][1],
            crate::timetools::ymd_to_day_number(2001, 3, 31).unwrap()
        );
    }

    #[rstest]
    #[case("1.5:2", Some(1.5), Some(2.0))]
    #[case(":2", None, Some(2.0))]
    #[case("-10:", Some(-10.0), None)]
    #[case(":", None, None)]
    fn test_parse_query(#[case] s: &str, #[case] min: Option<f64>, #[case] max: Option<f64>) {
        assert_eq!(s.parse::<RangeQuery>().unwrap(), RangeQuery::new(min, max));
    }
}
