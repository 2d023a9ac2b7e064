//! Observations and reanalyses, their climatologies and anomalies.
//!
//! Sources are described in a TOML file: where the files are, which variable
//! they hold, and how file names change with the date. A minimal example:
//!
//! ```toml
//! root = "/data/obs"
//! clim_years = [2001, 2020]
//! clim_type = "5dma"
//!
//! [sources.olr]
//! variable = "olr"
//! total_path = "NOAA_OLR/olr.cbo-1deg.day.mean.nc"
//! clim_path = "NOAA_OLR/olr_clim_{first_year}_{last_year}_1p0_{clim_type}.nc"
//!
//! [sources.z]
//! variable = "z"
//! total_path = "ERA5/daymean/PRS/z/ERA5_z_%Y%m_r720x360_1day.nc"
//! scale = 0.10197162129779283
//! ```
//!
//! Total paths are strftime patterns rendered for each date in the requested
//! time range, so a source may be one file, one file per year, or one file
//! per day. Climatology files hold 366 days dated in the leap reference year
//! 2000 (see [`crate::climatology`]). The first dimension of every source
//! must be time.
use std::path::{Path, PathBuf};

use chrono::{
    format::{Item, StrftimeItems},
    Datelike,
};
use error_stack::ResultExt;
use figment::{
    providers::{Format, Toml},
    Figment,
};
use indexmap::IndexMap;
use itertools::Itertools;
use log::debug;
use ndarray::{concatenate, Axis};
use serde::{Deserialize, Serialize};

use crate::{
    climatology::{clim_day_index, clim_reference_day_number, ClimType},
    error::{ConfigError, ReadError},
    interpolation::{regrid_pair, RegridTarget},
    multi_read::{self, coords_match, format_coord, MultiReadOptions, StackAxis},
    range_reader::{read_by_dim_range, GriddedSubset, RangeQuery, TimeDecoding},
    timetools::day_number_to_datetime,
};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ObsSource {
    /// Name of the variable inside the files.
    pub variable: String,
    /// Path of the total files below the root, as a strftime pattern.
    pub total_path: String,
    /// Path of the climatology file below the root. `{first_year}`,
    /// `{last_year}` and `{clim_type}` are filled in.
    #[serde(default)]
    pub clim_path: Option<String>,
    /// Multiplies totals and climatologies after reading.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Spacing of the dates `total_path` is rendered for.
    #[serde(default = "default_path_step_hours")]
    pub path_step_hours: u32,
}

fn default_scale() -> f64 {
    1.0
}

fn default_path_step_hours() -> u32 {
    24
}

fn default_clim_years() -> (i32, i32) {
    (2001, 2020)
}

fn default_clim_type() -> ClimType {
    ClimType::FiveDayMean
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ObsConfig {
    pub root: PathBuf,
    #[serde(default = "default_clim_years")]
    pub clim_years: (i32, i32),
    #[serde(default = "default_clim_type")]
    pub clim_type: ClimType,
    pub sources: IndexMap<String, ObsSource>,
}

impl ObsConfig {
    pub fn from_toml_file(path: &Path) -> error_stack::Result<Self, ConfigError> {
        let config: Self = Figment::from(Toml::file_exact(path))
            .extract()
            .map_err(|e| error_stack::Report::new(ConfigError::Load(path.to_path_buf())).attach_printable(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> error_stack::Result<Self, ConfigError> {
        let config: Self = Figment::from(Toml::string(s))
            .extract()
            .map_err(|e| error_stack::Report::new(ConfigError::Load(PathBuf::from("<string>"))).attach_printable(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> error_stack::Result<(), ConfigError> {
        let mut problems = vec![];
        if self.clim_years.0 > self.clim_years.1 {
            problems.push(format!(
                "clim_years {} to {} are inverted",
                self.clim_years.0, self.clim_years.1
            ));
        }
        if self.sources.is_empty() {
            problems.push("no observation sources are configured".to_string());
        }
        for (name, source) in &self.sources {
            if source.variable.is_empty() {
                problems.push(format!("source '{name}' has an empty variable name"));
            }
            if source.total_path.is_empty() {
                problems.push(format!("source '{name}' has an empty total_path"));
            } else if StrftimeItems::new(&source.total_path).any(|item| matches!(item, Item::Error)) {
                problems.push(format!(
                    "source '{name}' total_path '{}' is not a valid date pattern",
                    source.total_path
                ));
            }
            if let Some(pattern) = &source.clim_path {
                let rendered = render_clim_path(pattern, self.clim_years, self.clim_type);
                if rendered.contains(['{', '}']) {
                    problems.push(format!("source '{name}' clim_path '{pattern}' has an unknown placeholder"));
                }
            }
            if !source.scale.is_finite() || source.scale == 0.0 {
                problems.push(format!("source '{name}' has an unusable scale {}", source.scale));
            }
            if source.path_step_hours == 0 {
                problems.push(format!("source '{name}' has a path_step_hours of 0"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems).into())
        }
    }
}

fn render_clim_path(pattern: &str, years: (i32, i32), clim_type: ClimType) -> String {
    pattern
        .replace("{first_year}", &years.0.to_string())
        .replace("{last_year}", &years.1.to_string())
        .replace("{clim_type}", &clim_type.to_string())
}

/// Reads totals, climatologies and anomalies of configured sources.
///
/// Every read takes one [`RangeQuery`] per dimension of the source variable.
/// The time query (the first) must have both bounds, since it decides which
/// files are read.
#[derive(Debug, Clone)]
pub struct ObsReader {
    config: ObsConfig,
}

impl ObsReader {
    pub fn new(config: ObsConfig) -> error_stack::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ObsConfig {
        &self.config
    }

    fn source(&self, name: &str) -> Result<&ObsSource, ReadError> {
        self.config
            .sources
            .get(name)
            .ok_or_else(|| ReadError::UnknownSource(name.to_string()))
    }

    /// Total files with data from `start` to `end`, in date order and
    /// without repeats.
    pub fn total_paths(&self, name: &str, start: f64, end: f64) -> error_stack::Result<Vec<PathBuf>, ReadError> {
        let source = self.source(name)?;
        let step = source.path_step_hours as f64 / 24.0;
        let nsteps = ((end - start) / step).floor().max(0.0) as usize;
        let mut paths = vec![];
        for t in (0..=nsteps).map(|i| start + i as f64 * step).chain(std::iter::once(end)) {
            let dt = day_number_to_datetime(t).change_context_lazy(|| ReadError::Time(format!("day number {t}")))?;
            paths.push(self.config.root.join(dt.format(&source.total_path).to_string()));
        }
        Ok(paths.into_iter().unique().collect())
    }

    pub fn clim_file(&self, name: &str) -> Result<PathBuf, ReadError> {
        let source = self.source(name)?;
        let pattern = source
            .clim_path
            .as_deref()
            .ok_or_else(|| ReadError::NoClimatologyPath(name.to_string()))?;
        Ok(self
            .config
            .root
            .join(render_clim_path(pattern, self.config.clim_years, self.config.clim_type)))
    }

    /// Read the total of source `name` from every file the time range touches,
    /// concatenated along time.
    pub fn total(&self, name: &str, queries: &[RangeQuery]) -> error_stack::Result<GriddedSubset, ReadError> {
        let source = self.source(name)?;
        let (start, end) = time_bounds(queries)?;
        let paths = self.total_paths(name, start, end)?;
        debug!("reading {name} from {} file(s)", paths.len());
        let opts = MultiReadOptions::default()
            .stacked_along(StackAxis::Existing(0))
            .with_time(TimeDecoding::Dimension(0));
        let mut subset = multi_read::read(&paths, &source.variable, queries, &opts)?;
        apply_scale(&mut subset, source.scale);
        Ok(subset)
    }

    /// Read the climatology days the time range covers.
    ///
    /// The time coordinate of the result is in the reference year. A range
    /// that crosses into a new year, but is shorter than a year, is read in
    /// two parts (to the end of the first year, then from the start of the
    /// next) and joined in that order. A year or more reads every day.
    pub fn clim(&self, name: &str, queries: &[RangeQuery]) -> error_stack::Result<GriddedSubset, ReadError> {
        let source = self.source(name)?;
        let path = self.clim_file(name)?;
        let (start, end) = time_bounds(queries)?;

        let year_of = |t: f64| {
            day_number_to_datetime(t)
                .map(|dt| dt.year())
                .change_context_lazy(|| ReadError::Time(format!("day number {t}")))
        };
        let in_clim_year = |t: f64| {
            clim_reference_day_number(t).change_context_lazy(|| ReadError::Time(format!("day number {t}")))
        };
        let (first_year, last_year) = (year_of(start)?, year_of(end)?);
        let (c1, c2) = (in_clim_year(start)?, in_clim_year(end)?);

        let read = |window: RangeQuery| {
            let mut q = queries.to_vec();
            q[0] = window;
            read_by_dim_range(&path, &source.variable, &q, TimeDecoding::Dimension(0))
        };
        let mut subset = if first_year == last_year {
            read(RangeQuery::between(c1, c2))?
        } else if last_year > first_year + 1 || c2 + 1.0 >= c1 {
            read(RangeQuery::all())?
        } else {
            let end_of_year = read(RangeQuery::new(Some(c1), None))?;
            let start_of_year = read(RangeQuery::new(None, Some(c2)))?;
            join_along_time(&path, end_of_year, start_of_year)?
        };
        apply_scale(&mut subset, source.scale);
        Ok(subset)
    }

    /// Total minus climatology, matching each time to its climatology day.
    ///
    /// The horizontal grids must agree unless `regrid` says which one the
    /// other is interpolated onto.
    pub fn anomaly(
        &self,
        name: &str,
        queries: &[RangeQuery],
        regrid: RegridTarget,
    ) -> error_stack::Result<GriddedSubset, ReadError> {
        let source = self.source(name)?;
        let total = self.total(name, queries)?;
        let clim = self.clim(name, queries)?;

        let total_path = self.config.root.join(&source.total_path);
        let clim_path = self.clim_file(name)?;
        let (from, onto) = match regrid {
            RegridTarget::Clim => (&total_path, &clim_path),
            _ => (&clim_path, &total_path),
        };
        let (mut anomaly, clim) = regrid_pair(regrid, total, clim).change_context_lazy(|| ReadError::Regrid {
            from: from.clone(),
            onto: onto.clone(),
        })?;

        if anomaly.shape().len() != clim.shape().len() || anomaly.shape()[1..] != clim.shape()[1..] {
            return Err(ReadError::Shape {
                var: source.variable.clone(),
                first_file: total_path,
                first: anomaly.shape().to_vec(),
                second_file: clim_path,
                second: clim.shape().to_vec(),
            }
            .into());
        }
        for idim in 1..anomaly.coords.len() {
            if !coords_match(&anomaly.coords[idim], &clim.coords[idim]) {
                return Err(ReadError::DimensionValues {
                    dim: anomaly.dim_names[idim].clone(),
                    first_file: total_path,
                    first: format_coord(&anomaly.coords[idim]),
                    second_file: clim_path,
                    second: format_coord(&clim.coords[idim]),
                }
                .into());
            }
        }

        let clim_days: Vec<usize> = clim.coords[0]
            .iter()
            .map(|&t| clim_day_index(t))
            .try_collect()
            .change_context_lazy(|| ReadError::Time("climatology time axis".to_string()))?;
        for (it, &t) in anomaly.coords[0].iter().enumerate() {
            let day = clim_day_index(t).change_context_lazy(|| ReadError::Time(format!("day number {t}")))?;
            let ic = clim_days
                .iter()
                .position(|&d| d == day)
                .ok_or_else(|| ReadError::MissingClimDay(format_day(t)))?;
            let mut lane = anomaly.data.index_axis_mut(Axis(0), it);
            lane -= &clim.data.index_axis(Axis(0), ic);
        }
        Ok(anomaly)
    }
}

fn time_bounds(queries: &[RangeQuery]) -> Result<(f64, f64), ReadError> {
    match queries.first() {
        Some(RangeQuery {
            min: Some(start),
            max: Some(end),
        }) => Ok((*start, *end)),
        Some(q) => Err(ReadError::UnboundedTime(q.to_string())),
        None => Err(ReadError::UnboundedTime("no query".to_string())),
    }
}

fn apply_scale(subset: &mut GriddedSubset, scale: f64) {
    if scale != 1.0 {
        subset.data *= scale;
    }
}

fn format_day(t: f64) -> String {
    day_number_to_datetime(t)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|_| t.to_string())
}

/// Join two reads of the same climatology file along time.
fn join_along_time(
    path: &Path,
    first: GriddedSubset,
    second: GriddedSubset,
) -> error_stack::Result<GriddedSubset, ReadError> {
    let shape_error = || ReadError::Shape {
        var: first.var_name.clone(),
        first_file: path.to_path_buf(),
        first: first.shape().to_vec(),
        second_file: path.to_path_buf(),
        second: second.shape().to_vec(),
    };
    let data = concatenate(Axis(0), &[first.data.view(), second.data.view()]).map_err(|_| shape_error())?;
    let time = concatenate(Axis(0), &[first.coords[0].view(), second.coords[0].view()]).map_err(|_| shape_error())?;

    let mut joined = first;
    joined.data = data;
    joined.coords[0] = time;
    Ok(joined)
}
