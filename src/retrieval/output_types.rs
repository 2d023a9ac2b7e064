//! Destination products ("output types") and their conversion operators.
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{error::TimeError, timetools::day_number_to_datetime};

/// One destination product, configured under `[output_types.<name>]`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OutputType {
    /// Analysis products hold only the initial time and have no time axis.
    #[serde(default)]
    pub analysis: bool,
    /// Target grid for bilinear remapping, e.g. `r360x181`.
    #[serde(default)]
    pub remap: Option<String>,
    /// Region as `[lon_min, lon_max, lat_min, lat_max]`.
    #[serde(default)]
    pub lonlat_box: Option<[f64; 4]>,
    #[serde(default)]
    pub daily_mean: bool,
    /// Keep only valid times up to this many days after the initial day.
    #[serde(default)]
    pub max_valid_days: Option<u32>,
    /// Also pass the valid-day window to the converter as a date selection.
    #[serde(default)]
    pub select_window: bool,
}

/// Per-variable corrections applied by the converter, in addition to the
/// product's own operators.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VariableCorrections<'a> {
    /// Variable name in the converted file and the name it should have.
    pub rename: Option<(&'a str, &'a str)>,
    pub multiply: f64,
    pub add: f64,
    pub shift_hours: i32,
}

impl OutputType {
    pub fn file_name(name: &str, variable: &str) -> String {
        format!("{name}_{variable}.nc")
    }

    /// Operators describing the product itself.
    pub fn body_operators(&self, init: f64) -> Result<Vec<String>, TimeError> {
        let mut ops = vec![];
        if let Some([lon0, lon1, lat0, lat1]) = self.lonlat_box {
            ops.push(format!("-sellonlatbox,{lon0},{lon1},{lat0},{lat1}"));
        }
        if let Some(grid) = &self.remap {
            ops.push(format!("-remapbil,{grid}"));
        }
        if let (true, Some(ndays)) = (self.select_window, self.max_valid_days) {
            let first = day_number_to_datetime(init)?;
            let last = day_number_to_datetime(init + ndays as f64)?;
            ops.push(format!("-seldate,{},{}", first.format("%Y-%m-%d"), last.format("%Y-%m-%d")));
        }
        if self.daily_mean {
            ops.push("-daymean".to_string());
        }
        Ok(ops)
    }

    /// The full operator chain: rename, scale, offset, product body, then time shift.
    pub fn operators(&self, init: f64, corr: &VariableCorrections) -> Result<Vec<String>, TimeError> {
        let mut ops = vec![];
        if let Some((src, dest)) = corr.rename {
            ops.push(format!("-chname,{src},{dest}"));
        }
        if corr.multiply != 1.0 {
            ops.push(format!("-mulc,{}", corr.multiply));
        }
        if corr.add != 0.0 {
            ops.push(format!("-addc,{}", corr.add));
        }
        ops.extend(self.body_operators(init)?);
        if corr.shift_hours != 0 {
            ops.push(format!("-shifttime,{}hours", corr.shift_hours));
        }
        Ok(ops)
    }

    /// How many time steps a complete file for these leads should have.
    ///
    /// Valid times are the initial time plus each lead (hours) plus the
    /// variable's hour shift, restricted to the valid-day window if there is
    /// one. Daily products count distinct days, others distinct times.
    /// Analysis products always expect one.
    pub fn expected_count(&self, init: f64, leads: &[u32], shift_hours: i32) -> usize {
        if self.analysis {
            return 1;
        }

        let last_day = self.max_valid_days.map(|n| init.floor() + n as f64);
        let valid = leads
            .iter()
            .map(|&l| init + (l as f64 + shift_hours as f64) / 24.0)
            .filter(|t| last_day.map(|d| t.floor() <= d).unwrap_or(true));

        let keys: BTreeSet<i64> = if self.daily_mean {
            valid.map(|t| t.floor() as i64).collect()
        } else {
            valid.map(|t| (t * 1440.0).round() as i64).collect()
        };
        keys.len()
    }
}
