//! Climatologies, anomalies, and the mapping from dates to climatology days.
//!
//! A climatology here always has 366 days along its day axis. Every date is
//! placed by its month and day in the leap reference year 2000, so February
//! 29 is day 59 and March 1 is day 60 in every year. Leap and non-leap years
//! therefore agree on every date except February 29, which only leap years
//! contribute to. All functions that match data to a climatology go through
//! [`clim_day_index`].
use chrono::{Datelike, NaiveDate, NaiveTime};
use ndarray::{ArrayD, ArrayViewD, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ClimatologyError, TimeError},
    timetools::{datetime_to_day_number, day_number_to_datetime},
};

/// Number of days along the day axis of a climatology.
pub const CLIM_DAYS: usize = 366;

const FEB29_INDEX: usize = 59;

/// Kinds of climatologies, named as they appear in climatology file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, Deserialize, Serialize)]
pub enum ClimType {
    /// Raw daily mean.
    #[strum(serialize = "1day")]
    #[serde(rename = "1day")]
    Daily,
    /// Five-day moving average of the daily mean.
    #[strum(serialize = "5dma")]
    #[serde(rename = "5dma")]
    FiveDayMean,
    /// First three annual harmonics, computed outside this crate.
    #[strum(serialize = "3harm")]
    #[serde(rename = "3harm")]
    ThreeHarmonics,
}

fn reference_date(month: u32, day: u32) -> Result<NaiveDate, TimeError> {
    NaiveDate::from_ymd_opt(2000, month, day).ok_or(TimeError::InvalidYearMonthDay(2000, month, day))
}

/// Climatology day of a day number, optionally keeping the fraction of the day.
pub fn day_of_clim(day_number: f64, keep_fraction: bool) -> Result<f64, TimeError> {
    let dt = day_number_to_datetime(day_number)?;
    let slot = reference_date(dt.month(), dt.day())?.ordinal0() as f64;
    if keep_fraction {
        let midnight = datetime_to_day_number(dt.date().and_time(NaiveTime::MIN));
        Ok(slot + (day_number - midnight))
    } else {
        Ok(slot)
    }
}

/// Index (0 to 365) into the day axis of a climatology for a day number.
pub fn clim_day_index(day_number: f64) -> Result<usize, TimeError> {
    Ok(day_of_clim(day_number, false)? as usize)
}

/// Day number of midnight on the same month and day in the reference year.
pub fn clim_reference_day_number(day_number: f64) -> Result<f64, TimeError> {
    let dt = day_number_to_datetime(day_number)?;
    let date = reference_date(dt.month(), dt.day())?;
    Ok(datetime_to_day_number(date.and_time(NaiveTime::MIN)))
}

fn check_axis(shape: &[usize], axis: usize, ntimes: usize) -> Result<(), ClimatologyError> {
    if axis >= shape.len() {
        return Err(ClimatologyError::BadAxis {
            axis,
            ndim: shape.len(),
        });
    }
    if shape[axis] != ntimes {
        return Err(ClimatologyError::TimeLength {
            ntimes,
            len: shape[axis],
        });
    }
    Ok(())
}

/// Mean over all years for each climatology day, ignoring NaNs.
///
/// When no leap years are present, February 29 is filled with the mean of
/// February 28 and March 1.
pub fn daily_climatology(
    data: ArrayViewD<f64>,
    times: &[f64],
    axis: usize,
) -> Result<ArrayD<f64>, ClimatologyError> {
    check_axis(data.shape(), axis, times.len())?;
    let mut shape = data.shape().to_vec();
    shape[axis] = CLIM_DAYS;
    let mut sums = ArrayD::<f64>::zeros(shape.clone());
    let mut counts = ArrayD::<f64>::zeros(shape);

    for (it, &t) in times.iter().enumerate() {
        let slot = clim_day_index(t)?;
        Zip::from(sums.index_axis_mut(Axis(axis), slot))
            .and(counts.index_axis_mut(Axis(axis), slot))
            .and(data.index_axis(Axis(axis), it))
            .for_each(|s, c, &v| {
                if !v.is_nan() {
                    *s += v;
                    *c += 1.0;
                }
            });
    }

    let mut clim = sums / &counts;
    let feb28 = clim.index_axis(Axis(axis), FEB29_INDEX - 1).to_owned();
    let mar01 = clim.index_axis(Axis(axis), FEB29_INDEX + 1).to_owned();
    Zip::from(clim.index_axis_mut(Axis(axis), FEB29_INDEX))
        .and(counts.index_axis(Axis(axis), FEB29_INDEX))
        .and(&feb28)
        .and(&mar01)
        .for_each(|v, &c, &a, &b| {
            if c == 0.0 {
                *v = 0.5 * (a + b);
            }
        });
    Ok(clim)
}

/// Circular moving average along the day axis of a climatology, ignoring NaNs.
pub fn smooth_climatology(
    clim: ArrayViewD<f64>,
    axis: usize,
    window: usize,
) -> Result<ArrayD<f64>, ClimatologyError> {
    if window == 0 || window % 2 == 0 {
        return Err(ClimatologyError::Window(window));
    }
    check_axis(clim.shape(), axis, CLIM_DAYS)?;

    let half = (window / 2) as isize;
    let mut out = clim.to_owned();
    for lane_idx in 0..CLIM_DAYS {
        let mut sum = ArrayD::<f64>::zeros(clim.index_axis(Axis(axis), 0).shape());
        let mut count = sum.clone();
        for offset in -half..=half {
            let src = (lane_idx as isize + offset).rem_euclid(CLIM_DAYS as isize) as usize;
            Zip::from(&mut sum)
                .and(&mut count)
                .and(clim.index_axis(Axis(axis), src))
                .for_each(|s, c, &v| {
                    if !v.is_nan() {
                        *s += v;
                        *c += 1.0;
                    }
                });
        }
        out.index_axis_mut(Axis(axis), lane_idx).assign(&(sum / count));
    }
    Ok(out)
}

/// Build a climatology of the requested kind from a daily time series.
pub fn compute_climatology(
    data: ArrayViewD<f64>,
    times: &[f64],
    axis: usize,
    kind: ClimType,
) -> Result<ArrayD<f64>, ClimatologyError> {
    let daily = daily_climatology(data, times, axis)?;
    match kind {
        ClimType::Daily => Ok(daily),
        ClimType::FiveDayMean => smooth_climatology(daily.view(), axis, 5),
        ClimType::ThreeHarmonics => Err(ClimatologyError::NotComputable(kind.to_string())),
    }
}

/// Subtract a climatology from data, matching each time to its climatology
/// day with [`clim_day_index`].
///
/// `clim` must have the same shape as `data` except for 366 days along `axis`.
pub fn subtract_climatology(
    data: ArrayViewD<f64>,
    times: &[f64],
    axis: usize,
    clim: ArrayViewD<f64>,
) -> Result<ArrayD<f64>, ClimatologyError> {
    check_axis(data.shape(), axis, times.len())?;
    let mut expected = data.shape().to_vec();
    expected[axis] = CLIM_DAYS;
    if clim.shape() != expected.as_slice() {
        if clim.ndim() == data.ndim() && axis < clim.ndim() && clim.shape()[axis] != CLIM_DAYS {
            return Err(ClimatologyError::ClimatologyLength {
                expected: CLIM_DAYS,
                actual: clim.shape()[axis],
            });
        }
        return Err(ClimatologyError::Shape {
            clim: clim.shape().to_vec(),
            data: data.shape().to_vec(),
        });
    }

    let mut anomaly = data.to_owned();
    for (it, &t) in times.iter().enumerate() {
        let slot = clim_day_index(t)?;
        let mut lane = anomaly.index_axis_mut(Axis(axis), it);
        lane -= &clim.index_axis(Axis(axis), slot);
    }
    Ok(anomaly)
}
