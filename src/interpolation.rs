//! One-dimensional interpolation and the regridding built on it.
//!
//! Gridded fields are regridded one axis at a time, so linear interpolation
//! along latitude and then longitude is bilinear interpolation on the plane.
use std::fmt::Debug;

use interp::InterpMode;
use ndarray::{ArrayD, ArrayView1, ArrayViewD, Axis};
use num_traits::Float;
use serde::{Deserialize, Serialize};

use crate::range_reader::GriddedSubset;

#[derive(Debug, thiserror::Error)]
pub enum InterpolationError {
    #[error("Input arrays were different lengths (x.len() = {x_len}, y.len() = {y_len})")]
    InputLengthMismatch { x_len: usize, y_len: usize },
    #[error("Input arrays were too short, needed at least {req_len} elements but got only {actual_len}")]
    InputTooShort { req_len: usize, actual_len: usize },
    #[error("Requested output coordinate ({out}) falls outside the input domain ({left} to {right})")]
    OutOfDomain { left: String, right: String, out: String },
    #[error("Input coordinate must be strictly monotonic, but is not at index {0}")]
    NotMonotonic(usize),
    #[error("Cannot interpolate along axis {axis} of an array with {ndim} dimensions")]
    BadAxis { axis: usize, ndim: usize },
}

pub trait InterpolationMethod {
    fn interp1d<F: Float + Debug>(&self, input_x: &[F], input_y: &[F], output_x: F) -> Result<F, InterpolationError>;

    /// Interpolate to each of `output_x`. `input_x` must be increasing.
    fn interp1d_many<F: Float + Debug>(
        &self,
        input_x: &[F],
        input_y: &[F],
        output_x: &[F],
    ) -> Result<Vec<F>, InterpolationError> {
        output_x.iter().map(|&x| self.interp1d(input_x, input_y, x)).collect()
    }

    fn check_1d_inputs<F: Float + Debug>(
        &self,
        input_x: &[F],
        input_y: &[F],
        output_x: F,
        must_be_in_bounds: bool,
        min_len: usize,
    ) -> Result<(), InterpolationError> {
        if input_x.len() != input_y.len() {
            return Err(InterpolationError::InputLengthMismatch {
                x_len: input_x.len(),
                y_len: input_y.len(),
            });
        }

        if input_x.len() < min_len {
            return Err(InterpolationError::InputTooShort {
                req_len: min_len,
                actual_len: input_x.len(),
            });
        }

        if must_be_in_bounds {
            let (left_bound, right_bound) = match (
                input_x.iter().copied().reduce(F::min),
                input_x.iter().copied().reduce(F::max),
            ) {
                (Some(l), Some(r)) => (l, r),
                // empty input, only reachable with min_len == 0
                _ => return Ok(()),
            };

            if output_x < left_bound || output_x > right_bound {
                return Err(InterpolationError::OutOfDomain {
                    left: format!("{left_bound:?}"),
                    right: format!("{right_bound:?}"),
                    out: format!("{output_x:?}"),
                });
            }
        }

        Ok(())
    }
}

/// Piecewise linear interpolation. With extrapolation allowed, points
/// outside the input domain continue the first or last segment.
#[derive(Debug, Clone, Copy)]
pub struct LinearInterp {
    allow_extrapolation: bool,
}

impl LinearInterp {
    pub fn new(allow_extrapolation: bool) -> Self {
        Self { allow_extrapolation }
    }
}

impl InterpolationMethod for LinearInterp {
    fn interp1d<F: Float + Debug>(&self, input_x: &[F], input_y: &[F], output_x: F) -> Result<F, InterpolationError> {
        self.check_1d_inputs(input_x, input_y, output_x, !self.allow_extrapolation, 2)?;
        Ok(interp::interp(input_x, input_y, output_x, &InterpMode::Extrapolate))
    }

    fn interp1d_many<F: Float + Debug>(
        &self,
        input_x: &[F],
        input_y: &[F],
        output_x: &[F],
    ) -> Result<Vec<F>, InterpolationError> {
        // checking the extremes covers every point in between
        let lo = output_x.iter().copied().reduce(F::min);
        let hi = output_x.iter().copied().reduce(F::max);
        for x in lo.into_iter().chain(hi) {
            self.check_1d_inputs(input_x, input_y, x, !self.allow_extrapolation, 2)?;
        }
        Ok(interp::interp_slice(input_x, input_y, output_x, &InterpMode::Extrapolate))
    }
}

/// Interpolate `data` along `axis` from coordinate `x` onto `x_new`.
///
/// `x` may be increasing or decreasing but must be strictly monotonic;
/// `x_new` may be in any order. Equal coordinates return a copy of `data`.
pub fn interp_along_axis<M: InterpolationMethod>(
    method: &M,
    data: ArrayViewD<f64>,
    axis: usize,
    x: ArrayView1<f64>,
    x_new: ArrayView1<f64>,
) -> Result<ArrayD<f64>, InterpolationError> {
    if axis >= data.ndim() {
        return Err(InterpolationError::BadAxis { axis, ndim: data.ndim() });
    }
    if x.len() != data.len_of(Axis(axis)) {
        return Err(InterpolationError::InputLengthMismatch {
            x_len: x.len(),
            y_len: data.len_of(Axis(axis)),
        });
    }
    if x == x_new {
        return Ok(data.to_owned());
    }

    let (mut x, mut data) = (x, data);
    let descending = x.len() > 1 && x[1] < x[0];
    if descending {
        x.invert_axis(Axis(0));
        data.invert_axis(Axis(axis));
    }
    if let Some(i) = x.windows(2).into_iter().position(|w| !(w[1] > w[0])) {
        let i = if descending { x.len() - 2 - i } else { i + 1 };
        return Err(InterpolationError::NotMonotonic(i));
    }

    let x = x.to_vec();
    let x_new = x_new.to_vec();
    let mut shape = data.shape().to_vec();
    shape[axis] = x_new.len();
    let mut out = ArrayD::from_elem(shape, f64::NAN);
    for (lane, mut lane_out) in data.lanes(Axis(axis)).into_iter().zip(out.lanes_mut(Axis(axis))) {
        let y = lane.to_vec();
        let y_new = method.interp1d_many(&x, &y, &x_new)?;
        lane_out.assign(&ArrayView1::from(&y_new));
    }
    Ok(out)
}

/// Regrid `subset` onto the coordinates `target` has along each of `dims`,
/// interpolating one dimension at a time.
pub fn regrid_onto<M: InterpolationMethod>(
    method: &M,
    subset: &GriddedSubset,
    target: &GriddedSubset,
    dims: &[usize],
) -> Result<GriddedSubset, InterpolationError> {
    let mut out = subset.clone();
    for &idim in dims {
        if idim >= out.coords.len() || idim >= target.coords.len() {
            return Err(InterpolationError::BadAxis {
                axis: idim,
                ndim: out.coords.len().min(target.coords.len()),
            });
        }
        out.data = interp_along_axis(
            method,
            out.data.view(),
            idim,
            out.coords[idim].view(),
            target.coords[idim].view(),
        )?;
        out.coords[idim] = target.coords[idim].clone();
    }
    Ok(out)
}

/// Which grid two fields are brought onto when they differ horizontally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString, Deserialize, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RegridTarget {
    /// The grids must match; a difference is an error.
    #[default]
    Off,
    /// Interpolate the climatology onto the grid of the total.
    Total,
    /// Interpolate the total onto the grid of the climatology.
    Clim,
}

/// The trailing latitude and longitude dimensions. The leading time or
/// lead dimension is never among them.
fn horizontal_dims(ndim: usize) -> Vec<usize> {
    (ndim.saturating_sub(2).max(1)..ndim).collect()
}

/// Bring a total and its climatology onto one horizontal grid, chosen by
/// `target`, with linear interpolation that extrapolates past the edges.
pub fn regrid_pair(
    target: RegridTarget,
    total: GriddedSubset,
    clim: GriddedSubset,
) -> Result<(GriddedSubset, GriddedSubset), InterpolationError> {
    let dims = horizontal_dims(total.coords.len());
    let interpolator = LinearInterp::new(true);
    match target {
        RegridTarget::Off => Ok((total, clim)),
        RegridTarget::Total => {
            let clim = regrid_onto(&interpolator, &clim, &total, &dims)?;
            Ok((total, clim))
        }
        RegridTarget::Clim => {
            let total = regrid_onto(&interpolator, &total, &clim, &dims)?;
            Ok((total, clim))
        }
    }
}
