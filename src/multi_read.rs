//! Read the same variable from many files and stack the results.
//!
//! Each file is read with [`read_by_dim_range`], so the same range queries
//! apply to every file. Files are either stacked along a new leading "file"
//! dimension or concatenated along one of their existing dimensions (usually
//! time). The non-stacked dimensions must agree across files unless the
//! caller explicitly relaxes the checks.
use std::path::{Path, PathBuf};

use error_stack::ResultExt;
use itertools::Itertools;
use log::{debug, warn};
use ndarray::{Array1, ArrayD, Slice};

use crate::{
    error::ReadError,
    range_reader::{read_by_dim_range, GriddedSubset, RangeQuery, TimeDecoding},
};

/// Name given to the leading dimension created by [`StackAxis::New`].
pub const FILE_DIM_NAME: &str = "file";

/// Where to put the data from successive files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StackAxis {
    /// Add a new leading dimension indexed by file position.
    #[default]
    New,
    /// Concatenate along an existing dimension; negative values count from the end.
    Existing(isize),
}

#[derive(Debug, Clone, Default)]
pub struct MultiReadOptions {
    pub stack: StackAxis,
    pub time: TimeDecoding,
    /// Do not require the dimension names to match between files.
    pub ignore_dim_names: bool,
    /// Dimension indices whose coordinate values are not compared between files.
    pub ignored_dim_values: Vec<usize>,
    /// Fill missing files with NaN instead of failing.
    pub allow_missing_files: bool,
    /// Pad shorter non-stacked dimensions with NaN instead of failing.
    pub allow_varying_dim_length: bool,
}

impl MultiReadOptions {
    pub fn stacked_along(mut self, stack: StackAxis) -> Self {
        self.stack = stack;
        self
    }

    pub fn with_time(mut self, time: TimeDecoding) -> Self {
        self.time = time;
        self
    }

    pub fn allow_missing_files(mut self) -> Self {
        self.allow_missing_files = true;
        self
    }

    pub fn allow_varying_dim_length(mut self) -> Self {
        self.allow_varying_dim_length = true;
        self
    }

    pub fn ignore_dim_names(mut self) -> Self {
        self.ignore_dim_names = true;
        self
    }

    pub fn ignore_dim_values(mut self, dims: &[usize]) -> Self {
        self.ignored_dim_values.extend_from_slice(dims);
        self
    }
}

/// Read `var_name` from each of `paths` and stack the results.
///
/// Missing files are an error unless `opts.allow_missing_files` is set, in
/// which case they contribute NaN: a full slab for [`StackAxis::New`], or as
/// many entries as the first readable file has along the stacked dimension
/// for [`StackAxis::Existing`] (with NaN coordinates). If every file is
/// missing, this is always an error.
pub fn read<P: AsRef<Path>>(
    paths: &[P],
    var_name: &str,
    queries: &[RangeQuery],
    opts: &MultiReadOptions,
) -> error_stack::Result<GriddedSubset, ReadError> {
    if paths.is_empty() {
        return Err(ReadError::NoFiles.into());
    }

    let mut subsets: Vec<Option<(PathBuf, GriddedSubset)>> = Vec::with_capacity(paths.len());
    for path in paths.iter().map(|p| p.as_ref()) {
        if !path.exists() {
            if !opts.allow_missing_files {
                return Err(ReadError::FileNotFound(path.to_path_buf()))
                    .attach_printable("pass allow_missing_files to fill missing files with NaN");
            }
            warn!("{} does not exist, its part of {var_name} will be NaN", path.display());
            subsets.push(None);
            continue;
        }
        debug!("reading {var_name} from {}", path.display());
        let sub = read_by_dim_range(path, var_name, queries, opts.time)?;
        subsets.push(Some((path.to_path_buf(), sub)));
    }

    let (ref_path, reference) = subsets
        .iter()
        .flatten()
        .next()
        .ok_or(ReadError::AllFilesMissing(paths.len()))?;
    let ndim = reference.dim_names.len();

    let stack_dim = match opts.stack {
        StackAxis::New => None,
        StackAxis::Existing(axis) => Some(resolve_axis(axis, ndim)?),
    };

    for (path, sub) in subsets.iter().flatten().skip(1) {
        check_consistency(ref_path, reference, path, sub, stack_dim, opts)?;
    }

    // Output length and coordinate for each non-stacked dimension come from
    // the longest instance of that dimension.
    let mut common_len = reference.shape().to_vec();
    let mut common_coords = reference.coords.clone();
    for (_, sub) in subsets.iter().flatten() {
        for idim in (0..ndim).filter(|&d| Some(d) != stack_dim) {
            if sub.shape()[idim] > common_len[idim] {
                common_len[idim] = sub.shape()[idim];
                common_coords[idim] = sub.coords[idim].clone();
            }
        }
    }

    let stacked = match stack_dim {
        None => stack_new(&subsets, reference, common_len, common_coords),
        Some(axis) => stack_existing(&subsets, reference, axis, common_len, common_coords),
    };
    Ok(stacked)
}

fn resolve_axis(axis: isize, ndim: usize) -> Result<usize, ReadError> {
    let n = ndim as isize;
    if axis >= n || axis < -n {
        return Err(ReadError::BadStackAxis { axis, ndim });
    }
    Ok(if axis < 0 { (axis + n) as usize } else { axis as usize })
}

fn check_consistency(
    ref_path: &Path,
    reference: &GriddedSubset,
    path: &Path,
    sub: &GriddedSubset,
    stack_dim: Option<usize>,
    opts: &MultiReadOptions,
) -> Result<(), ReadError> {
    if sub.dim_names.len() != reference.dim_names.len()
        || (!opts.ignore_dim_names && sub.dim_names != reference.dim_names)
    {
        return Err(ReadError::DimensionNames {
            first_file: ref_path.to_path_buf(),
            first: reference.dim_names.clone(),
            second_file: path.to_path_buf(),
            second: sub.dim_names.clone(),
        });
    }

    for idim in 0..reference.dim_names.len() {
        if Some(idim) == stack_dim {
            continue;
        }

        if sub.shape()[idim] != reference.shape()[idim] {
            if opts.allow_varying_dim_length {
                continue;
            }
            return Err(ReadError::Shape {
                var: reference.var_name.clone(),
                first_file: ref_path.to_path_buf(),
                first: reference.shape().to_vec(),
                second_file: path.to_path_buf(),
                second: sub.shape().to_vec(),
            });
        }

        if !opts.ignored_dim_values.contains(&idim)
            && !coords_match(&reference.coords[idim], &sub.coords[idim])
        {
            return Err(ReadError::DimensionValues {
                dim: reference.dim_names[idim].clone(),
                first_file: ref_path.to_path_buf(),
                first: format_coord(&reference.coords[idim]),
                second_file: path.to_path_buf(),
                second: format_coord(&sub.coords[idim]),
            });
        }
    }
    Ok(())
}

pub(crate) fn coords_match(a: &Array1<f64>, b: &Array1<f64>) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| (x - y).abs() <= 1e-9 * x.abs().max(1.0))
}

pub(crate) fn format_coord(c: &Array1<f64>) -> String {
    if c.len() <= 6 {
        format!("[{}]", c.iter().join(", "))
    } else {
        format!(
            "[{}, ..., {}] ({} values)",
            c.iter().take(3).join(", "),
            c.iter().skip(c.len() - 3).join(", "),
            c.len()
        )
    }
}

/// Write `data` into the leading corner of `out`, with an offset along one axis.
pub(crate) fn assign_block(out: &mut ArrayD<f64>, data: &ArrayD<f64>, offset_axis: usize, offset: usize) {
    let mut view = out.slice_each_axis_mut(|ax| {
        let i = ax.axis.index();
        let len = data.shape()[i];
        if i == offset_axis {
            Slice::from(offset..offset + len)
        } else {
            Slice::from(0..len)
        }
    });
    view.assign(data);
}

fn stack_new(
    subsets: &[Option<(PathBuf, GriddedSubset)>],
    reference: &GriddedSubset,
    common_len: Vec<usize>,
    common_coords: Vec<Array1<f64>>,
) -> GriddedSubset {
    let nfiles = subsets.len();
    let shape = std::iter::once(nfiles).chain(common_len).collect_vec();
    let mut data = ArrayD::from_elem(shape, f64::NAN);

    for (ifile, entry) in subsets.iter().enumerate() {
        if let Some((_, sub)) = entry {
            let block = sub.data.clone().insert_axis(ndarray::Axis(0));
            assign_block(&mut data, &block, 0, ifile);
        }
    }

    let coords = std::iter::once(Array1::from_iter((0..nfiles).map(|i| i as f64)))
        .chain(common_coords)
        .collect();
    let dim_names = std::iter::once(FILE_DIM_NAME.to_string())
        .chain(reference.dim_names.iter().cloned())
        .collect();

    GriddedSubset {
        var_name: reference.var_name.clone(),
        dim_names,
        data,
        coords,
        time_dim: reference.time_dim.map(|t| t + 1),
    }
}

fn stack_existing(
    subsets: &[Option<(PathBuf, GriddedSubset)>],
    reference: &GriddedSubset,
    axis: usize,
    mut common_len: Vec<usize>,
    mut common_coords: Vec<Array1<f64>>,
) -> GriddedSubset {
    let fill_len = reference.shape()[axis];
    let lengths = subsets
        .iter()
        .map(|entry| entry.as_ref().map(|(_, s)| s.shape()[axis]).unwrap_or(fill_len))
        .collect_vec();
    common_len[axis] = lengths.iter().sum();
    let mut data = ArrayD::from_elem(common_len, f64::NAN);

    let mut stacked_coord = Vec::with_capacity(data.shape()[axis]);
    let mut offset = 0;
    for (entry, len) in subsets.iter().zip(lengths) {
        match entry {
            Some((_, sub)) => {
                assign_block(&mut data, &sub.data, axis, offset);
                stacked_coord.extend(sub.coords[axis].iter().copied());
            }
            None => stacked_coord.extend(std::iter::repeat(f64::NAN).take(len)),
        }
        offset += len;
    }
    common_coords[axis] = Array1::from_vec(stacked_coord);

    GriddedSubset {
        var_name: reference.var_name.clone(),
        dim_names: reference.dim_names.clone(),
        data,
        coords: common_coords,
        time_dim: reference.time_dim,
    }
}
