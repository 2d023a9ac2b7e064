use std::path::Path;

use ndarray::ArrayD;

use crate::nc_utils::DAY_NUMBER_UNITS;

/// One coordinate axis of a test file.
#[derive(Debug, Clone)]
pub(crate) struct TestAxis {
    pub(crate) name: String,
    pub(crate) values: Vec<f64>,
    pub(crate) units: Option<String>,
}

impl TestAxis {
    pub(crate) fn new(name: &str, values: &[f64]) -> Self {
        Self {
            name: name.to_string(),
            values: values.to_vec(),
            units: None,
        }
    }

    /// A "time" axis stored directly as day numbers.
    pub(crate) fn time(values: &[f64]) -> Self {
        Self::new("time", values).with_units(DAY_NUMBER_UNITS)
    }

    pub(crate) fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }
}

/// Write a single-variable netCDF file without going through the crate's
/// own writer, so that reader tests do not depend on it.
pub(crate) fn write_test_file(path: &Path, var_name: &str, axes: &[TestAxis], data: ArrayD<f64>) {
    assert_eq!(axes.len(), data.ndim(), "one axis per data dimension is required");
    let mut nc = netcdf::create(path).expect("creating the test file should not fail");
    for axis in axes {
        nc.add_dimension(&axis.name, axis.values.len())
            .expect("adding a test dimension should not fail");
        let mut var = nc
            .add_variable::<f64>(&axis.name, &[axis.name.as_str()])
            .expect("adding a test coordinate should not fail");
        var.put_values(axis.values.as_slice(), netcdf::Extents::All)
            .expect("writing a test coordinate should not fail");
        if let Some(units) = &axis.units {
            var.put_attribute("units", units.as_str())
                .expect("writing test units should not fail");
        }
    }

    let dims: Vec<&str> = axes.iter().map(|a| a.name.as_str()).collect();
    let mut var = nc
        .add_variable::<f64>(var_name, &dims)
        .expect("adding the test variable should not fail");
    var.put(data.view(), netcdf::Extents::All)
        .expect("writing the test variable should not fail");
}

/// A data array whose value at each index is `sum(index[i] * 10^(ndim - 1 - i))`,
/// so the original position of every element is easy to recover after slicing.
pub(crate) fn index_coded_array(shape: &[usize]) -> ArrayD<f64> {
    let ndim = shape.len();
    ArrayD::from_shape_fn(shape.to_vec(), |idx| {
        (0..ndim)
            .map(|i| idx[i] as f64 * 10f64.powi((ndim - 1 - i) as i32))
            .sum()
    })
}
