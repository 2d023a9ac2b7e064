//! Locate and read processed model files.
//!
//! Processed forecasts live in one file per initialization, member, product
//! and variable. Model climatologies live in one file per calendar day of
//! initialization. Both are described by a [`ModelFileDescriptor`], which
//! differs only in its [`ModelFileKind`].
use std::path::{Path, PathBuf};

use error_stack::ResultExt;
use itertools::Itertools;
use log::warn;
use ndarray::{Array1, ArrayD, Axis};

use crate::{
    climatology::{clim_reference_day_number, ClimType},
    error::{ReadError, TimeError},
    interpolation::{regrid_pair, RegridTarget},
    multi_read::{coords_match, format_coord},
    nc_utils::{open_dataset, var_dim_length},
    range_reader::{read_by_dim_range, GriddedSubset, RangeQuery, TimeDecoding},
    timetools::day_number_to_datetime,
};

/// Product name of single-time analysis files, which have no time axis.
pub const ANALYSIS_PRODUCT: &str = "analysis";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFileKind {
    /// A forecast (or analysis) for one initialization.
    Total,
    /// A climatology of forecasts initialized on one calendar day.
    Climatology {
        clim_type: ClimType,
        first_year: i32,
        last_year: i32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelFileDescriptor {
    pub model: String,
    /// The output product, e.g. "global_daily_1p0" or "analysis".
    pub product: String,
    pub variable: String,
    /// Initialization time as a day number.
    pub init: f64,
    pub member: u32,
    pub kind: ModelFileKind,
}

impl ModelFileDescriptor {
    pub fn total(model: &str, product: &str, variable: &str, init: f64, member: u32) -> Self {
        Self {
            model: model.to_string(),
            product: product.to_string(),
            variable: variable.to_string(),
            init,
            member,
            kind: ModelFileKind::Total,
        }
    }

    /// The climatology file matching this file's initialization day.
    pub fn climatology_for(&self, clim_type: ClimType, years: (i32, i32)) -> Result<Self, TimeError> {
        Ok(Self {
            init: clim_reference_day_number(self.init)?,
            kind: ModelFileKind::Climatology {
                clim_type,
                first_year: years.0,
                last_year: years.1,
            },
            ..self.clone()
        })
    }

    pub fn is_analysis(&self) -> bool {
        self.product == ANALYSIS_PRODUCT
    }

    /// Path to the file under `root`.
    ///
    /// Totals are `<model>/%Y/%m/%dz%H/E<member>/<product>_<var>.nc`;
    /// climatologies are
    /// `<model>/clim/E<member>/<type>/<var>/<product>_<var>_%m%d_<y0>_<y1>_<type>.nc`.
    pub fn path(&self, root: &Path) -> Result<PathBuf, TimeError> {
        let init = day_number_to_datetime(self.init)?;
        let member_dir = format!("E{:03}", self.member);
        let path = match self.kind {
            ModelFileKind::Total => root
                .join(&self.model)
                .join(init.format("%Y/%m/%dz%H").to_string())
                .join(member_dir)
                .join(format!("{}_{}.nc", self.product, self.variable)),
            ModelFileKind::Climatology {
                clim_type,
                first_year,
                last_year,
            } => root
                .join(&self.model)
                .join("clim")
                .join(member_dir)
                .join(clim_type.to_string())
                .join(&self.variable)
                .join(format!(
                    "{}_{}_{}_{first_year}_{last_year}_{clim_type}.nc",
                    self.product,
                    self.variable,
                    init.format("%m%d")
                )),
        };
        Ok(path)
    }

    pub fn exists(&self, root: &Path) -> bool {
        self.path(root).map(|p| p.exists()).unwrap_or(false)
    }

    pub fn has_variable(&self, root: &Path) -> bool {
        let Ok(path) = self.path(root) else {
            return false;
        };
        open_dataset(&path)
            .map(|ds| ds.variable(&self.variable).is_some())
            .unwrap_or(false)
    }

    /// Length of the leading (time) dimension of the variable, 0 if absent.
    pub fn time_length(&self, root: &Path) -> usize {
        self.path(root)
            .map(|p| var_dim_length(&p, &self.variable, 0))
            .unwrap_or(0)
    }

    /// Read the variable. For forecast totals, the first query and the first
    /// returned coordinate are lead times in days rather than valid times.
    pub fn read(&self, root: &Path, queries: &[RangeQuery]) -> error_stack::Result<GriddedSubset, ReadError> {
        let path = self
            .path(root)
            .change_context_lazy(|| ReadError::Time(format!("init {}", self.init)))?;

        let lead_based = self.kind == ModelFileKind::Total && !self.is_analysis();
        if !lead_based {
            return read_by_dim_range(&path, &self.variable, queries, TimeDecoding::Off);
        }

        let mut valid_queries = queries.to_vec();
        if let Some(q) = valid_queries.first_mut() {
            q.min = q.min.map(|lead| lead + self.init);
            q.max = q.max.map(|lead| lead + self.init);
        }
        let mut subset = read_by_dim_range(&path, &self.variable, &valid_queries, TimeDecoding::Dimension(0))?;
        if let Some(c) = subset.coords.first_mut() {
            c.mapv_inplace(|valid| valid - self.init);
        }
        subset.time_dim = None;
        Ok(subset)
    }
}

/// Reads forecast anomalies (total minus the model's own climatology) for
/// many initializations of one or more members.
#[derive(Debug, Clone)]
pub struct ModelAnomalyReader<'a> {
    pub root: &'a Path,
    pub model: &'a str,
    pub product: &'a str,
    pub variable: &'a str,
    pub members: &'a [u32],
    pub clim_type: ClimType,
    pub clim_years: (i32, i32),
    pub regrid: RegridTarget,
}

impl ModelAnomalyReader<'_> {
    /// Read anomalies for each member and initialization, stacked along new
    /// leading "member" and "init" dimensions. Missing forecast files give
    /// NaN; a missing climatology file is an error. The climatology is
    /// truncated to the number of leads in each forecast.
    pub fn read(&self, inits: &[f64], queries: &[RangeQuery]) -> error_stack::Result<GriddedSubset, ReadError> {
        let mut anomalies: Vec<Option<(PathBuf, GriddedSubset)>> =
            Vec::with_capacity(self.members.len() * inits.len());
        for &member in self.members {
            for &init in inits {
                let total = ModelFileDescriptor::total(self.model, self.product, self.variable, init, member);
                if !total.exists(self.root) {
                    warn!("no {} forecast for init {init}, member {member}", self.variable);
                    anomalies.push(None);
                    continue;
                }
                let anom = self.read_one(&total, queries)?;
                anomalies.push(Some((total.path(self.root).unwrap_or_default(), anom)));
            }
        }

        let (ref_path, reference) = anomalies
            .iter()
            .flatten()
            .next()
            .ok_or(ReadError::AllFilesMissing(anomalies.len()))?;

        let mut shape = reference.shape().to_vec();
        let mut coords = reference.coords.clone();
        for (path, anom) in anomalies.iter().flatten() {
            if anom.shape().len() != shape.len() || anom.shape()[1..] != shape[1..] {
                return Err(ReadError::Shape {
                    var: self.variable.to_string(),
                    first_file: ref_path.clone(),
                    first: reference.shape().to_vec(),
                    second_file: path.clone(),
                    second: anom.shape().to_vec(),
                }
                .into());
            }
            for idim in 1..coords.len() {
                if !coords_match(&coords[idim], &anom.coords[idim]) {
                    return Err(ReadError::DimensionValues {
                        dim: reference.dim_names[idim].clone(),
                        first_file: ref_path.clone(),
                        first: format_coord(&coords[idim]),
                        second_file: path.clone(),
                        second: format_coord(&anom.coords[idim]),
                    }
                    .into());
                }
            }
            if anom.shape()[0] > shape[0] {
                shape[0] = anom.shape()[0];
                coords[0] = anom.coords[0].clone();
            }
        }

        let full_shape = [self.members.len(), inits.len()].into_iter().chain(shape).collect_vec();
        let mut data = ArrayD::from_elem(full_shape, f64::NAN);
        for (k, entry) in anomalies.iter().enumerate() {
            if let Some((_, anom)) = entry {
                let (imem, iinit) = (k / inits.len(), k % inits.len());
                let mut slot = data.index_axis_mut(Axis(0), imem).index_axis_move(Axis(0), iinit);
                slot.slice_axis_inplace(Axis(0), (0..anom.shape()[0]).into());
                slot.assign(&anom.data);
            }
        }

        let member_coord = Array1::from_iter(self.members.iter().map(|&m| m as f64));
        Ok(GriddedSubset {
            var_name: reference.var_name.clone(),
            dim_names: ["member", "init"]
                .into_iter()
                .map(String::from)
                .chain(reference.dim_names.iter().cloned())
                .collect(),
            data,
            coords: [member_coord, Array1::from_vec(inits.to_vec())]
                .into_iter()
                .chain(coords)
                .collect(),
            time_dim: Some(1),
        })
    }

    fn read_one(
        &self,
        total: &ModelFileDescriptor,
        queries: &[RangeQuery],
    ) -> error_stack::Result<GriddedSubset, ReadError> {
        let clim_file = total
            .climatology_for(self.clim_type, self.clim_years)
            .change_context_lazy(|| ReadError::Time(format!("init {}", total.init)))?;
        let anomaly = total.read(self.root, queries)?;
        let clim = clim_file.read(self.root, queries)?;

        let total_path = total.path(self.root).unwrap_or_default();
        let clim_path = clim_file.path(self.root).unwrap_or_default();
        let nlead = anomaly.shape()[0];
        let shape_error = |anomaly: &GriddedSubset, clim: &GriddedSubset| ReadError::Shape {
            var: total.variable.clone(),
            first_file: total_path.clone(),
            first: anomaly.shape().to_vec(),
            second_file: clim_path.clone(),
            second: clim.shape().to_vec(),
        };
        if clim.shape().len() != anomaly.shape().len() || clim.shape()[0] < nlead {
            return Err(shape_error(&anomaly, &clim).into());
        }

        let (from, onto) = match self.regrid {
            RegridTarget::Clim => (&total_path, &clim_path),
            _ => (&clim_path, &total_path),
        };
        let (mut anomaly, clim) = regrid_pair(self.regrid, anomaly, clim).change_context_lazy(|| ReadError::Regrid {
            from: from.clone(),
            onto: onto.clone(),
        })?;

        if clim.shape()[1..] != anomaly.shape()[1..] {
            return Err(shape_error(&anomaly, &clim).into());
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

        anomaly.data -= &clim.data.slice_axis(Axis(0), (0..nlead).into());
        Ok(anomaly)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{array, s, Array2};
    use rstest::rstest;

    use super::*;
    use crate::{
        test_utils::{write_test_file, TestAxis},
        timetools::ymd_to_day_number,
    };

    fn dn(y: i32, m: u32, d: u32) -> f64 {
        ymd_to_day_number(y, m, d).unwrap()
    }

    #[test]
    fn test_total_path() {
        let desc = ModelFileDescriptor::total("CWA_GEPSv3", "global_daily_1p0", "u", dn(2024, 12, 7) + 0.5, 3);
        let path = desc.path(Path::new("/data")).unwrap();
        assert_eq!(
            path,
            PathBuf::from("/data/CWA_GEPSv3/2024/12/07z12/E003/global_daily_1p0_u.nc")
        );
    }

    #[rstest]
    #[case(dn(2020, 2, 29), "0229")]
    #[case(dn(2021, 3, 1) + 0.5, "0301")]
    fn test_climatology_path(#[case] init: f64, #[case] mmdd: &str) {
        let desc = ModelFileDescriptor::total("M", "global_daily_1p0", "olr", init, 0);
        let clim = desc.climatology_for(ClimType::FiveDayMean, (2001, 2020)).unwrap();
        let expected = format!("/r/M/clim/E000/5dma/olr/global_daily_1p0_olr_{mmdd}_2001_2020_5dma.nc");
        assert_eq!(clim.path(Path::new("/r")).unwrap(), PathBuf::from(expected));
        assert_abs_diff_eq!(clim.init.fract(), 0.0);
    }

    const LATS: [f64; 2] = [0.0, 10.0];

    /// Write a forecast for `member` with valid times `init + leads` and
    /// value `f(lead index, lat)`.
    fn write_member_total(
        root: &Path,
        init: f64,
        member: u32,
        leads: &[f64],
        lats: &[f64],
        f: impl Fn(usize, f64) -> f64,
    ) {
        let desc = ModelFileDescriptor::total("M", "global_daily_1p0", "olr", init, member);
        let path = desc.path(root).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let valid: Vec<f64> = leads.iter().map(|l| l + init).collect();
        write_test_file(
            &path,
            "olr",
            &[TestAxis::time(&valid), TestAxis::new("lat", lats)],
            Array2::from_shape_fn((leads.len(), lats.len()), |(i, j)| f(i, lats[j])).into_dyn(),
        );
    }

    fn write_total(root: &Path, init: f64, leads: &[f64], fill: f64) {
        write_member_total(root, init, 0, leads, &LATS, |_, _| fill);
    }

    fn write_member_clim(
        root: &Path,
        init: f64,
        member: u32,
        leads: &[f64],
        lats: &[f64],
        f: impl Fn(usize, f64) -> f64,
    ) {
        let desc = ModelFileDescriptor::total("M", "global_daily_1p0", "olr", init, member)
            .climatology_for(ClimType::FiveDayMean, (2001, 2020))
            .unwrap();
        let path = desc.path(root).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        write_test_file(
            &path,
            "olr",
            &[TestAxis::new("time", leads), TestAxis::new("lat", lats)],
            Array2::from_shape_fn((leads.len(), lats.len()), |(i, j)| f(i, lats[j])).into_dyn(),
        );
    }

    fn write_clim(root: &Path, init: f64, leads: &[f64], values: &[f64]) {
        write_member_clim(root, init, 0, leads, &LATS, |i, _| values[i]);
    }

    fn anomaly_reader<'a>(root: &'a Path, members: &'a [u32], regrid: RegridTarget) -> ModelAnomalyReader<'a> {
        ModelAnomalyReader {
            root,
            model: "M",
            product: "global_daily_1p0",
            variable: "olr",
            members,
            clim_type: ClimType::FiveDayMean,
            clim_years: (2001, 2020),
            regrid,
        }
    }

    #[test]
    fn test_read_total_in_leads() {
        let dir = tempfile::tempdir().unwrap();
        let init = dn(2020, 2, 29);
        write_total(dir.path(), init, &[0.0, 1.0, 2.0, 3.0], 5.0);
        let desc = ModelFileDescriptor::total("M", "global_daily_1p0", "olr", init, 0);
        assert!(desc.exists(dir.path()));
        assert!(desc.has_variable(dir.path()));
        assert_eq!(desc.time_length(dir.path()), 4);

        let sub = desc
            .read(dir.path(), &[RangeQuery::between(1.0, 2.0), RangeQuery::all()])
            .unwrap();
        assert_abs_diff_eq!(sub.coords[0], array![1.0, 2.0]);
        assert_eq!(sub.time_dim, None);
    }

    #[test]
    fn test_read_anomaly() {
        let dir = tempfile::tempdir().unwrap();
        let leap = dn(2020, 2, 29);
        let mar = dn(2021, 3, 1);
        let missing = dn(2021, 3, 2);
        write_total(dir.path(), leap, &[0.0, 1.0], 10.0);
        write_total(dir.path(), mar, &[0.0, 1.0, 2.0], 20.0);
        write_clim(dir.path(), leap, &[0.0, 1.0, 2.0], &[1.0, 2.0, 3.0]);
        write_clim(dir.path(), mar, &[0.0, 1.0, 2.0], &[4.0, 5.0, 6.0]);

        let reader = anomaly_reader(dir.path(), &[0], RegridTarget::Off);
        let anom = reader
            .read(&[leap, mar, missing], &[RangeQuery::all(), RangeQuery::all()])
            .unwrap();
        assert_eq!(anom.shape(), &[1, 3, 3, 2]);
        assert_eq!(anom.dim_names[..2], ["member", "init"]);
        assert_eq!(anom.time_dim, Some(1));
        assert_abs_diff_eq!(anom.coords[2], array![0.0, 1.0, 2.0]);
        assert_abs_diff_eq!(anom.data[[0, 0, 0, 0]], 9.0);
        assert_abs_diff_eq!(anom.data[[0, 0, 1, 1]], 8.0);
        assert!(anom.data[[0, 0, 2, 0]].is_nan());
        assert_abs_diff_eq!(anom.data[[0, 1, 2, 1]], 14.0);
        assert!(anom.data.slice(s![0, 2, .., ..]).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_read_anomaly_for_several_members() {
        let dir = tempfile::tempdir().unwrap();
        let first = dn(2021, 3, 1);
        let second = dn(2021, 3, 8);
        for init in [first, second] {
            write_member_total(dir.path(), init, 0, &[0.0, 1.0], &LATS, |_, _| 10.0);
            write_clim(dir.path(), init, &[0.0, 1.0], &[1.0, 2.0]);
        }
        write_member_total(dir.path(), first, 2, &[0.0, 1.0], &LATS, |_, _| 30.0);
        write_member_clim(dir.path(), first, 2, &[0.0, 1.0], &LATS, |i, _| [1.0, 2.0][i]);

        let reader = anomaly_reader(dir.path(), &[0, 2], RegridTarget::Off);
        let anom = reader.read(&[first, second], &[RangeQuery::all(); 2]).unwrap();
        assert_eq!(anom.shape(), &[2, 2, 2, 2]);
        assert_eq!(anom.coords[0], array![0.0, 2.0]);
        assert_eq!(anom.coords[1], array![first, second]);
        assert_abs_diff_eq!(anom.data[[0, 1, 1, 0]], 8.0);
        assert_abs_diff_eq!(anom.data[[1, 0, 0, 1]], 29.0);
        assert_abs_diff_eq!(anom.data[[1, 0, 1, 0]], 28.0);
        assert!(anom.data.slice(s![1, 1, .., ..]).iter().all(|v| v.is_nan()));
    }

    /// Forecast 100 + lat on latitudes 0, 4, 10 against a climatology of
    /// 2 * lat on latitudes 0, 5, 10. Both add the lead index.
    fn write_mismatched_grids(root: &Path, init: f64) {
        let leads = [0.0, 1.0];
        write_member_total(root, init, 0, &leads, &[0.0, 4.0, 10.0], |i, lat| 100.0 + lat + i as f64);
        write_member_clim(root, init, 0, &leads, &[0.0, 5.0, 10.0], |i, lat| 2.0 * lat + i as f64);
    }

    #[rstest]
    #[case(RegridTarget::Total, array![0.0, 4.0, 10.0], array![100.0, 96.0, 90.0])]
    #[case(RegridTarget::Clim, array![0.0, 5.0, 10.0], array![100.0, 95.0, 90.0])]
    fn test_anomaly_on_mismatched_grids(
        #[case] regrid: RegridTarget,
        #[case] expected_lats: Array1<f64>,
        #[case] expected: Array1<f64>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let init = dn(2023, 1, 15);
        write_mismatched_grids(dir.path(), init);

        let anom = anomaly_reader(dir.path(), &[0], regrid)
            .read(&[init], &[RangeQuery::all(); 2])
            .unwrap();
        assert_eq!(anom.shape(), &[1, 1, 2, 3]);
        assert_eq!(anom.coords[3], expected_lats);
        for ilead in 0..2 {
            let row = anom.data.slice(s![0, 0, ilead, ..]);
            for (v, e) in row.iter().zip(expected.iter()) {
                assert_abs_diff_eq!(*v, *e, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_mismatched_grids_without_regridding() {
        let dir = tempfile::tempdir().unwrap();
        let init = dn(2023, 1, 15);
        write_mismatched_grids(dir.path(), init);

        let err = anomaly_reader(dir.path(), &[0], RegridTarget::Off)
            .read(&[init], &[RangeQuery::all(); 2])
            .unwrap_err();
        match err.current_context() {
            ReadError::DimensionValues { dim, .. } => assert_eq!(dim, "lat"),
            other => panic!("Expected a dimension values error, got {other:?}"),
        }
    }

    #[test]
    fn test_anomaly_without_climatology() {
        let dir = tempfile::tempdir().unwrap();
        let init = dn(2022, 6, 1);
        write_total(dir.path(), init, &[0.0], 1.0);
        let reader = ModelAnomalyReader {
            clim_type: ClimType::Daily,
            ..anomaly_reader(dir.path(), &[0], RegridTarget::Off)
        };
        let err = reader.read(&[init], &[RangeQuery::all(); 2]).unwrap_err();
        assert!(matches!(err.current_context(), ReadError::FileNotFound(_)));
    }
}
