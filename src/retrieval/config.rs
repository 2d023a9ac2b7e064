//! Pipeline configuration.
//!
//! A configuration is a TOML file describing one model: where its raw output
//! lives, where processed files go, which members exist at which
//! initialization hours, and which variables to produce in which output
//! types. A minimal example:
//!
//! ```toml
//! model_name = "CWA_GEPSv3"
//! src_root = "/data/raw"
//! dest_root = "/data/processed"
//! work_dir = "/data/work"
//! grid_file = "/data/grids/gaussian.txt"
//! source_path = "op/{year2:02}{month:02}{day:02}{hour:02}/E{member:03}/{year}{month:02}{day:02}{hour:02}{lead:04}/{key}"
//! init_hours = [0, 12]
//!
//! [[members]]
//! first = 0
//! last = 32
//! max_lead = 1080
//!
//! [output_types.global_daily_1p0]
//! remap = "r360x181"
//! daily_mean = true
//!
//! [[variables]]
//! name = "olr"
//! leads = [1, {start = 6, end = 1080, step = 6}]
//! output_types = ["global_daily_1p0"]
//! match_patterns = [":ULWRF:top of atmosphere:"]
//! ```
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use figment::{
    providers::{Format, Toml},
    Figment,
};
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::{
    commands::ToolPaths,
    output_types::OutputType,
    template::{PathTemplate, SourcePath},
    variable::VariableSpec,
};
use crate::{error::ConfigError, timetools::datetime_to_day_number};

/// A contiguous range of members sharing a maximum lead.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MemberSpec {
    pub first: u32,
    pub last: u32,
    /// Longest lead in hours these members are run out to.
    pub max_lead: u32,
    /// Initialization hours this entry applies to; all hours if empty.
    #[serde(default)]
    pub init_hours: Vec<u32>,
}

impl MemberSpec {
    fn applies_to(&self, hour: u32) -> bool {
        self.init_hours.is_empty() || self.init_hours.contains(&hour)
    }
}

/// Work to leave out of a run.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SkipLists {
    #[serde(default)]
    pub init_times: Vec<NaiveDateTime>,
    #[serde(default)]
    pub months: Vec<u32>,
    #[serde(default)]
    pub members: Vec<u32>,
    #[serde(default)]
    pub variables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub model_name: String,
    pub src_root: PathBuf,
    pub dest_root: PathBuf,
    pub work_dir: PathBuf,
    pub grid_file: PathBuf,
    /// Source file path relative to `<src_root>/<model_name>`.
    pub source_path: PathTemplate,
    pub init_hours: Vec<u32>,
    #[serde(default)]
    pub reverse_init_order: bool,
    #[serde(default)]
    pub tools: ToolPaths,
    #[serde(default)]
    pub skip: SkipLists,
    pub members: Vec<MemberSpec>,
    pub output_types: IndexMap<String, OutputType>,
    pub variables: Vec<VariableSpec>,
}

impl PipelineConfig {
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

    /// Check everything that can be checked without touching the filesystem
    /// and report all problems at once.
    pub fn validate(&self) -> error_stack::Result<(), ConfigError> {
        let mut problems = vec![];
        if self.model_name.is_empty() {
            problems.push("model_name is empty".to_string());
        }
        if self.init_hours.is_empty() {
            problems.push("init_hours is empty".to_string());
        }
        for h in self.init_hours.iter().filter(|&&h| h > 23) {
            problems.push(format!("init hour {h} is not between 0 and 23"));
        }
        if self.members.is_empty() {
            problems.push("no members are configured".to_string());
        }
        for m in &self.members {
            if m.first > m.last {
                problems.push(format!("member range {}..={} is inverted", m.first, m.last));
            }
            for h in m.init_hours.iter().filter(|&h| !self.init_hours.contains(h)) {
                problems.push(format!(
                    "members {}..={} list init hour {h}, which is not in init_hours",
                    m.first, m.last
                ));
            }
        }
        for (name, output) in &self.output_types {
            if output.select_window && output.max_valid_days.is_none() {
                problems.push(format!("output type '{name}' sets select_window without max_valid_days"));
            }
        }
        if self.variables.is_empty() {
            problems.push("no variables are configured".to_string());
        }
        for (name, n) in self.variables.iter().counts_by(|v| v.name.as_str()) {
            if n > 1 {
                problems.push(format!("variable '{name}' is configured {n} times"));
            }
        }
        for v in &self.variables {
            problems.extend(v.problems(&self.output_types));
        }
        if let Err(e) = self.source_path.check() {
            problems.push(format!("source_path cannot be rendered: {e}"));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems).into())
        }
    }

    /// Initialization times from `start` to `end` inclusive, as day numbers,
    /// minus anything in the skip lists.
    pub fn init_times(&self, start: NaiveDate, end: NaiveDate) -> Vec<f64> {
        let mut times = start
            .iter_days()
            .take_while(|d| *d <= end)
            .cartesian_product(self.init_hours.iter().sorted())
            .filter_map(|(d, &h)| d.and_hms_opt(h, 0, 0))
            .filter(|dt| !self.skip.months.contains(&dt.month()))
            .filter(|dt| !self.skip.init_times.contains(dt))
            .map(datetime_to_day_number)
            .collect_vec();
        if self.reverse_init_order {
            times.reverse();
        }
        times
    }

    /// `(member, max_lead)` for every member run at this initialization.
    pub fn members_for(&self, init: NaiveDateTime) -> Vec<(u32, u32)> {
        let hour = init.hour();
        let mut members: Vec<(u32, u32)> = vec![];
        for spec in self.members.iter().filter(|m| m.applies_to(hour)) {
            for id in spec.first..=spec.last {
                if !self.skip.members.contains(&id) && !members.iter().any(|&(m, _)| m == id) {
                    members.push((id, spec.max_lead));
                }
            }
        }
        members
    }

    pub fn active_variables(&self) -> impl Iterator<Item = &VariableSpec> {
        self.variables
            .iter()
            .filter(|v| !self.skip.variables.contains(&v.name))
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn example_toml(root: &Path) -> String {
        format!(
            r#"
model_name = "M"
src_root = "{root}/src"
dest_root = "{root}/dest"
work_dir = "{root}/work"
grid_file = "{root}/grid.txt"
source_path = "{{year}}{{month:02}}{{day:02}}{{hour:02}}/E{{member:03}}/f{{lead:03}}{{key}}"
init_hours = [0, 12]

[[members]]
first = 0
last = 1
max_lead = 12
init_hours = [0]

[[members]]
first = 0
last = 0
max_lead = 6
init_hours = [12]

[output_types.analysis]
analysis = true

[output_types.global_daily_1p0]
remap = "r360x181"
daily_mean = true

[[variables]]
name = "t2m"
leads = [{{start = 0, end = 12, step = 6}}]
output_types = ["global_daily_1p0"]
match_patterns = [":TMP:2 m above ground:"]
source_name = "2t"

[[variables]]
name = "u"
leads = [0]
output_types = ["analysis"]
match_patterns = [":UGRD:{{level}} mb:"]
levels = [200, 850]
"#,
            root = root.display()
        )
    }

    #[test]
    fn test_load_example() {
        let cfg = PipelineConfig::from_toml_str(&example_toml(Path::new("/r"))).unwrap();
        assert_eq!(cfg.model_name, "M");
        assert_eq!(cfg.tools, ToolPaths::default());
        assert_eq!(cfg.output_types.keys().collect_vec(), vec!["analysis", "global_daily_1p0"]);
        assert_eq!(cfg.variables[1].expected_records(), 2);
    }

    #[test]
    fn test_members_for_hour() {
        let cfg = PipelineConfig::from_toml_str(&example_toml(Path::new("/r"))).unwrap();
        let d = NaiveDate::from_ymd_opt(2024, 12, 7).unwrap();
        assert_eq!(cfg.members_for(d.and_hms_opt(0, 0, 0).unwrap()), vec![(0, 12), (1, 12)]);
        assert_eq!(cfg.members_for(d.and_hms_opt(12, 0, 0).unwrap()), vec![(0, 6)]);
    }

    #[test]
    fn test_init_times_with_skips() {
        let mut cfg = PipelineConfig::from_toml_str(&example_toml(Path::new("/r"))).unwrap();
        let start = NaiveDate::from_ymd_opt(2024, 2, 28).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(cfg.init_times(start, end).len(), 6);

        cfg.skip.months = vec![3];
        cfg.skip.init_times = vec![start.and_hms_opt(12, 0, 0).unwrap()];
        cfg.reverse_init_order = true;
        let times = cfg.init_times(start, end);
        let feb28 = datetime_to_day_number(start.and_hms_opt(0, 0, 0).unwrap());
        assert_eq!(times, vec![feb28 + 1.5, feb28 + 1.0, feb28]);
    }

    #[test]
    fn test_invalid_config_lists_every_problem() {
        let toml = example_toml(Path::new("/r"))
            .replace("init_hours = [0, 12]", "init_hours = [0, 25]")
            .replace("levels = [200, 850]", "");
        let err = PipelineConfig::from_toml_str(&toml).unwrap_err();
        let ConfigError::Invalid(problems) = err.current_context() else {
            panic!("expected an Invalid error, got {err:?}");
        };
        // bad hour, member hour not in init_hours, no levels, and so no records
        assert_eq!(problems.len(), 4, "{problems:?}");
    }

    #[test]
    fn test_bad_template_fails_to_load() {
        let toml = example_toml(Path::new("/r")).replace("{lead:03}", "{leadtime:03}");
        let err = PipelineConfig::from_toml_str(&toml).unwrap_err();
        assert!(matches!(err.current_context(), ConfigError::Load(_)));
    }
}
