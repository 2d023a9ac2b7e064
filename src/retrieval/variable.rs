//! Static per-variable configuration.
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::{
    output_types::{OutputType, VariableCorrections},
    records::match_expression,
    template::{PathTemplate, TemplateContext, TemplateError},
};

/// Leads (in hours) are given as a list of single values and ranges, e.g.
/// `[1, {start = 6, end = 384, step = 6}]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum LeadSpec {
    Single(u32),
    Range { start: u32, end: u32, step: u32 },
}

impl LeadSpec {
    fn expand(&self) -> Vec<u32> {
        match *self {
            Self::Single(l) => vec![l],
            Self::Range { step: 0, .. } => vec![],
            Self::Range { start, end, step } => (start..=end).step_by(step as usize).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VariableSpec {
    /// Variable name in the destination files.
    pub name: String,
    pub leads: Vec<LeadSpec>,
    pub output_types: Vec<String>,
    /// One source file per lead and key; the default is a single file per lead.
    #[serde(default = "default_file_name_keys")]
    pub file_name_keys: Vec<String>,
    /// Record-match patterns. Patterns using `{level}` are repeated for each level.
    pub match_patterns: Vec<PathTemplate>,
    #[serde(default)]
    pub levels: Vec<u32>,
    /// Number of records expected in each source file; defaults to the
    /// number of expanded match patterns.
    #[serde(default)]
    pub records_per_file: Option<usize>,
    /// Variable name the converter gives the data, when it differs from `name`.
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default = "default_multiply")]
    pub multiply: f64,
    #[serde(default)]
    pub add: f64,
    #[serde(default)]
    pub shift_hours: i32,
}

fn default_file_name_keys() -> Vec<String> {
    vec![String::new()]
}

fn default_multiply() -> f64 {
    1.0
}

impl VariableSpec {
    /// All leads, ascending and without repeats.
    pub fn lead_hours(&self) -> Vec<u32> {
        self.leads
            .iter()
            .flat_map(|l| l.expand())
            .sorted()
            .dedup()
            .collect()
    }

    pub fn expanded_patterns(&self, ctx: &TemplateContext) -> Result<Vec<String>, TemplateError> {
        let mut patterns = vec![];
        for pat in &self.match_patterns {
            if pat.uses_level() {
                for &level in &self.levels {
                    patterns.push(pat.render(&ctx.clone().with_level(level))?);
                }
            } else {
                patterns.push(pat.render(ctx)?);
            }
        }
        Ok(patterns)
    }

    /// The record-match expression for one source file.
    pub fn match_expression(&self, ctx: &TemplateContext) -> Result<String, TemplateError> {
        Ok(match_expression(&self.expanded_patterns(ctx)?))
    }

    pub fn expected_records(&self) -> usize {
        self.records_per_file.unwrap_or_else(|| {
            self.match_patterns
                .iter()
                .map(|p| if p.uses_level() { self.levels.len() } else { 1 })
                .sum()
        })
    }

    pub fn corrections(&self) -> VariableCorrections<'_> {
        VariableCorrections {
            rename: self.source_name.as_deref().map(|src| (src, self.name.as_str())),
            multiply: self.multiply,
            add: self.add,
            shift_hours: self.shift_hours,
        }
    }

    /// Every problem with this variable, so they can be reported together.
    pub fn problems(&self, outputs: &IndexMap<String, OutputType>) -> Vec<String> {
        let mut problems = vec![];
        let who = format!("variable '{}'", self.name);
        if self.name.is_empty() {
            problems.push("a variable has an empty name".to_string());
        }
        if self.lead_hours().is_empty() {
            problems.push(format!("{who} has no leads"));
        }
        if self.leads.iter().any(|l| matches!(l, LeadSpec::Range { step: 0, .. })) {
            problems.push(format!("{who} has a lead range with a step of 0"));
        }
        if self.output_types.is_empty() {
            problems.push(format!("{who} has no output types"));
        }
        for o in &self.output_types {
            if !outputs.contains_key(o) {
                problems.push(format!("{who} uses undefined output type '{o}'"));
            }
        }
        if self.file_name_keys.is_empty() {
            problems.push(format!("{who} has an empty file_name_keys list"));
        }
        if self.match_patterns.is_empty() {
            problems.push(format!("{who} has no match patterns"));
        }
        if self.match_patterns.iter().any(|p| p.uses_level()) && self.levels.is_empty() {
            problems.push(format!("{who} uses {{level}} in a match pattern but lists no levels"));
        }
        if self.expected_records() == 0 {
            problems.push(format!("{who} expects 0 records per file"));
        }
        if let Err(e) = self.match_expression(&TemplateContext::sentinel()) {
            problems.push(format!("{who} match patterns cannot be rendered: {e}"));
        }
        if !self.multiply.is_finite() || !self.add.is_finite() {
            problems.push(format!("{who} has a non-finite multiply or add constant"));
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_toml() -> &'static str {
        r#"
        name = "u"
        leads = [1, {start = 6, end = 24, step = 6}, 12]
        output_types = ["analysis", "global_daily_1p0"]
        match_patterns = [":UGRD:{level} mb:", ":UGRD:10 m above ground:"]
        levels = [200, 850]
        source_name = "10u"
        "#
    }

    #[test]
    fn test_deserialize_defaults() {
        let v: VariableSpec = toml::from_str(spec_toml()).unwrap();
        assert_eq!(v.lead_hours(), vec![1, 6, 12, 18, 24]);
        assert_eq!(v.file_name_keys, vec![""]);
        assert_eq!(v.multiply, 1.0);
        assert_eq!(v.expected_records(), 3);
        assert_eq!(v.corrections().rename, Some(("10u", "u")));
    }

    #[test]
    fn test_match_expression_expands_levels() {
        let v: VariableSpec = toml::from_str(spec_toml()).unwrap();
        let expr = v.match_expression(&TemplateContext::sentinel()).unwrap();
        assert_eq!(expr, "(:UGRD:200 mb:|:UGRD:850 mb:|:UGRD:10 m above ground:)");
    }

    #[test]
    fn test_problems_are_aggregated() {
        let mut v: VariableSpec = toml::from_str(spec_toml()).unwrap();
        v.levels.clear();
        v.output_types.push("nowhere".to_string());
        let mut outputs = IndexMap::new();
        outputs.insert("analysis".to_string(), OutputType::default());
        outputs.insert("global_daily_1p0".to_string(), OutputType::default());

        let problems = v.problems(&outputs);
        assert_eq!(problems.len(), 2, "{problems:?}");
        assert!(problems[0].contains("nowhere"));
        assert!(problems[1].contains("{level}"));
    }
}
