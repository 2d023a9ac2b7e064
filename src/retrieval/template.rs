//! String templates for source paths and record-match expressions.
//!
//! A template is literal text with `{field}` placeholders. A placeholder may
//! carry an integer offset and a zero-padded width, e.g. `{lead-6:03}` renders
//! lead 12 as `006`. Templates are checked once when they are built, by parsing
//! them and rendering them against a sentinel context, so that a bad template
//! in a configuration fails before any processing starts.
use std::{fmt::Display, str::FromStr, sync::OnceLock};

use chrono::{Datelike, NaiveDateTime, Timelike};
use regex::Regex;

use crate::timetools::day_number_origin;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Unknown template field '{field}' in '{template}'")]
    UnknownField { field: String, template: String },
    #[error("Unbalanced braces in template '{0}'")]
    UnbalancedBraces(String),
    #[error("Offsets are only allowed on numeric fields ('{field}' in '{template}')")]
    OffsetOnText { field: String, template: String },
    #[error("Template field '{0}' has no value in this context")]
    MissingValue(&'static str),
    #[error("Template rendered to an empty string")]
    Empty,
}

/// Values available to templates.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateContext {
    pub model: String,
    pub init: NaiveDateTime,
    pub member: u32,
    /// Forecast lead in hours.
    pub lead: u32,
    /// Source file-name key.
    pub key: String,
    /// Pressure level, only set while expanding match patterns over levels.
    pub level: Option<u32>,
}

impl TemplateContext {
    pub fn new(model: &str, init: NaiveDateTime, member: u32, lead: u32) -> Self {
        Self {
            model: model.to_string(),
            init,
            member,
            lead,
            key: String::new(),
            level: None,
        }
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = Some(level);
        self
    }

    /// Context used to test-render templates when they are built.
    pub fn sentinel() -> Self {
        Self::new("MODEL", day_number_origin(), 0, 0).with_level(1000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
enum Field {
    Year,
    Year2,
    Month,
    Day,
    Hour,
    Member,
    Lead,
    Level,
    Key,
    Model,
}

impl Field {
    fn is_numeric(&self) -> bool {
        !matches!(self, Self::Key | Self::Model)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field {
        field: Field,
        offset: i64,
        width: Option<usize>,
    },
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{([a-z][a-z0-9]*)([+-]\d+)?(?::(\d+))?\}").expect("placeholder regex is valid")
    })
}

/// A parsed template. Construct with [`str::parse`].
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn uses_level(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Field { field: Field::Level, .. }))
    }

    pub fn render(&self, ctx: &TemplateContext) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Field { field, offset, width } => {
                    let text = match field {
                        Field::Key => ctx.key.clone(),
                        Field::Model => ctx.model.clone(),
                        _ => {
                            let v = numeric_value(*field, ctx)? + offset;
                            match width {
                                Some(w) => format!("{v:0w$}"),
                                None => v.to_string(),
                            }
                        }
                    };
                    out.push_str(&text);
                }
            }
        }
        Ok(out)
    }
}

fn numeric_value(field: Field, ctx: &TemplateContext) -> Result<i64, TemplateError> {
    let v = match field {
        Field::Year => ctx.init.year() as i64,
        Field::Year2 => ctx.init.year().rem_euclid(100) as i64,
        Field::Month => ctx.init.month() as i64,
        Field::Day => ctx.init.day() as i64,
        Field::Hour => ctx.init.hour() as i64,
        Field::Member => ctx.member as i64,
        Field::Lead => ctx.lead as i64,
        Field::Level => ctx.level.ok_or(TemplateError::MissingValue("level"))? as i64,
        Field::Key | Field::Model => unreachable!("text fields are not numeric"),
    };
    Ok(v)
}

impl FromStr for PathTemplate {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        let mut last = 0;
        for caps in placeholder_re().captures_iter(s) {
            let whole = caps.get(0).expect("capture 0 always exists");
            push_literal(&mut segments, &s[last..whole.start()], s)?;
            last = whole.end();

            let name = &caps[1];
            let field = Field::from_str(name).map_err(|_| TemplateError::UnknownField {
                field: name.to_string(),
                template: s.to_string(),
            })?;
            let offset = caps
                .get(2)
                .map(|m| m.as_str().parse::<i64>().unwrap_or_default())
                .unwrap_or(0);
            if offset != 0 && !field.is_numeric() {
                return Err(TemplateError::OffsetOnText {
                    field: name.to_string(),
                    template: s.to_string(),
                });
            }
            let width = caps.get(3).and_then(|m| m.as_str().parse::<usize>().ok());
            segments.push(Segment::Field { field, offset, width });
        }
        push_literal(&mut segments, &s[last..], s)?;

        let template = Self {
            source: s.to_string(),
            segments,
        };
        template.check()?;
        Ok(template)
    }
}

fn push_literal(segments: &mut Vec<Segment>, text: &str, template: &str) -> Result<(), TemplateError> {
    if text.contains('{') || text.contains('}') {
        return Err(TemplateError::UnbalancedBraces(template.to_string()));
    }
    if !text.is_empty() {
        segments.push(Segment::Literal(text.to_string()));
    }
    Ok(())
}

impl TryFrom<String> for PathTemplate {
    type Error = TemplateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PathTemplate> for String {
    fn from(value: PathTemplate) -> Self {
        value.source
    }
}

impl Display for PathTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

/// Anything that can produce a source file path (relative to the model's
/// source directory) for one initialization, member, lead and file key.
pub trait SourcePath {
    fn source_path(&self, ctx: &TemplateContext) -> Result<String, TemplateError>;

    /// Render against [`TemplateContext::sentinel`] to catch broken
    /// templates before any unit runs.
    fn check(&self) -> Result<(), TemplateError> {
        let s = self.source_path(&TemplateContext::sentinel())?;
        if s.is_empty() {
            Err(TemplateError::Empty)
        } else {
            Ok(())
        }
    }
}

impl SourcePath for PathTemplate {
    fn source_path(&self, ctx: &TemplateContext) -> Result<String, TemplateError> {
        self.render(ctx)
    }
}

impl<F: Fn(&TemplateContext) -> String> SourcePath for F {
    fn source_path(&self, ctx: &TemplateContext) -> Result<String, TemplateError> {
        Ok(self(ctx))
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rstest::rstest;

    use super::*;

    fn ctx() -> TemplateContext {
        let init = NaiveDate::from_ymd_opt(2024, 12, 7)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        TemplateContext::new("CWA_GEPSv3", init, 5, 12).with_key("B10200GI0G")
    }

    #[rstest]
    #[case("{year2:02}{month:02}{day:02}{hour:02}/E{member:03}", "24120712/E005")]
    #[case("{year}{month:02}{day:02}{hour:02}{lead:04}/{key}", "20241207120012/B10200GI0G")]
    #[case(":APCP:surface:{lead-6}-{lead} hour acc fcst:", ":APCP:surface:6-12 hour acc fcst:")]
    #[case("op/{model}/f{lead+1:03}", "op/CWA_GEPSv3/f013")]
    #[case("no placeholders", "no placeholders")]
    fn test_render(#[case] template: &str, #[case] expected: &str) {
        let t: PathTemplate = template.parse().unwrap();
        assert_eq!(t.render(&ctx()).unwrap(), expected);
    }

    #[rstest]
    #[case("{lead", TemplateError::UnbalancedBraces("{lead".to_string()))]
    #[case("lead}", TemplateError::UnbalancedBraces("lead}".to_string()))]
    #[case("{minute}", TemplateError::UnknownField { field: "minute".to_string(), template: "{minute}".to_string() })]
    #[case("{key+1}", TemplateError::OffsetOnText { field: "key".to_string(), template: "{key+1}".to_string() })]
    #[case("", TemplateError::Empty)]
    fn test_rejected(#[case] template: &str, #[case] expected: TemplateError) {
        assert_eq!(template.parse::<PathTemplate>().unwrap_err(), expected);
    }

    #[test]
    fn test_level_requires_context() {
        let t: PathTemplate = ":UGRD:{level} mb:".parse().unwrap();
        assert!(t.uses_level());
        assert_eq!(t.render(&ctx()), Err(TemplateError::MissingValue("level")));
        assert_eq!(t.render(&ctx().with_level(850)).unwrap(), ":UGRD:850 mb:");
    }

    #[test]
    fn test_closure_source_path() {
        let f = |c: &TemplateContext| format!("{}/{}", c.model, c.lead);
        assert!(f.check().is_ok());
        assert_eq!(f.source_path(&ctx()).unwrap(), "CWA_GEPSv3/12");

        let empty = |_: &TemplateContext| String::new();
        assert_eq!(empty.check(), Err(TemplateError::Empty));
    }
}
