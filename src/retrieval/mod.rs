//! Retrieval and merge pipeline for forecast model output.
//!
//! For every initialization time, ensemble member and variable (a "unit"),
//! the pipeline checks whether the processed files are already complete,
//! and if not, collects the matching records from the raw source files into
//! a scratch file, converts that into each requested output type, and
//! compresses the results. Each unit walks through the states of
//! [`UnitState`]; a failure in one unit is recorded and the run moves on.
//!
//! The external tools (record matcher, converter, compressor) are run
//! through the [`CommandRunner`] trait so that the pipeline can be tested
//! without them.
use std::borrow::Cow;

use tabled::Tabled;

use crate::timetools::day_number_to_datetime;

pub mod commands;
pub mod config;
pub mod output_types;
pub mod processor;
pub mod records;
pub mod template;
pub mod variable;

pub use commands::{CommandOutput, CommandRunner, SystemRunner, ToolCommand, ToolPaths};
pub use config::{MemberSpec, PipelineConfig, SkipLists};
pub use output_types::OutputType;
pub use processor::{run_stamp, scratch_path, Processor, ProcessorOptions};
pub use template::{PathTemplate, SourcePath, TemplateContext};
pub use variable::{LeadSpec, VariableSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitState {
    Start,
    SrcLocated,
    /// Nothing to do: outputs were complete or no sources exist.
    Skip,
    NeedsMerge,
    Merged,
    Converted,
    Compressed,
    Done,
    Error,
}

/// The outcome of one unit.
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub init: f64,
    pub member: u32,
    pub variable: String,
    pub state: UnitState,
    pub message: String,
}

impl Tabled for UnitReport {
    const LENGTH: usize = 5;

    fn fields(&self) -> Vec<Cow<'_, str>> {
        let init = day_number_to_datetime(self.init)
            .map(|dt| dt.format("%Y-%m-%d %Hz").to_string())
            .unwrap_or_else(|_| format!("{}", self.init));
        vec![
            init.into(),
            format!("E{:03}", self.member).into(),
            self.variable.as_str().into(),
            self.state.to_string().into(),
            self.message.as_str().into(),
        ]
    }

    fn headers() -> Vec<Cow<'static, str>> {
        vec!["init".into(), "member".into(), "variable".into(), "state".into(), "notes".into()]
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub units: Vec<UnitReport>,
}

impl RunSummary {
    pub fn count(&self, state: UnitState) -> usize {
        self.units.iter().filter(|u| u.state == state).count()
    }

    pub fn any_failed(&self) -> bool {
        self.count(UnitState::Error) > 0
    }

    /// Render as a plain text table, one row per unit.
    pub fn table(&self) -> String {
        let mut builder = tabled::builder::Builder::new();
        builder.push_record(UnitReport::headers());
        for unit in &self.units {
            builder.push_record(unit.fields());
        }
        let mut table = builder.build();
        table
            .with(tabled::settings::style::Style::blank())
            .with(tabled::settings::Alignment::left());
        table.to_string()
    }
}
