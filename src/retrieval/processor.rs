use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use chrono::{Local, NaiveDateTime};
use error_stack::ResultExt;
use itertools::Itertools;
use log::{debug, error, info, warn};

use super::{
    commands::{CommandRunner, ToolCommand},
    config::PipelineConfig,
    output_types::OutputType,
    records::{index_selector, parse_match_output, unique_records},
    template::{SourcePath, TemplateContext},
    variable::VariableSpec,
    RunSummary, UnitReport, UnitState,
};
use crate::{
    error::ConfigError,
    model_files::ModelFileDescriptor,
    nc_utils::{dim_names, find_time_dimension, open_dataset, summarize_variable, var_shape},
    timetools::day_number_to_datetime,
};

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Rebuild every output, even complete ones.
    pub force_update: bool,
    /// Keep the scratch file after each unit.
    pub debug: bool,
    /// Log the merge, convert and compress commands instead of running them.
    pub dry_run: bool,
    /// Log a short description of each output file after its unit finishes.
    pub print_summary: bool,
    /// Timestamp (`%y%m%d_%H%M%S`) used to name the scratch and log files.
    pub stamp: String,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            force_update: false,
            debug: false,
            dry_run: false,
            print_summary: false,
            stamp: run_stamp(),
        }
    }
}

pub fn run_stamp() -> String {
    Local::now().format("%y%m%d_%H%M%S").to_string()
}

pub fn scratch_path(work_dir: &Path, model: &str, stamp: &str) -> PathBuf {
    work_dir.join(format!("{model}.tmp.{stamp}"))
}

/// One (initialization, member, variable) combination.
struct Unit<'a> {
    init: f64,
    init_dt: NaiveDateTime,
    member: u32,
    max_lead: u32,
    var: &'a VariableSpec,
}

impl Display for Unit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} E{:03} {}",
            self.init_dt.format("%Y-%m-%d %Hz"),
            self.member,
            self.var.name
        )
    }
}

/// One destination file of a unit.
struct Dest<'a> {
    name: &'a str,
    output: &'a OutputType,
    path: PathBuf,
}

struct Source {
    path: PathBuf,
    lead: u32,
    key: String,
}

struct GroupOutcome {
    state: UnitState,
    produced: Vec<PathBuf>,
    message: Option<String>,
}

impl GroupOutcome {
    fn skipped<S: ToString>(why: S) -> Self {
        Self {
            state: UnitState::Skip,
            produced: vec![],
            message: Some(why.to_string()),
        }
    }

    fn failed<S: ToString>(why: S) -> Self {
        Self {
            state: UnitState::Error,
            produced: vec![],
            message: Some(why.to_string()),
        }
    }
}

/// Turns raw forecast output into per-initialization netCDF files.
pub struct Processor<R: CommandRunner> {
    config: PipelineConfig,
    runner: R,
    options: ProcessorOptions,
    scratch: PathBuf,
    /// Replaces `config.source_path` when set.
    source_path: Option<Box<dyn SourcePath>>,
}

impl<R: CommandRunner> Processor<R> {
    /// Check the configuration and the filesystem. Any problem here is fatal
    /// for the whole run.
    pub fn new(config: PipelineConfig, runner: R, options: ProcessorOptions) -> error_stack::Result<Self, ConfigError> {
        config.validate()?;

        ensure_writable_dir(&config.work_dir, false, &options.stamp)
            .change_context_lazy(|| ConfigError::WorkDirNotWritable(config.work_dir.clone()))?;
        ensure_writable_dir(&config.dest_root, true, &options.stamp)
            .change_context_lazy(|| ConfigError::DestRootNotWritable(config.dest_root.clone()))?;
        if !config.grid_file.is_file() {
            return Err(ConfigError::GridFileMissing(config.grid_file.clone()).into());
        }

        let scratch = scratch_path(&config.work_dir, &config.model_name, &options.stamp);
        if scratch.exists() {
            return Err(ConfigError::ScratchExists(scratch).into());
        }

        match config.to_toml_string() {
            Ok(s) => debug!("effective configuration:\n{s}"),
            Err(e) => warn!("could not render the configuration as TOML: {e}"),
        }
        info!("scratch file = {}", scratch.display());

        Ok(Self {
            config,
            runner,
            options,
            scratch,
            source_path: None,
        })
    }

    /// Locate source files with `source_path` instead of the configured
    /// template. It is test-rendered once here so a broken function fails
    /// before any unit runs.
    pub fn with_source_path<S: SourcePath + 'static>(mut self, source_path: S) -> error_stack::Result<Self, ConfigError> {
        if let Err(e) = source_path.check() {
            return Err(ConfigError::Invalid(vec![format!("source path function cannot be rendered: {e}")]).into());
        }
        self.source_path = Some(Box::new(source_path));
        Ok(self)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn scratch_path(&self) -> &Path {
        &self.scratch
    }

    fn source_path(&self) -> &dyn SourcePath {
        match &self.source_path {
            Some(sp) => sp.as_ref(),
            None => &self.config.source_path,
        }
    }

    /// Process every member and variable for each initialization in turn. A
    /// failing unit is logged and recorded but never stops the run.
    pub fn run(&self, inits: &[f64]) -> RunSummary {
        let mut summary = RunSummary::default();
        for &init in inits {
            let init_dt = match day_number_to_datetime(init) {
                Ok(dt) => dt,
                Err(e) => {
                    error!("skipping initialization {init}: {e}");
                    continue;
                }
            };

            for (member, max_lead) in self.config.members_for(init_dt) {
                for var in self.config.active_variables() {
                    let unit = Unit {
                        init,
                        init_dt,
                        member,
                        max_lead,
                        var,
                    };
                    info!("---- ---- ----");
                    info!("[[ model    ]] = {}", self.config.model_name);
                    info!("[[ initTime ]] = {}", init_dt.format("%Y-%m-%d %Hz"));
                    info!("[[ member   ]] = {member}");
                    info!("[[ variable ]] = {}", var.name);

                    let report = self.run_unit(&unit);
                    match report.state {
                        UnitState::Error => error!("{unit}: failed: {}", report.message),
                        state => info!("{unit}: {state}"),
                    }
                    summary.units.push(report);
                }
            }
        }
        summary
    }

    fn run_unit(&self, unit: &Unit) -> UnitReport {
        let mut outcomes = vec![];
        for (outputs, leads) in self.lead_groups(unit) {
            let outcome = match self.dests(unit, &outputs) {
                Ok(dests) => self.run_group(unit, &dests, &leads),
                Err(e) => GroupOutcome::failed(e),
            };
            outcomes.push(outcome);
        }

        let produced = outcomes.iter().flat_map(|o| o.produced.iter().cloned()).collect_vec();
        let failed = outcomes.iter().any(|o| o.state == UnitState::Error);
        let message = outcomes.iter().filter_map(|o| o.message.as_deref()).join("; ");

        let mut state = if failed {
            UnitState::Error
        } else if produced.is_empty() {
            UnitState::Skip
        } else {
            UnitState::Converted
        };

        if !produced.is_empty() {
            self.compress(&produced);
            if !failed {
                self.transition(unit, &mut state, UnitState::Compressed);
            }
        }

        if self.options.print_summary {
            self.print_summaries(unit);
        }
        self.cleanup_scratch();

        if state == UnitState::Compressed {
            self.transition(unit, &mut state, UnitState::Done);
        }

        UnitReport {
            init: unit.init,
            member: unit.member,
            variable: unit.var.name.clone(),
            state,
            message,
        }
    }

    /// Analysis outputs only need lead 0; forecast outputs use every
    /// configured lead up to the member's maximum.
    fn lead_groups<'c>(&'c self, unit: &Unit<'c>) -> Vec<(Vec<&'c str>, Vec<u32>)> {
        let (analysis, forecast): (Vec<&str>, Vec<&str>) = unit
            .var
            .output_types
            .iter()
            .map(|s| s.as_str())
            .partition(|name| self.config.output_types.get(*name).map(|o| o.analysis).unwrap_or(false));

        let mut groups = vec![];
        if !analysis.is_empty() {
            groups.push((analysis, vec![0]));
        }
        if !forecast.is_empty() {
            let leads = unit
                .var
                .lead_hours()
                .into_iter()
                .filter(|&l| l <= unit.max_lead)
                .collect_vec();
            groups.push((forecast, leads));
        }
        groups
    }

    fn dests<'c>(&'c self, unit: &Unit, outputs: &[&'c str]) -> Result<Vec<Dest<'c>>, String> {
        outputs
            .iter()
            .map(|&name| {
                let output = self
                    .config
                    .output_types
                    .get(name)
                    .ok_or_else(|| format!("output type '{name}' is not defined"))?;
                let path = ModelFileDescriptor::total(&self.config.model_name, name, &unit.var.name, unit.init, unit.member)
                    .path(&self.config.dest_root)
                    .map_err(|e| e.to_string())?;
                Ok(Dest { name, output, path })
            })
            .collect()
    }

    fn run_group(&self, unit: &Unit, dests: &[Dest], leads: &[u32]) -> GroupOutcome {
        let mut state = UnitState::Start;
        if leads.is_empty() {
            self.transition(unit, &mut state, UnitState::Skip);
            return GroupOutcome::skipped(format!("no leads within {} h", unit.max_lead));
        }

        let needed = self.dests_needing_update(unit, dests, leads);
        if needed.is_empty() {
            self.transition(unit, &mut state, UnitState::Skip);
            return GroupOutcome::skipped("complete");
        }

        let (sources, available) = self.locate_sources(unit, leads);
        self.transition(unit, &mut state, UnitState::SrcLocated);
        if sources.is_empty() {
            warn!("{unit}: no source files found");
            self.transition(unit, &mut state, UnitState::Skip);
            return GroupOutcome::skipped("no source files");
        }

        let needed = if available.len() < leads.len() {
            info!(
                "{unit}: sources exist for {} of {} leads, checking against those",
                available.len(),
                leads.len()
            );
            self.dests_needing_update(unit, dests, &available)
        } else {
            needed
        };
        if needed.is_empty() {
            self.transition(unit, &mut state, UnitState::Skip);
            return GroupOutcome::skipped("complete for the available leads");
        }

        self.transition(unit, &mut state, UnitState::NeedsMerge);
        if let Err(why) = self.merge(unit, &sources) {
            self.transition(unit, &mut state, UnitState::Error);
            return GroupOutcome::failed(why);
        }
        self.transition(unit, &mut state, UnitState::Merged);

        let mut produced = vec![];
        let mut failures = vec![];
        for dest in needed {
            match self.convert(unit, dest) {
                Ok(()) => produced.push(dest.path.clone()),
                Err(why) => failures.push(why),
            }
        }

        if failures.is_empty() {
            self.transition(unit, &mut state, UnitState::Converted);
            GroupOutcome {
                state,
                produced,
                message: None,
            }
        } else {
            self.transition(unit, &mut state, UnitState::Error);
            GroupOutcome {
                state,
                produced,
                message: Some(failures.join("; ")),
            }
        }
    }

    fn transition(&self, unit: &Unit, state: &mut UnitState, next: UnitState) {
        debug!("{unit}: {state} -> {next}");
        *state = next;
    }

    fn dests_needing_update<'d, 'c>(&self, unit: &Unit, dests: &'d [Dest<'c>], leads: &[u32]) -> Vec<&'d Dest<'c>> {
        if self.options.force_update {
            info!("{unit}: force updating all files");
            return dests.iter().collect();
        }

        dests
            .iter()
            .filter(|d| {
                let existing = existing_count(&d.path, &unit.var.name, d.output);
                let expected = d.output.expected_count(unit.init, leads, unit.var.shift_hours);
                if existing < expected {
                    info!("updating {}: {existing} of {expected} time steps present", d.name);
                    true
                } else {
                    info!("skipping {}: complete with {existing} time steps", d.name);
                    false
                }
            })
            .collect()
    }

    /// Source files in lead order. The list stops at the first missing file;
    /// a lead counts as available only if all its files exist.
    fn locate_sources(&self, unit: &Unit, leads: &[u32]) -> (Vec<Source>, Vec<u32>) {
        let src_dir = self.config.src_root.join(&self.config.model_name);
        let mut sources = vec![];
        let mut available = vec![];

        'leads: for &lead in leads {
            let mut lead_sources = vec![];
            for key in &unit.var.file_name_keys {
                let ctx = TemplateContext::new(&self.config.model_name, unit.init_dt, unit.member, lead).with_key(key);
                let path = match self.source_path().source_path(&ctx) {
                    Ok(rel) => src_dir.join(rel),
                    Err(e) => {
                        error!("{unit}: could not build the source path for lead {lead}: {e}");
                        break 'leads;
                    }
                };
                if !path.exists() {
                    warn!("source file not found: lead={lead} key='{key}'");
                    warn!("{}", path.display());
                    break 'leads;
                }
                lead_sources.push(Source {
                    path,
                    lead,
                    key: key.clone(),
                });
            }
            sources.extend(lead_sources);
            available.push(lead);
        }
        (sources, available)
    }

    /// Find the records in every source and append them to a fresh scratch
    /// file. Any source with the wrong number of records aborts the merge
    /// before anything is appended.
    fn merge(&self, unit: &Unit, sources: &[Source]) -> Result<(), String> {
        self.remove_scratch();

        let expected = unit.var.expected_records();
        let mut selections = vec![];
        for src in sources {
            let ctx = TemplateContext::new(&self.config.model_name, unit.init_dt, unit.member, src.lead).with_key(&src.key);
            let expr = unit.var.match_expression(&ctx).map_err(|e| e.to_string())?;
            let cmd = self.config.tools.match_records(&src.path, &expr);
            let out = self.runner.run(&cmd);
            let records = if out.success {
                unique_records(parse_match_output(&out.output))
            } else {
                log_failure(&cmd, &out.output);
                vec![]
            };

            if records.len() != expected {
                error!(
                    "expecting {expected} records but found {} in {}",
                    records.len(),
                    src.path.display()
                );
                error!("  command: {cmd}");
                for r in &records {
                    error!("  {}", r.line);
                }
                return Err(format!(
                    "found {} of {expected} records in {}",
                    records.len(),
                    src.path.display()
                ));
            }
            selections.push((src, records));
        }

        for (src, records) in selections {
            let cmd = self
                .config
                .tools
                .append_records(&src.path, &index_selector(&records), &self.scratch);
            self.execute(&cmd);
        }
        Ok(())
    }

    fn convert(&self, unit: &Unit, dest: &Dest) -> Result<(), String> {
        let ops = dest
            .output
            .operators(unit.init, &unit.var.corrections())
            .map_err(|e| format!("{}: {e}", dest.name))?;

        if !self.options.dry_run {
            if let Some(dir) = dest.path.parent() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| format!("could not create {}: {e}", dir.display()))?;
            }
        }

        let cmd = self
            .config
            .tools
            .convert(&ops, &self.config.grid_file, &self.scratch, &dest.path);
        if self.execute(&cmd) {
            info!("ok: {}", dest.name);
            Ok(())
        } else {
            Err(format!("conversion to {} failed", dest.name))
        }
    }

    fn compress(&self, produced: &[PathBuf]) {
        for p in produced {
            let cmd = self.config.tools.compress(p);
            if self.options.dry_run {
                info!("dry run: {cmd}");
            } else {
                self.runner.spawn_detached(&cmd);
            }
        }
    }

    /// Run a command that changes files, or just log it in a dry run.
    fn execute(&self, cmd: &ToolCommand) -> bool {
        if self.options.dry_run {
            info!("dry run: {cmd}");
            return true;
        }
        let out = self.runner.run(cmd);
        if !out.success {
            log_failure(cmd, &out.output);
        }
        out.success
    }

    fn print_summaries(&self, unit: &Unit) {
        let outputs = unit.var.output_types.iter().map(|s| s.as_str()).collect_vec();
        let Ok(dests) = self.dests(unit, &outputs) else {
            return;
        };
        for d in dests {
            if !d.path.exists() {
                warn!("[output file summary] {} not found", d.path.display());
                continue;
            }
            match summarize_variable(&d.path, &unit.var.name) {
                Ok(s) => info!("[output file summary] {s}"),
                Err(e) => warn!("[output file summary] {}: {e}", d.path.display()),
            }
        }
    }

    fn remove_scratch(&self) {
        if self.scratch.exists() {
            if let Err(e) = std::fs::remove_file(&self.scratch) {
                warn!("could not remove scratch file {}: {e}", self.scratch.display());
            }
        }
    }

    fn cleanup_scratch(&self) {
        if !self.options.debug {
            self.remove_scratch();
        }
    }
}

fn log_failure(cmd: &ToolCommand, output: &str) {
    error!("command failed: {cmd}");
    error!("{}", output.trim_end());
}

/// Number of time steps already in an output file. Missing files and files
/// without the variable count as empty; analysis files count as one step.
fn existing_count(path: &Path, var_name: &str, output: &OutputType) -> usize {
    if !path.exists() {
        return 0;
    }
    let ds = match open_dataset(path) {
        Ok(ds) => ds,
        Err(e) => {
            warn!("could not open {}, it will be rebuilt: {e}", path.display());
            return 0;
        }
    };
    let Some(var) = ds.variable(var_name) else {
        info!("{} does not contain {var_name}", path.display());
        return 0;
    };
    if output.analysis {
        return 1;
    }
    match find_time_dimension(&dim_names(&var)) {
        Some(i) => var_shape(&var)[i],
        None => {
            info!("{var_name} in {} has no time dimension", path.display());
            0
        }
    }
}

fn ensure_writable_dir(dir: &Path, create: bool, stamp: &str) -> std::io::Result<()> {
    if create {
        std::fs::create_dir_all(dir)?;
    }
    let marker = dir.join(format!(".write_check.{stamp}"));
    std::fs::File::create(&marker)?;
    std::fs::remove_file(&marker)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use chrono::NaiveDate;
    use ndarray::Array1;

    use super::*;
    use crate::{
        retrieval::{commands::CommandOutput, config::tests::example_toml},
        test_utils::{write_test_file, TestAxis},
        timetools::datetime_to_day_number,
    };

    /// Answers record queries with one line per match pattern and writes a
    /// small netCDF file for every conversion.
    #[derive(Default)]
    struct MockRunner {
        commands: RefCell<Vec<ToolCommand>>,
        detached: RefCell<Vec<ToolCommand>>,
        /// Sources that are one record short.
        short: Vec<PathBuf>,
    }

    impl MockRunner {
        fn with_short(short: &[PathBuf]) -> Self {
            Self {
                short: short.to_vec(),
                ..Default::default()
            }
        }

        fn count(&self, program: &str, flag: &str) -> usize {
            self.commands
                .borrow()
                .iter()
                .filter(|c| c.program == Path::new(program) && c.args.iter().any(|a| a == flag))
                .count()
        }

        fn mentions(&self, fragment: &str) -> bool {
            self.commands.borrow().iter().any(|c| c.args.iter().any(|a| a.contains(fragment)))
        }
    }

    impl CommandRunner for MockRunner {
        fn run(&self, cmd: &ToolCommand) -> CommandOutput {
            self.commands.borrow_mut().push(cmd.clone());
            let last = PathBuf::from(cmd.args.last().cloned().unwrap_or_default());

            if cmd.program == Path::new("wgrib2") && cmd.args.iter().any(|a| a == "-append") {
                std::fs::write(&last, b"GRIB").unwrap();
                CommandOutput::ok("")
            } else if cmd.program == Path::new("wgrib2") {
                let src = PathBuf::from(&cmd.args[2]);
                let patterns = last.to_string_lossy().trim_matches(['(', ')']).split('|').map(|s| s.to_string()).collect_vec();
                let n = if self.short.contains(&src) { patterns.len() - 1 } else { patterns.len() };
                let lines = patterns
                    .iter()
                    .take(n)
                    .enumerate()
                    .map(|(i, p)| format!("{}:{}:d=2024120700{p}anl:", i + 1, i * 1000))
                    .join("\n");
                CommandOutput::ok(lines)
            } else {
                let name = last.file_name().unwrap().to_string_lossy().to_string();
                let var = name.trim_end_matches(".nc").rsplit('_').next().unwrap().to_string();
                let lat = TestAxis::new("lat", &[0.0, 1.0]);
                if name.starts_with("analysis_") {
                    write_test_file(&last, &var, &[lat], Array1::zeros(2).into_dyn());
                } else {
                    write_test_file(&last, &var, &[TestAxis::time(&[0.0]), lat], ndarray::Array2::zeros((1, 2)).into_dyn());
                }
                CommandOutput::ok("")
            }
        }

        fn spawn_detached(&self, cmd: &ToolCommand) {
            self.detached.borrow_mut().push(cmd.clone());
        }
    }

    struct Workspace {
        dir: tempfile::TempDir,
        config: PipelineConfig,
        init: f64,
    }

    impl Workspace {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = PipelineConfig::from_toml_str(&example_toml(dir.path())).unwrap();
            std::fs::create_dir_all(&config.work_dir).unwrap();
            std::fs::write(&config.grid_file, "gridtype = lonlat\n").unwrap();
            let init = datetime_to_day_number(NaiveDate::from_ymd_opt(2024, 12, 7).unwrap().and_hms_opt(0, 0, 0).unwrap());
            Self { dir, config, init }
        }

        fn source(&self, member: u32, lead: u32) -> PathBuf {
            self.dir
                .path()
                .join(format!("src/M/2024120700/E{member:03}/f{lead:03}"))
        }

        fn make_sources(&self, member: u32, leads: &[u32]) {
            for &lead in leads {
                let p = self.source(member, lead);
                std::fs::create_dir_all(p.parent().unwrap()).unwrap();
                std::fs::write(p, b"").unwrap();
            }
        }

        fn dest(&self, member: u32, file: &str) -> PathBuf {
            self.dir.path().join(format!("dest/M/2024/12/07z00/E{member:03}/{file}"))
        }

        fn processor(&self, runner: MockRunner, stamp: &str, dry_run: bool) -> Processor<MockRunner> {
            let options = ProcessorOptions {
                dry_run,
                stamp: stamp.to_string(),
                ..Default::default()
            };
            Processor::new(self.config.clone(), runner, options).unwrap()
        }
    }

    #[test]
    fn test_full_run_then_skip() {
        let ws = Workspace::new();
        ws.make_sources(0, &[0, 6, 12]);
        ws.make_sources(1, &[0, 6, 12]);

        let p = ws.processor(MockRunner::default(), "241207_000001", false);
        let summary = p.run(&[ws.init]);
        assert_eq!(summary.units.len(), 4);
        assert_eq!(summary.count(UnitState::Done), 4, "{}", summary.table());

        let runner = p.runner();
        // t2m: one match and append per lead; u: one each for the analysis
        assert_eq!(runner.count("wgrib2", "-append"), 2 * (3 + 1));
        assert_eq!(runner.commands.borrow().iter().filter(|c| c.program == Path::new("cdo")).count(), 4);
        assert_eq!(runner.detached.borrow().len(), 4);
        assert!(ws.dest(1, "global_daily_1p0_t2m.nc").exists());
        assert!(ws.dest(0, "analysis_u.nc").exists());
        assert!(!p.scratch_path().exists());

        let p2 = ws.processor(MockRunner::default(), "241207_000002", false);
        let summary = p2.run(&[ws.init]);
        assert_eq!(summary.count(UnitState::Skip), 4, "{}", summary.table());
        assert!(p2.runner().commands.borrow().is_empty());
    }

    #[test]
    fn test_record_mismatch_fails_only_that_unit() {
        let ws = Workspace::new();
        ws.make_sources(0, &[0, 6, 12]);
        ws.make_sources(1, &[0, 6, 12]);

        let runner = MockRunner::with_short(&[ws.source(0, 6)]);
        let p = ws.processor(runner, "241207_000003", false);
        let summary = p.run(&[ws.init]);
        assert_eq!(summary.count(UnitState::Error), 1, "{}", summary.table());
        assert_eq!(summary.count(UnitState::Done), 3, "{}", summary.table());

        let failed = summary.units.iter().find(|u| u.state == UnitState::Error).unwrap();
        assert_eq!((failed.member, failed.variable.as_str()), (0, "t2m"));
        assert!(!ws.dest(0, "global_daily_1p0_t2m.nc").exists());
        assert!(ws.dest(0, "analysis_u.nc").exists());
        // nothing from member 0's t2m sources was appended
        assert!(!p
            .runner()
            .commands
            .borrow()
            .iter()
            .any(|c| c.args.contains(&"-append".to_string()) && c.args[2].contains("E000/f006")));
    }

    #[test]
    fn test_missing_source_truncates_leads() {
        let ws = Workspace::new();
        ws.make_sources(0, &[0, 6, 12]);
        ws.make_sources(1, &[0, 6]);

        let p = ws.processor(MockRunner::default(), "241207_000004", false);
        let summary = p.run(&[ws.init]);
        assert_eq!(summary.count(UnitState::Done), 4, "{}", summary.table());
        assert!(!p.runner().mentions("E001/f012"));
        assert!(p.runner().mentions("E000/f012"));
    }

    #[test]
    fn test_dry_run_only_matches() {
        let ws = Workspace::new();
        ws.make_sources(0, &[0, 6, 12]);
        ws.make_sources(1, &[0, 6, 12]);

        let p = ws.processor(MockRunner::default(), "241207_000005", true);
        let summary = p.run(&[ws.init]);
        assert_eq!(summary.count(UnitState::Done), 4);
        let runner = p.runner();
        assert_eq!(runner.count("wgrib2", "-append"), 0);
        assert_eq!(runner.count("wgrib2", "-match"), 8);
        assert!(runner.detached.borrow().is_empty());
        assert!(!ws.dest(0, "analysis_u.nc").exists());
    }

    #[test]
    fn test_source_path_function() {
        let ws = Workspace::new();
        let flat = ws.dir.path().join("src/M/flat");
        std::fs::create_dir_all(&flat).unwrap();
        for lead in [0, 6, 12] {
            std::fs::write(flat.join(format!("E{:03}_{lead}", 0)), b"").unwrap();
        }

        let mut config = ws.config.clone();
        config.skip.members = vec![1];
        config.skip.variables = vec!["u".to_string()];
        let options = ProcessorOptions {
            stamp: "241207_000007".to_string(),
            ..Default::default()
        };
        let p = Processor::new(config, MockRunner::default(), options)
            .unwrap()
            .with_source_path(|ctx: &TemplateContext| format!("flat/E{:03}_{}", ctx.member, ctx.lead))
            .unwrap();
        let summary = p.run(&[ws.init]);
        assert_eq!(summary.count(UnitState::Done), 1, "{}", summary.table());
        assert!(p.runner().mentions("flat/E000_12"));
        assert!(ws.dest(0, "global_daily_1p0_t2m.nc").exists());
    }

    #[test]
    fn test_empty_source_path_function_is_rejected() {
        let ws = Workspace::new();
        let options = ProcessorOptions {
            stamp: "241207_000008".to_string(),
            ..Default::default()
        };
        let err = Processor::new(ws.config.clone(), MockRunner::default(), options)
            .unwrap()
            .with_source_path(|_: &TemplateContext| String::new())
            .err()
            .unwrap();
        assert!(matches!(err.current_context(), ConfigError::Invalid(_)));
    }

    #[test]
    fn test_setup_errors() {
        let ws = Workspace::new();
        let stamp = "241207_000006";
        std::fs::write(scratch_path(&ws.config.work_dir, "M", stamp), b"").unwrap();
        let options = ProcessorOptions {
            stamp: stamp.to_string(),
            ..Default::default()
        };
        let err = Processor::new(ws.config.clone(), MockRunner::default(), options.clone()).err().unwrap();
        assert!(matches!(err.current_context(), ConfigError::ScratchExists(_)));

        std::fs::remove_file(&ws.config.grid_file).unwrap();
        let err = Processor::new(ws.config.clone(), MockRunner::default(), options).err().unwrap();
        assert!(matches!(err.current_context(), ConfigError::GridFileMissing(_)));

        let mut config = ws.config.clone();
        config.work_dir = ws.dir.path().join("does/not/exist");
        let err = Processor::new(config, MockRunner::default(), ProcessorOptions::default()).err().unwrap();
        assert!(matches!(err.current_context(), ConfigError::WorkDirNotWritable(_)));
    }
}
