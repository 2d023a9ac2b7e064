//! External tools used by the pipeline.
//!
//! Commands are always built as a program plus an argument list and run
//! without a shell. Failures are reported through [`CommandOutput`] rather
//! than as errors; the pipeline decides what a failure means for the unit.
use std::{
    fmt::Display,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: vec![],
        }
    }

    pub fn arg<S: ToString>(mut self, arg: S) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn path_arg(self, p: &Path) -> Self {
        let s = p.to_string_lossy().to_string();
        self.arg(s)
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.args.extend(args.into_iter().map(|a| a.to_string()));
        self
    }
}

/// Renders as a copy-pasteable command line, quoting arguments that need it.
impl Display for ToolCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for a in &self.args {
            if a.is_empty() || a.contains(|c: char| c.is_whitespace() || "|()^\"'$*?".contains(c)) {
                write!(f, " \"{}\"", a.replace('"', "\\\""))?;
            } else {
                write!(f, " {a}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    /// Standard output followed by standard error.
    pub output: String,
}

impl CommandOutput {
    pub fn ok<S: ToString>(output: S) -> Self {
        Self {
            success: true,
            output: output.to_string(),
        }
    }

    pub fn failed<S: ToString>(output: S) -> Self {
        Self {
            success: false,
            output: output.to_string(),
        }
    }
}

pub trait CommandRunner {
    /// Run to completion and capture the output.
    fn run(&self, cmd: &ToolCommand) -> CommandOutput;

    /// Start the command and return immediately, discarding its output.
    fn spawn_detached(&self, cmd: &ToolCommand);
}

/// Runs commands as child processes of this program.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &ToolCommand) -> CommandOutput {
        debug!("running: {cmd}");
        match Command::new(&cmd.program).args(&cmd.args).output() {
            Ok(out) => {
                let mut text = String::from_utf8_lossy(&out.stdout).to_string();
                text.push_str(&String::from_utf8_lossy(&out.stderr));
                CommandOutput {
                    success: out.status.success(),
                    output: text,
                }
            }
            Err(e) => CommandOutput::failed(format!("could not start {}: {e}", cmd.program.display())),
        }
    }

    /// The child is handed to a thread that waits on it, so finished jobs
    /// do not linger as zombie processes for the rest of the run.
    fn spawn_detached(&self, cmd: &ToolCommand) {
        debug!("starting in the background: {cmd}");
        let res = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match res {
            Ok(child) => child,
            Err(e) => {
                error!("could not start {cmd}: {e}");
                return;
            }
        };

        let desc = cmd.to_string();
        let reaper = std::thread::Builder::new()
            .name(format!("reap-{}", child.id()))
            .spawn(move || match child.wait() {
                Ok(status) if status.success() => debug!("background command finished: {desc}"),
                Ok(status) => warn!("background command exited with {status}: {desc}"),
                Err(e) => warn!("could not wait on background command {desc}: {e}"),
            });
        if let Err(e) = reaper {
            warn!("could not start a thread to wait on {cmd}: {e}");
        }
    }
}

/// Locations and thread counts of the external tools.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ToolPaths {
    #[serde(default = "default_wgrib2")]
    pub wgrib2: PathBuf,
    #[serde(default = "default_wgrib2_threads")]
    pub wgrib2_threads: u32,
    #[serde(default = "default_cdo")]
    pub cdo: PathBuf,
    #[serde(default = "default_cdo_threads")]
    pub cdo_threads: u32,
    #[serde(default = "default_nc_compress")]
    pub nc_compress: PathBuf,
}

fn default_wgrib2() -> PathBuf {
    PathBuf::from("wgrib2")
}

fn default_wgrib2_threads() -> u32 {
    1
}

fn default_cdo() -> PathBuf {
    PathBuf::from("cdo")
}

fn default_cdo_threads() -> u32 {
    8
}

fn default_nc_compress() -> PathBuf {
    PathBuf::from("nc_compress")
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            wgrib2: default_wgrib2(),
            wgrib2_threads: default_wgrib2_threads(),
            cdo: default_cdo(),
            cdo_threads: default_cdo_threads(),
            nc_compress: default_nc_compress(),
        }
    }
}

impl ToolPaths {
    /// List the records in `src` that match `expression`.
    pub fn match_records(&self, src: &Path, expression: &str) -> ToolCommand {
        ToolCommand::new(&self.wgrib2)
            .arg("-ncpu")
            .arg(self.wgrib2_threads)
            .path_arg(src)
            .arg("-match")
            .arg(expression)
    }

    /// Append the records of `src` selected by `selector` to `scratch`.
    pub fn append_records(&self, src: &Path, selector: &str, scratch: &Path) -> ToolCommand {
        ToolCommand::new(&self.wgrib2)
            .arg("-ncpu")
            .arg(self.wgrib2_threads)
            .path_arg(src)
            .arg("-match")
            .arg(selector)
            .arg("-append")
            .arg("-grib")
            .path_arg(scratch)
    }

    /// Convert the merged records in `scratch` to netCDF4 at `dest`. The
    /// operators are applied in the order given, followed by the grid.
    pub fn convert(&self, operators: &[String], grid_file: &Path, scratch: &Path, dest: &Path) -> ToolCommand {
        ToolCommand::new(&self.cdo)
            .arg("-P")
            .arg(self.cdo_threads)
            .args(["--no_history", "--reduce_dim", "-f", "nc4"])
            .args(operators)
            .arg(format!("-setgrid,{}", grid_file.display()))
            .path_arg(scratch)
            .path_arg(dest)
    }

    pub fn compress(&self, dest: &Path) -> ToolCommand {
        ToolCommand::new(&self.nc_compress).path_arg(dest).arg("-1")
    }
}
