use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
};

use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        file::FileAppender,
    },
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    Config, Handle,
};

const CONSOLE_PATTERN: &str = "{h({d(%Y-%m-%d %H:%M:%S)} [{l}] from line {L} in {M})} - {m}{n}";
const RUN_LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

static HANDLE: OnceLock<Handle> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Run log {} already exists", .0.display())]
    AlreadyExists(PathBuf),
    #[error("Could not open run log {}: {1}", .0.display())]
    Io(PathBuf, std::io::Error),
    #[error("Invalid logging configuration: {0}")]
    Config(String),
    #[error("A logger not managed by this crate is already installed")]
    ForeignLogger,
}

fn console_appender() -> ConsoleAppender {
    ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(CONSOLE_PATTERN)))
        .target(Target::Stderr)
        .build()
}

fn console_config(level: log::LevelFilter) -> Result<Config, LoggingError> {
    Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(console_appender())))
        .build(Root::builder().appender("stderr").build(level))
        .map_err(|e| LoggingError::Config(e.to_string()))
}

/// Set up logging to stderr for a command line program.
pub fn init_logging(level: log::LevelFilter) {
    let config = console_config(level).expect("Failed to configure logger");
    let handle = log4rs::init_config(config).expect("Failed to initialize logger");
    let _ = HANDLE.set(handle);
}

/// Path of the run log for `model` started at `stamp` (`%y%m%d_%H%M%S`).
pub fn run_log_path(work_dir: &Path, model: &str, stamp: &str) -> PathBuf {
    work_dir.join(format!("{model}.log.{stamp}"))
}

/// A log file that receives everything logged to the console for the
/// duration of one pipeline run, so a run that fails part way still leaves
/// a complete record. Dropping it (or calling [`RunLog::finish`]) returns
/// to console-only logging.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    level: log::LevelFilter,
}

impl RunLog {
    pub fn start(work_dir: &Path, model: &str, stamp: &str, level: log::LevelFilter) -> Result<Self, LoggingError> {
        let path = run_log_path(work_dir, model, stamp);
        if path.exists() {
            return Err(LoggingError::AlreadyExists(path));
        }

        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(RUN_LOG_PATTERN)))
            .append(false)
            .build(&path)
            .map_err(|e| LoggingError::Io(path.clone(), e))?;

        let config = Config::builder()
            .appender(Appender::builder().build("stderr", Box::new(console_appender())))
            .appender(Appender::builder().build("runlog", Box::new(file)))
            .build(Root::builder().appender("stderr").appender("runlog").build(level))
            .map_err(|e| LoggingError::Config(e.to_string()))?;

        match HANDLE.get() {
            Some(handle) => handle.set_config(config),
            None => {
                let handle = log4rs::init_config(config).map_err(|_| LoggingError::ForeignLogger)?;
                let _ = HANDLE.set(handle);
            }
        }

        log::info!("logging this run to {}", path.display());
        Ok(Self { path, level })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(self) {}
}

impl Drop for RunLog {
    fn drop(&mut self) {
        if let (Some(handle), Ok(config)) = (HANDLE.get(), console_config(self.level)) {
            handle.set_config(config);
        }
    }
}
