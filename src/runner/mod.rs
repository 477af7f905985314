//! Batch Runner: executes analysis units as isolated child processes, bounded by
//! a concurrency limit, and turns every outcome into a [`UnitResult`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;

use crate::types::PathsConfig;

pub mod batch;
pub mod report;

pub use batch::BatchRunner;
pub use report::{summarize, BatchReport, BatchStatus, Summary};

/// Environment variable carrying the dataset root to every unit.
pub const DATASET_ROOT_ENV: &str = "DATASET_ROOT";
/// Environment variable carrying the output directory to every unit.
pub const OUTPUT_DIR_ENV: &str = "OUTPUT_DIR";

/// Paths shared by every unit in a run.
#[derive(Clone, Debug)]
pub struct RunContext {
    pub working_dir: PathBuf,
    pub dataset_root: PathBuf,
    pub output_dir: PathBuf,
}

impl RunContext {
    /// Build a context with every path made absolute against the current directory.
    pub fn from_paths(paths: &PathsConfig) -> std::io::Result<Self> {
        let cwd = std::env::current_dir()?;
        let absolute = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                cwd.join(p)
            }
        };
        Ok(Self {
            working_dir: absolute(&paths.project_root),
            dataset_root: absolute(&paths.dataset_root),
            output_dir: absolute(&paths.output_dir),
        })
    }
}

/// Anything the runner can execute as a child process.
///
/// The runner adds the working directory, the dataset/output environment and the
/// stdio wiring on top of the returned command.
pub trait Runnable: Send + Sync {
    fn name(&self) -> &str;

    fn command(&self, ctx: &RunContext) -> Command;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl UnitState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitState::Succeeded | UnitState::Failed)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitState::Pending => "pending",
            UnitState::Running => "running",
            UnitState::Succeeded => "succeeded",
            UnitState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Final record for one unit.
#[derive(Clone, Debug, Serialize)]
pub struct UnitResult {
    pub name: String,
    pub succeeded: bool,
    /// `None` when the process never started or was killed by a signal.
    pub exit_code: Option<i32>,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl UnitResult {
    /// A failure that happened outside the unit's own process, e.g. it could not be spawned.
    pub fn fault(name: impl Into<String>, duration: Duration, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            succeeded: false,
            exit_code: None,
            duration,
            stdout: String::new(),
            stderr: message.into(),
        }
    }

    pub fn state(&self) -> UnitState {
        if self.succeeded {
            UnitState::Succeeded
        } else {
            UnitState::Failed
        }
    }

    /// Standard output followed by standard error.
    pub fn captured_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => {
                let mut out = self.stdout.clone();
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&self.stderr);
                out
            }
        }
    }
}
