//! Test runner I/O boundary interfaces
//!
//! Trait-based seams around the two external processes a run depends on:
//! - Program building (discovered modules → one compiled test program)
//! - Worker launching (re-executing this binary as `elm-test worker`)
//!
//! The supervisor and commands only see the traits, so tests can swap in
//! in-process implementations.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command as StdCommand, Stdio};

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;

use crate::discovery::TestModule;
use crate::endpoint::Endpoint;
use crate::protocol::ReportFormat;
use crate::supervisor::{WorkerExit, WorkerLauncher};

/// Errors from the external compiler.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("could not start the compiler `{}`: {source}", .compiler.display())]
    Spawn {
        compiler: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not talk to the compiler: {0}")]
    Io(#[from] io::Error),

    #[error("could not encode the build plan: {0}")]
    Plan(#[from] serde_json::Error),

    #[error("Compilation failed\n\n{stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("the compiler did not print a program path")]
    NoProgram,

    #[error("the build was interrupted: {0}")]
    Interrupted(#[from] tokio::task::JoinError),
}

// ============================================================================
// Program Builder Interface
// ============================================================================

/// Everything the compiler needs to produce one test program.
#[derive(Debug, Clone, Serialize)]
pub struct BuildPlan {
    pub modules: Vec<TestModule>,
    pub seed: u64,
    pub fuzz: u32,
    pub report: ReportFormat,
    pub processes: usize,
}

/// Compile the discovered test modules into an executable program.
pub trait ProgramBuilder {
    /// Returns the path of the compiled program.
    fn build(&self, plan: &BuildPlan) -> Result<PathBuf, BuildError>;
}

/// Run `builder` on the blocking pool.
pub async fn build_program<B>(builder: &B, plan: BuildPlan) -> Result<PathBuf, BuildError>
where
    B: ProgramBuilder + Clone + Send + 'static,
{
    let builder = builder.clone();
    tokio::task::spawn_blocking(move || builder.build(&plan)).await?
}

/// Runs an external compiler: the plan goes in as JSON on stdin and the
/// program path comes back as the first non-empty line of stdout.
#[derive(Debug, Clone)]
pub struct CompilerCommand {
    compiler: PathBuf,
    root_dir: PathBuf,
}

impl CompilerCommand {
    pub fn new(compiler: impl Into<PathBuf>, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            compiler: compiler.into(),
            root_dir: root_dir.into(),
        }
    }
}

impl ProgramBuilder for CompilerCommand {
    #[tracing::instrument(skip_all, fields(compiler = %self.compiler.display(), modules = plan.modules.len()))]
    fn build(&self, plan: &BuildPlan) -> Result<PathBuf, BuildError> {
        let input = serde_json::to_vec(plan)?;

        let mut child = StdCommand::new(&self.compiler)
            .current_dir(&self.root_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| BuildError::Spawn {
                compiler: self.compiler.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input)?;
            stdin.write_all(b"\n")?;
        }
        let output = child.wait_with_output()?;

        if !output.status.success() {
            return Err(BuildError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let program = program_path(&stdout).ok_or(BuildError::NoProgram)?;
        let program = if program.is_absolute() {
            program
        } else {
            self.root_dir.join(program)
        };
        tracing::debug!(program = %program.display(), "compiled test program");
        Ok(program)
    }
}

fn program_path(stdout: &str) -> Option<PathBuf> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(PathBuf::from)
}

// ============================================================================
// Worker Launcher (Current Behavior)
// ============================================================================

/// Starts workers by re-executing `exe` with the hidden `worker` subcommand.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    exe: PathBuf,
}

impl ProcessLauncher {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }

    /// Launch copies of the running binary.
    pub fn current() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, endpoint: &Endpoint) -> io::Result<WorkerExit> {
        let mut child = Command::new(&self.exe)
            .arg("worker")
            .arg("--endpoint")
            .arg(endpoint.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        tracing::debug!(pid = ?child.id(), "worker started");

        Ok(Box::pin(async move {
            match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::debug!(error = %e, "could not wait for worker");
                    None
                }
            }
        }))
    }
}
