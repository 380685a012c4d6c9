//! CLI module for the elm-test runner
//!
//! ## Commands
//!
//! - `elm-test [GLOBS]...` - Discover, compile and run tests
//! - `elm-test worker --endpoint <ADDR>` - Worker process entry point (hidden; started by the supervisor)
//!
//! ## Modules
//!
//! - `commands` - Command implementations and the watch loop
//! - `test_interfaces` - Compiler and worker-process boundaries
//!
//! ## Design
//!
//! The CLI uses clap for argument parsing with derive macros.
//! Command functions return `CliResult<T>` instead of calling `process::exit`.
//! Only the top-level `run()` function handles errors and exits.

// Enforce explicit error handling - no panicking in production code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod commands;
pub mod test_interfaces;

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use rand::Rng;

use crate::protocol::ReportFormat;
use crate::version::ELM_TEST_VERSION;
use commands::TestOptions;
use test_interfaces::{CompilerCommand, ProcessLauncher};

// ============================================================================
// CLI Error handling
// ============================================================================

/// Exit code for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    pub const FAILURE: ExitCode = ExitCode(1);
}

/// Error type for CLI operations.
///
/// Contains a user-facing message and an exit code. The CLI entry point
/// catches these errors, prints the message, and exits with the code.
#[derive(Debug)]
pub struct CliError {
    /// User-facing error message (already formatted for display)
    pub message: String,
    /// Exit code to return to the shell
    pub exit_code: ExitCode,
}

impl CliError {
    pub fn new(message: impl Into<String>, exit_code: ExitCode) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }

    /// Create a failure error (exit code 1).
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(message, ExitCode::FAILURE)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

/// Seeds are drawn from this range when `--seed` is not given.
const SEED_RANGE: std::ops::Range<u64> = 1000..407_199_254_740_991;

// ============================================================================
// Clap CLI definition
// ============================================================================

/// Run Elm tests in parallel
#[derive(Parser, Debug)]
#[command(name = "elm-test")]
#[command(version = ELM_TEST_VERSION)]
#[command(about = "Run Elm tests in parallel", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub test: TestArgs,
}

#[derive(Args, Debug)]
pub struct TestArgs {
    /// Test files, directories or globs (default: tests/)
    #[arg(value_name = "GLOBS")]
    pub globs: Vec<String>,

    /// Program that compiles the test modules into a runnable test program
    #[arg(long, value_name = "PATH", default_value = "elm-test-compile")]
    pub compiler: PathBuf,

    /// Run with a previous fuzzer seed (default: random)
    #[arg(long, value_name = "INT")]
    pub seed: Option<u64>,

    /// Run with each fuzz test performing this many iterations
    #[arg(long, value_name = "INT", default_value_t = 100, value_parser = clap::value_parser!(u32).range(1..))]
    pub fuzz: u32,

    /// Type of report
    #[arg(long, value_enum, default_value_t = ReportFormat::Console)]
    pub report: ReportFormat,

    /// Number of worker processes (default: number of logical CPUs)
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    pub processes: Option<u64>,

    /// Run tests on file changes
    #[arg(long)]
    pub watch: bool,

    /// Source directory to resolve test modules against (repeatable; default: src/ if present)
    #[arg(long = "source-dir", value_name = "DIR")]
    pub source_dirs: Vec<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve one test program for a supervisor
    #[command(hide = true)]
    Worker {
        /// Socket path or named pipe to connect to
        #[arg(long, value_name = "ADDR")]
        endpoint: String,
    },
}

impl TestArgs {
    /// Fill in the defaults that depend on the machine and the working directory.
    pub fn into_options(self, root_dir: PathBuf) -> TestOptions {
        let seed = self.seed.unwrap_or_else(|| rand::thread_rng().gen_range(SEED_RANGE));
        let processes = self
            .processes
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or_else(num_cpus::get)
            .max(1);
        TestOptions {
            root_dir,
            globs: self.globs,
            source_dirs: self.source_dirs,
            seed,
            fuzz: self.fuzz,
            report: self.report,
            processes,
            watch: self.watch,
        }
    }
}

// ============================================================================
// CLI entry point
// ============================================================================

/// Main CLI entry point.
///
/// This is the only place where `process::exit` is called. All command
/// implementations return `CliResult` and errors are handled here.
pub fn run() {
    let cli = Cli::parse();

    match execute(cli) {
        Ok(exit_code) => {
            if exit_code.0 != 0 {
                process::exit(exit_code.0);
            }
        }
        Err(e) => {
            if !e.message.is_empty() {
                eprintln!("{}", e.message);
            }
            process::exit(e.exit_code.0);
        }
    }
}

/// Execute the CLI command and return result.
fn execute(cli: Cli) -> CliResult<ExitCode> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::failure(format!("Could not start the async runtime: {e}")))?;

    match cli.command {
        Some(Command::Worker { endpoint }) => runtime.block_on(commands::run_worker(&endpoint)),
        None => {
            let root_dir = env::current_dir()
                .map_err(|e| CliError::failure(format!("Could not read the current directory: {e}")))?;
            let compiler = cli.test.compiler.clone();
            let options = cli.test.into_options(root_dir.clone());
            tracing::debug!(seed = options.seed, processes = options.processes, report = %options.report, "starting");

            let builder = CompilerCommand::new(compiler, root_dir);
            let launcher = ProcessLauncher::current()
                .map_err(|e| CliError::failure(format!("Could not locate the elm-test executable: {e}")))?;
            runtime.block_on(commands::run_tests(options, builder, launcher))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_defaults() {
        let cli = Cli::try_parse_from(["elm-test"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.test.globs.is_empty());
        assert_eq!(cli.test.compiler, PathBuf::from("elm-test-compile"));
        assert_eq!(cli.test.fuzz, 100);
        assert_eq!(cli.test.report, ReportFormat::Console);
        assert!(!cli.test.watch);
    }

    #[test]
    fn test_cli_parse_run_options() {
        let cli = Cli::try_parse_from([
            "elm-test",
            "tests/Unit",
            "src/**/*Tests.elm",
            "--seed",
            "12345",
            "--fuzz",
            "7",
            "--report",
            "junit",
            "--processes",
            "3",
            "--source-dir",
            "lib",
            "--source-dir",
            "vendor",
            "--watch",
        ])
        .unwrap();
        assert_eq!(cli.test.globs, vec!["tests/Unit", "src/**/*Tests.elm"]);
        assert_eq!(cli.test.seed, Some(12345));
        assert_eq!(cli.test.fuzz, 7);
        assert_eq!(cli.test.report, ReportFormat::Junit);
        assert_eq!(cli.test.processes, Some(3));
        assert_eq!(cli.test.source_dirs, vec![PathBuf::from("lib"), PathBuf::from("vendor")]);
        assert!(cli.test.watch);
    }

    #[test]
    fn test_cli_rejects_zero_fuzz_and_processes() {
        assert!(Cli::try_parse_from(["elm-test", "--fuzz", "0"]).is_err());
        assert!(Cli::try_parse_from(["elm-test", "--processes", "0"]).is_err());
        assert!(Cli::try_parse_from(["elm-test", "--report", "tap"]).is_err());
    }

    #[test]
    fn test_cli_parse_worker() {
        let cli = Cli::try_parse_from(["elm-test", "worker", "--endpoint", "/tmp/elm_test-1.sock"]).unwrap();
        match cli.command {
            Some(Command::Worker { endpoint }) => assert_eq!(endpoint, "/tmp/elm_test-1.sock"),
            other => panic!("Expected Worker command, got {other:?}"),
        }
    }

    #[test]
    fn test_default_seed_and_processes() {
        let cli = Cli::try_parse_from(["elm-test"]).unwrap();
        let options = cli.test.into_options(PathBuf::from("/project"));
        assert!(SEED_RANGE.contains(&options.seed));
        assert!(options.processes >= 1);
        assert_eq!(options.root_dir, PathBuf::from("/project"));
    }
}
