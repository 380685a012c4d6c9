//! CLI command implementations
//!
//! All command functions return `CliResult<ExitCode>` instead of calling
//! `process::exit`. Error handling and exits happen in the top-level `run()`.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::discovery::{self, Project};
use crate::endpoint::Endpoint;
use crate::protocol::ReportFormat;
use crate::supervisor::{Supervisor, SupervisorConfig, WorkerLauncher};
use crate::version::ELM_TEST_VERSION;
use crate::watch::{self, BATCH_DELAY, CLEAR_SCREEN, TestWatcher};
use crate::worker::{self, ProcessHost};

use super::test_interfaces::{BuildPlan, ProgramBuilder, build_program};
use super::{CliError, CliResult, ExitCode};

/// Resolved options for one `elm-test` invocation.
#[derive(Debug, Clone)]
pub struct TestOptions {
    pub root_dir: PathBuf,
    pub globs: Vec<String>,
    pub source_dirs: Vec<PathBuf>,
    pub seed: u64,
    pub fuzz: u32,
    pub report: ReportFormat,
    pub processes: usize,
    pub watch: bool,
}

// ============================================================================
// Project Preparation
// ============================================================================

/// `--source-dir` values, or `src/` when it exists. `tests/` is always a
/// source directory.
pub fn project_for(root_dir: &Path, source_dirs: &[PathBuf]) -> Project {
    let mut dirs: Vec<PathBuf> = if source_dirs.is_empty() {
        let src = root_dir.join("src");
        if src.is_dir() { vec![src] } else { Vec::new() }
    } else {
        source_dirs.to_vec()
    };
    let tests = root_dir.join("tests");
    if !dirs.iter().any(|dir| root_dir.join(dir) == tests) {
        dirs.push(tests);
    }
    Project::new(root_dir, dirs)
}

/// Files to test: the previous list when it is still valid, otherwise a fresh glob.
fn resolve_files(options: &TestOptions, cached: Option<&[PathBuf]>) -> CliResult<Vec<PathBuf>> {
    if let Some(files) = cached {
        return Ok(files.to_vec());
    }
    let files = discovery::resolve_globs(&options.globs, &options.root_dir);
    if files.is_empty() {
        return Err(CliError::failure(
            discovery::no_files_found(&options.root_dir, &options.globs).report(),
        ));
    }
    Ok(files)
}

/// Discover, compile and point the supervisor at the new program.
async fn prepare_run<B, L>(
    options: &TestOptions,
    project: &Project,
    files: &[PathBuf],
    builder: &B,
    supervisor: &mut Supervisor<L>,
) -> CliResult<()>
where
    B: ProgramBuilder + Clone + Send + 'static,
    L: WorkerLauncher,
{
    let modules = discovery::find_tests(files, project)
        .await
        .map_err(|e| CliError::failure(e.report()))?;
    tracing::debug!(modules = modules.len(), "discovered test modules");

    let plan = BuildPlan {
        modules,
        seed: options.seed,
        fuzz: options.fuzz,
        report: options.report,
        processes: options.processes,
    };
    let program = build_program(builder, plan)
        .await
        .map_err(|e| CliError::failure(e.to_string()))?;
    supervisor.set_program(program);
    Ok(())
}

// ============================================================================
// Test Command
// ============================================================================

/// Run the test suite once, or forever in watch mode.
pub async fn run_tests<B, L>(options: TestOptions, builder: B, launcher: L) -> CliResult<ExitCode>
where
    B: ProgramBuilder + Clone + Send + 'static,
    L: WorkerLauncher,
{
    let project = project_for(&options.root_dir, &options.source_dirs);
    let config = SupervisorConfig {
        version: ELM_TEST_VERSION.to_string(),
        report: options.report,
        processes: options.processes.max(1),
        program: PathBuf::new(),
        fuzz: options.fuzz,
        seed: options.seed,
        watch: options.watch,
    };
    let mut supervisor = Supervisor::new(config, launcher, Box::new(io::stdout()), Box::new(io::stderr()));

    if !options.watch {
        let files = resolve_files(&options, None)?;
        prepare_run(&options, &project, &files, &builder, &mut supervisor).await?;
        let code = supervisor
            .run()
            .await
            .map_err(|e| CliError::failure(e.to_string()))?;
        return Ok(ExitCode(code));
    }

    watch_tests(options, project, builder, supervisor).await
}

async fn watch_tests<B, L>(
    options: TestOptions,
    project: Project,
    builder: B,
    mut supervisor: Supervisor<L>,
) -> CliResult<ExitCode>
where
    B: ProgramBuilder + Clone + Send + 'static,
    L: WorkerLauncher,
{
    let mut watcher = TestWatcher::new(&project.root_dir, &project.source_dirs)
        .map_err(|e| CliError::failure(format!("Could not watch for changes: {e}")))?;
    let console = !options.report.is_machine_readable();

    if console {
        print!("{CLEAR_SCREEN}");
        println!("Running in watch mode");
    }

    let mut files: Option<Vec<PathBuf>> = None;
    loop {
        // Failures are shown and then we keep watching.
        let outcome = async {
            let resolved = resolve_files(&options, files.as_deref())?;
            prepare_run(&options, &project, &resolved, &builder, &mut supervisor).await?;
            files = Some(resolved);
            supervisor
                .run()
                .await
                .map_err(|e| CliError::failure(e.to_string()))
        }
        .await;
        match outcome {
            Ok(code) => tracing::debug!(code, "watch run finished"),
            Err(e) => eprintln!("{}", e.message),
        }

        let mut queue = watcher.drain();
        if queue.is_empty() {
            if console {
                println!("\nWatching for changes...");
                let _ = io::stdout().flush();
            }
            match watcher.next().await {
                Some(event) => queue.push(event),
                None => return Err(CliError::failure("The file watcher stopped unexpectedly.")),
            }
        }

        tokio::time::sleep(BATCH_DELAY).await;
        queue.extend(watcher.drain());

        if console {
            print!("{CLEAR_SCREEN}");
            println!("{}", watch::watcher_event_message(&queue));
        }
        if !watch::only_changed(&queue) {
            files = None;
        }
    }
}

// ============================================================================
// Worker Command
// ============================================================================

/// Entry point of a worker process started by the supervisor.
pub async fn run_worker(address: &str) -> CliResult<ExitCode> {
    let endpoint = Endpoint::parse(address);
    worker::run(&endpoint, &ProcessHost)
        .await
        .map_err(|e| CliError::failure(format!("elm-test worker: {e}")))?;
    Ok(ExitCode::SUCCESS)
}
