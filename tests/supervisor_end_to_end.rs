//! End-to-end runs of the real supervisor and worker client, in process.
//!
//! Workers are tasks running `worker::run` against the supervisor's socket; the
//! compiled test program is played by `ScriptedProgram`.

#![cfg(unix)]
#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use elm_test_runner::endpoint::Endpoint;
use elm_test_runner::protocol::{ProtocolError, ReportFormat};
use elm_test_runner::supervisor::{
    RUNTIME_EXCEPTION, Supervisor, SupervisorConfig, SupervisorError, WorkerExit, WorkerLauncher,
};
use elm_test_runner::worker::{
    self, ProgramChannels, ProgramEnd, ProgramFlags, ProgramHost, WorkerError, claimed_indices,
};

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

/// How the program at one offset goes wrong after `BEGIN`.
#[derive(Debug, Clone, Copy)]
enum MidRun {
    /// Exits with code 1 after its first result.
    Crash,
    /// Prints a line that is not a frame.
    StrayOutput,
}

/// Plays the compiled test program: reports its claimed results, then answers
/// the summary request.
struct ScriptedProgram {
    report: ReportFormat,
    results: Vec<Value>,
    /// Workers at this offset fail to start their program.
    crash_offset: Option<usize>,
    /// The program at this offset dies after starting.
    mid_run: Option<(usize, MidRun)>,
    repeat_finished: bool,
}

impl ScriptedProgram {
    fn new(report: ReportFormat, results: Vec<Value>) -> Self {
        Self {
            report,
            results,
            crash_offset: None,
            mid_run: None,
            repeat_finished: false,
        }
    }

    fn begin_message(&self) -> Value {
        match self.report {
            ReportFormat::Console => json!({
                "type": "begin",
                "output": format!("Running {} tests. To reproduce these results, run: elm-test --seed 42", self.results.len())
            }),
            ReportFormat::Json => json!({"event": "runStart", "testCount": self.results.len().to_string()}),
            ReportFormat::Junit => Value::Null,
        }
    }

    fn summary_message(report: ReportFormat, failures: u64) -> Value {
        match report {
            ReportFormat::Console => json!({
                "type": "summary",
                "summary": format!("TEST RUN {}\n\nfailures: {failures}", if failures == 0 { "PASSED" } else { "FAILED" })
            }),
            ReportFormat::Json => json!({"event": "runComplete", "failed": failures.to_string()}),
            ReportFormat::Junit => json!({
                "testsuite": {"@name": "elm-test", "@failures": failures, "testcase": []}
            }),
        }
    }
}

impl ProgramHost for ScriptedProgram {
    fn start(&self, program: &Path, flags: &ProgramFlags) -> Result<ProgramChannels, WorkerError> {
        if self.crash_offset == Some(flags.index) {
            return Err(WorkerError::Start {
                program: program.to_path_buf(),
                source: io::Error::other("segfault"),
            });
        }

        let (inbound, mut from_worker) = mpsc::unbounded_channel::<Value>();
        let (to_worker, outbound) = mpsc::unbounded_channel::<Value>();
        let (ended_tx, ended) = oneshot::channel();
        let claimed: BTreeMap<String, Value> = claimed_indices(flags.index, flags.processes, self.results.len())
            .map(|i| (i.to_string(), self.results[i].clone()))
            .collect();
        let begin = json!({"type": "BEGIN", "testCount": self.results.len(), "message": self.begin_message()});
        let repeat_finished = self.repeat_finished;
        let report = self.report;
        let offset = flags.index;
        let mid_run = self.mid_run.filter(|(at, _)| *at == offset).map(|(_, how)| how);

        tokio::spawn(async move {
            let Some(start) = from_worker.recv().await else {
                return;
            };
            assert_eq!(start, json!({"type": "TEST", "index": offset}));

            // Sends only fail once the worker has been stopped.
            let _ = to_worker.send(begin);
            match mid_run {
                Some(MidRun::Crash) => {
                    let first: BTreeMap<String, Value> = claimed.into_iter().take(1).collect();
                    let _ = to_worker.send(json!({"type": "RESULTS", "results": first}));
                    let _ = ended_tx.send(ProgramEnd::Exited(Some(1)));
                    return;
                }
                Some(MidRun::StrayOutput) => {
                    let stray = serde_json::from_str::<Value>("debug: hello").unwrap_err();
                    let _ = ended_tx.send(ProgramEnd::Malformed(ProtocolError::Json(stray)));
                    return;
                }
                None => {}
            }
            let _ = to_worker.send(json!({"type": "RESULTS", "results": claimed}));
            let _ = to_worker.send(json!({"type": "FINISHED"}));
            if repeat_finished {
                let _ = to_worker.send(json!({"type": "FINISHED"}));
            }

            while let Some(message) = from_worker.recv().await {
                if message["type"] == "SUMMARY" {
                    let failures = message["failures"].as_u64().unwrap();
                    let _ = to_worker.send(json!({
                        "type": "SUMMARY",
                        "message": ScriptedProgram::summary_message(report, failures),
                        "exitCode": if failures == 0 { 0 } else { 1 },
                    }));
                    let _ = ended_tx.send(ProgramEnd::Exited(Some(0)));
                    return;
                }
            }
        });

        Ok(ProgramChannels {
            inbound,
            outbound,
            ended,
        })
    }
}

/// Stops the worker task when the supervisor drops its exit future.
struct AbortOnDrop(JoinHandle<Result<(), WorkerError>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct TaskLauncher {
    host: Arc<ScriptedProgram>,
}

impl WorkerLauncher for TaskLauncher {
    fn launch(&self, endpoint: &Endpoint) -> io::Result<WorkerExit> {
        let endpoint = endpoint.clone();
        let host = Arc::clone(&self.host);
        let handle = tokio::spawn(async move { worker::run(&endpoint, host.as_ref()).await });
        let mut guard = AbortOnDrop(handle);
        Ok(Box::pin(async move {
            match (&mut guard.0).await {
                Ok(Ok(())) => Some(0),
                Ok(Err(_)) => Some(1),
                Err(_) => None,
            }
        }))
    }
}

/// Workers that exit cleanly without ever connecting.
struct QuittingLauncher;

impl WorkerLauncher for QuittingLauncher {
    fn launch(&self, _endpoint: &Endpoint) -> io::Result<WorkerExit> {
        Ok(Box::pin(async { Some(0) }))
    }
}

struct Outcome<T = i32> {
    exit_code: T,
    out: String,
    err: String,
}

fn config(report: ReportFormat, processes: usize, watch: bool) -> SupervisorConfig {
    SupervisorConfig {
        version: "0.1.0".to_string(),
        report,
        processes,
        program: PathBuf::from("/virtual/elm-test-program"),
        fuzz: 100,
        seed: 42,
        watch,
    }
}

async fn try_run<L: WorkerLauncher>(config: SupervisorConfig, launcher: L) -> Outcome<Result<i32, SupervisorError>> {
    let out = Captured::default();
    let err = Captured::default();
    let mut supervisor = Supervisor::new(config, launcher, Box::new(out.clone()), Box::new(err.clone()));

    let exit_code = tokio::time::timeout(Duration::from_secs(10), supervisor.run())
        .await
        .expect("run timed out");
    Outcome {
        exit_code,
        out: out.text(),
        err: err.text(),
    }
}

async fn run_suite(program: ScriptedProgram, processes: usize, watch: bool) -> Outcome {
    let config = config(program.report, processes, watch);
    let launcher = TaskLauncher { host: Arc::new(program) };
    let outcome = try_run(config, launcher).await;
    Outcome {
        exit_code: outcome.exit_code.unwrap(),
        out: outcome.out,
        err: outcome.err,
    }
}

fn console_pass(index: usize) -> Value {
    json!({"type": "complete", "status": "pass", "index": index})
}

fn json_result(index: usize, status: &str) -> Value {
    json!({"event": "testCompleted", "status": status, "index": index, "labels": ["Suite", format!("test {index}")], "failures": []})
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_console_four_modules_two_workers_all_pass() {
    // One passing test per module.
    let results = (0..4).map(console_pass).collect();
    let outcome = run_suite(ScriptedProgram::new(ReportFormat::Console, results), 2, false).await;

    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.out.starts_with("\nelm-test 0.1.0\n--------------\n\nRunning 4 tests."));
    assert!(outcome.out.contains("TEST RUN PASSED"));
    assert!(outcome.out.trim_end().ends_with("failures: 0"));
    assert_eq!(outcome.out.matches("elm-test 0.1.0").count(), 1, "only the first BEGIN is printed");
    assert!(outcome.err.is_empty());
}

#[tokio::test]
async fn test_json_one_failure_among_three() {
    let results = vec![json_result(0, "pass"), json_result(1, "fail"), json_result(2, "pass")];
    let outcome = run_suite(ScriptedProgram::new(ReportFormat::Json, results), 2, false).await;

    assert_eq!(outcome.exit_code, 1);
    let completed: Vec<Value> = outcome
        .out
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).unwrap())
        .filter(|line| line["event"] == "testCompleted")
        .collect();
    assert_eq!(completed.len(), 3);
    assert_eq!(outcome.out.matches(r#""status":"fail""#).count(), 1);
    let order: Vec<u64> = completed.iter().map(|r| r["index"].as_u64().unwrap()).collect();
    assert_eq!(order, vec![0, 1, 2]);
    assert!(outcome.out.trim_end().ends_with(r#"{"event":"runComplete","failed":"1"}"#));
}

#[tokio::test]
async fn test_output_is_ordered_across_many_workers() {
    let results = (0..25).map(|i| json_result(i, "pass")).collect();
    let outcome = run_suite(ScriptedProgram::new(ReportFormat::Json, results), 4, false).await;

    assert_eq!(outcome.exit_code, 0);
    let order: Vec<u64> = outcome
        .out
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).unwrap())
        .filter_map(|line| line["index"].as_u64())
        .collect();
    assert_eq!(order, (0..25).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_junit_written_once_at_the_end() {
    let results = vec![
        json!({"@classname": "ATest", "@name": "adds"}),
        json!({"@classname": "ATest", "@name": "breaks", "failure": "boom \u{1b}"}),
    ];
    let outcome = run_suite(ScriptedProgram::new(ReportFormat::Junit, results), 2, false).await;

    assert_eq!(outcome.exit_code, 1);
    insta::assert_snapshot!(
        outcome.out.trim_end(),
        @r#"<?xml version="1.0"?><testsuite name="elm-test" failures="1"><testcase classname="ATest" name="adds"/><testcase classname="ATest" name="breaks"><failure>boom \u{001b}</failure></testcase></testsuite>"#
    );
}

#[tokio::test]
async fn test_repeated_finished_does_not_end_the_run_early() {
    let mut program = ScriptedProgram::new(ReportFormat::Json, (0..6).map(|i| json_result(i, "pass")).collect());
    program.repeat_finished = true;
    let outcome = run_suite(program, 3, false).await;

    assert_eq!(outcome.exit_code, 0);
    let completed = outcome.out.matches(r#""event":"testCompleted""#).count();
    assert_eq!(completed, 6, "summary must wait for every worker");
    assert_eq!(outcome.out.matches("runComplete").count(), 1);
}

#[tokio::test]
async fn test_crash_outside_watch_mode_fails_the_run() {
    let mut program = ScriptedProgram::new(ReportFormat::Console, (0..4).map(console_pass).collect());
    program.crash_offset = Some(1);
    let outcome = run_suite(program, 2, false).await;

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(outcome.err.matches(RUNTIME_EXCEPTION).count(), 1);
    assert!(!outcome.out.contains("TEST RUN"));
}

#[tokio::test]
async fn test_crash_in_watch_mode_is_reported_once() {
    let mut program = ScriptedProgram::new(ReportFormat::Console, (0..6).map(console_pass).collect());
    program.crash_offset = Some(0);
    let outcome = run_suite(program, 3, true).await;

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(outcome.err.matches(RUNTIME_EXCEPTION).count(), 1);
}

#[tokio::test]
async fn test_program_dying_mid_run_fails_the_run() {
    let mut program = ScriptedProgram::new(ReportFormat::Json, (0..6).map(|i| json_result(i, "pass")).collect());
    program.mid_run = Some((0, MidRun::Crash));
    let outcome = run_suite(program, 2, false).await;

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(outcome.err.matches(RUNTIME_EXCEPTION).count(), 1);
    assert!(!outcome.out.contains("runComplete"));
}

#[tokio::test]
async fn test_program_dying_mid_run_in_watch_mode_is_reported_once() {
    let mut program = ScriptedProgram::new(ReportFormat::Console, (0..6).map(console_pass).collect());
    program.mid_run = Some((1, MidRun::Crash));
    let outcome = run_suite(program, 3, true).await;

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(outcome.err.matches(RUNTIME_EXCEPTION).count(), 1);
    assert!(!outcome.out.contains("TEST RUN"));
}

#[tokio::test]
async fn test_stray_program_output_fails_the_run() {
    let mut program = ScriptedProgram::new(ReportFormat::Json, (0..4).map(|i| json_result(i, "pass")).collect());
    program.mid_run = Some((1, MidRun::StrayOutput));
    let report = program.report;
    let outcome = try_run(config(report, 2, false), TaskLauncher { host: Arc::new(program) }).await;

    // The ERROR frame and the worker's exit race; either way the run fails.
    match outcome.exit_code {
        Err(SupervisorError::Worker(message)) => assert!(message.contains("invalid message"), "{message}"),
        Ok(code) => {
            assert_eq!(code, 1);
            assert_eq!(outcome.err.matches(RUNTIME_EXCEPTION).count(), 1);
        }
        Err(other) => panic!("unexpected error: {other}"),
    }
    assert!(!outcome.out.contains("runComplete"));
}

#[tokio::test]
async fn test_workers_exiting_cleanly_without_summary() {
    for watch in [false, true] {
        let outcome = try_run(config(ReportFormat::Console, 3, watch), QuittingLauncher).await;

        assert_eq!(outcome.exit_code.unwrap(), 1, "watch: {watch}");
        assert_eq!(outcome.err.matches(RUNTIME_EXCEPTION).count(), 1, "watch: {watch}");
        assert!(outcome.out.is_empty());
    }
}

#[tokio::test]
async fn test_supervisor_runs_again_after_a_run() {
    let config = SupervisorConfig {
        version: "0.1.0".to_string(),
        report: ReportFormat::Json,
        processes: 2,
        program: PathBuf::from("/virtual/first"),
        fuzz: 1,
        seed: 7,
        watch: true,
    };
    let out = Captured::default();
    let program = ScriptedProgram::new(ReportFormat::Json, vec![json_result(0, "pass"), json_result(1, "pass")]);
    let launcher = TaskLauncher { host: Arc::new(program) };
    let mut supervisor = Supervisor::new(config, launcher, Box::new(out.clone()), Box::new(io::sink()));

    assert_eq!(supervisor.run().await.unwrap(), 0);
    supervisor.set_program(PathBuf::from("/virtual/second"));
    assert_eq!(supervisor.run().await.unwrap(), 0);
    assert_eq!(supervisor.config().program, PathBuf::from("/virtual/second"));
    assert_eq!(out.text().matches("runComplete").count(), 2);
}
