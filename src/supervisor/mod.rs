//! Supervisor
//!
//! Owns one test run: binds the endpoint, starts the workers, hands each
//! connection its starting offset, and merges the result streams into one
//! ordered report.
//!
//! ```text
//!  acceptor task ──Connected──┐
//!  reader task (per worker) ──┼──► event channel ──► Run (single owner of RunState)
//!  worker exits (JoinSet) ────┘                         │
//!                                                       ▼
//!                                                   Reporter
//! ```
//!
//! All state lives in one task; connection readers only forward frames.

pub mod junit;
pub mod report;
pub mod state;

use std::collections::HashMap;
use std::future::Future;
use std::io::{self, Write};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use thiserror::Error;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::endpoint::{Connection, Endpoint, Listener};
use crate::protocol::{
    FrameReader, LoadInstruction, ProtocolError, ReportFormat, SupervisorMessage, WorkerMessage, write_frame,
};
use report::{Output, Reporter, reporter_for};
use state::{ConnectionId, RunState};

/// Runs started by any supervisor in this process; keeps endpoint names unique.
static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

pub const RUNTIME_EXCEPTION: &str = "\n\nThere was an unexpected runtime exception while running tests\n\n";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("could not listen on {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("could not start a worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("could not accept a worker connection: {0}")]
    Accept(#[source] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A worker reported `ERROR`.
    #[error("{0}")]
    Worker(String),

    #[error("could not write output: {0}")]
    Output(#[from] io::Error),
}

/// Resolves to the worker's exit code once it exits (`None` when killed by a
/// signal). Dropping it must stop the worker.
pub type WorkerExit = Pin<Box<dyn Future<Output = Option<i32>> + Send>>;

/// Starts worker processes that connect back to `endpoint`.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, endpoint: &Endpoint) -> io::Result<WorkerExit>;
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub version: String,
    pub report: ReportFormat,
    pub processes: usize,
    pub program: PathBuf,
    pub fuzz: u32,
    pub seed: u64,
    pub watch: bool,
}

pub struct Supervisor<L> {
    config: SupervisorConfig,
    launcher: L,
    reporter: Box<dyn Reporter>,
    err: Output,
}

enum Event {
    Connected(Connection),
    AcceptFailed(io::Error),
    Message(ConnectionId, WorkerMessage),
    Failed(ConnectionId, ProtocolError),
    Disconnected(ConnectionId),
}

impl<L: WorkerLauncher> Supervisor<L> {
    pub fn new(config: SupervisorConfig, launcher: L, out: Output, err: Output) -> Self {
        let reporter = reporter_for(config.report, &config.version, out);
        Self {
            config,
            launcher,
            reporter,
            err,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Point later runs at a freshly compiled program.
    pub fn set_program(&mut self, program: PathBuf) {
        self.config.program = program;
    }

    /// Execute one complete run and return the process exit code.
    ///
    /// Workers are always stopped before this returns.
    #[tracing::instrument(skip_all, fields(processes = self.config.processes))]
    pub async fn run(&mut self) -> Result<i32, SupervisorError> {
        let run = RUN_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        let endpoint = Endpoint::for_run(std::process::id(), run);
        tracing::debug!(run, endpoint = %endpoint, "starting run");
        let listener = Listener::bind(&endpoint).map_err(|source| SupervisorError::Bind {
            endpoint: endpoint.to_string(),
            source,
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let acceptor = tokio::spawn(accept_loop(listener, tx.clone()));

        let mut exits = JoinSet::new();
        let mut launched = Ok(());
        for _ in 0..self.config.processes {
            match self.launcher.launch(&endpoint) {
                Ok(exit) => {
                    exits.spawn(exit);
                }
                Err(e) => {
                    launched = Err(SupervisorError::Spawn(e));
                    break;
                }
            }
        }

        let mut run = Run {
            config: &self.config,
            reporter: self.reporter.as_mut(),
            err: &mut self.err,
            state: RunState::new(self.config.report, self.config.processes),
            writers: HashMap::new(),
            readers: JoinSet::new(),
            tx,
        };
        let outcome = match launched {
            Ok(()) => run.drive(rx, &mut exits).await,
            Err(e) => Err(e),
        };

        // Dropping the exit futures kills the worker processes.
        exits.shutdown().await;
        run.readers.shutdown().await;
        acceptor.abort();
        let _ = acceptor.await;

        outcome
    }
}

async fn accept_loop(listener: Listener, tx: mpsc::UnboundedSender<Event>) {
    loop {
        match listener.accept().await {
            Ok(connection) => {
                if tx.send(Event::Connected(connection)).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(Event::AcceptFailed(e));
                return;
            }
        }
    }
}

async fn read_worker(id: ConnectionId, read: ReadHalf<Connection>, tx: mpsc::UnboundedSender<Event>) {
    let mut frames = FrameReader::new(read);
    loop {
        let event = match frames.next::<WorkerMessage>().await {
            Ok(Some(message)) => Event::Message(id, message),
            Ok(None) => Event::Disconnected(id),
            // A reset socket means the worker died; its exit code tells the story.
            Err(ProtocolError::Io(e)) => {
                tracing::debug!(connection = id, error = %e, "worker connection lost");
                Event::Disconnected(id)
            }
            Err(e) => Event::Failed(id, e),
        };
        let last = !matches!(event, Event::Message(..));
        if tx.send(event).is_err() || last {
            return;
        }
    }
}

// ============================================================================
// RUN
// ============================================================================

struct Run<'a> {
    config: &'a SupervisorConfig,
    reporter: &'a mut dyn Reporter,
    err: &'a mut Output,
    state: RunState,
    writers: HashMap<ConnectionId, WriteHalf<Connection>>,
    readers: JoinSet<()>,
    tx: mpsc::UnboundedSender<Event>,
}

impl Run<'_> {
    async fn drive(
        &mut self,
        mut rx: mpsc::UnboundedReceiver<Event>,
        exits: &mut JoinSet<Option<i32>>,
    ) -> Result<i32, SupervisorError> {
        loop {
            let step = tokio::select! {
                Some(event) = rx.recv() => self.handle_event(event).await?,
                Some(joined) = exits.join_next(), if !exits.is_empty() => {
                    // A cancelled or panicked exit future counts as a kill, not a crash.
                    let code = joined.unwrap_or(None);
                    self.handle_exit(code, exits)?
                }
                else => Some(1),
            };
            if let Some(exit_code) = step {
                return Ok(exit_code);
            }
        }
    }

    async fn handle_event(&mut self, event: Event) -> Result<Option<i32>, SupervisorError> {
        match event {
            Event::Connected(connection) => {
                self.on_connected(connection).await;
                Ok(None)
            }
            Event::AcceptFailed(e) => Err(SupervisorError::Accept(e)),
            Event::Message(id, message) => self.on_message(id, message).await,
            Event::Failed(id, e) => {
                tracing::debug!(connection = id, error = %e, "bad frame from worker");
                Err(e.into())
            }
            Event::Disconnected(id) => {
                tracing::debug!(connection = id, "worker disconnected");
                self.writers.remove(&id);
                self.check_all_gone()
            }
        }
    }

    async fn on_connected(&mut self, connection: Connection) {
        let id = self.state.accept_connection();
        let (read, mut write) = tokio::io::split(connection);
        self.readers.spawn(read_worker(id, read, self.tx.clone()));

        let load = SupervisorMessage::Load(LoadInstruction {
            program: self.config.program.clone(),
            fuzz: self.config.fuzz,
            seed: self.config.seed,
            processes: self.config.processes,
            index: id,
            report: self.config.report,
        });
        tracing::debug!(connection = id, offset = id, "worker connected");
        // A worker that cannot be written to is about to exit; its exit code decides.
        match write_frame(&mut write, &load).await {
            Ok(()) => {
                self.writers.insert(id, write);
            }
            Err(e) => tracing::warn!(connection = id, error = %e, "could not send LOAD"),
        }
    }

    async fn on_message(&mut self, id: ConnectionId, message: WorkerMessage) -> Result<Option<i32>, SupervisorError> {
        tracing::debug!(connection = id, kind = message.kind(), "message from worker");
        match message {
            WorkerMessage::Begin { test_count, message } => {
                if self.state.begin(test_count) {
                    self.reporter.on_begin(&message)?;
                    self.flush()?;
                } else {
                    tracing::warn!(connection = id, test_count, "ignoring repeated BEGIN");
                }
            }
            WorkerMessage::Results { results } => {
                self.state.record_results(results)?;
                self.flush()?;
            }
            WorkerMessage::Finished { results } => {
                self.state.record_results(results)?;
                self.flush()?;
                if !self.state.mark_finished(id) {
                    tracing::warn!(connection = id, "ignoring repeated FINISHED");
                } else if self.state.running_workers() == 0 {
                    self.request_summary(id).await?;
                }
            }
            WorkerMessage::Summary { message, exit_code } => {
                self.flush()?;
                match message {
                    // The program could not run any tests at all.
                    Value::String(text) => writeln!(self.err, "{text}")?,
                    message => {
                        let results = self.state.buffered_results().cloned().collect();
                        self.reporter.on_summary(message, results)?;
                    }
                }
                return Ok(Some(exit_code));
            }
            WorkerMessage::Error { message } => return Err(SupervisorError::Worker(message)),
        }
        Ok(None)
    }

    /// Send `SUMMARY` to the worker that finished last.
    async fn request_summary(&mut self, id: ConnectionId) -> Result<(), SupervisorError> {
        let request = SupervisorMessage::Summary(self.state.summary_request());
        let Some(writer) = self.writers.get_mut(&id) else {
            return Err(ProtocolError::Unexpected {
                expected: "an open connection for SUMMARY",
                found: format!("connection {id} closed"),
            }
            .into());
        };
        write_frame(writer, &request).await?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SupervisorError> {
        for result in self.state.drain_printable() {
            self.reporter.on_result(&result)?;
        }
        Ok(())
    }

    fn handle_exit(
        &mut self,
        code: Option<i32>,
        exits: &mut JoinSet<Option<i32>>,
    ) -> Result<Option<i32>, SupervisorError> {
        let crashed = matches!(code, Some(c) if c != 0);
        let closed = self.state.worker_closed();
        tracing::debug!(?code, closed, "worker exited");

        if !crashed {
            return self.check_all_gone();
        }
        if !self.config.watch {
            self.report_runtime_exception()?;
            return Ok(Some(1));
        }

        // The run can no longer finish; stop the rest and report once they are gone.
        exits.abort_all();
        self.check_all_gone()
    }

    /// Every worker exited and every connection drained without a summary.
    fn check_all_gone(&mut self) -> Result<Option<i32>, SupervisorError> {
        if !self.state.all_closed() || !self.writers.is_empty() {
            return Ok(None);
        }
        self.report_runtime_exception()?;
        Ok(Some(1))
    }

    fn report_runtime_exception(&mut self) -> Result<(), SupervisorError> {
        writeln!(self.err, "{RUNTIME_EXCEPTION}")?;
        self.err.flush()?;
        Ok(())
    }
}
