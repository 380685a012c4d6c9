//! Per-run bookkeeping owned by the supervisor loop
//!
//! A fresh [`RunState`] is created for every run, watch-mode reruns included.
//! Only the supervisor's event loop touches it.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use serde_json::{Value, json};

use crate::protocol::{ProtocolError, ReportFormat, SummaryRequest};

/// Identity of an accepted worker connection, assigned in accept order.
pub type ConnectionId = usize;

#[derive(Debug)]
pub struct RunState {
    report: ReportFormat,
    processes: usize,
    results: BTreeMap<usize, Value>,
    /// `None` until the first `BEGIN`.
    next_result_to_print: Option<usize>,
    tests_to_run: Option<usize>,
    failures: usize,
    todos: Vec<Value>,
    started_at: Instant,
    accepted: usize,
    finished: HashSet<ConnectionId>,
    closed_workers: usize,
}

impl RunState {
    pub fn new(report: ReportFormat, processes: usize) -> Self {
        Self {
            report,
            processes,
            results: BTreeMap::new(),
            next_result_to_print: None,
            tests_to_run: None,
            failures: 0,
            todos: Vec::new(),
            started_at: Instant::now(),
            accepted: 0,
            finished: HashSet::new(),
            closed_workers: 0,
        }
    }

    /// Register a new connection. The returned id doubles as the worker's
    /// starting offset.
    pub fn accept_connection(&mut self) -> ConnectionId {
        let id = self.accepted;
        self.accepted += 1;
        id
    }

    /// Handle `BEGIN`. Returns `false` if an earlier `BEGIN` already started output.
    pub fn begin(&mut self, test_count: usize) -> bool {
        if self.tests_to_run.is_some() {
            return false;
        }
        self.tests_to_run = Some(test_count);
        self.next_result_to_print = Some(0);
        true
    }

    /// Store a batch of results, counting failures and todos for the report format.
    ///
    /// An index that already has a result keeps its first one.
    pub fn record_results(&mut self, batch: BTreeMap<usize, Value>) -> Result<(), ProtocolError> {
        for (index, result) in batch {
            if self.results.contains_key(&index) {
                tracing::warn!(index, "ignoring duplicate result");
                continue;
            }
            self.classify(&result)?;
            self.results.insert(index, result);
        }
        Ok(())
    }

    fn classify(&mut self, result: &Value) -> Result<(), ProtocolError> {
        let status = result.get("status").and_then(Value::as_str);
        match self.report {
            ReportFormat::Console => match status {
                Some("pass") => {}
                Some("todo") => self.todos.push(result.clone()),
                Some("fail") => self.failures += 1,
                _ => return Err(ProtocolError::BadResult(format!("unexpected status in {result}"))),
            },
            ReportFormat::Json => match status {
                Some("fail") => self.failures += 1,
                Some("todo") => self.todos.push(json!({
                    "labels": result.get("labels").cloned().unwrap_or(Value::Null),
                    "todo": result.pointer("/failures/0").cloned().unwrap_or(Value::Null),
                })),
                _ => {}
            },
            ReportFormat::Junit => {
                if result.get("failure").is_some() {
                    self.failures += 1;
                }
            }
        }
        Ok(())
    }

    /// Results that can be printed now, in index order.
    ///
    /// Nothing is printable before `BEGIN`; afterwards output advances while the
    /// next index is present and stops at the first gap.
    pub fn drain_printable(&mut self) -> Vec<Value> {
        let (Some(mut next), Some(total)) = (self.next_result_to_print, self.tests_to_run) else {
            return Vec::new();
        };
        let mut printable = Vec::new();
        while next < total {
            let Some(result) = self.results.get(&next) else {
                break;
            };
            printable.push(result.clone());
            next += 1;
        }
        self.next_result_to_print = Some(next);
        printable
    }

    /// Handle `FINISHED` from `connection`. Returns `true` only the first time.
    pub fn mark_finished(&mut self, connection: ConnectionId) -> bool {
        self.finished.insert(connection)
    }

    pub fn running_workers(&self) -> usize {
        self.processes.saturating_sub(self.finished.len())
    }

    pub fn worker_closed(&mut self) -> usize {
        self.closed_workers += 1;
        self.closed_workers
    }

    pub fn all_closed(&self) -> bool {
        self.closed_workers >= self.processes
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn summary_request(&self) -> SummaryRequest {
        SummaryRequest {
            duration: u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            failures: self.failures,
            todos: self.todos.clone(),
        }
    }

    /// Every stored result in index order.
    pub fn buffered_results(&self) -> impl Iterator<Item = &Value> {
        self.results.values()
    }
}
