//! Hosting the compiled test program
//!
//! The program is an executable started as `<program> --flags <JSON>`. It reads
//! newline-delimited JSON frames on stdin and writes them on stdout, using the
//! same framing as the supervisor socket.

use std::path::Path;
use std::process::Stdio;

use serde::Serialize;
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::mpsc;

use tokio::sync::oneshot;

use super::WorkerError;
use crate::protocol::{FrameReader, LoadInstruction, ProtocolError, ReportFormat, write_frame};

/// Execution parameters passed to the program at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgramFlags {
    pub seed: u64,
    pub fuzz: u32,
    pub report: ReportFormat,
    pub index: usize,
    pub processes: usize,
}

impl From<&LoadInstruction> for ProgramFlags {
    fn from(load: &LoadInstruction) -> Self {
        Self {
            seed: load.seed,
            fuzz: load.fuzz,
            report: load.report,
            index: load.index,
            processes: load.processes,
        }
    }
}

/// How a program's output stream ended.
#[derive(Debug)]
pub enum ProgramEnd {
    /// The program exited with this code, `None` when killed by a signal.
    Exited(Option<i32>),
    /// The program wrote a line that is not a JSON frame.
    Malformed(ProtocolError),
}

/// Both directions of a running program.
///
/// `outbound` closes when the program is done; `ended` then says how.
pub struct ProgramChannels {
    pub inbound: mpsc::UnboundedSender<Value>,
    pub outbound: mpsc::UnboundedReceiver<Value>,
    pub ended: oneshot::Receiver<ProgramEnd>,
}

/// Runs a compiled test program on behalf of a worker.
pub trait ProgramHost: Send + Sync {
    fn start(&self, program: &Path, flags: &ProgramFlags) -> Result<ProgramChannels, WorkerError>;
}

/// The test indices a worker at `offset` claims out of `total`.
///
/// The program applies this partition itself; the runner never calls it, but
/// any [`ProgramHost`] standing in for a real program must follow it.
pub fn claimed_indices(offset: usize, processes: usize, total: usize) -> impl Iterator<Item = usize> {
    (offset..total).step_by(processes.max(1))
}

/// Starts the program as a child process. Must be called inside a Tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessHost;

impl ProgramHost for ProcessHost {
    fn start(&self, program: &Path, flags: &ProgramFlags) -> Result<ProgramChannels, WorkerError> {
        let flags = serde_json::to_string(flags).map_err(crate::protocol::ProtocolError::from)?;
        let start_error = |source| WorkerError::Start {
            program: program.to_path_buf(),
            source,
        };

        let mut child = Command::new(program)
            .arg("--flags")
            .arg(flags)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(start_error)?;

        let missing = |stream: &str| {
            start_error(std::io::Error::other(format!("program {stream} was not captured")))
        };
        let mut stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

        let (inbound, mut inbound_rx) = mpsc::unbounded_channel::<Value>();
        let (outbound_tx, outbound) = mpsc::unbounded_channel::<Value>();
        let (ended_tx, ended) = oneshot::channel();

        tokio::spawn(async move {
            while let Some(frame) = inbound_rx.recv().await {
                if let Err(e) = write_frame(&mut stdin, &frame).await {
                    tracing::debug!(error = %e, "program stdin closed");
                    return;
                }
            }
        });

        tokio::spawn(async move {
            let mut frames = FrameReader::new(stdout);
            let end = loop {
                match frames.next_value().await {
                    Ok(Some(frame)) => {
                        if outbound_tx.send(frame).is_err() {
                            break None;
                        }
                    }
                    Ok(None) => break None,
                    Err(e) => break Some(e),
                }
            };
            // Close the stream only once the outcome is known.
            let end = match end {
                Some(e) => {
                    tracing::warn!(error = %e, "unreadable output from test program");
                    if let Err(e) = child.kill().await {
                        tracing::debug!(error = %e, "could not stop test program");
                    }
                    ProgramEnd::Malformed(e)
                }
                None => match child.wait().await {
                    Ok(status) => {
                        tracing::debug!(%status, "test program exited");
                        ProgramEnd::Exited(status.code())
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "could not wait for test program");
                        ProgramEnd::Exited(None)
                    }
                },
            };
            let _ = ended_tx.send(end);
            drop(outbound_tx);
        });

        Ok(ProgramChannels {
            inbound,
            outbound,
            ended,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_partition_examples() {
        assert_eq!(claimed_indices(1, 3, 8).collect::<Vec<_>>(), vec![1, 4, 7]);
        assert_eq!(claimed_indices(2, 2, 2).count(), 0);
        assert_eq!(claimed_indices(0, 0, 3).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    proptest! {
        #[test]
        fn partition_covers_every_index_once(processes in 1usize..12, total in 0usize..200) {
            let mut seen = BTreeSet::new();
            let mut claimed = 0;
            for offset in 0..processes {
                for index in claimed_indices(offset, processes, total) {
                    prop_assert_eq!(index % processes, offset);
                    seen.insert(index);
                    claimed += 1;
                }
            }
            prop_assert_eq!(claimed, total);
            prop_assert_eq!(seen, (0..total).collect::<BTreeSet<_>>());
        }
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("program.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    async fn run_to_end(program: &Path) -> (Vec<Value>, ProgramEnd) {
        let flags = ProgramFlags {
            seed: 1,
            fuzz: 1,
            report: ReportFormat::Console,
            index: 0,
            processes: 1,
        };
        let ProgramChannels {
            inbound,
            mut outbound,
            ended,
        } = ProcessHost.start(program, &flags).unwrap();
        inbound.send(serde_json::json!({"type": "TEST", "index": 0})).unwrap();

        let mut frames = Vec::new();
        while let Some(frame) = outbound.recv().await {
            frames.push(frame);
        }
        (frames, ended.await.unwrap())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_host_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "read start\necho '{\"type\":\"RESULTS\",\"results\":{}}'\nexit 3\n");

        let (frames, end) = run_to_end(&program).await;
        assert_eq!(frames, vec![serde_json::json!({"type": "RESULTS", "results": {}})]);
        assert!(matches!(end, ProgramEnd::Exited(Some(3))), "{end:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_host_rejects_stray_output() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "read start\necho 'debug: hello'\nexec sleep 30\n");

        let (frames, end) = run_to_end(&program).await;
        assert!(frames.is_empty());
        assert!(matches!(end, ProgramEnd::Malformed(ProtocolError::Json(_))), "{end:?}");
    }

    #[test]
    fn test_flags_shape() {
        let flags = ProgramFlags {
            seed: 7,
            fuzz: 100,
            report: ReportFormat::Json,
            index: 1,
            processes: 4,
        };
        assert_eq!(
            serde_json::to_string(&flags).unwrap(),
            r#"{"seed":7,"fuzz":100,"report":"json","index":1,"processes":4}"#
        );
    }
}
