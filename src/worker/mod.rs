//! Worker
//!
//! Bridges one supervisor connection and one instance of the compiled test
//! program:
//!
//! ```text
//! [Connecting] --connected--> [AwaitingLoad] --LOAD--> [Running] --EOF--> [Closed]
//! ```
//!
//! Once running, supervisor frames go to the program untouched and program
//! frames go to the supervisor untouched. There is no reconnection: any socket
//! error ends the worker.
//!
//! The worker succeeds only if its program relayed a `SUMMARY` and exited
//! cleanly, or if the supervisor hung up first. A program that crashes or stops
//! early makes the worker fail, which the supervisor reports as a runtime
//! exception.

pub mod program;

use std::io;
use std::path::PathBuf;

use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::WriteHalf;

use crate::endpoint::{self, Connection, Endpoint};
use crate::protocol::{FrameReader, ProtocolError, SupervisorMessage, write_frame};
pub use program::{ProcessHost, ProgramChannels, ProgramEnd, ProgramFlags, ProgramHost, claimed_indices};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("could not connect to the supervisor at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("the supervisor closed the connection before sending LOAD")]
    ClosedBeforeLoad,

    #[error("could not start {}: {source}", .program.display())]
    Start {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("the test program {}", describe_exit(.code))]
    ProgramCrashed { code: Option<i32> },

    #[error("the test program exited before sending its summary")]
    ProgramStopped,
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {code}"),
        None => "was killed by a signal".to_string(),
    }
}

/// Connect to the supervisor at `endpoint` and serve one test program.
///
/// Returns `Ok(())` when the supervisor hangs up, or when the program exits
/// cleanly after relaying its summary.
#[tracing::instrument(skip_all, fields(endpoint = %endpoint))]
pub async fn run<H: ProgramHost + ?Sized>(endpoint: &Endpoint, host: &H) -> Result<(), WorkerError> {
    let connection = endpoint::connect(endpoint).await.map_err(|source| WorkerError::Connect {
        endpoint: endpoint.to_string(),
        source,
    })?;
    let (read, mut write) = tokio::io::split(connection);
    let mut frames = FrameReader::new(read);

    let first = frames.next_value().await?.ok_or(WorkerError::ClosedBeforeLoad)?;
    let load = match serde_json::from_value::<SupervisorMessage>(first.clone()) {
        Ok(SupervisorMessage::Load(load)) => load,
        _ => {
            return Err(ProtocolError::Unexpected {
                expected: "LOAD",
                found: first.to_string(),
            }
            .into());
        }
    };
    tracing::debug!(offset = load.index, program = %load.program.display(), "loading test program");

    let ProgramChannels {
        inbound,
        mut outbound,
        ended,
    } = host.start(&load.program, &ProgramFlags::from(&load))?;
    let start: Value = json!({"type": "TEST", "index": load.index});
    if inbound.send(start).is_err() {
        tracing::debug!("test program stopped before it was started");
    }

    let mut summarized = false;
    loop {
        tokio::select! {
            frame = frames.next_value() => match frame? {
                Some(frame) => {
                    if inbound.send(frame).is_err() {
                        tracing::debug!("test program stopped accepting input");
                    }
                }
                None => {
                    tracing::debug!("supervisor closed the connection");
                    return Ok(());
                }
            },
            event = outbound.recv() => match event {
                Some(event) => {
                    summarized |= event["type"] == "SUMMARY";
                    write_frame(&mut write, &event).await?;
                }
                None => {
                    // A dropped sender without an outcome means the host lost the program.
                    let end = ended.await.unwrap_or(ProgramEnd::Exited(None));
                    return program_ended(end, summarized, &mut write).await;
                }
            },
        }
    }
}

async fn program_ended(
    end: ProgramEnd,
    summarized: bool,
    write: &mut WriteHalf<Connection>,
) -> Result<(), WorkerError> {
    tracing::debug!(?end, summarized, "test program finished");
    match end {
        ProgramEnd::Exited(Some(0)) if summarized => Ok(()),
        ProgramEnd::Exited(Some(0)) => Err(WorkerError::ProgramStopped),
        ProgramEnd::Exited(code) => Err(WorkerError::ProgramCrashed { code }),
        ProgramEnd::Malformed(e) => {
            let error = json!({"type": "ERROR", "message": format!("The test program sent an invalid message: {e}")});
            if let Err(report_error) = write_frame(write, &error).await {
                tracing::debug!(error = %report_error, "could not report the invalid message");
            }
            Err(e.into())
        }
    }
}
