//! Supervisor ↔ worker messages
//!
//! ## Framing
//!
//! Every frame is one compact JSON object followed by a single `\n`. The JSON
//! encoder escapes control characters, so a raw newline never appears inside a
//! frame. Readers buffer until the newline and skip blank lines, which covers
//! both several frames arriving in one read and one frame split over many.
//!
//! The same framing is used between a worker and the compiled test program.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected {expected} but received {found}")]
    Unexpected { expected: &'static str, found: String },

    #[error("unexpected result: {0}")]
    BadResult(String),
}

// ============================================================================
// REPORT FORMAT
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Console,
    Json,
    Junit,
}

impl ReportFormat {
    /// Machine-readable reports get no headline and no screen clearing.
    pub fn is_machine_readable(self) -> bool {
        !matches!(self, ReportFormat::Console)
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReportFormat::Console => "console",
            ReportFormat::Json => "json",
            ReportFormat::Junit => "junit",
        })
    }
}

// ============================================================================
// MESSAGES
// ============================================================================

/// Everything a worker needs to start its share of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadInstruction {
    pub program: PathBuf,
    pub fuzz: u32,
    pub seed: u64,
    pub processes: usize,
    /// Starting offset; this worker claims `index, index + processes, …`.
    pub index: usize,
    pub report: ReportFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRequest {
    /// Milliseconds since the run started.
    pub duration: u64,
    pub failures: usize,
    pub todos: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisorMessage {
    #[serde(alias = "TEST")]
    Load(LoadInstruction),
    Summary(SummaryRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    Begin {
        #[serde(rename = "testCount")]
        test_count: usize,
        message: Value,
    },
    Results {
        #[serde(with = "indexed")]
        results: BTreeMap<usize, Value>,
    },
    Finished {
        #[serde(default, with = "indexed")]
        results: BTreeMap<usize, Value>,
    },
    Summary {
        message: Value,
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
    Error {
        message: String,
    },
}

impl WorkerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Begin { .. } => "BEGIN",
            WorkerMessage::Results { .. } => "RESULTS",
            WorkerMessage::Finished { .. } => "FINISHED",
            WorkerMessage::Summary { .. } => "SUMMARY",
            WorkerMessage::Error { .. } => "ERROR",
        }
    }
}

/// Result maps travel as JSON objects keyed by decimal index strings.
mod indexed {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(results: &BTreeMap<usize, Value>, serializer: S) -> Result<S::Ok, S::Error> {
        results.serialize(serializer)
    }

    // Tagged enums buffer their content, which loses the ability to read
    // integer keys straight from strings.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<usize, Value>, D::Error> {
        BTreeMap::<String, Value>::deserialize(deserializer)?
            .into_iter()
            .map(|(key, value)| {
                key.parse::<usize>()
                    .map(|index| (index, value))
                    .map_err(|_| D::Error::custom(format!("invalid test index `{key}`")))
            })
            .collect()
    }
}

// ============================================================================
// FRAMING
// ============================================================================

/// Write one newline-terminated frame and flush.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize + ?Sized,
{
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads newline-delimited frames from a byte stream.
pub struct FrameReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// The next frame as untyped JSON; `None` once the stream closes.
    pub async fn next_value(&mut self) -> Result<Option<Value>, ProtocolError> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(&line)?));
        }
        Ok(None)
    }

    /// The next frame decoded as `T`.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        match self.next_value().await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}
