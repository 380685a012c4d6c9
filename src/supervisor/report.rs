//! Rendering results for each report format
//!
//! Result payloads are produced by the compiled test program; the reporters
//! only pick out the fields they print.

use std::io::Write;

use serde_json::Value;

use super::junit;
use crate::protocol::{ProtocolError, ReportFormat};

/// Output sink shared by the reporters and the supervisor.
pub type Output = Box<dyn Write + Send>;

/// Receives results in index order.
///
/// Implement this trait to add an output format.
pub trait Reporter: Send {
    /// Called once, for the first `BEGIN` of a run.
    fn on_begin(&mut self, message: &Value) -> Result<(), ProtocolError>;

    /// Called for each result as soon as every earlier index has been printed.
    fn on_result(&mut self, result: &Value) -> Result<(), ProtocolError>;

    /// Called with the program's formatted summary and every result of the run.
    fn on_summary(&mut self, message: Value, results: Vec<Value>) -> Result<(), ProtocolError>;
}

pub fn reporter_for(format: ReportFormat, version: &str, out: Output) -> Box<dyn Reporter> {
    match format {
        ReportFormat::Console => Box::new(ConsoleReporter::new(version, out)),
        ReportFormat::Json => Box::new(JsonReporter { out }),
        ReportFormat::Junit => Box::new(JunitReporter { out }),
    }
}

// ============================================================================
// CONSOLE
// ============================================================================

pub struct ConsoleReporter {
    out: Output,
    headline: String,
    windows_safe: bool,
}

impl ConsoleReporter {
    pub fn new(version: &str, out: Output) -> Self {
        Self {
            out,
            headline: format!("elm-test {version}"),
            windows_safe: cfg!(windows),
        }
    }

    fn print(&mut self, text: &str) -> Result<(), ProtocolError> {
        if self.windows_safe {
            writeln!(self.out, "{}", windowsify(text))?;
        } else {
            writeln!(self.out, "{text}")?;
        }
        Ok(())
    }

    fn print_field(&mut self, result: &Value, field: &str) -> Result<(), ProtocolError> {
        match result.get(field).and_then(Value::as_str) {
            Some(text) => self.print(text),
            None => Err(ProtocolError::BadResult(format!("missing `{field}` in {result}"))),
        }
    }
}

impl Reporter for ConsoleReporter {
    fn on_begin(&mut self, message: &Value) -> Result<(), ProtocolError> {
        let bar = "-".repeat(self.headline.chars().count());
        writeln!(self.out, "\n{}\n{bar}\n", self.headline)?;
        self.on_result(message)
    }

    fn on_result(&mut self, result: &Value) -> Result<(), ProtocolError> {
        let kind = result.get("type").and_then(Value::as_str);
        match kind {
            Some("begin") => self.print_field(result, "output"),
            Some("complete") => match result.get("status").and_then(Value::as_str) {
                Some("pass") => match result.get("distributionReport").and_then(Value::as_str) {
                    Some(report) => self.print(report),
                    None => Ok(()),
                },
                // Todos only show up in the summary.
                Some("todo") => Ok(()),
                Some("fail") => self.print_field(result, "failure"),
                _ => Err(ProtocolError::BadResult(format!("unexpected status in {result}"))),
            },
            Some("summary") => self.print_field(result, "summary"),
            _ => Err(ProtocolError::BadResult(format!("unexpected result type in {result}"))),
        }
    }

    fn on_summary(&mut self, message: Value, _results: Vec<Value>) -> Result<(), ProtocolError> {
        self.on_result(&message)?;
        self.out.flush()?;
        Ok(())
    }
}

// ============================================================================
// JSON
// ============================================================================

/// One compact JSON object per line.
pub struct JsonReporter {
    out: Output,
}

impl Reporter for JsonReporter {
    fn on_begin(&mut self, message: &Value) -> Result<(), ProtocolError> {
        self.on_result(message)
    }

    fn on_result(&mut self, result: &Value) -> Result<(), ProtocolError> {
        serde_json::to_writer(&mut self.out, result)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn on_summary(&mut self, message: Value, _results: Vec<Value>) -> Result<(), ProtocolError> {
        self.on_result(&message)?;
        self.out.flush()?;
        Ok(())
    }
}

// ============================================================================
// JUNIT
// ============================================================================

/// Prints nothing until the summary, then one XML document.
pub struct JunitReporter {
    out: Output,
}

impl Reporter for JunitReporter {
    fn on_begin(&mut self, _message: &Value) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn on_result(&mut self, _result: &Value) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn on_summary(&mut self, message: Value, results: Vec<Value>) -> Result<(), ProtocolError> {
        let document = junit::render(message, results)?;
        self.out.write_all(document.as_bytes())?;
        self.out.flush()?;
        Ok(())
    }
}

/// Replace glyphs that the Windows console cannot show.
pub fn windowsify(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '↓' | '✗' | '►' => '>',
            '╵' | '│' | '╷' | '╹' | '┃' | '╻' => '|',
            '═' => '=',
            '▔' => '-',
            '✔' => '√',
            other => other,
        })
        .collect()
}
