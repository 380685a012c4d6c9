#![forbid(unsafe_code)]
//! Parallel Elm test runner
//!
//! Finds candidate tests in Elm test modules, hands the compiled test program
//! to a pool of worker processes, and merges their results into one ordered
//! report (console, JSON or JUnit).
//!
//! - `scanner` / `discovery`: which files are test modules and what they expose
//! - `supervisor` / `worker`: the process pool and its wire protocol
//! - `watch`: rerunning on file changes
//! - `cli`: the `elm-test` binary
//!
//! ## Panic Policy
//!
//! This codebase follows explicit error handling:
//!
//! - **Production code**: Use `Result` or `Option` with `?` / `ok_or` / `map_err`. The `cli` module enforces
//!   `#![deny(clippy::unwrap_used)]`.
//!
//! - **Test code**: `.unwrap()` and `.expect()` are acceptable in tests.

pub mod cli;
pub mod discovery;
pub mod endpoint;
pub mod protocol;
pub mod scanner;
pub mod supervisor;
pub mod version;
pub mod watch;
pub mod worker;

pub use discovery::{Project, TestModule, find_tests};
pub use protocol::ReportFormat;
pub use scanner::{ExposedNames, ScanError, scan, scan_str};
pub use supervisor::{Supervisor, SupervisorConfig, WorkerLauncher};
