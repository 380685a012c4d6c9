//! elm-test runner version information.
//!
//! The value is taken from Cargo metadata (`CARGO_PKG_VERSION`) at compile time
//! and shared by the CLI `--version` flag and the console report headline.

/// The runner version string (for example, `0.1.0`).
pub const ELM_TEST_VERSION: &str = env!("CARGO_PKG_VERSION");
