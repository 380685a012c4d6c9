//! Source scanner
//!
//! Finds the names a test module exposes that could possibly be tests, without
//! running the compiler. Two small state machines are chained over the input:
//!
//! ```text
//! bytes ──► UTF-8 decode ──► Tokenizer ──► HeaderParser ──► ExposedNames
//! ```
//!
//! Input is consumed in chunks and scanning stops as soon as the exposing list
//! closes, so large files are never read in full.
//!
//! String and character literals are not recognised. A comment marker inside a
//! literal that appears before the exposing list closes will confuse the
//! tokenizer; in practice headers never contain literals.

pub mod header;
pub mod tokens;

use std::io::{self, Read};

use serde::{Serialize, Serializer};
use thiserror::Error;

pub use header::{HeaderParser, ModuleKind, Step};
pub use tokens::{Token, Tokenizer};

const CHUNK_SIZE: usize = 8 * 1024;

/// Candidate test names found in one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExposedNames {
    /// `exposing (..)`: every top-level lowercase value may be a test.
    All,
    /// An explicit list, already filtered down to lowercase names.
    Listed(Vec<String>),
}

impl ExposedNames {
    pub fn none() -> Self {
        ExposedNames::Listed(Vec::new())
    }

    /// Build the result from raw comma-separated entries of an exposing list.
    pub(crate) fn from_entries(entries: Vec<String>) -> Self {
        let entries: Vec<String> = entries
            .into_iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();

        if entries.len() == 1 && entries[0] == ".." {
            return ExposedNames::All;
        }

        let mut names = Vec::new();
        for entry in entries {
            if !starts_lowercase(&entry) {
                continue;
            }
            // `circle(..)` and friends: a value cannot export constructors.
            if !entry.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return ExposedNames::none();
            }
            names.push(entry);
        }
        ExposedNames::Listed(names)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ExposedNames::Listed(names) if names.is_empty())
    }
}

impl Serialize for ExposedNames {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ExposedNames::All => serializer.serialize_str("all"),
            ExposedNames::Listed(names) => names.serialize(serializer),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("could not read source: {0}")]
    Io(#[from] io::Error),

    #[error("source is not valid UTF-8")]
    InvalidUtf8,

    #[error(
        "It starts with `effect module`. Effect modules can only exist inside src/ in elm and elm-explorations packages. They cannot contain tests."
    )]
    EffectModule,
}

fn starts_lowercase(name: &str) -> bool {
    name.chars().next().is_some_and(char::is_lowercase)
}

/// `Main`, `Http_2`, `Ärger`
pub fn is_upper_name(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if first.is_uppercase() => chars.all(|c| c.is_alphanumeric() || c == '_'),
        _ => false,
    }
}

/// Dot-separated upper names, e.g. `Http.Helpers`.
pub fn is_module_name(name: &str) -> bool {
    name.split('.').all(is_upper_name)
}

// ============================================================================
// ENTRY POINTS
// ============================================================================

/// Scan a stream of module source.
pub fn scan<R: Read>(mut reader: R) -> Result<ExposedNames, ScanError> {
    let mut tokenizer = Tokenizer::new();
    let mut parser = HeaderParser::new();
    let mut tokens = Vec::new();
    let mut chunk = [0u8; CHUNK_SIZE];
    // Bytes of a code point split across two reads.
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let read = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        pending.extend_from_slice(&chunk[..read]);

        let valid = match std::str::from_utf8(&pending) {
            Ok(text) => text.len(),
            Err(e) if e.error_len().is_some() => return Err(ScanError::InvalidUtf8),
            Err(e) => e.valid_up_to(),
        };
        let text = std::str::from_utf8(&pending[..valid]).map_err(|_| ScanError::InvalidUtf8)?;
        for c in text.chars() {
            tokenizer.push(c, &mut tokens);
        }
        if let Some(exposed) = drain_tokens(&mut parser, &mut tokens)? {
            return Ok(exposed);
        }
        pending.drain(..valid);
    }

    if !pending.is_empty() {
        return Err(ScanError::InvalidUtf8);
    }

    tokenizer.finish(&mut tokens);
    if let Some(exposed) = drain_tokens(&mut parser, &mut tokens)? {
        return Ok(exposed);
    }
    Ok(parser.finish())
}

/// Scan an in-memory module.
#[tracing::instrument(skip_all, fields(source_len = source.len()))]
pub fn scan_str(source: &str) -> Result<ExposedNames, ScanError> {
    scan(source.as_bytes())
}

fn drain_tokens(parser: &mut HeaderParser, tokens: &mut Vec<Token>) -> Result<Option<ExposedNames>, ScanError> {
    for token in tokens.drain(..) {
        if let Step::Done(exposed) = parser.feed(token)? {
            return Ok(Some(exposed));
        }
    }
    Ok(None)
}

// ============================================================================
// TESTS
// ============================================================================
