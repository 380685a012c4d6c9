//! Test discovery
//!
//! Maps test files to module names via the project's source directories and
//! scans each file for candidate test names. Everything here runs before any
//! worker is spawned; the first error aborts the run.

use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use glob::MatchOptions;
use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use walkdir::WalkDir;

use crate::scanner::{self, ExposedNames, ScanError};

/// Directory names never searched for tests.
pub const IGNORED_DIRS: [&str; 2] = ["elm-stuff", "node_modules"];

#[derive(Debug, Error, Diagnostic)]
pub enum DiscoveryError {
    #[error("This file:\n\n{}\n\n…matches no source directory! Imports won't work then.", .path.display())]
    #[diagnostic(
        code(discovery::missing_source_directory),
        help(
            "Move it to tests/ in your project root, or make sure it is covered by \"source-directories\" in your elm.json."
        )
    )]
    MissingSourceDirectory { path: PathBuf },

    #[error(
        "This file:\n\n{}\n\n…matches more than one source directory:\n\n{}",
        .path.display(),
        display_lines(.matches)
    )]
    #[diagnostic(code(discovery::multiple_source_directories))]
    MultipleSourceDirectories {
        path: PathBuf,
        matches: Vec<PathBuf>,
        #[help]
        help: Option<String>,
    },

    #[error(
        "This file:\n\n{}\n\n…located in this directory:\n\n{}\n\n…is problematic. Trying to construct a module name from the parts after the directory gives:\n\n{module_name}",
        .path.display(),
        .source_dir.display()
    )]
    #[diagnostic(
        code(discovery::bad_module_name),
        help(
            "…but module names need to look like for example:\n\nMain\nHttp.Helpers\n\nMake sure that all parts start with an uppercase letter and don't contain any spaces or anything like that."
        )
    )]
    BadModuleName {
        path: PathBuf,
        source_dir: PathBuf,
        module_name: String,
    },

    #[error("This file is problematic:\n\n{}\n\n{source}", .path.display())]
    #[diagnostic(code(discovery::scan))]
    Problematic {
        path: PathBuf,
        #[source]
        source: ScanError,
    },

    #[error("{message}")]
    #[diagnostic(code(discovery::no_files_found))]
    NoFilesFound { message: String },

    #[error("scanning was interrupted: {0}")]
    Interrupted(#[from] tokio::task::JoinError),
}

impl DiscoveryError {
    /// Full user-facing text: the problem followed by the remediation hint.
    pub fn report(&self) -> String {
        match self.help() {
            Some(help) => format!("{self}\n\n{help}"),
            None => self.to_string(),
        }
    }
}

fn display_lines(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// PROJECT LAYOUT
// ============================================================================

/// Where the tests live and which directories the compiler resolves imports from.
#[derive(Debug, Clone)]
pub struct Project {
    pub root_dir: PathBuf,
    /// Absolute source directories, `tests/` included.
    pub source_dirs: Vec<PathBuf>,
}

/// A test file with its module name resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub module_name: String,
    pub source_dir: PathBuf,
}

/// A scanned test module, ready to be handed to the compiler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestModule {
    pub module_name: String,
    pub path: PathBuf,
    pub possibly_tests: ExposedNames,
}

impl Project {
    pub fn new(root_dir: impl Into<PathBuf>, source_dirs: Vec<PathBuf>) -> Self {
        let root_dir = root_dir.into();
        let source_dirs = source_dirs
            .into_iter()
            .map(|dir| if dir.is_absolute() { dir } else { root_dir.join(dir) })
            .collect();
        Self { root_dir, source_dirs }
    }

    pub fn tests_dir(&self) -> PathBuf {
        self.root_dir.join("tests")
    }

    /// Find the single source directory containing `path` and derive the module name.
    pub fn resolve_source_file(&self, path: &Path) -> Result<SourceFile, DiscoveryError> {
        let matches: Vec<&PathBuf> = self
            .source_dirs
            .iter()
            .filter(|dir| path != dir.as_path() && path.starts_with(dir))
            .collect();

        let source_dir = match matches.as_slice() {
            [] => {
                return Err(DiscoveryError::MissingSourceDirectory {
                    path: path.to_path_buf(),
                });
            }
            [single] => (*single).clone(),
            _ => {
                let tests_dir = self.tests_dir();
                let mut help = "Edit \"source-directories\" in your elm.json and try to make it so no source directory contains another source directory!".to_string();
                if matches.iter().any(|dir| **dir == tests_dir) {
                    help.push_str("\n\nNote: The tests/ folder counts as a source directory too (even if it isn't listed in your elm.json)!");
                }
                return Err(DiscoveryError::MultipleSourceDirectories {
                    path: path.to_path_buf(),
                    matches: matches.into_iter().cloned().collect(),
                    help: Some(help),
                });
            }
        };

        let relative = path.strip_prefix(&source_dir).unwrap_or(path).with_extension("");
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let module_name = parts.join(".");

        if !parts.iter().all(|part| scanner::is_upper_name(part)) {
            return Err(DiscoveryError::BadModuleName {
                path: path.to_path_buf(),
                source_dir,
                module_name,
            });
        }

        Ok(SourceFile {
            path: path.to_path_buf(),
            module_name,
            source_dir,
        })
    }
}

// ============================================================================
// SCANNING
// ============================================================================

fn scan_file(path: &Path) -> Result<ExposedNames, ScanError> {
    let file = File::open(path)?;
    scanner::scan(file)
}

/// Resolve and scan every test file.
///
/// Module names are all checked up front; files are then scanned concurrently.
/// The result keeps the order of `files`.
#[tracing::instrument(skip_all, fields(files = files.len()))]
pub async fn find_tests(files: &[PathBuf], project: &Project) -> Result<Vec<TestModule>, DiscoveryError> {
    let sources = files
        .iter()
        .map(|path| project.resolve_source_file(path))
        .collect::<Result<Vec<_>, _>>()?;

    let mut slots: Vec<Option<TestModule>> = vec![None; sources.len()];
    let mut scans = JoinSet::new();
    for (slot, source) in sources.into_iter().enumerate() {
        scans.spawn_blocking(move || {
            let scanned = scan_file(&source.path);
            (slot, source, scanned)
        });
    }

    while let Some(joined) = scans.join_next().await {
        let (slot, source, scanned) = joined?;
        let possibly_tests = scanned.map_err(|source_err| DiscoveryError::Problematic {
            path: source.path.clone(),
            source: source_err,
        })?;
        tracing::debug!(module = %source.module_name, ?possibly_tests, "scanned");
        slots[slot] = Some(TestModule {
            module_name: source.module_name,
            path: source.path,
            possibly_tests,
        });
    }

    Ok(slots.into_iter().flatten().collect())
}

// ============================================================================
// FILE RESOLUTION
// ============================================================================

/// Whether any component of `path` is one of [`IGNORED_DIRS`].
pub(crate) fn is_ignored(path: &Path) -> bool {
    path.components()
        .any(|c| IGNORED_DIRS.iter().any(|ignored| c.as_os_str() == *ignored))
}

/// Recursively collect `*.elm` files below `dir`.
pub fn find_elm_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !IGNORED_DIRS.iter().any(|ignored| entry.file_name() == *ignored)
        })
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("elm"))
        })
        .map(|entry| entry.into_path())
        .collect()
}

fn resolve_pattern(pattern: &Path) -> Vec<PathBuf> {
    let options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::new()
    };
    let Ok(entries) = glob::glob_with(&pattern.to_string_lossy(), options) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|path| !is_ignored(path))
        .flat_map(|path| if path.is_dir() { find_elm_files(&path) } else { vec![path] })
        .collect()
}

/// Turn command-line arguments into a sorted, de-duplicated list of test files.
///
/// Existing directories are searched recursively, existing files are used
/// as-is, and anything else is treated as a glob relative to the project root.
/// No arguments means the `tests/` directory.
pub fn resolve_globs(args: &[String], root_dir: &Path) -> Vec<PathBuf> {
    let defaults = [root_dir.join("tests").to_string_lossy().into_owned()];
    let args: &[String] = if args.is_empty() { &defaults } else { args };

    let mut files = BTreeSet::new();
    for arg in args {
        let candidate = root_dir.join(arg);
        match std::fs::metadata(&candidate) {
            Ok(meta) if meta.is_dir() => files.extend(find_elm_files(&candidate)),
            Ok(_) => {
                files.insert(candidate);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => files.extend(resolve_pattern(&candidate)),
            Err(e) => tracing::debug!(path = %candidate.display(), error = %e, "skipping unreadable argument"),
        }
    }
    files.into_iter().collect()
}

/// The error shown when [`resolve_globs`] comes back empty.
pub fn no_files_found(root_dir: &Path, args: &[String]) -> DiscoveryError {
    let message = if args.is_empty() {
        let tests_dir = root_dir.join("tests");
        let problem = match std::fs::metadata(&tests_dir) {
            Ok(meta) if meta.is_dir() => "No .elm files found in the tests/ directory.".to_string(),
            Ok(_) => format!(
                "Expected a directory but found something else at: {}\nCheck it out! Could you remove it?",
                tests_dir.display()
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => "The tests/ directory does not exist.".to_string(),
            Err(e) => format!("Failed to read the tests/ directory: {e}"),
        };
        format!(
            "{problem}\n\nTo generate some initial tests to get things going: elm-test init\n\nAlternatively, if your project has tests in a different directory,\ntry calling elm-test with a glob such as: elm-test \"src/**/*Tests.elm\""
        )
    } else {
        format!(
            "No files found matching:\n\n{}\n\nAre the above patterns correct? Maybe try running elm-test with no arguments?",
            args.join("\n")
        )
    };
    DiscoveryError::NoFilesFound { message }
}

// ============================================================================
// TESTS
// ============================================================================
