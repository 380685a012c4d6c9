//! Watch mode file-system events
//!
//! Bridges `notify`'s callback into a Tokio channel and turns raw events into
//! the `added` / `changed` / `removed` events the rerun loop queues up.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::discovery::is_ignored;

/// Events arriving within this window after the first one are batched into one rerun.
pub const BATCH_DELAY: Duration = Duration::from_millis(200);

#[cfg(windows)]
pub const CLEAR_SCREEN: &str = "\x1B[2J\x1B[0f";
#[cfg(not(windows))]
pub const CLEAR_SCREEN: &str = "\x1B[2J\x1B[3J\x1B[H";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeKind {
    Added,
    Changed,
    Removed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Added => "added",
            ChangeKind::Changed => "changed",
            ChangeKind::Removed => "removed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: ChangeKind,
    /// Relative to the project root when possible.
    pub path: PathBuf,
}

/// Watches `elm.json` and the source directories of a project.
pub struct TestWatcher {
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<FileEvent>,
}

impl TestWatcher {
    /// Start watching. Paths that do not exist yet are skipped.
    pub fn new(root_dir: &Path, source_dirs: &[PathBuf]) -> notify::Result<Self> {
        let (tx, events) = mpsc::unbounded_channel();
        let root = root_dir.to_path_buf();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for file_event in classify(&event, &root) {
                    let _ = tx.send(file_event);
                }
            }
            Err(e) => eprintln!("Watcher error: {e}"),
        })?;

        let elm_json = root_dir.join("elm.json");
        if elm_json.exists() {
            watcher.watch(&elm_json, RecursiveMode::NonRecursive)?;
        }
        for dir in source_dirs {
            if dir.exists() {
                watcher.watch(dir, RecursiveMode::Recursive)?;
            } else {
                tracing::debug!(dir = %dir.display(), "not watching missing directory");
            }
        }

        Ok(Self {
            _watcher: watcher,
            events,
        })
    }

    /// Wait for the next event.
    pub async fn next(&mut self) -> Option<FileEvent> {
        self.events.recv().await
    }

    /// Everything queued since the last call, without waiting.
    pub fn drain(&mut self) -> Vec<FileEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

fn is_relevant(path: &Path) -> bool {
    if is_ignored(path) {
        return false;
    }
    let is_elm = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("elm"));
    is_elm || path.file_name().is_some_and(|name| name == "elm.json")
}

/// Translate one `notify` event.
pub fn classify(event: &Event, root_dir: &Path) -> Vec<FileEvent> {
    let relative = |path: &PathBuf| path.strip_prefix(root_dir).unwrap_or(path).to_path_buf();
    let make = |kind: ChangeKind, path: &PathBuf| FileEvent {
        kind,
        path: relative(path),
    };

    let events: Vec<FileEvent> = match &event.kind {
        // A new directory may bring a whole tree of test files with it.
        EventKind::Create(CreateKind::Folder) => {
            return event
                .paths
                .iter()
                .map(|p| make(ChangeKind::Added, p))
                .filter(|e| !is_ignored(&e.path))
                .collect();
        }
        EventKind::Create(_) => event.paths.iter().map(|p| make(ChangeKind::Added, p)).collect(),
        EventKind::Remove(_) => event.paths.iter().map(|p| make(ChangeKind::Removed, p)).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.iter().map(|p| make(ChangeKind::Removed, p)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().map(|p| make(ChangeKind::Added, p)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to] => vec![make(ChangeKind::Removed, from), make(ChangeKind::Added, to)],
            _ => Vec::new(),
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => event.paths.iter().map(|p| make(ChangeKind::Changed, p)).collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    };
    events.into_iter().filter(|e| is_relevant(&e.path)).collect()
}

/// `"src/Main.elm changed. Rebuilding!"` or `"3 files added/changed. Rebuilding!"`
pub fn watcher_event_message(queue: &[FileEvent]) -> String {
    const SUFFIX: &str = ". Rebuilding!";

    let mut paths: Vec<&Path> = Vec::new();
    for event in queue {
        if !paths.contains(&event.path.as_path()) {
            paths.push(&event.path);
        }
    }
    if let ([_], Some(first)) = (paths.as_slice(), queue.first()) {
        return format!("{} {}{SUFFIX}", first.path.display(), first.kind);
    }

    let mut kinds: Vec<ChangeKind> = queue.iter().map(|e| e.kind).collect();
    kinds.sort();
    kinds.dedup();
    let kinds: Vec<String> = kinds.iter().map(ToString::to_string).collect();
    format!("{} files {}{SUFFIX}", paths.len(), kinds.join("/"))
}

/// When only existing files changed, the resolved file list is still valid.
pub fn only_changed(queue: &[FileEvent]) -> bool {
    !queue.is_empty() && queue.iter().all(|e| e.kind == ChangeKind::Changed)
}
