//! Device directory watcher
//!
//! Turns file system notifications for the input directory into
//! [`DeviceFileEvent`]s. The notification backend is installed before the
//! startup scan so nothing that appears in between is missed; files seen
//! twice are filtered out by the registry.

use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use statum::{machine, state};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A candidate device file appeared or disappeared, by file name
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeviceFileEvent {
    Appeared(String),
    Disappeared(String),
}

impl DeviceFileEvent {
    pub fn name(&self) -> &str {
        match self {
            DeviceFileEvent::Appeared(name) | DeviceFileEvent::Disappeared(name) => name,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Failed to watch device directory: {0}")]
    Watch(String),

    #[error("Failed to scan device directory: {0}")]
    Scan(String),
}

impl From<notify::Error> for WatchError {
    fn from(e: notify::Error) -> Self {
        WatchError::Watch(e.to_string())
    }
}

// Watcher lifecycle: the startup scan runs exactly once
#[state]
#[derive(Debug, Clone)]
pub enum WatchState {
    Scanning,
    Watching,
}

#[machine]
pub struct DeviceWatcher<S: WatchState> {
    directory: PathBuf,
    prefix: String,
    events: mpsc::UnboundedSender<DeviceFileEvent>,
    // Dropping the backend stops notifications
    backend: RecommendedWatcher,
}

impl<S: WatchState> DeviceWatcher<S> {
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl DeviceWatcher<Scanning> {
    /// Starts watching `directory` for files whose name begins with `prefix`
    pub fn create(
        directory: impl Into<PathBuf>,
        prefix: &str,
        events: mpsc::UnboundedSender<DeviceFileEvent>,
    ) -> Result<Self, WatchError> {
        let directory = directory.into();
        let sender = events.clone();
        let filter = prefix.to_string();

        let mut backend = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    warn!("Device directory notification error: {}", e);
                    return;
                }
            };
            for file_event in classify(&event, &filter) {
                debug!("Device file event: {:?}", file_event);
                if sender.send(file_event).is_err() {
                    debug!("Registry gone, dropping device file event");
                }
            }
        })?;
        backend.watch(&directory, RecursiveMode::NonRecursive)?;
        info!("Watching {} for input devices", directory.display());

        Ok(Self::new(directory, prefix.to_string(), events, backend))
    }

    /// Announces every candidate file already present, then keeps watching
    pub fn scan(self) -> Result<DeviceWatcher<Watching>, WatchError> {
        let entries = std::fs::read_dir(&self.directory)
            .map_err(|e| WatchError::Scan(format!("{}: {}", self.directory.display(), e)))?;

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| candidate_name(&entry.path(), &self.prefix))
            .collect();
        names.sort();

        info!(
            "Found {} candidate device file(s) in {}",
            names.len(),
            self.directory.display()
        );
        for name in names {
            if self.events.send(DeviceFileEvent::Appeared(name)).is_err() {
                return Err(WatchError::Scan("registry channel closed".into()));
            }
        }

        Ok(self.transition())
    }
}

/// File name of `path` if it names a candidate device file
pub fn candidate_name(path: &Path, prefix: &str) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    name.starts_with(prefix).then(|| name.to_string())
}

/// Maps one notification to device file events
///
/// Metadata changes count as appearances: udev fixes up permissions right
/// after creating a node, and only then can the file be opened.
pub fn classify(event: &Event, prefix: &str) -> Vec<DeviceFileEvent> {
    let names = || {
        event
            .paths
            .iter()
            .filter_map(|path| candidate_name(path, prefix))
    };

    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event
            .paths
            .iter()
            .enumerate()
            .filter_map(|(index, path)| {
                candidate_name(path, prefix).map(|name| match index {
                    0 => DeviceFileEvent::Disappeared(name),
                    _ => DeviceFileEvent::Appeared(name),
                })
            })
            .collect(),
        EventKind::Create(_)
        | EventKind::Modify(ModifyKind::Metadata(_))
        | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            names().map(DeviceFileEvent::Appeared).collect()
        }
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            names().map(DeviceFileEvent::Disappeared).collect()
        }
        _ => Vec::new(),
    }
}
