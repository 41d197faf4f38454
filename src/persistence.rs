//! Session persistence across process restarts.
//!
//! Three JSON files live in a caller-chosen folder: `mqtt-session.json`,
//! `subscriptions.json` and `seq-ids.json`. [`SessionStore`] loads them
//! once, keeps the merged [`SessionRecord`] in memory and writes changed
//! parts back through a debounced background writer.
//!
//! Persistence is best effort. Callers log failures and carry on with the
//! in-memory record.

mod record;
mod store;

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

pub use record::{DEFAULT_GRAPHQL_SUBS, DEFAULT_SKYWALKER_SUBS, MqttSession, SeqIds, SessionRecord, Subscriptions};
pub use store::SessionStore;

/// Default debounce window for coalescing writes.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Where and how often the session is written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistenceConfig {
    /// Folder holding the session files.
    pub folder: PathBuf,
    /// Quiet period before pending changes are written.
    pub debounce: Duration,
}

impl PersistenceConfig {
    /// Configuration for `folder` with the default debounce.
    #[must_use]
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    /// Override the debounce window.
    #[must_use]
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

/// Errors raised while reading or writing session files.
#[derive(Clone, Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Filesystem failure.
    #[error("session file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
    /// The file does not hold the expected JSON document.
    #[error("session file {path} is not valid: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: Arc<serde_json::Error>,
    },
    /// The background writer has stopped.
    #[error("session writer is not running")]
    Closed,
}

impl PersistenceError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }
    }

    fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }
    }
}
