//! Debounced, atomic JSON file store.

use std::{
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    fs,
    io::AsyncWriteExt,
    sync::{mpsc, oneshot},
    time::sleep,
};
use tracing::{debug, warn};

use super::{
    PersistenceConfig,
    PersistenceError,
    record::{Parts, SessionRecord},
};

const MQTT_SESSION_FILE: &str = "mqtt-session.json";
const SUBSCRIPTIONS_FILE: &str = "subscriptions.json";
const SEQ_IDS_FILE: &str = "seq-ids.json";

#[derive(Debug, Default)]
struct State {
    record: SessionRecord,
    dirty: Parts,
}

#[derive(Debug)]
struct Shared {
    folder: PathBuf,
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }
}

enum WriterCommand {
    Dirty,
    Flush(oneshot::Sender<Result<(), PersistenceError>>),
}

/// Durable store for [`SessionRecord`].
///
/// Updates land in memory immediately. A background writer coalesces
/// updates arriving within the debounce window and rewrites only the files
/// whose part changed, each through a `.tmp` file and a rename. All writes
/// happen on that one task, so files are never written concurrently.
///
/// Cloning yields another handle to the same store.
#[derive(Clone, Debug)]
pub struct SessionStore {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<WriterCommand>,
}

impl SessionStore {
    /// Open the store in `config.folder`, creating the folder if needed,
    /// and start the writer task.
    ///
    /// Unreadable or corrupt files are logged and treated as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder cannot be created.
    pub async fn open(config: PersistenceConfig) -> Result<Self, PersistenceError> {
        fs::create_dir_all(&config.folder)
            .await
            .map_err(|source| PersistenceError::io(&config.folder, source))?;
        let record = read_record(&config.folder, true).await?;
        debug!(folder = %config.folder.display(), resumable = record.is_resumable(), "session store opened");
        let shared = Arc::new(Shared {
            folder: config.folder,
            state: Mutex::new(State {
                record,
                dirty: Parts::default(),
            }),
        });
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(Arc::clone(&shared), rx, config.debounce));
        Ok(Self { shared, commands })
    }

    /// Folder holding the session files.
    #[must_use]
    pub fn folder(&self) -> &Path { &self.shared.folder }

    /// Copy of the current record.
    #[must_use]
    pub fn load(&self) -> SessionRecord { self.shared.lock().record.clone() }

    /// Merge `partial` into the record and schedule a write of the changed
    /// parts.
    pub fn save(&self, partial: SessionRecord) {
        let changed = {
            let mut state = self.shared.lock();
            let changed = state.record.merge(partial);
            state.dirty = state.dirty.union(changed);
            changed
        };
        if changed.any() && self.commands.send(WriterCommand::Dirty).is_err() {
            warn!("session writer stopped; update kept in memory only");
        }
    }

    /// Update the broker session part in place.
    pub fn update_mqtt(&self, update: impl FnOnce(&mut super::MqttSession)) {
        let mut mqtt = self.load().mqtt.unwrap_or_default();
        update(&mut mqtt);
        self.save(SessionRecord {
            mqtt: Some(mqtt),
            ..SessionRecord::default()
        });
    }

    /// Whether a sequence id and at least one subscription are stored.
    #[must_use]
    pub fn has_resumable_session(&self) -> bool { self.shared.lock().record.is_resumable() }

    /// Write pending changes now.
    ///
    /// # Errors
    ///
    /// Returns the first write failure, or [`PersistenceError::Closed`] if
    /// the writer task is gone.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(WriterCommand::Flush(tx))
            .map_err(|_| PersistenceError::Closed)?;
        rx.await.map_err(|_| PersistenceError::Closed)?
    }

    /// Re-read every file from disk, replacing the in-memory record and
    /// discarding unwritten changes.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be read or parsed.
    pub async fn reload(&self) -> Result<SessionRecord, PersistenceError> {
        let record = read_record(&self.shared.folder, false).await?;
        let mut state = self.shared.lock();
        state.record = record.clone();
        state.dirty = Parts::default();
        Ok(record)
    }

    /// Forget the record and delete its files.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be removed.
    pub async fn clear(&self) -> Result<(), PersistenceError> {
        {
            let mut state = self.shared.lock();
            state.record = SessionRecord::default();
            state.dirty = Parts::default();
        }
        for name in [MQTT_SESSION_FILE, SUBSCRIPTIONS_FILE, SEQ_IDS_FILE] {
            let path = self.shared.folder.join(name);
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(PersistenceError::io(&path, source)),
            }
        }
        Ok(())
    }
}

async fn run_writer(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<WriterCommand>, debounce: std::time::Duration) {
    while let Some(command) = rx.recv().await {
        let mut waiters = Vec::new();
        match command {
            WriterCommand::Flush(tx) => waiters.push(tx),
            WriterCommand::Dirty => {
                let deadline = sleep(debounce);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        () = &mut deadline => break,
                        next = rx.recv() => match next {
                            Some(WriterCommand::Dirty) => {}
                            Some(WriterCommand::Flush(tx)) => {
                                waiters.push(tx);
                                break;
                            }
                            None => break,
                        },
                    }
                }
            }
        }
        let result = write_pending(&shared).await;
        if let Err(e) = &result {
            log::warn!("failed to persist session: {e}");
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
    // Handles dropped: write whatever is left.
    if let Err(e) = write_pending(&shared).await {
        log::warn!("failed to persist session on shutdown: {e}");
    }
}

async fn write_pending(shared: &Shared) -> Result<(), PersistenceError> {
    let (record, dirty) = {
        let mut state = shared.lock();
        let dirty = std::mem::take(&mut state.dirty);
        (state.record.clone(), dirty)
    };
    if !dirty.any() {
        return Ok(());
    }
    let result = write_parts(&shared.folder, &record, dirty).await;
    if result.is_err() {
        // Keep the parts dirty so the next write retries them.
        let mut state = shared.lock();
        state.dirty = state.dirty.union(dirty);
    }
    result
}

async fn write_parts(folder: &Path, record: &SessionRecord, parts: Parts) -> Result<(), PersistenceError> {
    if parts.mqtt {
        write_json(&folder.join(MQTT_SESSION_FILE), record.mqtt.as_ref()).await?;
    }
    if parts.subscriptions {
        write_json(&folder.join(SUBSCRIPTIONS_FILE), record.subscriptions.as_ref()).await?;
    }
    if parts.seq_ids {
        write_json(&folder.join(SEQ_IDS_FILE), record.seq_ids.as_ref()).await?;
    }
    debug!(?parts, "session persisted");
    Ok(())
}

async fn write_json<T: Serialize>(path: &Path, value: Option<&T>) -> Result<(), PersistenceError> {
    let Some(value) = value else {
        return Ok(());
    };
    let data = serde_json::to_vec_pretty(value).map_err(|source| PersistenceError::json(path, source))?;
    let tmp = path.with_extension("json.tmp");
    let io_err = |source: io::Error| PersistenceError::io(path, source);
    let mut file = fs::File::create(&tmp).await.map_err(io_err)?;
    file.write_all(&data).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    drop(file);
    fs::rename(&tmp, path).await.map_err(io_err)
}

async fn read_record(folder: &Path, lenient: bool) -> Result<SessionRecord, PersistenceError> {
    Ok(SessionRecord {
        mqtt: read_json(&folder.join(MQTT_SESSION_FILE), lenient).await?,
        subscriptions: read_json(&folder.join(SUBSCRIPTIONS_FILE), lenient).await?,
        seq_ids: read_json(&folder.join(SEQ_IDS_FILE), lenient).await?,
    })
}

async fn read_json<T: DeserializeOwned>(path: &Path, lenient: bool) -> Result<Option<T>, PersistenceError> {
    let result = match fs::read(path).await {
        Ok(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| PersistenceError::json(path, source)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(PersistenceError::io(path, source)),
    };
    match result {
        Err(e) if lenient => {
            warn!(error = %e, "ignoring unreadable session file");
            Ok(None)
        }
        other => other,
    }
}
