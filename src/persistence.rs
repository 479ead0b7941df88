//! Durable storage for the session registry (§4.4, §6 "Persisted state file").
//!
//! Writes use write-temp-then-rename plus `fsync`, guarded by a cross-process
//! advisory lock via `fs2`, mirroring the daemon lifecycle pattern this repo
//! also uses for its lock file. Reads transparently migrate the legacy
//! `"{tool}::{workdir}"` flat key layout into the current `_sessions`/`_active`
//! schema.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{CoreError, CoreResult};
use crate::fingerprint::fingerprint;
use crate::session::{ActiveSelection, SessionRecord};

/// The on-disk document shape (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedState {
    #[serde(rename = "_sessions")]
    pub sessions: HashMap<String, SessionRecord>,
    #[serde(rename = "_active")]
    pub active: Option<ActiveSelection>,
}

/// One entry under the legacy `"{tool}::{workdir}"` key layout.
#[derive(Debug, Clone, Deserialize)]
struct LegacyEntry {
    tool: String,
    workdir: String,
    #[serde(default)]
    resume_token: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    updated_at: u64,
}

fn migrate_legacy(value: serde_json::Value) -> CoreResult<PersistedState> {
    let serde_json::Value::Object(map) = value else {
        return Ok(PersistedState::default());
    };
    let mut sessions = HashMap::new();
    for (key, entry_value) in map {
        if key == "_active" {
            continue;
        }
        let Ok(entry) = serde_json::from_value::<LegacyEntry>(entry_value) else {
            continue;
        };
        let id = fingerprint(&entry.tool, &entry.workdir);
        sessions.insert(
            id.clone(),
            SessionRecord {
                id,
                tool: entry.tool,
                workdir: entry.workdir,
                resume_token: entry.resume_token,
                name: entry.name,
                summary: entry.summary,
                updated_at: entry.updated_at,
            },
        );
    }
    Ok(PersistedState {
        sessions,
        active: None,
    })
}

/// Serializes reads and writes of the state file, with a cross-process
/// advisory lock so two controller instances never interleave writes.
pub struct PersistenceStore {
    path: PathBuf,
    io_lock: AsyncMutex<()>,
}

impl PersistenceStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            io_lock: AsyncMutex::new(()),
        }
    }

    pub async fn load(&self) -> CoreResult<PersistedState> {
        let _guard = self.io_lock.lock().await;
        self.load_locked()
    }

    fn load_locked(&self) -> CoreResult<PersistedState> {
        if !self.path.exists() {
            return Ok(PersistedState::default());
        }
        let file = File::open(&self.path)
            .map_err(|e| CoreError::PersistenceError(format!("open state file: {e}")))?;
        file.lock_shared()
            .map_err(|e| CoreError::PersistenceError(format!("lock state file: {e}")))?;
        let bytes = std::fs::read(&self.path);
        let _ = FileExt::unlock(&file);
        let bytes = bytes.map_err(|e| CoreError::PersistenceError(format!("read state file: {e}")))?;

        if bytes.is_empty() {
            return Ok(PersistedState::default());
        }
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::PersistenceError(format!("parse state file: {e}")))?;

        if value.get("_sessions").is_some() {
            serde_json::from_value(value)
                .map_err(|e| CoreError::PersistenceError(format!("decode state file: {e}")))
        } else {
            migrate_legacy(value)
        }
    }

    /// Persist `state`, never leaving a partially-written file (§3 invariant
    /// "Persisted state is never partially written").
    pub async fn save(&self, state: &PersistedState) -> CoreResult<()> {
        let _guard = self.io_lock.lock().await;
        self.save_locked(state)
    }

    fn save_locked(&self, state: &PersistedState) -> CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::PersistenceError(format!("create state dir: {e}")))?;
        }

        let lock_path = self.path.with_extension("lock");
        // truncate(false): never wipe an existing lock file's contents
        // before the exclusive lock is actually acquired.
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| CoreError::PersistenceError(format!("open lock file: {e}")))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| CoreError::PersistenceError(format!("acquire state lock: {e}")))?;

        let result = (|| -> std::io::Result<()> {
            let tmp_path = self.path.with_extension("tmp");
            let json = serde_json::to_vec_pretty(state)
                .map_err(|e| std::io::Error::other(format!("encode state: {e}")))?;
            {
                let mut tmp = File::create(&tmp_path)?;
                tmp.write_all(&json)?;
                tmp.sync_all()?;
            }
            std::fs::rename(&tmp_path, &self.path)?;
            if let Some(parent) = self.path.parent() {
                if let Ok(dir) = File::open(parent) {
                    let _ = dir.sync_all();
                }
            }
            Ok(())
        })();

        let _ = FileExt::unlock(&lock_file);
        result.map_err(|e| CoreError::PersistenceError(format!("write state file: {e}")))
    }
}
