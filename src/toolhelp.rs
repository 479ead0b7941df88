//! Tool-help cache (§6 "Tool-help cache").
//!
//! Caches the output of a tool's `help_cmd_template` invocation so repeated
//! requests for the same tool's help text don't respawn the subprocess. Uses
//! the same write-temp-then-rename-under-an-advisory-lock discipline as
//! `persistence.rs`, keyed by tool name instead of session id, with no
//! legacy format to migrate.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{CoreError, CoreResult};
use crate::session::now_ms;

/// One cached entry (§6 schema: `{tool, content, updated_at}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolHelpEntry {
    pub tool: String,
    pub content: String,
    pub updated_at: u64,
}

/// `{ <tool_name>: ToolHelpEntry }` on disk.
type ToolHelpDocument = HashMap<String, ToolHelpEntry>;

/// Durable cache of in-tool help text, updated whenever a caller requests
/// `help_cmd_template` output for a tool not already cached.
pub struct ToolHelpCache {
    path: PathBuf,
    io_lock: AsyncMutex<()>,
}

impl ToolHelpCache {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            io_lock: AsyncMutex::new(()),
        }
    }

    fn load_locked(&self) -> CoreResult<ToolHelpDocument> {
        if !self.path.exists() {
            return Ok(ToolHelpDocument::default());
        }
        let bytes = std::fs::read(&self.path)
            .map_err(|e| CoreError::PersistenceError(format!("read toolhelp cache: {e}")))?;
        if bytes.is_empty() {
            return Ok(ToolHelpDocument::default());
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::PersistenceError(format!("parse toolhelp cache: {e}")))
    }

    fn save_locked(&self, doc: &ToolHelpDocument) -> CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::PersistenceError(format!("create toolhelp dir: {e}")))?;
        }

        let lock_path = self.path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| CoreError::PersistenceError(format!("open toolhelp lock: {e}")))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| CoreError::PersistenceError(format!("acquire toolhelp lock: {e}")))?;

        let result = (|| -> std::io::Result<()> {
            let tmp_path = self.path.with_extension("tmp");
            let json = serde_json::to_vec_pretty(doc)
                .map_err(|e| std::io::Error::other(format!("encode toolhelp cache: {e}")))?;
            {
                let mut tmp = File::create(&tmp_path)?;
                tmp.write_all(&json)?;
                tmp.sync_all()?;
            }
            std::fs::rename(&tmp_path, &self.path)
        })();

        let _ = FileExt::unlock(&lock_file);
        result.map_err(|e| CoreError::PersistenceError(format!("write toolhelp cache: {e}")))
    }

    /// Return the cached help text for `tool`, running `fetch` to populate
    /// the cache on a miss. `fetch` is only invoked once per miss; its
    /// result is persisted before being returned.
    pub async fn get_or_refresh<F, Fut>(&self, tool: &str, fetch: F) -> CoreResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<String>>,
    {
        let _guard = self.io_lock.lock().await;
        let mut doc = self.load_locked()?;
        if let Some(entry) = doc.get(tool) {
            return Ok(entry.content.clone());
        }

        let content = fetch().await?;
        doc.insert(
            tool.to_string(),
            ToolHelpEntry {
                tool: tool.to_string(),
                content: content.clone(),
                updated_at: now_ms(),
            },
        );
        self.save_locked(&doc)?;
        Ok(content)
    }

    /// Force a fresh fetch regardless of what's cached, replacing the entry.
    pub async fn refresh<F, Fut>(&self, tool: &str, fetch: F) -> CoreResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<String>>,
    {
        let _guard = self.io_lock.lock().await;
        let mut doc = self.load_locked()?;
        let content = fetch().await?;
        doc.insert(
            tool.to_string(),
            ToolHelpEntry {
                tool: tool.to_string(),
                content: content.clone(),
                updated_at: now_ms(),
            },
        );
        self.save_locked(&doc)?;
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_runs_once_then_serves_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ToolHelpCache::new(dir.path().join("toolhelp.json"));
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let content = cache
            .get_or_refresh("codex", || async move {
                calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok("usage: codex ...".to_string())
            })
            .await
            .unwrap();
        assert_eq!(content, "usage: codex ...");

        let calls_clone = calls.clone();
        let cached = cache
            .get_or_refresh("codex", || async move {
                calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok("should not run".to_string())
            })
            .await
            .unwrap();
        assert_eq!(cached, "usage: codex ...");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_overwrites_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ToolHelpCache::new(dir.path().join("toolhelp.json"));
        cache
            .get_or_refresh("codex", || async { Ok("v1".to_string()) })
            .await
            .unwrap();
        let refreshed = cache
            .refresh("codex", || async { Ok("v2".to_string()) })
            .await
            .unwrap();
        assert_eq!(refreshed, "v2");
        let cached = cache
            .get_or_refresh("codex", || async { Ok("unused".to_string()) })
            .await
            .unwrap();
        assert_eq!(cached, "v2");
    }
}
