//! Session Manager (C4, §4.4): registry keyed by `(tool, workdir)`, active
//! selection, durable persistence, and restart recovery.
//!
//! The registry lock (a plain [`std::sync::Mutex`]) only ever guards the
//! directory of `id -> Arc<Mutex<Session>>` handles and the active
//! selection, for the duration of a map mutation -- never across an await.
//! Each session's own state (queue, busy flag, driver) is behind its own
//! `tokio::sync::Mutex`, so a long-running dispatch on one session never
//! blocks lookups or dispatch on any other (§5 "registry lock" / "cross-
//! session parallelism").

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::fingerprint::fingerprint;
use crate::persistence::{PersistedState, PersistenceStore};
use crate::session::{
    ActiveSelection, PendingPrompt, Session, SessionObservability, SessionSnapshot, now_ms,
};

pub type HookFn = Arc<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default, Clone)]
pub struct Hooks {
    pub on_create: Option<HookFn>,
    pub on_set_active: Option<HookFn>,
    pub before_close: Option<HookFn>,
    pub after_close: Option<HookFn>,
}

fn run_hook(name: &str, hook: &Option<HookFn>, session_id: &str) {
    if let Some(hook) = hook {
        if let Err(err) = hook(session_id) {
            tracing::warn!(hook = name, session_id, error = %err, "session hook failed");
        }
    }
}

struct Directory {
    sessions: HashMap<String, Arc<AsyncMutex<Session>>>,
    active: Option<ActiveSelection>,
}

pub struct SessionManager {
    config: Arc<Config>,
    store: PersistenceStore,
    directory: StdMutex<Directory>,
    hooks: Hooks,
    /// Notifies the scheduler that a session's queue gained work.
    dispatch_notify: Option<UnboundedSender<String>>,
}

impl SessionManager {
    /// Build an empty manager (no persisted state loaded). Prefer
    /// [`SessionManager::restore`] at process start.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        store: PersistenceStore,
        hooks: Hooks,
        dispatch_notify: Option<UnboundedSender<String>>,
    ) -> Self {
        Self {
            config,
            store,
            directory: StdMutex::new(Directory {
                sessions: HashMap::new(),
                active: None,
            }),
            hooks,
            dispatch_notify,
        }
    }

    /// Load the persistence file, re-hydrating sessions with empty queues
    /// and no drivers; re-validate `_active` against the loaded set (§9
    /// "Restart recovery").
    pub async fn restore(
        config: Arc<Config>,
        store: PersistenceStore,
        hooks: Hooks,
        dispatch_notify: Option<UnboundedSender<String>>,
    ) -> CoreResult<Self> {
        let manager = Self::new(config, store, hooks, dispatch_notify);
        let persisted = manager.store.load().await?;

        let mut sessions = HashMap::new();
        for (id, record) in persisted.sessions {
            let Some(tool_cfg) = manager.config.tool(&record.tool) else {
                tracing::warn!(session_id = %id, tool = %record.tool, "dropping session for unknown tool on restore");
                continue;
            };
            let session = Session::from_record(record, tool_cfg.mode);
            sessions.insert(id, Arc::new(AsyncMutex::new(session)));
        }

        let active = persisted
            .active
            .filter(|a| sessions.contains_key(&a.session_id));

        {
            let mut dir = manager.directory.lock().unwrap();
            dir.sessions = sessions;
            dir.active = active;
        }

        Ok(manager)
    }

    fn handle(&self, id: &str) -> CoreResult<Arc<AsyncMutex<Session>>> {
        self.directory
            .lock()
            .unwrap()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    async fn persist_snapshot(&self) -> CoreResult<()> {
        let (handles, active): (Vec<(String, Arc<AsyncMutex<Session>>)>, Option<ActiveSelection>) = {
            let dir = self.directory.lock().unwrap();
            (
                dir.sessions
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                dir.active.clone(),
            )
        };

        let mut sessions = HashMap::new();
        for (id, handle) in handles {
            let session = handle.lock().await;
            sessions.insert(id, session.to_record());
        }

        self.store
            .save(&PersistedState { sessions, active })
            .await
    }

    /// Create a new session for `(tool, workdir)` (§4.4 `create`).
    pub async fn create(
        &self,
        tool: &str,
        workdir: &str,
        name: Option<String>,
    ) -> CoreResult<SessionSnapshot> {
        let tool_cfg = self
            .config
            .tool(tool)
            .ok_or_else(|| CoreError::UnknownTool(tool.to_string()))?;

        if !std::path::Path::new(workdir).is_absolute() {
            return Err(CoreError::BadWorkdir(workdir.to_string()));
        }

        let id = fingerprint(tool, workdir);
        {
            let dir = self.directory.lock().unwrap();
            if dir.sessions.contains_key(&id) {
                return Err(CoreError::AlreadyExists(id));
            }
        }

        let mut session = Session::new(id.clone(), tool.to_string(), workdir.to_string(), tool_cfg.mode);
        session.name = name;
        let snapshot = SessionSnapshot::from(&session);

        {
            let mut dir = self.directory.lock().unwrap();
            dir.sessions
                .insert(id.clone(), Arc::new(AsyncMutex::new(session)));
        }

        self.persist_snapshot().await?;
        run_hook("create", &self.hooks.on_create, &id);
        Ok(snapshot)
    }

    /// Mark `id` as the active session (§4.4 `set_active`).
    pub async fn set_active(&self, id: &str) -> CoreResult<()> {
        let handle = self.handle(id)?;
        let session = handle.lock().await;
        let selection = ActiveSelection {
            session_id: id.to_string(),
            tool: session.tool.clone(),
            workdir: session.workdir.clone(),
            updated_at: now_ms(),
        };
        drop(session);

        {
            let mut dir = self.directory.lock().unwrap();
            dir.active = Some(selection);
        }
        self.persist_snapshot().await?;
        run_hook("set_active", &self.hooks.on_set_active, id);
        Ok(())
    }

    /// Rename a session (§4.4 `rename`).
    pub async fn rename(&self, id: &str, name: String) -> CoreResult<()> {
        let handle = self.handle(id)?;
        {
            let mut session = handle.lock().await;
            session.name = Some(name);
            session.touch();
        }
        self.persist_snapshot().await
    }

    /// Update the stored resume token (§4.4 `set_resume`).
    pub async fn set_resume(&self, id: &str, token: Option<String>) -> CoreResult<()> {
        let handle = self.handle(id)?;
        {
            let mut session = handle.lock().await;
            session.resume_token = token;
            session.touch();
        }
        self.persist_snapshot().await
    }

    /// Terminate the driver (if any), remove from the registry, persist,
    /// and run the `before_close`/`after_close` hooks (§4.4 `close`).
    pub async fn close(&self, id: &str) -> CoreResult<()> {
        let handle = self.handle(id)?;
        run_hook("before_close", &self.hooks.before_close, id);

        let driver = {
            let mut session = handle.lock().await;
            session.down = true;
            session.driver.take()
        };
        if let Some(driver) = driver {
            driver.close().await;
        }

        {
            let mut dir = self.directory.lock().unwrap();
            dir.sessions.remove(id);
            if dir.active.as_ref().is_some_and(|a| a.session_id == id) {
                dir.active = None;
            }
        }

        self.persist_snapshot().await?;
        run_hook("after_close", &self.hooks.after_close, id);
        Ok(())
    }

    /// Snapshot every session (§4.4 `list`).
    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<Arc<AsyncMutex<Session>>> = {
            let dir = self.directory.lock().unwrap();
            dir.sessions.values().cloned().collect()
        };
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let session = handle.lock().await;
            out.push(SessionSnapshot::from(&*session));
        }
        out
    }

    /// Publish the §6 observability surface for one session.
    pub async fn observe(&self, id: &str) -> CoreResult<SessionObservability> {
        let handle = self.handle(id)?;
        let session = handle.lock().await;
        Ok(SessionObservability::from(&*session))
    }

    /// Publish the §6 observability surface for every session.
    pub async fn observe_all(&self) -> Vec<SessionObservability> {
        let handles: Vec<Arc<AsyncMutex<Session>>> = {
            let dir = self.directory.lock().unwrap();
            dir.sessions.values().cloned().collect()
        };
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let session = handle.lock().await;
            out.push(SessionObservability::from(&*session));
        }
        out
    }

    /// Append a prompt to a session's queue, persist, and notify the
    /// scheduler that it may have work to dispatch (§4.4 `enqueue`).
    ///
    /// Rejects with [`CoreError::QueueFull`] once the session's queue holds
    /// `queue.max_per_session` entries, without touching persisted state
    /// (§4.5 "Back-pressure", §8 boundary behavior).
    pub async fn enqueue(&self, id: &str, prompt: PendingPrompt) -> CoreResult<()> {
        let handle = self.handle(id)?;
        {
            let mut session = handle.lock().await;
            if session.down {
                return Err(CoreError::Closed(id.to_string()));
            }
            if session.queue.len() >= self.config.queue.max_per_session {
                return Err(CoreError::QueueFull);
            }
            session.queue.push_back(prompt);
            session.touch();
        }
        self.persist_snapshot().await?;
        if let Some(tx) = &self.dispatch_notify {
            let _ = tx.send(id.to_string());
        }
        Ok(())
    }

    #[must_use]
    pub fn session_handle(&self, id: &str) -> Option<Arc<AsyncMutex<Session>>> {
        self.directory.lock().unwrap().sessions.get(id).cloned()
    }

    #[must_use]
    pub fn active_session_id(&self) -> Option<String> {
        self.directory
            .lock()
            .unwrap()
            .active
            .as_ref()
            .map(|a| a.session_id.clone())
    }

    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }
}
