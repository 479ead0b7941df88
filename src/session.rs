//! Data model entities owned by the Session Manager (§3): `Session`,
//! `PendingPrompt`, and the snapshot types exposed to callers.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::config::ToolMode;
use crate::driver::InteractiveDriver;
use crate::error::CoreResult;

/// What a caller waiting on a dispatched prompt gets back (§6 "For each
/// completed prompt").
#[derive(Debug, Clone)]
pub struct PromptCompletion {
    pub text: String,
    pub bytes_out: usize,
    pub elapsed_ms: u64,
}

/// Monotonic-enough wall-clock timestamp, in milliseconds since the epoch.
/// Used for `updated_at` fields that only need to order events, not measure
/// durations precisely.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A scheduled unit of work targeting one session (§3 `PendingPrompt`).
pub struct PendingPrompt {
    pub text: String,
    pub image_path: Option<String>,
    pub destination: String,
    pub deadline_ms: u64,
    /// Fires when the caller cancels this prompt before it starts.
    pub cancel: Option<oneshot::Receiver<()>>,
    /// Resolved directly to whichever caller is awaiting this specific
    /// prompt (e.g. the RPC bridge), independent of the Output Pipeline's
    /// destination-keyed fan-out.
    pub completion: Option<oneshot::Sender<CoreResult<PromptCompletion>>>,
}

impl PendingPrompt {
    #[must_use]
    pub fn new(text: String, destination: String, deadline_ms: u64) -> Self {
        Self {
            text,
            image_path: None,
            destination,
            deadline_ms,
            cancel: None,
            completion: None,
        }
    }
}

/// What survives a restart for one session (the persisted subset of
/// [`Session`]; mirrors the `_sessions` entry shape in §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub tool: String,
    pub workdir: String,
    #[serde(default)]
    pub resume_token: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    pub updated_at: u64,
}

/// In-memory session state, owned exclusively by the Session Manager.
///
/// The `driver` handle and `queue` are intentionally not part of
/// [`SessionRecord`]: per §9, in-flight queues and live subprocess handles
/// are never recovered across a restart.
pub struct Session {
    pub id: String,
    pub tool: String,
    pub workdir: String,
    pub mode: ToolMode,
    pub resume_token: Option<String>,
    pub name: Option<String>,
    pub summary: Option<String>,
    pub queue: std::collections::VecDeque<PendingPrompt>,
    pub busy: bool,
    pub driver: Option<InteractiveDriver>,
    pub down: bool,
    pub updated_at: u64,
    /// When the most recent prompt was dispatched to this session.
    /// Transient: not part of [`SessionRecord`], reset to `None` on restart.
    pub last_prompt_at: Option<u64>,
    /// Output size and wall-clock time of the most recent *successful*
    /// prompt completion (§6 observability surface).
    pub last_output_bytes: Option<usize>,
    pub elapsed_ms_last: Option<u64>,
}

impl Session {
    #[must_use]
    pub fn new(id: String, tool: String, workdir: String, mode: ToolMode) -> Self {
        Self {
            id,
            tool,
            workdir,
            mode,
            resume_token: None,
            name: None,
            summary: None,
            queue: std::collections::VecDeque::new(),
            busy: false,
            driver: None,
            down: false,
            updated_at: now_ms(),
            last_prompt_at: None,
            last_output_bytes: None,
            elapsed_ms_last: None,
        }
    }

    #[must_use]
    pub fn from_record(record: SessionRecord, mode: ToolMode) -> Self {
        Self {
            id: record.id,
            tool: record.tool,
            workdir: record.workdir,
            mode,
            resume_token: record.resume_token,
            name: record.name,
            summary: record.summary,
            queue: std::collections::VecDeque::new(),
            busy: false,
            driver: None,
            down: false,
            updated_at: record.updated_at,
            last_prompt_at: None,
            last_output_bytes: None,
            elapsed_ms_last: None,
        }
    }

    #[must_use]
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            tool: self.tool.clone(),
            workdir: self.workdir.clone(),
            resume_token: self.resume_token.clone(),
            name: self.name.clone(),
            summary: self.summary.clone(),
            updated_at: self.updated_at,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }

    /// The driver-state label shown in the §6 observability surface. A
    /// headless session has no live driver between prompts, so it reports
    /// `"idle"`/`"spawning"` directly off `busy` rather than an interactive
    /// `DriverState`.
    #[must_use]
    pub fn driver_state_label(&self) -> &'static str {
        if self.down {
            "failed"
        } else if let Some(driver) = &self.driver {
            match driver.state() {
                crate::driver::DriverState::Spawning => "spawning",
                crate::driver::DriverState::Ready => "ready",
                crate::driver::DriverState::Writing => "writing",
                crate::driver::DriverState::AwaitingPrompt => "awaiting_prompt",
                crate::driver::DriverState::Closed => "closed",
                crate::driver::DriverState::Failed(_) => "failed",
            }
        } else if self.busy {
            "spawning"
        } else {
            "idle"
        }
    }
}

/// Public listing snapshot for one session (§4.4 `list()`).
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub tool: String,
    pub workdir: String,
    pub name: Option<String>,
    pub updated_at: u64,
    pub busy: bool,
    pub queue_len: usize,
}

impl From<&Session> for SessionSnapshot {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            tool: s.tool.clone(),
            workdir: s.workdir.clone(),
            name: s.name.clone(),
            updated_at: s.updated_at,
            busy: s.busy,
            queue_len: s.queue.len(),
        }
    }
}

/// The observability surface for one session (§6 "Observability surface").
#[derive(Debug, Clone, Serialize)]
pub struct SessionObservability {
    pub id: String,
    pub tool: String,
    pub workdir: String,
    pub busy: bool,
    pub queue_len: usize,
    pub driver_state: String,
    pub last_prompt_at: Option<u64>,
    pub last_output_bytes: Option<usize>,
    pub elapsed_ms_last: Option<u64>,
}

impl From<&Session> for SessionObservability {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            tool: s.tool.clone(),
            workdir: s.workdir.clone(),
            busy: s.busy,
            queue_len: s.queue.len(),
            driver_state: s.driver_state_label().to_string(),
            last_prompt_at: s.last_prompt_at,
            last_output_bytes: s.last_output_bytes,
            elapsed_ms_last: s.elapsed_ms_last,
        }
    }
}

/// Currently active session, if any (§3 `ActiveSelection`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSelection {
    pub session_id: String,
    pub tool: String,
    pub workdir: String,
    pub updated_at: u64,
}
