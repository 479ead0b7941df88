//! Scheduler / Dispatcher (C5, §4.5): one logical dispatcher per session,
//! single-in-flight enforcement, timeouts, and cancellation.
//!
//! A dispatcher task is spawned lazily the first time a session gets work
//! and exits once its queue drains; `Scheduler` tracks which sessions
//! currently have a live dispatcher so a burst of enqueues doesn't spawn
//! duplicates. Distinct sessions' dispatchers never share a lock, so they
//! run fully concurrently (§5 "cross-session parallelism").

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::ToolMode;
use crate::driver::{self, InteractiveDriver};
use crate::error::CoreError;
use crate::manager::SessionManager;
use crate::output::OutputPipeline;
use crate::session::{PendingPrompt, PromptCompletion, now_ms};

/// Record the output size and wall-clock time of a successful prompt onto
/// its session, for the §6 observability surface.
async fn record_success(
    handle: &Arc<tokio::sync::Mutex<crate::session::Session>>,
    bytes: usize,
    elapsed_ms: u64,
) {
    let mut session = handle.lock().await;
    session.last_output_bytes = Some(bytes);
    session.elapsed_ms_last = Some(elapsed_ms);
}

pub struct Scheduler {
    manager: Arc<SessionManager>,
    pipeline: Arc<OutputPipeline>,
    running: StdMutex<HashSet<String>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(manager: Arc<SessionManager>, pipeline: Arc<OutputPipeline>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            pipeline,
            running: StdMutex::new(HashSet::new()),
        })
    }

    /// Drain dispatch notifications, lazily spawning one dispatcher task per
    /// session that reports new work.
    pub async fn run(self: Arc<Self>, mut dispatch_rx: mpsc::UnboundedReceiver<String>) {
        while let Some(id) = dispatch_rx.recv().await {
            self.ensure_dispatcher(id);
        }
    }

    fn ensure_dispatcher(self: &Arc<Self>, id: String) {
        let mut running = self.running.lock().unwrap();
        if running.contains(&id) {
            return;
        }
        running.insert(id.clone());
        drop(running);

        let this = self.clone();
        tokio::spawn(async move {
            this.dispatch_loop(&id).await;
            this.running.lock().unwrap().remove(&id);
        });
    }

    /// Pop and run prompts for `id` until its queue is empty or it goes down.
    async fn dispatch_loop(&self, id: &str) {
        loop {
            let Some(handle) = self.manager.session_handle(id) else {
                return;
            };

            let prompt = {
                let mut session = handle.lock().await;
                if session.down {
                    return;
                }
                match session.queue.pop_front() {
                    Some(p) => {
                        session.busy = true;
                        session.last_prompt_at = Some(now_ms());
                        Some(p)
                    }
                    None => None,
                }
            };

            let Some(prompt) = prompt else {
                return;
            };

            self.run_prompt(id, &handle, prompt).await;

            {
                let mut session = handle.lock().await;
                session.busy = false;
                session.touch();
            }
        }
    }

    async fn run_prompt(
        &self,
        id: &str,
        handle: &Arc<tokio::sync::Mutex<crate::session::Session>>,
        mut prompt: PendingPrompt,
    ) {
        let now = now_ms();

        // Boundary behavior (§8): a deadline that has already elapsed never
        // reaches the driver.
        if prompt.deadline_ms <= now {
            self.complete(id, prompt, Err(CoreError::Timeout)).await;
            return;
        }

        if let Some(cancel) = prompt.cancel.as_mut() {
            if cancel.try_recv().is_ok() {
                self.complete(id, prompt, Err(CoreError::Cancelled)).await;
                return;
            }
        }

        let remaining = Duration::from_millis(prompt.deadline_ms.saturating_sub(now));

        let mut session = handle.lock().await;
        let tool_name = session.tool.clone();
        let workdir = session.workdir.clone();
        let mode = session.mode;
        let Some(tool_cfg) = self.manager.config().tool(&tool_name).cloned() else {
            session.down = true;
            drop(session);
            self.complete(id, prompt, Err(CoreError::UnknownTool(tool_name)))
                .await;
            return;
        };
        let idle_timeout = Duration::from_secs(self.manager.config().defaults.idle_timeout_sec);
        let headless_timeout =
            Duration::from_secs(self.manager.config().defaults.headless_timeout_sec);

        match mode {
            ToolMode::Headless => {
                let resume = session.resume_token.clone();
                drop(session);
                let start = now_ms();
                let run_fut = driver::run_headless(
                    &tool_cfg,
                    &prompt.text,
                    resume.as_deref(),
                    prompt.image_path.as_deref(),
                    Path::new(&workdir),
                    remaining.min(headless_timeout),
                );

                // Dropping `run_fut` on cancel drops the child with
                // `kill_on_drop(true)`, tearing the subprocess down the same
                // way an expired deadline does (§4.5 "Cancellation").
                let result = match prompt.cancel.take() {
                    Some(mut cancel) => {
                        tokio::select! {
                            res = run_fut => res,
                            _ = &mut cancel => Err(CoreError::Cancelled),
                        }
                    }
                    None => run_fut.await,
                };
                match result {
                    Ok(outcome) => {
                        if let Some(token) = outcome.resume_token.clone() {
                            let _ = self.manager.set_resume(id, Some(token)).await;
                        }
                        let text = String::from_utf8_lossy(&outcome.output_bytes).into_owned();
                        let elapsed_ms = now_ms().saturating_sub(start);
                        record_success(handle, text.len(), elapsed_ms).await;
                        self.deliver(id, &prompt, &text).await;
                        self.complete(
                            id,
                            prompt,
                            Ok(PromptCompletion {
                                bytes_out: text.len(),
                                elapsed_ms,
                                text,
                            }),
                        )
                        .await;
                    }
                    Err(CoreError::Timeout) => {
                        self.complete(id, prompt, Err(CoreError::Timeout)).await;
                    }
                    Err(CoreError::Cancelled) => {
                        self.complete(id, prompt, Err(CoreError::Cancelled)).await;
                    }
                    Err(err) => {
                        self.mark_down(id).await;
                        self.complete(id, prompt, Err(err)).await;
                    }
                }
            }
            ToolMode::Interactive => {
                if session.driver.is_none() {
                    match InteractiveDriver::start(&tool_cfg, Path::new(&workdir), idle_timeout)
                        .await
                    {
                        Ok(d) => session.driver = Some(d),
                        Err(err) => {
                            // Degrade to headless on spawn failure per §3
                            // `Session.mode` "may be degraded... on spawn
                            // failure", then report this prompt as failed;
                            // the next enqueue will try headless.
                            session.mode = ToolMode::Headless;
                            drop(session);
                            self.mark_down_if_fatal(id, &err).await;
                            self.complete(id, prompt, Err(err)).await;
                            return;
                        }
                    }
                }

                let driver = session.driver.as_mut().expect("just ensured present");
                let start = now_ms();

                enum Outcome {
                    Done(Result<driver::SubmitOutcome, CoreError>),
                    TimedOut,
                    Cancelled,
                }

                let outcome = match prompt.cancel.take() {
                    Some(mut cancel) => {
                        tokio::select! {
                            res = tokio::time::timeout(remaining, driver.submit(&prompt.text, idle_timeout)) => {
                                res.map_or(Outcome::TimedOut, Outcome::Done)
                            }
                            _ = &mut cancel => Outcome::Cancelled,
                        }
                    }
                    None => tokio::time::timeout(remaining, driver.submit(&prompt.text, idle_timeout))
                        .await
                        .map_or(Outcome::TimedOut, Outcome::Done),
                };

                match outcome {
                    Outcome::Done(Ok(outcome)) => {
                        let resume = outcome.resume_token.clone();
                        drop(session);
                        if let Some(token) = resume {
                            let _ = self.manager.set_resume(id, Some(token)).await;
                        }
                        let text = outcome.text;
                        let elapsed_ms = now_ms().saturating_sub(start);
                        record_success(handle, text.len(), elapsed_ms).await;
                        self.deliver(id, &prompt, &text).await;
                        self.complete(
                            id,
                            prompt,
                            Ok(PromptCompletion {
                                bytes_out: text.len(),
                                elapsed_ms,
                                text,
                            }),
                        )
                        .await;
                    }
                    Outcome::Done(Err(err)) => {
                        let fatal = matches!(
                            err,
                            CoreError::Stalled | CoreError::SessionDown | CoreError::SpawnError(_)
                        );
                        drop(session);
                        if fatal {
                            self.mark_down(id).await;
                        }
                        self.complete(id, prompt, Err(err)).await;
                    }
                    Outcome::TimedOut => {
                        // Deadline elapsed: interrupt and report Timeout
                        // (§4.5 "Timeouts").
                        let interrupt_result = driver.interrupt().await;
                        drop(session);
                        if interrupt_result.is_err() {
                            self.mark_down(id).await;
                        }
                        self.complete(id, prompt, Err(CoreError::Timeout)).await;
                    }
                    Outcome::Cancelled => {
                        // Caller cancelled an in-flight prompt: interrupt the
                        // driver and report Cancelled once it's back to
                        // Ready (§4.5 "Cancellation").
                        let interrupt_result = driver.interrupt().await;
                        drop(session);
                        if interrupt_result.is_err() {
                            self.mark_down(id).await;
                        }
                        self.complete(id, prompt, Err(CoreError::Cancelled)).await;
                    }
                }
            }
        }
    }

    async fn deliver(&self, id: &str, prompt: &PendingPrompt, text: &str) {
        if prompt.destination.is_empty() {
            return;
        }
        if let Err(err) = self
            .pipeline
            .publish(&prompt.destination, id, text, None)
            .await
        {
            tracing::warn!(session_id = id, error = %err, "output pipeline delivery failed");
        }
    }

    async fn complete(
        &self,
        id: &str,
        prompt: PendingPrompt,
        result: Result<PromptCompletion, CoreError>,
    ) {
        if let Err(ref err) = result {
            tracing::warn!(session_id = id, error = %err, "prompt failed");
        }
        if let Some(tx) = prompt.completion {
            let _ = tx.send(result);
        }
    }

    async fn mark_down_if_fatal(&self, id: &str, err: &CoreError) {
        if matches!(err, CoreError::SpawnError(_) | CoreError::Stalled) {
            self.mark_down(id).await;
        }
    }

    /// Mark a session `Down` and drain its queue with `SessionDown` (§4.5
    /// "Failure policy").
    async fn mark_down(&self, id: &str) {
        let Some(handle) = self.manager.session_handle(id) else {
            return;
        };
        let mut drained = Vec::new();
        {
            let mut session = handle.lock().await;
            session.down = true;
            session.busy = false;
            if let Some(driver) = session.driver.take() {
                tokio::spawn(async move { driver.close().await });
            }
            while let Some(p) = session.queue.pop_front() {
                drained.push(p);
            }
        }
        for prompt in drained {
            self.complete(id, prompt, Err(CoreError::SessionDown)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Defaults, OutputDefaults, QueueConfig, RpcConfig, ToolConfig};
    use crate::manager::Hooks;
    use crate::persistence::PersistenceStore;
    use std::collections::HashMap;

    fn echo_config(state_path: std::path::PathBuf) -> Arc<Config> {
        let mut tools = HashMap::new();
        tools.insert(
            "echo".to_string(),
            ToolConfig {
                name: "echo".to_string(),
                mode: ToolMode::Headless,
                cmd_template: vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    "printf '%s' '{prompt}'".to_string(),
                ],
                interactive_cmd_template: None,
                resume_cmd_template: None,
                image_arg_template: None,
                prompt_regex: None,
                resume_regex: None,
                activity_tokens: vec![],
                env: HashMap::new(),
                auto_commands: vec![],
                help_cmd_template: None,
                exit_sequence: "\u{3}".to_string(),
            },
        );
        Arc::new(Config {
            tools,
            defaults: Defaults {
                workdir: "/tmp".into(),
                state_path,
                toolhelp_path: "/tmp/agentctl-toolhelp.json".into(),
                idle_timeout_sec: 5,
                headless_timeout_sec: 5,
                output: OutputDefaults::default(),
            },
            rpc: RpcConfig::default(),
            queue: QueueConfig::default(),
        })
    }

    #[tokio::test]
    async fn dispatches_prompts_in_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = echo_config(dir.path().join("state.json"));
        let store = PersistenceStore::new(dir.path().join("state.json"));
        let manager = Arc::new(SessionManager::new(config, store, Hooks::default(), None));
        let snap = manager.create("echo", "/tmp", None).await.unwrap();

        let artifact_dir = dir.path().join("artifacts");
        let pipeline = Arc::new(OutputPipeline::new(
            OutputDefaults::default(),
            artifact_dir,
            |_dest, _event| {},
        ));
        let scheduler = Scheduler::new(manager.clone(), pipeline);

        let mut receivers = Vec::new();
        for text in ["A", "B", "C"] {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let mut prompt = PendingPrompt::new(text.to_string(), String::new(), now_ms() + 5000);
            prompt.completion = Some(tx);
            manager.enqueue(&snap.id, prompt).await.unwrap();
            receivers.push(rx);
        }
        scheduler.ensure_dispatcher(snap.id.clone());

        let mut results = Vec::new();
        for rx in receivers {
            let completion = rx.await.unwrap().unwrap();
            results.push(completion.text);
        }
        assert_eq!(results, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn cancelling_in_flight_headless_prompt_resolves_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = (*echo_config(dir.path().join("state.json"))).clone();
        config.tools.get_mut("echo").unwrap().cmd_template = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "sleep 30".to_string(),
        ];
        let config = Arc::new(config);
        let store = PersistenceStore::new(dir.path().join("state.json"));
        let manager = Arc::new(SessionManager::new(config, store, Hooks::default(), None));
        let snap = manager.create("echo", "/tmp", None).await.unwrap();

        let pipeline = Arc::new(OutputPipeline::new(
            OutputDefaults::default(),
            dir.path().join("artifacts"),
            |_dest, _event| {},
        ));
        let scheduler = Scheduler::new(manager.clone(), pipeline);

        let (tx, rx) = tokio::sync::oneshot::channel();
        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
        let mut prompt = PendingPrompt::new("x".to_string(), String::new(), now_ms() + 10_000);
        prompt.completion = Some(tx);
        prompt.cancel = Some(cancel_rx);
        manager.enqueue(&snap.id, prompt).await.unwrap();
        scheduler.ensure_dispatcher(snap.id.clone());

        // Let the dispatcher spawn the subprocess before cancelling it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = cancel_tx.send(());

        let result = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("cancellation should resolve promptly, not wait out the sleep")
            .unwrap();
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }

    #[tokio::test]
    async fn successful_prompt_updates_observability_fields() {
        let dir = tempfile::tempdir().unwrap();
        let config = echo_config(dir.path().join("state.json"));
        let store = PersistenceStore::new(dir.path().join("state.json"));
        let manager = Arc::new(SessionManager::new(config, store, Hooks::default(), None));
        let snap = manager.create("echo", "/tmp", None).await.unwrap();

        let pipeline = Arc::new(OutputPipeline::new(
            OutputDefaults::default(),
            dir.path().join("artifacts"),
            |_dest, _event| {},
        ));
        let scheduler = Scheduler::new(manager.clone(), pipeline);

        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut prompt = PendingPrompt::new("hi".to_string(), String::new(), now_ms() + 5_000);
        prompt.completion = Some(tx);
        manager.enqueue(&snap.id, prompt).await.unwrap();
        scheduler.ensure_dispatcher(snap.id.clone());
        rx.await.unwrap().unwrap();

        let obs = manager.observe(&snap.id).await.unwrap();
        assert_eq!(obs.last_output_bytes, Some(2));
        assert!(obs.last_prompt_at.is_some());
        assert!(obs.elapsed_ms_last.is_some());
    }

    #[tokio::test]
    async fn zero_deadline_resolves_timeout_without_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let config = echo_config(dir.path().join("state.json"));
        let store = PersistenceStore::new(dir.path().join("state.json"));
        let manager = Arc::new(SessionManager::new(config, store, Hooks::default(), None));
        let snap = manager.create("echo", "/tmp", None).await.unwrap();

        let pipeline = Arc::new(OutputPipeline::new(
            OutputDefaults::default(),
            dir.path().join("artifacts"),
            |_dest, _event| {},
        ));
        let scheduler = Scheduler::new(manager.clone(), pipeline);

        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut prompt = PendingPrompt::new("x".to_string(), String::new(), 0);
        prompt.completion = Some(tx);
        manager.enqueue(&snap.id, prompt).await.unwrap();
        scheduler.ensure_dispatcher(snap.id.clone());

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(CoreError::Timeout)));
    }
}
