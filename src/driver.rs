//! Session Driver (C2, §4.2): spawns and owns one subprocess, in either the
//! one-shot headless flavor or the long-lived interactive flavor.
//!
//! The headless flavor generalizes the teacher's `process::run` (process
//! group via `setsid`, signal-based kill) to arbitrary tool argv templates.
//! The interactive flavor generalizes the teacher's PTY-backed
//! `ShellSession`, replacing its UUID-marker protocol with [`StreamMatcher`]
//! driven readiness detection, since our subprocesses are opaque CLI tools
//! that print their own prompts rather than a shell we fully control. Like
//! the teacher, the PTY is opened with echo disabled (the teacher does this
//! with `stty -echo`; here it's set directly on the pty's termios since the
//! child isn't necessarily a shell we can hand a command line to) so a
//! `submit()` capture only ever contains what the tool itself printed.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::termios::{self, LocalFlags, SetArg};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::config::ToolConfig;
use crate::error::{CoreError, CoreResult};
use crate::matcher::{MatchEvent, MatcherConfig, StreamMatcher};

/// Grace period given to a polite termination signal before escalating.
const POLITE_GRACE: Duration = Duration::from_secs(3);
/// How long `close()` waits after the exit sequence before forcing.
const CLOSE_GRACE: Duration = Duration::from_secs(2);
/// Poll granularity of the interactive read loop; also the activity-tick
/// check cadence for the idle watchdog.
const READ_TICK: Duration = Duration::from_millis(200);

fn build_matcher(cfg: &ToolConfig) -> CoreResult<StreamMatcher> {
    let matcher_cfg = MatcherConfig::compile(
        cfg.prompt_regex.as_deref(),
        cfg.resume_regex.as_deref(),
        cfg.activity_tokens.clone(),
    )
    .map_err(|e| CoreError::Validation(format!("invalid regex for tool {}: {e}", cfg.name)))?;
    Ok(StreamMatcher::new(matcher_cfg))
}

fn apply_env(cmd_env: &mut std::collections::HashMap<String, String>, cfg: &ToolConfig) {
    for (k, v) in cfg.resolved_env() {
        cmd_env.insert(k, v);
    }
}

/// Clear `ECHO`/`ECHONL` on the PTY's slave side before the child is
/// spawned, so the kernel never reflects a written prompt back into the
/// read side. Mirrors the teacher's `stty -echo` in `session.rs`, applied
/// at the termios layer because the child here is an arbitrary tool, not a
/// shell we can hand a setup command.
fn disable_echo(pts: &pty_process::Pts) -> CoreResult<()> {
    let mut term = termios::tcgetattr(pts)
        .map_err(|e| CoreError::SpawnError(format!("tcgetattr: {e}")))?;
    term.local_flags.remove(LocalFlags::ECHO | LocalFlags::ECHONL);
    termios::tcsetattr(pts, SetArg::TCSANOW, &term)
        .map_err(|e| CoreError::SpawnError(format!("tcsetattr: {e}")))?;
    Ok(())
}

/// Strip ANSI and the matched `prompt_regex` tail from a `submit()`
/// capture, leaving only what the tool printed in response. With echo
/// disabled at the PTY the kernel no longer reflects the written input
/// line back, so the only redundant content left to remove is the tool's
/// own prompt redraw at the end of the capture (§4.2: "the caller treats
/// bytes between `submit` and `PromptReady` as the response" -- the
/// prompt text itself is the readiness signal, not part of the response).
fn clean_response(raw: &[u8], prompt_regex: Option<&regex::Regex>) -> String {
    let text = crate::output::strip_ansi(&String::from_utf8_lossy(raw));
    let body = match prompt_regex.and_then(|re| re.find_iter(&text).last()) {
        Some(m) if text[m.end()..].trim().is_empty() => &text[..m.start()],
        _ => text.as_str(),
    };
    body.trim_end_matches(['\r', '\n']).to_string()
}

// ---------------------------------------------------------------------------
// Headless flavor
// ---------------------------------------------------------------------------

/// Outcome of a one-shot headless invocation.
#[derive(Debug, Clone)]
pub struct HeadlessResult {
    pub exit_code: i32,
    pub output_bytes: Vec<u8>,
    pub resume_token: Option<String>,
    pub elapsed_ms: u64,
}

/// Run `cmd_template` to completion, capturing combined stdout+stderr purely
/// for resume-token extraction (§4.2 headless flavor).
pub async fn run_headless(
    cfg: &ToolConfig,
    prompt: &str,
    resume: Option<&str>,
    image: Option<&str>,
    workdir: &Path,
    timeout: Duration,
) -> CoreResult<HeadlessResult> {
    let start = Instant::now();
    let argv = ToolConfig::render_template(&cfg.cmd_template, prompt, resume, image);
    let Some((program, args)) = argv.split_first() else {
        return Err(CoreError::Validation(format!(
            "tool {} has an empty cmd_template",
            cfg.name
        )));
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(workdir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut env = std::collections::HashMap::new();
    apply_env(&mut env, cfg);
    for (k, v) in env {
        command.env(k, v);
    }

    // SAFETY: pre_exec runs in the forked child before exec; setsid() just
    // puts it in its own process group so a timeout can kill the whole tree.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    let mut child = command
        .spawn()
        .map_err(|e| CoreError::SpawnError(format!("{}: {e}", cfg.name)))?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let matcher = std::sync::Arc::new(tokio::sync::Mutex::new(build_matcher(cfg)?));
    let output = std::sync::Arc::new(tokio::sync::Mutex::new(Vec::new()));

    // Two reader tasks drain stdout/stderr concurrently so neither pipe's
    // buffer can back up and stall the child, same as the headless capture
    // in the process-running side of this repo.
    let out_matcher = matcher.clone();
    let out_buf = output.clone();
    let stdout_task = tokio::spawn(async move {
        let mut stdout = stdout;
        let mut buf = [0u8; 4096];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    out_matcher.lock().await.observe(&buf[..n]);
                    out_buf.lock().await.extend_from_slice(&buf[..n]);
                }
            }
        }
    });
    let err_buf = output.clone();
    let stderr_task = tokio::spawn(async move {
        let mut stderr = stderr;
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    err_buf.lock().await.extend_from_slice(&buf[..n]);
                }
            }
        }
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status.map_err(|e| CoreError::SpawnError(e.to_string()))?,
        Err(_) => {
            terminate_escalating(&mut child).await.ok();
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            return Err(CoreError::Timeout);
        }
    };

    let _ = stdout_task.await;
    let _ = stderr_task.await;

    let resume_token = matcher.lock().await.resume_token().map(str::to_string);
    let output_bytes = output.lock().await.clone();

    Ok(HeadlessResult {
        exit_code: status.code().unwrap_or(-1),
        output_bytes,
        resume_token,
        elapsed_ms: start.elapsed().as_millis() as u64,
    })
}

/// Polite-then-forceful termination of a child's process group, mirroring
/// the teacher's `setsid`-based kill but escalating SIGTERM before SIGKILL.
///
/// Waits for the child on the tokio reactor rather than blocking the worker
/// thread, so other sessions' drivers keep making progress during the grace
/// period.
async fn terminate_escalating(child: &mut tokio::process::Child) -> Result<(), String> {
    let pid = child
        .id()
        .ok_or_else(|| "process already exited".to_string())?;
    let pgid = nix::unistd::Pid::from_raw(-(pid as i32));
    let _ = nix::sys::signal::kill(pgid, nix::sys::signal::Signal::SIGTERM);

    if tokio::time::timeout(POLITE_GRACE, child.wait()).await.is_ok() {
        return Ok(());
    }

    nix::sys::signal::kill(pgid, nix::sys::signal::Signal::SIGKILL)
        .map_err(|e| format!("failed to SIGKILL process group: {e}"))?;
    let _ = child.wait().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Interactive flavor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailedReason {
    SpawnError,
    Stalled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverState {
    Spawning,
    Ready,
    Writing,
    AwaitingPrompt,
    Closed,
    Failed(FailedReason),
}

/// The tool's response to one `submit()`, cleaned of ANSI and the trailing
/// prompt redraw (see [`clean_response`]).
pub struct SubmitOutcome {
    pub text: String,
    pub resume_token: Option<String>,
}

/// A long-lived, PTY-backed interactive subprocess driver (§4.2 interactive
/// flavor). Owns exactly one subprocess; all writes are serialized because
/// `submit`/`interrupt`/`close` take `&mut self`.
pub struct InteractiveDriver {
    child: tokio::process::Child,
    writer: pty_process::OwnedWritePty,
    reader: BufReader<pty_process::OwnedReadPty>,
    matcher: StreamMatcher,
    state: DriverState,
    idle_timeout: Duration,
    exit_sequence: String,
}

impl InteractiveDriver {
    #[must_use]
    pub fn state(&self) -> &DriverState {
        &self.state
    }

    /// Spawn the subprocess under a PTY, wait for the first `PromptReady`,
    /// then run `auto_commands`.
    pub async fn start(
        cfg: &ToolConfig,
        workdir: &Path,
        idle_timeout: Duration,
    ) -> CoreResult<Self> {
        let argv = cfg
            .interactive_cmd_template
            .as_deref()
            .unwrap_or(&cfg.cmd_template);
        let Some((program, args)) = argv.split_first() else {
            return Err(CoreError::Validation(format!(
                "tool {} has an empty interactive cmd_template",
                cfg.name
            )));
        };

        let (pty, pts) =
            pty_process::open().map_err(|e| CoreError::SpawnError(format!("open PTY: {e}")))?;
        pty.resize(pty_process::Size::new(24, 250))
            .map_err(|e| CoreError::SpawnError(format!("resize PTY: {e}")))?;
        disable_echo(&pts)?;

        let mut command = pty_process::Command::new(program);
        for a in args {
            command = command.arg(a);
        }
        command = command.current_dir(workdir);
        for (k, v) in cfg.resolved_env() {
            command = command.env(k, v);
        }

        let child = command
            .spawn(pts)
            .map_err(|e| CoreError::SpawnError(format!("{}: {e}", cfg.name)))?;

        let (read_pty, write_pty) = pty.into_split();
        let mut driver = Self {
            child,
            writer: write_pty,
            reader: BufReader::new(read_pty),
            matcher: build_matcher(cfg)?,
            state: DriverState::Spawning,
            idle_timeout,
            exit_sequence: cfg.exit_sequence.clone(),
        };

        driver.wait_for_prompt_ready().await?;
        driver.state = DriverState::Ready;

        for line in &cfg.auto_commands {
            driver.submit(line, idle_timeout).await?;
        }

        Ok(driver)
    }

    async fn wait_for_prompt_ready(&mut self) -> CoreResult<()> {
        let mut buf = [0u8; 4096];
        let mut last_activity = Instant::now();
        loop {
            match tokio::time::timeout(READ_TICK, self.reader.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    self.state = DriverState::Failed(FailedReason::SpawnError);
                    return Err(CoreError::SpawnError("subprocess closed PTY".to_string()));
                }
                Ok(Ok(n)) => {
                    let events = self.matcher.observe(&buf[..n]);
                    if events.contains(&MatchEvent::ActivityTick) {
                        last_activity = Instant::now();
                    }
                    if events.contains(&MatchEvent::PromptReady) {
                        return Ok(());
                    }
                }
                Ok(Err(e)) => {
                    self.state = DriverState::Failed(FailedReason::SpawnError);
                    return Err(CoreError::SpawnError(e.to_string()));
                }
                Err(_) => {}
            }
            if last_activity.elapsed() >= self.idle_timeout {
                self.state = DriverState::Failed(FailedReason::Stalled);
                return Err(CoreError::Stalled);
            }
        }
    }

    /// Write `prompt` (plus trailing newline) and collect output up to the
    /// terminal `PromptReady` (§4.2 interactive flavor).
    pub async fn submit(&mut self, prompt: &str, idle_timeout: Duration) -> CoreResult<SubmitOutcome> {
        if self.state != DriverState::Ready {
            return Err(CoreError::Validation(format!(
                "driver not ready (state: {:?})",
                self.state
            )));
        }

        self.state = DriverState::Writing;
        let mut line = prompt.as_bytes().to_vec();
        line.push(b'\n');
        if let Err(e) = self.writer.write_all(&line).await {
            self.state = DriverState::Failed(FailedReason::SpawnError);
            return Err(CoreError::SpawnError(e.to_string()));
        }
        if let Err(e) = self.writer.flush().await {
            self.state = DriverState::Failed(FailedReason::SpawnError);
            return Err(CoreError::SpawnError(e.to_string()));
        }
        self.state = DriverState::AwaitingPrompt;

        let mut raw_output = Vec::new();
        let mut buf = [0u8; 4096];
        let mut last_activity = Instant::now();

        loop {
            match tokio::time::timeout(READ_TICK, self.reader.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    self.state = DriverState::Failed(FailedReason::SpawnError);
                    return Err(CoreError::SessionDown);
                }
                Ok(Ok(n)) => {
                    raw_output.extend_from_slice(&buf[..n]);
                    let events = self.matcher.observe(&buf[..n]);
                    if events.contains(&MatchEvent::ActivityTick) {
                        last_activity = Instant::now();
                    }
                    if events.contains(&MatchEvent::PromptReady) {
                        // A PromptReady observed while still nominally
                        // Writing would be stale output from the prior
                        // turn; by construction we only reach this branch
                        // once state is AwaitingPrompt, so it's always
                        // the terminal event for this submit.
                        self.state = DriverState::Ready;
                        break;
                    }
                }
                Ok(Err(e)) => {
                    self.state = DriverState::Failed(FailedReason::SpawnError);
                    return Err(CoreError::SpawnError(e.to_string()));
                }
                Err(_) => {}
            }
            if last_activity.elapsed() >= idle_timeout {
                self.state = DriverState::Failed(FailedReason::Stalled);
                return Err(CoreError::Stalled);
            }
        }

        Ok(SubmitOutcome {
            text: clean_response(&raw_output, self.matcher.prompt_regex()),
            resume_token: self.matcher.resume_token().map(str::to_string),
        })
    }

    /// Interrupt an in-flight submit: send the cancel signal, discard output
    /// up to the next `PromptReady`, and return to `Ready`.
    pub async fn interrupt(&mut self) -> CoreResult<()> {
        let _ = self.writer.write_all(b"\x03").await;
        let _ = self.writer.flush().await;

        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match tokio::time::timeout(READ_TICK, self.reader.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    if self
                        .matcher
                        .observe(&buf[..n])
                        .contains(&MatchEvent::PromptReady)
                    {
                        self.state = DriverState::Ready;
                        return Ok(());
                    }
                }
                Ok(Err(_)) => break,
                Err(_) => {}
            }
        }
        self.state = DriverState::Failed(FailedReason::Stalled);
        Err(CoreError::Stalled)
    }

    /// Ask the subprocess to exit, then force-terminate if it doesn't.
    pub async fn close(mut self) {
        let _ = self.writer.write_all(self.exit_sequence.as_bytes()).await;
        let _ = self.writer.flush().await;

        drop(self.writer);
        drop(self.reader);

        if tokio::time::timeout(CLOSE_GRACE, self.child.wait())
            .await
            .is_err()
        {
            let _ = self.child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(1), self.child.wait()).await;
        }
        self.state = DriverState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn echo_tool() -> ToolConfig {
        ToolConfig {
            name: "echotool".to_string(),
            mode: crate::config::ToolMode::Headless,
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
        }
    }

    #[tokio::test]
    async fn headless_happy_path() {
        let cfg = echo_tool();
        let result = run_headless(
            &cfg,
            "hello",
            None,
            None,
            &std::env::temp_dir(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(String::from_utf8_lossy(&result.output_bytes), "hello");
    }

    #[tokio::test]
    async fn headless_timeout_produces_timeout_error() {
        let mut cfg = echo_tool();
        cfg.cmd_template = vec!["sleep".to_string(), "30".to_string()];
        let result = run_headless(
            &cfg,
            "x",
            None,
            None,
            &std::env::temp_dir(),
            Duration::from_millis(200),
        )
        .await;
        assert!(matches!(result, Err(CoreError::Timeout)));
    }

    /// A tiny shell-script "tool" standing in for an interactive CLI: prints
    /// a welcome banner and a resume token, then echoes `pong` for `ping`
    /// lines and redraws its prompt after each.
    fn interactive_tool() -> ToolConfig {
        let script = "printf 'welcome\\nthread=abc123\\n$ '; \
                       while IFS= read -r line; do \
                         if [ \"$line\" = ping ]; then printf 'pong\\n'; fi; \
                         printf '$ '; \
                       done";
        ToolConfig {
            name: "interactool".to_string(),
            mode: crate::config::ToolMode::Interactive,
            cmd_template: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            interactive_cmd_template: None,
            resume_cmd_template: None,
            image_arg_template: None,
            prompt_regex: Some(r"\$ $".to_string()),
            resume_regex: Some(r"thread=([a-f0-9]+)".to_string()),
            activity_tokens: vec![],
            env: HashMap::new(),
            auto_commands: vec![],
            help_cmd_template: None,
            exit_sequence: "\u{3}".to_string(),
        }
    }

    #[tokio::test]
    async fn interactive_submit_returns_response_and_resume_token() {
        let cfg = interactive_tool();
        let mut driver = InteractiveDriver::start(&cfg, &std::env::temp_dir(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(*driver.state(), DriverState::Ready);

        let outcome = driver.submit("ping", Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome.text, "pong");
        assert_eq!(outcome.resume_token.as_deref(), Some("abc123"));
        assert_eq!(*driver.state(), DriverState::Ready);

        driver.close().await;
    }

    #[tokio::test]
    async fn interactive_stall_reports_stalled() {
        let mut cfg = interactive_tool();
        cfg.cmd_template = vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()];
        let result =
            InteractiveDriver::start(&cfg, &std::env::temp_dir(), Duration::from_millis(200)).await;
        assert!(matches!(result, Err(CoreError::Stalled)));
    }
}
