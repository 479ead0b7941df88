//! RPC Bridge (C6, §4.6): a connection-per-request JSON TCP server.
//!
//! There is no persistent channel and no length prefix: a client opens a
//! connection, writes one JSON object, and the bridge replies with exactly
//! one JSON object before closing. Framing is "read until the first complete
//! JSON value parses" rather than a byte-count prefix, so the bridge detects
//! message boundaries the same way `StreamMatcher` detects event boundaries
//! in `matcher.rs`: by repeatedly re-parsing a growing buffer rather than
//! trusting a length header the client might get wrong.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::CoreError;
use crate::manager::SessionManager;
use crate::session::{PendingPrompt, now_ms};

/// Per-connection read deadline (§4.6: "Default timeout per connection: 60 s
/// for read, unbounded for the downstream prompt").
const READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Bound on a request's serialized size. The wire format has no length
/// prefix, so this is the only thing standing between a misbehaving or
/// malicious client and unbounded buffering.
const MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;
/// Effectively-unbounded prompt deadline handed to the scheduler: the RPC
/// caller owns its own timeout, so the bridge itself never expires a
/// dispatched prompt (§4.6).
const UNBOUNDED_DEADLINE_MS: u64 = u64::MAX / 2;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    token: Option<String>,
    prompt: String,
    #[serde(default)]
    session_id: Option<String>,
}

/// Bind `host:port` and serve RPC requests until the process is shut down.
pub async fn serve(
    manager: Arc<SessionManager>,
    host: &str,
    port: u16,
    token: Option<String>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    tracing::info!(host, port, "rpc bridge listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let manager = manager.clone();
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, &manager, token.as_deref()).await {
                tracing::warn!(peer = %peer, error = %err, "rpc connection error");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    manager: &Arc<SessionManager>,
    token: Option<&str>,
) -> std::io::Result<()> {
    let response = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut stream)).await {
        Err(_) => bare_error("timeout"),
        Ok(Err(_)) => bare_error("bad-request"),
        Ok(Ok(req)) => process_request(manager, req, token).await,
    };
    write_response(&mut stream, &response).await
}

/// Read from `stream` until the accumulated bytes parse as a complete
/// [`Request`], or the connection closes, or `MAX_REQUEST_BYTES` is exceeded.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<Request> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match serde_json::from_slice::<Request>(&buf) {
            Ok(req) => return Ok(req),
            Err(e) if e.is_eof() => {}
            Err(e) => {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e));
            }
        }

        if buf.len() >= MAX_REQUEST_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request exceeds size limit",
            ));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before a complete request arrived",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn process_request(
    manager: &Arc<SessionManager>,
    req: Request,
    expected_token: Option<&str>,
) -> Value {
    if let Some(expected) = expected_token {
        if req.token.as_deref() != Some(expected) {
            return bare_error("auth");
        }
    }

    let session_id = match req
        .session_id
        .filter(|id| manager.session_handle(id).is_some())
    {
        Some(id) => id,
        None => match manager.active_session_id() {
            Some(id) => id,
            None => return bare_error("no-active-session"),
        },
    };

    let (tx, rx) = tokio::sync::oneshot::channel();
    let mut prompt = PendingPrompt::new(
        req.prompt,
        String::new(),
        now_ms().saturating_add(UNBOUNDED_DEADLINE_MS),
    );
    prompt.completion = Some(tx);

    if let Err(err) = manager.enqueue(&session_id, prompt).await {
        return outcome_error(&err);
    }

    match rx.await {
        Ok(Ok(completion)) => json!({"ok": true, "output": completion.text}),
        Ok(Err(err)) => outcome_error(&err),
        Err(_) => outcome_error(&CoreError::SessionDown),
    }
}

/// A bare protocol-level failure token, per the literal wire examples in
/// §4.6 (`"auth"`, `"bad-request"`, `"no-active-session"`) rather than the
/// kind-prefixed human string used for prompt outcomes.
fn bare_error(token: &str) -> Value {
    json!({"ok": false, "error": token})
}

/// A dispatched prompt's failure, rendered as the bounded kind-prefixed
/// string §7 specifies for prompt outcomes.
fn outcome_error(err: &CoreError) -> Value {
    json!({"ok": false, "error": err.to_user_string()})
}

async fn write_response(stream: &mut TcpStream, response: &Value) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(response)?;
    stream.write_all(&bytes).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Config, Defaults, OutputDefaults, QueueConfig, RpcConfig, ToolConfig, ToolMode,
    };
    use crate::manager::Hooks;
    use crate::persistence::PersistenceStore;
    use std::collections::HashMap;
    use tokio::io::AsyncWriteExt as _;

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
                toolhelp_path: "/tmp/agentctl-test-toolhelp.json".into(),
                idle_timeout_sec: 5,
                headless_timeout_sec: 5,
                output: OutputDefaults::default(),
            },
            rpc: RpcConfig::default(),
            queue: QueueConfig::default(),
        })
    }

    async fn start_test_bridge(token: Option<String>) -> (std::net::SocketAddr, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = echo_config(dir.path().join("state.json"));
        let store = PersistenceStore::new(dir.path().join("state.json"));
        let (dispatch_tx, dispatch_rx) = tokio::sync::mpsc::unbounded_channel();
        let manager = Arc::new(SessionManager::new(
            config,
            store,
            Hooks::default(),
            Some(dispatch_tx),
        ));
        let snap = manager.create("echo", "/tmp", None).await.unwrap();
        manager.set_active(&snap.id).await.unwrap();

        let pipeline = Arc::new(crate::output::OutputPipeline::new(
            OutputDefaults::default(),
            dir.path().join("artifacts"),
            |_dest, _event| {},
        ));
        let scheduler = crate::scheduler::Scheduler::new(manager.clone(), pipeline);
        tokio::spawn(scheduler.run(dispatch_rx));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let manager = manager.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, &manager, token.as_deref()).await;
                });
            }
        });
        (addr, dir)
    }

    async fn roundtrip(addr: std::net::SocketAddr, body: Value) -> Value {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&serde_json::to_vec(&body).unwrap())
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        serde_json::from_slice(&buf).unwrap()
    }

    #[tokio::test]
    async fn round_trip_with_session_id_and_token() {
        let (addr, _dir) = start_test_bridge(Some("secret".to_string())).await;
        let resp = roundtrip(
            addr,
            json!({"token": "secret", "prompt": "hi", "session_id": null}),
        )
        .await;
        assert_eq!(resp["ok"], true);
        assert_eq!(resp["output"], "hi");
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let (addr, _dir) = start_test_bridge(Some("secret".to_string())).await;
        let resp = roundtrip(addr, json!({"token": "wrong", "prompt": "hi"})).await;
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["error"], "auth");
    }

    #[tokio::test]
    async fn missing_prompt_is_bad_request() {
        let (addr, _dir) = start_test_bridge(None).await;
        let resp = roundtrip(addr, json!({"session_id": null})).await;
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["error"], "bad-request");
    }

    #[tokio::test]
    async fn no_active_session_without_target() {
        let dir = tempfile::tempdir().unwrap();
        let config = echo_config(dir.path().join("state.json"));
        let store = PersistenceStore::new(dir.path().join("state.json"));
        let manager = Arc::new(SessionManager::new(config, store, Hooks::default(), None));
        // No session created, so there is no active session to fall back to.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = handle_connection(stream, &manager, None).await;
        });

        let resp = roundtrip(addr, json!({"prompt": "hi"})).await;
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["error"], "no-active-session");
    }
}
