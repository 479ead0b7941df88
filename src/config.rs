//! Typed configuration consumed by the core (§6 "Configuration contract").
//!
//! The core never parses a config file itself -- it is handed a [`Config`]
//! value at construction. `main.rs` owns the (thin) JSON loader; that's ambient
//! CLI glue, not part of the engine.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One-shot vs. persistent subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolMode {
    Headless,
    Interactive,
}

/// Immutable per-tool template (§3 `ToolConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Unique short identifier, e.g. `"codex"`, `"claude"`.
    pub name: String,
    pub mode: ToolMode,
    /// Argv template; elements may contain `{prompt}`, `{resume}`, `{image}`.
    pub cmd_template: Vec<String>,
    #[serde(default)]
    pub interactive_cmd_template: Option<Vec<String>>,
    #[serde(default)]
    pub resume_cmd_template: Option<Vec<String>>,
    #[serde(default)]
    pub image_arg_template: Option<Vec<String>>,
    /// Pattern signalling the tool is idle and ready (interactive only).
    #[serde(default)]
    pub prompt_regex: Option<String>,
    /// Capturing pattern whose first group yields a resume token.
    #[serde(default)]
    pub resume_regex: Option<String>,
    /// Substrings proving forward progress, for the idle watchdog.
    #[serde(default)]
    pub activity_tokens: Vec<String>,
    /// Env var name -> literal value or `${VAR}`-style indirection.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Lines sent immediately once the tool becomes ready.
    #[serde(default)]
    pub auto_commands: Vec<String>,
    /// Argv used to fetch in-tool help output.
    #[serde(default)]
    pub help_cmd_template: Option<Vec<String>>,
    /// Control sequence used by `close()` to ask the tool to exit gracefully.
    #[serde(default = "default_exit_sequence")]
    pub exit_sequence: String,
}

fn default_exit_sequence() -> String {
    "\u{3}".to_string() // Ctrl-C
}

impl ToolConfig {
    /// Resolve `env` into a concrete list of `(name, value)` pairs, expanding
    /// `${VAR}`-style indirection against the controller's own environment.
    #[must_use]
    pub fn resolved_env(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(k, v)| {
                let resolved = if let Some(inner) = v
                    .strip_prefix("${")
                    .and_then(|s| s.strip_suffix('}'))
                {
                    std::env::var(inner).unwrap_or_default()
                } else {
                    v.clone()
                };
                (k.clone(), resolved)
            })
            .collect()
    }

    /// Substitute `{prompt}`/`{resume}`/`{image}` placeholders in a template.
    #[must_use]
    pub fn render_template(
        template: &[String],
        prompt: &str,
        resume: Option<&str>,
        image: Option<&str>,
    ) -> Vec<String> {
        template
            .iter()
            .filter_map(|arg| {
                if arg.contains("{resume}") && resume.is_none() {
                    return None;
                }
                if arg.contains("{image}") && image.is_none() {
                    return None;
                }
                let mut out = arg.replace("{prompt}", prompt);
                if let Some(r) = resume {
                    out = out.replace("{resume}", r);
                }
                if let Some(i) = image {
                    out = out.replace("{image}", i);
                }
                Some(out)
            })
            .collect()
    }
}

/// Output pipeline tuning (§6 `defaults.output.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDefaults {
    pub inline_limit: usize,
    pub head_chars: usize,
    pub tail_chars: usize,
    pub flush_delay_ms: u64,
}

impl Default for OutputDefaults {
    fn default() -> Self {
        Self {
            inline_limit: 3500,
            head_chars: 1000,
            tail_chars: 2000,
            flush_delay_ms: 400,
        }
    }
}

/// `defaults.*` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    pub workdir: PathBuf,
    pub state_path: PathBuf,
    pub toolhelp_path: PathBuf,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_sec: u64,
    #[serde(default = "default_headless_timeout")]
    pub headless_timeout_sec: u64,
    #[serde(default)]
    pub output: OutputDefaults,
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_headless_timeout() -> u64 {
    300
}

/// `rpc.*` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub token: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_port(),
            token: None,
        }
    }
}

/// `queue.*` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_cap")]
    pub max_per_session: usize,
}

fn default_queue_cap() -> usize {
    32
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_per_session: default_queue_cap(),
        }
    }
}

/// Top-level typed configuration handed to the core at construction (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub tools: HashMap<String, ToolConfig>,
    pub defaults: Defaults,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Config {
    pub fn tool(&self, name: &str) -> Option<&ToolConfig> {
        self.tools.get(name)
    }
}
