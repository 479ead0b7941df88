//! Output windowing, ANSI rendering, and the per-destination delivery
//! pipeline for completed prompt output (C3, §4.3).
//!
//! This module keeps the teacher's `strip_ansi` helper and adds the
//! size/ordering/flush machinery the spec actually needs: classifying a
//! completed result as inline text or a rendered HTML artifact, and
//! serializing delivery to a destination so concurrent sessions never
//! interleave mid-message. The teacher's line-based `window`/`extract_errors`
//! helpers (build/test error-line surfacing for an LLM-facing shell tool)
//! have no counterpart in §4.3's char-based truncation and were dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::OutputDefaults;

// ---------------------------------------------------------------------------
// ANSI escape code stripping (for PTY output)
// ---------------------------------------------------------------------------

/// Regex matching ANSI escape sequences (CSI sequences, OSC sequences, etc.).
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\x1b\[[0-9;?<=>!]*[a-zA-Z~]|\x1b\][^\x07]*\x07|\x1b[()][0-9A-B]|\x1b[a-zA-Z]|.\x08",
    )
    .expect("invalid ANSI regex")
});

/// Strip ANSI escape codes from a string.
#[must_use]
pub fn strip_ansi(s: &str) -> String {
    ANSI_ESCAPE.replace_all(s, "").to_string()
}

// ---------------------------------------------------------------------------
// ANSI -> HTML rendering for overlong outputs (§4.3 point 2)
// ---------------------------------------------------------------------------

static SGR_ESCAPE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\x1b\[([0-9;]*)m").unwrap());

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Map a sequence of `;`-separated SGR codes to an inline CSS style, or
/// `None` if the codes amount to a plain reset.
fn sgr_style(codes: &str) -> Option<String> {
    let mut decls = Vec::new();
    for code in codes.split(';').filter(|c| !c.is_empty()) {
        match code.parse::<u16>() {
            Ok(0) => decls.clear(),
            Ok(1) => decls.push("font-weight:bold".to_string()),
            Ok(3) => decls.push("font-style:italic".to_string()),
            Ok(4) => decls.push("text-decoration:underline".to_string()),
            Ok(n @ 30..=37) => decls.push(format!("color:{}", ansi_color(n - 30, false))),
            Ok(n @ 90..=97) => decls.push(format!("color:{}", ansi_color(n - 90, true))),
            Ok(n @ 40..=47) => decls.push(format!("background-color:{}", ansi_color(n - 40, false))),
            Ok(n @ 100..=107) => {
                decls.push(format!("background-color:{}", ansi_color(n - 100, true)));
            }
            _ => {}
        }
    }
    if decls.is_empty() {
        None
    } else {
        Some(decls.join(";"))
    }
}

fn ansi_color(index: u16, bright: bool) -> &'static str {
    match (index, bright) {
        (0, false) => "#000000",
        (1, false) => "#aa0000",
        (2, false) => "#00aa00",
        (3, false) => "#aa5500",
        (4, false) => "#0000aa",
        (5, false) => "#aa00aa",
        (6, false) => "#00aaaa",
        (7, false) => "#aaaaaa",
        (0, true) => "#555555",
        (1, true) => "#ff5555",
        (2, true) => "#55ff55",
        (3, true) => "#ffff55",
        (4, true) => "#5555ff",
        (5, true) => "#ff55ff",
        (6, true) => "#55ffff",
        (7, true) => "#ffffff",
        _ => "inherit",
    }
}

/// Render raw (ANSI-decorated) output as a self-contained HTML fragment,
/// converting SGR color/style codes into inline `<span>` styling and
/// dropping every other escape sequence (cursor movement, OSC, etc.).
#[must_use]
pub fn render_html(raw: &str) -> String {
    let mut out = String::from("<pre>");
    let mut last = 0;
    let mut open = false;

    for caps in SGR_ESCAPE.captures_iter(raw) {
        let whole = caps.get(0).unwrap();
        let text = strip_ansi(&raw[last..whole.start()]);
        out.push_str(&html_escape(&text));

        let codes = caps.get(1).map_or("", |g| g.as_str());
        if open {
            out.push_str("</span>");
            open = false;
        }
        if let Some(style) = sgr_style(codes) {
            out.push_str(&format!("<span style=\"{style}\">"));
            open = true;
        }
        last = whole.end();
    }
    out.push_str(&html_escape(&strip_ansi(&raw[last..])));
    if open {
        out.push_str("</span>");
    }
    out.push_str("</pre>");
    out
}

// ---------------------------------------------------------------------------
// Size decision and delivery pipeline (§4.3 points 2-5)
// ---------------------------------------------------------------------------

const TRUNCATION_MARKER: &str = "\n... [truncated] ...\n";

/// What a completed prompt-output pair resolves to once sized against
/// `inline_limit`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputPayload {
    Inline { text: String },
    Artifact { preview: String, html_path: PathBuf },
}

impl OutputPayload {
    /// The plain text a summarizer should see: the full output for an
    /// inline payload, the preview for an artifact (the full text has
    /// already been rendered to disk).
    #[must_use]
    pub fn summarizable_text<'a>(&'a self, full_plain: &'a str) -> &'a str {
        match self {
            Self::Inline { .. } => full_plain,
            Self::Artifact { preview, .. } => preview,
        }
    }
}

fn take_front_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn take_back_chars(s: &str, n: usize) -> &str {
    let total = s.chars().count();
    if total <= n {
        return s;
    }
    let skip = total - n;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Classify and (if needed) render a completed result to an HTML artifact.
///
/// Sanitises ANSI for the size decision, keeping the raw bytes for the
/// artifact render. An output of exactly `inline_limit` characters is still
/// inline; `inline_limit + 1` crosses into artifact territory.
pub fn prepare_payload(
    raw: &str,
    cfg: &OutputDefaults,
    artifact_dir: &Path,
) -> std::io::Result<OutputPayload> {
    let plain = strip_ansi(raw);
    if plain.chars().count() <= cfg.inline_limit {
        return Ok(OutputPayload::Inline { text: plain });
    }

    std::fs::create_dir_all(artifact_dir)?;
    let file_name = format!("{}.html", uuid::Uuid::new_v4());
    let html_path = artifact_dir.join(file_name);
    std::fs::write(&html_path, render_html(raw))?;

    let head = take_front_chars(&plain, cfg.head_chars);
    let tail = take_back_chars(&plain, cfg.tail_chars);
    let preview = format!("{head}{TRUNCATION_MARKER}{tail}");

    Ok(OutputPayload::Artifact { preview, html_path })
}

/// Event handed to a destination's sink, in emission order.
#[derive(Debug, Clone)]
pub enum OutputEvent {
    /// Emitted before the payload, per §4.3 point 5. Summarizer failures
    /// never suppress the payload that follows.
    Summary { session_id: String, text: String },
    Payload {
        session_id: String,
        payload: OutputPayload,
    },
}

struct DestinationState {
    last_flush: Instant,
    rescheduled: bool,
}

/// Serializes delivery of completed prompt-output pairs to their
/// destinations, preserving per-destination ordering and applying the
/// flush-delay coalescing policy from §4.3 point 4.
pub struct OutputPipeline {
    cfg: OutputDefaults,
    artifact_dir: PathBuf,
    sink: std::sync::Arc<dyn Fn(&str, OutputEvent) + Send + Sync>,
    destinations: AsyncMutex<HashMap<String, DestinationState>>,
}

impl OutputPipeline {
    pub fn new(
        cfg: OutputDefaults,
        artifact_dir: PathBuf,
        sink: impl Fn(&str, OutputEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            cfg,
            artifact_dir,
            sink: std::sync::Arc::new(sink),
            destinations: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Deliver one completed `(session_id, destination, raw)` triple.
    ///
    /// `summarize`, if given, is run against the plain text before the
    /// payload is emitted; its result (or lack of one) never blocks the
    /// payload from reaching the sink.
    pub async fn publish(
        &self,
        destination: &str,
        session_id: &str,
        raw: &str,
        summarize: Option<&(dyn Fn(&str) -> anyhow::Result<String> + Send + Sync)>,
    ) -> std::io::Result<()> {
        let payload = prepare_payload(raw, &self.cfg, &self.artifact_dir)?;
        let plain = strip_ansi(raw);

        // Holding the destination's entry across the whole publish call is
        // what gives per-destination ordering at message boundaries: a
        // concurrently publishing session blocks here rather than
        // interleaving with this message's emission.
        let mut destinations = self.destinations.lock().await;
        let entry = destinations
            .entry(destination.to_string())
            .or_insert_with(|| DestinationState {
                last_flush: Instant::now() - Duration::from_secs(3600),
                rescheduled: false,
            });

        let flush_delay = Duration::from_millis(self.cfg.flush_delay_ms);
        let since_last = entry.last_flush.elapsed();
        let fits_inline = matches!(&payload, OutputPayload::Inline { text } if text.len() <= self.cfg.inline_limit);

        if fits_inline && since_last < flush_delay && !entry.rescheduled {
            entry.rescheduled = true;
            let remaining = flush_delay - since_last;
            drop(destinations);
            tokio::time::sleep(remaining).await;
            destinations = self.destinations.lock().await;
            if let Some(entry) = destinations.get_mut(destination) {
                entry.rescheduled = false;
            }
        } else if let Some(entry) = destinations.get_mut(destination) {
            entry.rescheduled = false;
        }

        if let Some(summarize) = summarize {
            match summarize(payload.summarizable_text(&plain)) {
                Ok(text) => (self.sink)(
                    destination,
                    OutputEvent::Summary {
                        session_id: session_id.to_string(),
                        text,
                    },
                ),
                Err(err) => {
                    tracing::warn!(destination, session_id, error = %err, "summarizer failed");
                }
            }
        }

        (self.sink)(
            destination,
            OutputEvent::Payload {
                session_id: session_id.to_string(),
                payload,
            },
        );

        if let Some(entry) = destinations.get_mut(destination) {
            entry.last_flush = Instant::now();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn inline_limit_boundary() {
        let cfg = OutputDefaults {
            inline_limit: 10,
            head_chars: 3,
            tail_chars: 3,
            flush_delay_ms: 0,
        };
        let dir = std::env::temp_dir().join("agentctl-test-artifacts");
        let exact = "a".repeat(10);
        let payload = prepare_payload(&exact, &cfg, &dir).unwrap();
        assert!(matches!(payload, OutputPayload::Inline { .. }));

        let over = "a".repeat(11);
        let payload = prepare_payload(&over, &cfg, &dir).unwrap();
        assert!(matches!(payload, OutputPayload::Artifact { .. }));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn render_html_wraps_sgr_in_spans() {
        let html = render_html("\x1b[1;31merror\x1b[0m plain");
        assert!(html.contains("<span style=\"font-weight:bold;color:#aa0000\">error</span>"));
        assert!(html.contains("plain"));
        assert!(!html.contains("\x1b"));
    }

    #[test]
    fn render_html_escapes_and_drops_non_sgr_escapes() {
        let html = render_html("a < b && \x1b[2Jc");
        assert!(html.contains("a &lt; b &amp;&amp; c"));
    }

    #[tokio::test]
    async fn publish_delivers_summary_before_payload_even_on_summary_error() {
        let cfg = OutputDefaults {
            inline_limit: 100,
            head_chars: 10,
            tail_chars: 10,
            flush_delay_ms: 0,
        };
        let dir = std::env::temp_dir().join("agentctl-test-pipeline");
        let events: std::sync::Arc<StdMutex<Vec<String>>> =
            std::sync::Arc::new(StdMutex::new(Vec::new()));
        let events_clone = events.clone();
        let pipeline = OutputPipeline::new(cfg, dir.clone(), move |_dest, ev| {
            let label = match ev {
                OutputEvent::Summary { .. } => "summary",
                OutputEvent::Payload { .. } => "payload",
            };
            events_clone.lock().unwrap().push(label.to_string());
        });

        let failing = |_: &str| -> anyhow::Result<String> { Err(anyhow::anyhow!("boom")) };
        pipeline
            .publish("chat:1", "sess-1", "hello world", Some(&failing))
            .await
            .unwrap();

        // Summarizer failed, so only the payload event should have landed.
        assert_eq!(*events.lock().unwrap(), vec!["payload".to_string()]);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
