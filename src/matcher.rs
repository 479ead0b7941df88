//! Incremental regex matching over a rolling output window (C1, §4.1).
//!
//! `StreamMatcher` watches combined stdout+stderr from an interactive
//! subprocess and raises three kinds of event without ever re-scanning the
//! full history: prompt readiness, resume-token extraction, and activity
//! ticks for the idle watchdog. Matching happens against an ANSI-stripped
//! "clean" view; the raw view (with escape codes intact) is left to the
//! caller for downstream rendering (§4.3).

use std::collections::VecDeque;

use regex::Regex;

use crate::output::strip_ansi;

/// Bytes of raw output retained. Large enough that a prompt or resume token
/// can't straddle an eviction boundary in practice.
const WINDOW_BYTES: usize = 64 * 1024;
/// Chars of ANSI-stripped output retained for regex matching.
const WINDOW_CHARS: usize = 64 * 1024;
/// Net bytes of output that force an activity tick even without a token hit.
const ACTIVITY_TICK_BYTES: usize = 128;
/// How much of the clean window's tail is checked for prompt readiness.
const PROMPT_TAIL_CHARS: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchEvent {
    PromptReady,
    ResumeToken(String),
    ActivityTick,
}

/// Compiled matching configuration for one tool.
pub struct MatcherConfig {
    pub prompt_regex: Option<Regex>,
    pub resume_regex: Option<Regex>,
    pub activity_tokens: Vec<String>,
}

impl MatcherConfig {
    pub fn compile(
        prompt_regex: Option<&str>,
        resume_regex: Option<&str>,
        activity_tokens: Vec<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            prompt_regex: prompt_regex.map(Regex::new).transpose()?,
            resume_regex: resume_regex.map(Regex::new).transpose()?,
            activity_tokens,
        })
    }
}

/// Rolling-window incremental matcher for one interactive subprocess stream.
pub struct StreamMatcher {
    cfg: MatcherConfig,
    raw_window: VecDeque<u8>,
    clean_window: String,
    resume_token: Option<String>,
    /// True once `prompt_regex` has matched the tail since the last chunk
    /// whose tail did *not* match -- implements the debounce in §4.1.
    prompt_armed: bool,
    bytes_since_tick: usize,
}

impl StreamMatcher {
    #[must_use]
    pub fn new(cfg: MatcherConfig) -> Self {
        Self {
            cfg,
            raw_window: VecDeque::with_capacity(WINDOW_BYTES.min(4096)),
            clean_window: String::new(),
            resume_token: None,
            prompt_armed: false,
            bytes_since_tick: 0,
        }
    }

    /// Currently extracted resume token, if any.
    #[must_use]
    pub fn resume_token(&self) -> Option<&str> {
        self.resume_token.as_deref()
    }

    /// The compiled `prompt_regex`, if this tool defines one. Lets a driver
    /// strip the matched prompt text back out of a captured response.
    #[must_use]
    pub fn prompt_regex(&self) -> Option<&Regex> {
        self.cfg.prompt_regex.as_ref()
    }

    /// Append a chunk of raw subprocess output and return the events it raised.
    pub fn observe(&mut self, chunk: &[u8]) -> Vec<MatchEvent> {
        let mut events = Vec::new();

        for &b in chunk {
            self.raw_window.push_back(b);
            if self.raw_window.len() > WINDOW_BYTES {
                self.raw_window.pop_front();
            }
        }

        let clean_chunk = strip_ansi(&String::from_utf8_lossy(chunk));
        self.clean_window.push_str(&clean_chunk);
        if self.clean_window.len() > WINDOW_CHARS {
            let excess = self.clean_window.len() - WINDOW_CHARS;
            let boundary = self
                .clean_window
                .char_indices()
                .map(|(i, _)| i)
                .find(|&i| i >= excess)
                .unwrap_or(self.clean_window.len());
            self.clean_window.drain(..boundary);
        }

        // Activity tick: an explicit token substring, or enough accumulated
        // net output since the last tick.
        let token_hit = self
            .cfg
            .activity_tokens
            .iter()
            .any(|t| clean_chunk.contains(t.as_str()));
        self.bytes_since_tick += chunk.len();
        if token_hit || self.bytes_since_tick >= ACTIVITY_TICK_BYTES {
            events.push(MatchEvent::ActivityTick);
            self.bytes_since_tick = 0;
        }

        // Prompt readiness, debounced against the tail of the clean window.
        if let Some(re) = &self.cfg.prompt_regex {
            let tail_start = self
                .clean_window
                .len()
                .saturating_sub(PROMPT_TAIL_CHARS);
            let boundary = self
                .clean_window
                .char_indices()
                .map(|(i, _)| i)
                .find(|&i| i >= tail_start)
                .unwrap_or(0);
            let tail = &self.clean_window[boundary..];
            if re.is_match(tail) {
                if !self.prompt_armed {
                    events.push(MatchEvent::PromptReady);
                    self.prompt_armed = true;
                }
            } else {
                self.prompt_armed = false;
            }
        }

        // Resume token: first match since last reset(), or a changed capture.
        if let Some(re) = &self.cfg.resume_regex {
            if let Some(caps) = re.captures(&self.clean_window) {
                if let Some(group) = caps.get(1) {
                    let value = group.as_str().to_string();
                    let should_fire = self.resume_token.as_deref() != Some(value.as_str());
                    if should_fire {
                        self.resume_token = Some(value.clone());
                        events.push(MatchEvent::ResumeToken(value));
                    }
                }
            }
        }

        events
    }

    /// Clear resume-token state so the next match is treated as "first".
    pub fn reset(&mut self) {
        self.resume_token = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(prompt: &str, resume: &str, tokens: &[&str]) -> StreamMatcher {
        let cfg = MatcherConfig::compile(
            Some(prompt),
            Some(resume),
            tokens.iter().map(|s| s.to_string()).collect(),
        )
        .unwrap();
        StreamMatcher::new(cfg)
    }

    #[test]
    fn prompt_ready_fires_once_per_redraw_burst() {
        let mut m = matcher(r"\$ $", r"thread=([a-f0-9]+)", &[]);
        let ev1 = m.observe(b"welcome\n$ ");
        assert!(ev1.contains(&MatchEvent::PromptReady));
        // Redraw of the same prompt without intervening non-matching output
        // must not refire.
        let ev2 = m.observe(b"$ ");
        assert!(!ev2.contains(&MatchEvent::PromptReady));
        // Non-matching output clears the debounce.
        let ev3 = m.observe(b"running\n");
        assert!(!ev3.contains(&MatchEvent::PromptReady));
        let ev4 = m.observe(b"$ ");
        assert!(ev4.contains(&MatchEvent::PromptReady));
    }

    #[test]
    fn resume_token_first_match_then_changed_only() {
        let mut m = matcher(r"\$ $", r"thread=([a-f0-9]+)", &[]);
        let ev1 = m.observe(b"thread=abc123\n");
        assert_eq!(
            ev1.iter()
                .find(|e| matches!(e, MatchEvent::ResumeToken(_))),
            Some(&MatchEvent::ResumeToken("abc123".to_string()))
        );
        // Same token again: shouldn't refire.
        let ev2 = m.observe(b"thread=abc123\n");
        assert!(ev2.iter().all(|e| !matches!(e, MatchEvent::ResumeToken(_))));
        // Changed token: refires with new value.
        let ev3 = m.observe(b"thread=def456\n");
        assert_eq!(
            ev3.iter()
                .find(|e| matches!(e, MatchEvent::ResumeToken(_))),
            Some(&MatchEvent::ResumeToken("def456".to_string()))
        );
        assert_eq!(m.resume_token(), Some("def456"));
    }

    #[test]
    fn activity_tick_on_token_or_volume() {
        let mut m = matcher(r"\$ $", r"thread=([a-f0-9]+)", &["Thinking"]);
        let ev1 = m.observe(b"Thinking...");
        assert!(ev1.contains(&MatchEvent::ActivityTick));

        let mut m2 = matcher(r"\$ $", r"thread=([a-f0-9]+)", &[]);
        let small = m2.observe(b"ab");
        assert!(!small.contains(&MatchEvent::ActivityTick));
        let big = m2.observe(&vec![b'x'; 200]);
        assert!(big.contains(&MatchEvent::ActivityTick));
    }

    #[test]
    fn ansi_decorated_prompt_matches_stripped_view() {
        let mut m = matcher(r"\$ $", r"thread=([a-f0-9]+)", &[]);
        let ev = m.observe(b"\x1b[32m$ \x1b[0m");
        assert!(ev.contains(&MatchEvent::PromptReady));
    }

    #[test]
    fn reset_allows_resume_token_to_refire() {
        let mut m = matcher(r"\$ $", r"thread=([a-f0-9]+)", &[]);
        m.observe(b"thread=abc123\n");
        m.reset();
        let ev = m.observe(b"thread=abc123\n");
        assert!(ev.iter().any(|e| matches!(e, MatchEvent::ResumeToken(_))));
    }
}
