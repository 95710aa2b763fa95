// MIT License - Copyright (c) 2026 pico-sync contributors
// Wait patterns, REPL modes and response framing

use std::fmt;

use regex::bytes::Regex;

use crate::constants::{
    CONTROL_CHARS, CTRL_A, CTRL_B, CTRL_D, CTRL_E, CTRL_F, FRIENDLY_PROMPT,
    RAW_PROMPT_PATTERN,
};
use crate::error::{BoardError, Result};

/// REPL mode of the connected board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplStatus {
    Disconnected,
    Connected,
    FriendlyRepl,
    RawRepl,
    PasteMode,
}

impl ReplStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplStatus::Disconnected => "disconnected",
            ReplStatus::Connected => "connected",
            ReplStatus::FriendlyRepl => "friendly REPL",
            ReplStatus::RawRepl => "raw REPL",
            ReplStatus::PasteMode => "paste mode",
        }
    }
}

impl fmt::Display for ReplStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a pending wait is looking for in the receive buffer.
#[derive(Debug, Clone)]
pub enum WaitPattern {
    /// Substring, subject to the mode-dependent prompt rules
    Literal(String),
    /// Regular expression over the raw buffer bytes
    Regex(Regex),
    /// Buffer holds at least this many bytes
    ByteLength(usize),
}

impl WaitPattern {
    pub fn literal(text: impl Into<String>) -> Self {
        WaitPattern::Literal(text.into())
    }

    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(WaitPattern::Regex)
            .map_err(|e| BoardError::InvalidResponse {
                details: format!("bad wait pattern {pattern:?}: {e}"),
            })
    }

    /// A regex matching `text` literally, exempt from the prompt rules.
    pub fn exact(text: &str) -> Result<Self> {
        Self::regex(&regex::escape(text))
    }

    /// End of a raw REPL response: `EOT >`.
    pub fn raw_prompt() -> Result<Self> {
        Self::regex(RAW_PROMPT_PATTERN)
    }
}

impl fmt::Display for WaitPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitPattern::Literal(text) => write!(f, "{text:?}"),
            WaitPattern::Regex(re) => write!(f, "/{}/", re.as_str()),
            WaitPattern::ByteLength(n) => write!(f, "{n} bytes"),
        }
    }
}

/// Whether `command` is exactly one REPL control character.
pub fn is_control_char(command: &str) -> bool {
    CONTROL_CHARS.contains(&command)
}

/// Terminate `command` for sending in the given mode: a line break unless it
/// is a bare control character or already ends with Ctrl-D, plus Ctrl-D to
/// execute in the raw REPL.
pub fn prepare_command(command: &str, status: ReplStatus) -> String {
    let mut prepared = command.to_string();
    let control = is_control_char(command);

    if !control && !prepared.ends_with("\r\n") && !prepared.ends_with(CTRL_D) {
        prepared.push_str("\r\n");
    }
    if status == ReplStatus::RawRepl && !control && !prepared.ends_with(CTRL_D) {
        prepared.push_str(CTRL_D);
    }
    prepared
}

/// Mode the board is in once the response to `command` has been matched.
pub fn transition_for(command: &str, status: ReplStatus) -> Option<ReplStatus> {
    let trimmed = command.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return None;
    }
    if trimmed == CTRL_A {
        return Some(ReplStatus::RawRepl);
    }
    if trimmed == CTRL_B || trimmed == CTRL_F {
        return Some(ReplStatus::FriendlyRepl);
    }
    if trimmed == CTRL_E {
        return Some(ReplStatus::PasteMode);
    }
    if trimmed == CTRL_D && status == ReplStatus::PasteMode {
        return Some(ReplStatus::FriendlyRepl);
    }
    if trimmed.chars().all(|c| c == '\x03') && status != ReplStatus::RawRepl {
        return Some(ReplStatus::FriendlyRepl);
    }
    None
}

/// Strip raw REPL framing: `OK<stdout>\x04<stderr>\x04>` becomes stdout
/// followed by stderr.
pub fn strip_raw_framing(received: &str) -> String {
    let body = received
        .strip_prefix("OK")
        .or_else(|| received.strip_prefix(">OK"))
        .unwrap_or(received);

    let mut sections = body.splitn(3, '\x04');
    let stdout = sections.next().unwrap_or_default();
    let stderr = sections.next().unwrap_or_default();
    format!("{stdout}{stderr}")
}

/// Strip friendly REPL framing: the echoed command and the trailing prompt.
pub fn strip_friendly_framing(received: &str, command: &str) -> String {
    let body = received.strip_prefix(command).unwrap_or(received);
    body.strip_suffix(FRIENDLY_PROMPT).unwrap_or(body).to_string()
}

/// Remove the common leading indentation of a code selection so it can be
/// executed at module level.
pub fn trim_indent(code: &str) -> String {
    let indent = code
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);

    code.lines()
        .map(|line| line.get(indent..).unwrap_or_else(|| line.trim_start()))
        .collect::<Vec<_>>()
        .join("\r\n")
}
