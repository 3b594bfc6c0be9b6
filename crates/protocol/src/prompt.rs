//! Prompt detection and response collection.
//!
//! A command's response is every data byte received after the command was
//! written, up to the point where the shell prompt shows up at the end of
//! the accumulated output.

use std::fmt;

use regex::bytes::Regex;

use crate::error::{ProtocolError, Result};

/// Prompt used when none is configured.
pub const DEFAULT_PROMPT: &str = "/ # ";

/// Upper bound on a single command's collected output (16 MB).
pub const MAX_RESPONSE_SIZE: usize = 16 * 1024 * 1024;

/// Byte pattern marking the end of a command's output.
#[derive(Debug, Clone)]
pub enum PromptPattern {
    /// Exact byte sequence.
    Literal(Vec<u8>),
    /// Regular expression, matched at the end of the output.
    Regex {
        /// The expression anchored to the end of input.
        at_end: Regex,
        /// The same expression anchored to the start of input.
        at_start: Regex,
    },
}

impl PromptPattern {
    /// Create a literal prompt. Empty prompts are rejected.
    pub fn literal(prompt: impl Into<Vec<u8>>) -> Result<Self> {
        let prompt = prompt.into();
        if prompt.is_empty() {
            return Err(ProtocolError::InvalidPrompt(
                "prompt must not be empty".to_string(),
            ));
        }
        Ok(PromptPattern::Literal(prompt))
    }

    /// Create a regex prompt. The expression only matches at the end of the output.
    pub fn regex(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(ProtocolError::InvalidPrompt(
                "prompt must not be empty".to_string(),
            ));
        }
        let at_end = Regex::new(&format!(r"(?:{})\z", pattern))?;
        if at_end.is_match(b"") {
            return Err(ProtocolError::InvalidPrompt(format!(
                "prompt pattern {:?} matches empty output",
                pattern
            )));
        }
        let at_start = Regex::new(&format!(r"\A(?:{})", pattern))?;
        Ok(PromptPattern::Regex { at_end, at_start })
    }

    /// Find the prompt at the end of `output`.
    ///
    /// Returns the index where the prompt starts.
    pub fn find_at_end(&self, output: &[u8]) -> Option<usize> {
        match self {
            PromptPattern::Literal(prompt) => output
                .ends_with(prompt)
                .then(|| output.len() - prompt.len()),
            PromptPattern::Regex { at_end, .. } => at_end
                .find(output)
                .filter(|m| m.end() == output.len())
                .map(|m| m.start()),
        }
    }

    /// Length of the prompt at the start of `output`, if there is one.
    fn find_at_start(&self, output: &[u8]) -> Option<usize> {
        let len = match self {
            PromptPattern::Literal(prompt) => output.starts_with(prompt).then(|| prompt.len()),
            PromptPattern::Regex { at_start, .. } => at_start.find(output).map(|m| m.end()),
        };
        len.filter(|len| *len > 0)
    }

    /// Skip prompts (and the blank lines around them) at the start of `output`.
    fn strip_leading<'a>(&self, mut output: &'a [u8]) -> &'a [u8] {
        loop {
            output = trim_start_terminators(output);
            match self.find_at_start(output) {
                Some(len) => output = &output[len..],
                None => return output,
            }
        }
    }
}

impl Default for PromptPattern {
    fn default() -> Self {
        PromptPattern::Literal(DEFAULT_PROMPT.as_bytes().to_vec())
    }
}

impl PartialEq for PromptPattern {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PromptPattern::Literal(a), PromptPattern::Literal(b)) => a == b,
            (PromptPattern::Regex { at_end: a, .. }, PromptPattern::Regex { at_end: b, .. }) => {
                a.as_str() == b.as_str()
            }
            _ => false,
        }
    }
}

impl Eq for PromptPattern {}

impl fmt::Display for PromptPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptPattern::Literal(prompt) => write!(f, "{:?}", String::from_utf8_lossy(prompt)),
            PromptPattern::Regex { at_end, .. } => write!(f, "/{}/", at_end.as_str()),
        }
    }
}

/// Output of one command once collection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Output with the echo and the prompt removed.
    pub output: Vec<u8>,
    /// Whether the prompt was seen.
    pub complete: bool,
}

/// Accumulates output for one command until the prompt appears.
///
/// A prompt with nothing but other prompts or blank lines in front of it
/// is a leftover from before the command and does not end collection.
#[derive(Debug, Clone)]
pub struct ResponseCollector {
    command: Vec<u8>,
    prompt: PromptPattern,
    buffer: Vec<u8>,
    /// Where this command's output begins once the echo has been found.
    body_start: Option<usize>,
    /// Output before the echo belongs to an earlier command.
    require_echo: bool,
    prompt_start: Option<usize>,
}

impl ResponseCollector {
    /// Start collecting for `command`.
    pub fn new(command: impl Into<Vec<u8>>, prompt: PromptPattern) -> Self {
        Self {
            command: command.into(),
            prompt,
            buffer: Vec::new(),
            body_start: None,
            require_echo: false,
            prompt_start: None,
        }
    }

    /// Start collecting for `command` on a stream that may still carry
    /// output of an earlier command.
    ///
    /// Everything up to the echoed command line, which must follow a
    /// prompt or open the stream, is skipped. Falls back to
    /// [`ResponseCollector::new`] for an empty command.
    pub fn after_echo(command: impl Into<Vec<u8>>, prompt: PromptPattern) -> Self {
        let mut collector = Self::new(command, prompt);
        collector.require_echo = !collector.command.is_empty();
        collector
    }

    /// Append output bytes. Returns `true` once the prompt has been seen.
    ///
    /// Bytes past [`MAX_RESPONSE_SIZE`] are dropped.
    pub fn push(&mut self, data: &[u8]) -> bool {
        if self.is_complete() {
            return true;
        }
        let room = MAX_RESPONSE_SIZE.saturating_sub(self.buffer.len());
        let take = data.len().min(room);
        if take == 0 {
            return false;
        }

        let rescan_from = self.buffer.len().saturating_sub(self.command.len());
        self.buffer.extend_from_slice(&data[..take]);

        if self.require_echo && self.body_start.is_none() {
            self.body_start = self.locate_echo(rescan_from);
        }
        self.prompt_start = self.locate_prompt();
        self.is_complete()
    }

    /// End of the first echoed command line at or after `from` that opens
    /// the stream or follows a prompt.
    fn locate_echo(&self, from: usize) -> Option<usize> {
        let command = self.command.as_slice();
        let mut at = from;
        while let Some(offset) = find(&self.buffer[at..], command) {
            let start = at + offset;
            let end = start + command.len();
            if matches!(self.buffer.get(end), Some(b'\r') | Some(b'\n')) {
                let before = &self.buffer[..start];
                if trim_start_terminators(before).is_empty()
                    || self.prompt.find_at_end(before).is_some()
                {
                    return Some(end);
                }
            }
            at = start + 1;
        }
        None
    }

    fn locate_prompt(&self) -> Option<usize> {
        if self.require_echo {
            let body_start = self.body_start?;
            return self
                .prompt
                .find_at_end(&self.buffer[body_start..])
                .map(|start| body_start + start);
        }

        let start = self.prompt.find_at_end(&self.buffer)?;
        let head = self.prompt.strip_leading(&self.buffer[..start]);
        (!trim_start_terminators(head).is_empty()).then_some(start)
    }

    /// Whether the prompt has been seen.
    pub fn is_complete(&self) -> bool {
        self.prompt_start.is_some()
    }

    /// Whether the output reached [`MAX_RESPONSE_SIZE`].
    pub fn is_full(&self) -> bool {
        self.buffer.len() >= MAX_RESPONSE_SIZE
    }

    /// Bytes collected so far, prompt included.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `true` if nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Stop collecting and extract the command output.
    pub fn finish(self) -> Response {
        let complete = self.is_complete();
        let end = self.prompt_start.unwrap_or(self.buffer.len());
        let body = match self.body_start {
            Some(start) => &self.buffer[start..end],
            None => {
                let output = self.prompt.strip_leading(&self.buffer[..end]);
                strip_echo(output, &self.command)
            }
        };
        Response {
            output: trim_line_terminators(body).to_vec(),
            complete,
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Remove the echoed command line from the start of the output.
fn strip_echo<'a>(output: &'a [u8], command: &[u8]) -> &'a [u8] {
    let body = trim_start_terminators(output);
    if command.is_empty() || !body.starts_with(command) {
        return body;
    }
    let rest = &body[command.len()..];
    match rest.first() {
        None | Some(b'\r') | Some(b'\n') => rest,
        Some(_) => body,
    }
}

fn is_terminator(byte: &u8) -> bool {
    matches!(byte, b'\r' | b'\n')
}

fn trim_start_terminators(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !is_terminator(b))
        .unwrap_or(bytes.len());
    &bytes[start..]
}

fn trim_line_terminators(bytes: &[u8]) -> &[u8] {
    let bytes = trim_start_terminators(bytes);
    let end = bytes
        .iter()
        .rposition(|b| !is_terminator(b))
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(command: &str, prompt: PromptPattern, chunks: &[&[u8]]) -> Response {
        let mut collector = ResponseCollector::new(command, prompt);
        for chunk in chunks {
            collector.push(chunk);
        }
        collector.finish()
    }

    #[test]
    fn test_default_prompt() {
        assert_eq!(
            PromptPattern::default(),
            PromptPattern::literal("/ # ").unwrap()
        );
    }

    #[test]
    fn test_empty_prompts_rejected() {
        assert!(matches!(
            PromptPattern::literal(""),
            Err(ProtocolError::InvalidPrompt(_))
        ));
        assert!(matches!(
            PromptPattern::regex(""),
            Err(ProtocolError::InvalidPrompt(_))
        ));
    }

    #[test]
    fn test_regex_matching_empty_output_rejected() {
        for pattern in ["[#$]?", "x*", "(?:)", "$"] {
            assert!(
                matches!(PromptPattern::regex(pattern), Err(ProtocolError::InvalidPrompt(_))),
                "{} accepted",
                pattern
            );
        }
        assert!(PromptPattern::regex("[#$] ?").is_ok());
    }

    #[test]
    fn test_invalid_regex_rejected() {
        assert!(matches!(
            PromptPattern::regex("[unclosed"),
            Err(ProtocolError::InvalidPrompt(_))
        ));
    }

    #[test]
    fn test_literal_find_at_end() {
        let prompt = PromptPattern::literal("/ # ").unwrap();
        assert_eq!(prompt.find_at_end(b"out\r\n/ # "), Some(5));
        assert_eq!(prompt.find_at_end(b"/ # more"), None);
        assert_eq!(prompt.find_at_end(b"/ #"), None);
    }

    #[test]
    fn test_regex_matches_only_at_end() {
        let prompt = PromptPattern::regex(r"[$#] ").unwrap();
        assert_eq!(prompt.find_at_end(b"user@host:~$ "), Some(11));
        assert_eq!(prompt.find_at_end(b"price $ 5"), None);
        assert_eq!(prompt.find_at_end(b"root# "), Some(4));
    }

    #[test]
    fn test_regex_alternation_is_anchored_as_a_whole() {
        let prompt = PromptPattern::regex(r"> |# ").unwrap();
        assert_eq!(prompt.find_at_end(b"a> b"), None);
        assert_eq!(prompt.find_at_end(b"router# "), Some(6));
    }

    #[test]
    fn test_prompt_display() {
        assert_eq!(PromptPattern::default().to_string(), "\"/ # \"");
        assert_eq!(PromptPattern::regex("[$#] ").unwrap().to_string(), "/(?:[$#] )\\z/");
    }

    #[test]
    fn test_prompt_equality() {
        assert_eq!(
            PromptPattern::regex("# ").unwrap(),
            PromptPattern::regex("# ").unwrap()
        );
        assert_ne!(
            PromptPattern::regex("# ").unwrap(),
            PromptPattern::literal("# ").unwrap()
        );
    }

    #[test]
    fn test_echo_and_prompt_stripped() {
        let response = collect(
            "ls",
            PromptPattern::default(),
            &[b"ls\r\ndir1 dir2\r\n/ # "],
        );
        assert_eq!(response.output, b"dir1 dir2".to_vec());
        assert!(response.complete);
    }

    #[test]
    fn test_prompt_split_across_chunks() {
        let response = collect(
            "ls",
            PromptPattern::default(),
            &[b"ls\r\ndir1", b" dir2\r\n/ ", b"# "],
        );
        assert_eq!(response.output, b"dir1 dir2".to_vec());
        assert!(response.complete);
    }

    #[test]
    fn test_output_without_echo() {
        let response = collect("uptime", PromptPattern::default(), &[b"up 3 days\r\n/ # "]);
        assert_eq!(response.output, b"up 3 days".to_vec());
    }

    #[test]
    fn test_echo_prefix_of_longer_word_kept() {
        let response = collect("ls", PromptPattern::default(), &[b"lsblk output\r\n/ # "]);
        assert_eq!(response.output, b"lsblk output".to_vec());
    }

    #[test]
    fn test_multiline_output_preserved() {
        let response = collect(
            "cat f",
            PromptPattern::default(),
            &[b"cat f\r\nline one\r\n\r\nline three\r\n/ # "],
        );
        assert_eq!(response.output, b"line one\r\n\r\nline three".to_vec());
    }

    #[test]
    fn test_command_with_no_output() {
        let response = collect("true", PromptPattern::default(), &[b"true\r\n/ # "]);
        assert!(response.output.is_empty());
        assert!(response.complete);
    }

    #[test]
    fn test_truncated_keeps_everything_received() {
        let response = collect(
            "sleep 10",
            PromptPattern::default(),
            &[b"sleep 10\r\npartial"],
        );
        assert_eq!(response.output, b"partial".to_vec());
        assert!(!response.complete);
    }

    #[test]
    fn test_nothing_received() {
        let response = collect("x", PromptPattern::default(), &[]);
        assert!(response.output.is_empty());
        assert!(!response.complete);
    }

    #[test]
    fn test_push_after_complete_is_ignored() {
        let mut collector = ResponseCollector::new("ls", PromptPattern::default());
        assert!(collector.push(b"ls\r\nx\r\n/ # "));
        assert!(collector.push(b"late bytes"));
        assert_eq!(collector.finish().output, b"x".to_vec());
    }

    #[test]
    fn test_regex_prompt_response() {
        let response = collect(
            "id",
            PromptPattern::regex(r"\w+@\w+:[^\r\n]*[$#] ").unwrap(),
            &[b"id\r\nuid=0(root)\r\nroot@box:~# "],
        );
        assert_eq!(response.output, b"uid=0(root)".to_vec());
        assert!(response.complete);
    }

    #[test]
    fn test_leftover_prompt_before_echo_ignored() {
        let mut collector = ResponseCollector::new("ls", PromptPattern::default());
        assert!(!collector.push(b"/ # "));
        assert!(!collector.push(b"\r\n/ # "));
        assert!(collector.push(b"ls\r\ndir1 dir2\r\n/ # "));
        let response = collector.finish();
        assert_eq!(response.output, b"dir1 dir2".to_vec());
        assert!(response.complete);
    }

    #[test]
    fn test_leftover_regex_prompt_in_same_chunk() {
        let response = collect(
            "id",
            PromptPattern::regex(r"\w+@\w+:\S*[$#] ").unwrap(),
            &[b"root@box:~# id\r\nuid=0\r\nroot@box:~# "],
        );
        assert_eq!(response.output, b"uid=0".to_vec());
        assert!(response.complete);
    }

    #[test]
    fn test_after_echo_skips_earlier_output() {
        let mut collector = ResponseCollector::after_echo("echo", PromptPattern::default());
        assert!(!collector.push(b"slow\r\nlate answer\r\n/ # "));
        assert!(!collector.push(b"ech"));
        assert!(collector.push(b"o\r\nran echo\r\n/ # "));
        let response = collector.finish();
        assert_eq!(response.output, b"ran echo".to_vec());
        assert!(response.complete);
    }

    #[test]
    fn test_after_echo_needs_prompt_before_echo() {
        // The command text inside earlier output is not its echo.
        let mut collector = ResponseCollector::after_echo("ls", PromptPattern::default());
        assert!(!collector.push(b"tail\r\nls\r\n/ # "));
        assert!(collector.push(b"ls\r\na b\r\n/ # "));
        assert_eq!(collector.finish().output, b"a b".to_vec());
    }

    #[test]
    fn test_after_echo_without_echo_keeps_everything() {
        let mut collector = ResponseCollector::after_echo("top", PromptPattern::default());
        collector.push(b"old output\r\n");
        let response = collector.finish();
        assert!(!response.complete);
        assert_eq!(response.output, b"old output".to_vec());
    }

    #[test]
    fn test_collector_bounded() {
        let mut collector = ResponseCollector::new("yes", PromptPattern::default());
        let chunk = vec![b'y'; 1024 * 1024];
        for _ in 0..17 {
            collector.push(&chunk);
        }
        assert!(collector.is_full());
        assert_eq!(collector.len(), MAX_RESPONSE_SIZE);
        assert!(!collector.is_complete());
    }
}
