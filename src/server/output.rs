//! Console output capture.
//!
//! A server's stdout and stderr are read one byte at a time so each line
//! reaches viewers as soon as its terminator arrives. Completed lines are
//! sanitized, kept in a bounded [`VirtualTerminal`] and published to the
//! server's detail topic.

use crate::broadcast::{Broadcaster, Topic};
use crate::server::ServerId;
use futures_lite::{AsyncRead, AsyncReadExt};
use regex::Regex;
use serde_json::json;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::{Arc, LazyLock, Mutex};

/// Line terminator written by server processes on this platform.
#[cfg(windows)]
pub const LINE_TERMINATOR: &[u8] = b"\r\n";
/// Line terminator written by server processes on this platform.
#[cfg(not(windows))]
pub const LINE_TERMINATOR: &[u8] = b"\n";

static ANSI_ESCAPE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b[@-Z\\-_]").ok());

/// Rolling buffer of the most recent console lines of one server.
#[derive(Debug, Clone)]
pub struct VirtualTerminal {
    lines: VecDeque<String>,
    capacity: usize,
}

impl VirtualTerminal {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a line, evicting the oldest one past capacity.
    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Lines oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

/// Shared handle to a server's virtual terminal.
pub type SharedTerminal = Arc<Mutex<VirtualTerminal>>;

/// Streaming line parser for one output pipe.
pub struct OutputStreamBuffer {
    server_id: ServerId,
    terminator: Vec<u8>,
    matched: usize,
    pending: Vec<u8>,
    terminal: SharedTerminal,
    broadcaster: Arc<dyn Broadcaster>,
}

impl OutputStreamBuffer {
    pub fn new(
        server_id: ServerId,
        terminal: SharedTerminal,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self::with_terminator(server_id, terminal, broadcaster, LINE_TERMINATOR)
    }

    /// Creates a parser that splits on a custom terminator sequence.
    pub fn with_terminator(
        server_id: ServerId,
        terminal: SharedTerminal,
        broadcaster: Arc<dyn Broadcaster>,
        terminator: &[u8],
    ) -> Self {
        Self {
            server_id,
            terminator: terminator.to_vec(),
            matched: 0,
            pending: Vec::new(),
            terminal,
            broadcaster,
        }
    }

    /// Feeds one byte. Returns the sanitized line when it completes one.
    pub fn process_byte(&mut self, byte: u8) -> Option<String> {
        if self.terminator.is_empty() {
            self.pending.push(byte);
            return None;
        }

        if byte == self.terminator[self.matched] {
            self.matched += 1;
            if self.matched == self.terminator.len() {
                self.matched = 0;
                return Some(self.emit());
            }
            return None;
        }

        // Partial terminator turned out to be line content.
        if self.matched > 0 {
            let prefix = self.terminator[..self.matched].to_vec();
            self.pending.extend_from_slice(&prefix);
            self.matched = 0;
            return self.process_byte(byte);
        }

        self.pending.push(byte);
        None
    }

    /// Feeds a chunk of bytes, returning every line it completes.
    pub fn process(&mut self, bytes: &[u8]) -> Vec<String> {
        bytes.iter().filter_map(|&b| self.process_byte(b)).collect()
    }

    /// Flushes any unterminated bytes as a final line.
    pub fn finish(&mut self) -> Option<String> {
        if self.matched > 0 {
            let prefix = self.terminator[..self.matched].to_vec();
            self.pending.extend_from_slice(&prefix);
            self.matched = 0;
        }
        if self.pending.is_empty() {
            return None;
        }
        Some(self.emit())
    }

    /// Reads `reader` to the end, then flushes the trailing partial line.
    pub async fn pump<R>(mut self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut byte = [0u8; 1];
        loop {
            match reader.read(&mut byte).await {
                Ok(0) => break,
                Ok(_) => {
                    self.process_byte(byte[0]);
                }
                Err(e) => {
                    tracing::debug!(server_id = %self.server_id, error = %e, "Output stream closed with error");
                    break;
                }
            }
        }
        self.finish();
        tracing::debug!(server_id = %self.server_id, "Output stream ended");
    }

    fn emit(&mut self) -> String {
        let raw = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        let line = sanitize_line(&raw);

        tracing::trace!(server_id = %self.server_id, line = %line, "Console output");

        match self.terminal.lock() {
            Ok(mut terminal) => terminal.push(line.clone()),
            Err(_) => tracing::error!(server_id = %self.server_id, "Failed to lock virtual terminal"),
        }

        self.broadcaster.publish_to_topic(
            Topic::ServerDetail(self.server_id),
            "vterm_new_line",
            json!({ "line": line }),
        );
        line
    }
}

/// Removes ANSI escapes and backspace artifacts, then HTML-escapes.
pub fn sanitize_line(raw: &str) -> String {
    let stripped = match ANSI_ESCAPE.as_ref() {
        Some(re) => re.replace_all(raw, ""),
        None => Cow::Borrowed(raw),
    };

    let mut erased: Vec<char> = Vec::with_capacity(stripped.len());
    for c in stripped.chars() {
        match c {
            '\u{8}' => {
                erased.pop();
            }
            '\r' => {}
            other => erased.push(other),
        }
    }

    let mut escaped = String::with_capacity(erased.len());
    for c in erased {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Hub;

    fn buffer(capacity: usize, terminator: &[u8]) -> (OutputStreamBuffer, SharedTerminal) {
        let terminal = Arc::new(Mutex::new(VirtualTerminal::new(capacity)));
        let parser = OutputStreamBuffer::with_terminator(
            ServerId(1),
            terminal.clone(),
            Arc::new(Hub::default()),
            terminator,
        );
        (parser, terminal)
    }

    #[test]
    fn test_partial_terminator_is_content() {
        let (mut parser, terminal) = buffer(10, b"\r\n");

        let lines = parser.process(b"a\rb\r\nc\r\r\n");

        assert_eq!(lines, vec!["ab", "c"]);
        assert_eq!(terminal.lock().unwrap().lines(), vec!["ab", "c"]);
    }

    #[test]
    fn test_sanitize_line() {
        assert_eq!(sanitize_line("\x1b[32m[INFO]\x1b[0m Done"), "[INFO] Done");
        assert_eq!(sanitize_line("abc\u{8}\u{8}d"), "ad");
        assert_eq!(sanitize_line("<b>&\"x\"'"), "&lt;b&gt;&amp;&quot;x&quot;&#x27;");
    }

    #[test]
    fn test_empty_line_is_kept() {
        let (mut parser, _terminal) = buffer(10, b"\n");
        assert_eq!(parser.process(b"\n\n"), vec!["", ""]);
        assert_eq!(parser.finish(), None);
    }
}
