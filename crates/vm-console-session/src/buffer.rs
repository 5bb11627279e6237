//! Console output buffering and sanitization.

use regex::Regex;
use vte::{Params, Perform};

/// Result of a successful [`OutputBuffer::take_match`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectMatch {
    /// Text consumed before the match
    pub before: String,
    /// The matched text
    pub matched: String,
}

/// Collects printable text out of the VTE state machine.
///
/// Escape sequences (colours, bracketed-paste toggles, cursor movement) and
/// carriage returns are dropped; `\n` and `\t` are kept and backspace erases
/// the previous character on the current line.
#[derive(Debug, Default)]
struct Sanitizer {
    text: String,
}

impl Perform for Sanitizer {
    fn print(&mut self, c: char) {
        self.text.push(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' => self.text.push('\n'),
            b'\t' => self.text.push('\t'),
            0x08 => {
                if !self.text.ends_with('\n') {
                    self.text.pop();
                }
            }
            _ => {}
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _c: char) {}

    fn put(&mut self, _byte: u8) {}

    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {}

    fn csi_dispatch(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _c: char) {
    }

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, _byte: u8) {}
}

/// Output buffer for a console session.
///
/// Keeps the raw bytes (for diagnostics) next to the sanitized text that
/// prompt matching and line reading consume.
pub struct OutputBuffer {
    /// Raw bytes (with ANSI codes) not yet handed out by `take_raw`
    raw_buffer: Vec<u8>,
    /// VTE state carried across chunk boundaries
    parser: vte::Parser,
    /// Unconsumed sanitized text
    sanitizer: Sanitizer,
}

impl std::fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("raw_len", &self.size())
            .field("pending", &self.sanitizer.text)
            .finish_non_exhaustive()
    }
}

impl OutputBuffer {
    /// Create a new output buffer.
    pub fn new() -> Self {
        Self {
            raw_buffer: Vec::new(),
            parser: vte::Parser::new(),
            sanitizer: Sanitizer::default(),
        }
    }

    /// Append new output to the buffer.
    pub fn append(&mut self, bytes: &[u8]) {
        self.raw_buffer.extend_from_slice(bytes);
        for byte in bytes {
            self.parser.advance(&mut self.sanitizer, *byte);
        }
    }

    /// Unconsumed sanitized text.
    pub fn pending(&self) -> &str {
        &self.sanitizer.text
    }

    /// Consume text up to and including the first match of `pattern`.
    pub fn take_match(&mut self, pattern: &Regex) -> Option<ExpectMatch> {
        let text = &mut self.sanitizer.text;
        let (start, end) = pattern.find(text).map(|m| (m.start(), m.end()))?;
        let matched = text[start..end].to_string();
        let before = text[..start].to_string();
        text.drain(..end);
        Some(ExpectMatch { before, matched })
    }

    /// Consume the next complete line, without its terminator.
    pub fn take_line(&mut self) -> Option<String> {
        let text = &mut self.sanitizer.text;
        let newline = text.find('\n')?;
        let line = text[..newline].to_string();
        text.drain(..=newline);
        Some(line)
    }

    /// Drain the raw bytes received since the last call.
    pub fn take_raw(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.raw_buffer)
    }

    /// Raw bytes currently held.
    pub fn size(&self) -> usize {
        self.raw_buffer.len()
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}
