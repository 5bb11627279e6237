//! Command framing and output parsing for the sentinel protocol.
//!
//! Every operation appends an `echo`/`printf` of a fresh [`Mark`] so the end
//! of its output can be found in an otherwise unstructured console stream.

use std::io::{self, Read};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use lazy_static::lazy_static;
use regex::Regex;

use vm_console_core::Mark;

lazy_static! {
    /// Output body followed by a line holding only the return code.
    static ref COMMAND_OUTPUT: Regex =
        Regex::new(r"(?s)\A(?P<output>.*?\n)??[\r\n]*(?P<rc>\d+)[ \t\r\n]*\z").unwrap();
}

/// How a console line relates to the mark of the running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// The line is the mark itself: the operation finished
    Terminator,
    /// The line contains the mark inside other text: the echoed command line
    Echo,
    /// Anything else
    Content,
}

/// Classify `line` against `mark`.
pub fn classify(mark: &Mark, line: &str) -> LineKind {
    if mark.terminates(line) {
        LineKind::Terminator
    } else if mark.echoed_in(line) {
        LineKind::Echo
    } else {
        LineKind::Content
    }
}

/// Text written to run `cmd` and report its exit status followed by `mark`.
///
/// The leading newline flushes any half-typed input so the command starts on
/// a fresh prompt.
pub fn command_line(cmd: &str, mark: &Mark) -> String {
    format!("\n{cmd} ; echo $? && echo {mark}\n")
}

/// Command that decodes base64 from stdin into `remote`.
pub fn upload_command(remote: &str, mark: &Mark) -> String {
    format!("base64 -d > {} && printf \"{}\\n\"", shell_quote(remote), mark)
}

/// Command that prints `remote` as base64.
pub fn download_command(remote: &str, mark: &Mark) -> String {
    format!("base64 {} && printf \"{}\\n\"", shell_quote(remote), mark)
}

/// Quote `value` for a POSIX shell.
///
/// ```
/// use vm_console_transport::framing::shell_quote;
///
/// assert_eq!(shell_quote("/tmp/it's"), r"'/tmp/it'\''s'");
/// ```
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Join collected lines back into text, one `\n` after each line.
pub fn join_lines(lines: &[String]) -> String {
    let mut text = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
    for line in lines {
        text.push_str(line);
        text.push('\n');
    }
    text
}

/// Split collected output into `(return_code, stdout)`.
///
/// The return code is the last line made of digits only; everything before
/// it, minus the separating newlines, is stdout. Returns `None` when the text
/// does not end with a return code.
pub fn parse_command_output(text: &str) -> Option<(i32, String)> {
    let captures = COMMAND_OUTPUT.captures(text)?;
    let rc = captures.name("rc")?.as_str().parse().ok()?;
    let output = captures
        .name("output")
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    Some((rc, output))
}

/// Reads a source in fixed-size chunks and yields each chunk as one base64 line.
///
/// Every chunk is encoded on its own, so each line decodes independently.
pub struct ChunkEncoder<R> {
    reader: R,
    chunk: Vec<u8>,
    done: bool,
}

impl<R: Read> ChunkEncoder<R> {
    /// Encode `reader` in chunks of `chunk_size` bytes.
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk: vec![0; chunk_size.max(1)],
            done: false,
        }
    }

    fn fill(&mut self) -> io::Result<usize> {
        let mut filled = 0;
        while filled < self.chunk.len() {
            match self.reader.read(&mut self.chunk[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl<R: Read> Iterator for ChunkEncoder<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fill() {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(n) => {
                self.done = n < self.chunk.len();
                Some(Ok(STANDARD.encode(&self.chunk[..n])))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Decode one base64 line printed by the remote side.
pub fn decode_line(line: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(line.trim())
}
