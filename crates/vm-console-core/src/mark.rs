//! Sentinel marks that terminate a logical block of console output.

use uuid::Uuid;

/// Delimiter run wrapped around the token.
const FENCE: &str = "================";

/// A fresh, process-unique sentinel string.
///
/// The rendered form is a UUID wrapped in runs of `=`. It contains no
/// whitespace, quotes, `%`, `\`, `#` or `~`, so it survives both an unquoted
/// `echo` and a `printf` format string unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mark(String);

impl Mark {
    /// Generate a new mark.
    pub fn new() -> Self {
        Self(format!("{FENCE}{}{FENCE}", Uuid::new_v4().simple()))
    }

    /// The mark as it appears on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a console line is exactly this mark.
    pub fn terminates(&self, line: &str) -> bool {
        line.trim() == self.0
    }

    /// Whether a console line mentions this mark without being it.
    ///
    /// This is the echo of the command line that carried the mark.
    pub fn echoed_in(&self, line: &str) -> bool {
        line.contains(&self.0) && !self.terminates(line)
    }
}

impl Default for Mark {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Mark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
