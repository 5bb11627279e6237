//! Outcome of a remote command.

/// Result of a command executed over the console.
///
/// A non-zero `return_code` is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit status reported by `echo $?`
    pub return_code: i32,
    /// Command output, without the return code and mark lines
    pub stdout: String,
    /// Always empty: the console merges both streams into `stdout`
    pub stderr: String,
    /// Raw console bytes seen while the command ran
    pub raw: Vec<u8>,
}

impl ExecutionResult {
    /// Create a result with empty stderr.
    pub fn new(return_code: i32, stdout: impl Into<String>, raw: Vec<u8>) -> Self {
        Self {
            return_code,
            stdout: stdout.into(),
            stderr: String::new(),
            raw,
        }
    }

    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.return_code == 0
    }

    /// `(return_code, stdout, stderr)` as consumed by execution plugins.
    pub fn into_triple(self) -> (i32, String, String) {
        (self.return_code, self.stdout, self.stderr)
    }
}
