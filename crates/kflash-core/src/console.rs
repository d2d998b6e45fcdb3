//! User-facing output seam
//!
//! Engine stages report progress as phase-labelled lines (`[Flash] ...`)
//! and ask the occasional yes/no question. The terminal implementation
//! lives in the binary; tests record the lines instead.

/// Progress output and confirmation prompts
pub trait Console {
    /// Stage progress, printed as `[phase] message`
    fn phase(&self, phase: &str, message: &str);

    /// Plain informational line
    fn info(&self, message: &str);

    /// Non-fatal problem
    fn warn(&self, message: &str);

    /// Fatal problem for the current operation
    fn error(&self, message: &str);

    /// Completed step
    fn success(&self, message: &str);

    /// Yes/no question; `default` applies on empty input or no terminal
    fn confirm(&self, prompt: &str, default: bool) -> bool;

    /// A long blocking step is starting
    fn begin_activity(&self, _message: &str) {}

    /// The long blocking step finished
    fn end_activity(&self) {}
}
