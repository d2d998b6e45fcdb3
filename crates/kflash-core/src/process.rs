//! Subprocess execution with timeouts
//!
//! Every external tool the engine drives (systemctl, sudo, make,
//! flashtool.py) goes through [`CommandRunner`]. The system implementation
//! enforces a wall-clock timeout per invocation and, when capturing, keeps
//! stdout, stderr and an interleaved combined stream.
//!
//! Non-interactive commands run in their own process group. `make` and
//! `flashtool.py` fork helpers that inherit the output pipes, so a timeout
//! kills the whole group and the pipe readers are only waited on for a
//! short grace period. Because such a group no longer gets SIGINT from the
//! terminal, the runner forwards it when its cancel flag is raised.
//! Commands that may prompt (inherited output, or [`CommandSpec::tty`])
//! stay in the foreground group and only the direct child is killed.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use thiserror::Error;

/// Poll interval while waiting for a child to exit
const WAIT_POLL: Duration = Duration::from_millis(50);

/// How long to keep reading output after the child is gone
const READER_GRACE: Duration = Duration::from_millis(500);

/// What to do with the child's stdout and stderr
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Collect into [`CommandOutput`]
    #[default]
    Capture,
    /// Share the parent's terminal
    Inherit,
    /// Discard
    Null,
}

/// One command invocation
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Executable name or path
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Extra environment variables
    pub env: Vec<(String, OsString)>,
    /// Bytes written to stdin, which is then closed
    pub stdin: Option<Vec<u8>>,
    /// Wall-clock limit
    pub timeout: Duration,
    /// Output handling
    pub output: OutputMode,
    /// May prompt on the controlling terminal, as `sudo` does
    pub tty: bool,
}

impl CommandSpec {
    /// New captured command with a 60 second timeout
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
            timeout: Duration::from_secs(60),
            output: OutputMode::Capture,
            tty: false,
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Feed bytes on stdin
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Set the timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the output mode
    pub fn output(mut self, mode: OutputMode) -> Self {
        self.output = mode;
        self
    }

    /// Keep the command in the terminal's foreground process group
    pub fn tty(mut self) -> Self {
        self.tty = true;
        self
    }

    /// Command line as a single string, for logs and messages
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Result of a command that was started
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` if killed by a signal or by the timeout
    pub code: Option<i32>,
    /// Whether the timeout fired
    pub timed_out: bool,
    /// Captured stdout
    pub stdout: Vec<u8>,
    /// Captured stderr
    pub stderr: Vec<u8>,
    /// stdout and stderr in arrival order
    pub combined: Vec<u8>,
    /// Wall time
    pub elapsed: Duration,
}

impl CommandOutput {
    /// Exited with status zero
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }

    /// Best description of why the command failed: stderr, else stdout,
    /// else the exit status
    pub fn failure_reason(&self) -> String {
        let stderr = String::from_utf8_lossy(&self.stderr);
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = String::from_utf8_lossy(&self.stdout);
        let stdout = stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.code {
            Some(code) => format!("exited with status {}", code),
            None if self.timed_out => "timed out".to_string(),
            None => "terminated by signal".to_string(),
        }
    }
}

/// A command could not be started or waited for
#[derive(Debug, Clone, Error)]
pub enum ProcessError {
    /// Program is not installed or not on PATH
    #[error("Command not found: {0}")]
    NotFound(String),

    /// Any other spawn failure
    #[error("Failed to run '{program}': {message}")]
    Spawn {
        /// Program name
        program: String,
        /// OS error text
        message: String,
    },

    /// Waiting on the child failed
    #[error("Failed waiting for '{program}': {message}")]
    Wait {
        /// Program name
        program: String,
        /// OS error text
        message: String,
    },
}

/// Runs external commands
pub trait CommandRunner {
    /// Run `spec` to completion or until its timeout fires
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError>;
}

/// [`CommandRunner`] backed by `std::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner {
    cancel: Option<&'static AtomicBool>,
}

impl SystemRunner {
    /// Runner without a cancel flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward SIGINT to running commands once `flag` is raised
    pub fn with_cancel(mut self, flag: &'static AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        debug!("Running: {}", spec.command_line());

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let (out, err) = match spec.output {
            OutputMode::Capture => (Stdio::piped(), Stdio::piped()),
            OutputMode::Inherit => (Stdio::inherit(), Stdio::inherit()),
            OutputMode::Null => (Stdio::null(), Stdio::null()),
        };
        cmd.stdout(out).stderr(err);
        cmd.stdin(match (&spec.stdin, spec.output) {
            (Some(_), _) => Stdio::piped(),
            (None, OutputMode::Inherit) => Stdio::inherit(),
            (None, _) => Stdio::null(),
        });
        // Interactive commands stay in the terminal's foreground group
        let grouped = spec.output != OutputMode::Inherit && !spec.tty;
        if grouped {
            cmd.process_group(0);
        }

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| spawn_error(&spec.program, e))?;

        if let Some(input) = &spec.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                // A child that exits without reading stdin is not an error here.
                if let Err(e) = pipe.write_all(input) {
                    trace!("stdin write to '{}' failed: {}", spec.program, e);
                }
            }
        }

        let combined = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        let mut readers = 0;
        if let Some(pipe) = child.stdout.take() {
            spawn_reader(pipe, Stream::Stdout, Arc::clone(&combined), tx.clone());
            readers += 1;
        }
        if let Some(pipe) = child.stderr.take() {
            spawn_reader(pipe, Stream::Stderr, Arc::clone(&combined), tx.clone());
            readers += 1;
        }
        drop(tx);

        let child = Running {
            child: &mut child,
            grouped,
            spec,
        };
        let (code, timed_out) = child.wait_with_timeout(self.cancel)?;

        let (stdout, stderr) = collect_output(&rx, readers, &spec.program);
        let combined = std::mem::take(&mut *combined.lock().unwrap_or_else(|e| e.into_inner()));

        let elapsed = start.elapsed();
        debug!(
            "'{}' finished in {:.1}s (code={:?}, timed_out={})",
            spec.program,
            elapsed.as_secs_f64(),
            code,
            timed_out
        );

        Ok(CommandOutput {
            code,
            timed_out,
            stdout,
            stderr,
            combined,
            elapsed,
        })
    }
}

fn spawn_error(program: &str, e: io::Error) -> ProcessError {
    if e.kind() == io::ErrorKind::NotFound {
        ProcessError::NotFound(program.to_string())
    } else {
        ProcessError::Spawn {
            program: program.to_string(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn spawn_reader<R: Read + Send + 'static>(
    mut pipe: R,
    stream: Stream,
    combined: Arc<Mutex<Vec<u8>>>,
    done: Sender<(Stream, Vec<u8>)>,
) {
    thread::spawn(move || {
        let mut own = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    own.extend_from_slice(&buf[..n]);
                    combined
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .extend_from_slice(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        // The receiver is gone if the runner stopped waiting.
        let _ = done.send((stream, own));
    });
}

/// Gather reader results, giving up after [`READER_GRACE`] if something
/// outside the killed group still holds a pipe open
fn collect_output(
    rx: &Receiver<(Stream, Vec<u8>)>,
    mut readers: usize,
    program: &str,
) -> (Vec<u8>, Vec<u8>) {
    let deadline = Instant::now() + READER_GRACE;
    let (mut stdout, mut stderr) = (Vec::new(), Vec::new());
    while readers > 0 {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok((Stream::Stdout, bytes)) => stdout = bytes,
            Ok((Stream::Stderr, bytes)) => stderr = bytes,
            Err(_) => {
                debug!("Output of '{}' still open, not waiting for it", program);
                break;
            }
        }
        readers -= 1;
    }
    (stdout, stderr)
}

struct Running<'a> {
    child: &'a mut Child,
    grouped: bool,
    spec: &'a CommandSpec,
}

impl Running<'_> {
    fn signal(&mut self, signal: Signal) {
        if self.grouped {
            if let Ok(pgid) = i32::try_from(self.child.id()) {
                if let Err(e) = killpg(Pid::from_raw(pgid), signal) {
                    trace!("killpg({}, {}) failed: {}", pgid, signal, e);
                }
                return;
            }
        }
        if signal == Signal::SIGKILL {
            let _ = self.child.kill();
        }
    }

    fn wait_with_timeout(
        mut self,
        cancel: Option<&AtomicBool>,
    ) -> Result<(Option<i32>, bool), ProcessError> {
        let deadline = Instant::now() + self.spec.timeout;
        let mut forwarded = false;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    // Leftover helpers must not outlive the command
                    if self.grouped {
                        self.signal(Signal::SIGKILL);
                    }
                    return Ok((status.code(), false));
                }
                Ok(None) if Instant::now() >= deadline => {
                    debug!(
                        "'{}' exceeded {}s, killing",
                        self.spec.program,
                        self.spec.timeout.as_secs_f64()
                    );
                    self.signal(Signal::SIGKILL);
                    let _ = self.child.wait();
                    return Ok((None, true));
                }
                Ok(None) => {
                    if !forwarded && cancel.is_some_and(|c| c.load(Ordering::SeqCst)) {
                        debug!("Forwarding interrupt to '{}'", self.spec.program);
                        self.signal(Signal::SIGINT);
                        forwarded = true;
                    }
                    thread::sleep(WAIT_POLL);
                }
                Err(e) => {
                    return Err(ProcessError::Wait {
                        program: self.spec.program.clone(),
                        message: e.to_string(),
                    })
                }
            }
        }
    }
}

/// Last `max_lines` lines of `bytes`, decoded lossily
pub fn tail_lines(bytes: &[u8], max_lines: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_lines_caps() {
        let text: String = (1..=500).map(|i| format!("line {}\n", i)).collect();
        let tail = tail_lines(text.as_bytes(), 200);
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), 200);
        assert_eq!(lines[0], "line 301");
        assert_eq!(lines[199], "line 500");
    }

    #[test]
    fn test_tail_lines_lossy() {
        let bytes = b"ok\n\xff\xfebad\n";
        let tail = tail_lines(bytes, 10);
        assert!(tail.starts_with("ok\n"));
        assert!(tail.contains("bad"));
    }

    #[test]
    fn test_command_line() {
        let spec = CommandSpec::new("make").arg("FLASH_DEVICE=/dev/x").arg("flash");
        assert_eq!(spec.command_line(), "make FLASH_DEVICE=/dev/x flash");
    }

    #[test]
    fn test_failure_reason_prefers_stderr() {
        let out = CommandOutput {
            code: Some(2),
            stdout: b"stdout text".to_vec(),
            stderr: b"  boom \n".to_vec(),
            ..Default::default()
        };
        assert_eq!(out.failure_reason(), "boom");

        let out = CommandOutput {
            code: Some(2),
            ..Default::default()
        };
        assert_eq!(out.failure_reason(), "exited with status 2");
    }

    #[test]
    fn test_system_runner_captures_and_times_out() {
        let out = SystemRunner::new()
            .run(&CommandSpec::new("sh").args(["-c", "echo out; echo err 1>&2; exit 3"]))
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "out");
        assert_eq!(String::from_utf8_lossy(&out.stderr).trim(), "err");
        assert!(!out.success());

        let out = SystemRunner::new()
            .run(
                &CommandSpec::new("sleep")
                    .arg("5")
                    .timeout(Duration::from_millis(200)),
            )
            .unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
    }

    #[test]
    fn test_timeout_kills_forked_helpers() {
        let out = SystemRunner::new()
            .run(
                &CommandSpec::new("sh")
                    .args(["-c", "sleep 4 & sleep 4; wait"])
                    .timeout(Duration::from_millis(300)),
            )
            .unwrap();
        assert!(out.timed_out);
        assert!(out.elapsed < Duration::from_secs(2), "took {:?}", out.elapsed);
    }

    #[test]
    fn test_exit_does_not_wait_for_background_helper() {
        let out = SystemRunner::new()
            .run(&CommandSpec::new("sh").args(["-c", "sleep 4 & echo done"]))
            .unwrap();
        assert_eq!(out.code, Some(0));
        assert!(out.elapsed < Duration::from_secs(2), "took {:?}", out.elapsed);
    }

    #[test]
    fn test_cancel_flag_interrupts_command() {
        static CANCEL: AtomicBool = AtomicBool::new(true);
        let out = SystemRunner::new()
            .with_cancel(&CANCEL)
            .run(&CommandSpec::new("sleep").arg("5").timeout(Duration::from_secs(10)))
            .unwrap();
        assert!(!out.timed_out);
        assert_eq!(out.code, None);
        assert!(out.elapsed < Duration::from_secs(2), "took {:?}", out.elapsed);
    }

    #[test]
    fn test_system_runner_stdin_and_missing_program() {
        let out = SystemRunner::new()
            .run(&CommandSpec::new("cat").stdin("1"))
            .unwrap();
        assert_eq!(out.stdout, b"1");

        let err = SystemRunner::new()
            .run(&CommandSpec::new("definitely-not-a-real-program-kflash"))
            .unwrap_err();
        assert!(matches!(err, ProcessError::NotFound(_)));
    }
}
