//! kflash-dummy - In-memory host doubles for testing
//!
//! This crate provides stand-ins for everything the flashing engine touches
//! on a real host, so engine behavior can be exercised without hardware,
//! sudo, systemd or a network:
//!
//! - [`ScriptedRunner`]: answers commands from a rule table and records calls
//! - [`FakeUsbBus`]: a mutable list of serial devices with scripted
//!   re-enumeration on `authorized` toggles
//! - [`FakeService`]: records stop/start calls, can be told to fail
//! - [`RecordingConsole`]: captures output lines and answers prompts
//! - [`FixedStatus`]: a print-status source returning fixed answers
//!
//! Doubles that tests need to inspect after handing them to the engine
//! share their state through `Rc`, so clones observe the same device list
//! or call log.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use kflash_core::console::Console;
use kflash_core::discovery::{SerialDevice, SERIAL_BY_ID};
use kflash_core::error::ServiceError;
use kflash_core::process::{CommandOutput, CommandRunner, CommandSpec, ProcessError};
use kflash_core::service::ServiceControl;
use kflash_core::status::{PrintStatus, PrintStatusSource, PrinterState};
use kflash_core::usb::{UsbBus, UsbError};
use kflash_core::versions::McuVersions;

/// Shared, ordered event log
///
/// Hand the same journal to several doubles to assert on the interleaving
/// of their calls.
#[derive(Debug, Clone, Default)]
pub struct Journal(Rc<RefCell<Vec<String>>>);

impl Journal {
    /// Empty journal
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event
    pub fn push(&self, event: impl Into<String>) {
        self.0.borrow_mut().push(event.into());
    }

    /// Snapshot of all events
    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    /// Index of the first event containing `needle`
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.0.borrow().iter().position(|e| e.contains(needle))
    }
}

// ---------------------------------------------------------------------------
// Command runner
// ---------------------------------------------------------------------------

/// Scripted answer to a command
#[derive(Debug, Clone)]
pub enum Reply {
    /// The command ran and exited
    Exit {
        /// Exit code
        code: i32,
        /// stdout bytes
        stdout: Vec<u8>,
        /// stderr bytes
        stderr: Vec<u8>,
    },
    /// The command ran past its timeout
    TimedOut,
    /// The program does not exist
    NotFound,
}

impl Reply {
    /// Exit 0, no output
    pub fn ok() -> Self {
        Self::ok_with("")
    }

    /// Exit 0 with stdout
    pub fn ok_with(stdout: impl Into<Vec<u8>>) -> Self {
        Reply::Exit {
            code: 0,
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    /// Nonzero exit with stderr
    pub fn fail(code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Reply::Exit {
            code,
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    /// Nonzero exit with stdout, as a failing build prints
    pub fn fail_with_stdout(code: i32, stdout: impl Into<Vec<u8>>) -> Self {
        Reply::Exit {
            code,
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    /// Timeout fired
    pub fn timeout() -> Self {
        Reply::TimedOut
    }

    /// Program missing
    pub fn not_found() -> Self {
        Reply::NotFound
    }
}

type Effect = Rc<dyn Fn(&CommandSpec)>;

struct Rule {
    needle: String,
    reply: Reply,
    effect: Option<Effect>,
    remaining: Option<usize>,
}

/// A command the runner was asked to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Program and arguments joined by spaces
    pub line: String,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Bytes fed on stdin
    pub stdin: Option<Vec<u8>>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Timeout the caller asked for
    pub timeout: Duration,
}

/// [`CommandRunner`] driven by substring rules
///
/// Rules are tried in the order they were added; the first rule whose
/// needle occurs in the command line and has uses left answers. A command
/// no rule matches behaves like a missing program.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: RefCell<Vec<Rule>>,
    calls: RefCell<Vec<RecordedCall>>,
    journal: Option<Journal>,
}

impl ScriptedRunner {
    /// Runner with no rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner that also logs each command line to `journal`
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::default()
        }
    }

    fn add(&self, needle: &str, reply: Reply, effect: Option<Effect>, remaining: Option<usize>) {
        self.rules.borrow_mut().push(Rule {
            needle: needle.to_string(),
            reply,
            effect,
            remaining,
        });
    }

    /// Answer every matching command with `reply`
    pub fn on(&self, needle: &str, reply: Reply) -> &Self {
        self.add(needle, reply, None, None);
        self
    }

    /// Answer the next matching command only
    pub fn once(&self, needle: &str, reply: Reply) -> &Self {
        self.add(needle, reply, None, Some(1));
        self
    }

    /// Answer with `reply` after running `effect`
    pub fn on_with(&self, needle: &str, reply: Reply, effect: impl Fn(&CommandSpec) + 'static) -> &Self {
        self.add(needle, reply, Some(Rc::new(effect)), None);
        self
    }

    /// Answer the next matching command with `reply` after running `effect`
    pub fn once_with(
        &self,
        needle: &str,
        reply: Reply,
        effect: impl Fn(&CommandSpec) + 'static,
    ) -> &Self {
        self.add(needle, reply, Some(Rc::new(effect)), Some(1));
        self
    }

    /// Every call so far
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }

    /// Number of calls whose command line contains `needle`
    pub fn count(&self, needle: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.line.contains(needle))
            .count()
    }

    /// Whether any call contained `needle`
    pub fn called(&self, needle: &str) -> bool {
        self.count(needle) > 0
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        let line = spec.command_line();
        self.calls.borrow_mut().push(RecordedCall {
            line: line.clone(),
            cwd: spec.cwd.clone(),
            stdin: spec.stdin.clone(),
            env: spec
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string_lossy().into_owned()))
                .collect(),
            timeout: spec.timeout,
        });
        if let Some(journal) = &self.journal {
            journal.push(format!("run: {}", line));
        }

        let mut rules = self.rules.borrow_mut();
        let Some(rule) = rules
            .iter_mut()
            .find(|r| r.remaining != Some(0) && line.contains(&r.needle))
        else {
            return Err(ProcessError::NotFound(spec.program.clone()));
        };
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        let reply = rule.reply.clone();
        let effect = rule.effect.clone();
        drop(rules);

        // Effects may touch other doubles, so run them with the rule table released.
        if let Some(effect) = effect {
            effect(spec);
        }

        match reply {
            Reply::Exit {
                code,
                stdout,
                stderr,
            } => {
                let mut combined = stdout.clone();
                combined.extend_from_slice(&stderr);
                Ok(CommandOutput {
                    code: Some(code),
                    timed_out: false,
                    stdout,
                    stderr,
                    combined,
                    elapsed: Duration::ZERO,
                })
            }
            Reply::TimedOut => Ok(CommandOutput {
                code: None,
                timed_out: true,
                elapsed: spec.timeout,
                ..Default::default()
            }),
            Reply::NotFound => Err(ProcessError::NotFound(spec.program.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// USB bus
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct UsbState {
    devices: Vec<String>,
    canonical: HashMap<String, PathBuf>,
    reenumerate: Option<(Vec<String>, Vec<String>)>,
    writes: Vec<bool>,
    fail_resolve: bool,
    fail_write: bool,
}

/// In-memory serial bus
///
/// Devices are plain descriptor names under a virtual
/// `/dev/serial/by-id`. Writing `authorized = 1` applies the scripted
/// re-enumeration, if any.
#[derive(Debug, Clone)]
pub struct FakeUsbBus {
    dir: PathBuf,
    state: Rc<RefCell<UsbState>>,
}

impl Default for FakeUsbBus {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeUsbBus {
    /// Empty bus
    pub fn new() -> Self {
        Self {
            dir: PathBuf::from(SERIAL_BY_ID),
            state: Rc::default(),
        }
    }

    /// Bus with these devices attached
    pub fn with_devices(names: &[&str]) -> Self {
        let bus = Self::new();
        for name in names {
            bus.add(name);
        }
        bus
    }

    /// Full path of a device name
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Attach a device
    pub fn add(&self, name: &str) {
        let mut state = self.state.borrow_mut();
        if !state.devices.iter().any(|d| d == name) {
            state.devices.push(name.to_string());
        }
    }

    /// Detach a device
    pub fn remove(&self, name: &str) {
        self.state.borrow_mut().devices.retain(|d| d != name);
    }

    /// Detach `old` and attach `new`, as a mode switch does
    pub fn replace(&self, old: &str, new: &str) {
        self.remove(old);
        self.add(new);
    }

    /// Names currently attached
    pub fn devices(&self) -> Vec<String> {
        self.state.borrow().devices.clone()
    }

    /// Make `name` canonicalize to `target`
    pub fn set_canonical(&self, name: &str, target: impl Into<PathBuf>) {
        self.state
            .borrow_mut()
            .canonical
            .insert(name.to_string(), target.into());
    }

    /// On re-authorization, detach `remove` and attach `add`
    pub fn on_reauthorize(&self, remove: &[&str], add: &[&str]) {
        self.state.borrow_mut().reenumerate = Some((
            remove.iter().map(|s| s.to_string()).collect(),
            add.iter().map(|s| s.to_string()).collect(),
        ));
    }

    /// Make topology resolution fail
    pub fn fail_resolve(&self) {
        self.state.borrow_mut().fail_resolve = true;
    }

    /// Make `authorized` writes fail
    pub fn fail_write(&self) {
        self.state.borrow_mut().fail_write = true;
    }

    /// Values written to `authorized`, in order
    pub fn authorization_writes(&self) -> Vec<bool> {
        self.state.borrow().writes.clone()
    }

    fn name_of(path: &Path) -> Option<String> {
        path.file_name().map(|n| n.to_string_lossy().into_owned())
    }

    fn attached(&self, path: &Path) -> bool {
        Self::name_of(path)
            .map(|n| self.state.borrow().devices.contains(&n))
            .unwrap_or(false)
    }
}

impl UsbBus for FakeUsbBus {
    fn serial_dir(&self) -> &Path {
        &self.dir
    }

    fn scan(&self) -> Vec<SerialDevice> {
        let mut names = self.devices();
        names.sort();
        names
            .into_iter()
            .map(|n| SerialDevice::new(&self.dir, n))
            .collect()
    }

    fn exists(&self, path: &Path) -> bool {
        self.attached(path)
    }

    fn canonical_path(&self, path: &Path) -> io::Result<PathBuf> {
        if !self.attached(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
        }
        let name = Self::name_of(path).unwrap_or_default();
        Ok(self
            .state
            .borrow()
            .canonical
            .get(&name)
            .cloned()
            .unwrap_or_else(|| path.to_path_buf()))
    }

    fn authorization_path(&self, device: &Path) -> Result<PathBuf, UsbError> {
        if self.state.borrow().fail_resolve {
            return Err(UsbError::Backend("sysfs path not found".into()));
        }
        if !self.attached(device) {
            return Err(UsbError::Missing(device.to_path_buf()));
        }
        let name = Self::name_of(device).unwrap_or_default();
        Ok(PathBuf::from(format!("/sys/bus/usb/devices/fake-{}/authorized", name)))
    }

    fn set_authorized(&self, _authorized_path: &Path, on: bool) -> Result<(), UsbError> {
        let mut state = self.state.borrow_mut();
        state.writes.push(on);
        if state.fail_write {
            return Err(UsbError::Backend("sudo: a password is required".into()));
        }
        if on {
            if let Some((remove, add)) = state.reenumerate.clone() {
                state.devices.retain(|d| !remove.contains(d));
                for name in add {
                    if !state.devices.contains(&name) {
                        state.devices.push(name);
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Records stop/start calls
#[derive(Debug, Clone, Default)]
pub struct FakeService {
    journal: Journal,
    fail_stop: Rc<Cell<bool>>,
    fail_start: Rc<Cell<bool>>,
}

impl FakeService {
    /// Service that always succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Service logging into a shared journal
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    /// Make `stop` fail
    pub fn fail_stop(&self) {
        self.fail_stop.set(true);
    }

    /// Make `start` fail
    pub fn fail_start(&self) {
        self.fail_start.set(true);
    }

    /// `service stop` / `service start` events, in order
    pub fn calls(&self) -> Vec<String> {
        self.journal
            .entries()
            .into_iter()
            .filter(|e| e.starts_with("service "))
            .collect()
    }

    /// Number of calls of `action`
    pub fn count(&self, action: &str) -> usize {
        let event = format!("service {}", action);
        self.calls().iter().filter(|e| **e == event).count()
    }
}

impl ServiceControl for FakeService {
    fn name(&self) -> &str {
        "klipper"
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.journal.push("service stop");
        if self.fail_stop.get() {
            return Err(ServiceError {
                action: "stop",
                service: "klipper".into(),
                detail: "Unit klipper.service not loaded".into(),
            });
        }
        Ok(())
    }

    fn start(&self) -> Result<(), ServiceError> {
        self.journal.push("service start");
        if self.fail_start.get() {
            return Err(ServiceError {
                action: "start",
                service: "klipper".into(),
                detail: "Job for klipper.service failed".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Console
// ---------------------------------------------------------------------------

/// Captures console output and answers prompts from a queue
#[derive(Debug, Default)]
pub struct RecordingConsole {
    lines: RefCell<Vec<String>>,
    prompts: RefCell<Vec<String>>,
    answers: RefCell<VecDeque<bool>>,
}

impl RecordingConsole {
    /// Console answering every prompt with its default
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an answer for the next prompt
    pub fn answer(&self, yes: bool) -> &Self {
        self.answers.borrow_mut().push_back(yes);
        self
    }

    /// Everything printed, tagged by kind
    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }

    /// Prompts asked
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    /// Whether any line contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.borrow().iter().any(|l| l.contains(needle))
    }

    /// Lines printed as warnings
    pub fn warnings(&self) -> Vec<String> {
        self.tagged("warn: ")
    }

    /// Lines printed as errors
    pub fn errors(&self) -> Vec<String> {
        self.tagged("error: ")
    }

    fn tagged(&self, tag: &str) -> Vec<String> {
        self.lines
            .borrow()
            .iter()
            .filter_map(|l| l.strip_prefix(tag).map(str::to_string))
            .collect()
    }

    fn push(&self, line: String) {
        self.lines.borrow_mut().push(line);
    }
}

impl Console for RecordingConsole {
    fn phase(&self, phase: &str, message: &str) {
        self.push(format!("[{}] {}", phase, message));
    }

    fn info(&self, message: &str) {
        self.push(format!("info: {}", message));
    }

    fn warn(&self, message: &str) {
        self.push(format!("warn: {}", message));
    }

    fn error(&self, message: &str) {
        self.push(format!("error: {}", message));
    }

    fn success(&self, message: &str) {
        self.push(format!("ok: {}", message));
    }

    fn confirm(&self, prompt: &str, default: bool) -> bool {
        self.prompts.borrow_mut().push(prompt.to_string());
        self.answers.borrow_mut().pop_front().unwrap_or(default)
    }
}

// ---------------------------------------------------------------------------
// Print status
// ---------------------------------------------------------------------------

/// Print-status source with fixed answers
#[derive(Debug, Clone)]
pub struct FixedStatus {
    status: Option<PrintStatus>,
    versions: Option<McuVersions>,
}

impl FixedStatus {
    fn with_status(status: Option<PrintStatus>) -> Self {
        Self {
            status,
            versions: None,
        }
    }

    /// Printer idle
    pub fn idle() -> Self {
        Self::with_status(Some(PrintStatus {
            state: PrinterState::Idle,
            filename: None,
            progress: 0.0,
        }))
    }

    /// Print in progress
    pub fn printing(filename: &str, progress: f64) -> Self {
        Self::with_status(Some(PrintStatus {
            state: PrinterState::Printing,
            filename: Some(filename.to_string()),
            progress,
        }))
    }

    /// Status service down
    pub fn unreachable() -> Self {
        Self::with_status(None)
    }

    /// Report these `(mcu name, version)` pairs
    pub fn with_versions(mut self, versions: &[(&str, &str)]) -> Self {
        self.versions = Some(
            versions
                .iter()
                .map(|(name, version)| (name.to_string(), version.to_string()))
                .collect(),
        );
        self
    }
}

impl PrintStatusSource for FixedStatus {
    fn get_status(&self) -> Option<PrintStatus> {
        self.status.clone()
    }

    fn mcu_versions(&self) -> Option<McuVersions> {
        self.versions.clone()
    }
}
