//! Terminal console
//!
//! Phase lines go to stdout, warnings and errors to stderr. Long blocking
//! steps (flashing) show a spinner that is cleared when the step ends.

use std::cell::RefCell;
use std::io::{self, BufRead, IsTerminal, Write};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use kflash_core::console::Console;

pub struct TerminalConsole {
    spinner: RefCell<Option<ProgressBar>>,
}

impl TerminalConsole {
    pub fn new() -> Self {
        Self {
            spinner: RefCell::new(None),
        }
    }

    /// Print through the spinner when one is active so lines don't tear
    fn emit(&self, line: String, to_stderr: bool) {
        match self.spinner.borrow().as_ref() {
            Some(pb) => pb.println(line),
            None if to_stderr => eprintln!("{}", line),
            None => println!("{}", line),
        }
    }
}

impl Console for TerminalConsole {
    fn phase(&self, phase: &str, message: &str) {
        self.emit(format!("[{}] {}", phase, message), false);
    }

    fn info(&self, message: &str) {
        self.emit(message.to_string(), false);
    }

    fn warn(&self, message: &str) {
        self.emit(format!("Warning: {}", message), true);
    }

    fn error(&self, message: &str) {
        self.emit(format!("Error: {}", message), true);
    }

    fn success(&self, message: &str) {
        self.emit(format!("OK: {}", message), false);
    }

    fn confirm(&self, prompt: &str, default: bool) -> bool {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return default;
        }
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        print!("{} {} ", prompt, hint);
        if io::stdout().flush().is_err() {
            return default;
        }
        let mut answer = String::new();
        if stdin.lock().read_line(&mut answer).is_err() {
            return default;
        }
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => true,
            "n" | "no" => false,
            _ => default,
        }
    }

    fn begin_activity(&self, message: &str) {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) =
            ProgressStyle::default_spinner().template("{spinner:.green} {msg} [{elapsed}]")
        {
            pb.set_style(style);
        }
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        if let Some(old) = self.spinner.replace(Some(pb)) {
            old.finish_and_clear();
        }
    }

    fn end_activity(&self) {
        if let Some(pb) = self.spinner.take() {
            pb.finish_and_clear();
        }
    }
}
