//! Batch summary rendering

use kflash_core::console::Console;
use kflash_core::models::BatchDeviceResult;

/// Lines of captured build output shown per failed device
pub const SUMMARY_OUTPUT_LINES: usize = 20;

/// Print one line per device, then build-failure output tails and totals
pub fn render_summary(console: &dyn Console, results: &[BatchDeviceResult]) {
    console.phase("Summary", &format!("{} device(s)", results.len()));
    if results.is_empty() {
        return;
    }

    let width = results
        .iter()
        .map(|r| r.device_name.len())
        .max()
        .unwrap_or(0);

    for result in results {
        let method = result
            .flash_method
            .map(|m| format!(" via {}", m))
            .unwrap_or_default();
        let detail = match (&result.error_message, result.succeeded()) {
            (Some(message), false) => format!(": {}", message),
            _ => String::new(),
        };
        let line = format!(
            "{:<width$}  {}{}{}",
            result.device_name,
            result.state(),
            method,
            detail,
            width = width
        );
        if result.succeeded() {
            console.success(&line);
        } else if result.is_failure() {
            console.error(&line);
        } else {
            console.info(&line);
        }
    }

    for result in results.iter().filter(|r| r.build_ok == Some(false)) {
        let Some(output) = result.error_output.as_deref() else {
            continue;
        };
        let lines: Vec<&str> = output.lines().collect();
        let tail = &lines[lines.len().saturating_sub(SUMMARY_OUTPUT_LINES)..];
        console.info(&format!(
            "Build output for {} (last {} lines):",
            result.device_name,
            tail.len()
        ));
        for line in tail {
            console.info(&format!("  {}", line));
        }
    }

    let succeeded = results.iter().filter(|r| r.succeeded()).count();
    let failed = results.iter().filter(|r| r.is_failure()).count();
    let skipped = results.len() - succeeded - failed;
    console.info(&format!(
        "{} succeeded, {} failed, {} skipped",
        succeeded, failed, skipped
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use kflash_core::models::{FlashMethod, SkipReason};
    use kflash_dummy::RecordingConsole;

    #[test]
    fn test_summary_lines() {
        let mut ok = BatchDeviceResult::new("octopus", "Octopus Pro");
        ok.build_ok = Some(true);
        ok.flash_ok = Some(true);
        ok.verify_ok = Some(true);
        ok.flash_method = Some(FlashMethod::MakeFlash);
        let mut off = BatchDeviceResult::new("ebb", "EBB36");
        off.skip(SkipReason::Excluded, "excluded by user");
        let mut bad = BatchDeviceResult::new("nitehawk", "Nitehawk");
        bad.skip(SkipReason::MissingConfig, "no cached configuration");

        let console = RecordingConsole::new();
        render_summary(&console, &[ok, off, bad]);
        let lines = console.lines();
        assert!(lines.contains(&"ok: Octopus Pro  success via make_flash".to_string()));
        assert!(lines.contains(&"info: EBB36        excluded: excluded by user".to_string()));
        assert!(console
            .errors()
            .iter()
            .any(|l| l.contains("missing configuration: no cached configuration")));
        assert!(console.contains("1 succeeded, 1 failed, 1 skipped"));
    }

    #[test]
    fn test_build_failure_shows_last_twenty_lines() {
        let mut r = BatchDeviceResult::new("octopus", "Octopus Pro");
        r.build_ok = Some(false);
        r.error_message = Some("make failed with exit code 2".into());
        r.error_output = Some((1..=200).map(|i| format!("line {}\n", i)).collect());

        let console = RecordingConsole::new();
        render_summary(&console, &[r]);
        let output: Vec<String> = console
            .lines()
            .into_iter()
            .filter(|l| l.starts_with("info:   line "))
            .collect();
        assert_eq!(output.len(), SUMMARY_OUTPUT_LINES);
        assert_eq!(output[0], "info:   line 181");
        assert_eq!(output[19], "info:   line 200");
    }
}
