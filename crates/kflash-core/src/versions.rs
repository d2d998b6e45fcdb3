//! Firmware version comparison
//!
//! Klipper reports versions in `git describe --long` form, both for the
//! host tree (`v0.12.0-45-g7ce409d`) and for each MCU's firmware. A board
//! is out of date when its tag or commit count differs from the host's.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::process::{CommandRunner, CommandSpec};

const GIT_TIMEOUT: Duration = Duration::from_secs(5);

static DESCRIBE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(v[0-9A-Za-z._-]+?)(?:-([0-9]+)-g[0-9a-fA-F]+)?(?:-dirty)?$")
        .expect("valid regex")
});

/// MCU name to firmware version, as reported by the printer host.
/// The primary MCU is named `main`.
pub type McuVersions = BTreeMap<String, String>;

/// Split a `git describe` string into tag and commit count
pub fn parse_describe(version: &str) -> Option<(String, Option<u32>)> {
    let caps = DESCRIBE_RE.captures(version.trim())?;
    let tag = caps.get(1)?.as_str().to_string();
    let count = caps.get(2).and_then(|m| m.as_str().parse().ok());
    Some((tag, count))
}

/// Whether MCU firmware `mcu` is behind host version `host`
///
/// Equal tags without commit counts are treated as current. Versions that
/// don't parse are compared as plain strings.
pub fn is_outdated(host: &str, mcu: &str) -> bool {
    let (host, mcu) = (host.trim(), mcu.trim());
    if host.is_empty() || mcu.is_empty() {
        return false;
    }
    match (parse_describe(host), parse_describe(mcu)) {
        (Some((host_tag, host_count)), Some((mcu_tag, mcu_count))) => {
            if host_tag != mcu_tag {
                return true;
            }
            match (host_count, mcu_count) {
                (Some(h), Some(m)) => h != m,
                _ => false,
            }
        }
        _ => host != mcu,
    }
}

/// Version of the MCU that best matches a registry `mcu` value: exact name,
/// then substring either way, then `main`
pub fn version_for_mcu<'a>(versions: &'a McuVersions, mcu: &str) -> Option<&'a str> {
    let mcu = mcu.to_lowercase();
    versions
        .iter()
        .find(|(name, _)| name.to_lowercase() == mcu)
        .or_else(|| {
            versions.iter().find(|(name, _)| {
                let name = name.to_lowercase();
                mcu.contains(&name) || name.contains(&mcu)
            })
        })
        .map(|(_, v)| v.as_str())
        .or_else(|| versions.get("main").map(String::as_str))
}

fn git(runner: &dyn CommandRunner, dir: &Path, args: &[&str]) -> Option<String> {
    let spec = CommandSpec::new("git")
        .args(args.iter().copied())
        .cwd(dir)
        .timeout(GIT_TIMEOUT);
    match runner.run(&spec) {
        Ok(out) if out.success() => Some(String::from_utf8_lossy(&out.stdout).trim().to_string()),
        Ok(out) => {
            debug!("git {} failed: {}", args.join(" "), out.failure_reason());
            None
        }
        Err(e) => {
            debug!("git {} failed: {}", args.join(" "), e);
            None
        }
    }
}

/// Version of the host Klipper tree in `tag-count-ghash` form
///
/// Trees without a reachable tag are described as `count-ghash`.
pub fn host_version(runner: &dyn CommandRunner, klipper_dir: &Path) -> Option<String> {
    let described = git(
        runner,
        klipper_dir,
        &["describe", "--always", "--tags", "--long", "--dirty"],
    )?;
    if !described.is_empty() && described.contains("-g") {
        return Some(described);
    }

    let tag = if described.starts_with('v') {
        Some(described)
    } else {
        git(runner, klipper_dir, &["describe", "--tags", "--abbrev=0"])
    };
    let count = git(runner, klipper_dir, &["rev-list", "--count", "HEAD"])?;
    let hash = git(runner, klipper_dir, &["rev-parse", "--short", "HEAD"])?;
    Some(match tag {
        Some(tag) => format!("{}-{}-g{}", tag, count, hash),
        None => format!("{}-g{}", count, hash),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_describe() {
        assert_eq!(
            parse_describe("v0.12.0-45-g7ce409d"),
            Some(("v0.12.0".to_string(), Some(45)))
        );
        assert_eq!(
            parse_describe("v0.12.0-0-g7ce409d-dirty"),
            Some(("v0.12.0".to_string(), Some(0)))
        );
        assert_eq!(
            parse_describe("v2026.01.00"),
            Some(("v2026.01.00".to_string(), None))
        );
        assert_eq!(parse_describe("7ce409d"), None);
    }

    #[test]
    fn test_is_outdated() {
        assert!(!is_outdated("v0.12.0-45-g7ce409d", "v0.12.0-45-g7ce409d"));
        assert!(is_outdated("v0.12.0-45-g7ce409d", "v0.12.0-40-gabc1234"));
        assert!(is_outdated("v0.12.0-45-g7ce409d", "v0.11.0-45-g7ce409d"));
        assert!(!is_outdated("v0.12.0-45-g7ce409d", "v0.12.0"));
        assert!(is_outdated("abc", "def"));
        assert!(!is_outdated("", "v0.12.0"));
    }

    #[test]
    fn test_version_for_mcu() {
        let versions: McuVersions = [
            ("main".to_string(), "v1-1-gaaa".to_string()),
            ("nhk".to_string(), "v1-2-gbbb".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(version_for_mcu(&versions, "NHK"), Some("v1-2-gbbb"));
        assert_eq!(version_for_mcu(&versions, "nhk36"), Some("v1-2-gbbb"));
        assert_eq!(version_for_mcu(&versions, "stm32h723"), Some("v1-1-gaaa"));
        assert_eq!(version_for_mcu(&McuVersions::new(), "rp2040"), None);
    }
}
