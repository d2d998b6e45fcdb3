//! Path helpers: `~` expansion, the app config directory, PATH lookup

use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;

/// Directory name under the user's config home
const APP_NAME: &str = "kalico-flash";

/// Expand a leading `~` to `$HOME`
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

/// Per-application configuration directory
pub fn app_config_dir() -> PathBuf {
    match ProjectDirs::from("", "", APP_NAME) {
        Some(dirs) => dirs.config_dir().to_path_buf(),
        None => expand_tilde(Path::new("~/.config")).join(APP_NAME),
    }
}

/// Locate an executable on `$PATH`
pub fn which(program: &str) -> Option<PathBuf> {
    which_in(program, &env::var_os("PATH")?)
}

/// Locate an executable on an explicit search path
pub fn which_in(program: &str, search_path: &OsStr) -> Option<PathBuf> {
    env::split_paths(search_path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
