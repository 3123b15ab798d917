//! Home directory and `~/` path expansion helpers.

use std::env;
use std::fs;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Current user's home directory, preferring the `HOME` environment
/// variable over what the OS reports.
pub fn home_dir() -> Result<PathBuf> {
    if let Ok(home) = env::var("HOME") {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    dirs::home_dir().ok_or_else(|| Error::Os("failed to determine user home directory".into()))
}

/// Expands `~` and `~/...` against the user home directory. `~user/` style
/// paths are not supported.
pub fn expand_path(path: &str) -> Result<PathBuf> {
    if !path.starts_with('~') {
        return Ok(PathBuf::from(path));
    }
    if path == "~" {
        return home_dir();
    }
    match path.strip_prefix("~/") {
        Some(rest) => Ok(home_dir()?.join(rest)),
        None => Err(Error::NotImplemented(
            "~user/ style paths are not supported".into(),
        )),
    }
}

/// Expands a path and requires it to point at an existing regular file.
pub fn expand_and_validate_path(path: &str) -> Result<PathBuf> {
    if path.is_empty() {
        return Err(Error::InvalidPath("path is empty".into()));
    }
    let expanded = expand_path(path)?;
    let meta = fs::metadata(&expanded)
        .map_err(|err| Error::InvalidPath(format!("{}: {err}", expanded.display())))?;
    if meta.is_dir() {
        return Err(Error::InvalidPath(format!(
            "{} is a directory",
            expanded.display()
        )));
    }
    Ok(expanded)
}
