//! Local glob expansion for shard patterns.
//!
//! After brace expansion, an entry such as `/data/train-*.tar` that names a
//! local path and contains glob metacharacters is expanded against the
//! filesystem. Matches are sorted so every worker sees the same order.

use anyhow::{Context, Result};
use glob::glob;

/// True if `pattern` contains `*`, `?` or `[`.
#[must_use]
pub fn has_glob_meta(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Expand a glob pattern into a sorted list of matching file paths.
///
/// Directories are skipped. No matches yields an empty vector.
///
/// # Errors
///
/// Returns an error if the pattern is invalid or an entry cannot be read.
pub fn expand_glob(pattern: &str) -> Result<Vec<String>> {
    let paths = glob(pattern).with_context(|| format!("invalid glob pattern: {pattern}"))?;

    let mut result = Vec::new();
    for entry in paths {
        let path =
            entry.with_context(|| format!("error reading glob entry for pattern: {pattern}"))?;
        if path.is_file() {
            result.push(path.to_string_lossy().into_owned());
        }
    }

    result.sort();
    Ok(result)
}
