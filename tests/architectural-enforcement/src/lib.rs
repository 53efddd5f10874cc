//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles:
//! - Retry pauses are the only place that sleeps
//! - Production code propagates errors instead of panicking
//! - `unsafe` stays inside the platform bindings
//!
//! The helpers below find the Rust sources of the workspace crates and
//! strip the `#[cfg(test)]` tail of each file, so the checks only look at
//! production code.

use std::fs;
use std::path::{Path, PathBuf};

/// Source directories of the production crates, relative to the workspace root
pub const PRODUCTION_DIRS: [&str; 2] = ["xenbus/core/src", "xenbus/probe/src"];

/// Workspace root, derived from this crate's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Every `.rs` file under the production directories
#[must_use]
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
                files.push(entry.into_path());
            }
        }
    }

    files.sort();
    files
}

/// Non-comment production lines of `path` as `(line_number, code)`
///
/// Everything from the first `#[cfg(test)]` onwards is treated as test code.
#[must_use]
pub fn production_lines(path: &Path) -> Vec<(usize, String)> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };

    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .filter_map(|(idx, line)| {
            let code = line.split("//").next().unwrap_or(line).trim();
            if code.is_empty() {
                None
            } else {
                Some((idx + 1, code.to_string()))
            }
        })
        .collect()
}

/// Path relative to the workspace root, with forward slashes
#[must_use]
pub fn relative(path: &Path) -> String {
    let root = workspace_root();
    path.strip_prefix(&root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Collect `file:line - code` for every production line that `matches`,
/// skipping files in `allowed`
pub fn find_violations(allowed: &[&str], matches: impl Fn(&str) -> bool) -> Vec<String> {
    let mut violations = Vec::new();

    for file in production_files() {
        let rel = relative(&file);
        if allowed.iter().any(|a| rel.ends_with(a)) {
            continue;
        }
        for (line_number, code) in production_lines(&file) {
            if matches(&code) {
                violations.push(format!("{rel}:{line_number} - {code}"));
            }
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_production_sources() {
        let files = production_files();
        assert!(
            files.iter().any(|f| relative(f) == "xenbus/core/src/lib.rs"),
            "expected to find xenbus/core/src/lib.rs among {files:?}"
        );
    }
}
