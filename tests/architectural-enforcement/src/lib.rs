//! Architectural Enforcement Integration Tests
//!
//! Source scans that keep the streaming client event driven:
//! - No sleep() calls in production code
//! - No blocking file, network or thread I/O on the async paths
//!
//! Everything after a file's `#[cfg(test)]` line is skipped, as is comment text.

use std::fs;
use std::path::{Path, PathBuf};

/// One offending source line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: PathBuf,
    pub line: usize,
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.text)
    }
}

/// Workspace root, two levels above this package
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from("../.."))
}

/// Production lines of `source`: comments stripped, tests cut off
pub fn production_lines(source: &str) -> Vec<(usize, &str)> {
    source
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .map(|(idx, line)| (idx + 1, line.split("//").next().unwrap_or(line)))
        .filter(|(_, code)| !code.trim().is_empty())
        .collect()
}

/// Scan every `.rs` file under `dir` (relative to the workspace root)
///
/// `skip` names file or directory components to leave out.
pub fn scan(dir: &str, skip: &[&str], forbidden: &[&str]) -> Vec<Violation> {
    let root = workspace_root().join(dir);
    let mut violations = Vec::new();

    for entry in walkdir::WalkDir::new(&root)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("rs") {
            continue;
        }
        let relative = path.strip_prefix(&root).unwrap_or(path);
        if relative
            .components()
            .any(|c| skip.iter().any(|s| c.as_os_str() == *s))
        {
            continue;
        }

        let Ok(content) = fs::read_to_string(path) else {
            continue;
        };
        for (line, code) in production_lines(&content) {
            if forbidden.iter().any(|pattern| code.contains(pattern)) {
                violations.push(Violation {
                    path: path.to_path_buf(),
                    line,
                    text: code.trim().to_string(),
                });
            }
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_tests() {
        let source = "fn a() {} // sleep(\n\n#[cfg(test)]\nfn b() { sleep(1) }\n";
        let lines = production_lines(source);
        assert_eq!(lines, vec![(1, "fn a() {} ")]);
    }

    #[test]
    fn test_workspace_root_has_core() {
        assert!(workspace_root().join("medqa/core/src").is_dir());
    }
}
