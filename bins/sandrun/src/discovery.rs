// Test discovery through pytest's collection phase
use anyhow::{Context, Result, bail};
use sandrun_common::types::TestCase;
use serde::Deserialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

pub trait TestInventory {
    /// Enumerate test cases in a stable order
    fn enumerate(&self) -> impl Future<Output = Result<Vec<TestCase>>> + Send;
}

/// Collects items in-process and prints one JSON object per test
const COLLECT_SCRIPT: &str = r#"
import contextlib, io, json, sys
import pytest

class Collector:
    def __init__(self):
        self.items = []

    def pytest_collection_modifyitems(self, session, config, items):
        self.items = items

collector = Collector()
with contextlib.redirect_stdout(io.StringIO()):
    code = pytest.main(["--collect-only", "-q"], plugins=[collector])
if code not in (0, 5):
    sys.exit(int(code))
for item in collector.items:
    path, _, name = item.reportinfo()
    print(json.dumps({"file": str(path), "case": name}))
"#;

#[derive(Debug, Deserialize)]
struct CollectedItem {
    file: String,
    case: String,
}

pub struct PytestInventory {
    python: PathBuf,
    project_dir: PathBuf,
}

impl PytestInventory {
    pub fn new(python: PathBuf, project_dir: PathBuf) -> Self {
        Self { python, project_dir }
    }

    /// Use the interpreter of an installed virtual environment
    pub fn from_venv(venv_dir: &Path, project_dir: PathBuf) -> Self {
        Self::new(venv_dir.join("bin").join("python"), project_dir)
    }
}

impl TestInventory for PytestInventory {
    async fn enumerate(&self) -> Result<Vec<TestCase>> {
        debug!(python = %self.python.display(), "Collecting tests");
        let output = Command::new(&self.python)
            .arg("-c")
            .arg(COLLECT_SCRIPT)
            .current_dir(&self.project_dir)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.python.display()))?;

        if !output.status.success() {
            bail!(
                "Test collection failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let tests = parse_collected(&String::from_utf8_lossy(&output.stdout))?;
        info!(tests = tests.len(), "Collected tests");
        Ok(tests)
    }
}

/// Parse the collection output. Items whose file is not a Python source
/// (doctest text files and the like) are skipped.
pub fn parse_collected(stdout: &str) -> Result<Vec<TestCase>> {
    let mut tests = Vec::new();
    for (idx, line) in stdout.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let item: CollectedItem = serde_json::from_str(line)
            .with_context(|| format!("Malformed collection output at line {}", idx + 1))?;

        if !item.file.ends_with(".py") {
            debug!(file = %item.file, "Skipping non-Python test item");
            continue;
        }
        tests.push(TestCase {
            source_file: PathBuf::from(item.file),
            case_id: item.case,
        });
    }
    Ok(tests)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_collected() {
        let stdout = concat!(
            r#"{"file": "tests/test_math.py", "case": "TestAdd.test_small"}"#,
            "\n",
            r#"{"file": "tests/test_io.py", "case": "test_read"}"#,
            "\n\n",
        );
        let tests = parse_collected(stdout).unwrap();
        assert_eq!(
            tests,
            vec![
                TestCase {
                    source_file: PathBuf::from("tests/test_math.py"),
                    case_id: "TestAdd.test_small".to_string(),
                },
                TestCase {
                    source_file: PathBuf::from("tests/test_io.py"),
                    case_id: "test_read".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_parse_skips_non_python_items() {
        let stdout = r#"{"file": "docs/usage.txt", "case": "[doctest] usage"}"#;
        assert!(parse_collected(stdout).unwrap().is_empty());
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_collected("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_malformed_line() {
        let err = parse_collected("collected 3 items").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_from_venv_uses_venv_python() {
        let inventory = PytestInventory::from_venv(Path::new("env"), PathBuf::from("/w"));
        assert_eq!(inventory.python, PathBuf::from("env/bin/python"));
    }
}
