//! File-backed test catalog.
//!
//! Each test record lives in its own `<id>.json` file inside the catalog
//! directory. The catalog is only consulted to turn a test name into a
//! command line and to remember the last outcome of a run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Lifecycle state of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TestStatus {
    #[default]
    #[serde(rename = "not run")]
    NotRun,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "passed")]
    Passed,
}

impl TestStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotRun => "not run",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Passed => "passed",
        }
    }

    /// Terminal status for a finished run.
    pub const fn from_outcome(succeeded: bool) -> Self {
        if succeeded { Self::Passed } else { Self::Failed }
    }
}

/// One stored test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed_at: Option<String>,
}

impl TestRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: TestStatus::NotRun,
            failed_at: None,
            passed_at: None,
        }
    }
}

/// Directory of test records.
#[derive(Debug, Clone)]
pub struct TestCatalog {
    dir: PathBuf,
}

impl TestCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load every `*.json` record, sorted by test name.
    ///
    /// A missing directory is an empty catalog.
    pub fn list(&self) -> Result<Vec<TestRecord>> {
        if !self.dir.exists() {
            debug!(dir = %self.dir.display(), "Catalog directory does not exist");
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            Error::Catalog(format!(
                "Failed to read tests directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            records.push(load_record(&path)?);
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Find a record by test name.
    pub fn find(&self, name: &str) -> Result<Option<TestRecord>> {
        Ok(self.list()?.into_iter().find(|r| r.name == name))
    }

    /// Persist a record as `<id>.json`, creating the directory if needed.
    pub fn save(&self, record: &TestRecord) -> Result<PathBuf> {
        if record.id.is_empty() || record.id.contains(['/', '\\']) || record.id.starts_with('.') {
            return Err(Error::Catalog(format!("Invalid test id: {:?}", record.id)));
        }
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.json", record.id));
        let content = serde_json::to_string_pretty(record)?;
        std::fs::write(&path, content)?;
        debug!(path = %path.display(), "Saved test record");
        Ok(path)
    }

    /// Store the outcome of a finished run on the named test.
    ///
    /// Returns the updated record, or `None` if no such test is catalogued.
    pub fn record_outcome(
        &self,
        name: &str,
        succeeded: bool,
        timestamp: &str,
    ) -> Result<Option<TestRecord>> {
        let Some(mut record) = self.find(name)? else {
            return Ok(None);
        };
        record.status = TestStatus::from_outcome(succeeded);
        if succeeded {
            record.passed_at = Some(timestamp.to_string());
        } else {
            record.failed_at = Some(timestamp.to_string());
        }
        self.save(&record)?;
        info!(test = %name, status = record.status.as_str(), "Recorded test outcome");
        Ok(Some(record))
    }
}

fn load_record(path: &Path) -> Result<TestRecord> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Catalog(format!("Failed to read test record {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Catalog(format!("Failed to parse test record {}: {}", path.display(), e))
    })
}

/// Spec file for a test name: `<name><suffix>`, e.g. `login.spec.ts`.
pub fn spec_file(name: &str, suffix: &str) -> String {
    format!("{name}{suffix}")
}

/// Substitute `{file}` in a command template.
///
/// A template without the placeholder gets the file appended.
pub fn build_command(template: &str, file: &str) -> String {
    if template.contains("{file}") {
        template.replace("{file}", file)
    } else {
        format!("{template} {file}")
    }
}
