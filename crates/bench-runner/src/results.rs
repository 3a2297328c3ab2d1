//! Harvesting of the harness's result artifact.
//!
//! The harness writes one JSON document per run into the image's log
//! directory. A consumed artifact is renamed with a `checkedAt<unix-seconds>`
//! marker so later scans skip it; that rename is the only thing preventing the
//! same result from being reported twice.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::image::{IdentifierMode, ImageRef};

pub const RESULT_EXTENSION: &str = "json";
const ARCHIVE_MARKER: &str = "checkedAt";
const RESERVED_KEYS: [&str; 4] = ["image", "tag", "last_run", "retry_budget_seconds"];

/// A harness artifact enriched with the identity of the run that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    #[serde(flatten)]
    pub metrics: Map<String, Value>,
    pub image: String,
    /// Content-addressable id of the image build that was run.
    pub tag: String,
    pub last_run: NaiveDateTime,
    pub retry_budget_seconds: u64,
}

/// Payload posted to the controller's result endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResultReport {
    Measured(ExecutionResult),
    /// Sent once the retry budget is spent without any artifact.
    Placeholder { image: String },
}

impl ResultReport {
    pub fn placeholder(image: &ImageRef) -> Self {
        ResultReport::Placeholder {
            image: image.as_str().to_string(),
        }
    }

    pub fn image(&self) -> &str {
        match self {
            ResultReport::Measured(result) => &result.image,
            ResultReport::Placeholder { image } => image,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, ResultReport::Placeholder { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ResultExtractor {
    logs_root: PathBuf,
    mode: IdentifierMode,
    retry_budget: Duration,
}

impl ResultExtractor {
    pub fn new(logs_root: impl Into<PathBuf>, mode: IdentifierMode, retry_budget: Duration) -> Self {
        Self {
            logs_root: logs_root.into(),
            mode,
            retry_budget,
        }
    }

    pub fn log_dir(&self, image: &ImageRef) -> PathBuf {
        self.logs_root.join(image.identifier(self.mode))
    }

    /// Returns the single pending artifact for `image`, archived and enriched.
    ///
    /// No artifact is not an error. Several artifacts are ambiguous: all of
    /// them are deleted and nothing is returned.
    pub fn extract(
        &self,
        image: &ImageRef,
        tag: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionResult>> {
        let dir = self.log_dir(image);
        info!(image = %image, dir = %dir.display(), "looking for result files");
        let mut candidates = pending_artifacts(&dir)?;

        if candidates.is_empty() {
            warn!(image = %image, "no json result found");
            return Ok(None);
        }
        if candidates.len() > 1 {
            warn!(
                image = %image,
                count = candidates.len(),
                "multiple result files found; cleaning up"
            );
            for path in &candidates {
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "failed to delete result file");
                }
            }
            return Ok(None);
        }

        let path = candidates.remove(0);
        let parsed = read_artifact(&path);
        let archived = archive_name(&path, now.timestamp());
        fs::rename(&path, &archived).with_context(|| {
            format!(
                "failed to archive {} as {}",
                path.display(),
                archived.display()
            )
        })?;
        info!(from = %path.display(), to = %archived.display(), "archived result file");

        let mut metrics = parsed?;
        for key in RESERVED_KEYS {
            metrics.remove(key);
        }
        let result = ExecutionResult {
            metrics,
            image: image.as_str().to_string(),
            tag: tag.to_string(),
            last_run: truncate_to_minute(now),
            retry_budget_seconds: self.retry_budget.as_secs(),
        };
        info!(image = %image, metrics = ?result.metrics, "found results");
        Ok(Some(result))
    }
}

fn read_artifact(path: &Path) -> Result<Map<String, Value>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    match serde_json::from_str::<Value>(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?
    {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!(
            "result file {} holds {} instead of an object",
            path.display(),
            value_type_name(&other)
        )),
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Unarchived result files in `dir`, sorted by name. A missing directory has
/// none.
pub fn pending_artifacts(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("failed to list {}", dir.display())),
    };
    let mut out = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && is_pending_artifact(&path) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

fn is_pending_artifact(path: &Path) -> bool {
    let has_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e == RESULT_EXTENSION)
        .unwrap_or(false);
    let archived = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.contains(&format!(".{}", ARCHIVE_MARKER)))
        .unwrap_or(false);
    has_extension && !archived
}

/// `<base>.<ext>` becomes `<base>.checkedAt<unix-seconds>.<ext>`.
pub fn archive_name(path: &Path, unix_seconds: i64) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!(
            "{}.{}{}.{}",
            stem,
            ARCHIVE_MARKER,
            unix_seconds,
            ext.to_string_lossy()
        ),
        None => format!("{}.{}{}", stem, ARCHIVE_MARKER, unix_seconds),
    };
    path.with_file_name(name)
}

pub fn truncate_to_minute(now: DateTime<Utc>) -> NaiveDateTime {
    let naive = now.naive_utc();
    naive
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(naive)
}
