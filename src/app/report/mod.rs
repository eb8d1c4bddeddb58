use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::app::error::AppError;

/// Metadata opening a report for one experiment.
#[derive(Debug, Clone, Serialize)]
pub struct ReportHeader {
    pub experiment_id: String,
    pub device_name: String,
    pub author: Option<String>,
    pub package_name: String,
    pub artifact_name: String,
    pub artifact_sha256: String,
    pub analysis_type: String,
    pub description: String,
}

/// External sink that persists experiment metadata and streamed events.
///
/// The controller never retries these calls; an unreachable sink surfaces as
/// `ERR_REPORTER` and the caller decides what to do.
pub trait SessionReporter: Send + Sync {
    fn create_report(&self, header: &ReportHeader, trace_id: &str) -> Result<(), AppError>;

    fn report_event(
        &self,
        experiment_id: &str,
        source: &str,
        action: &str,
        params: Option<&HashMap<String, String>>,
        trace_id: &str,
    ) -> Result<(), AppError>;
}

/// Appends reports and events as JSON lines to a local file.
pub struct FileReporter {
    path: PathBuf,
}

impl FileReporter {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn append(&self, value: serde_json::Value, trace_id: &str) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                AppError::reporter(
                    format!(
                        "Failed to create report sink directory {}: {err}",
                        parent.display()
                    ),
                    trace_id,
                )
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| {
                AppError::reporter(
                    format!("Failed to open report sink {}: {err}", self.path.display()),
                    trace_id,
                )
            })?;
        let line = serde_json::to_string(&value).map_err(|err| {
            AppError::reporter(format!("Failed to serialize report entry: {err}"), trace_id)
        })?;
        writeln!(file, "{line}").map_err(|err| {
            AppError::reporter(
                format!("Failed to write report sink {}: {err}", self.path.display()),
                trace_id,
            )
        })?;
        Ok(())
    }
}

impl SessionReporter for FileReporter {
    fn create_report(&self, header: &ReportHeader, trace_id: &str) -> Result<(), AppError> {
        debug!(trace_id = %trace_id, experiment_id = %header.experiment_id, "creating report");
        self.append(
            serde_json::json!({
                "kind": "report",
                "created_at": Utc::now().to_rfc3339(),
                "header": header,
            }),
            trace_id,
        )
    }

    fn report_event(
        &self,
        experiment_id: &str,
        source: &str,
        action: &str,
        params: Option<&HashMap<String, String>>,
        trace_id: &str,
    ) -> Result<(), AppError> {
        self.append(
            serde_json::json!({
                "kind": "event",
                "created_at": Utc::now().to_rfc3339(),
                "experiment_id": experiment_id,
                "source": source,
                "action": action,
                "params": params,
            }),
            trace_id,
        )
    }
}
