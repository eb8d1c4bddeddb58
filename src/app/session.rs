use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::app::config::ReportingSettings;
use crate::app::error::AppError;
use crate::app::report::{ReportHeader, SessionReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisType {
    Manual,
    Automatic,
}

impl AnalysisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::Manual => "manual",
            AnalysisType::Automatic => "automatic",
        }
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AnalysisType {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "manual" => Ok(AnalysisType::Manual),
            "automatic" => Ok(AnalysisType::Automatic),
            other => Err(AppError::invalid_argument(
                format!("Analysis type is either manual or automatic, not {other}"),
                "",
            )),
        }
    }
}

/// Derives the experiment identifier from the APK set under analysis:
/// sorted, concatenated basenames. Deterministic and independent of input
/// order, but NOT unique across repeated runs with identical inputs; the
/// reporting sink is responsible for uniqueness if it needs one.
pub fn experiment_id(apk_paths: &[&Path], trace_id: &str) -> Result<String, AppError> {
    if apk_paths.is_empty() {
        return Err(AppError::invalid_argument(
            "Cannot derive an experiment id from an empty APK list",
            trace_id,
        ));
    }
    let mut names: Vec<String> = apk_paths
        .iter()
        .map(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().to_string())
                .ok_or_else(|| {
                    AppError::invalid_argument(
                        format!("APK path {} has no file name", path.display()),
                        trace_id,
                    )
                })
        })
        .collect::<Result<_, _>>()?;
    names.sort();
    let id = names.concat();
    debug!(trace_id = %trace_id, experiment_id = %id, "derived experiment id");
    Ok(id)
}

/// SHA-256 of the artifact under analysis, streamed in 64 KiB blocks.
pub fn artifact_sha256(path: &Path, trace_id: &str) -> Result<String, AppError> {
    let mut file = File::open(path).map_err(|err| {
        AppError::invalid_argument(
            format!("Cannot open artifact {}: {err}", path.display()),
            trace_id,
        )
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];
    loop {
        let count = file.read(&mut buffer).map_err(|err| {
            AppError::system(
                format!("Failed to read artifact {}: {err}", path.display()),
                trace_id,
            )
        })?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    Ok(hex)
}

/// Renders the section-delimited key=value configuration the on-device agent
/// reads from external storage. Written verbatim; the agent parses this
/// layout, so keys and sections are fixed.
pub fn render_agent_config(reporting: &ReportingSettings, experiment_id: &str) -> String {
    format!(
        "# Analysis configuration consumed by the on-device agent\n\
         # Network configuration\n\
         [elasticsearch]\n\
         elasticsearch_mode={}\n\
         elasticsearch_nb_thread={}\n\
         elasticsearch_ip={}\n\
         elasticsearch_port={}\n\
         elasticsearch_index={}\n\
         elasticsearch_doctype={}\n\
         \n\
         # File configuration\n\
         [file]\n\
         file_mode={}\n\
         file_name=events.logs\n\
         \n\
         [analysis]\n\
         idXP={}\n",
        reporting.elasticsearch_mode,
        reporting.elasticsearch_nb_thread,
        reporting.elasticsearch_ip,
        reporting.elasticsearch_port,
        reporting.elasticsearch_index,
        reporting.elasticsearch_doctype,
        reporting.file_mode,
        experiment_id,
    )
}

/// Prepared state for one experiment run.
pub struct SessionStart {
    pub experiment_id: String,
    pub agent_config: String,
}

/// Ties the report sink, the reporting configuration, and the experiment
/// bookkeeping together. Owns no device state; the lifecycle controller
/// stays the single owner of device transitions.
pub struct AnalysisSession {
    reporter: Arc<dyn SessionReporter>,
    reporting: ReportingSettings,
    analysis_type: AnalysisType,
    trace_id: String,
}

impl AnalysisSession {
    pub fn new(
        reporter: Arc<dyn SessionReporter>,
        reporting: ReportingSettings,
        analysis_type: AnalysisType,
        trace_id: &str,
    ) -> Self {
        Self {
            reporter,
            reporting,
            analysis_type,
            trace_id: trace_id.to_string(),
        }
    }

    /// Derives the experiment id, opens the report, and renders the agent
    /// configuration the caller deploys onto the device.
    pub fn begin(
        &self,
        apk_path: &Path,
        package_name: &str,
        device_name: &str,
        description: &str,
    ) -> Result<SessionStart, AppError> {
        let id = experiment_id(&[apk_path], &self.trace_id)?;
        let sha256 = artifact_sha256(apk_path, &self.trace_id)?;
        let artifact_name = apk_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        info!(
            trace_id = %self.trace_id,
            experiment_id = %id,
            device = %device_name,
            "opening experiment report"
        );
        self.reporter.create_report(
            &ReportHeader {
                experiment_id: id.clone(),
                device_name: device_name.to_string(),
                author: None,
                package_name: package_name.to_string(),
                artifact_name,
                artifact_sha256: sha256,
                analysis_type: self.analysis_type.to_string(),
                description: description.to_string(),
            },
            &self.trace_id,
        )?;

        Ok(SessionStart {
            experiment_id: id.clone(),
            agent_config: render_agent_config(&self.reporting, &id),
        })
    }

    pub fn report_event(
        &self,
        experiment_id: &str,
        source: &str,
        action: &str,
        params: Option<&HashMap<String, String>>,
    ) -> Result<(), AppError> {
        self.reporter
            .report_event(experiment_id, source, action, params, &self.trace_id)
    }
}
