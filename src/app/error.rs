use serde::Serialize;
use std::fmt;

/// Error surfaced by any session or device operation.
///
/// The `code` identifies the failure class so callers can branch on it
/// without string matching; `error` carries the failing command and its
/// captured output where one exists.
#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    /// Caller error: bad identifier, empty name, empty package, bad enum value.
    pub fn invalid_argument(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_INVALID_ARGUMENT", message, trace_id)
    }

    /// Missing or empty backup subtree. Fatal at construction, never repaired.
    pub fn backup_source(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_BACKUP_SOURCE", message, trace_id)
    }

    /// External command returned failure or the device link broke.
    pub fn command(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_COMMAND", message, trace_id)
    }

    /// Readiness poll exhausted its wait budget.
    pub fn device_not_ready(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_DEVICE_NOT_READY", message, trace_id)
    }

    /// Agent configuration could not be written to the device.
    pub fn config_deploy(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_CONFIG_DEPLOY", message, trace_id)
    }

    /// The privileged copy of the recovery script produced output.
    pub fn recovery_script(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_RECOVERY_SCRIPT", message, trace_id)
    }

    /// Reporting sink unreachable.
    pub fn reporter(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_REPORTER", message, trace_id)
    }

    /// On-device instrumentation agent is not installed.
    pub fn agent_missing(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_AGENT_MISSING", message, trace_id)
    }

    /// Operation invoked on a handle whose state does not allow it.
    pub fn state(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_STATE", message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_SYSTEM", message, trace_id)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
