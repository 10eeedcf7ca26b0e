use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub const EXIT_GENERAL: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_CONFLICT: i32 = 3;
pub const EXIT_SUPERVISOR: i32 = 4;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stderr: Option<String>,
}

#[derive(Debug, Error)]
pub enum ServError {
    #[error("config parse error in {}:{line}:{column}: {message}", .path.display())]
    ConfigParse {
        path: PathBuf,
        line: usize,
        column: usize,
        message: String,
    },
    #[error("config error: {0}")]
    Config(String),
    #[error("port {port} is already in use by {owner}. {remedy}")]
    PortConflict {
        port: u16,
        owner: String,
        remedy: String,
    },
    #[error("no free port left in range {start}-{end}; stop or prune unused instances (`servman prune`) or set an explicit port")]
    PortExhausted { start: u16, end: u16 },
    #[error("environment '{env}' is already locked. Run `servman lock --env {env} --update` to refresh the snapshot, or `servman unlock --env {env}` first.")]
    AlreadyLocked { env: String },
    #[error("refusing to modify the config file while locked environments exist: {}. Run `servman lock --env <env> --update` after editing, or `servman unlock --env <env>` first (use --dry-run to preview).", .envs.join(", "))]
    LockViolation { envs: Vec<String> },
    #[error("`{tool}` was not found on PATH. {guidance}")]
    CertificateToolingMissing { tool: String, guidance: String },
    #[error("runtime validation failed: {0}")]
    RuntimeValidation(String),
    #[error("instance '{name}' did not bind port {port} within {timeout_sec}s; check `servman logs --name {name}`")]
    ProcessStartTimeout {
        name: String,
        port: u16,
        timeout_sec: u64,
    },
    #[error("instance '{name}' failed to start: {message}")]
    ProcessStartFailed { name: String, message: String },
    #[error("instance '{name}' (pid {pid}) did not stop within {timeout_sec}s")]
    ProcessStopTimeout {
        name: String,
        pid: u32,
        timeout_sec: u64,
    },
    #[error("start of instance '{name}' was interrupted; the partially started process was terminated")]
    Interrupted { name: String },
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("{failed} of {total} instances failed")]
    BulkFailure {
        failed: usize,
        total: usize,
        /// Per-instance outcomes, reported alongside the error.
        summary: serde_json::Value,
    },
    #[error("process error: {0}")]
    Process(String),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ProcessErrorDetails,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ServError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigParse { .. } | Self::Config(_) | Self::RuntimeValidation(_) => EXIT_CONFIG,
            Self::PortConflict { .. }
            | Self::PortExhausted { .. }
            | Self::AlreadyLocked { .. }
            | Self::LockViolation { .. } => EXIT_CONFLICT,
            Self::CertificateToolingMissing { .. }
            | Self::ProcessStartTimeout { .. }
            | Self::ProcessStartFailed { .. }
            | Self::ProcessStopTimeout { .. }
            | Self::Interrupted { .. }
            | Self::BulkFailure { .. }
            | Self::Process(_)
            | Self::ProcessDetailed { .. } => EXIT_SUPERVISOR,
            Self::InstanceNotFound(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Prompt(_)
            | Self::Http(_) => EXIT_GENERAL,
        }
    }

    pub fn details(&self) -> Option<ProcessErrorDetails> {
        match self {
            Self::ProcessDetailed { details, .. } => Some(details.clone()),
            Self::CertificateToolingMissing { tool, guidance } => Some(ProcessErrorDetails {
                error_code: "certificate_tool_missing".to_string(),
                hint: Some(guidance.clone()),
                command: Some(tool.clone()),
                raw_stderr: None,
            }),
            _ => None,
        }
    }

    /// Work that completed before the command failed, if any.
    pub fn partial_result(&self) -> Option<serde_json::Value> {
        match self {
            Self::BulkFailure { summary, .. } => Some(summary.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_failure_carries_the_per_instance_summary() {
        let err = ServError::BulkFailure {
            failed: 1,
            total: 2,
            summary: serde_json::json!({"failed": 1, "total": 2, "results": []}),
        };
        assert_eq!(err.to_string(), "1 of 2 instances failed");
        assert_eq!(err.exit_code(), EXIT_SUPERVISOR);
        assert_eq!(err.partial_result().unwrap()["total"], 2);
        assert!(ServError::InstanceNotFound("shop".to_string()).partial_result().is_none());
    }

    #[test]
    fn lock_violation_lists_every_environment() {
        let err = ServError::LockViolation {
            envs: vec!["_default".to_string(), "prod".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("_default, prod"));
        assert!(message.contains("--update"));
        assert!(message.contains("unlock"));
        assert_eq!(err.exit_code(), EXIT_CONFLICT);
    }

    #[test]
    fn exit_codes_separate_config_from_supervisor_failures() {
        assert_eq!(ServError::Config("bad".into()).exit_code(), EXIT_CONFIG);
        assert_eq!(
            ServError::ProcessStartTimeout {
                name: "a".into(),
                port: 8080,
                timeout_sec: 1
            }
            .exit_code(),
            EXIT_SUPERVISOR
        );
        assert_eq!(
            ServError::PortExhausted {
                start: 1,
                end: 2
            }
            .exit_code(),
            EXIT_CONFLICT
        );
    }
}
