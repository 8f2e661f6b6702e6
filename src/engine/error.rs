use std::path::PathBuf;

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::{HeaderValue, StatusCode, header};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to read policy document {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed policy document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("policy document defines no rules")]
    Empty,
    #[error("rule #{index} has an empty language identifier")]
    EmptyLanguage { index: usize },
    #[error("language '{0}' is defined more than once")]
    DuplicateLanguage(String),
    #[error("language '{0}' has an empty run command")]
    EmptyRunCommand(String),
    #[error("language '{0}' has an empty compile command")]
    EmptyCompileCommand(String),
    #[error("language '{language}' limit '{field}' must be greater than zero")]
    NonPositiveLimit {
        language: String,
        field: &'static str,
    },
    #[error("language '{language}' mounts {path}, which does not exist on the host")]
    MissingMountSource { language: String, path: PathBuf },
    #[error("language '{language}' uses non-absolute sandbox path {path}")]
    RelativeSandboxPath { language: String, path: PathBuf },
    #[error("unknown language '{0}'")]
    UnknownLanguage(String),
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("source file name '{0}' is not a plain relative path")]
    InvalidFileName(String),
    #[error("source file '{0}' is submitted more than once")]
    DuplicateFile(String),
    #[error("source path '{0}' is used both as a file and as a directory")]
    PathConflict(String),
    #[error("too many source files: {count} > {max}")]
    TooManyFiles { count: usize, max: usize },
    #[error("source file '{name}' is {size} bytes, limit is {max}")]
    FileTooLarge { name: String, size: u64, max: u64 },
    #[error("sources total {size} bytes, limit is {max}")]
    TotalTooLarge { size: u64, max: u64 },
    #[error("no source files submitted")]
    NoFiles,
}

impl WorkspaceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("rule for '{language}' has no {phase} command")]
    MissingCommand {
        language: String,
        phase: &'static str,
    },
    #[error("failed to prepare isolation engine command: {0}")]
    Prepare(#[from] anyhow::Error),
    #[error("failed to launch isolation engine: {0}")]
    Launch(#[source] std::io::Error),
    #[error("failed waiting on isolation engine: {0}")]
    Wait(#[source] std::io::Error),
    #[error("unrecognized isolation engine exit: {0}")]
    UnrecognizedExit(String),
}

#[derive(Debug, Error)]
pub enum JobFault {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("illegal job state transition {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

impl JobFault {
    /// Text safe to hand back to the submitter. Host paths and engine
    /// plumbing stay in the logs.
    pub fn public_detail(&self) -> String {
        match self {
            JobFault::Workspace(WorkspaceError::Io { .. }) => {
                "workspace preparation failed".to_string()
            }
            JobFault::Workspace(err) => err.to_string(),
            JobFault::Adapter(AdapterError::UnrecognizedExit(_)) => {
                "isolation engine exited unexpectedly".to_string()
            }
            JobFault::Adapter(AdapterError::MissingCommand { phase, .. }) => {
                format!("language rule has no {phase} command")
            }
            JobFault::Adapter(_) => "isolation engine failure".to_string(),
            JobFault::InvalidTransition { .. } => "internal state error".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("unknown language '{0}'")]
    UnknownLanguage(String),
    #[error("rejected: execution capacity reached")]
    RejectedAtCapacity,
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),
    #[error("no pending job {0}")]
    UnknownJob(uuid::Uuid),
    #[error("admission queue closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unknown language '{0}'")]
    UnknownLanguage(String),
    #[error("execution capacity reached, retry later")]
    AtCapacity,
    #[error("job not found")]
    NotFound,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match self {
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::UnknownLanguage(_) => StatusCode::BAD_REQUEST,
            EngineError::AtCapacity => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::NotFound => StatusCode::NOT_FOUND,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let retry = matches!(self, EngineError::AtCapacity);
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        let mut response = (status, body).into_response();
        if retry {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

impl From<AdmissionError> for EngineError {
    fn from(value: AdmissionError) -> Self {
        match value {
            AdmissionError::UnknownLanguage(language) => Self::UnknownLanguage(language),
            AdmissionError::RejectedAtCapacity => Self::AtCapacity,
            AdmissionError::InvalidSubmission(reason) => Self::InvalidRequest(reason),
            AdmissionError::UnknownJob(_) => Self::NotFound,
            AdmissionError::Closed => Self::Internal("admission queue closed".to_string()),
        }
    }
}
