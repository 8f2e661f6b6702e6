use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::rules::Limits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Compile,
    Run,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Compile => "compile",
            Phase::Run => "run",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Compiling,
    Running,
    Completed,
    CompileError,
    RuntimeError,
    TimedOut,
    SandboxViolation,
    InternalError,
}

impl JobState {
    pub const TERMINAL: [JobState; 6] = [
        JobState::Completed,
        JobState::CompileError,
        JobState::RuntimeError,
        JobState::TimedOut,
        JobState::SandboxViolation,
        JobState::InternalError,
    ];

    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            JobState::Queued | JobState::Compiling | JobState::Running
        )
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Queued, Compiling | Running | InternalError) => true,
            (Compiling, Running | CompileError | RuntimeError | TimedOut | SandboxViolation) => {
                true
            }
            (Compiling, InternalError) => true,
            (Running, Completed | RuntimeError | TimedOut | SandboxViolation | InternalError) => {
                true
            }
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Compiling => "compiling",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::CompileError => "compile_error",
            JobState::RuntimeError => "runtime_error",
            JobState::TimedOut => "timed_out",
            JobState::SandboxViolation => "sandbox_violation",
            JobState::InternalError => "internal_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Normal,
    WallTimeout,
    ResourceLimitExceeded,
    SandboxDenied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceLimit {
    Memory,
    Cpu,
    Processes,
    FileSize,
}

/// What one engine invocation produced. `exit_code` is only meaningful when
/// `terminated_reason` is `Normal`.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub terminated_reason: TerminationReason,
    pub limit: Option<ResourceLimit>,
    pub truncated: bool,
    pub detail: Option<String>,
}

/// How a text field of a submission carries its bytes. `base64` lets callers
/// send content that is not valid UTF-8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentEncoding {
    #[default]
    Utf8,
    Base64,
}

impl ContentEncoding {
    pub fn decode(self, text: String) -> Result<Bytes, base64::DecodeError> {
        match self {
            ContentEncoding::Utf8 => Ok(Bytes::from(text)),
            ContentEncoding::Base64 => general_purpose::STANDARD.decode(text).map(Bytes::from),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub encoding: ContentEncoding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub language: String,
    pub files: Vec<SourceFile>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub stdin_encoding: ContentEncoding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub id: Uuid,
    pub state: JobState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub id: Uuid,
    pub language: String,
    pub state: JobState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageSummary {
    pub language: String,
    pub compiled: bool,
    pub limits: Limits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub id: Uuid,
    pub language: String,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_stderr: Option<String>,
    pub compile_duration_ms: Option<u64>,
    pub run_duration_ms: Option<u64>,
    pub duration_ms: u64,
    pub truncated: bool,
    pub limit_exceeded: Option<ResourceLimit>,
    pub detail: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
