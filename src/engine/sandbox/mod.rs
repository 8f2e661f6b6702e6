mod adapter;
mod capture;
mod nsjail;
mod process;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::ExitStatus,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::process::Command;
use uuid::Uuid;

use crate::engine::{
    config::{EngineConfig, SandboxBackendKind},
    error::AdapterError,
    models::{ExecutionOutcome, Phase, ResourceLimit},
    rules::{Limits, Mount, Rule},
    workspace::Workspace,
};

pub use adapter::IsolationAdapter;
pub use nsjail::NsjailEngine;
pub use process::ProcessEngine;

/// Everything an engine needs to confine one phase of one job.
#[derive(Debug, Clone)]
pub struct InvocationSpec {
    pub job_id: Uuid,
    pub phase: Phase,
    pub argv: Vec<String>,
    pub limits: Limits,
    pub read_only_mounts: Vec<Mount>,
    pub host_workdir: PathBuf,
    pub sandbox_workdir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub engine_log: PathBuf,
}

/// How an engine explained the way its process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineVerdict {
    Exited(i32),
    TimedOut,
    LimitExceeded(ResourceLimit),
    Denied(String),
    Unrecognized(String),
}

/// An external isolation engine. Implementations only translate: the adapter
/// owns spawning, deadlines, output capture and process teardown.
pub trait IsolationEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Working directory as the confined program sees it.
    fn program_workdir<'a>(&self, host: &'a Path, sandbox: &'a Path) -> &'a Path;

    fn build_command(&self, spec: &InvocationSpec) -> anyhow::Result<Command>;

    fn interpret(&self, status: ExitStatus, engine_log: &str) -> EngineVerdict;
}

/// Runs a single phase of a job and reports what happened.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn invoke(
        &self,
        rule: &Rule,
        workspace: &Workspace,
        phase: Phase,
        stdin: Option<&Bytes>,
    ) -> Result<ExecutionOutcome, AdapterError>;
}

pub struct SandboxFactory;

impl SandboxFactory {
    pub fn from_config(config: &EngineConfig) -> anyhow::Result<Arc<dyn IsolationEngine>> {
        match config.sandbox_backend {
            SandboxBackendKind::Nsjail => Ok(Arc::new(NsjailEngine::new(config.nsjail.clone())?)),
            SandboxBackendKind::Process => {
                tracing::warn!("process backend selected: submissions run without isolation");
                Ok(Arc::new(ProcessEngine::new()))
            }
        }
    }
}

/// Expands `{workdir}` inside arguments and replaces a bare `{sources}`
/// argument with every staged file name.
pub fn expand_template(template: &[String], workdir: &Path, sources: &[String]) -> Vec<String> {
    let workdir = workdir.to_string_lossy();
    let mut argv = Vec::with_capacity(template.len() + sources.len());
    for arg in template {
        if arg == "{sources}" {
            argv.extend(sources.iter().cloned());
        } else {
            argv.push(arg.replace("{workdir}", &workdir));
        }
    }
    argv
}

pub fn trim_for_log(value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_string();
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &value[..end])
}
