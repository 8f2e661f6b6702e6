use std::{
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::ExitStatus,
};

use anyhow::Context;
use nix::sys::signal::Signal;
use tokio::process::Command;

use crate::engine::{
    models::ResourceLimit,
    sandbox::{EngineVerdict, InvocationSpec, IsolationEngine},
};

/// Runs commands directly on the host inside the workspace. It applies no
/// confinement and exists for development machines and the test suite.
pub struct ProcessEngine;

impl ProcessEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProcessEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IsolationEngine for ProcessEngine {
    fn name(&self) -> &'static str {
        "process"
    }

    fn program_workdir<'a>(&self, host: &'a Path, _sandbox: &'a Path) -> &'a Path {
        host
    }

    fn build_command(&self, spec: &InvocationSpec) -> anyhow::Result<Command> {
        let (program, args) = spec
            .argv
            .split_first()
            .context("invocation has an empty argv")?;

        let program = PathBuf::from(program);
        let program = if program.is_relative() && program.components().count() > 1 {
            spec.host_workdir.join(program)
        } else {
            program
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&spec.host_workdir)
            .envs(&spec.env);
        Ok(cmd)
    }

    fn interpret(&self, status: ExitStatus, _engine_log: &str) -> EngineVerdict {
        if let Some(code) = status.code() {
            return EngineVerdict::Exited(code);
        }
        let Some(raw) = status.signal() else {
            return EngineVerdict::Unrecognized(format!("no exit code or signal in {status}"));
        };
        match Signal::try_from(raw) {
            Ok(Signal::SIGSYS) => EngineVerdict::Denied("terminated by SIGSYS".to_string()),
            Ok(Signal::SIGXCPU) => EngineVerdict::LimitExceeded(ResourceLimit::Cpu),
            Ok(Signal::SIGXFSZ) => EngineVerdict::LimitExceeded(ResourceLimit::FileSize),
            Ok(Signal::SIGKILL) => EngineVerdict::LimitExceeded(ResourceLimit::Memory),
            _ => EngineVerdict::Exited(128 + raw),
        }
    }
}
