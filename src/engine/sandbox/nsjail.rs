use std::{
    os::unix::process::ExitStatusExt,
    path::Path,
    process::ExitStatus,
};

use tokio::process::Command;

use crate::engine::{
    config::NsjailConfig,
    models::ResourceLimit,
    sandbox::{EngineVerdict, InvocationSpec, IsolationEngine, trim_for_log},
};

const TIME_LIMIT_MARKER: &str = "run time >= time limit";
const SECCOMP_MARKER: &str = "seccomp violation";
const DENY_NETWORK_POLICY: &str =
    "POLICY deny_network { KILL { socket } } USE deny_network DEFAULT ALLOW";

const EXIT_SIGKILL: i32 = 128 + 9;
const EXIT_SIGSYS: i32 = 128 + 31;
const EXIT_SIGXCPU: i32 = 128 + 24;
const EXIT_SIGXFSZ: i32 = 128 + 25;
const EXIT_ENGINE_FAILURE: i32 = 255;

pub struct NsjailEngine {
    cfg: NsjailConfig,
}

impl NsjailEngine {
    pub fn new(cfg: NsjailConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(
            cfg.binary.is_file(),
            "nsjail binary not found at {}",
            cfg.binary.display()
        );
        Ok(Self { cfg })
    }

    fn arguments(&self, spec: &InvocationSpec) -> Vec<String> {
        let limits = &spec.limits;
        let mut args: Vec<String> = vec![
            "--mode".into(),
            "o".into(),
            "--log".into(),
            spec.engine_log.display().to_string(),
            "--time_limit".into(),
            ceil_div(limits.wall_time_ms, 1000).to_string(),
            "--rlimit_cpu".into(),
            ceil_div(limits.cpu_time_ms, 1000).to_string(),
            "--rlimit_as".into(),
            ceil_div(limits.memory_bytes, 1024 * 1024).to_string(),
            "--rlimit_nproc".into(),
            limits.max_processes.to_string(),
            "--cwd".into(),
            spec.sandbox_workdir.display().to_string(),
            "--bindmount".into(),
            format!(
                "{}:{}",
                spec.host_workdir.display(),
                spec.sandbox_workdir.display()
            ),
        ];

        for mount in &spec.read_only_mounts {
            args.push("--bindmount_ro".into());
            args.push(format!(
                "{}:{}",
                mount.source.display(),
                mount.target().display()
            ));
        }

        if self.cfg.use_cgroups {
            args.push("--cgroup_mem_max".into());
            args.push(limits.memory_bytes.to_string());
            args.push("--cgroup_pids_max".into());
            args.push(limits.max_processes.to_string());
        }

        if limits.allow_network {
            args.push("--disable_clone_newnet".into());
        }
        if let Some(policy) = &self.cfg.seccomp_policy {
            args.push("--seccomp_policy".into());
            args.push(policy.display().to_string());
            args.push("--seccomp_log".into());
        } else if !limits.allow_network {
            args.push("--seccomp_string".into());
            args.push(DENY_NETWORK_POLICY.into());
            args.push("--seccomp_log".into());
        }

        for (key, value) in &spec.env {
            args.push("--env".into());
            args.push(format!("{key}={value}"));
        }

        args.push("--".into());
        args.extend(spec.argv.iter().cloned());
        args
    }
}

impl IsolationEngine for NsjailEngine {
    fn name(&self) -> &'static str {
        "nsjail"
    }

    fn program_workdir<'a>(&self, _host: &'a Path, sandbox: &'a Path) -> &'a Path {
        sandbox
    }

    fn build_command(&self, spec: &InvocationSpec) -> anyhow::Result<Command> {
        anyhow::ensure!(!spec.argv.is_empty(), "invocation has an empty argv");
        let mut cmd = Command::new(&self.cfg.binary);
        cmd.args(self.arguments(spec));
        Ok(cmd)
    }

    fn interpret(&self, status: ExitStatus, engine_log: &str) -> EngineVerdict {
        let Some(code) = status.code() else {
            return EngineVerdict::Unrecognized(format!(
                "nsjail itself was terminated by signal {:?}",
                status.signal()
            ));
        };

        if engine_log.contains(TIME_LIMIT_MARKER) {
            return EngineVerdict::TimedOut;
        }
        if code == EXIT_SIGSYS || engine_log.contains(SECCOMP_MARKER) {
            let line = engine_log
                .lines()
                .find(|line| line.contains(SECCOMP_MARKER))
                .unwrap_or("terminated by SIGSYS");
            return EngineVerdict::Denied(trim_for_log(line, 256));
        }

        match code {
            EXIT_SIGKILL => EngineVerdict::LimitExceeded(ResourceLimit::Memory),
            EXIT_SIGXCPU => EngineVerdict::LimitExceeded(ResourceLimit::Cpu),
            EXIT_SIGXFSZ => EngineVerdict::LimitExceeded(ResourceLimit::FileSize),
            EXIT_ENGINE_FAILURE => match fatal_line(engine_log) {
                Some(line) => EngineVerdict::Unrecognized(trim_for_log(line, 256)),
                None => EngineVerdict::Exited(code),
            },
            0..=255 => EngineVerdict::Exited(code),
            other => EngineVerdict::Unrecognized(format!("nsjail exit code {other}")),
        }
    }
}

fn fatal_line(log: &str) -> Option<&str> {
    log.lines()
        .find(|line| line.starts_with("[F]") || line.starts_with("[E]"))
}

fn ceil_div(value: u64, unit: u64) -> u64 {
    value.div_ceil(unit).max(1)
}
