use std::{
    env,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    pub rules_path: PathBuf,
    pub max_concurrent_jobs: usize,
    pub max_queue_depth: usize,
    pub sandbox_backend: SandboxBackendKind,
    pub nsjail: NsjailConfig,
    pub workspace: WorkspaceConfig,
    pub kill_grace: Duration,
    pub max_stdin_bytes: usize,
    pub max_request_bytes: usize,
    pub unclaimed_result_ttl: Duration,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct NsjailConfig {
    pub binary: PathBuf,
    pub use_cgroups: bool,
    pub seccomp_policy: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    pub base_dir: PathBuf,
    pub dir_mode: u32,
    pub max_files: usize,
    pub max_file_bytes: u64,
    pub max_total_bytes: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: env::temp_dir().join("runjail"),
            dir_mode: 0o770,
            max_files: 64,
            max_file_bytes: 256 * 1024,
            max_total_bytes: 1024 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let workspace_defaults = WorkspaceConfig::default();
        Self {
            bind_addr: env_parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 1556))),
            rules_path: env::var("RULES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("rules/default.json")),
            max_concurrent_jobs: env_parse("MAX_CONCURRENT_JOBS", 4usize),
            max_queue_depth: env_parse("MAX_QUEUE_DEPTH", 64usize),
            sandbox_backend: env_parse("SANDBOX_BACKEND", SandboxBackendKind::Nsjail),
            nsjail: NsjailConfig {
                binary: env::var("NSJAIL_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("/usr/bin/nsjail")),
                use_cgroups: env_parse("NSJAIL_USE_CGROUPS", false),
                seccomp_policy: env::var("NSJAIL_SECCOMP_POLICY").ok().map(PathBuf::from),
            },
            workspace: WorkspaceConfig {
                base_dir: env::var("WORKSPACE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(workspace_defaults.base_dir),
                dir_mode: workspace_defaults.dir_mode,
                max_files: env_parse("MAX_SOURCE_FILES", workspace_defaults.max_files),
                max_file_bytes: env_parse(
                    "MAX_SOURCE_FILE_BYTES",
                    workspace_defaults.max_file_bytes,
                ),
                max_total_bytes: env_parse(
                    "MAX_SOURCE_TOTAL_BYTES",
                    workspace_defaults.max_total_bytes,
                ),
            },
            kill_grace: Duration::from_millis(env_parse("KILL_GRACE_MS", 100u64)),
            max_stdin_bytes: env_parse("MAX_STDIN_BYTES", 256 * 1024usize),
            max_request_bytes: env_parse("MAX_REQUEST_BYTES", 2 * 1024 * 1024usize),
            unclaimed_result_ttl: Duration::from_secs(env_parse(
                "UNCLAIMED_RESULT_TTL_SECS",
                300u64,
            )),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SandboxBackendKind {
    #[default]
    Nsjail,
    Process,
}

impl FromStr for SandboxBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nsjail" => Ok(Self::Nsjail),
            "process" => Ok(Self::Process),
            _ => Err(format!("unsupported sandbox backend: {s}")),
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
