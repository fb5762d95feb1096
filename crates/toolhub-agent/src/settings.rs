use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

use crate::log_service::DEFAULT_RETAINED_CLOSED;
use crate::usecases::CreateConfigurationRequest;

const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_RETENTION_DAYS: u32 = 7;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RESTART_SETTLE_MS: u64 = 2000;
const DEFAULT_STARTUP_GRACE_MS: u64 = 1000;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn absolute(p: PathBuf) -> PathBuf {
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };
    // Best-effort canonicalization: the directory may not exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

fn clamp_log_file_bytes(v: u64) -> u64 {
    if v == 0 {
        0
    } else {
        v.clamp(64 * 1024, 1024 * 1024 * 1024)
    }
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub data_root: PathBuf,
    pub log_dir: PathBuf,
    pub log_max_lines: usize,
    pub log_file_max_bytes: u64,
    pub log_retention_days: u32,
    /// Stopped subjects whose log tails stay in memory.
    pub log_retained_subjects: usize,
    pub stop_timeout: Duration,
    pub restart_settle: Duration,
    pub startup_grace: Duration,
    pub catalogue_path: Option<PathBuf>,
    pub seed_path: Option<PathBuf>,
}

impl AgentSettings {
    /// Defaults rooted at `data_root`, ignoring the environment.
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        let data_root = data_root.into();
        Self {
            log_dir: data_root.join("logs"),
            data_root,
            log_max_lines: DEFAULT_LOG_MAX_LINES,
            log_file_max_bytes: DEFAULT_LOG_FILE_MAX_BYTES,
            log_retention_days: DEFAULT_LOG_RETENTION_DAYS,
            log_retained_subjects: DEFAULT_RETAINED_CLOSED,
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            restart_settle: Duration::from_millis(DEFAULT_RESTART_SETTLE_MS),
            startup_grace: Duration::from_millis(DEFAULT_STARTUP_GRACE_MS),
            catalogue_path: None,
            seed_path: None,
        }
    }

    pub fn from_env() -> Self {
        let data_root = absolute(env_path("TOOLHUB_DATA_ROOT").unwrap_or_else(|| "./data".into()));
        let mut s = Self::with_data_root(data_root);

        if let Some(dir) = env_path("TOOLHUB_LOG_DIR") {
            s.log_dir = absolute(dir);
        }
        if let Some(v) = env_usize("TOOLHUB_LOG_MAX_LINES") {
            s.log_max_lines = v.clamp(100, 50_000);
        }
        if let Some(v) = env_u64("TOOLHUB_LOG_FILE_MAX_BYTES") {
            s.log_file_max_bytes = clamp_log_file_bytes(v);
        }
        if let Some(v) = env_u64("TOOLHUB_LOG_RETENTION_DAYS") {
            s.log_retention_days = v.clamp(0, 3650) as u32;
        }
        if let Some(v) = env_usize("TOOLHUB_LOG_RETAINED_SUBJECTS") {
            s.log_retained_subjects = v.clamp(1, 100_000);
        }
        if let Some(v) = env_u64("TOOLHUB_STOP_TIMEOUT_MS") {
            s.stop_timeout = Duration::from_millis(v.clamp(500, 10 * 60 * 1000));
        }
        if let Some(v) = env_u64("TOOLHUB_RESTART_SETTLE_MS") {
            s.restart_settle = Duration::from_millis(v.clamp(0, 60_000));
        }
        if let Some(v) = env_u64("TOOLHUB_STARTUP_GRACE_MS") {
            s.startup_grace = Duration::from_millis(v.clamp(0, 60_000));
        }
        s.catalogue_path = env_path("TOOLHUB_CATALOGUE");
        s.seed_path = env_path("TOOLHUB_SEED");
        s
    }
}

#[derive(Debug, Default, serde::Deserialize)]
struct SeedFile {
    #[serde(default)]
    configurations: Vec<CreateConfigurationRequest>,
}

pub fn parse_seed(raw: &str) -> anyhow::Result<Vec<CreateConfigurationRequest>> {
    let seed: SeedFile = toml::from_str(raw).context("parse seed configurations")?;
    Ok(seed.configurations)
}

/// Configurations to create when the daemon boots.
pub fn load_seed(path: &Path) -> anyhow::Result<Vec<CreateConfigurationRequest>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read seed file {}", path.display()))?;
    parse_seed(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolhub_process::ToolType;

    #[test]
    fn defaults_hang_off_data_root() {
        let s = AgentSettings::with_data_root("/srv/toolhub");
        assert_eq!(s.log_dir, PathBuf::from("/srv/toolhub/logs"));
        assert_eq!(s.log_max_lines, DEFAULT_LOG_MAX_LINES);
        assert_eq!(s.restart_settle, Duration::from_secs(2));
        assert_eq!(s.log_retained_subjects, DEFAULT_RETAINED_CLOSED);
        assert!(s.catalogue_path.is_none());
    }

    #[test]
    fn log_file_limit_keeps_zero_as_disabled() {
        assert_eq!(clamp_log_file_bytes(0), 0);
        assert_eq!(clamp_log_file_bytes(1), 64 * 1024);
        assert_eq!(clamp_log_file_bytes(u64::MAX), 1024 * 1024 * 1024);
    }

    #[test]
    fn seed_file_parses_configurations() {
        let raw = r#"
[[configurations]]
name = "comfy"
tool_type = "comfyui"
executable_path = "/opt/comfy/.venv/bin/python"
working_dir = "/opt/comfy"
host = "127.0.0.1"
port = 8188
arguments = ["main.py", "--port", "8188"]
auto_start = true

[configurations.environment]
CUDA_VISIBLE_DEVICES = "0"

[[configurations]]
name = "ollama"
tool_type = "ollama"
executable_path = "/usr/local/bin/ollama"
host = "127.0.0.1"
port = 11434
"#;
        let seed = parse_seed(raw).unwrap();
        assert_eq!(seed.len(), 2);
        assert_eq!(seed[0].tool_type, ToolType::ComfyUi);
        assert!(seed[0].auto_start);
        assert_eq!(seed[0].environment.get("CUDA_VISIBLE_DEVICES").unwrap(), "0");
        assert_eq!(seed[1].tool_type, ToolType::Ollama);
        assert!(seed[1].arguments.is_empty());
        assert!(!seed[1].auto_start);
    }

    #[test]
    fn seed_file_rejects_unknown_tool_type() {
        let raw = r#"
[[configurations]]
name = "x"
tool_type = "photoshop"
executable_path = "/bin/true"
host = "127.0.0.1"
port = 1
"#;
        assert!(parse_seed(raw).is_err());
    }
}
