use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Serialize;
use toolhub_process::ToolType;

use crate::catalogue::{PortRange, ToolCatalogue, ToolProfile};
use crate::error::{ToolError, ToolResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemInfo {
    pub os: String,
    pub os_family: String,
    pub arch: String,
    pub cpu_cores: usize,
    pub total_memory_bytes: u64,
    pub data_root_free_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyStatus {
    pub tool_type: ToolType,
    pub available: Vec<String>,
    pub satisfied: bool,
    pub missing: Vec<String>,
    pub recommendations: Vec<String>,
}

#[cfg(target_os = "linux")]
fn total_memory_bytes() -> u64 {
    let (pages, page) = unsafe {
        (
            libc::sysconf(libc::_SC_PHYS_PAGES),
            libc::sysconf(libc::_SC_PAGESIZE),
        )
    };
    if pages <= 0 || page <= 0 {
        return 0;
    }
    (pages as u64).saturating_mul(page as u64)
}

#[cfg(not(target_os = "linux"))]
fn total_memory_bytes() -> u64 {
    0
}

#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
fn free_bytes(p: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c = CString::new(p.as_os_str().as_bytes()).ok()?;
    let mut s: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c.as_ptr(), &mut s) };
    if rc != 0 {
        return None;
    }
    Some((s.f_bsize as u64).saturating_mul(s.f_bavail as u64))
}

#[cfg(not(unix))]
fn free_bytes(_p: &Path) -> Option<u64> {
    None
}

/// Free space of the filesystem holding `p`, looking at the nearest existing
/// ancestor when `p` has not been created yet.
fn free_bytes_near(p: &Path) -> u64 {
    p.ancestors().find_map(free_bytes).unwrap_or(0)
}

/// True when any `/` or `\` separated segment is exactly `..`.
pub fn contains_traversal(raw: &str) -> bool {
    raw.split(['/', '\\']).any(|seg| seg == "..")
}

fn recommendation(command: &str) -> String {
    match command {
        "python3" | "python" => {
            "Install Python 3 (https://www.python.org/downloads/) and make sure it is on PATH."
                .to_string()
        }
        "git" => "Install Git (https://git-scm.com/downloads) and make sure it is on PATH.".to_string(),
        other => format!("Install `{other}` and make sure it is on PATH."),
    }
}

/// Read-only queries about the host and the tool catalogue.
#[derive(Debug, Clone)]
pub struct CapabilityService {
    catalogue: Arc<ToolCatalogue>,
    data_root: PathBuf,
}

impl CapabilityService {
    pub fn new(catalogue: Arc<ToolCatalogue>, data_root: impl Into<PathBuf>) -> Self {
        Self {
            catalogue,
            data_root: data_root.into(),
        }
    }

    pub fn system_info(&self) -> SystemInfo {
        SystemInfo {
            os: std::env::consts::OS.to_string(),
            os_family: std::env::consts::FAMILY.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            total_memory_bytes: total_memory_bytes(),
            data_root_free_bytes: free_bytes_near(&self.data_root),
        }
    }

    /// Looks up each catalogue dependency on PATH. `a|b` entries are
    /// satisfied by either command.
    pub fn check_dependencies(&self, tool_type: ToolType) -> DependencyStatus {
        let mut available = Vec::new();
        let mut missing = Vec::new();
        let mut recommendations = Vec::new();

        for dep in self.catalogue.profile(tool_type).dependencies {
            let found = dep
                .split('|')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .find(|c| which::which(c).is_ok());
            match found {
                Some(cmd) => available.push(cmd.to_string()),
                None => {
                    let first = dep.split('|').next().unwrap_or(&dep).trim().to_string();
                    recommendations.push(recommendation(&first));
                    missing.push(dep);
                }
            }
        }

        DependencyStatus {
            tool_type,
            satisfied: missing.is_empty(),
            available,
            missing,
            recommendations,
        }
    }

    pub fn available_tools(&self) -> Vec<ToolProfile> {
        self.catalogue.list()
    }

    pub fn recommended_ports(&self, tool_type: ToolType) -> PortRange {
        self.catalogue.recommended_ports(tool_type)
    }

    /// Rejects traversal tokens before touching the filesystem, then
    /// requires the path to exist.
    pub async fn validate_path(&self, path: &Path) -> ToolResult<()> {
        let raw = path.to_string_lossy();
        if raw.trim().is_empty() {
            return Err(ToolError::Validation("path must not be empty".to_string()));
        }
        if contains_traversal(&raw) {
            return Err(ToolError::Security(format!(
                "path contains a parent-directory traversal: {raw}"
            )));
        }
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ToolError::not_found("path", raw))
            }
            Err(e) => Err(ToolError::io(format!("stat {raw}"), e)),
        }
    }
}
