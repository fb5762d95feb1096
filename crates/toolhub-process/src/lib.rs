use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr};

use chrono::{DateTime, Utc};

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ConfigurationId(pub String);

impl ConfigurationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ConfigurationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConfigurationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one launch. Never reused: every spawn gets a fresh id.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum ToolType {
    #[serde(rename = "comfyui")]
    ComfyUi,
    #[serde(rename = "automatic1111")]
    Automatic1111,
    #[serde(rename = "ollama")]
    Ollama,
    #[serde(rename = "lmstudio")]
    LmStudio,
    #[serde(rename = "text-gen-webui")]
    TextGenWebUi,
    #[serde(rename = "stable-diffusion")]
    StableDiffusion,
    #[serde(rename = "localai")]
    LocalAi,
}

impl ToolType {
    pub const ALL: [ToolType; 7] = [
        ToolType::ComfyUi,
        ToolType::Automatic1111,
        ToolType::Ollama,
        ToolType::LmStudio,
        ToolType::TextGenWebUi,
        ToolType::StableDiffusion,
        ToolType::LocalAi,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolType::ComfyUi => "comfyui",
            ToolType::Automatic1111 => "automatic1111",
            ToolType::Ollama => "ollama",
            ToolType::LmStudio => "lmstudio",
            ToolType::TextGenWebUi => "text-gen-webui",
            ToolType::StableDiffusion => "stable-diffusion",
            ToolType::LocalAi => "localai",
        }
    }
}

impl fmt::Display for ToolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tool type: {0}")]
pub struct ParseToolTypeError(pub String);

impl FromStr for ToolType {
    type Err = ParseToolTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ToolType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| ParseToolTypeError(s.to_string()))
    }
}

/// Lifecycle of one instance.
///
/// The order is monotonic: `Starting < Running < Stopping < {Stopped, Error}`.
/// `Stopped` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl InstanceStatus {
    fn rank(self) -> u8 {
        match self {
            InstanceStatus::Starting => 0,
            InstanceStatus::Running => 1,
            InstanceStatus::Stopping => 2,
            InstanceStatus::Stopped | InstanceStatus::Error => 3,
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, InstanceStatus::Starting | InstanceStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Stopped | InstanceStatus::Error)
    }

    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid status transition for instance {instance_id}: {from} -> {to}")]
pub struct TransitionError {
    pub instance_id: InstanceId,
    pub from: InstanceStatus,
    pub to: InstanceStatus,
}

fn web_url(host: &str, port: u16) -> String {
    if host.is_empty() {
        return String::new();
    }
    let scheme = if port == 443 { "https" } else { "http" };
    format!("{scheme}://{host}:{port}")
}

/// Named, reusable launch recipe for one tool.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Configuration {
    pub id: ConfigurationId,
    pub name: String,
    pub tool_type: ToolType,
    pub executable_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub auto_start: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Configuration {
    pub fn url(&self) -> String {
        web_url(&self.host, self.port)
    }

    /// True when `other` would launch a different process than `self`.
    ///
    /// Name, auto-start and timestamps are not launch fields.
    pub fn launch_fields_differ(&self, other: &Configuration) -> bool {
        self.tool_type != other.tool_type
            || self.executable_path != other.executable_path
            || self.working_dir != other.working_dir
            || self.host != other.host
            || self.port != other.port
            || self.arguments != other.arguments
            || self.environment != other.environment
    }
}

/// One concrete execution of a [`Configuration`].
///
/// The configuration is embedded as a snapshot taken at launch time, so later
/// edits to the stored configuration never leak into a running instance.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub config: Configuration,
    pub status: InstanceStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub log_file_path: PathBuf,
}

impl Instance {
    pub fn starting(
        id: InstanceId,
        config: Configuration,
        pid: Option<u32>,
        log_file_path: PathBuf,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            config,
            status: InstanceStatus::Starting,
            pid,
            started_at: Some(at),
            stopped_at: None,
            last_error: String::new(),
            exit_code: None,
            log_file_path,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    pub fn is_stopped(&self) -> bool {
        self.status == InstanceStatus::Stopped
    }

    pub fn has_error(&self) -> bool {
        self.status == InstanceStatus::Error
    }

    pub fn url(&self) -> String {
        self.config.url()
    }

    pub fn transition(
        &mut self,
        next: InstanceStatus,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                instance_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() && self.stopped_at.is_none() {
            self.stopped_at = Some(at);
        }
        Ok(())
    }

    /// Terminal transition into `Error`, recording the cause.
    pub fn fail(
        &mut self,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(InstanceStatus::Error, at)?;
        self.last_error = message.into();
        Ok(())
    }
}
