use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};

use chrono::Utc;
use toolhub_process::{Configuration, ConfigurationId, ToolType};

use crate::error::{ToolError, ToolResult};

pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> ToolResult<Self> {
        if start == 0 {
            return Err(ToolError::Validation(
                "port range must start at 1 or above".to_string(),
            ));
        }
        if start > end {
            return Err(ToolError::Validation(format!(
                "invalid port range {start}-{end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolProfile {
    pub tool_type: ToolType,
    pub display_name: String,
    pub default_port: u16,
    pub port_range: PortRange,
    /// Arguments used when a configuration supplies none. `{host}` and
    /// `{port}` are substituted at launch.
    pub default_args: Vec<String>,
    /// Commands expected on PATH. `a|b` means either one satisfies it.
    pub dependencies: Vec<String>,
}

fn strings(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

fn profile(
    tool_type: ToolType,
    display_name: &str,
    default_port: u16,
    (start, end): (u16, u16),
    default_args: &[&str],
    dependencies: &[&str],
) -> ToolProfile {
    ToolProfile {
        tool_type,
        display_name: display_name.to_string(),
        default_port,
        port_range: PortRange { start, end },
        default_args: strings(default_args),
        dependencies: strings(dependencies),
    }
}

fn builtin_profile(tool_type: ToolType) -> ToolProfile {
    const PYTHON_GIT: &[&str] = &["python3|python", "git"];

    match tool_type {
        ToolType::ComfyUi => profile(
            tool_type,
            "ComfyUI",
            8188,
            (8188, 8198),
            &["--listen", "{host}", "--port", "{port}"],
            PYTHON_GIT,
        ),
        ToolType::Automatic1111 => profile(
            tool_type,
            "Automatic1111",
            7860,
            (7860, 7870),
            &["--listen", "--port", "{port}"],
            PYTHON_GIT,
        ),
        ToolType::Ollama => profile(tool_type, "Ollama", 11434, (11434, 11444), &["serve"], &[]),
        ToolType::LmStudio => profile(tool_type, "LM Studio", 1234, (1234, 1244), &[], &[]),
        ToolType::TextGenWebUi => profile(
            tool_type,
            "Text Generation WebUI",
            7860,
            (7860, 7870),
            &["--listen", "--listen-port", "{port}"],
            PYTHON_GIT,
        ),
        ToolType::StableDiffusion => profile(
            tool_type,
            "Stable Diffusion",
            8080,
            (8080, 8090),
            &[],
            &["python3|python"],
        ),
        ToolType::LocalAi => profile(tool_type, "LocalAI", 8080, (8080, 8090), &[], &[]),
    }
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct ProfileOverride {
    display_name: Option<String>,
    default_port: Option<u16>,
    port_range: Option<PortRange>,
    default_args: Option<Vec<String>>,
    dependencies: Option<Vec<String>>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct CatalogueFile {
    #[serde(default)]
    tools: HashMap<String, ProfileOverride>,
}

/// Static table of supported tool kinds with their launch defaults.
#[derive(Debug, Clone)]
pub struct ToolCatalogue {
    profiles: BTreeMap<ToolType, ToolProfile>,
}

impl Default for ToolCatalogue {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ToolCatalogue {
    pub fn builtin() -> Self {
        let profiles = ToolType::ALL
            .into_iter()
            .map(|t| (t, builtin_profile(t)))
            .collect();
        Self { profiles }
    }

    /// Built-in table extended by a TOML override file.
    pub fn load(path: &Path) -> ToolResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ToolError::io(format!("read catalogue {}", path.display()), e))?;
        let mut catalogue = Self::builtin();
        catalogue.apply_toml(&raw)?;
        Ok(catalogue)
    }

    pub fn apply_toml(&mut self, raw: &str) -> ToolResult<()> {
        let file: CatalogueFile = toml::from_str(raw)
            .map_err(|e| ToolError::Validation(format!("invalid catalogue file: {e}")))?;

        for (key, o) in file.tools {
            let tool_type: ToolType = key
                .parse()
                .map_err(|e| ToolError::Validation(format!("invalid catalogue file: {e}")))?;
            let p = self
                .profiles
                .entry(tool_type)
                .or_insert_with(|| builtin_profile(tool_type));

            if let Some(v) = o.display_name {
                p.display_name = v;
            }
            if let Some(v) = o.port_range {
                p.port_range = PortRange::new(v.start, v.end)?;
            }
            if let Some(v) = o.default_port {
                if v == 0 {
                    return Err(ToolError::Validation(format!(
                        "default_port for {tool_type} must be non-zero"
                    )));
                }
                p.default_port = v;
            }
            if let Some(v) = o.default_args {
                p.default_args = v;
            }
            if let Some(v) = o.dependencies {
                p.dependencies = v;
            }
        }
        Ok(())
    }

    pub fn profile(&self, tool_type: ToolType) -> ToolProfile {
        self.profiles
            .get(&tool_type)
            .cloned()
            .unwrap_or_else(|| builtin_profile(tool_type))
    }

    pub fn list(&self) -> Vec<ToolProfile> {
        self.profiles.values().cloned().collect()
    }

    pub fn recommended_ports(&self, tool_type: ToolType) -> PortRange {
        self.profile(tool_type).port_range
    }

    pub fn render_args(&self, tool_type: ToolType, host: &str, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.profile(tool_type)
            .default_args
            .iter()
            .map(|a| a.replace("{host}", host).replace("{port}", &port))
            .collect()
    }

    /// Fresh configuration pre-filled with the tool's defaults. The executable
    /// path is left empty for the caller to fill in.
    pub fn default_configuration(&self, tool_type: ToolType) -> Configuration {
        let p = self.profile(tool_type);
        let now = Utc::now();
        Configuration {
            id: ConfigurationId::new(),
            name: format!("{} Instance", p.display_name),
            tool_type,
            executable_path: Default::default(),
            working_dir: None,
            host: DEFAULT_HOST.to_string(),
            port: p.default_port,
            arguments: self.render_args(tool_type, DEFAULT_HOST, p.default_port),
            environment: BTreeMap::new(),
            auto_start: false,
            created_at: now,
            updated_at: now,
        }
    }
}
