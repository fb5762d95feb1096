//! Caller-facing operations. Each one is a fixed pipeline over the stores,
//! the orchestrator and the capability service; errors are passed through.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use toolhub_process::{Configuration, ConfigurationId, Instance, InstanceId, ToolType};

use crate::capability::{CapabilityService, DependencyStatus, SystemInfo};
use crate::catalogue::{PortRange, ToolCatalogue, ToolProfile};
use crate::error::{ToolError, ToolResult};
use crate::log_service::{LogEntry, LogLevel, LogService};
use crate::memory_store::{InMemoryConfigurationRepository, InMemoryInstanceRepository};
use crate::orchestrator::{OrchestratorTiming, ToolOrchestrator};
use crate::port_alloc;
use crate::repository::{ConfigurationRepository, InstanceRepository};
use crate::settings::AgentSettings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateConfigurationRequest {
    pub name: String,
    pub tool_type: ToolType,
    pub executable_path: PathBuf,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    pub host: String,
    /// Wider than `u16` so out-of-range input is reported, not truncated.
    pub port: u32,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub auto_start: bool,
}

impl CreateConfigurationRequest {
    /// Request pre-filled from a catalogue default.
    pub fn from_configuration(c: &Configuration) -> Self {
        Self {
            name: c.name.clone(),
            tool_type: c.tool_type,
            executable_path: c.executable_path.clone(),
            working_dir: c.working_dir.clone(),
            host: c.host.clone(),
            port: u32::from(c.port),
            arguments: c.arguments.clone(),
            environment: c.environment.clone(),
            auto_start: c.auto_start,
        }
    }
}

fn checked_port(port: u32) -> ToolResult<u16> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ToolError::Validation(format!("port {port} is outside 1..=65535")))
}

pub struct ToolService {
    configurations: Arc<dyn ConfigurationRepository>,
    instances: Arc<dyn InstanceRepository>,
    orchestrator: ToolOrchestrator,
    capabilities: CapabilityService,
    logs: Arc<LogService>,
}

impl ToolService {
    /// Wires the in-memory stores.
    pub fn new(settings: &AgentSettings, catalogue: ToolCatalogue) -> Self {
        Self::with_repositories(
            settings,
            catalogue,
            Arc::new(InMemoryConfigurationRepository::new()),
            Arc::new(InMemoryInstanceRepository::new()),
        )
    }

    pub fn with_repositories(
        settings: &AgentSettings,
        catalogue: ToolCatalogue,
        configurations: Arc<dyn ConfigurationRepository>,
        instances: Arc<dyn InstanceRepository>,
    ) -> Self {
        let catalogue = Arc::new(catalogue);
        let logs = Arc::new(LogService::new(
            settings.log_dir.clone(),
            settings.log_max_lines,
            settings.log_file_max_bytes,
        )
        .with_retained_closed(settings.log_retained_subjects));
        let orchestrator = ToolOrchestrator::new(
            instances.clone(),
            catalogue.clone(),
            logs.clone(),
            OrchestratorTiming::from(settings),
        );
        let capabilities = CapabilityService::new(catalogue, settings.data_root.clone());
        Self {
            configurations,
            instances,
            orchestrator,
            capabilities,
            logs,
        }
    }

    pub fn orchestrator(&self) -> &ToolOrchestrator {
        &self.orchestrator
    }

    async fn log_config(&self, id: &ConfigurationId, message: String) {
        if let Err(e) = self.logs.write_log(&id.0, LogLevel::Info, message).await {
            tracing::warn!(configuration_id = %id, error = %e, "failed to write configuration log");
        }
    }

    /// Validates a request and turns it into a record with the given identity.
    async fn build_configuration(
        &self,
        req: CreateConfigurationRequest,
        id: ConfigurationId,
        created_at: chrono::DateTime<Utc>,
    ) -> ToolResult<Configuration> {
        if req.name.trim().is_empty() {
            return Err(ToolError::Validation("name must not be empty".to_string()));
        }
        let port = checked_port(req.port)?;

        self.capabilities.validate_path(&req.executable_path).await?;
        if let Some(dir) = &req.working_dir {
            self.capabilities.validate_path(dir).await?;
        }

        let config = Configuration {
            id,
            name: req.name.trim().to_string(),
            tool_type: req.tool_type,
            executable_path: req.executable_path,
            working_dir: req.working_dir,
            host: req.host.trim().to_string(),
            port,
            arguments: req.arguments,
            environment: req.environment,
            auto_start: req.auto_start,
            created_at,
            updated_at: Utc::now(),
        };
        self.orchestrator.validate_config(&config)?;
        Ok(config)
    }

    pub async fn create_configuration(
        &self,
        req: CreateConfigurationRequest,
    ) -> ToolResult<Configuration> {
        let config = self
            .build_configuration(req, ConfigurationId::new(), Utc::now())
            .await?;
        self.configurations.save(&config).await?;

        tracing::info!(configuration_id = %config.id, name = %config.name, tool = %config.tool_type, "configuration created");
        self.log_config(
            &config.id,
            format!("configuration created: {} ({})", config.name, config.tool_type),
        )
        .await;
        Ok(config)
    }

    async fn live_instances_of(&self, id: &ConfigurationId) -> ToolResult<Vec<Instance>> {
        Ok(self
            .instances
            .find_running()
            .await?
            .into_iter()
            .filter(|i| &i.config.id == id)
            .collect())
    }

    /// Name and auto-start can always change. Launch fields are locked while
    /// an instance of this configuration is live.
    pub async fn update_configuration(
        &self,
        id: &ConfigurationId,
        req: CreateConfigurationRequest,
    ) -> ToolResult<Configuration> {
        let current = self.configurations.find_by_id(id).await?;
        let updated = self
            .build_configuration(req, current.id.clone(), current.created_at)
            .await?;

        if current.launch_fields_differ(&updated) {
            if let Some(live) = self.live_instances_of(id).await?.first() {
                return Err(ToolError::Conflict(format!(
                    "configuration {id} is in use by live instance {}",
                    live.id
                )));
            }
        }
        self.configurations.update(&updated).await?;

        tracing::info!(configuration_id = %id, "configuration updated");
        self.log_config(id, "configuration updated".to_string()).await;
        Ok(updated)
    }

    pub async fn delete_configuration(&self, id: &ConfigurationId) -> ToolResult<()> {
        self.configurations.find_by_id(id).await?;
        if let Some(live) = self.live_instances_of(id).await?.first() {
            return Err(ToolError::Conflict(format!(
                "configuration {id} is in use by live instance {}",
                live.id
            )));
        }
        self.configurations.delete(id).await?;
        tracing::info!(configuration_id = %id, "configuration deleted");
        Ok(())
    }

    pub async fn get_configuration(&self, id: &ConfigurationId) -> ToolResult<Configuration> {
        self.configurations.find_by_id(id).await
    }

    pub async fn list_configurations(&self) -> ToolResult<Vec<Configuration>> {
        self.configurations.find_all().await
    }

    pub async fn launch_tool(&self, id: &ConfigurationId) -> ToolResult<Instance> {
        self.launch_tool_cancellable(id, &CancellationToken::new())
            .await
    }

    pub async fn launch_tool_cancellable(
        &self,
        id: &ConfigurationId,
        cancel: &CancellationToken,
    ) -> ToolResult<Instance> {
        let config = self.configurations.find_by_id(id).await?;
        let instance = self.orchestrator.launch_cancellable(config, cancel).await?;

        tracing::info!(
            configuration_id = %id,
            instance_id = %instance.id,
            url = %instance.url(),
            "launched"
        );
        self.log_config(id, format!("launched instance {}", instance.id))
            .await;
        Ok(instance)
    }

    pub async fn stop_tool(&self, id: &InstanceId) -> ToolResult<()> {
        let instance = self.instances.find_by_id(id).await?;
        if !instance.is_live() {
            return Err(ToolError::Conflict(format!(
                "instance {id} is not running (status {})",
                instance.status
            )));
        }
        let updated = self.orchestrator.stop(id).await?;
        tracing::info!(instance_id = %id, status = %updated.status, "stop requested");
        Ok(())
    }

    pub async fn restart_tool(&self, id: &InstanceId) -> ToolResult<Instance> {
        let instance = self.orchestrator.restart(id).await?;
        tracing::info!(old_instance_id = %id, instance_id = %instance.id, "restarted");
        Ok(instance)
    }

    pub async fn get_instance(&self, id: &InstanceId) -> ToolResult<Instance> {
        self.orchestrator.get_status(id).await
    }

    pub async fn list_instances(&self) -> ToolResult<Vec<Instance>> {
        self.instances.find_all().await
    }

    pub async fn get_instance_logs(&self, id: &InstanceId, n: usize) -> ToolResult<Vec<LogEntry>> {
        self.instances.find_by_id(id).await?;
        Ok(self.orchestrator.get_logs(id, n).await)
    }

    pub fn get_system_info(&self) -> SystemInfo {
        self.capabilities.system_info()
    }

    pub fn get_recommended_ports(&self, tool_type: ToolType) -> PortRange {
        self.capabilities.recommended_ports(tool_type)
    }

    pub fn is_port_available(&self, port: u16) -> bool {
        port_alloc::is_port_available(port)
    }

    /// First free port in the tool's recommended range.
    pub fn find_available_port(&self, tool_type: ToolType) -> ToolResult<u16> {
        self.orchestrator
            .find_available_port(self.capabilities.recommended_ports(tool_type))
    }

    pub fn check_dependencies(&self, tool_type: ToolType) -> DependencyStatus {
        self.capabilities.check_dependencies(tool_type)
    }

    pub fn available_tools(&self) -> Vec<ToolProfile> {
        self.capabilities.available_tools()
    }

    pub fn default_configuration(&self, tool_type: ToolType) -> Configuration {
        self.orchestrator.default_config(tool_type)
    }

    /// Launches every configuration flagged `auto_start`, one at a time.
    pub async fn auto_start(&self) -> ToolResult<Vec<(ConfigurationId, ToolResult<Instance>)>> {
        let mut out = Vec::new();
        for config in self.configurations.find_all().await? {
            if !config.auto_start {
                continue;
            }
            let res = self.launch_tool(&config.id).await;
            if let Err(e) = &res {
                tracing::warn!(configuration_id = %config.id, error = %e, "auto-start failed");
            }
            out.push((config.id, res));
        }
        Ok(out)
    }

    /// Stops every live instance and waits for the monitors to finish.
    /// Returns false if some process outlived `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> ToolResult<bool> {
        let stopped = self.orchestrator.stop_all().await?;
        if !stopped.is_empty() {
            tracing::info!(count = stopped.len(), "stopping live instances");
        }
        Ok(self.orchestrator.wait_idle(timeout).await)
    }

    pub async fn cleanup_logs(&self, older_than_days: u32) -> ToolResult<usize> {
        self.logs.cleanup_logs(older_than_days).await
    }
}
