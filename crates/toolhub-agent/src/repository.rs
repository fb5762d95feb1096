//! Store contracts injected into the orchestrator and the use-case layer.

use async_trait::async_trait;
use toolhub_process::{Configuration, ConfigurationId, Instance, InstanceId, ToolType};

use crate::error::ToolResult;

/// Read-modify-write step applied to one instance under its record lock.
///
/// Returning an error leaves the record untouched.
pub type InstanceMutation = Box<dyn FnOnce(&mut Instance) -> ToolResult<()> + Send>;

#[async_trait]
pub trait ConfigurationRepository: Send + Sync {
    /// Creation path only.
    ///
    /// # Errors
    ///
    /// `Conflict` when the id already exists.
    async fn save(&self, config: &Configuration) -> ToolResult<()>;

    async fn find_by_id(&self, id: &ConfigurationId) -> ToolResult<Configuration>;

    async fn find_by_type(&self, tool_type: ToolType) -> ToolResult<Vec<Configuration>>;

    async fn find_all(&self) -> ToolResult<Vec<Configuration>>;

    async fn update(&self, config: &Configuration) -> ToolResult<()>;

    async fn delete(&self, id: &ConfigurationId) -> ToolResult<()>;
}

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn save(&self, instance: &Instance) -> ToolResult<()>;

    async fn find_by_id(&self, id: &InstanceId) -> ToolResult<Instance>;

    /// Instances in `Starting` or `Running`.
    async fn find_running(&self) -> ToolResult<Vec<Instance>>;

    /// Matches on the tool type of the embedded configuration snapshot.
    async fn find_by_type(&self, tool_type: ToolType) -> ToolResult<Vec<Instance>>;

    async fn find_all(&self) -> ToolResult<Vec<Instance>>;

    async fn update(&self, instance: &Instance) -> ToolResult<()>;

    async fn delete(&self, id: &InstanceId) -> ToolResult<()>;

    /// Applies `mutation` while holding the record's write lock and returns
    /// the updated snapshot. Status writers go through here so that a stop
    /// request and the monitor's exit write never interleave.
    async fn modify(&self, id: &InstanceId, mutation: InstanceMutation) -> ToolResult<Instance>;
}
