pub mod capability;
pub mod catalogue;
pub mod error;
pub mod log_service;
pub mod memory_store;
pub mod monitor;
pub mod orchestrator;
pub mod port_alloc;
pub mod repository;
pub mod settings;
pub mod usecases;

pub use error::{ToolError, ToolResult};
pub use orchestrator::ToolOrchestrator;
pub use settings::AgentSettings;
pub use usecases::{CreateConfigurationRequest, ToolService};
