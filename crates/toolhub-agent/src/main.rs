use std::time::Duration;

use anyhow::Context;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use toolhub_agent::{AgentSettings, ToolService, catalogue::ToolCatalogue, settings::load_seed};

fn init_tracing(settings: &AgentSettings) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(&settings.log_dir)
        .with_context(|| format!("create log dir {}", settings.log_dir.display()))?;

    let file_appender =
        RollingFileAppender::new(Rotation::DAILY, &settings.log_dir, "toolhub-agent.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = AgentSettings::from_env();
    let _guard = init_tracing(&settings)?;

    let catalogue = match &settings.catalogue_path {
        Some(path) => ToolCatalogue::load(path)
            .with_context(|| format!("load tool catalogue {}", path.display()))?,
        None => ToolCatalogue::builtin(),
    };
    let service = ToolService::new(&settings, catalogue);

    let info = service.get_system_info();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_root = %settings.data_root.display(),
        log_dir = %settings.log_dir.display(),
        os = %info.os,
        arch = %info.arch,
        cpu_cores = info.cpu_cores,
        total_memory_bytes = info.total_memory_bytes,
        data_root_free_bytes = info.data_root_free_bytes,
        "toolhub-agent starting"
    );

    if let Some(path) = &settings.seed_path {
        for req in load_seed(path)? {
            let name = req.name.clone();
            match service.create_configuration(req).await {
                Ok(c) => {
                    tracing::info!(configuration_id = %c.id, name = %c.name, "seeded configuration")
                }
                Err(e) => {
                    tracing::warn!(name = %name, error = %e.encode(), "failed to seed configuration")
                }
            }
        }
    }

    for (id, res) in service.auto_start().await? {
        match res {
            Ok(inst) => tracing::info!(
                configuration_id = %id,
                instance_id = %inst.id,
                url = %inst.url(),
                "auto-started"
            ),
            Err(e) => {
                tracing::error!(configuration_id = %id, error = %e.encode(), "auto-start failed")
            }
        }
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");

    // Monitors escalate to SIGKILL at stop_timeout; allow them to report.
    let grace = settings.stop_timeout + Duration::from_secs(2);
    if !service.shutdown(grace).await? {
        tracing::warn!("some tool processes were still running at shutdown");
    }
    let removed = service.cleanup_logs(settings.log_retention_days).await?;
    tracing::info!(removed, "toolhub-agent stopped");
    Ok(())
}
