use std::{process::Stdio, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{process::Command, sync::Mutex};
use tokio_util::sync::CancellationToken;
use toolhub_process::{Configuration, Instance, InstanceId, InstanceStatus, ToolType};

use crate::capability::contains_traversal;
use crate::catalogue::{PortRange, ToolCatalogue, ToolProfile};
use crate::error::{ToolError, ToolResult};
use crate::log_service::{LogEntry, LogLevel, LogService};
use crate::monitor::{self, MonitorContext, ProcessHandle, ProcessTable};
use crate::port_alloc;
use crate::repository::InstanceRepository;
use crate::settings::AgentSettings;

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorTiming {
    /// Grace between SIGTERM and SIGKILL.
    pub stop_timeout: Duration,
    pub restart_settle: Duration,
    /// How long a process has to stay up before it counts as running.
    pub startup_grace: Duration,
}

impl From<&AgentSettings> for OrchestratorTiming {
    fn from(s: &AgentSettings) -> Self {
        Self {
            stop_timeout: s.stop_timeout,
            restart_settle: s.restart_settle,
            startup_grace: s.startup_grace,
        }
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // Take the child down with the agent if the agent dies.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

fn validate_environment(config: &Configuration) -> ToolResult<()> {
    for key in config.environment.keys() {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(ToolError::Validation(format!(
                "invalid environment variable name: {key:?}"
            )));
        }
    }
    for (key, value) in &config.environment {
        if value.contains('\0') {
            return Err(ToolError::Validation(format!(
                "environment variable {key} contains a NUL byte"
            )));
        }
    }
    Ok(())
}

/// Launches tool processes and drives their status machine.
#[derive(Clone)]
pub struct ToolOrchestrator {
    instances: Arc<dyn InstanceRepository>,
    catalogue: Arc<ToolCatalogue>,
    logs: Arc<LogService>,
    processes: ProcessTable,
    launch_gate: Arc<Mutex<()>>,
    timing: OrchestratorTiming,
}

impl ToolOrchestrator {
    pub fn new(
        instances: Arc<dyn InstanceRepository>,
        catalogue: Arc<ToolCatalogue>,
        logs: Arc<LogService>,
        timing: OrchestratorTiming,
    ) -> Self {
        Self {
            instances,
            catalogue,
            logs,
            processes: ProcessTable::default(),
            launch_gate: Arc::new(Mutex::new(())),
            timing,
        }
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    /// Field checks only, no filesystem access.
    pub fn validate_config(&self, config: &Configuration) -> ToolResult<()> {
        let exe = config.executable_path.to_string_lossy();
        if exe.trim().is_empty() {
            return Err(ToolError::Validation(
                "executable path must not be empty".to_string(),
            ));
        }
        if contains_traversal(&exe) {
            return Err(ToolError::Security(format!(
                "executable path contains a parent-directory traversal: {exe}"
            )));
        }
        if let Some(dir) = &config.working_dir {
            let dir = dir.to_string_lossy();
            if contains_traversal(&dir) {
                return Err(ToolError::Security(format!(
                    "working directory contains a parent-directory traversal: {dir}"
                )));
            }
        }
        if config.port == 0 {
            return Err(ToolError::Validation(
                "port must be in 1..=65535".to_string(),
            ));
        }
        if config.host.trim().is_empty() {
            return Err(ToolError::Validation("host must not be empty".to_string()));
        }
        validate_environment(config)
    }

    async fn check_paths(&self, config: &Configuration) -> ToolResult<()> {
        let exe = &config.executable_path;
        match tokio::fs::metadata(exe).await {
            Ok(m) if m.is_dir() => {
                return Err(ToolError::Validation(format!(
                    "executable path is a directory: {}",
                    exe.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ToolError::not_found("executable", exe.display()));
            }
            Err(e) => return Err(ToolError::io(format!("stat {}", exe.display()), e)),
        }

        if let Some(dir) = &config.working_dir {
            match tokio::fs::metadata(dir).await {
                Ok(m) if m.is_dir() => {}
                Ok(_) => {
                    return Err(ToolError::Validation(format!(
                        "working directory is not a directory: {}",
                        dir.display()
                    )));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ToolError::not_found("working directory", dir.display()));
                }
                Err(e) => return Err(ToolError::io(format!("stat {}", dir.display()), e)),
            }
        }
        Ok(())
    }

    async fn ensure_port_unclaimed(&self, config: &Configuration) -> ToolResult<()> {
        let live = self.instances.find_running().await?;
        if let Some(holder) = live.iter().find(|i| i.config.port == config.port) {
            return Err(ToolError::Conflict(format!(
                "port {} is already used by instance {} ({})",
                config.port, holder.id, holder.config.name
            )));
        }
        port_alloc::probe_port(&config.host, config.port).await
    }

    fn command(&self, config: &Configuration) -> Command {
        let args = if config.arguments.is_empty() {
            self.catalogue
                .render_args(config.tool_type, &config.host, config.port)
        } else {
            config.arguments.clone()
        };

        let mut cmd = Command::new(&config.executable_path);
        cmd.args(&args)
            .envs(&config.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session so the whole process tree can be signalled.
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        cmd
    }

    pub async fn launch(&self, config: Configuration) -> ToolResult<Instance> {
        self.launch_cancellable(config, &CancellationToken::new())
            .await
    }

    /// Launches `config`. `cancel` is honoured up to the spawn; once the
    /// process exists it is only taken down by [`Self::stop`].
    pub async fn launch_cancellable(
        &self,
        config: Configuration,
        cancel: &CancellationToken,
    ) -> ToolResult<Instance> {
        self.validate_config(&config)?;
        self.check_paths(&config).await?;
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        let gate = tokio::select! {
            g = self.launch_gate.clone().lock_owned() => g,
            _ = cancel.cancelled() => return Err(ToolError::Cancelled),
        };

        self.ensure_port_unclaimed(&config).await?;
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        let mut child = self.command(&config).spawn().map_err(|e| {
            ToolError::spawn(
                format!("failed to spawn {}", config.executable_path.display()),
                e,
            )
        })?;

        let id = InstanceId::new();
        let pid = child.id();
        let instance = Instance::starting(
            id.clone(),
            config,
            pid,
            self.logs.log_file_path(&id.0),
            Utc::now(),
        );
        tracing::info!(
            instance_id = %id,
            pid = ?pid,
            tool = %instance.config.tool_type,
            port = instance.config.port,
            "spawned tool process"
        );

        // Detached so that dropping this future can't strand the child.
        let this = self.clone();
        let finish = tokio::spawn(async move {
            let _gate = gate;

            // Registered before the record becomes visible, so a Stop that sees
            // the record always reaches the supervisor.
            let (handle, control) = ProcessHandle::new(pid);
            this.processes.insert(id.clone(), handle).await;

            if let Err(e) = this.instances.save(&instance).await {
                tracing::error!(instance_id = %instance.id, error = %e, "failed to persist instance, killing process");
                this.processes.remove(&id).await;
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(e);
            }

            let mut forwarders = Vec::new();
            if let Some(out) = child.stdout.take() {
                forwarders.push(monitor::forward_output(
                    this.logs.clone(),
                    id.clone(),
                    out,
                    "stdout",
                    LogLevel::Info,
                ));
            }
            if let Some(err) = child.stderr.take() {
                forwarders.push(monitor::forward_output(
                    this.logs.clone(),
                    id.clone(),
                    err,
                    "stderr",
                    LogLevel::Warn,
                ));
            }

            let _ = this
                .logs
                .write_log(
                    &id.0,
                    LogLevel::Info,
                    format!(
                        "launched {} (pid {})",
                        instance.config.executable_path.display(),
                        pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
                    ),
                )
                .await;

            let ctx = MonitorContext {
                instances: this.instances.clone(),
                processes: this.processes.clone(),
                logs: this.logs.clone(),
                stop_timeout: this.timing.stop_timeout,
                startup_grace: this.timing.startup_grace,
            };
            tokio::spawn(monitor::supervise(ctx, id, child, control, forwarders));
            Ok(instance)
        });

        match finish.await {
            Ok(res) => res,
            Err(e) => Err(ToolError::ProcessFailure {
                message: format!("launch task failed: {e}"),
                source: None,
            }),
        }
    }

    /// Requests termination and marks the instance `Stopping`. The terminal
    /// status is written by the monitor once the process is gone.
    pub async fn stop(&self, id: &InstanceId) -> ToolResult<Instance> {
        let at = Utc::now();
        let updated = self
            .instances
            .modify(
                id,
                Box::new(move |inst| {
                    if !inst.is_live() {
                        return Err(ToolError::Conflict(format!(
                            "instance {} is not running (status {})",
                            inst.id, inst.status
                        )));
                    }
                    inst.transition(InstanceStatus::Stopping, at)?;
                    Ok(())
                }),
            )
            .await?;

        match self.processes.get(id).await {
            Some(handle) => {
                // Queued even if the monitor has not started polling yet.
                if handle.terminate() {
                    tracing::info!(instance_id = %id, pid = ?handle.pid, "stop requested");
                    let _ = self
                        .logs
                        .write_log(&id.0, LogLevel::Info, "stop requested")
                        .await;
                } else {
                    tracing::warn!(instance_id = %id, "monitor already gone, exit is being recorded");
                }
                Ok(updated)
            }
            None => {
                // Nothing supervises this record; settle it here.
                tracing::warn!(instance_id = %id, "no live process handle, marking stopped");
                self.instances
                    .modify(
                        id,
                        Box::new(move |inst| {
                            if !inst.status.is_terminal() {
                                inst.transition(InstanceStatus::Stopped, at)?;
                            }
                            Ok(())
                        }),
                    )
                    .await
            }
        }
    }

    /// Waits until the monitor of `id` has released its handle.
    async fn wait_exit(&self, id: &InstanceId, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.processes.contains(id).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Stop, settle, launch again from the stopped instance's snapshot. Not
    /// atomic: a failing launch leaves the tool stopped.
    pub async fn restart(&self, id: &InstanceId) -> ToolResult<Instance> {
        let old = self.stop(id).await?;
        if !self
            .wait_exit(id, self.timing.stop_timeout + Duration::from_secs(1))
            .await
        {
            tracing::warn!(instance_id = %id, "process still alive after stop timeout");
        }
        tokio::time::sleep(self.timing.restart_settle).await;

        let mut config = old.config;
        config.updated_at = Utc::now();
        self.launch(config).await
    }

    pub async fn get_status(&self, id: &InstanceId) -> ToolResult<Instance> {
        self.instances.find_by_id(id).await
    }

    pub fn find_available_port(&self, range: PortRange) -> ToolResult<u16> {
        port_alloc::find_available_port(range)
    }

    pub fn is_port_available(&self, port: u16) -> bool {
        port_alloc::is_port_available(port)
    }

    pub fn default_config(&self, tool_type: ToolType) -> Configuration {
        self.catalogue.default_configuration(tool_type)
    }

    pub fn available_tools(&self) -> Vec<ToolProfile> {
        self.catalogue.list()
    }

    pub async fn get_logs(&self, id: &InstanceId, n: usize) -> Vec<LogEntry> {
        self.logs.read_logs(&id.0, n).await
    }

    /// Sends a stop to every live instance. Returns the ids that were asked
    /// to stop.
    pub async fn stop_all(&self) -> ToolResult<Vec<InstanceId>> {
        let mut stopped = Vec::new();
        for inst in self.instances.find_running().await? {
            match self.stop(&inst.id).await {
                Ok(_) => stopped.push(inst.id),
                // Exited on its own in the meantime.
                Err(ToolError::Conflict(_)) => {}
                Err(e) => {
                    tracing::warn!(instance_id = %inst.id, error = %e, "failed to stop instance");
                }
            }
        }
        Ok(stopped)
    }

    /// Waits until no monitor task is left. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.processes.is_empty().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{collections::BTreeMap, net::TcpListener, path::PathBuf};

    use async_trait::async_trait;

    use super::*;
    use crate::memory_store::InMemoryInstanceRepository;
    use crate::repository::InstanceMutation;

    /// Stores the record, then stalls before reporting success.
    struct SlowSaveRepository {
        inner: InMemoryInstanceRepository,
        delay: Duration,
    }

    #[async_trait]
    impl InstanceRepository for SlowSaveRepository {
        async fn save(&self, instance: &Instance) -> ToolResult<()> {
            self.inner.save(instance).await?;
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        async fn find_by_id(&self, id: &InstanceId) -> ToolResult<Instance> {
            self.inner.find_by_id(id).await
        }

        async fn find_running(&self) -> ToolResult<Vec<Instance>> {
            self.inner.find_running().await
        }

        async fn find_by_type(&self, tool_type: ToolType) -> ToolResult<Vec<Instance>> {
            self.inner.find_by_type(tool_type).await
        }

        async fn find_all(&self) -> ToolResult<Vec<Instance>> {
            self.inner.find_all().await
        }

        async fn update(&self, instance: &Instance) -> ToolResult<()> {
            self.inner.update(instance).await
        }

        async fn delete(&self, id: &InstanceId) -> ToolResult<()> {
            self.inner.delete(id).await
        }

        async fn modify(&self, id: &InstanceId, mutation: InstanceMutation) -> ToolResult<Instance> {
            self.inner.modify(id, mutation).await
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        repo: Arc<InMemoryInstanceRepository>,
        orch: ToolOrchestrator,
    }

    fn fixture(startup_grace: Duration) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let repo = Arc::new(InMemoryInstanceRepository::new());
        let logs = Arc::new(LogService::new(tmp.path().join("logs"), 1000, 0));
        let orch = ToolOrchestrator::new(
            repo.clone(),
            Arc::new(ToolCatalogue::builtin()),
            logs,
            OrchestratorTiming {
                stop_timeout: Duration::from_secs(2),
                restart_settle: Duration::from_millis(50),
                startup_grace,
            },
        );
        Fixture {
            _tmp: tmp,
            repo,
            orch,
        }
    }

    fn free_port() -> u16 {
        TcpListener::bind(("127.0.0.1", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn config(exe: &str, args: &[&str], port: u16) -> Configuration {
        let now = Utc::now();
        Configuration {
            id: Default::default(),
            name: "test-tool".to_string(),
            tool_type: ToolType::LocalAi,
            executable_path: PathBuf::from(exe),
            working_dir: None,
            host: "127.0.0.1".to_string(),
            port,
            arguments: args.iter().map(|s| s.to_string()).collect(),
            environment: BTreeMap::new(),
            auto_start: false,
            created_at: now,
            updated_at: now,
        }
    }

    async fn wait_terminal(orch: &ToolOrchestrator, id: &InstanceId) -> Instance {
        for _ in 0..100 {
            let inst = orch.get_status(id).await.unwrap();
            if inst.status.is_terminal() {
                return inst;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("instance {id} never reached a terminal state");
    }

    async fn wait_status(orch: &ToolOrchestrator, id: &InstanceId, want: InstanceStatus) {
        for _ in 0..100 {
            if orch.get_status(id).await.unwrap().status == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("instance {id} never reached {want}");
    }

    #[tokio::test]
    async fn clean_exit_ends_stopped() {
        let f = fixture(Duration::from_secs(1));
        let inst = f
            .orch
            .launch(config("/bin/true", &[], free_port()))
            .await
            .unwrap();
        assert_eq!(inst.status, InstanceStatus::Starting);
        assert!(inst.pid.is_some());

        let done = wait_terminal(&f.orch, &inst.id).await;
        assert_eq!(done.status, InstanceStatus::Stopped);
        assert!(done.stopped_at.is_some());
        assert!(done.last_error.is_empty());
        assert_eq!(done.exit_code, Some(0));
        assert!(f.orch.wait_idle(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn failing_exit_records_error() {
        let f = fixture(Duration::from_secs(1));
        let inst = f
            .orch
            .launch(config("/bin/false", &[], free_port()))
            .await
            .unwrap();

        let done = wait_terminal(&f.orch, &inst.id).await;
        assert_eq!(done.status, InstanceStatus::Error);
        assert!(!done.last_error.is_empty());
        assert!(done.stopped_at.is_some());
    }

    #[tokio::test]
    async fn output_is_captured_into_instance_log() {
        let f = fixture(Duration::from_secs(1));
        let inst = f
            .orch
            .launch(config("/bin/sh", &["-c", "echo hello; echo oops >&2"], free_port()))
            .await
            .unwrap();
        wait_terminal(&f.orch, &inst.id).await;

        let messages: Vec<String> = f
            .orch
            .get_logs(&inst.id, 100)
            .await
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert!(messages.iter().any(|m| m == "[stdout] hello"), "{messages:?}");
        assert!(messages.iter().any(|m| m == "[stderr] oops"), "{messages:?}");
    }

    #[tokio::test]
    async fn missing_executable_creates_no_instance() {
        let f = fixture(Duration::from_secs(1));
        let err = f
            .orch
            .launch(config("/nonexistent/toolhub-tool", &[], free_port()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound { what: "executable", .. }));
        assert!(f.repo.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_fields_fail_validation() {
        let f = fixture(Duration::from_secs(1));

        let err = f.orch.launch(config("", &[], 8000)).await.unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));

        let err = f.orch.launch(config("/bin/true", &[], 0)).await.unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));

        let mut c = config("/bin/true", &[], 8000);
        c.host = " ".to_string();
        assert!(matches!(f.orch.launch(c).await.unwrap_err(), ToolError::Validation(_)));

        let mut c = config("/bin/true", &[], 8000);
        c.environment.insert("A=B".to_string(), "x".to_string());
        assert!(matches!(f.orch.launch(c).await.unwrap_err(), ToolError::Validation(_)));

        let err = f.orch.launch(config("/bin", &[], 8000)).await.unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));

        let mut c = config("/bin/true", &[], 8000);
        c.working_dir = Some(PathBuf::from("/nonexistent/toolhub-wd"));
        assert!(matches!(
            f.orch.launch(c).await.unwrap_err(),
            ToolError::NotFound { what: "working directory", .. }
        ));

        assert!(f.repo.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn occupied_port_is_a_conflict() {
        let f = fixture(Duration::from_secs(1));
        let l = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = l.local_addr().unwrap().port();

        let err = f
            .orch
            .launch(config("/bin/true", &[], port))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Conflict(_)));
        assert!(f.repo.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn live_instance_holds_its_port() {
        let f = fixture(Duration::from_secs(1));
        let port = free_port();
        let first = f
            .orch
            .launch(config("/bin/sleep", &["30"], port))
            .await
            .unwrap();

        let err = f
            .orch
            .launch(config("/bin/sleep", &["30"], port))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Conflict(_)));
        assert_eq!(f.repo.find_all().await.unwrap().len(), 1);

        f.orch.stop(&first.id).await.unwrap();
        wait_terminal(&f.orch, &first.id).await;
    }

    #[tokio::test]
    async fn stop_terminates_and_rejects_second_stop() {
        let f = fixture(Duration::from_millis(50));
        let inst = f
            .orch
            .launch(config("/bin/sleep", &["30"], free_port()))
            .await
            .unwrap();
        wait_status(&f.orch, &inst.id, InstanceStatus::Running).await;

        let stopping = f.orch.stop(&inst.id).await.unwrap();
        assert_eq!(stopping.status, InstanceStatus::Stopping);

        let done = wait_terminal(&f.orch, &inst.id).await;
        assert_eq!(done.status, InstanceStatus::Stopped);
        assert!(done.last_error.is_empty());

        let err = f.orch.stop(&inst.id).await.unwrap_err();
        assert!(matches!(err, ToolError::Conflict(_)));
        assert!(f.orch.wait_idle(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn stop_on_errored_instance_is_a_conflict() {
        let f = fixture(Duration::from_secs(1));
        let inst = f
            .orch
            .launch(config("/bin/false", &[], free_port()))
            .await
            .unwrap();
        wait_terminal(&f.orch, &inst.id).await;

        let err = f.orch.stop(&inst.id).await.unwrap_err();
        assert!(matches!(err, ToolError::Conflict(_)));
    }

    #[tokio::test]
    async fn stop_unknown_instance_is_not_found() {
        let f = fixture(Duration::from_secs(1));
        let err = f.orch.stop(&InstanceId::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
    }

    #[tokio::test]
    async fn sigterm_is_escalated_after_timeout() {
        let f = fixture(Duration::from_millis(50));
        // Ignores SIGTERM, so only SIGKILL ends it.
        let inst = f
            .orch
            .launch(config(
                "/bin/sh",
                &["-c", "trap '' TERM; while true; do sleep 1; done"],
                free_port(),
            ))
            .await
            .unwrap();
        wait_status(&f.orch, &inst.id, InstanceStatus::Running).await;

        f.orch.stop(&inst.id).await.unwrap();
        let done = wait_terminal(&f.orch, &inst.id).await;
        assert_eq!(done.status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn cancelled_launch_spawns_nothing() {
        let f = fixture(Duration::from_secs(1));
        let token = CancellationToken::new();
        token.cancel();

        let err = f
            .orch
            .launch_cancellable(config("/bin/sleep", &["30"], free_port()), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
        assert!(f.repo.find_all().await.unwrap().is_empty());
        assert!(f.orch.processes().is_empty().await);
    }

    #[tokio::test]
    async fn restart_launches_a_fresh_instance() {
        let f = fixture(Duration::from_millis(50));
        let first = f
            .orch
            .launch(config("/bin/sleep", &["30"], free_port()))
            .await
            .unwrap();

        let second = f.orch.restart(&first.id).await.unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.config.port, first.config.port);
        assert_eq!(
            f.orch.get_status(&first.id).await.unwrap().status,
            InstanceStatus::Stopped
        );

        f.orch.stop_all().await.unwrap();
        assert!(f.orch.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(
            f.orch.get_status(&second.id).await.unwrap().status,
            InstanceStatus::Stopped
        );
    }

    #[tokio::test]
    async fn catalogue_defaults_fill_missing_arguments() {
        let f = fixture(Duration::from_secs(1));
        let c = f.orch.default_config(ToolType::Ollama);
        assert_eq!(c.arguments, vec!["serve"]);
        assert_eq!(f.orch.available_tools().len(), ToolType::ALL.len());
    }

    #[tokio::test]
    async fn stop_during_slow_persist_reaches_the_process() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = Arc::new(SlowSaveRepository {
            inner: InMemoryInstanceRepository::new(),
            delay: Duration::from_millis(300),
        });
        let orch = ToolOrchestrator::new(
            repo.clone(),
            Arc::new(ToolCatalogue::builtin()),
            Arc::new(LogService::new(tmp.path().join("logs"), 1000, 0)),
            OrchestratorTiming {
                stop_timeout: Duration::from_secs(2),
                restart_settle: Duration::from_millis(50),
                startup_grace: Duration::from_millis(50),
            },
        );
        let port = free_port();

        let launcher = orch.clone();
        let launch =
            tokio::spawn(async move { launcher.launch(config("/bin/sleep", &["30"], port)).await });

        // The record is visible while the save is still stalled.
        let mut visible = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some(inst) = repo.find_running().await.unwrap().into_iter().next() {
                visible = Some(inst);
                break;
            }
        }
        let inst = visible.expect("instance never became visible");
        let pid = inst.pid.unwrap();

        let stopping = orch.stop(&inst.id).await.unwrap();
        assert_eq!(stopping.status, InstanceStatus::Stopping);

        launch.await.unwrap().unwrap();
        let done = wait_terminal(&orch, &inst.id).await;
        assert_eq!(done.status, InstanceStatus::Stopped);
        assert!(orch.wait_idle(Duration::from_secs(5)).await);
        assert_ne!(unsafe { libc::kill(pid as i32, 0) }, 0, "process {pid} outlived stop");

        // The port is free again for a new launch.
        let next = orch.launch(config("/bin/sleep", &["30"], port)).await.unwrap();
        orch.stop(&next.id).await.unwrap();
        wait_terminal(&orch, &next.id).await;
    }

    #[tokio::test]
    async fn concurrent_launches_on_one_port_admit_one() {
        let f = fixture(Duration::from_secs(1));
        let port = free_port();

        let (a, b) = tokio::join!(
            f.orch.launch(config("/bin/sleep", &["30"], port)),
            f.orch.launch(config("/bin/sleep", &["30"], port)),
        );
        let (ok, err) = match (a, b) {
            (Ok(inst), Err(e)) | (Err(e), Ok(inst)) => (inst, e),
            (a, b) => panic!("expected exactly one launch to succeed, got {a:?} and {b:?}"),
        };
        assert!(matches!(err, ToolError::Conflict(_)));
        assert_eq!(f.repo.find_all().await.unwrap().len(), 1);
        assert_eq!(f.orch.processes().len().await, 1);

        f.orch.stop_all().await.unwrap();
        assert!(f.orch.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(
            f.orch.get_status(&ok.id).await.unwrap().status,
            InstanceStatus::Stopped
        );
    }
}
