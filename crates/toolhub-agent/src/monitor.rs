//! Per-instance supervision.
//!
//! Each launched process is owned by exactly one `supervise` task. Everyone
//! else reaches the process through the [`ProcessHandle`] registered in the
//! [`ProcessTable`], which only carries the pid and a control channel.

use std::{collections::HashMap, process::ExitStatus, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Child,
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use toolhub_process::{InstanceId, InstanceStatus};

use crate::log_service::{LogLevel, LogService};
use crate::repository::InstanceRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Terminate,
}

#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
    control: mpsc::UnboundedSender<ControlRequest>,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>) -> (Self, mpsc::UnboundedReceiver<ControlRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { pid, control: tx }, rx)
    }

    /// Asks the monitor to terminate the process. Returns false when the
    /// monitor is already gone.
    pub fn terminate(&self) -> bool {
        self.control.send(ControlRequest::Terminate).is_ok()
    }
}

/// Live process handles keyed by instance id.
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    inner: Arc<Mutex<HashMap<InstanceId, ProcessHandle>>>,
}

impl ProcessTable {
    pub async fn insert(&self, id: InstanceId, handle: ProcessHandle) {
        self.inner.lock().await.insert(id, handle);
    }

    pub async fn get(&self, id: &InstanceId) -> Option<ProcessHandle> {
        self.inner.lock().await.get(id).cloned()
    }

    pub(crate) async fn remove(&self, id: &InstanceId) -> Option<ProcessHandle> {
        self.inner.lock().await.remove(id)
    }

    pub async fn contains(&self, id: &InstanceId) -> bool {
        self.inner.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[derive(Clone)]
pub(crate) struct MonitorContext {
    pub instances: Arc<dyn InstanceRepository>,
    pub processes: ProcessTable,
    pub logs: Arc<LogService>,
    pub stop_timeout: Duration,
    pub startup_grace: Duration,
}

/// Copies `reader` into the instance log line by line.
pub(crate) fn forward_output<R>(
    logs: Arc<LogService>,
    id: InstanceId,
    reader: R,
    stream: &'static str,
    level: LogLevel,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Err(e) = logs
                .write_log(&id.0, level, format!("[{stream}] {line}"))
                .await
            {
                tracing::debug!(instance_id = %id, error = %e, "failed to record process output");
            }
        }
    })
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    match child.id() {
        // Children run in their own session, so the pgid equals the pid.
        Some(pid) => unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        },
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn send_kill(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn send_kill(child: &mut Child) {
    let _ = child.start_kill();
}

/// Message stored in `last_error` for an unrequested exit, `None` on success.
fn exit_failure(status: &ExitStatus) -> Option<String> {
    if status.success() {
        return None;
    }
    Some(match status.code() {
        Some(code) => format!("exited with code {code}"),
        None => "terminated by signal".to_string(),
    })
}

async fn mark_running(ctx: &MonitorContext, id: &InstanceId) {
    let at = Utc::now();
    let res = ctx
        .instances
        .modify(
            id,
            Box::new(move |inst| {
                if inst.status == InstanceStatus::Starting {
                    inst.transition(InstanceStatus::Running, at)?;
                }
                Ok(())
            }),
        )
        .await;
    match res {
        Ok(inst) if inst.status == InstanceStatus::Running => {
            tracing::info!(instance_id = %id, "instance running");
            let _ = ctx.logs.write_log(&id.0, LogLevel::Info, "running").await;
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(instance_id = %id, error = %e, "failed to mark instance running"),
    }
}

/// Owns `child` until it exits, then writes the terminal status exactly once
/// and releases the process handle.
pub(crate) async fn supervise(
    ctx: MonitorContext,
    id: InstanceId,
    mut child: Child,
    mut control: mpsc::UnboundedReceiver<ControlRequest>,
    forwarders: Vec<JoinHandle<()>>,
) {
    let grace = tokio::time::sleep(ctx.startup_grace);
    tokio::pin!(grace);
    let kill_deadline = tokio::time::sleep(ctx.stop_timeout);
    tokio::pin!(kill_deadline);

    let mut grace_done = false;
    let mut control_open = true;
    let mut terminating = false;
    let mut killed = false;

    let res = loop {
        tokio::select! {
            res = child.wait() => break res,
            _ = &mut grace, if !grace_done => {
                grace_done = true;
                mark_running(&ctx, &id).await;
            }
            req = control.recv(), if control_open => match req {
                Some(ControlRequest::Terminate) if !terminating => {
                    terminating = true;
                    tracing::info!(instance_id = %id, pid = ?child.id(), "sending SIGTERM");
                    send_terminate(&mut child);
                    kill_deadline
                        .as_mut()
                        .reset(tokio::time::Instant::now() + ctx.stop_timeout);
                }
                Some(ControlRequest::Terminate) => {}
                None => control_open = false,
            },
            _ = &mut kill_deadline, if terminating && !killed => {
                killed = true;
                tracing::warn!(instance_id = %id, timeout_ms = ctx.stop_timeout.as_millis() as u64, "stop timed out, sending SIGKILL");
                let _ = ctx
                    .logs
                    .write_log(&id.0, LogLevel::Warn, "stop timed out, killing process")
                    .await;
                send_kill(&mut child);
            }
        }
    };

    // Grandchildren may keep the pipes open, so don't wait on them forever.
    for f in forwarders {
        let _ = tokio::time::timeout(Duration::from_secs(1), f).await;
    }

    let at = Utc::now();
    let outcome: Result<ExitStatus, String> = res.map_err(|e| e.to_string());
    let write = outcome.clone();
    let updated = ctx
        .instances
        .modify(
            &id,
            Box::new(move |inst| {
                if inst.status.is_terminal() {
                    return Ok(());
                }
                let stopping = inst.status == InstanceStatus::Stopping;
                match write {
                    Ok(status) => {
                        inst.exit_code = status.code();
                        match exit_failure(&status) {
                            Some(msg) if !stopping => inst.fail(msg, at)?,
                            _ => inst.transition(InstanceStatus::Stopped, at)?,
                        }
                    }
                    Err(e) => inst.fail(format!("wait failed: {e}"), at)?,
                }
                Ok(())
            }),
        )
        .await;

    match &updated {
        Ok(inst) if inst.has_error() => {
            tracing::warn!(instance_id = %id, exit_code = ?inst.exit_code, error = %inst.last_error, "instance failed");
            let _ = ctx
                .logs
                .write_log(&id.0, LogLevel::Error, format!("exited: {}", inst.last_error))
                .await;
        }
        Ok(inst) => {
            tracing::info!(instance_id = %id, exit_code = ?inst.exit_code, "instance stopped");
            let msg = match &outcome {
                Ok(status) => format!("stopped ({status})"),
                Err(_) => "stopped".to_string(),
            };
            let _ = ctx.logs.write_log(&id.0, LogLevel::Info, msg).await;
        }
        Err(e) => {
            tracing::error!(instance_id = %id, error = %e, "failed to record instance exit");
        }
    }

    ctx.processes.remove(&id).await;
    ctx.logs.close(&id.0).await;
}
