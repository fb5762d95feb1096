use std::{io::ErrorKind, net::TcpListener};

use crate::catalogue::PortRange;
use crate::error::{ToolError, ToolResult};

fn bind_and_release(host: &str, port: u16) -> std::io::Result<()> {
    let l = TcpListener::bind((host, port))?;
    drop(l);
    Ok(())
}

/// Best-effort check on all interfaces. The port is released right away, so
/// another process may grab it before a tool binds it.
pub fn is_port_available(port: u16) -> bool {
    port != 0 && bind_and_release("0.0.0.0", port).is_ok()
}

/// Probe the exact address a tool is going to listen on. Host names are
/// resolved without blocking the runtime.
pub async fn probe_port(host: &str, port: u16) -> ToolResult<()> {
    match tokio::net::TcpListener::bind((host, port)).await {
        Ok(l) => {
            drop(l);
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => Err(ToolError::Conflict(format!(
            "port {port} is already in use on {host}"
        ))),
        Err(e) => Err(ToolError::Conflict(format!(
            "port {port} is not available on {host}: {e}"
        ))),
    }
}

/// First port in `range` that can be bound and released. Scans in order.
pub fn find_available_port(range: PortRange) -> ToolResult<u16> {
    let range = PortRange::new(range.start, range.end)?;
    (range.start..=range.end)
        .find(|p| is_port_available(*p))
        .ok_or_else(|| {
            ToolError::Conflict(format!(
                "no available port in range {}-{}",
                range.start, range.end
            ))
        })
}
