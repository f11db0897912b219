use std::{io::ErrorKind, net::TcpListener, time::Duration};

use anyhow::Context;

use crate::project_dir::ProjectDir;

const CONNECT_CHECK_TIMEOUT: Duration = Duration::from_millis(500);

/// Server-side check: can we bind the port right now? The listener is released immediately.
fn can_bind(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => {
            drop(l);
            true
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => false,
        Err(e) => {
            tracing::debug!(port, error = %e, "port bind check failed");
            false
        }
    }
}

/// First bindable port in `[min, max]`, scanning upward.
pub fn find_free_port(min: u16, max: u16) -> Option<u16> {
    (min..=max).find(|p| *p != 0 && can_bind(*p))
}

pub fn read_assigned_port(project: &ProjectDir) -> Option<u16> {
    let raw = std::fs::read_to_string(project.port_path()).ok()?;
    raw.trim().parse::<u16>().ok().filter(|p| *p != 0)
}

pub fn persist_port(project: &ProjectDir, port: u16) -> anyhow::Result<()> {
    std::fs::create_dir_all(project.root())
        .with_context(|| format!("create {}", project.root().display()))?;
    let path = project.port_path();
    let tmp = path.with_extension("txt.tmp");
    std::fs::write(&tmp, port.to_string()).context("write port.txt.tmp")?;
    std::fs::rename(&tmp, &path).context("persist port.txt")?;
    Ok(())
}

/// Stable port for a project. An existing assignment is returned as-is;
/// otherwise the first free port in range is persisted and returned.
/// `Ok(None)` means the whole range is occupied.
pub fn allocate(project: &ProjectDir, min: u16, max: u16) -> anyhow::Result<Option<u16>> {
    if let Some(port) = read_assigned_port(project) {
        return Ok(Some(port));
    }
    let Some(port) = find_free_port(min, max) else {
        tracing::warn!(min, max, "no free port in range");
        return Ok(None);
    };
    persist_port(project, port)?;
    tracing::info!(port, project = %project.root().display(), "assigned port");
    Ok(Some(port))
}

/// Client-side check: does anything accept connections on the port?
///
/// This is a different question from [`find_free_port`]'s bind check; a
/// port can be unbindable yet refuse connections (or vice versa briefly).
pub async fn is_port_in_use(port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            CONNECT_CHECK_TIMEOUT,
            tokio::net::TcpStream::connect(("127.0.0.1", port)),
        )
        .await,
        Ok(Ok(_))
    )
}
