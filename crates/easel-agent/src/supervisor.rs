use std::{
    ffi::OsString,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use easel_project::{ProjectState, ProjectStatus, StatePatch, ready_message};

use crate::context::AgentContext;
use crate::port_alloc;
use crate::process_tree;
use crate::project_dir::{IdError, ProjectDir};
use crate::state_store;

const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    InvalidId(#[from] IdError),
    #[error("project {0} not found")]
    NotFound(String),
    #[error("project is not ready (state: {0})")]
    NotReady(String),
    #[error("project is not running (state: {0})")]
    NotRunning(String),
    #[error("no free port in {min}..={max}")]
    NoFreePort { min: u16, max: u16 },
    #[error("port {0} is already in use")]
    PortInUse(u16),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn state_label(st: &ProjectState) -> String {
    st.state
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// How to launch one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
}

impl InstanceCommand {
    /// `<env python> main.py --port <port> --listen 0.0.0.0 [--cpu]` in the app dir.
    pub fn for_project(project: &ProjectDir, port: u16, cpu: bool) -> Self {
        let mut args: Vec<OsString> = ["main.py", "--port", &port.to_string(), "--listen", "0.0.0.0"]
            .into_iter()
            .map(OsString::from)
            .collect();
        if cpu {
            args.push("--cpu".into());
        }
        Self {
            program: project.env_python(),
            args,
            cwd: project.app_dir(),
        }
    }
}

pub type LaunchFn = dyn Fn(&ProjectDir, u16, bool) -> InstanceCommand + Send + Sync;

/// Whether an accelerator backend is available to the instance.
pub async fn detect_gpu() -> bool {
    if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        return true;
    }
    match tokio::process::Command::new("nvidia-smi")
        .arg("-L")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(_) => false,
    }
}

async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if port_alloc::is_port_in_use(port).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

fn spawn_detached(cmd: &InstanceCommand, log_path: &std::path::Path) -> anyhow::Result<u32> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).context("create launcher dir")?;
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("open {}", log_path.display()))?;
    let log_err = log.try_clone().context("clone console log handle")?;

    let mut command = tokio::process::Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .current_dir(&cmd.cwd)
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(log_err);

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("spawn {} (cwd {})", cmd.program.display(), cmd.cwd.display()))?;
    let pid = child.id().context("spawned instance has no pid")?;

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => tracing::info!(pid, %status, "instance exited"),
            Err(e) => tracing::warn!(pid, error = %e, "wait for instance failed"),
        }
    });
    Ok(pid)
}

/// Starts and stops project instances. Owns the `port`/`pid` fields of the
/// state record while an instance runs.
#[derive(Clone)]
pub struct Supervisor {
    ctx: AgentContext,
    launch: Arc<LaunchFn>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(ctx: AgentContext) -> Self {
        Self::with_launcher(ctx, InstanceCommand::for_project)
    }

    pub fn with_launcher<F>(ctx: AgentContext, launch: F) -> Self
    where
        F: Fn(&ProjectDir, u16, bool) -> InstanceCommand + Send + Sync + 'static,
    {
        Self {
            ctx,
            launch: Arc::new(launch),
        }
    }

    fn existing(&self, project_id: &str) -> Result<ProjectDir, SupervisorError> {
        let project = self.ctx.project(project_id)?;
        if !project.exists() {
            return Err(SupervisorError::NotFound(project_id.to_string()));
        }
        Ok(project)
    }

    pub async fn status(&self, project_id: &str) -> Result<ProjectState, SupervisorError> {
        let project = self.existing(project_id)?;
        Ok(state_store::read(&project).await)
    }

    /// Launch the instance and return its port.
    pub async fn start(&self, project_id: &str) -> Result<u16, SupervisorError> {
        let project = self.existing(project_id)?;
        let st = state_store::read(&project).await;
        if st.state != Some(ProjectStatus::Ready) {
            return Err(SupervisorError::NotReady(state_label(&st)));
        }

        let cfg = &self.ctx.config;
        let port = port_alloc::allocate(&project, cfg.min_port, cfg.max_port)?.ok_or(
            SupervisorError::NoFreePort {
                min: cfg.min_port,
                max: cfg.max_port,
            },
        )?;
        if port_alloc::is_port_in_use(port).await {
            return Err(SupervisorError::PortInUse(port));
        }

        let cpu = cfg.force_cpu || !detect_gpu().await;
        let cmd = (self.launch)(&project, port, cpu);
        let pid = spawn_detached(&cmd, &project.console_log_path())?;
        tracing::info!(project_id, port, pid, cpu, "instance spawned");

        if wait_for_port(port, cfg.ready_timeout).await {
            tracing::info!(project_id, port, "instance is accepting connections");
        } else {
            tracing::warn!(
                project_id,
                port,
                timeout_sec = cfg.ready_timeout.as_secs(),
                "instance did not open its port in time; marking running anyway"
            );
        }

        state_store::merge(
            &project,
            StatePatch::status(ProjectStatus::Running, "Running...")
                .with_port(Some(port))
                .with_pid(Some(pid)),
        )
        .await?;
        Ok(port)
    }

    /// Terminate the instance's process tree and return the project to `ready`.
    pub async fn stop(&self, project_id: &str) -> Result<(), SupervisorError> {
        let project = self.existing(project_id)?;
        let st = state_store::read(&project).await;
        if st.state != Some(ProjectStatus::Running) {
            return Err(SupervisorError::NotRunning(state_label(&st)));
        }

        match st.pid {
            Some(pid) => process_tree::terminate_tree(pid).await,
            None => tracing::warn!(project_id, "running project has no recorded pid"),
        }

        state_store::merge(
            &project,
            StatePatch::status(ProjectStatus::Ready, ready_message(st.missing_files.len()))
                .with_port(None)
                .with_pid(None),
        )
        .await?;
        tracing::info!(project_id, "instance stopped");
        Ok(())
    }
}
