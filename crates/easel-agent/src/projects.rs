//! Project lifecycle above the pipeline: create (and queue provisioning),
//! list, inspect and delete project directories.

use std::{path::Path, sync::Arc, time::SystemTime};

use anyhow::Context;
use easel_project::{JobId, LauncherSpec, ProjectDescriptor, ProjectState, ProjectStatus, StatePatch};

use crate::best_effort;
use crate::context::AgentContext;
use crate::pipeline::{ProvisionJob, Provisioner};
use crate::port_alloc;
use crate::project_dir::{IdError, ProjectDir, normalize_project_id};
use crate::queue::{JobHandle, JobQueue};
use crate::state_store;
use crate::supervisor::Supervisor;
use crate::toolchain::Toolchain;

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error(transparent)]
    InvalidId(#[from] IdError),
    #[error("project {0} already exists")]
    AlreadyExists(String),
    #[error("project {0} not found")]
    NotFound(String),
    #[error("failed to delete {0}")]
    DeleteFailed(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Directory-safe id derived from a display name.
///
/// Non-ASCII characters are dropped, whitespace and dash runs collapse
/// into a single `-`.
pub fn slugify(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-') || c.is_ascii_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect();

    let mut out = String::with_capacity(kept.len());
    let mut pending_sep = false;
    for c in kept.chars() {
        if c == '-' || c.is_ascii_whitespace() {
            pending_sep = true;
            continue;
        }
        if pending_sep && !out.is_empty() {
            out.push('-');
        }
        pending_sep = false;
        out.push(c);
    }
    out.trim_matches(['-', '_']).to_string()
}

/// One project as shown to callers.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ProjectView {
    #[serde(flatten)]
    pub state: ProjectState,
    /// Persisted port, or the first free one for a project never started.
    pub assigned_port: Option<u16>,
}

#[derive(Debug)]
pub struct CreatedProject {
    pub id: String,
    pub job: JobHandle,
}

#[derive(Debug, Clone)]
pub struct ProjectManager {
    ctx: AgentContext,
    provisioner: Provisioner,
    supervisor: Supervisor,
    queue: JobQueue,
}

impl ProjectManager {
    /// Starts the provisioning worker; call inside a tokio runtime.
    pub fn new(ctx: AgentContext, toolchain: Arc<dyn Toolchain>) -> Self {
        Self::with_parts(
            ctx.clone(),
            Provisioner::new(ctx.clone(), toolchain),
            Supervisor::new(ctx),
        )
    }

    pub fn with_parts(ctx: AgentContext, provisioner: Provisioner, supervisor: Supervisor) -> Self {
        Self {
            ctx,
            provisioner,
            supervisor,
            queue: JobQueue::start(),
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    fn existing(&self, project_id: &str) -> Result<ProjectDir, ProjectError> {
        let project = self.ctx.project(project_id)?;
        if !project.exists() {
            return Err(ProjectError::NotFound(project_id.to_string()));
        }
        Ok(project)
    }

    /// Read-only: a project that was never started is shown the port it
    /// would get now, but nothing is persisted until `start`.
    fn view(&self, project: &ProjectDir, state: ProjectState) -> ProjectView {
        let cfg = &self.ctx.config;
        let assigned_port = port_alloc::read_assigned_port(project)
            .or_else(|| port_alloc::find_free_port(cfg.min_port, cfg.max_port));
        ProjectView {
            state,
            assigned_port,
        }
    }

    /// Create the project directory and queue its provisioning.
    pub async fn create(
        &self,
        name: &str,
        launcher_spec: Option<LauncherSpec>,
        port: Option<u16>,
    ) -> Result<CreatedProject, ProjectError> {
        let id = normalize_project_id(&slugify(name))?;
        let project = self.ctx.project(&id)?;
        if project.root().exists() {
            return Err(ProjectError::AlreadyExists(id));
        }

        match self.try_create(&project, &id, name, launcher_spec, port).await {
            Ok(created) => Ok(created),
            Err(e) => {
                best_effort::remove_dir_all(project.root()).await;
                Err(e)
            }
        }
    }

    async fn try_create(
        &self,
        project: &ProjectDir,
        id: &str,
        name: &str,
        launcher_spec: Option<LauncherSpec>,
        port: Option<u16>,
    ) -> Result<CreatedProject, ProjectError> {
        tokio::fs::create_dir_all(project.root())
            .await
            .with_context(|| format!("create {}", project.root().display()))?;
        state_store::merge(
            project,
            StatePatch::status(ProjectStatus::Initializing, "Initializing project...")
                .identity(id, name),
        )
        .await?;

        let descriptor = ProjectDescriptor {
            id: id.to_string(),
            name: name.to_string(),
            launcher_spec,
            requested_port: port,
        };
        let job = ProvisionJob::for_descriptor(&self.ctx, &descriptor)?;
        let provisioner = self.provisioner.clone();
        let handle = self.queue.enqueue(
            format!("provision {id}"),
            Box::pin(async move { provisioner.provision(job).await.map(|_| ()) }),
        )?;

        if let Err(e) = tokio::fs::write(project.setup_job_path(), handle.id.0.as_bytes()).await {
            self.queue.cancel(&handle.id);
            return Err(anyhow::Error::new(e)
                .context("write setup_task_id.txt")
                .into());
        }
        tracing::info!(project_id = %id, job_id = %handle.id, "project created");
        Ok(CreatedProject {
            id: id.to_string(),
            job: handle,
        })
    }

    /// Projects with a state record, newest first.
    pub async fn list(&self) -> Result<Vec<ProjectView>, ProjectError> {
        let dir = &self.ctx.config.projects_dir;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("read {}", dir.display()))
                    .into());
            }
        };

        let mut found: Vec<(SystemTime, ProjectDir)> = Vec::new();
        while let Some(entry) = entries.next_entry().await.context("read projects dir")? {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(project) = self.ctx.project(&id) else {
                continue;
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, project));
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));

        let mut out = Vec::with_capacity(found.len());
        for (_, project) in found {
            let state = state_store::read(&project).await;
            if state.is_empty() {
                continue;
            }
            out.push(self.view(&project, state));
        }
        Ok(out)
    }

    pub async fn get(&self, project_id: &str) -> Result<ProjectView, ProjectError> {
        let project = self.existing(project_id)?;
        let state = state_store::read(&project).await;
        Ok(self.view(&project, state))
    }

    /// Cancel provisioning, stop the instance and remove the directory.
    pub async fn delete(&self, project_id: &str) -> Result<(), ProjectError> {
        let project = self.existing(project_id)?;

        if let Ok(raw) = tokio::fs::read_to_string(project.setup_job_path()).await {
            let job = JobId(raw.trim().to_string());
            if !job.0.is_empty() && self.queue.cancel(&job) {
                tracing::info!(project_id, job_id = %job, "provisioning cancelled");
            }
        }
        if state_store::read(&project).await.state == Some(ProjectStatus::Running) {
            best_effort::log_failure("stop instance", self.supervisor.stop(project_id).await);
        }

        if let Err(e) = tokio::fs::remove_dir_all(project.root()).await {
            tracing::warn!(project_id, error = %e, "delete failed, retrying after clearing read-only bits");
            let root = project.root().to_path_buf();
            best_effort::run("clear read-only bits", async move {
                tokio::task::spawn_blocking(move || make_writable(&root))
                    .await
                    .map_err(anyhow::Error::from)?
                    .map_err(anyhow::Error::from)
            })
            .await;
            best_effort::remove_dir_all(project.root()).await;
        }

        if project.root().exists() {
            return Err(ProjectError::DeleteFailed(project.root().display().to_string()));
        }
        tracing::info!(project_id, "project deleted");
        Ok(())
    }
}

fn make_writable(path: &Path) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    let mut perms = meta.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(perms.mode() | 0o700);
    }
    #[cfg(not(unix))]
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    std::fs::set_permissions(path, perms)?;

    if meta.is_dir() {
        for entry in std::fs::read_dir(path)? {
            make_writable(&entry?.path())?;
        }
    }
    Ok(())
}
