//! Provisioning: turn a launcher descriptor into a `ready` project directory.
//!
//! Steps run strictly in order, each announced through the state record
//! before it starts. Per-file download failures are collected; any other
//! failure marks the project `error` and is returned to the caller.

use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use easel_project::{
    DownloadReport, LauncherSpec, PipRequirement, ProjectDescriptor, ProjectStatus, StatePatch,
    ready_message,
};
use serde_json::Value;

use crate::best_effort;
use crate::config::absolute_path;
use crate::context::AgentContext;
use crate::download::{Downloader, RetryPolicy};
use crate::port_alloc;
use crate::project_dir::{IdError, ProjectDir};
use crate::state_store;
use crate::toolchain::Toolchain;
use crate::workflow;

/// Plugins every project gets, regardless of its snapshot.
pub const BASELINE_PLUGINS: &[&str] = &[
    "https://github.com/ltdrdata/ComfyUI-Manager",
    "https://github.com/thecooltechguy/ComfyUI-ComfyWorkflows",
];

/// Snapshot entries matching these are skipped; the baseline already covers them.
const IGNORED_SNAPSHOT_PLUGINS: &[&str] = &["ComfyUI-ComfyWorkflows", "ComfyUI-Manager"];

const SEED_CHECKOUT_DIR: &str = "tmp_comfyui";
const EXTRA_REQUIREMENTS_FILE: &str = "requirements.txt";
const TYPING_EXTENSIONS_PIN: &str = "typing-extensions>=4.8.0";

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() || parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

/// One provisioning request, as carried through the job queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionJob {
    pub project_path: PathBuf,
    pub models_path: PathBuf,
    pub id: String,
    pub name: String,
    pub launcher_spec: Option<LauncherSpec>,
    pub port: Option<u16>,
    /// Wipe and recreate the project directory first.
    pub create_project_folder: bool,
}

impl ProvisionJob {
    /// Standalone job that builds the directory from scratch.
    pub fn new(project_path: PathBuf, models_path: PathBuf, id: String, name: String) -> Self {
        Self {
            project_path,
            models_path,
            id,
            name,
            launcher_spec: None,
            port: None,
            create_project_folder: true,
        }
    }

    /// Job for a project whose directory and initial state already exist.
    pub fn for_descriptor(ctx: &AgentContext, descriptor: &ProjectDescriptor) -> Result<Self, IdError> {
        let project = ctx.project(&descriptor.id)?;
        Ok(Self {
            project_path: project.root().to_path_buf(),
            models_path: ctx.config.models_dir.clone(),
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            launcher_spec: descriptor.launcher_spec.clone(),
            port: descriptor.requested_port,
            create_project_folder: false,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisionOutcome {
    pub report: DownloadReport,
    /// States written during this run, in order.
    pub transitions: Vec<ProjectStatus>,
}

struct Run<'a> {
    project: &'a ProjectDir,
    transitions: Vec<ProjectStatus>,
}

impl Run<'_> {
    async fn advance(&mut self, patch: StatePatch) -> anyhow::Result<()> {
        let next = patch.state.context("state patch without a state")?;
        if let Some(prev) = self.transitions.last().copied()
            && !prev.can_advance_to(next)
        {
            anyhow::bail!("illegal state transition {prev} -> {next}");
        }
        state_store::merge(self.project, patch).await?;
        self.transitions.push(next);
        tracing::info!(state = %next, "project state changed");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PluginKind {
    Baseline,
    Snapshot,
}

fn plugin_dir_name(url: &str) -> Option<String> {
    let last = url.trim().trim_end_matches('/').rsplit('/').next()?;
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() || name == "." || name == ".." || name.contains('\\') {
        return None;
    }
    Some(name.to_string())
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        // Follow links so a linked store copies as real content.
        let meta = fs::metadata(&src_path)
            .with_context(|| format!("stat {}", src_path.display()))?;
        if meta.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else if meta.is_file() {
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("copy {}", src_path.display()))?;
        }
    }
    Ok(())
}

fn link_or_copy(store: &Path, link: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    let linked = std::os::unix::fs::symlink(store, link);
    #[cfg(windows)]
    let linked = std::os::windows::fs::symlink_dir(store, link);
    #[cfg(not(any(unix, windows)))]
    let linked: std::io::Result<()> = Err(std::io::Error::other("symlinks unsupported"));

    match linked {
        Ok(()) => {
            tracing::info!(link = %link.display(), store = %store.display(), "linked models store");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(error = %e, "symlink failed, copying models store instead");
            copy_dir_recursive(store, link)
                .with_context(|| format!("copy {} -> {}", store.display(), link.display()))
        }
    }
}

fn points_to(link: &Path, target: &Path) -> bool {
    match fs::read_link(link) {
        Ok(dest) => {
            dest == target
                || fs::canonicalize(link)
                    .ok()
                    .zip(fs::canonicalize(target).ok())
                    .is_some_and(|(a, b)| a == b)
        }
        Err(_) => false,
    }
}

async fn remove_path(path: &Path) -> anyhow::Result<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
    };
    let res = if meta.file_type().is_symlink() {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(_) => tokio::fs::remove_dir(path).await,
        }
    } else if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    res.with_context(|| format!("remove {}", path.display()))
}

async fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

#[derive(Clone)]
pub struct Provisioner {
    ctx: AgentContext,
    toolchain: Arc<dyn Toolchain>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    pub fn new(ctx: AgentContext, toolchain: Arc<dyn Toolchain>) -> Self {
        let retry = RetryPolicy::new(ctx.config.download_max_retries);
        Self {
            ctx,
            toolchain,
            retry,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn provision(&self, job: ProvisionJob) -> anyhow::Result<ProvisionOutcome> {
        let project = ProjectDir::new(absolute_path(&job.project_path));
        let models = absolute_path(&job.models_path);
        tracing::info!(
            project_id = %job.id,
            project = %project.root().display(),
            models = %models.display(),
            "provisioning started"
        );

        if job.create_project_folder {
            if project.exists() {
                tracing::warn!(project = %project.root().display(), "project folder exists, recreating");
                tokio::fs::remove_dir_all(project.root())
                    .await
                    .with_context(|| format!("remove {}", project.root().display()))?;
            }
        } else {
            match state_store::read(&project).await.state {
                Some(ProjectStatus::Error) => {
                    anyhow::bail!("project {} is in error state; delete and recreate it", job.id)
                }
                Some(ProjectStatus::Running) => {
                    anyhow::bail!("project {} is running; stop it before provisioning", job.id)
                }
                _ => {}
            }
        }
        tokio::fs::create_dir_all(project.root())
            .await
            .with_context(|| format!("create {}", project.root().display()))?;

        let mut run = Run {
            project: &project,
            transitions: Vec::new(),
        };
        match self.run_steps(&job, &project, &models, &mut run).await {
            Ok(report) => {
                tracing::info!(
                    project_id = %job.id,
                    missing = report.missing_files.len(),
                    "provisioning finished"
                );
                Ok(ProvisionOutcome {
                    report,
                    transitions: run.transitions,
                })
            }
            Err(e) => {
                let message = format!("Error: {}", format_error_chain(&e));
                tracing::error!(project_id = %job.id, error = %message, "provisioning failed");
                best_effort::log_failure(
                    "record error state",
                    state_store::merge(&project, StatePatch::status(ProjectStatus::Error, message))
                        .await,
                );
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        job: &ProvisionJob,
        project: &ProjectDir,
        models: &Path,
        run: &mut Run<'_>,
    ) -> anyhow::Result<DownloadReport> {
        let mut spec = job.launcher_spec.clone();
        let app_dir = project.app_dir();

        run.advance(
            StatePatch::status(ProjectStatus::DownloadingApp, "Downloading ComfyUI...")
                .identity(&job.id, &job.name),
        )
        .await?;
        if app_dir.join(".git").exists() {
            tracing::info!(app = %app_dir.display(), "application already cloned");
        } else {
            self.toolchain
                .clone_repo(&self.ctx.config.app_repo_url, &app_dir, false)
                .await
                .context("clone application")?;
        }
        if let Some(spec) = spec.as_mut() {
            if let Some(rev) = spec.snapshot.app_commit.as_deref().filter(|r| !r.trim().is_empty()) {
                self.toolchain
                    .checkout(&app_dir, rev.trim())
                    .await
                    .context("checkout application revision")?;
            }
            spec.workflow_document = workflow::normalize(&spec.workflow_document, cfg!(windows))?;
        }

        self.swap_landing_page(project).await?;
        self.link_models(project, models).await?;

        run.advance(StatePatch::status(ProjectStatus::InstallingApp, "Installing ComfyUI..."))
            .await?;
        let env_dir = project.env_dir();
        if project.env_python().exists() {
            tracing::info!(env = %env_dir.display(), "environment already exists");
        } else {
            self.toolchain
                .create_env(&env_dir)
                .await
                .context("create environment")?;
        }
        self.toolchain
            .pip_install(
                &env_dir,
                vec!["-r".into(), app_dir.join("requirements.txt").into_os_string()],
            )
            .await
            .context("install application requirements")?;

        run.advance(StatePatch::status(
            ProjectStatus::InstallingPlugins,
            "Installing custom nodes...",
        ))
        .await?;
        for url in BASELINE_PLUGINS {
            self.install_plugin(project, url, None, PluginKind::Baseline)
                .await?;
        }
        if let Some(spec) = &spec {
            for (url, pin) in spec.snapshot.plugins.iter() {
                if IGNORED_SNAPSHOT_PLUGINS.iter().any(|n| url.contains(n)) {
                    continue;
                }
                if pin.disabled {
                    tracing::info!(plugin = %url, "plugin disabled, skipping");
                    continue;
                }
                self.install_plugin(project, url, pin.commit_hash.as_deref(), PluginKind::Snapshot)
                    .await?;
            }
            self.install_extra_requirements(project, &spec.pip_requirements)
                .await?;
        }

        run.advance(StatePatch::status(
            ProjectStatus::DownloadingFiles,
            "Downloading models & other files...",
        ))
        .await?;
        let report = match &spec {
            Some(spec) => {
                Downloader::new(self.ctx.http.clone(), self.retry)
                    .download_files(&app_dir, &spec.file_groups, &self.ctx.credentials())
                    .await
            }
            None => DownloadReport::default(),
        };

        if let Some(spec) = &spec {
            if spec.workflow_document.is_null() {
                tracing::warn!("descriptor has no workflow document, keeping the default graph");
            } else {
                workflow::write_default_graph(project, &spec.workflow_document).await?;
            }
            let data = serde_json::to_vec(spec).context("serialize launcher.json")?;
            write_atomic(&project.launcher_json_path(), &data).await?;
        }
        if let Some(port) = job.port {
            port_alloc::persist_port(project, port)?;
        }

        let missing: Vec<String> = report.missing_files.iter().cloned().collect();
        for f in &missing {
            tracing::warn!(file = %f, "missing file");
        }
        run.advance(
            StatePatch::status(ProjectStatus::Ready, ready_message(missing.len()))
                .with_missing_files(missing),
        )
        .await?;
        Ok(report)
    }

    async fn swap_landing_page(&self, project: &ProjectDir) -> anyhow::Result<()> {
        let web = project.app_web_dir();
        let index = web.join("index.html");
        let original = web.join("comfyui_index.html");
        if !original.exists() {
            tokio::fs::rename(&index, &original)
                .await
                .with_context(|| format!("move {}", index.display()))?;
        }
        let frame = &self.ctx.config.frame_html;
        tokio::fs::copy(frame, &index)
            .await
            .with_context(|| format!("copy frame page {}", frame.display()))?;
        Ok(())
    }

    async fn link_models(&self, project: &ProjectDir, store: &Path) -> anyhow::Result<()> {
        let link = project.app_models_dir();
        if points_to(&link, store) {
            tracing::info!(link = %link.display(), "models link already in place");
            return Ok(());
        }
        remove_path(&link).await?;
        if !store.exists() {
            self.seed_models_store(store).await?;
        }

        let (store, link) = (store.to_path_buf(), link.clone());
        tokio::task::spawn_blocking(move || link_or_copy(&store, &link))
            .await
            .context("join models link task")?
    }

    /// Populate the shared store with the application's bundled models folder.
    async fn seed_models_store(&self, store: &Path) -> anyhow::Result<()> {
        let parent = store
            .parent()
            .with_context(|| format!("models store {} has no parent", store.display()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;

        let tmp = parent.join(SEED_CHECKOUT_DIR);
        remove_path(&tmp).await?;
        tracing::info!(store = %store.display(), "seeding models store");
        self.toolchain
            .clone_repo(&self.ctx.config.app_repo_url, &tmp, false)
            .await
            .context("clone application to seed models store")?;
        tokio::fs::rename(tmp.join("models"), store)
            .await
            .with_context(|| format!("move seed models into {}", store.display()))?;
        best_effort::remove_dir_all(&tmp).await;
        Ok(())
    }

    async fn install_plugin(
        &self,
        project: &ProjectDir,
        url: &str,
        revision: Option<&str>,
        kind: PluginKind,
    ) -> anyhow::Result<()> {
        let name = plugin_dir_name(url).with_context(|| format!("unusable plugin url {url}"))?;
        let dir = project.plugins_dir().join(&name);
        let env_dir = project.env_dir();

        if dir.join(".git").exists() {
            tracing::info!(plugin = %name, "plugin already cloned");
        } else {
            self.toolchain
                .clone_repo(url, &dir, kind == PluginKind::Snapshot)
                .await
                .with_context(|| format!("clone plugin {name}"))?;
        }
        if let Some(rev) = revision.map(str::trim).filter(|r| !r.is_empty()) {
            self.toolchain
                .checkout(&dir, rev)
                .await
                .with_context(|| format!("checkout plugin {name}"))?;
        }

        let manifests: &[&str] = match kind {
            PluginKind::Baseline => &["requirements.txt"],
            PluginKind::Snapshot => &["requirements.txt", "requirements_post.txt"],
        };
        for manifest in manifests {
            let path = dir.join(manifest);
            if path.is_file() {
                self.toolchain
                    .pip_install(&env_dir, vec!["-r".into(), path.into_os_string()])
                    .await
                    .with_context(|| format!("install {name}/{manifest}"))?;
            }
        }

        if kind == PluginKind::Snapshot {
            let script = dir.join("install.py");
            if script.is_file() {
                self.toolchain
                    .run_script(&env_dir, &script, &dir)
                    .await
                    .with_context(|| format!("run {name}/install.py"))?;
            }
        }

        // This plugin ships its node file one level too deep.
        if kind == PluginKind::Snapshot && name == "ComfyUI-CLIPSeg" {
            let src = dir.join("custom_nodes").join("clipseg.py");
            tokio::fs::copy(&src, project.plugins_dir().join("clipseg.py"))
                .await
                .with_context(|| format!("copy {}", src.display()))?;
        }
        Ok(())
    }

    async fn install_extra_requirements(
        &self,
        project: &ProjectDir,
        reqs: &[PipRequirement],
    ) -> anyhow::Result<()> {
        let lines: Vec<String> = reqs
            .iter()
            .map(PipRequirement::to_requirement_line)
            .filter(|l| !l.is_empty())
            .collect();
        if lines.is_empty() {
            return Ok(());
        }

        let path = project.root().join(EXTRA_REQUIREMENTS_FILE);
        let mut body = lines.join("\n");
        body.push('\n');
        tokio::fs::write(&path, body)
            .await
            .context("write extra requirements")?;

        let env_dir = project.env_dir();
        let file_args = |flag: &str| -> Vec<OsString> {
            vec!["-r".into(), path.clone().into_os_string(), flag.into()]
        };
        let res: anyhow::Result<()> = async {
            let first: anyhow::Result<()> = async {
                self.toolchain.pip_install(&env_dir, file_args("--no-deps")).await?;
                self.toolchain
                    .pip_install(&env_dir, vec![TYPING_EXTENSIONS_PIN.into()])
                    .await
            }
            .await;
            if let Err(e) = first {
                tracing::warn!(error = %format!("{e:#}"), "extra requirements failed, retrying with --ignore-installed");
                self.toolchain
                    .pip_install(&env_dir, file_args("--ignore-installed"))
                    .await
                    .context("install extra requirements")?;
            }
            Ok(())
        }
        .await;

        best_effort::remove_file(&path).await;
        res
    }
}

/// Parse a descriptor document that may be either a launcher descriptor or
/// a bare workflow graph.
pub fn launcher_spec_from_document(doc: Value) -> anyhow::Result<LauncherSpec> {
    if LauncherSpec::is_launcher_format(&doc) {
        return serde_json::from_value(doc).context("parse launcher descriptor");
    }
    Ok(LauncherSpec {
        workflow_document: doc,
        ..LauncherSpec::default()
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::config::AgentConfig;
    use crate::download::fixture::{good_sha, serve};
    use crate::toolchain::testing::RecordingToolchain;

    const APP_URL: &str = "https://example.invalid/app.git";

    struct Harness {
        _root: tempfile::TempDir,
        ctx: AgentContext,
        toolchain: Arc<RecordingToolchain>,
    }

    impl Harness {
        fn new(toolchain: RecordingToolchain) -> Self {
            let root = tempfile::tempdir().unwrap();
            let mut cfg = AgentConfig::rooted_at(root.path());
            cfg.app_repo_url = APP_URL.to_string();
            std::fs::create_dir_all(cfg.frame_html.parent().unwrap()).unwrap();
            std::fs::write(&cfg.frame_html, b"<html>frame</html>").unwrap();
            Self {
                _root: root,
                ctx: AgentContext::new(cfg).unwrap(),
                toolchain: Arc::new(toolchain),
            }
        }

        fn provisioner(&self) -> Provisioner {
            let tc: Arc<dyn Toolchain> = self.toolchain.clone();
            Provisioner::new(self.ctx.clone(), tc).with_retry_policy(RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
            })
        }

        fn job(&self, spec: Option<LauncherSpec>) -> ProvisionJob {
            ProvisionJob::for_descriptor(
                &self.ctx,
                &ProjectDescriptor {
                    id: "demo".to_string(),
                    name: "Demo".to_string(),
                    launcher_spec: spec,
                    requested_port: Some(4055),
                },
            )
            .unwrap()
        }

        fn project(&self) -> ProjectDir {
            self.ctx.project("demo").unwrap()
        }

        fn count(&self, call: &str) -> usize {
            self.toolchain.calls().iter().filter(|c| *c == call).count()
        }
    }

    fn spec_with_file(url: &str) -> LauncherSpec {
        launcher_spec_from_document(json!({
            "format": "comfyui_launcher",
            "workflow_json": {
                "nodes": [{
                    "id": 3,
                    "type": "CheckpointLoaderSimple",
                    "widgets_values": ["sd\\model.safetensors"]
                }],
                "links": []
            },
            "files": [[{
                "download_url": url,
                "dest_relative_path": "models/a.bin",
                "sha256_checksum": good_sha()
            }]],
            "snapshot_json": {
                "comfyui": "abc123",
                "git_custom_nodes": {
                    "https://github.com/x/ComfyUI-Foo.git": {"hash": "def456", "disabled": false},
                    "https://github.com/x/ComfyUI-Off": {"hash": null, "disabled": true},
                    "https://github.com/ltdrdata/ComfyUI-Manager": {"hash": "zzz", "disabled": false}
                }
            },
            "pip_requirements": ["numpy", {"_key": "pillow", "_version": "10.0.0"}]
        }))
        .unwrap()
    }

    #[test]
    fn error_chain_is_deduplicated() {
        let err = anyhow::anyhow!("disk full").context("write state").context("write state");
        assert_eq!(format_error_chain(&err), "write state: disk full");
    }

    #[test]
    fn plugin_dir_names() {
        assert_eq!(plugin_dir_name("https://github.com/a/Foo.git").as_deref(), Some("Foo"));
        assert_eq!(plugin_dir_name("https://github.com/a/Bar/").as_deref(), Some("Bar"));
        assert_eq!(plugin_dir_name("https://github.com/a/.."), None);
        assert_eq!(plugin_dir_name(""), None);
    }

    #[test]
    fn bare_workflow_documents_become_specs() {
        let spec = launcher_spec_from_document(json!({"nodes": []})).unwrap();
        assert_eq!(spec.workflow_document, json!({"nodes": []}));
        assert!(spec.file_groups.is_empty());
    }

    #[tokio::test]
    async fn provisions_to_ready_with_all_files() {
        let fx = serve().await;
        let h = Harness::new(RecordingToolchain::default());
        let outcome = h
            .provisioner()
            .provision(h.job(Some(spec_with_file(&fx.url("/models/a.bin")))))
            .await
            .unwrap();

        assert!(outcome.report.is_complete());
        assert_eq!(
            outcome.transitions,
            [
                ProjectStatus::DownloadingApp,
                ProjectStatus::InstallingApp,
                ProjectStatus::InstallingPlugins,
                ProjectStatus::DownloadingFiles,
                ProjectStatus::Ready,
            ]
        );
        for pair in outcome.transitions.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]));
        }

        let project = h.project();
        let st = state_store::read(&project).await;
        assert_eq!(st.state, Some(ProjectStatus::Ready));
        assert_eq!(st.status_message.as_deref(), Some("Ready"));
        assert_eq!((st.id.as_str(), st.name.as_str()), ("demo", "Demo"));
        assert!(st.missing_files.is_empty());

        let calls = h.toolchain.calls();
        assert!(calls.contains(&"checkout abc123".to_string()));
        assert!(calls.contains(&"clone https://github.com/x/ComfyUI-Foo.git --recursive".to_string()));
        assert!(calls.contains(&"checkout def456".to_string()));
        assert!(!calls.iter().any(|c| c.contains("ComfyUI-Off")));
        assert_eq!(h.count("clone https://github.com/ltdrdata/ComfyUI-Manager"), 1);
        assert!(!calls.contains(&"checkout zzz".to_string()));
        assert!(calls.iter().any(|c| c.ends_with("--no-deps")));
        assert!(calls.contains(&format!("pip install {TYPING_EXTENSIONS_PIN}")));
        assert!(!project.root().join(EXTRA_REQUIREMENTS_FILE).exists());

        let web = project.app_web_dir();
        assert_eq!(std::fs::read(web.join("index.html")).unwrap(), b"<html>frame</html>");
        assert!(web.join("comfyui_index.html").exists());
        assert!(web.join("scripts/defaultGraph.js").exists());
        assert!(project.app_models_dir().join("a.bin").exists());
        assert!(h.ctx.config.models_dir.join("a.bin").exists());
        #[cfg(unix)]
        assert!(
            std::fs::symlink_metadata(project.app_models_dir())
                .unwrap()
                .file_type()
                .is_symlink()
        );

        let saved: LauncherSpec =
            serde_json::from_slice(&std::fs::read(project.launcher_json_path()).unwrap()).unwrap();
        #[cfg(unix)]
        assert_eq!(
            saved.workflow_document["nodes"][0]["widgets_values"][0],
            "sd/model.safetensors"
        );
        assert_eq!(saved.file_groups.len(), 1);
        assert_eq!(port_alloc::read_assigned_port(&project), Some(4055));
    }

    #[tokio::test]
    async fn unreachable_file_still_reaches_ready() {
        let h = Harness::new(RecordingToolchain::default());
        let outcome = h
            .provisioner()
            .provision(h.job(Some(spec_with_file("http://127.0.0.1:1/a.bin"))))
            .await
            .unwrap();

        assert_eq!(
            outcome.report.missing_files.iter().collect::<Vec<_>>(),
            ["models/a.bin"]
        );
        let st = state_store::read(&h.project()).await;
        assert_eq!(st.state, Some(ProjectStatus::Ready));
        assert_eq!(st.status_message.as_deref(), Some("Ready (1 file missing)"));
        assert_eq!(st.missing_files, ["models/a.bin"]);
    }

    #[tokio::test]
    async fn fatal_step_records_error_state() {
        let h = Harness::new(RecordingToolchain::failing_on("create_env"));
        let err = h.provisioner().provision(h.job(None)).await.unwrap_err();
        assert!(format_error_chain(&err).contains("simulated failure"));

        let st = state_store::read(&h.project()).await;
        assert_eq!(st.state, Some(ProjectStatus::Error));
        let msg = st.status_message.unwrap();
        assert!(msg.starts_with("Error: create environment"), "{msg}");
        assert!(!h.toolchain.calls().iter().any(|c| c.starts_with("clone https://github.com")));
    }

    #[tokio::test]
    async fn refuses_error_and_running_projects() {
        let h = Harness::new(RecordingToolchain::default());
        let project = h.project();
        for status in [ProjectStatus::Error, ProjectStatus::Running] {
            state_store::merge(&project, StatePatch::status(status, "before"))
                .await
                .unwrap();
            assert!(h.provisioner().provision(h.job(None)).await.is_err());
            let st = state_store::read(&project).await;
            assert_eq!(st.state, Some(status));
            assert_eq!(st.status_message.as_deref(), Some("before"));
        }
        assert!(h.toolchain.calls().is_empty());
    }

    #[tokio::test]
    async fn rerun_reuses_existing_work() {
        let h = Harness::new(RecordingToolchain::default());
        let p = h.provisioner();
        p.provision(h.job(None)).await.unwrap();
        p.provision(h.job(None)).await.unwrap();

        // One clone for the project, one to seed the shared models store.
        assert_eq!(h.count(&format!("clone {APP_URL}")), 2);
        assert_eq!(h.count("create_env"), 1);
        assert_eq!(h.count("clone https://github.com/ltdrdata/ComfyUI-Manager"), 1);
        assert!(!h.ctx.config.models_dir.parent().unwrap().join(SEED_CHECKOUT_DIR).exists());
        assert_eq!(
            state_store::read(&h.project()).await.state,
            Some(ProjectStatus::Ready)
        );
    }

    #[tokio::test]
    async fn create_project_folder_starts_from_scratch() {
        let h = Harness::new(RecordingToolchain::default());
        let project = h.project();
        std::fs::create_dir_all(project.root()).unwrap();
        std::fs::write(project.root().join("stale.txt"), b"x").unwrap();

        let mut job = h.job(None);
        job.create_project_folder = true;
        h.provisioner().provision(job).await.unwrap();
        assert!(!project.root().join("stale.txt").exists());
        assert!(!project.launcher_json_path().exists());
    }

    #[test]
    fn standalone_jobs_wipe_the_folder() {
        let job = ProvisionJob::new("/p".into(), "/m".into(), "a".into(), "A".into());
        assert!(job.create_project_folder);
        assert!(job.launcher_spec.is_none() && job.port.is_none());

        let h = Harness::new(RecordingToolchain::default());
        assert!(!h.job(None).create_project_folder);
    }

    #[tokio::test]
    async fn snapshot_plugins_install_in_document_order() {
        let h = Harness::new(RecordingToolchain::default());
        let spec = launcher_spec_from_document(json!({
            "format": "comfyui_launcher",
            "workflow_json": {"nodes": []},
            "snapshot_json": {
                "comfyui": null,
                "git_custom_nodes": {
                    "https://github.com/x/Zeta": {"hash": null, "disabled": false},
                    "https://github.com/x/Alpha": {"hash": null, "disabled": false},
                    "https://github.com/x/Mid": {"hash": null, "disabled": false}
                }
            }
        }))
        .unwrap();
        h.provisioner().provision(h.job(Some(spec))).await.unwrap();

        let clones: Vec<String> = h
            .toolchain
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("clone https://github.com/x/"))
            .collect();
        assert_eq!(
            clones,
            [
                "clone https://github.com/x/Zeta --recursive",
                "clone https://github.com/x/Alpha --recursive",
                "clone https://github.com/x/Mid --recursive",
            ]
        );
    }

    #[tokio::test]
    async fn clipseg_fixup_only_for_snapshot_plugins() {
        let h = Harness::new(RecordingToolchain::default());
        let p = h.provisioner();
        let project = h.project();
        let url = "https://github.com/x/ComfyUI-CLIPSeg";
        let flat = project.plugins_dir().join("clipseg.py");

        p.install_plugin(&project, url, None, PluginKind::Baseline)
            .await
            .unwrap();
        assert!(!flat.exists());

        let nested = project.plugins_dir().join("ComfyUI-CLIPSeg/custom_nodes");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("clipseg.py"), b"node").unwrap();
        p.install_plugin(&project, url, None, PluginKind::Snapshot)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&flat).unwrap(), b"node");
    }

    #[test]
    fn copy_fallback_follows_links() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("store");
        std::fs::create_dir_all(src.join("checkpoints")).unwrap();
        std::fs::write(src.join("checkpoints/m.ckpt"), b"w").unwrap();
        copy_dir_recursive(&src, &dir.path().join("copy")).unwrap();
        assert_eq!(std::fs::read(dir.path().join("copy/checkpoints/m.ckpt")).unwrap(), b"w");
    }
}
