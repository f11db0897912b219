//! External build tooling used by provisioning: git and the project's
//! isolated Python environment.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::Context;
use async_trait::async_trait;

use crate::best_effort;
use crate::command::CommandSpec;
use crate::config::AgentConfig;
use crate::project_dir::env_python;

#[async_trait]
pub trait Toolchain: Send + Sync {
    async fn clone_repo(&self, url: &str, dest: &Path, recursive: bool) -> anyhow::Result<()>;

    async fn checkout(&self, repo_dir: &Path, revision: &str) -> anyhow::Result<()>;

    /// Create an isolated environment with the base ML runtime installed.
    /// A failed creation leaves nothing behind.
    async fn create_env(&self, env_dir: &Path) -> anyhow::Result<()>;

    /// `pip install <args>` inside the environment.
    async fn pip_install(&self, env_dir: &Path, args: Vec<OsString>) -> anyhow::Result<()>;

    /// Run a Python script with the environment's interpreter.
    async fn run_script(&self, env_dir: &Path, script: &Path, cwd: &Path) -> anyhow::Result<()>;
}

/// Real toolchain: `git` from `PATH`, environments created by the configured interpreter.
#[derive(Debug, Clone)]
pub struct SystemToolchain {
    git: PathBuf,
    python: String,
    torch_index_url: Option<String>,
}

impl SystemToolchain {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            git: PathBuf::from("git"),
            python: config.python.clone(),
            torch_index_url: config.torch_index_url.clone(),
        }
    }

    fn git(&self) -> CommandSpec {
        CommandSpec::new(&self.git).env("GIT_TERMINAL_PROMPT", "0")
    }

    fn pip(env_dir: &Path) -> CommandSpec {
        CommandSpec::new(env_python(env_dir)).args(["-m", "pip"])
    }

    async fn build_env(&self, env_dir: &Path) -> anyhow::Result<()> {
        CommandSpec::new(&self.python)
            .args(["-m", "venv"])
            .arg(env_dir)
            .run()
            .await
            .context("create virtual environment")?;

        best_effort::log_failure(
            "upgrade pip",
            Self::pip(env_dir)
                .args(["install", "--upgrade", "pip"])
                .run()
                .await,
        );

        if let Some(index) = &self.torch_index_url {
            Self::pip(env_dir)
                .args([
                    "install",
                    "--no-cache-dir",
                    "torch",
                    "torchvision",
                    "torchaudio",
                    "--index-url",
                ])
                .arg(index)
                .run()
                .await
                .context("install torch")?;
        }
        Ok(())
    }
}

#[async_trait]
impl Toolchain for SystemToolchain {
    async fn clone_repo(&self, url: &str, dest: &Path, recursive: bool) -> anyhow::Result<()> {
        let mut cmd = self.git().arg("clone");
        if recursive {
            cmd = cmd.arg("--recursive");
        }
        cmd.arg(url)
            .arg(dest)
            .run()
            .await
            .with_context(|| format!("git clone {url}"))?;
        Ok(())
    }

    async fn checkout(&self, repo_dir: &Path, revision: &str) -> anyhow::Result<()> {
        self.git()
            .args(["checkout", revision])
            .current_dir(repo_dir)
            .run()
            .await
            .with_context(|| format!("git checkout {revision}"))?;
        Ok(())
    }

    async fn create_env(&self, env_dir: &Path) -> anyhow::Result<()> {
        tracing::info!(env = %env_dir.display(), python = %self.python, "creating environment");
        let res = self.build_env(env_dir).await;
        if res.is_err() {
            best_effort::remove_dir_all(env_dir).await;
        }
        res
    }

    async fn pip_install(&self, env_dir: &Path, args: Vec<OsString>) -> anyhow::Result<()> {
        Self::pip(env_dir)
            .arg("install")
            .args(&args)
            .run()
            .await
            .context("pip install")?;
        Ok(())
    }

    async fn run_script(&self, env_dir: &Path, script: &Path, cwd: &Path) -> anyhow::Result<()> {
        CommandSpec::new(env_python(env_dir))
            .arg(script)
            .current_dir(cwd)
            .run()
            .await
            .with_context(|| format!("run {}", script.display()))?;
        Ok(())
    }
}
