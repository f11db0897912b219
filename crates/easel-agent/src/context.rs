use std::{sync::Arc, time::Duration};

use anyhow::Context;

use crate::config::{AgentConfig, Credentials};
use crate::project_dir::ProjectDir;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Everything the pipeline and supervisor need, built once per process.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub config: Arc<AgentConfig>,
    pub http: reqwest::Client,
}

impl AgentContext {
    pub fn new(config: AgentConfig) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("*/*"),
        );
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;
        Ok(Self {
            config: Arc::new(config),
            http,
        })
    }

    /// Credentials are re-read on every call so edits apply without a restart.
    pub fn credentials(&self) -> Credentials {
        Credentials::load(&self.config.credentials_path)
    }

    pub fn project(&self, project_id: &str) -> Result<ProjectDir, crate::project_dir::IdError> {
        ProjectDir::for_id(&self.config.projects_dir, project_id)
    }
}
