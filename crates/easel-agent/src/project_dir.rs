use std::path::{Path, PathBuf};

pub const APP_DIR: &str = "comfyui";
pub const ENV_DIR: &str = "venv";
const LAUNCHER_DIR: &str = ".launcher";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("project id must be non-empty")]
    Empty,
    #[error("invalid project id: {0}")]
    Invalid(String),
}

/// Keep project ids safe for filesystem paths.
pub fn normalize_project_id(id: &str) -> Result<String, IdError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(IdError::Empty);
    }
    if id == "." || id == ".." || id.contains("..") {
        return Err(IdError::Invalid(id.to_string()));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(IdError::Invalid(id.to_string()));
    }
    Ok(id.to_string())
}

/// On-disk layout of one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectDir {
    root: PathBuf,
}

impl ProjectDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn for_id(projects_dir: &Path, project_id: &str) -> Result<Self, IdError> {
        let id = normalize_project_id(project_id)?;
        Ok(Self::new(projects_dir.join(id)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn launcher_dir(&self) -> PathBuf {
        self.root.join(LAUNCHER_DIR)
    }

    pub fn state_path(&self) -> PathBuf {
        self.launcher_dir().join("state.json")
    }

    pub fn console_log_path(&self) -> PathBuf {
        self.launcher_dir().join("console.log")
    }

    pub fn port_path(&self) -> PathBuf {
        self.root.join("port.txt")
    }

    pub fn launcher_json_path(&self) -> PathBuf {
        self.root.join("launcher.json")
    }

    pub fn setup_job_path(&self) -> PathBuf {
        self.root.join("setup_task_id.txt")
    }

    pub fn app_dir(&self) -> PathBuf {
        self.root.join(APP_DIR)
    }

    pub fn app_web_dir(&self) -> PathBuf {
        self.app_dir().join("web")
    }

    pub fn app_models_dir(&self) -> PathBuf {
        self.app_dir().join("models")
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.app_dir().join("custom_nodes")
    }

    pub fn env_dir(&self) -> PathBuf {
        self.root.join(ENV_DIR)
    }

    /// Interpreter inside the project's isolated environment.
    pub fn env_python(&self) -> PathBuf {
        env_python(&self.env_dir())
    }
}

pub fn env_python(env_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        env_dir.join("Scripts").join("python.exe")
    } else {
        env_dir.join("bin").join("python")
    }
}
