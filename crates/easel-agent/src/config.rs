use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use reqwest::Url;

pub const DEFAULT_APP_REPO_URL: &str = "https://github.com/comfyanonymous/ComfyUI.git";
pub const DEFAULT_TORCH_INDEX_URL: &str = "https://download.pytorch.org/whl/cu121";

const DEFAULT_MIN_PORT: u16 = 4001;
const DEFAULT_MAX_PORT: u16 = 4100;
const DEFAULT_DOWNLOAD_MAX_RETRIES: u32 = 3;
const DEFAULT_READY_TIMEOUT_SEC: u64 = 60;

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn env_u16(name: &str) -> Option<u16> {
    env_string(name).and_then(|v| v.parse::<u16>().ok())
}

pub(crate) fn env_flag(name: &str) -> bool {
    env_string(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Resolve relative paths against the working directory. Canonicalization is
/// best-effort: the directory may not exist yet.
pub(crate) fn absolute_path(raw: impl AsRef<Path>) -> PathBuf {
    let p = raw.as_ref().to_path_buf();
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

fn default_python() -> &'static str {
    if cfg!(windows) { "python" } else { "python3" }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub projects_dir: PathBuf,
    pub models_dir: PathBuf,
    pub credentials_path: PathBuf,
    pub frame_html: PathBuf,
    pub app_repo_url: String,
    pub min_port: u16,
    pub max_port: u16,
    pub python: String,
    /// Wheel index for the base ML runtime; `None` skips that install.
    pub torch_index_url: Option<String>,
    pub download_max_retries: u32,
    pub ready_timeout: Duration,
    pub force_cpu: bool,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let min_port = env_u16("EASEL_PROJECT_MIN_PORT")
            .filter(|v| *v >= 1024)
            .unwrap_or(DEFAULT_MIN_PORT);
        let max_port = env_u16("EASEL_PROJECT_MAX_PORT")
            .unwrap_or(DEFAULT_MAX_PORT)
            .max(min_port);

        let torch_index_url = match std::env::var("EASEL_TORCH_INDEX_URL") {
            Ok(v) if v.trim().is_empty() => None,
            Ok(v) => Some(v.trim().to_string()),
            Err(_) => Some(DEFAULT_TORCH_INDEX_URL.to_string()),
        };

        Self {
            projects_dir: absolute_path(
                &env_string("EASEL_PROJECTS_DIR").unwrap_or_else(|| "./projects".to_string()),
            ),
            models_dir: absolute_path(
                &env_string("EASEL_MODELS_DIR").unwrap_or_else(|| "./models".to_string()),
            ),
            credentials_path: absolute_path(
                &env_string("EASEL_CONFIG_PATH").unwrap_or_else(|| "./config.json".to_string()),
            ),
            frame_html: absolute_path(
                &env_string("EASEL_FRAME_HTML")
                    .unwrap_or_else(|| "./web/comfy_frame.html".to_string()),
            ),
            app_repo_url: env_string("EASEL_APP_REPO_URL")
                .unwrap_or_else(|| DEFAULT_APP_REPO_URL.to_string()),
            min_port,
            max_port,
            python: env_string("EASEL_PYTHON").unwrap_or_else(|| default_python().to_string()),
            torch_index_url,
            download_max_retries: env_u64("EASEL_DOWNLOAD_MAX_RETRIES")
                .map(|v| v.clamp(1, 10) as u32)
                .unwrap_or(DEFAULT_DOWNLOAD_MAX_RETRIES),
            ready_timeout: Duration::from_secs(
                env_u64("EASEL_READY_TIMEOUT_SEC")
                    .map(|v| v.clamp(1, 600))
                    .unwrap_or(DEFAULT_READY_TIMEOUT_SEC),
            ),
            force_cpu: env_flag("EASEL_FORCE_CPU"),
        }
    }

    /// Configuration rooted in `root`, for embedding and tests.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            projects_dir: root.join("projects"),
            models_dir: root.join("models"),
            credentials_path: root.join("config.json"),
            frame_html: root.join("web").join("comfy_frame.html"),
            app_repo_url: DEFAULT_APP_REPO_URL.to_string(),
            min_port: DEFAULT_MIN_PORT,
            max_port: DEFAULT_MAX_PORT,
            python: default_python().to_string(),
            torch_index_url: Some(DEFAULT_TORCH_INDEX_URL.to_string()),
            download_max_retries: DEFAULT_DOWNLOAD_MAX_RETRIES,
            ready_timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SEC),
            force_cpu: false,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CivitaiCredentials {
    #[serde(default)]
    pub apikey: String,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct HuggingfaceCredentials {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub civitai: CivitaiCredentials,
    #[serde(default)]
    pub huggingface: HuggingfaceCredentials,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    credentials: Credentials,
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

impl Credentials {
    /// Missing file yields empty credentials; a malformed one is logged and ignored.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read(path) {
            Ok(v) => v,
            Err(_) => return Self::default(),
        };
        match serde_json::from_slice::<CredentialsFile>(&raw) {
            Ok(f) => f.credentials,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring malformed credentials file");
                Self::default()
            }
        }
    }

    /// Overwrite the given tokens in the config document and persist it.
    /// Other keys in the document are kept. A malformed document is an
    /// error rather than being replaced.
    pub fn update(
        path: &Path,
        civitai_apikey: Option<&str>,
        huggingface_token: Option<&str>,
    ) -> anyhow::Result<Self> {
        let mut doc = match std::fs::read(path) {
            Ok(raw) => serde_json::from_slice::<serde_json::Value>(&raw)
                .with_context(|| format!("parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => serde_json::json!({}),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let root = doc
            .as_object_mut()
            .with_context(|| format!("{} is not a JSON object", path.display()))?;

        let mut file: CredentialsFile = serde_json::from_value(serde_json::Value::Object(root.clone()))
            .with_context(|| format!("parse credentials in {}", path.display()))?;
        if let Some(key) = civitai_apikey {
            file.credentials.civitai.apikey = key.trim().to_string();
        }
        if let Some(token) = huggingface_token {
            file.credentials.huggingface.token = token.trim().to_string();
        }
        root.insert(
            "credentials".to_string(),
            serde_json::to_value(&file.credentials).context("serialize credentials")?,
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("create config dir")?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&doc)?).context("write config.json.tmp")?;
        std::fs::rename(&tmp, path).context("persist config.json")?;
        tracing::info!(path = %path.display(), "credentials updated");
        Ok(file.credentials)
    }

    /// Authorization headers for `url`. Tokens are only attached to their own host.
    pub fn headers_for(&self, url: &str) -> Vec<(String, String)> {
        let Some(host) = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        else {
            return Vec::new();
        };

        let token = if host_matches(&host, "civitai.com") {
            self.civitai.apikey.trim()
        } else if host_matches(&host, "huggingface.co") {
            self.huggingface.token.trim()
        } else {
            ""
        };

        if token.is_empty() {
            return Vec::new();
        }
        vec![("Authorization".to_string(), format!("Bearer {token}"))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            civitai: CivitaiCredentials {
                apikey: "civ-key".to_string(),
            },
            huggingface: HuggingfaceCredentials {
                token: "hf-token".to_string(),
            },
        }
    }

    #[test]
    fn headers_follow_hostname() {
        let c = creds();
        assert_eq!(
            c.headers_for("https://civitai.com/api/download/models/1"),
            vec![("Authorization".to_string(), "Bearer civ-key".to_string())]
        );
        assert_eq!(
            c.headers_for("https://huggingface.co/a/b/resolve/main/x.safetensors"),
            vec![("Authorization".to_string(), "Bearer hf-token".to_string())]
        );
        assert_eq!(
            c.headers_for("https://cdn-lfs.huggingface.co/x"),
            vec![("Authorization".to_string(), "Bearer hf-token".to_string())]
        );
    }

    #[test]
    fn headers_not_leaked_to_lookalike_hosts() {
        let c = creds();
        assert!(c.headers_for("https://evil-civitai.com/x").is_empty());
        assert!(c.headers_for("https://example.com/?u=huggingface.co").is_empty());
        assert!(c.headers_for("not a url").is_empty());
    }

    #[test]
    fn empty_tokens_add_no_header() {
        let c = Credentials::default();
        assert!(c.headers_for("https://civitai.com/x").is_empty());
    }

    #[test]
    fn credentials_load_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert!(Credentials::load(&path).civitai.apikey.is_empty());

        std::fs::write(&path, b"{not json").unwrap();
        assert!(Credentials::load(&path).huggingface.token.is_empty());

        assert!(Credentials::update(&path, Some("x"), None).is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"{not json");
    }

    #[test]
    fn update_merges_into_existing_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let c = Credentials::update(&path, Some(" civ-key "), None).unwrap();
        assert_eq!(c.civitai.apikey, "civ-key");
        assert!(c.huggingface.token.is_empty());

        let mut doc: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        doc["theme"] = serde_json::json!("dark");
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        Credentials::update(&path, None, Some("hf-token")).unwrap();
        let loaded = Credentials::load(&path);
        assert_eq!(loaded.civitai.apikey, creds().civitai.apikey);
        assert_eq!(loaded.huggingface.token, "hf-token");
        let doc: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc["theme"], "dark");
    }

    #[test]
    fn rooted_config_uses_root() {
        let root = Path::new("/tmp/easel-root");
        let cfg = AgentConfig::rooted_at(root);
        assert_eq!(cfg.projects_dir, root.join("projects"));
        assert_eq!(cfg.models_dir, root.join("models"));
        assert!(cfg.min_port <= cfg.max_port);
    }
}
