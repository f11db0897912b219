use std::{collections::BTreeSet, fmt};

use serde_json::{Map, Value};

/// Identifier of one queued provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a project as persisted in its state record.
///
/// Provisioning walks `Initializing` through `Ready` strictly forward.
/// `Running` is a side-state of `Ready`; `Error` absorbs everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Initializing,
    DownloadingApp,
    InstallingApp,
    InstallingPlugins,
    DownloadingFiles,
    Ready,
    Running,
    Error,
}

impl ProjectStatus {
    /// Position in the provisioning order; `None` for the side/absorbing states.
    pub fn pipeline_rank(self) -> Option<u8> {
        match self {
            Self::Initializing => Some(0),
            Self::DownloadingApp => Some(1),
            Self::InstallingApp => Some(2),
            Self::InstallingPlugins => Some(3),
            Self::DownloadingFiles => Some(4),
            Self::Ready => Some(5),
            Self::Running | Self::Error => None,
        }
    }

    pub fn can_advance_to(self, next: ProjectStatus) -> bool {
        match (self, next) {
            (Self::Error, _) => false,
            (_, Self::Error) => true,
            (Self::Ready, Self::Running) | (Self::Running, Self::Ready) => true,
            (a, b) => match (a.pipeline_rank(), b.pipeline_rank()) {
                (Some(a), Some(b)) => b > a,
                _ => false,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::DownloadingApp => "downloading_app",
            Self::InstallingApp => "installing_app",
            Self::InstallingPlugins => "installing_plugins",
            Self::DownloadingFiles => "downloading_files",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status message for `ready`, flagging degraded completeness.
pub fn ready_message(missing_files: usize) -> String {
    match missing_files {
        0 => "Ready".to_string(),
        1 => "Ready (1 file missing)".to_string(),
        n => format!("Ready ({n} files missing)"),
    }
}

/// Typed view of the persisted state record.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProjectState {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: Option<ProjectStatus>,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_files: Vec<String>,
}

impl ProjectState {
    pub fn is_empty(&self) -> bool {
        self.id.is_empty() && self.name.is_empty() && self.state.is_none()
    }
}

/// Partial update merged into a state record. Unset fields are left alone;
/// `port`/`pid` distinguish "leave" (`None`) from "clear" (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub id: Option<String>,
    pub name: Option<String>,
    pub state: Option<ProjectStatus>,
    pub status_message: Option<String>,
    pub port: Option<Option<u16>>,
    pub pid: Option<Option<u32>>,
    pub missing_files: Option<Vec<String>>,
}

impl StatePatch {
    pub fn status(state: ProjectStatus, message: impl Into<String>) -> Self {
        Self {
            state: Some(state),
            status_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn identity(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self.name = Some(name.into());
        self
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_missing_files(mut self, files: Vec<String>) -> Self {
        self.missing_files = Some(files);
        self
    }

    /// The JSON fields this patch overwrites.
    pub fn into_fields(self) -> Map<String, Value> {
        let mut out = Map::new();
        if let Some(id) = self.id {
            out.insert("id".to_string(), Value::String(id));
        }
        if let Some(name) = self.name {
            out.insert("name".to_string(), Value::String(name));
        }
        if let Some(state) = self.state {
            out.insert("state".to_string(), Value::String(state.as_str().to_string()));
        }
        if let Some(msg) = self.status_message {
            out.insert("status_message".to_string(), Value::String(msg));
        }
        if let Some(port) = self.port {
            out.insert("port".to_string(), port.map(Value::from).unwrap_or(Value::Null));
        }
        if let Some(pid) = self.pid {
            out.insert("pid".to_string(), pid.map(Value::from).unwrap_or(Value::Null));
        }
        if let Some(files) = self.missing_files {
            out.insert(
                "missing_files".to_string(),
                Value::Array(files.into_iter().map(Value::String).collect()),
            );
        }
        out
    }
}

/// One alternative source for a required file.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FileSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_relative_path: Option<String>,
    #[serde(
        default,
        rename = "sha256_checksum",
        skip_serializing_if = "Option::is_none"
    )]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PluginPin {
    #[serde(default, rename = "hash")]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

/// Plugin pins keyed by repository url, in document order.
///
/// Install order follows the order the descriptor lists them in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginPins(pub Vec<(String, PluginPin)>);

impl PluginPins {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PluginPin)> {
        self.0.iter().map(|(url, pin)| (url.as_str(), pin))
    }

    pub fn get(&self, url: &str) -> Option<&PluginPin> {
        self.iter().find(|(u, _)| *u == url).map(|(_, pin)| pin)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl serde::Serialize for PluginPins {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

impl<'de> serde::Deserialize<'de> for PluginPins {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PinsVisitor;

        impl<'de> serde::de::Visitor<'de> for PinsVisitor {
            type Value = PluginPins;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of plugin url to pin")
            }

            fn visit_map<A: serde::de::MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut out: Vec<(String, PluginPin)> = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((url, pin)) = map.next_entry::<String, PluginPin>()? {
                    // Later duplicates win, keeping the first position.
                    match out.iter_mut().find(|(u, _)| *u == url) {
                        Some(slot) => slot.1 = pin,
                        None => out.push((url, pin)),
                    }
                }
                Ok(PluginPins(out))
            }
        }

        deserializer.deserialize_map(PinsVisitor)
    }
}

/// Pinned application + plugin revisions.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    #[serde(default, rename = "comfyui")]
    pub app_commit: Option<String>,
    #[serde(default, rename = "git_custom_nodes")]
    pub plugins: PluginPins,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum PipRequirement {
    Spec(String),
    Pinned {
        #[serde(rename = "_key")]
        key: String,
        #[serde(rename = "_version")]
        version: String,
    },
}

impl PipRequirement {
    pub fn to_requirement_line(&self) -> String {
        match self {
            Self::Spec(s) => s.trim().to_string(),
            Self::Pinned { key, version } => format!("{key}=={version}"),
        }
    }
}

/// The launcher descriptor document (`launcher.json`).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LauncherSpec {
    #[serde(default, rename = "workflow_json")]
    pub workflow_document: Value,
    #[serde(default, rename = "files")]
    pub file_groups: Vec<Vec<FileSource>>,
    #[serde(default, rename = "snapshot_json")]
    pub snapshot: Snapshot,
    #[serde(default)]
    pub pip_requirements: Vec<PipRequirement>,
    /// Keys this agent does not interpret (e.g. `format`), kept for persistence.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LauncherSpec {
    /// `true` when the document declares itself as a launcher descriptor
    /// rather than a bare workflow graph.
    pub fn is_launcher_format(doc: &Value) -> bool {
        doc.get("format").and_then(Value::as_str) == Some("comfyui_launcher")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectDescriptor {
    pub id: String,
    pub name: String,
    pub launcher_spec: Option<LauncherSpec>,
    pub requested_port: Option<u16>,
}

/// Outcome of the file-download phase of one provisioning run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub missing_files: BTreeSet<String>,
}

impl DownloadReport {
    pub fn is_complete(&self) -> bool {
        self.missing_files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_id_is_non_empty() {
        assert!(!JobId::new().0.is_empty());
    }

    #[test]
    fn provisioning_order_is_forward_only() {
        use ProjectStatus::*;
        assert!(Initializing.can_advance_to(DownloadingApp));
        assert!(DownloadingApp.can_advance_to(InstallingApp));
        assert!(DownloadingFiles.can_advance_to(Ready));
        assert!(!InstallingPlugins.can_advance_to(DownloadingApp));
        assert!(!Ready.can_advance_to(Initializing));
        assert!(!Ready.can_advance_to(Ready));
    }

    #[test]
    fn error_is_reachable_and_absorbing() {
        use ProjectStatus::*;
        for s in [Initializing, DownloadingApp, InstallingPlugins, Ready, Running] {
            assert!(s.can_advance_to(Error), "{s} -> error");
        }
        for s in [Initializing, Ready, Running, Error] {
            assert!(!Error.can_advance_to(s), "error -> {s}");
        }
    }

    #[test]
    fn running_is_a_side_state_of_ready() {
        use ProjectStatus::*;
        assert!(Ready.can_advance_to(Running));
        assert!(Running.can_advance_to(Ready));
        assert!(!InstallingApp.can_advance_to(Running));
        assert!(!Running.can_advance_to(DownloadingFiles));
    }

    #[test]
    fn ready_message_counts_missing_files() {
        assert_eq!(ready_message(0), "Ready");
        assert_eq!(ready_message(1), "Ready (1 file missing)");
        assert_eq!(ready_message(3), "Ready (3 files missing)");
    }

    #[test]
    fn status_serializes_snake_case() {
        let v = serde_json::to_value(ProjectStatus::InstallingPlugins).unwrap();
        assert_eq!(v, json!("installing_plugins"));
        assert_eq!(ProjectStatus::InstallingPlugins.as_str(), "installing_plugins");
    }

    #[test]
    fn patch_distinguishes_clear_from_leave() {
        let fields = StatePatch::status(ProjectStatus::Ready, "Ready")
            .with_port(None)
            .with_pid(None)
            .into_fields();
        assert_eq!(fields.get("port"), Some(&Value::Null));
        assert_eq!(fields.get("pid"), Some(&Value::Null));
        assert_eq!(fields.get("state"), Some(&json!("ready")));
        assert!(!fields.contains_key("name"));

        let fields = StatePatch::status(ProjectStatus::Running, "Running...").into_fields();
        assert!(!fields.contains_key("port"));
    }

    #[test]
    fn empty_record_parses_to_default_state() {
        let st: ProjectState = serde_json::from_value(json!({})).unwrap();
        assert!(st.is_empty());
        assert_eq!(st.state, None);
    }

    #[test]
    fn launcher_spec_parses_wire_format() {
        let doc = json!({
            "format": "comfyui_launcher",
            "workflow_json": {"nodes": []},
            "files": [[
                {"download_url": "http://test/a.bin", "dest_relative_path": "models/a.bin", "sha256_checksum": "ab"},
                {"download_url": "http://mirror/a.bin", "dest_relative_path": "models/a.bin"}
            ]],
            "snapshot_json": {
                "comfyui": "abc123",
                "git_custom_nodes": {
                    "https://github.com/x/Plugin.git": {"hash": "def", "disabled": false},
                    "https://github.com/x/Off": {"hash": null, "disabled": true}
                }
            },
            "pip_requirements": ["numpy", {"_key": "torch", "_version": "2.1.0"}]
        });
        assert!(LauncherSpec::is_launcher_format(&doc));

        let spec: LauncherSpec = serde_json::from_value(doc).unwrap();
        assert_eq!(spec.file_groups.len(), 1);
        assert_eq!(spec.file_groups[0][0].sha256.as_deref(), Some("ab"));
        assert_eq!(spec.file_groups[0][1].sha256, None);
        assert_eq!(spec.snapshot.app_commit.as_deref(), Some("abc123"));
        assert!(spec.snapshot.plugins.get("https://github.com/x/Off").unwrap().disabled);
        assert_eq!(spec.pip_requirements[0].to_requirement_line(), "numpy");
        assert_eq!(spec.pip_requirements[1].to_requirement_line(), "torch==2.1.0");
        assert_eq!(spec.extra.get("format"), Some(&json!("comfyui_launcher")));

        let back = serde_json::to_value(&spec).unwrap();
        assert_eq!(back["format"], json!("comfyui_launcher"));
        assert_eq!(back["snapshot_json"]["comfyui"], json!("abc123"));
    }

    #[test]
    fn launcher_spec_tolerates_missing_sections() {
        let spec: LauncherSpec = serde_json::from_value(json!({})).unwrap();
        assert!(spec.file_groups.is_empty());
        assert!(spec.snapshot.plugins.is_empty());
        assert_eq!(spec.workflow_document, Value::Null);
    }

    #[test]
    fn plugin_pins_keep_document_order() {
        let raw = r#"{"git_custom_nodes": {
            "https://github.com/x/Zeta": {"hash": "z"},
            "https://github.com/x/Alpha": {"hash": "a", "disabled": true},
            "https://github.com/x/Mid": {}
        }}"#;
        let expected = [
            "https://github.com/x/Zeta",
            "https://github.com/x/Alpha",
            "https://github.com/x/Mid",
        ];

        let from_str: Snapshot = serde_json::from_str(raw).unwrap();
        let urls: Vec<&str> = from_str.plugins.iter().map(|(u, _)| u).collect();
        assert_eq!(urls, expected);
        assert!(from_str.plugins.get("https://github.com/x/Alpha").unwrap().disabled);

        let value: Value = serde_json::from_str(raw).unwrap();
        let from_value: Snapshot = serde_json::from_value(value).unwrap();
        assert_eq!(from_value, from_str);

        let written = serde_json::to_string(&from_str.plugins).unwrap();
        assert!(written.find("Zeta").unwrap() < written.find("Alpha").unwrap());
        assert!(written.find("Alpha").unwrap() < written.find("Mid").unwrap());
    }
}
