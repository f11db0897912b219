//! Workflow graph documents: model-file path normalization and the default
//! graph files the application and its companion plugin load at startup.

use anyhow::Context;
use serde_json::{Map, Value};

use crate::project_dir::ProjectDir;

const MODEL_EXTENSIONS: &[&str] = &["safetensors", "ckpt", "pt", "pth", "bin"];

/// Plugin directory that reads the current graph back from disk.
pub const COMPANION_PLUGIN_DIR: &str = "ComfyUI-ComfyWorkflows";

/// A string leaf that names a model file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFileRef {
    pub filename: String,
    pub original_path: String,
    pub normalized_path: String,
    /// `type` of the nearest enclosing node, when found under a `nodes` key.
    pub node_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Scope<'a> {
    under_nodes: bool,
    node_type: Option<&'a str>,
}

impl<'a> Scope<'a> {
    /// Scope for a child value. The node type is captured only once we are
    /// already beneath `nodes`, and the first one found sticks.
    fn enter(self, key: Option<&str>, child: &'a Value) -> Self {
        let node_type = match self.node_type {
            Some(t) => Some(t),
            None if self.under_nodes => child.get("type").and_then(Value::as_str),
            None => None,
        };
        Self {
            under_nodes: self.under_nodes || key == Some("nodes"),
            node_type,
        }
    }
}

pub fn to_host_path(path: &str, host_is_windows: bool) -> String {
    if host_is_windows {
        path.replace('/', "\\")
    } else {
        path.replace("\\\\", "/").replace('\\', "/")
    }
}

fn is_model_file(s: &str) -> bool {
    s.rsplit_once('.')
        .is_some_and(|(_, ext)| MODEL_EXTENSIONS.contains(&ext))
}

fn visit<'a>(value: &'a Value, scope: Scope<'a>, host_is_windows: bool, out: &mut Vec<ModelFileRef>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                visit(v, scope.enter(Some(k), v), host_is_windows, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                visit(v, scope.enter(None, v), host_is_windows, out);
            }
        }
        Value::String(s) if s.contains('.') && is_model_file(s) => {
            let filename = s.rsplit(['/', '\\']).next().unwrap_or(s).to_string();
            out.push(ModelFileRef {
                filename,
                original_path: s.clone(),
                normalized_path: to_host_path(s, host_is_windows),
                node_type: scope.node_type.map(str::to_string),
            });
        }
        _ => {}
    }
}

/// Every model-file reference in the document, in traversal order.
pub fn extract_model_files(doc: &Value, host_is_windows: bool) -> Vec<ModelFileRef> {
    let mut out = Vec::new();
    visit(doc, Scope::default(), host_is_windows, &mut out);
    out
}

/// JSON-escaped body of a string, as it appears inside serialized text.
fn escaped(s: &str) -> String {
    let quoted = Value::String(s.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// Rewrite model-file path separators to the host convention.
///
/// Substitution is textual over the serialized document, so a reference
/// that is a substring of another string is rewritten there too.
pub fn normalize(doc: &Value, host_is_windows: bool) -> anyhow::Result<Value> {
    let refs = extract_model_files(doc, host_is_windows);
    if refs.iter().all(|r| r.original_path == r.normalized_path) {
        return Ok(doc.clone());
    }

    let mut text = serde_json::to_string(doc).context("serialize workflow")?;
    for r in &refs {
        if r.original_path == r.normalized_path {
            continue;
        }
        text = text.replace(&escaped(&r.original_path), &escaped(&r.normalized_path));
    }
    serde_json::from_str(&text).context("reparse normalized workflow")
}

fn int_id(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn max_id<'a>(items: impl Iterator<Item = &'a Value>) -> i64 {
    items
        .filter_map(|item| match item {
            Value::Object(o) => o.get("id").and_then(int_id),
            Value::Array(a) => a.first().and_then(int_id),
            _ => None,
        })
        .fold(0, i64::max)
}

/// Graph shape the application expects as its default: unwrapped,
/// versioned, with `last_node_id` / `last_link_id` recomputed.
pub fn prepare_default_graph(doc: &Value) -> Value {
    let doc = match doc {
        Value::Object(o) if o.contains_key("workflow") => &o["workflow"],
        other => other,
    };
    let mut graph = match doc {
        Value::Object(o) => o.clone(),
        _ => Map::new(),
    };

    let version = match graph.get("version") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .unwrap_or(1.0);
    graph.insert("version".to_string(), Value::from(version));
    graph
        .entry("nodes")
        .or_insert_with(|| Value::Array(Vec::new()));
    graph
        .entry("links")
        .or_insert_with(|| Value::Array(Vec::new()));

    let last_node_id = graph
        .get("nodes")
        .and_then(Value::as_array)
        .map(|a| max_id(a.iter()))
        .unwrap_or(0);
    let last_link_id = graph
        .get("links")
        .and_then(Value::as_array)
        .map(|a| max_id(a.iter()))
        .unwrap_or(0);
    graph.insert("last_node_id".to_string(), Value::from(last_node_id));
    graph.insert("last_link_id".to_string(), Value::from(last_link_id));

    Value::Object(graph)
}

pub fn default_graph_js(graph: &Value) -> anyhow::Result<String> {
    let body = serde_json::to_string_pretty(graph).context("serialize default graph")?;
    Ok(format!(
        "window.resetWorkflowHistory = true;\nexport const defaultGraph = {body};"
    ))
}

/// Write the prepared graph where the application and the companion plugin read it.
pub async fn write_default_graph(project: &ProjectDir, doc: &Value) -> anyhow::Result<Value> {
    let graph = prepare_default_graph(doc);

    let scripts = project.app_web_dir().join("scripts");
    tokio::fs::create_dir_all(&scripts)
        .await
        .with_context(|| format!("create {}", scripts.display()))?;
    tokio::fs::write(scripts.join("defaultGraph.js"), default_graph_js(&graph)?)
        .await
        .context("write defaultGraph.js")?;

    let plugin = project.plugins_dir().join(COMPANION_PLUGIN_DIR);
    tokio::fs::create_dir_all(&plugin)
        .await
        .with_context(|| format!("create {}", plugin.display()))?;
    let pretty = serde_json::to_vec_pretty(&graph).context("serialize current graph")?;
    tokio::fs::write(plugin.join("current_graph.json"), pretty)
        .await
        .context("write current_graph.json")?;

    tracing::info!(
        nodes = graph["nodes"].as_array().map(Vec::len).unwrap_or(0),
        "default graph written"
    );
    Ok(graph)
}
