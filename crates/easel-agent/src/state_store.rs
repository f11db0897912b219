//! Durable per-project state record (`.launcher/state.json`).
//!
//! The record is a flat JSON object. Merges overwrite only the keys a patch
//! carries and retain everything else, including keys this agent does not
//! know about. Nothing is cached between calls.

use anyhow::Context;
use easel_project::{ProjectState, StatePatch};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;

use crate::project_dir::ProjectDir;

async fn read_fields(project: &ProjectDir) -> Map<String, Value> {
    let path = project.state_path();
    let raw = match tokio::fs::read(&path).await {
        Ok(v) => v,
        Err(_) => return Map::new(),
    };
    match serde_json::from_slice::<Value>(&raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            tracing::warn!(path = %path.display(), "state record unreadable, treating as empty");
            Map::new()
        }
    }
}

fn to_state(fields: &Map<String, Value>) -> ProjectState {
    serde_json::from_value(Value::Object(fields.clone())).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "state record has unexpected shape");
        ProjectState::default()
    })
}

/// Current record, or an empty default when absent. Never fails.
pub async fn read(project: &ProjectDir) -> ProjectState {
    to_state(&read_fields(project).await)
}

/// Raw JSON view of the record (`{}` when absent).
pub async fn read_raw(project: &ProjectDir) -> Value {
    Value::Object(read_fields(project).await)
}

/// Read-modify-write: load, overwrite the patch's keys, persist, return the result.
pub async fn merge(project: &ProjectDir, patch: StatePatch) -> anyhow::Result<ProjectState> {
    let dir = project.launcher_dir();
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("create {}", dir.display()))?;

    let mut fields = read_fields(project).await;
    for (k, v) in patch.into_fields() {
        fields.insert(k, v);
    }

    let path = project.state_path();
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec(&Value::Object(fields.clone())).context("serialize state")?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .context("create state.json.tmp")?;
    f.write_all(&data).await.context("write state.json.tmp")?;
    f.flush().await.ok();
    drop(f);
    tokio::fs::rename(&tmp, &path)
        .await
        .context("persist state.json")?;

    Ok(to_state(&fields))
}
