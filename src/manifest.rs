//! Task manifests.
//!
//! A manifest is a JSON array of tasks, a JSON object with a `tasks` array,
//! or a TOML file of `[[task]]` tables. The format follows the extension:
//! `.toml` is TOML, anything else is JSON.

use crate::core::task::TaskSpec;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TomlManifest {
    #[serde(default, rename = "task")]
    tasks: Vec<TaskSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonManifest {
    List(Vec<TaskSpec>),
    Wrapped { tasks: Vec<TaskSpec> },
}

/// Read the task list from `path`.
pub fn load(path: &Path) -> Result<Vec<TaskSpec>> {
    let content = fs::read_to_string(path)?;
    let is_toml = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);

    let tasks = if is_toml {
        parse_toml(&content)?
    } else {
        parse_json(&content)?
    };
    tracing::debug!(path = %path.display(), tasks = tasks.len(), "manifest loaded");
    Ok(tasks)
}

pub fn parse_json(content: &str) -> Result<Vec<TaskSpec>> {
    let manifest: JsonManifest = serde_json::from_str(content)?;
    Ok(match manifest {
        JsonManifest::List(tasks) | JsonManifest::Wrapped { tasks } => tasks,
    })
}

pub fn parse_toml(content: &str) -> Result<Vec<TaskSpec>> {
    let manifest: TomlManifest = toml::from_str(content)?;
    Ok(manifest.tasks)
}

/// Render tasks as a TOML manifest.
pub fn to_toml(tasks: &[TaskSpec]) -> Result<String> {
    Ok(toml::to_string_pretty(&TomlManifest {
        tasks: tasks.to_vec(),
    })?)
}
