//! Model artifact resolution for the inference backend.

use super::SupervisorError;
use std::fs;
use std::path::{Path, PathBuf};

/// File extension of backend model artifacts.
pub const MODEL_EXTENSION: &str = "gguf";

/// File names tried in every search directory before scanning it.
pub const WELL_KNOWN_MODEL_FILES: &[&str] = &["model.gguf", "default.gguf", "thinknode.gguf"];

/// Pick the model file for the backend.
///
/// Order: the explicit override if it exists, then each well-known name in
/// each search directory, then the lexicographically first `*.gguf` found
/// by scanning the directories in order.
pub fn resolve_model_artifact(
    override_path: Option<&Path>,
    search_dirs: &[PathBuf],
) -> Result<PathBuf, SupervisorError> {
    if let Some(path) = override_path {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        tracing::warn!(path = %path.display(), "model override does not exist, searching model directories");
    }

    for dir in search_dirs {
        for name in WELL_KNOWN_MODEL_FILES {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    for dir in search_dirs {
        if let Some(found) = scan_dir(dir) {
            return Ok(found);
        }
    }

    let mut searched: Vec<String> = override_path
        .map(|p| p.display().to_string())
        .into_iter()
        .collect();
    searched.extend(search_dirs.iter().map(|d| d.display().to_string()));

    Err(SupervisorError::ModelNotFound {
        searched: if searched.is_empty() {
            "no locations configured".to_string()
        } else {
            searched.join(", ")
        },
    })
}

fn scan_dir(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    let mut models: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(MODEL_EXTENSION))
        })
        .collect();
    models.sort();
    models.into_iter().next()
}
