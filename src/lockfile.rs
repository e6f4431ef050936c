use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::contract::AttributeType;
use crate::recipe::Recipe;
use crate::registry::StepSpec;

/// Pinned shape of a recipe: attribute signatures plus one hash per step.
#[derive(Debug, Serialize)]
pub struct PipelineLock {
    pub recipe_version: u32,
    pub name: String,
    pub generated_at: DateTime<Utc>,
    pub contract: Vec<AttributeLock>,
    pub steps: Vec<StepLock>,
}

#[derive(Debug, Serialize)]
pub struct AttributeLock {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AttributeType,
    pub required: bool,
}

#[derive(Debug, Serialize)]
pub struct StepLock {
    /// Slash-separated, e.g. `persist/mark_read` for a step inside a transaction.
    pub path: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub params_hash: String,
}

pub fn build_lock(recipe: &Recipe) -> PipelineLock {
    let mut steps = Vec::new();
    collect_steps("", &recipe.steps, &mut steps);

    PipelineLock {
        recipe_version: recipe.version,
        name: recipe.name.clone(),
        generated_at: Utc::now(),
        contract: recipe
            .contract
            .iter()
            .map(|attr| AttributeLock {
                name: attr.name.clone(),
                kind: attr.kind,
                required: attr.required,
            })
            .collect(),
        steps,
    }
}

pub fn generate_lock(recipe: &Recipe, path: &Path) -> Result<()> {
    let lock = build_lock(recipe);
    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;

    Ok(())
}

fn collect_steps(prefix: &str, specs: &[StepSpec], out: &mut Vec<StepLock>) {
    for spec in specs {
        let path = if prefix.is_empty() {
            spec.name().to_string()
        } else {
            format!("{prefix}/{}", spec.name())
        };
        out.push(StepLock {
            path: path.clone(),
            kind: spec.kind().to_string(),
            action: spec.action().map(str::to_string),
            params_hash: hash_params(spec),
        });
        collect_steps(&path, spec.nested(), out);
    }
}

fn hash_params(spec: &StepSpec) -> String {
    let mut hasher = Sha256::new();
    let serialized = serde_json::to_vec(&spec.params().cloned().unwrap_or_default())
        .unwrap_or_default();
    hasher.update(spec.kind().as_str().as_bytes());
    hasher.update(spec.action().unwrap_or_default().as_bytes());
    hasher.update(serialized);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_steps_get_slash_paths() {
        let recipe = Recipe::from_yaml(
            r#"
version: 1
name: mark_read
steps:
  - kind: transaction
    name: persist
    steps:
      - kind: step
        name: mark_read
        use: annotate
        params: { key: read, value: true }
"#,
        )
        .unwrap();
        let lock = build_lock(&recipe);
        let paths: Vec<_> = lock.steps.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(paths, ["persist", "persist/mark_read"]);
        assert_eq!(lock.steps[1].action.as_deref(), Some("annotate"));
        assert_eq!(lock.steps[1].params_hash.len(), 64);
        assert_ne!(lock.steps[0].params_hash, lock.steps[1].params_hash);
    }
}
