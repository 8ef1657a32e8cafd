//! Startup loading of definitions and rules from JSON files
//!
//! Each `*.json` file holds one object or an array of objects. Files are
//! read in name order so that later versions of a definition code register
//! after earlier ones.

use crate::error::{DaemonError, DaemonResult};
use runflow_engine::DefinitionRegistry;
use runflow_rules::RuleEngine;
use runflow_types::{BusinessRule, RunDefinition};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Register every definition found in `dir`; returns how many
pub fn load_definitions(dir: &Path, registry: &DefinitionRegistry) -> DaemonResult<usize> {
    let mut count = 0;
    for (path, definitions) in read_dir::<RunDefinition>(dir)? {
        for definition in definitions {
            let code = definition.code.clone();
            let registered = registry.register(definition).map_err(|e| DaemonError::Seed {
                path: path.display().to_string(),
                message: format!("{}: {}", code, e),
            })?;
            tracing::info!(
                code = %registered.code,
                version = registered.version,
                scope = %registered.scope,
                "Definition registered"
            );
            count += 1;
        }
    }
    Ok(count)
}

/// Register every business rule found in `dir`; returns how many
pub async fn load_rules(dir: &Path, rules: &RuleEngine) -> DaemonResult<usize> {
    let mut count = 0;
    for (path, batch) in read_dir::<BusinessRule>(dir)? {
        for rule in batch {
            let name = rule.name.clone();
            rules.register(rule).await.map_err(|e| DaemonError::Seed {
                path: path.display().to_string(),
                message: format!("{}: {}", name, e),
            })?;
            tracing::debug!(rule = %name, "Rule registered");
            count += 1;
        }
    }
    Ok(count)
}

fn read_dir<T: DeserializeOwned>(dir: &Path) -> DaemonResult<Vec<(PathBuf, Vec<T>)>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let text = std::fs::read_to_string(&path)?;
            let items = parse_items(&text).map_err(|e| DaemonError::Seed {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            Ok((path, items))
        })
        .collect()
}

fn parse_items<T: DeserializeOwned>(text: &str) -> serde_json::Result<Vec<T>> {
    match serde_json::from_str::<serde_json::Value>(text)? {
        serde_json::Value::Array(items) => items.into_iter().map(serde_json::from_value).collect(),
        single => Ok(vec![serde_json::from_value(single)?]),
    }
}
