//! Secret bundle parsing.
//!
//! Bundles live in a separate file from pipeline definitions so the two can
//! be permissioned differently. Each child node of a `bundle` is one
//! variable: the node name is the key, the first argument the value.

use crate::{ConfigError, ConfigResult};
use gantry_core::secret::SecretBundle;
use kdl::KdlDocument;
use std::collections::{HashMap, HashSet};

/// Parse secret bundles from KDL text.
pub fn parse_bundles(kdl: &str) -> ConfigResult<Vec<SecretBundle>> {
    let doc: KdlDocument = kdl.parse()?;

    let mut bundles = Vec::new();
    for node in doc.nodes() {
        if node.name().value() != "bundle" {
            continue;
        }

        let name = node
            .entries()
            .iter()
            .find(|e| e.name().is_none())
            .and_then(|e| e.value().as_string())
            .map(|s| s.to_string())
            .ok_or_else(|| ConfigError::MissingField("bundle name".to_string()))?;

        let mut vars = HashMap::new();
        if let Some(children) = node.children() {
            for child in children.nodes() {
                let key = child.name().value().to_string();
                let value = child
                    .entries()
                    .iter()
                    .find(|e| e.name().is_none())
                    .and_then(|e| e.value().as_string())
                    .map(|s| s.to_string())
                    .ok_or_else(|| {
                        ConfigError::MissingField(format!(
                            "value for '{key}' in bundle '{name}'"
                        ))
                    })?;
                if vars.insert(key.clone(), value).is_some() {
                    return Err(ConfigError::Duplicate(format!(
                        "variable '{key}' in bundle '{name}'"
                    )));
                }
            }
        }

        bundles.push(SecretBundle { name, vars });
    }

    let mut seen = HashSet::new();
    for bundle in &bundles {
        if !seen.insert(bundle.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("bundle '{}'", bundle.name)));
        }
    }

    Ok(bundles)
}
