//! Secret bundle abstraction and output redaction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::Result;

/// A named, immutable set of environment variables. Bundles are created
/// out-of-band by an operator and are read-only at pipeline-run time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretBundle {
    pub name: String,
    pub vars: HashMap<String, String>,
}

impl SecretBundle {
    pub fn new(name: impl Into<String>, vars: HashMap<String, String>) -> Self {
        Self {
            name: name.into(),
            vars,
        }
    }
}

/// Trait for secret storage backends. Resolution is side-effect-free and
/// safe under concurrent reads from unrelated pipelines.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Resolve a bundle by name, or `Error::NotFound` if no such bundle is
    /// registered.
    async fn resolve(&self, bundle_name: &str) -> Result<SecretBundle>;
}

/// Replaces known secret values in captured output before it is stored or
/// displayed anywhere.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    /// Values sorted longest-first so overlapping secrets redact fully.
    values: Vec<String>,
}

pub const REDACTED: &str = "***";

impl Redactor {
    pub fn new(values: impl IntoIterator<Item = String>) -> Self {
        // Empty values would match everywhere; skip them.
        let mut values: Vec<String> = values.into_iter().filter(|v| !v.is_empty()).collect();
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        values.dedup();
        Self { values }
    }

    /// Build a redactor covering every value of the given bundles.
    pub fn for_bundles<'a>(bundles: impl IntoIterator<Item = &'a SecretBundle>) -> Self {
        Self::new(
            bundles
                .into_iter()
                .flat_map(|b| b.vars.values().cloned())
                .collect::<Vec<_>>(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn redact(&self, line: &str) -> String {
        let mut redacted = line.to_string();
        for value in &self.values {
            if redacted.contains(value.as_str()) {
                redacted = redacted.replace(value.as_str(), REDACTED);
            }
        }
        redacted
    }
}
