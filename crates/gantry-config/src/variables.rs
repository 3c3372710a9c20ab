//! Variable interpolation for job commands and cache keys.
//!
//! Supports variables like:
//! - `${workflow.id}` - Workflow ID shared across promoted runs
//! - `${git.sha}` - Full git commit SHA
//! - `${git.short_sha}` - Short (7 char) git commit SHA
//! - `${git.branch}` - Branch name
//! - `${pipeline.name}` - Pipeline name
//! - `${block.name}` - Current block name
//! - `${job.name}` - Current job name
//! - `${env.VAR_NAME}` - Engine base environment variable
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)
//!
//! Unknown variables are left in place so a typo is visible in the job
//! output rather than silently becoming an empty string.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

/// Variable context for one job of one run.
#[derive(Debug, Clone, Default)]
pub struct WorkflowContext {
    pub workflow_id: String,
    pub sha: String,
    pub short_sha: String,
    pub branch: String,
    pub pipeline: String,
    pub block: String,
    pub job: String,
    /// Engine base environment, exposed as `${env.NAME}`.
    pub env: HashMap<String, String>,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow_id(mut self, id: impl Into<String>) -> Self {
        self.workflow_id = id.into();
        self
    }

    pub fn with_commit(mut self, sha: impl Into<String>) -> Self {
        let sha = sha.into();
        self.short_sha = sha.chars().take(7).collect();
        self.sha = sha;
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_pipeline(mut self, name: impl Into<String>) -> Self {
        self.pipeline = name.into();
        self
    }

    pub fn with_position(mut self, block: impl Into<String>, job: impl Into<String>) -> Self {
        self.block = block.into();
        self.job = job.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["workflow", "id"] => Some(self.workflow_id.clone()),

            ["git", "sha"] => Some(self.sha.clone()),
            ["git", "short_sha"] => Some(self.short_sha.clone()),
            ["git", "branch"] => Some(self.branch.clone()),

            ["pipeline", "name"] => Some(self.pipeline.clone()),
            ["block", "name"] => Some(self.block.clone()),
            ["job", "name"] => Some(self.job.clone()),

            ["env", name] => self.env.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),

            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    /// Variables are specified as `${var_name}` or `${namespace.var_name}`.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Interpolate variables in a list of strings.
    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    /// Interpolate variables in the values of a map.
    pub fn interpolate_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }
}
