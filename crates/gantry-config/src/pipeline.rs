//! Pipeline definition parsing.
//!
//! A definition file holds one or more `pipeline` nodes; promotions may
//! reference any pipeline in the same file, so parsing always works on the
//! whole set.

use crate::{ConfigError, ConfigResult};
use gantry_core::pipeline::{BlockDefinition, Command, JobDefinition, PipelineDefinition};
use gantry_core::pipeline::PipelineStatus;
use gantry_core::promotion::{PromotionPredicate, PromotionRule, TriggerMode};
use kdl::{KdlDocument, KdlNode};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Parse a definition set from KDL text and validate it as a whole:
/// names must be unique at every level, promotion targets must exist, and
/// Auto promotions must not form a cycle.
pub fn parse_definitions(kdl: &str) -> ConfigResult<Vec<PipelineDefinition>> {
    let doc: KdlDocument = kdl.parse()?;

    let mut definitions = Vec::new();
    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => definitions.push(parse_pipeline(node)?),
            _ => {} // Ignore unknown top-level nodes
        }
    }

    if definitions.is_empty() {
        return Err(ConfigError::MissingField("pipeline".to_string()));
    }

    let mut seen = HashSet::new();
    for definition in &definitions {
        if !seen.insert(definition.name.as_str()) {
            return Err(ConfigError::Duplicate(format!(
                "pipeline '{}'",
                definition.name
            )));
        }
    }

    // Promotion targets must resolve within the set.
    for definition in &definitions {
        for rule in &definition.promotions {
            if !seen.contains(rule.target.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "pipeline '{}' promotes to unknown pipeline '{}'",
                    definition.name, rule.target
                )));
            }
        }
    }

    if let Err(cycle) = detect_auto_cycle(&definitions) {
        return Err(ConfigError::CycleDetected(cycle));
    }

    Ok(definitions)
}

fn parse_pipeline(node: &KdlNode) -> ConfigResult<PipelineDefinition> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;

    let mut blocks = Vec::new();
    let mut promotions = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "block" => blocks.push(parse_block(&name, child)?),
                "promote" => promotions.push(parse_promotion(&name, child)?),
                _ => {}
            }
        }
    }

    if blocks.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "blocks in pipeline '{}'",
            name
        )));
    }

    let mut block_names = HashSet::new();
    for block in &blocks {
        if !block_names.insert(block.name.as_str()) {
            return Err(ConfigError::Duplicate(format!(
                "block '{}' in pipeline '{}'",
                block.name, name
            )));
        }
    }

    Ok(PipelineDefinition {
        name,
        blocks,
        promotions,
    })
}

fn parse_block(pipeline: &str, node: &KdlNode) -> ConfigResult<BlockDefinition> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("block name in pipeline '{pipeline}'")))?;

    let mut jobs = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "job" {
                jobs.push(parse_job(&name, child)?);
            }
        }
    }

    if jobs.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "jobs in block '{name}'"
        )));
    }

    let mut job_names = HashSet::new();
    for job in &jobs {
        if !job_names.insert(job.name.as_str()) {
            return Err(ConfigError::Duplicate(format!(
                "job '{}' in block '{}'",
                job.name, name
            )));
        }
    }

    Ok(BlockDefinition { name, jobs })
}

fn parse_job(block: &str, node: &KdlNode) -> ConfigResult<JobDefinition> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("job name in block '{block}'")))?;

    let secrets = get_string_list_prop(node, "secrets");

    let timeout = match node.get("timeout") {
        Some(value) => {
            let seconds = value.as_integer().filter(|s| *s > 0).ok_or_else(|| {
                ConfigError::InvalidValue {
                    field: format!("timeout for job '{name}'"),
                    message: "expected a positive number of seconds".to_string(),
                }
            })?;
            Some(Duration::from_secs(seconds as u64))
        }
        None => None,
    };

    // Children are walked once so command order is the file order.
    let mut commands = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "run" => {
                    let line = get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("run command in job '{name}'"))
                    })?;
                    commands.push(Command::Shell(line));
                }
                "cache-store" => {
                    let mut args = get_all_string_args(child);
                    if args.len() < 2 {
                        return Err(ConfigError::MissingField(format!(
                            "cache-store key and paths in job '{name}'"
                        )));
                    }
                    let key = args.remove(0);
                    commands.push(Command::CacheStore { key, paths: args });
                }
                "cache-restore" => {
                    let key = get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("cache-restore key in job '{name}'"))
                    })?;
                    commands.push(Command::CacheRestore { key });
                }
                "cache-delete" => {
                    let key = get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("cache-delete key in job '{name}'"))
                    })?;
                    commands.push(Command::CacheDelete { key });
                }
                _ => {}
            }
        }
    }

    if commands.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "commands in job '{name}'"
        )));
    }

    Ok(JobDefinition {
        name,
        commands,
        secrets,
        timeout,
    })
}

fn parse_promotion(pipeline: &str, node: &KdlNode) -> ConfigResult<PromotionRule> {
    let target = get_first_string_arg(node).ok_or_else(|| {
        ConfigError::MissingField(format!("promotion target in pipeline '{pipeline}'"))
    })?;

    let name = get_string_prop(node, "name").unwrap_or_else(|| target.clone());
    let mode = if get_bool_prop(node, "auto").unwrap_or(false) {
        TriggerMode::Auto
    } else {
        TriggerMode::Manual
    };

    let mut when = PromotionPredicate::default();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "when" {
                if let Some(result) = get_string_prop(child, "result") {
                    when.result = Some(parse_result(&name, &result)?);
                }
                when.branches = get_string_list_prop(child, "branch");
            }
        }
    }

    Ok(PromotionRule {
        name,
        target,
        mode,
        when,
    })
}

fn parse_result(rule: &str, value: &str) -> ConfigResult<PipelineStatus> {
    match value {
        "passed" => Ok(PipelineStatus::Passed),
        "failed" => Ok(PipelineStatus::Failed),
        "stopped" => Ok(PipelineStatus::Stopped),
        other => Err(ConfigError::InvalidValue {
            field: format!("result in promotion '{rule}'"),
            message: format!("unknown result '{other}', expected passed, failed, or stopped"),
        }),
    }
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

/// Collect every occurrence of a repeated property, e.g.
/// `secrets="a" secrets="b"`.
fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().map(|n| n.value()) == Some(name))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

/// Detect cycles among Auto promotion edges using DFS. Manual promotions
/// may form cycles; an operator gates each hop.
fn detect_auto_cycle(definitions: &[PipelineDefinition]) -> Result<(), String> {
    let edges: HashMap<&str, Vec<&str>> = definitions
        .iter()
        .map(|d| {
            let targets = d
                .promotions
                .iter()
                .filter(|r| r.mode == TriggerMode::Auto)
                .map(|r| r.target.as_str())
                .collect();
            (d.name.as_str(), targets)
        })
        .collect();

    let mut visited = HashMap::new();
    let mut rec_stack = HashMap::new();

    for definition in definitions {
        if !visited.contains_key(definition.name.as_str()) {
            if let Some(cycle) =
                dfs_detect_cycle(&definition.name, &edges, &mut visited, &mut rec_stack)
            {
                return Err(cycle);
            }
        }
    }
    Ok(())
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashMap<&'a str, bool>,
    rec_stack: &mut HashMap<&'a str, bool>,
) -> Option<String> {
    visited.insert(node, true);
    rec_stack.insert(node, true);

    if let Some(targets) = edges.get(node) {
        for target in targets {
            if !visited.contains_key(target) {
                if let Some(cycle) = dfs_detect_cycle(target, edges, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.get(target).copied().unwrap_or(false) {
                return Some(format!("{node} -> {target}"));
            }
        }
    }

    rec_stack.insert(node, false);
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_pipeline() {
        let kdl = r#"
            pipeline "build-test" {
                block "build" {
                    job "image" {
                        run "make image"
                    }
                }
            }
        "#;

        let definitions = parse_definitions(kdl).unwrap();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].name, "build-test");
        assert_eq!(definitions[0].blocks.len(), 1);
        assert_eq!(definitions[0].blocks[0].jobs[0].name, "image");
    }

    #[test]
    fn test_command_order_follows_file_order() {
        let kdl = r#"
            pipeline "p" {
                block "b" {
                    job "j" {
                        cache-restore "deps"
                        run "make build"
                        cache-store "deps" "target/deps"
                    }
                }
            }
        "#;

        let definitions = parse_definitions(kdl).unwrap();
        let commands = &definitions[0].blocks[0].jobs[0].commands;
        assert!(matches!(commands[0], Command::CacheRestore { .. }));
        assert!(matches!(commands[1], Command::Shell(_)));
        assert!(matches!(commands[2], Command::CacheStore { .. }));
    }

    #[test]
    fn test_parse_job_secrets_and_timeout() {
        let kdl = r#"
            pipeline "p" {
                block "b" {
                    job "push" secrets="dockerhub" secrets="extra" timeout=90 {
                        run "docker push app"
                    }
                }
            }
        "#;

        let definitions = parse_definitions(kdl).unwrap();
        let job = &definitions[0].blocks[0].jobs[0];
        assert_eq!(job.secrets, vec!["dockerhub", "extra"]);
        assert_eq!(job.timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_parse_promotions() {
        let kdl = r#"
            pipeline "build-test" {
                block "b" {
                    job "j" { run "true" }
                }
                promote "deploy-staging" auto=#true {
                    when result="passed" branch="master" branch="develop"
                }
                promote "deploy-production" {
                    when result="passed" branch="master"
                }
            }
            pipeline "deploy-staging" {
                block "d" {
                    job "j" { run "true" }
                }
            }
            pipeline "deploy-production" {
                block "d" {
                    job "j" { run "true" }
                }
            }
        "#;

        let definitions = parse_definitions(kdl).unwrap();
        let rules = &definitions[0].promotions;
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].mode, TriggerMode::Auto);
        assert_eq!(rules[0].when.branches, vec!["master", "develop"]);
        assert_eq!(rules[0].when.result, Some(PipelineStatus::Passed));
        assert_eq!(rules[1].mode, TriggerMode::Manual);
        assert_eq!(rules[1].target, "deploy-production");
    }

    #[test]
    fn test_unknown_promotion_target_rejected() {
        let kdl = r#"
            pipeline "p" {
                block "b" {
                    job "j" { run "true" }
                }
                promote "nonexistent"
            }
        "#;

        let result = parse_definitions(kdl);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidReference(_)
        ));
    }

    #[test]
    fn test_auto_promotion_cycle_rejected() {
        let kdl = r#"
            pipeline "a" {
                block "b" { job "j" { run "true" } }
                promote "b" auto=#true
            }
            pipeline "b" {
                block "b" { job "j" { run "true" } }
                promote "a" auto=#true
            }
        "#;

        let result = parse_definitions(kdl);
        assert!(matches!(result.unwrap_err(), ConfigError::CycleDetected(_)));
    }

    #[test]
    fn test_manual_promotion_cycle_allowed() {
        let kdl = r#"
            pipeline "a" {
                block "b" { job "j" { run "true" } }
                promote "b" auto=#true
            }
            pipeline "b" {
                block "b" { job "j" { run "true" } }
                promote "a"
            }
        "#;

        assert!(parse_definitions(kdl).is_ok());
    }

    #[test]
    fn test_duplicate_pipeline_rejected() {
        let kdl = r#"
            pipeline "p" { block "b" { job "j" { run "true" } } }
            pipeline "p" { block "b" { job "j" { run "true" } } }
        "#;

        assert!(matches!(
            parse_definitions(kdl).unwrap_err(),
            ConfigError::Duplicate(_)
        ));
    }

    #[test]
    fn test_duplicate_job_rejected() {
        let kdl = r#"
            pipeline "p" {
                block "b" {
                    job "j" { run "true" }
                    job "j" { run "false" }
                }
            }
        "#;

        assert!(matches!(
            parse_definitions(kdl).unwrap_err(),
            ConfigError::Duplicate(_)
        ));
    }

    #[test]
    fn test_empty_job_rejected() {
        let kdl = r#"
            pipeline "p" {
                block "b" {
                    job "j" { }
                }
            }
        "#;

        assert!(matches!(
            parse_definitions(kdl).unwrap_err(),
            ConfigError::MissingField(_)
        ));
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let kdl = r#"
            pipeline "p" {
                block "b" {
                    job "j" timeout=-5 { run "true" }
                }
            }
        "#;

        assert!(matches!(
            parse_definitions(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_invalid_result_rejected() {
        let kdl = r#"
            pipeline "p" {
                block "b" { job "j" { run "true" } }
                promote "p" {
                    when result="green"
                }
            }
        "#;

        assert!(matches!(
            parse_definitions(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }
}
