//! CLI command implementations.

pub mod run;

use anyhow::Result;

pub fn validate(path: &str) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    match gantry_config::parse_definitions(&content) {
        Ok(definitions) => {
            println!("Configuration is valid ({} pipelines)", definitions.len());
            for definition in &definitions {
                let jobs: usize = definition.blocks.iter().map(|b| b.jobs.len()).sum();
                println!(
                    "  {} - {} blocks, {} jobs, {} promotions",
                    definition.name,
                    definition.blocks.len(),
                    jobs,
                    definition.promotions.len()
                );
            }
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
