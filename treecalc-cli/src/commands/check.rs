//! Compile every rule and report what fails.

use super::load_session;
use anyhow::{bail, Result};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct Failure {
    item: String,
    message: String,
}

#[derive(Serialize)]
struct CheckSummary {
    rules: usize,
    failures: Vec<Failure>,
}

pub fn check_model(config_path: &Path, json: bool) -> Result<()> {
    let mut session = load_session(config_path)?;
    let root = session.config_root();
    let failures = session.check(root);
    let summary = CheckSummary {
        rules: session.calculated_items(root).len(),
        failures: failures
            .into_iter()
            .map(|(node, error)| Failure {
                item: session.tree().full_name(node),
                message: error.to_string(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Check complete: {} rules, {} failures",
            summary.rules,
            summary.failures.len()
        );
        for failure in &summary.failures {
            println!("- {}: {}", failure.item, failure.message);
        }
    }

    if !summary.failures.is_empty() {
        bail!("{} rules failed to compile", summary.failures.len());
    }
    Ok(())
}
