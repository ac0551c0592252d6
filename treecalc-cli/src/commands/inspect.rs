//! Compile-time views of a rule.

use super::{find_item, load_session};
use anyhow::{Context, Result};
use std::path::Path;

pub fn show_key(config_path: &Path, path: &str) -> Result<()> {
    let mut session = load_session(config_path)?;
    let node = find_item(&session, path)?;
    let key = session
        .canonical_key(node)
        .with_context(|| format!("Failed to compile {}", path))?;
    println!("{}", key);
    Ok(())
}

pub fn show_suppliers(config_path: &Path, path: &str) -> Result<()> {
    let mut session = load_session(config_path)?;
    let node = find_item(&session, path)?;
    let suppliers = session
        .suppliers(node)
        .with_context(|| format!("Failed to compile {}", path))?;
    for supplier in suppliers {
        println!("{}", session.tree().full_name(supplier));
    }
    Ok(())
}
