//! CLI command implementations.

pub mod check;
pub mod eval;
pub mod inspect;
pub mod tree;

pub use check::check_model;
pub use eval::eval_item;
pub use inspect::{show_key, show_suppliers};
pub use tree::print_tree;

use anyhow::{Context, Result};
use std::path::Path;
use treecalc_engine::{Config, NodeId, Session};

/// Load the model at `config_path` into a fresh session
pub(crate) fn load_session(config_path: &Path) -> Result<Session> {
    let config = Config::from_file(config_path).context("Failed to load model")?;
    let session = Session::from_config(&config)
        .with_context(|| format!("Failed to build model from {}", config_path.display()))?;
    tracing::debug!(items = config.item_count(), "model ready");
    Ok(session)
}

pub(crate) fn find_item(session: &Session, path: &str) -> Result<NodeId> {
    session
        .lookup(path)
        .with_context(|| format!("No item named {}", path))
}
