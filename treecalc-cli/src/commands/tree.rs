//! Print the namespace.

use super::load_session;
use anyhow::Result;
use std::path::Path;
use treecalc_engine::{NodeId, NodeKind, Session};

fn describe(session: &Session, node: NodeId) -> String {
    let n = session.tree().node(node);
    let mut line = format!("{} ({}", n.name.as_str(), n.kind.describe());
    match n.kind {
        NodeKind::Unit(info) => {
            line.push_str(&format!(" {}", info.value_type.name()));
            if let Some(count) = info.count {
                line.push_str(&format!(", {} elements", count));
            }
        }
        NodeKind::Data(meta) => {
            if let Some(vt) = meta.value_type {
                line.push_str(&format!(" {}", vt.name()));
            }
        }
        NodeKind::Container => {}
    }
    line.push(')');
    if let Some(expr) = &n.expr {
        line.push_str(&format!(" = {}", expr));
    }
    line
}

fn print_node(session: &Session, node: NodeId, depth: usize) {
    println!("{}{}", "  ".repeat(depth), describe(session, node));
    for child in session.tree().children(node) {
        print_node(session, child, depth + 1);
    }
}

pub fn print_tree(config_path: &Path) -> Result<()> {
    let session = load_session(config_path)?;
    let root = session.config_root();
    for child in session.tree().children(root) {
        print_node(&session, child, 0);
    }
    Ok(())
}
