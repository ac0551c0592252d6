//! Compute an item.

use super::{find_item, load_session};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use treecalc_engine::{Column, MetricsSnapshot, Value};

#[derive(Serialize)]
struct EvalOutput<'a> {
    item: String,
    #[serde(rename = "type")]
    value_type: &'a str,
    values: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<MetricsSnapshot>,
}

fn json_value(value: Value) -> serde_json::Value {
    if !value.is_defined() {
        return serde_json::Value::Null;
    }
    match value {
        Value::Bool(v) => v.into(),
        Value::UInt16(v) => v.into(),
        Value::UInt32(v) => v.into(),
        Value::Int32(v) => v.into(),
        Value::Int64(v) => v.into(),
        Value::Float64(v) => v.into(),
        Value::String(v) => v.into(),
    }
}

fn values(column: &Column) -> impl Iterator<Item = Value> + '_ {
    (0..column.len()).filter_map(|i| column.get(i))
}

pub fn eval_item(config_path: &Path, path: &str, json: bool, stats: bool) -> Result<()> {
    let mut session = load_session(config_path)?;
    let node = find_item(&session, path)?;
    let column = session
        .read_column(node)
        .with_context(|| format!("Failed to compute {}", path))?;
    let metrics = stats.then(|| session.metrics());

    if json {
        let output = EvalOutput {
            item: session.tree().full_name(node),
            value_type: column.value_type().name(),
            values: values(&column).map(json_value).collect(),
            stats: metrics,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        let shown: Vec<String> = values(&column).map(|v| v.to_string()).collect();
        println!(
            "{}: {} [{}]",
            session.tree().full_name(node),
            column.value_type().name(),
            shown.join(", ")
        );
        if let Some(metrics) = metrics {
            println!("{}", metrics);
        }
    }
    Ok(())
}
