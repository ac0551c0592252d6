//! Shared fixtures for the engine integration tests

#![allow(dead_code)]

use treecalc_engine::prelude::*;
use treecalc_engine::Config;

/// Cities grouped into regions, with a few derived attributes
pub const CITIES: &str = r#"
items:
  - name: m
    items:
      - name: regions
        kind: unit
        count: 2
        items:
          - name: name
            kind: attribute
            value_type: String
            data: [north, south]
      - name: cities
        kind: unit
        count: 3
        items:
          - name: pop
            kind: attribute
            data: [1.0, 2.0, 3.0]
          - name: region
            kind: attribute
            value_type: UInt32
            values: /m/regions
            data: [1, 0, 1]
          - name: density
            kind: attribute
            expr: "pop * 2"
          - name: regionName
            kind: attribute
            expr: "region->name"
      - name: total
        kind: parameter
        expr: "sum(cities/pop)"
"#;

pub fn load(yaml: &str) -> Session {
    let config = Config::from_yaml_str(yaml).expect("fixture parses");
    Session::from_config(&config).expect("fixture loads")
}

pub fn cities() -> Session {
    load(CITIES)
}

pub fn node(session: &Session, path: &str) -> NodeId {
    session
        .lookup(path)
        .unwrap_or_else(|| panic!("no item {}", path))
}

/// Empty container below `parent`
pub fn container(session: &mut Session, parent: NodeId, name: &str) -> NodeId {
    session
        .create_item(parent, name, NodeKind::Container)
        .expect("live parent")
}

/// Parameter of open type computed by `expr`
pub fn param(session: &mut Session, parent: NodeId, name: &str, expr: &str) -> NodeId {
    let node = session
        .create_item(parent, name, NodeKind::Data(DataMeta::default()))
        .expect("live parent");
    session.set_expr(node, expr).expect("live item");
    node
}

/// Parameter holding one given value
pub fn constant(session: &mut Session, parent: NodeId, name: &str, value: Value) -> NodeId {
    let node = session.create_item(
        parent,
        name,
        NodeKind::Data(DataMeta {
            value_type: Some(value.value_type()),
            ..DataMeta::default()
        }),
    )
    .expect("live parent");
    session
        .set_data(node, Column::scalar(value))
        .expect("constant data");
    node
}

/// Container whose rule is `expr`, for template calls and meta functions
pub fn calculated_container(session: &mut Session, parent: NodeId, name: &str, expr: &str) -> NodeId {
    let node = container(session, parent, name);
    session.set_expr(node, expr).expect("live item");
    node
}

pub fn template(session: &mut Session, parent: NodeId, name: &str) -> NodeId {
    let node = container(session, parent, name);
    session
        .set_prop(node, "IsTemplate", "true")
        .expect("template flag");
    node
}

pub fn floats(session: &mut Session, path: &str) -> Vec<f64> {
    let node = node(session, path);
    match session.read_column(node).expect("column").as_ref() {
        Column::Float64(values) => values.clone(),
        other => panic!("{} is not Float64: {:?}", path, other),
    }
}
