//! Model configuration
//!
//! A model is a YAML document with an optional `engine:` section and a
//! nested list of `items:`. Item references (`domain`, `values`) are paths
//! relative to the item's parent or absolute from the model root.

use crate::data::{Column, Value};
use crate::props::{set_prop_raw, PropError};
use crate::session::Session;
use crate::tree::{DataMeta, NodeId, NodeKind, UnitInfo};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use treecalc_types::ValueType;

/// Failures while loading a model
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// File that was read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid YAML for a model
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Two siblings share a name
    #[error("Duplicate item: {0}")]
    DuplicateItem(String),

    /// A property in the item could not be applied
    #[error("Item {item}: {source}")]
    Property {
        /// Item name
        item: String,
        /// Why the property was rejected
        #[source]
        source: PropError,
    },

    /// Literal data or an item reference is unusable
    #[error("Item {item}: {message}")]
    InvalidData {
        /// Item name
        item: String,
        /// What is wrong with it
        message: String,
    },
}

/// A parsed model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Engine settings; defaults when absent
    #[serde(default)]
    pub engine: EngineConfig,

    /// Top-level items, created under the model root
    #[serde(default)]
    pub items: Vec<ItemConfig>,
}

impl Config {
    /// Load a model from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Parse a model from YAML text
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Number of items, nested ones included
    pub fn item_count(&self) -> usize {
        fn count(items: &[ItemConfig]) -> usize {
            items.iter().map(|i| 1 + count(&i.items)).sum()
        }
        count(&self.items)
    }
}

/// Engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Elements processed between suspension checkpoints
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Size bound of the payload cache; no cache when absent
    #[serde(default)]
    pub cache_max_bytes: Option<usize>,

    /// Poll the suspension latch; when off every walk runs to completion
    #[serde(default = "default_true")]
    pub suspension: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            cache_max_bytes: None,
            suspension: true,
        }
    }
}

fn default_chunk_size() -> usize {
    4096
}

fn default_true() -> bool {
    true
}

/// What an item entry creates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// Plain grouping node
    #[default]
    Container,
    /// Element domain with an element count
    Unit,
    /// Data item over a domain
    Attribute,
    /// Data item with a single element
    Parameter,
}

/// One item entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemConfig {
    /// Name within the parent
    pub name: String,

    /// Defaults to a container
    #[serde(default)]
    pub kind: ItemKind,

    /// Element type of a unit or data item, e.g. `Float64`
    #[serde(default)]
    pub value_type: Option<String>,

    /// Element count of a unit
    #[serde(default)]
    pub count: Option<u64>,

    /// Path of the unit holding the value type of a data item
    #[serde(default)]
    pub values: Option<String>,

    /// Path of the domain unit of an attribute
    #[serde(default)]
    pub domain: Option<String>,

    /// Rule text
    #[serde(default)]
    pub expr: Option<String>,

    /// Literal payload; `null` entries are undefined
    #[serde(default)]
    pub data: Option<Vec<Option<Scalar>>>,

    /// Name of the storage manager to load from
    #[serde(default)]
    pub storage: Option<String>,

    /// Format hint passed to the storage manager
    #[serde(default)]
    pub storage_type: Option<String>,

    /// Display label
    #[serde(default)]
    pub label: Option<String>,

    /// Free text description
    #[serde(default)]
    pub descr: Option<String>,

    /// Mark the item as a template
    #[serde(default)]
    pub template: bool,

    /// Children
    #[serde(default)]
    pub items: Vec<ItemConfig>,
}

/// A literal element as written in YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// `true` or `false`
    Bool(bool),
    /// Integer literal
    Int(i64),
    /// Number with a fraction or exponent
    Float(f64),
    /// Anything else
    Text(String),
}

impl Scalar {
    fn to_value(&self) -> Value {
        match self {
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(i) => Value::Int64(*i),
            Scalar::Float(f) => Value::Float64(*f),
            Scalar::Text(s) => Value::String(s.clone()),
        }
    }

    fn value_type(&self) -> ValueType {
        match self {
            Scalar::Bool(_) => ValueType::Bool,
            Scalar::Int(_) | Scalar::Float(_) => ValueType::Float64,
            Scalar::Text(_) => ValueType::String,
        }
    }
}

fn parse_value_type(item: &str, name: &str) -> Result<ValueType, ConfigError> {
    ValueType::from_name(name.trim()).ok_or_else(|| ConfigError::Property {
        item: item.to_string(),
        source: PropError::InvalidValue {
            prop: "ValueType".to_string(),
            value: name.to_string(),
        },
    })
}

impl Session {
    /// Build a session holding the items of `config`
    /// Items are created first and configured in a second pass, so
    /// references may point at items declared later.
    pub fn from_config(config: &Config) -> Result<Session, ConfigError> {
        let mut session = Session::new().with_engine(config.engine.clone());
        let root = session.config_root();
        let mut created = Vec::new();
        session.create_config_items(root, &config.items, &mut created)?;
        for (node, item) in &created {
            session.configure_item(*node, item)?;
        }
        debug!(items = created.len(), "model loaded");
        Ok(session)
    }

    fn create_config_items<'c>(
        &mut self,
        parent: NodeId,
        items: &'c [ItemConfig],
        created: &mut Vec<(NodeId, &'c ItemConfig)>,
    ) -> Result<(), ConfigError> {
        for item in items {
            let parent_name = self.tree.full_name(parent);
            let full_name = match parent_name.as_str() {
                "/" => format!("/{}", item.name),
                p => format!("{}/{}", p, item.name),
            };
            if item.name.trim().is_empty() || item.name.contains('/') {
                return Err(ConfigError::InvalidData {
                    item: full_name,
                    message: "item names must be non-empty and contain no '/'".to_string(),
                });
            }
            let exists = treecalc_expr::Symbol::lookup(&item.name)
                .and_then(|sym| self.tree.child(parent, sym))
                .is_some();
            if exists {
                return Err(ConfigError::DuplicateItem(full_name));
            }

            let declared = item
                .value_type
                .as_deref()
                .map(|vt| parse_value_type(&full_name, vt))
                .transpose()?;
            let kind = match item.kind {
                ItemKind::Container => NodeKind::Container,
                ItemKind::Unit => NodeKind::Unit(UnitInfo {
                    value_type: declared.unwrap_or(ValueType::UInt32),
                    count: item.count,
                }),
                ItemKind::Attribute | ItemKind::Parameter => {
                    let inferred = match (&item.expr, &item.data) {
                        (Some(_), _) => None,
                        (None, Some(data)) => Some(
                            data.iter()
                                .flatten()
                                .next()
                                .map_or(ValueType::Float64, Scalar::value_type),
                        ),
                        (None, None) => Some(ValueType::Float64),
                    };
                    NodeKind::Data(DataMeta {
                        value_type: declared.or(inferred),
                        domain: None,
                        values: None,
                    })
                }
            };
            let node = self
                .create_item(parent, &item.name, kind)
                .map_err(|e| ConfigError::InvalidData {
                    item: item.name.clone(),
                    message: e.to_string(),
                })?;
            created.push((node, item));
            self.create_config_items(node, &item.items, created)?;
        }
        Ok(())
    }

    fn configure_item(&mut self, node: NodeId, item: &ItemConfig) -> Result<(), ConfigError> {
        let name = self.tree.full_name(node);
        let prop_error = |source| ConfigError::Property {
            item: name.clone(),
            source,
        };

        if item.kind == ItemKind::Attribute {
            match &item.domain {
                Some(domain) => set_prop_raw(&mut self.tree, node, "Domain", domain).map_err(prop_error)?,
                None => {
                    let parent = self.tree.parent(node);
                    if let Some(unit) = parent.filter(|p| self.tree.node(*p).kind.is_unit()) {
                        if let NodeKind::Data(meta) = &mut self.tree.node_mut(node).kind {
                            meta.domain = Some(unit);
                        }
                    }
                }
            }
        } else if item.domain.is_some() {
            return Err(ConfigError::InvalidData {
                item: name,
                message: format!("a {:?} item has no domain", item.kind).to_lowercase(),
            });
        }

        let props = [
            ("Values", &item.values),
            ("Expr", &item.expr),
            ("Label", &item.label),
            ("Descr", &item.descr),
            ("StorageName", &item.storage),
            ("StorageType", &item.storage_type),
        ];
        for (prop, value) in props {
            if let Some(value) = value {
                set_prop_raw(&mut self.tree, node, prop, value).map_err(prop_error)?;
            }
        }
        self.tree.node_mut(node).flags.is_template = item.template;

        if let Some(data) = &item.data {
            let vt = match self.tree.node(node).kind {
                NodeKind::Unit(info) => info.value_type,
                NodeKind::Data(meta) => meta.value_type.unwrap_or(ValueType::Float64),
                NodeKind::Container => {
                    return Err(ConfigError::InvalidData {
                        item: name,
                        message: "containers hold no data".to_string(),
                    })
                }
            };
            let values: Vec<Value> = data
                .iter()
                .map(|s| match s {
                    Some(s) => s.to_value(),
                    None if vt == ValueType::String => Value::String(String::new()),
                    None => Value::Float64(f64::NAN),
                })
                .collect();
            self.set_data(node, Column::from_values(vt, &values))
                .map_err(|e| ConfigError::InvalidData {
                    item: name.clone(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = r#"
engine:
  chunk_size: 16
items:
  - name: model
    items:
      - name: cities
        kind: unit
        count: 3
        items:
          - name: pop
            kind: attribute
            value_type: Float64
            data: [1.5, 2, null]
      - name: total
        kind: parameter
        expr: "sum(cities/pop)"
"#;

    #[test]
    fn parses_defaults() {
        let config = Config::from_yaml_str(MODEL).unwrap();
        assert_eq!(config.engine.chunk_size, 16);
        assert!(config.engine.suspension);
        assert_eq!(config.engine.cache_max_bytes, None);
        assert_eq!(config.item_count(), 4);
        let cities = &config.items[0].items[0];
        assert_eq!(cities.kind, ItemKind::Unit);
        assert_eq!(
            cities.items[0].data,
            Some(vec![Some(Scalar::Float(1.5)), Some(Scalar::Int(2)), None])
        );
    }

    #[test]
    fn loads_items_with_implicit_domains() {
        let config = Config::from_yaml_str(MODEL).unwrap();
        let session = Session::from_config(&config).unwrap();
        let cities = session.lookup("/model/cities").unwrap();
        let pop = session.lookup("/model/cities/pop").unwrap();
        match session.tree().node(pop).kind {
            NodeKind::Data(meta) => {
                assert_eq!(meta.domain, Some(cities));
                assert_eq!(meta.value_type, Some(ValueType::Float64));
            }
            other => panic!("unexpected kind {:?}", other),
        }
        let total = session.lookup("/model/total").unwrap();
        assert_eq!(session.tree().node(total).expr.as_deref(), Some("sum(cities/pop)"));
    }

    #[test]
    fn rejects_duplicates_and_bad_types() {
        let dup = "items:\n  - name: a\n  - name: a\n";
        let err = Session::from_config(&Config::from_yaml_str(dup).unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateItem(ref n) if n == "/a"));

        let bad = "items:\n  - name: a\n    kind: parameter\n    value_type: Float32\n";
        let err = Session::from_config(&Config::from_yaml_str(bad).unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::Property { .. }));
        assert!(err.to_string().contains("Float32"));
    }

    #[test]
    fn unresolved_domain_is_reported() {
        let yaml = "items:\n  - name: a\n    kind: attribute\n    domain: nowhere\n";
        let err = Session::from_config(&Config::from_yaml_str(yaml).unwrap()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Item /a: Property 'Domain' refers to unknown item 'nowhere'"
        );
    }
}
