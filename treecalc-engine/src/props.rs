//! Property definitions
//!
//! A static table describing the named, string-valued properties of a node.
//! Each entry knows how to read the property, optionally how to write it and
//! how to carry it over when a template is instantiated.

use crate::tree::{CopiedFields, DataMeta, NodeData, NodeId, NodeKind, Tree, UnitInfo};
use treecalc_types::ValueType;

/// Why a property cannot be read or written
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PropError {
    /// No property of that name
    #[error("Unknown property '{0}'")]
    Unknown(String),

    /// The property has no setter, or not for this kind of node
    #[error("Property '{0}' is read-only")]
    ReadOnly(String),

    /// The text does not parse as a value of the property
    #[error("Invalid value '{value}' for property '{prop}'")]
    InvalidValue {
        /// Property name
        prop: String,
        /// Text given
        value: String,
    },

    /// A path-valued property names no item
    #[error("Property '{prop}' refers to unknown item '{path}'")]
    UnresolvedPath {
        /// Property name
        prop: String,
        /// Path given
        path: String,
    },

    /// The node id is stale
    #[error("Item no longer exists")]
    Removed,
}

type Getter = fn(&Tree, NodeId) -> Option<String>;
type Setter = fn(&mut Tree, NodeId, &str) -> Result<(), PropError>;
type Copier = fn(&CopiedFields, &mut NodeData, &dyn Fn(NodeId) -> NodeId);

/// One named property
pub struct PropDef {
    /// Name, matched case-insensitively
    pub name: &'static str,
    /// Current value; `None` when it has its default
    pub get: Getter,
    /// Absent for read-only properties
    pub set: Option<Setter>,
    /// Carries the value over to a copy during template instantiation
    pub copy: Option<Copier>,
}

impl std::fmt::Debug for PropDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropDef")
            .field("name", &self.name)
            .field("settable", &self.set.is_some())
            .field("copyable", &self.copy.is_some())
            .finish()
    }
}

impl PropDef {
    /// Is the property set to something other than its default?
    pub fn has_non_default(&self, tree: &Tree, id: NodeId) -> bool {
        (self.get)(tree, id).is_some()
    }
}

fn opt(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn resolve(tree: &Tree, id: NodeId, prop: &str, path: &str) -> Result<NodeId, PropError> {
    let start = match path.strip_prefix('/') {
        Some(_) => tree.root_of(id),
        None => tree.parent(id).unwrap_or(id),
    };
    tree.walk_path(start, path.trim_start_matches('/'))
        .map_err(|_| PropError::UnresolvedPath {
            prop: prop.to_string(),
            path: path.to_string(),
        })
}

fn data_meta_mut<'a>(tree: &'a mut Tree, id: NodeId, prop: &str) -> Result<&'a mut DataMeta, PropError> {
    match &mut tree.node_mut(id).kind {
        NodeKind::Data(meta) => Ok(meta),
        _ => Err(PropError::ReadOnly(prop.to_string())),
    }
}

/// Every property a node has
pub static PROP_DEFS: &[PropDef] = &[
    PropDef {
        name: "Expr",
        get: |tree, id| tree.node(id).expr.clone().filter(|e| !e.is_empty()),
        set: Some(|tree, id, value| {
            tree.node_mut(id).expr = opt(value);
            Ok(())
        }),
        copy: Some(|src, dst, _| dst.expr = src.expr.clone()),
    },
    PropDef {
        name: "Label",
        get: |tree, id| tree.node(id).label.clone(),
        set: Some(|tree, id, value| {
            tree.node_mut(id).label = opt(value);
            Ok(())
        }),
        copy: Some(|src, dst, _| dst.label = src.label.clone()),
    },
    PropDef {
        name: "Descr",
        get: |tree, id| tree.node(id).descr.clone(),
        set: Some(|tree, id, value| {
            tree.node_mut(id).descr = opt(value);
            Ok(())
        }),
        copy: Some(|src, dst, _| dst.descr = src.descr.clone()),
    },
    PropDef {
        name: "StorageName",
        get: |tree, id| tree.node(id).storage_name.clone(),
        set: Some(|tree, id, value| {
            tree.node_mut(id).storage_name = opt(value);
            Ok(())
        }),
        copy: Some(|src, dst, _| dst.storage_name = src.storage_name.clone()),
    },
    PropDef {
        name: "StorageType",
        get: |tree, id| tree.node(id).storage_type.clone(),
        set: Some(|tree, id, value| {
            tree.node_mut(id).storage_type = opt(value);
            Ok(())
        }),
        copy: Some(|src, dst, _| dst.storage_type = src.storage_type.clone()),
    },
    PropDef {
        name: "ValueType",
        get: |tree, id| match tree.node(id).kind {
            NodeKind::Unit(info) => Some(info.value_type.name().to_string()),
            NodeKind::Data(meta) => meta.value_type.map(|vt| vt.name().to_string()),
            NodeKind::Container => None,
        },
        set: Some(|tree, id, value| {
            let vt = ValueType::from_name(value.trim()).ok_or_else(|| PropError::InvalidValue {
                prop: "ValueType".into(),
                value: value.to_string(),
            })?;
            match &mut tree.node_mut(id).kind {
                NodeKind::Unit(info) => info.value_type = vt,
                NodeKind::Data(meta) => meta.value_type = Some(vt),
                NodeKind::Container => return Err(PropError::ReadOnly("ValueType".into())),
            }
            Ok(())
        }),
        copy: Some(|src, dst, _| match (&src.kind, &mut dst.kind) {
            (NodeKind::Unit(s), NodeKind::Unit(d)) => d.value_type = s.value_type,
            (NodeKind::Data(s), NodeKind::Data(d)) => d.value_type = s.value_type,
            _ => {}
        }),
    },
    PropDef {
        name: "Domain",
        get: |tree, id| match tree.node(id).kind {
            NodeKind::Data(DataMeta { domain: Some(d), .. }) => Some(tree.full_name(d)),
            _ => None,
        },
        set: Some(|tree, id, value| {
            let target = resolve(tree, id, "Domain", value.trim())?;
            data_meta_mut(tree, id, "Domain")?.domain = Some(target);
            Ok(())
        }),
        copy: Some(|src, dst, remap| {
            if let (NodeKind::Data(s), NodeKind::Data(d)) = (&src.kind, &mut dst.kind) {
                d.domain = s.domain.map(remap);
            }
        }),
    },
    PropDef {
        name: "Values",
        get: |tree, id| match tree.node(id).kind {
            NodeKind::Data(DataMeta { values: Some(v), .. }) => Some(tree.full_name(v)),
            _ => None,
        },
        set: Some(|tree, id, value| {
            let target = resolve(tree, id, "Values", value.trim())?;
            data_meta_mut(tree, id, "Values")?.values = Some(target);
            Ok(())
        }),
        copy: Some(|src, dst, remap| {
            if let (NodeKind::Data(s), NodeKind::Data(d)) = (&src.kind, &mut dst.kind) {
                d.values = s.values.map(remap);
            }
        }),
    },
    PropDef {
        name: "Count",
        get: |tree, id| match tree.node(id).kind {
            NodeKind::Unit(UnitInfo { count: Some(n), .. }) => Some(n.to_string()),
            _ => None,
        },
        set: Some(|tree, id, value| {
            let n = value.trim().parse::<u64>().map_err(|_| PropError::InvalidValue {
                prop: "Count".into(),
                value: value.to_string(),
            })?;
            match &mut tree.node_mut(id).kind {
                NodeKind::Unit(info) => info.count = Some(n),
                _ => return Err(PropError::ReadOnly("Count".into())),
            }
            Ok(())
        }),
        copy: Some(|src, dst, _| {
            if let (NodeKind::Unit(s), NodeKind::Unit(d)) = (&src.kind, &mut dst.kind) {
                d.count = s.count;
            }
        }),
    },
    PropDef {
        name: "IsTemplate",
        get: |tree, id| tree.node(id).flags.is_template.then(|| "true".to_string()),
        set: Some(|tree, id, value| {
            let flag = match value.trim() {
                "true" | "1" => true,
                "false" | "0" | "" => false,
                other => {
                    return Err(PropError::InvalidValue {
                        prop: "IsTemplate".into(),
                        value: other.to_string(),
                    })
                }
            };
            tree.node_mut(id).flags.is_template = flag;
            Ok(())
        }),
        copy: Some(|src, dst, _| dst.flags.is_template = src.is_template),
    },
    PropDef {
        name: "FullName",
        get: |tree, id| Some(tree.full_name(id)),
        set: None,
        copy: None,
    },
    PropDef {
        name: "FailReason",
        get: |tree, id| tree.node(id).fail.as_ref().map(|f| f.error.to_string()),
        set: None,
        copy: None,
    },
];

/// Definition of the property `name`
pub fn find_prop_def(name: &str) -> Option<&'static PropDef> {
    PROP_DEFS.iter().find(|d| d.name.eq_ignore_ascii_case(name))
}

/// Read a property by name
pub fn get_prop(tree: &Tree, id: NodeId, name: &str) -> Result<Option<String>, PropError> {
    let def = find_prop_def(name).ok_or_else(|| PropError::Unknown(name.to_string()))?;
    if !tree.contains(id) {
        return Err(PropError::Removed);
    }
    Ok((def.get)(tree, id))
}

/// Write a property by name, without any invalidation
pub fn set_prop_raw(tree: &mut Tree, id: NodeId, name: &str, value: &str) -> Result<(), PropError> {
    let def = find_prop_def(name).ok_or_else(|| PropError::Unknown(name.to_string()))?;
    let set = def.set.ok_or_else(|| PropError::ReadOnly(def.name.to_string()))?;
    if !tree.contains(id) {
        return Err(PropError::Removed);
    }
    set(tree, id, value)
}
