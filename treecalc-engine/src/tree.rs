//! Node tree
//!
//! Nodes live in a generational arena and link to each other by [`NodeId`].
//! A node has at most one parent, set at creation, so walking up the parent
//! chain always terminates. The arena holds several roots: the configuration
//! root, one cache root per memoized operator result and one default unit per
//! value type.

use crate::calc::Compiled;
use crate::data::{new_slot, DataSlot};
use crate::error::FailRecord;
use crate::interest::InterestCount;
use crate::props::PROP_DEFS;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use treecalc_expr::Symbol;
use treecalc_types::{Timestamp, ValueType};

/// Stable handle on a node; stale after the node is removed
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// Slot index; reused after removal
    pub fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}v{}", self.index, self.generation)
    }
}

/// Description of an element domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitInfo {
    /// Type of the element ids
    pub value_type: ValueType,
    /// Number of elements when known up front
    pub count: Option<u64>,
}

/// Typing of a data item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataMeta {
    /// Declared element type; calculated items may leave it open
    pub value_type: Option<ValueType>,
    /// Entity the values are indexed by; `None` for parameters
    pub domain: Option<NodeId>,
    /// Unit the values refer to, used by arrow lookups
    pub values: Option<NodeId>,
}

/// What a node is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Groups other items
    Container,
    /// Element domain
    Unit(UnitInfo),
    /// Attribute or parameter
    Data(DataMeta),
}

impl NodeKind {
    /// Is this a unit?
    pub fn is_unit(&self) -> bool {
        matches!(self, NodeKind::Unit(_))
    }

    /// Is this a data item?
    pub fn is_data(&self) -> bool {
        matches!(self, NodeKind::Data(_))
    }

    /// Word used in messages
    pub fn describe(&self) -> &'static str {
        match self {
            NodeKind::Container => "container",
            NodeKind::Unit(_) => "unit",
            NodeKind::Data(_) => "attribute",
        }
    }
}

/// Marks on a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFlags {
    /// Instantiated, never calculated itself
    pub is_template: bool,
    /// Created by a meta function or template instantiation
    pub endogenous: bool,
    /// Result node owned by a DataController
    pub cache_item: bool,
    /// Template children were copied in
    pub instantiated: bool,
}

/// A node of the item tree
#[derive(Debug)]
pub struct NodeData {
    /// Unique among siblings
    pub name: Symbol,
    /// Set at creation
    pub kind: NodeKind,
    parent: Option<NodeId>,
    first_child: Option<NodeId>,
    last_child: Option<NodeId>,
    next_sibling: Option<NodeId>,
    /// Raw calculation rule
    pub expr: Option<String>,
    /// Template and generation marks
    pub flags: NodeFlags,
    /// Display label
    pub label: Option<String>,
    /// Description
    pub descr: Option<String>,
    /// Storage manager the payload is read from
    pub storage_name: Option<String>,
    /// Format hint for the storage manager
    pub storage_type: Option<String>,
    /// Memoized failure
    pub fail: Option<FailRecord>,
    /// Keeps the payload alive
    pub interest: InterestCount,
    /// Last change of the rule or of anything it was compiled from
    pub meta_changed: Timestamp,
    /// Last change of the payload
    pub data_changed: Timestamp,
    /// Cached compile result
    pub compiled: Option<Rc<Compiled>>,
    /// Fixed compile result of an instantiated template parameter
    pub preset: Option<Rc<Compiled>>,
    /// Payload
    pub data: DataSlot,
    /// The payload was loaded, not computed
    pub data_from_storage: bool,
}

impl NodeData {
    fn new(name: Symbol, kind: NodeKind, parent: Option<NodeId>, now: Timestamp) -> Self {
        Self {
            name,
            kind,
            parent,
            first_child: None,
            last_child: None,
            next_sibling: None,
            expr: None,
            flags: NodeFlags::default(),
            label: None,
            descr: None,
            storage_name: None,
            storage_type: None,
            fail: None,
            interest: InterestCount::new(),
            meta_changed: now,
            data_changed: now,
            compiled: None,
            preset: None,
            data: new_slot(),
            data_from_storage: false,
        }
    }

    /// `None` for roots
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Has a non-empty calculation rule
    pub fn has_calculator(&self) -> bool {
        self.preset.is_some() || self.expr.as_deref().is_some_and(|e| !e.trim().is_empty())
    }

    /// Has a storage to read from
    pub fn is_loadable(&self) -> bool {
        self.storage_name.is_some()
    }
}

struct Slot {
    generation: u32,
    node: Option<NodeData>,
}

/// Options for copying a template's children
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyTreeContext {
    /// Mark the copies as generated
    pub endogenous: bool,
    /// Change stamp of the copies
    pub now: Timestamp,
}

/// Arena of nodes, addressed by generational ids
pub struct Tree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    roots: Vec<NodeId>,
    default_units: Vec<NodeId>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// Tree holding only the default units
    pub fn new() -> Self {
        let mut tree = Self {
            slots: Vec::new(),
            free: Vec::new(),
            roots: Vec::new(),
            default_units: Vec::with_capacity(ValueType::ALL.len()),
        };
        for vt in ValueType::ALL {
            let name = format!("#{}", vt.name());
            let unit = tree.create_root(
                &name,
                NodeKind::Unit(UnitInfo {
                    value_type: vt,
                    count: None,
                }),
            );
            tree.default_units.push(unit);
        }
        tree
    }

    fn alloc(&mut self, data: NodeData) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(data);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(data),
                });
                NodeId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// New parentless node
    pub fn create_root(&mut self, name: &str, kind: NodeKind) -> NodeId {
        let id = self.alloc(NodeData::new(Symbol::intern(name), kind, None, Timestamp::ZERO));
        self.roots.push(id);
        id
    }

    /// Parentless nodes, in creation order
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Unit standing for "any value of this type"
    pub fn default_unit(&self, vt: ValueType) -> NodeId {
        let pos = ValueType::ALL.iter().position(|t| *t == vt).unwrap_or(0);
        self.default_units[pos]
    }

    /// Value type `id` stands for, if it is a default unit
    pub fn is_default_unit(&self, id: NodeId) -> Option<ValueType> {
        self.default_units
            .iter()
            .position(|u| *u == id)
            .map(|pos| ValueType::ALL[pos])
    }

    /// Get or create the child `name` of `parent`
    ///
    /// An existing child keeps its kind.
    pub fn create_item(&mut self, parent: NodeId, name: &str, kind: NodeKind, now: Timestamp) -> NodeId {
        let sym = Symbol::intern(name);
        if let Some(existing) = self.child(parent, sym) {
            return existing;
        }
        let id = self.alloc(NodeData::new(sym, kind, Some(parent), now));
        let prev_last = self.node(parent).last_child;
        match prev_last {
            Some(last) => self.node_mut(last).next_sibling = Some(id),
            None => self.node_mut(parent).first_child = Some(id),
        }
        self.node_mut(parent).last_child = Some(id);
        id
    }

    /// Is `id` live?
    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// `None` for a stale id
    pub fn get(&self, id: NodeId) -> Option<&NodeData> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    /// `None` for a stale id
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut NodeData> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    /// Panics on a stale id
    pub fn node(&self, id: NodeId) -> &NodeData {
        match self.get(id) {
            Some(node) => node,
            None => panic!("stale node id {:?}", id),
        }
    }

    /// Panics on a stale id
    pub fn node_mut(&mut self, id: NodeId) -> &mut NodeData {
        match self.get_mut(id) {
            Some(node) => node,
            None => panic!("stale node id {:?}", id),
        }
    }

    /// Parent of `id`; `None` for roots and stale ids
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).and_then(|n| n.parent)
    }

    /// Child of `parent` named `name`
    pub fn child(&self, parent: NodeId, name: Symbol) -> Option<NodeId> {
        self.children(parent).find(|c| self.node(*c).name == name)
    }

    /// Children in creation order; empty for a stale id
    pub fn children(&self, parent: NodeId) -> Children<'_> {
        Children {
            tree: self,
            next: self.get(parent).and_then(|n| n.first_child),
        }
    }

    /// Root of the tree containing `id`
    pub fn root_of(&self, id: NodeId) -> NodeId {
        let mut cur = id;
        while let Some(p) = self.parent(cur) {
            cur = p;
        }
        cur
    }

    /// Slash separated path from the root; the root's own name is omitted
    /// when empty
    pub fn full_name(&self, id: NodeId) -> String {
        let Some(node) = self.get(id) else {
            return "<removed>".to_string();
        };
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            let n = self.node(c);
            if n.parent.is_some() || !n.name.as_str().is_empty() {
                parts.push(n.name.as_str());
            }
            cur = n.parent;
        }
        if parts.is_empty() {
            debug_assert!(node.parent.is_none());
            return "/".to_string();
        }
        let mut out = String::new();
        for part in parts.iter().rev() {
            out.push('/');
            out.push_str(part);
        }
        out
    }

    /// Does `ancestor` contain `id` (or equal it)?
    pub fn does_contain(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut cur = Some(id);
        while let Some(c) = cur {
            if c == ancestor {
                return true;
            }
            cur = self.parent(c);
        }
        false
    }

    /// Nearest template at or above `id`
    pub fn in_template(&self, id: NodeId) -> Option<NodeId> {
        let mut cur = Some(id);
        while let Some(c) = cur {
            let n = self.node(c);
            if n.flags.is_template {
                return Some(c);
            }
            cur = n.parent;
        }
        None
    }

    /// Follow a relative path strictly downwards (with `..` steps up)
    ///
    /// On failure returns the deepest node reached and the number of
    /// components resolved.
    pub fn walk_path(&self, start: NodeId, path: &str) -> Result<NodeId, (NodeId, usize)> {
        let mut cur = start;
        for (i, part) in path.split('/').filter(|p| !p.is_empty()).enumerate() {
            let next = match part {
                "." => Some(cur),
                ".." => self.parent(cur),
                name => Symbol::lookup(name).and_then(|sym| self.child(cur, sym)),
            };
            match next {
                Some(n) => cur = n,
                None => return Err((cur, i)),
            }
        }
        Ok(cur)
    }

    /// Preorder list of `id` and everything below it
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            out.push(cur);
            let mut kids: Vec<NodeId> = self.children(cur).collect();
            kids.reverse();
            stack.extend(kids);
        }
        out
    }

    /// Unlink `id` from its parent and free it with all descendants
    pub fn remove_subtree(&mut self, id: NodeId) -> usize {
        if !self.contains(id) {
            return 0;
        }
        if let Some(parent) = self.node(id).parent {
            self.unlink(parent, id);
        } else {
            self.roots.retain(|r| *r != id);
        }
        let doomed = self.descendants(id);
        for d in &doomed {
            let slot = &mut self.slots[d.index as usize];
            slot.node = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(d.index);
        }
        doomed.len()
    }

    fn unlink(&mut self, parent: NodeId, id: NodeId) {
        let next = self.node(id).next_sibling;
        let mut prev = None;
        let mut cur = self.node(parent).first_child;
        while let Some(c) = cur {
            if c == id {
                break;
            }
            prev = Some(c);
            cur = self.node(c).next_sibling;
        }
        match prev {
            Some(p) => self.node_mut(p).next_sibling = next,
            None => self.node_mut(parent).first_child = next,
        }
        if self.node(parent).last_child == Some(id) {
            self.node_mut(parent).last_child = prev;
        }
    }

    /// Copy the children of `src` below `dst`, remapping references that
    /// point inside `src` to their copies. Returns the (source, copy) pairs.
    pub fn copy_children(&mut self, src: NodeId, dst: NodeId, ctx: CopyTreeContext) -> Vec<(NodeId, NodeId)> {
        let mut map: HashMap<NodeId, NodeId> = HashMap::new();
        map.insert(src, dst);
        let mut pairs = Vec::new();
        for s in self.descendants(src).into_iter().skip(1) {
            let Some(parent) = self.parent(s) else { continue };
            let Some(&target_parent) = map.get(&parent) else { continue };
            let (name, kind) = {
                let n = self.node(s);
                (n.name, n.kind)
            };
            let copy = self.create_item(target_parent, &name.as_str(), kind, ctx.now);
            map.insert(s, copy);
            pairs.push((s, copy));
        }
        let remap = |id: NodeId| map.get(&id).copied().unwrap_or(id);
        for (s, copy) in &pairs {
            let (source_fields, slot) = {
                let n = self.node(*s);
                (CopiedFields::from(n), n.data.clone())
            };
            let target = self.node_mut(*copy);
            for def in PROP_DEFS {
                if let Some(copy_fn) = def.copy {
                    copy_fn(&source_fields, target, &remap);
                }
            }
            if let Some(column) = slot.read().clone() {
                *target.data.write() = Some(column);
            }
            target.flags.endogenous = ctx.endogenous;
            target.meta_changed = ctx.now;
            target.data_changed = ctx.now;
        }
        pairs
    }

    /// Every live node, in arena order
    pub fn ids(&self) -> Vec<NodeId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.node.is_some())
            .map(|(i, s)| NodeId {
                index: i as u32,
                generation: s.generation,
            })
            .collect()
    }

    /// Live nodes, default units included
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// No nodes?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("nodes", &self.len())
            .field("roots", &self.roots.len())
            .finish()
    }
}

/// Snapshot of the copyable fields of a node, read before the copy target
/// is borrowed mutably
#[derive(Debug, Clone)]
pub struct CopiedFields {
    /// Kind
    pub kind: NodeKind,
    /// Rule
    pub expr: Option<String>,
    /// Label
    pub label: Option<String>,
    /// Description
    pub descr: Option<String>,
    /// Storage name
    pub storage_name: Option<String>,
    /// Storage format
    pub storage_type: Option<String>,
    /// Template mark
    pub is_template: bool,
}

impl From<&NodeData> for CopiedFields {
    fn from(n: &NodeData) -> Self {
        Self {
            kind: n.kind,
            expr: n.expr.clone(),
            label: n.label.clone(),
            descr: n.descr.clone(),
            storage_name: n.storage_name.clone(),
            storage_type: n.storage_type.clone(),
            is_template: n.flags.is_template,
        }
    }
}

/// Iterator over the children of a node
#[derive(Debug)]
pub struct Children<'a> {
    tree: &'a Tree,
    next: Option<NodeId>,
}

impl Iterator for Children<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let cur = self.next?;
        self.next = self.tree.get(cur).and_then(|n| n.next_sibling);
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Tree, NodeId) {
        let mut tree = Tree::new();
        let root = tree.create_root("", NodeKind::Container);
        (tree, root)
    }

    #[test]
    fn create_is_get_or_create() {
        let (mut tree, root) = sample();
        let a = tree.create_item(root, "a", NodeKind::Container, Timestamp::ZERO);
        let again = tree.create_item(root, "a", NodeKind::Container, Timestamp::ZERO);
        assert_eq!(a, again);
        assert_eq!(tree.children(root).count(), 1);
    }

    #[test]
    fn full_names_and_paths() {
        let (mut tree, root) = sample();
        let a = tree.create_item(root, "a", NodeKind::Container, Timestamp::ZERO);
        let b = tree.create_item(a, "b", NodeKind::Data(DataMeta::default()), Timestamp::ZERO);
        assert_eq!(tree.full_name(root), "/");
        assert_eq!(tree.full_name(b), "/a/b");
        assert_eq!(tree.walk_path(root, "a/b"), Ok(b));
        assert_eq!(tree.walk_path(b, "../b"), Ok(b));
        assert_eq!(tree.walk_path(root, "a/x/y"), Err((a, 1)));
        assert!(tree.does_contain(a, b));
        assert!(!tree.does_contain(b, a));
    }

    #[test]
    fn removal_invalidates_ids_and_unlinks() {
        let (mut tree, root) = sample();
        let a = tree.create_item(root, "a", NodeKind::Container, Timestamp::ZERO);
        let b = tree.create_item(root, "b", NodeKind::Container, Timestamp::ZERO);
        let c = tree.create_item(a, "c", NodeKind::Container, Timestamp::ZERO);
        assert_eq!(tree.remove_subtree(a), 2);
        assert!(!tree.contains(a));
        assert!(!tree.contains(c));
        assert_eq!(tree.children(root).collect::<Vec<_>>(), vec![b]);

        let d = tree.create_item(root, "d", NodeKind::Container, Timestamp::ZERO);
        assert_ne!(d, a);
        assert_eq!(tree.children(root).collect::<Vec<_>>(), vec![b, d]);
    }

    #[test]
    fn copy_remaps_internal_references() {
        let (mut tree, root) = sample();
        let tmpl = tree.create_item(root, "tmpl", NodeKind::Container, Timestamp::ZERO);
        let unit = tree.create_item(
            tmpl,
            "u",
            NodeKind::Unit(UnitInfo {
                value_type: ValueType::UInt32,
                count: Some(3),
            }),
            Timestamp::ZERO,
        );
        let attr = tree.create_item(
            tmpl,
            "v",
            NodeKind::Data(DataMeta {
                value_type: Some(ValueType::Float64),
                domain: Some(unit),
                values: None,
            }),
            Timestamp::ZERO,
        );
        tree.node_mut(attr).expr = Some("1.0".into());
        let inst = tree.create_item(root, "inst", NodeKind::Container, Timestamp::ZERO);
        let pairs = tree.copy_children(
            tmpl,
            inst,
            CopyTreeContext {
                endogenous: true,
                now: Timestamp(2),
            },
        );
        assert_eq!(pairs.len(), 2);
        let new_unit = tree.child(inst, Symbol::intern("u")).unwrap();
        let new_attr = tree.child(inst, Symbol::intern("v")).unwrap();
        match tree.node(new_attr).kind {
            NodeKind::Data(meta) => assert_eq!(meta.domain, Some(new_unit)),
            other => panic!("unexpected kind {:?}", other),
        }
        assert_eq!(tree.node(new_attr).expr.as_deref(), Some("1.0"));
        assert!(tree.node(new_attr).flags.endogenous);
    }

    #[test]
    fn default_units_exist_per_type() {
        let tree = Tree::new();
        let u = tree.default_unit(ValueType::Int32);
        assert_eq!(tree.is_default_unit(u), Some(ValueType::Int32));
        assert_eq!(tree.full_name(u), "/#Int32");
    }
}
