//! Server-side arena of state nodes.
//!
//! Nodes reference each other only by [`NodeId`]. A node is visible to the client exactly while it
//! is reachable from the root through namespace slots, so (re-)parenting is a pure data update.
//!
//! The tree performs no locking. Callers that mutate it from multiple threads have to serialize
//! access per session themselves.

use crate::{
	change::NodeChange,
	error::TreeError,
	namespace::{ChangeTracking, ListNamespace, MapNamespace, Namespace, NamespaceKind, Slot},
	value_type::{TypeId, ARRAY, OBJECT},
};
use hashbrown::{HashMap, HashSet};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, error, instrument, trace};

pub type NodeId = u32;
pub type NamespaceId = u32;

/// The id of the root node, which is shared with the client before any change is sent.
pub const ROOT: NodeId = 1;

/// The read-only view of a slot's content.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
	Value(Value),
	Node(NodeId),
}

impl From<&Slot> for StateValue {
	fn from(slot: &Slot) -> Self {
		match slot {
			Slot::Value(value) => StateValue::Value(value.clone()),
			Slot::Map(node) | Slot::List(node) => StateValue::Node(*node),
		}
	}
}

/// One unit of synchronized state.
#[derive(Debug)]
pub struct StateNode {
	id: NodeId,
	type_id: TypeId,
	parent: Option<NodeId>,
	namespaces: BTreeMap<NamespaceId, Namespace>,
	/// Whether the client currently knows this node.
	sent: bool,
}

impl StateNode {
	#[must_use]
	pub fn id(&self) -> NodeId {
		self.id
	}

	#[must_use]
	pub fn type_id(&self) -> TypeId {
		self.type_id
	}

	#[must_use]
	pub fn parent(&self) -> Option<NodeId> {
		self.parent
	}

	#[must_use]
	pub fn namespace(&self, id: NamespaceId) -> Option<&Namespace> {
		self.namespaces.get(&id)
	}

	#[must_use]
	pub fn is_list(&self) -> bool {
		self.namespaces.values().any(|namespace| namespace.kind() == NamespaceKind::List)
	}

	pub fn for_each_child(&self, mut action: impl FnMut(NodeId)) {
		for namespace in self.namespaces.values() {
			namespace.for_each_child(&mut action);
		}
	}

	fn slot_for(&self) -> fn(NodeId) -> Slot {
		if self.is_list() {
			Slot::List
		} else {
			Slot::Map
		}
	}
}

/// Arena of [`StateNode`]s with a fixed root.
#[derive(Debug)]
pub struct StateTree {
	nodes: HashMap<NodeId, StateNode>,
	next_id: NodeId,
}

impl Default for StateTree {
	fn default() -> Self {
		Self::new()
	}
}

impl StateTree {
	/// Creates a tree holding only the [`ROOT`] node, which has one map namespace (`0`).
	#[must_use]
	pub fn new() -> Self {
		let mut nodes = HashMap::new();
		let mut namespaces = BTreeMap::new();
		namespaces.insert(0, Namespace::new(NamespaceKind::Map));
		nodes.insert(
			ROOT,
			StateNode {
				id: ROOT,
				type_id: OBJECT,
				parent: None,
				namespaces,
				sent: true,
			},
		);
		Self { nodes, next_id: ROOT + 1 }
	}

	#[must_use]
	pub fn root(&self) -> NodeId {
		ROOT
	}

	#[must_use]
	pub fn node(&self, id: NodeId) -> Option<&StateNode> {
		self.nodes.get(&id)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	/// Creates a detached node.
	///
	/// # Errors
	///
	/// Iff more than one list namespace is requested.
	#[instrument(skip(self, namespaces))]
	pub fn create_node(&mut self, type_id: TypeId, namespaces: impl IntoIterator<Item = (NamespaceId, NamespaceKind)>) -> Result<NodeId, TreeError> {
		let id = self.next_id;
		let mut map = BTreeMap::new();
		let mut lists = 0;
		for (namespace_id, kind) in namespaces {
			if kind == NamespaceKind::List {
				lists += 1;
			}
			map.insert(namespace_id, Namespace::new(kind));
		}
		if lists > 1 {
			return Err(TreeError::MultipleListNamespaces(id));
		}
		self.next_id += 1;
		self.nodes.insert(
			id,
			StateNode {
				id,
				type_id,
				parent: None,
				namespaces: map,
				sent: false,
			},
		);
		trace!("Created state node {}.", id);
		Ok(id)
	}

	/// Creates a detached node with a single map namespace `0`.
	pub fn create_map_node(&mut self, type_id: TypeId) -> NodeId {
		self.create_node(type_id, [(0, NamespaceKind::Map)]).unwrap_or_else(|_| unreachable!())
	}

	/// Creates a detached node with a single list namespace `0`.
	pub fn create_list_node(&mut self) -> NodeId {
		self.create_node(ARRAY, [(0, NamespaceKind::List)]).unwrap_or_else(|_| unreachable!())
	}

	fn node_mut(&mut self, id: NodeId) -> Result<&mut StateNode, TreeError> {
		self.nodes.get_mut(&id).ok_or(TreeError::UnknownNode(id))
	}

	fn map(&self, node: NodeId, namespace: NamespaceId) -> Result<&MapNamespace, TreeError> {
		match self.nodes.get(&node).ok_or(TreeError::UnknownNode(node))?.namespaces.get(&namespace) {
			Some(Namespace::Map(map)) => Ok(map),
			Some(Namespace::List(_)) => Err(TreeError::WrongNamespaceKind { node, namespace, expected: "map" }),
			None => Err(TreeError::UnknownNamespace { node, namespace }),
		}
	}

	fn map_mut(&mut self, node: NodeId, namespace: NamespaceId) -> Result<&mut MapNamespace, TreeError> {
		match self.node_mut(node)?.namespaces.get_mut(&namespace) {
			Some(Namespace::Map(map)) => Ok(map),
			Some(Namespace::List(_)) => Err(TreeError::WrongNamespaceKind { node, namespace, expected: "map" }),
			None => Err(TreeError::UnknownNamespace { node, namespace }),
		}
	}

	fn list(&self, node: NodeId, namespace: NamespaceId) -> Result<&ListNamespace, TreeError> {
		match self.nodes.get(&node).ok_or(TreeError::UnknownNode(node))?.namespaces.get(&namespace) {
			Some(Namespace::List(list)) => Ok(list),
			Some(Namespace::Map(_)) => Err(TreeError::WrongNamespaceKind { node, namespace, expected: "list" }),
			None => Err(TreeError::UnknownNamespace { node, namespace }),
		}
	}

	fn list_mut(&mut self, node: NodeId, namespace: NamespaceId) -> Result<&mut ListNamespace, TreeError> {
		match self.node_mut(node)?.namespaces.get_mut(&namespace) {
			Some(Namespace::List(list)) => Ok(list),
			Some(Namespace::Map(_)) => Err(TreeError::WrongNamespaceKind { node, namespace, expected: "list" }),
			None => Err(TreeError::UnknownNamespace { node, namespace }),
		}
	}

	/// Checks that `child` may become a child of `parent` and returns the slot to store it in.
	fn attachable(&self, parent: NodeId, child: NodeId) -> Result<Slot, TreeError> {
		let child_node = self.nodes.get(&child).ok_or(TreeError::UnknownNode(child))?;
		if let Some(current) = child_node.parent {
			return Err(TreeError::AlreadyAttached { child, parent: current });
		}
		if child == ROOT {
			return Err(TreeError::Cycle { child, parent });
		}
		let mut ancestor = Some(parent);
		while let Some(id) = ancestor {
			if id == child {
				return Err(TreeError::Cycle { child, parent });
			}
			ancestor = self.nodes.get(&id).and_then(|node| node.parent);
		}
		Ok(child_node.slot_for()(child))
	}

	fn attach(&mut self, parent: NodeId, child: NodeId) {
		if let Some(node) = self.nodes.get_mut(&child) {
			debug_assert!(node.parent.is_none());
			node.parent = Some(parent);
		}
	}

	fn detach_potential_child(&mut self, parent: NodeId, slot: Option<&Slot>) {
		let child = match slot.and_then(Slot::child) {
			Some(child) => child,
			None => return,
		};
		let node = match self.nodes.get_mut(&child) {
			Some(node) => node,
			None => return error!("Detached child {} of {} is not part of the tree.", child, parent),
		};
		if node.parent != Some(parent) {
			if cfg!(debug_assertions) {
				panic!("twig-dom bug: Detaching state node {} from {}, but its parent is {:?}", child, parent, node.parent);
			} else {
				// Leave the foreign parent pointer intact.
				return error!("Invariant violation: Detaching state node {} from {}, but its parent is {:?}. Ignoring.", child, parent, node.parent);
			}
		}
		node.parent = None;
	}

	/// # Errors
	///
	/// Iff the namespace doesn't exist or isn't a map.
	pub fn put(&mut self, node: NodeId, namespace: NamespaceId, key: impl Into<String>, value: impl Into<Value>) -> Result<(), TreeError> {
		let replaced = self.map_mut(node, namespace)?.put(key.into(), Slot::Value(value.into()));
		self.detach_potential_child(node, replaced.as_ref());
		Ok(())
	}

	/// Stores `child` under `key`, making `node` its parent.
	///
	/// # Errors
	///
	/// Iff the namespace doesn't exist or isn't a map, or `child` can't be attached here.
	#[instrument(skip(self, key))]
	pub fn put_node(&mut self, node: NodeId, namespace: NamespaceId, key: impl Into<String>, child: NodeId) -> Result<(), TreeError> {
		let key = key.into();
		if let Some(Slot::Map(existing) | Slot::List(existing)) = self.map(node, namespace)?.get(&key) {
			if *existing == child {
				return Ok(());
			}
		}
		let slot = self.attachable(node, child)?;
		let replaced = self.map_mut(node, namespace)?.put(key, slot);
		self.detach_potential_child(node, replaced.as_ref());
		self.attach(node, child);
		Ok(())
	}

	/// Removes `key`, detaching a child node stored there.
	///
	/// # Errors
	///
	/// Iff the namespace doesn't exist or isn't a map.
	pub fn remove(&mut self, node: NodeId, namespace: NamespaceId, key: &str) -> Result<Option<StateValue>, TreeError> {
		let removed = self.map_mut(node, namespace)?.remove(key);
		self.detach_potential_child(node, removed.as_ref());
		Ok(removed.as_ref().map(StateValue::from))
	}

	/// # Errors
	///
	/// Iff the namespace doesn't exist or isn't a map.
	pub fn get(&self, node: NodeId, namespace: NamespaceId, key: &str) -> Result<Option<StateValue>, TreeError> {
		Ok(self.map(node, namespace)?.get(key).map(StateValue::from))
	}

	/// # Errors
	///
	/// Iff the namespace doesn't exist or isn't a list, or `index` is greater than its length.
	pub fn insert(&mut self, node: NodeId, namespace: NamespaceId, index: usize, value: impl Into<Value>) -> Result<(), TreeError> {
		let list = self.list_mut(node, namespace)?;
		check_insert_index(index, list.len())?;
		list.insert(index, Slot::Value(value.into()));
		Ok(())
	}

	/// Inserts `child` at `index`, making `node` its parent.
	///
	/// # Errors
	///
	/// Iff the namespace doesn't exist or isn't a list, `index` is out of bounds or `child` can't be attached here.
	#[instrument(skip(self))]
	pub fn insert_node(&mut self, node: NodeId, namespace: NamespaceId, index: usize, child: NodeId) -> Result<(), TreeError> {
		check_insert_index(index, self.list(node, namespace)?.len())?;
		let slot = self.attachable(node, child)?;
		self.list_mut(node, namespace)?.insert(index, slot);
		self.attach(node, child);
		Ok(())
	}

	/// Removes the item at `index`, detaching it if it is a node.
	///
	/// # Errors
	///
	/// Iff the namespace doesn't exist or isn't a list, or `index` is out of bounds.
	pub fn remove_at(&mut self, node: NodeId, namespace: NamespaceId, index: usize) -> Result<StateValue, TreeError> {
		let list = self.list_mut(node, namespace)?;
		let len = list.len();
		let removed = list.remove(index).ok_or(TreeError::IndexOutOfBounds { index, len })?;
		self.detach_potential_child(node, Some(&removed));
		Ok(StateValue::from(&removed))
	}

	/// # Errors
	///
	/// Iff the namespace doesn't exist or isn't a list.
	pub fn list_values(&self, node: NodeId, namespace: NamespaceId) -> Result<Vec<StateValue>, TreeError> {
		Ok(self.list(node, namespace)?.iter().map(StateValue::from).collect())
	}

	/// Removes a detached node and everything below it from the arena.
	///
	/// # Errors
	///
	/// Iff the node is unknown, the root, or still attached.
	#[instrument(skip(self))]
	pub fn dispose(&mut self, id: NodeId) -> Result<(), TreeError> {
		let node = self.nodes.get(&id).ok_or(TreeError::UnknownNode(id))?;
		if id == ROOT || node.parent.is_some() {
			return Err(TreeError::StillAttached(id));
		}
		let mut pending = vec![id];
		while let Some(id) = pending.pop() {
			if let Some(node) = self.nodes.remove(&id) {
				node.for_each_child(|child| pending.push(child));
			}
		}
		debug!("Disposed state node {} and its descendants.", id);
		Ok(())
	}

	fn reachable(&self) -> HashSet<NodeId> {
		let mut reachable = HashSet::new();
		let mut pending = vec![ROOT];
		while let Some(id) = pending.pop() {
			if reachable.insert(id) {
				if let Some(node) = self.nodes.get(&id) {
					node.for_each_child(|child| pending.push(child));
				}
			}
		}
		reachable
	}

	fn sorted_ids(&self) -> Vec<NodeId> {
		let mut ids: Vec<_> = self.nodes.keys().copied().collect();
		ids.sort_unstable();
		ids
	}

	/// Emits the changes that bring the client from the last committed picture to the current one.
	///
	/// Creations come first and removals last, so every reference in between resolves.
	/// A node that was created and detached again since the last [`reset_changes`](`StateTree::reset_changes`) produces no change at all.
	#[instrument(skip(self, collector))]
	pub fn collect_changes(&self, mut collector: impl FnMut(NodeChange)) {
		let reachable = self.reachable();
		let ids = self.sorted_ids();
		for &id in &ids {
			let node = &self.nodes[&id];
			if reachable.contains(&id) && !node.sent {
				collector(NodeChange::NodeCreate { node_id: id, type_id: node.type_id });
			}
		}
		for &id in &ids {
			if reachable.contains(&id) {
				for (&namespace_id, namespace) in &self.nodes[&id].namespaces {
					namespace.collect_changes(id, namespace_id, &mut collector);
				}
			}
		}
		for &id in &ids {
			if !reachable.contains(&id) && self.nodes[&id].sent {
				collector(NodeChange::NodeRemove { node_id: id });
			}
		}
	}

	/// Whether [`collect_changes`](`StateTree::collect_changes`) would emit anything.
	#[must_use]
	pub fn has_changes(&self) -> bool {
		let reachable = self.reachable();
		self.nodes.values().any(|node| {
			let visible = reachable.contains(&node.id);
			visible != node.sent || (visible && node.namespaces.values().any(ChangeTracking::has_changes))
		})
	}

	/// Commits the picture last collected, after it was delivered successfully.
	#[instrument(skip(self))]
	pub fn reset_changes(&mut self) {
		let reachable = self.reachable();
		for node in self.nodes.values_mut() {
			match (reachable.contains(&node.id), node.sent) {
				(true, _) => {
					node.sent = true;
					node.namespaces.values_mut().for_each(ChangeTracking::reset_changes);
				}
				(false, true) => {
					node.sent = false;
					node.namespaces.values_mut().for_each(ChangeTracking::forget_client_state);
				}
				(false, false) => (),
			}
		}
	}
}

fn check_insert_index(index: usize, len: usize) -> Result<(), TreeError> {
	if index > len {
		Err(TreeError::IndexOutOfBounds { index, len })
	} else {
		Ok(())
	}
}
