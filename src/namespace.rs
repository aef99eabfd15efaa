//! Change-tracked slices of a state node's data.
//!
//! Namespaces don't know about the tree they are part of. Parent pointers of child nodes are
//! maintained by [`StateTree`](`crate::state_tree::StateTree`), which inspects the slots that
//! mutations here return.

use crate::{
	change::NodeChange,
	state_tree::{NamespaceId, NodeId},
};
use hashbrown::{HashMap, HashSet};
use serde_json::Value;

/// The content of one namespace slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
	Value(Value),
	/// A child node with map-shaped content.
	Map(NodeId),
	/// A child node with a list namespace.
	List(NodeId),
}

impl Slot {
	#[must_use]
	pub fn child(&self) -> Option<NodeId> {
		match *self {
			Slot::Value(_) => None,
			Slot::Map(node) | Slot::List(node) => Some(node),
		}
	}
}

/// The shared contract of all namespace variants.
pub trait ChangeTracking {
	/// Emits the minimal sequence of changes that turns the state last reported to the client
	/// (empty, or as of the last [`reset_changes`](`ChangeTracking::reset_changes`)) into the
	/// current state.
	fn collect_changes(&self, node: NodeId, namespace: NamespaceId, collector: &mut dyn FnMut(NodeChange));

	/// Makes the current state the baseline of subsequent collections.
	fn reset_changes(&mut self);

	/// Makes the empty state the baseline of subsequent collections.
	fn forget_client_state(&mut self);

	fn has_changes(&self) -> bool;

	/// Visits every child node currently held by this namespace.
	fn for_each_child(&self, action: &mut dyn FnMut(NodeId));
}

/// Key/value namespace.
#[derive(Debug, Default)]
pub struct MapNamespace {
	values: HashMap<String, Slot>,
	/// Keys present as of the baseline.
	baseline: HashSet<String>,
	/// Keys touched since the baseline, in order of first touch.
	dirty: Vec<String>,
	dirty_set: HashSet<String>,
}

impl MapNamespace {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn get(&self, key: &str) -> Option<&Slot> {
		self.values.get(key)
	}

	#[must_use]
	pub fn contains_key(&self, key: &str) -> bool {
		self.values.contains_key(key)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.values.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.values.is_empty()
	}

	pub fn keys(&self) -> impl Iterator<Item = &str> {
		self.values.keys().map(String::as_str)
	}

	/// Returns the replaced slot, if any.
	pub fn put(&mut self, key: String, slot: Slot) -> Option<Slot> {
		self.touch(&key);
		self.values.insert(key, slot)
	}

	pub fn remove(&mut self, key: &str) -> Option<Slot> {
		let removed = self.values.remove(key);
		if removed.is_some() {
			self.touch(key);
		}
		removed
	}

	fn touch(&mut self, key: &str) {
		if !self.dirty_set.contains(key) {
			self.dirty_set.insert(key.to_owned());
			self.dirty.push(key.to_owned());
		}
	}
}

impl ChangeTracking for MapNamespace {
	fn collect_changes(&self, node_id: NodeId, namespace_id: NamespaceId, collector: &mut dyn FnMut(NodeChange)) {
		for key in &self.dirty {
			let change = match self.values.get(key) {
				Some(Slot::Value(value)) => NodeChange::Put {
					node_id,
					namespace_id,
					key: key.clone(),
					value: value.clone(),
				},
				Some(&Slot::Map(child)) => NodeChange::PutMapReference {
					node_id,
					namespace_id,
					key: key.clone(),
					child,
				},
				Some(&Slot::List(child)) => NodeChange::PutListReference {
					node_id,
					namespace_id,
					key: key.clone(),
					child,
				},
				None if self.baseline.contains(key) => NodeChange::Remove {
					node_id,
					namespace_id,
					key: key.clone(),
				},
				None => continue,
			};
			collector(change);
		}
	}

	fn reset_changes(&mut self) {
		self.baseline = self.values.keys().cloned().collect();
		self.dirty.clear();
		self.dirty_set.clear();
	}

	fn forget_client_state(&mut self) {
		self.baseline.clear();
		self.dirty = self.values.keys().cloned().collect();
		self.dirty.sort_unstable();
		self.dirty_set = self.dirty.iter().cloned().collect();
	}

	fn has_changes(&self) -> bool {
		self.dirty.iter().any(|key| self.values.contains_key(key) || self.baseline.contains(key))
	}

	fn for_each_child(&self, action: &mut dyn FnMut(NodeId)) {
		self.values.values().filter_map(Slot::child).for_each(action);
	}
}

#[derive(Debug)]
struct Item {
	slot: Slot,
	/// Position in the baseline, or [`None`] if inserted since.
	baseline_index: Option<usize>,
}

/// Ordered sequence namespace.
#[derive(Debug, Default)]
pub struct ListNamespace {
	items: Vec<Item>,
	/// Baseline positions of items removed since the baseline.
	removed: Vec<usize>,
}

impl ListNamespace {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.items.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	#[must_use]
	pub fn get(&self, index: usize) -> Option<&Slot> {
		self.items.get(index).map(|item| &item.slot)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Slot> {
		self.items.iter().map(|item| &item.slot)
	}

	/// # Panics
	///
	/// Iff `index > len`.
	pub fn insert(&mut self, index: usize, slot: Slot) {
		self.items.insert(index, Item { slot, baseline_index: None });
	}

	pub fn remove(&mut self, index: usize) -> Option<Slot> {
		if index >= self.items.len() {
			return None;
		}
		let item = self.items.remove(index);
		if let Some(baseline_index) = item.baseline_index {
			self.removed.push(baseline_index);
		}
		Some(item.slot)
	}
}

impl ChangeTracking for ListNamespace {
	fn collect_changes(&self, node_id: NodeId, namespace_id: NamespaceId, collector: &mut dyn FnMut(NodeChange)) {
		let mut removed = self.removed.clone();
		removed.sort_unstable_by(|a, b| b.cmp(a));
		for index in removed {
			collector(NodeChange::ListRemove { node_id, namespace_id, index });
		}

		let mut run: Option<(usize, Vec<Value>)> = None;
		let flush = |run: &mut Option<(usize, Vec<Value>)>, collector: &mut dyn FnMut(NodeChange)| {
			if let Some((index, values)) = run.take() {
				collector(NodeChange::ListInsertPrimitive {
					node_id,
					namespace_id,
					index,
					values,
				});
			}
		};
		for (index, item) in self.items.iter().enumerate() {
			if item.baseline_index.is_some() {
				flush(&mut run, &mut *collector);
				continue;
			}
			match &item.slot {
				Slot::Value(value) => match &mut run {
					Some((_, values)) => values.push(value.clone()),
					None => run = Some((index, vec![value.clone()])),
				},
				Slot::Map(child) | Slot::List(child) => {
					flush(&mut run, &mut *collector);
					collector(NodeChange::ListInsertNode {
						node_id,
						namespace_id,
						index,
						child: *child,
					});
				}
			}
		}
		flush(&mut run, &mut *collector);
	}

	fn reset_changes(&mut self) {
		for (index, item) in self.items.iter_mut().enumerate() {
			item.baseline_index = Some(index);
		}
		self.removed.clear();
	}

	fn forget_client_state(&mut self) {
		for item in &mut self.items {
			item.baseline_index = None;
		}
		self.removed.clear();
	}

	fn has_changes(&self) -> bool {
		!self.removed.is_empty() || self.items.iter().any(|item| item.baseline_index.is_none())
	}

	fn for_each_child(&self, action: &mut dyn FnMut(NodeId)) {
		self.iter().filter_map(Slot::child).for_each(action);
	}
}

/// Whether a namespace is map- or list-shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceKind {
	Map,
	List,
}

/// A namespace of either shape, dispatching [`ChangeTracking`] by variant.
#[derive(Debug)]
pub enum Namespace {
	Map(MapNamespace),
	List(ListNamespace),
}

impl Namespace {
	#[must_use]
	pub fn new(kind: NamespaceKind) -> Self {
		match kind {
			NamespaceKind::Map => Namespace::Map(MapNamespace::new()),
			NamespaceKind::List => Namespace::List(ListNamespace::new()),
		}
	}

	#[must_use]
	pub fn kind(&self) -> NamespaceKind {
		match self {
			Namespace::Map(_) => NamespaceKind::Map,
			Namespace::List(_) => NamespaceKind::List,
		}
	}

	fn tracking(&self) -> &dyn ChangeTracking {
		match self {
			Namespace::Map(map) => map,
			Namespace::List(list) => list,
		}
	}

	fn tracking_mut(&mut self) -> &mut dyn ChangeTracking {
		match self {
			Namespace::Map(map) => map,
			Namespace::List(list) => list,
		}
	}
}

impl ChangeTracking for Namespace {
	fn collect_changes(&self, node: NodeId, namespace: NamespaceId, collector: &mut dyn FnMut(NodeChange)) {
		self.tracking().collect_changes(node, namespace, collector)
	}

	fn reset_changes(&mut self) {
		self.tracking_mut().reset_changes()
	}

	fn forget_client_state(&mut self) {
		self.tracking_mut().forget_client_state()
	}

	fn has_changes(&self) -> bool {
		self.tracking().has_changes()
	}

	fn for_each_child(&self, action: &mut dyn FnMut(NodeId)) {
		self.tracking().for_each_child(action)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn collect(namespace: &dyn ChangeTracking) -> Vec<NodeChange> {
		let mut changes = vec![];
		namespace.collect_changes(1, 0, &mut |change| changes.push(change));
		changes
	}

	#[test]
	fn map_put_twice_keeps_latest() {
		let mut map = MapNamespace::new();
		map.put("a".to_owned(), Slot::Value(json!(1)));
		map.put("b".to_owned(), Slot::Value(json!(2)));
		map.put("a".to_owned(), Slot::Value(json!(3)));
		assert_eq!(
			collect(&map),
			vec![
				NodeChange::Put {
					node_id: 1,
					namespace_id: 0,
					key: "a".to_owned(),
					value: json!(3),
				},
				NodeChange::Put {
					node_id: 1,
					namespace_id: 0,
					key: "b".to_owned(),
					value: json!(2),
				},
			]
		);
	}

	#[test]
	fn map_remove_of_sent_key() {
		let mut map = MapNamespace::new();
		map.put("a".to_owned(), Slot::Value(json!(1)));
		map.reset_changes();
		assert!(!map.has_changes());
		map.remove("a");
		map.put("b".to_owned(), Slot::Value(json!(2)));
		map.remove("b");
		assert_eq!(
			collect(&map),
			vec![NodeChange::Remove {
				node_id: 1,
				namespace_id: 0,
				key: "a".to_owned(),
			}]
		);
	}

	#[test]
	fn list_insert_then_remove_is_no_op() {
		let mut list = ListNamespace::new();
		list.insert(0, Slot::Value(json!("kept")));
		list.reset_changes();
		list.insert(1, Slot::Value(json!("transient")));
		assert!(list.has_changes());
		list.remove(1);
		assert!(!list.has_changes());
		assert!(collect(&list).is_empty());
	}

	#[test]
	fn list_removes_before_inserts() {
		let mut list = ListNamespace::new();
		for (index, value) in ["a", "b", "c"].iter().enumerate() {
			list.insert(index, Slot::Value(json!(value)));
		}
		list.reset_changes();
		list.remove(0);
		list.insert(1, Slot::Value(json!("x")));
		list.insert(2, Slot::Value(json!("y")));
		list.remove(0);
		assert_eq!(
			collect(&list),
			vec![
				NodeChange::ListRemove {
					node_id: 1,
					namespace_id: 0,
					index: 1,
				},
				NodeChange::ListRemove {
					node_id: 1,
					namespace_id: 0,
					index: 0,
				},
				NodeChange::ListInsertPrimitive {
					node_id: 1,
					namespace_id: 0,
					index: 0,
					values: vec![json!("x"), json!("y")],
				},
			]
		);
	}
}
