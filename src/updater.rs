//! The client side: Applies change batches to a mirror of the state tree and projects it onto a [`Dom`].
//!
//! # Projection
//!
//! Map nodes are projected according to where they are referenced from:
//!
//! - The bound root and any map node in a [`CHILDREN`] list become elements.
//!   Their keys are routed to the element:
//!   - [`TAG`] selects the element's tag name. Elements are created with a placeholder tag until it arrives.
//!   - `attr.`-prefixed keys and [`STYLE`] are set as attributes.
//!   - [`CLASS_LIST`], [`LISTENERS`] and [`CHILDREN`] bind list nodes to the `class` attribute,
//!     forwarded event types and child elements respectively.
//!   - [`EVENT_DATA`] maps event types to lists of expressions that are evaluated when that event is forwarded.
//!   - Anything else is set as property.
//! - Map and list nodes referenced from a property become live objects and arrays.
//!   An object or array that is already present on the element is reused.
//!
//! The mirror keeps every node's content, so nodes that are bound late are fully replayed.

use crate::{
	change::{ChangeBatch, MethodInvocation, NodeChange, RpcArgument, RpcInvocation, ATTRIBUTE_PREFIX, CALLBACK_RPC_INTERFACE, CALLBACK_RPC_METHOD, CHILDREN, CLASS_LIST, EVENT_CALLBACK, EVENT_DATA, LISTENERS, STYLE, TAG},
	dom::{Dom, DomValue, EventHandler},
	error::UpdateError,
	rc_hash_map::RcHashMap,
	state_tree::NodeId,
	value_type::{TypeId, ValueTypeDescriptor, ValueTypeMap, ELEMENT},
};
use core::{
	fmt::{self, Debug, Formatter},
	mem,
};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
	cell::{Ref, RefCell},
	collections::BTreeMap,
	rc::{Rc, Weak},
};
use tracing::{debug, error, instrument, trace, trace_span, warn};

/// Configuration of a [`TreeUpdater`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdaterOptions {
	/// Tag of elements whose [`TAG`] hasn't arrived yet.
	pub placeholder_tag: String,
	pub interface_name: String,
	pub method_name: String,
	pub callback_name: String,
}

impl Default for UpdaterOptions {
	fn default() -> Self {
		Self {
			placeholder_tag: "div".to_owned(),
			interface_name: CALLBACK_RPC_INTERFACE.to_owned(),
			method_name: CALLBACK_RPC_METHOD.to_owned(),
			callback_name: EVENT_CALLBACK.to_owned(),
		}
	}
}

/// Formats user values only with the `dangerous-logging` feature enabled.
struct Redacted<'a, T: Debug>(&'a T);
impl<'a, T: Debug> Debug for Redacted<'a, T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		if cfg!(feature = "dangerous-logging") {
			self.0.fmt(f)
		} else {
			f.write_str("<redacted>")
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
enum Entry {
	Value(Value),
	Node(NodeId),
}

#[derive(Debug)]
enum Content {
	Map(BTreeMap<String, Entry>),
	List(Vec<Entry>),
}

#[derive(Debug, Clone)]
enum Binding<D: Dom> {
	Unbound,
	Element(D::Element),
	Object(D::Object),
	Array(D::Object),
	Children { owner: NodeId },
	ClassList { owner: NodeId },
	Listeners { owner: NodeId },
}

struct MirrorNode<D: Dom> {
	type_id: TypeId,
	content: Content,
	binding: Binding<D>,
	/// Event listeners registered on this node's element, counted per event type.
	listeners: RcHashMap<String, usize, Option<D::Listener>>,
	/// How many map keys and list items in the mirror refer to this node.
	///
	/// A node moved within one batch is briefly referenced twice, as the new reference may arrive before the old one is dropped.
	references: usize,
}

impl<D: Dom> MirrorNode<D> {
	fn new(type_id: TypeId, content: Content, binding: Binding<D>) -> Self {
		Self {
			type_id,
			content,
			binding,
			listeners: RcHashMap::new(),
			references: 0,
		}
	}

	fn is_list(&self) -> bool {
		matches!(self.content, Content::List(_))
	}

	fn child_nodes(&self) -> Vec<NodeId> {
		let entries: Box<dyn Iterator<Item = &Entry>> = match &self.content {
			Content::Map(map) => Box::new(map.values()),
			Content::List(items) => Box::new(items.iter()),
		};
		entries
			.filter_map(|entry| match entry {
				Entry::Node(child) => Some(*child),
				Entry::Value(_) => None,
			})
			.collect()
	}
}

struct Shared<D: Dom> {
	dom: D,
	options: UpdaterOptions,
	types: ValueTypeMap,
	root: Option<NodeId>,
	nodes: HashMap<NodeId, MirrorNode<D>>,
	invocations: Vec<MethodInvocation>,
	desynchronized: bool,
	this: Weak<RefCell<Shared<D>>>,
}

/// Applies change batches to a [`Dom`] and queues forwarded events as [`MethodInvocation`]s.
///
/// The updater starts out unbound. Call [`bind_root`](`TreeUpdater::bind_root`) before applying node changes.
///
/// # Errors
///
/// Any error while applying a batch aborts it and leaves the updater desynchronized:
/// Further updates fail with [`UpdateError::Desynchronized`] until [`resynchronize`](`TreeUpdater::resynchronize`) is called
/// and the server sends its whole state again.
pub struct TreeUpdater<D: Dom> {
	shared: Rc<RefCell<Shared<D>>>,
}

impl<D: Dom> Debug for TreeUpdater<D> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self.shared.try_borrow() {
			Ok(shared) => f
				.debug_struct("TreeUpdater")
				.field("dom", &shared.dom)
				.field("root", &shared.root)
				.field("nodes", &shared.nodes.len())
				.field("invocations", &shared.invocations.len())
				.field("desynchronized", &shared.desynchronized)
				.finish(),
			Err(_) => f.write_str("TreeUpdater { <borrowed> }"),
		}
	}
}

impl<D: Dom> TreeUpdater<D> {
	#[must_use]
	pub fn new(dom: D, options: UpdaterOptions) -> Self {
		let shared = Rc::new(RefCell::new(Shared {
			dom,
			options,
			types: ValueTypeMap::new(),
			root: None,
			nodes: HashMap::new(),
			invocations: vec![],
			desynchronized: false,
			this: Weak::new(),
		}));
		shared.borrow_mut().this = Rc::downgrade(&shared);
		Self { shared }
	}

	/// Binds the pre-shared root node to `element`, replacing any earlier binding.
	///
	/// # Errors
	///
	/// Iff releasing an earlier binding failed.
	#[instrument(skip(self, element))]
	pub fn bind_root(&mut self, node_id: NodeId, element: D::Element) -> Result<(), UpdateError> {
		let mut shared = self.shared.borrow_mut();
		shared.reset()?;
		shared.root = Some(node_id);
		shared.nodes.insert(node_id, MirrorNode::new(ELEMENT, Content::Map(BTreeMap::new()), Binding::Element(element)));
		shared.desynchronized = false;
		Ok(())
	}

	/// Applies one batch: value types first, then node changes in order, then type changes, then invocations.
	///
	/// # Errors
	///
	/// See [`TreeUpdater`#errors].
	#[instrument(skip_all)]
	pub fn update(&mut self, value_types: &BTreeMap<String, ValueTypeDescriptor>, type_changes: &BTreeMap<String, TypeId>, node_changes: &[NodeChange], invocations: &[RpcInvocation]) -> Result<(), UpdateError> {
		let mut shared = self.shared.borrow_mut();
		if shared.desynchronized {
			return Err(UpdateError::Desynchronized);
		}
		let result = shared.apply_update(value_types, type_changes, node_changes, invocations);
		if let Err(error) = &result {
			error!("Aborting batch: {}. The client mirror is now desynchronized.", error);
			shared.desynchronized = true;
		}
		result
	}

	/// # Errors
	///
	/// See [`TreeUpdater`#errors].
	pub fn apply_batch(&mut self, batch: &ChangeBatch) -> Result<(), UpdateError> {
		self.update(&batch.value_types, &batch.type_changes, &batch.changes, &batch.invocations)
	}

	/// Clears the mirror back to the bound root so that a full state can be applied.
	///
	/// # Errors
	///
	/// Iff no root is bound.
	#[instrument(skip(self))]
	pub fn resynchronize(&mut self) -> Result<(), UpdateError> {
		let mut shared = self.shared.borrow_mut();
		let root = shared.root.ok_or(UpdateError::NotBound)?;
		let element = shared.element_of(root)?;
		shared.reset()?;
		shared.root = Some(root);
		shared.nodes.insert(root, MirrorNode::new(ELEMENT, Content::Map(BTreeMap::new()), Binding::Element(element)));
		shared.desynchronized = false;
		debug!("Resynchronizing.");
		Ok(())
	}

	#[must_use]
	pub fn is_desynchronized(&self) -> bool {
		self.shared.borrow().desynchronized
	}

	#[must_use]
	pub fn type_map(&self) -> Ref<'_, ValueTypeMap> {
		Ref::map(self.shared.borrow(), |shared| &shared.types)
	}

	/// Invocations forwarded since the last [`take_invocations`](`TreeUpdater::take_invocations`).
	///
	/// Don't dispatch events while holding on to this.
	#[must_use]
	pub fn enqueued_invocations(&self) -> Ref<'_, [MethodInvocation]> {
		Ref::map(self.shared.borrow(), |shared| shared.invocations.as_slice())
	}

	pub fn take_invocations(&mut self) -> Vec<MethodInvocation> {
		mem::take(&mut self.shared.borrow_mut().invocations)
	}

	/// The element `node_id` is currently projected as, if any.
	#[must_use]
	pub fn element(&self, node_id: NodeId) -> Option<D::Element> {
		match &self.shared.borrow().nodes.get(&node_id)?.binding {
			Binding::Element(element) => Some(element.clone()),
			_ => None,
		}
	}

	/// The value type `node_id` was created or last re-typed with.
	#[must_use]
	pub fn node_type(&self, node_id: NodeId) -> Option<TypeId> {
		self.shared.borrow().nodes.get(&node_id).map(|node| node.type_id)
	}

	#[must_use]
	pub fn root_element(&self) -> Option<D::Element> {
		let root = self.shared.borrow().root?;
		self.element(root)
	}

	#[must_use]
	pub fn dom(&self) -> D {
		self.shared.borrow().dom.clone()
	}
}

impl<D: Dom> Drop for TreeUpdater<D> {
	fn drop(&mut self) {
		if let Ok(mut shared) = self.shared.try_borrow_mut() {
			shared.release_listeners();
		}
	}
}

impl<D: Dom> Shared<D> {
	fn node(&self, id: NodeId) -> Result<&MirrorNode<D>, UpdateError> {
		self.nodes.get(&id).ok_or(UpdateError::UnknownNode(id))
	}

	fn node_mut(&mut self, id: NodeId) -> Result<&mut MirrorNode<D>, UpdateError> {
		self.nodes.get_mut(&id).ok_or(UpdateError::UnknownNode(id))
	}

	fn element_of(&self, id: NodeId) -> Result<D::Element, UpdateError> {
		match &self.node(id)?.binding {
			Binding::Element(element) => Ok(element.clone()),
			_ => Err(UpdateError::Protocol {
				node: id,
				reason: "not projected as an element".to_owned(),
			}),
		}
	}

	fn list_items(&self, id: NodeId) -> Result<&[Entry], UpdateError> {
		match &self.node(id)?.content {
			Content::List(items) => Ok(items),
			Content::Map(_) => Err(UpdateError::Protocol {
				node: id,
				reason: "expected a list node".to_owned(),
			}),
		}
	}

	fn map_entry(&self, id: NodeId, key: &str) -> Option<&Entry> {
		match &self.nodes.get(&id)?.content {
			Content::Map(map) => map.get(key),
			Content::List(_) => None,
		}
	}

	fn apply_update(&mut self, value_types: &BTreeMap<String, ValueTypeDescriptor>, type_changes: &BTreeMap<String, TypeId>, node_changes: &[NodeChange], invocations: &[RpcInvocation]) -> Result<(), UpdateError> {
		self.types.merge(value_types)?;
		if self.root.is_none() && !(node_changes.is_empty() && type_changes.is_empty() && invocations.is_empty()) {
			return Err(UpdateError::NotBound);
		}

		for (index, change) in node_changes.iter().enumerate() {
			let span = trace_span!("change", index, node = change.node_id());
			let _enter = span.enter();
			trace!(change = ?Redacted(change));
			self.apply(change)?;
		}

		for (node, &type_id) in type_changes {
			let node = node.parse::<NodeId>().map_err(|_| UpdateError::Protocol {
				node: 0,
				reason: format!("invalid node id {:?} in type changes", node),
			})?;
			self.change_type(node, type_id)?;
		}

		for invocation in invocations {
			let span = trace_span!("invocation", expression = ?Redacted(&invocation.expression));
			let _enter = span.enter();
			self.invoke(invocation)?;
		}

		debug!(
			"Applied {} value type(s), {} node change(s), {} type change(s) and {} invocation(s).",
			value_types.len(),
			node_changes.len(),
			type_changes.len(),
			invocations.len()
		);
		Ok(())
	}

	fn apply(&mut self, change: &NodeChange) -> Result<(), UpdateError> {
		match change {
			&NodeChange::NodeCreate { node_id, type_id } => self.create(node_id, type_id),
			&NodeChange::NodeRemove { node_id } => self.remove_node(node_id),
			NodeChange::Put { node_id, key, value, .. } => self.put(*node_id, key, Entry::Value(value.clone())),
			NodeChange::PutListReference { node_id, key, child, .. } => {
				self.expect_shape(*child, true)?;
				self.put(*node_id, key, Entry::Node(*child))
			}
			NodeChange::PutMapReference { node_id, key, child, .. } => {
				self.expect_shape(*child, false)?;
				self.put(*node_id, key, Entry::Node(*child))
			}
			NodeChange::Remove { node_id, key, .. } => self.remove_key(*node_id, key),
			NodeChange::ListInsertPrimitive { node_id, index, values, .. } => self.list_insert(*node_id, *index, values.iter().cloned().map(Entry::Value).collect()),
			NodeChange::ListInsertNode { node_id, index, child, .. } => {
				self.node(*child)?;
				self.list_insert(*node_id, *index, vec![Entry::Node(*child)])
			}
			NodeChange::ListRemove { node_id, index, .. } => self.list_remove(*node_id, *index),
		}
	}

	fn expect_shape(&self, id: NodeId, list: bool) -> Result<(), UpdateError> {
		if self.node(id)?.is_list() == list {
			Ok(())
		} else {
			Err(UpdateError::Protocol {
				node: id,
				reason: format!("expected a {} node", if list { "list" } else { "map" }),
			})
		}
	}

	fn create(&mut self, id: NodeId, type_id: TypeId) -> Result<(), UpdateError> {
		let value_type = self.types.get(type_id)?;
		if self.nodes.contains_key(&id) {
			return Err(UpdateError::DuplicateNode(id));
		}
		let content = if value_type.is_list() { Content::List(vec![]) } else { Content::Map(BTreeMap::new()) };
		let binding = if value_type.is_element() {
			Binding::Element(self.dom.create_element(&self.options.placeholder_tag)?)
		} else {
			Binding::Unbound
		};
		self.nodes.insert(id, MirrorNode::new(type_id, content, binding));
		Ok(())
	}

	fn remove_node(&mut self, id: NodeId) -> Result<(), UpdateError> {
		if self.root == Some(id) {
			return Err(UpdateError::Protocol {
				node: id,
				reason: "the root can't be removed".to_owned(),
			});
		}
		self.unbind(id)?;
		for child in self.node(id)?.child_nodes() {
			if self.release(child) {
				self.unbind(child)?;
			}
		}
		let mut node = self.nodes.remove(&id).ok_or(UpdateError::UnknownNode(id))?;
		if let Binding::Element(element) = &node.binding {
			if let Some(parent) = self.dom.parent_element(element) {
				self.dom.remove_child(&parent, element)?;
			}
			for (event_type, listener) in node.listeners.drain() {
				if let Some(listener) = listener {
					self.dom.remove_event_listener(element, &event_type, listener)?;
				}
			}
		}
		Ok(())
	}

	fn change_type(&mut self, id: NodeId, type_id: TypeId) -> Result<(), UpdateError> {
		let value_type = self.types.get(type_id)?;
		let node = self.node_mut(id)?;
		node.type_id = type_id;
		if value_type.is_element() && matches!(node.binding, Binding::Unbound) && !node.is_list() {
			self.ensure_element(id)?;
		}
		Ok(())
	}

	fn put(&mut self, id: NodeId, key: &str, entry: Entry) -> Result<(), UpdateError> {
		let old = match &mut self.node_mut(id)?.content {
			Content::Map(map) => map.insert(key.to_owned(), entry.clone()),
			Content::List(_) => {
				return Err(UpdateError::Protocol {
					node: id,
					reason: format!("put of {:?} into a list node", key),
				})
			}
		};
		if let Entry::Node(child) = &entry {
			self.retain(*child);
		}
		if let Some(Entry::Node(old_child)) = old {
			if self.release(old_child) {
				self.unbind(old_child)?;
			}
		}
		match self.node(id)?.binding.clone() {
			Binding::Element(element) => self.project_element_key(id, &element, key, &entry),
			Binding::Object(object) => {
				let value = self.structured(&entry)?;
				Ok(self.dom.object_set(&object, key, value)?)
			}
			_ => Ok(()),
		}
	}

	fn remove_key(&mut self, id: NodeId, key: &str) -> Result<(), UpdateError> {
		let old = match &mut self.node_mut(id)?.content {
			Content::Map(map) => map.remove(key),
			Content::List(_) => {
				return Err(UpdateError::Protocol {
					node: id,
					reason: format!("remove of {:?} from a list node", key),
				})
			}
		};
		let old = match old {
			Some(old) => old,
			None => return Ok(warn!("Removing absent key {:?}. Ignoring.", key)),
		};
		match self.node(id)?.binding.clone() {
			Binding::Element(element) => match key {
				TAG => warn!("Ignoring removal of the tag. The element keeps its current tag."),
				STYLE | CLASS_LIST => self.dom.remove_attribute(&element, if key == STYLE { "style" } else { "class" })?,
				LISTENERS | CHILDREN | EVENT_DATA => (),
				_ if key.starts_with(ATTRIBUTE_PREFIX) => self.dom.remove_attribute(&element, &key[ATTRIBUTE_PREFIX.len()..])?,
				_ => self.dom.remove_property(&element, key)?,
			},
			Binding::Object(object) => self.dom.object_remove(&object, key)?,
			_ => (),
		}
		if let Entry::Node(child) = old {
			if self.release(child) {
				self.unbind(child)?;
			}
		}
		Ok(())
	}

	fn project_element_key(&mut self, id: NodeId, element: &D::Element, key: &str, entry: &Entry) -> Result<(), UpdateError> {
		let protocol = |reason: &str| UpdateError::Protocol {
			node: id,
			reason: format!("{:?}: {}", key, reason),
		};
		match (key, entry) {
			(TAG, Entry::Value(Value::String(tag))) => self.retag(id, tag),
			(TAG, _) => Err(protocol("expected a tag name")),
			(CLASS_LIST, Entry::Node(child)) => self.bind_list(*child, Binding::ClassList { owner: id }),
			(LISTENERS, Entry::Node(child)) => self.bind_list(*child, Binding::Listeners { owner: id }),
			(CHILDREN, Entry::Node(child)) => self.bind_list(*child, Binding::Children { owner: id }),
			// Read when events are forwarded.
			(EVENT_DATA, Entry::Node(_)) => Ok(()),
			(CLASS_LIST | LISTENERS | CHILDREN | EVENT_DATA, Entry::Value(_)) => Err(protocol("expected a node reference")),
			(STYLE, Entry::Value(value)) => self.set_attribute(element, "style", value),
			(_, Entry::Value(value)) if key.starts_with(ATTRIBUTE_PREFIX) => self.set_attribute(element, &key[ATTRIBUTE_PREFIX.len()..], value),
			(STYLE, Entry::Node(_)) => Err(protocol("expected a value")),
			(_, Entry::Node(_)) if key.starts_with(ATTRIBUTE_PREFIX) => Err(protocol("expected a value")),
			(_, Entry::Value(value)) => Ok(self.dom.set_property(element, key, DomValue::Json(value.clone()))?),
			(_, Entry::Node(child)) => {
				let child = *child;
				let is_list = self.node(child)?.is_list();
				let reusable = match (self.dom.property(element, key), &self.node(child)?.binding) {
					(Some(DomValue::Object(existing)), Binding::Unbound) if self.dom.is_array(&existing) == is_list => Some(existing),
					_ => None,
				};
				let value = match reusable {
					Some(existing) => {
						trace!("Reusing the existing live object.");
						self.bind_structured(child, existing.clone())?;
						DomValue::Object(existing)
					}
					None => self.structured(entry)?,
				};
				Ok(self.dom.set_property(element, key, value)?)
			}
		}
	}

	fn set_attribute(&self, element: &D::Element, name: &str, value: &Value) -> Result<(), UpdateError> {
		match value {
			Value::Null => self.dom.remove_attribute(element, name)?,
			Value::String(value) => self.dom.set_attribute(element, name, value)?,
			other => self.dom.set_attribute(element, name, &other.to_string())?,
		}
		Ok(())
	}

	/// Replaces the element of `id` with one with the new tag, carrying over its state.
	#[instrument(skip(self))]
	fn retag(&mut self, id: NodeId, tag: &str) -> Result<(), UpdateError> {
		let old = self.element_of(id)?;
		if self.dom.tag_name(&old).eq_ignore_ascii_case(tag) {
			return Ok(());
		}
		if self.root == Some(id) {
			return Ok(warn!("Can't change the tag of the root element from {:?}. Ignoring.", self.dom.tag_name(&old)));
		}

		for child in self.node(id)?.child_nodes() {
			self.unbind(child)?;
		}
		let new = self.dom.create_element(tag)?;
		if let Some(parent) = self.dom.parent_element(&old) {
			self.dom.replace_child(&parent, &new, &old)?;
		}
		self.node_mut(id)?.binding = Binding::Element(new.clone());
		self.replay_element(id, &new)
	}

	fn replay_element(&mut self, id: NodeId, element: &D::Element) -> Result<(), UpdateError> {
		let entries: Vec<(String, Entry)> = match &self.node(id)?.content {
			Content::Map(map) => map.iter().filter(|(key, _)| key.as_str() != TAG).map(|(key, entry)| (key.clone(), entry.clone())).collect(),
			Content::List(_) => vec![],
		};
		for (key, entry) in entries {
			self.project_element_key(id, element, &key, &entry)?;
		}
		Ok(())
	}

	/// The element of `id`, creating it first if `id` is an unbound map node.
	fn ensure_element(&mut self, id: NodeId) -> Result<D::Element, UpdateError> {
		let node = self.node(id)?;
		match &node.binding {
			Binding::Element(element) => return Ok(element.clone()),
			Binding::Unbound => (),
			_ => {
				return Err(UpdateError::Protocol {
					node: id,
					reason: "already bound and can't become an element".to_owned(),
				})
			}
		}
		let tag = match &node.content {
			Content::Map(map) => match map.get(TAG) {
				Some(Entry::Value(Value::String(tag))) => tag.clone(),
				_ => self.options.placeholder_tag.clone(),
			},
			Content::List(_) => {
				return Err(UpdateError::Protocol {
					node: id,
					reason: "a list node can't become an element".to_owned(),
				})
			}
		};
		let element = self.dom.create_element(&tag)?;
		self.node_mut(id)?.binding = Binding::Element(element.clone());
		self.replay_element(id, &element)?;
		Ok(element)
	}

	/// The value `entry` is projected as inside a live object or array.
	fn structured(&mut self, entry: &Entry) -> Result<DomValue<D>, UpdateError> {
		let child = match entry {
			Entry::Value(value) => return Ok(DomValue::Json(value.clone())),
			Entry::Node(child) => *child,
		};
		let node = self.node(child)?;
		let is_list = node.is_list();
		match &node.binding {
			Binding::Element(element) => Ok(DomValue::Element(element.clone())),
			Binding::Object(object) | Binding::Array(object) => Ok(DomValue::Object(object.clone())),
			Binding::Unbound => {
				let object = if is_list { self.dom.create_array() } else { self.dom.create_object() };
				self.bind_structured(child, object.clone())?;
				Ok(DomValue::Object(object))
			}
			Binding::Children { .. } | Binding::ClassList { .. } | Binding::Listeners { .. } => Err(UpdateError::Protocol {
				node: child,
				reason: "already bound to an element".to_owned(),
			}),
		}
	}

	fn bind_structured(&mut self, id: NodeId, object: D::Object) -> Result<(), UpdateError> {
		let node = self.node_mut(id)?;
		if node.is_list() {
			node.binding = Binding::Array(object.clone());
			let items = self.list_items(id)?.to_vec();
			if let Some(len) = self.dom.array_len(&object) {
				for index in (0..len).rev() {
					self.dom.array_remove(&object, index)?;
				}
			}
			for (index, entry) in items.iter().enumerate() {
				let value = self.structured(entry)?;
				self.dom.array_insert(&object, index, value)?;
			}
		} else {
			node.binding = Binding::Object(object.clone());
			let entries: Vec<(String, Entry)> = match &node.content {
				Content::Map(map) => map.iter().map(|(key, entry)| (key.clone(), entry.clone())).collect(),
				Content::List(_) => vec![],
			};
			for (key, entry) in entries {
				let value = self.structured(&entry)?;
				self.dom.object_set(&object, &key, value)?;
			}
		}
		Ok(())
	}

	fn bind_list(&mut self, id: NodeId, binding: Binding<D>) -> Result<(), UpdateError> {
		let node = self.node_mut(id)?;
		if !node.is_list() {
			return Err(UpdateError::Protocol {
				node: id,
				reason: "expected a list node".to_owned(),
			});
		}
		if !matches!(node.binding, Binding::Unbound) {
			trace!("Moving list node {} to a new binding.", id);
			self.unbind(id)?;
		}
		self.node_mut(id)?.binding = binding.clone();

		match binding {
			Binding::ClassList { owner } => self.update_class(id, owner),
			Binding::Listeners { owner } => {
				for entry in self.list_items(id)?.to_vec() {
					self.listen_entry(owner, &entry)?;
				}
				Ok(())
			}
			Binding::Children { owner } => {
				for index in 0..self.list_items(id)?.len() {
					self.attach_child(id, owner, index)?;
				}
				Ok(())
			}
			Binding::Unbound | Binding::Element(_) | Binding::Object(_) | Binding::Array(_) => Ok(()),
		}
	}

	/// Releases what binding `id` projected, except elements, which stay with their node.
	fn unbind(&mut self, id: NodeId) -> Result<(), UpdateError> {
		let node = match self.nodes.get_mut(&id) {
			Some(node) => node,
			None => return Ok(trace!("Node {} is gone already.", id)),
		};
		let binding = match &node.binding {
			Binding::Element(_) => return Ok(()),
			_ => mem::replace(&mut node.binding, Binding::Unbound),
		};
		match binding {
			Binding::Unbound | Binding::Element(_) | Binding::ClassList { .. } => (),
			Binding::Children { owner } | Binding::Listeners { owner } if !self.nodes.contains_key(&owner) => {
				trace!("The owner {} of node {} is gone already.", owner, id);
			}
			Binding::Object(_) | Binding::Array(_) => {
				for child in self.node(id)?.child_nodes() {
					self.unbind(child)?;
				}
			}
			Binding::Children { owner } => {
				let parent = self.element_of(owner)?;
				for child in self.node(id)?.child_nodes() {
					self.detach_child(&parent, child)?;
				}
			}
			Binding::Listeners { owner } => {
				for entry in self.list_items(id)?.to_vec() {
					if let Entry::Value(Value::String(event_type)) = entry {
						self.unlisten(owner, &event_type)?;
					}
				}
			}
		}
		Ok(())
	}

	fn list_insert(&mut self, id: NodeId, index: usize, entries: Vec<Entry>) -> Result<(), UpdateError> {
		let count = entries.len();
		let children: Vec<NodeId> = entries
			.iter()
			.filter_map(|entry| match entry {
				Entry::Node(child) => Some(*child),
				Entry::Value(_) => None,
			})
			.collect();
		match &mut self.node_mut(id)?.content {
			Content::List(items) if index <= items.len() => drop(items.splice(index..index, entries)),
			Content::List(items) => {
				return Err(UpdateError::Protocol {
					node: id,
					reason: format!("insertion index {} is out of bounds for length {}", index, items.len()),
				})
			}
			Content::Map(_) => {
				return Err(UpdateError::Protocol {
					node: id,
					reason: "list insertion into a map node".to_owned(),
				})
			}
		}
		for child in children {
			self.retain(child);
		}

		match self.node(id)?.binding.clone() {
			Binding::Children { owner } => {
				for index in index..index + count {
					self.attach_child(id, owner, index)?;
				}
			}
			Binding::ClassList { owner } => self.update_class(id, owner)?,
			Binding::Listeners { owner } => {
				for entry in self.list_items(id)?[index..index + count].to_vec() {
					self.listen_entry(owner, &entry)?;
				}
			}
			Binding::Array(array) => {
				for index in index..index + count {
					let entry = self.list_items(id)?[index].clone();
					let value = self.structured(&entry)?;
					self.dom.array_insert(&array, index, value)?;
				}
			}
			Binding::Unbound | Binding::Element(_) | Binding::Object(_) => (),
		}
		Ok(())
	}

	fn list_remove(&mut self, id: NodeId, index: usize) -> Result<(), UpdateError> {
		let removed = match &mut self.node_mut(id)?.content {
			Content::List(items) if index < items.len() => items.remove(index),
			Content::List(items) => {
				return Err(UpdateError::Protocol {
					node: id,
					reason: format!("removal index {} is out of bounds for length {}", index, items.len()),
				})
			}
			Content::Map(_) => {
				return Err(UpdateError::Protocol {
					node: id,
					reason: "list removal from a map node".to_owned(),
				})
			}
		};

		match self.node(id)?.binding.clone() {
			Binding::Children { owner } => {
				if let Entry::Node(child) = removed {
					if self.release(child) {
						let parent = self.element_of(owner)?;
						self.detach_child(&parent, child)?;
					}
				}
				return Ok(());
			}
			Binding::ClassList { owner } => self.update_class(id, owner)?,
			Binding::Listeners { owner } => {
				if let Entry::Value(Value::String(event_type)) = &removed {
					self.unlisten(owner, event_type)?;
				}
			}
			Binding::Array(array) => self.dom.array_remove(&array, index)?,
			Binding::Unbound | Binding::Element(_) | Binding::Object(_) => (),
		}
		if let Entry::Node(child) = removed {
			if self.release(child) {
				self.unbind(child)?;
			}
		}
		Ok(())
	}

	fn retain(&mut self, child: NodeId) {
		if let Some(node) = self.nodes.get_mut(&child) {
			node.references += 1;
		}
	}

	/// Drops one reference to `child` and returns whether that was the last one.
	fn release(&mut self, child: NodeId) -> bool {
		match self.nodes.get_mut(&child) {
			Some(node) => {
				node.references = node.references.saturating_sub(1);
				if node.references > 0 {
					trace!("Node {} is still referenced elsewhere. Keeping its binding.", child);
				}
				node.references == 0
			}
			None => false,
		}
	}

	/// Inserts the element of the child at `index` of `list` before the next sibling that is still attached.
	fn attach_child(&mut self, list: NodeId, owner: NodeId, index: usize) -> Result<(), UpdateError> {
		let child = match &self.list_items(list)?[index] {
			Entry::Node(child) => *child,
			Entry::Value(_) => {
				return Err(UpdateError::Protocol {
					node: list,
					reason: format!("{} can only contain nodes", CHILDREN),
				})
			}
		};
		let parent = self.element_of(owner)?;
		let element = self.ensure_element(child)?;
		let reference = self.list_items(list)?[index + 1..]
			.iter()
			.filter_map(|entry| match entry {
				Entry::Node(sibling) => match &self.nodes.get(sibling)?.binding {
					Binding::Element(element) => Some(element.clone()),
					_ => None,
				},
				Entry::Value(_) => None,
			})
			.find(|sibling| self.dom.parent_element(sibling).as_ref() == Some(&parent));
		Ok(self.dom.insert_before(&parent, &element, reference.as_ref())?)
	}

	fn detach_child(&self, parent: &D::Element, child: NodeId) -> Result<(), UpdateError> {
		if let Some(Binding::Element(element)) = self.nodes.get(&child).map(|node| &node.binding) {
			if self.dom.parent_element(element).as_ref() == Some(parent) {
				self.dom.remove_child(parent, element)?;
			} else {
				warn!("The element of node {} was already detached by someone else. Skipping its removal.", child);
			}
		}
		Ok(())
	}

	fn update_class(&self, list: NodeId, owner: NodeId) -> Result<(), UpdateError> {
		let classes = self
			.list_items(list)?
			.iter()
			.filter_map(|entry| match entry {
				Entry::Value(Value::String(class)) => Some(class.clone()),
				Entry::Value(Value::Null) | Entry::Node(_) => None,
				Entry::Value(other) => Some(other.to_string()),
			})
			.collect::<Vec<_>>()
			.join(" ");
		let element = self.element_of(owner)?;
		Ok(self.dom.set_attribute(&element, "class", &classes)?)
	}

	fn listen_entry(&mut self, owner: NodeId, entry: &Entry) -> Result<(), UpdateError> {
		match entry {
			Entry::Value(Value::String(event_type)) => self.listen(owner, event_type),
			_ => Err(UpdateError::Protocol {
				node: owner,
				reason: format!("{} can only contain event type names", LISTENERS),
			}),
		}
	}

	fn listen(&mut self, owner: NodeId, event_type: &str) -> Result<(), UpdateError> {
		let element = self.element_of(owner)?;
		let handler = self.event_handler(owner, event_type);
		let dom = &self.dom;
		let node = self.nodes.get_mut(&owner).ok_or(UpdateError::UnknownNode(owner))?;
		let (listener, added) = node.listeners.increment_or_insert_with(event_type.to_owned(), || None).map_err(|error| UpdateError::Protocol {
			node: owner,
			reason: error.to_string(),
		})?;
		if added {
			*listener = Some(dom.add_event_listener(&element, event_type, handler)?);
			trace!("Listening for {:?} on node {}.", event_type, owner);
		}
		Ok(())
	}

	fn unlisten(&mut self, owner: NodeId, event_type: &str) -> Result<(), UpdateError> {
		let element = self.element_of(owner)?;
		let node = self.nodes.get_mut(&owner).ok_or(UpdateError::UnknownNode(owner))?;
		match node.listeners.weak_decrement(event_type) {
			Ok(Some(_)) => (),
			Ok(None) => warn!("No listener for {:?} on node {}.", event_type, owner),
			Err(error) => error!("Listener for {:?} on node {}: {}", event_type, owner, error),
		}
		let freed: Vec<_> = node.listeners.drain_weak().collect();
		trace!("Freed {} event listener(s).", freed.len());
		for (event_type, listener) in freed {
			if let Some(listener) = listener {
				self.dom.remove_event_listener(&element, &event_type, listener)?;
			}
		}
		Ok(())
	}

	fn event_handler(&self, owner: NodeId, event_type: &str) -> EventHandler<D> {
		let this = self.this.clone();
		let event_type = event_type.to_owned();
		Rc::new(move |event: &D::Event| {
			let span = trace_span!("event", node = owner, event_type = %event_type);
			let _enter = span.enter();

			let shared = match this.upgrade() {
				Some(shared) => shared,
				None => return warn!("Event received after the updater was dropped. Ignoring."),
			};
			let mut shared = match shared.try_borrow_mut() {
				Ok(shared) => shared,
				Err(_) => return error!("Event received while the updater was busy. Dropping it."),
			};
			shared.forward_event(owner, &event_type, event);
		})
	}

	fn event_data_expressions(&self, owner: NodeId, event_type: &str) -> Vec<String> {
		let list = match self.map_entry(owner, EVENT_DATA) {
			Some(Entry::Node(event_data)) => match self.map_entry(*event_data, event_type) {
				Some(Entry::Node(list)) => *list,
				_ => return vec![],
			},
			_ => return vec![],
		};
		match self.list_items(list) {
			Ok(items) => items
				.iter()
				.filter_map(|entry| match entry {
					Entry::Value(Value::String(expression)) => Some(expression.clone()),
					_ => None,
				})
				.collect(),
			Err(error) => {
				warn!("Malformed event data for {:?}: {}", event_type, error);
				vec![]
			}
		}
	}

	fn forward_event(&mut self, owner: NodeId, event_type: &str, event: &D::Event) {
		let element = match self.element_of(owner) {
			Ok(element) => element,
			Err(error) => return warn!("Event for a node that is gone: {}. Ignoring.", error),
		};
		let mut data = Map::new();
		for expression in self.event_data_expressions(owner, event_type) {
			match self.dom.evaluate(&expression, event, &element) {
				Ok(value) => drop(data.insert(expression, value)),
				Err(error) => error!("Failed to evaluate event data {:?}: {}", expression, error),
			}
		}
		debug!(data = ?Redacted(&data), "Forwarding event.");
		let options = &self.options;
		self.invocations
			.push(MethodInvocation::event(&options.interface_name, &options.method_name, &options.callback_name, owner, event_type, data));
	}

	fn invoke(&mut self, invocation: &RpcInvocation) -> Result<(), UpdateError> {
		let arguments = invocation
			.arguments
			.iter()
			.map(|argument| match argument {
				RpcArgument::Element(descriptor) => self.element_of(descriptor.node).map(DomValue::Element),
				RpcArgument::Value(value) => Ok(DomValue::Json(value.clone())),
			})
			.collect::<Result<Vec<_>, _>>()?;
		Ok(self.dom.invoke(&invocation.expression, &arguments)?)
	}

	fn release_listeners(&mut self) {
		let dom = &self.dom;
		for node in self.nodes.values_mut() {
			if let Binding::Element(element) = &node.binding {
				for (event_type, listener) in node.listeners.drain() {
					if let Some(Err(error)) = listener.map(|listener| dom.remove_event_listener(element, &event_type, listener)) {
						warn!("Failed to remove event listener {:?}: {}", event_type, error);
					}
				}
			}
		}
	}

	/// Unbinds the root's content and forgets all nodes.
	fn reset(&mut self) -> Result<(), UpdateError> {
		let root = match self.root.take() {
			Some(root) => root,
			None => return Ok(()),
		};
		let keys: Vec<String> = match &self.node(root)?.content {
			Content::Map(map) => map.keys().cloned().collect(),
			Content::List(_) => vec![],
		};
		for key in keys {
			if let Err(error) = self.remove_key(root, &key) {
				warn!("Failed to release {:?} of the root: {}", key, error);
			}
		}
		self.release_listeners();
		self.nodes.clear();
		Ok(())
	}
}
