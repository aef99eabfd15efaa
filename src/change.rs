//! The synchronization protocol: node changes, batches and invocations in both directions.
//!
//! All of these (de)serialize to the JSON shapes exchanged with the server.
//! Key names and `kind` tags are part of the protocol and must not change.

use crate::{
	error::LookupError,
	state_tree::{NamespaceId, NodeId, StateTree},
	value_type::{TypeId, ValueTypeDescriptor, ValueTypeMap},
};
use core::convert::TryFrom;
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

/// Reserved key: Tag name of the element a map node is projected as.
pub const TAG: &str = "TAG";
/// Reserved key: List node whose members are the element's child elements.
pub const CHILDREN: &str = "CHILDREN";
/// Reserved key: List node whose members make up the `class` attribute.
pub const CLASS_LIST: &str = "CLASS_LIST";
/// Reserved key: List node of event types that are forwarded to the server.
pub const LISTENERS: &str = "LISTENERS";
/// Reserved key: Map node from event type to a list node of event data expressions.
pub const EVENT_DATA: &str = "EVENT_DATA";
/// Prefix of keys that are set as attributes rather than properties.
pub const ATTRIBUTE_PREFIX: &str = "attr.";
/// Key that is set as the `style` attribute.
pub const STYLE: &str = "style";

/// One atomic mutation.
///
/// Changes are position-relative and must be applied in the order they were produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum NodeChange {
	#[serde(rename_all = "camelCase")]
	NodeCreate { node_id: NodeId, type_id: TypeId },
	#[serde(rename_all = "camelCase")]
	NodeRemove { node_id: NodeId },
	#[serde(rename_all = "camelCase")]
	Put {
		node_id: NodeId,
		#[serde(default)]
		namespace_id: NamespaceId,
		key: String,
		value: Value,
	},
	#[serde(rename_all = "camelCase")]
	PutListReference {
		node_id: NodeId,
		#[serde(default)]
		namespace_id: NamespaceId,
		key: String,
		#[serde(rename = "value")]
		child: NodeId,
	},
	#[serde(rename_all = "camelCase")]
	PutMapReference {
		node_id: NodeId,
		#[serde(default)]
		namespace_id: NamespaceId,
		key: String,
		#[serde(rename = "value")]
		child: NodeId,
	},
	#[serde(rename_all = "camelCase")]
	Remove {
		node_id: NodeId,
		#[serde(default)]
		namespace_id: NamespaceId,
		key: String,
	},
	#[serde(rename_all = "camelCase")]
	ListInsertPrimitive {
		node_id: NodeId,
		#[serde(default)]
		namespace_id: NamespaceId,
		index: usize,
		#[serde(rename = "value")]
		values: Vec<Value>,
	},
	#[serde(rename_all = "camelCase")]
	ListInsertNode {
		node_id: NodeId,
		#[serde(default)]
		namespace_id: NamespaceId,
		index: usize,
		#[serde(rename = "value")]
		child: NodeId,
	},
	#[serde(rename_all = "camelCase")]
	ListRemove {
		node_id: NodeId,
		#[serde(default)]
		namespace_id: NamespaceId,
		index: usize,
	},
}

impl NodeChange {
	/// The node this change is applied to.
	#[must_use]
	pub fn node_id(&self) -> NodeId {
		match *self {
			NodeChange::NodeCreate { node_id, .. }
			| NodeChange::NodeRemove { node_id }
			| NodeChange::Put { node_id, .. }
			| NodeChange::PutListReference { node_id, .. }
			| NodeChange::PutMapReference { node_id, .. }
			| NodeChange::Remove { node_id, .. }
			| NodeChange::ListInsertPrimitive { node_id, .. }
			| NodeChange::ListInsertNode { node_id, .. }
			| NodeChange::ListRemove { node_id, .. } => node_id,
		}
	}
}

/// Reference to an element-bound node, as used in [`RpcInvocation`] arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ElementDescriptor {
	pub node: NodeId,
	#[serde(default)]
	pub template: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcArgument {
	Element(ElementDescriptor),
	Value(Value),
}

/// A server-to-client call, serialized as `[expression, argument...]`.
///
/// Arguments are bound to `$0`, `$1`… in `expression`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub struct RpcInvocation {
	pub expression: String,
	pub arguments: Vec<RpcArgument>,
}

impl TryFrom<Vec<Value>> for RpcInvocation {
	type Error = String;

	fn try_from(values: Vec<Value>) -> Result<Self, Self::Error> {
		let mut values = values.into_iter();
		let expression = match values.next() {
			Some(Value::String(expression)) => expression,
			other => return Err(format!("Expected invocation expression string but found {:?}", other)),
		};
		let arguments = values
			.map(|value| match serde_json::from_value::<ElementDescriptor>(value.clone()) {
				Ok(descriptor) if value.is_object() => RpcArgument::Element(descriptor),
				_ => RpcArgument::Value(value),
			})
			.collect();
		Ok(Self { expression, arguments })
	}
}

impl From<RpcInvocation> for Vec<Value> {
	fn from(invocation: RpcInvocation) -> Self {
		let mut values = vec![Value::String(invocation.expression)];
		values.extend(invocation.arguments.into_iter().map(|argument| match argument {
			RpcArgument::Element(descriptor) => serde_json::to_value(descriptor).unwrap_or(Value::Null),
			RpcArgument::Value(value) => value,
		}));
		values
	}
}

/// Default [`MethodInvocation::interface_name`] of forwarded events.
pub const CALLBACK_RPC_INTERFACE: &str = "JavaScriptCallbackRpc";
/// Default [`MethodInvocation::method_name`] of forwarded events.
pub const CALLBACK_RPC_METHOD: &str = "call";
/// Default [`MethodInvocation::callback_name`] of forwarded events.
pub const EVENT_CALLBACK: &str = "vEvent";

/// A client-to-server call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodInvocation {
	pub interface_name: String,
	pub method_name: String,
	pub callback_name: String,
	pub parameters: Vec<Value>,
}

impl MethodInvocation {
	/// Creates a forwarded event with parameters `[node_id, event_type, event_data]`.
	#[must_use]
	pub fn event(interface_name: &str, method_name: &str, callback_name: &str, node_id: NodeId, event_type: &str, event_data: Map<String, Value>) -> Self {
		Self {
			interface_name: interface_name.to_owned(),
			method_name: method_name.to_owned(),
			callback_name: callback_name.to_owned(),
			parameters: vec![Value::from(node_id), Value::from(event_type), Value::Object(event_data)],
		}
	}

	#[must_use]
	pub fn node_id(&self) -> Option<NodeId> {
		self.parameters.get(0)?.as_u64().and_then(|id| NodeId::try_from(id).ok())
	}

	#[must_use]
	pub fn event_type(&self) -> Option<&str> {
		self.parameters.get(1)?.as_str()
	}

	#[must_use]
	pub fn event_data(&self) -> Option<&Map<String, Value>> {
		self.parameters.get(2)?.as_object()
	}
}

/// Everything exchanged in one synchronization round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBatch {
	/// New value type descriptors keyed by stringified type id.
	#[serde(default)]
	pub value_types: BTreeMap<String, ValueTypeDescriptor>,
	/// Nodes that changed their value type, as stringified node id → type id.
	#[serde(default)]
	pub type_changes: BTreeMap<String, TypeId>,
	#[serde(default)]
	pub changes: Vec<NodeChange>,
	#[serde(default)]
	pub invocations: Vec<RpcInvocation>,
}

impl ChangeBatch {
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.value_types.is_empty() && self.type_changes.is_empty() && self.changes.is_empty() && self.invocations.is_empty()
	}
}

/// Produces [`ChangeBatch`]es from a [`StateTree`], sending each value type descriptor once.
#[derive(Debug, Default)]
pub struct ChangeCollector {
	sent_types: HashSet<TypeId>,
	pending_types: Vec<TypeId>,
	pending_invocations: Vec<RpcInvocation>,
	collected_invocations: usize,
}

impl ChangeCollector {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Queues a call that is sent after the structural changes of the next batch.
	pub fn invoke(&mut self, invocation: RpcInvocation) {
		self.pending_invocations.push(invocation);
	}

	/// Collects the current changes of `tree` along with all custom types not sent before.
	///
	/// Nothing is committed until [`commit`](`ChangeCollector::commit`) is called.
	///
	/// # Errors
	///
	/// Iff a registered type id vanished from `types`.
	#[instrument(skip(self, tree, types))]
	pub fn collect(&mut self, tree: &StateTree, types: &ValueTypeMap) -> Result<ChangeBatch, LookupError> {
		let mut batch = ChangeBatch::default();
		self.pending_types.clear();
		let sent_types = &self.sent_types;
		let new_types: Vec<TypeId> = types.custom_ids().filter(|id| !sent_types.contains(id)).collect();
		for id in new_types {
			batch.value_types.insert(id.to_string(), types.descriptor(id)?);
			self.pending_types.push(id);
		}
		tree.collect_changes(|change| batch.changes.push(change));
		batch.invocations = self.pending_invocations.clone();
		self.collected_invocations = batch.invocations.len();
		debug!(
			"Collected {} change(s), {} type(s) and {} invocation(s).",
			batch.changes.len(),
			batch.value_types.len(),
			batch.invocations.len()
		);
		Ok(batch)
	}

	/// Marks the last collected batch as delivered.
	#[instrument(skip(self, tree))]
	pub fn commit(&mut self, tree: &mut StateTree) {
		self.sent_types.extend(self.pending_types.drain(..));
		self.pending_invocations.drain(..self.collected_invocations);
		self.collected_invocations = 0;
		tree.reset_changes();
	}
}
