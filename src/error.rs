use crate::{state_tree::NodeId, value_type::TypeId};
use thiserror::Error;

/// A type id was dereferenced before its descriptor was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Unknown value type id {0}")]
pub struct LookupError(pub TypeId);

/// Registering a value type descriptor failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
	#[error("Value type {0} is already registered with a different shape")]
	Conflict(TypeId),
	#[error("Value type id {0:?} is not an integer")]
	InvalidId(String),
}

/// A server-side state tree mutation was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
	#[error("Unknown state node {0}")]
	UnknownNode(NodeId),
	#[error("State node {node} has no namespace {namespace}")]
	UnknownNamespace { node: NodeId, namespace: u32 },
	#[error("Namespace {namespace} of state node {node} is not a {expected} namespace")]
	WrongNamespaceKind { node: NodeId, namespace: u32, expected: &'static str },
	#[error("State node {0} may own at most one list namespace")]
	MultipleListNamespaces(NodeId),
	#[error("State node {child} is already attached to {parent}")]
	AlreadyAttached { child: NodeId, parent: NodeId },
	#[error("Attaching state node {child} below {parent} would create a cycle")]
	Cycle { child: NodeId, parent: NodeId },
	#[error("List index {index} is out of bounds for length {len}")]
	IndexOutOfBounds { index: usize, len: usize },
	#[error("State node {0} is still attached and can't be disposed")]
	StillAttached(NodeId),
}

/// A [`Dom`](`crate::dom::Dom`) implementation could not carry out an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomError {
	#[error("JavaScript error: {0}")]
	JavaScript(String),
	#[error("Invalid expression {expression:?}: {reason}")]
	Expression { expression: String, reason: String },
	#[error("Value is not {0}")]
	NotA(&'static str),
	#[error("Index {index} is out of bounds for length {len}")]
	IndexOutOfBounds { index: usize, len: usize },
	#[error("Element is not a child of the given parent")]
	NotAChild,
	#[error("Unknown event listener")]
	UnknownListener,
}

/// Applying a change batch failed.
///
/// Any of these leaves the [`TreeUpdater`](`crate::updater::TreeUpdater`) desynchronized.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpdateError {
	#[error("No root element has been bound")]
	NotBound,
	#[error("The client mirror is desynchronized and needs a full resynchronization")]
	Desynchronized,
	#[error(transparent)]
	Lookup(#[from] LookupError),
	#[error(transparent)]
	Type(#[from] TypeError),
	#[error("Change references unknown node {0}")]
	UnknownNode(NodeId),
	#[error("Node {0} was created twice")]
	DuplicateNode(NodeId),
	#[error("Protocol violation at node {node}: {reason}")]
	Protocol { node: NodeId, reason: String },
	#[error(transparent)]
	Dom(#[from] DomError),
}
