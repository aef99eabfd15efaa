//! Schema descriptors for the data shape of state nodes.
//!
//! A [`ValueTypeMap`] is scoped to one session. The server registers types as it needs them and
//! sends their [`ValueTypeDescriptor`]s ahead of any change that references them; the client
//! [`merge`](`ValueTypeMap::merge`)s those tables before applying node changes.

use crate::error::{LookupError, TypeError};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, iter, sync::Arc};
use tracing::{instrument, trace};

/// Identifies a [`ValueType`] within one [`ValueTypeMap`].
pub type TypeId = u32;

pub const STRING: TypeId = 0;
pub const BOOLEAN: TypeId = 1;
pub const BOOLEAN_PRIMITIVE: TypeId = 2;
pub const INTEGER: TypeId = 3;
pub const INTEGER_PRIMITIVE: TypeId = 4;
pub const NUMBER: TypeId = 5;
pub const NUMBER_PRIMITIVE: TypeId = 6;
/// Opaque values of no particular shape.
pub const ANY: TypeId = 7;
/// Map nodes without declared properties.
pub const OBJECT: TypeId = 8;
/// List nodes of [`ANY`] members.
pub const ARRAY: TypeId = 9;
/// Map nodes that are projected as DOM elements as soon as they are created.
pub const ELEMENT: TypeId = 10;
/// Ids below this are reserved for well-known types.
pub const FIRST_CUSTOM_ID: TypeId = 16;

/// Wire representation of a [`ValueType`].
///
/// Absence of both `properties` and `member` denotes an opaque type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueTypeDescriptor {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub properties: Option<BTreeMap<String, TypeId>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub member: Option<TypeId>,
	#[serde(default, skip_serializing_if = "is_false")]
	pub element: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(value: &bool) -> bool {
	!*value
}

impl ValueTypeDescriptor {
	#[must_use]
	pub fn object(properties: impl IntoIterator<Item = (String, TypeId)>) -> Self {
		Self {
			properties: Some(properties.into_iter().collect()),
			..Self::default()
		}
	}

	#[must_use]
	pub fn list(member: TypeId) -> Self {
		Self {
			member: Some(member),
			..Self::default()
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
enum Kind {
	Primitive { default: Value },
	Object { properties: BTreeMap<String, TypeId>, element: bool },
	List { member: TypeId },
}

/// An immutable, interned schema descriptor.
///
/// Property and member types are stored by id and resolved through the owning [`ValueTypeMap`]
/// on access, which allows mutually recursive types and forward references within one table.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueType {
	id: TypeId,
	kind: Kind,
}

impl ValueType {
	fn primitive(id: TypeId, default: Value) -> Self {
		Self { id, kind: Kind::Primitive { default } }
	}

	fn from_descriptor(id: TypeId, descriptor: &ValueTypeDescriptor) -> Self {
		let kind = match (descriptor.member, &descriptor.properties) {
			(Some(member), _) => Kind::List { member },
			(None, Some(properties)) => Kind::Object {
				properties: properties.clone(),
				element: descriptor.element,
			},
			(None, None) if descriptor.element => Kind::Object {
				properties: BTreeMap::new(),
				element: true,
			},
			(None, None) => Kind::Primitive { default: Value::Null },
		};
		Self { id, kind }
	}

	fn to_descriptor(&self) -> ValueTypeDescriptor {
		match &self.kind {
			Kind::Primitive { .. } => ValueTypeDescriptor::default(),
			Kind::Object { properties, element } => ValueTypeDescriptor {
				properties: Some(properties.clone()),
				member: None,
				element: *element,
			},
			Kind::List { member } => ValueTypeDescriptor::list(*member),
		}
	}

	#[must_use]
	pub fn id(&self) -> TypeId {
		self.id
	}

	/// `null` for composite and list types, a zero value for primitives.
	#[must_use]
	pub fn default_value(&self) -> Value {
		match &self.kind {
			Kind::Primitive { default } => default.clone(),
			Kind::Object { .. } | Kind::List { .. } => Value::Null,
		}
	}

	#[must_use]
	pub fn is_list(&self) -> bool {
		matches!(self.kind, Kind::List { .. })
	}

	#[must_use]
	pub fn is_object(&self) -> bool {
		matches!(self.kind, Kind::Object { .. })
	}

	/// Whether nodes of this type become DOM elements when created.
	#[must_use]
	pub fn is_element(&self) -> bool {
		matches!(self.kind, Kind::Object { element: true, .. })
	}

	/// Resolves the property types of a composite type, or [`None`] if this isn't one.
	///
	/// # Errors
	///
	/// Iff a property references an id that `types` doesn't know (yet).
	pub fn properties(&self, types: &ValueTypeMap) -> Result<Option<BTreeMap<String, Arc<ValueType>>>, LookupError> {
		match &self.kind {
			Kind::Object { properties, .. } => properties
				.iter()
				.map(|(name, &id)| Ok((name.clone(), types.get(id)?)))
				.collect::<Result<_, _>>()
				.map(Some),
			Kind::Primitive { .. } | Kind::List { .. } => Ok(None),
		}
	}

	/// Resolves the member type of a list type, or [`None`] if this isn't one.
	///
	/// # Errors
	///
	/// Iff the member id is unknown to `types`.
	pub fn member_type(&self, types: &ValueTypeMap) -> Result<Option<Arc<ValueType>>, LookupError> {
		match self.kind {
			Kind::List { member } => types.get(member).map(Some),
			Kind::Primitive { .. } | Kind::Object { .. } => Ok(None),
		}
	}
}

/// Per-session registry of [`ValueType`]s.
#[derive(Debug, Clone)]
pub struct ValueTypeMap {
	types: HashMap<TypeId, Arc<ValueType>>,
}

impl Default for ValueTypeMap {
	fn default() -> Self {
		Self::new()
	}
}

impl ValueTypeMap {
	/// Creates a registry containing only the well-known types.
	#[must_use]
	pub fn new() -> Self {
		let mut types = HashMap::new();
		let mut add = |value_type: ValueType| {
			types.insert(value_type.id, Arc::new(value_type));
		};
		add(ValueType::primitive(STRING, Value::Null));
		add(ValueType::primitive(BOOLEAN, Value::Null));
		add(ValueType::primitive(BOOLEAN_PRIMITIVE, Value::Bool(false)));
		add(ValueType::primitive(INTEGER, Value::Null));
		add(ValueType::primitive(INTEGER_PRIMITIVE, Value::from(0)));
		add(ValueType::primitive(NUMBER, Value::Null));
		add(ValueType::primitive(NUMBER_PRIMITIVE, Value::from(0.0)));
		add(ValueType::primitive(ANY, Value::Null));
		add(ValueType::from_descriptor(OBJECT, &ValueTypeDescriptor::object(iter::empty())));
		add(ValueType::from_descriptor(ARRAY, &ValueTypeDescriptor::list(ANY)));
		add(ValueType::from_descriptor(
			ELEMENT,
			&ValueTypeDescriptor {
				element: true,
				..ValueTypeDescriptor::object(iter::empty())
			},
		));
		Self { types }
	}

	/// Installs a type. Re-registering an identical descriptor is a no-op.
	///
	/// # Errors
	///
	/// Iff `id` is already taken by a different shape.
	#[instrument(skip(self))]
	pub fn register(&mut self, id: TypeId, descriptor: &ValueTypeDescriptor) -> Result<Arc<ValueType>, TypeError> {
		let value_type = ValueType::from_descriptor(id, descriptor);
		if let Some(existing) = self.types.get(&id) {
			return if **existing == value_type {
				Ok(Arc::clone(existing))
			} else {
				Err(TypeError::Conflict(id))
			};
		}
		trace!("Registered value type {}.", id);
		let value_type = Arc::new(value_type);
		self.types.insert(id, Arc::clone(&value_type));
		Ok(value_type)
	}

	/// Registers a whole wire table of descriptors keyed by stringified id.
	///
	/// Forward references between the new entries are fine, as they are only resolved on access.
	///
	/// # Errors
	///
	/// Iff a key isn't an integer or a descriptor conflicts with a registered type.
	/// Entries before the failing one stay registered.
	pub fn merge(&mut self, table: &BTreeMap<String, ValueTypeDescriptor>) -> Result<(), TypeError> {
		for (key, descriptor) in table {
			let id = key.parse().map_err(|_| TypeError::InvalidId(key.clone()))?;
			self.register(id, descriptor)?;
		}
		Ok(())
	}

	/// # Errors
	///
	/// Iff no type with this id is registered.
	pub fn get(&self, id: TypeId) -> Result<Arc<ValueType>, LookupError> {
		self.types.get(&id).cloned().ok_or(LookupError(id))
	}

	#[must_use]
	pub fn contains(&self, id: TypeId) -> bool {
		self.types.contains_key(&id)
	}

	/// The wire descriptor of a registered type.
	///
	/// # Errors
	///
	/// Iff no type with this id is registered.
	pub fn descriptor(&self, id: TypeId) -> Result<ValueTypeDescriptor, LookupError> {
		self.get(id).map(|value_type| value_type.to_descriptor())
	}

	/// Ids of all types that were registered explicitly, in ascending order.
	pub fn custom_ids(&self) -> impl Iterator<Item = TypeId> {
		let mut ids: Vec<_> = self.types.keys().copied().filter(|&id| id >= FIRST_CUSTOM_ID).collect();
		ids.sort_unstable();
		ids.into_iter()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn well_known_defaults() {
		let types = ValueTypeMap::new();
		assert_eq!(types.get(INTEGER_PRIMITIVE).unwrap().default_value(), Value::from(0));
		assert_eq!(types.get(BOOLEAN_PRIMITIVE).unwrap().default_value(), Value::Bool(false));
		assert_eq!(types.get(INTEGER).unwrap().default_value(), Value::Null);
		assert_eq!(types.get(STRING).unwrap().default_value(), Value::Null);
		assert!(types.get(ARRAY).unwrap().is_list());
		assert!(types.get(ELEMENT).unwrap().is_element());
		assert!(!types.get(OBJECT).unwrap().is_element());
	}

	#[test]
	fn conflicting_registration() {
		let mut types = ValueTypeMap::new();
		types.register(20, &ValueTypeDescriptor::list(STRING)).unwrap();
		types.register(20, &ValueTypeDescriptor::list(STRING)).unwrap();
		assert_eq!(types.register(20, &ValueTypeDescriptor::list(INTEGER)), Err(TypeError::Conflict(20)));
		assert_eq!(types.register(STRING, &ValueTypeDescriptor::list(INTEGER)), Err(TypeError::Conflict(STRING)));
	}

	#[test]
	fn forward_reference_fails_until_registered() {
		let mut types = ValueTypeMap::new();
		let list = types.register(20, &ValueTypeDescriptor::list(21)).unwrap();
		assert_eq!(list.member_type(&types), Err(LookupError(21)));
		let member = types.register(21, &ValueTypeDescriptor::object(vec![("next".to_owned(), 20)])).unwrap();
		assert!(Arc::ptr_eq(&list.member_type(&types).unwrap().unwrap(), &member));
		let recursive = member.properties(&types).unwrap().unwrap();
		assert!(Arc::ptr_eq(&recursive["next"], &list));
	}
}
