//! A headless document.
//!
//! Models just enough of the DOM for the updater: elements with attributes, properties and children,
//! live objects and arrays shared by reference, and synchronous event dispatch that bubbles to ancestors.
//!
//! Elements are never reclaimed. A [`MemoryElement`] stays readable after it is detached or replaced,
//! so the document only grows. Use one per test or per bounded one-shot render, not for a long-lived session.

use super::{
	expression::{self, Expression, Statement},
	Dom, DomValue, EventHandler,
};
use crate::error::DomError;
use core::fmt::{self, Debug, Formatter};
use hashbrown::HashMap;
use serde_json::{Map, Value};
use std::{cell::RefCell, collections::BTreeMap, rc::Rc};
use tracing::{trace, trace_span};

/// Handle to a headless document. Clones share the document.
#[derive(Clone, Default)]
pub struct MemoryDom(Rc<RefCell<Document>>);

impl Debug for MemoryDom {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self.0.try_borrow() {
			Ok(document) => f.debug_struct("MemoryDom").field("elements", &document.elements.len()).finish(),
			Err(_) => f.write_str("MemoryDom { <borrowed> }"),
		}
	}
}

#[derive(Default)]
struct Document {
	elements: Vec<ElementData>,
	next_listener: u64,
}

struct ElementData {
	tag: String,
	attributes: BTreeMap<String, String>,
	properties: HashMap<String, DomValue<MemoryDom>>,
	parent: Option<usize>,
	children: Vec<usize>,
	listeners: Vec<(u64, String, EventHandler<MemoryDom>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryElement(usize);

/// Registration token returned by [`MemoryDom::add_event_listener`](`Dom::add_event_listener`).
#[derive(Debug, PartialEq, Eq)]
pub struct MemoryListener(u64);

#[derive(Debug, Clone)]
enum Live {
	Object(BTreeMap<String, DomValue<MemoryDom>>),
	Array(Vec<DomValue<MemoryDom>>),
}

/// A live object or array. Clones refer to the same instance.
#[derive(Clone)]
pub struct LiveObject(Rc<RefCell<Live>>);

impl PartialEq for LiveObject {
	fn eq(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.0, &other.0)
	}
}

impl Debug for LiveObject {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_tuple("LiveObject").field(&self.to_json()).finish()
	}
}

impl LiveObject {
	#[must_use]
	pub fn new_object() -> Self {
		Self(Rc::new(RefCell::new(Live::Object(BTreeMap::new()))))
	}

	#[must_use]
	pub fn new_array() -> Self {
		Self(Rc::new(RefCell::new(Live::Array(vec![]))))
	}

	#[must_use]
	pub fn is_array(&self) -> bool {
		matches!(*self.0.borrow(), Live::Array(_))
	}

	/// Number of array items or object keys.
	#[must_use]
	pub fn len(&self) -> usize {
		match &*self.0.borrow() {
			Live::Object(object) => object.len(),
			Live::Array(array) => array.len(),
		}
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	#[must_use]
	pub fn get(&self, key: &str) -> Option<DomValue<MemoryDom>> {
		match &*self.0.borrow() {
			Live::Object(object) => object.get(key).cloned(),
			Live::Array(array) => key.parse::<usize>().ok().and_then(|index| array.get(index).cloned()),
		}
	}

	#[must_use]
	pub fn index(&self, index: usize) -> Option<DomValue<MemoryDom>> {
		match &*self.0.borrow() {
			Live::Array(array) => array.get(index).cloned(),
			Live::Object(_) => None,
		}
	}

	/// A structured copy. Elements are represented as empty objects, like `JSON.stringify` does.
	#[must_use]
	pub fn to_json(&self) -> Value {
		match &*self.0.borrow() {
			Live::Object(object) => Value::Object(object.iter().map(|(key, value)| (key.clone(), value_to_json(value))).collect()),
			Live::Array(array) => Value::Array(array.iter().map(value_to_json).collect()),
		}
	}
}

fn value_to_json(value: &DomValue<MemoryDom>) -> Value {
	match value {
		DomValue::Json(value) => value.clone(),
		DomValue::Object(object) => object.to_json(),
		DomValue::Element(_) => Value::Object(Map::new()),
	}
}

/// A synthetic event for [`MemoryDom::dispatch_event`].
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEvent {
	event_type: String,
	fields: Map<String, Value>,
}

impl MemoryEvent {
	#[must_use]
	pub fn new(event_type: impl Into<String>) -> Self {
		Self {
			event_type: event_type.into(),
			fields: Map::new(),
		}
	}

	/// Adds an event property, like `clientX` of a mouse event.
	#[must_use]
	pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
		self.fields.insert(name.into(), value.into());
		self
	}

	#[must_use]
	pub fn event_type(&self) -> &str {
		&self.event_type
	}

	#[must_use]
	pub fn field(&self, name: &str) -> Option<Value> {
		match name {
			"type" => Some(Value::String(self.event_type.clone())),
			_ => self.fields.get(name).cloned(),
		}
	}
}

/// An intermediate value while evaluating an [`Expression`].
#[derive(Debug, Clone)]
enum Evaluated {
	Undefined,
	Value(DomValue<MemoryDom>),
	Event,
}

fn valid_name(name: &str) -> bool {
	!name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == ':' || c == '.')
}

impl MemoryDom {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// How many elements were ever created in this document, detached or not.
	#[must_use]
	pub fn element_count(&self) -> usize {
		self.0.borrow().elements.len()
	}

	fn with_element<T>(&self, element: MemoryElement, f: impl FnOnce(&ElementData) -> T) -> T {
		f(&self.0.borrow().elements[element.0])
	}

	fn with_element_mut<T>(&self, element: MemoryElement, f: impl FnOnce(&mut ElementData) -> T) -> T {
		f(&mut self.0.borrow_mut().elements[element.0])
	}

	#[must_use]
	pub fn has_attribute(&self, element: &MemoryElement, name: &str) -> bool {
		self.with_element(*element, |data| data.attributes.contains_key(name))
	}

	#[must_use]
	pub fn children(&self, element: &MemoryElement) -> Vec<MemoryElement> {
		self.with_element(*element, |data| data.children.iter().copied().map(MemoryElement).collect())
	}

	#[must_use]
	pub fn child_count(&self, element: &MemoryElement) -> usize {
		self.with_element(*element, |data| data.children.len())
	}

	#[must_use]
	pub fn listener_count(&self, element: &MemoryElement) -> usize {
		self.with_element(*element, |data| data.listeners.len())
	}

	/// Reads a declaration from the `style` attribute, or `""` if it isn't set.
	#[must_use]
	pub fn style(&self, element: &MemoryElement, property: &str) -> String {
		self.attribute(element, "style")
			.and_then(|style| {
				style.split(';').find_map(|declaration| {
					let (name, value) = declaration.split_once(':')?;
					(name.trim().eq_ignore_ascii_case(property)).then(|| value.trim().to_owned())
				})
			})
			.unwrap_or_default()
	}

	/// Dispatches `event` at `target`, bubbling through its ancestors.
	///
	/// Returns the number of listeners that were called.
	pub fn dispatch_event(&self, target: &MemoryElement, event: &MemoryEvent) -> usize {
		let span = trace_span!("dispatch_event", ?target, event_type = event.event_type());
		let _enter = span.enter();

		let handlers: Vec<_> = {
			let document = self.0.borrow();
			let mut handlers = vec![];
			let mut current = Some(target.0);
			while let Some(index) = current {
				let data = &document.elements[index];
				handlers.extend(data.listeners.iter().filter(|(_, event_type, _)| *event_type == event.event_type).map(|(_, _, handler)| Rc::clone(handler)));
				current = data.parent;
			}
			handlers
		};
		for handler in &handlers {
			handler(event);
		}
		trace!("Called {} listener(s).", handlers.len());
		handlers.len()
	}

	fn is_ancestor_or_self(&self, ancestor: MemoryElement, element: MemoryElement) -> bool {
		let document = self.0.borrow();
		let mut current = Some(element.0);
		while let Some(index) = current {
			if index == ancestor.0 {
				return true;
			}
			current = document.elements[index].parent;
		}
		false
	}

	fn detach(&self, child: MemoryElement) {
		let mut document = self.0.borrow_mut();
		if let Some(parent) = document.elements[child.0].parent.take() {
			document.elements[parent].children.retain(|&c| c != child.0);
		}
	}

	fn evaluate_expression(&self, source: &str, expression: &Expression, event: Option<&MemoryEvent>, element: Option<&MemoryElement>, arguments: &[DomValue<Self>]) -> Result<Evaluated, DomError> {
		let evaluate = |expression: &Expression| self.evaluate_expression(source, expression, event, element, arguments);
		Ok(match expression {
			Expression::Literal(value) => Evaluated::Value(DomValue::Json(value.clone())),
			Expression::Parameter(index) => arguments.get(*index).cloned().map_or(Evaluated::Undefined, Evaluated::Value),
			Expression::Identifier(name) => match (name.as_str(), event, element) {
				("event", Some(_), _) => Evaluated::Event,
				("element", _, Some(element)) => Evaluated::Value(DomValue::Element(*element)),
				(name, Some(event), _) => event.field(name).map_or(Evaluated::Undefined, |value| Evaluated::Value(DomValue::Json(value))),
				(name, None, _) => {
					return Err(DomError::Expression {
						expression: source.to_owned(),
						reason: format!("{} is not defined", name),
					})
				}
			},
			Expression::Member(target, name) => match evaluate(&**target)? {
				Evaluated::Undefined | Evaluated::Value(DomValue::Json(Value::Null)) => {
					return Err(DomError::Expression {
						expression: source.to_owned(),
						reason: format!("Cannot read property {:?} of undefined or null", name),
					})
				}
				Evaluated::Event => event.and_then(|event| event.field(name)).map_or(Evaluated::Undefined, |value| Evaluated::Value(DomValue::Json(value))),
				Evaluated::Value(DomValue::Element(element)) => match name.as_str() {
					"tagName" => Evaluated::Value(DomValue::Json(Value::String(self.tag_name(&element)))),
					_ => self.property(&element, name).map_or(Evaluated::Undefined, Evaluated::Value),
				},
				Evaluated::Value(DomValue::Object(object)) => match (name.as_str(), object.is_array()) {
					("length", true) => Evaluated::Value(DomValue::Json(Value::from(object.len()))),
					_ => object.get(name).map_or(Evaluated::Undefined, Evaluated::Value),
				},
				Evaluated::Value(DomValue::Json(value)) => match (name.as_str(), &value) {
					("length", Value::Array(array)) => Evaluated::Value(DomValue::Json(Value::from(array.len()))),
					("length", Value::String(string)) => Evaluated::Value(DomValue::Json(Value::from(string.encode_utf16().count()))),
					(name, Value::Object(object)) => object.get(name).cloned().map_or(Evaluated::Undefined, |value| Evaluated::Value(DomValue::Json(value))),
					_ => Evaluated::Undefined,
				},
			},
			Expression::Typeof(target) => {
				let type_name = match evaluate(&**target) {
					Ok(Evaluated::Undefined) => "undefined",
					Err(error) => match &**target {
						// `typeof` of an undeclared identifier doesn't throw.
						Expression::Identifier(_) => "undefined",
						_ => return Err(error),
					},
					Ok(Evaluated::Event) | Ok(Evaluated::Value(DomValue::Object(_))) | Ok(Evaluated::Value(DomValue::Element(_))) => "object",
					Ok(Evaluated::Value(DomValue::Json(value))) => match value {
						Value::Null | Value::Array(_) | Value::Object(_) => "object",
						Value::Bool(_) => "boolean",
						Value::Number(_) => "number",
						Value::String(_) => "string",
					},
				};
				Evaluated::Value(DomValue::Json(Value::from(type_name)))
			}
			Expression::Array(items) => {
				let array = LiveObject::new_array();
				for (index, item) in items.iter().enumerate() {
					let value = match evaluate(item)? {
						Evaluated::Undefined => DomValue::Json(Value::Null),
						Evaluated::Event => DomValue::Json(Value::Object(event.map(|event| event.fields.clone()).unwrap_or_default())),
						Evaluated::Value(value) => value,
					};
					self.array_insert(&array, index, value)?;
				}
				Evaluated::Value(DomValue::Object(array))
			}
		})
	}
}

impl Dom for MemoryDom {
	type Element = MemoryElement;
	type Object = LiveObject;
	type Event = MemoryEvent;
	type Listener = MemoryListener;

	fn create_element(&self, tag: &str) -> Result<MemoryElement, DomError> {
		if !valid_name(tag) {
			return Err(DomError::JavaScript(format!("InvalidCharacterError: {:?} is not a valid tag name", tag)));
		}
		let mut document = self.0.borrow_mut();
		document.elements.push(ElementData {
			tag: tag.to_ascii_uppercase(),
			attributes: BTreeMap::new(),
			properties: HashMap::new(),
			parent: None,
			children: vec![],
			listeners: vec![],
		});
		Ok(MemoryElement(document.elements.len() - 1))
	}

	fn tag_name(&self, element: &MemoryElement) -> String {
		self.with_element(*element, |data| data.tag.clone())
	}

	fn set_attribute(&self, element: &MemoryElement, name: &str, value: &str) -> Result<(), DomError> {
		if !valid_name(name) {
			return Err(DomError::JavaScript(format!("InvalidCharacterError: {:?} is not a valid attribute name", name)));
		}
		self.with_element_mut(*element, |data| data.attributes.insert(name.to_owned(), value.to_owned()));
		Ok(())
	}

	fn remove_attribute(&self, element: &MemoryElement, name: &str) -> Result<(), DomError> {
		self.with_element_mut(*element, |data| data.attributes.remove(name));
		Ok(())
	}

	fn attribute(&self, element: &MemoryElement, name: &str) -> Option<String> {
		self.with_element(*element, |data| data.attributes.get(name).cloned())
	}

	fn set_property(&self, element: &MemoryElement, name: &str, value: DomValue<Self>) -> Result<(), DomError> {
		self.with_element_mut(*element, |data| data.properties.insert(name.to_owned(), value));
		Ok(())
	}

	fn property(&self, element: &MemoryElement, name: &str) -> Option<DomValue<Self>> {
		self.with_element(*element, |data| data.properties.get(name).cloned())
	}

	fn remove_property(&self, element: &MemoryElement, name: &str) -> Result<(), DomError> {
		self.with_element_mut(*element, |data| data.properties.remove(name));
		Ok(())
	}

	fn create_object(&self) -> LiveObject {
		LiveObject::new_object()
	}

	fn create_array(&self) -> LiveObject {
		LiveObject::new_array()
	}

	fn is_array(&self, object: &LiveObject) -> bool {
		object.is_array()
	}

	fn array_len(&self, array: &LiveObject) -> Option<usize> {
		array.is_array().then(|| array.len())
	}

	fn object_set(&self, object: &LiveObject, key: &str, value: DomValue<Self>) -> Result<(), DomError> {
		match &mut *object.0.borrow_mut() {
			Live::Object(object) => {
				object.insert(key.to_owned(), value);
				Ok(())
			}
			Live::Array(_) => Err(DomError::NotA("an object")),
		}
	}

	fn object_remove(&self, object: &LiveObject, key: &str) -> Result<(), DomError> {
		match &mut *object.0.borrow_mut() {
			Live::Object(object) => {
				object.remove(key);
				Ok(())
			}
			Live::Array(_) => Err(DomError::NotA("an object")),
		}
	}

	fn array_insert(&self, array: &LiveObject, index: usize, value: DomValue<Self>) -> Result<(), DomError> {
		match &mut *array.0.borrow_mut() {
			Live::Array(array) if index <= array.len() => {
				array.insert(index, value);
				Ok(())
			}
			Live::Array(array) => Err(DomError::IndexOutOfBounds { index, len: array.len() }),
			Live::Object(_) => Err(DomError::NotA("an array")),
		}
	}

	fn array_remove(&self, array: &LiveObject, index: usize) -> Result<(), DomError> {
		match &mut *array.0.borrow_mut() {
			Live::Array(array) if index < array.len() => {
				array.remove(index);
				Ok(())
			}
			Live::Array(array) => Err(DomError::IndexOutOfBounds { index, len: array.len() }),
			Live::Object(_) => Err(DomError::NotA("an array")),
		}
	}

	fn parent_element(&self, element: &MemoryElement) -> Option<MemoryElement> {
		self.with_element(*element, |data| data.parent.map(MemoryElement))
	}

	fn insert_before(&self, parent: &MemoryElement, child: &MemoryElement, reference: Option<&MemoryElement>) -> Result<(), DomError> {
		if self.is_ancestor_or_self(*child, *parent) {
			return Err(DomError::JavaScript("HierarchyRequestError: The new child is an ancestor of the parent".to_owned()));
		}
		if reference == Some(child) {
			return Ok(());
		}
		if let Some(reference) = reference {
			if self.parent_element(reference) != Some(*parent) {
				return Err(DomError::NotAChild);
			}
		}
		self.detach(*child);
		let mut document = self.0.borrow_mut();
		let children = &mut document.elements[parent.0].children;
		let index = reference.and_then(|reference| children.iter().position(|&c| c == reference.0)).unwrap_or_else(|| children.len());
		children.insert(index, child.0);
		document.elements[child.0].parent = Some(parent.0);
		Ok(())
	}

	fn remove_child(&self, parent: &MemoryElement, child: &MemoryElement) -> Result<(), DomError> {
		if self.parent_element(child) != Some(*parent) {
			return Err(DomError::NotAChild);
		}
		self.detach(*child);
		Ok(())
	}

	fn replace_child(&self, parent: &MemoryElement, new: &MemoryElement, old: &MemoryElement) -> Result<(), DomError> {
		if self.parent_element(old) != Some(*parent) {
			return Err(DomError::NotAChild);
		}
		if new == old {
			return Ok(());
		}
		self.insert_before(parent, new, Some(old))?;
		self.detach(*old);
		Ok(())
	}

	fn add_event_listener(&self, element: &MemoryElement, event_type: &str, handler: EventHandler<Self>) -> Result<MemoryListener, DomError> {
		let mut document = self.0.borrow_mut();
		let id = document.next_listener;
		document.next_listener += 1;
		document.elements[element.0].listeners.push((id, event_type.to_owned(), handler));
		Ok(MemoryListener(id))
	}

	fn remove_event_listener(&self, element: &MemoryElement, _event_type: &str, listener: MemoryListener) -> Result<(), DomError> {
		self.with_element_mut(*element, |data| {
			let before = data.listeners.len();
			data.listeners.retain(|(id, _, _)| *id != listener.0);
			if data.listeners.len() == before {
				Err(DomError::UnknownListener)
			} else {
				Ok(())
			}
		})
	}

	fn evaluate(&self, source: &str, event: &MemoryEvent, element: &MemoryElement) -> Result<Value, DomError> {
		match expression::parse(source)? {
			Statement::Expression(expression) => Ok(match self.evaluate_expression(source, &expression, Some(event), Some(element), &[])? {
				Evaluated::Undefined => Value::Null,
				Evaluated::Event => Value::Object(event.fields.clone()),
				Evaluated::Value(value) => value_to_json(&value),
			}),
			Statement::Assign { .. } => Err(DomError::Expression {
				expression: source.to_owned(),
				reason: "Event data expressions can't assign".to_owned(),
			}),
		}
	}

	fn invoke(&self, source: &str, arguments: &[DomValue<Self>]) -> Result<(), DomError> {
		match expression::parse(source)? {
			Statement::Expression(expression) => self.evaluate_expression(source, &expression, None, None, arguments).map(drop),
			Statement::Assign { target, property, value } => {
				let value = match self.evaluate_expression(source, &value, None, None, arguments)? {
					Evaluated::Value(value) => value,
					Evaluated::Undefined | Evaluated::Event => DomValue::Json(Value::Null),
				};
				match self.evaluate_expression(source, &target, None, None, arguments)? {
					Evaluated::Value(DomValue::Element(element)) => self.set_property(&element, &property, value),
					Evaluated::Value(DomValue::Object(object)) => self.object_set(&object, &property, value),
					_ => Err(DomError::Expression {
						expression: source.to_owned(),
						reason: format!("Cannot set property {:?} of a non-object", property),
					}),
				}
			}
		}
	}
}
