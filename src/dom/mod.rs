//! The DOM operations the [`TreeUpdater`](`crate::updater::TreeUpdater`) needs.
//!
//! Implementations are handles with interior mutability, like the browser's DOM itself:
//! All methods take `&self`, and cloning an implementation yields another handle to the same document.
//!
//! - [`web::WebDom`] drives a real document through [`web_sys`].
//! - [`memory::MemoryDom`] is a headless document for tests and bounded server-side projection. It never frees elements.

use crate::error::DomError;
use core::fmt::Debug;
use serde_json::Value;
use std::rc::Rc;

pub mod expression;
pub mod memory;
pub mod web;

/// A value that can be stored in a property or in a live object or array.
#[derive(Debug, Clone)]
pub enum DomValue<D: Dom> {
	/// A plain value, stored as structured copy.
	Json(Value),
	/// A live object or array, stored by reference.
	Object(D::Object),
	Element(D::Element),
}

impl<D: Dom> From<Value> for DomValue<D> {
	fn from(value: Value) -> Self {
		DomValue::Json(value)
	}
}

impl<D: Dom> DomValue<D> {
	#[must_use]
	pub fn as_json(&self) -> Option<&Value> {
		match self {
			DomValue::Json(value) => Some(value),
			DomValue::Object(_) | DomValue::Element(_) => None,
		}
	}

	#[must_use]
	pub fn as_object(&self) -> Option<&D::Object> {
		match self {
			DomValue::Object(object) => Some(object),
			DomValue::Json(_) | DomValue::Element(_) => None,
		}
	}
}

/// Called synchronously for each dispatched event a listener was registered for.
pub type EventHandler<D> = Rc<dyn Fn(&<D as Dom>::Event)>;

/// A document the updater can project a state tree onto.
pub trait Dom: Clone + Debug + 'static {
	type Element: Clone + PartialEq + Debug + 'static;
	/// A live object or array.
	type Object: Clone + Debug + 'static;
	type Event: Debug + 'static;
	/// Keeps a registered event listener alive. Pass it back to [`Dom::remove_event_listener`] to unregister it.
	type Listener: Debug + 'static;

	/// # Errors
	///
	/// Iff the tag name is invalid.
	fn create_element(&self, tag: &str) -> Result<Self::Element, DomError>;

	/// The upper-case tag name, as reported by [***Element.tagName***](https://developer.mozilla.org/en-US/docs/Web/API/Element/tagName) for HTML elements.
	fn tag_name(&self, element: &Self::Element) -> String;

	/// # Errors
	///
	/// Iff the attribute name is invalid.
	fn set_attribute(&self, element: &Self::Element, name: &str, value: &str) -> Result<(), DomError>;

	/// # Errors
	///
	/// Iff the attribute name is invalid.
	fn remove_attribute(&self, element: &Self::Element, name: &str) -> Result<(), DomError>;

	fn attribute(&self, element: &Self::Element, name: &str) -> Option<String>;

	/// # Errors
	///
	/// Iff the property can't be assigned.
	fn set_property(&self, element: &Self::Element, name: &str, value: DomValue<Self>) -> Result<(), DomError>;

	/// Reads a property, or [`None`] if it is `undefined`.
	fn property(&self, element: &Self::Element, name: &str) -> Option<DomValue<Self>>;

	/// # Errors
	///
	/// Iff the property can't be deleted.
	fn remove_property(&self, element: &Self::Element, name: &str) -> Result<(), DomError>;

	fn create_object(&self) -> Self::Object;
	fn create_array(&self) -> Self::Object;
	fn is_array(&self, object: &Self::Object) -> bool;

	/// The length of `array`, or [`None`] if it isn't an array.
	fn array_len(&self, array: &Self::Object) -> Option<usize>;

	/// # Errors
	///
	/// Iff `object` is an array or the value can't be assigned.
	fn object_set(&self, object: &Self::Object, key: &str, value: DomValue<Self>) -> Result<(), DomError>;

	/// # Errors
	///
	/// Iff `object` is an array.
	fn object_remove(&self, object: &Self::Object, key: &str) -> Result<(), DomError>;

	/// # Errors
	///
	/// Iff `array` isn't an array or `index` is greater than its length.
	fn array_insert(&self, array: &Self::Object, index: usize, value: DomValue<Self>) -> Result<(), DomError>;

	/// # Errors
	///
	/// Iff `array` isn't an array or `index` is out of bounds.
	fn array_remove(&self, array: &Self::Object, index: usize) -> Result<(), DomError>;

	fn parent_element(&self, element: &Self::Element) -> Option<Self::Element>;

	/// Inserts (or moves) `child` into `parent` before `reference`, or at the end if that is [`None`].
	///
	/// # Errors
	///
	/// Iff `reference` isn't a child of `parent` or the insertion would be cyclic.
	fn insert_before(&self, parent: &Self::Element, child: &Self::Element, reference: Option<&Self::Element>) -> Result<(), DomError>;

	/// # Errors
	///
	/// Iff `child` isn't a child of `parent`.
	fn remove_child(&self, parent: &Self::Element, child: &Self::Element) -> Result<(), DomError>;

	/// # Errors
	///
	/// Iff `old` isn't a child of `parent`.
	fn replace_child(&self, parent: &Self::Element, new: &Self::Element, old: &Self::Element) -> Result<(), DomError>;

	/// # Errors
	///
	/// Iff the listener can't be registered.
	fn add_event_listener(&self, element: &Self::Element, event_type: &str, handler: EventHandler<Self>) -> Result<Self::Listener, DomError>;

	/// # Errors
	///
	/// Iff the listener can't be unregistered.
	fn remove_event_listener(&self, element: &Self::Element, event_type: &str, listener: Self::Listener) -> Result<(), DomError>;

	/// Evaluates an event data expression with `event` and `element` in scope.
	///
	/// Free identifiers resolve against the event first, so a plain property name like `clientX` reads that event property.
	///
	/// # Errors
	///
	/// Iff evaluation throws or the result can't be represented as JSON.
	fn evaluate(&self, expression: &str, event: &Self::Event, element: &Self::Element) -> Result<Value, DomError>;

	/// Runs an invocation expression with `arguments` bound to `$0`, `$1`, ….
	///
	/// # Errors
	///
	/// Iff evaluation throws.
	fn invoke(&self, expression: &str, arguments: &[DomValue<Self>]) -> Result<(), DomError>;
}
