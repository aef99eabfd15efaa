//! [`Dom`] implementation for a browser document, through [`web_sys`].

use super::{Dom, DomValue, EventHandler};
use crate::error::DomError;
use js_sys::{Array, Function, Object, Reflect, JSON};
use serde_json::Value;
use tracing::{instrument, trace};
use wasm_bindgen::{closure::Closure, JsCast, JsValue};

impl From<JsValue> for DomError {
	fn from(value: JsValue) -> Self {
		match value.dyn_ref::<js_sys::Error>() {
			Some(error) => DomError::JavaScript(format!("{}: {}", String::from(error.name()), String::from(error.message()))),
			None => DomError::JavaScript(format!("{:?}", value)),
		}
	}
}

#[derive(Debug, Clone)]
pub struct WebDom {
	document: web_sys::Document,
}

impl WebDom {
	/// Uses the current window's document.
	///
	/// # Errors
	///
	/// Iff there is no window or it has no document.
	pub fn new() -> Result<Self, DomError> {
		let document = web_sys::window()
			.ok_or(DomError::NotA("window"))?
			.document()
			.ok_or(DomError::NotA("document"))?;
		Ok(Self::with_document(document))
	}

	#[must_use]
	pub fn with_document(document: web_sys::Document) -> Self {
		Self { document }
	}

	#[must_use]
	pub fn document(&self) -> &web_sys::Document {
		&self.document
	}
}

fn to_js(value: &Value) -> Result<JsValue, DomError> {
	match value {
		Value::Null => Ok(JsValue::NULL),
		Value::Bool(bool) => Ok(JsValue::from_bool(*bool)),
		Value::String(string) => Ok(JsValue::from_str(string)),
		Value::Number(number) => Ok(number.as_f64().map_or(JsValue::NULL, JsValue::from_f64)),
		Value::Array(_) | Value::Object(_) => {
			let json = serde_json::to_string(value).map_err(|error| DomError::JavaScript(error.to_string()))?;
			Ok(JSON::parse(&json)?)
		}
	}
}

fn to_json(value: &JsValue) -> Result<Value, DomError> {
	if value.is_undefined() || value.is_null() {
		return Ok(Value::Null);
	}
	let json = JSON::stringify(value)?;
	match json.as_string() {
		Some(json) => serde_json::from_str(&json).map_err(|error| DomError::JavaScript(error.to_string())),
		None => Ok(Value::Null),
	}
}

fn dom_value_to_js(value: &DomValue<WebDom>) -> Result<JsValue, DomError> {
	match value {
		DomValue::Json(value) => to_js(value),
		DomValue::Object(object) => Ok(object.clone()),
		DomValue::Element(element) => Ok(element.clone().into()),
	}
}

fn compile(parameters: &str, body: &str) -> Result<Function, DomError> {
	// Function constructors run sloppy, which `with` needs.
	js_sys::eval(&format!("(function ({}) {{ {} }})", parameters, body))?
		.dyn_into::<Function>()
		.map_err(|_| DomError::NotA("function"))
}

fn splice(array: &JsValue, arguments: &Array) -> Result<(), DomError> {
	let splice = Reflect::get(array, &JsValue::from_str("splice"))?.dyn_into::<Function>().map_err(|_| DomError::NotA("an array"))?;
	splice.apply(array, arguments)?;
	Ok(())
}

impl Dom for WebDom {
	type Element = web_sys::Element;
	type Object = JsValue;
	type Event = web_sys::Event;
	type Listener = Closure<dyn Fn(web_sys::Event)>;

	fn create_element(&self, tag: &str) -> Result<web_sys::Element, DomError> {
		Ok(self.document.create_element(tag)?)
	}

	fn tag_name(&self, element: &web_sys::Element) -> String {
		element.tag_name()
	}

	fn set_attribute(&self, element: &web_sys::Element, name: &str, value: &str) -> Result<(), DomError> {
		Ok(element.set_attribute(name, value)?)
	}

	fn remove_attribute(&self, element: &web_sys::Element, name: &str) -> Result<(), DomError> {
		Ok(element.remove_attribute(name)?)
	}

	fn attribute(&self, element: &web_sys::Element, name: &str) -> Option<String> {
		element.get_attribute(name)
	}

	fn set_property(&self, element: &web_sys::Element, name: &str, value: DomValue<Self>) -> Result<(), DomError> {
		Reflect::set(element, &JsValue::from_str(name), &dom_value_to_js(&value)?)?;
		Ok(())
	}

	fn property(&self, element: &web_sys::Element, name: &str) -> Option<DomValue<Self>> {
		let value = Reflect::get(element, &JsValue::from_str(name)).ok()?;
		if value.is_undefined() {
			None
		} else if let Some(element) = value.dyn_ref::<web_sys::Element>() {
			Some(DomValue::Element(element.clone()))
		} else if value.is_object() {
			Some(DomValue::Object(value))
		} else {
			to_json(&value).ok().map(DomValue::Json)
		}
	}

	fn remove_property(&self, element: &web_sys::Element, name: &str) -> Result<(), DomError> {
		Reflect::delete_property(element, &JsValue::from_str(name))?;
		Ok(())
	}

	fn create_object(&self) -> JsValue {
		Object::new().into()
	}

	fn create_array(&self) -> JsValue {
		Array::new().into()
	}

	fn is_array(&self, object: &JsValue) -> bool {
		Array::is_array(object)
	}

	fn array_len(&self, array: &JsValue) -> Option<usize> {
		array.dyn_ref::<Array>().filter(|array| Array::is_array(array)).map(|array| array.length() as usize)
	}

	fn object_set(&self, object: &JsValue, key: &str, value: DomValue<Self>) -> Result<(), DomError> {
		if Array::is_array(object) {
			return Err(DomError::NotA("an object"));
		}
		Reflect::set(object, &JsValue::from_str(key), &dom_value_to_js(&value)?)?;
		Ok(())
	}

	fn object_remove(&self, object: &JsValue, key: &str) -> Result<(), DomError> {
		let object = object.dyn_ref::<Object>().filter(|object| !Array::is_array(object)).ok_or(DomError::NotA("an object"))?;
		Reflect::delete_property(object, &JsValue::from_str(key))?;
		Ok(())
	}

	fn array_insert(&self, array: &JsValue, index: usize, value: DomValue<Self>) -> Result<(), DomError> {
		let len = self.array_len(array).ok_or(DomError::NotA("an array"))?;
		if index > len {
			return Err(DomError::IndexOutOfBounds { index, len });
		}
		splice(array, &Array::of3(&JsValue::from_f64(index as f64), &JsValue::from_f64(0.0), &dom_value_to_js(&value)?))
	}

	fn array_remove(&self, array: &JsValue, index: usize) -> Result<(), DomError> {
		let len = self.array_len(array).ok_or(DomError::NotA("an array"))?;
		if index >= len {
			return Err(DomError::IndexOutOfBounds { index, len });
		}
		splice(array, &Array::of2(&JsValue::from_f64(index as f64), &JsValue::from_f64(1.0)))
	}

	fn parent_element(&self, element: &web_sys::Element) -> Option<web_sys::Element> {
		element.parent_element()
	}

	fn insert_before(&self, parent: &web_sys::Element, child: &web_sys::Element, reference: Option<&web_sys::Element>) -> Result<(), DomError> {
		let reference: Option<&web_sys::Node> = reference.map(|reference| &**reference);
		parent.insert_before(child, reference)?;
		Ok(())
	}

	fn remove_child(&self, parent: &web_sys::Element, child: &web_sys::Element) -> Result<(), DomError> {
		parent.remove_child(child)?;
		Ok(())
	}

	fn replace_child(&self, parent: &web_sys::Element, new: &web_sys::Element, old: &web_sys::Element) -> Result<(), DomError> {
		parent.replace_child(new, old)?;
		Ok(())
	}

	#[instrument(skip(self, handler))]
	fn add_event_listener(&self, element: &web_sys::Element, event_type: &str, handler: EventHandler<Self>) -> Result<Self::Listener, DomError> {
		let listener = Closure::wrap(Box::new(move |event: web_sys::Event| handler(&event)) as Box<dyn Fn(web_sys::Event)>);
		element.add_event_listener_with_callback(event_type, listener.as_ref().unchecked_ref())?;
		trace!("Added event listener.");
		Ok(listener)
	}

	#[instrument(skip(self, listener))]
	fn remove_event_listener(&self, element: &web_sys::Element, event_type: &str, listener: Self::Listener) -> Result<(), DomError> {
		element.remove_event_listener_with_callback(event_type, listener.as_ref().unchecked_ref())?;
		trace!("Removed event listener.");
		Ok(())
	}

	fn evaluate(&self, expression: &str, event: &web_sys::Event, element: &web_sys::Element) -> Result<Value, DomError> {
		let function = compile("event, element", &format!("with (event) {{ return ({}); }}", expression))?;
		to_json(&function.call2(&JsValue::UNDEFINED, event, element)?)
	}

	fn invoke(&self, expression: &str, arguments: &[DomValue<Self>]) -> Result<(), DomError> {
		let parameters = (0..arguments.len()).map(|index| format!("${}", index)).collect::<Vec<_>>().join(", ");
		let function = compile(&parameters, expression)?;
		let values = Array::new();
		for argument in arguments {
			values.push(&dom_value_to_js(argument)?);
		}
		function.apply(&JsValue::UNDEFINED, &values)?;
		Ok(())
	}
}
