#![cfg(not(target_arch = "wasm32"))]

use proptest::prelude::*;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;
use twig_dom::{
	change::{ChangeBatch, ChangeCollector, ElementDescriptor, NodeChange, RpcArgument, RpcInvocation, CHILDREN, CLASS_LIST, LISTENERS, TAG},
	dom::{
		memory::{MemoryDom, MemoryElement, MemoryEvent},
		Dom, DomValue,
	},
	state_tree::{NodeId, StateTree, StateValue, ROOT},
	updater::{TreeUpdater, UpdaterOptions},
	value_type::{ValueTypeDescriptor, ValueTypeMap, ELEMENT, OBJECT, STRING},
};

fn init_log() {
	let _ = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_test_writer().try_init();
}

/// A server session and a client mirroring it.
struct Session {
	tree: StateTree,
	types: ValueTypeMap,
	collector: ChangeCollector,
	dom: MemoryDom,
	root: MemoryElement,
	updater: TreeUpdater<MemoryDom>,
}

impl Session {
	fn new() -> Self {
		init_log();
		let dom = MemoryDom::new();
		let root = dom.create_element("body").unwrap();
		let mut updater = TreeUpdater::new(dom.clone(), UpdaterOptions::default());
		updater.bind_root(ROOT, root).unwrap();
		Self {
			tree: StateTree::new(),
			types: ValueTypeMap::new(),
			collector: ChangeCollector::new(),
			dom,
			root,
			updater,
		}
	}

	/// Sends all pending changes through JSON, as a transport would.
	fn sync(&mut self) -> ChangeBatch {
		let batch = self.collector.collect(&self.tree, &self.types).unwrap();
		let json = serde_json::to_string(&batch).unwrap();
		self.updater.apply_batch(&serde_json::from_str(&json).unwrap()).unwrap();
		self.collector.commit(&mut self.tree);
		batch
	}

	fn live_json(&self, name: &str) -> Value {
		match self.dom.property(&self.root, name) {
			Some(DomValue::Object(object)) => object.to_json(),
			other => panic!("Expected a live object in {:?} but found {:?}", name, other),
		}
	}

	fn tags(&self, element: &MemoryElement) -> Vec<String> {
		self.dom.children(element).iter().map(|child| self.dom.tag_name(child)).collect()
	}
}

fn state_json(tree: &StateTree, list: NodeId) -> Value {
	let values = tree.list_values(list, 0).unwrap();
	Value::Array(
		values
			.into_iter()
			.map(|value| match value {
				StateValue::Value(value) => value,
				StateValue::Node(node) => panic!("Unexpected node {} in a primitive list", node),
			})
			.collect(),
	)
}

#[test]
fn elements_round_trip() {
	let mut s = Session::new();
	let children = s.tree.create_list_node();
	s.tree.put_node(ROOT, 0, CHILDREN, children).unwrap();
	for (index, tag) in ["header", "main", "footer"].iter().enumerate() {
		let child = s.tree.create_map_node(OBJECT);
		s.tree.put(child, 0, TAG, *tag).unwrap();
		s.tree.insert_node(children, 0, index, child).unwrap();
	}
	s.sync();
	assert_eq!(s.tags(&s.root), vec!["HEADER", "MAIN", "FOOTER"]);

	let nav = s.tree.create_map_node(OBJECT);
	s.tree.put(nav, 0, TAG, "nav").unwrap();
	s.tree.insert_node(children, 0, 1, nav).unwrap();
	s.tree.remove_at(children, 0, 3).unwrap();
	let batch = s.sync();
	assert_eq!(s.tags(&s.root), vec!["HEADER", "NAV", "MAIN"]);
	assert!(batch.changes.iter().any(|change| matches!(change, NodeChange::NodeRemove { .. })));
}

#[test]
fn nested_content_round_trip() {
	let mut s = Session::new();
	let children = s.tree.create_list_node();
	s.tree.put_node(ROOT, 0, CHILDREN, children).unwrap();

	let list = s.tree.create_map_node(OBJECT);
	s.tree.put(list, 0, TAG, "ul").unwrap();
	s.tree.insert_node(children, 0, 0, list).unwrap();
	let items = s.tree.create_list_node();
	s.tree.put_node(list, 0, CHILDREN, items).unwrap();
	for index in 0..3 {
		let item = s.tree.create_map_node(OBJECT);
		s.tree.put(item, 0, TAG, "li").unwrap();
		s.tree.put(item, 0, "textContent", format!("Item {}", index)).unwrap();
		let classes = s.tree.create_list_node();
		s.tree.insert(classes, 0, 0, "item").unwrap();
		s.tree.put_node(item, 0, CLASS_LIST, classes).unwrap();
		s.tree.insert_node(items, 0, index, item).unwrap();
	}
	s.sync();

	let ul = s.dom.children(&s.root)[0];
	assert_eq!(s.dom.tag_name(&ul), "UL");
	let lis = s.dom.children(&ul);
	assert_eq!(lis.len(), 3);
	for (index, li) in lis.iter().enumerate() {
		assert_eq!(s.dom.tag_name(li), "LI");
		assert_eq!(s.dom.attribute(li, "class").as_deref(), Some("item"));
		assert_eq!(s.dom.property(li, "textContent").and_then(|value| value.as_json().cloned()), Some(json!(format!("Item {}", index))));
	}
}

#[test]
fn events_round_trip() {
	let mut s = Session::new();
	let listeners = s.tree.create_list_node();
	s.tree.insert(listeners, 0, 0, "click").unwrap();
	s.tree.put_node(ROOT, 0, LISTENERS, listeners).unwrap();
	s.sync();

	s.dom.dispatch_event(&s.root, &MemoryEvent::new("click"));
	let json = serde_json::to_value(s.updater.take_invocations()).unwrap();
	assert_eq!(
		json,
		json!([{
			"interfaceName": "JavaScriptCallbackRpc",
			"methodName": "call",
			"callbackName": "vEvent",
			"parameters": [ROOT, "click", {}],
		}])
	);
}

#[test]
fn invocations_run_after_changes() {
	let mut s = Session::new();
	s.tree.put(ROOT, 0, "title", "Before").unwrap();
	s.collector.invoke(RpcInvocation {
		expression: "$0.title = $1".to_owned(),
		arguments: vec![RpcArgument::Element(ElementDescriptor { node: ROOT, template: 0 }), RpcArgument::Value(json!("After"))],
	});
	let batch = s.sync();
	assert_eq!(batch.invocations.len(), 1);
	assert_eq!(s.dom.property(&s.root, "title").and_then(|value| value.as_json().cloned()), Some(json!("After")));

	assert!(s.sync().invocations.is_empty());
}

#[test]
fn value_types_are_sent_once() {
	let mut s = Session::new();
	let mut properties = std::collections::BTreeMap::new();
	properties.insert("title".to_owned(), STRING);
	s.types.register(16, &ValueTypeDescriptor::object(properties)).unwrap();

	let node = s.tree.create_map_node(16);
	s.tree.put_node(ROOT, 0, "model", node).unwrap();
	assert_eq!(s.sync().value_types.len(), 1);
	assert_eq!(s.updater.node_type(node), Some(16));

	s.tree.put(node, 0, "title", "Todos").unwrap();
	assert!(s.sync().value_types.is_empty());
	assert_eq!(s.live_json("model"), json!({"title": "Todos"}));
}

#[test]
fn element_typed_nodes_become_elements_on_creation() {
	let mut s = Session::new();
	let node = s.tree.create_map_node(ELEMENT);
	s.tree.put(node, 0, "width", 640).unwrap();
	s.tree.put_node(ROOT, 0, "canvas", node).unwrap();
	s.sync();

	let canvas = s.updater.element(node).unwrap();
	assert_eq!(s.dom.tag_name(&canvas), "DIV");
	assert!(matches!(s.dom.property(&s.root, "canvas"), Some(DomValue::Element(element)) if element == canvas));
	assert_eq!(s.dom.property(&canvas, "width").and_then(|value| value.as_json().cloned()), Some(json!(640)));
}

#[test]
fn resynchronization_replays_the_whole_tree() {
	let mut s = Session::new();
	let children = s.tree.create_list_node();
	s.tree.put_node(ROOT, 0, CHILDREN, children).unwrap();
	let child = s.tree.create_map_node(OBJECT);
	s.tree.put(child, 0, TAG, "p").unwrap();
	s.tree.insert_node(children, 0, 0, child).unwrap();
	s.sync();

	s.updater.resynchronize().unwrap();
	assert_eq!(s.dom.child_count(&s.root), 0);

	// The server forgets what the client knew by detaching and re-attaching everything below the root.
	s.tree.remove(ROOT, 0, CHILDREN).unwrap();
	s.tree.reset_changes();
	s.tree.put_node(ROOT, 0, CHILDREN, children).unwrap();
	s.sync();
	assert_eq!(s.tags(&s.root), vec!["P"]);
}

#[test]
fn detaching_an_element_releases_its_lists() {
	let mut s = Session::new();
	let children = s.tree.create_list_node();
	s.tree.put_node(ROOT, 0, CHILDREN, children).unwrap();

	// The list element is created before its CHILDREN list and item.
	let ul = s.tree.create_map_node(OBJECT);
	s.tree.put(ul, 0, TAG, "ul").unwrap();
	let items = s.tree.create_list_node();
	let li = s.tree.create_map_node(OBJECT);
	s.tree.put(li, 0, TAG, "li").unwrap();
	s.tree.insert_node(items, 0, 0, li).unwrap();
	s.tree.put_node(ul, 0, CHILDREN, items).unwrap();
	s.tree.insert_node(children, 0, 0, ul).unwrap();

	// The button is created after its LISTENERS list.
	let listeners = s.tree.create_list_node();
	s.tree.insert(listeners, 0, 0, "click").unwrap();
	let button = s.tree.create_map_node(OBJECT);
	s.tree.put(button, 0, TAG, "button").unwrap();
	s.tree.put_node(button, 0, LISTENERS, listeners).unwrap();
	s.tree.insert_node(children, 0, 1, button).unwrap();
	s.sync();

	let ul_element = s.updater.element(ul).unwrap();
	let li_element = s.updater.element(li).unwrap();
	let button_element = s.updater.element(button).unwrap();
	assert_eq!(s.tags(&s.root), vec!["UL", "BUTTON"]);
	assert_eq!(s.dom.listener_count(&button_element), 1);

	s.tree.remove_at(children, 0, 1).unwrap();
	s.tree.remove_at(children, 0, 0).unwrap();
	let batch = s.sync();
	let removed = batch.changes.iter().filter(|change| matches!(change, NodeChange::NodeRemove { .. })).count();
	assert_eq!(removed, 5);
	assert!(!s.updater.is_desynchronized());
	assert_eq!(s.dom.child_count(&s.root), 0);
	assert_eq!(s.dom.parent_element(&ul_element), None);
	assert_eq!(s.dom.parent_element(&li_element), None);
	assert_eq!(s.dom.listener_count(&button_element), 0);
	assert_eq!(s.updater.element(ul), None);

	s.tree.put(ROOT, 0, "title", "Still in sync").unwrap();
	s.sync();
	assert_eq!(s.dom.property(&s.root, "title").and_then(|value| value.as_json().cloned()), Some(json!("Still in sync")));
}

#[test]
fn moving_an_object_between_keys_keeps_it_live() {
	let mut s = Session::new();
	let model = s.tree.create_map_node(OBJECT);
	s.tree.put(model, 0, "title", "old").unwrap();
	s.tree.put_node(ROOT, 0, "a", model).unwrap();
	s.sync();
	assert_eq!(s.live_json("a"), json!({"title": "old"}));

	// The new key is set before the old one is removed, so both refer to the node for a moment.
	s.tree.put(ROOT, 0, "b", 1).unwrap();
	s.tree.remove(ROOT, 0, "a").unwrap();
	s.tree.put_node(ROOT, 0, "b", model).unwrap();
	s.sync();
	assert!(s.dom.property(&s.root, "a").is_none());
	assert_eq!(s.live_json("b"), json!({"title": "old"}));

	s.tree.put(model, 0, "title", "new").unwrap();
	s.sync();
	assert_eq!(s.live_json("b"), json!({"title": "new"}));
}

#[test]
fn moving_a_class_list_between_elements() {
	let mut s = Session::new();
	let children = s.tree.create_list_node();
	s.tree.put_node(ROOT, 0, CHILDREN, children).unwrap();
	let first = s.tree.create_map_node(OBJECT);
	let second = s.tree.create_map_node(OBJECT);
	s.tree.insert_node(children, 0, 0, first).unwrap();
	s.tree.insert_node(children, 0, 1, second).unwrap();
	let classes = s.tree.create_list_node();
	s.tree.insert(classes, 0, 0, "selected").unwrap();
	s.tree.put_node(first, 0, CLASS_LIST, classes).unwrap();
	s.sync();

	s.tree.remove(first, 0, CLASS_LIST).unwrap();
	s.tree.put_node(second, 0, CLASS_LIST, classes).unwrap();
	s.sync();
	s.tree.insert(classes, 0, 1, "focused").unwrap();
	s.sync();

	let first_element = s.updater.element(first).unwrap();
	let second_element = s.updater.element(second).unwrap();
	assert!(!s.dom.has_attribute(&first_element, "class"));
	assert_eq!(s.dom.attribute(&second_element, "class").as_deref(), Some("selected focused"));
}

#[derive(Debug, Clone)]
enum ListOp {
	Insert(usize, String),
	Remove(usize),
}

fn list_op() -> impl Strategy<Value = ListOp> {
	prop_oneof![
		(any::<usize>(), "[a-z]{1,3}").prop_map(|(index, value)| ListOp::Insert(index, value)),
		any::<usize>().prop_map(ListOp::Remove),
	]
}

fn apply_ops(tree: &mut StateTree, list: NodeId, ops: &[ListOp]) {
	for op in ops {
		let len = tree.list_values(list, 0).unwrap().len();
		match op {
			ListOp::Insert(index, value) => tree.insert(list, 0, index % (len + 1), value.as_str()).unwrap(),
			ListOp::Remove(_) if len == 0 => (),
			ListOp::Remove(index) => drop(tree.remove_at(list, 0, index % len).unwrap()),
		}
	}
}

proptest! {
	#[test]
	fn primitive_list_arrives_in_order(values in prop::collection::vec("[a-z]{0,4}", 0..40)) {
		let mut s = Session::new();
		let list = s.tree.create_list_node();
		for (index, value) in values.iter().enumerate() {
			s.tree.insert(list, 0, index, value.as_str()).unwrap();
		}
		s.tree.put_node(ROOT, 0, "items", list).unwrap();
		s.sync();

		prop_assert_eq!(s.live_json("items"), json!(values));
	}

	#[test]
	fn list_edits_replay_faithfully(
		first in prop::collection::vec(list_op(), 0..30),
		second in prop::collection::vec(list_op(), 0..30),
	) {
		let mut s = Session::new();
		let list = s.tree.create_list_node();
		s.tree.put_node(ROOT, 0, "items", list).unwrap();

		apply_ops(&mut s.tree, list, &first);
		s.sync();
		prop_assert_eq!(s.live_json("items"), state_json(&s.tree, list));

		apply_ops(&mut s.tree, list, &second);
		s.sync();
		prop_assert_eq!(s.live_json("items"), state_json(&s.tree, list));
	}

	#[test]
	fn put_then_remove_before_flush_emits_nothing(key in "[a-z]{1,8}", values in prop::collection::vec(any::<i32>(), 1..5)) {
		let mut tree = StateTree::new();
		for value in values {
			tree.put(ROOT, 0, key.as_str(), value).unwrap();
		}
		tree.remove(ROOT, 0, &key).unwrap();

		let mut changes = vec![];
		tree.collect_changes(|change| changes.push(change));
		prop_assert!(changes.is_empty());
		prop_assert!(!tree.has_changes());
	}
}
