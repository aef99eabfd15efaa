use serde_json::json;
use twig_dom::{
	change::{ChangeBatch, NodeChange, RpcArgument, RpcInvocation},
	error::{TreeError, TypeError},
	namespace::NamespaceKind,
	state_tree::{NodeId, StateTree, StateValue, ROOT},
	value_type::{ValueTypeDescriptor, ValueTypeMap, ARRAY, OBJECT, STRING},
};

fn collect(tree: &StateTree) -> Vec<NodeChange> {
	let mut changes = vec![];
	tree.collect_changes(|change| changes.push(change));
	changes
}

fn flush(tree: &mut StateTree) -> Vec<NodeChange> {
	let changes = collect(tree);
	tree.reset_changes();
	changes
}

fn creates(changes: &[NodeChange]) -> Vec<NodeId> {
	changes
		.iter()
		.filter_map(|change| match change {
			NodeChange::NodeCreate { node_id, .. } => Some(*node_id),
			_ => None,
		})
		.collect()
}

#[test]
fn fresh_tree_has_no_changes() {
	let tree = StateTree::new();
	assert!(!tree.has_changes());
	assert!(collect(&tree).is_empty());
	assert_eq!(tree.node(ROOT).unwrap().type_id(), OBJECT);
}

#[test]
fn creates_come_first_in_ascending_order() {
	let mut tree = StateTree::new();
	let list = tree.create_list_node();
	let child = tree.create_map_node(OBJECT);
	tree.put(child, 0, "title", "Hi").unwrap();
	tree.insert_node(list, 0, 0, child).unwrap();
	tree.put_node(ROOT, 0, "items", list).unwrap();

	let changes = flush(&mut tree);
	assert_eq!(
		changes,
		vec![
			NodeChange::NodeCreate { node_id: list, type_id: ARRAY },
			NodeChange::NodeCreate { node_id: child, type_id: OBJECT },
			NodeChange::PutListReference {
				node_id: ROOT,
				namespace_id: 0,
				key: "items".to_owned(),
				child: list,
			},
			NodeChange::ListInsertNode {
				node_id: list,
				namespace_id: 0,
				index: 0,
				child,
			},
			NodeChange::Put {
				node_id: child,
				namespace_id: 0,
				key: "title".to_owned(),
				value: json!("Hi"),
			},
		]
	);
	assert!(!tree.has_changes());
}

#[test]
fn created_and_detached_within_one_window_emits_nothing() {
	let mut tree = StateTree::new();
	let child = tree.create_map_node(OBJECT);
	tree.put_node(ROOT, 0, "child", child).unwrap();
	tree.remove(ROOT, 0, "child").unwrap();

	assert!(collect(&tree).is_empty());
	assert!(!tree.has_changes());
}

#[test]
fn detaching_a_sent_node_removes_it() {
	let mut tree = StateTree::new();
	let child = tree.create_map_node(OBJECT);
	tree.put_node(ROOT, 0, "child", child).unwrap();
	flush(&mut tree);

	tree.remove(ROOT, 0, "child").unwrap();
	assert_eq!(
		flush(&mut tree),
		vec![
			NodeChange::Remove {
				node_id: ROOT,
				namespace_id: 0,
				key: "child".to_owned(),
			},
			NodeChange::NodeRemove { node_id: child },
		]
	);
	assert_eq!(tree.node(child).unwrap().parent(), None);
}

#[test]
fn reattaching_resends_the_whole_subtree() {
	let mut tree = StateTree::new();
	let child = tree.create_map_node(OBJECT);
	tree.put(child, 0, "a", 1).unwrap();
	tree.put(child, 0, "b", 2).unwrap();
	tree.put_node(ROOT, 0, "child", child).unwrap();
	flush(&mut tree);

	tree.remove(ROOT, 0, "child").unwrap();
	flush(&mut tree);

	tree.put_node(ROOT, 0, "again", child).unwrap();
	let changes = flush(&mut tree);
	assert_eq!(creates(&changes), vec![child]);
	let puts = changes
		.iter()
		.filter(|change| matches!(change, NodeChange::Put { node_id, .. } if *node_id == child))
		.count();
	assert_eq!(puts, 2);
}

#[test]
fn attaching_twice_fails() {
	let mut tree = StateTree::new();
	let child = tree.create_map_node(OBJECT);
	tree.put_node(ROOT, 0, "first", child).unwrap();
	assert_eq!(tree.put_node(ROOT, 0, "second", child), Err(TreeError::AlreadyAttached { child, parent: ROOT }));

	// Storing the same child under the same key again is fine.
	tree.put_node(ROOT, 0, "first", child).unwrap();
}

#[test]
fn cycles_are_rejected() {
	let mut tree = StateTree::new();
	let outer = tree.create_map_node(OBJECT);
	let inner = tree.create_map_node(OBJECT);
	tree.put_node(outer, 0, "inner", inner).unwrap();
	assert_eq!(tree.put_node(inner, 0, "outer", outer), Err(TreeError::Cycle { child: outer, parent: inner }));
	assert_eq!(tree.put_node(inner, 0, "root", ROOT), Err(TreeError::Cycle { child: ROOT, parent: inner }));
}

#[test]
fn replacing_a_child_detaches_the_old_one() {
	let mut tree = StateTree::new();
	let old = tree.create_map_node(OBJECT);
	let new = tree.create_map_node(OBJECT);
	tree.put_node(ROOT, 0, "slot", old).unwrap();
	tree.put_node(ROOT, 0, "slot", new).unwrap();
	assert_eq!(tree.node(old).unwrap().parent(), None);
	assert_eq!(tree.node(new).unwrap().parent(), Some(ROOT));

	tree.put(ROOT, 0, "slot", "plain").unwrap();
	assert_eq!(tree.node(new).unwrap().parent(), None);
	assert_eq!(tree.get(ROOT, 0, "slot").unwrap(), Some(StateValue::Value(json!("plain"))));
}

#[test]
fn at_most_one_list_namespace() {
	let mut tree = StateTree::new();
	let result = tree.create_node(STRING, vec![(0, NamespaceKind::List), (1, NamespaceKind::List)]);
	assert!(matches!(result, Err(TreeError::MultipleListNamespaces(_))));

	let node = tree.create_node(OBJECT, vec![(0, NamespaceKind::Map), (1, NamespaceKind::List)]).unwrap();
	tree.insert(node, 1, 0, "x").unwrap();
	assert!(matches!(tree.insert(node, 0, 0, "x"), Err(TreeError::WrongNamespaceKind { .. })));
	assert!(matches!(tree.put(node, 2, "x", 1), Err(TreeError::UnknownNamespace { .. })));
}

#[test]
fn list_bounds_are_checked() {
	let mut tree = StateTree::new();
	let list = tree.create_list_node();
	assert_eq!(tree.insert(list, 0, 1, "x"), Err(TreeError::IndexOutOfBounds { index: 1, len: 0 }));
	assert_eq!(tree.remove_at(list, 0, 0), Err(TreeError::IndexOutOfBounds { index: 0, len: 0 }));
}

#[test]
fn list_changes_merge_primitive_runs() {
	let mut tree = StateTree::new();
	let list = tree.create_list_node();
	tree.put_node(ROOT, 0, "items", list).unwrap();
	for (index, value) in ["a", "b", "c"].iter().enumerate() {
		tree.insert(list, 0, index, *value).unwrap();
	}
	flush(&mut tree);

	tree.remove_at(list, 0, 0).unwrap();
	tree.insert(list, 0, 2, "d").unwrap();
	tree.insert(list, 0, 3, "e").unwrap();
	assert_eq!(
		flush(&mut tree),
		vec![
			NodeChange::ListRemove { node_id: list, namespace_id: 0, index: 0 },
			NodeChange::ListInsertPrimitive {
				node_id: list,
				namespace_id: 0,
				index: 2,
				values: vec![json!("d"), json!("e")],
			},
		]
	);
}

#[test]
fn dispose_needs_a_detached_node() {
	let mut tree = StateTree::new();
	let child = tree.create_map_node(OBJECT);
	let grandchild = tree.create_map_node(OBJECT);
	tree.put_node(child, 0, "inner", grandchild).unwrap();
	tree.put_node(ROOT, 0, "child", child).unwrap();
	assert_eq!(tree.dispose(child), Err(TreeError::StillAttached(child)));
	assert_eq!(tree.dispose(ROOT), Err(TreeError::StillAttached(ROOT)));

	tree.remove(ROOT, 0, "child").unwrap();
	tree.dispose(child).unwrap();
	assert!(tree.node(child).is_none());
	assert!(tree.node(grandchild).is_none());
	assert_eq!(tree.len(), 1);
}

#[test]
fn value_types_are_immutable() {
	let mut types = ValueTypeMap::new();
	let descriptor = ValueTypeDescriptor::list(STRING);
	let first = types.register(16, &descriptor).unwrap();
	let second = types.register(16, &descriptor).unwrap();
	assert!(std::sync::Arc::ptr_eq(&first, &second));
	assert_eq!(types.register(16, &ValueTypeDescriptor::list(OBJECT)), Err(TypeError::Conflict(16)));
	assert_eq!(types.custom_ids().collect::<Vec<_>>(), vec![16]);
}

#[test]
fn wire_format() {
	let change = NodeChange::ListInsertPrimitive {
		node_id: 3,
		namespace_id: 0,
		index: 1,
		values: vec![json!("a"), json!(2)],
	};
	assert_eq!(
		serde_json::to_value(&change).unwrap(),
		json!({"kind": "list-insert-primitive", "nodeId": 3, "namespaceId": 0, "index": 1, "value": ["a", 2]})
	);

	let batch: ChangeBatch = serde_json::from_value(json!({
		"changes": [
			{"kind": "node-create", "nodeId": 2, "typeId": 9},
			{"kind": "put-list-reference", "nodeId": 1, "key": "items", "value": 2},
		],
		"invocations": [["$0.focus()", {"node": 2}, 5]],
	}))
	.unwrap();
	assert_eq!(batch.changes[0], NodeChange::NodeCreate { node_id: 2, type_id: ARRAY });
	assert_eq!(batch.changes[1].node_id(), ROOT);
	assert!(batch.value_types.is_empty());
	let invocation: &RpcInvocation = &batch.invocations[0];
	assert_eq!(invocation.expression, "$0.focus()");
	assert!(matches!(invocation.arguments[0], RpcArgument::Element(descriptor) if descriptor.node == 2 && descriptor.template == 0));
	assert_eq!(invocation.arguments[1], RpcArgument::Value(json!(5)));
}
