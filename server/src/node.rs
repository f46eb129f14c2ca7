use crate::constraint::Constraint;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

/// The three shapes a tracked value can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Scalar,
    Object,
    List,
}

// Classify an incoming JSON value. Null, booleans, numbers and strings
// all live in scalar cells; arrays and objects become containers.
pub fn shape_of(value: &Value) -> Shape {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => Shape::Scalar,
        Value::Array(_) => Shape::List,
        Value::Object(_) => Shape::Object,
    }
}

/// A scalar leaf holding one JSON value and its constraint chain.
#[derive(Debug, Clone)]
pub struct Cell {
    pub value: Value,
    pub constraints: Vec<Constraint>,
}

impl Cell {
    pub fn new(value: Value) -> Self {
        Cell {
            value,
            constraints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Cell(Cell),
    Object(BTreeMap<String, Node>),
    List(Vec<Node>),
}

/// One node of the replicated tree.
///
/// Every node knows its own absolute path (first segment is the owning
/// agent's id), which agent owns it, and which agents besides the owner
/// may observe it. The flags and the visibility set are copied to
/// children at creation time; afterwards each node evolves on its own.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub path: Vec<String>,
    pub owner: String,
    pub disabled: bool,
    pub relayed: bool,
    pub visible_to: HashSet<String>,
}

impl Node {
    /// Builds a subtree mirroring `value`, inheriting flags and
    /// visibility from the would-be parent.
    pub fn from_value(
        value: Value,
        path: Vec<String>,
        owner: &str,
        disabled: bool,
        relayed: bool,
        visible_to: &HashSet<String>,
    ) -> Self {
        let kind = match value {
            Value::Array(items) => {
                let mut children = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    let mut child_path = path.clone();
                    child_path.push(index.to_string());
                    children.push(Node::from_value(
                        item, child_path, owner, disabled, relayed, visible_to,
                    ));
                }
                NodeKind::List(children)
            }
            Value::Object(entries) => {
                let mut children = BTreeMap::new();
                for (key, item) in entries {
                    let mut child_path = path.clone();
                    child_path.push(key.clone());
                    children.insert(
                        key,
                        Node::from_value(item, child_path, owner, disabled, relayed, visible_to),
                    );
                }
                NodeKind::Object(children)
            }
            scalar => NodeKind::Cell(Cell::new(scalar)),
        };
        Node {
            kind,
            path,
            owner: owner.to_string(),
            disabled,
            relayed,
            visible_to: visible_to.clone(),
        }
    }

    /// Empty object node, the root every agent starts from.
    pub fn empty_object(path: Vec<String>, owner: &str) -> Self {
        Node {
            kind: NodeKind::Object(BTreeMap::new()),
            path,
            owner: owner.to_string(),
            disabled: false,
            relayed: true,
            visible_to: HashSet::new(),
        }
    }

    pub fn shape(&self) -> Shape {
        match self.kind {
            NodeKind::Cell(_) => Shape::Scalar,
            NodeKind::Object(_) => Shape::Object,
            NodeKind::List(_) => Shape::List,
        }
    }

    /// The unfiltered value of this subtree, as the server sees it.
    pub fn raw_value(&self) -> Value {
        match &self.kind {
            NodeKind::Cell(cell) => cell.value.clone(),
            NodeKind::Object(children) => {
                let mut map = Map::new();
                for (key, child) in children {
                    map.insert(key.clone(), child.raw_value());
                }
                Value::Object(map)
            }
            NodeKind::List(children) => {
                Value::Array(children.iter().map(Node::raw_value).collect())
            }
        }
    }

    pub fn child(&self, key: &str) -> Option<&Node> {
        match &self.kind {
            NodeKind::Cell(_) => None,
            NodeKind::Object(children) => children.get(key),
            NodeKind::List(children) => key.parse::<usize>().ok().and_then(|i| children.get(i)),
        }
    }

    pub fn child_mut(&mut self, key: &str) -> Option<&mut Node> {
        match &mut self.kind {
            NodeKind::Cell(_) => None,
            NodeKind::Object(children) => children.get_mut(key),
            NodeKind::List(children) => {
                key.parse::<usize>().ok().and_then(|i| children.get_mut(i))
            }
        }
    }

    pub fn descend(&self, segments: &[String]) -> Option<&Node> {
        let mut current = self;
        for segment in segments {
            current = current.child(segment)?;
        }
        Some(current)
    }

    pub fn descend_mut(&mut self, segments: &[String]) -> Option<&mut Node> {
        let mut current = self;
        for segment in segments {
            current = current.child_mut(segment)?;
        }
        Some(current)
    }

    /// Rewrites this node's path and every descendant's path below it.
    /// Needed whenever a subtree moves, e.g. after a list splice.
    pub fn set_location(&mut self, path: Vec<String>) {
        match &mut self.kind {
            NodeKind::Cell(_) => {}
            NodeKind::Object(children) => {
                for (key, child) in children.iter_mut() {
                    let mut child_path = path.clone();
                    child_path.push(key.clone());
                    child.set_location(child_path);
                }
            }
            NodeKind::List(children) => {
                for (index, child) in children.iter_mut().enumerate() {
                    let mut child_path = path.clone();
                    child_path.push(index.to_string());
                    child.set_location(child_path);
                }
            }
        }
        self.path = path;
    }

    /// Removes an agent from this subtree's visibility sets.
    pub fn purge_viewer(&mut self, agent: &str) {
        self.visible_to.remove(agent);
        match &mut self.kind {
            NodeKind::Cell(_) => {}
            NodeKind::Object(children) => {
                for child in children.values_mut() {
                    child.purge_viewer(agent);
                }
            }
            NodeKind::List(children) => {
                for child in children {
                    child.purge_viewer(agent);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn classification_covers_all_json_shapes() {
        assert_eq!(shape_of(&json!(null)), Shape::Scalar);
        assert_eq!(shape_of(&json!(true)), Shape::Scalar);
        assert_eq!(shape_of(&json!(3.5)), Shape::Scalar);
        assert_eq!(shape_of(&json!("text")), Shape::Scalar);
        assert_eq!(shape_of(&json!([1, 2])), Shape::List);
        assert_eq!(shape_of(&json!({"a": 1})), Shape::Object);
    }

    #[test]
    fn from_value_builds_matching_subtree() {
        let mut visible = HashSet::new();
        visible.insert("observer".to_string());
        let node = Node::from_value(
            json!({"pos": {"x": 1}, "tags": ["a", "b"]}),
            path(&["alice", "state"]),
            "alice",
            false,
            true,
            &visible,
        );

        assert_eq!(node.shape(), Shape::Object);
        let x = node.descend(&path(&["pos", "x"])).unwrap();
        assert_eq!(x.path, path(&["alice", "state", "pos", "x"]));
        assert_eq!(x.owner, "alice");
        assert!(x.visible_to.contains("observer"));

        let second_tag = node.descend(&path(&["tags", "1"])).unwrap();
        assert_eq!(second_tag.raw_value(), json!("b"));
        assert_eq!(second_tag.path, path(&["alice", "state", "tags", "1"]));
    }

    #[test]
    fn children_inherit_flags() {
        let node = Node::from_value(
            json!({"a": {"b": 1}}),
            path(&["alice"]),
            "alice",
            true,
            false,
            &HashSet::new(),
        );
        let leaf = node.descend(&path(&["a", "b"])).unwrap();
        assert!(leaf.disabled);
        assert!(!leaf.relayed);
    }

    #[test]
    fn raw_value_round_trips() {
        let value = json!({"n": 1, "list": [true, null, {"k": "v"}]});
        let node = Node::from_value(
            value.clone(),
            path(&["alice"]),
            "alice",
            false,
            true,
            &HashSet::new(),
        );
        assert_eq!(node.raw_value(), value);
    }

    #[test]
    fn set_location_rewrites_descendants() {
        let mut node = Node::from_value(
            json!({"inner": [10]}),
            path(&["alice", "old"]),
            "alice",
            false,
            true,
            &HashSet::new(),
        );
        node.set_location(path(&["alice", "new", "spot"]));
        assert_eq!(node.path, path(&["alice", "new", "spot"]));
        let leaf = node.descend(&path(&["inner", "0"])).unwrap();
        assert_eq!(leaf.path, path(&["alice", "new", "spot", "inner", "0"]));
    }

    #[test]
    fn purge_viewer_strips_whole_subtree() {
        let mut visible = HashSet::new();
        visible.insert("bob".to_string());
        let mut node = Node::from_value(
            json!({"a": {"b": 1}}),
            path(&["alice"]),
            "alice",
            false,
            true,
            &visible,
        );
        node.purge_viewer("bob");
        assert!(node.visible_to.is_empty());
        let leaf = node.descend(&path(&["a", "b"])).unwrap();
        assert!(leaf.visible_to.is_empty());
    }

    #[test]
    fn list_child_lookup_requires_numeric_key() {
        let node = Node::from_value(
            json!([1, 2, 3]),
            path(&["alice", "xs"]),
            "alice",
            false,
            true,
            &HashSet::new(),
        );
        assert!(node.child("1").is_some());
        assert!(node.child("first").is_none());
        assert!(node.child("7").is_none());
    }
}
