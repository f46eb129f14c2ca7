//! Per-viewer filtering of the replicated tree.
//!
//! Visibility is decided node by node: a viewer sees a node when it
//! owns it, holds a direct grant, or belongs to a granted team. A
//! container a viewer cannot see directly is still serialized when
//! something underneath is visible, so a deep grant reaches its
//! audience without exposing the siblings around it. Whatever stays
//! hidden is simply omitted; an explicit `null` is always real data.

use crate::agents::AgentRegistry;
use crate::node::{Node, NodeKind};
use serde_json::{Map, Value};

pub fn can_see(registry: &AgentRegistry, node: &Node, viewer: &str) -> bool {
    registry.can_see(&node.visible_to, &node.owner, viewer)
}

/// Serializes `node` as `viewer` is allowed to observe it.
///
/// `None` means the whole branch is hidden (or not relayed). Hidden
/// object entries are dropped from the map; hidden list elements are
/// padded with `null` instead so the surviving indices still line up
/// with the per-index edits the viewer will receive later.
pub fn value_for(registry: &AgentRegistry, node: &Node, viewer: &str) -> Option<Value> {
    if !node.relayed {
        return None;
    }
    let visible = can_see(registry, node, viewer);
    match &node.kind {
        NodeKind::Cell(cell) => visible.then(|| cell.value.clone()),
        NodeKind::Object(children) => {
            let mut map = Map::new();
            for (key, child) in children {
                if let Some(value) = value_for(registry, child, viewer) {
                    map.insert(key.clone(), value);
                }
            }
            if visible || !map.is_empty() {
                Some(Value::Object(map))
            } else {
                None
            }
        }
        NodeKind::List(children) => {
            let filtered: Vec<Option<Value>> = children
                .iter()
                .map(|child| value_for(registry, child, viewer))
                .collect();
            if visible || filtered.iter().any(Option::is_some) {
                Some(Value::Array(
                    filtered
                        .into_iter()
                        .map(|v| v.unwrap_or(Value::Null))
                        .collect(),
                ))
            } else {
                None
            }
        }
    }
}

/// Like [`value_for`] but collapses "nothing visible" to an empty
/// object, the shape snapshots are expected to have.
pub fn snapshot_for(registry: &AgentRegistry, node: &Node, viewer: &str) -> Value {
    value_for(registry, node, viewer).unwrap_or_else(|| Value::Object(Map::new()))
}

// Grants cascade so that publishing a branch publishes everything that
// currently hangs under it. Nodes added later inherit from their parent
// at creation instead.
pub fn grant(node: &mut Node, agent: &str) {
    node.visible_to.insert(agent.to_string());
    match &mut node.kind {
        NodeKind::Cell(_) => {}
        NodeKind::Object(children) => {
            for child in children.values_mut() {
                grant(child, agent);
            }
        }
        NodeKind::List(children) => {
            for child in children {
                grant(child, agent);
            }
        }
    }
}

pub fn revoke(node: &mut Node, agent: &str) {
    node.purge_viewer(agent);
}

/// Direct membership test, the question `is_public` answers. Team
/// expansion deliberately plays no part here: a member sees the node,
/// but the node is public to the team, not to the member.
pub fn is_granted(node: &Node, agent: &str) -> bool {
    node.visible_to.contains(agent)
}
