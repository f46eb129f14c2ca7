use crate::agents::AgentRegistry;
use crate::constraint::{apply_chain, shared_specs, Constraint};
use crate::node::{shape_of, Cell, Node, NodeKind, Shape};
use crate::visibility;
use log::debug;
use serde_json::Value;
use shared::rules::{CellRules, RuleSpec};
use shared::update::{Update, WireValue};
use shared::LENGTH_KEY;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Updates produced by a mutation, addressed per receiving client. The
/// scheduler turns these into queue entries; the tree itself never
/// talks to the network.
pub type Outbox = Vec<(String, Update)>;

#[derive(Debug, Error, PartialEq)]
pub enum WriteError {
    #[error("write rejected by a constraint or a disabled cell")]
    Rejected,
    #[error("write does not fit the current tree shape")]
    ShapeMismatch,
    #[error("no node at the given path")]
    MissingPath,
    #[error("no agent root named {0}")]
    UnknownRoot(String),
    #[error("path does not name a list")]
    NotAList,
}

/// Who asked for a write. Server writes may reshape the tree and
/// bypass `disabled`; remote writes may only touch existing scalar
/// cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin<'a> {
    Server,
    Remote(&'a str),
}

impl Origin<'_> {
    fn is_remote(&self) -> bool {
        matches!(self, Origin::Remote(_))
    }
}

/// All replicated state, one root per agent.
#[derive(Debug, Default)]
pub struct StateTree {
    roots: BTreeMap<String, Node>,
}

/// Concrete clients an accepted change at `node` must reach. Empty when
/// the node is not relayed.
pub(crate) fn recipients(reg: &AgentRegistry, node: &Node) -> BTreeSet<String> {
    if !node.relayed {
        return BTreeSet::new();
    }
    reg.expand(&node.visible_to, &node.owner)
}

fn child_path(base: &[String], segment: &str) -> Vec<String> {
    let mut path = base.to_vec();
    path.push(segment.to_string());
    path
}

fn null_pad(parent: &Node, index: usize) -> Node {
    Node {
        kind: NodeKind::Cell(Cell::new(Value::Null)),
        path: child_path(&parent.path, &index.to_string()),
        owner: parent.owner.clone(),
        disabled: parent.disabled,
        relayed: parent.relayed,
        visible_to: parent.visible_to.clone(),
    }
}

fn emit_filtered(reg: &AgentRegistry, node: &Node, out: &mut Outbox) {
    for client in recipients(reg, node) {
        if let Some(value) = visibility::value_for(reg, node, &client) {
            out.push((
                client,
                Update::Edit {
                    path: node.path.clone(),
                    value: WireValue::Json(value),
                },
            ));
        }
    }
}

fn emit_tombstones(targets: &BTreeSet<String>, path: &[String], out: &mut Outbox) {
    for client in targets {
        out.push((
            client.clone(),
            Update::Edit {
                path: path.to_vec(),
                value: WireValue::Absent,
            },
        ));
    }
}

// Scalar-onto-scalar write: the one kind remote peers may perform.
// Runs the constraint chain; a rejection answers a remote sender with
// a corrective edit carrying what the cell really holds.
fn write_scalar(
    reg: &AgentRegistry,
    parent: &mut Node,
    key: &str,
    value: Value,
    origin: Origin,
    out: &mut Outbox,
) -> Result<(), WriteError> {
    let outcome = {
        let target = parent.child(key).ok_or(WriteError::MissingPath)?;
        let cell = match &target.kind {
            NodeKind::Cell(cell) => cell,
            _ => return Err(WriteError::ShapeMismatch),
        };
        if target.disabled && origin.is_remote() {
            None
        } else {
            apply_chain(&cell.constraints, &value)
        }
    };

    match outcome {
        Some(stored) => {
            let (targets, path) = {
                let target = parent.child(key).ok_or(WriteError::MissingPath)?;
                (recipients(reg, target), target.path.clone())
            };
            let target = parent.child_mut(key).ok_or(WriteError::MissingPath)?;
            if let NodeKind::Cell(cell) = &mut target.kind {
                cell.value = stored.clone();
            }
            for client in targets {
                out.push((
                    client,
                    Update::Edit {
                        path: path.clone(),
                        value: WireValue::Json(stored.clone()),
                    },
                ));
            }
            Ok(())
        }
        None => {
            if let Origin::Remote(sender) = origin {
                let target = parent.child(key).ok_or(WriteError::MissingPath)?;
                debug!("Rejected write from {} at {:?}", sender, target.path);
                let current = visibility::value_for(reg, target, sender)
                    .map(WireValue::Json)
                    .unwrap_or(WireValue::Absent);
                out.push((
                    sender.to_string(),
                    Update::Edit {
                        path: target.path.clone(),
                        value: current,
                    },
                ));
            }
            Err(WriteError::Rejected)
        }
    }
}

// Structural write: replaces (or creates) the child under `key` with a
// fresh subtree built from `value`. Server only. Viewers of the old
// subtree who cannot see the new one get a tombstone so their mirrors
// drop the branch.
fn replace_at(
    reg: &AgentRegistry,
    parent: &mut Node,
    key: &str,
    value: Value,
    origin: Origin,
    out: &mut Outbox,
) -> Result<(), WriteError> {
    if origin.is_remote() {
        return Err(WriteError::ShapeMismatch);
    }
    let old_targets = parent
        .child(key)
        .map(|node| recipients(reg, node))
        .unwrap_or_default();
    let base_path = parent.path.clone();
    let owner = parent.owner.clone();
    let disabled = parent.disabled;
    let relayed = parent.relayed;
    let visible = parent.visible_to.clone();
    let fresh = Node::from_value(
        value,
        child_path(&base_path, key),
        &owner,
        disabled,
        relayed,
        &visible,
    );
    let new_targets = recipients(reg, &fresh);

    match &mut parent.kind {
        NodeKind::Object(children) => {
            children.insert(key.to_string(), fresh);
        }
        NodeKind::List(children) => {
            let index: usize = key.parse().map_err(|_| WriteError::ShapeMismatch)?;
            while children.len() < index {
                children.push(Node {
                    kind: NodeKind::Cell(Cell::new(Value::Null)),
                    path: child_path(&base_path, &children.len().to_string()),
                    owner: owner.clone(),
                    disabled,
                    relayed,
                    visible_to: visible.clone(),
                });
            }
            if index < children.len() {
                children[index] = fresh;
            } else {
                children.push(fresh);
            }
        }
        NodeKind::Cell(_) => return Err(WriteError::ShapeMismatch),
    }

    let inserted = parent.child(key).ok_or(WriteError::MissingPath)?;
    for client in &new_targets {
        if let Some(value) = visibility::value_for(reg, inserted, client) {
            out.push((
                client.clone(),
                Update::Edit {
                    path: inserted.path.clone(),
                    value: WireValue::Json(value),
                },
            ));
        }
    }
    let lost: BTreeSet<String> = old_targets.difference(&new_targets).cloned().collect();
    emit_tombstones(&lost, &inserted.path, out);
    Ok(())
}

fn replace_root(
    reg: &AgentRegistry,
    root: &mut Node,
    value: Value,
    origin: Origin,
    out: &mut Outbox,
) -> Result<(), WriteError> {
    if origin.is_remote() || shape_of(&value) != Shape::Object {
        return Err(WriteError::ShapeMismatch);
    }
    let old_targets = recipients(reg, root);
    let path = root.path.clone();
    let owner = root.owner.clone();
    let visible = root.visible_to.clone();
    *root = Node::from_value(value, path, &owner, root.disabled, root.relayed, &visible);

    let new_targets = recipients(reg, root);
    for client in &new_targets {
        if let Some(value) = visibility::value_for(reg, root, client) {
            out.push((
                client.clone(),
                Update::Edit {
                    path: root.path.clone(),
                    value: WireValue::Json(value),
                },
            ));
        }
    }
    let lost: BTreeSet<String> = old_targets.difference(&new_targets).cloned().collect();
    emit_tombstones(&lost, &root.path, out);
    Ok(())
}

// Writing the reserved `length` key truncates or null-extends the
// list, relayed as a single edit rather than one tombstone per element.
fn set_list_length(
    reg: &AgentRegistry,
    list: &mut Node,
    value: &Value,
    origin: Origin,
    out: &mut Outbox,
) -> Result<(), WriteError> {
    if origin.is_remote() {
        return Err(WriteError::ShapeMismatch);
    }
    let wanted = value.as_u64().ok_or(WriteError::ShapeMismatch)? as usize;

    let mut audience;
    {
        let children = match &list.kind {
            NodeKind::List(children) => children,
            _ => return Err(WriteError::NotAList),
        };
        if children.len() == wanted {
            return Ok(());
        }
        audience = recipients(reg, list);
        if wanted < children.len() {
            // Dropped elements may have viewers of their own.
            for child in &children[wanted..] {
                audience.extend(recipients(reg, child));
            }
        }
    }

    let pads: Vec<Node> = {
        let len = match &list.kind {
            NodeKind::List(children) => children.len(),
            _ => return Err(WriteError::NotAList),
        };
        (len..wanted).map(|i| null_pad(list, i)).collect()
    };
    if let NodeKind::List(children) = &mut list.kind {
        if wanted < children.len() {
            children.truncate(wanted);
        } else {
            children.extend(pads);
        }
    }

    let path = child_path(&list.path, LENGTH_KEY);
    for client in audience {
        out.push((
            client,
            Update::Edit {
                path: path.clone(),
                value: WireValue::Json(Value::from(wanted as u64)),
            },
        ));
    }
    Ok(())
}

impl StateTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_root(&mut self, id: &str) {
        self.roots
            .insert(id.to_string(), Node::empty_object(vec![id.to_string()], id));
    }

    pub fn remove_root(&mut self, id: &str) -> Option<Node> {
        self.roots.remove(id)
    }

    pub fn root(&self, id: &str) -> Option<&Node> {
        self.roots.get(id)
    }

    pub fn node(&self, path: &[String]) -> Option<&Node> {
        let (root_key, rest) = path.split_first()?;
        self.roots.get(root_key)?.descend(rest)
    }

    pub fn node_mut(&mut self, path: &[String]) -> Option<&mut Node> {
        let (root_key, rest) = path.split_first()?;
        self.roots.get_mut(root_key)?.descend_mut(rest)
    }

    /// Unfiltered value lookup. A trailing `length` segment under a
    /// list resolves to the list's current length.
    pub fn value(&self, path: &[String]) -> Option<Value> {
        if path.last().map(String::as_str) == Some(LENGTH_KEY) && path.len() >= 2 {
            if let Some(node) = self.node(&path[..path.len() - 1]) {
                if let NodeKind::List(children) = &node.kind {
                    return Some(Value::from(children.len() as u64));
                }
            }
        }
        self.node(path).map(Node::raw_value)
    }

    /// Writes `value` at `path`, appending the resulting updates to
    /// `out`. Missing intermediate objects are created silently for
    /// server writes; remote writes must land on an existing scalar
    /// cell and pass its constraint chain.
    pub fn set(
        &mut self,
        reg: &AgentRegistry,
        origin: Origin,
        path: &[String],
        value: Value,
        out: &mut Outbox,
    ) -> Result<(), WriteError> {
        let (root_key, rest) = path.split_first().ok_or(WriteError::MissingPath)?;
        let root = self
            .roots
            .get_mut(root_key)
            .ok_or_else(|| WriteError::UnknownRoot(root_key.clone()))?;
        if rest.is_empty() {
            return replace_root(reg, root, value, origin, out);
        }
        let (last, mids) = rest.split_last().ok_or(WriteError::MissingPath)?;

        let mut parent: &mut Node = root;
        for segment in mids {
            let create = match &parent.kind {
                NodeKind::Cell(_) => return Err(WriteError::ShapeMismatch),
                NodeKind::Object(children) => !children.contains_key(segment.as_str()),
                NodeKind::List(children) => {
                    let index: usize =
                        segment.parse().map_err(|_| WriteError::ShapeMismatch)?;
                    if index >= children.len() {
                        return Err(WriteError::MissingPath);
                    }
                    false
                }
            };
            if create {
                if origin.is_remote() {
                    return Err(WriteError::ShapeMismatch);
                }
                let child = Node {
                    kind: NodeKind::Object(BTreeMap::new()),
                    path: child_path(&parent.path, segment),
                    owner: parent.owner.clone(),
                    disabled: parent.disabled,
                    relayed: parent.relayed,
                    visible_to: parent.visible_to.clone(),
                };
                if let NodeKind::Object(children) = &mut parent.kind {
                    children.insert(segment.clone(), child);
                }
            }
            parent = parent.child_mut(segment).ok_or(WriteError::MissingPath)?;
        }

        if last.as_str() == LENGTH_KEY && matches!(parent.kind, NodeKind::List(_)) {
            return set_list_length(reg, parent, &value, origin, out);
        }
        match (parent.child(last).map(Node::shape), shape_of(&value)) {
            (Some(Shape::Scalar), Shape::Scalar) => {
                write_scalar(reg, parent, last, value, origin, out)
            }
            _ => replace_at(reg, parent, last, value, origin, out),
        }
    }

    /// Removes the node at `path`. Deleting from the middle of a list
    /// leaves a `null` hole so later indices keep meaning; deleting the
    /// tail element shortens the list.
    pub fn delete(
        &mut self,
        reg: &AgentRegistry,
        origin: Origin,
        path: &[String],
        out: &mut Outbox,
    ) -> Result<(), WriteError> {
        if origin.is_remote() || path.len() < 2 {
            return Err(WriteError::ShapeMismatch);
        }
        let last = &path[path.len() - 1];

        enum Removal {
            ObjectKey,
            ListTail,
            ListHole(usize),
        }
        let (targets, removed_path, removal) = {
            let parent = self
                .node(&path[..path.len() - 1])
                .ok_or(WriteError::MissingPath)?;
            match &parent.kind {
                NodeKind::Cell(_) => return Err(WriteError::ShapeMismatch),
                NodeKind::Object(children) => {
                    let node = children.get(last.as_str()).ok_or(WriteError::MissingPath)?;
                    (recipients(reg, node), node.path.clone(), Removal::ObjectKey)
                }
                NodeKind::List(children) => {
                    let index: usize = last.parse().map_err(|_| WriteError::ShapeMismatch)?;
                    let node = children.get(index).ok_or(WriteError::MissingPath)?;
                    let removal = if index + 1 == children.len() {
                        Removal::ListTail
                    } else {
                        Removal::ListHole(index)
                    };
                    (recipients(reg, node), node.path.clone(), removal)
                }
            }
        };

        let parent = self
            .node_mut(&path[..path.len() - 1])
            .ok_or(WriteError::MissingPath)?;
        match removal {
            Removal::ObjectKey => {
                if let NodeKind::Object(children) = &mut parent.kind {
                    children.remove(last.as_str());
                }
            }
            Removal::ListTail => {
                if let NodeKind::List(children) = &mut parent.kind {
                    children.pop();
                }
            }
            Removal::ListHole(index) => {
                let pad = null_pad(parent, index);
                if let NodeKind::List(children) = &mut parent.kind {
                    children[index] = pad;
                }
            }
        }
        emit_tombstones(&targets, &removed_path, out);
        Ok(())
    }

    pub fn set_disabled(&mut self, path: &[String], flag: bool) -> Result<(), WriteError> {
        self.node_mut(path).ok_or(WriteError::MissingPath)?.disabled = flag;
        Ok(())
    }

    pub fn set_relayed(&mut self, path: &[String], flag: bool) -> Result<(), WriteError> {
        self.node_mut(path).ok_or(WriteError::MissingPath)?.relayed = flag;
        Ok(())
    }

    /// Appends a constraint to the cell at `path` and returns the
    /// cell's distributable rule list.
    pub fn add_constraint(
        &mut self,
        path: &[String],
        constraint: Constraint,
    ) -> Result<Vec<RuleSpec>, WriteError> {
        let node = self.node_mut(path).ok_or(WriteError::MissingPath)?;
        match &mut node.kind {
            NodeKind::Cell(cell) => {
                cell.constraints.push(constraint);
                Ok(shared_specs(&cell.constraints))
            }
            _ => Err(WriteError::ShapeMismatch),
        }
    }

    /// Detaches every constraint with the given name from the cell.
    pub fn remove_constraint(
        &mut self,
        path: &[String],
        name: &str,
    ) -> Result<Vec<RuleSpec>, WriteError> {
        let node = self.node_mut(path).ok_or(WriteError::MissingPath)?;
        match &mut node.kind {
            NodeKind::Cell(cell) => {
                cell.constraints.retain(|c| c.name() != name);
                Ok(shared_specs(&cell.constraints))
            }
            _ => Err(WriteError::ShapeMismatch),
        }
    }

    /// Every cell under `owner`'s root with at least one shareable
    /// rule, in deterministic path order.
    pub fn rule_table(&self, owner: &str) -> Vec<CellRules> {
        fn collect(node: &Node, table: &mut Vec<CellRules>) {
            match &node.kind {
                NodeKind::Cell(cell) => {
                    let rules = shared_specs(&cell.constraints);
                    if !rules.is_empty() {
                        table.push(CellRules {
                            path: node.path.clone(),
                            rules,
                        });
                    }
                }
                NodeKind::Object(children) => {
                    for child in children.values() {
                        collect(child, table);
                    }
                }
                NodeKind::List(children) => {
                    for child in children {
                        collect(child, table);
                    }
                }
            }
        }
        let mut table = Vec::new();
        if let Some(root) = self.roots.get(owner) {
            collect(root, &mut table);
        }
        table
    }

    /// Strips a departing agent from every visibility set in the tree.
    pub fn purge_grants(&mut self, agent: &str) {
        for root in self.roots.values_mut() {
            root.purge_viewer(agent);
        }
    }

    /// Topmost nodes granted to `agent`, anywhere in the tree. Grants
    /// cascade, so a subtree's descendants are covered by its top.
    pub fn granted_tops(&self, agent: &str) -> Vec<Vec<String>> {
        fn walk(node: &Node, agent: &str, tops: &mut Vec<Vec<String>>) {
            if node.visible_to.contains(agent) {
                tops.push(node.path.clone());
                return;
            }
            match &node.kind {
                NodeKind::Cell(_) => {}
                NodeKind::Object(children) => {
                    for child in children.values() {
                        walk(child, agent, tops);
                    }
                }
                NodeKind::List(children) => {
                    for child in children {
                        walk(child, agent, tops);
                    }
                }
            }
        }
        let mut tops = Vec::new();
        for root in self.roots.values() {
            walk(root, agent, &mut tops);
        }
        tops
    }

    fn list_children(&self, path: &[String]) -> Result<&Vec<Node>, WriteError> {
        let node = self.node(path).ok_or(WriteError::MissingPath)?;
        match &node.kind {
            NodeKind::List(children) => Ok(children),
            _ => Err(WriteError::NotAList),
        }
    }

    pub fn list_len(&self, path: &[String]) -> Result<usize, WriteError> {
        Ok(self.list_children(path)?.len())
    }

    pub fn list_push(
        &mut self,
        reg: &AgentRegistry,
        path: &[String],
        value: Value,
        out: &mut Outbox,
    ) -> Result<usize, WriteError> {
        let len = self.list_len(path)?;
        self.set(
            reg,
            Origin::Server,
            &child_path(path, &len.to_string()),
            value,
            out,
        )?;
        Ok(len + 1)
    }

    pub fn list_pop(
        &mut self,
        reg: &AgentRegistry,
        path: &[String],
        out: &mut Outbox,
    ) -> Result<Option<Value>, WriteError> {
        let len = self.list_len(path)?;
        if len == 0 {
            return Ok(None);
        }
        let tail = child_path(path, &(len - 1).to_string());
        let value = self.value(&tail);
        self.delete(reg, Origin::Server, &tail, out)?;
        Ok(value)
    }

    pub fn list_unshift(
        &mut self,
        reg: &AgentRegistry,
        path: &[String],
        value: Value,
        out: &mut Outbox,
    ) -> Result<usize, WriteError> {
        self.list_splice(reg, path, 0, 0, vec![value], out)?;
        self.list_len(path)
    }

    pub fn list_shift(
        &mut self,
        reg: &AgentRegistry,
        path: &[String],
        out: &mut Outbox,
    ) -> Result<Option<Value>, WriteError> {
        if self.list_len(path)? == 0 {
            return Ok(None);
        }
        let mut removed = self.list_splice(reg, path, 0, 1, Vec::new(), out)?;
        Ok(removed.pop())
    }

    /// Replaces `delete_count` elements starting at `start` with
    /// `items`, returning the removed values. Survivors move in one
    /// structural shift instead of an edit per displaced element; only
    /// the inserted items are sent as edits. A viewer that could only
    /// see a removed element gets a tombstone for it.
    pub fn list_splice(
        &mut self,
        reg: &AgentRegistry,
        path: &[String],
        start: usize,
        delete_count: usize,
        items: Vec<Value>,
        out: &mut Outbox,
    ) -> Result<Vec<Value>, WriteError> {
        let inserted_count = items.len();
        let (list_path, start, cut, delta, shift_audience, stranded) = {
            let list = self.node(path).ok_or(WriteError::MissingPath)?;
            let children = match &list.kind {
                NodeKind::List(children) => children,
                _ => return Err(WriteError::NotAList),
            };
            let len = children.len();
            let start = start.min(len);
            let cut = delete_count.min(len - start);
            let delta = inserted_count as i64 - cut as i64;
            // Everyone who can see the list or any element past the cut
            // must hear about the reindexing.
            let list_audience = recipients(reg, list);
            let mut shift_audience = list_audience.clone();
            for child in &children[start + cut..] {
                shift_audience.extend(recipients(reg, child));
            }
            // The shift drains removed slots for whoever receives it,
            // and an equal-size splice re-edits them for list viewers.
            // A viewer outside both sets saw a removed element it will
            // never hear about again; it gets a tombstone instead.
            let covered = if delta != 0 {
                &shift_audience
            } else {
                &list_audience
            };
            let mut stranded: Vec<(Vec<String>, BTreeSet<String>)> = Vec::new();
            for child in &children[start..start + cut] {
                let lost: BTreeSet<String> = recipients(reg, child)
                    .difference(covered)
                    .cloned()
                    .collect();
                if !lost.is_empty() {
                    stranded.push((child.path.clone(), lost));
                }
            }
            (list.path.clone(), start, cut, delta, shift_audience, stranded)
        };

        let removed = {
            let list = self.node_mut(path).ok_or(WriteError::MissingPath)?;
            let owner = list.owner.clone();
            let disabled = list.disabled;
            let relayed = list.relayed;
            let visible = list.visible_to.clone();
            let children = match &mut list.kind {
                NodeKind::List(children) => children,
                _ => return Err(WriteError::NotAList),
            };
            let fresh: Vec<Node> = items
                .into_iter()
                .map(|item| {
                    Node::from_value(item, list_path.clone(), &owner, disabled, relayed, &visible)
                })
                .collect();
            let removed_nodes: Vec<Node> =
                children.splice(start..start + cut, fresh).collect();
            for index in start..children.len() {
                let new_path = child_path(&list_path, &index.to_string());
                children[index].set_location(new_path);
            }
            removed_nodes.iter().map(Node::raw_value).collect()
        };

        for (element, lost) in &stranded {
            emit_tombstones(lost, element, out);
        }
        if delta != 0 {
            for client in &shift_audience {
                out.push((
                    client.clone(),
                    Update::Shift {
                        path: list_path.clone(),
                        from: start + cut,
                        delta,
                    },
                ));
            }
        }
        let list = self.node(path).ok_or(WriteError::MissingPath)?;
        if let NodeKind::List(children) = &list.kind {
            for child in &children[start..start + inserted_count] {
                emit_filtered(reg, child, out);
            }
        }
        Ok(removed)
    }

    /// Reverses the list in place. The wire form is a shift with
    /// `delta == 0`, which real splices never produce.
    pub fn list_reverse(
        &mut self,
        reg: &AgentRegistry,
        path: &[String],
        out: &mut Outbox,
    ) -> Result<(), WriteError> {
        let audience = {
            let list = self.node(path).ok_or(WriteError::MissingPath)?;
            let children = match &list.kind {
                NodeKind::List(children) => children,
                _ => return Err(WriteError::NotAList),
            };
            let mut audience = recipients(reg, list);
            for child in children {
                audience.extend(recipients(reg, child));
            }
            audience
        };
        let list_path = {
            let list = self.node_mut(path).ok_or(WriteError::MissingPath)?;
            let list_path = list.path.clone();
            if let NodeKind::List(children) = &mut list.kind {
                children.reverse();
                for index in 0..children.len() {
                    let new_path = child_path(&list_path, &index.to_string());
                    children[index].set_location(new_path);
                }
            }
            list_path
        };
        for client in audience {
            out.push((
                client,
                Update::Shift {
                    path: list_path.clone(),
                    from: 0,
                    delta: 0,
                },
            ));
        }
        Ok(())
    }

    pub fn list_truncate(
        &mut self,
        reg: &AgentRegistry,
        path: &[String],
        len: usize,
        out: &mut Outbox,
    ) -> Result<(), WriteError> {
        self.set(
            reg,
            Origin::Server,
            &child_path(path, LENGTH_KEY),
            Value::from(len as u64),
            out,
        )
    }

    pub fn list_slice(
        &self,
        path: &[String],
        start: usize,
        end: usize,
    ) -> Result<Vec<Value>, WriteError> {
        let children = self.list_children(path)?;
        let end = end.min(children.len());
        let start = start.min(end);
        Ok(children[start..end].iter().map(Node::raw_value).collect())
    }

    pub fn list_values(&self, path: &[String]) -> Result<Vec<Value>, WriteError> {
        Ok(self.list_children(path)?.iter().map(Node::raw_value).collect())
    }

    pub fn list_keys(&self, path: &[String]) -> Result<Vec<usize>, WriteError> {
        Ok((0..self.list_children(path)?.len()).collect())
    }

    pub fn list_entries(&self, path: &[String]) -> Result<Vec<(usize, Value)>, WriteError> {
        Ok(self
            .list_children(path)?
            .iter()
            .enumerate()
            .map(|(i, node)| (i, node.raw_value()))
            .collect())
    }

    pub fn list_map<F>(&self, path: &[String], f: F) -> Result<Vec<Value>, WriteError>
    where
        F: Fn(&Value) -> Value,
    {
        Ok(self
            .list_children(path)?
            .iter()
            .map(|node| f(&node.raw_value()))
            .collect())
    }

    pub fn list_filter<F>(&self, path: &[String], f: F) -> Result<Vec<Value>, WriteError>
    where
        F: Fn(&Value) -> bool,
    {
        Ok(self
            .list_children(path)?
            .iter()
            .map(Node::raw_value)
            .filter(|value| f(value))
            .collect())
    }

    pub fn list_reduce<F>(&self, path: &[String], init: Value, f: F) -> Result<Value, WriteError>
    where
        F: Fn(Value, &Value) -> Value,
    {
        let mut acc = init;
        for node in self.list_children(path)? {
            acc = f(acc, &node.raw_value());
        }
        Ok(acc)
    }

    pub fn list_reduce_right<F>(
        &self,
        path: &[String],
        init: Value,
        f: F,
    ) -> Result<Value, WriteError>
    where
        F: Fn(Value, &Value) -> Value,
    {
        let mut acc = init;
        for node in self.list_children(path)?.iter().rev() {
            acc = f(acc, &node.raw_value());
        }
        Ok(acc)
    }

    pub fn list_for_each<F>(&self, path: &[String], mut f: F) -> Result<(), WriteError>
    where
        F: FnMut(&Value),
    {
        for node in self.list_children(path)? {
            f(&node.raw_value());
        }
        Ok(())
    }

    pub fn list_every<F>(&self, path: &[String], f: F) -> Result<bool, WriteError>
    where
        F: Fn(&Value) -> bool,
    {
        Ok(self.list_children(path)?.iter().all(|n| f(&n.raw_value())))
    }

    pub fn list_some<F>(&self, path: &[String], f: F) -> Result<bool, WriteError>
    where
        F: Fn(&Value) -> bool,
    {
        Ok(self.list_children(path)?.iter().any(|n| f(&n.raw_value())))
    }

    pub fn list_find<F>(&self, path: &[String], f: F) -> Result<Option<Value>, WriteError>
    where
        F: Fn(&Value) -> bool,
    {
        Ok(self
            .list_children(path)?
            .iter()
            .map(Node::raw_value)
            .find(|value| f(value)))
    }

    pub fn list_find_index<F>(&self, path: &[String], f: F) -> Result<Option<usize>, WriteError>
    where
        F: Fn(&Value) -> bool,
    {
        Ok(self
            .list_children(path)?
            .iter()
            .position(|n| f(&n.raw_value())))
    }
}
