use log::{debug, warn};
use serde_json::{Map, Value};
use shared::rules::{CellRules, RuleSpec};
use shared::update::{Update, WireValue};
use shared::{LENGTH_KEY, PROP_CONSTRAINT, PROP_CONTROLLER, PROP_ID, PROP_SPACE};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Local copy of everything the server lets this client see. Updates
/// from the wire are applied in arrival order; between updates the
/// mirror is a plain readable value tree.
#[derive(Debug, Default)]
pub struct Mirror {
    self_id: Option<String>,
    tick_rate: u32,
    state: BTreeMap<String, Value>,
    peers: BTreeSet<String>,
    teams: BTreeSet<String>,
    rules: HashMap<Vec<String>, Vec<RuleSpec>>,
    controller: Value,
    space: Option<String>,
    responses: VecDeque<(String, Value)>,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn self_id(&self) -> Option<&str> {
        self.self_id.as_deref()
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn controller(&self) -> &Value {
        &self.controller
    }

    pub fn space(&self) -> Option<&str> {
        self.space.as_deref()
    }

    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.peers.iter().map(String::as_str)
    }

    pub fn teams(&self) -> impl Iterator<Item = &str> {
        self.teams.iter().map(String::as_str)
    }

    pub fn value(&self, path: &[String]) -> Option<&Value> {
        let (root, rest) = path.split_first()?;
        locate(self.state.get(root)?, rest)
    }

    pub fn list_len(&self, path: &[String]) -> Option<usize> {
        match self.value(path) {
            Some(Value::Array(items)) => Some(items.len()),
            _ => None,
        }
    }

    /// The rules the server has shared for one cell, if any.
    pub fn rules_for(&self, path: &[String]) -> Option<&[RuleSpec]> {
        self.rules.get(path).map(Vec::as_slice)
    }

    /// Oldest unconsumed named message from the server.
    pub fn next_response(&mut self) -> Option<(String, Value)> {
        self.responses.pop_front()
    }

    /// Every agent subtree as one object, for display and tests.
    pub fn snapshot(&self) -> Value {
        let mut map = Map::new();
        for (id, value) in &self.state {
            map.insert(id.clone(), value.clone());
        }
        Value::Object(map)
    }

    /// Decodes a newline-framed batch and applies every well-formed
    /// unit, returning how many were applied.
    pub fn apply_payload(&mut self, payload: &str) -> usize {
        let mut applied = 0;
        for unit in shared::decode_batch(payload) {
            match unit {
                Ok(update) => {
                    self.apply(update);
                    applied += 1;
                }
                Err(e) => warn!("Skipping malformed unit: {}", e),
            }
        }
        applied
    }

    pub fn apply(&mut self, update: Update) {
        match update {
            Update::Edit { path, value } => match value {
                WireValue::Json(value) => self.write(&path, value),
                WireValue::Absent => self.remove(&path),
            },
            Update::Shift { path, from, delta } => self.shift(&path, from, delta),
            Update::SelfProperty { property, data } => self.self_property(&property, data),
            Update::Connect { id, snapshot } => {
                self.peers.insert(id.clone());
                self.state.insert(id, snapshot);
            }
            Update::Disconnect { id } => {
                self.peers.remove(&id);
                self.state.remove(&id);
            }
            Update::Response { name, payload } => {
                self.responses.push_back((name, payload));
            }
            Update::Initialize {
                self_id,
                tick_rate,
                constraints,
                clients,
                teams,
                space,
            } => self.initialize(self_id, tick_rate, constraints, clients, teams, space),
        }
    }

    fn initialize(
        &mut self,
        self_id: String,
        tick_rate: u32,
        constraints: Value,
        clients: Value,
        teams: Value,
        space: Option<String>,
    ) {
        self.state.clear();
        self.peers.clear();
        self.teams.clear();
        self.rules.clear();
        self.responses.clear();
        self.controller = Value::Null;
        self.tick_rate = tick_rate;
        self.space = space;

        self.state.insert(self_id.clone(), Value::Object(Map::new()));
        self.self_id = Some(self_id);

        if let Value::Object(map) = clients {
            for (id, snapshot) in map {
                self.peers.insert(id.clone());
                self.state.insert(id, snapshot);
            }
        }
        if let Value::Object(map) = teams {
            for (id, snapshot) in map {
                self.teams.insert(id.clone());
                self.state.insert(id, snapshot);
            }
        }
        match serde_json::from_value::<Vec<CellRules>>(constraints) {
            Ok(table) => {
                for cell in table {
                    if !cell.rules.is_empty() {
                        self.rules.insert(cell.path, cell.rules);
                    }
                }
            }
            Err(e) => warn!("Ignoring malformed constraint table: {}", e),
        }
    }

    fn self_property(&mut self, property: &str, data: Value) {
        match property {
            PROP_ID => {
                if let Value::String(id) = data {
                    self.self_id = Some(id);
                }
            }
            PROP_CONTROLLER => self.controller = data,
            PROP_SPACE => self.space = data.as_str().map(str::to_string),
            PROP_CONSTRAINT => match serde_json::from_value::<CellRules>(data) {
                Ok(cell) => {
                    if cell.rules.is_empty() {
                        self.rules.remove(&cell.path);
                    } else {
                        self.rules.insert(cell.path, cell.rules);
                    }
                }
                Err(e) => warn!("Ignoring malformed constraint update: {}", e),
            },
            other => debug!("Unknown self property {}", other),
        }
    }

    fn write(&mut self, path: &[String], value: Value) {
        let (root, rest) = match path.split_first() {
            Some(split) => split,
            None => return,
        };
        if rest.is_empty() {
            // A whole-root edit for an unknown agent is a team catch-up;
            // peers always arrive through Connect.
            if self.self_id.as_deref() != Some(root.as_str()) && !self.peers.contains(root) {
                self.teams.insert(root.clone());
            }
            self.state.insert(root.clone(), value);
            return;
        }
        let slot = self
            .state
            .entry(root.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        write_into(slot, rest, value);
    }

    fn remove(&mut self, path: &[String]) {
        let (root, rest) = match path.split_first() {
            Some(split) => split,
            None => return,
        };
        if rest.is_empty() {
            self.state.remove(root);
            self.teams.remove(root);
            return;
        }
        let last = &rest[rest.len() - 1];
        let parent = match self
            .state
            .get_mut(root)
            .and_then(|slot| locate_mut(slot, &rest[..rest.len() - 1]))
        {
            Some(parent) => parent,
            None => return,
        };
        match parent {
            Value::Object(map) => {
                map.remove(last);
            }
            Value::Array(items) => {
                if let Ok(index) = last.parse::<usize>() {
                    if index + 1 == items.len() {
                        items.pop();
                    } else if index < items.len() {
                        // Holes keep later indices meaningful.
                        items[index] = Value::Null;
                    }
                }
            }
            _ => {}
        }
    }

    fn shift(&mut self, path: &[String], from: usize, delta: i64) {
        let items = match path
            .split_first()
            .and_then(|(root, rest)| locate_mut(self.state.get_mut(root)?, rest))
        {
            Some(Value::Array(items)) => items,
            // A shift for state this client cannot see is a no-op.
            _ => return,
        };
        if delta > 0 {
            let at = from.min(items.len());
            for _ in 0..delta as usize {
                items.insert(at, Value::Null);
            }
        } else if delta < 0 {
            let count = (-delta) as usize;
            let end = from.min(items.len());
            let start = end.saturating_sub(count);
            if start < end {
                items.drain(start..end);
            }
        } else {
            // The zero-delta form reverses the tail starting at `from`.
            let len = items.len();
            if from < len {
                items[from..len].reverse();
            }
        }
    }
}

fn locate<'a>(slot: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = slot;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                if segment.as_str() == LENGTH_KEY {
                    return None;
                }
                items.get(segment.parse::<usize>().ok()?)?
            }
            _ => return None,
        };
    }
    Some(current)
}

fn locate_mut<'a>(slot: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
    let mut current = slot;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn write_into(slot: &mut Value, path: &[String], value: Value) {
    let (head, rest) = match path.split_first() {
        Some(split) => split,
        None => {
            *slot = value;
            return;
        }
    };
    match slot {
        Value::Array(items) => {
            if head.as_str() == LENGTH_KEY && rest.is_empty() {
                if let Some(len) = value.as_u64() {
                    items.resize(len as usize, Value::Null);
                }
                return;
            }
            match head.parse::<usize>() {
                Ok(index) => {
                    if items.len() <= index {
                        items.resize(index + 1, Value::Null);
                    }
                    write_into(&mut items[index], rest, value);
                }
                Err(_) => debug!("Ignoring non-index key {} into a list", head),
            }
        }
        Value::Object(map) => {
            let child = map.entry(head.clone()).or_insert(Value::Null);
            write_into(child, rest, value);
        }
        _ => {
            // The server reshaped an intermediate; follow it. An index
            // or length segment means the branch is a list, which keeps
            // partially visible lists index-aligned with the server.
            if head.as_str() == LENGTH_KEY || head.parse::<usize>().is_ok() {
                *slot = Value::Array(Vec::new());
            } else {
                *slot = Value::Object(Map::new());
            }
            write_into(slot, path, value);
        }
    }
}
