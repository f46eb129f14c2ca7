//! The authoritative engine tying the pieces together.
//!
//! The engine is a plain synchronous struct: the network layer feeds it
//! decoded lines and tick pulses, and everything it wants sent goes
//! through the [`Transport`] it was given. That keeps every rule about
//! state, visibility and scheduling testable without sockets.
//!
//! The application talks to the engine three ways: the tree facade
//! (`set`, `delete`, the list operations), the messaging surface
//! (`send`, `await_response`, `on`), and the agent surface (teams,
//! visibility, per-client properties).

use crate::agents::{AgentKind, AgentRegistry};
use crate::constraint::Constraint;
use crate::ident::IdAllocator;
use crate::scheduler::Scheduler;
use crate::transport::Transport;
use crate::tree::{recipients, Origin, Outbox, StateTree, WriteError};
use crate::visibility;
use log::{debug, info, warn};
use serde_json::{Map, Value};
use shared::rules::CellRules;
use shared::update::{Update, WireValue};
use shared::{DEFAULT_TICK_RATE, PROP_CONSTRAINT, PROP_CONTROLLER, PROP_SPACE};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

/// Reserved event fired after a client's root and queue exist.
pub const EVENT_CONNECT: &str = "connect";
/// Reserved event fired before a departing client is torn down.
pub const EVENT_DISCONNECT: &str = "disconnect";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown client {0}")]
    UnknownClient(String),
    #[error("unknown team {0}")]
    UnknownTeam(String),
    #[error("unknown agent {0}")]
    UnknownAgent(String),
    #[error("agent name {0} is already taken")]
    NameTaken(String),
    #[error(transparent)]
    Write(#[from] WriteError),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Broadcast passes per second.
    pub tick_rate: u32,
    /// Socket backlog, in bytes, above which a client's flush is skipped.
    pub high_water_mark: usize,
    /// Malformed inbound units tolerated before the connection is cut.
    pub malformed_limit: u32,
    /// Length of generated client ids.
    pub id_length: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            tick_rate: DEFAULT_TICK_RATE,
            high_water_mark: 64 * 1024,
            malformed_limit: 32,
            id_length: 8,
        }
    }
}

type MessageHandler = Box<dyn FnMut(&mut Engine, &str, &Value) + Send>;
type TickHandler = Box<dyn FnMut(&mut Engine) + Send>;

pub struct Engine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    tree: StateTree,
    registry: AgentRegistry,
    scheduler: Scheduler,
    ids: IdAllocator,
    handlers: HashMap<String, Vec<MessageHandler>>,
    before_hooks: Vec<TickHandler>,
    after_hooks: Vec<TickHandler>,
    waiters: HashMap<(String, String), Vec<oneshot::Sender<Value>>>,
    ticks: u64,
}

impl Engine {
    pub fn new(config: EngineConfig, transport: Arc<dyn Transport>) -> Self {
        let id_length = config.id_length;
        Engine {
            config,
            transport,
            tree: StateTree::new(),
            registry: AgentRegistry::new(),
            scheduler: Scheduler::new(),
            ids: IdAllocator::new(id_length),
            handlers: HashMap::new(),
            before_hooks: Vec::new(),
            after_hooks: Vec::new(),
            waiters: HashMap::new(),
            ticks: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    // ---- lifecycle -----------------------------------------------------

    /// Admits a new connection: allocates an id, creates the agent, its
    /// empty root and its queue, snapshots the world for it, fires the
    /// connect event and tells everyone else.
    ///
    /// The snapshot goes on the queue before the connect event runs, so
    /// state created by connect handlers reaches the client as ordinary
    /// edits after it.
    pub fn client_connected(&mut self) -> String {
        let id = self.ids.allocate();
        self.registry.add_client(&id);
        self.tree.create_root(&id);
        self.scheduler.add_client(&id);
        info!("Client {} connected", id);

        let initialize = self.build_initialize(&id);
        self.scheduler.enqueue(&id, initialize);

        self.dispatch(EVENT_CONNECT, &id, &Value::Null);

        let others: Vec<String> = self
            .registry
            .client_ids()
            .filter(|other| *other != id)
            .map(str::to_string)
            .collect();
        for other in others {
            let snapshot = self
                .tree
                .root(&id)
                .map(|root| visibility::snapshot_for(&self.registry, root, &other))
                .unwrap_or_else(|| Value::Object(Map::new()));
            self.scheduler.enqueue(
                &other,
                Update::Connect {
                    id: id.clone(),
                    snapshot,
                },
            );
        }
        id
    }

    /// Tears a client down: fires the disconnect event while its state
    /// is still readable, then drops its root, queue, grants, pending
    /// waits and memberships, and tells everyone else.
    pub fn client_disconnected(&mut self, id: &str) {
        if !self.registry.is_client(id) {
            return;
        }
        self.dispatch(EVENT_DISCONNECT, id, &Value::Null);

        self.tree.remove_root(id);
        self.tree.purge_grants(id);
        self.registry.remove_client(id);
        self.scheduler.remove_client(id);
        self.ids.release(id);
        self.waiters.retain(|(client, _), _| client != id);
        info!("Client {} disconnected", id);

        let others: Vec<String> = self.registry.client_ids().map(str::to_string).collect();
        for other in others {
            self.scheduler
                .enqueue(&other, Update::Disconnect { id: id.to_string() });
        }
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.registry.is_client(id)
    }

    pub fn clients(&self) -> Vec<String> {
        self.registry.client_ids().map(str::to_string).collect()
    }

    pub fn teams(&self) -> Vec<String> {
        self.registry.team_ids().map(str::to_string).collect()
    }

    pub fn for_each_agent<F>(&self, mut f: F)
    where
        F: FnMut(&str, AgentKind),
    {
        for id in self.registry.client_ids() {
            f(id, AgentKind::Client);
        }
        for id in self.registry.team_ids() {
            f(id, AgentKind::Team);
        }
    }

    fn build_initialize(&self, id: &str) -> Update {
        let mut clients = Map::new();
        for other in self.registry.client_ids() {
            if other == id {
                continue;
            }
            if let Some(root) = self.tree.root(other) {
                clients.insert(
                    other.to_string(),
                    visibility::snapshot_for(&self.registry, root, id),
                );
            }
        }
        let mut teams = Map::new();
        for team in self.registry.team_ids() {
            if let Some(root) = self.tree.root(team) {
                teams.insert(
                    team.to_string(),
                    visibility::snapshot_for(&self.registry, root, id),
                );
            }
        }
        Update::Initialize {
            self_id: id.to_string(),
            tick_rate: self.config.tick_rate,
            constraints: self.constraint_table_for(id),
            clients: Value::Object(clients),
            teams: Value::Object(teams),
            space: self.registry.client(id).and_then(|c| c.space.clone()),
        }
    }

    fn constraint_table_for(&self, id: &str) -> Value {
        let mut table = self.tree.rule_table(id);
        for team in self.registry.memberships(id) {
            table.extend(self.tree.rule_table(&team));
        }
        serde_json::to_value(table).unwrap_or_else(|_| Value::Array(Vec::new()))
    }

    // ---- inbound -------------------------------------------------------

    /// Feeds one raw inbound payload from a client. Returns `true` when
    /// the connection should be dropped because the sender crossed the
    /// malformed-unit limit.
    pub fn handle_message(&mut self, client: &str, raw: &str) -> bool {
        if !self.registry.is_client(client) {
            return true;
        }
        let mut malformed: u32 = 0;
        for unit in shared::decode_batch(raw) {
            match unit {
                Ok(update) => self.apply_inbound(client, update, &mut malformed),
                Err(err) => {
                    warn!("Malformed unit from {}: {}", client, err);
                    malformed += 1;
                }
            }
        }
        if malformed > 0 {
            if let Some(agent) = self.registry.client_mut(client) {
                agent.malformed_warnings += malformed;
                if agent.malformed_warnings >= self.config.malformed_limit {
                    warn!(
                        "Dropping {}: {} malformed units",
                        client, agent.malformed_warnings
                    );
                    return true;
                }
            }
        }
        false
    }

    pub fn warnings_of(&self, client: &str) -> u32 {
        self.registry
            .client(client)
            .map(|c| c.malformed_warnings)
            .unwrap_or(0)
    }

    pub fn network_issues_of(&self, client: &str) -> u64 {
        self.scheduler.network_issues(client)
    }

    fn apply_inbound(&mut self, client: &str, update: Update, malformed: &mut u32) {
        match update {
            Update::Edit { path, value } => {
                if !self.may_write(client, &path) {
                    debug!("Ignoring write from {} outside its authority: {:?}", client, path);
                    return;
                }
                let value = match value {
                    WireValue::Json(value) => value,
                    // Remote peers cannot remove nodes.
                    WireValue::Absent => {
                        debug!("Ignoring removal attempt from {}: {:?}", client, path);
                        return;
                    }
                };
                let mut out = Outbox::new();
                match self
                    .tree
                    .set(&self.registry, Origin::Remote(client), &path, value, &mut out)
                {
                    // A rejection already queued the corrective edit.
                    Ok(()) | Err(WriteError::Rejected) => self.scheduler.enqueue_outbox(out),
                    Err(err) => debug!("Ignoring write from {} at {:?}: {}", client, path, err),
                }
            }
            Update::Response { name, payload } => {
                if !self.complete_waiter(client, &name, &payload) {
                    self.dispatch(&name, client, &payload);
                }
            }
            _ => {
                warn!("Client {} sent a server-only update kind", client);
                *malformed += 1;
            }
        }
    }

    /// A client may write inside its own subtree and inside subtrees of
    /// teams it belongs to.
    fn may_write(&self, client: &str, path: &[String]) -> bool {
        match path.first() {
            Some(root) if root == client => true,
            Some(root) => self
                .registry
                .team(root)
                .map(|team| team.members.contains(client))
                .unwrap_or(false),
            None => false,
        }
    }

    // ---- messaging -----------------------------------------------------

    /// Registers a handler for a named client message (or one of the
    /// reserved `connect`/`disconnect` events).
    pub fn on<F>(&mut self, event: &str, handler: F)
    where
        F: FnMut(&mut Engine, &str, &Value) + Send + 'static,
    {
        self.handlers
            .entry(event.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    /// Queues a named message for one client.
    pub fn send(&mut self, client: &str, name: &str, payload: Value) -> Result<(), EngineError> {
        if !self.registry.is_client(client) {
            return Err(EngineError::UnknownClient(client.to_string()));
        }
        self.scheduler.enqueue(
            client,
            Update::Response {
                name: name.to_string(),
                payload,
            },
        );
        Ok(())
    }

    /// One-shot wait for the next message named `name` from `client`.
    /// The returned receiver resolves when it arrives and errors if the
    /// client disconnects first. Waiters win over `on` handlers and
    /// consume the message.
    pub fn await_response(
        &mut self,
        client: &str,
        name: &str,
    ) -> Result<oneshot::Receiver<Value>, EngineError> {
        if !self.registry.is_client(client) {
            return Err(EngineError::UnknownClient(client.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        self.waiters
            .entry((client.to_string(), name.to_string()))
            .or_default()
            .push(tx);
        Ok(rx)
    }

    fn complete_waiter(&mut self, client: &str, name: &str, payload: &Value) -> bool {
        let key = (client.to_string(), name.to_string());
        if let Some(queue) = self.waiters.get_mut(&key) {
            while !queue.is_empty() {
                let waiter = queue.remove(0);
                if waiter.send(payload.clone()).is_ok() {
                    if self.waiters.get(&key).map(|q| q.is_empty()).unwrap_or(false) {
                        self.waiters.remove(&key);
                    }
                    return true;
                }
            }
            self.waiters.remove(&key);
        }
        false
    }

    fn dispatch(&mut self, event: &str, client: &str, payload: &Value) {
        if let Some(mut handlers) = self.handlers.remove(event) {
            for handler in handlers.iter_mut() {
                handler(self, client, payload);
            }
            // Handlers registered while dispatching run next time.
            if let Some(added) = self.handlers.remove(event) {
                handlers.extend(added);
            }
            self.handlers.insert(event.to_string(), handlers);
        }
    }

    // ---- tree facade ---------------------------------------------------

    pub fn get(&self, path: &[String]) -> Option<Value> {
        self.tree.value(path)
    }

    pub fn set(&mut self, path: &[String], value: Value) -> Result<(), EngineError> {
        let mut out = Outbox::new();
        self.tree
            .set(&self.registry, Origin::Server, path, value, &mut out)?;
        self.scheduler.enqueue_outbox(out);
        Ok(())
    }

    pub fn delete(&mut self, path: &[String]) -> Result<(), EngineError> {
        let mut out = Outbox::new();
        self.tree
            .delete(&self.registry, Origin::Server, path, &mut out)?;
        self.scheduler.enqueue_outbox(out);
        Ok(())
    }

    pub fn set_disabled(&mut self, path: &[String], flag: bool) -> Result<(), EngineError> {
        Ok(self.tree.set_disabled(path, flag)?)
    }

    pub fn set_relayed(&mut self, path: &[String], flag: bool) -> Result<(), EngineError> {
        Ok(self.tree.set_relayed(path, flag)?)
    }

    // ---- constraints ---------------------------------------------------

    /// Attaches a constraint to a scalar cell and ships the cell's
    /// updated rule list to whoever owns it, so their mirrors can
    /// predict outcomes locally. Custom constraints stay server-side.
    pub fn add_constraint(
        &mut self,
        path: &[String],
        constraint: Constraint,
    ) -> Result<(), EngineError> {
        let rules = self.tree.add_constraint(path, constraint)?;
        self.distribute_rules(path, rules);
        Ok(())
    }

    /// Detaches all constraints with the given name from a cell and
    /// redistributes the remaining rule list.
    pub fn remove_constraint(&mut self, path: &[String], name: &str) -> Result<(), EngineError> {
        let rules = self.tree.remove_constraint(path, name)?;
        self.distribute_rules(path, rules);
        Ok(())
    }

    fn distribute_rules(&mut self, path: &[String], rules: Vec<shared::RuleSpec>) {
        let owner = match path.first() {
            Some(owner) => owner.clone(),
            None => return,
        };
        let data = serde_json::to_value(CellRules {
            path: path.to_vec(),
            rules,
        })
        .unwrap_or(Value::Null);
        let targets: Vec<String> = if self.registry.is_client(&owner) {
            vec![owner]
        } else if let Some(team) = self.registry.team(&owner) {
            team.members.iter().cloned().collect()
        } else {
            Vec::new()
        };
        for target in targets {
            self.scheduler.enqueue(
                &target,
                Update::SelfProperty {
                    property: PROP_CONSTRAINT.to_string(),
                    data: data.clone(),
                },
            );
        }
    }

    // ---- visibility ----------------------------------------------------

    /// Grants `agent` sight of the subtree at `path` and catches its
    /// audience up with the subtree's current value.
    pub fn add_public(&mut self, path: &[String], agent: &str) -> Result<(), EngineError> {
        if self.registry.kind_of(agent).is_none() {
            return Err(EngineError::UnknownAgent(agent.to_string()));
        }
        {
            let node = self.tree.node_mut(path).ok_or(WriteError::MissingPath)?;
            visibility::grant(node, agent);
        }
        let viewers: Vec<String> = if self.registry.is_team(agent) {
            if let Some(team) = self.registry.team_mut(agent) {
                team.published.insert(path.to_vec());
            }
            self.registry
                .team(agent)
                .map(|team| team.members.iter().cloned().collect())
                .unwrap_or_default()
        } else {
            vec![agent.to_string()]
        };
        self.catch_up(path, &viewers);
        Ok(())
    }

    /// Revokes a grant; whoever loses sight of the subtree gets a
    /// removal edit so their mirror drops the branch. Viewers who still
    /// see it another way are left alone.
    pub fn remove_public(&mut self, path: &[String], agent: &str) -> Result<(), EngineError> {
        let before = {
            let node = self.tree.node(path).ok_or(WriteError::MissingPath)?;
            recipients(&self.registry, node)
        };
        {
            let node = self.tree.node_mut(path).ok_or(WriteError::MissingPath)?;
            visibility::revoke(node, agent);
        }
        if let Some(team) = self.registry.team_mut(agent) {
            team.published.remove(path);
        }
        let after = match self.tree.node(path) {
            Some(node) => recipients(&self.registry, node),
            None => Default::default(),
        };
        for client in before.difference(&after) {
            self.scheduler.enqueue(
                client,
                Update::Edit {
                    path: path.to_vec(),
                    value: WireValue::Absent,
                },
            );
        }
        Ok(())
    }

    /// Whether `agent` holds a direct grant on the node at `path`.
    pub fn is_public(&self, path: &[String], agent: &str) -> Result<bool, EngineError> {
        let node = self.tree.node(path).ok_or(WriteError::MissingPath)?;
        Ok(visibility::is_granted(node, agent))
    }

    /// Serializes `owner`'s subtree as `viewer` currently observes it.
    pub fn public_snapshot(&self, owner: &str, viewer: &str) -> Result<Value, EngineError> {
        if self.registry.kind_of(viewer).is_none() {
            return Err(EngineError::UnknownAgent(viewer.to_string()));
        }
        let root = self
            .tree
            .root(owner)
            .ok_or_else(|| EngineError::UnknownAgent(owner.to_string()))?;
        Ok(visibility::snapshot_for(&self.registry, root, viewer))
    }

    fn catch_up(&mut self, path: &[String], viewers: &[String]) {
        let updates: Vec<(String, Update)> = match self.tree.node(path) {
            Some(node) => viewers
                .iter()
                .filter_map(|viewer| {
                    visibility::value_for(&self.registry, node, viewer).map(|value| {
                        (
                            viewer.clone(),
                            Update::Edit {
                                path: path.to_vec(),
                                value: WireValue::Json(value),
                            },
                        )
                    })
                })
                .collect(),
            None => Vec::new(),
        };
        for (client, update) in updates {
            self.scheduler.enqueue(&client, update);
        }
    }

    // ---- teams ---------------------------------------------------------

    /// Creates a named team agent with an empty root. The root is
    /// public to the team itself, so everything the application puts
    /// under it is visible to whoever is a member at broadcast time.
    pub fn create_team(&mut self, name: &str) -> Result<(), EngineError> {
        if !self.ids.claim(name) {
            return Err(EngineError::NameTaken(name.to_string()));
        }
        if !self.registry.add_team(name) {
            self.ids.release(name);
            return Err(EngineError::NameTaken(name.to_string()));
        }
        self.tree.create_root(name);
        let root_path = vec![name.to_string()];
        if let Some(node) = self.tree.node_mut(&root_path) {
            visibility::grant(node, name);
        }
        if let Some(team) = self.registry.team_mut(name) {
            team.published.insert(root_path);
        }
        Ok(())
    }

    /// Removes a team: its subtree, its grants anywhere in the tree,
    /// and the sight its members had through it. Ex-members' mirrors
    /// get removal edits for whatever the team let them see.
    pub fn discard_team(&mut self, name: &str) -> Result<(), EngineError> {
        if !self.registry.is_team(name) {
            return Err(EngineError::UnknownTeam(name.to_string()));
        }
        let tops = self.tree.granted_tops(name);
        let mut before: Vec<(Vec<String>, std::collections::BTreeSet<String>)> = Vec::new();
        for top in tops {
            if let Some(node) = self.tree.node(&top) {
                before.push((top, recipients(&self.registry, node)));
            }
        }

        self.registry.remove_team(name);
        self.tree.purge_grants(name);
        self.tree.remove_root(name);
        self.ids.release(name);
        info!("Team {} discarded", name);

        for (top, audience) in before {
            let after = match self.tree.node(&top) {
                Some(node) => recipients(&self.registry, node),
                None => Default::default(),
            };
            for client in audience.difference(&after) {
                self.scheduler.enqueue(
                    client,
                    Update::Edit {
                        path: top.clone(),
                        value: WireValue::Absent,
                    },
                );
            }
        }
        Ok(())
    }

    /// Adds a client to a team. The new member is caught up with one
    /// edit per path currently published to the team, plus the team's
    /// constraint tables.
    pub fn team_add_client(&mut self, team: &str, client: &str) -> Result<(), EngineError> {
        if !self.registry.is_client(client) {
            return Err(EngineError::UnknownClient(client.to_string()));
        }
        if !self.registry.is_team(team) {
            return Err(EngineError::UnknownTeam(team.to_string()));
        }
        if !self.registry.join(team, client) {
            return Ok(());
        }
        info!("Client {} joined team {}", client, team);

        let published: Vec<Vec<String>> = self
            .registry
            .team(team)
            .map(|t| t.published.iter().cloned().collect())
            .unwrap_or_default();
        let viewer = [client.to_string()];
        let mut stale: Vec<Vec<String>> = Vec::new();
        for path in published {
            if self.tree.node(&path).is_some() {
                self.catch_up(&path, &viewer);
            } else {
                stale.push(path);
            }
        }
        if let Some(t) = self.registry.team_mut(team) {
            for path in stale {
                t.published.remove(&path);
            }
        }

        for cell in self.tree.rule_table(team) {
            let data = serde_json::to_value(&cell).unwrap_or(Value::Null);
            self.scheduler.enqueue(
                client,
                Update::SelfProperty {
                    property: PROP_CONSTRAINT.to_string(),
                    data,
                },
            );
        }
        Ok(())
    }

    /// Removes a client from a team. Departure is silent: nothing
    /// further is sent, the ex-member simply stops hearing about state
    /// it only saw through the membership.
    pub fn team_remove_client(&mut self, team: &str, client: &str) -> Result<(), EngineError> {
        if !self.registry.is_team(team) {
            return Err(EngineError::UnknownTeam(team.to_string()));
        }
        if !self.registry.leave(team, client) {
            return Ok(());
        }
        info!("Client {} left team {}", client, team);
        Ok(())
    }

    pub fn team_members(&self, team: &str) -> Result<Vec<String>, EngineError> {
        self.registry
            .team(team)
            .map(|t| t.members.iter().cloned().collect())
            .ok_or_else(|| EngineError::UnknownTeam(team.to_string()))
    }

    // ---- per-client properties -----------------------------------------

    /// Sets the inputs a client is told to listen for, mirrored to the
    /// client as a self property.
    pub fn set_controller(&mut self, client: &str, controller: Value) -> Result<(), EngineError> {
        let agent = self
            .registry
            .client_mut(client)
            .ok_or_else(|| EngineError::UnknownClient(client.to_string()))?;
        agent.controller = controller.clone();
        self.scheduler.enqueue(
            client,
            Update::SelfProperty {
                property: PROP_CONTROLLER.to_string(),
                data: controller,
            },
        );
        Ok(())
    }

    pub fn controller_of(&self, client: &str) -> Option<Value> {
        self.registry.client(client).map(|c| c.controller.clone())
    }

    /// Moves a client to a named space (or out of any, with `None`).
    pub fn set_space(&mut self, client: &str, space: Option<String>) -> Result<(), EngineError> {
        let agent = self
            .registry
            .client_mut(client)
            .ok_or_else(|| EngineError::UnknownClient(client.to_string()))?;
        agent.space = space.clone();
        let data = space.map(Value::String).unwrap_or(Value::Null);
        self.scheduler.enqueue(
            client,
            Update::SelfProperty {
                property: PROP_SPACE.to_string(),
                data,
            },
        );
        Ok(())
    }

    pub fn space_of(&self, client: &str) -> Option<String> {
        self.registry.client(client).and_then(|c| c.space.clone())
    }

    // ---- lists ---------------------------------------------------------

    pub fn list_push(&mut self, path: &[String], value: Value) -> Result<usize, EngineError> {
        let mut out = Outbox::new();
        let len = self.tree.list_push(&self.registry, path, value, &mut out)?;
        self.scheduler.enqueue_outbox(out);
        Ok(len)
    }

    pub fn list_pop(&mut self, path: &[String]) -> Result<Option<Value>, EngineError> {
        let mut out = Outbox::new();
        let value = self.tree.list_pop(&self.registry, path, &mut out)?;
        self.scheduler.enqueue_outbox(out);
        Ok(value)
    }

    pub fn list_unshift(&mut self, path: &[String], value: Value) -> Result<usize, EngineError> {
        let mut out = Outbox::new();
        let len = self.tree.list_unshift(&self.registry, path, value, &mut out)?;
        self.scheduler.enqueue_outbox(out);
        Ok(len)
    }

    pub fn list_shift(&mut self, path: &[String]) -> Result<Option<Value>, EngineError> {
        let mut out = Outbox::new();
        let value = self.tree.list_shift(&self.registry, path, &mut out)?;
        self.scheduler.enqueue_outbox(out);
        Ok(value)
    }

    pub fn list_splice(
        &mut self,
        path: &[String],
        start: usize,
        delete_count: usize,
        items: Vec<Value>,
    ) -> Result<Vec<Value>, EngineError> {
        let mut out = Outbox::new();
        let removed = self
            .tree
            .list_splice(&self.registry, path, start, delete_count, items, &mut out)?;
        self.scheduler.enqueue_outbox(out);
        Ok(removed)
    }

    pub fn list_reverse(&mut self, path: &[String]) -> Result<(), EngineError> {
        let mut out = Outbox::new();
        self.tree.list_reverse(&self.registry, path, &mut out)?;
        self.scheduler.enqueue_outbox(out);
        Ok(())
    }

    pub fn list_truncate(&mut self, path: &[String], len: usize) -> Result<(), EngineError> {
        let mut out = Outbox::new();
        self.tree.list_truncate(&self.registry, path, len, &mut out)?;
        self.scheduler.enqueue_outbox(out);
        Ok(())
    }

    pub fn list_len(&self, path: &[String]) -> Result<usize, EngineError> {
        Ok(self.tree.list_len(path)?)
    }

    pub fn list_slice(
        &self,
        path: &[String],
        start: usize,
        end: usize,
    ) -> Result<Vec<Value>, EngineError> {
        Ok(self.tree.list_slice(path, start, end)?)
    }

    pub fn list_values(&self, path: &[String]) -> Result<Vec<Value>, EngineError> {
        Ok(self.tree.list_values(path)?)
    }

    pub fn list_keys(&self, path: &[String]) -> Result<Vec<usize>, EngineError> {
        Ok(self.tree.list_keys(path)?)
    }

    pub fn list_entries(&self, path: &[String]) -> Result<Vec<(usize, Value)>, EngineError> {
        Ok(self.tree.list_entries(path)?)
    }

    pub fn list_map<F>(&self, path: &[String], f: F) -> Result<Vec<Value>, EngineError>
    where
        F: Fn(&Value) -> Value,
    {
        Ok(self.tree.list_map(path, f)?)
    }

    pub fn list_filter<F>(&self, path: &[String], f: F) -> Result<Vec<Value>, EngineError>
    where
        F: Fn(&Value) -> bool,
    {
        Ok(self.tree.list_filter(path, f)?)
    }

    pub fn list_reduce<F>(&self, path: &[String], init: Value, f: F) -> Result<Value, EngineError>
    where
        F: Fn(Value, &Value) -> Value,
    {
        Ok(self.tree.list_reduce(path, init, f)?)
    }

    pub fn list_reduce_right<F>(
        &self,
        path: &[String],
        init: Value,
        f: F,
    ) -> Result<Value, EngineError>
    where
        F: Fn(Value, &Value) -> Value,
    {
        Ok(self.tree.list_reduce_right(path, init, f)?)
    }

    pub fn list_for_each<F>(&self, path: &[String], f: F) -> Result<(), EngineError>
    where
        F: FnMut(&Value),
    {
        Ok(self.tree.list_for_each(path, f)?)
    }

    pub fn list_every<F>(&self, path: &[String], f: F) -> Result<bool, EngineError>
    where
        F: Fn(&Value) -> bool,
    {
        Ok(self.tree.list_every(path, f)?)
    }

    pub fn list_some<F>(&self, path: &[String], f: F) -> Result<bool, EngineError>
    where
        F: Fn(&Value) -> bool,
    {
        Ok(self.tree.list_some(path, f)?)
    }

    pub fn list_find<F>(&self, path: &[String], f: F) -> Result<Option<Value>, EngineError>
    where
        F: Fn(&Value) -> bool,
    {
        Ok(self.tree.list_find(path, f)?)
    }

    pub fn list_find_index<F>(&self, path: &[String], f: F) -> Result<Option<usize>, EngineError>
    where
        F: Fn(&Value) -> bool,
    {
        Ok(self.tree.list_find_index(path, f)?)
    }

    // ---- ticking -------------------------------------------------------

    /// Registers work to run at the start of every tick, before the
    /// flush.
    pub fn before_tick<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Engine) + Send + 'static,
    {
        self.before_hooks.push(Box::new(handler));
    }

    /// Registers work to run at the end of every tick, after the flush.
    pub fn after_tick<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Engine) + Send + 'static,
    {
        self.after_hooks.push(Box::new(handler));
    }

    /// One broadcast pass: before-handlers, flush every queue through
    /// the transport, after-handlers.
    pub fn tick(&mut self) {
        self.ticks += 1;
        self.run_tick_handlers(true);
        self.scheduler
            .flush(self.transport.as_ref(), self.config.high_water_mark);
        self.run_tick_handlers(false);
    }

    fn run_tick_handlers(&mut self, before: bool) {
        let mut handlers = std::mem::take(if before {
            &mut self.before_hooks
        } else {
            &mut self.after_hooks
        });
        for handler in handlers.iter_mut() {
            handler(self);
        }
        let slot = if before {
            &mut self.before_hooks
        } else {
            &mut self.after_hooks
        };
        let added = std::mem::take(slot);
        handlers.extend(added);
        *slot = handlers;
    }
}
