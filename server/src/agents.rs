use log::info;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Client,
    Team,
}

/// A connected peer: its inbound health counters plus the protocol
/// properties the application may set on it.
#[derive(Debug, Clone)]
pub struct ClientAgent {
    pub id: String,
    pub controller: Value,
    pub space: Option<String>,
    pub malformed_warnings: u32,
}

impl ClientAgent {
    fn new(id: &str) -> Self {
        ClientAgent {
            id: id.to_string(),
            controller: Value::Null,
            space: None,
            malformed_warnings: 0,
        }
    }
}

/// A server-created group agent. Teams own a subtree like clients do
/// but have no connection; whatever is visible to a team is visible to
/// its current members, and the `published` paths are replayed to
/// whoever joins later.
#[derive(Debug, Clone, Default)]
pub struct TeamAgent {
    pub members: BTreeSet<String>,
    pub published: BTreeSet<Vec<String>>,
}

/// All known agents, clients and teams, keyed by id.
///
/// Ordered maps keep iteration (and therefore broadcast and snapshot
/// order) deterministic, which the tests lean on.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    clients: BTreeMap<String, ClientAgent>,
    teams: BTreeMap<String, TeamAgent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_client(&mut self, id: &str) {
        self.clients.insert(id.to_string(), ClientAgent::new(id));
    }

    pub fn remove_client(&mut self, id: &str) -> Option<ClientAgent> {
        for team in self.teams.values_mut() {
            team.members.remove(id);
        }
        self.clients.remove(id)
    }

    pub fn client(&self, id: &str) -> Option<&ClientAgent> {
        self.clients.get(id)
    }

    pub fn client_mut(&mut self, id: &str) -> Option<&mut ClientAgent> {
        self.clients.get_mut(id)
    }

    pub fn add_team(&mut self, id: &str) -> bool {
        if self.teams.contains_key(id) || self.clients.contains_key(id) {
            return false;
        }
        self.teams.insert(id.to_string(), TeamAgent::default());
        info!("Created team {}", id);
        true
    }

    pub fn remove_team(&mut self, id: &str) -> Option<TeamAgent> {
        self.teams.remove(id)
    }

    pub fn team(&self, id: &str) -> Option<&TeamAgent> {
        self.teams.get(id)
    }

    pub fn team_mut(&mut self, id: &str) -> Option<&mut TeamAgent> {
        self.teams.get_mut(id)
    }

    pub fn is_client(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub fn is_team(&self, id: &str) -> bool {
        self.teams.contains_key(id)
    }

    pub fn kind_of(&self, id: &str) -> Option<AgentKind> {
        if self.is_client(id) {
            Some(AgentKind::Client)
        } else if self.is_team(id) {
            Some(AgentKind::Team)
        } else {
            None
        }
    }

    pub fn client_ids(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    pub fn team_ids(&self) -> impl Iterator<Item = &str> {
        self.teams.keys().map(String::as_str)
    }

    /// Teams the given client currently belongs to.
    pub fn memberships(&self, client: &str) -> Vec<String> {
        self.teams
            .iter()
            .filter(|(_, team)| team.members.contains(client))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn join(&mut self, team: &str, client: &str) -> bool {
        match self.teams.get_mut(team) {
            Some(t) => t.members.insert(client.to_string()),
            None => false,
        }
    }

    pub fn leave(&mut self, team: &str, client: &str) -> bool {
        match self.teams.get_mut(team) {
            Some(t) => t.members.remove(client),
            None => false,
        }
    }

    /// Expands a visibility set into concrete client recipients: each
    /// granted client directly, each granted team through its current
    /// membership, plus the owner when the owner is a client. Team
    /// grants are expanded fresh on every call, so membership changes
    /// retarget past grants automatically.
    pub fn expand(&self, grants: &HashSet<String>, owner: &str) -> BTreeSet<String> {
        let mut recipients = BTreeSet::new();
        if self.is_client(owner) {
            recipients.insert(owner.to_string());
        }
        for grant in grants {
            if self.is_client(grant) {
                recipients.insert(grant.clone());
            } else if let Some(team) = self.teams.get(grant) {
                recipients.extend(team.members.iter().cloned());
            }
        }
        recipients
    }

    /// Whether `viewer` may observe a node owned by `owner` with the
    /// given grants, either directly, through team membership, or by
    /// being the owner.
    pub fn can_see(&self, grants: &HashSet<String>, owner: &str, viewer: &str) -> bool {
        if viewer == owner || grants.contains(viewer) {
            return true;
        }
        self.teams
            .iter()
            .any(|(id, team)| grants.contains(id) && team.members.contains(viewer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grants(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn expansion_resolves_teams_to_members() {
        let mut reg = AgentRegistry::new();
        reg.add_client("alice");
        reg.add_client("bob");
        reg.add_client("carol");
        reg.add_team("red");
        reg.join("red", "bob");
        reg.join("red", "carol");

        let recipients = reg.expand(&grants(&["red"]), "alice");
        let expected: Vec<&str> = vec!["alice", "bob", "carol"];
        assert_eq!(recipients.iter().map(String::as_str).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn expansion_tracks_membership_changes() {
        let mut reg = AgentRegistry::new();
        reg.add_client("alice");
        reg.add_client("bob");
        reg.add_team("red");

        let g = grants(&["red"]);
        assert!(!reg.expand(&g, "alice").contains("bob"));
        reg.join("red", "bob");
        assert!(reg.expand(&g, "alice").contains("bob"));
        reg.leave("red", "bob");
        assert!(!reg.expand(&g, "alice").contains("bob"));
    }

    #[test]
    fn team_owned_nodes_have_no_implicit_client_owner() {
        let mut reg = AgentRegistry::new();
        reg.add_client("alice");
        reg.add_team("red");
        reg.join("red", "alice");

        // The owner being a team contributes nothing by itself; only
        // grants reach clients.
        assert!(reg.expand(&HashSet::new(), "red").is_empty());
        let via_grant = reg.expand(&grants(&["red"]), "red");
        assert_eq!(via_grant.len(), 1);
        assert!(via_grant.contains("alice"));
    }

    #[test]
    fn can_see_covers_owner_direct_and_team_paths() {
        let mut reg = AgentRegistry::new();
        reg.add_client("alice");
        reg.add_client("bob");
        reg.add_client("eve");
        reg.add_team("red");
        reg.join("red", "bob");

        let g = grants(&["red"]);
        assert!(reg.can_see(&g, "alice", "alice"));
        assert!(reg.can_see(&g, "alice", "bob"));
        assert!(!reg.can_see(&g, "alice", "eve"));
        assert!(reg.can_see(&grants(&["eve"]), "alice", "eve"));
        // A team id itself can be the viewer, via a direct grant.
        assert!(reg.can_see(&g, "alice", "red"));
    }

    #[test]
    fn removing_a_client_leaves_its_teams() {
        let mut reg = AgentRegistry::new();
        reg.add_client("bob");
        reg.add_team("red");
        reg.join("red", "bob");
        assert_eq!(reg.memberships("bob"), vec!["red".to_string()]);

        reg.remove_client("bob");
        assert!(reg.team("red").unwrap().members.is_empty());
    }

    #[test]
    fn team_names_cannot_shadow_clients() {
        let mut reg = AgentRegistry::new();
        reg.add_client("alice");
        assert!(!reg.add_team("alice"));
        assert!(reg.add_team("red"));
        assert!(!reg.add_team("red"));
    }
}
