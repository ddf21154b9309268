//! Node registry: tracks directly connected nodes by installation.
//!
//! The [`NodeRegistry`] records every node we have completed a handshake
//! with, keyed by its persistent instance id. Only one session of an
//! installation is authoritative at a time; when a second session of the
//! same instance id shows up while the first is still connected, the
//! configured [`NodeIdCollisionPolicy`] decides which one wins.

use crate::channel::ChannelId;
use chrono::{DateTime, Utc};
use nodelink_types::{InitialNodeInformation, InstanceNodeSessionId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Connection state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Connected,
    /// Connection lost but entry kept.
    Disconnected,
}

/// An entry representing a single known node session.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub info: InitialNodeInformation,
    /// Channel over which the node was learned.
    pub channel_id: ChannelId,
    pub state: NodeState,
    pub connected_at: DateTime<Utc>,
}

impl NodeEntry {
    pub fn new(info: InitialNodeInformation, channel_id: impl Into<ChannelId>) -> Self {
        Self {
            info,
            channel_id: channel_id.into(),
            state: NodeState::Connected,
            connected_at: Utc::now(),
        }
    }

    pub fn node_id(&self) -> &InstanceNodeSessionId {
        &self.info.node_id
    }
}

/// Decision of a collision policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionDecision {
    KeepExisting,
    ReplaceWithIncoming,
}

/// Resolves two live sessions sharing one instance id.
pub trait NodeIdCollisionPolicy: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn resolve(&self, existing: &NodeEntry, incoming: &NodeEntry) -> CollisionDecision;
}

/// The newer session wins; typical after a crash and restart where the old
/// connection has not timed out yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreferNewestSession;

impl NodeIdCollisionPolicy for PreferNewestSession {
    fn name(&self) -> &'static str {
        "prefer-newest"
    }

    fn resolve(&self, _existing: &NodeEntry, _incoming: &NodeEntry) -> CollisionDecision {
        CollisionDecision::ReplaceWithIncoming
    }
}

/// The first session stays authoritative until it disconnects.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepExistingSession;

impl NodeIdCollisionPolicy for KeepExistingSession {
    fn name(&self) -> &'static str {
        "keep-existing"
    }

    fn resolve(&self, _existing: &NodeEntry, _incoming: &NodeEntry) -> CollisionDecision {
        CollisionDecision::KeepExisting
    }
}

/// Result of [`NodeRegistry::register`].
#[derive(Debug, Clone)]
pub enum RegistrationOutcome {
    /// First session of this instance, or the previous one was disconnected.
    Added,
    /// Same session seen again (e.g. a second channel).
    Updated,
    /// A live session of the same instance was displaced.
    Replaced { previous: NodeEntry },
    /// The incoming session lost against a live one.
    Rejected { existing: NodeEntry },
}

/// Thread-safe registry of known nodes.
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<String, NodeEntry>>>,
    policy: Arc<dyn NodeIdCollisionPolicy>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(Arc::new(PreferNewestSession))
    }
}

impl NodeRegistry {
    pub fn new(policy: Arc<dyn NodeIdCollisionPolicy>) -> Self {
        Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
            policy,
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Register a node after a successful handshake.
    pub fn register(&self, entry: NodeEntry) -> RegistrationOutcome {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let key = entry.node_id().instance_id.clone();
        let Some(existing) = nodes.get(&key).cloned() else {
            nodes.insert(key, entry);
            return RegistrationOutcome::Added;
        };

        if existing.node_id() == entry.node_id() {
            nodes.insert(key, entry);
            return RegistrationOutcome::Updated;
        }
        if existing.state == NodeState::Disconnected {
            nodes.insert(key, entry);
            return RegistrationOutcome::Added;
        }

        match self.policy.resolve(&existing, &entry) {
            CollisionDecision::ReplaceWithIncoming => {
                warn!(
                    previous = %existing.node_id(),
                    incoming = %entry.node_id(),
                    policy = self.policy.name(),
                    "Registry: node id collision, replacing session"
                );
                nodes.insert(key, entry);
                RegistrationOutcome::Replaced { previous: existing }
            }
            CollisionDecision::KeepExisting => {
                warn!(
                    existing = %existing.node_id(),
                    incoming = %entry.node_id(),
                    policy = self.policy.name(),
                    "Registry: node id collision, keeping existing session"
                );
                RegistrationOutcome::Rejected { existing }
            }
        }
    }

    /// Whether `node_id` would be accepted right now, without registering it.
    pub fn would_accept(&self, info: &InitialNodeInformation) -> bool {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        match nodes.get(&info.node_id.instance_id) {
            Some(existing)
                if existing.state == NodeState::Connected
                    && existing.node_id() != &info.node_id =>
            {
                let probe = NodeEntry::new(info.clone(), String::new());
                self.policy.resolve(existing, &probe) == CollisionDecision::ReplaceWithIncoming
            }
            _ => true,
        }
    }

    /// Mark a session as disconnected if it is still the registered one.
    pub fn mark_disconnected(&self, node_id: &InstanceNodeSessionId) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = nodes.get_mut(&node_id.instance_id) {
            if entry.node_id() == node_id {
                entry.state = NodeState::Disconnected;
            }
        }
    }

    /// Remove an installation entirely.
    pub fn remove(&self, instance_id: &str) -> Option<NodeEntry> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.remove(instance_id)
    }

    /// Get a snapshot of the entry for an installation.
    pub fn get(&self, instance_id: &str) -> Option<NodeEntry> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.get(instance_id).cloned()
    }

    /// Whether `node_id` is the authoritative, connected session of its instance.
    pub fn is_authoritative(&self, node_id: &InstanceNodeSessionId) -> bool {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes
            .get(&node_id.instance_id)
            .map(|e| e.node_id() == node_id && e.state == NodeState::Connected)
            .unwrap_or(false)
    }

    /// Get all connected nodes.
    pub fn connected_nodes(&self) -> Vec<NodeEntry> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes
            .values()
            .filter(|n| n.state == NodeState::Connected)
            .cloned()
            .collect()
    }

    /// Get all nodes (connected + disconnected).
    pub fn all_nodes(&self) -> Vec<NodeEntry> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.values().cloned().collect()
    }

    /// Number of connected nodes.
    pub fn connected_count(&self) -> usize {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes
            .values()
            .filter(|n| n.state == NodeState::Connected)
            .count()
    }
}
