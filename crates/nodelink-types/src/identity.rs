//! Node identities.
//!
//! A node installation has a persistent *instance id* that survives restarts.
//! Every running process of that installation additionally gets a random
//! *session part*; the pair forms an [`InstanceNodeSessionId`]. Two session
//! ids with the same instance id belong to the same installation (for example
//! before and after a crash) and are treated as colliding identities by the
//! node registry.

use crate::error::NodeLinkError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between instance id and session part in the string form.
pub const SESSION_PART_SEPARATOR: char = ':';

/// Length of the random session part (hex characters).
pub const SESSION_PART_LENGTH: usize = 10;

/// Globally unique id of one running node process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceNodeSessionId {
    /// Persistent id of the installation.
    pub instance_id: String,
    /// Random id of this process run.
    pub session_part: String,
}

impl InstanceNodeSessionId {
    /// Create an id from its two parts.
    pub fn new(instance_id: impl Into<String>, session_part: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            session_part: session_part.into(),
        }
    }

    /// Create a new id for the given installation with a random session part.
    pub fn generate(instance_id: impl Into<String>) -> Self {
        let mut rng = rand::thread_rng();
        let session_part: String = (0..SESSION_PART_LENGTH)
            .map(|_| format!("{:x}", rng.gen_range(0..16u8)))
            .collect();
        Self::new(instance_id, session_part)
    }

    /// Whether both ids refer to the same installation (possibly different runs).
    pub fn is_same_instance_as(&self, other: &InstanceNodeSessionId) -> bool {
        self.instance_id == other.instance_id
    }
}

impl fmt::Display for InstanceNodeSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.instance_id, SESSION_PART_SEPARATOR, self.session_part
        )
    }
}

impl FromStr for InstanceNodeSessionId {
    type Err = NodeLinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(SESSION_PART_SEPARATOR) {
            Some((instance, session)) if !instance.is_empty() && !session.is_empty() => {
                Ok(Self::new(instance, session))
            }
            _ => Err(NodeLinkError::InvalidNodeId(s.to_string())),
        }
    }
}

/// Identity information exchanged in both directions during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialNodeInformation {
    /// Session id of the node.
    pub node_id: InstanceNodeSessionId,
    /// Human-readable node name.
    pub display_name: String,
    /// Whether the node forwards requests for other nodes.
    #[serde(default)]
    pub is_relay: bool,
}

impl InitialNodeInformation {
    pub fn new(node_id: InstanceNodeSessionId, display_name: impl Into<String>) -> Self {
        Self {
            node_id,
            display_name: display_name.into(),
            is_relay: false,
        }
    }

    /// Builder-style relay flag.
    pub fn with_relay(mut self, is_relay: bool) -> Self {
        self.is_relay = is_relay;
        self
    }
}

impl fmt::Display for InitialNodeInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" [{}]", self.display_name, self.node_id)
    }
}
