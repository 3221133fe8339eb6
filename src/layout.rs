//! Read-only view of the fleet topology.
//!
//! A [`Layout`] is supplied from outside (typically a JSON file handed to the
//! CLI) and lists every participating agent with its role and API endpoint.
//! The engine only reads it to find synchronization peers.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Port the agent API listens on when a layout entry does not say otherwise.
pub const DEFAULT_AGENT_PORT: u16 = 4500;

/// Role an agent plays in a multi-machine workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "Client"),
            Role::Server => write!(f, "Server"),
        }
    }
}

/// One agent in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInstance {
    pub name: String,
    pub role: Role,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_AGENT_PORT
}

impl ClientInstance {
    pub fn new(name: impl Into<String>, role: Role, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            role,
            address: address.into(),
            port,
        }
    }

    /// `address:port`, used in logs and error context.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

impl fmt::Display for ClientInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.role, self.endpoint())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    #[serde(default)]
    pub instances: Vec<ClientInstance>,
}

impl Layout {
    pub fn new(instances: Vec<ClientInstance>) -> Self {
        Self { instances }
    }

    /// Loads a layout from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn instances_with_role(&self, role: Role) -> impl Iterator<Item = &ClientInstance> {
        self.instances.iter().filter(move |i| i.role == role)
    }

    /// A layout is multi-role when it has at least one client and one server.
    pub fn is_multi_role(&self) -> bool {
        self.instances_with_role(Role::Client).next().is_some()
            && self.instances_with_role(Role::Server).next().is_some()
    }
}
