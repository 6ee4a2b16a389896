//! Container metadata, lifecycle events and the container source interface

use crate::error::ContainerError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use hyper::body::Bytes;

/// Transport protocol of an exposed port
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PortProtocol {
    Tcp,
    Udp,
    Sctp,
}

/// A port declared as exposed by a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExposedPort {
    pub port: u16,
    pub protocol: PortProtocol,
}

impl ExposedPort {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: PortProtocol::Tcp,
        }
    }

    /// Parse Docker's `"8080/tcp"` notation. A missing protocol means TCP.
    pub fn parse(spec: &str) -> Option<Self> {
        let (port, protocol) = match spec.split_once('/') {
            Some((port, proto)) => (port, proto),
            None => (spec, "tcp"),
        };

        let protocol = match protocol.to_ascii_lowercase().as_str() {
            "tcp" => PortProtocol::Tcp,
            "udp" => PortProtocol::Udp,
            "sctp" => PortProtocol::Sctp,
            _ => return None,
        };

        Some(Self {
            port: port.trim().parse().ok()?,
            protocol,
        })
    }
}

/// The subset of inspected container state the gateway routes on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerMetadata {
    pub id: String,
    pub ip_address: String,
    pub exposed_ports: Vec<ExposedPort>,
    /// Environment as `KEY=value` entries
    pub env: Vec<String>,
    pub tty: bool,
}

impl ContainerMetadata {
    /// First 12 characters of the container id
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    /// Value of an environment variable set on the container
    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| match entry.split_once('=') {
            Some((key, value)) if key == name => Some(value),
            _ => None,
        })
    }

    /// The exposed port a destination should target: lowest TCP port first,
    /// then lowest port of any protocol.
    pub fn preferred_port(&self) -> Option<u16> {
        self.exposed_ports
            .iter()
            .filter(|p| p.protocol == PortProtocol::Tcp)
            .map(|p| p.port)
            .min()
            .or_else(|| self.exposed_ports.iter().map(|p| p.port).min())
    }
}

/// Length of the abbreviated container id Docker displays
pub const SHORT_ID_LEN: usize = 12;

pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

/// What a lifecycle event means for the routing table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    /// The container started and may need a route
    Start,
    /// The container is going away (stop, destroy, kill, die)
    Remove,
    /// Not relevant for routing
    Ignore,
}

/// A container lifecycle notification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerEvent {
    pub id: String,
    pub status: String,
}

impl ContainerEvent {
    pub fn new(id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: status.into(),
        }
    }

    /// Events without an id or status carry nothing to reconcile
    pub fn is_keepalive(&self) -> bool {
        self.id.is_empty() || self.status.is_empty()
    }

    pub fn action(&self) -> EventAction {
        match self.status.as_str() {
            "start" => EventAction::Start,
            "stop" | "destroy" | "kill" | "die" => EventAction::Remove,
            _ => EventAction::Ignore,
        }
    }
}

/// Stream of lifecycle events from a container source
pub type EventStream = BoxStream<'static, Result<ContainerEvent, ContainerError>>;

/// Container-management API the gateway reconciles against
#[async_trait]
pub trait ContainerSource: Send + Sync {
    /// Ids of all currently running containers
    async fn list_running(&self) -> Result<Vec<String>, ContainerError>;

    /// Inspect a container. Returns `ContainerError::NotFound` once it is gone.
    async fn inspect(&self, id: &str) -> Result<ContainerMetadata, ContainerError>;

    /// Subscribe to container lifecycle events
    async fn events(&self) -> Result<EventStream, ContainerError>;

    /// Last `tail` lines of combined stdout/stderr
    async fn logs(&self, id: &str, tail: &str) -> Result<Bytes, ContainerError>;

    /// Run a command inside the container and capture its output
    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<Bytes, ContainerError>;
}
