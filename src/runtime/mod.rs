use std::collections::BTreeMap;
use std::net::IpAddr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::DiscoveryError;
use crate::types::Trigger;

pub mod docker;
#[cfg(test)]
pub mod memory;

pub use docker::DockerRuntime;

/// Runtime-neutral view of an inspected container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    /// Network name to the container's address on it.
    pub addresses: BTreeMap<String, IpAddr>,
    /// Declared ports, as `8080/tcp`.
    pub exposed_ports: Vec<String>,
}

/// Read access to the current state of the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Identifiers of every running container.
    async fn running_containers(&self) -> Result<Vec<String>, DiscoveryError>;

    /// Inspect a single container.
    async fn inspect(&self, id: &str) -> Result<ContainerDetails, DiscoveryError>;
}

/// Source of reconciliation triggers.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Watch the runtime until `trigger_tx` is closed, sending one trigger
    /// per relevant event.  Disconnects are retried internally.
    async fn watch(&self, trigger_tx: mpsc::Sender<Trigger>) -> Result<()>;
}
