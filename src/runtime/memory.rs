//! In-memory container runtime for driving the reconciler in tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use super::{ContainerDetails, ContainerRuntime};
use crate::error::DiscoveryError;

#[derive(Default)]
pub struct MemoryRuntime {
    containers: RwLock<BTreeMap<String, ContainerDetails>>,
    /// Containers whose inspection fails as if the runtime hiccuped.
    broken: RwLock<BTreeSet<String>>,
    clock: RwLock<i64>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&self) -> DateTime<Utc> {
        let mut clock = self.clock.write().unwrap();
        *clock += 1;
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(*clock)
    }

    /// Start a container attached to `network` at `ip`.
    pub fn start(&self, name: &str, network: &str, ip: &str, labels: &[(&str, &str)]) {
        let mut addresses = BTreeMap::new();
        addresses.insert(network.to_string(), ip.parse().unwrap());
        let details = ContainerDetails {
            id: format!("id-{}", name),
            name: name.to_string(),
            running: true,
            started_at: Some(self.tick()),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            addresses,
            exposed_ports: vec!["80/tcp".to_string()],
        };
        self.insert(details);
    }

    pub fn insert(&self, details: ContainerDetails) {
        self.containers
            .write()
            .unwrap()
            .insert(details.id.clone(), details);
    }

    pub fn stop(&self, name: &str) {
        self.containers
            .write()
            .unwrap()
            .retain(|_, c| c.name != name);
    }

    pub fn break_inspect(&self, name: &str) {
        self.broken.write().unwrap().insert(format!("id-{}", name));
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn running_containers(&self) -> Result<Vec<String>, DiscoveryError> {
        Ok(self
            .containers
            .read()
            .unwrap()
            .values()
            .filter(|c| c.running)
            .map(|c| c.id.clone())
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, DiscoveryError> {
        if self.broken.read().unwrap().contains(id) {
            return Err(DiscoveryError::Docker(
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 500,
                    message: format!("inspect of {} timed out", id),
                },
            ));
        }
        self.containers
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| DiscoveryError::NotFound(id.to_string()))
    }
}
