use super::{ContainerDetails, ContainerRuntime, EventSource};
use crate::error::DiscoveryError;
use crate::types::Trigger;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerInspectResponse, EventMessage, EventMessageTypeEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Networks every Docker host has; never a managed network.
const BUILTIN_NETWORKS: [&str; 3] = ["bridge", "host", "none"];

pub struct DockerRuntime {
    docker: Docker,
    network_name: String,
}

impl DockerRuntime {
    pub fn new(docker: Docker, network_name: String) -> Self {
        Self {
            docker,
            network_name,
        }
    }

    pub fn connect() -> Result<Docker> {
        // Connect to the local Docker daemon using default settings.
        // This handles unix socket on Linux.
        Docker::connect_with_local_defaults().map_err(Into::into)
    }

    /// Inspects the current container to find the first user-defined network.
    /// Used when `network_name` is not configured.
    pub async fn autodetect_network(docker: &Docker) -> Result<String> {
        info!("`network_name` not specified, attempting to auto-detect managed network...");
        // In a Docker container, the hostname is typically the container ID.
        let hostname = env::var("HOSTNAME")?;
        let container_detail = docker.inspect_container(&hostname, None).await?;

        let mut names: Vec<String> = container_detail
            .network_settings
            .and_then(|s| s.networks)
            .map(|networks| networks.into_keys().collect())
            .unwrap_or_default();
        names.sort();

        names
            .into_iter()
            .find(|name| !BUILTIN_NETWORKS.contains(&name.as_str()))
            .map(|name| {
                info!("Auto-detected managed network: {}", name);
                name
            })
            .ok_or_else(|| anyhow!("Could not auto-detect a managed network for this container."))
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn running_containers(&self) -> Result<Vec<String>, DiscoveryError> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, DiscoveryError> {
        match self.docker.inspect_container(id, None).await {
            Ok(detail) => Ok(details_from(detail)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(DiscoveryError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

/// The two Docker calls the watcher needs.
#[async_trait]
trait EventFeed: Send + Sync {
    async fn ping(&self) -> Result<(), bollard::errors::Error>;
    fn subscribe(&self) -> BoxStream<'_, Result<EventMessage, bollard::errors::Error>>;
}

#[async_trait]
impl EventFeed for Docker {
    async fn ping(&self) -> Result<(), bollard::errors::Error> {
        Docker::ping(self).await.map(|_| ())
    }

    fn subscribe(&self) -> BoxStream<'_, Result<EventMessage, bollard::errors::Error>> {
        let opts = EventsOptions::<String> {
            filters: event_filters(),
            ..Default::default()
        };
        self.events(Some(opts)).boxed()
    }
}

#[async_trait]
impl EventSource for DockerRuntime {
    async fn watch(&self, trigger_tx: mpsc::Sender<Trigger>) -> Result<()> {
        watch_feed(&self.docker, &self.network_name, trigger_tx).await
    }
}

/// Forward relevant events until `trigger_tx` closes, reconnecting forever.
///
/// Every subscription, the first included, is followed by a resync: the
/// startup cycle may have raced the subscription or failed outright, and
/// anything that happened while disconnected was missed.
async fn watch_feed(
    feed: &dyn EventFeed,
    network_name: &str,
    trigger_tx: mpsc::Sender<Trigger>,
) -> Result<()> {
    let mut backoff = Backoff::default();

    loop {
        if let Err(e) = feed.ping().await {
            let delay = backoff.next_delay();
            error!(
                "Failed to reach Docker: {}. Retrying in {}s...",
                e,
                delay.as_secs()
            );
            sleep(delay).await;
            continue;
        }
        backoff.reset();

        let mut stream = feed.subscribe();
        info!("Listening for Docker events on network {}...", network_name);

        if trigger_tx.send(Trigger::Resync).await.is_err() {
            info!("Trigger channel closed, stopping watcher");
            return Ok(());
        }

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(event) => {
                    let Some(trigger) = classify(event, network_name) else {
                        continue;
                    };
                    debug!("Docker event: {}", trigger);
                    if trigger_tx.send(trigger).await.is_err() {
                        info!("Trigger channel closed, stopping watcher");
                        return Ok(());
                    }
                }
                Err(e) => {
                    error!("Error in Docker event stream: {}", e);
                    break; // Break inner loop to reconnect
                }
            }
        }

        let delay = backoff.next_delay();
        warn!(
            "Docker event stream ended. Reconnecting in {}s...",
            delay.as_secs()
        );
        sleep(delay).await;
    }
}

fn event_filters() -> HashMap<String, Vec<String>> {
    [
        ("type", ["container", "network"].as_slice()),
        ("event", ["start", "die", "connect", "disconnect"].as_slice()),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
    .collect()
}

/// Map a raw Docker event to a trigger, dropping anything irrelevant.
fn classify(event: EventMessage, network_name: &str) -> Option<Trigger> {
    let action = event.action.unwrap_or_default();
    let actor = event.actor?;
    let attributes = actor.attributes.unwrap_or_default();

    match event.typ {
        Some(EventMessageTypeEnum::CONTAINER) => {
            if action != "start" && action != "die" {
                return None;
            }
            let name = attributes
                .get("name")
                .filter(|n| !n.is_empty())
                .cloned()
                .or(actor.id)
                .filter(|n| !n.is_empty())?;
            Some(Trigger::Container { action, name })
        }
        Some(EventMessageTypeEnum::NETWORK) => {
            if action != "connect" && action != "disconnect" {
                return None;
            }
            if attributes.get("name").map(String::as_str) != Some(network_name) {
                return None;
            }
            let container = attributes.get("container").cloned().unwrap_or_default();
            Some(Trigger::Network { action, container })
        }
        _ => None,
    }
}

fn details_from(detail: ContainerInspectResponse) -> ContainerDetails {
    let (running, started_at) = match &detail.state {
        Some(state) => (
            state.running.unwrap_or(false),
            state.started_at.as_deref().and_then(parse_timestamp),
        ),
        None => (false, None),
    };

    let (labels, exposed_ports) = match detail.config {
        Some(config) => {
            let labels: BTreeMap<String, String> =
                config.labels.unwrap_or_default().into_iter().collect();
            let mut ports: Vec<String> = config
                .exposed_ports
                .map(|p| p.into_keys().collect())
                .unwrap_or_default();
            ports.sort();
            (labels, ports)
        }
        None => (BTreeMap::new(), Vec::new()),
    };

    let mut addresses = BTreeMap::new();
    if let Some(networks) = detail.network_settings.and_then(|s| s.networks) {
        for (name, net) in networks {
            let ip = [net.ip_address, net.global_ipv6_address]
                .into_iter()
                .flatten()
                .find_map(|s| s.parse::<IpAddr>().ok());
            if let Some(ip) = ip {
                addresses.insert(name, ip);
            }
        }
    }

    ContainerDetails {
        id: detail.id.unwrap_or_default(),
        name: detail
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        running,
        started_at,
        labels,
        addresses,
        exposed_ports,
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Exponential reconnect delay, doubling up to [`MAX_BACKOFF`].
#[derive(Debug)]
struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            current: INITIAL_BACKOFF,
        }
    }
}

impl Backoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{
        ContainerConfig, ContainerState, EndpointSettings, EventActor, NetworkSettings,
    };
    use futures_util::stream;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    type Events = Vec<Result<EventMessage, bollard::errors::Error>>;

    /// Plays back ping results and one batch of events per subscription.
    /// Once the script runs out every ping succeeds and every stream ends.
    #[derive(Default)]
    struct ScriptedFeed {
        pings: Mutex<VecDeque<bool>>,
        subscriptions: Mutex<VecDeque<Events>>,
    }

    #[async_trait]
    impl EventFeed for ScriptedFeed {
        async fn ping(&self) -> Result<(), bollard::errors::Error> {
            match self.pings.lock().unwrap().pop_front() {
                Some(false) => Err(server_error("daemon unavailable")),
                _ => Ok(()),
            }
        }

        fn subscribe(&self) -> BoxStream<'_, Result<EventMessage, bollard::errors::Error>> {
            let events = self
                .subscriptions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            stream::iter(events).boxed()
        }
    }

    fn server_error(message: &str) -> bollard::errors::Error {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: message.to_string(),
        }
    }

    fn event(typ: EventMessageTypeEnum, action: &str, attrs: &[(&str, &str)]) -> EventMessage {
        EventMessage {
            typ: Some(typ),
            action: Some(action.to_string()),
            actor: Some(EventActor {
                id: Some("0123abcd".to_string()),
                attributes: Some(
                    attrs
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn classifies_container_start_and_die() {
        let start = event(EventMessageTypeEnum::CONTAINER, "start", &[("name", "api")]);
        assert_eq!(
            classify(start, "apps"),
            Some(Trigger::Container {
                action: "start".into(),
                name: "api".into()
            })
        );

        // Falls back to the actor id when the name attribute is missing.
        let die = event(EventMessageTypeEnum::CONTAINER, "die", &[]);
        assert_eq!(
            classify(die, "apps"),
            Some(Trigger::Container {
                action: "die".into(),
                name: "0123abcd".into()
            })
        );
    }

    #[test]
    fn ignores_other_container_actions() {
        let exec = event(EventMessageTypeEnum::CONTAINER, "exec_start", &[("name", "api")]);
        assert_eq!(classify(exec, "apps"), None);
    }

    #[test]
    fn network_events_only_for_managed_network() {
        let ours = event(
            EventMessageTypeEnum::NETWORK,
            "connect",
            &[("name", "apps"), ("container", "c1")],
        );
        assert_eq!(
            classify(ours, "apps"),
            Some(Trigger::Network {
                action: "connect".into(),
                container: "c1".into()
            })
        );

        let other = event(
            EventMessageTypeEnum::NETWORK,
            "connect",
            &[("name", "bridge"), ("container", "c1")],
        );
        assert_eq!(classify(other, "apps"), None);
    }

    #[test]
    fn image_events_are_dropped() {
        let pull = event(EventMessageTypeEnum::IMAGE, "start", &[("name", "x")]);
        assert_eq!(classify(pull, "apps"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn resync_follows_every_subscription() {
        let feed = Arc::new(ScriptedFeed::default());
        // Docker is down at first, then the first stream breaks after one event.
        feed.pings.lock().unwrap().extend([false, false, true, true]);
        feed.subscriptions.lock().unwrap().extend([
            vec![
                Ok(event(EventMessageTypeEnum::CONTAINER, "start", &[("name", "api")])),
                Err(server_error("connection reset")),
            ],
            vec![Ok(event(EventMessageTypeEnum::CONTAINER, "die", &[("name", "api")]))],
        ]);

        let (tx, mut rx) = mpsc::channel(8);
        let watcher = {
            let feed = Arc::clone(&feed);
            tokio::spawn(async move { watch_feed(feed.as_ref(), "apps", tx).await })
        };

        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(rx.recv().await.unwrap());
        }
        assert_eq!(
            received,
            vec![
                Trigger::Resync,
                Trigger::Container {
                    action: "start".into(),
                    name: "api".into()
                },
                Trigger::Resync,
                Trigger::Container {
                    action: "die".into(),
                    name: "api".into()
                },
            ]
        );

        drop(rx);
        assert!(watcher.await.unwrap().is_ok());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), INITIAL_BACKOFF);
    }

    #[test]
    fn converts_inspect_response() {
        let mut networks = HashMap::new();
        networks.insert(
            "apps".to_string(),
            EndpointSettings {
                ip_address: Some("172.18.0.5".to_string()),
                ..Default::default()
            },
        );
        networks.insert(
            "v6only".to_string(),
            EndpointSettings {
                ip_address: Some(String::new()),
                global_ipv6_address: Some("fd00::5".to_string()),
                ..Default::default()
            },
        );
        let mut exposed = HashMap::new();
        exposed.insert("8080/tcp".to_string(), HashMap::new());

        let detail = ContainerInspectResponse {
            id: Some("abc".to_string()),
            name: Some("/beneficiaries".to_string()),
            state: Some(ContainerState {
                running: Some(true),
                started_at: Some("2024-05-01T10:00:00.123456789Z".to_string()),
                ..Default::default()
            }),
            config: Some(ContainerConfig {
                labels: Some(HashMap::from([(
                    "path".to_string(),
                    "/dev/beneficiaries".to_string(),
                )])),
                exposed_ports: Some(exposed),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        };

        let details = details_from(detail);
        assert_eq!(details.name, "beneficiaries");
        assert!(details.running);
        assert!(details.started_at.is_some());
        assert_eq!(details.exposed_ports, vec!["8080/tcp".to_string()]);
        assert_eq!(
            details.addresses.get("apps"),
            Some(&"172.18.0.5".parse().unwrap())
        );
        assert_eq!(
            details.addresses.get("v6only"),
            Some(&"fd00::5".parse().unwrap())
        );
    }
}
