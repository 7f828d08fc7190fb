//! Data structures shared by the reconciliation pipeline.
//!
//! Nothing here is persisted.  A [`ContainerRecord`] is recomputed from
//! the container runtime on every cycle and thrown away afterwards; a
//! [`Trigger`] only says *why* a cycle ran, never *what* changed, because
//! every cycle rebuilds the whole routing table from scratch.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One routable container, derived from its labels and network state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: String,
    /// Container name without Docker's leading `/`.
    pub name: String,
    /// Address on the managed network.
    pub ip: IpAddr,
    pub port: u16,
    /// Normalized prefix, always with leading and trailing slash.
    pub path_prefix: String,
    pub host: Option<String>,
    pub enabled: bool,
    /// Used to order claimants of the same path under last-wins.
    pub started_at: Option<DateTime<Utc>>,
}

impl ContainerRecord {
    /// Name of the upstream block serving this container.
    pub fn upstream_name(&self) -> String {
        format!("{}_backend", self.name)
    }

    /// `ip:port`, bracketing IPv6 addresses.
    pub fn backend_addr(&self) -> String {
        match self.ip {
            IpAddr::V4(ip) => format!("{}:{}", ip, self.port),
            IpAddr::V6(ip) => format!("[{}]:{}", ip, self.port),
        }
    }
}

/// The reason a reconciliation cycle was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Unconditional pass when the daemon starts.
    Startup,
    /// The event stream was re-established; events may have been missed.
    Resync,
    /// A container `start` or `die` event.
    Container { action: String, name: String },
    /// A container was connected to or disconnected from the managed network.
    Network { action: String, container: String },
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Startup => write!(f, "startup"),
            Trigger::Resync => write!(f, "resync"),
            Trigger::Container { action, name } => write!(f, "container {} {}", action, name),
            Trigger::Network { action, container } => {
                write!(f, "network {} {}", action, container)
            }
        }
    }
}

/// Result class of one audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Applied,
    Rejected,
    SkippedContainer,
    Fatal,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Applied => "applied",
            Outcome::Rejected => "rejected",
            Outcome::SkippedContainer => "skipped-container",
            Outcome::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// What one reconciliation cycle (or one skipped container within it) came to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationResult {
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
    pub diagnostic: String,
    /// Set for `skipped-container` results.
    pub container: Option<String>,
    /// Digest of the rendered artifact, once one exists.
    pub digest: Option<String>,
    /// Number of routes in the table this cycle built.
    pub routes: usize,
}

impl ReconciliationResult {
    pub fn new(outcome: Outcome, diagnostic: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            outcome,
            diagnostic: diagnostic.into(),
            container: None,
            digest: None,
            routes: 0,
        }
    }

    pub fn skipped(container: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            container: Some(container.into()),
            ..Self::new(Outcome::SkippedContainer, diagnostic)
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    pub fn with_routes(mut self, routes: usize) -> Self {
        self.routes = routes;
        self
    }
}
