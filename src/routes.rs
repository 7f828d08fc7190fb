//! Route table construction.
//!
//! Every cycle enumerates all running containers and builds the table from
//! nothing.  There is no patching of a previous table: a dropped, duplicated
//! or reordered event is corrected by the next full rebuild.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, PathCollision};
use crate::metadata::{Extraction, MetadataExtractor};
use crate::runtime::ContainerRuntime;
use crate::types::ContainerRecord;

/// What to do when two containers claim the same path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollisionPolicy {
    /// Reject the whole cycle; nothing is applied.
    #[default]
    Reject,
    /// Keep the most recently started claimant and warn.
    LastWins,
}

/// A container left out of this cycle because it could not be examined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedContainer {
    pub container: String,
    pub reason: String,
}

/// Eligible records plus the containers that had to be skipped.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub records: Vec<ContainerRecord>,
    pub skipped: Vec<SkippedContainer>,
}

/// Enumerate every running container and run it through the extractor.
///
/// Only a failure to list containers at all is an error; a container that
/// cannot be inspected or carries bad labels is reported in
/// [`Snapshot::skipped`] and the rest of the snapshot still stands.
pub async fn collect(
    runtime: &dyn ContainerRuntime,
    extractor: &MetadataExtractor,
) -> Result<Snapshot, DiscoveryError> {
    let mut snapshot = Snapshot::default();

    for id in runtime.running_containers().await? {
        let details = match runtime.inspect(&id).await {
            Ok(details) => details,
            Err(DiscoveryError::NotFound(_)) => {
                debug!("Container {} went away before inspection", id);
                continue;
            }
            Err(e) => {
                warn!("Skipping container {}: {}", id, e);
                snapshot.skipped.push(SkippedContainer {
                    container: id,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        match extractor.extract(&details) {
            Ok(Extraction::Eligible(record)) => snapshot.records.push(record),
            Ok(Extraction::NotEligible(why)) => {
                debug!("Container {} not routed: {:?}", details.name, why);
            }
            Err(source) => {
                let e = DiscoveryError::Label {
                    name: details.name.clone(),
                    source,
                };
                warn!("Skipping container: {}", e);
                snapshot.skipped.push(SkippedContainer {
                    container: details.name,
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(snapshot)
}

/// Canonical, name-ordered set of routes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    routes: Vec<ContainerRecord>,
}

/// A table together with the collisions last-wins resolved.
#[derive(Debug, Clone, Default)]
pub struct BuiltTable {
    pub table: RouteTable,
    pub warnings: Vec<PathCollision>,
}

impl RouteTable {
    pub fn build(
        records: Vec<ContainerRecord>,
        policy: CollisionPolicy,
    ) -> Result<BuiltTable, PathCollision> {
        let mut by_path: BTreeMap<String, Vec<ContainerRecord>> = BTreeMap::new();
        for record in records.into_iter().filter(|r| r.enabled) {
            by_path
                .entry(record.path_prefix.clone())
                .or_default()
                .push(record);
        }

        let mut routes = Vec::new();
        let mut warnings = Vec::new();

        for (path, mut claimants) in by_path {
            claimants.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
            if claimants.len() == 1 {
                routes.extend(claimants);
                continue;
            }

            let collision = PathCollision {
                path,
                claimants: claimants.iter().map(|c| c.name.clone()).collect(),
            };
            match policy {
                CollisionPolicy::Reject => return Err(collision),
                CollisionPolicy::LastWins => {
                    // Latest start wins; among equal starts the last name wins.
                    let winner = claimants
                        .into_iter()
                        .max_by(|a, b| {
                            a.started_at
                                .cmp(&b.started_at)
                                .then_with(|| a.name.cmp(&b.name))
                        })
                        .ok_or_else(|| collision.clone())?;
                    warn!("{}; keeping {}", collision, winner.name);
                    routes.push(winner);
                    warnings.push(collision);
                }
            }
        }

        routes.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(BuiltTable {
            table: RouteTable { routes },
            warnings,
        })
    }

    pub fn routes(&self) -> &[ContainerRecord] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.routes.iter().map(|r| r.name.clone()).collect()
    }
}
