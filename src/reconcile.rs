//! The reconciliation loop.
//!
//! One trigger drives one cycle, run to completion before the next trigger
//! is taken off the channel:
//!
//! ```text
//! Idle -> Collecting -> Rendering -> Validating -> Applying -> Idle
//!                                               \-> Rejected -> Idle
//! ```
//!
//! Each cycle is bounded by a deadline.  A cycle that overruns while
//! collecting, rendering or validating is abandoned and recorded as fatal.
//! Applying is never abandoned midway: the applier bounds the reload by the
//! same deadline and puts the previous files back on overrun.  Either way
//! the previously installed artifact stays in place.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};

use crate::apply::Applier;
use crate::audit::AuditSink;
use crate::metadata::MetadataExtractor;
use crate::render::{ConfigArtifact, Renderer};
use crate::routes::{self, CollisionPolicy, RouteTable, SkippedContainer};
use crate::runtime::ContainerRuntime;
use crate::types::{Outcome, ReconciliationResult, Trigger};
use crate::validate::Validator;

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Collecting,
    Rendering,
    Validating,
    Applying,
    Rejected,
}

/// How far a cycle got before anything touches the live files.
enum Step {
    Done(ReconciliationResult),
    Apply {
        artifact: ConfigArtifact,
        digest: String,
        routes: usize,
    },
}

pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    extractor: MetadataExtractor,
    policy: CollisionPolicy,
    renderer: Renderer,
    validator: Box<dyn Validator>,
    applier: Applier,
    audit: Arc<dyn AuditSink>,
    deadline: Duration,
    phase: Phase,
    cycles: u64,
}

impl Reconciler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        extractor: MetadataExtractor,
        validator: Box<dyn Validator>,
        applier: Applier,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            runtime,
            extractor,
            policy: CollisionPolicy::default(),
            renderer: Renderer::default(),
            validator,
            applier,
            audit,
            deadline: DEFAULT_DEADLINE,
            phase: Phase::Idle,
            cycles: 0,
        }
    }

    pub fn with_policy(mut self, policy: CollisionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_renderer(mut self, renderer: Renderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Reconcile once at startup, then once per trigger until the channel
    /// closes or shutdown is signalled.  Shutdown is only observed between
    /// cycles; an in-flight cycle finishes or hits its deadline first.
    pub async fn run(
        mut self,
        mut triggers: mpsc::Receiver<Trigger>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.reconcile(&Trigger::Startup).await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("Shutdown requested, reconcile loop stopping");
                    break;
                }
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => {
                        self.reconcile(&trigger).await;
                    }
                    None => {
                        info!("Trigger channel closed, reconcile loop stopping");
                        break;
                    }
                },
            }
        }
    }

    /// Run one full cycle and record it.
    pub async fn reconcile(&mut self, trigger: &Trigger) -> ReconciliationResult {
        self.cycles += 1;
        let cycle = self.cycles;
        info!("Cycle {} triggered by {}", cycle, trigger);

        let mut skipped = Vec::new();
        let deadline = Instant::now() + self.deadline;
        let prepared = timeout_at(deadline, self.prepare(&mut skipped)).await;
        let result = match prepared {
            Ok(Step::Done(result)) => result,
            Ok(Step::Apply {
                artifact,
                digest,
                routes,
            }) => self
                .install(&artifact, routes, deadline)
                .await
                .with_digest(digest)
                .with_routes(routes),
            Err(_) => ReconciliationResult::new(
                Outcome::Fatal,
                format!(
                    "cycle abandoned after {}s while {:?}",
                    self.deadline.as_secs_f64(),
                    self.phase
                ),
            ),
        };
        self.transition(Phase::Idle);

        for skip in &skipped {
            let entry =
                ReconciliationResult::skipped(skip.container.as_str(), skip.reason.as_str());
            self.record(cycle, trigger, &entry).await;
        }

        match result.outcome {
            Outcome::Applied => info!("Cycle {}: {}", cycle, result.diagnostic),
            Outcome::Rejected => warn!("Cycle {} rejected: {}", cycle, result.diagnostic),
            Outcome::SkippedContainer => warn!("Cycle {}: {}", cycle, result.diagnostic),
            Outcome::Fatal => error!("Cycle {} failed: {}", cycle, result.diagnostic),
        }
        self.record(cycle, trigger, &result).await;
        result
    }

    async fn record(&self, cycle: u64, trigger: &Trigger, result: &ReconciliationResult) {
        if let Err(e) = self.audit.record(cycle, trigger, result).await {
            error!("Unable to write audit entry for cycle {}: {}", cycle, e);
        }
    }

    fn transition(&mut self, next: Phase) {
        if self.phase != next {
            debug!("{:?} -> {:?}", self.phase, next);
            self.phase = next;
        }
    }

    /// Collect, build, render and validate.  Nothing here writes to the
    /// live files, so it may be dropped at the deadline.
    async fn prepare(&mut self, skipped: &mut Vec<SkippedContainer>) -> Step {
        self.transition(Phase::Collecting);
        let snapshot = match routes::collect(self.runtime.as_ref(), &self.extractor).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let diagnostic = format!("discovery failed: {}", e);
                return Step::Done(ReconciliationResult::new(Outcome::Fatal, diagnostic));
            }
        };
        skipped.extend(snapshot.skipped);

        let built = match RouteTable::build(snapshot.records, self.policy) {
            Ok(built) => built,
            Err(collision) => {
                self.transition(Phase::Rejected);
                let diagnostic = collision.to_string();
                return Step::Done(ReconciliationResult::new(Outcome::Rejected, diagnostic));
            }
        };
        let table = built.table;
        if table.is_empty() {
            info!("No eligible containers; rendering an empty route set");
        }
        let routed = table.names();
        for collision in built.warnings {
            for loser in collision.claimants.iter().filter(|c| !routed.contains(*c)) {
                skipped.push(SkippedContainer {
                    container: loser.clone(),
                    reason: format!("{}; superseded by a later container", collision),
                });
            }
        }

        self.transition(Phase::Rendering);
        let artifact = match self.renderer.render(&table) {
            Ok(artifact) => artifact,
            Err(e) => {
                error!("Renderer produced an inconsistent artifact: {}", e);
                let diagnostic = format!("render failed: {}", e);
                return Step::Done(
                    ReconciliationResult::new(Outcome::Fatal, diagnostic).with_routes(table.len()),
                );
            }
        };
        let digest = artifact.digest();

        self.transition(Phase::Validating);
        let verdict = match self.validator.validate(&artifact).await {
            Ok(verdict) => verdict,
            Err(e) => {
                let diagnostic = format!("validation failed to run: {}", e);
                return Step::Done(
                    ReconciliationResult::new(Outcome::Fatal, diagnostic)
                        .with_digest(digest)
                        .with_routes(table.len()),
                );
            }
        };
        if !verdict.passed {
            self.transition(Phase::Rejected);
            return Step::Done(
                ReconciliationResult::new(Outcome::Rejected, verdict.diagnostic)
                    .with_digest(digest)
                    .with_routes(table.len()),
            );
        }

        Step::Apply {
            artifact,
            digest,
            routes: table.len(),
        }
    }

    async fn install(
        &mut self,
        artifact: &ConfigArtifact,
        routes: usize,
        deadline: Instant,
    ) -> ReconciliationResult {
        self.transition(Phase::Applying);
        match self.applier.apply(artifact, deadline).await {
            Ok(()) => {
                ReconciliationResult::new(Outcome::Applied, format!("applied {} route(s)", routes))
            }
            Err(e) => ReconciliationResult::new(Outcome::Fatal, e.to_string()),
        }
    }
}
