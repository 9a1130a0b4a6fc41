//! Reconciliation Loop
//!
//! Each cycle compares declared and observed state and issues corrective
//! actions. Steps run in a fixed order; a failing step is recorded in the
//! [`CycleReport`] and never stops the steps after it.

mod deployment;
mod report;

pub use deployment::{DeploymentState, DeploymentStore};
pub use report::{CycleReport, ReconcileStep, StepOutcome, StepRecord};

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::bootstrap::{BootstrapCoordinator, BootstrapOutcome};
use crate::config::Config;
use crate::control_plane::{ControlPlane, LocalRuntime};
use crate::error::Result;
use crate::identity::NodeProbe;
use crate::periodic::run_periodic;
use crate::retry::RetryPolicy;
use crate::types::{MembershipState, ServiceObservation, ServiceSpec};

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// Managed services; empty means "every service the scheduler reports"
    pub services: Vec<ServiceSpec>,
    pub remediation: RetryPolicy,
    pub high_water_percent: f64,
    pub shed_service: Option<String>,
    pub shed_memory_limit: String,
    pub descriptor_version: String,
}

impl ReconcileSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            services: config.services.clone(),
            remediation: config.reconcile.remediation.to_policy(),
            high_water_percent: config.reconcile.high_water_percent,
            shed_service: config.reconcile.shed_service.clone(),
            shed_memory_limit: config.reconcile.shed_memory_limit.clone(),
            descriptor_version: config.descriptor_version(),
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    control_plane: Arc<dyn ControlPlane>,
    runtime: Arc<dyn LocalRuntime>,
    probe: NodeProbe,
    bootstrap: BootstrapCoordinator,
    deployments: DeploymentStore,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        runtime: Arc<dyn LocalRuntime>,
        probe: NodeProbe,
        bootstrap: BootstrapCoordinator,
        deployments: DeploymentStore,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            control_plane,
            runtime,
            probe,
            bootstrap,
            deployments,
            settings,
        }
    }

    /// Run cycles every `interval` until `stop` is set or a cycle hits a
    /// fatal local error, which is returned.
    pub async fn run_loop(
        &self,
        interval: Duration,
        budget: Duration,
        stop: watch::Receiver<bool>,
    ) -> Result<u64> {
        run_periodic("reconcile", interval, budget, stop, || async {
            match self.run_cycle().await.fatal {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
        .await
    }

    /// Run one full cycle. Never fails; outcomes are in the report and a
    /// fatal local error is kept in [`CycleReport::fatal`].
    #[instrument(skip(self), name = "reconcile")]
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::begin();

        let reachable = match self.ensure_control_plane().await {
            Ok(detail) => {
                report.record(ReconcileStep::ControlPlane, StepOutcome::Ok(detail));
                true
            }
            Err(e) => {
                error!("Control plane unreachable, skipping cluster steps: {}", e);
                report.note(&e);
                report.record(ReconcileStep::ControlPlane, StepOutcome::Failed(e.to_string()));
                false
            }
        };

        if reachable {
            let outcome = self.check_membership(&mut report).await;
            report.record(ReconcileStep::Membership, outcome);

            let outcome = self.converge_services(&mut report).await;
            report.record(ReconcileStep::Services, outcome);
        } else {
            let reason = "control plane unreachable".to_string();
            report.record(ReconcileStep::Membership, StepOutcome::Skipped(reason.clone()));
            report.record(ReconcileStep::Services, StepOutcome::Skipped(reason));
        }

        let outcome = self.relieve_pressure(&mut report, reachable).await;
        report.record(ReconcileStep::Resources, outcome);

        let outcome = self.housekeeping(&mut report).await;
        report.record(ReconcileStep::Housekeeping, outcome);

        report.finished_at = Some(Utc::now());
        if let Some(e) = &report.fatal {
            error!("Reconcile cycle hit a fatal local error: {}", e);
        }
        info!(
            "Reconcile cycle done: {} forced update(s), {} failed step(s)",
            report.forced_updates.len(),
            report.failed_steps()
        );
        report
    }

    /// Step 1: ping, restarting the local agent a bounded number of times.
    async fn ensure_control_plane(&self) -> Result<String> {
        let first = match self.control_plane.ping().await {
            Ok(()) => return Ok("reachable".to_string()),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => e,
        };
        warn!("Control plane ping failed: {}", first);

        let policy = &self.settings.remediation;
        let mut last = first;
        for attempt in 0..policy.max_attempts {
            info!("Restarting control-plane agent (attempt {}/{})", attempt + 1, policy.max_attempts);
            if let Err(e) = self.runtime.restart_agent().await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("Agent restart failed: {}", e);
                last = e;
                continue;
            }
            tokio::time::sleep(policy.backoff(attempt)).await;
            match self.control_plane.ping().await {
                Ok(()) => return Ok(format!("recovered after {} restart(s)", attempt + 1)),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    /// Step 2: re-bootstrap when membership was lost.
    async fn check_membership(&self, report: &mut CycleReport) -> StepOutcome {
        let membership = self.probe.current_membership().await;
        if membership.unknown {
            return StepOutcome::Skipped("membership unknown".to_string());
        }
        match membership.state {
            MembershipState::Manager | MembershipState::Worker => {
                StepOutcome::Ok(membership.state.to_string())
            }
            MembershipState::Joining => StepOutcome::Ok("join in progress".to_string()),
            MembershipState::NotJoined => {
                warn!("Membership lost, resetting and re-bootstrapping");
                if let Err(e) = self.bootstrap.store().reset() {
                    return StepOutcome::Failed(format!("reset membership: {}", e));
                }
                match self.bootstrap.run().await {
                    Ok(settled) => StepOutcome::Ok(match settled.outcome {
                        BootstrapOutcome::Joined { via, .. } => format!("rejoined via {}", via),
                        BootstrapOutcome::Founded { address } => format!("founded on {}", address),
                        BootstrapOutcome::AlreadyMember { state } => state.to_string(),
                    }),
                    Err(e) => {
                        report.note(&e);
                        StepOutcome::Failed(format!("bootstrap: {}", e))
                    }
                }
            }
        }
    }

    async fn managed_specs(&self) -> Result<Vec<ServiceSpec>> {
        if !self.settings.services.is_empty() {
            return Ok(self.settings.services.clone());
        }
        let mut specs = Vec::new();
        for name in self.control_plane.list_services().await? {
            match self.control_plane.inspect_service(&name).await {
                Ok(Some(desired)) => specs.push(ServiceSpec::new(name, desired)),
                Ok(None) => debug!("Service {} is global, not replica-managed", name),
                Err(e) => warn!("Cannot inspect service {}: {}", name, e),
            }
        }
        Ok(specs)
    }

    /// Step 3: one forced update per under-replicated service, plus a
    /// rollout when the descriptor version changed.
    async fn converge_services(&self, report: &mut CycleReport) -> StepOutcome {
        let specs = match self.managed_specs().await {
            Ok(specs) => specs,
            Err(e) => {
                report.note(&e);
                return StepOutcome::Failed(format!("list services: {}", e));
            }
        };

        let mut updated: HashSet<String> = HashSet::new();
        let mut failures = Vec::new();

        for spec in &specs {
            let observation = match self.control_plane.list_tasks(&spec.name).await {
                Ok(states) => ServiceObservation::from_tasks(&spec.name, states),
                Err(e) => {
                    report.note(&e);
                    failures.push(format!("{}: {}", spec.name, e));
                    continue;
                }
            };
            if !observation.is_under_replicated(spec.desired_replicas) {
                continue;
            }
            warn!(
                "Service {} under-replicated ({}/{}), forcing update",
                spec.name, observation.running_replicas, spec.desired_replicas
            );
            match self.control_plane.force_service_update(&spec.name).await {
                Ok(()) => {
                    updated.insert(spec.name.clone());
                    report.forced_updates.push(spec.name.clone());
                }
                Err(e) => {
                    report.note(&e);
                    failures.push(format!("{}: {}", spec.name, e));
                }
            }
        }

        if let Err(e) = self.roll_out(&specs, &mut updated, report, &mut failures).await {
            report.note(&e);
            failures.push(format!("deployment state: {}", e));
        }

        if failures.is_empty() {
            StepOutcome::Ok(format!(
                "{} service(s) checked, {} updated",
                specs.len(),
                report.forced_updates.len()
            ))
        } else {
            StepOutcome::Failed(failures.join("; "))
        }
    }

    async fn roll_out(
        &self,
        specs: &[ServiceSpec],
        updated: &mut HashSet<String>,
        report: &mut CycleReport,
        failures: &mut Vec<String>,
    ) -> Result<()> {
        let current = &self.settings.descriptor_version;
        let recorded = match self.deployments.load()? {
            Some(state) => state.last_applied_version,
            None => self.bootstrap.store().load()?.last_applied_version,
        };

        match recorded {
            None => {
                debug!("Recording baseline descriptor version {}", current);
                self.deployments.record(current)
            }
            Some(previous) if previous == *current => Ok(()),
            Some(previous) => {
                info!("Descriptor changed ({} -> {}), rolling out", previous, current);
                let before = failures.len();
                for spec in specs {
                    if updated.contains(&spec.name) {
                        continue;
                    }
                    match self.control_plane.force_service_update(&spec.name).await {
                        Ok(()) => {
                            updated.insert(spec.name.clone());
                            report.forced_updates.push(spec.name.clone());
                        }
                        Err(e) => {
                            report.note(&e);
                            failures.push(format!("{}: {}", spec.name, e));
                        }
                    }
                }
                // Retry the rollout next cycle unless every service took it
                if failures.len() == before {
                    self.deployments.record(current)?;
                }
                Ok(())
            }
        }
    }

    /// Step 4: cleanup above the high-water mark, shed load if that was
    /// not enough.
    async fn relieve_pressure(&self, report: &mut CycleReport, reachable: bool) -> StepOutcome {
        let threshold = self.settings.high_water_percent;
        let sample = self.probe.sample_resources().await;
        if !sample.under_pressure(threshold) {
            return StepOutcome::Ok("below high-water mark".to_string());
        }

        warn!(
            "Resource pressure (memory {:?}%, disk {:?}%), running cleanup",
            sample.memory_percent, sample.disk_percent
        );
        report.cleanup_ran = true;
        let cleanup = match self.runtime.run_cleanup().await {
            Ok(summary) => summary,
            Err(e) => {
                report.note(&e);
                return StepOutcome::Failed(format!("cleanup: {}", e));
            }
        };

        let resample = self.probe.sample_resources().await;
        if !resample.under_pressure(threshold) {
            return StepOutcome::Ok(format!(
                "cleanup relieved pressure ({} command(s), {} failed)",
                cleanup.commands_run, cleanup.commands_failed
            ));
        }

        let Some(service) = &self.settings.shed_service else {
            return StepOutcome::Ok("still over high-water mark, no service designated to shed".to_string());
        };
        if !reachable {
            return StepOutcome::Skipped("load shedding needs the control plane".to_string());
        }
        match self
            .control_plane
            .limit_service_memory(service, &self.settings.shed_memory_limit)
            .await
        {
            Ok(()) => {
                report.load_shed = true;
                warn!("Lowered memory ceiling of {} to {}", service, self.settings.shed_memory_limit);
                StepOutcome::Ok(format!("shed load from {}", service))
            }
            Err(e) => {
                report.note(&e);
                StepOutcome::Failed(format!("shed {}: {}", service, e))
            }
        }
    }

    /// Step 5: remove exited platform-managed containers.
    async fn housekeeping(&self, report: &mut CycleReport) -> StepOutcome {
        let exited = match self.runtime.list_exited_managed().await {
            Ok(ids) => ids,
            Err(e) => {
                report.note(&e);
                return StepOutcome::Failed(format!("list exited: {}", e));
            }
        };
        let mut failed = 0;
        for id in &exited {
            match self.runtime.remove_unit(id).await {
                Ok(()) => report.removed_units += 1,
                Err(e) => {
                    report.note(&e);
                    failed += 1;
                    warn!("Failed to remove {}: {}", id, e);
                }
            }
        }
        if failed == 0 {
            StepOutcome::Ok(format!("removed {} exited unit(s)", report.removed_units))
        } else {
            StepOutcome::Failed(format!("{} of {} removals failed", failed, exited.len()))
        }
    }
}
