use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::controller::inventory::{instances_of_fleet, parse_instance_list};
use crate::controller::{ControllerCommand, ObservedInstance, RemoteCommand, SessionGuard, SessionPool};
use crate::db::entities::fleet;
use crate::db::enums::{FleetStatus, InstanceStatus};
use crate::db::services::{FleetSpec, FleetStore, JobTracker, ReconcileReport};
use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::server::config::{FleetPolicy, TerminatePolicy};
use crate::server::fleet_locks::FleetLocks;
use crate::server::workload_dispatcher::ActiveJobs;

const MAX_EXEC_COMMAND_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceOutput {
    pub instance: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-instance outcome of a broadcast command.
#[derive(Debug, Clone, Serialize)]
pub struct FleetExecutionReport {
    pub fleet_id: Uuid,
    pub command: String,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<InstanceOutput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerHealth {
    pub healthy: bool,
    pub endpoint: String,
    pub instances: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Owns the fleet state machine. Every public operation holds the fleet's
/// lock for its whole duration and re-reads the fleet after taking it.
pub struct FleetManager {
    store: FleetStore,
    jobs: JobTracker,
    pool: SessionPool,
    locks: Arc<FleetLocks>,
    active_jobs: Arc<ActiveJobs>,
    policy: FleetPolicy,
    command_timeout: Duration,
    provision_timeout: Duration,
}

impl FleetManager {
    pub fn new(
        store: FleetStore,
        jobs: JobTracker,
        pool: SessionPool,
        active_jobs: Arc<ActiveJobs>,
        policy: FleetPolicy,
        command_timeout: Duration,
        provision_timeout: Duration,
    ) -> Self {
        Self {
            store,
            jobs,
            pool,
            locks: Arc::new(FleetLocks::new()),
            active_jobs,
            policy,
            command_timeout,
            provision_timeout,
        }
    }

    /// The lock registry, shared with the dispatcher so job creation and
    /// fleet termination exclude each other.
    pub fn locks(&self) -> Arc<FleetLocks> {
        self.locks.clone()
    }

    fn check_count(&self, count: i64) -> Result<()> {
        if count < 1 || count > i64::from(self.policy.max_instances) {
            return Err(OrchestratorError::Validation(format!(
                "instance count must be between 1 and {}, got {count}",
                self.policy.max_instances
            )));
        }
        Ok(())
    }

    /// Creates the fleet record and provisions it.
    pub async fn deploy_fleet(&self, owner_id: i32, spec: FleetSpec) -> Result<fleet::Model> {
        spec.validate()?;
        self.check_count(i64::from(spec.instance_count))?;
        let fleet = self.store.create_fleet(owner_id, spec).await?;
        self.provision_fleet(fleet.id, owner_id).await
    }

    /// Provisions a `pending` fleet. Also the retry path after a timed out
    /// deployment, which leaves the fleet `pending`.
    pub async fn provision_fleet(&self, fleet_id: Uuid, owner_id: i32) -> Result<fleet::Model> {
        let _guard = self.locks.lock(fleet_id).await;
        let fleet = self.store.get_fleet(fleet_id, owner_id).await?;
        if fleet.status != FleetStatus::Pending {
            return Err(OrchestratorError::InvalidState(format!(
                "fleet {fleet_id} is {}; only pending fleets can be provisioned",
                fleet.status
            )));
        }

        self.store
            .update_fleet_status(fleet_id, FleetStatus::Deploying, None)
            .await?;
        info!(fleet_id = %fleet_id, prefix = %fleet.remote_name(), count = fleet.instance_count, "Deploying fleet.");

        let prefix = fleet.remote_name();
        let deploy = ControllerCommand::deploy_fleet(
            &prefix,
            fleet.instance_count as u32,
            &fleet.region_list(),
            fleet.provider,
            &fleet.instance_type,
        );
        let modules = fleet.modules();

        let outcome = match self.pool.acquire().await {
            Ok(mut session) => {
                let result = async {
                    session
                        .run(&deploy, self.provision_timeout, "provisioning fleet instances")
                        .await?;
                    for module in &modules {
                        session
                            .run(
                                &ControllerCommand::install_module(&prefix, module),
                                self.provision_timeout,
                                "installing fleet module",
                            )
                            .await?;
                    }
                    self.observe(&mut session, &prefix).await
                }
                .await;
                session.release().await;
                result
            }
            Err(e) => Err(e),
        };

        let outcome = match outcome {
            Ok(observed) => {
                self.store
                    .activate_with_instances(fleet_id, &observed, fleet.instance_count)
                    .await
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(fleet) => Ok(fleet),
            Err(e) => Err(self.record_failure(fleet_id, FleetStatus::Pending, e).await),
        }
    }

    pub async fn scale_fleet(
        &self,
        fleet_id: Uuid,
        owner_id: i32,
        direction: ScaleDirection,
        count: i32,
    ) -> Result<fleet::Model> {
        if count <= 0 {
            return Err(OrchestratorError::Validation(format!(
                "scale count must be a positive integer, got {count}"
            )));
        }

        let _guard = self.locks.lock(fleet_id).await;
        let fleet = self.store.get_fleet(fleet_id, owner_id).await?;
        if fleet.status != FleetStatus::Active {
            return Err(OrchestratorError::InvalidState(format!(
                "fleet {fleet_id} is {}; only active fleets can be scaled",
                fleet.status
            )));
        }

        let current = i64::from(fleet.instance_count);
        let target = match direction {
            ScaleDirection::Up => current + i64::from(count),
            ScaleDirection::Down => current - i64::from(count),
        };
        if direction == ScaleDirection::Down && target < 1 {
            return Err(OrchestratorError::Validation(format!(
                "removing {count} of {current} instances would empty the fleet; terminate it instead"
            )));
        }
        self.check_count(target)?;

        self.store
            .update_fleet_status(fleet_id, FleetStatus::Scaling, None)
            .await?;
        info!(fleet_id = %fleet_id, ?direction, count, target, "Scaling fleet.");

        let prefix = fleet.remote_name();
        let command = match direction {
            ScaleDirection::Up => ControllerCommand::add_instances(&prefix, count as u32),
            ScaleDirection::Down => ControllerCommand::remove_instances(&prefix, count as u32),
        };

        let outcome = match self.pool.acquire().await {
            Ok(mut session) => {
                let result = async {
                    session
                        .run(&command, self.provision_timeout, "scaling fleet")
                        .await?;
                    self.observe(&mut session, &prefix).await
                }
                .await;
                session.release().await;
                result
            }
            Err(e) => Err(e),
        };

        let outcome = match outcome {
            Ok(observed) => {
                self.store
                    .activate_with_instances(fleet_id, &observed, target as i32)
                    .await
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(fleet) => Ok(fleet),
            Err(e) => Err(self.record_failure(fleet_id, FleetStatus::Active, e).await),
        }
    }

    /// Deletes every instance of the fleet and marks fleet and instances
    /// `terminated`. Terminating a terminated fleet returns it unchanged.
    pub async fn terminate_fleet(&self, fleet_id: Uuid, owner_id: i32) -> Result<fleet::Model> {
        let guard = self.locks.lock(fleet_id).await;
        let fleet = self.store.get_fleet(fleet_id, owner_id).await?;
        if fleet.status == FleetStatus::Terminated {
            debug!(fleet_id = %fleet_id, "Fleet already terminated.");
            return Ok(fleet);
        }

        self.settle_jobs(&fleet).await?;

        let prior = fleet.status;
        self.store
            .update_fleet_status(fleet_id, FleetStatus::Terminating, None)
            .await?;
        info!(fleet_id = %fleet_id, from = %prior, "Terminating fleet.");

        let prefix = fleet.remote_name();
        let outcome = match self.pool.acquire().await {
            Ok(mut session) => {
                let result = self.delete_members(&mut session, &prefix).await;
                session.release().await;
                result
            }
            Err(e) => Err(e),
        };
        let outcome = match outcome {
            Ok(deleted) => {
                info!(fleet_id = %fleet_id, deleted, "Fleet instances deleted.");
                self.store.terminate_cascade(fleet_id).await
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(fleet) => {
                drop(guard);
                self.locks.forget(fleet_id);
                Ok(fleet)
            }
            Err(e) => Err(self.record_failure(fleet_id, prior, e).await),
        }
    }

    /// Deletes the instances the controller lists for `prefix`, one by name.
    async fn delete_members(&self, session: &mut SessionGuard, prefix: &str) -> Result<usize> {
        let listing = session
            .run(
                &ControllerCommand::list_instances(),
                self.command_timeout,
                "listing fleet instances",
            )
            .await?;
        let members: Vec<String> = instances_of_fleet(&parse_instance_list(&listing), prefix)
            .map(|i| i.name.clone())
            .collect();
        for name in &members {
            session
                .run(
                    &ControllerCommand::delete_instance(name),
                    self.provision_timeout,
                    "deleting fleet instance",
                )
                .await?;
        }
        Ok(members.len())
    }

    /// Applies the configured policy to jobs still bound to a fleet that is
    /// about to be terminated.
    async fn settle_jobs(&self, fleet: &fleet::Model) -> Result<()> {
        let active = self.jobs.list_active_jobs_for_fleet(fleet.id).await?;
        if active.is_empty() {
            return Ok(());
        }
        match self.policy.terminate_with_running_jobs {
            TerminatePolicy::Reject => Err(OrchestratorError::InvalidState(format!(
                "fleet {} still has {} queued or running jobs; stop them first",
                fleet.id,
                active.len()
            ))),
            TerminatePolicy::Stop => {
                for job in active {
                    self.active_jobs.cancel(job.id);
                    match self.jobs.mark_stopped(job.id).await {
                        Ok(_) => info!(job_id = %job.id, fleet_id = %fleet.id, "Job stopped ahead of fleet termination."),
                        // Finished on its own in the meantime.
                        Err(OrchestratorError::InvalidState(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
        }
    }

    /// Runs `command` on every running instance of the fleet. Instances fail
    /// individually; the call only fails when nothing could be attempted.
    pub async fn execute_on_fleet(
        &self,
        fleet_id: Uuid,
        owner_id: i32,
        command: &str,
    ) -> Result<FleetExecutionReport> {
        let command = command.trim();
        if command.is_empty() || command.len() > MAX_EXEC_COMMAND_LEN || command.contains('\0') {
            return Err(OrchestratorError::Validation(format!(
                "command must be 1-{MAX_EXEC_COMMAND_LEN} characters without NUL bytes"
            )));
        }

        let _guard = self.locks.lock(fleet_id).await;
        let fleet = self.store.get_fleet(fleet_id, owner_id).await?;
        if !matches!(fleet.status, FleetStatus::Active | FleetStatus::Error) {
            return Err(OrchestratorError::InvalidState(format!(
                "fleet {fleet_id} is {}; commands need an active fleet",
                fleet.status
            )));
        }
        let instances = self.store.running_instances(fleet_id).await?;
        if instances.is_empty() {
            return Err(OrchestratorError::InvalidState(format!(
                "fleet {fleet_id} has no running instances"
            )));
        }

        let results = join_all(instances.iter().map(|inst| async move {
            let cmd = ControllerCommand::exec_on_instance(&inst.name, command);
            match self
                .run_single(&cmd, self.command_timeout, "executing command on instance")
                .await
            {
                Ok(output) => InstanceOutput {
                    instance: inst.name.clone(),
                    success: true,
                    output: Some(output),
                    error_kind: None,
                    error: None,
                },
                Err(e) => {
                    warn!(fleet_id = %fleet_id, instance = %inst.name, error = %e, "Instance command failed.");
                    InstanceOutput {
                        instance: inst.name.clone(),
                        success: false,
                        output: None,
                        error_kind: Some(e.kind()),
                        error: Some(e.to_string()),
                    }
                }
            }
        }))
        .await;

        let succeeded = results.iter().filter(|r| r.success).count();
        info!(fleet_id = %fleet_id, succeeded, failed = results.len() - succeeded, "Fleet command finished.");
        Ok(FleetExecutionReport {
            fleet_id,
            command: command.to_string(),
            succeeded,
            failed: results.len() - succeeded,
            results,
        })
    }

    /// Compares one fleet with the controller's inventory and corrects the
    /// store.
    pub async fn reconcile_fleet(&self, fleet_id: Uuid, owner_id: i32) -> Result<ReconcileReport> {
        let _guard = self.locks.lock(fleet_id).await;
        let fleet = self.store.get_fleet(fleet_id, owner_id).await?;
        let observed = self.list_remote().await?;
        self.reconcile_with(&fleet, &observed).await
    }

    /// Reconciles every idle fleet against one inventory snapshot. Fleets
    /// busy with another operation are skipped until the next round.
    pub async fn reconcile_all(&self) -> Result<Vec<ReconcileReport>> {
        let fleets = self.store.list_reconcilable_fleets().await?;
        if fleets.is_empty() {
            return Ok(Vec::new());
        }
        let observed = self.list_remote().await?;

        let mut reports = Vec::new();
        for listed in fleets {
            let Some(_guard) = self.locks.try_lock(listed.id) else {
                debug!(fleet_id = %listed.id, "Fleet busy; skipping reconciliation.");
                continue;
            };
            let fleet = match self.store.get_fleet(listed.id, listed.owner_id).await {
                Ok(fleet) => fleet,
                Err(e) => {
                    warn!(fleet_id = %listed.id, error = %e, "Could not re-read fleet.");
                    continue;
                }
            };
            // Changed after the snapshot was taken; the snapshot may be stale.
            if fleet.updated_at != listed.updated_at {
                continue;
            }
            match self.reconcile_with(&fleet, &observed).await {
                Ok(report) => reports.push(report),
                Err(e) => error!(fleet_id = %fleet.id, error = %e, "Reconciliation failed."),
            }
        }
        Ok(reports)
    }

    async fn reconcile_with(
        &self,
        fleet: &fleet::Model,
        observed: &[ObservedInstance],
    ) -> Result<ReconcileReport> {
        let prefix = fleet.remote_name();
        let mine: Vec<ObservedInstance> = instances_of_fleet(observed, &prefix).cloned().collect();

        if fleet.status == FleetStatus::Terminated {
            let orphaned: Vec<String> = mine.into_iter().map(|o| o.name).collect();
            if !orphaned.is_empty() {
                warn!(fleet_id = %fleet.id, orphaned = ?orphaned, "Terminated fleet still has remote instances.");
            }
            return Ok(ReconcileReport {
                fleet_id: fleet.id,
                fleet_status: Some(FleetStatus::Terminated),
                orphaned,
                ..Default::default()
            });
        }
        self.store.apply_reconciliation(fleet.id, &mine).await
    }

    pub async fn controller_health(&self) -> ControllerHealth {
        let endpoint = self.pool.endpoint().to_string();
        match self.list_remote().await {
            Ok(observed) => ControllerHealth {
                healthy: true,
                endpoint,
                instances: observed.len(),
                error: None,
                checked_at: Utc::now(),
            },
            Err(e) => {
                warn!(error = %e, "Controller health check failed.");
                ControllerHealth {
                    healthy: false,
                    endpoint,
                    instances: 0,
                    error: Some(e.to_string()),
                    checked_at: Utc::now(),
                }
            }
        }
    }

    async fn list_remote(&self) -> Result<Vec<ObservedInstance>> {
        let output = self
            .run_single(
                &ControllerCommand::list_instances(),
                self.command_timeout,
                "listing controller instances",
            )
            .await?;
        Ok(parse_instance_list(&output))
    }

    /// Lists the fleet's instances; fails unless at least one is running.
    async fn observe(&self, session: &mut SessionGuard, prefix: &str) -> Result<Vec<ObservedInstance>> {
        let command = ControllerCommand::list_instances();
        let output = session
            .run(&command, self.command_timeout, "listing fleet instances")
            .await?;
        let observed: Vec<ObservedInstance> = instances_of_fleet(&parse_instance_list(&output), prefix)
            .cloned()
            .collect();
        if !observed.iter().any(|o| o.status == InstanceStatus::Running) {
            return Err(OrchestratorError::Execution {
                command: command.to_string(),
                exit_status: 0,
                stderr: format!("controller lists no running instance for {prefix}"),
            });
        }
        Ok(observed)
    }

    async fn run_single(&self, command: &RemoteCommand, timeout: Duration, operation: &str) -> Result<String> {
        let mut session = self.pool.acquire().await?;
        let result = session.run(command, timeout, operation).await;
        session.release().await;
        result
    }

    /// Applies the remote failure policy and hands the error back.
    ///
    /// A timeout puts the fleet back where it was before the operation; any
    /// other remote or store failure parks it in `error` with the failure
    /// text, so it never stays in a transient state.
    async fn record_failure(
        &self,
        fleet_id: Uuid,
        prior: FleetStatus,
        err: OrchestratorError,
    ) -> OrchestratorError {
        match &err {
            OrchestratorError::Timeout { .. } => {
                warn!(fleet_id = %fleet_id, restored = %prior, error = %err, "Fleet operation timed out.");
                if let Err(e) = self.store.restore_status(fleet_id, prior).await {
                    error!(fleet_id = %fleet_id, error = %e, "Failed to restore fleet status.");
                }
            }
            e if e.is_remote() || matches!(e, OrchestratorError::Database(_)) => {
                error!(fleet_id = %fleet_id, error = %err, "Fleet operation failed.");
                if let Err(e) = self
                    .store
                    .update_fleet_status(fleet_id, FleetStatus::Error, Some(err.to_string()))
                    .await
                {
                    error!(fleet_id = %fleet_id, error = %e, "Failed to record fleet error.");
                }
            }
            _ => {
                error!(fleet_id = %fleet_id, error = %err, "Fleet operation aborted.");
            }
        }
        err
    }
}
