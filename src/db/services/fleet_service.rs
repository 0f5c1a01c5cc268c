use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait, Iterable,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::controller::command::{validate_fleet_name, validate_identifier};
use crate::controller::ObservedInstance;
use crate::db::entities::{fleet, instance};
use crate::db::enums::{CloudProvider, FleetStatus, InstanceStatus};
use crate::error::{OrchestratorError, Result};

/// What a caller asks for when creating a fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSpec {
    pub name: String,
    pub provider: CloudProvider,
    pub instance_type: String,
    pub instance_count: i32,
    pub regions: Vec<String>,
    #[serde(default)]
    pub tunnel_node_id: Option<i32>,
    /// Controller modules installed on every instance after provisioning.
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub tags: Map<String, Value>,
}

impl FleetSpec {
    pub fn validate(&self) -> Result<()> {
        validate_fleet_name(&self.name)?;
        if self.instance_count <= 0 {
            return Err(OrchestratorError::Validation(format!(
                "instance_count must be positive, got {}",
                self.instance_count
            )));
        }
        if self.regions.is_empty() {
            return Err(OrchestratorError::Validation(
                "At least one region must be provided.".to_string(),
            ));
        }
        for region in &self.regions {
            validate_identifier("region", region, 32)?;
        }
        validate_identifier("instance_type", &self.instance_type, 64)?;
        for module in &self.modules {
            validate_identifier("module", module, 64)?;
        }
        Ok(())
    }
}

/// A fleet row with its instance counts joined in.
#[derive(Debug, Clone, Serialize)]
pub struct FleetSummary {
    #[serde(flatten)]
    pub fleet: fleet::Model,
    pub total_instances: usize,
    pub running_instances: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetDetails {
    #[serde(flatten)]
    pub fleet: fleet::Model,
    pub instances: Vec<instance::Model>,
}

/// Differences found between the store and the controller for one fleet.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub fleet_id: Uuid,
    pub fleet_status: Option<FleetStatus>,
    pub marked_unreachable: Vec<String>,
    pub discovered: Vec<String>,
    pub status_changed: Vec<String>,
    /// Instances still present remotely although their fleet is terminated.
    pub orphaned: Vec<String>,
    pub drift_detected: bool,
    /// An `error` fleet whose instances are running again was reactivated.
    pub recovered: bool,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.marked_unreachable.is_empty()
            && self.discovered.is_empty()
            && self.status_changed.is_empty()
            && self.orphaned.is_empty()
            && !self.drift_detected
            && !self.recovered
    }
}

/// Sole writer of fleet and instance rows.
#[derive(Clone, Debug)]
pub struct FleetStore {
    db: Arc<DatabaseConnection>,
}

impl FleetStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn create_fleet(&self, owner_id: i32, spec: FleetSpec) -> Result<fleet::Model> {
        spec.validate()?;

        let mut tags = spec.tags;
        if !spec.modules.is_empty() {
            tags.insert("modules".to_string(), serde_json::to_value(&spec.modules)?);
        }

        let now = Utc::now();
        let fleet = fleet::ActiveModel {
            id: Set(Uuid::new_v4()),
            owner_id: Set(owner_id),
            name: Set(spec.name),
            provider: Set(spec.provider),
            instance_type: Set(spec.instance_type),
            instance_count: Set(spec.instance_count),
            regions: Set(serde_json::to_value(&spec.regions)?),
            status: Set(FleetStatus::Pending),
            tunnel_node_id: Set(spec.tunnel_node_id),
            tags: Set(Value::Object(tags)),
            last_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await?;

        info!(fleet_id = %fleet.id, owner_id, name = %fleet.name, "Fleet created.");
        Ok(fleet)
    }

    /// Fails with `NotFound` both for unknown ids and fleets of other owners.
    pub async fn get_fleet(&self, fleet_id: Uuid, owner_id: i32) -> Result<fleet::Model> {
        fleet::Entity::find_by_id(fleet_id)
            .filter(fleet::Column::OwnerId.eq(owner_id))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| OrchestratorError::fleet_not_found(fleet_id))
    }

    pub async fn get_fleet_details(&self, fleet_id: Uuid, owner_id: i32) -> Result<FleetDetails> {
        let fleet = self.get_fleet(fleet_id, owner_id).await?;
        let instances = self.list_instances(fleet_id).await?;
        Ok(FleetDetails { fleet, instances })
    }

    /// Newest first.
    pub async fn list_fleets(&self, owner_id: i32) -> Result<Vec<FleetSummary>> {
        let fleets = fleet::Entity::find()
            .filter(fleet::Column::OwnerId.eq(owner_id))
            .order_by_desc(fleet::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;
        if fleets.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = fleets.iter().map(|f| f.id).collect();
        let instances = instance::Entity::find()
            .filter(instance::Column::FleetId.is_in(ids))
            .all(self.db.as_ref())
            .await?;

        let mut counts: HashMap<Uuid, (usize, usize)> = HashMap::new();
        for inst in &instances {
            let entry = counts.entry(inst.fleet_id).or_default();
            entry.0 += 1;
            if inst.status == InstanceStatus::Running {
                entry.1 += 1;
            }
        }

        Ok(fleets
            .into_iter()
            .map(|fleet| {
                let (total_instances, running_instances) =
                    counts.get(&fleet.id).copied().unwrap_or_default();
                FleetSummary {
                    fleet,
                    total_instances,
                    running_instances,
                }
            })
            .collect())
    }

    pub async fn list_instances(&self, fleet_id: Uuid) -> Result<Vec<instance::Model>> {
        Ok(instance::Entity::find()
            .filter(instance::Column::FleetId.eq(fleet_id))
            .order_by_asc(instance::Column::Region)
            .order_by_asc(instance::Column::CreatedAt)
            .order_by_asc(instance::Column::Name)
            .all(self.db.as_ref())
            .await?)
    }

    /// Running instances ordered by name, the order work is distributed in.
    pub async fn running_instances(&self, fleet_id: Uuid) -> Result<Vec<instance::Model>> {
        Ok(instance::Entity::find()
            .filter(instance::Column::FleetId.eq(fleet_id))
            .filter(instance::Column::Status.eq(InstanceStatus::Running))
            .order_by_asc(instance::Column::Name)
            .all(self.db.as_ref())
            .await?)
    }

    /// Fleets the background reconciler looks at. In-flight states are
    /// skipped; their operation rewrites the instance set anyway.
    pub async fn list_reconcilable_fleets(&self) -> Result<Vec<fleet::Model>> {
        Ok(fleet::Entity::find()
            .filter(fleet::Column::Status.is_in([
                FleetStatus::Active,
                FleetStatus::Error,
                FleetStatus::Terminated,
            ]))
            .order_by_asc(fleet::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?)
    }

    /// Moves a fleet along one edge of its state machine.
    ///
    /// The status check and the write are one conditional statement, so a
    /// concurrent writer can never slip in between. `last_error` replaces
    /// the stored error text.
    pub async fn update_fleet_status(
        &self,
        fleet_id: Uuid,
        next: FleetStatus,
        last_error: Option<String>,
    ) -> Result<fleet::Model> {
        let predecessors: Vec<FleetStatus> = FleetStatus::iter()
            .filter(|s| s.can_transition_to(next))
            .collect();

        let result = fleet::Entity::update_many()
            .set(fleet::ActiveModel {
                status: Set(next),
                last_error: Set(last_error),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(fleet::Column::Id.eq(fleet_id))
            .filter(fleet::Column::Status.is_in(predecessors))
            .exec(self.db.as_ref())
            .await?;

        let current = fleet::Entity::find_by_id(fleet_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| OrchestratorError::fleet_not_found(fleet_id))?;

        if result.rows_affected == 0 {
            return Err(OrchestratorError::InvalidState(format!(
                "fleet {fleet_id} cannot move from {} to {next}",
                current.status
            )));
        }
        debug!(fleet_id = %fleet_id, status = %next, "Fleet status updated.");
        Ok(current)
    }

    /// Puts a fleet back into the status it had before an operation timed
    /// out. Terminated fleets are left alone.
    pub async fn restore_status(&self, fleet_id: Uuid, status: FleetStatus) -> Result<()> {
        let result = fleet::Entity::update_many()
            .set(fleet::ActiveModel {
                status: Set(status),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(fleet::Column::Id.eq(fleet_id))
            .filter(fleet::Column::Status.ne(FleetStatus::Terminated))
            .exec(self.db.as_ref())
            .await?;
        if result.rows_affected == 0 {
            warn!(fleet_id = %fleet_id, "Fleet status not restored; fleet missing or terminated.");
        }
        Ok(())
    }

    pub async fn update_instance_status(
        &self,
        instance_id: Uuid,
        status: InstanceStatus,
    ) -> Result<instance::Model> {
        let result = instance::Entity::update_many()
            .set(instance::ActiveModel {
                status: Set(status),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(instance::Column::Id.eq(instance_id))
            .filter(instance::Column::Status.ne(InstanceStatus::Terminated))
            .exec(self.db.as_ref())
            .await?;

        let current = instance::Entity::find_by_id(instance_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "Instance",
                id: instance_id.to_string(),
            })?;
        if result.rows_affected == 0 {
            return Err(OrchestratorError::InvalidState(format!(
                "instance {instance_id} is terminated"
            )));
        }
        Ok(current)
    }

    /// Records the outcome of a successful provisioning or scaling step:
    /// the observed instance set, the new desired count and `active`, all
    /// in one transaction.
    pub async fn activate_with_instances(
        &self,
        fleet_id: Uuid,
        observed: &[ObservedInstance],
        desired_count: i32,
    ) -> Result<fleet::Model> {
        if !observed.iter().any(|o| o.status == InstanceStatus::Running) {
            return Err(OrchestratorError::InvalidState(format!(
                "fleet {fleet_id} cannot become active without a running instance"
            )));
        }

        let txn = self.db.begin().await?;
        let now = Utc::now();

        let result = fleet::Entity::update_many()
            .set(fleet::ActiveModel {
                status: Set(FleetStatus::Active),
                instance_count: Set(desired_count),
                last_error: Set(None),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(fleet::Column::Id.eq(fleet_id))
            .filter(fleet::Column::Status.is_in([FleetStatus::Deploying, FleetStatus::Scaling]))
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            txn.rollback().await?;
            return Err(OrchestratorError::InvalidState(format!(
                "fleet {fleet_id} is not deploying or scaling"
            )));
        }

        let existing = instance::Entity::find()
            .filter(instance::Column::FleetId.eq(fleet_id))
            .filter(instance::Column::Status.ne(InstanceStatus::Terminated))
            .all(&txn)
            .await?;
        let mut by_name: HashMap<&str, &instance::Model> =
            existing.iter().map(|i| (i.name.as_str(), i)).collect();

        for obs in observed {
            match by_name.remove(obs.name.as_str()) {
                Some(known) => refresh_instance(&txn, known, obs).await?,
                None => insert_instance(&txn, fleet_id, obs).await?,
            }
        }
        // Whatever the controller no longer lists was removed by the step.
        for gone in by_name.into_values() {
            set_instance_status(&txn, gone.id, InstanceStatus::Terminated).await?;
        }

        let fleet = fleet::Entity::find_by_id(fleet_id)
            .one(&txn)
            .await?
            .ok_or_else(|| OrchestratorError::fleet_not_found(fleet_id))?;
        txn.commit().await?;

        info!(fleet_id = %fleet_id, instances = observed.len(), desired_count, "Fleet is active.");
        Ok(fleet)
    }

    /// Marks the fleet and every one of its instances `terminated`.
    pub async fn terminate_cascade(&self, fleet_id: Uuid) -> Result<fleet::Model> {
        let txn = self.db.begin().await?;
        let now = Utc::now();

        let result = fleet::Entity::update_many()
            .set(fleet::ActiveModel {
                status: Set(FleetStatus::Terminated),
                last_error: Set(None),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(fleet::Column::Id.eq(fleet_id))
            .filter(fleet::Column::Status.eq(FleetStatus::Terminating))
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            txn.rollback().await?;
            return Err(OrchestratorError::InvalidState(format!(
                "fleet {fleet_id} is not terminating"
            )));
        }

        let instances = instance::Entity::update_many()
            .set(instance::ActiveModel {
                status: Set(InstanceStatus::Terminated),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(instance::Column::FleetId.eq(fleet_id))
            .exec(&txn)
            .await?;

        let fleet = fleet::Entity::find_by_id(fleet_id)
            .one(&txn)
            .await?
            .ok_or_else(|| OrchestratorError::fleet_not_found(fleet_id))?;
        txn.commit().await?;

        info!(fleet_id = %fleet_id, instances = instances.rows_affected, "Fleet terminated.");
        Ok(fleet)
    }

    /// Brings the instance rows of a live fleet in line with what the
    /// controller reports.
    ///
    /// Known instances missing remotely become `unreachable`; unknown ones
    /// matching the fleet prefix are recorded. An `active` fleet left with no
    /// running instance moves to `error`.
    pub async fn apply_reconciliation(
        &self,
        fleet_id: Uuid,
        observed: &[ObservedInstance],
    ) -> Result<ReconcileReport> {
        let txn = self.db.begin().await?;
        let fleet = fleet::Entity::find_by_id(fleet_id)
            .one(&txn)
            .await?
            .ok_or_else(|| OrchestratorError::fleet_not_found(fleet_id))?;
        if fleet.status.is_terminal() {
            txn.rollback().await?;
            return Err(OrchestratorError::InvalidState(format!(
                "fleet {fleet_id} is terminated"
            )));
        }

        let mut report = ReconcileReport {
            fleet_id,
            ..Default::default()
        };

        let known = instance::Entity::find()
            .filter(instance::Column::FleetId.eq(fleet_id))
            .filter(instance::Column::Status.ne(InstanceStatus::Terminated))
            .all(&txn)
            .await?;
        let mut by_name: HashMap<&str, &instance::Model> =
            known.iter().map(|i| (i.name.as_str(), i)).collect();

        let mut running = 0usize;
        for obs in observed {
            if obs.status == InstanceStatus::Running {
                running += 1;
            }
            match by_name.remove(obs.name.as_str()) {
                Some(existing) => {
                    if existing.status != obs.status
                        || existing.ip_address.as_deref() != Some(obs.primary_ip.as_str())
                    {
                        refresh_instance(&txn, existing, obs).await?;
                        if existing.status != obs.status {
                            report.status_changed.push(obs.name.clone());
                        }
                    }
                }
                None => {
                    insert_instance(&txn, fleet_id, obs).await?;
                    report.discovered.push(obs.name.clone());
                }
            }
        }
        for missing in by_name.into_values() {
            if missing.status != InstanceStatus::Unreachable {
                set_instance_status(&txn, missing.id, InstanceStatus::Unreachable).await?;
                report.marked_unreachable.push(missing.name.clone());
            }
        }

        let mut status = fleet.status;
        if fleet.status == FleetStatus::Active && running == 0 {
            let message = "drift detected: controller reports no running instances".to_string();
            fleet::Entity::update_many()
                .set(fleet::ActiveModel {
                    status: Set(FleetStatus::Error),
                    last_error: Set(Some(message)),
                    updated_at: Set(Utc::now()),
                    ..Default::default()
                })
                .filter(fleet::Column::Id.eq(fleet_id))
                .filter(fleet::Column::Status.eq(FleetStatus::Active))
                .exec(&txn)
                .await?;
            status = FleetStatus::Error;
            report.drift_detected = true;
        } else if fleet.status == FleetStatus::Error && running > 0 {
            fleet::Entity::update_many()
                .set(fleet::ActiveModel {
                    status: Set(FleetStatus::Active),
                    last_error: Set(None),
                    updated_at: Set(Utc::now()),
                    ..Default::default()
                })
                .filter(fleet::Column::Id.eq(fleet_id))
                .filter(fleet::Column::Status.eq(FleetStatus::Error))
                .exec(&txn)
                .await?;
            status = FleetStatus::Active;
            report.recovered = true;
        }
        txn.commit().await?;

        report.marked_unreachable.sort();
        report.discovered.sort();
        report.status_changed.sort();
        report.fleet_status = Some(status);
        if !report.is_clean() {
            warn!(
                fleet_id = %fleet_id,
                unreachable = report.marked_unreachable.len(),
                discovered = report.discovered.len(),
                changed = report.status_changed.len(),
                drift = report.drift_detected,
                recovered = report.recovered,
                "Reconciliation corrected fleet state."
            );
        }
        Ok(report)
    }
}

async fn insert_instance(
    txn: &DatabaseTransaction,
    fleet_id: Uuid,
    obs: &ObservedInstance,
) -> Result<()> {
    let now = Utc::now();
    instance::ActiveModel {
        id: Set(Uuid::new_v4()),
        fleet_id: Set(fleet_id),
        name: Set(obs.name.clone()),
        region: Set(obs.region.clone()),
        ip_address: Set(Some(obs.primary_ip.clone())),
        status: Set(obs.status),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(txn)
    .await?;
    Ok(())
}

async fn refresh_instance(
    txn: &DatabaseTransaction,
    known: &instance::Model,
    obs: &ObservedInstance,
) -> Result<()> {
    let mut active: instance::ActiveModel = known.clone().into();
    active.status = Set(obs.status);
    active.ip_address = Set(Some(obs.primary_ip.clone()));
    active.region = Set(obs.region.clone());
    active.updated_at = Set(Utc::now());
    active.update(txn).await?;
    Ok(())
}

async fn set_instance_status(
    txn: &DatabaseTransaction,
    instance_id: Uuid,
    status: InstanceStatus,
) -> Result<()> {
    instance::Entity::update_many()
        .set(instance::ActiveModel {
            status: Set(status),
            updated_at: Set(Utc::now()),
            ..Default::default()
        })
        .filter(instance::Column::Id.eq(instance_id))
        .exec(txn)
        .await?;
    Ok(())
}
