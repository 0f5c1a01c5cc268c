use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::entities::{finding, job};
use crate::db::enums::{DistributionStrategy, JobKind, JobStatus};
use crate::error::{OrchestratorError, Result};

/// Descriptor a job is created from.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub name: String,
    pub fleet_id: Option<Uuid>,
    pub targets: Vec<String>,
    pub tool: String,
    pub strategy: DistributionStrategy,
    pub rate_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFailure {
    /// Instance name, or `controller` for jobs without a fleet.
    pub instance: String,
    pub kind: String,
    pub message: String,
}

/// Progress document stored on every job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub failed_chunks: u32,
    pub findings: u64,
    #[serde(default)]
    pub failures: Vec<ChunkFailure>,
}

impl JobProgress {
    pub fn new(total_chunks: u32) -> Self {
        Self {
            total_chunks,
            ..Default::default()
        }
    }

    pub fn from_json(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// Whole percent of chunks that have finished, successfully or not.
    pub fn percent(&self) -> u8 {
        if self.total_chunks == 0 {
            return 0;
        }
        let done = (self.completed_chunks + self.failed_chunks).min(self.total_chunks);
        (u64::from(done) * 100 / u64::from(self.total_chunks)) as u8
    }

    pub fn is_finished(&self) -> bool {
        self.completed_chunks + self.failed_chunks >= self.total_chunks
    }

    pub fn all_failed(&self) -> bool {
        self.total_chunks > 0 && self.failed_chunks >= self.total_chunks
    }
}

/// Owns job rows and their findings.
#[derive(Clone, Debug)]
pub struct JobTracker {
    db: Arc<DatabaseConnection>,
    late_finding_grace: ChronoDuration,
}

impl JobTracker {
    pub fn new(db: Arc<DatabaseConnection>, late_finding_grace_secs: u64) -> Self {
        Self {
            db,
            late_finding_grace: ChronoDuration::seconds(late_finding_grace_secs as i64),
        }
    }

    pub async fn create_job(&self, owner_id: i32, new_job: NewJob) -> Result<job::Model> {
        if new_job.name.trim().is_empty() || new_job.name.len() > 128 {
            return Err(OrchestratorError::Validation(
                "Job name must be 1-128 characters.".to_string(),
            ));
        }
        if new_job.targets.is_empty() {
            return Err(OrchestratorError::Validation(
                "At least one target must be provided.".to_string(),
            ));
        }

        let now = Utc::now();
        let job = job::ActiveModel {
            id: Set(Uuid::new_v4()),
            owner_id: Set(owner_id),
            kind: Set(new_job.kind),
            name: Set(new_job.name),
            fleet_id: Set(new_job.fleet_id),
            targets: Set(serde_json::to_value(&new_job.targets)?),
            tool: Set(new_job.tool),
            strategy: Set(new_job.strategy),
            rate_limit: Set(new_job.rate_limit as i32),
            status: Set(JobStatus::Queued),
            progress: Set(serde_json::to_value(JobProgress::default())?),
            result_location: Set(None),
            error_message: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            completed_at: Set(None),
        }
        .insert(self.db.as_ref())
        .await?;

        info!(job_id = %job.id, owner_id, kind = %job.kind, "Job queued.");
        Ok(job)
    }

    pub async fn mark_running(&self, job_id: Uuid, total_chunks: u32) -> Result<job::Model> {
        self.transition(
            job_id,
            JobStatus::Running,
            job::ActiveModel {
                progress: Set(serde_json::to_value(JobProgress::new(total_chunks))?),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn mark_completed(&self, job_id: Uuid, result_location: String) -> Result<job::Model> {
        self.transition(
            job_id,
            JobStatus::Completed,
            job::ActiveModel {
                result_location: Set(Some(result_location)),
                completed_at: Set(Some(Utc::now())),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn mark_failed(&self, job_id: Uuid, error: String) -> Result<job::Model> {
        self.transition(
            job_id,
            JobStatus::Failed,
            job::ActiveModel {
                error_message: Set(Some(error)),
                completed_at: Set(Some(Utc::now())),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn mark_stopped(&self, job_id: Uuid) -> Result<job::Model> {
        self.transition(
            job_id,
            JobStatus::Stopped,
            job::ActiveModel {
                completed_at: Set(Some(Utc::now())),
                ..Default::default()
            },
        )
        .await
    }

    /// Writes `next` together with `changes` only if the job currently sits
    /// in one of the statuses allowed to precede `next`.
    async fn transition(
        &self,
        job_id: Uuid,
        next: JobStatus,
        mut changes: job::ActiveModel,
    ) -> Result<job::Model> {
        changes.status = Set(next);
        changes.updated_at = Set(Utc::now());

        let result = job::Entity::update_many()
            .set(changes)
            .filter(job::Column::Id.eq(job_id))
            .filter(job::Column::Status.is_in(JobStatus::allowed_predecessors(next).iter().copied()))
            .exec(self.db.as_ref())
            .await?;

        let current = job::Entity::find_by_id(job_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| OrchestratorError::job_not_found(job_id))?;
        if result.rows_affected == 0 {
            return Err(OrchestratorError::InvalidState(format!(
                "job {job_id} cannot move from {} to {next}",
                current.status
            )));
        }
        info!(job_id = %job_id, status = %next, "Job status updated.");
        Ok(current)
    }

    /// Stores a new progress document. Returns `false` once the job has
    /// left `running`; progress of finished jobs is frozen.
    pub async fn update_progress(&self, job_id: Uuid, progress: &JobProgress) -> Result<bool> {
        let result = job::Entity::update_many()
            .set(job::ActiveModel {
                progress: Set(serde_json::to_value(progress)?),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(job::Column::Id.eq(job_id))
            .filter(job::Column::Status.eq(JobStatus::Running))
            .exec(self.db.as_ref())
            .await?;
        debug!(job_id = %job_id, percent = progress.percent(), "Job progress updated.");
        Ok(result.rows_affected > 0)
    }

    pub async fn append_finding(&self, job_id: Uuid, payload: Value) -> Result<finding::Model> {
        self.ensure_accepts_findings(job_id).await?;
        let finding = finding::ActiveModel {
            job_id: Set(job_id),
            payload: Set(payload),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(self.db.as_ref())
        .await?;
        Ok(finding)
    }

    /// Appends a batch of findings. Returns how many were stored.
    pub async fn append_findings(&self, job_id: Uuid, payloads: Vec<Value>) -> Result<usize> {
        if payloads.is_empty() {
            return Ok(0);
        }
        self.ensure_accepts_findings(job_id).await?;
        let now = Utc::now();
        let count = payloads.len();
        let rows = payloads.into_iter().map(|payload| finding::ActiveModel {
            job_id: Set(job_id),
            payload: Set(payload),
            created_at: Set(now),
            ..Default::default()
        });
        finding::Entity::insert_many(rows)
            .exec(self.db.as_ref())
            .await?;
        Ok(count)
    }

    /// Findings are accepted while a job runs, and for a grace period after
    /// it finished so slow workers can still report.
    async fn ensure_accepts_findings(&self, job_id: Uuid) -> Result<()> {
        let job = job::Entity::find_by_id(job_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| OrchestratorError::job_not_found(job_id))?;
        match job.status {
            JobStatus::Running => Ok(()),
            JobStatus::Queued => Err(OrchestratorError::InvalidState(format!(
                "job {job_id} has not started"
            ))),
            _ => {
                let finished_at = job.completed_at.unwrap_or(job.updated_at);
                if Utc::now() - finished_at <= self.late_finding_grace {
                    Ok(())
                } else {
                    warn!(job_id = %job_id, status = %job.status, "Rejected late finding.");
                    Err(OrchestratorError::InvalidState(format!(
                        "job {job_id} finished at {finished_at} and no longer accepts findings"
                    )))
                }
            }
        }
    }

    pub async fn get_job(&self, job_id: Uuid, owner_id: i32) -> Result<job::Model> {
        job::Entity::find_by_id(job_id)
            .filter(job::Column::OwnerId.eq(owner_id))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| OrchestratorError::job_not_found(job_id))
    }

    /// Newest first, optionally narrowed to one kind.
    pub async fn list_jobs(&self, owner_id: i32, kind: Option<JobKind>) -> Result<Vec<job::Model>> {
        let mut query = job::Entity::find().filter(job::Column::OwnerId.eq(owner_id));
        if let Some(kind) = kind {
            query = query.filter(job::Column::Kind.eq(kind));
        }
        Ok(query
            .order_by_desc(job::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?)
    }

    pub async fn list_active_jobs(&self, owner_id: i32) -> Result<Vec<job::Model>> {
        Ok(job::Entity::find()
            .filter(job::Column::OwnerId.eq(owner_id))
            .filter(job::Column::Status.is_in([JobStatus::Queued, JobStatus::Running]))
            .order_by_desc(job::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?)
    }

    pub async fn list_active_jobs_for_fleet(&self, fleet_id: Uuid) -> Result<Vec<job::Model>> {
        Ok(job::Entity::find()
            .filter(job::Column::FleetId.eq(fleet_id))
            .filter(job::Column::Status.is_in([JobStatus::Queued, JobStatus::Running]))
            .all(self.db.as_ref())
            .await?)
    }

    /// Findings in insertion order.
    pub async fn get_findings(&self, job_id: Uuid, owner_id: i32) -> Result<Vec<finding::Model>> {
        self.get_job(job_id, owner_id).await?;
        self.findings_of(job_id).await
    }

    pub(super) async fn findings_of(&self, job_id: Uuid) -> Result<Vec<finding::Model>> {
        Ok(finding::Entity::find()
            .filter(finding::Column::JobId.eq(job_id))
            .order_by_asc(finding::Column::Id)
            .all(self.db.as_ref())
            .await?)
    }
}
