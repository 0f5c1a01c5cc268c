use dashmap::DashMap;
use futures::future::join_all;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::controller::command::validate_identifier;
use crate::controller::{ControllerCommand, RemoteCommand, SessionPool};
use crate::db::entities::job;
use crate::db::enums::{DistributionStrategy, FleetStatus, JobKind};
use crate::db::services::{ChunkFailure, FleetStore, JobProgress, JobTracker, NewJob};
use crate::error::{OrchestratorError, Result};
use crate::server::config::DispatchConfig;
use crate::server::fleet_locks::FleetLocks;

/// Label used in progress failures of chunks that run on the controller.
const CONTROLLER_LABEL: &str = "controller";

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRequest {
    #[serde(default = "default_kind")]
    pub kind: JobKind,
    pub name: String,
    #[serde(default)]
    pub fleet_id: Option<Uuid>,
    pub targets: Vec<String>,
    pub tool: String,
    #[serde(default = "default_strategy")]
    pub strategy: DistributionStrategy,
    pub rate_limit: u32,
    /// Index into the fleet's running instances (ordered by name) for the
    /// `single` strategy. Defaults to the first instance.
    #[serde(default)]
    pub designated_instance: Option<usize>,
}

fn default_kind() -> JobKind {
    JobKind::Scan
}

fn default_strategy() -> DistributionStrategy {
    DistributionStrategy::RoundRobin
}

impl DispatchRequest {
    /// Checks the request and returns its targets with blank entries removed.
    pub fn validate(&self, max_rate_limit: u32) -> Result<Vec<String>> {
        let targets: Vec<String> = self
            .targets
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if targets.is_empty() {
            return Err(OrchestratorError::Validation(
                "At least one target must be provided.".to_string(),
            ));
        }
        if let Some(bad) = targets.iter().find(|t| t.contains(['\n', '\r', '\0'])) {
            return Err(OrchestratorError::Validation(format!(
                "target {bad:?} contains a line break"
            )));
        }
        validate_identifier("tool", &self.tool, 64)?;
        if self.rate_limit == 0 || self.rate_limit > max_rate_limit {
            return Err(OrchestratorError::Validation(format!(
                "rate_limit must be between 1 and {max_rate_limit}, got {}",
                self.rate_limit
            )));
        }
        Ok(targets)
    }
}

/// Targets destined for one remote invocation. `instance` is `None` when the
/// job has no fleet and runs on the controller itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkChunk {
    pub instance: Option<String>,
    pub targets: Vec<String>,
}

/// Splits `targets` over `instances` according to `strategy`.
///
/// Round-robin places target `j` on instance `j mod N`, so every target lands
/// in exactly one chunk, chunk sizes differ by at most one and the first
/// `T mod N` instances get the larger chunks. Instances that would receive
/// nothing get no chunk.
pub fn plan_distribution(
    targets: &[String],
    instances: &[String],
    strategy: DistributionStrategy,
    designated: Option<usize>,
) -> Result<Vec<WorkChunk>> {
    if instances.is_empty() {
        return Ok(vec![WorkChunk {
            instance: None,
            targets: targets.to_vec(),
        }]);
    }

    match strategy {
        DistributionStrategy::Broadcast => Ok(instances
            .iter()
            .map(|name| WorkChunk {
                instance: Some(name.clone()),
                targets: targets.to_vec(),
            })
            .collect()),
        DistributionStrategy::Single => {
            let index = designated.unwrap_or(0);
            let name = instances.get(index).ok_or_else(|| {
                OrchestratorError::Validation(format!(
                    "designated instance {index} is out of range for {} running instances",
                    instances.len()
                ))
            })?;
            Ok(vec![WorkChunk {
                instance: Some(name.clone()),
                targets: targets.to_vec(),
            }])
        }
        DistributionStrategy::RoundRobin => {
            let mut buckets: Vec<Vec<String>> = vec![Vec::new(); instances.len()];
            for (j, target) in targets.iter().enumerate() {
                buckets[j % instances.len()].push(target.clone());
            }
            Ok(instances
                .iter()
                .zip(buckets)
                .filter(|(_, bucket)| !bucket.is_empty())
                .map(|(name, bucket)| WorkChunk {
                    instance: Some(name.clone()),
                    targets: bucket,
                })
                .collect())
        }
    }
}

/// Turns a chunk's stdout into finding payloads. JSON object lines are kept,
/// any other line is wrapped as `{"output": line}`.
pub fn parse_findings(output: &str, instance: Option<&str>) -> Vec<Value> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let mut payload = match serde_json::from_str::<Value>(line) {
                Ok(Value::Object(map)) => Value::Object(map),
                _ => json!({ "output": line }),
            };
            if let (Some(instance), Value::Object(map)) = (instance, &mut payload) {
                map.entry("instance")
                    .or_insert_with(|| Value::String(instance.to_string()));
            }
            payload
        })
        .collect()
}

/// Cancellation tokens of jobs with local work in flight.
#[derive(Default)]
pub struct ActiveJobs {
    tokens: DashMap<Uuid, CancellationToken>,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(job_id, token.clone());
        token
    }

    /// Cancels and forgets the job's token. Returns whether one existed.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.tokens.remove(&job_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, job_id: Uuid) {
        self.tokens.remove(&job_id);
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        self.tokens.contains_key(&job_id)
    }
}

#[derive(Debug)]
pub struct DispatchHandle {
    pub job_id: Uuid,
    handle: JoinHandle<()>,
}

impl DispatchHandle {
    /// Waits until the job's local work has finished or been abandoned.
    pub async fn wait(self) {
        if let Err(e) = self.handle.await {
            error!(job_id = %self.job_id, error = %e, "Dispatch task panicked.");
        }
    }
}

struct PlannedChunk {
    index: usize,
    chunk: WorkChunk,
    targets_file: String,
}

#[derive(Clone)]
pub struct WorkloadDispatcher {
    store: FleetStore,
    tracker: JobTracker,
    pool: SessionPool,
    limiter: Arc<DefaultDirectRateLimiter>,
    config: DispatchConfig,
    command_timeout: Duration,
    active_jobs: Arc<ActiveJobs>,
    locks: Arc<FleetLocks>,
}

impl WorkloadDispatcher {
    pub fn new(
        store: FleetStore,
        tracker: JobTracker,
        pool: SessionPool,
        config: DispatchConfig,
        command_timeout: Duration,
        active_jobs: Arc<ActiveJobs>,
        locks: Arc<FleetLocks>,
    ) -> Self {
        let per_second = NonZeroU32::new(config.invocations_per_sec).unwrap_or(NonZeroU32::MIN);
        Self {
            store,
            tracker,
            pool,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
            config,
            command_timeout,
            active_jobs,
            locks,
        }
    }

    fn job_dir(&self, job_id: Uuid) -> String {
        format!("{}/{}", self.config.work_dir.trim_end_matches('/'), job_id)
    }

    /// Validates and records a job, uploads its chunks and starts them in
    /// the background. The returned job is `running`.
    pub async fn distribute(
        &self,
        owner_id: i32,
        request: DispatchRequest,
    ) -> Result<(job::Model, DispatchHandle)> {
        let targets = request.validate(self.config.max_rate_limit)?;

        // Held until the job row exists, so a concurrent termination either
        // runs first or sees the job.
        let fleet_guard = match request.fleet_id {
            Some(fleet_id) => Some(self.locks.lock(fleet_id).await),
            None => None,
        };
        let instances: Vec<String> = match request.fleet_id {
            Some(fleet_id) => {
                let fleet = self.store.get_fleet(fleet_id, owner_id).await?;
                if fleet.status != FleetStatus::Active {
                    return Err(OrchestratorError::InvalidState(format!(
                        "fleet {fleet_id} is {}; jobs need an active fleet",
                        fleet.status
                    )));
                }
                let running = self.store.running_instances(fleet_id).await?;
                if running.is_empty() {
                    return Err(OrchestratorError::InvalidState(format!(
                        "fleet {fleet_id} has no running instances"
                    )));
                }
                running.into_iter().map(|i| i.name).collect()
            }
            None => Vec::new(),
        };
        let chunks = plan_distribution(
            &targets,
            &instances,
            request.strategy,
            request.designated_instance,
        )?;

        let job = self
            .tracker
            .create_job(
                owner_id,
                NewJob {
                    kind: request.kind,
                    name: request.name,
                    fleet_id: request.fleet_id,
                    targets,
                    tool: request.tool.clone(),
                    strategy: request.strategy,
                    rate_limit: request.rate_limit,
                },
            )
            .await?;
        let token = self.active_jobs.register(job.id);
        drop(fleet_guard);

        let planned = match self.upload_chunks(job.id, chunks).await {
            Ok(planned) => planned,
            Err(e) => {
                self.active_jobs.remove(job.id);
                self.record_staging_failure(job.id, &e).await;
                return Err(e);
            }
        };

        let job = match self.tracker.mark_running(job.id, planned.len() as u32).await {
            Ok(job) => job,
            Err(e) => {
                self.active_jobs.remove(job.id);
                return Err(e);
            }
        };
        info!(job_id = %job.id, chunks = planned.len(), strategy = %job.strategy, "Job dispatched.");

        let job_id = job.id;
        let this = self.clone();
        let tool = request.tool;
        let rate_limit = request.rate_limit;
        let handle = tokio::spawn(async move {
            this.run_job(job_id, tool, rate_limit, planned, token).await;
        });
        Ok((job, DispatchHandle { job_id, handle }))
    }

    /// A timed out upload leaves the job `queued`; any other failure marks
    /// it `failed`.
    async fn record_staging_failure(&self, job_id: Uuid, err: &OrchestratorError) {
        if matches!(err, OrchestratorError::Timeout { .. }) {
            warn!(job_id = %job_id, error = %err, "Staging timed out; job left queued.");
            return;
        }
        error!(job_id = %job_id, error = %err, "Failed to stage job on the controller.");
        if let Err(mark_err) = self.tracker.mark_failed(job_id, err.to_string()).await {
            error!(job_id = %job_id, error = %mark_err, "Failed to mark job failed.");
        }
    }

    /// Writes each chunk's targets to its own file on the controller.
    async fn upload_chunks(&self, job_id: Uuid, chunks: Vec<WorkChunk>) -> Result<Vec<PlannedChunk>> {
        let dir = self.job_dir(job_id);
        let mut session = self.pool.acquire().await?;
        let result = async {
            session
                .run(&ControllerCommand::make_dir(&dir), self.command_timeout, "creating job directory")
                .await?;
            let mut planned = Vec::with_capacity(chunks.len());
            for (index, chunk) in chunks.into_iter().enumerate() {
                let targets_file = format!("{dir}/chunk-{index}.txt");
                let mut contents = chunk.targets.join("\n");
                contents.push('\n');
                session
                    .run(
                        &ControllerCommand::write_file(&targets_file, contents),
                        self.command_timeout,
                        "uploading targets",
                    )
                    .await?;
                planned.push(PlannedChunk {
                    index,
                    chunk,
                    targets_file,
                });
            }
            Ok::<_, OrchestratorError>(planned)
        }
        .await;
        session.release().await;
        result
    }

    async fn run_job(
        self,
        job_id: Uuid,
        tool: String,
        rate_limit: u32,
        planned: Vec<PlannedChunk>,
        token: CancellationToken,
    ) {
        let progress = Arc::new(Mutex::new(JobProgress::new(planned.len() as u32)));
        let work = join_all(planned.into_iter().map(|p| {
            let progress = progress.clone();
            let tool = tool.as_str();
            let this = &self;
            async move { this.run_chunk(job_id, p, tool, rate_limit, &progress).await }
        }));

        tokio::select! {
            _ = token.cancelled() => {
                info!(job_id = %job_id, "Job cancelled; abandoning local work.");
                return;
            }
            _ = work => {}
        }
        self.active_jobs.remove(job_id);

        let progress = progress.lock().await.clone();
        let outcome = if progress.all_failed() {
            let reason = progress
                .failures
                .first()
                .map(|f| format!("all {} chunks failed; first: {}", progress.total_chunks, f.message))
                .unwrap_or_else(|| "all chunks failed".to_string());
            self.tracker.mark_failed(job_id, reason).await
        } else {
            self.tracker.mark_completed(job_id, self.job_dir(job_id)).await
        };
        match outcome {
            Ok(job) => info!(
                job_id = %job_id,
                status = %job.status,
                findings = progress.findings,
                failed_chunks = progress.failed_chunks,
                "Job finished."
            ),
            // Stopped while the last chunks were finishing.
            Err(OrchestratorError::InvalidState(_)) => debug!(job_id = %job_id, "Job already finalised."),
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to finalise job."),
        }
    }

    async fn run_chunk(
        &self,
        job_id: Uuid,
        planned: PlannedChunk,
        tool: &str,
        rate_limit: u32,
        progress: &Mutex<JobProgress>,
    ) {
        let PlannedChunk {
            index,
            chunk,
            targets_file,
        } = planned;
        let label = chunk
            .instance
            .clone()
            .unwrap_or_else(|| CONTROLLER_LABEL.to_string());

        self.limiter.until_ready().await;
        let output_file = format!("{}/chunk-{index}.out", self.job_dir(job_id));
        let command = ControllerCommand::scan(
            &targets_file,
            tool,
            chunk.instance.as_deref(),
            rate_limit,
            &output_file,
        );
        debug!(job_id = %job_id, instance = %label, targets = chunk.targets.len(), "Running chunk.");

        let outcome = match self.run_scan(&command).await {
            Ok(output) => {
                let findings = parse_findings(&output, chunk.instance.as_deref());
                self.tracker.append_findings(job_id, findings).await
            }
            Err(e) => Err(e),
        };

        let mut progress = progress.lock().await;
        match outcome {
            Ok(count) => {
                progress.completed_chunks += 1;
                progress.findings += count as u64;
            }
            Err(e) => {
                warn!(job_id = %job_id, instance = %label, error = %e, "Chunk failed.");
                progress.failed_chunks += 1;
                progress.failures.push(ChunkFailure {
                    instance: label,
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
            }
        }
        if let Err(e) = self.tracker.update_progress(job_id, &progress).await {
            error!(job_id = %job_id, error = %e, "Failed to record job progress.");
        }
    }

    async fn run_scan(&self, command: &RemoteCommand) -> Result<String> {
        let mut session = self.pool.acquire().await?;
        let result = session
            .run(
                command,
                Duration::from_secs(self.config.chunk_timeout_secs),
                "running scan chunk",
            )
            .await;
        session.release().await;
        result
    }

    /// Marks the job `stopped`, abandons its local work and asks every
    /// running instance of its fleet to kill the tool. Jobs without a fleet
    /// run on the controller, where the job's own scans are killed instead.
    /// The remote kill is best effort.
    pub async fn stop_job(&self, owner_id: i32, job_id: Uuid) -> Result<job::Model> {
        let job = self.tracker.get_job(job_id, owner_id).await?;
        let stopped = self.tracker.mark_stopped(job.id).await?;
        self.active_jobs.cancel(job.id);
        info!(job_id = %job.id, "Job stopped.");

        if let Some(fleet_id) = job.fleet_id {
            match self.store.running_instances(fleet_id).await {
                Ok(instances) => {
                    let tool = job.tool.as_str();
                    join_all(instances.iter().map(|inst| async move {
                        let command = ControllerCommand::stop_tool(&inst.name, tool);
                        if let Err(e) = self.run_stop(&command).await {
                            warn!(job_id = %job_id, instance = %inst.name, error = %e, "Remote stop failed.");
                        }
                    }))
                    .await;
                }
                Err(e) => warn!(job_id = %job.id, error = %e, "Could not list instances to stop."),
            }
        } else {
            // Every scan of the job writes below the job directory.
            let command = ControllerCommand::stop_local(&self.job_dir(job_id));
            if let Err(e) = self.run_stop(&command).await {
                warn!(job_id = %job_id, error = %e, "Controller-side stop failed.");
            }
        }
        Ok(stopped)
    }

    async fn run_stop(&self, command: &RemoteCommand) -> Result<String> {
        let mut session = self.pool.acquire().await?;
        let result = session
            .run(command, self.command_timeout, "stopping remote tool")
            .await;
        session.release().await;
        result
    }
}
