use serde::{Deserialize, Serialize};

use crate::db::entities::job;
use crate::db::enums::JobKind;
use crate::db::services::JobProgress;
use crate::server::ScaleDirection;

/// Caller identity forwarded by the upstream gateway, passed to handlers as
/// a request extension.
#[derive(Debug, Clone, Copy)]
pub struct OwnerContext {
    pub id: i32,
}

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub direction: ScaleDirection,
    pub count: i32,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub command: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct JobListQuery {
    pub kind: Option<JobKind>,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    #[serde(flatten)]
    pub job: job::Model,
    pub percent_complete: u8,
}

impl From<job::Model> for JobResponse {
    fn from(job: job::Model) -> Self {
        let percent_complete = JobProgress::from_json(&job.progress).percent();
        Self {
            job,
            percent_complete,
        }
    }
}
