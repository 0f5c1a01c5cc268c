use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "cloud_provider_enum")]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    #[sea_orm(string_value = "aws")]
    Aws,
    #[sea_orm(string_value = "gcp")]
    Gcp,
    #[sea_orm(string_value = "azure")]
    Azure,
    #[sea_orm(string_value = "digitalocean")]
    DigitalOcean,
    #[sea_orm(string_value = "linode")]
    Linode,
    #[sea_orm(string_value = "hetzner")]
    Hetzner,
    #[sea_orm(string_value = "ibm")]
    Ibm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "fleet_status_enum")]
#[serde(rename_all = "lowercase")]
pub enum FleetStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "deploying")]
    Deploying,
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "scaling")]
    Scaling,
    #[sea_orm(string_value = "terminating")]
    Terminating,
    #[sea_orm(string_value = "terminated")]
    Terminated,
    #[sea_orm(string_value = "error")]
    Error,
}

impl FleetStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FleetStatus::Terminated)
    }

    /// Edges of the fleet state machine. `Terminated` has no outgoing edge.
    pub fn can_transition_to(&self, next: FleetStatus) -> bool {
        use FleetStatus::*;
        match (self, next) {
            (Pending, Deploying) => true,
            (Deploying, Active) | (Deploying, Error) => true,
            (Active, Scaling) | (Scaling, Active) | (Scaling, Error) => true,
            // Drift found by reconciliation, and recovery once instances run again.
            (Active, Error) | (Error, Active) => true,
            (Terminating, Terminated) | (Terminating, Error) => true,
            (Terminated, _) => false,
            (_, Terminating) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "instance_status_enum")]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    #[sea_orm(string_value = "provisioning")]
    Provisioning,
    #[sea_orm(string_value = "running")]
    Running,
    #[sea_orm(string_value = "stopped")]
    Stopped,
    #[sea_orm(string_value = "terminated")]
    Terminated,
    #[sea_orm(string_value = "unreachable")]
    Unreachable,
}

impl InstanceStatus {
    /// Maps the status column printed by `axiom-ls`.
    pub fn from_controller(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "active" | "running" | "on" => InstanceStatus::Running,
            "off" | "stopped" | "stopping" => InstanceStatus::Stopped,
            "new" | "provisioning" | "starting" | "pending" | "initializing" => {
                InstanceStatus::Provisioning
            }
            _ => InstanceStatus::Unreachable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "job_kind_enum")]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    #[sea_orm(string_value = "scan")]
    Scan,
    #[sea_orm(string_value = "collection")]
    Collection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "job_status_enum")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[sea_orm(string_value = "queued")]
    Queued,
    #[sea_orm(string_value = "running")]
    Running,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "stopped")]
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }

    /// Statuses a job may be in right before moving to `next`.
    pub fn allowed_predecessors(next: JobStatus) -> &'static [JobStatus] {
        match next {
            JobStatus::Queued => &[],
            JobStatus::Running => &[JobStatus::Queued],
            JobStatus::Completed => &[JobStatus::Running],
            JobStatus::Failed | JobStatus::Stopped => &[JobStatus::Queued, JobStatus::Running],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "distribution_strategy_enum")]
#[serde(rename_all = "kebab-case")]
pub enum DistributionStrategy {
    #[sea_orm(string_value = "round-robin")]
    RoundRobin,
    #[sea_orm(string_value = "broadcast")]
    Broadcast,
    #[sea_orm(string_value = "single")]
    Single,
}

macro_rules! display_as_db_value {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.to_value())
                }
            }
        )*
    };
}

display_as_db_value!(
    CloudProvider,
    FleetStatus,
    InstanceStatus,
    JobKind,
    JobStatus,
    DistributionStrategy
);
