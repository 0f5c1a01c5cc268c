use crate::db::enums::{DistributionStrategy, JobKind, JobStatus};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(indexed)]
    pub owner_id: i32,
    pub kind: JobKind,
    pub name: String,
    #[sea_orm(indexed)]
    pub fleet_id: Option<Uuid>,
    pub targets: Json,
    pub tool: String,
    pub strategy: DistributionStrategy,
    pub rate_limit: i32,
    #[sea_orm(indexed)]
    pub status: JobStatus,
    pub progress: Json,
    pub result_location: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub completed_at: Option<DateTimeUtc>,
}

impl Model {
    pub fn target_list(&self) -> Vec<String> {
        serde_json::from_value(self.targets.clone()).unwrap_or_default()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::finding::Entity")]
    Finding,
}

impl Related<super::finding::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Finding.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
