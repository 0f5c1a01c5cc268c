use crate::db::enums::{CloudProvider, FleetStatus};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "fleets")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(indexed)]
    pub owner_id: i32,
    pub name: String,
    pub provider: CloudProvider,
    pub instance_type: String,
    pub instance_count: i32,
    pub regions: Json,
    #[sea_orm(indexed)]
    pub status: FleetStatus,
    pub tunnel_node_id: Option<i32>,
    pub tags: Json,
    pub last_error: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

impl Model {
    /// Name prefix used for this fleet's instances on the controller.
    ///
    /// The id fragment keeps two owners' fleets with the same display name
    /// apart, since the controller namespace is shared.
    pub fn remote_name(&self) -> String {
        let id = self.id.simple().to_string();
        format!("{}-{}", self.name, &id[..8])
    }

    pub fn region_list(&self) -> Vec<String> {
        serde_json::from_value(self.regions.clone()).unwrap_or_default()
    }

    pub fn modules(&self) -> Vec<String> {
        self.tags
            .get("modules")
            .and_then(|m| serde_json::from_value(m.clone()).ok())
            .unwrap_or_default()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::instance::Entity")]
    Instance,
}

impl Related<super::instance::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Instance.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
