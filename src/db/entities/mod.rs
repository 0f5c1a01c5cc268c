//! SeaORM entities for the fleet orchestration tables.

pub mod finding;
pub mod fleet;
pub mod instance;
pub mod job;

pub mod prelude {
    pub use super::fleet::ActiveModel as FleetActiveModel;
    pub use super::fleet::Column as FleetColumn;
    pub use super::fleet::Entity as Fleet;
    pub use super::fleet::Model as FleetModel;

    pub use super::instance::ActiveModel as InstanceActiveModel;
    pub use super::instance::Column as InstanceColumn;
    pub use super::instance::Entity as Instance;
    pub use super::instance::Model as InstanceModel;

    pub use super::job::ActiveModel as JobActiveModel;
    pub use super::job::Column as JobColumn;
    pub use super::job::Entity as Job;
    pub use super::job::Model as JobModel;

    pub use super::finding::ActiveModel as FindingActiveModel;
    pub use super::finding::Column as FindingColumn;
    pub use super::finding::Entity as Finding;
    pub use super::finding::Model as FindingModel;
}
