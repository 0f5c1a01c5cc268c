use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, Schema};
use tracing::debug;

use crate::db::entities::{finding, fleet, instance, job};

/// Creates the orchestration tables and their indexes if they do not exist.
pub async fn create_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    create_for(db, fleet::Entity).await?;
    create_for(db, instance::Entity).await?;
    create_for(db, job::Entity).await?;
    create_for(db, finding::Entity).await?;
    Ok(())
}

async fn create_for<E>(db: &DatabaseConnection, entity: E) -> Result<(), DbErr>
where
    E: EntityTrait,
{
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let mut table = schema.create_table_from_entity(entity);
    table.if_not_exists();
    db.execute(backend.build(&table)).await?;

    for mut index in schema.create_index_from_entity(entity) {
        index.if_not_exists();
        db.execute(backend.build(&index)).await?;
    }
    debug!(table = entity.table_name(), "Ensured table exists.");
    Ok(())
}
