//! Persistence layer: entities, active enums, schema bootstrap and the
//! services that own every mutation of fleet and job state.

pub mod entities;
pub mod enums;
pub mod schema;
pub mod services;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr};
use std::time::Duration;
use tracing::info;

/// Opens the connection pool for `database_url`.
///
/// In-memory SQLite URLs are pinned to a single connection, otherwise each
/// pooled connection would see its own empty database.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(database_url.to_owned());
    let max_connections = if database_url.contains(":memory:") || database_url.contains("mode=memory") {
        1
    } else {
        max_connections
    };
    opt.max_connections(max_connections)
        .connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;
    info!(backend = ?db.get_database_backend(), max_connections, "Database connection established.");
    Ok(db)
}
