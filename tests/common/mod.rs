#![allow(dead_code)]

use atlas_fleet::controller::mock::SimulatedController;
use atlas_fleet::controller::SessionPool;
use atlas_fleet::db;
use atlas_fleet::db::entities::fleet;
use atlas_fleet::db::enums::CloudProvider;
use atlas_fleet::db::services::FleetSpec;
use atlas_fleet::server::config::{
    ControllerConfig, DispatchConfig, FleetPolicy, ServerConfig, ServiceConfig,
};
use atlas_fleet::web::AppState;
use sea_orm::DatabaseConnection;
use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;

pub const OWNER: i32 = 1;
pub const OTHER_OWNER: i32 = 2;

pub fn test_config() -> ServerConfig {
    ServerConfig {
        service: ServiceConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            database_url: "sqlite::memory:".to_string(),
            max_db_connections: 1,
            log_dir: "logs".to_string(),
            auto_migrate: true,
        },
        controller: ControllerConfig {
            simulated: true,
            host: "controller.simulated".to_string(),
            port: 22,
            user: "axiom".to_string(),
            key_path: "/dev/null".into(),
            known_hosts_path: None,
            binary_dir: None,
            control_dir: std::env::temp_dir().join("atlas-ssh-tests"),
            connect_timeout_secs: 5,
            command_timeout_secs: 5,
            provision_timeout_secs: 5,
            max_sessions: 4,
        },
        fleet: FleetPolicy::default(),
        dispatch: DispatchConfig {
            invocations_per_sec: 1000,
            work_dir: "/tmp/atlas-test".to_string(),
            chunk_timeout_secs: 5,
            ..DispatchConfig::default()
        },
    }
}

pub struct Harness {
    pub controller: SimulatedController,
    pub state: Arc<AppState>,
    pub db: Arc<DatabaseConnection>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: ServerConfig) -> Self {
        let db_pool = db::connect(&config.service.database_url, 1)
            .await
            .expect("connect sqlite");
        db::schema::create_tables(&db_pool)
            .await
            .expect("create tables");

        let controller = SimulatedController::new();
        let pool = SessionPool::new(
            Arc::new(controller.clone()),
            SimulatedController::endpoint(),
            config.controller.max_sessions,
            Duration::from_secs(config.controller.connect_timeout_secs),
        );
        let db = Arc::new(db_pool);
        let state = Arc::new(AppState::new(db.clone(), pool, Arc::new(config)));
        Self { controller, state, db }
    }

    pub async fn deploy(&self, name: &str, count: i32) -> fleet::Model {
        self.state
            .fleet_manager
            .deploy_fleet(OWNER, spec(name, count))
            .await
            .expect("deploy fleet")
    }
}

pub fn spec(name: &str, count: i32) -> FleetSpec {
    FleetSpec {
        name: name.to_string(),
        provider: CloudProvider::DigitalOcean,
        instance_type: "s-1vcpu-1gb".to_string(),
        instance_count: count,
        regions: vec!["nyc1".to_string(), "ams3".to_string()],
        tunnel_node_id: None,
        modules: Vec::new(),
        tags: Map::new(),
    }
}
