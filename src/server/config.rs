use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::controller::ControllerEndpoint;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub controller: ControllerConfig,
    pub fleet: FleetPolicy,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen_addr: String,
    pub database_url: String,
    pub max_db_connections: u32,
    pub log_dir: String,
    /// Create missing tables on startup.
    pub auto_migrate: bool,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Serve controller commands from the in-process simulation instead of SSH.
    pub simulated: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
    pub known_hosts_path: Option<PathBuf>,
    pub binary_dir: Option<String>,
    pub control_dir: PathBuf,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub provision_timeout_secs: u64,
    pub max_sessions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminatePolicy {
    /// Refuse to terminate a fleet that still has queued or running jobs.
    Reject,
    /// Stop those jobs first, then terminate.
    Stop,
}

#[derive(Debug, Clone)]
pub struct FleetPolicy {
    pub max_instances: u32,
    pub reconcile_interval_secs: u64,
    pub terminate_with_running_jobs: TerminatePolicy,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_rate_limit: u32,
    pub invocations_per_sec: u32,
    pub work_dir: String,
    pub chunk_timeout_secs: u64,
    pub late_finding_grace_secs: u64,
}

impl FromStr for TerminatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(TerminatePolicy::Reject),
            "stop" => Ok(TerminatePolicy::Stop),
            other => Err(format!(
                "terminate_with_running_jobs must be `reject` or `stop`, got {other:?}"
            )),
        }
    }
}

impl fmt::Display for TerminatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminatePolicy::Reject => f.write_str("reject"),
            TerminatePolicy::Stop => f.write_str("stop"),
        }
    }
}

impl ControllerConfig {
    pub fn endpoint(&self) -> ControllerEndpoint {
        ControllerEndpoint {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            key_path: self.key_path.clone(),
            known_hosts_path: self.known_hosts_path.clone(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }
}

impl Default for FleetPolicy {
    fn default() -> Self {
        Self {
            max_instances: 50,
            reconcile_interval_secs: 300,
            terminate_with_running_jobs: TerminatePolicy::Reject,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_rate_limit: 1000,
            invocations_per_sec: 10,
            work_dir: "/tmp/atlas".to_string(),
            chunk_timeout_secs: 3600,
            late_finding_grace_secs: 3600,
        }
    }
}

// Partial configs for layering. The file is sectioned, the environment flat.
#[derive(Deserialize, Default, Debug)]
struct FileConfig {
    #[serde(default)]
    service: PartialService,
    #[serde(default)]
    controller: PartialController,
    #[serde(default)]
    fleet: PartialFleet,
    #[serde(default)]
    dispatch: PartialDispatch,
}

#[derive(Deserialize, Default, Debug)]
struct PartialService {
    listen_addr: Option<String>,
    database_url: Option<String>,
    max_db_connections: Option<u32>,
    log_dir: Option<String>,
    auto_migrate: Option<bool>,
}

#[derive(Deserialize, Default, Debug)]
struct PartialController {
    simulated: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    key_path: Option<String>,
    known_hosts_path: Option<String>,
    binary_dir: Option<String>,
    control_dir: Option<String>,
    connect_timeout_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
    provision_timeout_secs: Option<u64>,
    max_sessions: Option<usize>,
}

#[derive(Deserialize, Default, Debug)]
struct PartialFleet {
    max_instances: Option<u32>,
    reconcile_interval_secs: Option<u64>,
    terminate_with_running_jobs: Option<String>,
}

#[derive(Deserialize, Default, Debug)]
struct PartialDispatch {
    max_rate_limit: Option<u32>,
    invocations_per_sec: Option<u32>,
    work_dir: Option<String>,
    chunk_timeout_secs: Option<u64>,
    late_finding_grace_secs: Option<u64>,
}

/// `ATLAS_`-prefixed environment variables, e.g. `ATLAS_CONTROLLER_HOST`.
#[derive(Deserialize, Default, Debug)]
struct EnvConfig {
    listen_addr: Option<String>,
    database_url: Option<String>,
    max_db_connections: Option<u32>,
    log_dir: Option<String>,
    auto_migrate: Option<bool>,
    controller_simulated: Option<bool>,
    controller_host: Option<String>,
    controller_port: Option<u16>,
    controller_user: Option<String>,
    controller_key_path: Option<String>,
    controller_known_hosts_path: Option<String>,
    controller_binary_dir: Option<String>,
    controller_control_dir: Option<String>,
    controller_connect_timeout_secs: Option<u64>,
    controller_command_timeout_secs: Option<u64>,
    controller_provision_timeout_secs: Option<u64>,
    controller_max_sessions: Option<usize>,
    fleet_max_instances: Option<u32>,
    fleet_reconcile_interval_secs: Option<u64>,
    fleet_terminate_with_running_jobs: Option<String>,
    dispatch_max_rate_limit: Option<u32>,
    dispatch_invocations_per_sec: Option<u32>,
    dispatch_work_dir: Option<String>,
    dispatch_chunk_timeout_secs: Option<u64>,
    dispatch_late_finding_grace_secs: Option<u64>,
}

impl ServerConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self, String> {
        dotenv::dotenv().ok();

        // 1. Load from file (optional)
        let file_config: FileConfig = match config_path {
            Some(path_str) => {
                let path = Path::new(path_str);
                if path.exists() {
                    let contents = fs::read_to_string(path)
                        .map_err(|e| format!("Failed to read config file at {path:?}: {e}"))?;
                    toml::from_str(&contents).map_err(|e| {
                        format!("Failed to parse TOML from config file at {path:?}: {e}")
                    })?
                } else {
                    FileConfig::default()
                }
            }
            None => FileConfig::default(),
        };

        // 2. Load from environment variables
        let env_config: EnvConfig = envy::prefixed("ATLAS_")
            .from_env::<EnvConfig>()
            .map_err(|e| format!("Failed to load config from environment: {e}"))?;

        // 3. Merge: environment overrides file
        merge(file_config, env_config, std::env::var("DATABASE_URL").ok())
    }
}

fn merge(
    file: FileConfig,
    env: EnvConfig,
    fallback_database_url: Option<String>,
) -> Result<ServerConfig, String> {
    let fleet_defaults = FleetPolicy::default();
    let dispatch_defaults = DispatchConfig::default();

    let service = ServiceConfig {
        listen_addr: env
            .listen_addr
            .or(file.service.listen_addr)
            .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        database_url: env
            .database_url
            .or(file.service.database_url)
            .or(fallback_database_url)
            .ok_or("DATABASE_URL is required")?,
        max_db_connections: env
            .max_db_connections
            .or(file.service.max_db_connections)
            .unwrap_or(10),
        log_dir: env
            .log_dir
            .or(file.service.log_dir)
            .unwrap_or_else(|| "logs".to_string()),
        auto_migrate: env.auto_migrate.or(file.service.auto_migrate).unwrap_or(true),
    };

    let simulated = env
        .controller_simulated
        .or(file.controller.simulated)
        .unwrap_or(false);
    let host = env.controller_host.or(file.controller.host);
    let user = env.controller_user.or(file.controller.user);
    let key_path = env.controller_key_path.or(file.controller.key_path);
    let (host, user, key_path) = if simulated {
        (
            host.unwrap_or_else(|| "controller.simulated".to_string()),
            user.unwrap_or_else(|| "axiom".to_string()),
            key_path.unwrap_or_default(),
        )
    } else {
        (
            host.ok_or("ATLAS_CONTROLLER_HOST is required")?,
            user.ok_or("ATLAS_CONTROLLER_USER is required")?,
            key_path.ok_or("ATLAS_CONTROLLER_KEY_PATH is required")?,
        )
    };

    let controller = ControllerConfig {
        simulated,
        host,
        port: env.controller_port.or(file.controller.port).unwrap_or(22),
        user,
        key_path: PathBuf::from(key_path),
        known_hosts_path: env
            .controller_known_hosts_path
            .or(file.controller.known_hosts_path)
            .map(PathBuf::from),
        binary_dir: env.controller_binary_dir.or(file.controller.binary_dir),
        control_dir: env
            .controller_control_dir
            .or(file.controller.control_dir)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("atlas-ssh")),
        connect_timeout_secs: env
            .controller_connect_timeout_secs
            .or(file.controller.connect_timeout_secs)
            .unwrap_or(15),
        command_timeout_secs: env
            .controller_command_timeout_secs
            .or(file.controller.command_timeout_secs)
            .unwrap_or(60),
        provision_timeout_secs: env
            .controller_provision_timeout_secs
            .or(file.controller.provision_timeout_secs)
            .unwrap_or(120),
        max_sessions: env
            .controller_max_sessions
            .or(file.controller.max_sessions)
            .unwrap_or(4),
    };

    let fleet = FleetPolicy {
        max_instances: env
            .fleet_max_instances
            .or(file.fleet.max_instances)
            .unwrap_or(fleet_defaults.max_instances),
        reconcile_interval_secs: env
            .fleet_reconcile_interval_secs
            .or(file.fleet.reconcile_interval_secs)
            .unwrap_or(fleet_defaults.reconcile_interval_secs),
        terminate_with_running_jobs: match env
            .fleet_terminate_with_running_jobs
            .or(file.fleet.terminate_with_running_jobs)
        {
            Some(raw) => raw.parse()?,
            None => fleet_defaults.terminate_with_running_jobs,
        },
    };

    let dispatch = DispatchConfig {
        max_rate_limit: env
            .dispatch_max_rate_limit
            .or(file.dispatch.max_rate_limit)
            .unwrap_or(dispatch_defaults.max_rate_limit),
        invocations_per_sec: env
            .dispatch_invocations_per_sec
            .or(file.dispatch.invocations_per_sec)
            .unwrap_or(dispatch_defaults.invocations_per_sec),
        work_dir: env
            .dispatch_work_dir
            .or(file.dispatch.work_dir)
            .unwrap_or(dispatch_defaults.work_dir),
        chunk_timeout_secs: env
            .dispatch_chunk_timeout_secs
            .or(file.dispatch.chunk_timeout_secs)
            .unwrap_or(dispatch_defaults.chunk_timeout_secs),
        late_finding_grace_secs: env
            .dispatch_late_finding_grace_secs
            .or(file.dispatch.late_finding_grace_secs)
            .unwrap_or(dispatch_defaults.late_finding_grace_secs),
    };

    if fleet.max_instances == 0 {
        return Err("fleet.max_instances must be at least 1".to_string());
    }
    if dispatch.max_rate_limit == 0 || dispatch.invocations_per_sec == 0 {
        return Err("dispatch.max_rate_limit and dispatch.invocations_per_sec must be positive".to_string());
    }

    Ok(ServerConfig {
        service,
        controller,
        fleet,
        dispatch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(toml_text: &str) -> FileConfig {
        toml::from_str(toml_text).unwrap()
    }

    #[test]
    fn test_defaults_apply_for_simulated_controller() {
        let file = parse(
            r#"
            [service]
            database_url = "sqlite::memory:"

            [controller]
            simulated = true
            "#,
        );
        let config = merge(file, EnvConfig::default(), None).unwrap();
        assert_eq!(config.controller.port, 22);
        assert_eq!(config.controller.connect_timeout_secs, 15);
        assert_eq!(config.controller.command_timeout_secs, 60);
        assert_eq!(config.controller.provision_timeout_secs, 120);
        assert_eq!(config.controller.max_sessions, 4);
        assert_eq!(config.fleet.max_instances, 50);
        assert_eq!(config.fleet.terminate_with_running_jobs, TerminatePolicy::Reject);
        assert_eq!(config.dispatch.max_rate_limit, 1000);
        assert_eq!(config.dispatch.work_dir, "/tmp/atlas");
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = parse(
            r#"
            [service]
            database_url = "postgres://file/db"

            [controller]
            host = "10.0.0.1"
            user = "ubuntu"
            key_path = "/keys/file"
            port = 2222

            [fleet]
            terminate_with_running_jobs = "stop"
            "#,
        );
        let env = EnvConfig {
            controller_host: Some("10.9.9.9".to_string()),
            fleet_max_instances: Some(10),
            ..Default::default()
        };
        let config = merge(file, env, Some("postgres://fallback/db".to_string())).unwrap();
        assert_eq!(config.service.database_url, "postgres://file/db");
        assert_eq!(config.controller.host, "10.9.9.9");
        assert_eq!(config.controller.port, 2222);
        assert_eq!(config.fleet.max_instances, 10);
        assert_eq!(config.fleet.terminate_with_running_jobs, TerminatePolicy::Stop);
        assert_eq!(config.controller.endpoint().to_string(), "ubuntu@10.9.9.9:2222");
    }

    #[test]
    fn test_database_url_falls_back_to_plain_variable() {
        let file = parse("[controller]\nsimulated = true\n");
        let config = merge(file, EnvConfig::default(), Some("sqlite://atlas.db".to_string())).unwrap();
        assert_eq!(config.service.database_url, "sqlite://atlas.db");
    }

    #[test]
    fn test_real_controller_requires_credentials() {
        let file = parse("[service]\ndatabase_url = \"sqlite::memory:\"\n");
        let err = merge(file, EnvConfig::default(), None).unwrap_err();
        assert!(err.contains("CONTROLLER_HOST"));
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        let file = parse(
            "[service]\ndatabase_url = \"x\"\n[controller]\nsimulated = true\n[fleet]\nterminate_with_running_jobs = \"ignore\"\n",
        );
        assert!(merge(file, EnvConfig::default(), None).is_err());
    }

    #[test]
    fn test_load_reads_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[service]\ndatabase_url = \"sqlite::memory:\"\nlisten_addr = \"127.0.0.1:9000\"\n[controller]\nsimulated = true\n[dispatch]\ninvocations_per_sec = 3"
        )
        .unwrap();
        let config = ServerConfig::load(file.path().to_str()).unwrap();
        assert!(config.controller.simulated);
        assert_eq!(config.service.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.dispatch.invocations_per_sec, 3);
    }
}
