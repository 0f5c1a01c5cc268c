use atlas_fleet::controller::mock::SimulatedController;
use atlas_fleet::controller::ssh::{SshOptions, SshSessionFactory};
use atlas_fleet::controller::{SessionFactory, SessionPool};
use atlas_fleet::db;
use atlas_fleet::server::config::ServerConfig;
use atlas_fleet::version::VERSION;
use atlas_fleet::web::{AppState, create_axum_router};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API (default)
    Serve,
    /// Create the database tables and exit
    InitDb,
}

fn init_logging(log_dir: &str) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "server.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sea_orm=warn,sqlx::query=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

fn build_session_pool(config: &ServerConfig) -> SessionPool {
    let controller = &config.controller;
    let factory: Arc<dyn SessionFactory> = if controller.simulated {
        warn!("Using the simulated controller; no remote commands will run.");
        Arc::new(SimulatedController::new())
    } else {
        Arc::new(SshSessionFactory::new(SshOptions {
            connect_timeout: controller.connect_timeout(),
            binary_dir: controller.binary_dir.clone(),
            control_dir: controller.control_dir.clone(),
        }))
    };
    let endpoint = if controller.simulated {
        SimulatedController::endpoint()
    } else {
        controller.endpoint()
    };
    SessionPool::new(
        factory,
        endpoint,
        controller.max_sessions,
        controller.connect_timeout(),
    )
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C.");
    }
    info!("Shutdown signal received.");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if std::env::args().any(|arg| arg == "--version") {
        println!("Server version: {VERSION}");
        return Ok(());
    }

    let args = Args::parse();

    let server_config = match ServerConfig::load(args.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Failed to load server configuration: {e}");
            return Err(e.into());
        }
    };

    init_logging(&server_config.service.log_dir);
    info!(version = VERSION, "Starting server.");

    let db_pool = db::connect(
        &server_config.service.database_url,
        server_config.service.max_db_connections,
    )
    .await?;

    match args.command.unwrap_or(Command::Serve) {
        Command::InitDb => {
            db::schema::create_tables(&db_pool).await?;
            info!("Database schema is ready.");
            return Ok(());
        }
        Command::Serve => {
            if server_config.service.auto_migrate {
                db::schema::create_tables(&db_pool).await?;
            }
        }
    }

    let pool = build_session_pool(&server_config);
    info!(
        endpoint = %pool.endpoint(),
        max_sessions = server_config.controller.max_sessions,
        "Controller session pool ready."
    );

    let app_state = Arc::new(AppState::new(
        Arc::new(db_pool),
        pool,
        server_config.clone(),
    ));

    // --- Periodic reconciliation ---
    let reconcile_secs = server_config.fleet.reconcile_interval_secs;
    if reconcile_secs > 0 {
        let manager = app_state.fleet_manager.clone();
        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(reconcile_secs));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            info!(interval_seconds = reconcile_secs, "Fleet reconciliation task started.");
            loop {
                interval.tick().await;
                match manager.reconcile_all().await {
                    Ok(reports) => {
                        let drifted = reports.iter().filter(|r| !r.is_clean()).count();
                        info!(fleets = reports.len(), drifted, "Fleet reconciliation finished.");
                    }
                    Err(e) => error!(error = %e, "Fleet reconciliation failed."),
                }
            }
        });
    }

    let app = create_axum_router(app_state);
    let listener = tokio::net::TcpListener::bind(&server_config.service.listen_addr).await?;
    info!(address = %server_config.service.listen_addr, "HTTP server listening.");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped.");
    Ok(())
}
