mod common;

use atlas_fleet::db::enums::{FleetStatus, InstanceStatus, JobKind, DistributionStrategy, JobStatus};
use atlas_fleet::server::config::TerminatePolicy;
use atlas_fleet::server::{DispatchRequest, ScaleDirection};
use atlas_fleet::{ErrorKind, OrchestratorError};
use common::{Harness, OTHER_OWNER, OWNER, spec, test_config};
use std::time::Duration;

#[tokio::test]
async fn deploy_then_scale_up() {
    let h = Harness::new().await;
    let fleet = h.deploy("recon", 3).await;
    assert_eq!(fleet.status, FleetStatus::Active);
    assert_eq!(fleet.instance_count, 3);

    let store = &h.state.fleet_store;
    let fetched = store.get_fleet(fleet.id, OWNER).await.unwrap();
    assert_eq!(fetched.status, FleetStatus::Active);
    assert_eq!(fetched.instance_count, 3);
    assert_eq!(store.running_instances(fleet.id).await.unwrap().len(), 3);

    let scaled = h
        .state
        .fleet_manager
        .scale_fleet(fleet.id, OWNER, ScaleDirection::Up, 2)
        .await
        .unwrap();
    assert_eq!(scaled.status, FleetStatus::Active);
    assert_eq!(scaled.instance_count, 5);
    assert_eq!(store.running_instances(fleet.id).await.unwrap().len(), 5);
    assert_eq!(h.controller.instance_names().len(), 5);
    assert_eq!(h.controller.open_sessions(), 0);
}

#[tokio::test]
async fn deploy_installs_requested_modules() {
    let h = Harness::new().await;
    let mut with_modules = spec("mods", 1);
    with_modules.modules = vec!["nuclei".to_string()];
    let fleet = h
        .state
        .fleet_manager
        .deploy_fleet(OWNER, with_modules)
        .await
        .unwrap();
    assert_eq!(
        h.controller.installed_modules(),
        vec![(fleet.remote_name(), "nuclei".to_string())]
    );
}

#[tokio::test]
async fn scale_down_keeps_at_least_one_instance() {
    let h = Harness::new().await;
    let fleet = h.deploy("shrink", 3).await;
    let manager = &h.state.fleet_manager;

    let scaled = manager
        .scale_fleet(fleet.id, OWNER, ScaleDirection::Down, 1)
        .await
        .unwrap();
    assert_eq!(scaled.instance_count, 2);
    assert_eq!(h.state.fleet_store.running_instances(fleet.id).await.unwrap().len(), 2);

    let err = manager
        .scale_fleet(fleet.id, OWNER, ScaleDirection::Down, 2)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = manager
        .scale_fleet(fleet.id, OWNER, ScaleDirection::Up, 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let unchanged = h.state.fleet_store.get_fleet(fleet.id, OWNER).await.unwrap();
    assert_eq!(unchanged.status, FleetStatus::Active);
    assert_eq!(unchanged.instance_count, 2);
}

#[tokio::test]
async fn invalid_specs_are_rejected_without_side_effects() {
    let h = Harness::new().await;
    let manager = &h.state.fleet_manager;

    let err = manager.deploy_fleet(OWNER, spec("zero", 0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = manager.deploy_fleet(OWNER, spec("huge", 51)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let mut no_regions = spec("nowhere", 1);
    no_regions.regions.clear();
    let err = manager.deploy_fleet(OWNER, no_regions).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = manager
        .deploy_fleet(OWNER, spec("bad;name", 1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert!(h.state.fleet_store.list_fleets(OWNER).await.unwrap().is_empty());
    assert!(h.controller.commands().is_empty());
}

#[tokio::test]
async fn terminate_is_idempotent() {
    let h = Harness::new().await;
    let fleet = h.deploy("gone", 2).await;
    let manager = &h.state.fleet_manager;

    let first = manager.terminate_fleet(fleet.id, OWNER).await.unwrap();
    assert_eq!(first.status, FleetStatus::Terminated);
    let second = manager.terminate_fleet(fleet.id, OWNER).await.unwrap();
    assert_eq!(second.status, FleetStatus::Terminated);

    assert_eq!(h.controller.count_commands("axiom-rm"), 2);
    assert!(h.controller.instance_names().is_empty());
    let instances = h.state.fleet_store.list_instances(fleet.id).await.unwrap();
    assert_eq!(instances.len(), 2);
    assert!(instances.iter().all(|i| i.status == InstanceStatus::Terminated));
}

#[tokio::test]
async fn scaling_a_terminated_fleet_fails_and_leaves_it_unchanged() {
    let h = Harness::new().await;
    let fleet = h.deploy("done", 1).await;
    let manager = &h.state.fleet_manager;
    let terminated = manager.terminate_fleet(fleet.id, OWNER).await.unwrap();

    let err = manager
        .scale_fleet(fleet.id, OWNER, ScaleDirection::Up, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidState(_)));

    let after = h.state.fleet_store.get_fleet(fleet.id, OWNER).await.unwrap();
    assert_eq!(after, terminated);
}

#[tokio::test]
async fn other_owners_cannot_see_or_touch_a_fleet() {
    let h = Harness::new().await;
    let fleet = h.deploy("mine", 1).await;
    let manager = &h.state.fleet_manager;

    let err = h.state.fleet_store.get_fleet(fleet.id, OTHER_OWNER).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = manager
        .scale_fleet(fleet.id, OTHER_OWNER, ScaleDirection::Up, 1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = manager.terminate_fleet(fleet.id, OTHER_OWNER).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = manager
        .execute_on_fleet(fleet.id, OTHER_OWNER, "id")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert!(h.state.fleet_store.list_fleets(OTHER_OWNER).await.unwrap().is_empty());
    assert_eq!(
        h.state.fleet_store.get_fleet(fleet.id, OWNER).await.unwrap().status,
        FleetStatus::Active
    );
}

#[tokio::test]
async fn remote_failure_moves_fleet_to_error() {
    let h = Harness::new().await;
    h.controller.fail_program("axiom-fleet", 1, "quota exceeded");

    let err = h
        .state
        .fleet_manager
        .deploy_fleet(OWNER, spec("broken", 2))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Execution { exit_status: 1, .. }));

    let fleets = h.state.fleet_store.list_fleets(OWNER).await.unwrap();
    assert_eq!(fleets.len(), 1);
    let fleet = &fleets[0].fleet;
    assert_eq!(fleet.status, FleetStatus::Error);
    assert!(fleet.last_error.as_deref().unwrap_or_default().contains("quota exceeded"));

    // An errored fleet can still be torn down.
    h.controller.clear_failures();
    let terminated = h.state.fleet_manager.terminate_fleet(fleet.id, OWNER).await.unwrap();
    assert_eq!(terminated.status, FleetStatus::Terminated);
}

#[tokio::test]
async fn unreachable_controller_moves_fleet_to_error() {
    let h = Harness::new().await;
    h.controller.fail_connect(true);

    let err = h
        .state
        .fleet_manager
        .deploy_fleet(OWNER, spec("offline", 1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);

    let fleets = h.state.fleet_store.list_fleets(OWNER).await.unwrap();
    assert_eq!(fleets[0].fleet.status, FleetStatus::Error);
    assert_eq!(h.controller.open_sessions(), 0);
}

#[tokio::test]
async fn timeout_restores_previous_status() {
    let mut config = test_config();
    config.controller.provision_timeout_secs = 1;
    let h = Harness::with_config(config).await;
    let manager = &h.state.fleet_manager;

    h.controller.set_latency(Duration::from_millis(1500));
    let err = manager.deploy_fleet(OWNER, spec("slow", 1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let fleet = h.state.fleet_store.list_fleets(OWNER).await.unwrap()[0].fleet.clone();
    assert_eq!(fleet.status, FleetStatus::Pending);

    // Retry once the controller is responsive again.
    h.controller.set_latency(Duration::ZERO);
    let fleet = manager.provision_fleet(fleet.id, OWNER).await.unwrap();
    assert_eq!(fleet.status, FleetStatus::Active);

    h.controller.set_latency(Duration::from_millis(1500));
    let err = manager
        .scale_fleet(fleet.id, OWNER, ScaleDirection::Up, 1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    let after = h.state.fleet_store.get_fleet(fleet.id, OWNER).await.unwrap();
    assert_eq!(after.status, FleetStatus::Active);
    assert_eq!(after.instance_count, 1);
}

#[tokio::test]
async fn provision_requires_a_pending_fleet() {
    let h = Harness::new().await;
    let fleet = h.deploy("twice", 1).await;
    let err = h
        .state
        .fleet_manager
        .provision_fleet(fleet.id, OWNER)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn execute_reports_each_instance() {
    let h = Harness::new().await;
    let fleet = h.deploy("exec", 3).await;
    let instances = h.state.fleet_store.running_instances(fleet.id).await.unwrap();
    h.controller.fail_instance(&instances[1].name);

    let report = h
        .state
        .fleet_manager
        .execute_on_fleet(fleet.id, OWNER, "uptime")
        .await
        .unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.results.len(), 3);

    let failed = report.results.iter().find(|r| !r.success).unwrap();
    assert_eq!(failed.instance, instances[1].name);
    assert_eq!(failed.error_kind, Some(ErrorKind::Execution));

    let ok = report.results.iter().find(|r| r.instance == instances[0].name).unwrap();
    assert!(ok.output.as_deref().unwrap().contains("uptime"));

    let err = h
        .state
        .fleet_manager
        .execute_on_fleet(fleet.id, OWNER, "   ")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn reconcile_detects_drift() {
    let h = Harness::new().await;
    let fleet = h.deploy("drift", 2).await;
    let manager = &h.state.fleet_manager;
    let prefix = fleet.remote_name();

    let report = manager.reconcile_fleet(fleet.id, OWNER).await.unwrap();
    assert!(report.is_clean());

    let vanished = format!("{prefix}01");
    assert!(h.controller.remove_instance(&vanished));
    let stray = format!("{prefix}07");
    h.controller.insert_instance(&stray, "nyc1");

    let report = manager.reconcile_fleet(fleet.id, OWNER).await.unwrap();
    assert_eq!(report.marked_unreachable, vec![vanished.clone()]);
    assert_eq!(report.discovered, vec![stray.clone()]);
    assert_eq!(report.fleet_status, Some(FleetStatus::Active));

    h.controller.remove_instance(&format!("{prefix}02"));
    h.controller.remove_instance(&stray);
    let report = manager.reconcile_fleet(fleet.id, OWNER).await.unwrap();
    assert!(report.drift_detected);
    assert_eq!(report.fleet_status, Some(FleetStatus::Error));

    let fleet = h.state.fleet_store.get_fleet(fleet.id, OWNER).await.unwrap();
    assert_eq!(fleet.status, FleetStatus::Error);
    assert!(fleet.last_error.unwrap().contains("drift"));
    let instances = h.state.fleet_store.list_instances(fleet.id).await.unwrap();
    assert!(instances.iter().all(|i| i.status == InstanceStatus::Unreachable));
}

#[tokio::test]
async fn reconcile_reports_orphans_of_terminated_fleets() {
    let h = Harness::new().await;
    let fleet = h.deploy("orphan", 1).await;
    let manager = &h.state.fleet_manager;
    manager.terminate_fleet(fleet.id, OWNER).await.unwrap();

    let leftover = format!("{}01", fleet.remote_name());
    h.controller.insert_instance(&leftover, "nyc1");

    let report = manager.reconcile_fleet(fleet.id, OWNER).await.unwrap();
    assert_eq!(report.fleet_status, Some(FleetStatus::Terminated));
    assert_eq!(report.orphaned, vec![leftover]);
    assert_eq!(
        h.state.fleet_store.get_fleet(fleet.id, OWNER).await.unwrap().status,
        FleetStatus::Terminated
    );
}

#[tokio::test]
async fn reconcile_all_covers_every_idle_fleet() {
    let h = Harness::new().await;
    let a = h.deploy("alpha", 1).await;
    let b = h.deploy("bravo", 2).await;
    h.controller.remove_instance(&format!("{}02", b.remote_name()));

    let reports = h.state.fleet_manager.reconcile_all().await.unwrap();
    assert_eq!(reports.len(), 2);
    let report_a = reports.iter().find(|r| r.fleet_id == a.id).unwrap();
    assert!(report_a.is_clean());
    let report_b = reports.iter().find(|r| r.fleet_id == b.id).unwrap();
    assert_eq!(report_b.marked_unreachable.len(), 1);
}

#[tokio::test]
async fn controller_health_follows_connectivity() {
    let h = Harness::new().await;
    h.deploy("health", 2).await;

    let health = h.state.fleet_manager.controller_health().await;
    assert!(health.healthy);
    assert_eq!(health.instances, 2);

    h.controller.fail_connect(true);
    let health = h.state.fleet_manager.controller_health().await;
    assert!(!health.healthy);
    assert!(health.error.is_some());
}

#[tokio::test]
async fn operations_on_one_fleet_are_serialised() {
    let h = Harness::new().await;
    let fleet = h.deploy("race", 2).await;
    h.controller.set_latency(Duration::from_millis(50));
    let manager = &h.state.fleet_manager;

    let (scaled, terminated) = tokio::join!(
        manager.scale_fleet(fleet.id, OWNER, ScaleDirection::Up, 1),
        manager.terminate_fleet(fleet.id, OWNER),
    );
    assert_eq!(terminated.unwrap().status, FleetStatus::Terminated);
    if let Err(e) = scaled {
        assert_eq!(e.kind(), ErrorKind::InvalidState);
    }
    let after = h.state.fleet_store.get_fleet(fleet.id, OWNER).await.unwrap();
    assert_eq!(after.status, FleetStatus::Terminated);
    assert!(h.controller.instance_names().is_empty());
}

fn slow_job(fleet_id: uuid::Uuid) -> DispatchRequest {
    DispatchRequest {
        kind: JobKind::Scan,
        name: "slow".to_string(),
        fleet_id: Some(fleet_id),
        targets: vec!["a.example".to_string(), "b.example".to_string()],
        tool: "nmap".to_string(),
        strategy: DistributionStrategy::RoundRobin,
        rate_limit: 10,
        designated_instance: None,
    }
}

#[tokio::test]
async fn terminate_rejects_fleets_with_running_jobs() {
    let h = Harness::new().await;
    let fleet = h.deploy("busy", 2).await;

    let (job, handle) = h.state.dispatcher.distribute(OWNER, slow_job(fleet.id)).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    h.controller.set_latency(Duration::from_millis(800));

    let err = h.state.fleet_manager.terminate_fleet(fleet.id, OWNER).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(
        h.state.fleet_store.get_fleet(fleet.id, OWNER).await.unwrap().status,
        FleetStatus::Active
    );

    handle.wait().await;
    h.controller.set_latency(Duration::ZERO);
    let terminated = h.state.fleet_manager.terminate_fleet(fleet.id, OWNER).await.unwrap();
    assert_eq!(terminated.status, FleetStatus::Terminated);
}

#[tokio::test]
async fn terminate_can_stop_running_jobs_first() {
    let mut config = test_config();
    config.fleet.terminate_with_running_jobs = TerminatePolicy::Stop;
    let h = Harness::with_config(config).await;
    let fleet = h.deploy("cascade", 2).await;

    let (job, handle) = h.state.dispatcher.distribute(OWNER, slow_job(fleet.id)).await.unwrap();
    h.controller.set_latency(Duration::from_millis(800));

    let terminated = h.state.fleet_manager.terminate_fleet(fleet.id, OWNER).await.unwrap();
    assert_eq!(terminated.status, FleetStatus::Terminated);

    handle.wait().await;
    let job = h.state.job_tracker.get_job(job.id, OWNER).await.unwrap();
    assert_eq!(job.status, JobStatus::Stopped);
}

#[tokio::test]
async fn terminate_spares_fleets_with_lookalike_names() {
    let h = Harness::new().await;
    let web = h.deploy("web", 1).await;
    let lookalike = h
        .state
        .fleet_manager
        .deploy_fleet(OTHER_OWNER, spec(&format!("{}x", web.remote_name()), 2))
        .await
        .unwrap();
    assert!(lookalike.remote_name().starts_with(&web.remote_name()));
    assert_eq!(h.controller.instance_names().len(), 3);

    h.state.fleet_manager.terminate_fleet(web.id, OWNER).await.unwrap();

    let survivors = h.controller.instance_names();
    assert_eq!(survivors.len(), 2);
    assert!(survivors.iter().all(|n| n.starts_with(&lookalike.remote_name())));
    assert_eq!(h.controller.count_commands("axiom-rm"), 1);
    let other = h.state.fleet_store.get_fleet(lookalike.id, OTHER_OWNER).await.unwrap();
    assert_eq!(other.status, FleetStatus::Active);
    assert_eq!(h.state.fleet_store.running_instances(lookalike.id).await.unwrap().len(), 2);

    let err = h
        .state
        .fleet_manager
        .deploy_fleet(OTHER_OWNER, spec(&web.remote_name(), 1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn errored_fleet_recovers_once_instances_run() {
    let h = Harness::new().await;
    h.controller.fail_program("axiom-ls", 1, "listing unavailable");
    let err = h
        .state
        .fleet_manager
        .deploy_fleet(OWNER, spec("flaky", 2))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    let fleet = h.state.fleet_store.list_fleets(OWNER).await.unwrap()[0].fleet.clone();
    assert_eq!(fleet.status, FleetStatus::Error);

    h.controller.clear_failures();
    let report = h.state.fleet_manager.reconcile_fleet(fleet.id, OWNER).await.unwrap();
    assert!(report.recovered);
    assert_eq!(report.discovered.len(), 2);
    assert_eq!(report.fleet_status, Some(FleetStatus::Active));

    let fleet = h.state.fleet_store.get_fleet(fleet.id, OWNER).await.unwrap();
    assert_eq!(fleet.status, FleetStatus::Active);
    assert_eq!(fleet.last_error, None);

    let scaled = h
        .state
        .fleet_manager
        .scale_fleet(fleet.id, OWNER, ScaleDirection::Up, 1)
        .await
        .unwrap();
    assert_eq!(scaled.instance_count, 3);
}

#[tokio::test]
async fn store_failure_after_provisioning_parks_fleet_in_error() {
    use sea_orm::ConnectionTrait;

    let h = Harness::new().await;
    let fleet = h.state.fleet_store.create_fleet(OWNER, spec("brittle", 1)).await.unwrap();
    h.db.execute_unprepared("DROP TABLE instances").await.unwrap();

    let err = h
        .state
        .fleet_manager
        .provision_fleet(fleet.id, OWNER)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Database);

    let fleet = h.state.fleet_store.get_fleet(fleet.id, OWNER).await.unwrap();
    assert_eq!(fleet.status, FleetStatus::Error);
    assert!(fleet.last_error.is_some());
}
