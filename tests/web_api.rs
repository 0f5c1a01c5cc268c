mod common;

use atlas_fleet::web::create_axum_router;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use common::Harness;
use serde_json::{Value, json};
use tower::ServiceExt;

async fn send(app: &Router, method: &str, uri: &str, owner: Option<&str>, body: Option<Value>) -> (StatusCode, Vec<u8>, header::HeaderMap) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(owner) = owner {
        builder = builder.header("x-owner-id", owner);
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec(), headers)
}

fn json_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

fn fleet_request(name: &str, count: i32) -> Value {
    json!({
        "name": name,
        "provider": "digitalocean",
        "instance_type": "s-1vcpu-1gb",
        "instance_count": count,
        "regions": ["nyc1"]
    })
}

#[tokio::test]
async fn health_endpoints_are_public() {
    let h = Harness::new().await;
    let app = create_axum_router(h.state.clone());

    let (status, body, _) = send(&app, "GET", "/api/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");

    let (status, body, _) = send(&app, "GET", "/api/controller/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["healthy"], true);
}

#[tokio::test]
async fn requests_without_owner_are_unauthorized() {
    let h = Harness::new().await;
    let app = create_axum_router(h.state.clone());

    let (status, _, _) = send(&app, "GET", "/api/fleets", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, body, _) = send(&app, "GET", "/api/jobs", Some("not-a-number"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(&body)["kind"], "unauthorized");
}

#[tokio::test]
async fn fleet_lifecycle_over_http() {
    let h = Harness::new().await;
    let app = create_axum_router(h.state.clone());

    let (status, body, _) = send(&app, "POST", "/api/fleets", Some("1"), Some(fleet_request("web", 2))).await;
    assert_eq!(status, StatusCode::CREATED);
    let fleet = json_body(&body);
    assert_eq!(fleet["status"], "active");
    let id = fleet["id"].as_str().unwrap().to_string();

    let (status, body, _) = send(&app, "GET", "/api/fleets", Some("1"), None).await;
    assert_eq!(status, StatusCode::OK);
    let fleets = json_body(&body);
    assert_eq!(fleets[0]["running_instances"], 2);

    let (status, body, _) = send(&app, "GET", &format!("/api/fleets/{id}"), Some("1"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["instances"].as_array().unwrap().len(), 2);

    let (status, _, _) = send(&app, "GET", &format!("/api/fleets/{id}"), Some("2"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body, _) = send(
        &app,
        "POST",
        &format!("/api/fleets/{id}/scale"),
        Some("1"),
        Some(json!({"direction": "up", "count": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["instance_count"], 3);

    let (status, body, _) = send(
        &app,
        "POST",
        &format!("/api/fleets/{id}/execute"),
        Some("1"),
        Some(json!({"command": "whoami"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["succeeded"], 3);

    let (status, body, _) = send(&app, "POST", &format!("/api/fleets/{id}/reconcile"), Some("1"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["drift_detected"], false);

    let (status, body, _) = send(&app, "DELETE", &format!("/api/fleets/{id}"), Some("1"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["status"], "terminated");

    let (status, body, _) = send(
        &app,
        "POST",
        &format!("/api/fleets/{id}/scale"),
        Some("1"),
        Some(json!({"direction": "up", "count": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json_body(&body)["kind"], "invalid_state_error");
}

#[tokio::test]
async fn remote_failures_map_to_gateway_errors() {
    let h = Harness::new().await;
    let app = create_axum_router(h.state.clone());
    h.controller.fail_program("axiom-fleet", 1, "provider rejected request");

    let (status, body, _) = send(&app, "POST", "/api/fleets", Some("1"), Some(fleet_request("bad", 1))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let body = json_body(&body);
    assert_eq!(body["kind"], "execution_error");
    assert!(body["error"].as_str().unwrap().contains("provider rejected request"));

    let (status, _, _) = send(&app, "POST", "/api/fleets", Some("1"), Some(fleet_request("zero", 0))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn jobs_over_http() {
    let h = Harness::new().await;
    let app = create_axum_router(h.state.clone());
    let fleet = h.deploy("jobs", 2).await;

    let (status, body, _) = send(
        &app,
        "POST",
        "/api/jobs",
        Some("1"),
        Some(json!({
            "name": "sweep",
            "fleet_id": fleet.id,
            "targets": ["a.example", "b.example"],
            "tool": "httpx",
            "rate_limit": 20
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let job = json_body(&body);
    assert_eq!(job["status"], "running");
    assert_eq!(job["strategy"], "round-robin");
    let id = job["id"].as_str().unwrap().to_string();

    // Poll until the background work has finished.
    let mut finished = None;
    for _ in 0..50 {
        let (_, body, _) = send(&app, "GET", &format!("/api/jobs/{id}"), Some("1"), None).await;
        let job = json_body(&body);
        if job["status"] != "running" {
            finished = Some(job);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    let job = finished.expect("job finished");
    assert_eq!(job["status"], "completed");
    assert_eq!(job["percent_complete"], 100);

    let (status, body, _) = send(&app, "GET", &format!("/api/jobs/{id}/findings"), Some("1"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body).as_array().unwrap().len(), 2);

    let late = json!({ "target": "c.example", "status": "open" });
    let (status, body, _) = send(&app, "POST", &format!("/api/jobs/{id}/findings"), Some("1"), Some(late)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json_body(&body)["payload"]["target"], "c.example");
    let (_, body, _) = send(&app, "GET", &format!("/api/jobs/{id}/findings"), Some("1"), None).await;
    assert_eq!(json_body(&body).as_array().unwrap().len(), 3);
    let (status, _, _) = send(&app, "POST", &format!("/api/jobs/{id}/findings"), Some("1"), Some(json!(["not", "an", "object"]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _, _) = send(&app, "POST", &format!("/api/jobs/{id}/findings"), Some("2"), Some(json!({ "target": "x" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body, headers) = send(&app, "GET", &format!("/api/jobs/{id}/export/csv"), Some("1"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "text/csv; charset=utf-8");
    assert!(headers[header::CONTENT_DISPOSITION].to_str().unwrap().starts_with("attachment;"));
    assert!(String::from_utf8(body).unwrap().starts_with("finding_id,job_id,created_at"));

    let (status, body, _) = send(&app, "GET", &format!("/api/jobs/{id}/export/xml"), Some("1"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body)["kind"], "unsupported_format_error");

    let (status, _, _) = send(&app, "POST", &format!("/api/jobs/{id}/stop"), Some("1"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body, _) = send(&app, "GET", "/api/jobs?kind=scan", Some("1"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body).as_array().unwrap().len(), 1);

    let (status, body, _) = send(&app, "GET", "/api/jobs/active", Some("1"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json_body(&body).as_array().unwrap().is_empty());

    let (status, _, _) = send(&app, "GET", &format!("/api/jobs/{id}"), Some("2"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
