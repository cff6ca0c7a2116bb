use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use eternal_scan::auth::UserStore;
use eternal_scan::config::ScannerConfig;
use eternal_scan::country::StaticResolver;
use eternal_scan::inventory::Inventory;
use eternal_scan::probe::{ProbeOutcome, Prober};
use eternal_scan::scanner::Scanner;
use eternal_scan::server::{router, AppState};
use eternal_scan::types::{Device, ProbeTarget};

const TOKEN: &str = "s3cret";

/// Never answers within a test's lifetime, so started scans stay running.
struct SlowProber;

#[async_trait]
impl Prober for SlowProber {
    async fn probe(&self, _target: ProbeTarget, _timeout: Duration) -> ProbeOutcome {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        ProbeOutcome::closed()
    }
}

fn app(ui_dir: &Path) -> (Router, Scanner) {
    let scanner = Scanner::new(
        ScannerConfig::default(),
        Arc::new(SlowProber),
        Arc::new(StaticResolver::new().with_country("DE", &["192.0.2.0/24"])),
        Arc::new(Inventory::new()),
    );
    let users = UserStore::from_specs(&[format!("admin:{TOKEN}")]).unwrap();
    (router(AppState::new(scanner.clone(), users), ui_dir), scanner)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn api_requires_a_token() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(dir.path());

    let req = Request::builder().uri("/api/status").body(Body::empty()).unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], json!(false));

    let req = Request::builder()
        .uri("/api/status")
        .header(header::AUTHORIZATION, "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, req).await.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn status_when_idle() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(dir.path());

    let (status, body) = send(&app, get("/api/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_scanning"], json!(false));
    assert_eq!(body["is_paused"], json!(false));
    assert_eq!(body["state"], json!("idle"));
    assert_eq!(body["total_devices"], json!(0));

    let resp = app.clone().oneshot(get("/api/status")).await.unwrap();
    assert_eq!(resp.headers()[header::CACHE_CONTROL], "no-store");
}

#[tokio::test]
async fn scan_control_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(dir.path());

    let request = json!({
        "scan_type": "range",
        "ip_range": "10.0.0.0/30",
        "port_range": "22,80",
        "speed": "fast"
    });
    let (status, body) = send(&app, post_json("/api/scan", request.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["total_targets"], json!(8));

    let (status, body) = send(&app, post_json("/api/scan", request)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], json!(false));

    assert_eq!(send(&app, post_json("/api/scan/resume", json!({}))).await.0, StatusCode::CONFLICT);
    assert_eq!(send(&app, post_json("/api/scan/pause", json!({}))).await.0, StatusCode::OK);

    let (_, body) = send(&app, get("/api/status")).await;
    assert_eq!(body["is_paused"], json!(true));
    assert_eq!(body["total_targets"], json!(8));

    let (status, body) = send(&app, post_json("/api/scan/stop", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(send(&app, post_json("/api/scan/stop", json!({}))).await.0, StatusCode::CONFLICT);

    let (_, body) = send(&app, get("/api/status")).await;
    assert_eq!(body["is_scanning"], json!(false));
    assert_eq!(body["status"], json!("Scan stopped"));
}

#[tokio::test]
async fn bad_scan_request_is_a_400() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(dir.path());

    let (status, body) = send(
        &app,
        post_json("/api/scan", json!({"ip_range": "10.0.0.0/30\nbogus", "port_range": "80"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("line 2"));

    let (status, _) = send(
        &app,
        post_json("/api/scan", json!({"scan_type": "country", "country_codes": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_bodies_get_json_errors() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(dir.path());

    let (status, body) = send(&app, post_json("/api/scan", json!({"ip_range": "10.0.0.1", "scan_type": "bogus"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));
    assert!(body["message"].as_str().unwrap().contains("scan_type"));

    let (status, body) = send(&app, post_json("/api/scan/device", json!({"ip": "not-an-ip", "port": 80}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));
    assert!(body["message"].is_string());

    let req = Request::builder()
        .method("POST")
        .uri("/api/preview")
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"ranges\": "))
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn unknown_speed_scans_at_normal() {
    let dir = tempfile::tempdir().unwrap();
    let (app, scanner) = app(dir.path());

    let request = json!({"ip_range": "10.0.0.1", "port_range": "80", "speed": "turbo"});
    let (status, body) = send(&app, post_json("/api/scan", request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));

    let (_, body) = send(&app, get("/api/status")).await;
    assert_eq!(body["state"], json!("scanning"));
    scanner.stop().await.unwrap();
}

#[tokio::test]
async fn preview_accepts_list_or_text() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(dir.path());

    let (status, body) = send(
        &app,
        post_json("/api/preview", json!({"ranges": ["10.0.0.0/24"], "exclude_ranges": "10.0.0.0/25"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_ips"], json!(128));
    assert_eq!(body["range_count"], json!(1));
    assert_eq!(body["capped"], json!(false));

    let (status, body) = send(&app, post_json("/api/preview", json!({"ranges": "10.0.0.1\n10.0.0.2"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_ips"], json!(2));
}

#[tokio::test]
async fn devices_and_export() {
    let dir = tempfile::tempdir().unwrap();
    let (app, scanner) = app(dir.path());
    let inv = scanner.inventory();
    for (last, port) in [(1u8, 22u16), (2, 80), (3, 80)] {
        let target = ProbeTarget::new([10, 0, 0, last].into(), port);
        inv.upsert(Device::new(target, b"hello".to_vec())).await;
    }

    let (status, body) = send(&app, get("/api/devices?port=80&sort=ip")).await;
    assert_eq!(status, StatusCode::OK);
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["ip"], json!("10.0.0.2"));
    assert_eq!(rows[0]["banner"], json!("hello"));

    let (status, body) = send(&app, get("/api/devices?limit=1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    assert_eq!(send(&app, get("/api/devices?port=http")).await.0, StatusCode::BAD_REQUEST);

    let (_, body) = send(&app, get("/api/search?query=10.0.0.1&per_page=10")).await;
    assert_eq!(body["pagination"]["total_items"], json!(1));

    let resp = app.clone().oneshot(get("/api/export?format=csv")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()[header::CONTENT_TYPE],
        "text/csv; charset=utf-8"
    );
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.starts_with("IP,Port,Banner,Timestamp\r\n"));
    assert_eq!(text.lines().count(), 4);

    assert_eq!(send(&app, get("/api/export?format=xml")).await.0, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn countries_and_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(dir.path());

    let (status, body) = send(&app, get("/api/countries")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body
        .as_array()
        .unwrap()
        .iter()
        .any(|c| c["code"] == json!("DE")));

    let (status, body) = send(&app, get("/api/country/de/ranges")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(["192.0.2.0/24"]));

    assert_eq!(send(&app, get("/api/country/XX/ranges")).await.0, StatusCode::BAD_REQUEST);
    // known code that the resolver cannot answer
    assert_eq!(send(&app, get("/api/country/FR/ranges")).await.0, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn history_endpoints_paginate() {
    let dir = tempfile::tempdir().unwrap();
    let (app, scanner) = app(dir.path());
    for n in 0..3 {
        scanner.inventory().record_sample(n).await;
    }

    let (status, body) = send(&app, get("/api/history?page=1&per_page=2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
    assert_eq!(body["items"][0]["devices_found"], json!(2));
    assert_eq!(body["pagination"]["total_pages"], json!(2));

    let (status, body) = send(&app, get("/api/scan/history")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn login_sets_cookie_and_identifies_user() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(dir.path());

    let login = |token: &str| {
        Request::builder()
            .method("POST")
            .uri("/api/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"username": "admin", "token": token}).to_string()))
            .unwrap()
    };

    assert_eq!(send(&app, login("nope")).await.0, StatusCode::UNAUTHORIZED);

    let resp = app.clone().oneshot(login(TOKEN)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let cookie = resp.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
    assert!(cookie.starts_with(&format!("token={TOKEN};")));

    let req = Request::builder()
        .uri("/api/users/current")
        .header(header::COOKIE, format!("token={TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], json!("admin"));

    let req = Request::builder()
        .method("POST")
        .uri("/api/logout")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()[header::SET_COOKIE].to_str().unwrap().contains("Max-Age=0"));
}

#[tokio::test]
async fn rescan_endpoint_validates_port() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(dir.path());

    let (status, _) = send(&app, post_json("/api/scan/device", json!({"ip": "10.0.0.1", "port": 0}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, post_json("/api/scan/device", json!({"ip": "10.0.0.1", "port": 22}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
}

#[tokio::test]
async fn static_ui_is_served_without_auth() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>eternal-scan</h1>").unwrap();
    let (app, _) = app(dir.path());

    let resp = app
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"<h1>eternal-scan</h1>");
}
