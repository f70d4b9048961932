#![cfg(unix)]

use alert_exec::{
    config::Config,
    metrics::Metrics,
    server::{Server, MAX_BODY_BYTES, TOKEN_HEADER},
};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum_test::TestServer;
use serde_json::{json, Value};
use std::time::Duration;

fn alert_payload() -> Value {
    json!({
        "version": "4",
        "groupKey": "{}:{alertname=\"InstanceDown\"}",
        "truncatedAlerts": 0,
        "status": "firing",
        "receiver": "exec",
        "groupLabels": { "alertname": "InstanceDown" },
        "commonLabels": { "alertname": "InstanceDown", "severity": "critical" },
        "commonAnnotations": {},
        "externalURL": "http://alertmanager:9093",
        "alerts": [{
            "status": "firing",
            "labels": { "alertname": "InstanceDown", "instance": "web-1" },
            "annotations": { "summary": "web-1 is down" },
            "startsAt": "2024-05-01T10:00:00Z",
            "endsAt": "0001-01-01T00:00:00Z",
            "generatorURL": "http://prometheus:9090/graph",
            "fingerprint": "1a2b3c"
        }]
    })
}

fn shell_config(script: &str) -> Config {
    Config {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

fn test_server(config: Config) -> TestServer {
    let server = Server::new(config, Metrics::new().unwrap());
    TestServer::new(server.build_router()).unwrap()
}

fn token_header() -> HeaderName {
    HeaderName::from_static(TOKEN_HEADER)
}

#[tokio::test]
async fn test_health_endpoint() {
    let client = test_server(Config::default());

    let response = client.get("/healthz").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "ok");

    let response = client.method(Method::HEAD, "/healthz").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let response = client.post("/healthz").await;
    assert_eq!(response.status_code(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_alert_requires_post() {
    let client = test_server(Config::default());

    let response = client.get("/alert").await;
    assert_eq!(response.status_code(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_successful_command() {
    let client = test_server(shell_config("exit 0"));

    let response = client.post("/alert").json(&alert_payload()).await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body, json!({ "status": "ok", "exit_code": 0, "timed_out": false }));
}

#[tokio::test]
async fn test_templated_arguments_reach_command() {
    // The script fails unless the rendered arguments match the payload
    let mut config = shell_config(r#"test "$1" = firing && test "$2" = web-1"#);
    config.args.push("alert-exec".to_string());
    config.args.push("{{ .Status }}".to_string());
    config.args.push("{{ .Alerts.0.Labels.instance }}".to_string());
    let client = test_server(config);

    let response = client.post("/alert").json(&alert_payload()).await;

    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_missing_label_still_runs_command() {
    let mut config = shell_config(r#"test "$1" = "<no value>""#);
    config.args.push("alert-exec".to_string());
    config.args.push("{{ .CommonLabels.team }}".to_string());
    let client = test_server(config);

    let response = client.post("/alert").json(&alert_payload()).await;

    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_failing_command_returns_503() {
    let client = test_server(shell_config("echo 'disk is full' >&2; echo more >&2; exit 7"));

    let response = client.post("/alert").json(&alert_payload()).await;

    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(body["status"], "error");
    assert_eq!(body["exit_code"], 7);
    assert_eq!(body["timed_out"], false);
    assert_eq!(body["message"], "disk is full");
}

#[tokio::test]
async fn test_timed_out_command_returns_503() {
    let mut config = shell_config("sleep 5");
    config.timeout = Duration::from_millis(100);
    let client = test_server(config);

    let response = client.post("/alert").json(&alert_payload()).await;

    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(body["status"], "error");
    assert_eq!(body["timed_out"], true);
    assert_eq!(body["exit_code"], -1);
    assert_eq!(body["message"], "command timed out after 100ms");
}

#[tokio::test]
async fn test_missing_command_returns_503() {
    let mut config = Config::default();
    config.command = "/nonexistent/alert-exec-hook".to_string();
    let client = test_server(config);

    let response = client.post("/alert").json(&alert_payload()).await;

    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(body["exit_code"], -1);
    assert_eq!(body["timed_out"], false);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .starts_with("failed to start command"));
}

#[tokio::test]
async fn test_token_is_enforced() {
    let mut config = shell_config("exit 0");
    config.token = "s3cret".to_string();
    let client = test_server(config);

    let response = client.post("/alert").json(&alert_payload()).await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.text(), "unauthorized");

    let response = client
        .post("/alert")
        .add_header(token_header(), HeaderValue::from_static("wrong"))
        .json(&alert_payload())
        .await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);

    let response = client
        .post("/alert")
        .add_header(token_header(), HeaderValue::from_static("s3cret"))
        .json(&alert_payload())
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_invalid_bodies_never_run_command() {
    // Any invocation of this command would leave a 503 behind
    let client = test_server(shell_config("exit 1"));

    let response = client.post("/alert").text("{not json").await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(response.text(), "invalid JSON");

    let mut missing_status = alert_payload();
    missing_status.as_object_mut().unwrap().remove("status");
    let response = client.post("/alert").json(&missing_status).await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(response.text(), "invalid payload");

    let mut no_alerts = alert_payload();
    no_alerts["alerts"] = json!([]);
    let response = client.post("/alert").json(&no_alerts).await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(response.text(), "invalid payload");
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let client = test_server(shell_config("exit 0"));

    let response = client.post("/alert").text("x".repeat(MAX_BODY_BYTES + 1)).await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(response.text(), "bad request");
}

#[tokio::test]
async fn test_template_error_returns_500() {
    let mut config = shell_config("exit 0");
    config.args.push("{{ .Status".to_string());
    let client = test_server(config);

    let response = client.post("/alert").json(&alert_payload()).await;

    assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.text(), "template error");
}

#[tokio::test]
async fn test_metrics_track_outcomes() {
    let client = test_server(shell_config("exit 0"));

    client.post("/alert").json(&alert_payload()).await;
    client.post("/alert").text("nope").await;

    let response = client.get("/metrics").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let text = response.text();
    assert!(text.contains(r#"alert_exec_requests_total{outcome="ok"} 1"#));
    assert!(text.contains(r#"alert_exec_requests_total{outcome="bad_request"} 1"#));
    assert!(text.contains(r#"alert_exec_executions_total{result="success"} 1"#));
}
