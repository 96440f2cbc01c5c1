mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{eventually, readiness_stub, supervisor, test_config, FakeOcis};
use ociswrapper::http_server::router;
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

async fn call(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn envelope(status: &str, message: &str) -> Value {
    json!({"status": status, "message": message})
}

#[tokio::test]
async fn command_returns_output_and_exit_code() {
    let ocis = FakeOcis::healthy();
    let (supervisor, _logs) = supervisor(test_config(&ocis.bin, "http://127.0.0.1:1", 5));
    let app = router(supervisor);

    let (status, body) = call(&app, "POST", "/command", r#"{"command":"list","inputs":[]}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "OK", "message": "a\nb\n", "exitCode": 0}));

    let (status, body) = call(&app, "POST", "/command", r#"{"command":"bogus"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ERROR");
    assert_eq!(body["exitCode"], 1);
}

#[tokio::test]
async fn command_rejects_malformed_bodies() {
    let ocis = FakeOcis::healthy();
    let (supervisor, _logs) = supervisor(test_config(&ocis.bin, "http://127.0.0.1:1", 5));
    let app = router(supervisor);

    let (status, body) = call(&app, "POST", "/command", r#"{"inputs":[]}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, envelope("ERROR", "Command is missing"));

    let (status, body) = call(&app, "POST", "/command", "{oops").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, envelope("ERROR", "Invalid json body"));

    let (status, body) = call(&app, "POST", "/command", r#"{"command":"list","inputs":[1]}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, envelope("ERROR", "Invalid input data. Expected string"));

    let (status, _) = call(&app, "GET", "/command", "").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn start_conflict_and_stop() {
    let ocis = FakeOcis::healthy();
    let url = readiness_stub().await;
    let (supervisor, _logs) = supervisor(test_config(&ocis.bin, &url, 5));
    let app = router(supervisor.clone());

    let (status, body) = call(&app, "POST", "/ocis/start", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, envelope("OK", "oCIS server is up and running"));

    let (status, body) = call(&app, "POST", "/start", "").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body, envelope("ERROR", "oCIS server is already running"));

    let (status, body) = call(&app, "GET", "/health", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, envelope("OK", "oCIS server is running"));

    let (status, body) = call(&app, "POST", "/ocis/stop", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, envelope("OK", "oCIS server stopped successfully"));
    assert!(supervisor.tracked().await.is_empty());
}

#[tokio::test]
async fn service_runs_separately_from_parent() {
    let ocis = FakeOcis::healthy();
    let fake = &ocis;
    let url = readiness_stub().await;
    let (supervisor, _logs) = supervisor(test_config(&ocis.bin, &url, 5));
    let app = router(supervisor.clone());

    let (status, body) = call(&app, "POST", "/services/foo", r#"{"X":"1"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, envelope("OK", "oCIS service foo started successfully"));

    assert!(eventually(Duration::from_secs(5), || async move { fake.launches().len() == 2 }).await);
    assert_eq!(
        ocis.launches(),
        vec!["server X= EXCLUDE=foo", "foo server X=1 EXCLUDE="]
    );
    let names: Vec<String> = supervisor.tracked().await.into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["", "foo"]);
    // The exclusion is transient and never becomes a configured override.
    assert!(supervisor.env_overrides().await.is_empty());

    let (status, body) = call(&app, "DELETE", "/services/foo", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, envelope("OK", "oCIS service foo stopped successfully"));

    let (status, body) = call(&app, "DELETE", "/services/foo", "").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, envelope("ERROR", "Service foo is not running"));

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn service_body_must_be_json_object() {
    let ocis = FakeOcis::healthy();
    let (supervisor, _logs) = supervisor(test_config(&ocis.bin, "http://127.0.0.1:1", 5));
    let app = router(supervisor);

    let (status, body) = call(&app, "POST", "/services/foo", "not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, envelope("ERROR", "Invalid json body"));
    assert!(ocis.launches().is_empty());
}

#[tokio::test]
async fn empty_service_name_is_unprocessable() {
    let ocis = FakeOcis::healthy();
    let (supervisor, _logs) = supervisor(test_config(&ocis.bin, "http://127.0.0.1:1", 5));
    let app = router(supervisor);

    for (method, uri) in [("POST", "/services/"), ("DELETE", "/services"), ("DELETE", "/services/")] {
        let (status, body) = call(&app, method, uri, "").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{} {}", method, uri);
        assert_eq!(body, envelope("ERROR", "Service name not specified"));
    }
}

#[tokio::test]
async fn configure_and_rollback_restart_with_environment() {
    let ocis = FakeOcis::healthy();
    let fake = &ocis;
    let url = readiness_stub().await;
    let (supervisor, _logs) = supervisor(test_config(&ocis.bin, &url, 5));
    let app = router(supervisor.clone());

    let (status, body) = call(&app, "PUT", "/env", r#"{"X":"7"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, envelope("OK", "oCIS configured successfully"));
    assert_eq!(supervisor.env_overrides().await, vec!["X=7"]);

    let (status, body) = call(&app, "DELETE", "/env", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, envelope("OK", "oCIS configuration rolled back successfully"));
    assert!(supervisor.env_overrides().await.is_empty());

    assert!(eventually(Duration::from_secs(5), || async move { fake.launches().len() == 2 }).await);
    assert_eq!(
        ocis.launches(),
        vec!["server X=7 EXCLUDE=", "server X= EXCLUDE="]
    );

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn configure_rejects_invalid_json() {
    let ocis = FakeOcis::healthy();
    let (supervisor, _logs) = supervisor(test_config(&ocis.bin, "http://127.0.0.1:1", 5));
    let app = router(supervisor.clone());

    let (status, body) = call(&app, "PUT", "/config", "[1, 2").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, envelope("ERROR", "Invalid json body"));
    assert!(supervisor.env_overrides().await.is_empty());
    assert!(ocis.launches().is_empty());
}
