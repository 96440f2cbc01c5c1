//! HTTP control API for the supervised oCIS server.
//!
//! Every endpoint answers with a JSON envelope `{"status", "message"}`
//! where status is `OK` for 200 responses and `ERROR` otherwise.

use std::future::Future;
use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::WrapperError;
use crate::supervisor::Supervisor;

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    /// Port to listen on.
    pub port: u16,
    /// Host to bind to.
    pub host: String,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            port: 5200,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Control API server in front of a [`Supervisor`].
pub struct HttpServer {
    config: HttpServerConfig,
    supervisor: Supervisor,
}

impl HttpServer {
    pub fn new(config: HttpServerConfig, supervisor: Supervisor) -> Self {
        Self { config, supervisor }
    }

    /// Serve until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = router(self.supervisor.clone());
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port).parse()?;

        tracing::info!("Starting control API on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

/// Routes of the control API.
pub fn router(supervisor: Supervisor) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/env", put(set_env_handler).delete(rollback_handler))
        .route("/config", put(set_env_handler))
        .route("/rollback", delete(rollback_handler))
        .route("/ocis/start", post(start_handler))
        .route("/start", post(start_handler))
        .route("/ocis/stop", post(stop_handler))
        .route("/stop", post(stop_handler))
        .route("/command", post(command_handler))
        .route(
            "/services/:name",
            post(start_service_handler).delete(stop_service_handler),
        )
        .route(
            "/services",
            post(missing_service_handler).delete(missing_service_handler),
        )
        .route(
            "/services/",
            post(missing_service_handler).delete(missing_service_handler),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(supervisor)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicResponse {
    pub status: String,
    pub message: String,
}

impl BasicResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: "OK".to_string(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "ERROR".to_string(),
            message: message.into(),
        }
    }

    fn for_status(status: StatusCode, message: impl Into<String>) -> Self {
        if status == StatusCode::OK {
            Self::ok(message)
        } else {
            Self::error(message)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    #[serde(flatten)]
    pub basic: BasicResponse,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
}

fn reply(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(BasicResponse::for_status(status, message))).into_response()
}

impl IntoResponse for WrapperError {
    fn into_response(self) -> Response {
        reply(self.status_code(), self.to_string())
    }
}

fn invalid_json() -> WrapperError {
    WrapperError::InvalidRequest("Invalid json body".to_string())
}

/// Parse a request body that must be a JSON object.
fn parse_object(body: &[u8]) -> Result<Map<String, Value>, WrapperError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(invalid_json()),
    }
}

/// `KEY=VALUE` entries from a JSON object; strings are used verbatim.
pub fn env_pairs(map: &Map<String, Value>) -> Vec<String> {
    map.iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("{}={}", key, s),
            other => format!("{}={}", key, other),
        })
        .collect()
}

async fn health_handler(State(supervisor): State<Supervisor>) -> Response {
    let message = if supervisor.is_running().await {
        "oCIS server is running"
    } else {
        "oCIS server is not running"
    };
    reply(StatusCode::OK, message)
}

async fn set_env_handler(State(supervisor): State<Supervisor>, body: Bytes) -> Response {
    let map = match parse_object(&body) {
        Ok(map) => map,
        Err(e) => return e.into_response(),
    };

    match supervisor.configure(env_pairs(&map)).await {
        Ok(_) => reply(StatusCode::OK, "oCIS configured successfully"),
        Err(e) => {
            tracing::error!("Configuration restart failed: {}", e);
            reply(
                e.status_code(),
                "Failed to restart oCIS with new configuration",
            )
        }
    }
}

async fn rollback_handler(State(supervisor): State<Supervisor>) -> Response {
    match supervisor.rollback().await {
        Ok(_) => reply(StatusCode::OK, "oCIS configuration rolled back successfully"),
        Err(e) => {
            tracing::error!("Rollback restart failed: {}", e);
            reply(
                e.status_code(),
                "Failed to restart oCIS with initial configuration",
            )
        }
    }
}

async fn start_handler(State(supervisor): State<Supervisor>) -> Response {
    match supervisor.launch().await {
        Ok(message) => reply(StatusCode::OK, message),
        Err(e) => e.into_response(),
    }
}

async fn stop_handler(State(supervisor): State<Supervisor>) -> Response {
    match supervisor.stop().await {
        Ok(message) => reply(StatusCode::OK, message),
        Err(e) => e.into_response(),
    }
}

/// Validated body of a command request.
#[derive(Debug, PartialEq, Eq)]
pub struct CommandRequest {
    pub command: String,
    pub inputs: Vec<String>,
}

impl CommandRequest {
    pub fn parse(body: &[u8]) -> Result<Self, WrapperError> {
        if body.is_empty() {
            return Err(WrapperError::InvalidRequest("Body is missing".to_string()));
        }
        let map = parse_object(body)?;

        let Some(Value::String(command)) = map.get("command") else {
            return Err(WrapperError::InvalidRequest("Command is missing".to_string()));
        };

        let inputs = match map.get("inputs") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    _ => Err(expected_string()),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err(expected_string()),
        };

        Ok(Self {
            command: command.clone(),
            inputs,
        })
    }
}

fn expected_string() -> WrapperError {
    WrapperError::InvalidRequest("Invalid input data. Expected string".to_string())
}

async fn command_handler(State(supervisor): State<Supervisor>, body: Bytes) -> Response {
    let request = match CommandRequest::parse(&body) {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };

    match supervisor
        .run_command(&request.command, &request.inputs)
        .await
    {
        Ok(output) => {
            let basic = if output.exit_code == 0 {
                BasicResponse::ok(output.output)
            } else {
                BasicResponse::error(output.output)
            };
            let response = CommandResponse {
                basic,
                exit_code: output.exit_code,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn start_service_handler(
    State(supervisor): State<Supervisor>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    if name.is_empty() {
        return WrapperError::MissingServiceName.into_response();
    }

    let env = if body.is_empty() {
        Vec::new()
    } else {
        match parse_object(&body) {
            Ok(map) => env_pairs(&map),
            Err(e) => return e.into_response(),
        }
    };

    match supervisor.run_service(&name, env).await {
        Ok(message) => reply(StatusCode::OK, message),
        Err(e) => {
            tracing::error!(service = %name, "Failed to run service separately: {}", e);
            reply(
                e.status_code(),
                format!("Failed to restart oCIS without service {}", name),
            )
        }
    }
}

async fn stop_service_handler(
    State(supervisor): State<Supervisor>,
    Path(name): Path<String>,
) -> Response {
    if name.is_empty() {
        return WrapperError::MissingServiceName.into_response();
    }

    match supervisor.stop_service(&name).await {
        Ok(message) => reply(StatusCode::OK, message),
        Err(e) => e.into_response(),
    }
}

async fn missing_service_handler() -> Response {
    WrapperError::MissingServiceName.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_response_uses_flat_envelope() {
        let response = CommandResponse {
            basic: BasicResponse::ok("a\nb\n"),
            exit_code: 0,
        };
        assert_eq!(
            serde_json::to_value(response).unwrap(),
            json!({"status": "OK", "message": "a\nb\n", "exitCode": 0})
        );
    }

    #[test]
    fn env_pairs_keep_strings_verbatim() {
        let map = json!({"A": "x y", "B": 1, "C": true});
        let pairs = env_pairs(map.as_object().unwrap());
        assert_eq!(pairs, vec!["A=x y", "B=1", "C=true"]);
    }

    #[test]
    fn command_request_validation() {
        assert_eq!(
            CommandRequest::parse(br#"{"command":"list","inputs":["y"]}"#).unwrap(),
            CommandRequest {
                command: "list".into(),
                inputs: vec!["y".into()],
            }
        );
        assert_eq!(
            CommandRequest::parse(br#"{"command":"list"}"#).unwrap().inputs,
            Vec::<String>::new()
        );

        let message = |body: &[u8]| CommandRequest::parse(body).unwrap_err().to_string();
        assert_eq!(message(b""), "Body is missing");
        assert_eq!(message(b"{not json"), "Invalid json body");
        assert_eq!(message(b"[1,2]"), "Invalid json body");
        assert_eq!(message(br#"{"inputs":[]}"#), "Command is missing");
        assert_eq!(message(br#"{"command":5}"#), "Command is missing");
        assert_eq!(
            message(br#"{"command":"x","inputs":[1]}"#),
            "Invalid input data. Expected string"
        );
        assert_eq!(
            message(br#"{"command":"x","inputs":"yes"}"#),
            "Invalid input data. Expected string"
        );
    }

    #[test]
    fn error_envelope_carries_status() {
        assert_eq!(
            BasicResponse::for_status(StatusCode::CONFLICT, "busy"),
            BasicResponse::error("busy")
        );
        assert_eq!(BasicResponse::for_status(StatusCode::OK, "fine").status, "OK");
    }
}
