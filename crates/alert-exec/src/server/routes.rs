use axum::{
    body::to_bytes,
    extract::{ConnectInfo, Request, State},
    response::{IntoResponse, Response},
    Json,
};
use http::{HeaderMap, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::receivers::{AlertManagerPayload, PayloadError};
use super::AppState;
use crate::{
    executor,
    metrics::RequestOutcome,
    template::{self, RenderError},
};

pub const MAX_BODY_BYTES: usize = 1 << 20; // 1 MiB
pub const TOKEN_HEADER: &str = "x-token";

/// Per-request failures that stop the pipeline before a command result exists.
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("invalid or missing token")]
    Unauthorized,
    #[error("failed to read request body: {0}")]
    BodyRead(String),
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] PayloadError),
    #[error("invalid payload: {0}")]
    InvalidPayload(#[source] PayloadError),
    #[error(transparent)]
    Template(#[from] RenderError),
}

impl AlertError {
    fn status_code(&self) -> StatusCode {
        match self {
            AlertError::Unauthorized => StatusCode::UNAUTHORIZED,
            AlertError::BodyRead(_) | AlertError::InvalidJson(_) | AlertError::InvalidPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            AlertError::Template(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> &'static str {
        match self {
            AlertError::Unauthorized => "unauthorized",
            AlertError::BodyRead(_) => "bad request",
            AlertError::InvalidJson(_) => "invalid JSON",
            AlertError::InvalidPayload(_) => "invalid payload",
            AlertError::Template(_) => "template error",
        }
    }

    fn outcome(&self) -> RequestOutcome {
        match self {
            AlertError::Unauthorized => RequestOutcome::Unauthorized,
            AlertError::Template(_) => RequestOutcome::TemplateError,
            _ => RequestOutcome::BadRequest,
        }
    }
}

impl IntoResponse for AlertError {
    fn into_response(self) -> Response {
        (self.status_code(), self.body()).into_response()
    }
}

/// JSON body returned once the command has run.
#[derive(Debug, Serialize)]
pub struct ExecutionResponse {
    pub status: &'static str,
    pub exit_code: i32,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.gather() {
        Ok(text) => text.into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn receive_alert(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let span = info_span!("alert", request_id = %Uuid::new_v4(), remote_addr = %remote_addr);

    match handle_alert(&state, request).instrument(span).await {
        Ok((status, body)) => {
            let outcome = if status.is_success() {
                RequestOutcome::Ok
            } else {
                RequestOutcome::CommandFailed
            };
            state.metrics.record_request(outcome);
            (status, Json(body)).into_response()
        }
        Err(e) => {
            state.metrics.record_request(e.outcome());
            e.into_response()
        }
    }
}

fn check_token(headers: &HeaderMap, expected: &str) -> Result<(), AlertError> {
    if expected.is_empty() {
        return Ok(());
    }
    let provided = headers
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if provided.is_empty() || provided != expected {
        return Err(AlertError::Unauthorized);
    }
    Ok(())
}

async fn handle_alert(
    state: &AppState,
    request: Request,
) -> Result<(StatusCode, ExecutionResponse), AlertError> {
    let config = &state.config;

    if let Err(e) = check_token(request.headers(), &config.token) {
        warn!("unauthorized request: invalid or missing token");
        return Err(e);
    }

    let body = to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to read request body");
            AlertError::BodyRead(e.to_string())
        })?;

    let payload = AlertManagerPayload::parse(&body).map_err(|e| {
        error!(error = %e, "failed to parse alertmanager payload");
        AlertError::InvalidJson(e)
    })?;

    if let Err(e) = payload.validate() {
        error!(error = %e, "invalid alertmanager payload");
        return Err(AlertError::InvalidPayload(e));
    }

    let rendered = template::render_command(&config.command, &config.args, &payload).map_err(|e| {
        error!(error = %e, "failed to render command from template");
        AlertError::Template(e)
    })?;

    info!(
        status = %payload.status,
        receiver = %payload.receiver,
        group_key = %payload.group_key,
        alerts_count = payload.alerts.len(),
        primary_alertname = %payload.primary_alert_name(),
        command = %rendered.command,
        args = ?rendered.args,
        "alert mapped to command"
    );

    let (result, err) = executor::run(&rendered.command, &rendered.args, config.timeout).await;
    state.metrics.record_execution(&result);

    if err.is_some() || result.exit_code != 0 || result.timed_out {
        let error_text = err.as_ref().map(ToString::to_string).unwrap_or_default();
        error!(
            command = %result.command,
            args = ?result.args,
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            duration_ms = result.duration.as_millis() as u64,
            stdout = %result.stdout,
            stderr = %result.stderr,
            error = %error_text,
            primary_alertname = %payload.primary_alert_name(),
            alerts_count = payload.alerts.len(),
            "command execution failed"
        );

        let message = result.failure_message(err.as_ref());
        return Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            ExecutionResponse {
                status: "error",
                exit_code: result.exit_code,
                timed_out: result.timed_out,
                message: Some(message),
            },
        ));
    }

    info!(
        command = %result.command,
        args = ?result.args,
        exit_code = result.exit_code,
        timed_out = result.timed_out,
        duration_ms = result.duration.as_millis() as u64,
        stdout = %result.stdout,
        stderr = %result.stderr,
        primary_alertname = %payload.primary_alert_name(),
        alerts_count = payload.alerts.len(),
        "command execution succeeded"
    );

    Ok((
        StatusCode::OK,
        ExecutionResponse {
            status: "ok",
            exit_code: result.exit_code,
            timed_out: result.timed_out,
            message: None,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_check_token() {
        let mut headers = HeaderMap::new();
        assert!(check_token(&headers, "").is_ok());
        assert!(matches!(check_token(&headers, "s3cret"), Err(AlertError::Unauthorized)));

        headers.insert(TOKEN_HEADER, HeaderValue::from_static("wrong"));
        assert!(check_token(&headers, "s3cret").is_err());

        headers.insert(TOKEN_HEADER, HeaderValue::from_static("s3cret"));
        assert!(check_token(&headers, "s3cret").is_ok());
    }

    #[test]
    fn test_error_status_mapping() {
        let invalid = AlertManagerPayload::default().validate().unwrap_err();
        let malformed = AlertManagerPayload::parse(b"[").unwrap_err();

        assert_eq!(AlertError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AlertError::BodyRead("too big".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AlertError::InvalidJson(malformed).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AlertError::InvalidPayload(invalid).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AlertError::Unauthorized.outcome(), RequestOutcome::Unauthorized);
    }

    #[test]
    fn test_success_body_omits_message() {
        let body = ExecutionResponse {
            status: "ok",
            exit_code: 0,
            timed_out: false,
            message: None,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({ "status": "ok", "exit_code": 0, "timed_out": false })
        );
    }
}
