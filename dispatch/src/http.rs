//! HTTP ingress for producers that cannot link the crate.
//!
//! `POST /worker/schedule` takes `{queue, payload, delayMs}` and
//! `POST /worker/queue` takes `{queue, payload}`. Both accept an optional
//! `job` naming the handler, defaulting to the queue name. Success is
//! `202 {"id": ...}`; every failure is `{"error": ..., "kind": ...}`.

use crate::{
    config::DispatchConfig,
    jobs::{Job, JobHandle},
    manager::DispatchManager,
    Error, Result,
};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{future::Future, sync::Arc, time::Duration};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    pub queue: String,
    pub payload: serde_json::Value,
    #[serde(rename = "delayMs")]
    pub delay_ms: i64,
    #[serde(default)]
    pub job: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueRequest {
    pub queue: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub job: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Accepted {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

fn error_response(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
            kind: kind.to_string(),
        }),
    )
        .into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::InvalidArgument(_) | Error::Serialization(_) | Error::NoHandler(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::HandleExpired(_) => StatusCode::CONFLICT,
            Error::UnknownDriver(_)
            | Error::JobFailed { .. }
            | Error::HandlerAlreadyRegistered(_)
            | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("dispatch failed: {}", self);
            return error_response(status, self.kind(), "internal error");
        }
        error_response(status, self.kind(), self.to_string())
    }
}

fn rejected(rejection: JsonRejection) -> Response {
    warn!("rejected request body: {}", rejection);
    error_response(
        StatusCode::BAD_REQUEST,
        "invalid_argument",
        rejection.body_text(),
    )
}

#[derive(Clone)]
struct Ingress {
    manager: Arc<DispatchManager>,
    timeout: Duration,
}

impl Ingress {
    async fn bounded<F>(&self, work: F) -> Response
    where
        F: Future<Output = Result<JobHandle>>,
    {
        match tokio::time::timeout(self.timeout, work).await {
            Ok(Ok(handle)) => (
                StatusCode::ACCEPTED,
                Json(Accepted {
                    id: handle.to_string(),
                }),
            )
                .into_response(),
            Ok(Err(e)) => e.into_response(),
            Err(_) => {
                warn!("request exceeded {:?}", self.timeout);
                error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "timeout",
                    "backend did not answer in time",
                )
            }
        }
    }
}

fn job_for(queue: &str, job: Option<&str>, payload: &serde_json::Value) -> Result<Job> {
    if queue.is_empty() {
        return Err(Error::InvalidArgument("queue must not be empty".to_string()));
    }
    Job::from_json(job.unwrap_or(queue), payload)
}

async fn schedule(
    State(ingress): State<Ingress>,
    body: std::result::Result<Json<ScheduleRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return rejected(rejection),
    };
    ingress
        .bounded(async {
            let job = job_for(&request.queue, request.job.as_deref(), &request.payload)?;
            ingress
                .manager
                .later(&request.queue, job, request.delay_ms)
                .await
        })
        .await
}

async fn queue(
    State(ingress): State<Ingress>,
    body: std::result::Result<Json<QueueRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return rejected(rejection),
    };
    ingress
        .bounded(async {
            let job = job_for(&request.queue, request.job.as_deref(), &request.payload)?;
            ingress.manager.push(&request.queue, job).await
        })
        .await
}

/// Builds the ingress router. Without `register_routes` the router is empty
/// and every worker path answers 404.
pub fn router(manager: Arc<DispatchManager>, config: &DispatchConfig) -> Router {
    if !config.register_routes {
        info!("worker routes disabled");
        return Router::new();
    }
    Router::new()
        .route("/worker/schedule", post(schedule))
        .route("/worker/queue", post(queue))
        .with_state(Ingress {
            manager,
            timeout: config.request_timeout(),
        })
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_hide_details() {
        let response = Error::Config("secret dsn".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn status_follows_error_kind() {
        let cases = [
            (Error::InvalidArgument("x".into()), StatusCode::BAD_REQUEST),
            (Error::Serialization("x".into()), StatusCode::BAD_REQUEST),
            (Error::BackendUnavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::HandleExpired("x".into()), StatusCode::CONFLICT),
            (Error::UnknownDriver("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn schedule_request_uses_camel_case_delay() {
        let request: ScheduleRequest =
            serde_json::from_str(r#"{"queue":"emails","payload":{"to":"a@b.c"},"delayMs":1500}"#)
                .unwrap();
        assert_eq!(request.delay_ms, 1500);
        assert!(request.job.is_none());
    }

    #[test]
    fn job_name_defaults_to_queue() {
        let job = job_for("emails", None, &serde_json::json!({})).unwrap();
        assert_eq!(job.name(), "emails");
        assert!(job_for("", None, &serde_json::json!({})).is_err());
    }
}
