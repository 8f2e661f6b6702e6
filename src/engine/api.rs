use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Extension, Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
};
use uuid::Uuid;

use crate::engine::{
    admission::AdmissionController,
    config::EngineConfig,
    error::EngineError,
    logging::{RequestId, log_requests},
    metrics::MetricsRegistry,
    models::{
        CreateJobResponse, JobResult, JobState, JobStatusResponse, LanguageSummary, SubmitRequest,
    },
};

#[derive(Clone)]
pub struct AppState {
    admission: AdmissionController,
    metrics: Arc<MetricsRegistry>,
}

pub fn routes(
    config: &EngineConfig,
    admission: AdmissionController,
    metrics_registry: Arc<MetricsRegistry>,
) -> Router {
    let state = AppState {
        admission,
        metrics: metrics_registry,
    };
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/languages", get(languages))
        .route("/v1/jobs", post(submit_job))
        .route("/v1/jobs/{id}", get(get_job))
        .route("/v1/jobs/{id}/result", get(get_result))
        .route("/v1/run", post(run_job))
        .layer(DefaultBodyLimit::max(config.max_request_bytes))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "queued": state.metrics.queue_depth(),
        "running": state.metrics.running(),
    }))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.render_prometheus())
}

async fn languages(State(state): State<AppState>) -> Json<Vec<LanguageSummary>> {
    Json(state.admission.languages())
}

async fn submit_job(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), EngineError> {
    let id = state.admission.submit(request)?;
    tracing::info!(request_id = %request_id, job_id = %id, "submission accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(CreateJobResponse {
            id,
            state: JobState::Queued,
        }),
    ))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, EngineError> {
    state
        .admission
        .status(id)
        .map(Json)
        .ok_or(EngineError::NotFound)
}

async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResult>, EngineError> {
    Ok(Json(state.admission.await_result(id).await?))
}

/// Submit and wait in one round trip.
async fn run_job(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<JobResult>, EngineError> {
    let id = state.admission.submit(request)?;
    tracing::info!(request_id = %request_id, job_id = %id, "submission accepted, waiting");
    Ok(Json(state.admission.await_result(id).await?))
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode, header},
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::routes;
    use crate::engine::{
        admission::AdmissionController,
        config::{EngineConfig, WorkspaceConfig},
        metrics::MetricsRegistry,
        queue::Scheduler,
        rules::{Limits, Rule, RuleSet},
    };

    fn app(depth: usize) -> Router {
        let rules = RuleSet::from_rules(vec![Rule {
            language: "python".into(),
            compile_command: None,
            run_command: vec!["python3".into(), "main.py".into()],
            limits: Limits {
                cpu_time_ms: 1_000,
                wall_time_ms: 1_000,
                memory_bytes: 64 * 1024 * 1024,
                max_processes: 4,
                max_output_bytes: 4096,
                allow_network: false,
            },
            filesystem_view: Vec::new(),
            workdir: "/workspace".into(),
            env: BTreeMap::new(),
        }])
        .unwrap();
        let metrics = Arc::new(MetricsRegistry::new());
        let config = EngineConfig::from_env();
        let admission = AdmissionController::new(
            Arc::new(rules),
            Scheduler::new(depth),
            metrics.clone(),
            WorkspaceConfig::default(),
            config.max_stdin_bytes,
        );
        routes(&config, admission, metrics)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn submission(language: &str) -> Value {
        json!({
            "language": language,
            "files": [{ "name": "main.py", "content": "print('hi')\n" }]
        })
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn lists_languages() {
        let response = app(4)
            .oneshot(Request::get("/v1/languages").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let json = body_json(response).await;
        assert_eq!(json[0]["language"], "python");
        assert_eq!(json[0]["compiled"], false);
    }

    #[tokio::test]
    async fn unknown_language_is_a_bad_request() {
        let response = app(4)
            .oneshot(post("/v1/jobs", submission("brainfuck")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("brainfuck"));
    }

    #[tokio::test]
    async fn accepts_then_reports_queued_state() {
        let app = app(4);
        let response = app
            .clone()
            .oneshot(post("/v1/jobs", submission("python")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let created = body_json(response).await;
        assert_eq!(created["state"], "queued");

        let id = created["id"].as_str().unwrap();
        let response = app
            .oneshot(
                Request::get(format!("/v1/jobs/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["state"], "queued");
    }

    #[tokio::test]
    async fn full_queue_answers_service_unavailable() {
        let app = app(1);
        let first = app
            .clone()
            .oneshot(post("/v1/jobs", submission("python")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = app
            .oneshot(post("/v1/jobs", submission("python")))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(second.headers()[header::RETRY_AFTER], "1");
    }

    #[tokio::test]
    async fn health_reports_queue_gauges() {
        let app = app(4);
        app.clone()
            .oneshot(post("/v1/jobs", submission("python")))
            .await
            .unwrap();
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["ok"], true);
        assert_eq!(json["queued"], 1);
        assert_eq!(json["running"], 0);
    }

    #[tokio::test]
    async fn file_shadowing_a_directory_is_a_bad_request() {
        let body = json!({
            "language": "python",
            "files": [
                { "name": "main.py", "content": "print(1)\n" },
                { "name": "main.py/x", "content": "" }
            ]
        });
        let response = app(4).oneshot(post("/v1/jobs", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("main.py"));
    }

    #[tokio::test]
    async fn echoes_caller_request_id() {
        let response = app(4)
            .oneshot(
                Request::get("/healthz")
                    .header("x-request-id", "trace-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["x-request-id"], "trace-42");
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let response = app(4)
            .oneshot(
                Request::get(format!("/v1/jobs/{}/result", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
