use std::{path::Path, sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
};
use runjail::engine::{
    admission::AdmissionController,
    api::routes,
    config::{EngineConfig, WorkspaceConfig},
    metrics::MetricsRegistry,
    orchestrator::JobOrchestrator,
    queue::Scheduler,
    rules::RuleSet,
    sandbox::{IsolationAdapter, ProcessEngine},
    worker::spawn_worker_pool,
    workspace::WorkspaceManager,
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

const RULES: &str = r#"{
  "rules": [
    {
      "language": "sh",
      "run_command": ["sh", "main.sh"],
      "limits": {
        "cpu_time_ms": 5000,
        "wall_time_ms": 3000,
        "memory_bytes": 268435456,
        "max_processes": 32,
        "max_output_bytes": 4096,
        "allow_network": false
      }
    },
    {
      "language": "sh-loop",
      "run_command": ["sh", "main.sh"],
      "limits": {
        "cpu_time_ms": 5000,
        "wall_time_ms": 500,
        "memory_bytes": 268435456,
        "max_processes": 32,
        "max_output_bytes": 4096,
        "allow_network": false
      }
    },
    {
      "language": "sh-built",
      "compile_command": ["sh", "build.sh", "{sources}"],
      "run_command": ["sh", "{workdir}/app.sh"],
      "limits": {
        "cpu_time_ms": 5000,
        "wall_time_ms": 3000,
        "memory_bytes": 268435456,
        "max_processes": 32,
        "max_output_bytes": 4096,
        "allow_network": false
      }
    },
    {
      "language": "python",
      "run_command": ["python3", "main.py"],
      "limits": {
        "cpu_time_ms": 2000,
        "wall_time_ms": 5000,
        "memory_bytes": 268435456,
        "max_processes": 8,
        "max_output_bytes": 4096,
        "allow_network": false
      }
    }
  ]
}"#;

struct Harness {
    app: Router,
    workspaces: TempDir,
}

impl Harness {
    fn new(workers: usize, queue_depth: usize) -> Self {
        let workspaces = tempfile::tempdir().unwrap();
        let workspace_cfg = WorkspaceConfig {
            base_dir: workspaces.path().to_path_buf(),
            ..WorkspaceConfig::default()
        };
        let config = EngineConfig::from_env();
        let metrics = Arc::new(MetricsRegistry::new());
        let adapter = IsolationAdapter::new(Arc::new(ProcessEngine::new()), Duration::from_millis(100));
        let orchestrator = Arc::new(JobOrchestrator::new(
            WorkspaceManager::new(workspace_cfg.clone()),
            Arc::new(adapter),
            metrics.clone(),
        ));
        let scheduler = Scheduler::new(queue_depth);
        spawn_worker_pool(workers, scheduler.receiver(), orchestrator, metrics.clone());
        let admission = AdmissionController::new(
            Arc::new(RuleSet::load(RULES).unwrap()),
            scheduler,
            metrics.clone(),
            workspace_cfg,
            config.max_stdin_bytes,
        );
        Self {
            app: routes(&config, admission, metrics),
            workspaces,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn run(&self, body: Value) -> Value {
        let response = self.send(post("/v1/run", body)).await;
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await
    }

    async fn metrics(&self) -> String {
        let response = self
            .send(Request::get("/metrics").body(Body::empty()).unwrap())
            .await;
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    fn assert_no_residue(&self) {
        let left: Vec<_> = std::fs::read_dir(self.workspaces.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert!(left.is_empty(), "workspaces left behind: {left:?}");
    }
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn submission(language: &str, name: &str, content: &str) -> Value {
    json!({ "language": language, "files": [{ "name": name, "content": content }] })
}

async fn body_json(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn interpreted_program_completes() {
    let harness = Harness::new(2, 8);
    let result = harness
        .run(submission("sh", "main.sh", "echo hello"))
        .await;
    assert_eq!(result["state"], "completed");
    assert_eq!(result["exit_code"], 0);
    assert_eq!(result["stdout"], "hello\n");
    assert_eq!(result["truncated"], false);
    assert!(result.get("compile_stdout").is_none());
    harness.assert_no_residue();
}

#[tokio::test]
async fn python_hello_world() {
    if !Path::new("/usr/bin/python3").exists() {
        return;
    }
    let harness = Harness::new(1, 4);
    let result = harness
        .run(submission("python", "main.py", "print('hello')\n"))
        .await;
    assert_eq!(result["state"], "completed");
    assert_eq!(result["exit_code"], 0);
    assert_eq!(result["stdout"], "hello\n");
    harness.assert_no_residue();
}

#[tokio::test]
async fn infinite_loop_times_out() {
    let harness = Harness::new(1, 4);
    let started = std::time::Instant::now();
    let result = harness
        .run(submission("sh-loop", "main.sh", "while :; do :; done"))
        .await;
    // 500 ms wall limit plus 100 ms kill grace.
    assert!(
        started.elapsed() < Duration::from_millis(1500),
        "took {:?}",
        started.elapsed()
    );
    assert_eq!(result["state"], "timed_out");
    assert!(result["exit_code"].is_null());
    harness.assert_no_residue();
}

#[tokio::test]
async fn compile_error_never_runs() {
    let harness = Harness::new(1, 4);
    let body = json!({
        "language": "sh-built",
        "files": [
            { "name": "build.sh", "content": "echo 'main.src:1: expected ;' >&2\nexit 1\n" },
            { "name": "main.src", "content": "garbage" }
        ]
    });
    let result = harness.run(body).await;
    assert_eq!(result["state"], "compile_error");
    assert_eq!(result["exit_code"], 1);
    assert_eq!(result["compile_stderr"], "main.src:1: expected ;\n");
    assert!(result["run_duration_ms"].is_null());
    assert_eq!(result["stdout"], "");
    harness.assert_no_residue();
}

#[tokio::test]
async fn compiled_program_runs_after_build() {
    let harness = Harness::new(1, 4);
    let body = json!({
        "language": "sh-built",
        "files": [
            { "name": "build.sh", "content": "echo building \"$@\"\necho 'read line; echo \"got $line\"' > app.sh\n" },
            { "name": "src/lib.src", "content": "" }
        ],
        "stdin": "ping\n"
    });
    let result = harness.run(body).await;
    assert_eq!(result["state"], "completed");
    assert_eq!(result["compile_stdout"], "building build.sh src/lib.src\n");
    assert_eq!(result["stdout"], "got ping\n");
    assert!(result["compile_duration_ms"].is_u64());
    harness.assert_no_residue();
}

#[tokio::test]
async fn nonzero_exit_is_a_runtime_error() {
    let harness = Harness::new(1, 4);
    let result = harness
        .run(submission("sh", "main.sh", "echo partial; echo boom >&2; exit 7"))
        .await;
    assert_eq!(result["state"], "runtime_error");
    assert_eq!(result["exit_code"], 7);
    assert_eq!(result["stdout"], "partial\n");
    assert_eq!(result["stderr"], "boom\n");
}

#[tokio::test]
async fn output_flood_is_truncated() {
    let harness = Harness::new(1, 4);
    let result = harness
        .run(submission(
            "sh",
            "main.sh",
            "i=0; while [ $i -lt 5000 ]; do echo 0123456789; i=$((i+1)); done",
        ))
        .await;
    assert_eq!(result["state"], "completed");
    assert_eq!(result["truncated"], true);
    assert!(result["stdout"].as_str().unwrap().len() <= 4096);
}

#[tokio::test]
async fn invalid_utf8_flood_stays_within_the_output_limit() {
    let harness = Harness::new(1, 4);
    let result = harness
        .run(submission(
            "sh",
            "main.sh",
            "i=0; while [ $i -lt 5000 ]; do printf '\\377'; i=$((i+1)); done",
        ))
        .await;
    assert_eq!(result["state"], "completed");
    assert_eq!(result["truncated"], true);
    assert!(result["stdout"].as_str().unwrap().len() <= 4096);
}

#[tokio::test]
async fn base64_sources_and_stdin_reach_the_program() {
    let harness = Harness::new(1, 4);
    let body = json!({
        "language": "sh",
        // "read line; echo \"got $line\"\n"
        "files": [{
            "name": "main.sh",
            "content": "cmVhZCBsaW5lOyBlY2hvICJnb3QgJGxpbmUiCg==",
            "encoding": "base64"
        }],
        "stdin": "cGluZwo=",
        "stdin_encoding": "base64"
    });
    let result = harness.run(body).await;
    assert_eq!(result["state"], "completed");
    assert_eq!(result["stdout"], "got ping\n");
    harness.assert_no_residue();
}

#[tokio::test]
async fn file_and_directory_with_one_name_is_rejected_at_admission() {
    let harness = Harness::new(1, 4);
    let body = json!({
        "language": "sh",
        "files": [
            { "name": "main.sh", "content": "echo hi" },
            { "name": "main.sh/x", "content": "" }
        ]
    });
    let response = harness.send(post("/v1/run", body)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    let error = json["error"].as_str().unwrap();
    assert!(error.contains("main.sh"));
    assert!(!error.contains(harness.workspaces.path().to_str().unwrap()));
    let metrics = harness.metrics().await;
    assert!(metrics.contains("runjail_jobs_submitted_total 0"));
    harness.assert_no_residue();
}

#[tokio::test]
async fn unknown_language_creates_no_job() {
    let harness = Harness::new(1, 4);
    let response = harness
        .send(post("/v1/jobs", submission("cobol", "main.cob", "DISPLAY 'HI'.")))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let metrics = harness.metrics().await;
    assert!(metrics.contains("runjail_jobs_submitted_total 0"));
    assert!(metrics.contains("runjail_jobs_rejected_total{reason=\"unknown_language\"} 1"));
    harness.assert_no_residue();
}

#[tokio::test]
async fn path_traversal_is_rejected_at_admission() {
    let harness = Harness::new(1, 4);
    let response = harness
        .send(post("/v1/jobs", submission("sh", "../../escape.sh", "echo hi")))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    harness.assert_no_residue();
}

#[tokio::test]
async fn full_capacity_rejects_without_side_effects() {
    let harness = Harness::new(1, 1);
    let slow = submission("sh", "main.sh", "sleep 1; echo done");

    let running = body_json(harness.send(post("/v1/jobs", slow.clone())).await).await;
    let running_id = running["id"].as_str().unwrap().to_string();
    // Wait until the only worker has taken the first job off the queue.
    for _ in 0..100 {
        let status = body_json(
            harness
                .send(
                    Request::get(format!("/v1/jobs/{running_id}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await,
        )
        .await;
        if status["state"] != "queued" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let queued = harness.send(post("/v1/jobs", slow.clone())).await;
    assert_eq!(queued.status(), StatusCode::ACCEPTED);
    let queued_id = body_json(queued).await["id"].as_str().unwrap().to_string();

    let rejected = harness.send(post("/v1/jobs", slow)).await;
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);

    let metrics = harness.metrics().await;
    assert!(metrics.contains("runjail_jobs_submitted_total 2"));
    assert!(metrics.contains("runjail_jobs_rejected_total{reason=\"at_capacity\"} 1"));

    for id in [running_id, queued_id] {
        let response = harness
            .send(
                Request::get(format!("/v1/jobs/{id}/result"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let result = body_json(response).await;
        assert_eq!(result["state"], "completed");
        assert_eq!(result["stdout"], "done\n");

        let again = harness
            .send(
                Request::get(format!("/v1/jobs/{id}/result"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }
    harness.assert_no_residue();
}
