use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobq_api::app::services::{build_in_memory_services, AppServices};
use jobq_core::HandlerOutcome;
use jobq_infra::config::Settings;
use jobq_infra::jobs::finalizer::EXHAUSTED_DETAILS;
use jobq_infra::jobs::{FnHandler, HandlerRegistry, SimulatedWork};
use jobq_infra::task_queue::InMemoryTaskQueue;
use reqwest::StatusCode;
use serde_json::{json, Value};

struct TestServer {
    base_url: String,
    queue: Arc<InMemoryTaskQueue>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(HandlerRegistry::with_builtin_handlers(SimulatedWork::instant())).await
    }

    async fn spawn_with(registry: HandlerRegistry) -> Self {
        let settings = Settings {
            workers: 2,
            retry_backoff: Duration::ZERO,
            ..Settings::default()
        };
        let queue = Arc::new(InMemoryTaskQueue::default());
        let services: Arc<AppServices> = Arc::new(
            build_in_memory_services(&settings, registry, Arc::clone(&queue))
                .expect("failed to build services"),
        );

        // Same router as prod, bound to an ephemeral port.
        let app = jobq_api::app::build_app(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            queue,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn submit(client: &reqwest::Client, srv: &TestServer, body: Value) -> reqwest::Response {
    client
        .post(srv.url("/jobs/submit"))
        .json(&body)
        .send()
        .await
        .unwrap()
}

async fn status(client: &reqwest::Client, srv: &TestServer, id: i64) -> Value {
    let res = client
        .get(srv.url(&format!("/jobs/status/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    res.json().await.unwrap()
}

/// Jobs run on background workers; poll until the job reaches `expected`.
async fn wait_for_status(client: &reqwest::Client, srv: &TestServer, id: i64, expected: &str) -> Value {
    for _ in 0..200 {
        let job = status(client, srv, id).await;
        if job["status"] == expected {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("job {id} did not reach status {expected} within timeout");
}

#[tokio::test]
async fn welcome_and_health() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body, json!({"message": "Welcome to the Job Queue Service!"}));

    let res = client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "in_memory");
    assert!(body["workers"].is_object());
}

#[tokio::test]
async fn email_job_is_accepted_then_completed() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = submit(
        &client,
        &srv,
        json!({"job_type": "send_email", "payload": {"to": "ada@example.com"}}),
    )
    .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["message"], "Job received successfully");
    assert_eq!(body["job_type"], "send_email");
    assert_eq!(body["status"], "queued");
    let id = body["job_id"].as_i64().unwrap();

    let job = wait_for_status(&client, &srv, id, "completed").await;
    assert_eq!(job["job_id"], id);
    assert_eq!(job["retries"], 0);
    assert_eq!(job["result"]["message"], "Email sent successfully.");
    assert_eq!(job["result"]["recipient"], "ada@example.com");
    assert!(job["error_message"].is_null());
    assert!(job["created_at"].is_string());
    assert!(job["updated_at"].is_string());
}

#[tokio::test]
async fn non_object_payload_is_rejected_without_persisting() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = submit(&client, &srv, json!({"job_type": "send_email", "payload": [1, 2, 3]})).await;
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = res.json().await.unwrap();
    assert!(body["detail"].is_string());

    let res = submit(&client, &srv, json!({"job_type": "", "payload": {}})).await;
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let res = client.get(srv.url("/jobs/")).send().await.unwrap();
    let jobs: Vec<Value> = res.json().await.unwrap();
    assert!(jobs.is_empty());
    assert_eq!(srv.queue.pending_len(), 0);
}

#[tokio::test]
async fn broker_outage_returns_503_and_fails_the_job() {
    let srv = TestServer::spawn().await;
    srv.queue.set_available(false);
    let client = reqwest::Client::new();

    let res = submit(&client, &srv, json!({"job_type": "send_email", "payload": {}})).await;
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = res.json().await.unwrap();
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .starts_with("Job saved but failed to queue to worker. Error: "));
    let id = body["job_id"].as_i64().unwrap();

    let job = status(&client, &srv, id).await;
    assert_eq!(job["status"], "failed");
    assert!(job["result"].is_null());
    assert_eq!(job["error_message"]["error"], "Queue Connection Error");
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/jobs/status/999")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body, json!({"detail": "Job with ID 999 not found."}));

    let res = client.get(srv.url("/jobs/status/abc")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn listing_is_newest_first() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let mut ids = Vec::new();
    for n in 0..3 {
        let res = submit(&client, &srv, json!({"job_type": "send_email", "payload": {"n": n}})).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let body: Value = res.json().await.unwrap();
        ids.push(body["job_id"].as_i64().unwrap());
    }

    for path in ["/jobs/", "/jobs"] {
        let res = client.get(srv.url(path)).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let jobs: Vec<Value> = res.json().await.unwrap();
        let listed: Vec<i64> = jobs.iter().map(|j| j["job_id"].as_i64().unwrap()).collect();
        let mut expected = ids.clone();
        expected.reverse();
        assert_eq!(listed, expected);
    }

    let res = client.get(srv.url("/jobs/?limit=2")).send().await.unwrap();
    let jobs: Vec<Value> = res.json().await.unwrap();
    assert_eq!(jobs.len(), 2);
}

#[tokio::test]
async fn malformed_listing_limit_is_a_json_error() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    for query in ["?limit=abc", "?limit=-1"] {
        let res = client.get(srv.url(&format!("/jobs/{query}"))).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: Value = res.json().await.unwrap();
        assert!(body["detail"]
            .as_str()
            .unwrap()
            .starts_with("Failed to deserialize query string"), "{body}");
    }
}

#[tokio::test]
async fn listing_is_capped_at_fifty() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    for _ in 0..55 {
        let res = submit(&client, &srv, json!({"job_type": "send_email", "payload": {}})).await;
        assert_eq!(res.status(), StatusCode::CREATED);
    }

    let res = client.get(srv.url("/jobs/?limit=500")).send().await.unwrap();
    let jobs: Vec<Value> = res.json().await.unwrap();
    assert_eq!(jobs.len(), 50);
    assert_eq!(jobs[0]["job_id"], 55);
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let mut registry = HandlerRegistry::with_builtin_handlers(SimulatedWork::instant());
    registry.register_handler(
        "flaky_twice",
        FnHandler::new("flaky_twice", move |_ctx| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                HandlerOutcome::transient("upstream timeout")
            } else {
                HandlerOutcome::success(json!({"ok": true}))
            }
        }),
    );
    let srv = TestServer::spawn_with(registry).await;
    let client = reqwest::Client::new();

    let res = submit(&client, &srv, json!({"job_type": "flaky_twice", "payload": {}})).await;
    let body: Value = res.json().await.unwrap();
    let id = body["job_id"].as_i64().unwrap();

    let job = wait_for_status(&client, &srv, id, "completed").await;
    assert_eq!(job["retries"], 2);
    assert_eq!(job["result"], json!({"ok": true}));
    assert!(job["error_message"].is_null());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_fail_the_job() {
    let mut registry = HandlerRegistry::with_builtin_handlers(SimulatedWork::instant());
    registry.register_handler(
        "always_down",
        FnHandler::new("always_down", |_ctx| HandlerOutcome::transient("connection refused")),
    );
    let srv = TestServer::spawn_with(registry).await;
    let client = reqwest::Client::new();

    let res = submit(&client, &srv, json!({"job_type": "always_down", "payload": {}})).await;
    let body: Value = res.json().await.unwrap();
    let id = body["job_id"].as_i64().unwrap();

    let job = wait_for_status(&client, &srv, id, "failed").await;
    assert!(job["result"].is_null());
    assert_eq!(job["retries"], 3);
    assert_eq!(job["error_message"]["error"], "connection refused");
    assert_eq!(job["error_message"]["details"], EXHAUSTED_DETAILS);

    // The delivery is parked right after the finalizer's write.
    for _ in 0..100 {
        if !srv.queue.dead_letters().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let parked = srv.queue.dead_letters();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].message.job_id.get(), id);
}
