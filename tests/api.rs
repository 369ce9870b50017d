//! End-to-end HTTP tests: a real server on an ephemeral port, driven
//! with reqwest, with a mocked OpenAI-compatible backend behind it.

use std::net::SocketAddr;
use std::sync::Arc;

use answer_harness::app::App;
use answer_harness::config::Config;
use answer_harness::server;

struct TestServer {
    base_url: String,
    app: Arc<App>,
    _tmp: tempfile::TempDir,
}

async fn spawn_server(mutate: impl FnOnce(&mut Config)) -> TestServer {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.db.path = tmp.path().join("api.sqlite");
    config.rate_limit.enabled = false;
    mutate(&mut config);

    let app = App::init(config).await.unwrap();
    let router = server::build_router(app.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        base_url: format!("http://{}", addr),
        app,
        _tmp: tmp,
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn create_project(server: &TestServer, slug: &str, prompt: &str) {
    let response = client()
        .post(format!("{}/api/v1/projects", server.base_url))
        .json(&serde_json::json!({
            "slug": slug,
            "title": slug,
            "system_prompt": prompt,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200, "{}", response.text().await.unwrap());
}

fn sse_body(tokens: &[&str]) -> String {
    let mut body = String::new();
    for token in tokens {
        let chunk = serde_json::json!({ "choices": [{ "delta": { "content": token } }] });
        body.push_str(&format!("data: {}\n\n", chunk));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

#[tokio::test]
async fn test_health_endpoints() {
    let server = spawn_server(|_| {}).await;

    let health: serde_json::Value = client()
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["store"], "up");

    let healthz = client()
        .get(format!("{}/healthz", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(healthz.status(), 200);

    let metrics = client()
        .get(format!("{}/metrics", server.base_url))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("answer_chat_requests_total"));
}

#[tokio::test]
async fn test_project_crud_roundtrip() {
    let server = spawn_server(|_| {}).await;
    create_project(&server, "demo", "Answer in English.").await;

    // Duplicate slug conflicts.
    let dup = client()
        .post(format!("{}/api/v1/projects", server.base_url))
        .json(&serde_json::json!({ "slug": "demo" }))
        .send()
        .await
        .unwrap();
    assert_eq!(dup.status(), 409);

    let fetched: serde_json::Value = client()
        .get(format!("{}/api/v1/projects/demo", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["slug"], "demo");

    let deleted = client()
        .delete(format!("{}/api/v1/projects/demo", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);

    let gone = client()
        .get(format!("{}/api/v1/projects/demo", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
}

#[tokio::test]
async fn test_chat_validation_and_not_found() {
    let server = spawn_server(|_| {}).await;

    let missing_project = client()
        .post(format!("{}/api/v1/chat", server.base_url))
        .json(&serde_json::json!({ "message": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing_project.status(), 400);
    let body: serde_json::Value = missing_project.json().await.unwrap();
    assert_eq!(body["error"]["code"], "validation_error");
    assert_eq!(body["error"]["field"], "project");

    let unknown = client()
        .post(format!("{}/api/v1/chat", server.base_url))
        .json(&serde_json::json!({ "project": "ghost", "message": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 404);
    let body: serde_json::Value = unknown.json().await.unwrap();
    assert_eq!(body["error"]["code"], "project_not_found");
}

#[tokio::test]
async fn test_chat_happy_path_over_sse() {
    let backend = httpmock::MockServer::start();
    backend.mock(|when, then| {
        when.method(httpmock::Method::POST)
            .path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(sse_body(&["The capital of Atlantis is ", "Sunhaven", "."]));
    });

    let backend_url = backend.base_url();
    let server = spawn_server(move |config| {
        config.llm.servers = vec![backend_url];
    })
    .await;
    create_project(&server, "demo", "Answer in English.").await;

    // Seed one document and index it.
    let added = client()
        .post(format!("{}/api/v1/admin/knowledge", server.base_url))
        .json(&serde_json::json!({
            "project": "demo",
            "title": "Atlantis",
            "text": "The capital of Atlantis is Sunhaven. It lies beneath the waves.",
            "source_url": "https://example.test/atlantis",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(added.status(), 200);
    server.app.indexer.scan_once().await.unwrap();

    let response = client()
        .post(format!("{}/api/v1/chat", server.base_url))
        .json(&serde_json::json!({
            "project": "demo",
            "message": "What is the capital of Atlantis?",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();

    assert!(body.contains("event: token"), "body: {}", body);
    assert!(body.contains("Sunhaven"));
    assert!(body.contains("event: sources"));
    assert!(body.contains("https://example.test/atlantis"));
    assert!(body.contains("event: done"));

    // The token events come before the terminal ones.
    let token_pos = body.find("event: token").unwrap();
    let done_pos = body.rfind("event: done").unwrap();
    assert!(token_pos < done_pos);

    // Stats were recorded.
    let stats: serde_json::Value = client()
        .get(format!(
            "{}/api/v1/admin/stats?project=demo",
            server.base_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats[0]["count"], 1);
}

#[tokio::test]
async fn test_chat_error_event_when_no_backend() {
    let server = spawn_server(|_| {}).await;
    create_project(&server, "demo", "Answer in English.").await;

    let added = client()
        .post(format!("{}/api/v1/admin/knowledge", server.base_url))
        .json(&serde_json::json!({
            "project": "demo",
            "text": "Some content long enough to pass the quality floor easily.",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(added.status(), 200);
    server.app.indexer.scan_once().await.unwrap();

    let body = client()
        .post(format!("{}/api/v1/chat", server.base_url))
        .json(&serde_json::json!({ "project": "demo", "message": "content?" }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("event: error"), "body: {}", body);
}

#[tokio::test]
async fn test_write_rate_limit_returns_429_with_hint() {
    let server = spawn_server(|config| {
        config.rate_limit.enabled = true;
        config.rate_limit.write_per_min = 10;
        config.rate_limit.read_per_min = 1000;
    })
    .await;

    // Writes that mutate nothing: stopping a crawler that is not running.
    let mut last_status = 0;
    for _ in 0..11 {
        let response = client()
            .post(format!("{}/api/v1/crawler/stop", server.base_url))
            .json(&serde_json::json!({ "project": "nothing" }))
            .send()
            .await
            .unwrap();
        last_status = response.status().as_u16();
        if last_status == 429 {
            let retry_after: u64 = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .expect("Retry-After header");
            assert!(retry_after >= 1);
            let body: serde_json::Value = response.json().await.unwrap();
            assert_eq!(body["error"]["code"], "rate_limited");
        }
    }
    assert_eq!(last_status, 429, "the 11th write must be limited");
}

#[tokio::test]
async fn test_qa_upload_csv_idempotent() {
    let server = spawn_server(|_| {}).await;
    create_project(&server, "demo", "Answer in English.").await;

    let csv = "question,answer\nWhat is up?,The sky.\nSecond?,Answer two.\n";
    let upload = |csv: &'static str, base: String| async move {
        let form = reqwest::multipart::Form::new()
            .text("project", "demo")
            .part(
                "file",
                reqwest::multipart::Part::bytes(csv.as_bytes().to_vec())
                    .file_name("qa.csv")
                    .mime_str("text/csv")
                    .unwrap(),
            );
        client()
            .post(format!("{}/api/v1/admin/knowledge/qa/upload", base))
            .multipart(form)
            .send()
            .await
            .unwrap()
            .json::<serde_json::Value>()
            .await
            .unwrap()
    };

    let first = upload(csv, server.base_url.clone()).await;
    assert_eq!(first["imported"], 2);
    assert_eq!(first["duplicates"], 0);

    let second = upload(csv, server.base_url.clone()).await;
    assert_eq!(second["imported"], 0);
    assert_eq!(second["duplicates"], 2);
}

#[tokio::test]
async fn test_upload_rejects_wrong_extension() {
    let server = spawn_server(|_| {}).await;
    create_project(&server, "demo", "x").await;

    let form = reqwest::multipart::Form::new()
        .text("project", "demo")
        .part(
            "file",
            reqwest::multipart::Part::bytes(b"not a spreadsheet".to_vec())
                .file_name("malware.exe")
                .mime_str("application/octet-stream")
                .unwrap(),
        );
    let response = client()
        .post(format!(
            "{}/api/v1/admin/knowledge/qa/upload",
            server.base_url
        ))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_crawler_status_idle_and_stop_noop() {
    let server = spawn_server(|_| {}).await;
    create_project(&server, "demo", "x").await;

    let status: serde_json::Value = client()
        .get(format!(
            "{}/api/v1/crawler/status?project=demo",
            server.base_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "idle");

    let stop = client()
        .post(format!("{}/api/v1/crawler/stop", server.base_url))
        .json(&serde_json::json!({ "project": "demo" }))
        .send()
        .await
        .unwrap();
    assert_eq!(stop.status(), 200);
}

#[tokio::test]
async fn test_csrf_required_when_configured() {
    let server = spawn_server(|config| {
        config.server.csrf_secret_key = Some("sekrit".into());
    })
    .await;

    let without = client()
        .post(format!("{}/api/v1/projects", server.base_url))
        .json(&serde_json::json!({ "slug": "demo" }))
        .send()
        .await
        .unwrap();
    assert_eq!(without.status(), 400);

    let with = client()
        .post(format!("{}/api/v1/projects", server.base_url))
        .header("x-csrf-token", "sekrit")
        .json(&serde_json::json!({ "slug": "demo" }))
        .send()
        .await
        .unwrap();
    assert_eq!(with.status(), 200);
}

#[tokio::test]
async fn test_voice_session_requires_voice_enabled() {
    let server = spawn_server(|_| {}).await;
    create_project(&server, "demo", "x").await;

    let response = client()
        .post(format!("{}/api/v1/voice/session/start", server.base_url))
        .json(&serde_json::json!({ "project": "demo", "language": "en-US" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn test_llm_servers_readout() {
    let backend = httpmock::MockServer::start();
    let backend_url = backend.base_url();
    let server = spawn_server(move |config| {
        config.llm.servers = vec![backend_url.clone()];
    })
    .await;

    let servers: serde_json::Value = client()
        .get(format!("{}/api/v1/llm/servers", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(servers.as_array().unwrap().len(), 1);
    assert_eq!(servers[0]["health"], "unknown");
}
