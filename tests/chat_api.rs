//! End-to-end HTTP API tests: the real router and pipeline served
//! in-process over a temporary database, with the generation provider
//! replaced by a local mock that records every request it receives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

use scope_rag::config::{
    AuthConfig, ChunkingConfig, Config, DbConfig, EmbeddingConfig, LlmConfig, RetrievalConfig,
    ServerConfig,
};
use scope_rag::db;
use scope_rag::index::SqliteIndex;
use scope_rag::llm::{create_generation_client, GenerationClient};
use scope_rag::migrate;
use scope_rag::server::{build_router, AppState};

// ============ Mock generation endpoint ============

#[derive(Clone, Default)]
struct MockLlm {
    requests: Arc<Mutex<Vec<Value>>>,
    fail: Arc<AtomicBool>,
}

impl MockLlm {
    fn last_request(&self) -> Value {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

async fn mock_completions(State(mock): State<MockLlm>, Json(body): Json<Value>) -> Response {
    mock.requests.lock().unwrap().push(body);
    if mock.fail.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "mock outage").into_response();
    }
    Json(json!({
        "choices": [{"message": {"content": "mock answer"}}]
    }))
    .into_response()
}

async fn spawn_mock_llm() -> (String, MockLlm) {
    let mock = MockLlm::default();
    let app = Router::new()
        .route("/chat/completions", post(mock_completions))
        .with_state(mock.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (url, mock)
}

// ============ App under test ============

struct TestApp {
    base: String,
    client: reqwest::Client,
    mock: MockLlm,
    _tmp: TempDir,
}

async fn spawn_app() -> TestApp {
    let (mock_url, mock) = spawn_mock_llm().await;

    // The Groq client requires the key at construction; the mock never
    // checks it.
    std::env::set_var("GROQ_API_KEY", "test-key");

    let tmp = TempDir::new().unwrap();
    let config = Config {
        db: DbConfig {
            path: tmp.path().join("rag.sqlite"),
        },
        server: ServerConfig::default(),
        auth: AuthConfig {
            token_secret: Some("api-test-secret".to_string()),
            token_ttl_hours: 24,
        },
        chunking: ChunkingConfig::default(),
        retrieval: RetrievalConfig::default(),
        llm: LlmConfig {
            provider: "groq".to_string(),
            model: None,
            url: Some(mock_url),
            timeout_secs: 5,
        },
        embedding: EmbeddingConfig::default(),
    };

    migrate::run_migrations(&config).await.unwrap();
    let pool = db::connect(&config).await.unwrap();
    let index = Arc::new(SqliteIndex::new(pool.clone(), config.embedding.clone()));
    let llm: Arc<dyn GenerationClient> = create_generation_client(&config.llm).unwrap().into();

    let state = AppState {
        config: Arc::new(config),
        pool,
        index,
        llm,
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        base,
        client: reqwest::Client::new(),
        mock,
        _tmp: tmp,
    }
}

impl TestApp {
    async fn signup(&self, email: &str) -> String {
        let res = self
            .client
            .post(format!("{}/api/v1/auth/signup", self.base))
            .json(&json!({"email": email, "password": "pw123"}))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);
        let body: Value = res.json().await.unwrap();
        body["access_token"].as_str().unwrap().to_string()
    }

    async fn create_conversation(&self, token: &str) -> String {
        let res = self
            .client
            .post(format!("{}/api/v1/conversations", self.base))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);
        let body: Value = res.json().await.unwrap();
        body["convo_id"].as_str().unwrap().to_string()
    }

    async fn upload(&self, token: &str, path: &str, filename: &str, bytes: &[u8]) -> Value {
        let part = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let res = self
            .client
            .post(format!("{}{}", self.base, path))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);
        res.json().await.unwrap()
    }

    async fn ask(&self, token: &str, convo_id: &str, message: &str) -> Value {
        let res = self
            .client
            .post(format!("{}/api/v1/conversations/{}/ask", self.base, convo_id))
            .bearer_auth(token)
            .json(&json!({"message": message}))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);
        res.json().await.unwrap()
    }
}

// ============ Health and auth ============

#[tokio::test]
async fn health_reports_version() {
    let app = spawn_app().await;
    let res = app
        .client
        .get(format!("{}/health", app.base))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn signup_login_and_token_use() {
    let app = spawn_app().await;
    app.signup("user@example.com").await;

    // Duplicate signup is rejected with the structured error body.
    let res = app
        .client
        .post(format!("{}/api/v1/auth/signup", app.base))
        .json(&json!({"email": "user@example.com", "password": "other"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert_eq!(body["error"]["message"], "Email already registered");

    // Login with the form endpoint.
    let res = app
        .client
        .post(format!("{}/api/v1/auth/token", app.base))
        .form(&[("username", "user@example.com"), ("password", "pw123")])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["token_type"], "bearer");
    let token = body["access_token"].as_str().unwrap();

    // The fresh token opens protected routes.
    app.create_conversation(token).await;
}

#[tokio::test]
async fn wrong_password_is_unauthorized() {
    let app = spawn_app().await;
    app.signup("user@example.com").await;

    let res = app
        .client
        .post(format!("{}/api/v1/auth/token", app.base))
        .form(&[("username", "user@example.com"), ("password", "wrong")])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"]["message"], "Incorrect username or password");
}

#[tokio::test]
async fn protected_routes_reject_missing_or_forged_tokens() {
    let app = spawn_app().await;

    let res = app
        .client
        .post(format!("{}/api/v1/conversations", app.base))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);

    let res = app
        .client
        .post(format!("{}/api/v1/conversations", app.base))
        .bearer_auth("forged.token")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"]["message"], "Could not validate credentials");
}

// ============ Conversations ============

#[tokio::test]
async fn conversations_list_only_the_callers() {
    let app = spawn_app().await;
    let token_a = app.signup("a@example.com").await;
    let token_b = app.signup("b@example.com").await;

    let convo_a = app.create_conversation(&token_a).await;
    app.create_conversation(&token_b).await;

    let res = app
        .client
        .get(format!("{}/api/v1/conversations", app.base))
        .bearer_auth(&token_a)
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    let listed: Vec<&str> = body["conversations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(listed, vec![convo_a.as_str()]);
}

// ============ The scoped retrieval flow ============

#[tokio::test]
async fn scoped_ask_flow_with_citations_and_history() {
    let app = spawn_app().await;
    let token = app.signup("pilot@example.com").await;
    let convo = app.create_conversation(&token).await;

    // Private document in the conversation scope, shared one in global.
    let body = app
        .upload(
            &token,
            &format!("/api/v1/conversations/{}/documents", convo),
            "mission.txt",
            b"Project OMEGA-99 launch code is delta-five.",
        )
        .await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["chunks_added"], 1);

    let body = app
        .upload(
            &token,
            "/api/v1/conversations/documents/global",
            "policy.txt",
            b"Directive ALPHA-11 requires visitor badges.",
        )
        .await;
    assert_eq!(body["status"], "ok");

    // A question matching both scopes cites local material first.
    let response = app
        .ask(&token, &convo, "Tell me about OMEGA-99 and ALPHA-11")
        .await;
    assert_eq!(response["answer"], "mock answer");
    let citations = response["citations"].as_array().unwrap();
    assert_eq!(citations.len(), 2);
    assert_eq!(citations[0]["source"], "mission.txt");
    assert_eq!(citations[1]["source"], "policy.txt");
    assert_eq!(citations[0]["chunk_id"], format!("{}:mission.txt:0", convo));

    // The provider saw both chunks in the system prompt, local first.
    let request = app.mock.last_request();
    let system = request["messages"][0]["content"].as_str().unwrap();
    assert_eq!(request["messages"][0]["role"], "system");
    let local_pos = system.find("delta-five").unwrap();
    let global_pos = system.find("visitor badges").unwrap();
    assert!(local_pos < global_pos);

    // The exchange was persisted with one shared timestamp.
    let res = app
        .client
        .get(format!("{}/api/v1/conversations/{}/history", app.base, convo))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    let history = body["history"].as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["role"], "user");
    assert_eq!(history[1]["role"], "assistant");
    assert_eq!(history[0]["timestamp"], history[1]["timestamp"]);
}

#[tokio::test]
async fn private_documents_never_leak_into_other_conversations() {
    let app = spawn_app().await;
    let token = app.signup("pilot@example.com").await;
    let convo_a = app.create_conversation(&token).await;
    let convo_b = app.create_conversation(&token).await;

    app.upload(
        &token,
        "/api/v1/conversations/documents/global",
        "key.txt",
        b"The Secret Global Key is OMEGA-99.",
    )
    .await;
    app.upload(
        &token,
        &format!("/api/v1/conversations/{}/documents", convo_a),
        "private.txt",
        b"The Private Code for A is ALPHA-11.",
    )
    .await;

    // Conversation A can reach the global corpus.
    let response = app.ask(&token, &convo_a, "What is the Global Key?").await;
    let citations = response["citations"].as_array().unwrap();
    assert!(citations.iter().any(|c| c["source"] == "key.txt"));

    // A fresh conversation never sees A's private file.
    let response = app.ask(&token, &convo_b, "What is the Private Code?").await;
    let citations = response["citations"].as_array().unwrap();
    assert!(citations.iter().all(|c| c["source"] != "private.txt"));
}

#[tokio::test]
async fn second_ask_carries_prior_turns_to_the_provider() {
    let app = spawn_app().await;
    let token = app.signup("pilot@example.com").await;
    let convo = app.create_conversation(&token).await;

    app.ask(&token, &convo, "first question").await;
    app.ask(&token, &convo, "second question").await;

    let request = app.mock.last_request();
    let messages = request["messages"].as_array().unwrap();
    // system + two prior turns + the new question.
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[1]["content"], "first question");
    assert_eq!(messages[2]["content"], "mock answer");
    assert_eq!(messages[3]["content"], "second question");
}

#[tokio::test]
async fn ask_without_documents_sends_the_sentinel_context() {
    let app = spawn_app().await;
    let token = app.signup("pilot@example.com").await;
    let convo = app.create_conversation(&token).await;

    let response = app.ask(&token, &convo, "anything at all").await;
    assert_eq!(response["answer"], "mock answer");
    assert!(response["citations"].as_array().unwrap().is_empty());

    let request = app.mock.last_request();
    let system = request["messages"][0]["content"].as_str().unwrap();
    assert!(system.contains("No relevant documents found."));
}

#[tokio::test]
async fn foreign_conversation_folds_into_access_denied_answer() {
    let app = spawn_app().await;
    let token_a = app.signup("a@example.com").await;
    let token_b = app.signup("b@example.com").await;
    let convo_a = app.create_conversation(&token_a).await;

    let response = app.ask(&token_b, &convo_a, "let me in").await;
    assert_eq!(
        response["answer"],
        "Access denied: conversation not found or not owned by you."
    );

    // Non-ask routes surface plain not-found instead.
    let res = app
        .client
        .get(format!("{}/api/v1/conversations/{}/history", app.base, convo_a))
        .bearer_auth(&token_b)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn provider_outage_folds_into_the_answer() {
    let app = spawn_app().await;
    let token = app.signup("pilot@example.com").await;
    let convo = app.create_conversation(&token).await;

    app.mock.fail.store(true, Ordering::SeqCst);
    let response = app.ask(&token, &convo, "anything").await;
    let answer = response["answer"].as_str().unwrap();
    assert!(answer.starts_with("An error occurred while answering:"));

    // Nothing was persisted for the failed exchange.
    let res = app
        .client
        .get(format!("{}/api/v1/conversations/{}/history", app.base, convo))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert!(body["history"].as_array().unwrap().is_empty());
}

// ============ Documents ============

#[tokio::test]
async fn unsupported_upload_reports_error_without_failing() {
    let app = spawn_app().await;
    let token = app.signup("pilot@example.com").await;
    let convo = app.create_conversation(&token).await;

    let body = app
        .upload(
            &token,
            &format!("/api/v1/conversations/{}/documents", convo),
            "binary.exe",
            b"\x00\x01\x02",
        )
        .await;
    assert_eq!(body["status"], "error");
    assert_eq!(body["chunks_added"], 0);
}

#[tokio::test]
async fn documents_can_be_listed_and_deleted() {
    let app = spawn_app().await;
    let token = app.signup("pilot@example.com").await;
    let convo = app.create_conversation(&token).await;
    let docs_path = format!("/api/v1/conversations/{}/documents", convo);

    app.upload(&token, &docs_path, "one.txt", b"first document about herons")
        .await;
    app.upload(&token, &docs_path, "two.txt", b"second document about cranes")
        .await;

    let res = app
        .client
        .get(format!("{}{}", app.base, docs_path))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    let documents: Vec<&str> = body["documents"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(documents, vec!["one.txt", "two.txt"]);

    let res = app
        .client
        .delete(format!("{}{}/one.txt", app.base, docs_path))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "deleted");
    assert_eq!(body["chunks_removed"], 1);

    // The deleted document no longer surfaces in retrieval.
    let response = app.ask(&token, &convo, "herons").await;
    assert!(response["citations"].as_array().unwrap().is_empty());

    let res = app
        .client
        .get(format!("{}{}", app.base, docs_path))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["documents"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn reuploading_a_document_replaces_its_chunks() {
    let app = spawn_app().await;
    let token = app.signup("pilot@example.com").await;
    let convo = app.create_conversation(&token).await;
    let docs_path = format!("/api/v1/conversations/{}/documents", convo);

    app.upload(&token, &docs_path, "notes.txt", b"old content about ospreys")
        .await;
    let body = app
        .upload(&token, &docs_path, "notes.txt", b"new content about kestrels")
        .await;
    assert_eq!(body["chunks_added"], 1);

    // The old text is gone, the new one retrievable.
    let response = app.ask(&token, &convo, "ospreys").await;
    assert!(response["citations"].as_array().unwrap().is_empty());
    let response = app.ask(&token, &convo, "kestrels").await;
    assert_eq!(response["citations"].as_array().unwrap().len(), 1);
}
