use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ragnote::config::parse_config;
use ragnote::server::{build_state, router};

const BOUNDARY: &str = "ragnote-test-boundary";

async fn setup(extra: &str) -> (TempDir, Router) {
    setup_with_auth(extra, "").await
}

async fn setup_with_auth(extra: &str, auth_extra: &str) -> (TempDir, Router) {
    let tmp = TempDir::new().unwrap();
    let config = parse_config(&format!(
        r#"[db]
path = "{root}/ragnote.sqlite"

[server]
uploads_dir = "{root}/uploads"

{extra}

[auth]
secret = "test-secret"
password_hash_rounds = 1000
{auth_extra}
"#,
        root = tmp.path().display(),
        extra = extra,
        auth_extra = auth_extra
    ))
    .unwrap();

    let state = build_state(&config).await.unwrap();
    (tmp, router(state))
}

fn json_request(method: Method, uri: &str, body: Option<Value>, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn upload_request(field: &str, filename: &str, content: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method(Method::POST)
        .uri("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).to_string())
        })
    };
    (status, value)
}

async fn register_and_login(app: &Router, email: &str) -> String {
    let creds = json!({"email": email, "password": "correct horse"});
    let (status, _) = send(app, json_request(Method::POST, "/register", Some(creds.clone()), None)).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = send(app, json_request(Method::POST, "/login", Some(creds), None)).await;
    assert_eq!(status, StatusCode::OK);
    body["access_token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_reports_ok() {
    let (_tmp, app) = setup("").await;
    let (status, body) = send(&app, json_request(Method::GET, "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["indexed_chunks"], 0);
}

#[tokio::test]
async fn chat_before_any_upload() {
    let (_tmp, app) = setup("").await;
    let (status, body) = send(
        &app,
        json_request(Method::POST, "/chat", Some(json!({"message": "hello?"})), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
    assert_eq!(body["error"]["message"], "No documents uploaded yet.");
}

#[tokio::test]
async fn chat_rejects_empty_message() {
    let (_tmp, app) = setup("").await;
    let (status, body) = send(
        &app,
        json_request(Method::POST, "/chat/", Some(json!({"query": "  "})), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "message must not be empty");
}

#[tokio::test]
async fn upload_chat_and_delete() {
    let (tmp, app) = setup("").await;

    let (status, body) = send(
        &app,
        upload_request("file", "handbook.txt", b"The office closes at 6pm on Fridays."),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["filename"], "handbook.txt");
    assert_eq!(body["chunks"], 1);
    assert_eq!(body["pending"], 0);
    let doc_id = body["document_id"].as_str().unwrap().to_string();
    assert!(tmp.path().join("uploads").join("handbook.txt").exists());

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/chat",
            Some(json!({"message": "When does the office close?"})),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["retrieval_only"], true);
    assert_eq!(body["response"], "The office closes at 6pm on Fridays.");
    assert_eq!(body["sources"][0]["document_id"], doc_id.as_str());

    let (status, body) = send(&app, json_request(Method::GET, "/documents", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["documents"].as_array().unwrap().len(), 1);

    let uri = format!("/documents/{}", doc_id);
    let (status, body) = send(&app, json_request(Method::GET, &uri, None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["chunks"][0]["text"], "The office closes at 6pm on Fridays.");

    let (status, _) = send(&app, json_request(Method::DELETE, &uri, None, None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(!tmp.path().join("uploads").join("handbook.txt").exists());

    let (status, body) = send(&app, json_request(Method::GET, &uri, None, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn reupload_of_same_content_is_unchanged() {
    let (_tmp, app) = setup("").await;

    let (_, first) = send(&app, upload_request("file", "a.md", b"# Title\n\nSome text.")).await;
    let (status, second) = send(&app, upload_request("file", "a.md", b"# Title\n\nSome text.")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["document_id"], second["document_id"]);

    let (_, body) = send(&app, json_request(Method::GET, "/stats", None, None)).await;
    assert_eq!(body["documents"], 1);
}

#[tokio::test]
async fn upload_rejects_unsupported_type() {
    let (_tmp, app) = setup("").await;
    let (status, body) = send(&app, upload_request("file", "setup.exe", b"MZ\x90\x00")).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(body["error"]["code"], "unsupported_media_type");
}

#[tokio::test]
async fn upload_requires_file_field() {
    let (_tmp, app) = setup("").await;
    let (status, body) = send(&app, upload_request("attachment", "a.txt", b"hello")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "multipart field 'file' is required");
}

#[tokio::test]
async fn upload_rejects_empty_text() {
    let (_tmp, app) = setup("").await;
    let (status, body) = send(&app, upload_request("file", "blank.txt", b"   \n  ")).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "unprocessable");
}

#[tokio::test]
async fn register_login_and_conflicts() {
    let (_tmp, app) = setup("").await;
    let token = register_and_login(&app, "ada@example.com").await;
    assert!(!token.is_empty());

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/register",
            Some(json!({"email": "ada@example.com", "password": "another pw"})),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/login",
            Some(json!({"email": "ada@example.com", "password": "wrong"})),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["message"], "Incorrect email or password");
}

#[tokio::test]
async fn invalid_token_rejected() {
    let (_tmp, app) = setup("").await;
    let (status, body) = send(
        &app,
        json_request(Method::GET, "/notes", None, Some("not.a.token")),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn notes_are_scoped_to_their_owner() {
    let (_tmp, app) = setup("").await;
    let ada = register_and_login(&app, "ada@example.com").await;
    let bob = register_and_login(&app, "bob@example.com").await;

    let (status, note) = send(
        &app,
        json_request(
            Method::POST,
            "/notes",
            Some(json!({"title": "Groceries", "content": "eggs"})),
            Some(&ada),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let uri = format!("/notes/{}", note["id"]);

    let (_, body) = send(&app, json_request(Method::GET, "/notes", None, Some(&ada))).await;
    assert_eq!(body["notes"].as_array().unwrap().len(), 1);
    let (_, body) = send(&app, json_request(Method::GET, "/notes", None, Some(&bob))).await;
    assert!(body["notes"].as_array().unwrap().is_empty());
    let (_, body) = send(&app, json_request(Method::GET, "/notes", None, None)).await;
    assert!(body["notes"].as_array().unwrap().is_empty());

    let (status, _) = send(&app, json_request(Method::GET, &uri, None, Some(&bob))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        json_request(Method::PUT, &uri, Some(json!({"content": "eggs, milk"})), Some(&ada)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "Groceries");
    assert_eq!(body["content"], "eggs, milk");

    let (status, _) = send(&app, json_request(Method::DELETE, &uri, None, Some(&bob))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, json_request(Method::DELETE, &uri, None, Some(&ada))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, json_request(Method::GET, &uri, None, Some(&ada))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn note_title_required() {
    let (_tmp, app) = setup("").await;
    let (status, body) = send(
        &app,
        json_request(Method::POST, "/notes", Some(json!({"title": " "})), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
    assert_eq!(body["error"]["message"], "title must not be empty");

    let (_, note) = send(
        &app,
        json_request(Method::POST, "/notes", Some(json!({"title": "ok"})), None),
    )
    .await;
    let uri = format!("/notes/{}", note["id"]);
    let (status, body) = send(
        &app,
        json_request(Method::PUT, &uri, Some(json!({"title": ""})), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn require_auth_blocks_anonymous_callers() {
    let (_tmp, app) = setup_with_auth("", "require_auth = true").await;
    let (status, _) = send(&app, json_request(Method::GET, "/documents", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // registration stays open
    let token = register_and_login(&app, "ada@example.com").await;
    let (status, _) = send(&app, json_request(Method::GET, "/documents", None, Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn semantic_search_without_embeddings() {
    let (_tmp, app) = setup("").await;
    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/search",
            Some(json!({"query": "office", "mode": "semantic"})),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "embeddings_disabled");
}

#[tokio::test]
async fn keyword_search_over_uploads() {
    let (_tmp, app) = setup("").await;
    send(&app, upload_request("file", "a.txt", b"Kubernetes runs the cluster.")).await;
    send(&app, upload_request("file", "b.txt", b"Bread needs flour.")).await;

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/search",
            Some(json!({"query": "kubernetes", "mode": "keyword"})),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["source_id"], "a.txt");
}

#[tokio::test]
async fn chat_uses_language_model() {
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": " At 6pm. "})))
        .expect(1)
        .mount(&llm)
        .await;

    let (_tmp, app) = setup(&format!(
        "[llm]\nprovider = \"ollama\"\nmodel = \"llama3\"\nurl = \"{}\"\nmax_retries = 0\n",
        llm.uri()
    ))
    .await;
    send(&app, upload_request("file", "handbook.txt", b"The office closes at 6pm.")).await;

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/chat",
            Some(json!({"message": "When does the office close?", "top_k": 2})),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["response"], "At 6pm.");
    assert_eq!(body["model"], "llama3");
    assert_eq!(body["retrieval_only"], false);
}

#[tokio::test]
async fn language_model_failure_is_bad_gateway() {
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&llm)
        .await;

    let (_tmp, app) = setup(&format!(
        "[llm]\nprovider = \"llamacpp\"\nurl = \"{}\"\nmax_retries = 0\n",
        llm.uri()
    ))
    .await;
    send(&app, upload_request("file", "handbook.txt", b"The office closes at 6pm.")).await;

    let (status, body) = send(
        &app,
        json_request(Method::POST, "/chat", Some(json!({"message": "office?"})), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "upstream");
}

#[tokio::test]
async fn semantic_search_with_embeddings() {
    let embedder = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[1.0, 0.0]]
        })))
        .mount(&embedder)
        .await;

    let (_tmp, app) = setup(&format!(
        "[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"\ndims = 2\nurl = \"{}\"\nmax_retries = 0\n",
        embedder.uri()
    ))
    .await;

    let (status, body) = send(&app, upload_request("file", "a.txt", b"Vectors are lists of numbers.")).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["embedded"], 1);

    let (_, health) = send(&app, json_request(Method::GET, "/health", None, None)).await;
    assert_eq!(health["indexed_chunks"], 1);

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/search",
            Some(json!({"query": "anything", "mode": "semantic"})),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["results"][0]["source_id"], "a.txt");

    let (status, body) = send(&app, json_request(Method::POST, "/index/sync", None, None)).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["embedded"], 0);
    assert_eq!(body["indexed_chunks"], 1);
}
