use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, Method as AxumMethod, StatusCode, Uri},
    response::IntoResponse,
    Json, Router,
};
use resilient_http::{
    header::{self, HeaderValue},
    http_client_factory,
    logger::{LogEntry, LogLevel, MemoryLogger},
    observer::RequestObserver,
    AttachTokenProvider, BoxError, ClientConfig, ClientCredentials, ClientOptions, ErrorCode,
    HttpClient, HttpClientError, Method, OidcSession, RequestEnvelope, Result as ClientResult,
};
use serde_json::{json, Value as JsonValue};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

#[derive(Clone)]
struct MockResponse {
    status: StatusCode,
    body: JsonValue,
    delay: Duration,
}

impl MockResponse {
    fn json(status: StatusCode, body: JsonValue) -> Self {
        Self {
            status,
            body,
            delay: Duration::from_millis(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone, Debug)]
struct RecordedRequest {
    method: String,
    path: String,
    headers: HeaderMap,
}

impl RecordedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

#[derive(Clone)]
struct MockState {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

async fn mock_handler(
    State(state): State<MockState>,
    method: AxumMethod,
    uri: Uri,
    headers: HeaderMap,
    _body: String,
) -> impl IntoResponse {
    state
        .requests
        .lock()
        .expect("request log mutex must not be poisoned")
        .push(RecordedRequest {
            method: method.to_string(),
            path: uri.path().to_owned(),
            headers,
        });

    let response = {
        let mut queue = state
            .responses
            .lock()
            .expect("response queue mutex must not be poisoned");
        queue.pop_front().unwrap_or_else(|| {
            MockResponse::json(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "no mock response available"}),
            )
        })
    };

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    (response.status, Json(response.body))
}

struct TestServer {
    base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .expect("request log mutex must not be poisoned")
            .clone()
    }

    fn hits(&self) -> usize {
        self.requests().len()
    }
}

async fn spawn_server(responses: Vec<MockResponse>) -> TestServer {
    let state = MockState {
        responses: Arc::new(Mutex::new(responses.into())),
        requests: Arc::new(Mutex::new(Vec::new())),
    };

    let app = Router::new()
        .fallback(mock_handler)
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        requests: state.requests,
        task,
    }
}

/// What the raw server does with the next connection.
enum RawAction {
    /// Read the request, then close the socket without answering.
    Drop,
    Respond(u16, &'static str),
}

/// Plain TCP server used to simulate connections that die mid-request.
struct FlakyServer {
    base_url: String,
    request_heads: Arc<Mutex<Vec<String>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for FlakyServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FlakyServer {
    fn hits(&self) -> usize {
        self.request_heads
            .lock()
            .expect("request log mutex must not be poisoned")
            .len()
    }

    fn authorization_of(&self, index: usize) -> Option<String> {
        let heads = self
            .request_heads
            .lock()
            .expect("request log mutex must not be poisoned");
        heads.get(index).and_then(|head| {
            head.lines().find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("authorization")
                    .then(|| value.trim().to_owned())
            })
        })
    }
}

async fn spawn_flaky_server(actions: Vec<RawAction>) -> FlakyServer {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let request_heads = Arc::new(Mutex::new(Vec::new()));
    let heads = request_heads.clone();

    let task = tokio::spawn(async move {
        let mut actions: VecDeque<RawAction> = actions.into();
        while let Ok((mut socket, _)) = listener.accept().await {
            let head = read_request_head(&mut socket).await;
            heads
                .lock()
                .expect("request log mutex must not be poisoned")
                .push(head);

            match actions.pop_front().unwrap_or(RawAction::Drop) {
                RawAction::Drop => drop(socket),
                RawAction::Respond(status, body) => {
                    let response = format!(
                        "HTTP/1.1 {status} OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                }
            }
        }
    });

    FlakyServer {
        base_url: format!("http://{address}"),
        request_heads,
        task,
    }
}

async fn read_request_head(socket: &mut tokio::net::TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.windows(4).any(|window| window == b"\r\n\r\n") {
                    break;
                }
            }
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    drop(listener);
    format!("http://{address}")
}

fn fast_options() -> ClientOptions {
    ClientOptions {
        timeout_ms: 2_000,
        max_retries: 3,
        retry_backoff_ms: 1,
        ..ClientOptions::default()
    }
}

fn retry_logs(logger: &MemoryLogger) -> Vec<LogEntry> {
    logger.matching(LogLevel::Info, "Retrying http call")
}

async fn build_client(config: ClientConfig) -> HttpClient {
    http_client_factory(config)
        .build()
        .await
        .expect("client must build")
}

#[tokio::test]
async fn get_succeeds_after_two_network_failures() {
    let server = spawn_flaky_server(vec![
        RawAction::Drop,
        RawAction::Drop,
        RawAction::Respond(200, r#"{"items":[]}"#),
    ])
    .await;
    let logger = MemoryLogger::new();
    let client = build_client(
        ClientConfig::new()
            .base_url(server.base_url.clone())
            .get_token(|| async { Ok::<_, BoxError>("T1".to_owned()) })
            .logger(Arc::new(logger.clone()))
            .options(fast_options()),
    )
    .await;

    let response = client.get("/items").await.expect("third attempt must succeed");

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json::<JsonValue>().expect("json body"), json!({"items": []}));
    assert_eq!(server.hits(), 3);
    assert_eq!(server.authorization_of(2).as_deref(), Some("T1"));

    let retries = retry_logs(&logger);
    assert_eq!(retries.len(), 2);
    assert_eq!(retries[0].fields["retryCount"], 1);
    assert_eq!(retries[1].fields["retryCount"], 2);
    assert_eq!(retries[0].fields["errorCode"], "ERR_NETWORK");
    assert_eq!(retries[0].fields["method"], "GET");
    assert_eq!(retries[0].fields["url"], "/items");
    assert_eq!(retries[0].fields["baseURL"], server.base_url.as_str());
}

#[tokio::test]
async fn post_conflict_fails_immediately_and_logs_only_safe_fields() {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::CONFLICT,
        json!({"error": "duplicate", "ssn": "123-45-6789"}),
    )])
    .await;
    let logger = MemoryLogger::new();
    let client = build_client(
        ClientConfig::new()
            .base_url(server.base_url.clone())
            .get_token(|| async { Ok::<_, BoxError>("T1".to_owned()) })
            .logger(Arc::new(logger.clone()))
            .options(fast_options()),
    )
    .await;

    let err = client
        .post_json("/items", &json!({"name": "widget"}))
        .await
        .expect_err("conflict must fail");

    let transport = err.as_transport().expect("must be a transport error");
    assert_eq!(transport.status, Some(409));
    assert_eq!(transport.code, Some(ErrorCode::BadRequest));
    let body = transport
        .response
        .as_ref()
        .map(|response| response.body.clone())
        .expect("response must be kept for the caller");
    assert!(body.contains("duplicate"));

    assert_eq!(server.hits(), 1);
    assert!(retry_logs(&logger).is_empty());

    let errors = logger.matching(LogLevel::Error, "http call error");
    assert_eq!(errors.len(), 1);
    let mut keys: Vec<&str> = errors[0].fields.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(keys, ["cause", "code", "message", "status"]);
    let rendered = serde_json::to_string(&errors[0].fields).expect("fields serialize");
    assert!(!rendered.contains("123-45-6789"));
    assert!(!rendered.contains("widget"));
}

#[tokio::test]
async fn retry_disabled_fails_on_first_network_error() {
    let logger = MemoryLogger::new();
    let client = build_client(
        ClientConfig::new()
            .base_url(closed_port_url().await)
            .with_retry(false)
            .logger(Arc::new(logger.clone()))
            .options(fast_options()),
    )
    .await;

    let err = client.get("/items").await.expect_err("refused connection must fail");

    assert_eq!(
        err.as_transport().and_then(|transport| transport.code),
        Some(ErrorCode::Network)
    );
    assert!(retry_logs(&logger).is_empty());
    assert_eq!(logger.matching(LogLevel::Debug, "Making http call").len(), 1);
    assert_eq!(logger.matching(LogLevel::Error, "http call error").len(), 1);
}

#[tokio::test]
async fn retry_budget_caps_attempts_at_four() {
    let server = spawn_flaky_server(Vec::new()).await;
    let logger = MemoryLogger::new();
    let client = build_client(
        ClientConfig::new()
            .base_url(server.base_url.clone())
            .logger(Arc::new(logger.clone()))
            .options(fast_options()),
    )
    .await;

    let err = client.get("/items").await.expect_err("every attempt must fail");

    assert!(matches!(err, HttpClientError::Transport(_)));
    assert_eq!(server.hits(), 4);
    let counts: Vec<JsonValue> = retry_logs(&logger)
        .into_iter()
        .map(|entry| entry.fields["retryCount"].clone())
        .collect();
    assert_eq!(counts, [json!(1), json!(2), json!(3)]);
}

#[tokio::test]
async fn idempotent_get_is_retried_on_server_error() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::SERVICE_UNAVAILABLE, json!({"error": "busy"})),
        MockResponse::json(StatusCode::OK, json!({"id": 1})),
    ])
    .await;
    let logger = MemoryLogger::new();
    let client = build_client(
        ClientConfig::new()
            .base_url(server.base_url.clone())
            .logger(Arc::new(logger.clone()))
            .options(fast_options()),
    )
    .await;

    let response = client.get("/items/1").await.expect("retry must succeed");

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(server.hits(), 2);
    let retries = retry_logs(&logger);
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].fields["errorCode"], "ERR_BAD_RESPONSE");
}

#[tokio::test]
async fn post_is_not_retried_on_server_error() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::SERVICE_UNAVAILABLE, json!({"error": "busy"})),
        MockResponse::json(StatusCode::CREATED, json!({"id": 1})),
    ])
    .await;
    let logger = MemoryLogger::new();
    let client = build_client(
        ClientConfig::new()
            .base_url(server.base_url.clone())
            .logger(Arc::new(logger.clone()))
            .options(fast_options()),
    )
    .await;

    let err = client
        .post_json("/items", &json!({"name": "widget"}))
        .await
        .expect_err("server error must surface");

    assert_eq!(err.as_transport().and_then(|t| t.status), Some(503));
    assert_eq!(server.hits(), 1);
    assert!(retry_logs(&logger).is_empty());
}

#[tokio::test]
async fn timed_out_post_is_retried() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::CREATED, json!({"id": 1}))
            .with_delay(Duration::from_millis(300)),
        MockResponse::json(StatusCode::CREATED, json!({"id": 2})),
    ])
    .await;
    let logger = MemoryLogger::new();
    let client = build_client(
        ClientConfig::new()
            .base_url(server.base_url.clone())
            .logger(Arc::new(logger.clone()))
            .options(ClientOptions {
                timeout_ms: 50,
                max_retries: 3,
                retry_backoff_ms: 1,
                ..ClientOptions::default()
            }),
    )
    .await;

    let response = client
        .post_json("/items", &json!({"name": "widget"}))
        .await
        .expect("second attempt must succeed");

    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(server.hits(), 2);
    let retries = retry_logs(&logger);
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].fields["errorCode"], "ECONNABORTED");
}

#[tokio::test]
async fn every_request_gets_a_fresh_token_and_json_content_type() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::OK, json!({})),
        MockResponse::json(StatusCode::OK, json!({})),
    ])
    .await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let client = build_client(
        ClientConfig::new()
            .base_url(server.base_url.clone())
            .get_token(move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok::<_, BoxError>(format!("T{n}"))
                }
            })
            .options(fast_options()),
    )
    .await;

    let plain_text = client
        .request(Method::PUT, "/items/1")
        .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
        .body("not json");
    client.send(plain_text).await.expect("put must succeed");
    client.get("/items").await.expect("get must succeed");

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, "PUT");
    assert_eq!(requests[0].path, "/items/1");
    assert_eq!(requests[0].header("authorization"), Some("T1"));
    assert_eq!(requests[1].header("authorization"), Some("T2"));
    assert_eq!(requests[0].header("content-type"), Some("application/json"));
    assert_eq!(requests[1].header("content-type"), Some("application/json"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn concurrent_calls_keep_their_own_retry_state() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::OK, json!({})),
        MockResponse::json(StatusCode::OK, json!({})),
    ])
    .await;
    let logger = MemoryLogger::new();
    let client = build_client(
        ClientConfig::new()
            .base_url(server.base_url.clone())
            .logger(Arc::new(logger.clone()))
            .options(fast_options()),
    )
    .await;
    let refused = client.request(Method::GET, format!("{}/items", closed_port_url().await));

    let (ok, failed) = tokio::join!(client.get("/items"), client.send(refused));

    ok.expect("call against live server must succeed");
    failed.expect_err("call against closed port must fail");
    assert_eq!(server.hits(), 1);
    assert_eq!(retry_logs(&logger).len(), 3);
}

#[tokio::test]
async fn token_provider_failure_is_not_retried_and_sends_nothing() {
    let server = spawn_server(vec![MockResponse::json(StatusCode::OK, json!({}))]).await;
    let logger = MemoryLogger::new();
    let client = build_client(
        ClientConfig::new()
            .base_url(server.base_url.clone())
            .get_token(|| async { Err::<String, BoxError>("vault sealed".into()) })
            .logger(Arc::new(logger.clone()))
            .options(fast_options()),
    )
    .await;

    let err = client.get("/items").await.expect_err("token failure must surface");

    assert!(matches!(err, HttpClientError::Observer(_)));
    assert_eq!(server.hits(), 0);
    assert!(retry_logs(&logger).is_empty());
    assert!(logger.matching(LogLevel::Error, "http call error").is_empty());
}

struct SessionHeader;

#[async_trait]
impl RequestObserver for SessionHeader {
    async fn on_request(&self, request: &mut RequestEnvelope) -> ClientResult<()> {
        request
            .headers
            .insert("x-session", HeaderValue::from_static("abc"));
        Ok(())
    }
}

struct SessionHook;

#[async_trait]
impl AttachTokenProvider for SessionHook {
    async fn attach(&self, client: &mut HttpClient) -> ClientResult<()> {
        client.add_request_observer(Arc::new(SessionHeader));
        Ok(())
    }
}

#[tokio::test]
async fn get_token_and_attach_hook_both_apply() {
    let server = spawn_server(vec![MockResponse::json(StatusCode::OK, json!({}))]).await;
    let client = build_client(
        ClientConfig::new()
            .base_url(server.base_url.clone())
            .get_token(|| async { Ok::<_, BoxError>("T1".to_owned()) })
            .attach_token_provider(SessionHook)
            .options(fast_options()),
    )
    .await;

    client.get("/items").await.expect("get must succeed");

    let requests = server.requests();
    assert_eq!(requests[0].header("authorization"), Some("T1"));
    assert_eq!(requests[0].header("x-session"), Some("abc"));
}

fn token_body(access_token: &str) -> JsonValue {
    json!({
        "access_token": access_token,
        "token_type": "bearer",
        "expires_in": 3600
    })
}

fn oidc_session(token_server: &TestServer) -> Arc<OidcSession> {
    Arc::new(OidcSession::new(ClientCredentials {
        token_url: format!("{}/oauth/token", token_server.base_url),
        client_id: "svc".to_owned(),
        client_secret: "s3cr3t".to_owned(),
        scope: Some("items:read".to_owned()),
    }))
}

#[tokio::test]
async fn oidc_session_fetches_token_once_and_reuses_it() {
    let token_server =
        spawn_server(vec![MockResponse::json(StatusCode::OK, token_body("one"))]).await;
    let api = spawn_server(vec![
        MockResponse::json(StatusCode::OK, json!({})),
        MockResponse::json(StatusCode::OK, json!({})),
    ])
    .await;
    let client = build_client(
        ClientConfig::new()
            .base_url(api.base_url.clone())
            .attach_token_provider(oidc_session(&token_server))
            .options(fast_options()),
    )
    .await;
    assert_eq!(token_server.hits(), 0);

    client.get("/items").await.expect("first get must succeed");
    client.get("/items").await.expect("second get must succeed");

    assert_eq!(token_server.hits(), 1);
    assert_eq!(token_server.requests()[0].method, "POST");
    let requests = api.requests();
    assert_eq!(requests[0].header("authorization"), Some("Bearer one"));
    assert_eq!(requests[1].header("authorization"), Some("Bearer one"));
}

#[tokio::test]
async fn unauthorized_response_forces_a_new_session_token() {
    let token_server = spawn_server(vec![
        MockResponse::json(StatusCode::OK, token_body("one")),
        MockResponse::json(StatusCode::OK, token_body("two")),
    ])
    .await;
    let api = spawn_server(vec![
        MockResponse::json(StatusCode::UNAUTHORIZED, json!({"error": "expired"})),
        MockResponse::json(StatusCode::OK, json!({})),
    ])
    .await;
    let client = build_client(
        ClientConfig::new()
            .base_url(api.base_url.clone())
            .with_retry(false)
            .attach_token_provider(oidc_session(&token_server))
            .options(fast_options()),
    )
    .await;

    let err = client.get("/items").await.expect_err("401 must surface");
    assert_eq!(err.as_transport().and_then(|t| t.status), Some(401));
    client.get("/items").await.expect("second get must succeed");

    assert_eq!(token_server.hits(), 2);
    let requests = api.requests();
    assert_eq!(requests[0].header("authorization"), Some("Bearer one"));
    assert_eq!(requests[1].header("authorization"), Some("Bearer two"));
}

#[tokio::test]
async fn token_with_unrepresentable_lifetime_is_cached_without_expiry() {
    let token_server = spawn_server(vec![MockResponse::json(
        StatusCode::OK,
        json!({
            "access_token": "forever",
            "token_type": "Bearer",
            "expires_in": u64::MAX
        }),
    )])
    .await;
    let api = spawn_server(vec![
        MockResponse::json(StatusCode::OK, json!({})),
        MockResponse::json(StatusCode::OK, json!({})),
    ])
    .await;
    let client = build_client(
        ClientConfig::new()
            .base_url(api.base_url.clone())
            .attach_token_provider(oidc_session(&token_server))
            .options(fast_options()),
    )
    .await;

    client.get("/items").await.expect("first get must succeed");
    client.get("/items").await.expect("second get must succeed");

    assert_eq!(token_server.hits(), 1);
    let requests = api.requests();
    assert_eq!(requests[0].header("authorization"), Some("Bearer forever"));
    assert_eq!(requests[1].header("authorization"), Some("Bearer forever"));
}

#[tokio::test]
async fn hanging_token_endpoint_fails_the_call_after_the_session_timeout() {
    let token_server = spawn_server(vec![MockResponse::json(StatusCode::OK, token_body("late"))
        .with_delay(Duration::from_secs(5))])
    .await;
    let api = spawn_server(vec![MockResponse::json(StatusCode::OK, json!({}))]).await;
    let session = Arc::new(
        OidcSession::new(ClientCredentials {
            token_url: format!("{}/oauth/token", token_server.base_url),
            client_id: "svc".to_owned(),
            client_secret: "s3cr3t".to_owned(),
            scope: None,
        })
        .with_timeout(Duration::from_millis(100)),
    );
    let client = build_client(
        ClientConfig::new()
            .base_url(api.base_url.clone())
            .attach_token_provider(session)
            .options(fast_options()),
    )
    .await;

    let started = std::time::Instant::now();
    let err = client.get("/items").await.expect_err("token fetch must time out");

    assert!(matches!(err, HttpClientError::Observer(_)));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(api.hits(), 0);
}
