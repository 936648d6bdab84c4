//! HTTP adapters against a local stub server: the JSON data backend, the
//! chat completions generator, and a full engine run over both.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use analyst::{ChatCompletionsGenerator, HttpJsonBackend, LlmEndpoint};
use analyst_coordination::data::{BackendLocator, BackendSet, BoundParam, QueryRegistry};
use analyst_coordination::debate::TurnType;
use analyst_coordination::{
    AnalysisContext, AnalysisEngine, AnalystConfig, BackendError, ComplexityTier,
    FactConsistencyVerifier, GenerationError, ParticipantRole, QueryBackend, RunOptions,
    SessionStatus, TextGenerator, TurnConstraints,
};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

type Routes = Arc<dyn Fn(&str) -> (u16, String) + Send + Sync>;

/// Serve `routes(request_line)` until the test ends; returns the base URL
/// and a log of request lines.
async fn stub_server(routes: Routes) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&log);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let routes = Arc::clone(&routes);
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let header_end = loop {
                    let n = socket.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };
                let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                let length = head
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                while buf.len() < header_end + length {
                    let n = socket.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }

                let request_line = head.lines().next().unwrap_or_default().to_string();
                seen.lock().unwrap().push(request_line.clone());
                let (status, body) = routes(&request_line);
                let response = format!(
                    "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{}", addr), log)
}

fn chat_body(text: &str) -> String {
    json!({"choices": [{"message": {"role": "assistant", "content": text}}]}).to_string()
}

fn endpoint(base: &str) -> LlmEndpoint {
    LlmEndpoint {
        url: format!("{}/v1", base),
        model: "stub-model".into(),
        api_key: Some("test-key".into()),
        temperature: 0.0,
        request_timeout: Duration::from_secs(5),
    }
}

fn constraints() -> TurnConstraints {
    TurnConstraints {
        turn_type: TurnType::Opening,
        require_citations: true,
        allowed_query_ids: vec!["unemployment_rate".into()],
        max_words: 120,
    }
}

// ── Data backend ─────────────────────────────────────────────────

#[tokio::test]
async fn test_http_backend_sends_params_and_reads_pointer() {
    let (base, log) = stub_server(Arc::new(|_line: &str| {
        (
            200,
            json!({"observations": [{"date": "2024-06-01", "value": "4.1"}]}).to_string(),
        )
    }))
    .await;

    let backend = HttpJsonBackend::new(Duration::from_secs(5)).unwrap();
    let locator = BackendLocator::Http {
        url: format!("{}/series", base),
        params: vec!["region".into()],
        rows_pointer: Some("/observations".into()),
    };
    let rows = backend
        .execute(
            &locator,
            &[BoundParam {
                name: "region".into(),
                value: json!("US"),
            }],
        )
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["value"], json!("4.1"));
    let requests = log.lock().unwrap().clone();
    assert!(requests[0].starts_with("GET /series?region=US"), "{:?}", requests);
}

#[tokio::test]
async fn test_http_backend_maps_server_errors_to_transient() {
    let (base, _log) = stub_server(Arc::new(|_line: &str| (503, "{}".to_string()))).await;

    let backend = HttpJsonBackend::new(Duration::from_secs(5)).unwrap();
    let locator = BackendLocator::Http {
        url: format!("{}/series", base),
        params: vec![],
        rows_pointer: None,
    };
    assert!(matches!(
        backend.execute(&locator, &[]).await,
        Err(BackendError::Transient(_))
    ));
}

// ── Generator ────────────────────────────────────────────────────

#[tokio::test]
async fn test_generator_posts_chat_completion() {
    let (base, log) = stub_server(Arc::new(|_line: &str| {
        (200, chat_body("Unemployment is 4.1% [src:unemployment_rate]."))
    }))
    .await;

    let generator = ChatCompletionsGenerator::new(endpoint(&base)).unwrap();
    let text = generator
        .generate(ParticipantRole::Economist, "context", &constraints())
        .await
        .unwrap();

    assert_eq!(text, "Unemployment is 4.1% [src:unemployment_rate].");
    assert_eq!(log.lock().unwrap()[0], "POST /v1/chat/completions HTTP/1.1");
}

#[tokio::test]
async fn test_generator_rate_limit_is_reported() {
    let (base, _log) = stub_server(Arc::new(|_line: &str| (429, "{}".to_string()))).await;

    let generator = ChatCompletionsGenerator::new(endpoint(&base)).unwrap();
    let err = generator
        .generate(ParticipantRole::Quant, "context", &constraints())
        .await
        .unwrap_err();
    assert!(matches!(err, GenerationError::RateLimited(_)));
}

// ── Full run ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_engine_over_http_adapters() {
    let (base, _log) = stub_server(Arc::new(|line: &str| {
        if line.contains("/chat/completions") {
            (200, chat_body("Unemployment is 4.1% [src:unemployment_rate]."))
        } else {
            (
                200,
                json!([{"region": "US", "period": "2024-06-01", "unemployment_rate": 4.1}])
                    .to_string(),
            )
        }
    }))
    .await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queries.toml");
    std::fs::write(
        &path,
        format!(
            r#"
[[datasets]]
id = "labor"
source_type = "labor_api"

[[queries]]
query_id = "unemployment_rate"
dataset = "labor"
unit = "percent"
metric_fields = ["unemployment_rate"]
date_field = "period"
backend_locator = {{ type = "http", url = "{}/labor", params = ["region"] }}

[[routes]]
dataset = "labor"
keywords = ["unemployment"]
params = {{ region = "US" }}
"#,
            base
        ),
    )
    .unwrap();

    let registry = Arc::new(QueryRegistry::from_path(&path).unwrap());
    let backends = BackendSet::new().with(Arc::new(HttpJsonBackend::new(Duration::from_secs(5)).unwrap()));
    let ctx = AnalysisContext::new(
        AnalystConfig::default(),
        registry,
        backends,
        Arc::new(ChatCompletionsGenerator::new(endpoint(&base)).unwrap()),
        Arc::new(FactConsistencyVerifier::default()),
    );
    let engine = AnalysisEngine::new(ctx.shared());

    let result = engine
        .run_with(
            "Is unemployment rising?",
            &RunOptions {
                tier: Some(ComplexityTier::Simple),
                ..RunOptions::default()
            },
        )
        .await;

    assert_eq!(result.session_status, SessionStatus::Done);
    assert_eq!(result.citations_used, vec!["unemployment_rate".to_string()]);
    assert!(result.data_gaps.is_empty());
    assert!(result.verification.supported > 0);
}
