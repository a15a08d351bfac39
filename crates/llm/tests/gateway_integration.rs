use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use llm::{
    AskRequest, Config, ConfigKind, GatewayFactory, RetryPolicy, ToolAskRequest, TokenUsage,
};
use parking_lot::Mutex;
use proto::{CanonicalMessage, LlmError, ToolCall, ToolChoice, ToolSpec};
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// Requests observed by a mock provider.
#[derive(Clone, Default)]
struct Recorded {
    hits: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Value>>>,
    headers: Arc<Mutex<Vec<HeaderMap>>>,
}

impl Recorded {
    fn record(&self, headers: HeaderMap, body: Value) -> usize {
        self.bodies.lock().push(body);
        self.headers.lock().push(headers);
        self.hits.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn last_body(&self) -> Value {
        self.bodies.lock().last().cloned().expect("at least one request")
    }
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("mock server");
    });
    format!("http://{addr}")
}

fn factory(config: Config, env: Vec<(&str, String)>) -> GatewayFactory {
    let env: std::collections::HashMap<String, String> = env
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    GatewayFactory::new(config)
        .with_env(Arc::new(move |key| env.get(key).cloned()))
        .with_retry_policy(RetryPolicy::fast())
}

fn openai_env(base: &str) -> Vec<(&'static str, String)> {
    vec![
        ("LLMGATE_PROVIDER", "openai".to_string()),
        ("OPENAI_API_KEY", "sk-test".to_string()),
        ("OPENAI_BASE_URL", format!("{base}/v1")),
        ("OPENAI_MODEL_NAME", "gpt-4o".to_string()),
    ]
}

fn anthropic_env(base: &str) -> Vec<(&'static str, String)> {
    vec![
        ("LLMGATE_PROVIDER", "anthropic".to_string()),
        ("ANTHROPIC_API_KEY", "sk-ant-test".to_string()),
        ("ANTHROPIC_BASE_URL", base.to_string()),
        ("ANTHROPIC_MODEL_NAME", "claude-3-5-sonnet-20241022".to_string()),
    ]
}

fn chat_completion(message: Value, usage: Option<(u64, u64)>) -> Value {
    let mut body = json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "created": 1,
        "model": "gpt-4o",
        "choices": [{ "index": 0, "message": message, "finish_reason": "stop" }],
    });
    if let Some((prompt, completion)) = usage {
        body["usage"] = json!({
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion,
        });
    }
    body
}

fn anthropic_message(text: &str) -> Value {
    json!({
        "id": "msg_1",
        "type": "message",
        "role": "assistant",
        "model": "claude-3-5-sonnet-20241022",
        "content": [{ "type": "text", "text": text }],
        "stop_reason": "end_turn",
        "usage": { "input_tokens": 20, "output_tokens": 5 },
    })
}

fn bash_tool() -> ToolSpec {
    ToolSpec::new(
        "bash",
        "Run a shell command",
        json!({
            "type": "object",
            "properties": { "cmd": { "type": "string" } },
            "required": ["cmd"],
        }),
    )
}

#[tokio::test]
async fn openai_non_streaming_reply_and_reported_usage() {
    async fn handler(
        State(rec): State<Recorded>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        rec.record(headers, body);
        Json(chat_completion(
            json!({ "role": "assistant", "content": "  Hello there  " }),
            Some((11, 7)),
        ))
    }

    let rec = Recorded::default();
    let base = serve(
        Router::new()
            .route("/v1/chat/completions", post(handler))
            .with_state(rec.clone()),
    )
    .await;
    let gateway = factory(Config::default(), openai_env(&base)).gateway(ConfigKind::General, "default");

    let reply = gateway
        .ask(
            AskRequest::new(vec![CanonicalMessage::user("hi")])
                .with_system(vec![CanonicalMessage::system("be brief")])
                .streaming(false),
        )
        .await
        .expect("reply");

    assert_eq!(reply, "  Hello there  ");
    assert_eq!(gateway.usage(), TokenUsage::new(11, 7));

    let body = rec.last_body();
    assert_eq!(body["model"], "gpt-4o");
    assert_eq!(body["max_tokens"], 4096);
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "hi");
    assert!(body.get("tools").is_none());
    let headers = rec.headers.lock();
    assert_eq!(headers[0]["authorization"], "Bearer sk-test");
}

#[tokio::test]
async fn openai_streaming_collects_and_forwards_chunks() {
    async fn handler(State(rec): State<Recorded>, Json(body): Json<Value>) -> Response {
        rec.record(HeaderMap::new(), body);
        let mut sse = String::new();
        for piece in ["Hel", "lo", " world "] {
            let chunk = json!({
                "id": "chatcmpl-1",
                "object": "chat.completion.chunk",
                "created": 1,
                "model": "gpt-4o",
                "choices": [{ "index": 0, "delta": { "content": piece }, "finish_reason": null }],
            });
            sse.push_str(&format!("data: {chunk}\n\n"));
        }
        sse.push_str("data: [DONE]\n\n");
        ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response()
    }

    let rec = Recorded::default();
    let base = serve(
        Router::new()
            .route("/v1/chat/completions", post(handler))
            .with_state(rec.clone()),
    )
    .await;
    let gateway = factory(Config::default(), openai_env(&base)).gateway(ConfigKind::General, "default");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let reply = gateway
        .ask(AskRequest::new(vec![CanonicalMessage::user("greet me")]).with_sink(tx))
        .await
        .expect("streamed reply");

    assert_eq!(reply, "Hello world");
    let mut forwarded = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        forwarded.push(chunk);
    }
    assert_eq!(forwarded, vec!["Hel", "lo", " world "]);

    let usage = gateway.usage();
    assert!(usage.input_tokens > 0);
    assert!(usage.completion_tokens > 0);
    assert_eq!(rec.last_body()["stream"], true);
}

#[tokio::test]
async fn openai_authentication_failure_is_not_retried() {
    async fn handler(State(rec): State<Recorded>, Json(body): Json<Value>) -> Response {
        rec.record(HeaderMap::new(), body);
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": {
                    "message": "Incorrect API key provided: sk-bad",
                    "type": "invalid_request_error",
                    "param": null,
                    "code": "invalid_api_key",
                }
            })),
        )
            .into_response()
    }

    let rec = Recorded::default();
    let base = serve(
        Router::new()
            .route("/v1/chat/completions", post(handler))
            .with_state(rec.clone()),
    )
    .await;
    let gateway = factory(Config::default(), openai_env(&base)).gateway(ConfigKind::General, "default");

    let err = gateway
        .ask(AskRequest::new(vec![CanonicalMessage::user("hi")]).streaming(false))
        .await
        .expect_err("bad key");

    assert!(matches!(err, LlmError::Authentication(_)), "got {err:?}");
    assert_eq!(rec.hits(), 1);
    assert_eq!(gateway.usage(), TokenUsage::default());
}

#[tokio::test]
async fn openai_tool_call_is_adapted() {
    async fn handler(State(rec): State<Recorded>, Json(body): Json<Value>) -> Json<Value> {
        rec.record(HeaderMap::new(), body);
        Json(chat_completion(
            json!({
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": { "name": "bash", "arguments": "{\"cmd\":\"ls\"}" },
                }],
            }),
            Some((30, 12)),
        ))
    }

    let rec = Recorded::default();
    let base = serve(
        Router::new()
            .route("/v1/chat/completions", post(handler))
            .with_state(rec.clone()),
    )
    .await;
    let gateway = factory(Config::default(), openai_env(&base)).gateway(ConfigKind::General, "default");

    let message = gateway
        .ask_tool(
            ToolAskRequest::new(vec![CanonicalMessage::user("list files")], vec![bash_tool()])
                .with_tool_choice(ToolChoice::Required),
        )
        .await
        .expect("tool turn")
        .expect("message with tool calls");

    assert_eq!(message.tool_calls, vec![ToolCall::new("call_1", "bash", "{\"cmd\":\"ls\"}")]);
    assert_eq!(message.tool_calls[0].arguments_value()["cmd"], "ls");
    assert_eq!(gateway.usage(), TokenUsage::new(30, 12));

    let body = rec.last_body();
    assert_eq!(body["tools"][0]["function"]["name"], "bash");
    assert_eq!(body["tool_choice"], "required");
}

#[tokio::test]
async fn openai_empty_tool_reply_yields_none() {
    async fn handler(Json(_body): Json<Value>) -> Json<Value> {
        Json(chat_completion(json!({ "role": "assistant", "content": null }), None))
    }

    let base = serve(Router::new().route("/v1/chat/completions", post(handler))).await;
    let gateway = factory(Config::default(), openai_env(&base)).gateway(ConfigKind::General, "default");

    let reply = gateway
        .ask_tool(ToolAskRequest::new(vec![CanonicalMessage::user("hi")], vec![bash_tool()]))
        .await
        .expect("no error");
    assert!(reply.is_none());
    // No usage reported, so the local input estimate is recorded.
    assert!(gateway.usage().input_tokens > 0);
}

#[tokio::test]
async fn tool_call_timeout_is_retried_then_reported() {
    async fn handler(State(rec): State<Recorded>, Json(body): Json<Value>) -> Json<Value> {
        rec.record(HeaderMap::new(), body);
        tokio::time::sleep(Duration::from_millis(500)).await;
        Json(chat_completion(json!({ "role": "assistant", "content": "late" }), None))
    }

    let rec = Recorded::default();
    let base = serve(
        Router::new()
            .route("/v1/chat/completions", post(handler))
            .with_state(rec.clone()),
    )
    .await;
    let gateway = factory(Config::default(), openai_env(&base)).gateway(ConfigKind::General, "default");

    let err = gateway
        .ask_tool(
            ToolAskRequest::new(vec![CanonicalMessage::user("hi")], vec![bash_tool()])
                .with_timeout(Duration::from_millis(50)),
        )
        .await
        .expect_err("every attempt times out");

    assert!(matches!(err, LlmError::Timeout(d) if d == Duration::from_millis(50)));
    assert_eq!(rec.hits(), 6);
}

#[tokio::test]
async fn anthropic_tool_history_is_paired_and_tools_withheld() {
    async fn handler(
        State(rec): State<Recorded>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        rec.record(headers, body);
        Json(anthropic_message("Found a.txt"))
    }

    let rec = Recorded::default();
    let base = serve(
        Router::new()
            .route("/v1/messages", post(handler))
            .with_state(rec.clone()),
    )
    .await;
    let gateway =
        factory(Config::default(), anthropic_env(&base)).gateway(ConfigKind::General, "default");

    let history = vec![
        CanonicalMessage::user("list files"),
        CanonicalMessage::assistant_tool_calls(
            None,
            vec![ToolCall::new("call_1", "bash", "{\"cmd\":\"ls\"}")],
        ),
        CanonicalMessage::tool_result("call_1", "bash", "a.txt"),
    ];
    let message = gateway
        .ask_tool(
            ToolAskRequest::new(history, vec![bash_tool()])
                .with_system(vec![CanonicalMessage::system("you run commands")]),
        )
        .await
        .expect("tool turn")
        .expect("text reply");

    assert_eq!(message.text().as_deref(), Some("Found a.txt"));
    assert_eq!(gateway.usage(), TokenUsage::new(20, 5));

    let body = rec.last_body();
    assert_eq!(body["system"], "you run commands");
    assert!(body.get("tools").is_none(), "tools follow a tool result: {body}");
    let messages = body["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"][0]["type"], "tool_use");
    assert_eq!(messages[1]["content"][0]["input"]["cmd"], "ls");
    assert_eq!(messages[2]["role"], "user");
    assert_eq!(messages[2]["content"][0]["type"], "tool_result");
    assert_eq!(messages[2]["content"][0]["tool_use_id"], "call_1");

    let headers = rec.headers.lock();
    assert_eq!(headers[0]["x-api-key"], "sk-ant-test");
    assert!(headers[0].contains_key("anthropic-version"));
}

#[tokio::test]
async fn anthropic_server_errors_are_retried() {
    async fn handler(State(rec): State<Recorded>, Json(body): Json<Value>) -> Response {
        let attempt = rec.record(HeaderMap::new(), body);
        if attempt < 3 {
            (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded").into_response()
        } else {
            Json(anthropic_message("recovered")).into_response()
        }
    }

    let rec = Recorded::default();
    let base = serve(
        Router::new()
            .route("/v1/messages", post(handler))
            .with_state(rec.clone()),
    )
    .await;
    let gateway =
        factory(Config::default(), anthropic_env(&base)).gateway(ConfigKind::General, "default");

    let reply = gateway
        .ask(AskRequest::new(vec![CanonicalMessage::user("hi")]).streaming(false))
        .await
        .expect("third attempt succeeds");
    assert_eq!(reply, "recovered");
    assert_eq!(rec.hits(), 3);
}

#[tokio::test]
async fn anthropic_streaming_reads_text_deltas() {
    async fn handler(Json(body): Json<Value>) -> Response {
        assert_eq!(body["stream"], true);
        let events = [
            ("message_start", json!({ "type": "message_start", "message": {} })),
            (
                "content_block_delta",
                json!({ "type": "content_block_delta", "index": 0, "delta": { "type": "text_delta", "text": "Bon" } }),
            ),
            (
                "content_block_delta",
                json!({ "type": "content_block_delta", "index": 0, "delta": { "type": "text_delta", "text": "jour" } }),
            ),
            ("message_stop", json!({ "type": "message_stop" })),
        ];
        let sse: String = events
            .iter()
            .map(|(name, data)| format!("event: {name}\ndata: {data}\n\n"))
            .collect();
        ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response()
    }

    let base = serve(Router::new().route("/v1/messages", post(handler))).await;
    let gateway =
        factory(Config::default(), anthropic_env(&base)).gateway(ConfigKind::General, "default");

    let reply = gateway
        .ask(AskRequest::new(vec![CanonicalMessage::user("say hello in french")]))
        .await
        .expect("streamed reply");
    assert_eq!(reply, "Bonjour");
}

#[tokio::test]
async fn sink_replays_chunks_when_a_stream_is_retried() {
    async fn handler(State(rec): State<Recorded>, Json(body): Json<Value>) -> Response {
        let attempt = rec.record(HeaderMap::new(), body);
        let delta = |text: &str| {
            json!({ "type": "content_block_delta", "index": 0, "delta": { "type": "text_delta", "text": text } })
        };
        let events = if attempt == 1 {
            vec![
                ("content_block_delta", delta("Bon")),
                ("error", json!({ "type": "error", "error": { "type": "overloaded_error", "message": "Overloaded" } })),
            ]
        } else {
            vec![
                ("content_block_delta", delta("Bon")),
                ("content_block_delta", delta("soir")),
                ("message_stop", json!({ "type": "message_stop" })),
            ]
        };
        let sse: String = events
            .iter()
            .map(|(name, data)| format!("event: {name}\ndata: {data}\n\n"))
            .collect();
        ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response()
    }

    let rec = Recorded::default();
    let base = serve(
        Router::new()
            .route("/v1/messages", post(handler))
            .with_state(rec.clone()),
    )
    .await;
    let gateway =
        factory(Config::default(), anthropic_env(&base)).gateway(ConfigKind::General, "default");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let reply = gateway
        .ask(AskRequest::new(vec![CanonicalMessage::user("greet me")]).with_sink(tx))
        .await
        .expect("second attempt succeeds");

    assert_eq!(reply, "Bonsoir");
    assert_eq!(rec.hits(), 2);
    let mut forwarded = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        forwarded.push(chunk);
    }
    assert_eq!(forwarded, vec!["Bon", "Bon", "soir"]);
}

#[tokio::test]
async fn exhausted_budget_never_reaches_the_provider() {
    async fn handler(State(rec): State<Recorded>, Json(body): Json<Value>) -> Json<Value> {
        rec.record(HeaderMap::new(), body);
        Json(chat_completion(json!({ "role": "assistant", "content": "unreachable" }), None))
    }

    let rec = Recorded::default();
    let base = serve(
        Router::new()
            .route("/v1/chat/completions", post(handler))
            .with_state(rec.clone()),
    )
    .await;
    let config = Config::from_toml_str(
        r#"
[llm.default]
model = "gpt-4o"
max_input_tokens = 3
"#,
    )
    .expect("config");
    let gateway = factory(config, openai_env(&base)).gateway(ConfigKind::General, "default");

    let err = gateway
        .ask(AskRequest::new(vec![CanonicalMessage::user("this will not fit")]).streaming(false))
        .await
        .expect_err("over budget");

    assert!(matches!(err, LlmError::TokenLimitExceeded(ref m) if m.contains("Max: 3")));
    assert_eq!(rec.hits(), 0);
}

#[tokio::test]
async fn gateways_with_equal_descriptors_share_a_session() {
    let base = serve(Router::new()).await;
    let factory = factory(Config::default(), openai_env(&base));

    let general = factory.gateway(ConfigKind::General, "default");
    let extraction = factory.gateway(ConfigKind::Extraction, "default");
    assert!(Arc::ptr_eq(general.session(), extraction.session()));
    assert_eq!(factory.registry().len(), 1);
    assert_eq!(general.descriptor().base_url.as_deref(), Some(format!("{base}/v1").as_str()));
}
