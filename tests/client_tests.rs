//! End-to-end orchestration-loop scenarios against a scripted provider.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::RwLock;

use common::*;
use jaato::error::TransientClass;
use jaato::ledger::{RetryPolicy, TokenLedger};
use jaato::permission::channels::{AutoChannel, PromptAction};
use jaato::permission::{PermissionEngine, PermissionPolicy, SharedPrompter};
use jaato::registry::PluginRegistry;
use jaato::types::{ProviderResponse, TokenUsage};
use jaato::{ClientConfig, JaatoClient, JaatoError, ToolPlugin};

fn fast_ledger() -> Arc<TokenLedger> {
    Arc::new(TokenLedger::with_policy(RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    }))
}

async fn registry_with(
    plugins: Vec<(&'static str, fn() -> Box<dyn ToolPlugin>)>,
) -> Arc<RwLock<PluginRegistry>> {
    let mut registry = PluginRegistry::new();
    for (name, factory) in plugins {
        registry.register_factory(name, Arc::new(factory));
        registry.expose_tool(name, None).await.unwrap();
    }
    Arc::new(RwLock::new(registry))
}

async fn make_client(
    provider: MockProvider,
    registry: Arc<RwLock<PluginRegistry>>,
    engine: PermissionEngine,
    config: ClientConfig,
) -> JaatoClient {
    let client = JaatoClient::new(
        Box::new(provider),
        registry,
        Arc::new(engine),
        fast_ledger(),
    )
    .with_config(config);
    client.refresh_auto_approved(&[]).await;
    client
}

fn echo_auto() -> Box<dyn ToolPlugin> {
    Box::new(EchoPlugin {
        auto_approved: true,
    })
}

fn echo_gated() -> Box<dyn ToolPlugin> {
    Box::new(EchoPlugin {
        auto_approved: false,
    })
}

fn sleeper() -> Box<dyn ToolPlugin> {
    Box::new(SleepPlugin)
}

fn failing() -> Box<dyn ToolPlugin> {
    Box::new(FailingPlugin)
}

// S1: pure text turn. One provider call, no tools, one accounting row.
#[tokio::test]
async fn pure_text_turn() {
    let provider = MockProvider::new(vec![text_reply("Hello there!")]);
    let attempts = Arc::clone(&provider.attempts);
    let registry = registry_with(vec![]).await;
    let engine = PermissionEngine::new(PermissionPolicy::allow_all());
    let mut client = make_client(provider, registry, engine, ClientConfig::default()).await;

    let answer = client.send_message("Say hi.").await.unwrap();
    assert_eq!(answer, "Hello there!");
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(client.turn_accounting().len(), 1);

    let row = &client.turn_accounting()[0];
    assert_eq!(row.total_tokens, row.prompt_tokens + row.output_tokens);
    assert!(row.function_calls.is_empty());
}

// S2: single auto-approved tool. Two provider calls, one execution,
// auto-approved gating metadata, final text from the follow-up round.
#[tokio::test]
async fn single_tool_auto_approved() {
    let provider = MockProvider::new(vec![
        tool_reply(None, vec![call("c1", "echo", json!({"text": "hello"}))]),
        text_reply("The tool echoed hello."),
    ]);
    let attempts = Arc::clone(&provider.attempts);
    let batches = Arc::clone(&provider.result_batches);
    let registry = registry_with(vec![("echo", echo_auto)]).await;
    let engine = PermissionEngine::new(PermissionPolicy::ask());
    let mut client = make_client(provider, registry, engine, ClientConfig::default()).await;

    let answer = client
        .send_message("Call echo with 'hello'.")
        .await
        .unwrap();
    assert!(answer.contains("hello"));
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_eq!(*batches.lock().unwrap(), vec![1]);

    let history = client.history().to_vec();
    let results = tool_results(&history);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].call_id, "c1");
    assert!(!results[0].is_error);
    assert_eq!(results[0].result["echoed"], "hello");
    assert_eq!(results[0].result["_permission"]["method"], "auto_approved");

    let row = &client.turn_accounting()[0];
    assert_eq!(row.function_calls.len(), 1);
    assert_eq!(row.function_calls[0].name, "echo");
}

// S3: user denies once. Denied result, no session rule, second identical
// call prompts again.
#[tokio::test]
async fn deny_once_prompts_again() {
    let provider = MockProvider::new(vec![
        tool_reply(None, vec![call("c1", "echo", json!({"text": "x"}))]),
        text_reply("understood"),
        tool_reply(None, vec![call("c2", "echo", json!({"text": "x"}))]),
        text_reply("understood again"),
    ]);
    let registry = registry_with(vec![("echo", echo_gated)]).await;
    let channel = AutoChannel::scripted(vec![PromptAction::No, PromptAction::No]);
    let counter = channel.prompt_counter();
    let engine = PermissionEngine::with_prompter(
        PermissionPolicy::ask(),
        Arc::new(SharedPrompter::new(Box::new(channel))),
    );
    let mut client = make_client(provider, registry, engine, ClientConfig::default()).await;

    client.send_message("try the tool").await.unwrap();
    {
        let history = client.history().to_vec();
        let results = tool_results(&history);
        assert_eq!(results.len(), 1);
        assert!(!results[0].is_error);
        assert_eq!(results[0].result["denied"], true);
        assert_eq!(results[0].result["_permission"]["method"], "user_once");
    }
    assert_eq!(client.permission().session_rule_count(), 0);

    client.send_message("try again").await.unwrap();
    assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 2);
}

// S4: "never" installs a session rule. The second identical call is denied
// without a prompt, attributed to the session rule.
#[tokio::test]
async fn deny_always_installs_session_rule() {
    let provider = MockProvider::new(vec![
        tool_reply(None, vec![call("c1", "echo", json!({"text": "x"}))]),
        text_reply("noted"),
        tool_reply(None, vec![call("c2", "echo", json!({"text": "x"}))]),
        text_reply("noted again"),
    ]);
    let registry = registry_with(vec![("echo", echo_gated)]).await;
    let channel = AutoChannel::scripted(vec![PromptAction::Never]);
    let counter = channel.prompt_counter();
    let engine = PermissionEngine::with_prompter(
        PermissionPolicy::ask(),
        Arc::new(SharedPrompter::new(Box::new(channel))),
    );
    let mut client = make_client(provider, registry, engine, ClientConfig::default()).await;

    client.send_message("first").await.unwrap();
    assert_eq!(client.permission().session_rule_count(), 1);
    {
        let history = client.history().to_vec();
        let results = tool_results(&history);
        assert_eq!(results[0].result["_permission"]["method"], "user_never");
    }

    client.send_message("second").await.unwrap();
    // One prompt total: the second denial came from the session rule.
    assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    let history = client.history().to_vec();
    let results = tool_results(&history);
    assert_eq!(results.len(), 2);
    assert_eq!(results[1].result["denied"], true);
    assert_eq!(results[1].result["_permission"]["method"], "session_rule");
}

// S5: parallel fan-out. Three concurrent sleeps finish near max, not sum,
// and all three results return in one batch with three timings.
#[tokio::test]
async fn parallel_fan_out() {
    let provider = MockProvider::new(vec![
        tool_reply(
            None,
            vec![
                call("c1", "sleep", json!({"ms": 150})),
                call("c2", "sleep", json!({"ms": 150})),
                call("c3", "sleep", json!({"ms": 150})),
            ],
        ),
        text_reply("all done"),
    ]);
    let batches = Arc::clone(&provider.result_batches);
    let registry = registry_with(vec![("sleeper", sleeper)]).await;
    let engine = PermissionEngine::new(PermissionPolicy::ask());
    let mut client = make_client(provider, registry, engine, ClientConfig::default()).await;

    let started = Instant::now();
    client.send_message("sleep three times").await.unwrap();
    let elapsed = started.elapsed();

    // Sum would be 450ms; parallel execution lands near the 150ms max.
    assert!(elapsed >= Duration::from_millis(150), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(300), "{:?}", elapsed);

    assert_eq!(*batches.lock().unwrap(), vec![3]);
    let row = &client.turn_accounting()[0];
    assert_eq!(row.function_calls.len(), 3);

    // Results kept the model's issue order regardless of completion order.
    let history = client.history().to_vec();
    let results = tool_results(&history);
    let ids: Vec<&str> = results.iter().map(|r| r.call_id.as_str()).collect();
    assert_eq!(ids, vec!["c1", "c2", "c3"]);
}

// S6: transient retries. Two rate-limit failures then success, recorded in
// the ledger, with no error surfaced.
#[tokio::test]
async fn transient_retries_recover() {
    let provider = MockProvider::new(vec![
        ScriptStep::TransientFail(TransientClass::RateLimit, "429 too many requests"),
        ScriptStep::TransientFail(TransientClass::RateLimit, "429 too many requests"),
        text_reply("recovered"),
    ]);
    let registry = registry_with(vec![]).await;
    let engine = PermissionEngine::new(PermissionPolicy::allow_all());
    let ledger = fast_ledger();
    let mut client = JaatoClient::new(
        Box::new(provider),
        registry,
        Arc::new(engine),
        Arc::clone(&ledger),
    );

    let answer = client.send_message("hello?").await.unwrap();
    assert_eq!(answer, "recovered");

    let summary = ledger.summarize();
    assert_eq!(summary.retry_attempts, 2);
    assert_eq!(summary.rate_limit_retries, 2);
    assert_eq!(summary.calls, 1);
    assert_eq!(
        summary.last_rate_limit_error.as_deref(),
        Some("429 too many requests")
    );
}

#[tokio::test]
async fn transient_exhaustion_surfaces_typed_error() {
    let provider = MockProvider::new(vec![
        ScriptStep::TransientFail(TransientClass::Infra, "503 unavailable"),
        ScriptStep::TransientFail(TransientClass::Infra, "503 unavailable"),
    ]);
    let registry = registry_with(vec![]).await;
    let engine = PermissionEngine::new(PermissionPolicy::allow_all());
    let ledger = Arc::new(TokenLedger::with_policy(RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(2),
        max_delay: Duration::from_millis(5),
    }));
    let mut client = JaatoClient::new(Box::new(provider), registry, Arc::new(engine), ledger);

    let err = client.send_message("hello?").await.unwrap_err();
    match err {
        JaatoError::TransientExhausted { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("unexpected error: {}", other),
    }
    // The failed turn still closed its accounting row.
    assert_eq!(client.turn_accounting().len(), 1);
}

#[tokio::test]
async fn iteration_cap_k1_stops_after_one_round() {
    let provider = MockProvider::new(vec![
        tool_reply(Some("step1"), vec![call("c1", "echo", json!({"text": "a"}))]),
        tool_reply(Some("step2"), vec![call("c2", "echo", json!({"text": "b"}))]),
    ]);
    let batches = Arc::clone(&provider.result_batches);
    let registry = registry_with(vec![("echo", echo_auto)]).await;
    let engine = PermissionEngine::new(PermissionPolicy::ask());
    let config = ClientConfig {
        max_tool_iterations: 1,
        ..ClientConfig::default()
    };
    let mut client = make_client(provider, registry, engine, config).await;

    let answer = client.send_message("loop forever").await.unwrap();
    assert!(answer.starts_with("step2"));
    assert!(answer.contains("Maximum tool iterations reached"));
    assert_eq!(batches.lock().unwrap().len(), 1);
    assert!(client.turn_accounting()[0].max_iterations_hit);
}

#[tokio::test]
async fn iteration_cap_k8_default() {
    let mut script = Vec::new();
    for i in 0..9 {
        script.push(tool_reply(
            Some(&format!("round {}", i)),
            vec![call(&format!("c{}", i), "echo", json!({"text": "x"}))],
        ));
    }
    let provider = MockProvider::new(script);
    let attempts = Arc::clone(&provider.attempts);
    let batches = Arc::clone(&provider.result_batches);
    let registry = registry_with(vec![("echo", echo_auto)]).await;
    let engine = PermissionEngine::new(PermissionPolicy::ask());
    let mut client = make_client(provider, registry, engine, ClientConfig::default()).await;

    let answer = client.send_message("loop forever").await.unwrap();
    assert!(answer.contains("Maximum tool iterations reached"));
    // Initial call plus eight tool rounds.
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 9);
    assert_eq!(batches.lock().unwrap().len(), 8);
    assert!(client.turn_accounting()[0].max_iterations_hit);
}

#[tokio::test]
async fn unknown_tool_becomes_error_result() {
    let provider = MockProvider::new(vec![
        tool_reply(None, vec![call("c1", "ghost", json!({}))]),
        text_reply("sorry about that"),
    ]);
    let registry = registry_with(vec![]).await;
    let engine = PermissionEngine::new(PermissionPolicy::allow_all());
    let mut client = make_client(provider, registry, engine, ClientConfig::default()).await;

    let answer = client.send_message("use the ghost tool").await.unwrap();
    assert_eq!(answer, "sorry about that");

    let history = client.history().to_vec();
    let results = tool_results(&history);
    assert_eq!(results.len(), 1);
    assert!(results[0].is_error);
    assert!(results[0].result.as_str().unwrap().contains("unknown tool"));
}

#[tokio::test]
async fn executor_error_feeds_back_without_unwinding() {
    let provider = MockProvider::new(vec![
        tool_reply(None, vec![call("c1", "explode", json!({}))]),
        text_reply("the tool failed, moving on"),
    ]);
    let registry = registry_with(vec![("failing", failing)]).await;
    let engine = PermissionEngine::new(PermissionPolicy::ask());
    let mut client = make_client(provider, registry, engine, ClientConfig::default()).await;

    let answer = client.send_message("explode please").await.unwrap();
    assert_eq!(answer, "the tool failed, moving on");

    let history = client.history().to_vec();
    let results = tool_results(&history);
    assert!(results[0].is_error);
    assert!(results[0]
        .result
        .as_str()
        .unwrap()
        .contains("executor blew up"));
}

#[tokio::test]
async fn oversized_result_is_truncated_with_flag() {
    let provider = MockProvider::new(vec![
        tool_reply(
            None,
            vec![call("c1", "echo", json!({"text": "x".repeat(500)}))],
        ),
        text_reply("done"),
    ]);
    let registry = registry_with(vec![("echo", echo_auto)]).await;
    let engine = PermissionEngine::new(PermissionPolicy::ask());
    let config = ClientConfig {
        max_result_bytes: 100,
        ..ClientConfig::default()
    };
    let mut client = make_client(provider, registry, engine, config).await;

    client.send_message("echo a lot").await.unwrap();
    let history = client.history().to_vec();
    let results = tool_results(&history);
    assert_eq!(results[0].result["truncated"], true);
    assert!(results[0].result["hint"]
        .as_str()
        .unwrap()
        .contains("truncated"));
}

#[tokio::test]
async fn empty_prompt_returns_model_text() {
    let provider = MockProvider::new(vec![text_reply("")]);
    let registry = registry_with(vec![]).await;
    let engine = PermissionEngine::new(PermissionPolicy::allow_all());
    let mut client = make_client(provider, registry, engine, ClientConfig::default()).await;

    let answer = client.send_message("").await.unwrap();
    assert_eq!(answer, "");
    assert_eq!(client.turn_accounting().len(), 1);
}

#[tokio::test]
async fn cancellation_interrupts_running_executors() {
    let provider = MockProvider::new(vec![
        tool_reply(None, vec![call("c1", "sleep", json!({"ms": 5000}))]),
        text_reply("never reached"),
    ]);
    let registry = registry_with(vec![("sleeper", sleeper)]).await;
    let engine = PermissionEngine::new(PermissionPolicy::ask());
    let mut client = make_client(provider, registry, engine, ClientConfig::default()).await;

    let handle = client.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });

    let started = Instant::now();
    let err = client.send_message("sleep forever").await.unwrap_err();
    assert!(matches!(err, JaatoError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(2));

    let row = client.turn_accounting().last().unwrap();
    assert!(row.cancelled);
}

#[tokio::test]
async fn structured_output_is_captured_from_final_response() {
    let provider = MockProvider::new(vec![ScriptStep::Respond(ProviderResponse {
        text: Some(r#"{"answer": 42}"#.to_string()),
        function_calls: Vec::new(),
        usage: TokenUsage {
            prompt_tokens: 5,
            output_tokens: 5,
            total_tokens: 10,
        },
        finish_reason: jaato::types::FinishReason::Stop,
        structured_output: Some(json!({"answer": 42})),
        raw: None,
    })]);
    let registry = registry_with(vec![]).await;
    let engine = PermissionEngine::new(PermissionPolicy::allow_all());
    let mut client = make_client(provider, registry, engine, ClientConfig::default()).await;

    client
        .send_message_structured("answer", json!({"type": "object"}))
        .await
        .unwrap();
    assert_eq!(client.last_structured_output().unwrap()["answer"], 42);
}

#[tokio::test]
async fn revert_to_turn_truncates_history_and_accounting() {
    let provider = MockProvider::new(vec![
        text_reply("first"),
        text_reply("second"),
        text_reply("third"),
    ]);
    let registry = registry_with(vec![]).await;
    let engine = PermissionEngine::new(PermissionPolicy::allow_all());
    let mut client = make_client(provider, registry, engine, ClientConfig::default()).await;

    client.send_message("one").await.unwrap();
    client.send_message("two").await.unwrap();
    let history_after_one = 2; // user + model

    client.revert_to_turn(1).await.unwrap();
    assert_eq!(client.turn_count(), 1);
    assert_eq!(client.turn_accounting().len(), 1);
    assert_eq!(client.history().len(), history_after_one);

    // The conversation continues cleanly from the revert point.
    let answer = client.send_message("three").await.unwrap();
    assert_eq!(answer, "third");
    assert_eq!(client.turn_count(), 2);
}
