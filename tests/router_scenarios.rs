//! End-to-end scenarios from spec §8 (S1-S6), driven through a real
//! `Router` against the in-process `MockProviderAdapter` test double rather
//! than the `mock_response`/`mock_timeout` request-level shortcuts used by
//! the unit tests in `src/retry.rs`.

mod common;

use futures::StreamExt;

use common::{mock_deployment_entry, router_with_mock_adapter, ScriptedCall, ScriptedStream, SequenceRandom};
use litellm_router::config::{Credentials, DeploymentConfigEntry, DeploymentModelInfo, DeploymentParams};
use litellm_router::providers::ProviderKind;
use litellm_router::types::{ChatMessage, NormalizedRequest};
use litellm_router::{RouterConfig, StreamEvent};

/// S1: two healthy, equal-weight deployments in one model group. A
/// simple-shuffle selection must land on one of them and the response must
/// pass through untouched.
#[tokio::test]
async fn s1_basic_routing_picks_a_healthy_deployment_and_passes_the_response_through() {
    let (router, mock) = router_with_mock_adapter(RouterConfig::default(), SequenceRandom::new(vec![0.0]));
    let d1 = router.add_deployment(mock_deployment_entry("gpt", "mock://s1/d1"));
    let d2 = router.add_deployment(mock_deployment_entry("gpt", "mock://s1/d2"));
    mock.script_unary("mock://s1/d1", vec![ScriptedCall::Success("hello from d1")]);
    mock.script_unary("mock://s1/d2", vec![ScriptedCall::Success("hello from d2")]);

    let request = NormalizedRequest::new("gpt", vec![ChatMessage::user("hi")]);
    let response = router.acompletion(request).await.expect("one healthy deployment must serve the request");

    assert!(response.routing.deployment_id == d1.id || response.routing.deployment_id == d2.id);
    let expected = if response.routing.deployment_id == d1.id {
        "hello from d1"
    } else {
        "hello from d2"
    };
    assert_eq!(response.choices[0].message.text_content(), expected);
    assert_eq!(response.routing.attempted_groups, vec!["gpt".to_string()]);
}

/// S2: a deployment that fails repeatedly trips its cooldown after
/// `allowed_fails` failures; until then, a within-group retry reaches the
/// healthy sibling; after cooldown, only the healthy sibling is selected.
#[tokio::test]
async fn s2_repeated_failures_cool_down_a_deployment_and_traffic_shifts_to_its_sibling() {
    let config = RouterConfig {
        num_retries: 1,
        allowed_fails: 3,
        cooldown_time_s: 30,
        ..RouterConfig::default()
    };
    // Two candidates: index 0 always resolves to d1 (still in `remaining`
    // until its cooldown excludes it from the *next* request's filter),
    // index 1 to d2. Three requests' worth of [d1, d2] picks covers the
    // three failures needed to trip `allowed_fails`, then two more requests
    // with only d2 left eligible (any trailing value works once there's a
    // single candidate).
    let (router, mock) = router_with_mock_adapter(config, SequenceRandom::new(vec![0.0, 0.9, 0.0, 0.9, 0.0, 0.9, 0.0]));
    let d1 = router.add_deployment(mock_deployment_entry("gpt", "mock://s2/d1"));
    let d2 = router.add_deployment(mock_deployment_entry("gpt", "mock://s2/d2"));
    mock.script_unary(
        "mock://s2/d1",
        vec![ScriptedCall::ConnectionError, ScriptedCall::ConnectionError, ScriptedCall::ConnectionError],
    );

    for _ in 0..3 {
        let request = NormalizedRequest::new("gpt", vec![ChatMessage::user("hi")]);
        let response = router.acompletion(request).await.expect("d2 must absorb the within-group retry");
        assert_eq!(response.routing.deployment_id, d2.id);
    }

    assert!(!router.health().is_available(&d1.id), "d1 should be in cooldown after 3 transient failures");

    for _ in 0..2 {
        let request = NormalizedRequest::new("gpt", vec![ChatMessage::user("hi")]);
        let response = router.acompletion(request).await.expect("d2 alone must keep serving while d1 cools down");
        assert_eq!(response.routing.deployment_id, d2.id);
    }
}

/// S3: a deployment whose `max_input_tokens` can't fit the prompt is
/// filtered out before any call is made, even though it scripted a success.
#[tokio::test]
async fn s3_context_window_filter_routes_around_the_too_small_deployment() {
    let (router, mock) = router_with_mock_adapter(RouterConfig::default(), SequenceRandom::new(vec![0.0]));

    let mut too_small = mock_deployment_entry("gpt", "mock://s3/small");
    too_small.litellm_params.max_input_tokens = Some(1);
    let too_small = router.add_deployment(too_small);
    let roomy = router.add_deployment(mock_deployment_entry("gpt", "mock://s3/roomy"));

    mock.script_unary("mock://s3/small", vec![ScriptedCall::Success("should never be reached")]);
    mock.script_unary("mock://s3/roomy", vec![ScriptedCall::Success("fits fine")]);

    let request = NormalizedRequest::new("gpt", vec![ChatMessage::user("a prompt long enough to need more than one token of budget")]);
    let response = router.acompletion(request).await.expect("the roomy deployment must serve the request");

    assert_eq!(response.routing.deployment_id, roomy.id);
    assert_ne!(response.routing.deployment_id, too_small.id);
    assert_eq!(response.choices[0].message.text_content(), "fits fine");
}

/// S4: a non-retryable failure on the primary model group falls back to the
/// next group in the chain rather than retrying a sibling in the same group.
#[tokio::test]
async fn s4_non_retryable_failure_falls_back_to_the_next_model_group() {
    let config = RouterConfig {
        fallbacks: std::collections::HashMap::from([("gpt-4".to_string(), vec!["gpt-3.5".to_string()])]),
        ..RouterConfig::default()
    };
    let (router, mock) = router_with_mock_adapter(config, SequenceRandom::new(vec![0.0]));
    let primary = router.add_deployment(mock_deployment_entry("gpt-4", "mock://s4/primary"));
    let fallback = router.add_deployment(mock_deployment_entry("gpt-3.5", "mock://s4/fallback"));

    mock.script_unary("mock://s4/primary", vec![ScriptedCall::NotFound]);
    mock.script_unary("mock://s4/fallback", vec![ScriptedCall::Success("from the fallback group")]);

    let request = NormalizedRequest::new("gpt-4", vec![ChatMessage::user("hi")]);
    let response = router.acompletion(request).await.expect("the fallback group must serve the request");

    assert_eq!(response.routing.deployment_id, fallback.id);
    assert_ne!(response.routing.deployment_id, primary.id);
    assert_eq!(response.routing.attempted_groups, vec!["gpt-4".to_string(), "gpt-3.5".to_string()]);
}

/// S5: streamed deltas aggregate into the final response, and usage/cost
/// carried on the terminal frame propagate to both the `End` event and the
/// finalized response.
#[tokio::test]
async fn s5_streaming_usage_and_cost_propagate_to_the_final_response() {
    let (router, mock) = router_with_mock_adapter(RouterConfig::default(), SequenceRandom::new(vec![0.0]));
    router.add_deployment(mock_deployment_entry("gpt-stream", "mock://s5/d1"));

    mock.script_stream(
        "mock://s5/d1",
        vec![ScriptedStream::Frames(vec![
            serde_json::json!({ "content": "Hello" }).to_string(),
            serde_json::json!({ "content": " world" }).to_string(),
            serde_json::json!({
                "finish_reason": "stop",
                "usage": { "prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12, "cost": 0.00123 }
            })
            .to_string(),
        ])],
    );

    let request = NormalizedRequest::new("gpt-stream", vec![ChatMessage::user("hi")]);
    let mut stream = router.acompletion_stream(request).await.expect("the deployment must open a stream");

    let mut chunks = Vec::new();
    let mut final_response = None;
    while let Some(event) = stream.next().await {
        match event.expect("stream must not error") {
            StreamEvent::Chunk(chunk) => chunks.push(chunk),
            StreamEvent::End { usage, response, .. } => {
                assert_eq!(usage.cost, Some(0.00123));
                final_response = Some(*response);
            }
        }
    }

    assert_eq!(chunks.len(), 3);
    // The aggregator corrects a terminal chunk carrying a `finish_reason`
    // but no content to `Some("")`, distinct from `None`.
    assert_eq!(chunks[2].choices[0].content.as_deref(), Some(""));

    let final_response = final_response.expect("stream must emit an End event");
    assert_eq!(final_response.choices[0].message.text_content(), "Hello world");
    assert_eq!(final_response.usage.cost, Some(0.00123));
}

/// S6: `num_retries` arriving as a numeric string on one deployment's
/// `litellm_params` is coerced at config-load time and still honored as the
/// per-deployment retry budget at call time (spec §9).
#[tokio::test]
async fn s6_per_deployment_string_coerced_num_retries_is_honored_as_the_retry_budget() {
    let (router, mock) = router_with_mock_adapter(RouterConfig::default(), SequenceRandom::new(vec![0.0]));

    let json = serde_json::json!({
        "provider": { "custom": "mock" },
        "upstream_model": "mock-model",
        "api_base": "mock://s6/d1",
        "num_retries": "6"
    });
    let params: DeploymentParams = serde_json::from_value(json).expect("num_retries as a numeric string must coerce");
    assert_eq!(params.num_retries, Some(6));
    let d1 = router.add_deployment(DeploymentConfigEntry {
        model_name: "gpt".to_string(),
        litellm_params: params,
        model_info: DeploymentModelInfo::default(),
    });

    // Budget is 6 retries -> 7 attempts; script one more failure than that
    // so the 7th attempt is the last one the engine is allowed to make.
    mock.script_unary("mock://s6/d1", vec![ScriptedCall::ConnectionError; 7]);

    let request = NormalizedRequest::new("gpt", vec![ChatMessage::user("hi")]);
    let err = router.acompletion(request).await.expect_err("every attempt was scripted to fail");

    // The group's retry budget (6, from the coerced `num_retries`) allows 7
    // attempts total; `num_retries_attempted` only counts the retries after
    // the first attempt, so it must read back as exactly 6 — not 0 (ignored)
    // and not unbounded (the string failed to coerce and fell back to the
    // router default of 0 retries).
    match err {
        litellm_router::RouterError::ApiConnection { context, .. } => {
            assert_eq!(context.num_retries_attempted, 6);
            assert_eq!(context.deployment_id.as_deref(), None);
        }
        other => panic!("expected the last ApiConnection error once the retry budget was exhausted, got {other:?}"),
    }
    let _ = d1.id;
}

/// `Credentials`/`ProviderKind` re-import guard: confirms the crate's public
/// surface still exposes what this suite depends on.
#[test]
fn crate_exposes_the_config_types_this_suite_depends_on() {
    let _ = Credentials::default();
    let _ = ProviderKind::Custom("mock".to_string());
}
