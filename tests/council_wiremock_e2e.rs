use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use regex::Regex;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use council_harness::council::{self, CouncilError, CouncilEvent, CouncilRequest};
use council_harness::gateway::openrouter::OpenRouterAdapter;
use council_harness::gateway::{ChatGateway, NoopUsageSink, ProviderGateway};

// =============================================================================
// Deterministic council responder
// =============================================================================

/// Classifies each request by its system message and answers deterministically:
/// - stage 1 (no system message): "answer from <model>"
/// - stage 2 (evaluator system): labels seen in the prompt, ranked ascending
/// - stage 3 (chairman system): "FINAL ANSWER"
/// - title: "Council Test Title"
#[derive(Clone, Default)]
struct CouncilResponder {
    fail_members: Vec<String>,
    fail_rankings: bool,
    fail_synthesis: bool,
}

enum RequestKind {
    Stage1,
    Ranking,
    Synthesis,
    Title,
}

fn classify(request: &Request) -> (String, RequestKind, String) {
    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    let model = body["model"].as_str().unwrap_or_default().to_string();
    let messages = body["messages"].as_array().cloned().unwrap_or_default();

    let system = messages
        .iter()
        .find(|m| m["role"] == "system")
        .and_then(|m| m["content"].as_str())
        .unwrap_or_default();
    let user = messages
        .iter()
        .find(|m| m["role"] == "user")
        .and_then(|m| m["content"].as_str())
        .unwrap_or_default()
        .to_string();

    let kind = if system.is_empty() {
        RequestKind::Stage1
    } else if system.starts_with("You are an impartial evaluator") {
        RequestKind::Ranking
    } else if system.starts_with("You are the chairman") {
        RequestKind::Synthesis
    } else if system.starts_with("You generate short titles") {
        RequestKind::Title
    } else {
        panic!("unexpected system prompt: {system}");
    };

    (model, kind, user)
}

fn ok_body(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
            "message": { "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 10, "completion_tokens": 10 }
    }))
}

impl Respond for CouncilResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let (model, kind, user) = classify(request);

        match kind {
            RequestKind::Stage1 => {
                if self.fail_members.contains(&model) {
                    ResponseTemplate::new(500)
                } else {
                    ok_body(&format!("answer from {model}"))
                }
            }
            RequestKind::Ranking => {
                if self.fail_rankings {
                    return ResponseTemplate::new(500);
                }
                // Rank the labels visible in the prompt in ascending order.
                let label_re = Regex::new(r"### Response (\d+)").unwrap();
                let mut indices: Vec<u32> = label_re
                    .captures_iter(&user)
                    .map(|c| c[1].parse().unwrap())
                    .collect();
                indices.sort_unstable();
                let ranking = indices
                    .iter()
                    .enumerate()
                    .map(|(pos, i)| format!("{}. Response {} - solid reasoning", pos + 1, i))
                    .collect::<Vec<_>>()
                    .join("\n");
                ok_body(&ranking)
            }
            RequestKind::Synthesis => {
                if self.fail_synthesis {
                    ResponseTemplate::new(500)
                } else {
                    ok_body("FINAL ANSWER")
                }
            }
            RequestKind::Title => ok_body("Council Test Title"),
        }
    }
}

async fn mount(server: &MockServer, responder: CouncilResponder) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(responder)
        .mount(server)
        .await;
}

fn gateway_for(server: &MockServer) -> Arc<dyn ChatGateway> {
    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    Arc::new(ProviderGateway::new(adapter, Arc::new(NoopUsageSink)))
}

fn members(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Full pipeline
// =============================================================================

#[tokio::test]
async fn full_council_ranks_and_synthesizes() {
    let server = MockServer::start().await;
    mount(&server, CouncilResponder::default()).await;
    let gateway = gateway_for(&server);

    let req = CouncilRequest::new(
        "What is the capital of France?",
        members(&["m/alpha", "m/beta", "m/gamma"]),
    )
    .chairman("m/chair");

    let result = council::run_full_council(gateway.as_ref(), &req)
        .await
        .unwrap();

    // Stage 1 preserves dispatch order.
    let stage1_models: Vec<&str> = result.stage1.iter().map(|r| r.model_id.as_str()).collect();
    assert_eq!(stage1_models, vec!["m/alpha", "m/beta", "m/gamma"]);
    assert_eq!(result.stage1[0].content, "answer from m/alpha");

    // Label assignment binds labels to models in dispatch order.
    assert_eq!(result.metadata.label_to_model["Response 1"], "m/alpha");
    assert_eq!(result.metadata.label_to_model["Response 2"], "m/beta");
    assert_eq!(result.metadata.label_to_model["Response 3"], "m/gamma");

    // Every survivor submitted a ranking over its two peers, completed to a
    // total order of three.
    assert_eq!(result.stage2.len(), 3);
    for submission in &result.stage2 {
        assert_eq!(submission.ordered_labels.len(), 3);
        assert_eq!(submission.explicit_len, 2);
    }

    // With each ranker preferring lower label numbers among its peers:
    // m/alpha averages 5/3, m/beta 2, m/gamma 7/3.
    let agg = &result.metadata.aggregate_ranking;
    assert_eq!(agg[0].model_id, "m/alpha");
    assert_eq!(agg[1].model_id, "m/beta");
    assert_eq!(agg[2].model_id, "m/gamma");
    assert!((agg[0].mean_rank - 5.0 / 3.0).abs() < 1e-9);
    assert!((agg[1].mean_rank - 2.0).abs() < 1e-9);
    assert!((agg[2].mean_rank - 7.0 / 3.0).abs() < 1e-9);
    for entry in agg {
        assert_eq!(entry.vote_count, 2);
    }

    assert_eq!(result.stage3.chairman_model_id, "m/chair");
    assert_eq!(result.stage3.content, "FINAL ANSWER");
}

#[tokio::test]
async fn ranking_prompts_exclude_the_rankers_own_answer() {
    let server = MockServer::start().await;
    mount(&server, CouncilResponder::default()).await;
    let gateway = gateway_for(&server);

    let req = CouncilRequest::new("q", members(&["m/alpha", "m/beta", "m/gamma"]))
        .chairman("m/chair");
    council::run_full_council(gateway.as_ref(), &req)
        .await
        .unwrap();

    let received = server.received_requests().await.unwrap();
    let mut ranking_requests = 0;
    for request in &received {
        let (model, kind, user) = classify(request);
        if matches!(kind, RequestKind::Ranking) {
            ranking_requests += 1;
            assert!(
                !user.contains(&format!("answer from {model}")),
                "ranker {model} saw its own answer"
            );
            // ...but it does see both peers.
            assert_eq!(user.matches("answer from ").count(), 2);
        }
    }
    assert_eq!(ranking_requests, 3);
}

#[tokio::test]
async fn partial_failure_ranks_survivors_and_ties_on_ranker_silence() {
    let server = MockServer::start().await;
    mount(
        &server,
        CouncilResponder {
            fail_members: members(&["m/gamma", "m/delta"]),
            fail_rankings: true,
            ..Default::default()
        },
    )
    .await;
    let gateway = gateway_for(&server);

    // 4 members, 2 survive stage 1; both ranking calls then fail.
    let req = CouncilRequest::new(
        "q",
        members(&["m/alpha", "m/gamma", "m/beta", "m/delta"]),
    )
    .chairman("m/chair");

    let result = council::run_full_council(gateway.as_ref(), &req)
        .await
        .unwrap();

    let stage1_models: Vec<&str> = result.stage1.iter().map(|r| r.model_id.as_str()).collect();
    assert_eq!(stage1_models, vec!["m/alpha", "m/beta"]);

    // Ranking prompts were built over exactly the two surviving answers.
    let received = server.received_requests().await.unwrap();
    let ranking_users: Vec<String> = received
        .iter()
        .filter_map(|r| {
            let (_, kind, user) = classify(r);
            matches!(kind, RequestKind::Ranking).then_some(user)
        })
        .collect();
    assert_eq!(ranking_users.len(), 2);
    for user in &ranking_users {
        // Self-exclusion leaves each ranker exactly one peer answer.
        assert_eq!(user.matches("### Response").count(), 1);
    }

    // Both rankers abstained: empty submissions, survivors tied at the
    // worst rank, ordered by dispatch order.
    assert!(result.stage2.is_empty());
    let agg = &result.metadata.aggregate_ranking;
    assert_eq!(agg[0].model_id, "m/alpha");
    assert_eq!(agg[1].model_id, "m/beta");
    assert_eq!(agg[0].mean_rank, 2.0);
    assert_eq!(agg[1].mean_rank, 2.0);

    // Stage 3 still runs on the tied consensus.
    assert_eq!(result.stage3.content, "FINAL ANSWER");
}

#[tokio::test]
async fn zero_quorum_stops_before_stage2() {
    let server = MockServer::start().await;
    mount(
        &server,
        CouncilResponder {
            fail_members: members(&["m/alpha", "m/beta"]),
            ..Default::default()
        },
    )
    .await;
    let gateway = gateway_for(&server);

    let req = CouncilRequest::new("q", members(&["m/alpha", "m/beta"]));
    let err = council::run_full_council(gateway.as_ref(), &req)
        .await
        .unwrap_err();

    assert!(matches!(err, CouncilError::ZeroQuorum));
    assert_eq!(err.code(), "zero_quorum");

    // Only the two stage-1 calls went out; no ranking, no synthesis.
    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);
    for request in &received {
        let (_, kind, _) = classify(request);
        assert!(matches!(kind, RequestKind::Stage1));
    }
}

#[tokio::test]
async fn chairman_failure_is_fatal() {
    let server = MockServer::start().await;
    mount(
        &server,
        CouncilResponder {
            fail_synthesis: true,
            ..Default::default()
        },
    )
    .await;
    let gateway = gateway_for(&server);

    let req = CouncilRequest::new("q", members(&["m/alpha", "m/beta"]));
    let err = council::run_full_council(gateway.as_ref(), &req)
        .await
        .unwrap_err();

    assert!(matches!(err, CouncilError::Synthesis(_)));
    assert_eq!(err.code(), "synthesis_failed");
}

#[tokio::test]
async fn duplicate_members_are_dispatched_once() {
    let server = MockServer::start().await;
    mount(&server, CouncilResponder::default()).await;
    let gateway = gateway_for(&server);

    let req = CouncilRequest::new(
        "q",
        members(&["m/alpha", "m/alpha", "m/beta", "m/alpha"]),
    );
    let result = council::run_full_council(gateway.as_ref(), &req)
        .await
        .unwrap();

    let stage1_models: Vec<&str> = result.stage1.iter().map(|r| r.model_id.as_str()).collect();
    assert_eq!(stage1_models, vec!["m/alpha", "m/beta"]);
}

// =============================================================================
// Streaming
// =============================================================================

#[tokio::test]
async fn streaming_emits_events_in_stage_order() {
    let server = MockServer::start().await;
    mount(&server, CouncilResponder::default()).await;
    let gateway = gateway_for(&server);

    let req = CouncilRequest::new("q", members(&["m/alpha", "m/beta"])).chairman("m/chair");
    let events: Vec<CouncilEvent> = council::run_council_streaming(gateway, req)
        .collect()
        .await;

    let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
    assert_eq!(
        types,
        vec![
            "stage1_start",
            "stage1_complete",
            "stage2_start",
            "stage2_complete",
            "stage3_start",
            "stage3_complete",
            "title_complete",
            "complete",
        ]
    );

    assert_eq!(
        events.iter().filter(|e| e.is_terminal()).count(),
        1,
        "exactly one terminal event per session"
    );

    match &events[3] {
        CouncilEvent::Stage2Complete { label_to_model, .. } => {
            assert_eq!(label_to_model["Response 1"], "m/alpha");
            assert_eq!(label_to_model["Response 2"], "m/beta");
        }
        other => panic!("expected stage2_complete, got {other:?}"),
    }

    match &events[6] {
        CouncilEvent::TitleComplete { title } => assert_eq!(title, "Council Test Title"),
        other => panic!("expected title_complete, got {other:?}"),
    }
}

#[tokio::test]
async fn streaming_zero_quorum_ends_with_single_error_event() {
    let server = MockServer::start().await;
    mount(
        &server,
        CouncilResponder {
            fail_members: members(&["m/alpha", "m/beta"]),
            ..Default::default()
        },
    )
    .await;
    let gateway = gateway_for(&server);

    let req = CouncilRequest::new("q", members(&["m/alpha", "m/beta"]));
    let events: Vec<CouncilEvent> = council::run_council_streaming(gateway, req)
        .collect()
        .await;

    let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
    assert_eq!(types, vec!["stage1_start", "error"]);

    match &events[1] {
        CouncilEvent::Error { code, .. } => assert_eq!(code, "zero_quorum"),
        other => panic!("expected error event, got {other:?}"),
    }
}

#[tokio::test]
async fn streaming_rejects_empty_council() {
    let server = MockServer::start().await;
    mount(&server, CouncilResponder::default()).await;
    let gateway = gateway_for(&server);

    let req = CouncilRequest::new("q", vec![]);
    let events: Vec<CouncilEvent> = council::run_council_streaming(gateway, req)
        .collect()
        .await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        CouncilEvent::Error { code, .. } => assert_eq!(code, "invalid_request"),
        other => panic!("expected error event, got {other:?}"),
    }
}
