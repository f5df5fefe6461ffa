//! End-to-end conformance-runner tests against the mock provider.
//!
//! These exercise the runner's documented invariants: no result loss, the
//! JSON partition, group and streaming filters, error containment,
//! cancellation, and order-independence across worker counts.
//!
//! Run with: `cargo test --test conformance`

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use switchboard_llm::tester::{test_provider, TesterOptions};
use switchboard_llm::{
    AgentType, ChatMessage, ContentResponse, LlmError, MockBehavior, MockProvider, Provider,
    ProviderConfig, ProviderKind, StreamHandler, TestCase, TestGroup, TestRegistry, TestType,
    ToolDefinition,
};

fn mock_provider(behavior: MockBehavior) -> Arc<MockProvider> {
    Arc::new(MockProvider::new(behavior, None).unwrap())
}

fn non_empty_check() -> switchboard_llm::tester::CheckFn {
    Arc::new(|response: &ContentResponse, _| !response.content.is_empty())
}

/// Expected request count for the given filters against the built-in
/// catalog, computed independently of the runner.
fn expected_requests(agents: &[AgentType], groups: &[TestGroup], streaming: bool) -> usize {
    let registry = TestRegistry::builtin();
    let mut count = 0;
    for group in groups {
        for case in registry.suite(*group) {
            if case.streaming && !streaming {
                continue;
            }
            count += agents
                .iter()
                .filter(|agent| case.compatible_with(**agent))
                .count();
        }
    }
    count
}

// ============================================================================
// Spec Scenarios
// ============================================================================

mod scenarios {
    use super::*;

    /// Scenario A: three prompt-type Basic cases for `Simple` against a
    /// default mock yield three successes with no errors.
    #[tokio::test]
    async fn scenario_a_three_prompt_cases_all_pass() {
        let registry = Arc::new(TestRegistry::new(vec![
            TestCase::prompt_case(1, "one", TestGroup::Basic, "first", non_empty_check()),
            TestCase::prompt_case(2, "two", TestGroup::Basic, "second", non_empty_check()),
            TestCase::prompt_case(3, "three", TestGroup::Basic, "third", non_empty_check()),
        ]));

        let results = test_provider(
            &CancellationToken::new(),
            mock_provider(MockBehavior::default()),
            TesterOptions::default()
                .with_agents(vec![AgentType::Simple])
                .with_groups(vec![TestGroup::Basic])
                .with_registry(registry),
        )
        .await
        .unwrap();

        let simple = results.for_agent(AgentType::Simple);
        assert_eq!(simple.len(), 3);
        for result in simple {
            assert!(result.success, "case {} failed", result.name);
            assert!(result.error.is_none());
        }
        assert_eq!(results.total(), 3);
    }

    /// Scenario B: a JSON-typed case with only `Simple` selected never runs;
    /// with a compatible sibling case the call still succeeds, without one it
    /// is the "no tests to execute" error.
    #[tokio::test]
    async fn scenario_b_json_case_filtered_for_simple() {
        let json_case = || {
            TestCase::json_case(
                30,
                "json_object",
                "Return JSON.",
                Arc::new(|response: &ContentResponse, _| {
                    serde_json::from_str::<JsonValue>(&response.content).is_ok()
                }),
            )
        };

        // With a compatible sibling the run succeeds and the JSON case is
        // absent from Simple's results.
        let registry = Arc::new(TestRegistry::new(vec![
            json_case(),
            TestCase::prompt_case(1, "plain", TestGroup::Basic, "hi", non_empty_check()),
        ]));
        let results = test_provider(
            &CancellationToken::new(),
            mock_provider(MockBehavior::default()),
            TesterOptions::default()
                .with_agents(vec![AgentType::Simple])
                .with_groups(vec![TestGroup::Basic, TestGroup::Json])
                .with_registry(registry),
        )
        .await
        .unwrap();
        assert!(results
            .for_agent(AgentType::Simple)
            .iter()
            .all(|result| result.case_type != TestType::Json));
        assert_eq!(results.total(), 1);

        // Without one there is nothing to run.
        let registry = Arc::new(TestRegistry::new(vec![json_case()]));
        let err = test_provider(
            &CancellationToken::new(),
            mock_provider(MockBehavior::default()),
            TesterOptions::default()
                .with_agents(vec![AgentType::Simple])
                .with_groups(vec![TestGroup::Json])
                .with_registry(registry),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("no tests to execute"));
    }

    /// Scenario C: worker count 1 and 8 produce identical pass/fail sets.
    #[tokio::test]
    async fn scenario_c_worker_count_does_not_change_outcomes() {
        let behavior = || {
            MockBehavior::default()
                .with_response("capital of France", "Paris")
                .with_response("formula of water", "H2O")
                .with_response("Hamlet", "William Shakespeare")
        };

        let mut outcome_sets = Vec::new();
        for workers in [1usize, 8] {
            let results = test_provider(
                &CancellationToken::new(),
                mock_provider(behavior()),
                TesterOptions::default().with_workers(workers),
            )
            .await
            .unwrap();

            let outcomes: BTreeSet<(String, u32, bool)> = AgentType::ALL
                .iter()
                .flat_map(|agent| {
                    results
                        .for_agent(*agent)
                        .iter()
                        .map(|result| (agent.to_string(), result.id, result.success))
                        .collect::<Vec<_>>()
                })
                .collect();
            outcome_sets.push(outcomes);
        }

        assert_eq!(outcome_sets[0], outcome_sets[1]);
        assert!(!outcome_sets[0].is_empty());
    }
}

// ============================================================================
// Invariants
// ============================================================================

mod invariants {
    use super::*;

    /// No-loss: emitted results equal collected requests exactly.
    #[tokio::test]
    async fn no_loss_across_full_default_run() {
        let options = TesterOptions::default();
        let expected = expected_requests(&options.agents, &options.groups, options.streaming);

        let results = test_provider(
            &CancellationToken::new(),
            mock_provider(MockBehavior::default()),
            options,
        )
        .await
        .unwrap();

        assert_eq!(results.total(), expected);
        assert!(expected > 0);
    }

    /// JSON partition: `SimpleJson` sees only JSON-typed cases and every
    /// other task kind sees none.
    #[tokio::test]
    async fn json_partition_holds_over_builtin_catalog() {
        let results = test_provider(
            &CancellationToken::new(),
            mock_provider(MockBehavior::default()),
            TesterOptions::default().with_groups(TestGroup::ALL.to_vec()),
        )
        .await
        .unwrap();

        for result in results.for_agent(AgentType::SimpleJson) {
            assert_eq!(result.case_type, TestType::Json);
        }
        for agent in AgentType::ALL {
            if agent == AgentType::SimpleJson {
                continue;
            }
            for result in results.for_agent(agent) {
                assert_ne!(result.case_type, TestType::Json);
            }
        }
        assert!(!results.for_agent(AgentType::SimpleJson).is_empty());
    }

    /// Group filter law: groups = {Basic} yields only Basic results.
    #[tokio::test]
    async fn group_filter_restricts_results() {
        let results = test_provider(
            &CancellationToken::new(),
            mock_provider(MockBehavior::default()),
            TesterOptions::default().with_groups(vec![TestGroup::Basic]),
        )
        .await
        .unwrap();

        for agent in AgentType::ALL {
            for result in results.for_agent(agent) {
                assert_eq!(result.group, TestGroup::Basic);
            }
        }
        assert!(results.total() > 0);
    }

    /// Streaming filter law: streaming disabled yields zero streaming-flagged
    /// results.
    #[tokio::test]
    async fn streaming_filter_removes_streaming_cases() {
        let with_streaming = test_provider(
            &CancellationToken::new(),
            mock_provider(MockBehavior::default()),
            TesterOptions::default(),
        )
        .await
        .unwrap();
        let without_streaming = test_provider(
            &CancellationToken::new(),
            mock_provider(MockBehavior::default()),
            TesterOptions::default().with_streaming(false),
        )
        .await
        .unwrap();

        let count_streaming = |results: &switchboard_llm::ProviderTestResults| {
            AgentType::ALL
                .iter()
                .flat_map(|agent| results.for_agent(*agent))
                .filter(|result| result.streaming)
                .count()
        };

        assert!(count_streaming(&with_streaming) > 0);
        assert_eq!(count_streaming(&without_streaming), 0);
        assert!(without_streaming.total() < with_streaming.total());
    }
}

// ============================================================================
// Error Containment
// ============================================================================

/// Test double whose every call fails with a vendor error.
struct FailingProvider {
    config: ProviderConfig,
}

impl FailingProvider {
    fn new() -> Self {
        Self {
            config: ProviderConfig::load("failing-model", "", None).unwrap(),
        }
    }
}

#[async_trait]
impl Provider for FailingProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Custom
    }

    fn provider_config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn call_ex(
        &self,
        _ctx: &CancellationToken,
        _agent: AgentType,
        _messages: &[ChatMessage],
        _handler: Option<&StreamHandler>,
    ) -> switchboard_llm::Result<ContentResponse> {
        Err(LlmError::ApiError("backend unavailable".to_string()))
    }

    async fn call_with_tools(
        &self,
        _ctx: &CancellationToken,
        _agent: AgentType,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        _handler: Option<&StreamHandler>,
    ) -> switchboard_llm::Result<ContentResponse> {
        Err(LlmError::ApiError("backend unavailable".to_string()))
    }

    fn usage(&self, _info: &HashMap<String, JsonValue>) -> (u64, u64) {
        (0, 0)
    }
}

mod error_handling {
    use super::*;

    /// A provider error becomes a failing result with the error attached;
    /// sibling tests and the batch itself are unaffected.
    #[tokio::test]
    async fn provider_errors_are_contained_per_test() {
        let options = TesterOptions::default();
        let expected = expected_requests(&options.agents, &options.groups, options.streaming);

        let results = test_provider(
            &CancellationToken::new(),
            Arc::new(FailingProvider::new()),
            options,
        )
        .await
        .unwrap();

        assert_eq!(results.total(), expected);
        for agent in AgentType::ALL {
            for result in results.for_agent(agent) {
                assert!(!result.success);
                assert!(result
                    .error
                    .as_deref()
                    .unwrap()
                    .contains("backend unavailable"));
            }
        }
    }

    /// Cancelling before the run: every request surfaces the cancellation as
    /// its error and nothing is reported successful.
    #[tokio::test]
    async fn pre_cancelled_context_fails_every_request() {
        let ctx = CancellationToken::new();
        ctx.cancel();

        let results = test_provider(
            &ctx,
            mock_provider(MockBehavior::default()),
            TesterOptions::default().with_groups(vec![TestGroup::Basic]),
        )
        .await
        .unwrap();

        assert!(results.total() > 0);
        for agent in AgentType::ALL {
            for result in results.for_agent(agent) {
                assert!(!result.success);
                assert!(result.error.as_deref().unwrap().contains("cancelled"));
            }
        }
    }

    /// Cancelling mid-call aborts the in-flight streaming call promptly and
    /// attaches the cancellation error to that request's result.
    #[tokio::test]
    async fn mid_call_cancellation_aborts_streaming() {
        let registry = Arc::new(TestRegistry::new(vec![TestCase::messages_case(
            1,
            "slow_stream",
            TestGroup::Basic,
            vec![ChatMessage::user("stream slowly")],
            non_empty_check(),
        )
        .with_streaming()]));

        let behavior = MockBehavior::default()
            .with_default_response("a response long enough for several chunks")
            .with_chunking(4, Duration::from_millis(50));

        let ctx = CancellationToken::new();
        let cancel_ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_ctx.cancel();
        });

        let results = test_provider(
            &ctx,
            mock_provider(behavior),
            TesterOptions::default()
                .with_agents(vec![AgentType::Assistant])
                .with_registry(registry),
        )
        .await
        .unwrap();

        let result = &results.for_agent(AgentType::Assistant)[0];
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("cancelled"));
    }
}

// ============================================================================
// Mock-Driven Validation
// ============================================================================

mod validation {
    use super::*;

    /// Knowledge checks pass when the backend answers correctly and fail
    /// (without errors) when it answers nonsense.
    #[tokio::test]
    async fn knowledge_group_distinguishes_right_from_wrong() {
        let good = mock_provider(
            MockBehavior::default()
                .with_response("capital of France", "The capital of France is Paris.")
                .with_response("formula of water", "It is H2O.")
                .with_response("Hamlet", "Hamlet was written by William Shakespeare."),
        );
        let results = test_provider(
            &CancellationToken::new(),
            good,
            TesterOptions::default()
                .with_agents(vec![AgentType::Simple])
                .with_groups(vec![TestGroup::Knowledge]),
        )
        .await
        .unwrap();
        for result in results.for_agent(AgentType::Simple) {
            assert!(result.success, "case {} failed", result.name);
        }

        let bad = mock_provider(MockBehavior::default().with_default_response("no idea"));
        let results = test_provider(
            &CancellationToken::new(),
            bad,
            TesterOptions::default()
                .with_agents(vec![AgentType::Simple])
                .with_groups(vec![TestGroup::Knowledge]),
        )
        .await
        .unwrap();
        for result in results.for_agent(AgentType::Simple) {
            assert!(!result.success);
            // Validation failure, not an execution error.
            assert!(result.error.is_none());
        }
    }

    /// Tool cases pass through the mock's tool-call synthesis.
    #[tokio::test]
    async fn tool_cases_validate_tool_call_names() {
        let results = test_provider(
            &CancellationToken::new(),
            mock_provider(MockBehavior::default()),
            TesterOptions::default()
                .with_agents(vec![AgentType::PrimaryAgent])
                .with_groups(vec![TestGroup::Advanced]),
        )
        .await
        .unwrap();

        let tool_results: Vec<_> = results
            .for_agent(AgentType::PrimaryAgent)
            .iter()
            .filter(|result| result.case_type == TestType::Tool)
            .collect();
        assert!(!tool_results.is_empty());
        for result in tool_results {
            assert!(result.success, "tool case {} failed", result.name);
        }
    }

    /// JSON cases pass under `SimpleJson` when the backend emits JSON.
    #[tokio::test]
    async fn json_cases_pass_with_json_responses() {
        let provider = mock_provider(
            MockBehavior::default()
                .with_response("integer key", r#"{"name": "Ada", "age": 36}"#)
                .with_response("city names", r#"["Paris", "Lima", "Oslo"]"#)
                .with_response("readiness", r#"{"status": "ready"}"#),
        );
        let results = test_provider(
            &CancellationToken::new(),
            provider,
            TesterOptions::default()
                .with_agents(vec![AgentType::SimpleJson])
                .with_groups(vec![TestGroup::Json]),
        )
        .await
        .unwrap();

        let json_results = results.for_agent(AgentType::SimpleJson);
        assert_eq!(json_results.len(), 3);
        for result in json_results {
            assert!(result.success, "case {} failed", result.name);
        }
    }

    /// External profile bytes overlay the embedded defaults (read from a
    /// real file the way a deployment would).
    #[tokio::test]
    async fn external_profile_overlays_embedded_defaults() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[default]\nmodel = \"tuned-model\"\n\n[agents.simple]\ntemperature = 0.05\n"
        )
        .unwrap();
        let bytes = std::fs::read(file.path()).unwrap();

        let provider = MockProvider::new(MockBehavior::default(), Some(&bytes)).unwrap();
        assert_eq!(provider.model(AgentType::Simple), "tuned-model");
        assert_eq!(
            provider
                .provider_config()
                .options_for(AgentType::Simple)
                .temperature,
            Some(0.05)
        );
        assert_eq!(provider.raw_config(), bytes.as_slice());
    }
}
