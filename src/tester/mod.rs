//! Provider conformance harness: test catalog, runner, and result shapes.
//!
//! The harness exercises a [`crate::traits::Provider`] across a cross-product
//! of task kinds and test cases using a bounded worker pool, then groups the
//! per-case outcomes by task kind. It produces structured pass/fail data
//! only; rendering is an external concern.

pub mod registry;
pub mod runner;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::options::AgentType;
use crate::traits::{ChatMessage, ContentResponse, ToolDefinition};

pub use registry::TestRegistry;
pub use runner::{test_provider, TesterOptions};

/// Shape of a test case's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    /// Plain prompt, exercised via `call`.
    Prompt,
    /// Message chain, exercised via `call_ex`.
    Messages,
    /// Message chain with tool declarations, exercised via `call_with_tools`.
    Tool,
    /// Structured-output case, exclusive to the `SimpleJson` task kind.
    Json,
}

/// Thematic grouping of test cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestGroup {
    Basic,
    Advanced,
    Knowledge,
    Json,
}

impl TestGroup {
    pub const ALL: [TestGroup; 4] = [
        TestGroup::Basic,
        TestGroup::Advanced,
        TestGroup::Knowledge,
        TestGroup::Json,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestGroup::Basic => "basic",
            TestGroup::Advanced => "advanced",
            TestGroup::Knowledge => "knowledge",
            TestGroup::Json => "json",
        }
    }
}

impl fmt::Display for TestGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-case validation policy: decides pass/fail from the response and the
/// observed latency. The runner is agnostic to what "correct" means.
pub type CheckFn = Arc<dyn Fn(&ContentResponse, Duration) -> bool + Send + Sync>;

/// One conformance test case.
///
/// The payload decides the call shape: tools present means
/// `call_with_tools`, messages alone mean `call_ex`, a prompt alone means
/// `call`. A case with none of these never reaches the provider.
#[derive(Clone)]
pub struct TestCase {
    pub id: u32,
    pub name: &'static str,
    pub case_type: TestType,
    pub group: TestGroup,
    pub prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    /// Whether this case requires streaming delivery.
    pub streaming: bool,
    check: CheckFn,
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("case_type", &self.case_type)
            .field("group", &self.group)
            .field("streaming", &self.streaming)
            .finish()
    }
}

impl TestCase {
    /// Prompt-shaped case.
    pub fn prompt_case(
        id: u32,
        name: &'static str,
        group: TestGroup,
        prompt: impl Into<String>,
        check: CheckFn,
    ) -> Self {
        Self {
            id,
            name,
            case_type: TestType::Prompt,
            group,
            prompt: Some(prompt.into()),
            messages: Vec::new(),
            tools: Vec::new(),
            streaming: false,
            check,
        }
    }

    /// Message-chain case.
    pub fn messages_case(
        id: u32,
        name: &'static str,
        group: TestGroup,
        messages: Vec<ChatMessage>,
        check: CheckFn,
    ) -> Self {
        Self {
            id,
            name,
            case_type: TestType::Messages,
            group,
            prompt: None,
            messages,
            tools: Vec::new(),
            streaming: false,
            check,
        }
    }

    /// Tool-calling case.
    pub fn tool_case(
        id: u32,
        name: &'static str,
        group: TestGroup,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
        check: CheckFn,
    ) -> Self {
        Self {
            id,
            name,
            case_type: TestType::Tool,
            group,
            prompt: None,
            messages,
            tools,
            streaming: false,
            check,
        }
    }

    /// JSON-output case (prompt-shaped unless messages are given).
    pub fn json_case(
        id: u32,
        name: &'static str,
        prompt: impl Into<String>,
        check: CheckFn,
    ) -> Self {
        Self {
            id,
            name,
            case_type: TestType::Json,
            group: TestGroup::Json,
            prompt: Some(prompt.into()),
            messages: Vec::new(),
            tools: Vec::new(),
            streaming: false,
            check,
        }
    }

    /// Mark the case as requiring streaming delivery.
    pub fn with_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Replace the prompt payload with a message chain (for JSON cases that
    /// exercise the multi-turn shape).
    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.prompt = None;
        self.messages = messages;
        self
    }

    /// The JSON partition rule: `SimpleJson` accepts only JSON-typed cases,
    /// every other task kind accepts every case type except JSON-typed ones.
    pub fn compatible_with(&self, agent: AgentType) -> bool {
        (agent == AgentType::SimpleJson) == (self.case_type == TestType::Json)
    }

    /// Judge a successfully executed call.
    pub fn execute(&self, response: &ContentResponse, latency: Duration) -> TestResult {
        TestResult {
            id: self.id,
            name: self.name.to_string(),
            case_type: self.case_type,
            group: self.group,
            success: (self.check)(response, latency),
            error: None,
            latency,
            streaming: self.streaming,
        }
    }

    /// Record an execution failure (provider error or structural problem).
    pub fn failure(&self, error: impl Into<String>, latency: Duration) -> TestResult {
        TestResult {
            id: self.id,
            name: self.name.to_string(),
            case_type: self.case_type,
            group: self.group,
            success: false,
            error: Some(error.into()),
            latency,
            streaming: self.streaming,
        }
    }
}

/// Universal outcome shape for validation results and execution failures.
///
/// A non-nil `error` is authoritative regardless of `success`; a validation
/// failure is `success == false` with `error == None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub id: u32,
    pub name: String,
    pub case_type: TestType,
    pub group: TestGroup,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency: Duration,
    pub streaming: bool,
}

/// Internal pairing submitted to a worker.
#[derive(Debug, Clone)]
pub(crate) struct TestRequest {
    pub agent: AgentType,
    pub case: Arc<TestCase>,
}

/// Internal worker outcome.
#[derive(Debug)]
pub(crate) struct TestResponse {
    pub agent: AgentType,
    pub result: TestResult,
}

/// Fixed-shape aggregate: one ordered list of results per task kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderTestResults {
    pub simple: Vec<TestResult>,
    pub simple_json: Vec<TestResult>,
    pub primary_agent: Vec<TestResult>,
    pub assistant: Vec<TestResult>,
    pub generator: Vec<TestResult>,
    pub refiner: Vec<TestResult>,
    pub adviser: Vec<TestResult>,
    pub reflector: Vec<TestResult>,
    pub searcher: Vec<TestResult>,
    pub enricher: Vec<TestResult>,
    pub coder: Vec<TestResult>,
    pub installer: Vec<TestResult>,
    pub pentester: Vec<TestResult>,
}

impl ProviderTestResults {
    /// Append a result to its task kind's list.
    pub fn push(&mut self, agent: AgentType, result: TestResult) {
        self.for_agent_mut(agent).push(result);
    }

    /// Results for one task kind.
    pub fn for_agent(&self, agent: AgentType) -> &[TestResult] {
        match agent {
            AgentType::Simple => &self.simple,
            AgentType::SimpleJson => &self.simple_json,
            AgentType::PrimaryAgent => &self.primary_agent,
            AgentType::Assistant => &self.assistant,
            AgentType::Generator => &self.generator,
            AgentType::Refiner => &self.refiner,
            AgentType::Adviser => &self.adviser,
            AgentType::Reflector => &self.reflector,
            AgentType::Searcher => &self.searcher,
            AgentType::Enricher => &self.enricher,
            AgentType::Coder => &self.coder,
            AgentType::Installer => &self.installer,
            AgentType::Pentester => &self.pentester,
        }
    }

    fn for_agent_mut(&mut self, agent: AgentType) -> &mut Vec<TestResult> {
        match agent {
            AgentType::Simple => &mut self.simple,
            AgentType::SimpleJson => &mut self.simple_json,
            AgentType::PrimaryAgent => &mut self.primary_agent,
            AgentType::Assistant => &mut self.assistant,
            AgentType::Generator => &mut self.generator,
            AgentType::Refiner => &mut self.refiner,
            AgentType::Adviser => &mut self.adviser,
            AgentType::Reflector => &mut self.reflector,
            AgentType::Searcher => &mut self.searcher,
            AgentType::Enricher => &mut self.enricher,
            AgentType::Coder => &mut self.coder,
            AgentType::Installer => &mut self.installer,
            AgentType::Pentester => &mut self.pentester,
        }
    }

    /// Total number of results across every task kind.
    pub fn total(&self) -> usize {
        AgentType::ALL
            .iter()
            .map(|agent| self.for_agent(*agent).len())
            .sum()
    }

    /// Number of passing results across every task kind.
    pub fn passed(&self) -> usize {
        AgentType::ALL
            .iter()
            .flat_map(|agent| self.for_agent(*agent))
            .filter(|result| result.success)
            .count()
    }

    /// Sort every task kind's list by case id for deterministic reports.
    pub(crate) fn sort(&mut self) {
        for agent in AgentType::ALL {
            self.for_agent_mut(agent).sort_by_key(|result| result.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always_pass() -> CheckFn {
        Arc::new(|_, _| true)
    }

    #[test]
    fn test_json_partition_rule() {
        let json_case = TestCase::json_case(1, "json", "{}", always_pass());
        let prompt_case =
            TestCase::prompt_case(2, "prompt", TestGroup::Basic, "hi", always_pass());

        assert!(json_case.compatible_with(AgentType::SimpleJson));
        assert!(!json_case.compatible_with(AgentType::Simple));
        assert!(!json_case.compatible_with(AgentType::Pentester));

        assert!(prompt_case.compatible_with(AgentType::Simple));
        assert!(prompt_case.compatible_with(AgentType::Pentester));
        assert!(!prompt_case.compatible_with(AgentType::SimpleJson));
    }

    #[test]
    fn test_execute_and_failure_shapes() {
        let case = TestCase::prompt_case(
            7,
            "check",
            TestGroup::Basic,
            "hi",
            Arc::new(|response, _| response.content.contains("ok")),
        );

        let pass = case.execute(&ContentResponse::from_text("ok then"), Duration::from_millis(5));
        assert!(pass.success);
        assert!(pass.error.is_none());

        let fail = case.execute(&ContentResponse::from_text("nope"), Duration::from_millis(5));
        assert!(!fail.success);
        assert!(fail.error.is_none());

        let err = case.failure("boom", Duration::from_millis(5));
        assert!(!err.success);
        assert_eq!(err.error.as_deref(), Some("boom"));
        assert_eq!(err.id, 7);
    }

    #[test]
    fn test_results_aggregate() {
        let case = TestCase::prompt_case(1, "a", TestGroup::Basic, "hi", always_pass());
        let mut results = ProviderTestResults::default();
        results.push(
            AgentType::Simple,
            case.execute(&ContentResponse::from_text("x"), Duration::ZERO),
        );
        results.push(
            AgentType::Coder,
            case.failure("err", Duration::ZERO),
        );
        assert_eq!(results.total(), 2);
        assert_eq!(results.passed(), 1);
        assert_eq!(results.for_agent(AgentType::Simple).len(), 1);
        assert_eq!(results.for_agent(AgentType::Assistant).len(), 0);
    }

    #[test]
    fn test_sort_orders_by_case_id() {
        let early = TestCase::prompt_case(1, "a", TestGroup::Basic, "x", always_pass());
        let late = TestCase::prompt_case(9, "b", TestGroup::Basic, "x", always_pass());
        let mut results = ProviderTestResults::default();
        results.push(
            AgentType::Simple,
            late.execute(&ContentResponse::from_text("x"), Duration::ZERO),
        );
        results.push(
            AgentType::Simple,
            early.execute(&ContentResponse::from_text("x"), Duration::ZERO),
        );
        results.sort();
        assert_eq!(results.simple[0].id, 1);
        assert_eq!(results.simple[1].id, 9);
    }

    #[test]
    fn test_results_serializable() {
        let mut results = ProviderTestResults::default();
        let case = TestCase::prompt_case(1, "a", TestGroup::Basic, "x", always_pass());
        results.push(
            AgentType::Simple,
            case.execute(&ContentResponse::from_text("x"), Duration::from_millis(3)),
        );
        let json = serde_json::to_value(&results).unwrap();
        assert_eq!(json["simple"][0]["id"], 1);
        assert_eq!(json["simple"][0]["group"], "basic");
    }
}
