//! Built-in catalog of conformance test cases.
//!
//! Cases are grouped by theme (basic, advanced, knowledge, JSON) and tagged
//! by payload shape and streaming requirement. The catalog is process-wide,
//! read-only, loaded once, and safely shared by concurrent runner
//! invocations.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde_json::{json, Value as JsonValue};

use super::{CheckFn, TestCase, TestGroup};
use crate::traits::{ChatMessage, ContentResponse, ToolDefinition};

/// A catalog of test suites keyed by group.
#[derive(Debug, Clone)]
pub struct TestRegistry {
    suites: BTreeMap<TestGroup, Vec<Arc<TestCase>>>,
}

impl TestRegistry {
    /// Build a registry from an arbitrary case list.
    pub fn new(cases: Vec<TestCase>) -> Self {
        let mut suites: BTreeMap<TestGroup, Vec<Arc<TestCase>>> = BTreeMap::new();
        for case in cases {
            suites.entry(case.group).or_default().push(Arc::new(case));
        }
        Self { suites }
    }

    /// The built-in catalog, shared process-wide.
    pub fn builtin() -> Arc<TestRegistry> {
        static BUILTIN: Lazy<Arc<TestRegistry>> =
            Lazy::new(|| Arc::new(TestRegistry::new(builtin_cases())));
        Arc::clone(&BUILTIN)
    }

    /// The test suite for one group (empty slice if the group has none).
    pub fn suite(&self, group: TestGroup) -> &[Arc<TestCase>] {
        self.suites.get(&group).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of cases across all groups.
    pub fn len(&self) -> usize {
        self.suites.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn non_empty() -> CheckFn {
    Arc::new(|response: &ContentResponse, _| !response.content.trim().is_empty())
}

fn contains(needle: &'static str) -> CheckFn {
    Arc::new(move |response: &ContentResponse, _| {
        response.content.to_lowercase().contains(needle)
    })
}

fn calls_tool(name: &'static str) -> CheckFn {
    Arc::new(move |response: &ContentResponse, _| {
        response.tool_calls.iter().any(|call| call.name() == name)
    })
}

/// Strip optional markdown fences before parsing model-produced JSON.
fn parse_json(content: &str) -> Option<JsonValue> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).ok()
}

fn json_object_with_keys(keys: &'static [&'static str]) -> CheckFn {
    Arc::new(move |response: &ContentResponse, _| {
        parse_json(&response.content)
            .and_then(|value| value.as_object().cloned())
            .map(|object| keys.iter().all(|key| object.contains_key(*key)))
            .unwrap_or(false)
    })
}

fn json_non_empty_array() -> CheckFn {
    Arc::new(|response: &ContentResponse, _| {
        parse_json(&response.content)
            .and_then(|value| value.as_array().map(|items| !items.is_empty()))
            .unwrap_or(false)
    })
}

fn weather_tool() -> ToolDefinition {
    ToolDefinition::function(
        "get_weather",
        "Get the current weather for a city",
        json!({
            "type": "object",
            "properties": {
                "city": {"type": "string", "description": "City name"}
            },
            "required": ["city"]
        }),
    )
}

fn search_tool() -> ToolDefinition {
    ToolDefinition::function(
        "search_web",
        "Search the web for a query",
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"}
            },
            "required": ["query"]
        }),
    )
}

fn builtin_cases() -> Vec<TestCase> {
    vec![
        // ---- Basic: does the provider answer at all, within reason ----
        TestCase::prompt_case(
            1,
            "prompt_response",
            TestGroup::Basic,
            "Say hello.",
            non_empty(),
        ),
        TestCase::prompt_case(
            2,
            "prompt_latency",
            TestGroup::Basic,
            "Reply with a short acknowledgement.",
            Arc::new(|response, latency| {
                !response.content.trim().is_empty() && latency.as_secs() < 120
            }),
        ),
        TestCase::prompt_case(
            3,
            "prompt_substance",
            TestGroup::Basic,
            "Describe the color of a clear daytime sky in one sentence.",
            Arc::new(|response, _| response.content.trim().len() >= 2),
        ),
        TestCase::messages_case(
            4,
            "chat_greeting",
            TestGroup::Basic,
            vec![
                ChatMessage::system("You are a concise assistant."),
                ChatMessage::user("Greet me in one short sentence."),
            ],
            non_empty(),
        ),
        TestCase::messages_case(
            5,
            "chat_streaming",
            TestGroup::Basic,
            vec![ChatMessage::user("Count from one to five.")],
            non_empty(),
        )
        .with_streaming(),
        // ---- Advanced: multi-turn context and tool calling ----
        TestCase::messages_case(
            10,
            "chat_multi_turn",
            TestGroup::Advanced,
            vec![
                ChatMessage::user("My name is Alice."),
                ChatMessage::assistant("Nice to meet you, Alice."),
                ChatMessage::user("What is my name?"),
            ],
            contains("alice"),
        ),
        TestCase::tool_case(
            11,
            "tool_weather",
            TestGroup::Advanced,
            vec![ChatMessage::user("What is the weather in Paris right now?")],
            vec![weather_tool()],
            calls_tool("get_weather"),
        ),
        TestCase::tool_case(
            12,
            "tool_search",
            TestGroup::Advanced,
            vec![ChatMessage::user(
                "Find the latest release notes for the Linux kernel.",
            )],
            vec![search_tool()],
            calls_tool("search_web"),
        ),
        TestCase::messages_case(
            13,
            "chat_instruction",
            TestGroup::Advanced,
            vec![
                ChatMessage::system("Answer every question in exactly one sentence."),
                ChatMessage::user("Why is the sea salty?"),
            ],
            non_empty(),
        ),
        TestCase::messages_case(
            14,
            "advanced_streaming",
            TestGroup::Advanced,
            vec![ChatMessage::user(
                "List three prime numbers, one per line.",
            )],
            non_empty(),
        )
        .with_streaming(),
        // ---- Knowledge: stable factual recall ----
        TestCase::prompt_case(
            20,
            "capital_of_france",
            TestGroup::Knowledge,
            "What is the capital of France? Answer with the city name.",
            contains("paris"),
        ),
        TestCase::prompt_case(
            21,
            "water_formula",
            TestGroup::Knowledge,
            "What is the chemical formula of water?",
            contains("h2o"),
        ),
        TestCase::messages_case(
            22,
            "hamlet_author",
            TestGroup::Knowledge,
            vec![ChatMessage::user("Who wrote the play Hamlet?")],
            contains("shakespeare"),
        ),
        // ---- JSON: structured output, SimpleJson only ----
        TestCase::json_case(
            30,
            "json_object",
            "Return a JSON object with string key \"name\" and integer key \"age\". \
             Respond with JSON only.",
            json_object_with_keys(&["name", "age"]),
        ),
        TestCase::json_case(
            31,
            "json_array",
            "Return a JSON array of three city names. Respond with JSON only.",
            json_non_empty_array(),
        ),
        TestCase::json_case(
            32,
            "json_conversation",
            "",
            json_object_with_keys(&["status"]),
        )
        .with_messages(vec![
            ChatMessage::system("You respond only with JSON."),
            ChatMessage::user(
                "Report readiness as a JSON object with a single key \"status\".",
            ),
        ]),
    ]
}
