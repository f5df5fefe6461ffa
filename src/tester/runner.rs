//! Concurrent conformance test runner.
//!
//! Requests are the cross-product of selected task kinds and compatible test
//! cases. They are queued on a channel sized to the full request count (the
//! producer never blocks) and drained by a fixed number of workers. Every
//! worker emits exactly one response per request, so the response count
//! always equals the request count; the aggregation loop ends only when the
//! last worker has finished and dropped its sender, which is the fan-in
//! barrier. Execution order and arrival order are unspecified.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ProviderTestResults, TestGroup, TestRegistry, TestRequest, TestResponse, TestResult};
use crate::error::{LlmError, Result};
use crate::options::AgentType;
use crate::traits::{ChatMessage, ContentResponse, Provider, StreamChunk, StreamHandler};

/// Default worker count.
const DEFAULT_WORKERS: usize = 4;

/// Configuration knobs for [`test_provider`].
#[derive(Clone)]
pub struct TesterOptions {
    /// Task kinds to exercise.
    pub agents: Vec<AgentType>,

    /// Test groups to run.
    pub groups: Vec<TestGroup>,

    /// Whether streaming-required cases run at all.
    pub streaming: bool,

    /// Log each result as it arrives.
    pub verbose: bool,

    /// Fixed worker pool size.
    pub workers: usize,

    /// Custom catalog; the built-in one when absent.
    pub registry: Option<Arc<TestRegistry>>,
}

impl Default for TesterOptions {
    fn default() -> Self {
        Self {
            agents: AgentType::ALL.to_vec(),
            groups: vec![TestGroup::Basic, TestGroup::Advanced, TestGroup::Knowledge],
            streaming: true,
            verbose: false,
            workers: DEFAULT_WORKERS,
            registry: None,
        }
    }
}

impl TesterOptions {
    /// Restrict to the given task kinds.
    pub fn with_agents(mut self, agents: Vec<AgentType>) -> Self {
        self.agents = agents;
        self
    }

    /// Restrict to the given groups.
    pub fn with_groups(mut self, groups: Vec<TestGroup>) -> Self {
        self.groups = groups;
        self
    }

    /// Enable or disable streaming-required cases.
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Set the worker pool size.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Use a custom test catalog.
    pub fn with_registry(mut self, registry: Arc<TestRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }
}

/// Run the conformance suite against a provider.
///
/// Fails before any execution when the catalog yields no runnable requests
/// for the given filters; every per-test problem after that point is
/// captured in that test's [`TestResult`] and never aborts the batch.
pub async fn test_provider(
    ctx: &CancellationToken,
    provider: Arc<dyn Provider>,
    options: TesterOptions,
) -> Result<ProviderTestResults> {
    let registry = options
        .registry
        .clone()
        .unwrap_or_else(TestRegistry::builtin);

    let requests = collect_requests(&registry, &options);
    if requests.is_empty() {
        return Err(LlmError::InvalidRequest(
            "no tests to execute for the given filters".to_string(),
        ));
    }
    let total = requests.len();
    debug!(total, workers = options.workers, "collected test requests");

    // Both channels hold the full request set, so neither side ever blocks
    // on capacity.
    let (request_tx, request_rx) = mpsc::channel::<TestRequest>(total);
    let (response_tx, mut response_rx) = mpsc::channel::<TestResponse>(total);

    for request in requests {
        // Capacity equals the request count; this cannot block or fail while
        // the receiver is alive.
        if request_tx.send(request).await.is_err() {
            break;
        }
    }
    drop(request_tx);

    let request_rx = Arc::new(Mutex::new(request_rx));
    let worker_count = options.workers.max(1);
    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        workers.push(tokio::spawn(worker_loop(
            ctx.clone(),
            Arc::clone(&provider),
            Arc::clone(&request_rx),
            response_tx.clone(),
            options.streaming,
            options.verbose,
        )));
    }
    // Workers hold the remaining senders; the receive loop below ends when
    // the last of them finishes.
    drop(response_tx);

    let mut results = ProviderTestResults::default();
    let mut received = 0usize;
    while let Some(response) = response_rx.recv().await {
        results.push(response.agent, response.result);
        received += 1;
    }
    for worker in workers {
        let _ = worker.await;
    }

    if received != total {
        // One result per request is a hard invariant; a mismatch is a
        // harness defect, not a provider failure.
        warn!(received, total, "result count does not match request count");
    }

    results.sort();
    Ok(results)
}

/// Build the (task kind × test case) cross-product honoring the streaming
/// switch and the JSON partition rule.
fn collect_requests(registry: &TestRegistry, options: &TesterOptions) -> Vec<TestRequest> {
    let mut requests = Vec::new();
    for group in &options.groups {
        for case in registry.suite(*group) {
            if case.streaming && !options.streaming {
                continue;
            }
            for agent in &options.agents {
                if !case.compatible_with(*agent) {
                    continue;
                }
                requests.push(TestRequest {
                    agent: *agent,
                    case: Arc::clone(case),
                });
            }
        }
    }
    requests
}

/// One worker: drain the shared queue, emit exactly one response per
/// request. A panic inside case execution is converted into a synthetic
/// failing result so the counting invariant holds.
async fn worker_loop(
    ctx: CancellationToken,
    provider: Arc<dyn Provider>,
    queue: Arc<Mutex<mpsc::Receiver<TestRequest>>>,
    responses: mpsc::Sender<TestResponse>,
    streaming: bool,
    verbose: bool,
) {
    loop {
        let request = { queue.lock().await.recv().await };
        let Some(request) = request else { break };
        let agent = request.agent;

        let result = match AssertUnwindSafe(run_case(&ctx, provider.as_ref(), &request, streaming))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => request
                .case
                .failure("test execution panicked", Duration::ZERO),
        };

        if verbose {
            info!(
                agent = %agent,
                case = result.name.as_str(),
                success = result.success,
                latency_ms = result.latency.as_millis() as u64,
                "test finished"
            );
        }

        if responses.send(TestResponse { agent, result }).await.is_err() {
            break;
        }
    }
}

/// Execute one request: pick the call shape from the payload, measure
/// latency around the provider call, and fold any provider error into a
/// failing result.
async fn run_case(
    ctx: &CancellationToken,
    provider: &dyn Provider,
    request: &TestRequest,
    streaming_enabled: bool,
) -> TestResult {
    let case = &request.case;
    let wants_stream = case.streaming && streaming_enabled;

    let chunks_seen = Arc::new(AtomicUsize::new(0));
    let collector = {
        let chunks_seen = Arc::clone(&chunks_seen);
        move |_chunk: &StreamChunk| -> Result<()> {
            chunks_seen.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    };
    let handler: Option<&StreamHandler> = if wants_stream {
        Some(&collector)
    } else {
        None
    };

    let started = Instant::now();
    let outcome: Result<ContentResponse> = if !case.messages.is_empty() && !case.tools.is_empty() {
        provider
            .call_with_tools(ctx, request.agent, &case.messages, &case.tools, handler)
            .await
    } else if !case.messages.is_empty() {
        provider
            .call_ex(ctx, request.agent, &case.messages, handler)
            .await
    } else if let Some(prompt) = &case.prompt {
        if wants_stream {
            let messages = vec![ChatMessage::user(prompt)];
            provider
                .call_ex(ctx, request.agent, &messages, handler)
                .await
        } else {
            provider
                .call(ctx, request.agent, prompt)
                .await
                .map(ContentResponse::from_text)
        }
    } else {
        // Structural problem: never reaches the provider.
        return case.failure(
            "test case has neither prompt nor message chain",
            Duration::ZERO,
        );
    };
    let latency = started.elapsed();

    match outcome {
        Ok(response) => {
            debug!(
                case = case.name,
                chunks = chunks_seen.load(Ordering::Relaxed),
                "provider call succeeded"
            );
            case.execute(&response, latency)
        }
        Err(error) => case.failure(error.to_string(), latency),
    }
}
