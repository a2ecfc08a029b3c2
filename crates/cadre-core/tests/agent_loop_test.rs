//! Integration tests for the agent loop: convergence, tool dispatch,
//! failure budgets, and the iteration budget sentinel.

use async_trait::async_trait;
use cadre_abstraction::{
    EventStream, FinishReason, LanguageModel, LanguageRequest, LanguageResponse, ModelError,
    ToolUse,
};
use cadre_core::{
    AgentContext, AgentDefinition, AgentRunner, CoreError, RunnerConfig, TaskContext, Tool,
    ToolRefreshPolicy, ToolResult, UNFINISHED,
};
use cadre_models::MockProvider;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Counts streaming calls so tests can assert iteration counts.
struct CountingModel {
    inner: MockProvider,
    calls: AtomicU32,
}

impl CountingModel {
    fn new() -> Self {
        Self { inner: MockProvider::new("counting"), calls: AtomicU32::new(0) }
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for CountingModel {
    async fn call(&self, request: &LanguageRequest) -> Result<LanguageResponse, ModelError> {
        self.inner.call(request).await
    }

    async fn call_stream(&self, request: &LanguageRequest) -> Result<EventStream, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.call_stream(request).await
    }

    fn model_id(&self) -> &str {
        "counting"
    }

    fn images_in_tool_results(&self) -> bool {
        true
    }
}

fn text_response(text: &str) -> LanguageResponse {
    LanguageResponse::text(text)
}

fn tool_response(calls: Vec<(&str, &str, Value)>) -> LanguageResponse {
    LanguageResponse {
        text: String::new(),
        thinking: None,
        tool_calls: calls
            .into_iter()
            .map(|(id, name, arguments)| ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            })
            .collect(),
        finish_reason: FinishReason::ToolUse,
        usage: None,
    }
}

struct CountingTool {
    executions: Arc<AtomicU32>,
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        "count"
    }

    fn description(&self) -> &str {
        "counts invocations"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value, _ctx: &mut AgentContext) -> anyhow::Result<ToolResult> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(ToolResult::text("counted"))
    }
}

struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "flaky"
    }

    fn description(&self) -> &str {
        "always fails"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value, _ctx: &mut AgentContext) -> anyhow::Result<ToolResult> {
        anyhow::bail!("backend unreachable")
    }
}

fn context_with(
    model: Arc<dyn LanguageModel>,
    agent: AgentDefinition,
    config: RunnerConfig,
) -> AgentContext {
    let agent = Arc::new(agent);
    let task = Arc::new(TaskContext::new(model, vec![Arc::clone(&agent)], config));
    AgentContext::new(task, agent, "test task")
}

#[tokio::test]
async fn test_plain_text_returns_after_one_iteration() {
    let model = Arc::new(CountingModel::new());
    model.inner.push_response(text_response("all done"));

    let mut ctx = context_with(
        Arc::clone(&model) as Arc<dyn LanguageModel>,
        AgentDefinition::new("worker", "test agent"),
        RunnerConfig::default(),
    );

    let result = AgentRunner::new().run(&mut ctx, "say done").await.unwrap();
    assert_eq!(result, "all done");
    assert_eq!(model.call_count(), 1);
}

#[tokio::test]
async fn test_tool_turn_then_text_converges() {
    let executions = Arc::new(AtomicU32::new(0));
    let model = Arc::new(CountingModel::new());
    model.inner.push_response(tool_response(vec![("c1", "count", json!({}))]));
    model.inner.push_response(text_response("finished"));

    let agent = AgentDefinition::new("worker", "test agent")
        .with_tool(Arc::new(CountingTool { executions: Arc::clone(&executions) }));
    let mut ctx = context_with(
        Arc::clone(&model) as Arc<dyn LanguageModel>,
        agent,
        RunnerConfig::default(),
    );

    let result = AgentRunner::new().run(&mut ctx, "count once").await.unwrap();
    assert_eq!(result, "finished");
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(model.call_count(), 2);

    let chain = ctx.chain.lock().unwrap();
    assert_eq!(chain.records.len(), 1);
    assert!(chain.records[0].ok);
}

#[tokio::test]
async fn test_duplicate_tool_calls_collapse_to_one_execution() {
    let executions = Arc::new(AtomicU32::new(0));
    let model = Arc::new(CountingModel::new());
    model.inner.push_response(tool_response(vec![
        ("c1", "count", json!({"target": "page"})),
        ("c2", "count", json!({"target": "page"})),
        ("c3", "count", json!({"target": "other"})),
    ]));
    model.inner.push_response(text_response("done"));

    let agent = AgentDefinition::new("worker", "test agent")
        .with_tool(Arc::new(CountingTool { executions: Arc::clone(&executions) }));
    let mut ctx = context_with(
        Arc::clone(&model) as Arc<dyn LanguageModel>,
        agent,
        RunnerConfig::default(),
    );

    AgentRunner::new().run(&mut ctx, "count").await.unwrap();
    // Two distinct (name, args) pairs out of three calls.
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_ten_consecutive_failures_terminate_with_last_error() {
    let model = Arc::new(CountingModel::new());
    for i in 0..10 {
        model
            .inner
            .push_response(tool_response(vec![(&format!("c{}", i), "flaky", json!({}))]));
    }

    let agent =
        AgentDefinition::new("worker", "test agent").with_tool(Arc::new(FailingTool));
    let mut ctx = context_with(
        Arc::clone(&model) as Arc<dyn LanguageModel>,
        agent,
        RunnerConfig::default(),
    );

    let err = AgentRunner::new().run(&mut ctx, "keep trying").await.unwrap_err();
    match err {
        CoreError::ToolFailuresExhausted { agent, count, last_error } => {
            assert_eq!(agent, "worker");
            assert_eq!(count, 10);
            assert!(last_error.starts_with("Error"));
        }
        other => panic!("expected failure budget error, got {:?}", other),
    }
    assert_eq!(model.call_count(), 10);
}

#[tokio::test]
async fn test_nine_failures_then_success_resets_counter() {
    let executions = Arc::new(AtomicU32::new(0));
    let model = Arc::new(CountingModel::new());
    for i in 0..9 {
        model
            .inner
            .push_response(tool_response(vec![(&format!("c{}", i), "flaky", json!({}))]));
    }
    model.inner.push_response(tool_response(vec![("c9", "count", json!({}))]));
    model.inner.push_response(text_response("recovered"));

    let agent = AgentDefinition::new("worker", "test agent")
        .with_tool(Arc::new(FailingTool))
        .with_tool(Arc::new(CountingTool { executions: Arc::clone(&executions) }));
    let mut ctx = context_with(
        Arc::clone(&model) as Arc<dyn LanguageModel>,
        agent,
        RunnerConfig::default(),
    );

    let result = AgentRunner::new().run(&mut ctx, "keep trying").await.unwrap();
    assert_eq!(result, "recovered");
    assert_eq!(ctx.consecutive_tool_errors, 0);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_iteration_budget_returns_unfinished() {
    let executions = Arc::new(AtomicU32::new(0));
    let model = Arc::new(CountingModel::new());
    for i in 0..3 {
        model
            .inner
            .push_response(tool_response(vec![(&format!("c{}", i), "count", json!({"i": i}))]));
    }

    let agent = AgentDefinition::new("worker", "test agent")
        .with_tool(Arc::new(CountingTool { executions: Arc::clone(&executions) }));
    let config = RunnerConfig { max_iterations: 3, ..RunnerConfig::default() };
    let mut ctx =
        context_with(Arc::clone(&model) as Arc<dyn LanguageModel>, agent, config);

    let result = AgentRunner::new().run(&mut ctx, "never converge").await.unwrap();
    assert_eq!(result, UNFINISHED);
    assert_eq!(model.call_count(), 3);
}

#[tokio::test]
async fn test_cancellation_preempts_the_loop() {
    let model = Arc::new(CountingModel::new());
    let mut ctx = context_with(
        Arc::clone(&model) as Arc<dyn LanguageModel>,
        AgentDefinition::new("worker", "test agent"),
        RunnerConfig::default(),
    );
    ctx.task.cancel.cancel();

    let err = AgentRunner::new().run(&mut ctx, "anything").await.unwrap_err();
    assert!(matches!(err, CoreError::Cancelled));
    assert_eq!(model.call_count(), 0);
}

#[tokio::test]
async fn test_unknown_tool_is_an_error_result_not_a_crash() {
    let model = Arc::new(CountingModel::new());
    model.inner.push_response(tool_response(vec![("c1", "nonexistent", json!({}))]));
    model.inner.push_response(text_response("recovered"));

    let mut ctx = context_with(
        Arc::clone(&model) as Arc<dyn LanguageModel>,
        AgentDefinition::new("worker", "test agent"),
        RunnerConfig::default(),
    );

    let result = AgentRunner::new().run(&mut ctx, "call something").await.unwrap();
    assert_eq!(result, "recovered");

    let chain = ctx.chain.lock().unwrap();
    assert_eq!(chain.records.len(), 1);
    assert!(!chain.records[0].ok);
    assert!(chain.records[0].result_text.contains("not found"));
}

/// Delegates to a mock but claims images cannot travel in tool results,
/// forcing the synthetic follow-up user turn.
struct NoToolImagesModel {
    inner: MockProvider,
}

#[async_trait]
impl LanguageModel for NoToolImagesModel {
    async fn call(&self, request: &LanguageRequest) -> Result<LanguageResponse, ModelError> {
        self.inner.call(request).await
    }

    async fn call_stream(&self, request: &LanguageRequest) -> Result<EventStream, ModelError> {
        self.inner.call_stream(request).await
    }

    fn model_id(&self) -> &str {
        "no-tool-images"
    }
}

struct ScreenshotTool;

#[async_trait]
impl Tool for ScreenshotTool {
    fn name(&self) -> &str {
        "screenshot"
    }

    fn description(&self) -> &str {
        "captures the screen"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value, _ctx: &mut AgentContext) -> anyhow::Result<ToolResult> {
        Ok(ToolResult::image("iVBORw0KGgo=", "image/png"))
    }
}

#[tokio::test]
async fn test_image_result_gets_synthetic_user_turn() {
    let model = Arc::new(NoToolImagesModel { inner: MockProvider::new("mock") });
    model.inner.push_response(tool_response(vec![("c1", "screenshot", json!({}))]));
    // The second turn has an empty script: the mock echoes the latest user
    // message, which should be the synthetic image follow-up.

    let agent =
        AgentDefinition::new("worker", "test agent").with_tool(Arc::new(ScreenshotTool));
    let mut ctx = context_with(
        Arc::clone(&model) as Arc<dyn LanguageModel>,
        agent,
        RunnerConfig::default(),
    );

    let result = AgentRunner::new().run(&mut ctx, "take a screenshot").await.unwrap();
    assert!(
        result.contains("screenshot"),
        "expected the synthetic follow-up turn to reference the tool, got: {}",
        result
    );
}

/// Refreshes the listing on every iteration.
struct AlwaysRefresh;

impl ToolRefreshPolicy for AlwaysRefresh {
    fn should_refresh(&self, _iteration: u32, _ctx: &AgentContext) -> bool {
        true
    }
}

#[tokio::test]
async fn test_used_tool_survives_listing_omission() {
    use cadre_abstraction::ToolDefinition;
    use cadre_core::{ListToolsParams, RemoteToolService};
    use std::sync::Mutex;

    /// Lists one tool on the first call and nothing afterwards.
    struct VanishingListing {
        listings: Mutex<u32>,
        executions: Arc<AtomicU32>,
    }

    #[async_trait]
    impl RemoteToolService for VanishingListing {
        async fn connect(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn list_tools(
            &self,
            _params: &ListToolsParams,
        ) -> anyhow::Result<Vec<ToolDefinition>> {
            let mut listings = self.listings.lock().unwrap();
            *listings += 1;
            if *listings == 1 {
                Ok(vec![ToolDefinition {
                    name: "remote_probe".to_string(),
                    description: "probes something remote".to_string(),
                    parameters: json!({"type": "object", "properties": {}}),
                }])
            } else {
                Ok(Vec::new())
            }
        }

        async fn call_tool(
            &self,
            name: &str,
            _arguments: Value,
            _ext_info: Option<Value>,
        ) -> anyhow::Result<ToolResult> {
            assert_eq!(name, "remote_probe");
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(ToolResult::text("probed"))
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let executions = Arc::new(AtomicU32::new(0));
    let model = Arc::new(CountingModel::new());
    // The tool is called in two separate turns; by the second turn the
    // listing no longer contains it.
    model.inner.push_response(tool_response(vec![("c1", "remote_probe", json!({"n": 1}))]));
    model.inner.push_response(tool_response(vec![("c2", "remote_probe", json!({"n": 2}))]));
    model.inner.push_response(text_response("done"));

    let mut ctx = context_with(
        Arc::clone(&model) as Arc<dyn LanguageModel>,
        AgentDefinition::new("worker", "test agent"),
        RunnerConfig::default(),
    );

    let runner = AgentRunner::new()
        .with_remote_tools(Arc::new(VanishingListing {
            listings: Mutex::new(0),
            executions: Arc::clone(&executions),
        }))
        .with_refresh_policy(Arc::new(AlwaysRefresh));

    let result = runner.run(&mut ctx, "probe twice").await.unwrap();
    assert_eq!(result, "done");
    assert_eq!(executions.load(Ordering::SeqCst), 2);

    let chain = ctx.chain.lock().unwrap();
    assert_eq!(chain.error_count(), 0);
}
