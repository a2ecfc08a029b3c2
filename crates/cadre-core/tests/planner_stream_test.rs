//! Integration tests for streaming plan construction and replanning.

use async_trait::async_trait;
use cadre_abstraction::{
    EventStream, FinishReason, LanguageModel, LanguageRequest, LanguageResponse, ModelError,
    Role, StreamEvent,
};
use cadre_core::{
    AgentDefinition, CoreError, PlanObserver, Planner, RunnerConfig, TaskContext, Workflow,
};
use std::sync::{Arc, Mutex};

const PLAN_DOC: &str = r#"<root>
  <name>Price check</name>
  <thought>One agent is enough.</thought>
  <agents>
    <agent name="browser">
      <task>Find the listed price</task>
      <nodes>
        <node>Open the product page</node>
        <node output="price">Record the price</node>
      </nodes>
    </agent>
  </agents>
</root>"#;

/// Streams a fixed document as small text deltas and records every request.
struct ChunkedModel {
    document: String,
    chunk_size: usize,
    requests: Mutex<Vec<LanguageRequest>>,
}

impl ChunkedModel {
    fn new(document: &str, chunk_size: usize) -> Self {
        Self {
            document: document.to_string(),
            chunk_size,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<LanguageRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ChunkedModel {
    async fn call(&self, _request: &LanguageRequest) -> Result<LanguageResponse, ModelError> {
        Ok(LanguageResponse::text(self.document.clone()))
    }

    async fn call_stream(&self, request: &LanguageRequest) -> Result<EventStream, ModelError> {
        self.requests.lock().unwrap().push(request.clone());

        let mut events: Vec<Result<StreamEvent, ModelError>> = Vec::new();
        let bytes = self.document.as_bytes();
        let mut start = 0;
        while start < bytes.len() {
            let mut end = usize::min(start + self.chunk_size, bytes.len());
            while !self.document.is_char_boundary(end) {
                end += 1;
            }
            events.push(Ok(StreamEvent::TextDelta {
                text: self.document[start..end].to_string(),
            }));
            start = end;
        }
        events.push(Ok(StreamEvent::Finish { reason: FinishReason::Stop, usage: None }));
        Ok(Box::pin(futures::stream::iter(events)))
    }

    fn model_id(&self) -> &str {
        "chunked"
    }
}

#[derive(Default)]
struct RecordingObserver {
    snapshots: Mutex<Vec<(Workflow, bool)>>,
}

impl PlanObserver for RecordingObserver {
    fn on_plan(&self, workflow: &Workflow, done: bool) {
        self.snapshots.lock().unwrap().push((workflow.clone(), done));
    }
}

fn task_with(model: Arc<dyn LanguageModel>) -> TaskContext {
    TaskContext::new(
        model,
        vec![Arc::new(AgentDefinition::new("browser", "drives a web browser"))],
        RunnerConfig::default(),
    )
}

#[tokio::test]
async fn test_streaming_plan_reports_partials_then_done() {
    let model = Arc::new(ChunkedModel::new(PLAN_DOC, 16));
    let task = task_with(Arc::clone(&model) as Arc<dyn LanguageModel>);
    let observer = RecordingObserver::default();

    let workflow = Planner::new()
        .plan(&task, "check the price", &observer)
        .await
        .unwrap();

    assert_eq!(workflow.name, "Price check");
    assert_eq!(workflow.agents.len(), 1);
    assert_eq!(workflow.agents[0].nodes.len(), 2);

    let snapshots = observer.snapshots.lock().unwrap();
    assert!(snapshots.len() > 1, "expected partial reports while streaming");
    // Exactly the last report is final.
    assert!(snapshots.last().unwrap().1);
    assert!(snapshots.iter().rev().skip(1).all(|(_, done)| !done));

    // The parsed plan is stored on the task for execution.
    assert_eq!(task.workflow().unwrap(), workflow);
    let record = task.planning_record().unwrap();
    assert_eq!(record.request, "check the price");
    assert_eq!(record.response, PLAN_DOC);
}

#[tokio::test]
async fn test_unparseable_final_document_is_fatal() {
    let model = Arc::new(ChunkedModel::new("I cannot produce a plan for that.", 8));
    let task = task_with(Arc::clone(&model) as Arc<dyn LanguageModel>);

    let err = Planner::new()
        .plan(&task, "do something", &cadre_core::planning::NoopPlanObserver)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Plan(_)));
}

#[tokio::test]
async fn test_replan_reuses_prior_exchange_as_history() {
    let model = Arc::new(ChunkedModel::new(PLAN_DOC, 32));
    let task = task_with(Arc::clone(&model) as Arc<dyn LanguageModel>);
    let planner = Planner::new();

    planner
        .plan(&task, "check the price", &cadre_core::planning::NoopPlanObserver)
        .await
        .unwrap();
    planner
        .replan(&task, "also capture the currency", &cadre_core::planning::NoopPlanObserver)
        .await
        .unwrap();

    let requests = model.requests();
    assert_eq!(requests.len(), 2);

    let replan_messages = &requests[1].messages;
    // system, prior user prompt, prior assistant response, new instruction.
    assert_eq!(replan_messages.len(), 4);
    assert_eq!(replan_messages[1].role, Role::User);
    assert_eq!(replan_messages[1].text_content(), "check the price");
    assert_eq!(replan_messages[2].role, Role::Assistant);
    assert_eq!(replan_messages[2].text_content(), PLAN_DOC);
    assert_eq!(replan_messages[3].text_content(), "also capture the currency");

    // The stored record now reflects the replan.
    assert_eq!(task.planning_record().unwrap().request, "also capture the currency");
}

#[tokio::test]
async fn test_cancellation_interrupts_planning() {
    let model = Arc::new(ChunkedModel::new(PLAN_DOC, 8));
    let task = task_with(Arc::clone(&model) as Arc<dyn LanguageModel>);
    task.cancel.cancel();

    let err = Planner::new()
        .plan(&task, "check the price", &cadre_core::planning::NoopPlanObserver)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Cancelled | CoreError::Model(ModelError::Cancelled)));
}

#[tokio::test]
async fn test_partial_snapshots_only_grow() {
    let model = Arc::new(ChunkedModel::new(PLAN_DOC, 12));
    let task = task_with(Arc::clone(&model) as Arc<dyn LanguageModel>);
    let observer = RecordingObserver::default();

    Planner::new().plan(&task, "check the price", &observer).await.unwrap();

    let snapshots = observer.snapshots.lock().unwrap();
    let mut max_nodes = 0;
    for (workflow, _) in snapshots.iter() {
        let nodes: usize = workflow.agents.iter().map(|a| a.nodes.len()).sum();
        assert!(nodes >= max_nodes, "a later snapshot lost plan content");
        max_nodes = nodes;
    }
}
