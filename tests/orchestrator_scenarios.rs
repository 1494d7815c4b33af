//! 端到端场景：脚本化 LLM + 脚本化工具执行器驱动完整轮次

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bee_loop::config::{AppConfig, ReflectionMode, StorageBackend};
use bee_loop::core::{
    AgentState, ApprovalDecision, AuditOutcome, CheckpointTrigger, Orchestrator, OrchestratorBuilder,
    StepStatus,
};
use bee_loop::llm::ScriptedLlmClient;
use bee_loop::memory::{FileStorage, MemoryStorage, StateStorage, StorageKey};
use bee_loop::react::{LoopEvent, ToolCall};
use bee_loop::tools::{ToolExecutor, ToolResult};
use tokio::sync::mpsc;

/// 按工具名返回固定结果并记录调用
#[derive(Default)]
struct ScriptedExecutor {
    replies: HashMap<String, ToolResult>,
    calls: Mutex<Vec<ToolCall>>,
    delay: Option<Duration>,
}

impl ScriptedExecutor {
    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn reply(mut self, tool: &str, result: ToolResult) -> Self {
        self.replies.insert(tool.to_string(), result);
        self
    }

    fn calls_to(&self, tool: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.tool == tool)
            .count()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ToolExecutor for ScriptedExecutor {
    async fn execute(&self, call: &ToolCall) -> ToolResult {
        self.calls.lock().unwrap().push(call.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .get(&call.tool)
            .cloned()
            .unwrap_or_else(|| ToolResult::failure(format!("unknown tool: {} (not found)", call.tool)))
    }

    fn tool_names(&self) -> Vec<String> {
        self.replies.keys().cloned().collect()
    }
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.app.storage = StorageBackend::Memory;
    config.llm.provider = "mock".into();
    config.checkpoint.interval_secs = 0;
    config.retry.request_alternatives = false;
    config.approval.enabled = false;
    config
}

fn build(
    config: AppConfig,
    llm: Arc<ScriptedLlmClient>,
    executor: Arc<ScriptedExecutor>,
    storage: Arc<dyn StateStorage>,
) -> Orchestrator {
    OrchestratorBuilder::new(config)
        .with_llm(llm)
        .with_executor(executor)
        .with_storage(storage)
        .build()
        .unwrap()
}

const THREE_STEP_PLAN: &str = "1. build the project\n2. run the tests\n3. deploy the service";
const GOAL: &str = "build the project, then run the tests, then deploy";

fn retry_scenario() -> (Arc<ScriptedLlmClient>, Arc<ScriptedExecutor>) {
    let llm = Arc::new(ScriptedLlmClient::new([
        THREE_STEP_PLAN,
        r#"{"tool": "build", "args": {}}"#,
        r#"{"tool": "test", "args": {}}"#,
    ]));
    let executor = Arc::new(
        ScriptedExecutor::default()
            .reply("build", ToolResult::success("build succeeded"))
            .reply("test", ToolResult::failure("operation timed out"))
            .reply("deploy", ToolResult::success("deployed")),
    );
    (llm, executor)
}

#[tokio::test]
async fn test_step_fails_after_retries_and_later_steps_wait() {
    let mut config = test_config();
    config.retry.max_retries = 2;
    let (llm, executor) = retry_scenario();
    let orchestrator = build(config, llm.clone(), executor.clone(), Arc::new(MemoryStorage::new()));

    let result = orchestrator.run_turn("s1", GOAL).await.unwrap();

    assert_eq!(result.plan_progress.completed, 1);
    assert_eq!(result.plan_progress.failed, 1);
    assert_eq!(result.plan_progress.total, 3);
    assert_eq!(executor.calls_to("build"), 1);
    assert_eq!(executor.calls_to("test"), 3);
    assert_eq!(executor.calls_to("deploy"), 0);
    assert_eq!(llm.call_count(), 3);
    assert_eq!(result.last_state, AgentState::Error);
    assert_eq!(result.iterations, 4);
    let reason = result.failure_reason.unwrap();
    assert!(reason.contains("retries exhausted"), "{reason}");
    assert!(reason.contains("timed out"));

    let state = orchestrator.store().get_state("s1").await;
    let plan = state.plan.as_ref().unwrap();
    assert_eq!(plan.steps[1].status, StepStatus::Failed);
    assert_eq!(plan.steps[2].status, StepStatus::Active);
    assert!(state.check_invariant());
    assert_eq!(state.counters.total_tool_calls, 4);
}

#[tokio::test(start_paused = true)]
async fn test_approval_timeout_fails_step_without_executing() {
    let mut config = test_config();
    config.approval.enabled = true;
    config.approval.timeout_ms = 500;
    let llm = Arc::new(ScriptedLlmClient::new([r#"{"tool": "shell", "args": {"command": "ls"}}"#]));
    let executor = Arc::new(ScriptedExecutor::default().reply("shell", ToolResult::success("a.txt")));
    let orchestrator = build(config, llm, executor.clone(), Arc::new(MemoryStorage::new()));

    let result = orchestrator.run_turn("s1", "list files").await.unwrap();

    assert_eq!(executor.total_calls(), 0);
    let reason = result.failure_reason.unwrap();
    assert!(reason.contains("approval timed out"), "{reason}");
    assert_eq!(result.last_state, AgentState::Idle);
    assert_eq!(result.plan_progress.failed, 1);

    let audit = orchestrator.audit_log();
    let last = audit.last().unwrap();
    assert_eq!(last.outcome, AuditOutcome::TimedOut);
    assert_eq!(last.tier, 2);
    assert!(orchestrator.pending_approvals(Some("s1")).is_empty());

    let state = orchestrator.store().get_state("s1").await;
    let step = &state.plan.as_ref().unwrap().steps[0];
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.error.as_deref().unwrap().contains("approval timed out"));
}

#[tokio::test]
async fn test_deferred_approval_resumes_next_turn() {
    let mut config = test_config();
    config.approval.enabled = true;
    config.orchestrator.defer_approvals = true;
    let llm = Arc::new(ScriptedLlmClient::new([r#"{"tool": "shell", "args": {"command": "ls"}}"#]));
    let executor = Arc::new(ScriptedExecutor::default().reply("shell", ToolResult::success("a.txt b.txt")));
    let orchestrator = build(config, llm.clone(), executor.clone(), Arc::new(MemoryStorage::new()));

    let first = orchestrator.run_turn("s1", "list files").await.unwrap();
    let request = first.pending_approval.clone().unwrap();
    assert_eq!(first.last_state, AgentState::WaitingHuman);
    assert_eq!(executor.total_calls(), 0);
    assert_eq!(orchestrator.pending_approvals(None).len(), 1);

    assert!(orchestrator.resolve_approval(&request.id, ApprovalDecision::Approve));
    let second = orchestrator.run_turn("s1", "list files").await.unwrap();

    assert_eq!(executor.total_calls(), 1);
    assert_eq!(second.plan_progress.completed, 1);
    assert_eq!(second.last_state, AgentState::Idle);
    assert!(second.failure_reason.is_none());
    assert_eq!(llm.call_count(), 1);
    assert!(orchestrator.get_status("s1").await.is_complete);
}

#[tokio::test(start_paused = true)]
async fn test_deferred_approval_expires_under_deny_policy() {
    let mut config = test_config();
    config.approval.enabled = true;
    config.approval.timeout_ms = 500;
    config.orchestrator.defer_approvals = true;
    let llm = Arc::new(ScriptedLlmClient::new([r#"{"tool": "shell", "args": {"command": "ls"}}"#]));
    let executor = Arc::new(ScriptedExecutor::default().reply("shell", ToolResult::success("a.txt")));
    let orchestrator = build(config, llm, executor.clone(), Arc::new(MemoryStorage::new()));

    let first = orchestrator.run_turn("s1", "list files").await.unwrap();
    let request = first.pending_approval.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(!orchestrator.resolve_approval(&request.id, ApprovalDecision::Approve));
    let second = orchestrator.run_turn("s1", "list files").await.unwrap();

    assert_eq!(executor.total_calls(), 0);
    let reason = second.failure_reason.unwrap();
    assert!(reason.contains("approval timed out"), "{reason}");
    assert_eq!(second.plan_progress.failed, 1);
    assert!(orchestrator
        .audit_log()
        .iter()
        .all(|e| e.outcome != AuditOutcome::Approved));
}

#[tokio::test(start_paused = true)]
async fn test_interval_checkpoint_follows_durable_save() {
    let mut config = test_config();
    config.plan.auto_save_every = 50;
    config.checkpoint.interval_secs = 5;
    let storage = Arc::new(MemoryStorage::new());
    let llm = Arc::new(ScriptedLlmClient::new([r#"{"tool": "build", "args": {}}"#]));
    let executor = Arc::new(
        ScriptedExecutor::default()
            .reply("build", ToolResult::success("build succeeded"))
            .with_delay(Duration::from_secs(20)),
    );
    let orchestrator = Arc::new(build(config, llm, executor, storage.clone()));

    let runner = Arc::clone(&orchestrator);
    let handle = tokio::spawn(async move { runner.run_turn("s1", "build it").await });
    tokio::time::sleep(Duration::from_secs(12)).await;

    let listed = orchestrator.list_checkpoints("s1").await.unwrap();
    assert!(listed.iter().any(|c| c.trigger == CheckpointTrigger::Interval));
    let persisted = storage
        .read(&StorageKey::session("plan_state", "s1"))
        .await
        .unwrap();
    assert!(persisted.is_some());

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.plan_progress.completed, 1);
}

#[tokio::test]
async fn test_blocked_tier_gives_up_without_executing() {
    let mut config = test_config();
    config.approval.enabled = true;
    config.approval.block_tier = Some(3);
    let llm = Arc::new(ScriptedLlmClient::new([
        r#"{"tool": "shell", "args": {"command": "rm -rf /tmp/x"}}"#,
    ]));
    let executor = Arc::new(ScriptedExecutor::default().reply("shell", ToolResult::success("")));
    let orchestrator = build(config, llm, executor.clone(), Arc::new(MemoryStorage::new()));

    let result = orchestrator.run_turn("s1", "clean tmp").await.unwrap();

    assert_eq!(executor.total_calls(), 0);
    let reason = result.failure_reason.unwrap();
    assert!(reason.contains("no alternative call"), "{reason}");
    assert!(reason.contains("blocked at 3"));
    assert_eq!(orchestrator.audit_log()[0].outcome, AuditOutcome::Blocked);
}

#[tokio::test]
async fn test_text_reply_completes_step() {
    let llm = Arc::new(ScriptedLlmClient::new(["Hello there!"]));
    let executor = Arc::new(ScriptedExecutor::default());
    let orchestrator = build(test_config(), llm, executor, Arc::new(MemoryStorage::new()));

    let result = orchestrator.run_turn("s1", "say hello").await.unwrap();

    assert_eq!(result.plan_progress.completed, 1);
    assert_eq!(result.plan_progress.total, 1);
    assert_eq!(result.iterations, 1);
    assert_eq!(result.last_state, AgentState::Idle);
    let state = orchestrator.store().get_state("s1").await;
    assert_eq!(state.plan.unwrap().steps[0].result.as_deref(), Some("Hello there!"));
    assert!(orchestrator.transition_count("s1").await >= 5);
}

#[tokio::test]
async fn test_checkpoints_pruned_to_limit() {
    let mut config = test_config();
    config.checkpoint.max_checkpoints_per_session = 2;
    let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
    let orchestrator = build(config, llm, Arc::new(ScriptedExecutor::default()), Arc::new(MemoryStorage::new()));

    let store = orchestrator.store();
    let first = store.create_manual_checkpoint("s1", "one").await.unwrap();
    store.create_manual_checkpoint("s1", "two").await.unwrap();
    store.create_manual_checkpoint("s1", "three").await.unwrap();

    let listed = orchestrator.list_checkpoints("s1").await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|c| c.id != first.id));
    assert_eq!(listed[1].description, "three");
    assert_eq!(store.get_state("s1").await.checkpoints.len(), 2);
}

#[tokio::test]
async fn test_restore_without_checkpoints() {
    let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
    let orchestrator = build(test_config(), llm, Arc::new(ScriptedExecutor::default()), Arc::new(MemoryStorage::new()));

    let result = orchestrator.restore("nobody", None).await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("no checkpoint found"));
}

#[tokio::test]
async fn test_restore_step_checkpoint_reopens_failed_step() {
    let (llm, executor) = retry_scenario();
    let orchestrator = build(test_config(), llm, executor, Arc::new(MemoryStorage::new()));
    orchestrator.run_turn("s1", GOAL).await.unwrap();

    let listed = orchestrator.list_checkpoints("s1").await.unwrap();
    let after_step_one = listed
        .iter()
        .find(|c| c.description == "step step-1 complete")
        .unwrap();
    let restored = orchestrator.restore("s1", Some(&after_step_one.id)).await;
    assert!(restored.success);

    let status = orchestrator.get_status("s1").await;
    assert!(status.has_active_plan);
    assert_eq!(status.active_step.unwrap().id, "step-2");
    assert_eq!(status.progress.completed, 1);
    assert_eq!(status.progress.failed, 0);
    assert_eq!(orchestrator.agent_state("s1").await, AgentState::Idle);
}

#[tokio::test]
async fn test_plan_survives_restart_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.orchestrator.max_iterations_per_turn = 1;

    let llm = Arc::new(ScriptedLlmClient::new([
        "1. build the project\n2. deploy the service",
        r#"{"tool": "build", "args": {}}"#,
    ]));
    let executor = Arc::new(
        ScriptedExecutor::default()
            .reply("build", ToolResult::success("build succeeded"))
            .reply("deploy", ToolResult::success("deployed")),
    );
    let first = build(config.clone(), llm, executor.clone(), Arc::new(FileStorage::new(dir.path())));
    let result = first.run_turn("s1", "build the project then deploy it").await.unwrap();
    assert_eq!(result.plan_progress.completed, 1);
    assert!(result.failure_reason.unwrap().contains("iteration limit"));
    assert!(first.get_status("s1").await.has_incomplete_work);
    drop(first);

    let llm = Arc::new(ScriptedLlmClient::new([r#"{"tool": "deploy", "args": {}}"#]));
    let second = build(config, llm.clone(), executor.clone(), Arc::new(FileStorage::new(dir.path())));
    let result = second.run_turn("s1", "build the project then deploy it").await.unwrap();

    assert_eq!(llm.call_count(), 1);
    assert_eq!(result.plan_progress.completed, 2);
    let status = second.get_status("s1").await;
    assert!(status.is_complete);
    assert!(!status.has_incomplete_work);
    assert_eq!(executor.calls_to("deploy"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_replanning_keeps_current_plan() {
    let mut config = test_config();
    config.orchestrator.reflection = ReflectionMode::Critic;
    let llm = Arc::new(
        ScriptedLlmClient::new([
            "1. build the project\n2. deploy the service",
            r#"{"tool": "build", "args": {}}"#,
            "REPLAN",
            "1. rebuild everything\n2. deploy the service",
        ])
        .with_delay(Duration::from_secs(1)),
    );
    let executor = Arc::new(ScriptedExecutor::default().reply("build", ToolResult::success("build succeeded")));
    let orchestrator = Arc::new(build(config, llm, executor, Arc::new(MemoryStorage::new())));

    let runner = Arc::clone(&orchestrator);
    let handle = tokio::spawn(async move { runner.run_turn("s1", "build the project then deploy it").await });
    // 计划、下一步、评审各 1 秒，第 4 次调用（重新规划）进行中
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(orchestrator.cancel("s1"));

    let result = handle.await.unwrap().unwrap();
    assert!(result.cancelled);
    assert_eq!(result.plan_progress.completed, 1);
    let status = orchestrator.get_status("s1").await;
    assert_eq!(status.active_step.unwrap().action, "deploy the service");
    assert_eq!(status.progress.total, 2);
}

#[tokio::test]
async fn test_reset_session_discards_plan_and_checkpoints() {
    let (llm, executor) = retry_scenario();
    let storage = Arc::new(MemoryStorage::new());
    let orchestrator = build(test_config(), llm, executor, storage.clone());
    orchestrator.run_turn("s1", GOAL).await.unwrap();
    let saved = orchestrator.list_checkpoints("s1").await.unwrap().len();
    assert!(saved > 0);

    let removed = orchestrator.reset_session("s1").await.unwrap();
    assert_eq!(removed, saved);
    assert!(orchestrator.list_checkpoints("s1").await.unwrap().is_empty());
    let status = orchestrator.get_status("s1").await;
    assert!(!status.has_active_plan);
    assert!(!status.has_incomplete_work);
    assert!(storage
        .read(&StorageKey::session("plan_state", "s1"))
        .await
        .unwrap()
        .is_none());
    assert_eq!(orchestrator.agent_state("s1").await, AgentState::Idle);
}

#[tokio::test]
async fn test_cancel_during_approval_keeps_step_active() {
    let mut config = test_config();
    config.approval.enabled = true;
    let llm = Arc::new(ScriptedLlmClient::new([r#"{"tool": "shell", "args": {"command": "ls"}}"#]));
    let executor = Arc::new(ScriptedExecutor::default().reply("shell", ToolResult::success("a.txt")));
    let orchestrator = Arc::new(build(config, llm, executor.clone(), Arc::new(MemoryStorage::new())));

    let runner = Arc::clone(&orchestrator);
    let handle = tokio::spawn(async move { runner.run_turn("s1", "list files").await });

    let mut waited = 0;
    while orchestrator.pending_approvals(Some("s1")).is_empty() && waited < 500 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    assert!(orchestrator.cancel("s1"));

    let result = handle.await.unwrap().unwrap();
    assert!(result.cancelled);
    assert!(result.failure_reason.is_none());
    assert_eq!(executor.total_calls(), 0);
    assert_eq!(result.last_state, AgentState::Idle);

    let status = orchestrator.get_status("s1").await;
    assert_eq!(status.active_step.unwrap().status, StepStatus::Active);
    let last = orchestrator.audit_log().pop().unwrap();
    assert_eq!(last.outcome, AuditOutcome::Denied);
    assert_eq!(last.reason.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn test_events_stream_turn_progress() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let llm = Arc::new(ScriptedLlmClient::new([r#"{"tool": "echo", "args": {"text": "hi"}}"#]));
    let executor = Arc::new(ScriptedExecutor::default().reply("echo", ToolResult::success("done: hi")));
    let orchestrator = OrchestratorBuilder::new(test_config())
        .with_llm(llm)
        .with_executor(executor)
        .with_storage(Arc::new(MemoryStorage::new()))
        .with_event_sender(tx)
        .build()
        .unwrap();

    orchestrator.run_turn("s1", "echo hi").await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events.first(), Some(LoopEvent::TurnStarted { .. })));
    assert!(matches!(events.last(), Some(LoopEvent::TurnFinished { completed: 1, .. })));
    assert!(events.iter().any(|e| matches!(e, LoopEvent::PlanCreated { .. })));
    assert!(events.iter().any(|e| matches!(e, LoopEvent::StepCompleted { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, LoopEvent::StateChanged { to, .. } if to == "executing")));
}
