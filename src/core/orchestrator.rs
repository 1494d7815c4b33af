//! 编排器：一个 Agent 轮次的主控循环
//!
//! 每轮：加载计划状态；没有计划时交给 Planner 生成（或退化为单步计划）；
//! 对 active 步骤请求 Tool Call，经审批闸门后执行，交给 StepTracker 判定并更新 PlanStateStore；
//! 失败时进入 recovering 由 RetryEngine 决定重试或放弃；每次请求 LLM 前按预算管理上下文，
//! 按触发条件写检查点。
//!
//! 同一会话的轮次通过会话运行时的异步互斥严格串行；会话之间只共享存储后端。
//! 轮次结束时状态机停在 idle（正常 / 拒绝 / 取消）、error（重试耗尽）或 waiting_human（审批挂起到下一轮）。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::approval::{
    ApprovalDecision, ApprovalGate, ApprovalOutcome, ApprovalRequest, ApprovalResolution,
    AuditEntry, GateVerdict,
};
use crate::core::checkpoint::{CheckpointManager, CheckpointOptions, RestoreResult};
use crate::core::plan::{
    CheckpointRef, CheckpointTrigger, PlanProgress, PlanState, PlanStep, StepStatus, TaskPlan,
};
use crate::core::plan_state::PlanStateStore;
use crate::core::retry::{RetryDecision, RetryEngine};
use crate::core::session_supervisor::SessionSupervisor;
use crate::core::state::{AgentState, AgentStateMachine};
use crate::core::task_stack::TaskStack;
use crate::core::AgentError;
use crate::memory::Message;
use crate::react::events::preview;
use crate::react::{
    ContextManager, EventForwarder, LoopEvent, Planner, PlannerOutput, ReflectionDecision,
    ReflectionInput, ReflectionPolicy, StepTracker, Summarizer, ToolCall,
};
use crate::tools::{ToolExecutor, ToolResult};

/// 单轮内最多重新规划的次数
const MAX_REPLANS_PER_TURN: usize = 2;

const PREVIEW_CHARS: usize = 200;

/// 每次规划调用前从压缩历史中取回的摘要条数
const RECALL_HITS: usize = 3;

/// run_turn 的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnResult {
    pub session_id: String,
    pub plan_progress: PlanProgress,
    pub last_state: AgentState,
    pub pending_approval: Option<ApprovalRequest>,
    pub failure_reason: Option<String>,
    pub iterations: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub has_active_plan: bool,
    pub active_step: Option<PlanStep>,
    pub progress: PlanProgress,
    pub is_complete: bool,
    /// 最新检查点里还有未完成的计划
    pub has_incomplete_work: bool,
}

/// 挂起到下一轮的审批
pub(crate) struct PendingCall {
    request: ApprovalRequest,
    step_id: String,
}

/// 会话运行时：状态机、上下文与任务镜像只在内存中
pub(crate) struct SessionRuntime {
    fsm: AgentStateMachine,
    context: ContextManager,
    tasks: TaskStack,
    task_root: Option<String>,
    pending: Option<PendingCall>,
    last_summary: Option<String>,
}

/// 单轮的可变记录
#[derive(Default)]
struct Turn {
    iterations: usize,
    failure_reason: Option<String>,
    cancelled: bool,
    pending_approval: Option<ApprovalRequest>,
    replans: usize,
    /// 重试引擎给出的下一次调用；有值时本次迭代不再请求 LLM
    next_call: Option<ToolCall>,
}

enum Flow {
    Continue,
    EndTurn,
}

pub struct Orchestrator {
    pub(crate) config: AppConfig,
    pub(crate) store: Arc<PlanStateStore>,
    pub(crate) checkpoints: Arc<CheckpointManager>,
    pub(crate) planner: Arc<Planner>,
    pub(crate) executor: Arc<dyn ToolExecutor>,
    pub(crate) gate: Arc<ApprovalGate>,
    pub(crate) retry: RetryEngine,
    pub(crate) tracker: StepTracker,
    pub(crate) reflection: Arc<dyn ReflectionPolicy>,
    pub(crate) summarizer: Summarizer,
    pub(crate) supervisor: SessionSupervisor,
    pub(crate) events: Option<mpsc::UnboundedSender<LoopEvent>>,
    pub(crate) sessions: Mutex<HashMap<String, Arc<AsyncMutex<SessionRuntime>>>>,
}

/// 计划快照消息（每次请求 LLM 前替换）
fn render_plan(state: &PlanState) -> String {
    let Some(plan) = &state.plan else {
        return "No active plan.".to_string();
    };
    let mut out = format!("## Plan v{} for: {}\n", plan.version, plan.goal);
    for step in &plan.steps {
        let mark = match step.status {
            StepStatus::Pending => "[ ]",
            StepStatus::Active => "[>]",
            StepStatus::Complete => "[x]",
            StepStatus::Failed => "[!]",
            StepStatus::Skipped => "[-]",
        };
        out.push_str(&format!("{mark} {}: {}\n", step.id, step.action));
    }
    out
}

impl Orchestrator {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PlanStateStore> {
        &self.store
    }

    pub fn checkpoint_manager(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    fn emit(&self, event: LoopEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn runtime(&self, session_id: &str) -> Arc<AsyncMutex<SessionRuntime>> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let mut fsm = AgentStateMachine::new();
                if let Some(tx) = &self.events {
                    fsm.subscribe(Arc::new(EventForwarder::new(tx.clone())));
                }
                Arc::new(AsyncMutex::new(SessionRuntime {
                    fsm,
                    context: ContextManager::new(self.config.context.clone(), self.summarizer.clone()),
                    tasks: TaskStack::new(),
                    task_root: None,
                    pending: None,
                    last_summary: None,
                }))
            })
            .clone()
    }

    fn transition(rt: &mut SessionRuntime, to: AgentState, trigger: &str) -> Result<(), AgentError> {
        rt.fsm.transition(to, trigger, None)?;
        Ok(())
    }

    /// 把状态机收拢到可停留的状态：idle，或 error（重试耗尽 / 规划中断）
    fn wind_down(rt: &mut SessionRuntime, trigger: &str) -> Result<(), AgentError> {
        match rt.fsm.state() {
            AgentState::Executing | AgentState::Reflecting => {
                Self::transition(rt, AgentState::Completing, trigger)?;
                Self::transition(rt, AgentState::Idle, trigger)
            }
            AgentState::Completing | AgentState::WaitingHuman => {
                Self::transition(rt, AgentState::Idle, trigger)
            }
            AgentState::Planning | AgentState::Recovering | AgentState::Replanning => {
                Self::transition(rt, AgentState::Error, trigger)
            }
            AgentState::Idle | AgentState::Error | AgentState::Complete => Ok(()),
        }
    }

    /// 新一轮开始前回到 idle
    fn reset_to_idle(rt: &mut SessionRuntime) -> Result<(), AgentError> {
        Self::wind_down(rt, "reset")?;
        if matches!(rt.fsm.state(), AgentState::Error | AgentState::Complete) {
            Self::transition(rt, AgentState::Idle, "reset")?;
        }
        Ok(())
    }

    fn sync_tasks(rt: &mut SessionRuntime, state: &PlanState) {
        if let (Some(root), Some(plan)) = (rt.task_root.clone(), &state.plan) {
            rt.tasks.sync_plan(&root, plan);
        }
    }

    /// 执行一轮
    pub async fn run_turn(&self, session_id: &str, goal: &str) -> Result<TurnResult, AgentError> {
        let cancel = self.supervisor.begin_turn(session_id);
        let runtime = self.runtime(session_id);
        let mut rt = runtime.lock().await;
        let rt = &mut *rt;

        tracing::info!(session_id, goal, "turn started");
        self.emit(LoopEvent::TurnStarted {
            session_id: session_id.to_string(),
            goal: goal.to_string(),
        });
        self.store.init(session_id).await;
        self.store.record_turn(session_id).await;

        let mut turn = Turn::default();
        let flow = match rt.pending.take() {
            Some(pending) => self.resume_pending(rt, session_id, goal, pending, &cancel, &mut turn).await?,
            None => {
                Self::reset_to_idle(rt)?;
                self.begin_plan(rt, session_id, goal, &cancel, &mut turn).await?
            }
        };
        if let Flow::Continue = flow {
            self.ensure_auto_checkpoint(session_id);
            self.execute_loop(rt, session_id, goal, &cancel, &mut turn).await?;
        }
        self.finish_turn(rt, session_id, turn).await
    }

    /// idle → planning → executing；没有未完成计划时生成新计划
    async fn begin_plan(
        &self,
        rt: &mut SessionRuntime,
        session_id: &str,
        goal: &str,
        cancel: &CancellationToken,
        turn: &mut Turn,
    ) -> Result<Flow, AgentError> {
        Self::transition(rt, AgentState::Planning, "turn_started")?;
        let state = self.store.get_state(session_id).await;

        if state.has_active_plan() {
            tracing::debug!(session_id, "resuming unfinished plan");
            if rt.task_root.is_none() {
                if let Some(plan) = &state.plan {
                    rt.task_root = Some(rt.tasks.mirror_plan(plan));
                }
            }
            let same_goal = state.plan.as_ref().is_some_and(|p| p.goal == goal);
            if !same_goal && !goal.trim().is_empty() {
                rt.context.push_message(Message::user(goal));
            }
        } else {
            rt.context.working.clear();
            rt.context.working.set_goal(goal);
            rt.context.push_message(Message::user(goal));
            let plan = if self.planner.should_generate_plan(goal) {
                let generated = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        turn.cancelled = true;
                        return Ok(Flow::EndTurn);
                    }
                    r = self.planner.generate_plan(goal, &rt.context.working) => r,
                };
                match generated {
                    Ok(plan) => plan,
                    Err(e) => {
                        tracing::warn!(session_id, error = %e, "plan generation failed, using single-step plan");
                        self.emit(LoopEvent::Error {
                            text: format!("plan generation failed: {e}"),
                        });
                        TaskPlan::single_step(goal)
                    }
                }
            } else {
                TaskPlan::single_step(goal)
            };
            self.install_plan(rt, session_id, plan).await?;
        }

        Self::transition(rt, AgentState::Executing, "plan_ready")?;
        Ok(Flow::Continue)
    }

    async fn install_plan(
        &self,
        rt: &mut SessionRuntime,
        session_id: &str,
        plan: TaskPlan,
    ) -> Result<(), AgentError> {
        let diff = self.store.set_plan(session_id, plan).await?;
        let state = self.store.get_state(session_id).await;
        if let Some(plan) = &state.plan {
            tracing::info!(
                session_id,
                version = plan.version,
                steps = plan.steps.len(),
                added = diff.added.len(),
                removed = diff.removed.len(),
                "plan installed"
            );
            self.emit(LoopEvent::PlanCreated {
                version: plan.version,
                steps: plan.steps.iter().map(|s| s.action.clone()).collect(),
            });
            rt.task_root = Some(rt.tasks.mirror_plan(plan));
        }
        rt.context.set_plan_state_message(render_plan(&state));
        Ok(())
    }

    fn ensure_auto_checkpoint(&self, session_id: &str) {
        let interval = self.config.checkpoint.interval_secs;
        if interval == 0 || self.checkpoints.is_auto_checkpoint_running(session_id) {
            return;
        }
        let store = Arc::clone(&self.store);
        let sid = session_id.to_string();
        self.checkpoints.start_auto_checkpoint(
            session_id,
            move || {
                let store = Arc::clone(&store);
                let sid = sid.clone();
                async move {
                    match store.durable_snapshot(&sid).await {
                        Ok(state) => state.has_active_plan().then_some(state),
                        Err(e) => {
                            tracing::warn!(session_id = %sid, error = %e, "plan state flush failed, interval checkpoint skipped");
                            None
                        }
                    }
                }
            },
            Duration::from_secs(interval),
        );
    }

    async fn checkpoint(
        &self,
        rt: &SessionRuntime,
        session_id: &str,
        description: String,
        trigger: CheckpointTrigger,
    ) {
        let mut options = CheckpointOptions::new(description, trigger)
            .with_recent_messages(rt.context.recent_messages(self.config.checkpoint.recent_messages));
        if let Some(summary) = &rt.last_summary {
            options = options.with_summary(summary.clone());
        }
        match self.store.create_checkpoint(session_id, options).await {
            Ok(cp) => self.emit(LoopEvent::CheckpointCreated {
                checkpoint_id: cp.id,
                trigger: format!("{trigger:?}").to_lowercase(),
            }),
            Err(e) => tracing::warn!(session_id, error = %e, "checkpoint failed"),
        }
    }

    async fn execute_loop(
        &self,
        rt: &mut SessionRuntime,
        session_id: &str,
        goal: &str,
        cancel: &CancellationToken,
        turn: &mut Turn,
    ) -> Result<(), AgentError> {
        let max_iterations = self.config.orchestrator.max_iterations_per_turn;
        loop {
            if cancel.is_cancelled() {
                turn.cancelled = true;
                break;
            }
            let state = self.store.get_state(session_id).await;
            let Some(step) = state.active_step().cloned() else {
                break;
            };
            if turn.iterations >= max_iterations {
                tracing::warn!(session_id, max_iterations, "iteration limit reached");
                turn.failure_reason = Some(format!("iteration limit of {max_iterations} reached"));
                break;
            }
            turn.iterations += 1;

            let call = match turn.next_call.take() {
                Some(call) => call,
                None => {
                    if let Some(outcome) = rt.context.maybe_compact(turn.iterations, goal).await {
                        if outcome.summary.is_some() {
                            rt.last_summary = outcome.summary.clone();
                        }
                        self.emit(LoopEvent::ContextCompacted {
                            dropped: outcome.dropped,
                            summarized: outcome.summarized,
                            used_tokens: outcome.budget.used(),
                        });
                    }
                    rt.context.set_plan_state_message(render_plan(&state));
                    rt.context.refresh_recall(&step.action, RECALL_HITS);
                    let messages = rt.context.to_llm_messages();
                    let recall = rt.context.recall_section().to_string();
                    let output = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            turn.cancelled = true;
                            break;
                        }
                        r = self.planner.next_tool_call(&messages, &step, &rt.context.working, &recall) => r,
                    };
                    match output {
                        Ok(PlannerOutput::ToolCall(call)) => {
                            rt.context
                                .push_message(Message::tool_call(serde_json::to_string(&call)?));
                            call
                        }
                        Ok(PlannerOutput::Response(text)) => {
                            rt.context.push_message(Message::assistant(text.clone()));
                            Self::transition(rt, AgentState::Reflecting, "step_response")?;
                            let state = self
                                .tracker
                                .mark_complete(&self.store, session_id, &step.id, Some(text.clone()))
                                .await?;
                            match self
                                .on_step_complete(rt, session_id, goal, &step, &state, &text, 1.0, cancel, turn)
                                .await?
                            {
                                Flow::Continue => continue,
                                Flow::EndTurn => break,
                            }
                        }
                        Err(e) => match self.on_capability_failure(rt, session_id, &step, &e.to_string(), turn).await? {
                            Flow::Continue => continue,
                            Flow::EndTurn => break,
                        },
                    }
                }
            };

            if let Flow::EndTurn = self
                .dispatch(rt, session_id, goal, &step, call, cancel, turn)
                .await?
            {
                break;
            }
        }
        Ok(())
    }

    /// 请求下一步失败（超时 / LLM 错误）：与工具失败共用重试预算，但不产生替代调用
    async fn on_capability_failure(
        &self,
        rt: &mut SessionRuntime,
        session_id: &str,
        step: &PlanStep,
        error: &str,
        turn: &mut Turn,
    ) -> Result<Flow, AgentError> {
        tracing::warn!(session_id, step_id = %step.id, error, "next-step request failed");
        rt.context.working.add_failure(format!("planner: {error}"));
        Self::transition(rt, AgentState::Recovering, "capability_failure")?;
        match self.retry.record_capability_failure(session_id, &step.id, error) {
            None => {
                Self::transition(rt, AgentState::Executing, "retry")?;
                Ok(Flow::Continue)
            }
            Some(reason) => self.give_up(rt, session_id, step, reason, turn).await,
        }
    }

    /// 审批闸门 → 执行
    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        rt: &mut SessionRuntime,
        session_id: &str,
        goal: &str,
        step: &PlanStep,
        call: ToolCall,
        cancel: &CancellationToken,
        turn: &mut Turn,
    ) -> Result<Flow, AgentError> {
        match self.gate.evaluate(session_id, &call).await {
            GateVerdict::Allow { .. } => {
                self.execute_and_track(rt, session_id, goal, step, call, cancel, turn)
                    .await
            }
            GateVerdict::Block { reason, .. } => {
                let result = ToolResult::failure(format!("permission denied: {reason}"));
                rt.context
                    .push_message(Message::tool_result(format!("Error: {}", result.error_text())));
                self.handle_failure(rt, session_id, step, &call, &result, turn)
                    .await
            }
            GateVerdict::Pending(request) => {
                self.emit(LoopEvent::ApprovalRequested {
                    request_id: request.id.clone(),
                    tool: call.tool.clone(),
                    tier: request.tier,
                    deadline: request.deadline.to_rfc3339(),
                });
                Self::transition(rt, AgentState::WaitingHuman, "approval_required")?;
                if self.config.orchestrator.defer_approvals {
                    tracing::info!(session_id, request_id = %request.id, "approval deferred to next turn");
                    rt.pending = Some(PendingCall {
                        request: request.clone(),
                        step_id: step.id.clone(),
                    });
                    turn.pending_approval = Some(request);
                    return Ok(Flow::EndTurn);
                }
                let outcome = self.gate.wait(&request.id, cancel).await;
                self.after_approval(rt, session_id, goal, step, &request, outcome, cancel, turn)
                    .await
            }
        }
    }

    /// 恢复上一轮挂起的审批
    async fn resume_pending(
        &self,
        rt: &mut SessionRuntime,
        session_id: &str,
        goal: &str,
        pending: PendingCall,
        cancel: &CancellationToken,
        turn: &mut Turn,
    ) -> Result<Flow, AgentError> {
        let state = self.store.get_state(session_id).await;
        let step = state
            .plan
            .as_ref()
            .and_then(|p| p.step(&pending.step_id))
            .filter(|s| s.status == StepStatus::Active)
            .cloned();
        let still_pending = self.gate.is_open(&pending.request.id);

        match step {
            Some(step) if still_pending && rt.fsm.state() == AgentState::WaitingHuman => {
                let outcome = self.gate.wait(&pending.request.id, cancel).await;
                self.after_approval(rt, session_id, goal, &step, &pending.request, outcome, cancel, turn)
                    .await
            }
            _ => {
                tracing::info!(session_id, request_id = %pending.request.id, "pending approval withdrawn");
                Self::reset_to_idle(rt)?;
                self.begin_plan(rt, session_id, goal, cancel, turn).await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn after_approval(
        &self,
        rt: &mut SessionRuntime,
        session_id: &str,
        goal: &str,
        step: &PlanStep,
        request: &ApprovalRequest,
        outcome: ApprovalOutcome,
        cancel: &CancellationToken,
        turn: &mut Turn,
    ) -> Result<Flow, AgentError> {
        self.emit(LoopEvent::ApprovalResolved {
            request_id: outcome.request_id.clone(),
            resolution: outcome.resolution.to_string(),
            reason: outcome.reason.clone(),
        });

        if outcome.approved {
            Self::transition(rt, AgentState::Executing, "approval_granted")?;
            return self
                .execute_and_track(rt, session_id, goal, step, request.tool_call.clone(), cancel, turn)
                .await;
        }

        if cancel.is_cancelled() {
            // 取消不算步骤失败，步骤保持 active 以便恢复
            turn.cancelled = true;
            return Ok(Flow::EndTurn);
        }

        let label = match outcome.resolution {
            ApprovalResolution::TimedOut => "approval timed out",
            _ => "approval denied",
        };
        let mut reason = format!("{label} for tool '{}' (tier {})", request.tool_call.tool, request.tier);
        if outcome.reason != label {
            reason.push_str(&format!(": {}", outcome.reason));
        }
        let state = self
            .tracker
            .mark_failed(&self.store, session_id, &step.id, &reason)
            .await?;
        Self::sync_tasks(rt, &state);
        rt.context.working.add_failure(reason.clone());
        rt.context
            .push_message(Message::tool_result(format!("Error: {reason}")));
        self.emit(LoopEvent::StepFailed {
            step_id: step.id.clone(),
            reason: reason.clone(),
        });
        tracing::info!(session_id, step_id = %step.id, reason = %reason, "step failed on approval");
        turn.failure_reason = Some(reason);
        Self::transition(rt, AgentState::Idle, "approval_rejected")?;
        Ok(Flow::EndTurn)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_and_track(
        &self,
        rt: &mut SessionRuntime,
        session_id: &str,
        goal: &str,
        step: &PlanStep,
        call: ToolCall,
        cancel: &CancellationToken,
        turn: &mut Turn,
    ) -> Result<Flow, AgentError> {
        self.emit(LoopEvent::ToolCall {
            step_id: step.id.clone(),
            tool: call.tool.clone(),
            args: call.args.clone(),
        });
        self.store.record_tool_call(session_id).await;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                turn.cancelled = true;
                return Ok(Flow::EndTurn);
            }
            r = self.executor.execute(&call) => r,
        };

        let observation = if result.success {
            result.output.clone()
        } else {
            format!("Error: {}", result.error_text())
        };
        self.emit(LoopEvent::Observation {
            step_id: step.id.clone(),
            tool: call.tool.clone(),
            success: result.success,
            preview: preview(&observation, PREVIEW_CHARS),
        });
        rt.context.push_message(Message::tool_result(observation));

        if !result.success {
            return self
                .handle_failure(rt, session_id, step, &call, &result, turn)
                .await;
        }

        Self::transition(rt, AgentState::Reflecting, "tool_result")?;
        let analysis = self.tracker.analyze_tool_result(&call, &result, step).await;
        if !analysis.is_complete {
            tracing::debug!(session_id, step_id = %step.id, reason = %analysis.reason, "step not complete yet");
            rt.context
                .working
                .add_attempt(format!("{}: {}", call.tool, analysis.reason));
            Self::transition(rt, AgentState::Executing, "step_incomplete")?;
            return Ok(Flow::Continue);
        }

        let state = self
            .tracker
            .mark_complete(&self.store, session_id, &step.id, analysis.suggested_result.clone())
            .await?;
        self.on_step_complete(
            rt,
            session_id,
            goal,
            step,
            &state,
            &result.output,
            analysis.confidence,
            cancel,
            turn,
        )
        .await
    }

    /// 步骤完成后（状态机处于 reflecting）：检查点 + 反思
    #[allow(clippy::too_many_arguments)]
    async fn on_step_complete(
        &self,
        rt: &mut SessionRuntime,
        session_id: &str,
        goal: &str,
        step: &PlanStep,
        state: &PlanState,
        observation: &str,
        confidence: f32,
        cancel: &CancellationToken,
        turn: &mut Turn,
    ) -> Result<Flow, AgentError> {
        self.retry.reset(session_id, &step.id);
        Self::sync_tasks(rt, state);
        self.emit(LoopEvent::StepCompleted {
            step_id: step.id.clone(),
            confidence,
        });
        tracing::info!(session_id, step_id = %step.id, "step complete");
        if self.config.checkpoint.on_step_complete {
            self.checkpoint(
                rt,
                session_id,
                format!("step {} complete", step.id),
                CheckpointTrigger::Auto,
            )
            .await;
        }

        let input = ReflectionInput {
            goal,
            state,
            step,
            observation,
        };
        match self.reflection.reflect(&input).await {
            ReflectionDecision::Continue => {
                Self::transition(rt, AgentState::Executing, "continue")?;
                Ok(Flow::Continue)
            }
            ReflectionDecision::Done => {
                self.skip_remaining(rt, session_id, "goal reached before step ran").await?;
                Self::transition(rt, AgentState::Completing, "goal_reached")?;
                Ok(Flow::EndTurn)
            }
            ReflectionDecision::Replan if turn.replans >= MAX_REPLANS_PER_TURN => {
                tracing::debug!(session_id, "replan limit reached, continuing current plan");
                Self::transition(rt, AgentState::Executing, "continue")?;
                Ok(Flow::Continue)
            }
            ReflectionDecision::Replan => {
                turn.replans += 1;
                Self::transition(rt, AgentState::Replanning, "reflection_replan")?;
                self.replan(rt, session_id, goal, cancel, turn).await
            }
        }
    }

    async fn skip_remaining(
        &self,
        rt: &mut SessionRuntime,
        session_id: &str,
        reason: &str,
    ) -> Result<(), AgentError> {
        let state = self.store.get_state(session_id).await;
        let open: Vec<String> = state
            .plan
            .iter()
            .flat_map(|p| p.steps.iter())
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.id.clone())
            .collect();
        for id in open {
            self.store
                .skip_step(session_id, &id, Some(reason.to_string()))
                .await?;
        }
        let state = self.store.get_state(session_id).await;
        Self::sync_tasks(rt, &state);
        Ok(())
    }

    /// replanning → executing；生成失败时沿用当前计划
    async fn replan(
        &self,
        rt: &mut SessionRuntime,
        session_id: &str,
        goal: &str,
        cancel: &CancellationToken,
        turn: &mut Turn,
    ) -> Result<Flow, AgentError> {
        let state = self.store.get_state(session_id).await;
        let progress = state.progress();
        rt.context.working.add_attempt(format!(
            "replanning after {}/{} steps complete",
            progress.completed, progress.total
        ));
        let generated = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                turn.cancelled = true;
                return Ok(Flow::EndTurn);
            }
            r = self.planner.generate_plan(goal, &rt.context.working) => r,
        };
        match generated {
            Ok(plan) => {
                self.install_plan(rt, session_id, plan).await?;
                Self::transition(rt, AgentState::Executing, "replanned")?;
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "replanning failed, keeping current plan");
                Self::transition(rt, AgentState::Executing, "replan_failed")?;
            }
        }
        Ok(Flow::Continue)
    }

    /// executing → recovering，交给重试引擎
    async fn handle_failure(
        &self,
        rt: &mut SessionRuntime,
        session_id: &str,
        step: &PlanStep,
        call: &ToolCall,
        result: &ToolResult,
        turn: &mut Turn,
    ) -> Result<Flow, AgentError> {
        let error = result.error_text();
        rt.context
            .working
            .add_failure(format!("{}: {}", call.tool, error));
        Self::transition(rt, AgentState::Recovering, "tool_failure")?;
        if self.config.checkpoint.on_error {
            self.checkpoint(
                rt,
                session_id,
                format!("error on step {}", step.id),
                CheckpointTrigger::Error,
            )
            .await;
        }

        match self.retry.on_failure(session_id, &step.id, call, result).await {
            RetryDecision::Retry { call, kind, attempt } => {
                self.emit(LoopEvent::Retry {
                    step_id: step.id.clone(),
                    kind: kind.to_string(),
                    attempt,
                    tool: call.tool.clone(),
                });
                turn.next_call = Some(call);
                Self::transition(rt, AgentState::Executing, "retry")?;
                Ok(Flow::Continue)
            }
            RetryDecision::GiveUp { reason, .. } => {
                self.give_up(rt, session_id, step, reason, turn).await
            }
        }
    }

    /// 放弃：步骤标记 failed，轮次以 error 结束
    async fn give_up(
        &self,
        rt: &mut SessionRuntime,
        session_id: &str,
        step: &PlanStep,
        reason: String,
        turn: &mut Turn,
    ) -> Result<Flow, AgentError> {
        let state = self
            .tracker
            .mark_failed(&self.store, session_id, &step.id, &reason)
            .await?;
        Self::sync_tasks(rt, &state);
        self.emit(LoopEvent::StepFailed {
            step_id: step.id.clone(),
            reason: reason.clone(),
        });
        tracing::info!(session_id, step_id = %step.id, reason = %reason, "step failed");
        turn.failure_reason = Some(reason);
        Self::transition(rt, AgentState::Error, "retries_exhausted")?;
        Ok(Flow::EndTurn)
    }

    async fn finish_turn(
        &self,
        rt: &mut SessionRuntime,
        session_id: &str,
        turn: Turn,
    ) -> Result<TurnResult, AgentError> {
        if rt.pending.is_none() {
            let trigger = if turn.cancelled { "cancelled" } else { "turn_end" };
            Self::wind_down(rt, trigger)?;
        }
        if let Err(e) = self.store.save(session_id).await {
            tracing::warn!(session_id, error = %e, "failed to flush plan state at turn end");
        }

        let state = self.store.get_state(session_id).await;
        Self::sync_tasks(rt, &state);
        if !state.has_active_plan() {
            self.checkpoints.stop_auto_checkpoint(session_id);
            rt.context.working.clear();
        }

        let progress = state.progress();
        self.emit(LoopEvent::TurnFinished {
            iterations: turn.iterations,
            completed: progress.completed,
            total: progress.total,
            failure_reason: turn.failure_reason.clone(),
        });
        tracing::info!(
            session_id,
            iterations = turn.iterations,
            completed = progress.completed,
            total = progress.total,
            state = %rt.fsm.state(),
            cancelled = turn.cancelled,
            "turn finished"
        );
        Ok(TurnResult {
            session_id: session_id.to_string(),
            plan_progress: progress,
            last_state: rt.fsm.state(),
            pending_approval: turn.pending_approval,
            failure_reason: turn.failure_reason,
            iterations: turn.iterations,
            cancelled: turn.cancelled,
        })
    }

    pub async fn get_status(&self, session_id: &str) -> SessionStatus {
        let state = self.store.get_state(session_id).await;
        SessionStatus {
            has_active_plan: state.has_active_plan(),
            active_step: state.active_step().cloned(),
            progress: state.progress(),
            is_complete: state.is_complete(),
            has_incomplete_work: self.checkpoints.has_incomplete_work(session_id).await,
        }
    }

    pub async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<CheckpointRef>, AgentError> {
        self.checkpoints.list_checkpoints(session_id).await
    }

    /// 恢复检查点（None 表示最新）：计划状态整体替换，会话上下文换成检查点里的消息窗口
    pub async fn restore(&self, session_id: &str, checkpoint_id: Option<&str>) -> RestoreResult {
        let result = self.checkpoints.restore(session_id, checkpoint_id).await;
        let (true, Some(state), Some(cp_ref)) = (result.success, result.state.clone(), result.checkpoint.clone()) else {
            return result;
        };
        self.store.replace_state(session_id, state).await;

        let runtime = self.runtime(session_id);
        let mut rt = runtime.lock().await;
        if rt.pending.take().is_some() {
            self.gate.cancel_session(session_id);
        }
        if let Err(e) = Self::reset_to_idle(&mut rt) {
            tracing::warn!(session_id, error = %e, "failed to reset state machine after restore");
        }
        match self.checkpoints.get_checkpoint(session_id, &cp_ref.id).await {
            Ok(Some(cp)) => {
                let mut messages = cp.recent_messages;
                if let Some(summary) = cp.summary {
                    messages.insert(0, Message::summary(format!("Summary of earlier conversation:\n{summary}")));
                    rt.last_summary = Some(summary);
                }
                if !messages.is_empty() {
                    rt.context.conversation.set_messages(messages);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(session_id, error = %e, "failed to reload checkpoint messages"),
        }
        let state = self.store.get_state(session_id).await;
        if let Some(plan) = &state.plan {
            rt.task_root = Some(rt.tasks.mirror_plan(plan));
        }
        rt.context.set_plan_state_message(render_plan(&state));
        self.retry.reset_session(session_id);
        result
    }

    /// 外部裁决；请求不存在或已裁决时返回 false
    pub fn resolve_approval(&self, request_id: &str, decision: ApprovalDecision) -> bool {
        self.gate.resolve(request_id, decision)
    }

    /// 取消会话：中断当前一轮、挂起审批按拒绝处理、停止定时检查点；计划保持可恢复
    pub fn cancel(&self, session_id: &str) -> bool {
        let interrupted = self.supervisor.cancel(session_id);
        let withdrawn = self.gate.cancel_session(session_id);
        let stopped = self.checkpoints.stop_auto_checkpoint(session_id);
        tracing::info!(session_id, interrupted, withdrawn, stopped, "session cancelled");
        interrupted || withdrawn > 0 || stopped
    }

    /// 丢弃会话：中断当前一轮，清空计划状态并删除全部检查点；返回删除的检查点数
    pub async fn reset_session(&self, session_id: &str) -> Result<usize, AgentError> {
        self.cancel(session_id);
        let runtime = self.runtime(session_id);
        let _rt = runtime.lock().await;
        self.store.clear(session_id).await?;
        let removed = self.checkpoints.delete_checkpoints(session_id).await?;
        self.retry.reset_session(session_id);
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(session_id);
        tracing::info!(session_id, removed, "session reset");
        Ok(removed)
    }

    /// 取消全部会话
    pub fn shutdown(&self) {
        self.supervisor.shutdown();
        for session_id in self.supervisor.session_ids() {
            self.gate.cancel_session(&session_id);
            self.checkpoints.stop_auto_checkpoint(&session_id);
        }
    }

    pub fn pending_approvals(&self, session_id: Option<&str>) -> Vec<ApprovalRequest> {
        self.gate.pending_requests(session_id)
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.gate.audit_log()
    }

    /// 当前计划的任务镜像
    pub async fn tasks(&self, session_id: &str) -> TaskStack {
        self.runtime(session_id).lock().await.tasks.clone()
    }

    pub async fn agent_state(&self, session_id: &str) -> AgentState {
        self.runtime(session_id).lock().await.fsm.state()
    }

    /// 状态机历史长度（已接受的转移数）
    pub async fn transition_count(&self, session_id: &str) -> usize {
        self.runtime(session_id).lock().await.fsm.history_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_plan_marks_statuses() {
        let mut state = PlanState::empty("s");
        let mut plan = TaskPlan::from_actions("ship it", ["build", "test"]);
        plan.steps[0].status = StepStatus::Complete;
        plan.steps[1].status = StepStatus::Active;
        state.plan = Some(plan);
        let text = render_plan(&state);
        assert!(text.contains("[x] step-1: build"));
        assert!(text.contains("[>] step-2: test"));
        assert_eq!(render_plan(&PlanState::empty("s")), "No active plan.");
    }
}
