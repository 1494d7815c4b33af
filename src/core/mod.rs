//! 核心编排层：计划状态、状态机、审批、重试、检查点、任务镜像、会话监管与主控循环

pub mod approval;
pub mod builder;
pub mod checkpoint;
pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod plan_state;
pub mod retry;
pub mod session_supervisor;
pub mod state;
pub mod task_stack;

pub use approval::{
    ApprovalChannel, ApprovalDecision, ApprovalGate, ApprovalOutcome, ApprovalRequest,
    ApprovalResolution, AuditEntry, AuditOutcome, GateVerdict, LogApprovalChannel,
    MpscApprovalChannel, RiskClassifier,
};
pub use builder::{create_llm_from_config, OrchestratorBuilder};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointOptions, RestoreResult};
pub use error::AgentError;
pub use orchestrator::{Orchestrator, SessionStatus, TurnResult};
pub use plan::{
    CheckpointRef, CheckpointTrigger, PlanDiff, PlanProgress, PlanState, PlanStep, StepStatus,
    TaskPlan,
};
pub use plan_state::PlanStateStore;
pub use retry::{FailureContext, FailureKind, RetryDecision, RetryEngine};
pub use session_supervisor::SessionSupervisor;
pub use state::{AgentState, AgentStateContext, AgentStateMachine, StateTransition, TransitionObserver};
pub use task_stack::{NewTask, Task, TaskStack, TaskStatus};
