//! 编排层错误类型
//!
//! 能力调用失败（LLM / 工具 / 存储）由 RetryEngine 或存储回退在本地消化；
//! InvalidTransition 表示编排器自身不变量被破坏，始终向上抛出。

use thiserror::Error;

use crate::core::state::AgentState;
use crate::llm::LlmError;
use crate::memory::StorageError;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: AgentState, to: AgentState },

    /// 能力调用（LLM / 工具）超时；对重试引擎而言等同一次失败
    #[error("Capability timed out: {0}")]
    CapabilityTimeout(String),

    #[error("LLM error: {0}")]
    LlmError(#[from] LlmError),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Plan parse error: {0}")]
    PlanParseError(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("No active plan for session {0}")]
    NoActivePlan(String),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    /// 能力层失败（可交给 RetryEngine 处理），区别于编排逻辑错误
    pub fn is_capability_failure(&self) -> bool {
        matches!(
            self,
            AgentError::CapabilityTimeout(_)
                | AgentError::LlmError(_)
                | AgentError::ToolExecutionFailed(_)
                | AgentError::JsonParseError(_)
                | AgentError::PlanParseError(_)
        )
    }
}
