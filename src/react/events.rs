//! 循环过程事件：用于流式展示规划、工具调用、审批与检查点

use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::state::{AgentStateContext, StateTransition, TransitionObserver};

/// 单个事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    TurnStarted {
        session_id: String,
        goal: String,
    },
    /// 新计划（含重新规划）
    PlanCreated {
        version: u32,
        steps: Vec<String>,
    },
    StateChanged {
        from: String,
        to: String,
        trigger: String,
    },
    ToolCall {
        step_id: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        step_id: String,
        tool: String,
        success: bool,
        preview: String,
    },
    StepCompleted {
        step_id: String,
        confidence: f32,
    },
    StepFailed {
        step_id: String,
        reason: String,
    },
    Retry {
        step_id: String,
        kind: String,
        attempt: u32,
        tool: String,
    },
    ApprovalRequested {
        request_id: String,
        tool: String,
        tier: u8,
        deadline: String,
    },
    ApprovalResolved {
        request_id: String,
        resolution: String,
        reason: String,
    },
    ContextCompacted {
        dropped: usize,
        summarized: bool,
        used_tokens: usize,
    },
    CheckpointCreated {
        checkpoint_id: String,
        trigger: String,
    },
    TurnFinished {
        iterations: usize,
        completed: usize,
        total: usize,
        failure_reason: Option<String>,
    },
    Error {
        text: String,
    },
}

/// 截取前 max_chars 个字符作为预览
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}...")
}

/// 把状态机转移转发成 StateChanged 事件
pub struct EventForwarder {
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl EventForwarder {
    pub fn new(tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self { tx }
    }
}

impl TransitionObserver for EventForwarder {
    fn on_transition(
        &self,
        transition: &StateTransition,
        _context: &AgentStateContext,
    ) -> anyhow::Result<()> {
        self.tx.send(LoopEvent::StateChanged {
            from: transition.from.to_string(),
            to: transition.to.to_string(),
            trigger: transition.trigger.clone(),
        })?;
        Ok(())
    }
}
