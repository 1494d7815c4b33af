//! 认知层：Planner、步骤判定、反思策略、上下文管理与过程事件

pub mod critic;
pub mod events;
pub mod memory;
pub mod planner;
pub mod tracker;

pub use critic::{
    CriticReflection, HeuristicReflection, ReflectionDecision, ReflectionInput, ReflectionPolicy,
};
pub use events::{EventForwarder, LoopEvent};
pub use memory::{
    estimate_tokens, manage_context, should_manage_context, ContextManager, ContextOutcome,
    Summarizer,
};
pub use planner::{parse_llm_output, parse_plan, Planner, PlannerOutput, ToolCall};
pub use tracker::{StepAnalysis, StepTracker};
