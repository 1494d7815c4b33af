//! 反思策略：一步完成后决定继续执行、重新规划还是提前结束
//!
//! 默认的启发式策略只看计划是否已全部结束；Critic 策略额外调用一次 LLM，
//! 按首个单词解析 OK / REPLAN / DONE，调用失败或回复无法识别时退回启发式结论。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::plan::{PlanState, PlanStep};
use crate::llm::{LlmClient, LlmRequest};
use crate::memory::Message;

pub const DEFAULT_CRITIC_PROMPT: &str = "Goal: {goal}\nPlan progress: {progress}\nStep just finished: {step}\nObservation: {observation}\n\n\
Reply with exactly one word: OK to continue with the plan, REPLAN if the remaining plan no longer fits, DONE if the goal is already reached.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionDecision {
    Continue,
    Replan,
    Done,
}

/// 反思输入：目标、步骤完成后的计划状态、刚结束的步骤与观察
pub struct ReflectionInput<'a> {
    pub goal: &'a str,
    pub state: &'a PlanState,
    pub step: &'a PlanStep,
    pub observation: &'a str,
}

#[async_trait]
pub trait ReflectionPolicy: Send + Sync {
    async fn reflect(&self, input: &ReflectionInput<'_>) -> ReflectionDecision;
}

/// 计划结束即 Done，否则 Continue
pub struct HeuristicReflection;

impl HeuristicReflection {
    fn decide(state: &PlanState) -> ReflectionDecision {
        if state.is_complete() || state.active_step_id.is_none() {
            ReflectionDecision::Done
        } else {
            ReflectionDecision::Continue
        }
    }
}

#[async_trait]
impl ReflectionPolicy for HeuristicReflection {
    async fn reflect(&self, input: &ReflectionInput<'_>) -> ReflectionDecision {
        Self::decide(input.state)
    }
}

pub fn parse_critic_reply(reply: &str) -> Option<ReflectionDecision> {
    let word: String = reply
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_uppercase();
    match word.as_str() {
        "OK" | "CONTINUE" => Some(ReflectionDecision::Continue),
        "REPLAN" => Some(ReflectionDecision::Replan),
        "DONE" => Some(ReflectionDecision::Done),
        _ => None,
    }
}

/// LLM 评审
pub struct CriticReflection {
    llm: Arc<dyn LlmClient>,
    prompt_template: String,
    timeout: Duration,
}

impl CriticReflection {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            prompt_template: DEFAULT_CRITIC_PROMPT.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = template.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn render(&self, input: &ReflectionInput<'_>) -> String {
        let progress = input.state.progress();
        let observation: String = input.observation.chars().take(1000).collect();
        self.prompt_template
            .replace("{goal}", input.goal)
            .replace(
                "{progress}",
                &format!("{}/{} complete, {} failed", progress.completed, progress.total, progress.failed),
            )
            .replace("{step}", &input.step.action)
            .replace("{observation}", &observation)
    }
}

#[async_trait]
impl ReflectionPolicy for CriticReflection {
    async fn reflect(&self, input: &ReflectionInput<'_>) -> ReflectionDecision {
        let fallback = HeuristicReflection::decide(input.state);
        // 计划已结束时无需再问
        if fallback == ReflectionDecision::Done {
            return fallback;
        }
        let request = LlmRequest::new(vec![Message::user(self.render(input))]).with_max_tokens(8);
        match tokio::time::timeout(self.timeout, self.llm.complete(&request)).await {
            Ok(Ok(reply)) => parse_critic_reply(&reply).unwrap_or_else(|| {
                tracing::debug!(reply = %reply, "unrecognized critic reply");
                fallback
            }),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "critic call failed");
                fallback
            }
            Err(_) => {
                tracing::warn!("critic call timed out");
                fallback
            }
        }
    }
}
