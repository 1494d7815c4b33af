//! 步骤完成判定
//!
//! 先用启发式给出判定：结果文本里的成功 / 失败关键词，加上调用的工具与步骤声明的工具（或动作描述）
//! 是否吻合。置信度低于阈值且开启了 LLM 复核时，把截断后的结果摘要交给 LLM 回答 YES / NO。
//! mark_complete / mark_failed 是显式覆盖的入口。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::TrackerSection;
use crate::core::plan::{PlanState, PlanStep};
use crate::core::plan_state::PlanStateStore;
use crate::core::AgentError;
use crate::llm::{LlmClient, LlmRequest};
use crate::memory::Message;
use crate::react::ToolCall;
use crate::tools::ToolResult;

const SUCCESS_MARKERS: &[&str] = &[
    "success", "succeeded", "done", "completed", "created", "saved", "passed", "ok", "written",
    "成功", "完成",
];

const FAILURE_MARKERS: &[&str] = &[
    "error", "failed", "failure", "exception", "traceback", "not found", "denied", "invalid",
    "失败", "错误",
];

/// 判定结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAnalysis {
    pub is_complete: bool,
    /// 0.5 ~ 1.0
    pub confidence: f32,
    pub reason: String,
    pub suggested_result: Option<String>,
}

pub struct StepTracker {
    config: TrackerSection,
    llm: Option<Arc<dyn LlmClient>>,
    timeout: Duration,
}

fn contains_marker(text: &str, markers: &[&'static str]) -> Option<&'static str> {
    markers.iter().copied().find(|m| {
        if m.is_ascii() {
            word_match(text, m)
        } else {
            text.contains(m)
        }
    })
}

/// 英文关键词按词边界匹配（"ok" 不命中 "token"）
fn word_match(text: &str, marker: &str) -> bool {
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let marker_words: Vec<&str> = marker.split(' ').collect();
    words
        .windows(marker_words.len())
        .any(|w| w == marker_words.as_slice())
}

fn truncate(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}... ({total} chars total)")
}

impl StepTracker {
    pub fn new(config: TrackerSection, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self {
            config,
            llm,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 纯启发式判定
    pub fn heuristic(&self, call: &ToolCall, result: &ToolResult, step: &PlanStep) -> StepAnalysis {
        if !result.success {
            return StepAnalysis {
                is_complete: false,
                confidence: 0.9,
                reason: format!("tool reported failure: {}", result.error_text()),
                suggested_result: None,
            };
        }

        let output = result.output.to_lowercase();
        let mut score: f32 = 0.6;
        let mut reasons = Vec::new();

        if output.trim().is_empty() {
            score -= 0.2;
            reasons.push("empty output".to_string());
        }
        if let Some(m) = contains_marker(&output, FAILURE_MARKERS) {
            score -= 0.3;
            reasons.push(format!("output mentions '{m}'"));
        }
        if let Some(m) = contains_marker(&output, SUCCESS_MARKERS) {
            score += 0.2;
            reasons.push(format!("output mentions '{m}'"));
        }
        match &step.tool {
            Some(expected) if expected == &call.tool => {
                score += 0.2;
                reasons.push(format!("tool '{}' matches the step", call.tool));
            }
            Some(expected) => {
                score -= 0.3;
                reasons.push(format!("step expects tool '{expected}', got '{}'", call.tool));
            }
            None if step.action.to_lowercase().contains(&call.tool.to_lowercase()) => {
                score += 0.1;
                reasons.push(format!("action mentions tool '{}'", call.tool));
            }
            None => {}
        }

        let score = score.clamp(0.0, 1.0);
        let is_complete = score >= 0.5;
        if reasons.is_empty() {
            reasons.push("tool succeeded".to_string());
        }
        StepAnalysis {
            is_complete,
            confidence: score.max(1.0 - score),
            reason: reasons.join("; "),
            suggested_result: is_complete.then(|| truncate(result.output.trim(), self.config.max_summary_chars)),
        }
    }

    /// 启发式判定，必要时交给 LLM 复核
    pub async fn analyze_tool_result(
        &self,
        call: &ToolCall,
        result: &ToolResult,
        step: &PlanStep,
    ) -> StepAnalysis {
        let analysis = self.heuristic(call, result, step);
        if analysis.confidence >= self.config.heuristic_threshold || !self.config.use_llm_verification {
            return analysis;
        }
        let Some(llm) = &self.llm else {
            return analysis;
        };

        let prompt = format!(
            "Step: {}\nTool: {}\nResult summary: {}\n\nDid this tool result complete the step? Answer YES or NO.",
            step.action,
            call.tool,
            truncate(&result.output, self.config.max_summary_chars),
        );
        let request = LlmRequest::new(vec![Message::user(prompt)]).with_max_tokens(8);
        let answer = match tokio::time::timeout(self.timeout, llm.complete(&request)).await {
            Ok(Ok(text)) => text.trim().to_uppercase(),
            Ok(Err(e)) => {
                tracing::warn!(step_id = %step.id, error = %e, "step verification failed, keeping heuristic verdict");
                return analysis;
            }
            Err(_) => {
                tracing::warn!(step_id = %step.id, "step verification timed out, keeping heuristic verdict");
                return analysis;
            }
        };

        let is_complete = if answer.starts_with("YES") {
            true
        } else if answer.starts_with("NO") {
            false
        } else {
            return analysis;
        };
        StepAnalysis {
            is_complete,
            confidence: 0.9,
            reason: format!("llm verification answered {}", if is_complete { "YES" } else { "NO" }),
            suggested_result: is_complete
                .then(|| truncate(result.output.trim(), self.config.max_summary_chars)),
        }
    }

    pub async fn mark_complete(
        &self,
        store: &PlanStateStore,
        session_id: &str,
        step_id: &str,
        result: Option<String>,
    ) -> Result<PlanState, AgentError> {
        store.complete_step(session_id, step_id, result).await
    }

    pub async fn mark_failed(
        &self,
        store: &PlanStateStore,
        session_id: &str,
        step_id: &str,
        error: &str,
    ) -> Result<PlanState, AgentError> {
        store.fail_step(session_id, step_id, error).await
    }
}
