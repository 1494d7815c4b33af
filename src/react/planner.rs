//! Planner：计划生成、下一步 Tool Call 与失败替代方案
//!
//! 调用 LLM 得到回复或 JSON Tool Call；parse_llm_output 从文本中提取 JSON 并解析为 ToolCall 或直接回复。
//! 计划文本优先按 JSON 步骤列表解析，否则退回编号 / 项目符号列表。
//! 所有 LLM 调用都带超时，超时以 CapabilityTimeout 返回（对重试引擎而言只是一次失败）。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::plan::{PlanStep, TaskPlan};
use crate::core::retry::{AlternativeSource, FailureContext};
use crate::core::AgentError;
use crate::llm::{LlmClient, LlmRequest};
use crate::memory::tokenizer::tokenize;
use crate::memory::{Message, WorkingMemory};

/// LLM 返回的 Tool Call（简化 JSON：{"tool": "cat", "args": {"path": "..."}}）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }
}

/// Planner 输出
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    /// 直接回复（当前步骤已完成，文本即结果）
    Response(String),
    /// 需要执行工具
    ToolCall(ToolCall),
}

/// 提取 ```json 代码块或首尾花括号之间的内容
fn extract_json_block(text: &str, open: char, close: char) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// 解析 LLM 输出：若含有效 JSON 且 tool 非空则为 ToolCall，否则为 Response
pub fn parse_llm_output(output: &str) -> Result<PlannerOutput, AgentError> {
    let trimmed = output.trim();

    let Some(json_str) = extract_json_block(trimmed, '{', '}') else {
        return Ok(PlannerOutput::Response(trimmed.to_string()));
    };

    let parsed: ToolCall = serde_json::from_str(json_str)
        .map_err(|e| AgentError::JsonParseError(format!("{}: {}", e, json_str)))?;

    if parsed.tool.is_empty() {
        Ok(PlannerOutput::Response(trimmed.to_string()))
    } else {
        Ok(PlannerOutput::ToolCall(parsed))
    }
}

#[derive(Deserialize)]
struct RawStep {
    #[serde(default)]
    id: Option<String>,
    #[serde(alias = "description", alias = "title", alias = "step")]
    action: String,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPlan {
    Wrapped { steps: Vec<RawStep> },
    Bare(Vec<RawStep>),
}

/// 从计划文本解析 TaskPlan：JSON（{"steps": [...]} 或数组）优先，否则按编号 / 项目符号行
pub fn parse_plan(goal: &str, text: &str) -> Result<TaskPlan, AgentError> {
    let trimmed = text.trim();
    let json = extract_json_block(trimmed, '{', '}')
        .and_then(|s| serde_json::from_str::<RawPlan>(s).ok())
        .or_else(|| {
            extract_json_block(trimmed, '[', ']')
                .and_then(|s| serde_json::from_str::<RawPlan>(s).ok())
        });

    if let Some(raw) = json {
        let raw_steps = match raw {
            RawPlan::Wrapped { steps } => steps,
            RawPlan::Bare(steps) => steps,
        };
        let steps: Vec<PlanStep> = raw_steps
            .into_iter()
            .filter(|s| !s.action.trim().is_empty())
            .enumerate()
            .map(|(i, s)| {
                let mut step = PlanStep::new(
                    s.id.unwrap_or_else(|| format!("step-{}", i + 1)),
                    s.action.trim(),
                )
                .with_depends_on(s.depends_on);
                step.tool = s.tool.filter(|t| !t.is_empty());
                step
            })
            .collect();
        if steps.is_empty() {
            return Err(AgentError::PlanParseError("plan has no steps".to_string()));
        }
        return Ok(TaskPlan::new(goal, steps));
    }

    let actions: Vec<String> = trimmed.lines().filter_map(list_item).collect();
    if actions.is_empty() {
        return Err(AgentError::PlanParseError(format!(
            "no steps found in planner output: {}",
            trimmed.chars().take(120).collect::<String>()
        )));
    }
    Ok(TaskPlan::from_actions(goal, actions))
}

/// "1. xxx" / "2) xxx" / "- xxx" / "* xxx" → "xxx"
fn list_item(line: &str) -> Option<String> {
    let line = line.trim();
    let rest = if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
        rest
    } else {
        let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        let after = &line[digits..];
        after
            .strip_prefix('.')
            .or_else(|| after.strip_prefix(')'))
            .or_else(|| after.strip_prefix('、'))?
    };
    let rest = rest.trim();
    (!rest.is_empty()).then(|| rest.to_string())
}

/// 多步目标的提示词
const MULTI_STEP_MARKERS: &[&str] = &[
    " then ", " and then ", " after ", " finally ", "first,", "step", "然后", "接着", "之后", "最后", "\n",
];

/// Planner：持有 LLM、system prompt 与调用超时
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    timeout: Duration,
    max_tokens: Option<u32>,
    plan_min_words: usize,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
            timeout: Duration::from_secs(60),
            max_tokens: None,
            plan_min_words: 6,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_plan_min_words(mut self, words: usize) -> Self {
        self.plan_min_words = words;
        self
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 带超时的 LLM 调用
    async fn call(&self, system: &str, messages: &[Message]) -> Result<String, AgentError> {
        let mut full_messages = vec![Message::system(system.to_string())];
        full_messages.extend(messages.iter().cloned());
        let mut request = LlmRequest::new(full_messages);
        request.max_tokens = self.max_tokens;

        match tokio::time::timeout(self.timeout, self.llm.complete(&request)).await {
            Ok(result) => result.map_err(AgentError::LlmError),
            Err(_) => Err(AgentError::CapabilityTimeout(format!(
                "llm call exceeded {}s",
                self.timeout.as_secs()
            ))),
        }
    }

    /// 目标是否值得生成多步计划（否则用单步计划）
    pub fn should_generate_plan(&self, goal: &str) -> bool {
        let lower = format!(" {} ", goal.to_lowercase());
        if MULTI_STEP_MARKERS.iter().any(|m| lower.contains(m)) {
            return true;
        }
        tokenize(goal).len() >= self.plan_min_words
    }

    pub async fn generate_plan(&self, goal: &str, working: &WorkingMemory) -> Result<TaskPlan, AgentError> {
        let system = format!(
            "{}\n\nBreak the goal into a short ordered list of concrete steps. \
Reply with JSON {{\"steps\": [{{\"id\": \"step-1\", \"action\": \"...\", \"tool\": null, \"depends_on\": []}}]}} \
or a numbered list.\n\n{}",
            self.system_prompt,
            working.to_prompt_section()
        );
        let text = self.call(&system, &[Message::user(goal.to_string())]).await?;
        let plan = parse_plan(goal, &text)?;
        tracing::debug!(steps = plan.steps.len(), "plan generated");
        Ok(plan)
    }

    /// 为当前步骤请求下一步：Tool Call，或表示步骤完成的文本回复
    ///
    /// `recall` 是从已压缩历史中检索出的相关摘要段落，可为空
    pub async fn next_tool_call(
        &self,
        messages: &[Message],
        step: &PlanStep,
        working: &WorkingMemory,
        recall: &str,
    ) -> Result<PlannerOutput, AgentError> {
        let mut system = format!(
            "{}\n\n{}{}## Active Step\n[{}] {}\n",
            self.system_prompt,
            working.to_prompt_section(),
            recall,
            step.id,
            step.action
        );
        if let Some(tool) = &step.tool {
            system.push_str(&format!("Suggested tool: {tool}\n"));
        }
        let text = self.call(&system, messages).await?;
        parse_llm_output(&text)
    }

    /// 失败后请求一个不同的调用；回复不是 Tool Call 时返回 None
    pub async fn alternative_tool_call(
        &self,
        failed: &ToolCall,
        failure: &FailureContext,
    ) -> Result<Option<ToolCall>, AgentError> {
        let system = format!(
            "{}\n\nA tool call failed. Propose a different tool call that can achieve the same step, \
as JSON {{\"tool\": \"name\", \"args\": {{...}}}}. Reply NONE if there is no alternative.",
            self.system_prompt
        );
        let prompt = format!(
            "Failed call: {}\nFailure kind: {}\nError: {}\nAttempt: {}",
            serde_json::to_string(failed)?,
            failure.kind.as_str(),
            failure.error,
            failure.attempt
        );
        let text = self.call(&system, &[Message::user(prompt)]).await?;
        match parse_llm_output(&text) {
            Ok(PlannerOutput::ToolCall(call)) => Ok(Some(call)),
            Ok(PlannerOutput::Response(_)) => Ok(None),
            Err(e) => {
                tracing::debug!(error = %e, "unparseable alternative, ignoring");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl AlternativeSource for Planner {
    async fn alternative(
        &self,
        failed: &ToolCall,
        failure: &FailureContext,
    ) -> Result<Option<ToolCall>, AgentError> {
        self.alternative_tool_call(failed, failure).await
    }
}
