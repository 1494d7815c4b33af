//! 上下文管理：token 预算与历史压缩
//!
//! ContextManager 把短期对话（Conversation）、中期记忆（Working）和 token 预算放在一起。
//! 使用率达到阈值或迭代数到达检查间隔时执行压缩：最近 N 条原样保留，始终保留的类型
//! （system / plan_state / summary）不动，其余旧消息被丢弃；丢弃的区间可交给 LLM 摘要
//! （失败时退回抽取式摘要），摘要写入工作记忆并以 Summary 消息插回历史。

use std::sync::Arc;
use std::time::Duration;

use crate::config::ContextSection;
use crate::llm::{LlmClient, LlmRequest};
use crate::memory::{
    ConversationMemory, Message, MessageKind, Role, SummaryHit, TokenBudget, TokenEstimator,
    WorkingMemory,
};

/// 约 4 字符 / token，向上取整
pub fn estimate_tokens(text: &str) -> usize {
    TokenEstimator::estimate(text)
}

/// 是否需要压缩：使用率达到阈值，或迭代数是检查间隔的整数倍
pub fn should_manage_context(budget: &TokenBudget, iteration: usize, config: &ContextSection) -> bool {
    if budget.usage_ratio() >= config.threshold {
        return true;
    }
    config.manage_every_n_iterations > 0
        && iteration > 0
        && iteration % config.manage_every_n_iterations == 0
}

/// 压缩结果
#[derive(Debug, Clone, PartialEq)]
pub struct ContextOutcome {
    pub messages: Vec<Message>,
    pub budget: TokenBudget,
    /// 是否生成了摘要
    pub summarized: bool,
    pub dropped: usize,
    pub summary: Option<String>,
}

/// 摘要器：有 LLM 时调用 LLM，否则（或失败时）做抽取式摘要
#[derive(Clone)]
pub struct Summarizer {
    llm: Option<Arc<dyn LlmClient>>,
    timeout: Duration,
    max_tokens: u32,
}

impl Summarizer {
    pub fn new(llm: Option<Arc<dyn LlmClient>>, timeout: Duration, max_tokens: u32) -> Self {
        Self {
            llm,
            timeout,
            max_tokens,
        }
    }

    /// 只做抽取式摘要
    pub fn extractive(max_tokens: u32) -> Self {
        Self::new(None, Duration::from_secs(30), max_tokens)
    }

    pub async fn summarize(&self, span: &[Message]) -> String {
        if let Some(llm) = &self.llm {
            let transcript = render_transcript(span, self.max_tokens as usize * 8);
            let request = LlmRequest::new(vec![
                Message::system(
                    "Summarize the conversation excerpt below in a few sentences. \
Keep decisions, tool outcomes, file names and errors. Reply with the summary only.",
                ),
                Message::user(transcript),
            ])
            .with_max_tokens(self.max_tokens);
            match tokio::time::timeout(self.timeout, llm.complete(&request)).await {
                Ok(Ok(text)) if !text.trim().is_empty() => return text.trim().to_string(),
                Ok(Ok(_)) => tracing::warn!("empty summary from llm, using extractive summary"),
                Ok(Err(e)) => tracing::warn!(error = %e, "summary llm call failed, using extractive summary"),
                Err(_) => tracing::warn!("summary llm call timed out, using extractive summary"),
            }
        }
        extractive_summary(span, self.max_tokens as usize * 4)
    }
}

fn role_label(m: &Message) -> &'static str {
    match m.kind {
        MessageKind::ToolCall => "tool call",
        MessageKind::ToolResult => "tool result",
        _ => match m.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        },
    }
}

fn render_transcript(span: &[Message], max_chars: usize) -> String {
    let mut out = String::new();
    for m in span {
        let line = format!("{}: {}\n", role_label(m), m.content.trim());
        if out.chars().count() + line.chars().count() > max_chars {
            break;
        }
        out.push_str(&line);
    }
    out
}

/// 每条消息取第一句（最多 160 字符），总长度不超过 max_chars
pub fn extractive_summary(span: &[Message], max_chars: usize) -> String {
    let mut lines = Vec::new();
    let mut total = 0;
    for m in span {
        let first = m
            .content
            .split(['\n', '。'])
            .map(str::trim)
            .find(|s| !s.is_empty())
            .unwrap_or("");
        if first.is_empty() {
            continue;
        }
        let clipped: String = first.chars().take(160).collect();
        let line = format!("- {}: {}", role_label(m), clipped);
        total += line.chars().count() + 1;
        if total > max_chars {
            break;
        }
        lines.push(line);
    }
    lines.join("\n")
}

/// 压缩消息序列；调用方负责只在 should_manage_context 为真时调用
pub async fn manage_context(
    messages: &[Message],
    budget: &TokenBudget,
    working: &mut WorkingMemory,
    config: &ContextSection,
    summarizer: &Summarizer,
    topic: &str,
) -> ContextOutcome {
    let n = messages.len();
    let recent_start = n.saturating_sub(config.keep_recent);

    let mut kept_old = Vec::new();
    let mut span = Vec::new();
    let mut dropped = 0;
    for (i, m) in messages[..recent_start].iter().enumerate() {
        if config.always_keep.contains(&m.kind) {
            kept_old.push(m.clone());
            continue;
        }
        dropped += 1;
        let age = n - 1 - i;
        // 过旧的工具结果直接丢弃，不进入摘要
        if m.kind == MessageKind::ToolResult && age >= config.tool_result_max_age {
            continue;
        }
        span.push(m.clone());
    }

    let summary = if config.summarize && !span.is_empty() {
        Some(summarizer.summarize(&span).await).filter(|s| !s.trim().is_empty())
    } else {
        None
    };

    let mut result = kept_old;
    if let Some(s) = &summary {
        working.store_summary(topic, s.clone());
        result.push(Message::summary(format!("Summary of earlier conversation:\n{s}")));
    }
    result.extend_from_slice(&messages[recent_start..]);

    let used = TokenEstimator::estimate_messages(&result);
    tracing::debug!(dropped, kept = result.len(), used, "context managed");
    ContextOutcome {
        budget: TokenBudget::with_used(budget.max_tokens(), used),
        summarized: summary.is_some(),
        summary,
        dropped,
        messages: result,
    }
}

/// 单个会话的上下文：对话、工作记忆、预算
#[derive(Clone)]
pub struct ContextManager {
    pub conversation: ConversationMemory,
    pub working: WorkingMemory,
    budget: TokenBudget,
    config: ContextSection,
    summarizer: Summarizer,
    /// 当前步骤召回的历史摘要片段（随系统提示词发送）
    recall: String,
}

impl ContextManager {
    pub fn new(config: ContextSection, summarizer: Summarizer) -> Self {
        Self {
            conversation: ConversationMemory::new(),
            working: WorkingMemory::new(),
            budget: TokenBudget::new(config.max_tokens),
            config,
            summarizer,
            recall: String::new(),
        }
    }

    pub fn budget(&self) -> TokenBudget {
        self.budget
    }

    pub fn config(&self) -> &ContextSection {
        &self.config
    }

    /// 追加消息并计入预算
    pub fn push_message(&mut self, msg: Message) {
        self.budget
            .update_budget(estimate_tokens(&msg.content) + 4);
        self.conversation.push(msg);
    }

    /// 按实际要发送的内容重算预算：消息 + 工作记忆片段 + 召回片段
    fn recount(&mut self) {
        let used = TokenEstimator::estimate_messages(self.conversation.messages())
            + estimate_tokens(&self.working.to_prompt_section())
            + estimate_tokens(&self.recall);
        self.budget = TokenBudget::with_used(self.budget.max_tokens(), used);
    }

    /// 替换（或插入）唯一的计划快照消息
    pub fn set_plan_state_message(&mut self, content: impl Into<String>) {
        let content = content.into();
        let mut messages: Vec<Message> = self
            .conversation
            .messages()
            .iter()
            .filter(|m| m.kind != MessageKind::PlanState)
            .cloned()
            .collect();
        let at = messages
            .iter()
            .take_while(|m| m.kind == MessageKind::System)
            .count();
        messages.insert(at, Message::plan_state(content));
        self.conversation.set_messages(messages);
        self.recount();
    }

    pub fn messages(&self) -> &[Message] {
        self.conversation.messages()
    }

    pub fn to_llm_messages(&self) -> Vec<Message> {
        self.conversation.messages().to_vec()
    }

    pub fn recent_messages(&self, n: usize) -> Vec<Message> {
        self.conversation.recent(n)
    }

    pub fn should_manage(&self, iteration: usize) -> bool {
        should_manage_context(&self.budget, iteration, &self.config)
    }

    /// should_manage 为真时压缩并返回结果，否则 None
    pub async fn maybe_compact(&mut self, iteration: usize, topic: &str) -> Option<ContextOutcome> {
        self.recount();
        if !self.should_manage(iteration) {
            return None;
        }
        let outcome = manage_context(
            self.conversation.messages(),
            &self.budget,
            &mut self.working,
            &self.config,
            &self.summarizer,
            topic,
        )
        .await;
        self.conversation.set_messages(outcome.messages.clone());
        self.recount();
        Some(outcome)
    }

    /// 在历史摘要中检索与 query 相关的内容
    pub fn search_relevant_context(&self, query: &str, k: usize) -> Vec<SummaryHit> {
        self.working.search(query, k)
    }

    /// 为当前步骤召回相关摘要；已作为 Summary 消息在历史中的不重复召回
    pub fn refresh_recall(&mut self, query: &str, k: usize) -> &str {
        let in_history: Vec<&str> = self
            .conversation
            .messages()
            .iter()
            .filter(|m| m.kind == MessageKind::Summary)
            .map(|m| m.content.as_str())
            .collect();
        let hits: Vec<SummaryHit> = self
            .search_relevant_context(query, k + in_history.len())
            .into_iter()
            .filter(|h| !in_history.iter().any(|c| c.contains(h.summary.as_str())))
            .take(k)
            .collect();
        self.recall = if hits.is_empty() {
            String::new()
        } else {
            let mut section = String::from("## Relevant earlier context\n");
            for hit in &hits {
                section.push_str(&format!("- [{}] {}\n", hit.topic, hit.summary));
            }
            section.push('\n');
            section
        };
        self.recount();
        &self.recall
    }

    pub fn recall_section(&self) -> &str {
        &self.recall
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, ScriptedLlmClient};

    fn config() -> ContextSection {
        ContextSection {
            max_tokens: 100,
            threshold: 0.8,
            manage_every_n_iterations: 5,
            keep_recent: 3,
            tool_result_max_age: 6,
            summarize: true,
            ..ContextSection::default()
        }
    }

    fn history() -> Vec<Message> {
        vec![
            Message::system("you are bee"),
            Message::user("please deploy the docker image"),
            Message::tool_call(r#"{"tool":"shell","args":{"command":"docker build ."}}"#),
            Message::tool_result("Successfully built abc123"),
            Message::plan_state("step-2 active"),
            Message::assistant("built the image"),
            Message::user("now push"),
            Message::tool_result("pushed"),
        ]
    }

    #[test]
    fn test_should_manage_context() {
        let c = config();
        assert!(!should_manage_context(&TokenBudget::with_used(100, 79), 1, &c));
        assert!(should_manage_context(&TokenBudget::with_used(100, 80), 1, &c));
        assert!(should_manage_context(&TokenBudget::with_used(100, 0), 10, &c));
        assert!(!should_manage_context(&TokenBudget::with_used(100, 0), 0, &c));
    }

    #[tokio::test]
    async fn test_keeps_recent_and_pinned_kinds() {
        let llm = Arc::new(ScriptedLlmClient::new(["Built docker image abc123."]));
        let summarizer = Summarizer::new(Some(llm), Duration::from_secs(5), 64);
        let mut working = WorkingMemory::new();
        let messages = history();
        let out = manage_context(
            &messages,
            &TokenBudget::with_used(100, 95),
            &mut working,
            &config(),
            &summarizer,
            "deploy",
        )
        .await;

        assert!(out.summarized);
        assert_eq!(out.dropped, 3);
        let kinds: Vec<MessageKind> = out.messages.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MessageKind::System,
                MessageKind::PlanState,
                MessageKind::Summary,
                MessageKind::Chat,
                MessageKind::Chat,
                MessageKind::ToolResult,
            ]
        );
        assert_eq!(&out.messages[3..], &messages[5..]);
        assert_eq!(out.budget.used(), TokenEstimator::estimate_messages(&out.messages));
        assert_eq!(out.budget.max_tokens(), 100);

        let hits = working.search("docker image", 3);
        assert_eq!(hits[0].topic, "deploy");
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back_to_extractive() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()).then_error(LlmError::Timeout));
        let summarizer = Summarizer::new(Some(llm), Duration::from_secs(5), 64);
        let mut working = WorkingMemory::new();
        let out = manage_context(
            &history(),
            &TokenBudget::with_used(100, 95),
            &mut working,
            &config(),
            &summarizer,
            "deploy",
        )
        .await;
        let summary = out.summary.unwrap();
        assert!(summary.contains("user: please deploy the docker image"));
        assert!(summary.contains("tool result: Successfully built abc123"));
    }

    #[tokio::test]
    async fn test_old_tool_results_excluded_from_summary() {
        let mut c = config();
        c.tool_result_max_age = 2;
        let mut working = WorkingMemory::new();
        let out = manage_context(
            &history(),
            &TokenBudget::with_used(100, 95),
            &mut working,
            &c,
            &Summarizer::extractive(64),
            "deploy",
        )
        .await;
        let summary = out.summary.unwrap();
        assert!(!summary.contains("Successfully built"));
        assert_eq!(out.dropped, 3);
    }

    #[tokio::test]
    async fn test_maybe_compact_only_when_needed() {
        let mut cm = ContextManager::new(config(), Summarizer::extractive(16));
        cm.push_message(Message::system("sys"));
        cm.push_message(Message::user("hello"));
        assert!(!cm.should_manage(1));
        assert!(cm.maybe_compact(1, "t").await.is_none());

        for i in 0..10 {
            cm.push_message(Message::user(format!("message number {i} with some padding text")));
        }
        assert!(cm.budget().is_exceeded());
        let out = cm.maybe_compact(1, "t").await.unwrap();
        assert!(out.dropped > 0);
        assert!(cm.messages().len() <= 5);
        assert!(!cm.budget().is_exceeded());
    }

    #[test]
    fn test_plan_state_message_is_unique() {
        let mut cm = ContextManager::new(config(), Summarizer::extractive(64));
        cm.push_message(Message::system("sys"));
        cm.push_message(Message::user("go"));
        cm.set_plan_state_message("v1");
        cm.set_plan_state_message("v2");
        let plan_msgs: Vec<&Message> = cm
            .messages()
            .iter()
            .filter(|m| m.kind == MessageKind::PlanState)
            .collect();
        assert_eq!(plan_msgs.len(), 1);
        assert_eq!(plan_msgs[0].content, "v2");
        assert_eq!(cm.messages()[1].kind, MessageKind::PlanState);
    }

    #[test]
    fn test_repeated_plan_state_keeps_budget_flat() {
        let mut cm = ContextManager::new(config(), Summarizer::extractive(64));
        cm.push_message(Message::system("sys"));
        cm.push_message(Message::user("go"));
        cm.set_plan_state_message("## Plan\n[active] step-1 build the project");
        let used = cm.budget().used();
        for _ in 0..50 {
            cm.set_plan_state_message("## Plan\n[active] step-1 build the project");
        }
        assert_eq!(cm.budget().used(), used);
        assert!(!cm.budget().is_exceeded());
    }

    #[test]
    fn test_recall_skips_summaries_still_in_history() {
        let mut cm = ContextManager::new(config(), Summarizer::extractive(64));
        cm.working.store_summary("docker", "built docker image abc123");
        cm.working.store_summary("docker", "pushed docker image to registry");
        cm.push_message(Message::summary(
            "Summary of earlier conversation:\npushed docker image to registry",
        ));

        assert!(cm.refresh_recall("kubernetes", 3).is_empty());
        let baseline = cm.budget().used();

        let section = cm.refresh_recall("docker image", 3).to_string();
        assert!(section.contains("built docker image abc123"));
        assert!(!section.contains("pushed docker image"));
        assert_eq!(cm.recall_section(), section);
        assert!(cm.budget().used() > baseline);

        assert!(cm.refresh_recall("kubernetes", 3).is_empty());
        assert_eq!(cm.budget().used(), baseline);
    }
}
