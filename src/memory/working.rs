//! 中期记忆：当前目标、已尝试方案、失败原因，以及按主题归档的历史摘要
//!
//! 上下文压缩时被丢弃的消息区间会被摘要后写入 summaries（按主题索引），
//! 之后可通过 search 按关键词相关度取回，而不必保留原始消息。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::memory::tokenizer::{relevance, tokenize_to_set};

/// 单个主题下最多保留的摘要条数
const MAX_SUMMARIES_PER_TOPIC: usize = 16;

/// attempts / failures 各自最多保留的条数（丢弃最旧的）
const MAX_NOTES: usize = 8;

fn push_capped(list: &mut Vec<String>, item: String) {
    list.push(item);
    if list.len() > MAX_NOTES {
        let excess = list.len() - MAX_NOTES;
        list.drain(..excess);
    }
}

/// 检索结果
#[derive(Clone, Debug, PartialEq)]
pub struct SummaryHit {
    pub topic: String,
    pub summary: String,
    pub score: f32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkingMemory {
    pub goal: Option<String>,
    pub attempts: Vec<String>,
    pub failures: Vec<String>,
    /// topic -> 摘要列表（按写入顺序）
    #[serde(default)]
    pub summaries: BTreeMap<String, Vec<String>>,
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_goal(&mut self, goal: impl Into<String>) {
        self.goal = Some(goal.into());
    }

    pub fn add_attempt(&mut self, attempt: impl Into<String>) {
        push_capped(&mut self.attempts, attempt.into());
    }

    pub fn add_failure(&mut self, failure: impl Into<String>) {
        push_capped(&mut self.failures, failure.into());
    }

    /// 清空目标与尝试记录；摘要跨目标保留
    pub fn clear(&mut self) {
        self.goal = None;
        self.attempts.clear();
        self.failures.clear();
    }

    /// 写入一条摘要；同一主题超过上限时丢弃最旧的
    pub fn store_summary(&mut self, topic: impl Into<String>, summary: impl Into<String>) {
        let topic = topic.into();
        let summary = summary.into();
        if summary.trim().is_empty() {
            return;
        }
        let entries = self.summaries.entry(topic).or_default();
        entries.push(summary);
        if entries.len() > MAX_SUMMARIES_PER_TOPIC {
            let excess = entries.len() - MAX_SUMMARIES_PER_TOPIC;
            entries.drain(..excess);
        }
    }

    pub fn summaries_for(&self, topic: &str) -> &[String] {
        self.summaries.get(topic).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 按相关度检索摘要（主题与正文一起参与打分），返回前 k 条
    pub fn search(&self, query: &str, k: usize) -> Vec<SummaryHit> {
        let query_tokens = tokenize_to_set(query);
        if query_tokens.is_empty() || k == 0 {
            return Vec::new();
        }
        let mut hits: Vec<SummaryHit> = self
            .summaries
            .iter()
            .flat_map(|(topic, entries)| {
                let query_tokens = &query_tokens;
                entries.iter().filter_map(move |summary| {
                    let doc = tokenize_to_set(&format!("{topic} {summary}"));
                    let score = relevance(query_tokens, &doc);
                    (score > 0.0).then(|| SummaryHit {
                        topic: topic.clone(),
                        summary: summary.clone(),
                        score,
                    })
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        hits
    }

    /// 构建供 Planner 使用的 Prompt 片段（Current Goal / What has been tried / Failures）
    pub fn to_prompt_section(&self) -> String {
        let mut s = String::new();
        if let Some(goal) = &self.goal {
            s.push_str(&format!("## Current Goal\n{}\n\n", goal));
        }
        if !self.attempts.is_empty() {
            s.push_str("## What has been tried\n");
            for a in &self.attempts {
                s.push_str(&format!("- {}\n", a));
            }
            s.push('\n');
        }
        if !self.failures.is_empty() {
            s.push_str("## Failures\n");
            for f in &self.failures {
                s.push_str(&format!("- {}\n", f));
            }
            s.push('\n');
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_ranks_by_relevance() {
        let mut wm = WorkingMemory::new();
        wm.store_summary("deploy", "built the docker image and pushed it to the registry");
        wm.store_summary("docs", "rewrote the readme introduction");
        let hits = wm.search("docker registry push", 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].topic, "deploy");
    }

    #[test]
    fn test_store_summary_caps_per_topic() {
        let mut wm = WorkingMemory::new();
        for i in 0..(MAX_SUMMARIES_PER_TOPIC + 3) {
            wm.store_summary("t", format!("summary {i}"));
        }
        let entries = wm.summaries_for("t");
        assert_eq!(entries.len(), MAX_SUMMARIES_PER_TOPIC);
        assert_eq!(entries[0], "summary 3");
    }

    #[test]
    fn test_clear_keeps_summaries() {
        let mut wm = WorkingMemory::new();
        wm.set_goal("g");
        wm.add_failure("f");
        wm.store_summary("t", "kept");
        wm.clear();
        assert!(wm.goal.is_none());
        assert!(wm.failures.is_empty());
        assert_eq!(wm.summaries_for("t").len(), 1);
    }

    #[test]
    fn test_notes_are_capped() {
        let mut wm = WorkingMemory::new();
        for i in 0..(MAX_NOTES * 3) {
            wm.add_attempt(format!("attempt {i}"));
            wm.add_failure(format!("failure {i}"));
        }
        assert_eq!(wm.attempts.len(), MAX_NOTES);
        assert_eq!(wm.failures.len(), MAX_NOTES);
        assert_eq!(wm.failures[0], format!("failure {}", MAX_NOTES * 2));
        let section = wm.to_prompt_section();
        assert!(!section.contains("failure 0\n"));
    }
}
