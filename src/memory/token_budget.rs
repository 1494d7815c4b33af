//! Token 预算控制
//!
//! TokenEstimator 按固定启发式（约 4 字符 / token）估算文本开销；
//! TokenBudget 记录单轮内的消耗，used 只增不减，超出预算时由 ContextManager 在下一次 LLM 调用前压缩。

use serde::{Deserialize, Serialize};

use crate::memory::Message;

/// 每条消息的固定开销（角色、分隔符等）
const PER_MESSAGE_OVERHEAD: usize = 4;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量：字符数 / 4，向上取整
    pub fn estimate(text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }

    /// 估算一组消息的 token 数量（含每条消息的固定开销）
    pub fn estimate_messages(messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| Self::estimate(&m.content) + PER_MESSAGE_OVERHEAD)
            .sum()
    }
}

/// 单轮 token 预算：max 为上限，used 为累计消耗
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    max_tokens: usize,
    used: usize,
}

impl TokenBudget {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens, used: 0 }
    }

    /// 以已知消耗创建（压缩后按剩余消息重新计数）
    pub fn with_used(max_tokens: usize, used: usize) -> Self {
        Self { max_tokens, used }
    }

    /// 累加消耗；只增不减
    pub fn update_budget(&mut self, tokens: usize) {
        self.used = self.used.saturating_add(tokens);
    }

    /// 剩余可用 token，超支时为负数
    pub fn available_tokens(&self) -> i64 {
        self.max_tokens as i64 - self.used as i64
    }

    /// 估算 text 后是否仍在预算内（used + estimate <= max）
    pub fn can_fit_in_budget(&self, text: &str) -> bool {
        self.can_fit_tokens(TokenEstimator::estimate(text))
    }

    pub fn can_fit_tokens(&self, tokens: usize) -> bool {
        self.used.saturating_add(tokens) <= self.max_tokens
    }

    /// 已用比例（0.0 ~ ，超支时大于 1.0）
    pub fn usage_ratio(&self) -> f64 {
        if self.max_tokens == 0 {
            return 1.0;
        }
        self.used as f64 / self.max_tokens as f64
    }

    pub fn is_exceeded(&self) -> bool {
        self.used > self.max_tokens
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(8000)
    }
}
