//! 重试引擎
//!
//! 工具失败时按关键词把错误归类，再决定 retry（附替代调用）或 give_up。
//! 瞬时类失败（超时 / 网络 / 限流 / 未知）向 Planner 请求替代调用，拿不到就原样重试；
//! 确定性失败（权限 / 不存在 / 参数错误）必须换一个不同的调用，否则立即放弃。
//! 每个 (会话, 步骤) 的失败次数超过 max_retries 即放弃，由编排器把步骤标记为 failed。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::react::ToolCall;
use crate::tools::ToolResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Permission,
    NotFound,
    RateLimit,
    Network,
    InvalidInput,
    Unknown,
}

impl FailureKind {
    /// 关键词分类；顺序决定优先级（限流先于超时，"429 timeout" 视为限流）
    pub fn classify(error: &str) -> Self {
        let e = error.to_lowercase();
        let has = |keys: &[&str]| keys.iter().any(|k| e.contains(k));
        if has(&["rate limit", "rate-limit", "too many requests", "429", "quota"]) {
            FailureKind::RateLimit
        } else if has(&["timeout", "timed out", "deadline exceeded"]) {
            FailureKind::Timeout
        } else if has(&[
            "permission denied",
            "forbidden",
            "unauthorized",
            "not allowed",
            "access denied",
            "401",
            "403",
        ]) {
            FailureKind::Permission
        } else if has(&["not found", "no such file", "does not exist", "unknown tool", "404"]) {
            FailureKind::NotFound
        } else if has(&[
            "connection",
            "network",
            "dns",
            "unreachable",
            "reset by peer",
            "broken pipe",
        ]) {
            FailureKind::Network
        } else if has(&["invalid", "missing", "malformed", "bad request", "expected", "400"]) {
            FailureKind::InvalidInput
        } else {
            FailureKind::Unknown
        }
    }

    /// 瞬时失败：同样的调用稍后可能成功
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::Network | FailureKind::RateLimit | FailureKind::Unknown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Permission => "permission",
            FailureKind::NotFound => "not_found",
            FailureKind::RateLimit => "rate_limit",
            FailureKind::Network => "network",
            FailureKind::InvalidInput => "invalid_input",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 交给替代调用来源的失败上下文
#[derive(Debug, Clone, PartialEq)]
pub struct FailureContext {
    pub error: String,
    pub kind: FailureKind,
    /// 本步骤第几次失败（从 1 开始）
    pub attempt: u32,
}

impl FailureContext {
    pub fn new(error: impl Into<String>, attempt: u32) -> Self {
        let error = error.into();
        Self {
            kind: FailureKind::classify(&error),
            error,
            attempt,
        }
    }
}

/// 替代调用来源（通常是 Planner）
#[async_trait]
pub trait AlternativeSource: Send + Sync {
    async fn alternative(
        &self,
        failed: &ToolCall,
        failure: &FailureContext,
    ) -> Result<Option<ToolCall>, AgentError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry {
        call: ToolCall,
        kind: FailureKind,
        attempt: u32,
    },
    GiveUp {
        reason: String,
        kind: FailureKind,
    },
}

pub struct RetryEngine {
    max_retries: u32,
    request_alternatives: bool,
    source: Option<Arc<dyn AlternativeSource>>,
    attempts: Mutex<HashMap<(String, String), u32>>,
}

impl RetryEngine {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            request_alternatives: true,
            source: None,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_alternative_source(mut self, source: Arc<dyn AlternativeSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_request_alternatives(mut self, enabled: bool) -> Self {
        self.request_alternatives = enabled;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn bump(&self, session_id: &str, step_id: &str) -> u32 {
        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let n = attempts
            .entry((session_id.to_string(), step_id.to_string()))
            .or_insert(0);
        *n += 1;
        *n
    }

    /// 该步骤已记录的失败次数
    pub fn failures(&self, session_id: &str, step_id: &str) -> u32 {
        self.attempts
            .lock()
            .map(|a| {
                a.get(&(session_id.to_string(), step_id.to_string()))
                    .copied()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// 步骤结束（成功或放弃）后清零
    pub fn reset(&self, session_id: &str, step_id: &str) {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.remove(&(session_id.to_string(), step_id.to_string()));
        }
    }

    pub fn reset_session(&self, session_id: &str) {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.retain(|(sid, _), _| sid != session_id);
        }
    }

    /// 能力调用（如请求下一步）失败：与工具失败共用计数；超出预算时返回放弃原因
    pub fn record_capability_failure(
        &self,
        session_id: &str,
        step_id: &str,
        error: &str,
    ) -> Option<String> {
        let attempt = self.bump(session_id, step_id);
        if attempt > self.max_retries {
            tracing::info!(session_id, step_id, attempt, "capability retries exhausted");
            return Some(format!("retries exhausted after {attempt} failures: {error}"));
        }
        tracing::debug!(session_id, step_id, attempt, error, "capability failure, will retry");
        None
    }

    pub async fn on_failure(
        &self,
        session_id: &str,
        step_id: &str,
        call: &ToolCall,
        result: &ToolResult,
    ) -> RetryDecision {
        let error = result.error_text();
        let attempt = self.bump(session_id, step_id);
        let failure = FailureContext::new(error.clone(), attempt);
        let kind = failure.kind;

        if attempt > self.max_retries {
            tracing::info!(session_id, step_id, attempt, kind = %kind, "retries exhausted");
            return RetryDecision::GiveUp {
                reason: format!("retries exhausted after {attempt} failures: {error}"),
                kind,
            };
        }

        let alternative = match (&self.source, self.request_alternatives) {
            (Some(source), true) => match source.alternative(call, &failure).await {
                Ok(alt) => alt,
                Err(e) => {
                    tracing::warn!(session_id, step_id, error = %e, "alternative request failed");
                    None
                }
            },
            _ => None,
        };

        if kind.is_transient() {
            let next = alternative.unwrap_or_else(|| call.clone());
            tracing::debug!(session_id, step_id, attempt, kind = %kind, tool = %next.tool, "retrying");
            return RetryDecision::Retry {
                call: next,
                kind,
                attempt,
            };
        }

        match alternative {
            Some(alt) if alt != *call => {
                tracing::debug!(session_id, step_id, attempt, kind = %kind, tool = %alt.tool, "retrying with alternative");
                RetryDecision::Retry {
                    call: alt,
                    kind,
                    attempt,
                }
            }
            _ => RetryDecision::GiveUp {
                reason: format!("{kind} failure with no alternative call: {error}"),
                kind,
            },
        }
    }
}
