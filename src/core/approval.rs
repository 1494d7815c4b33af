//! 审批闸门
//!
//! 每个待执行的 Tool Call 先按规则分级（tier 0 只读直接放行；更高等级需人工审批；
//! 达到 block_tier 直接拒绝）。需要审批时创建 ApprovalRequest 发布到外部决策通道，
//! 调用方在 wait 中挂起，直到外部 resolve、截止时间到（按 timeout_policy 裁决）或会话被取消（视为拒绝）。
//! 等待只作用于单个请求；所有裁决（含超时）都写入审计日志。请求不落盘。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ApprovalSection, RiskRule, TimeoutPolicy};
use crate::core::AgentError;
use crate::react::ToolCall;

struct CompiledRule {
    tool: String,
    pattern: Option<Regex>,
    tier: u8,
}

/// 风险分级：工具名与参数的纯函数
pub struct RiskClassifier {
    rules: Vec<CompiledRule>,
    default_tier: u8,
}

impl RiskClassifier {
    pub fn new(rules: &[RiskRule], default_tier: u8) -> Result<Self, AgentError> {
        let rules = rules
            .iter()
            .map(|r| {
                let pattern = r
                    .params_pattern
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .map_err(|e| {
                        AgentError::ConfigError(format!("invalid risk rule for '{}': {e}", r.tool))
                    })?;
                Ok(CompiledRule {
                    tool: r.tool.clone(),
                    pattern,
                    tier: r.tier,
                })
            })
            .collect::<Result<Vec<_>, AgentError>>()?;
        Ok(Self {
            rules,
            default_tier,
        })
    }

    /// 所有命中规则中取最高等级；无命中时用默认等级
    pub fn classify(&self, call: &ToolCall) -> u8 {
        let params = call.args.to_string();
        self.rules
            .iter()
            .filter(|r| r.tool == "*" || r.tool == call.tool)
            .filter(|r| r.pattern.as_ref().map_or(true, |p| p.is_match(&params)))
            .map(|r| r.tier)
            .max()
            .unwrap_or(self.default_tier)
    }
}

/// 审批请求里展示给人看的参数摘要
pub fn summarize_args(call: &ToolCall) -> String {
    let raw = match call.tool.as_str() {
        "shell" => call
            .args
            .get("command")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("(unknown)")
            .to_string(),
        _ => call.args.to_string(),
    };
    if raw.chars().count() > 200 {
        format!("{}...", raw.chars().take(200).collect::<String>())
    } else {
        raw
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalResolution {
    Pending,
    Approved,
    Denied,
    TimedOut,
}

impl fmt::Display for ApprovalResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalResolution::Pending => "pending",
            ApprovalResolution::Approved => "approved",
            ApprovalResolution::Denied => "denied",
            ApprovalResolution::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub session_id: String,
    pub tool_call: ToolCall,
    pub tier: u8,
    pub args_summary: String,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub resolution: ApprovalResolution,
}

/// 外部裁决
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Deny { reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    Allow { tier: u8 },
    Block { tier: u8, reason: String },
    Pending(ApprovalRequest),
}

/// wait 的结果；approved 为 true 才可执行
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalOutcome {
    pub request_id: String,
    pub resolution: ApprovalResolution,
    pub approved: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Blocked,
    Approved,
    Denied,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub session_id: String,
    pub request_id: Option<String>,
    pub tool: String,
    pub tier: u8,
    pub outcome: AuditOutcome,
    pub reason: Option<String>,
}

/// 外部决策通道：接收待审批请求（CLI / IM / Web 等）
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    async fn publish(&self, request: &ApprovalRequest) -> anyhow::Result<()>;
}

/// 只写日志的通道；裁决需经 ApprovalGate::resolve 送达
pub struct LogApprovalChannel;

#[async_trait]
impl ApprovalChannel for LogApprovalChannel {
    async fn publish(&self, request: &ApprovalRequest) -> anyhow::Result<()> {
        tracing::info!(
            request_id = %request.id,
            session_id = %request.session_id,
            tool = %request.tool_call.tool,
            tier = request.tier,
            args = %request.args_summary,
            deadline = %request.deadline,
            "tool approval requested"
        );
        Ok(())
    }
}

/// 把请求转发到 mpsc 通道，由外部任务消费
pub struct MpscApprovalChannel {
    tx: mpsc::UnboundedSender<ApprovalRequest>,
}

impl MpscApprovalChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ApprovalRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ApprovalChannel for MpscApprovalChannel {
    async fn publish(&self, request: &ApprovalRequest) -> anyhow::Result<()> {
        self.tx
            .send(request.clone())
            .map_err(|_| anyhow::anyhow!("approval receiver dropped"))
    }
}

struct PendingEntry {
    request: ApprovalRequest,
    deadline: Instant,
    tx: Option<oneshot::Sender<ApprovalDecision>>,
    /// 被 wait 取走后为 None
    rx: Option<oneshot::Receiver<ApprovalDecision>>,
}

pub struct ApprovalGate {
    enabled: bool,
    classifier: RiskClassifier,
    block_tier: Option<u8>,
    timeout: Duration,
    timeout_policy: TimeoutPolicy,
    channel: Arc<dyn ApprovalChannel>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    /// 已过期、尚未被 wait 领取的结果：request_id -> (session_id, outcome)
    expired: Mutex<HashMap<String, (String, ApprovalOutcome)>>,
    audit: Mutex<Vec<AuditEntry>>,
}

impl ApprovalGate {
    pub fn from_config(
        section: &ApprovalSection,
        channel: Arc<dyn ApprovalChannel>,
    ) -> Result<Self, AgentError> {
        Ok(Self {
            enabled: section.enabled,
            classifier: RiskClassifier::new(&section.rules, section.default_tier)?,
            block_tier: section.block_tier,
            timeout: Duration::from_millis(section.timeout_ms),
            timeout_policy: section.timeout_policy,
            channel,
            pending: Mutex::new(HashMap::new()),
            expired: Mutex::new(HashMap::new()),
            audit: Mutex::new(Vec::new()),
        })
    }

    pub fn classify(&self, call: &ToolCall) -> u8 {
        self.classifier.classify(call)
    }

    fn record(&self, entry: AuditEntry) {
        let line = serde_json::json!({
            "event": "approval_audit",
            "session_id": entry.session_id,
            "request_id": entry.request_id,
            "tool": entry.tool,
            "tier": entry.tier,
            "outcome": entry.outcome,
            "reason": entry.reason,
        });
        tracing::info!(audit = %line, "approval");
        self.audit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry);
    }

    fn audit_entry(
        session_id: &str,
        request_id: Option<&str>,
        call: &ToolCall,
        tier: u8,
        outcome: AuditOutcome,
        reason: Option<String>,
    ) -> AuditEntry {
        AuditEntry {
            at: Utc::now(),
            session_id: session_id.to_string(),
            request_id: request_id.map(str::to_string),
            tool: call.tool.clone(),
            tier,
            outcome,
            reason,
        }
    }

    /// 分级并决定放行、拒绝或挂起；挂起时请求已发布到决策通道
    pub async fn evaluate(&self, session_id: &str, call: &ToolCall) -> GateVerdict {
        self.sweep_expired();
        let tier = self.classify(call);
        if !self.enabled || tier == 0 {
            self.record(Self::audit_entry(session_id, None, call, tier, AuditOutcome::Allowed, None));
            return GateVerdict::Allow { tier };
        }
        if let Some(block) = self.block_tier {
            if tier >= block {
                let reason = format!("tool '{}' is risk tier {tier} (blocked at {block})", call.tool);
                self.record(Self::audit_entry(
                    session_id,
                    None,
                    call,
                    tier,
                    AuditOutcome::Blocked,
                    Some(reason.clone()),
                ));
                return GateVerdict::Block { tier, reason };
            }
        }

        let now = Utc::now();
        let deadline = now
            + chrono::Duration::from_std(self.timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let request = ApprovalRequest {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            tool_call: call.clone(),
            tier,
            args_summary: summarize_args(call),
            created_at: now,
            deadline,
            resolution: ApprovalResolution::Pending,
        };
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                request.id.clone(),
                PendingEntry {
                    request: request.clone(),
                    deadline: Instant::now() + self.timeout,
                    tx: Some(tx),
                    rx: Some(rx),
                },
            );

        if let Err(e) = self.channel.publish(&request).await {
            tracing::warn!(request_id = %request.id, error = %e, "failed to publish approval request");
        }
        GateVerdict::Pending(request)
    }

    /// 外部裁决；请求不存在、已裁决或已过截止时间时返回 false
    pub fn resolve(&self, request_id: &str, decision: ApprovalDecision) -> bool {
        let tx = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match pending.get_mut(request_id) {
                Some(entry) if Instant::now() < entry.deadline => entry.tx.take(),
                Some(_) => {
                    tracing::info!(request_id, "approval decision arrived after deadline, ignored");
                    None
                }
                None => None,
            }
        };
        match tx {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    fn decision_verdict(
        decision: Result<ApprovalDecision, oneshot::error::RecvError>,
    ) -> (ApprovalResolution, bool, String) {
        match decision {
            Ok(ApprovalDecision::Approve) => (ApprovalResolution::Approved, true, "approved".to_string()),
            Ok(ApprovalDecision::Deny { reason }) => (
                ApprovalResolution::Denied,
                false,
                reason.unwrap_or_else(|| "approval denied".to_string()),
            ),
            Err(_) => (ApprovalResolution::Denied, false, "approval channel closed".to_string()),
        }
    }

    fn timeout_verdict(&self) -> (ApprovalResolution, bool, String) {
        (
            ApprovalResolution::TimedOut,
            self.timeout_policy == TimeoutPolicy::Approve,
            "approval timed out".to_string(),
        )
    }

    /// 截止时间已过：截止前送达的裁决仍然有效，否则按 timeout_policy
    fn expired_verdict(&self, rx: &mut oneshot::Receiver<ApprovalDecision>) -> (ApprovalResolution, bool, String) {
        match rx.try_recv() {
            Ok(decision) => Self::decision_verdict(Ok(decision)),
            Err(_) => self.timeout_verdict(),
        }
    }

    /// 等待单个请求的裁决（外部决定 / 截止时间 / 取消，先到者生效）
    pub async fn wait(&self, request_id: &str, cancel: &CancellationToken) -> ApprovalOutcome {
        let swept = self
            .expired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(request_id);
        if let Some((_, outcome)) = swept {
            return outcome;
        }

        let taken = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            pending
                .get_mut(request_id)
                .and_then(|entry| entry.rx.take().map(|rx| (rx, entry.deadline, entry.request.clone())))
        };
        let Some((mut rx, deadline, request)) = taken else {
            return ApprovalOutcome {
                request_id: request_id.to_string(),
                resolution: ApprovalResolution::Denied,
                approved: false,
                reason: "unknown approval request".to_string(),
            };
        };

        let (resolution, approved, reason) = if Instant::now() >= deadline {
            self.expired_verdict(&mut rx)
        } else {
            let settled = tokio::select! {
                biased;
                decision = &mut rx => Some(Self::decision_verdict(decision)),
                _ = cancel.cancelled() => Some((ApprovalResolution::Denied, false, "cancelled".to_string())),
                _ = tokio::time::sleep_until(deadline) => None,
            };
            match settled {
                Some(verdict) => verdict,
                None => self.expired_verdict(&mut rx),
            }
        };

        self.finish(&request, resolution, approved, &reason);
        ApprovalOutcome {
            request_id: request.id,
            resolution,
            approved,
            reason,
        }
    }

    /// 清理无人等待且已过截止时间的请求：写审计，结果留给之后对同一请求的 wait
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(ApprovalRequest, oneshot::Receiver<ApprovalDecision>)> = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, e)| e.rx.is_some() && e.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| pending.remove(id))
                .filter_map(|mut e| e.rx.take().map(|rx| (e.request, rx)))
                .collect()
        };
        let count = expired.len();
        for (request, mut rx) in expired {
            let (resolution, approved, reason) = self.expired_verdict(&mut rx);
            self.finish(&request, resolution, approved, &reason);
            self.expired
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(
                    request.id.clone(),
                    (
                        request.session_id,
                        ApprovalOutcome {
                            request_id: request.id,
                            resolution,
                            approved,
                            reason,
                        },
                    ),
                );
        }
        count
    }

    /// 请求仍待 wait 取走结果（未裁决，或已过期但结果未被领取）
    pub fn is_open(&self, request_id: &str) -> bool {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(request_id);
        pending
            || self
                .expired
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .contains_key(request_id)
    }

    fn finish(&self, request: &ApprovalRequest, resolution: ApprovalResolution, approved: bool, reason: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&request.id);
        let outcome = match resolution {
            ApprovalResolution::TimedOut => AuditOutcome::TimedOut,
            _ if approved => AuditOutcome::Approved,
            _ => AuditOutcome::Denied,
        };
        self.record(Self::audit_entry(
            &request.session_id,
            Some(&request.id),
            &request.tool_call,
            request.tier,
            outcome,
            Some(reason.to_string()),
        ));
    }

    /// 取消会话中无人等待的挂起请求（正在等待的由取消令牌处理）
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let idle: Vec<ApprovalRequest> = {
            let pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            pending
                .values()
                .filter(|e| e.request.session_id == session_id && e.rx.is_some())
                .map(|e| e.request.clone())
                .collect()
        };
        for request in &idle {
            self.finish(request, ApprovalResolution::Denied, false, "cancelled");
        }
        self.expired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|_, (owner, _)| owner != session_id);
        idle.len()
    }

    /// 未裁决的请求；session_id 为 None 时返回全部
    pub fn pending_requests(&self, session_id: Option<&str>) -> Vec<ApprovalRequest> {
        self.sweep_expired();
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut out: Vec<ApprovalRequest> = pending
            .values()
            .filter(|e| session_id.map_or(true, |s| e.request.session_id == s))
            .map(|e| e.request.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn section(timeout_ms: u64, policy: TimeoutPolicy) -> ApprovalSection {
        ApprovalSection {
            enabled: true,
            default_tier: 1,
            block_tier: Some(3),
            timeout_ms,
            timeout_policy: policy,
            rules: vec![
                RiskRule::new("read", 0),
                RiskRule::new("deploy", 2),
                RiskRule::new("*", 3).with_pattern("prod"),
            ],
        }
    }

    fn gate(timeout_ms: u64, policy: TimeoutPolicy) -> ApprovalGate {
        ApprovalGate::from_config(&section(timeout_ms, policy), Arc::new(LogApprovalChannel)).unwrap()
    }

    #[test]
    fn test_classify_highest_matching_tier() {
        let g = gate(500, TimeoutPolicy::Deny);
        assert_eq!(g.classify(&ToolCall::new("read", json!({"path": "a"}))), 0);
        assert_eq!(g.classify(&ToolCall::new("read", json!({"path": "prod.db"}))), 3);
        assert_eq!(g.classify(&ToolCall::new("deploy", json!({"env": "dev"}))), 2);
        assert_eq!(g.classify(&ToolCall::new("mystery", json!({}))), 1);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let mut s = section(500, TimeoutPolicy::Deny);
        s.rules.push(RiskRule::new("x", 1).with_pattern("(unclosed"));
        assert!(matches!(
            ApprovalGate::from_config(&s, Arc::new(LogApprovalChannel)),
            Err(AgentError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_allow_and_block() {
        let g = gate(500, TimeoutPolicy::Deny);
        assert_eq!(
            g.evaluate("s", &ToolCall::new("read", json!({}))).await,
            GateVerdict::Allow { tier: 0 }
        );
        assert!(matches!(
            g.evaluate("s", &ToolCall::new("deploy", json!({"env": "prod"}))).await,
            GateVerdict::Block { tier: 3, .. }
        ));
        let log = g.audit_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].outcome, AuditOutcome::Blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_applies_default_deny() {
        let g = gate(500, TimeoutPolicy::Deny);
        let GateVerdict::Pending(req) = g.evaluate("s", &ToolCall::new("deploy", json!({}))).await
        else {
            panic!("expected pending");
        };
        assert_eq!(req.tier, 2);
        let outcome = g.wait(&req.id, &CancellationToken::new()).await;
        assert_eq!(outcome.resolution, ApprovalResolution::TimedOut);
        assert!(!outcome.approved);
        assert!(outcome.reason.contains("approval timed out"));
        assert!(g.pending_requests(None).is_empty());
        assert_eq!(g.audit_log().last().unwrap().outcome, AuditOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_with_approve_policy() {
        let g = gate(500, TimeoutPolicy::Approve);
        let GateVerdict::Pending(req) = g.evaluate("s", &ToolCall::new("deploy", json!({}))).await
        else {
            panic!("expected pending");
        };
        let outcome = g.wait(&req.id, &CancellationToken::new()).await;
        assert_eq!(outcome.resolution, ApprovalResolution::TimedOut);
        assert!(outcome.approved);
    }

    #[tokio::test]
    async fn test_external_decision_via_channel() {
        let (channel, mut rx) = MpscApprovalChannel::new();
        let g = Arc::new(
            ApprovalGate::from_config(&section(60_000, TimeoutPolicy::Deny), Arc::new(channel)).unwrap(),
        );
        let GateVerdict::Pending(req) = g.evaluate("s", &ToolCall::new("deploy", json!({}))).await
        else {
            panic!("expected pending");
        };

        let resolver = g.clone();
        tokio::spawn(async move {
            if let Some(published) = rx.recv().await {
                resolver.resolve(&published.id, ApprovalDecision::Approve);
            }
        });
        let outcome = g.wait(&req.id, &CancellationToken::new()).await;
        assert_eq!(outcome.resolution, ApprovalResolution::Approved);
        assert!(outcome.approved);
        assert!(!g.resolve(&req.id, ApprovalDecision::Approve));
    }

    #[tokio::test]
    async fn test_decision_before_wait_and_denial_reason() {
        let g = gate(60_000, TimeoutPolicy::Approve);
        let GateVerdict::Pending(req) = g.evaluate("s", &ToolCall::new("deploy", json!({}))).await
        else {
            panic!("expected pending");
        };
        assert!(g.resolve(
            &req.id,
            ApprovalDecision::Deny {
                reason: Some("not today".into())
            }
        ));
        let outcome = g.wait(&req.id, &CancellationToken::new()).await;
        assert_eq!(outcome.resolution, ApprovalResolution::Denied);
        assert_eq!(outcome.reason, "not today");
    }

    #[tokio::test]
    async fn test_cancel_resolves_as_denied() {
        let g = Arc::new(gate(60_000, TimeoutPolicy::Approve));
        let GateVerdict::Pending(req) = g.evaluate("s", &ToolCall::new("deploy", json!({}))).await
        else {
            panic!("expected pending");
        };
        let token = CancellationToken::new();
        let waiter = {
            let g = g.clone();
            let token = token.clone();
            let id = req.id.clone();
            tokio::spawn(async move { g.wait(&id, &token).await })
        };
        token.cancel();
        let outcome = waiter.await.unwrap();
        assert_eq!(outcome.resolution, ApprovalResolution::Denied);
        assert_eq!(outcome.reason, "cancelled");

        // 无人等待的请求由 cancel_session 处理
        let GateVerdict::Pending(_) = g.evaluate("s", &ToolCall::new("deploy", json!({}))).await
        else {
            panic!("expected pending");
        };
        assert_eq!(g.pending_requests(Some("s")).len(), 1);
        assert_eq!(g.cancel_session("s"), 1);
        assert!(g.pending_requests(Some("s")).is_empty());
        assert_eq!(g.audit_log().last().unwrap().outcome, AuditOutcome::Denied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_decision_rejected() {
        let g = gate(500, TimeoutPolicy::Deny);
        let GateVerdict::Pending(req) = g.evaluate("s", &ToolCall::new("deploy", json!({}))).await
        else {
            panic!("expected pending");
        };
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(!g.resolve(&req.id, ApprovalDecision::Approve));
        let outcome = g.wait(&req.id, &CancellationToken::new()).await;
        assert_eq!(outcome.resolution, ApprovalResolution::TimedOut);
        assert!(!outcome.approved);
        assert_eq!(g.audit_log().last().unwrap().outcome, AuditOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decision_before_deadline_survives_late_wait() {
        let g = gate(500, TimeoutPolicy::Deny);
        let GateVerdict::Pending(req) = g.evaluate("s", &ToolCall::new("deploy", json!({}))).await
        else {
            panic!("expected pending");
        };
        assert!(g.resolve(&req.id, ApprovalDecision::Approve));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let outcome = g.wait(&req.id, &CancellationToken::new()).await;
        assert_eq!(outcome.resolution, ApprovalResolution::Approved);
        assert!(outcome.approved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_times_out_unattended_requests() {
        let g = gate(500, TimeoutPolicy::Deny);
        let GateVerdict::Pending(req) = g.evaluate("s", &ToolCall::new("deploy", json!({}))).await
        else {
            panic!("expected pending");
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(g.pending_requests(None).is_empty());
        assert_eq!(g.audit_log().last().unwrap().outcome, AuditOutcome::TimedOut);
        assert!(g.is_open(&req.id));

        let outcome = g.wait(&req.id, &CancellationToken::new()).await;
        assert_eq!(outcome.resolution, ApprovalResolution::TimedOut);
        assert!(!g.is_open(&req.id));
        // 清理只记一次审计
        let timed_out = g
            .audit_log()
            .iter()
            .filter(|e| e.outcome == AuditOutcome::TimedOut)
            .count();
        assert_eq!(timed_out, 1);
    }
}
