//! 工具执行器
//!
//! ToolExecutor 是编排器看到的执行契约：execute(ToolCall) → ToolResult，不抛错。
//! RegistryExecutor 持有 ToolRegistry 与全局超时，每次调用输出一条结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::react::ToolCall;
use crate::tools::ToolRegistry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    /// 失败描述：优先 error，其次 output
    pub fn error_text(&self) -> String {
        match &self.error {
            Some(e) if !e.is_empty() => e.clone(),
            _ if !self.output.is_empty() => self.output.clone(),
            _ => "unknown error".to_string(),
        }
    }
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall) -> ToolResult;

    /// 可用工具名（用于 prompt）
    fn tool_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// 基于 ToolRegistry 的执行器：对每次调用施加超时
pub struct RegistryExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl RegistryExecutor {
    pub fn new(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

#[async_trait]
impl ToolExecutor for RegistryExecutor {
    async fn execute(&self, call: &ToolCall) -> ToolResult {
        let start = Instant::now();
        let result = timeout(
            self.timeout,
            self.registry.execute(&call.tool, call.args.clone()),
        )
        .await;

        let outcome = match &result {
            Ok(Ok(_)) => "ok",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.tool,
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.args),
        });
        tracing::info!(audit = %audit, "tool");

        match result {
            Ok(Ok(output)) => ToolResult::success(output),
            Ok(Err(e)) => ToolResult::failure(e),
            Err(_) => ToolResult::failure(format!(
                "tool '{}' timed out after {}s",
                call.tool,
                self.timeout.as_secs()
            )),
        }
    }

    fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
