//! Shell 工具：白名单命令，禁止危险子串
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、cargo）；命中禁用子串或不在白名单时以
//! "permission denied" 拒绝（重试引擎据此视为确定性失败，不会原样重试）。
//! 执行通过 sh -c，带超时，超时后子进程随 future 一起被杀掉。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::config::ShellSection;
use crate::tools::Tool;

/// 禁止的子串（即使命令名在白名单中）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
];

pub struct ShellTool {
    allowed_commands: HashSet<String>,
    timeout: Duration,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>, timeout: Duration) -> Self {
        Self {
            allowed_commands: allowed_commands
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
            timeout,
        }
    }

    pub fn from_config(section: &ShellSection, timeout: Duration) -> Self {
        Self::new(section.allowed_commands.clone(), timeout)
    }

    fn check(&self, raw: &str) -> Result<(), String> {
        let lower = raw.to_lowercase();
        if let Some(f) = FORBIDDEN_SUBSTR.iter().find(|f| lower.contains(*f)) {
            return Err(format!("permission denied: forbidden pattern {f:?}"));
        }
        let name = lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err("invalid arguments: empty command".to_string());
        }
        if !self.allowed_commands.contains(name) {
            return Err(format!("permission denied: command '{name}' not in allowlist"));
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run an allowlisted shell command and return its stdout."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute (first word must be allowlisted)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        self.check(command)?;

        tracing::debug!(command = %command, "shell tool execute");

        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| format!("command timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| format!("execution failed: {e}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(format!("exit {:?}: {}", output.status.code(), stderr));
        }
        Ok(if stderr.is_empty() {
            stdout
        } else {
            format!("{stdout}\nstderr: {stderr}")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> ShellTool {
        ShellTool::new(vec!["echo".into(), "ls".into()], Duration::from_secs(5))
    }

    #[test]
    fn test_rejects_outside_allowlist() {
        let t = tool();
        assert!(t.check("ls -la").is_ok());
        assert!(t.check("cat /etc/passwd").unwrap_err().contains("permission denied"));
        assert!(t.check("ls; rm -rf /").unwrap_err().contains("forbidden"));
        assert!(t.check("  ").unwrap_err().contains("empty"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_allowed_command() {
        let out = tool()
            .execute(serde_json::json!({"command": "echo hello"}))
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }
}
