//! Mock / Scripted LLM 客户端（用于测试与离线运行，无需 API）
//!
//! - MockLlmClient：取最后一条 User 消息，回显为 JSON Tool Call（echo），便于本地跑通循环。
//! - ScriptedLlmClient：按顺序返回预置回复，并记录收到的请求，供场景测试断言。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, LlmRequest};
use crate::memory::Role;

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(serde_json::json!({
            "tool": "echo",
            "args": { "text": format!("Echo from Mock: {last_user}") }
        })
        .to_string())
    }
}

/// 预置回复的客户端；脚本耗尽后返回 fallback（未设置则报错）
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Option<String>,
    delay: Option<Duration>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(responses.into_iter().map(|s| Ok(s.into())).collect()),
            fallback: None,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 追加一条失败回复
    pub fn then_error(self, error: LlmError) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(error));
        }
        self
    }

    pub fn then_reply(self, reply: impl Into<String>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Ok(reply.into()));
        }
        self
    }

    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    /// 每次调用前等待（用于超时场景）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(reply) => reply,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| LlmError::Other("script exhausted".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Message;

    #[tokio::test]
    async fn test_mock_echoes_last_user_message() {
        let client = MockLlmClient;
        let request = LlmRequest::new(vec![Message::system("sys"), Message::user("hello")]);
        let out = client.complete(&request).await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["tool"], "echo");
        assert_eq!(v["args"]["text"], "Echo from Mock: hello");
    }

    #[tokio::test]
    async fn test_scripted_replays_in_order() {
        let client = ScriptedLlmClient::new(["one"])
            .then_error(LlmError::Timeout)
            .with_fallback("done");
        let req = LlmRequest::new(vec![Message::user("x")]);
        assert_eq!(client.complete(&req).await.unwrap(), "one");
        assert_eq!(client.complete(&req).await.unwrap_err(), LlmError::Timeout);
        assert_eq!(client.complete(&req).await.unwrap(), "done");
        assert_eq!(client.call_count(), 3);
    }
}
