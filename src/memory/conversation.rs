//! 短期记忆：对话历史
//!
//! 消息按角色与类型（Chat / ToolCall / ToolResult / PlanState / Summary）区分，
//! ContextManager 依据类型决定剪枝时哪些消息必须保留。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// 消息类型：决定上下文压缩时的保留策略
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Chat,
    System,
    /// 当前计划快照（始终保留）
    PlanState,
    ToolCall,
    ToolResult,
    /// 压缩后的历史摘要
    Summary,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            kind: MessageKind::Chat,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            kind: MessageKind::Chat,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            kind: MessageKind::System,
        }
    }

    /// 工具调用（assistant 发出）
    pub fn tool_call(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            kind: MessageKind::ToolCall,
        }
    }

    /// 工具返回
    pub fn tool_result(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            kind: MessageKind::ToolResult,
        }
    }

    pub fn plan_state(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            kind: MessageKind::PlanState,
        }
    }

    pub fn summary(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            kind: MessageKind::Summary,
        }
    }
}

/// 短期记忆：会话内完整消息序列（剪枝交给 ContextManager）
#[derive(Clone, Debug, Default)]
pub struct ConversationMemory {
    messages: Vec<Message>,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 替换全部消息（压缩或检查点恢复后）
    pub fn set_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// 最近 n 条消息（检查点保存的消息窗口）
    pub fn recent(&self, n: usize) -> Vec<Message> {
        let start = self.messages.len().saturating_sub(n);
        self.messages[start..].to_vec()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_window() {
        let mut conv = ConversationMemory::new();
        for i in 0..5 {
            conv.push(Message::user(format!("m{i}")));
        }
        let recent = conv.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "m3");
        assert_eq!(conv.recent(10).len(), 5);
    }

    #[test]
    fn test_kind_defaults_to_chat_when_missing() {
        let msg: Message = serde_json::from_str(r#"{"role":"User","content":"hi"}"#).unwrap();
        assert_eq!(msg.kind, MessageKind::Chat);
    }
}
