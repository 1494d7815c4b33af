//! 会话监管：每个会话一个取消令牌
//!
//! 所有会话令牌都是根令牌的子令牌：cancel(session) 只中断该会话当前一轮，shutdown 中断全部。
//! 已取消的令牌在下一轮开始时被替换，会话可继续使用。

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct SessionSupervisor {
    root: CancellationToken,
    sessions: Mutex<HashMap<String, CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新一轮开始时取令牌；上一轮已取消则换新的
    pub fn begin_turn(&self, session_id: &str) -> CancellationToken {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let token = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| self.root.child_token());
        if token.is_cancelled() && !self.root.is_cancelled() {
            *token = self.root.child_token();
        }
        token.clone()
    }

    /// 触发会话取消（用户 Ctrl+C）；会话不存在时返回 false
    pub fn cancel(&self, session_id: &str) -> bool {
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match sessions.get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消全部会话
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions
            .lock()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_per_session_and_renewed() {
        let sup = SessionSupervisor::new();
        let a = sup.begin_turn("a");
        let b = sup.begin_turn("b");
        assert!(sup.cancel("a"));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!sup.cancel("missing"));

        let a2 = sup.begin_turn("a");
        assert!(!a2.is_cancelled());

        sup.shutdown();
        assert!(a2.is_cancelled() && b.is_cancelled());
        assert!(sup.begin_turn("a").is_cancelled());
    }
}
