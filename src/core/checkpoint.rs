//! 检查点管理
//!
//! 把 PlanState 快照（可附带最近消息窗口与对话摘要）写入持久存储，按会话内递增的
//! sequence 排序；先写后剪，超过 max_checkpoints_per_session 时淘汰最旧的。
//! restore 从不抛错，失败以 RestoreResult 结构化返回。
//!
//! 定时检查点由后台任务驱动，受 CancellationToken 控制；计划快照与上一次定时快照相同则跳过。

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::plan::{CheckpointRef, CheckpointTrigger, PlanState};
use crate::core::AgentError;
use crate::memory::{Message, StateStorage, StorageKey};

pub const CHECKPOINT_NAMESPACE: &str = "checkpoints";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// 捕获时的 active 步骤
    pub step_id: Option<String>,
    pub description: String,
    pub trigger: CheckpointTrigger,
    /// 状态快照（不含检查点索引本身）
    pub state: PlanState,
    #[serde(default)]
    pub recent_messages: Vec<Message>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl Checkpoint {
    pub fn to_ref(&self) -> CheckpointRef {
        CheckpointRef {
            id: self.id.clone(),
            sequence: self.sequence,
            timestamp: self.timestamp,
            description: self.description.clone(),
            trigger: self.trigger,
            step_id: self.step_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointOptions {
    pub description: String,
    pub trigger: CheckpointTrigger,
    pub recent_messages: Option<Vec<Message>>,
    pub summary: Option<String>,
}

impl CheckpointOptions {
    pub fn new(description: impl Into<String>, trigger: CheckpointTrigger) -> Self {
        Self {
            description: description.into(),
            trigger,
            recent_messages: None,
            summary: None,
        }
    }

    pub fn with_recent_messages(mut self, messages: Vec<Message>) -> Self {
        self.recent_messages = Some(messages);
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreResult {
    pub success: bool,
    pub checkpoint: Option<CheckpointRef>,
    pub state: Option<PlanState>,
    pub error: Option<String>,
}

impl RestoreResult {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            checkpoint: None,
            state: None,
            error: Some(error.into()),
        }
    }
}

pub struct CheckpointManager {
    storage: Arc<dyn StateStorage>,
    max_per_session: usize,
    /// 同一会话的 create / prune 串行
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    auto_tasks: Mutex<HashMap<String, CancellationToken>>,
}

impl CheckpointManager {
    pub fn new(storage: Arc<dyn StateStorage>, max_per_session: usize) -> Self {
        Self {
            storage,
            max_per_session: max_per_session.max(1),
            session_locks: Mutex::new(HashMap::new()),
            auto_tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_per_session(&self) -> usize {
        self.max_per_session
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .session_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// 写入新检查点，然后剪掉超出上限的最旧检查点
    pub async fn create_checkpoint(
        &self,
        state: &PlanState,
        options: CheckpointOptions,
    ) -> Result<Checkpoint, AgentError> {
        let session_id = state.session_id.clone();
        let lock = self.session_lock(&session_id);
        let _guard = lock.lock().await;

        let existing = self.load_all(&session_id).await?;
        let sequence = existing.last().map(|c| c.sequence + 1).unwrap_or(1);

        let mut snapshot = state.clone();
        snapshot.checkpoints.clear();

        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            sequence,
            timestamp: Utc::now(),
            step_id: state.active_step_id.clone(),
            description: options.description,
            trigger: options.trigger,
            state: snapshot,
            recent_messages: options.recent_messages.unwrap_or_default(),
            summary: options.summary,
        };

        let data = serde_json::to_string(&checkpoint)?;
        self.storage
            .write(
                &StorageKey::item(CHECKPOINT_NAMESPACE, &session_id, &checkpoint.id),
                &data,
            )
            .await?;

        let total = existing.len() + 1;
        if total > self.max_per_session {
            for old in existing.iter().take(total - self.max_per_session) {
                let key = StorageKey::item(CHECKPOINT_NAMESPACE, &session_id, &old.id);
                if let Err(e) = self.storage.delete(&key).await {
                    tracing::warn!(session_id = %session_id, checkpoint = %old.id, error = %e, "failed to prune checkpoint");
                }
            }
        }

        tracing::info!(
            session_id = %session_id,
            checkpoint = %checkpoint.id,
            sequence,
            trigger = ?checkpoint.trigger,
            "checkpoint created"
        );
        Ok(checkpoint)
    }

    /// 读取会话全部检查点，按 sequence 升序；损坏的条目跳过并记日志
    async fn load_all(&self, session_id: &str) -> Result<Vec<Checkpoint>, AgentError> {
        let ids = self.storage.list(CHECKPOINT_NAMESPACE, session_id).await?;
        let mut checkpoints = Vec::with_capacity(ids.len());
        for id in ids {
            let key = StorageKey::item(CHECKPOINT_NAMESPACE, session_id, &id);
            match self.storage.read(&key).await {
                Ok(Some(data)) => match serde_json::from_str::<Checkpoint>(&data) {
                    Ok(cp) => checkpoints.push(cp),
                    Err(e) => {
                        tracing::warn!(session_id, checkpoint = %id, error = %e, "corrupt checkpoint skipped")
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(session_id, checkpoint = %id, error = %e, "unreadable checkpoint skipped")
                }
            }
        }
        checkpoints.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then(a.timestamp.cmp(&b.timestamp))
        });
        Ok(checkpoints)
    }

    /// 最旧在前
    pub async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<CheckpointRef>, AgentError> {
        Ok(self
            .load_all(session_id)
            .await?
            .iter()
            .map(Checkpoint::to_ref)
            .collect())
    }

    pub async fn get_checkpoint(
        &self,
        session_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>, AgentError> {
        let key = StorageKey::item(CHECKPOINT_NAMESPACE, session_id, checkpoint_id);
        match self.storage.read(&key).await? {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    pub async fn latest(&self, session_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        Ok(self.load_all(session_id).await?.pop())
    }

    /// 恢复指定检查点（None 表示最新）；返回的 state 由调用方整体替换进 PlanStateStore
    pub async fn restore(&self, session_id: &str, checkpoint_id: Option<&str>) -> RestoreResult {
        let found = match checkpoint_id {
            Some(id) => self.get_checkpoint(session_id, id).await,
            None => self.latest(session_id).await,
        };
        match found {
            Ok(Some(cp)) => {
                tracing::info!(session_id, checkpoint = %cp.id, "checkpoint restored");
                RestoreResult {
                    success: true,
                    checkpoint: Some(cp.to_ref()),
                    state: Some(cp.state),
                    error: None,
                }
            }
            Ok(None) => RestoreResult::failure("no checkpoint found"),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "checkpoint restore failed");
                RestoreResult::failure(e.to_string())
            }
        }
    }

    /// 最新检查点中是否还有未完成的计划
    pub async fn has_incomplete_work(&self, session_id: &str) -> bool {
        match self.latest(session_id).await {
            Ok(Some(cp)) => cp.state.has_active_plan(),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "failed to inspect checkpoints");
                false
            }
        }
    }

    pub async fn delete_checkpoints(&self, session_id: &str) -> Result<usize, AgentError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        let ids = self.storage.list(CHECKPOINT_NAMESPACE, session_id).await?;
        for id in &ids {
            self.storage
                .delete(&StorageKey::item(CHECKPOINT_NAMESPACE, session_id, id))
                .await?;
        }
        Ok(ids.len())
    }

    /// 启动定时检查点；同一会话已有任务时先停止旧任务
    pub fn start_auto_checkpoint<F, Fut>(
        self: &Arc<Self>,
        session_id: &str,
        get_state: F,
        interval: Duration,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<PlanState>> + Send,
    {
        self.stop_auto_checkpoint(session_id);

        let token = CancellationToken::new();
        {
            let mut tasks = self
                .auto_tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tasks.insert(session_id.to_string(), token.clone());
        }

        let manager = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 第一次 tick 立即返回，跳过
            ticker.tick().await;
            let mut last_fingerprint: Option<String> = None;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(state) = get_state().await else { continue };
                        let fingerprint = plan_fingerprint(&state);
                        if last_fingerprint.as_deref() == Some(fingerprint.as_str()) {
                            tracing::debug!(session_id = %session_id, "plan unchanged, interval checkpoint skipped");
                            continue;
                        }
                        let options = CheckpointOptions::new("interval checkpoint", CheckpointTrigger::Interval);
                        match manager.create_checkpoint(&state, options).await {
                            Ok(_) => last_fingerprint = Some(fingerprint),
                            Err(e) => tracing::warn!(session_id = %session_id, error = %e, "interval checkpoint failed"),
                        }
                    }
                }
            }
            tracing::debug!(session_id = %session_id, "auto checkpoint stopped");
        });
    }

    pub fn stop_auto_checkpoint(&self, session_id: &str) -> bool {
        let token = self
            .auto_tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(session_id);
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_auto_checkpoint_running(&self, session_id: &str) -> bool {
        self.auto_tasks
            .lock()
            .map(|tasks| tasks.contains_key(session_id))
            .unwrap_or(false)
    }
}

/// 计划部分的指纹（不含计数器与时间戳）
fn plan_fingerprint(state: &PlanState) -> String {
    serde_json::json!({
        "plan": state.plan,
        "active": state.active_step_id,
        "completed": state.completed_step_ids,
        "failed": state.failed_step_ids,
    })
    .to_string()
}
