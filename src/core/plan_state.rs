//! 计划状态存储
//!
//! 每个会话一个 PlanState，存放在独立的异步互斥槽中：同一会话的修改严格串行，
//! 不同会话之间不共享锁。槽在首次访问时从存储懒加载；缺失或损坏的数据回退为空状态。
//!
//! 持久化按 auto_save_every 批量进行：每累计 N 次修改写一次（N = 1 即每次修改都在返回前落盘）。
//! 写入失败只记日志，脏计数保留，下一次修改时自动重试，不阻塞调用方。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::core::checkpoint::{Checkpoint, CheckpointManager, CheckpointOptions};
use crate::core::plan::{
    CheckpointTrigger, PlanDiff, PlanProgress, PlanState, StepStatus, TaskPlan,
};
use crate::core::AgentError;
use crate::memory::{StateStorage, StorageError, StorageKey};

pub const PLAN_STATE_NAMESPACE: &str = "plan_state";

struct Slot {
    state: PlanState,
    /// 自上次成功写入后的修改次数
    dirty: usize,
    loaded: bool,
}

pub struct PlanStateStore {
    storage: Arc<dyn StateStorage>,
    checkpoints: Arc<CheckpointManager>,
    auto_save_every: usize,
    slots: Mutex<HashMap<String, Arc<AsyncMutex<Slot>>>>,
}

impl PlanStateStore {
    pub fn new(
        storage: Arc<dyn StateStorage>,
        checkpoints: Arc<CheckpointManager>,
        auto_save_every: usize,
    ) -> Self {
        Self {
            storage,
            checkpoints,
            auto_save_every: auto_save_every.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn checkpoint_manager(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    fn slot(&self, session_id: &str) -> Arc<AsyncMutex<Slot>> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(Slot {
                    state: PlanState::empty(session_id),
                    dirty: 0,
                    loaded: false,
                }))
            })
            .clone()
    }

    /// 锁定会话槽，必要时先从存储加载
    async fn lock(&self, session_id: &str) -> OwnedMutexGuard<Slot> {
        let mut guard = self.slot(session_id).lock_owned().await;
        if !guard.loaded {
            guard.state = self.read_state(session_id).await;
            guard.loaded = true;
            guard.dirty = 0;
        }
        guard
    }

    async fn read_state(&self, session_id: &str) -> PlanState {
        let key = StorageKey::session(PLAN_STATE_NAMESPACE, session_id);
        match self.storage.read(&key).await {
            Ok(Some(data)) => match serde_json::from_str::<PlanState>(&data) {
                Ok(mut state) => {
                    state.session_id = session_id.to_string();
                    state
                }
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "corrupt plan state, starting empty");
                    PlanState::empty(session_id)
                }
            },
            Ok(None) => PlanState::empty(session_id),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "failed to load plan state, starting empty");
                PlanState::empty(session_id)
            }
        }
    }

    async fn write_state(&self, state: &PlanState) -> Result<(), StorageError> {
        let data = serde_json::to_string(state)
            .map_err(|e| StorageError::Backend(format!("serialize plan state: {e}")))?;
        self.storage
            .write(&StorageKey::session(PLAN_STATE_NAMESPACE, &state.session_id), &data)
            .await
    }

    /// 记一次修改并按批量策略落盘
    async fn commit(&self, slot: &mut Slot) {
        slot.state.counters.last_activity = Utc::now();
        slot.dirty += 1;
        if slot.dirty < self.auto_save_every {
            return;
        }
        match self.write_state(&slot.state).await {
            Ok(()) => slot.dirty = 0,
            Err(e) => {
                tracing::warn!(
                    session_id = %slot.state.session_id,
                    pending = slot.dirty,
                    error = %e,
                    "plan state save failed, will retry on next mutation"
                );
            }
        }
    }

    /// 加载（或创建空的）会话状态
    pub async fn init(&self, session_id: &str) -> PlanState {
        self.lock(session_id).await.state.clone()
    }

    pub async fn get_state(&self, session_id: &str) -> PlanState {
        self.init(session_id).await
    }

    pub async fn get_progress(&self, session_id: &str) -> PlanProgress {
        self.lock(session_id).await.state.progress()
    }

    /// 丢弃内存中的状态并从存储重新读取（未落盘的修改会丢失）
    pub async fn load(&self, session_id: &str) -> PlanState {
        let mut slot = self.slot(session_id).lock_owned().await;
        slot.state = self.read_state(session_id).await;
        slot.loaded = true;
        slot.dirty = 0;
        slot.state.clone()
    }

    /// 立即落盘；显式调用时写入失败返回错误
    pub async fn save(&self, session_id: &str) -> Result<(), AgentError> {
        let mut slot = self.lock(session_id).await;
        self.write_state(&slot.state).await?;
        slot.dirty = 0;
        Ok(())
    }

    /// 先把未落盘的修改写入存储，再返回状态副本；供定时检查点使用
    pub async fn durable_snapshot(&self, session_id: &str) -> Result<PlanState, AgentError> {
        let mut slot = self.lock(session_id).await;
        if slot.dirty > 0 {
            self.write_state(&slot.state).await?;
            slot.dirty = 0;
        }
        Ok(slot.state.clone())
    }

    /// 未落盘的修改次数
    pub async fn pending_writes(&self, session_id: &str) -> usize {
        self.lock(session_id).await.dirty
    }

    /// 整体替换计划；返回与旧计划的差异
    pub async fn set_plan(&self, session_id: &str, mut plan: TaskPlan) -> Result<PlanDiff, AgentError> {
        let mut slot = self.lock(session_id).await;
        let diff = PlanDiff::between(slot.state.plan.as_ref(), &plan);
        if let Some(old) = &slot.state.plan {
            plan.version = old.version.max(plan.version) + 1;
        }
        slot.state.plan = Some(plan);
        slot.state.active_step_id = None;
        slot.state.advance();
        slot.state.rebuild_step_sets();
        tracing::info!(
            session_id,
            added = diff.added.len(),
            removed = diff.removed.len(),
            retained = diff.retained.len(),
            "plan set"
        );
        self.commit(&mut slot).await;
        Ok(diff)
    }

    /// 标记完成并推进；对已完成的步骤重复调用为空操作
    pub async fn complete_step(
        &self,
        session_id: &str,
        step_id: &str,
        result: Option<String>,
    ) -> Result<PlanState, AgentError> {
        self.finish_step(session_id, step_id, StepStatus::Complete, result, None)
            .await
    }

    pub async fn fail_step(
        &self,
        session_id: &str,
        step_id: &str,
        error: &str,
    ) -> Result<PlanState, AgentError> {
        self.finish_step(
            session_id,
            step_id,
            StepStatus::Failed,
            None,
            Some(error.to_string()),
        )
        .await
    }

    pub async fn skip_step(
        &self,
        session_id: &str,
        step_id: &str,
        reason: Option<String>,
    ) -> Result<PlanState, AgentError> {
        self.finish_step(session_id, step_id, StepStatus::Skipped, None, reason)
            .await
    }

    async fn finish_step(
        &self,
        session_id: &str,
        step_id: &str,
        status: StepStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<PlanState, AgentError> {
        let mut slot = self.lock(session_id).await;
        let state = &mut slot.state;
        let plan = state
            .plan
            .as_mut()
            .ok_or_else(|| AgentError::NoActivePlan(session_id.to_string()))?;
        let step = plan
            .step_mut(step_id)
            .ok_or_else(|| AgentError::StepNotFound(step_id.to_string()))?;

        if step.status == status {
            return Ok(state.clone());
        }

        step.status = status;
        match status {
            StepStatus::Complete => {
                step.result = result;
                step.error = None;
            }
            _ => step.error = error,
        }
        if status == StepStatus::Failed {
            state.counters.total_errors += 1;
        }
        if state.active_step_id.as_deref() == Some(step_id) {
            state.active_step_id = None;
        }
        state.advance();
        state.rebuild_step_sets();

        tracing::debug!(session_id, step_id, status = ?status, next = ?state.active_step_id, "step finished");
        self.commit(&mut slot).await;
        Ok(slot.state.clone())
    }

    pub async fn record_tool_call(&self, session_id: &str) {
        let mut slot = self.lock(session_id).await;
        slot.state.counters.total_tool_calls += 1;
        self.commit(&mut slot).await;
    }

    pub async fn record_turn(&self, session_id: &str) {
        let mut slot = self.lock(session_id).await;
        slot.state.counters.turn_count += 1;
        self.commit(&mut slot).await;
    }

    pub async fn set_metadata(&self, session_id: &str, key: &str, value: serde_json::Value) {
        let mut slot = self.lock(session_id).await;
        slot.state.metadata.insert(key.to_string(), value);
        self.commit(&mut slot).await;
    }

    /// 整体替换状态（检查点恢复用）；保留当前的检查点索引
    pub async fn replace_state(&self, session_id: &str, mut state: PlanState) {
        let mut slot = self.lock(session_id).await;
        state.session_id = session_id.to_string();
        state.checkpoints = std::mem::take(&mut slot.state.checkpoints);
        state.advance();
        state.rebuild_step_sets();
        slot.state = state;
        self.commit(&mut slot).await;
    }

    /// 先落盘当前状态，再写检查点，最后把索引记入状态并按上限剪枝
    pub async fn create_checkpoint(
        &self,
        session_id: &str,
        options: CheckpointOptions,
    ) -> Result<Checkpoint, AgentError> {
        let mut slot = self.lock(session_id).await;
        if slot.dirty > 0 {
            self.write_state(&slot.state).await?;
            slot.dirty = 0;
        }
        let checkpoint = self
            .checkpoints
            .create_checkpoint(&slot.state, options)
            .await?;
        slot.state.checkpoints.push(checkpoint.to_ref());
        let max = self.checkpoints.max_per_session();
        let len = slot.state.checkpoints.len();
        if len > max {
            slot.state.checkpoints.drain(..len - max);
        }
        self.commit(&mut slot).await;
        Ok(checkpoint)
    }

    pub async fn create_manual_checkpoint(
        &self,
        session_id: &str,
        description: &str,
    ) -> Result<Checkpoint, AgentError> {
        self.create_checkpoint(
            session_id,
            CheckpointOptions::new(description, CheckpointTrigger::Manual),
        )
        .await
    }

    pub async fn restore_checkpoint(
        &self,
        session_id: &str,
        checkpoint_id: &str,
    ) -> Result<PlanState, AgentError> {
        let result = self
            .checkpoints
            .restore(session_id, Some(checkpoint_id))
            .await;
        match result.state {
            Some(state) if result.success => {
                self.replace_state(session_id, state).await;
                Ok(self.get_state(session_id).await)
            }
            _ => Err(AgentError::CheckpointNotFound(checkpoint_id.to_string())),
        }
    }

    /// 清空会话的计划状态（内存与存储）；检查点保留
    pub async fn clear(&self, session_id: &str) -> Result<(), AgentError> {
        let mut slot = self.slot(session_id).lock_owned().await;
        self.storage
            .delete(&StorageKey::session(PLAN_STATE_NAMESPACE, session_id))
            .await?;
        slot.state = PlanState::empty(session_id);
        slot.loaded = true;
        slot.dirty = 0;
        Ok(())
    }
}
