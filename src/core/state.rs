//! Agent 状态机
//!
//! 显式的阶段模型：idle → planning → executing → reflecting → …；非法转移返回 InvalidTransition，
//! 从不静默忽略。每次转移记录带时间戳的历史、累计各状态停留时长，并同步通知订阅者；
//! 订阅者返回的错误或 panic 只记日志，不影响主循环。
//!
//! 状态机是纯内存对象，serialize / restore 只涉及当前状态、元数据与历史，持久记录以 PlanState 为准。

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;

pub type StateMetadata = BTreeMap<String, serde_json::Value>;

/// 循环阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Planning,
    Executing,
    Reflecting,
    Replanning,
    WaitingHuman,
    Recovering,
    Completing,
    Error,
    Complete,
}

impl AgentState {
    pub const ALL: [AgentState; 10] = [
        AgentState::Idle,
        AgentState::Planning,
        AgentState::Executing,
        AgentState::Reflecting,
        AgentState::Replanning,
        AgentState::WaitingHuman,
        AgentState::Recovering,
        AgentState::Completing,
        AgentState::Error,
        AgentState::Complete,
    ];

    /// 转移表
    pub fn allowed_transitions(self) -> &'static [AgentState] {
        use AgentState::*;
        match self {
            Idle => &[Planning],
            Planning => &[Executing, Error],
            Executing => &[Reflecting, WaitingHuman, Recovering, Completing],
            Reflecting => &[Executing, Replanning, Completing],
            Replanning => &[Executing, Error],
            WaitingHuman => &[Executing, Planning, Completing, Idle],
            Recovering => &[Executing, Replanning, Error],
            Completing => &[Idle],
            Error => &[Idle],
            Complete => &[Idle],
        }
    }

    pub fn can_transition_to(self, to: AgentState) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Planning => "planning",
            AgentState::Executing => "executing",
            AgentState::Reflecting => "reflecting",
            AgentState::Replanning => "replanning",
            AgentState::WaitingHuman => "waiting_human",
            AgentState::Recovering => "recovering",
            AgentState::Completing => "completing",
            AgentState::Error => "error",
            AgentState::Complete => "complete",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次已接受的转移
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: AgentState,
    pub to: AgentState,
    pub trigger: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: StateMetadata,
}

/// 状态机上下文（可序列化供外部展示）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStateContext {
    pub state: AgentState,
    pub previous_state: Option<AgentState>,
    pub entered_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: StateMetadata,
    #[serde(default)]
    pub history: Vec<StateTransition>,
}

impl Default for AgentStateContext {
    fn default() -> Self {
        Self {
            state: AgentState::Idle,
            previous_state: None,
            entered_at: Utc::now(),
            metadata: StateMetadata::new(),
            history: Vec::new(),
        }
    }
}

/// 转移订阅者：在转移完成后同步调用
pub trait TransitionObserver: Send + Sync {
    fn on_transition(
        &self,
        transition: &StateTransition,
        context: &AgentStateContext,
    ) -> anyhow::Result<()>;
}

/// 某状态的累计停留时长与进入次数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateDuration {
    pub total_ms: i64,
    pub entries: u32,
}

/// 订阅句柄，用于取消订阅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

pub struct AgentStateMachine {
    context: AgentStateContext,
    observers: Vec<(ObserverId, Arc<dyn TransitionObserver>)>,
    next_observer_id: u64,
    durations: HashMap<AgentState, StateDuration>,
}

impl AgentStateMachine {
    pub fn new() -> Self {
        let mut durations = HashMap::new();
        durations.insert(
            AgentState::Idle,
            StateDuration {
                total_ms: 0,
                entries: 1,
            },
        );
        Self {
            context: AgentStateContext::default(),
            observers: Vec::new(),
            next_observer_id: 0,
            durations,
        }
    }

    pub fn state(&self) -> AgentState {
        self.context.state
    }

    pub fn previous_state(&self) -> Option<AgentState> {
        self.context.previous_state
    }

    pub fn context(&self) -> &AgentStateContext {
        &self.context
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.context.history
    }

    pub fn history_len(&self) -> usize {
        self.context.history.len()
    }

    pub fn can_transition(&self, to: AgentState) -> bool {
        self.context.state.can_transition_to(to)
    }

    pub fn subscribe(&mut self, observer: Arc<dyn TransitionObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer_id);
        self.next_observer_id += 1;
        self.observers.push((id, observer));
        id
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    /// 执行转移；不在转移表中的目标返回 InvalidTransition，状态保持不变
    pub fn transition(
        &mut self,
        to: AgentState,
        trigger: &str,
        metadata: Option<StateMetadata>,
    ) -> Result<StateTransition, AgentError> {
        let from = self.context.state;
        if !from.can_transition_to(to) {
            return Err(AgentError::InvalidTransition { from, to });
        }

        let now = Utc::now();
        let elapsed = (now - self.context.entered_at).num_milliseconds().max(0);
        self.durations.entry(from).or_default().total_ms += elapsed;
        self.durations.entry(to).or_default().entries += 1;

        let metadata = metadata.unwrap_or_default();
        let transition = StateTransition {
            from,
            to,
            trigger: trigger.to_string(),
            at: now,
            metadata: metadata.clone(),
        };
        self.context.previous_state = Some(from);
        self.context.state = to;
        self.context.entered_at = now;
        self.context.metadata = metadata;
        self.context.history.push(transition.clone());

        tracing::debug!(from = %from, to = %to, trigger, "state transition");
        self.notify(&transition);
        Ok(transition)
    }

    fn notify(&self, transition: &StateTransition) {
        for (id, observer) in &self.observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                observer.on_transition(transition, &self.context)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(observer = id.0, error = %e, "transition observer failed");
                }
                Err(_) => {
                    tracing::warn!(observer = id.0, "transition observer panicked");
                }
            }
        }
    }

    /// 各状态累计时长（含当前状态尚未结束的部分）
    pub fn durations(&self) -> HashMap<AgentState, StateDuration> {
        let mut out = self.durations.clone();
        let current = (Utc::now() - self.context.entered_at).num_milliseconds().max(0);
        out.entry(self.context.state).or_default().total_ms += current;
        out
    }

    pub fn serialize(&self) -> Result<String, AgentError> {
        Ok(serde_json::to_string(&self.context)?)
    }

    /// 从 serialize 的输出恢复；订阅者保留，时长统计重新开始
    pub fn restore(&mut self, data: &str) -> Result<(), AgentError> {
        let context: AgentStateContext = serde_json::from_str(data)?;
        self.durations.clear();
        self.durations.entry(context.state).or_default().entries += 1;
        self.context = context;
        Ok(())
    }
}

impl Default for AgentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 直接把状态机放到某个状态（绕过转移表，仅测试用）
    fn machine_at(state: AgentState) -> AgentStateMachine {
        let mut m = AgentStateMachine::new();
        m.context.state = state;
        m
    }

    #[test]
    fn test_every_pair_matches_table() {
        let mut accepted = 0;
        for from in AgentState::ALL {
            for to in AgentState::ALL {
                let mut m = machine_at(from);
                let result = m.transition(to, "test", None);
                if from.allowed_transitions().contains(&to) {
                    assert!(result.is_ok(), "{from} -> {to} should be allowed");
                    accepted += 1;
                    assert_eq!(m.state(), to);
                    assert_eq!(m.history().len(), 1);
                } else {
                    match result {
                        Err(AgentError::InvalidTransition { from: f, to: t }) => {
                            assert_eq!((f, t), (from, to));
                        }
                        other => panic!("{from} -> {to} should be rejected, got {other:?}"),
                    }
                    assert_eq!(m.state(), from);
                    assert!(m.history().is_empty());
                }
            }
        }
        assert_eq!(accepted, 22);
    }

    #[test]
    fn test_history_counts_only_accepted() {
        let mut m = AgentStateMachine::new();
        m.transition(AgentState::Planning, "goal", None).unwrap();
        assert!(m.transition(AgentState::Completing, "bad", None).is_err());
        m.transition(AgentState::Executing, "plan ready", None).unwrap();
        m.transition(AgentState::Reflecting, "step done", None).unwrap();
        assert!(m.transition(AgentState::Idle, "bad", None).is_err());
        m.transition(AgentState::Completing, "no steps left", None).unwrap();
        m.transition(AgentState::Idle, "done", None).unwrap();
        assert_eq!(m.history().len(), 5);
        assert_eq!(m.previous_state(), Some(AgentState::Completing));
        assert_eq!(m.history()[1].trigger, "plan ready");
    }

    struct Counting(AtomicUsize);

    impl TransitionObserver for Counting {
        fn on_transition(&self, _: &StateTransition, _: &AgentStateContext) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    impl TransitionObserver for Failing {
        fn on_transition(&self, _: &StateTransition, _: &AgentStateContext) -> anyhow::Result<()> {
            anyhow::bail!("observer broke")
        }
    }

    struct Panicking;

    impl TransitionObserver for Panicking {
        fn on_transition(&self, _: &StateTransition, _: &AgentStateContext) -> anyhow::Result<()> {
            panic!("observer panicked")
        }
    }

    #[test]
    fn test_observer_failures_do_not_propagate() {
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        let mut m = AgentStateMachine::new();
        m.subscribe(Arc::new(Failing));
        m.subscribe(Arc::new(Panicking));
        let id = m.subscribe(counter.clone());

        m.transition(AgentState::Planning, "goal", None).unwrap();
        m.transition(AgentState::Executing, "plan", None).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);

        assert!(m.unsubscribe(id));
        m.transition(AgentState::Completing, "done", None).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_serialize_restore() {
        let mut m = AgentStateMachine::new();
        let mut meta = StateMetadata::new();
        meta.insert("step".to_string(), serde_json::json!("s1"));
        m.transition(AgentState::Planning, "goal", None).unwrap();
        m.transition(AgentState::Executing, "plan", Some(meta)).unwrap();
        let data = m.serialize().unwrap();

        let mut restored = AgentStateMachine::new();
        restored.restore(&data).unwrap();
        assert_eq!(restored.context(), m.context());
        assert_eq!(restored.state(), AgentState::Executing);
        assert_eq!(restored.context().metadata["step"], "s1");
        // 恢复后继续按转移表运行
        restored.transition(AgentState::Reflecting, "step", None).unwrap();
        assert_eq!(restored.history().len(), 3);
    }

    #[test]
    fn test_durations_count_entries() {
        let mut m = AgentStateMachine::new();
        m.transition(AgentState::Planning, "a", None).unwrap();
        m.transition(AgentState::Executing, "b", None).unwrap();
        m.transition(AgentState::Reflecting, "c", None).unwrap();
        m.transition(AgentState::Executing, "d", None).unwrap();
        let durations = m.durations();
        assert_eq!(durations[&AgentState::Executing].entries, 2);
        assert_eq!(durations[&AgentState::Idle].entries, 1);
        assert!(durations[&AgentState::Idle].total_ms >= 0);
    }
}
