//! 计划与会话状态的数据模型
//!
//! TaskPlan 是有序步骤列表（可带依赖）；PlanState 是每个会话唯一的持久记录，
//! 只能通过 PlanStateStore 修改。

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Active,
    Complete,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Complete | StepStatus::Failed | StepStatus::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    /// 步骤要做的事（自然语言）
    pub action: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<String>,
    /// 规划时预期使用的工具
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            status: StepStatus::Pending,
            result: None,
            tool: None,
            depends_on: Vec::new(),
            error: None,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub goal: String,
    pub steps: Vec<PlanStep>,
    /// 每次整体替换加一
    #[serde(default = "default_version")]
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl TaskPlan {
    pub fn new(goal: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            goal: goal.into(),
            steps,
            version: 1,
            created_at: Utc::now(),
        }
    }

    /// 按动作描述生成线性计划，id 为 step-1、step-2 …
    pub fn from_actions<I, S>(goal: impl Into<String>, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let steps = actions
            .into_iter()
            .enumerate()
            .map(|(i, a)| PlanStep::new(format!("step-{}", i + 1), a))
            .collect();
        Self::new(goal, steps)
    }

    /// 单步计划：目标本身即唯一步骤
    pub fn single_step(goal: impl Into<String>) -> Self {
        let goal = goal.into();
        Self::from_actions(goal.clone(), [goal])
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn step_ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    /// 依赖是否满足（complete 或 skipped 视为满足；未知 id 视为不满足）
    pub fn dependencies_satisfied(&self, step: &PlanStep) -> bool {
        step.depends_on.iter().all(|dep| {
            self.step(dep)
                .map(|d| matches!(d.status, StepStatus::Complete | StepStatus::Skipped))
                .unwrap_or(false)
        })
    }

    /// 计划顺序中第一个依赖已满足的 pending 步骤
    pub fn next_ready_step(&self) -> Option<&PlanStep> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Pending && self.dependencies_satisfied(s))
    }

    /// 所有步骤都已终结
    pub fn is_finished(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    /// 依赖失败的 pending 步骤永远不会就绪，标记为 skipped；返回被跳过的 id
    pub fn skip_unreachable(&mut self) -> Vec<String> {
        let mut skipped = Vec::new();
        loop {
            let blocked: HashSet<String> = self
                .steps
                .iter()
                .filter(|s| matches!(s.status, StepStatus::Failed))
                .map(|s| s.id.clone())
                .chain(skipped.iter().cloned())
                .collect();
            let mut changed = false;
            for step in self.steps.iter_mut() {
                if step.status != StepStatus::Pending {
                    continue;
                }
                if let Some(dep) = step.depends_on.iter().find(|d| blocked.contains(*d)) {
                    step.status = StepStatus::Skipped;
                    step.error = Some(format!("dependency {dep} did not complete"));
                    skipped.push(step.id.clone());
                    changed = true;
                }
            }
            if !changed {
                return skipped;
            }
        }
    }
}

/// set_plan 的替换差异
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlanDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub retained: Vec<String>,
}

impl PlanDiff {
    pub fn between(old: Option<&TaskPlan>, new: &TaskPlan) -> Self {
        let old_ids: Vec<String> = old.map(TaskPlan::step_ids).unwrap_or_default();
        let new_ids = new.step_ids();
        Self {
            added: new_ids.iter().filter(|id| !old_ids.contains(id)).cloned().collect(),
            removed: old_ids.iter().filter(|id| !new_ids.contains(id)).cloned().collect(),
            retained: new_ids.iter().filter(|id| old_ids.contains(id)).cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanCounters {
    pub turn_count: u64,
    pub total_tool_calls: u64,
    pub total_errors: u64,
    pub last_activity: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl Default for PlanCounters {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            turn_count: 0,
            total_tool_calls: 0,
            total_errors: 0,
            last_activity: now,
            started_at: now,
        }
    }
}

/// 检查点触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTrigger {
    Manual,
    Auto,
    Interval,
    Error,
}

/// PlanState 中记录的检查点索引项（完整数据在 CheckpointManager 的存储里）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub trigger: CheckpointTrigger,
    pub step_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanProgress {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
    pub percent: f32,
}

/// 会话的持久状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanState {
    pub session_id: String,
    pub plan: Option<TaskPlan>,
    pub active_step_id: Option<String>,
    #[serde(default)]
    pub completed_step_ids: BTreeSet<String>,
    #[serde(default)]
    pub failed_step_ids: BTreeSet<String>,
    #[serde(default)]
    pub counters: PlanCounters,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointRef>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl PlanState {
    pub fn empty(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            plan: None,
            active_step_id: None,
            completed_step_ids: BTreeSet::new(),
            failed_step_ids: BTreeSet::new(),
            counters: PlanCounters::default(),
            checkpoints: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn has_active_plan(&self) -> bool {
        self.plan.as_ref().map(|p| !p.is_finished()).unwrap_or(false)
    }

    pub fn active_step(&self) -> Option<&PlanStep> {
        let id = self.active_step_id.as_deref()?;
        self.plan.as_ref()?.step(id)
    }

    pub fn is_complete(&self) -> bool {
        self.plan.as_ref().map(TaskPlan::is_finished).unwrap_or(false)
    }

    pub fn progress(&self) -> PlanProgress {
        let Some(plan) = &self.plan else {
            return PlanProgress {
                completed: 0,
                failed: 0,
                skipped: 0,
                total: 0,
                percent: 0.0,
            };
        };
        let count = |status| plan.steps.iter().filter(|s| s.status == status).count();
        let completed = count(StepStatus::Complete);
        let failed = count(StepStatus::Failed);
        let skipped = count(StepStatus::Skipped);
        let total = plan.steps.len();
        let percent = if total == 0 {
            0.0
        } else {
            (completed + failed + skipped) as f32 / total as f32 * 100.0
        };
        PlanProgress {
            completed,
            failed,
            skipped,
            total,
            percent,
        }
    }

    /// active_step_id 为空，或指向唯一一个 active 步骤
    pub fn check_invariant(&self) -> bool {
        let Some(plan) = &self.plan else {
            return self.active_step_id.is_none();
        };
        let active: Vec<&PlanStep> = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Active)
            .collect();
        match &self.active_step_id {
            None => active.is_empty(),
            Some(id) => active.len() == 1 && &active[0].id == id,
        }
    }

    /// 从步骤状态重建 completed / failed 集合
    pub(crate) fn rebuild_step_sets(&mut self) {
        self.completed_step_ids.clear();
        self.failed_step_ids.clear();
        if let Some(plan) = &self.plan {
            for step in &plan.steps {
                match step.status {
                    StepStatus::Complete => {
                        self.completed_step_ids.insert(step.id.clone());
                    }
                    StepStatus::Failed => {
                        self.failed_step_ids.insert(step.id.clone());
                    }
                    _ => {}
                }
            }
        }
    }

    /// 保证至多一个 active 步骤；当前没有 active 时推进到下一个就绪步骤
    pub(crate) fn advance(&mut self) {
        let Some(plan) = self.plan.as_mut() else {
            self.active_step_id = None;
            return;
        };

        let current = self
            .active_step_id
            .as_deref()
            .and_then(|id| plan.step(id))
            .filter(|s| s.status == StepStatus::Active)
            .map(|s| s.id.clone());

        // 多余的 active 步骤降级为 pending
        for step in plan.steps.iter_mut() {
            if step.status == StepStatus::Active && Some(&step.id) != current.as_ref() {
                step.status = StepStatus::Pending;
            }
        }

        if current.is_some() {
            self.active_step_id = current;
            return;
        }

        plan.skip_unreachable();
        let next = plan.next_ready_step().map(|s| s.id.clone());
        if let Some(id) = &next {
            if let Some(step) = plan.step_mut(id) {
                step.status = StepStatus::Active;
            }
        }
        self.active_step_id = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(plan: TaskPlan) -> PlanState {
        let mut s = PlanState::empty("s");
        s.plan = Some(plan);
        s.advance();
        s
    }

    #[test]
    fn test_advance_activates_first_pending() {
        let s = state_with(TaskPlan::from_actions("g", ["a", "b"]));
        assert_eq!(s.active_step_id.as_deref(), Some("step-1"));
        assert!(s.check_invariant());
    }

    #[test]
    fn test_advance_honors_dependencies() {
        let plan = TaskPlan::new(
            "g",
            vec![
                PlanStep::new("b", "second").with_depends_on(vec!["a".into()]),
                PlanStep::new("a", "first"),
            ],
        );
        let s = state_with(plan);
        assert_eq!(s.active_step_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_failed_dependency_skips_dependents() {
        let mut plan = TaskPlan::new(
            "g",
            vec![
                PlanStep::new("a", "first"),
                PlanStep::new("b", "second").with_depends_on(vec!["a".into()]),
                PlanStep::new("c", "third").with_depends_on(vec!["b".into()]),
            ],
        );
        plan.steps[0].status = StepStatus::Failed;
        let s = state_with(plan);
        assert!(s.active_step_id.is_none());
        let p = s.progress();
        assert_eq!((p.failed, p.skipped, p.total), (1, 2, 3));
        assert!(s.is_complete());
    }

    #[test]
    fn test_plan_diff() {
        let old = TaskPlan::from_actions("g", ["a", "b"]);
        let new = TaskPlan::from_actions("g", ["a", "b", "c"]);
        let diff = PlanDiff::between(Some(&old), &new);
        assert_eq!(diff.added, vec!["step-3"]);
        assert!(diff.removed.is_empty());
        assert_eq!(diff.retained.len(), 2);
    }

    #[test]
    fn test_state_serde_round_trip() {
        let mut s = state_with(TaskPlan::from_actions("g", ["a"]));
        s.metadata.insert("k".into(), serde_json::json!({"n": 1}));
        let json = serde_json::to_string(&s).unwrap();
        let back: PlanState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
