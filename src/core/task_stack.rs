//! 任务树
//!
//! Task 以 id 存放在扁平表中，父任务持有子任务 id 列表。叶子任务的状态变化会向上传播：
//! 所有子任务完成则父任务完成；没有子任务仍处于 pending / in_progress / blocked 时，
//! 至少一个成功则父任务完成，否则失败。
//!
//! 编排器把每个计划镜像为一个根任务（目标）加每步一个子任务，计划状态变化后同步过来。

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::plan::{StepStatus, TaskPlan};
use crate::core::AgentError;

const PLAN_ROOT_PREFIX: &str = "goal-v";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Blocked,
    Complete,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// 仍可能继续推进
    pub fn is_open(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Blocked)
    }
}

impl From<StepStatus> for TaskStatus {
    fn from(status: StepStatus) -> Self {
        match status {
            StepStatus::Pending => TaskStatus::Pending,
            StepStatus::Active => TaskStatus::InProgress,
            StepStatus::Complete => TaskStatus::Complete,
            StepStatus::Failed => TaskStatus::Failed,
            StepStatus::Skipped => TaskStatus::Skipped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// 越大越先执行
    pub priority: i32,
    /// 必须先 complete 的任务 id
    pub dependencies: Vec<String>,
    pub subtasks: Vec<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// 插入顺序，同优先级时用于排序
    seq: u64,
}

impl Task {
    pub fn is_leaf(&self) -> bool {
        self.subtasks.is_empty()
    }
}

/// 新任务参数
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub id: Option<String>,
    pub title: String,
    pub description: String,
    pub priority: i32,
    pub dependencies: Vec<String>,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStack {
    tasks: HashMap<String, Task>,
    roots: Vec<String>,
    next_seq: u64,
}

impl TaskStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn roots(&self) -> impl Iterator<Item = &Task> {
        self.roots.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn children(&self, id: &str) -> Vec<&Task> {
        self.tasks
            .get(id)
            .map(|t| t.subtasks.iter().filter_map(|c| self.tasks.get(c)).collect())
            .unwrap_or_default()
    }

    fn insert(&mut self, parent_id: Option<String>, new: NewTask) -> String {
        let id = new
            .id
            .filter(|id| !self.tasks.contains_key(id))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let task = Task {
            id: id.clone(),
            parent_id,
            title: new.title,
            description: new.description,
            status: TaskStatus::Pending,
            priority: new.priority,
            dependencies: new.dependencies,
            subtasks: Vec::new(),
            metadata: BTreeMap::new(),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.tasks.insert(id.clone(), task);
        id
    }

    pub fn add_root(&mut self, new: NewTask) -> String {
        let id = self.insert(None, new);
        self.roots.push(id.clone());
        id
    }

    pub fn add_subtask(&mut self, parent_id: &str, new: NewTask) -> Result<String, AgentError> {
        if !self.tasks.contains_key(parent_id) {
            return Err(AgentError::TaskNotFound(parent_id.to_string()));
        }
        let id = self.insert(Some(parent_id.to_string()), new);
        if let Some(parent) = self.tasks.get_mut(parent_id) {
            parent.subtasks.push(id.clone());
        }
        self.propagate_from(parent_id);
        Ok(id)
    }

    pub fn set_metadata(&mut self, id: &str, key: &str, value: serde_json::Value) -> Result<(), AgentError> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| AgentError::TaskNotFound(id.to_string()))?;
        task.metadata.insert(key.to_string(), value);
        Ok(())
    }

    /// 设置状态并向上传播
    pub fn set_status(&mut self, id: &str, status: TaskStatus) -> Result<(), AgentError> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| AgentError::TaskNotFound(id.to_string()))?;
        task.status = status;
        if let Some(parent) = task.parent_id.clone() {
            self.propagate_from(&parent);
        }
        Ok(())
    }

    /// 按子任务重新计算 id 及其祖先的状态
    fn propagate_from(&mut self, id: &str) {
        let mut current = Some(id.to_string());
        while let Some(id) = current {
            let Some(task) = self.tasks.get(&id) else { break };
            let children: Vec<TaskStatus> = task
                .subtasks
                .iter()
                .filter_map(|c| self.tasks.get(c).map(|t| t.status))
                .collect();
            let parent = task.parent_id.clone();
            if !children.is_empty() {
                let derived = if children.iter().all(|s| *s == TaskStatus::Complete) {
                    TaskStatus::Complete
                } else if children.iter().any(|s| s.is_open()) {
                    if children
                        .iter()
                        .any(|s| !matches!(s, TaskStatus::Pending | TaskStatus::Blocked))
                    {
                        TaskStatus::InProgress
                    } else {
                        TaskStatus::Pending
                    }
                } else if children.iter().any(|s| *s == TaskStatus::Complete) {
                    TaskStatus::Complete
                } else {
                    TaskStatus::Failed
                };
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.status = derived;
                }
            }
            current = parent;
        }
    }

    fn dependencies_complete(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|d| {
            self.tasks
                .get(d)
                .map(|t| t.status == TaskStatus::Complete)
                .unwrap_or(false)
        })
    }

    /// 依赖已完成、优先级最高的 pending 叶子任务；同优先级按插入顺序
    pub fn next_eligible(&self) -> Option<&Task> {
        self.tasks
            .values()
            .filter(|t| t.is_leaf() && t.status == TaskStatus::Pending && self.dependencies_complete(t))
            .min_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)))
    }

    /// 删除任务及其全部后代
    pub fn remove(&mut self, id: &str) -> Result<Task, AgentError> {
        let task = self
            .tasks
            .remove(id)
            .ok_or_else(|| AgentError::TaskNotFound(id.to_string()))?;
        for child in &task.subtasks {
            let _ = self.remove(child);
        }
        self.roots.retain(|r| r != id);
        if let Some(parent) = &task.parent_id {
            if let Some(p) = self.tasks.get_mut(parent) {
                p.subtasks.retain(|c| c != id);
            }
            self.propagate_from(parent);
        }
        Ok(task)
    }

    /// 把计划镜像为根任务 + 每步一个子任务（子任务 id = 步骤 id），返回根任务 id；
    /// 旧版本计划的镜像会被替换
    pub fn mirror_plan(&mut self, plan: &TaskPlan) -> String {
        let stale: Vec<String> = self
            .roots
            .iter()
            .filter(|id| id.starts_with(PLAN_ROOT_PREFIX))
            .cloned()
            .collect();
        for id in stale {
            let _ = self.remove(&id);
        }
        let root_id = format!("{PLAN_ROOT_PREFIX}{}", plan.version);
        let root = self.add_root(
            NewTask::new(plan.goal.clone())
                .with_id(root_id)
                .with_description(format!("{} steps", plan.steps.len())),
        );
        for step in &plan.steps {
            let new = NewTask::new(step.action.clone())
                .with_id(step.id.clone())
                .with_dependencies(step.depends_on.clone());
            if let Ok(id) = self.add_subtask(&root, new) {
                if let Some(tool) = &step.tool {
                    let _ = self.set_metadata(&id, "tool", serde_json::json!(tool));
                }
            }
        }
        self.sync_plan(&root, plan);
        root
    }

    /// 按计划步骤状态刷新镜像子任务
    pub fn sync_plan(&mut self, root_id: &str, plan: &TaskPlan) {
        for step in &plan.steps {
            if let Some(task) = self.tasks.get_mut(&step.id) {
                if task.parent_id.as_deref() == Some(root_id) {
                    task.status = step.status.into();
                }
            }
        }
        self.propagate_from(root_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_completes_when_all_children_complete() {
        let mut stack = TaskStack::new();
        let root = stack.add_root(NewTask::new("goal"));
        let a = stack.add_subtask(&root, NewTask::new("a")).unwrap();
        let b = stack.add_subtask(&root, NewTask::new("b")).unwrap();
        stack.set_status(&a, TaskStatus::Complete).unwrap();
        assert_eq!(stack.get(&root).unwrap().status, TaskStatus::InProgress);
        stack.set_status(&b, TaskStatus::Complete).unwrap();
        assert_eq!(stack.get(&root).unwrap().status, TaskStatus::Complete);
    }

    #[test]
    fn test_parent_outcome_when_nothing_open() {
        let mut stack = TaskStack::new();
        let root = stack.add_root(NewTask::new("goal"));
        let a = stack.add_subtask(&root, NewTask::new("a")).unwrap();
        let b = stack.add_subtask(&root, NewTask::new("b")).unwrap();
        stack.set_status(&a, TaskStatus::Failed).unwrap();
        stack.set_status(&b, TaskStatus::Complete).unwrap();
        assert_eq!(stack.get(&root).unwrap().status, TaskStatus::Complete);

        let other = stack.add_root(NewTask::new("other"));
        let c = stack.add_subtask(&other, NewTask::new("c")).unwrap();
        let d = stack.add_subtask(&other, NewTask::new("d")).unwrap();
        stack.set_status(&c, TaskStatus::Failed).unwrap();
        stack.set_status(&d, TaskStatus::Skipped).unwrap();
        assert_eq!(stack.get(&other).unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn test_propagates_through_levels() {
        let mut stack = TaskStack::new();
        let root = stack.add_root(NewTask::new("goal"));
        let mid = stack.add_subtask(&root, NewTask::new("mid")).unwrap();
        let leaf = stack.add_subtask(&mid, NewTask::new("leaf")).unwrap();
        stack.set_status(&leaf, TaskStatus::Complete).unwrap();
        assert_eq!(stack.get(&mid).unwrap().status, TaskStatus::Complete);
        assert_eq!(stack.get(&root).unwrap().status, TaskStatus::Complete);
    }

    #[test]
    fn test_next_eligible_priority_and_dependencies() {
        let mut stack = TaskStack::new();
        let root = stack.add_root(NewTask::new("goal"));
        let first = stack
            .add_subtask(&root, NewTask::new("first").with_id("first"))
            .unwrap();
        stack
            .add_subtask(
                &root,
                NewTask::new("urgent but blocked")
                    .with_priority(10)
                    .with_dependencies(vec!["first".into()]),
            )
            .unwrap();
        stack.add_subtask(&root, NewTask::new("second")).unwrap();

        assert_eq!(stack.next_eligible().unwrap().id, first);
        stack.set_status(&first, TaskStatus::Complete).unwrap();
        assert_eq!(stack.next_eligible().unwrap().title, "urgent but blocked");
    }

    #[test]
    fn test_mirror_plan_and_sync() {
        let mut plan = TaskPlan::from_actions("ship", ["build", "test"]);
        let mut stack = TaskStack::new();
        let root = stack.mirror_plan(&plan);
        assert_eq!(stack.children(&root).len(), 2);
        assert_eq!(stack.next_eligible().unwrap().id, "step-1");

        plan.steps[0].status = StepStatus::Complete;
        plan.steps[1].status = StepStatus::Failed;
        stack.sync_plan(&root, &plan);
        assert_eq!(stack.get(&root).unwrap().status, TaskStatus::Complete);

        stack.remove(&root).unwrap();
        assert!(stack.is_empty());
    }
}
