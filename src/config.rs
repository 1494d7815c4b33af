//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEELOOP__*` 覆盖（双下划线表示嵌套，如 `BEELOOP__RETRY__MAX_RETRIES=3`）。
//! 所有字段都有默认值，空配置即可运行；命令行等调用方可再用 ConfigOverrides 做类型化的局部覆盖。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::memory::MessageKind;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub plan: PlanSection,
    pub approval: ApprovalSection,
    pub retry: RetrySection,
    pub context: ContextSection,
    pub checkpoint: CheckpointSection,
    pub tracker: TrackerSection,
    pub orchestrator: OrchestratorSection,
}

/// 持久化后端
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    File,
    Memory,
    Sqlite,
}

/// [app] 段：应用名与状态目录
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    pub storage: StorageBackend,
    /// 文件后端的根目录 / SQLite 数据库所在目录
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            storage: StorageBackend::File,
            data_dir: PathBuf::from(".bee-loop"),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai（任意兼容端点）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub request_timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            request_timeout_secs: 60,
            max_tokens: 2048,
        }
    }
}

/// [tools] 段：工具超时与 Shell 白名单
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub shell: ShellSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            shell: ShellSection::default(),
        }
    }
}

/// [tools.shell] 段：允许执行的命令名（仅首词，如 ls、grep、cargo）
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShellSection {
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: ["ls", "grep", "cat", "head", "tail", "wc", "find", "echo", "cargo"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// [plan] 段
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PlanSection {
    /// 每 N 次修改落盘一次；1 表示每次修改都同步写入
    pub auto_save_every: usize,
}

impl Default for PlanSection {
    fn default() -> Self {
        Self { auto_save_every: 1 }
    }
}

/// 超时未决时的默认裁决
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    Approve,
    #[default]
    Deny,
}

/// 风险分级规则：tool 为工具名或 `*`；params_pattern 匹配序列化后的参数 JSON
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RiskRule {
    pub tool: String,
    #[serde(default)]
    pub params_pattern: Option<String>,
    pub tier: u8,
}

impl RiskRule {
    pub fn new(tool: impl Into<String>, tier: u8) -> Self {
        Self {
            tool: tool.into(),
            params_pattern: None,
            tier,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.params_pattern = Some(pattern.into());
        self
    }
}

/// [approval] 段：tier 0 直接放行，1 及以上需审批，达到 block_tier 直接拒绝
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApprovalSection {
    pub enabled: bool,
    /// 未匹配任何规则的工具
    pub default_tier: u8,
    pub block_tier: Option<u8>,
    pub timeout_ms: u64,
    pub timeout_policy: TimeoutPolicy,
    pub rules: Vec<RiskRule>,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            enabled: true,
            default_tier: 1,
            block_tier: None,
            timeout_ms: 300_000,
            timeout_policy: TimeoutPolicy::Deny,
            rules: vec![
                RiskRule::new("echo", 0),
                RiskRule::new("shell", 2),
                RiskRule::new("shell", 3).with_pattern(r"\brm\s+-rf\b"),
            ],
        }
    }
}

/// [retry] 段
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySection {
    /// 每个步骤允许的重试次数（不含首次尝试）
    pub max_retries: u32,
    /// 是否向 Planner 请求替代调用
    pub request_alternatives: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 2,
            request_alternatives: true,
        }
    }
}

/// [context] 段：token 预算与压缩策略
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ContextSection {
    pub max_tokens: usize,
    /// 使用率达到该比例时触发压缩
    pub threshold: f64,
    /// 每 N 次迭代强制检查一次；0 表示只按使用率
    pub manage_every_n_iterations: usize,
    /// 原样保留的最近消息数
    pub keep_recent: usize,
    /// 比最近 N 条更早的工具结果被丢弃
    pub tool_result_max_age: usize,
    /// 是否用 LLM 摘要被丢弃的区间
    pub summarize: bool,
    pub always_keep: Vec<MessageKind>,
    pub summary_max_tokens: u32,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_tokens: 8000,
            threshold: 0.8,
            manage_every_n_iterations: 10,
            keep_recent: 10,
            tool_result_max_age: 6,
            summarize: true,
            always_keep: vec![MessageKind::System, MessageKind::PlanState, MessageKind::Summary],
            summary_max_tokens: 512,
        }
    }
}

/// [checkpoint] 段
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CheckpointSection {
    pub max_checkpoints_per_session: usize,
    /// 定时检查点间隔（秒）；0 表示关闭
    pub interval_secs: u64,
    pub on_step_complete: bool,
    pub on_error: bool,
    /// 检查点附带的最近消息条数
    pub recent_messages: usize,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            max_checkpoints_per_session: 10,
            interval_secs: 300,
            on_step_complete: true,
            on_error: true,
            recent_messages: 8,
        }
    }
}

/// [tracker] 段
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerSection {
    /// 启发式置信度低于该值时才考虑 LLM 复核
    pub heuristic_threshold: f32,
    pub use_llm_verification: bool,
    /// 交给 LLM 的结果摘要最大字符数
    pub max_summary_chars: usize,
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            heuristic_threshold: 0.6,
            use_llm_verification: false,
            max_summary_chars: 800,
        }
    }
}

/// 反思策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionMode {
    #[default]
    Heuristic,
    Critic,
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 单轮最多迭代次数
    pub max_iterations_per_turn: usize,
    /// LLM 能力调用（规划 / 下一步 / 替代 / 摘要）超时（秒）
    pub capability_timeout_secs: u64,
    pub reflection: ReflectionMode,
    /// true 时需要审批的调用不在本轮等待，而是挂起到下一轮
    pub defer_approvals: bool,
    /// 目标至少有这么多词才请求 Planner 生成多步计划
    pub plan_min_words: usize,
    pub system_prompt: String,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_iterations_per_turn: 50,
            capability_timeout_secs: 60,
            reflection: ReflectionMode::Heuristic,
            defer_approvals: false,
            plan_min_words: 6,
            system_prompt: "You are Bee, an autonomous agent. Work through the active plan step by step. \
To call a tool reply with JSON {\"tool\": \"name\", \"args\": {...}}; when the step is done reply with plain text."
                .to_string(),
        }
    }
}

/// 类型化的局部覆盖（命令行参数等），只覆盖 Some 的字段
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub storage: Option<StorageBackend>,
    pub data_dir: Option<PathBuf>,
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub llm_base_url: Option<String>,
    pub auto_save_every: Option<usize>,
    pub max_retries: Option<u32>,
    pub approval_timeout_ms: Option<u64>,
    pub approval_timeout_policy: Option<TimeoutPolicy>,
    pub max_context_tokens: Option<usize>,
    pub max_checkpoints_per_session: Option<usize>,
    pub checkpoint_interval_secs: Option<u64>,
    pub max_iterations_per_turn: Option<usize>,
    pub reflection: Option<ReflectionMode>,
    pub defer_approvals: Option<bool>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(v) = self.storage {
            config.app.storage = v;
        }
        if let Some(v) = &self.data_dir {
            config.app.data_dir = v.clone();
        }
        if let Some(v) = &self.llm_provider {
            config.llm.provider = v.clone();
        }
        if let Some(v) = &self.llm_model {
            config.llm.model = v.clone();
        }
        if let Some(v) = &self.llm_base_url {
            config.llm.base_url = Some(v.clone());
        }
        if let Some(v) = self.auto_save_every {
            config.plan.auto_save_every = v;
        }
        if let Some(v) = self.max_retries {
            config.retry.max_retries = v;
        }
        if let Some(v) = self.approval_timeout_ms {
            config.approval.timeout_ms = v;
        }
        if let Some(v) = self.approval_timeout_policy {
            config.approval.timeout_policy = v;
        }
        if let Some(v) = self.max_context_tokens {
            config.context.max_tokens = v;
        }
        if let Some(v) = self.max_checkpoints_per_session {
            config.checkpoint.max_checkpoints_per_session = v;
        }
        if let Some(v) = self.checkpoint_interval_secs {
            config.checkpoint.interval_secs = v;
        }
        if let Some(v) = self.max_iterations_per_turn {
            config.orchestrator.max_iterations_per_turn = v;
        }
        if let Some(v) = self.reflection {
            config.orchestrator.reflection = v;
        }
        if let Some(v) = self.defer_approvals {
            config.orchestrator.defer_approvals = v;
        }
    }
}

/// 从 config 目录加载配置，环境变量 BEELOOP__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEELOOP__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEELOOP")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.plan.auto_save_every, 1);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.approval.timeout_policy, TimeoutPolicy::Deny);
        assert!(config.context.always_keep.contains(&MessageKind::PlanState));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bee.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
[retry]
max_retries = 5

[approval]
timeout_ms = 500
timeout_policy = "approve"

[[approval.rules]]
tool = "*"
params_pattern = "prod"
tier = 3

[orchestrator]
reflection = "critic"
"#
        )
        .unwrap();

        let config = load_config(Some(path)).unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert!(config.retry.request_alternatives);
        assert_eq!(config.approval.timeout_ms, 500);
        assert_eq!(config.approval.timeout_policy, TimeoutPolicy::Approve);
        assert_eq!(config.approval.rules.len(), 1);
        assert_eq!(config.approval.rules[0].tier, 3);
        assert_eq!(config.orchestrator.reflection, ReflectionMode::Critic);
        assert_eq!(config.context.max_tokens, 8000);
    }

    #[test]
    fn test_overrides_apply_only_set_fields() {
        let mut config = AppConfig::default();
        let overrides = ConfigOverrides {
            max_retries: Some(7),
            defer_approvals: Some(true),
            ..Default::default()
        };
        overrides.apply(&mut config);
        assert_eq!(config.retry.max_retries, 7);
        assert!(config.orchestrator.defer_approvals);
        assert_eq!(config.plan.auto_save_every, 1);
    }
}
