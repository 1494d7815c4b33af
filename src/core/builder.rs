//! 编排器构建器：统一的组件初始化逻辑
//!
//! 所有组件只在这里构造一次，再注入 Orchestrator；没有全局单例。
//! 未显式提供的组件按配置创建：存储后端、LLM（有 OPENAI_API_KEY 时走兼容端点，否则 Mock）、
//! 工具注册表（echo + shell）、审批通道（只写日志）、反思策略。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::{AppConfig, ReflectionMode, StorageBackend};
use crate::core::approval::{ApprovalChannel, ApprovalGate, LogApprovalChannel};
use crate::core::checkpoint::CheckpointManager;
use crate::core::orchestrator::Orchestrator;
use crate::core::plan_state::PlanStateStore;
use crate::core::retry::RetryEngine;
use crate::core::session_supervisor::SessionSupervisor;
use crate::core::AgentError;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::{FileStorage, MemoryStorage, SqliteStorage, StateStorage, StorageError};
use crate::react::{
    CriticReflection, HeuristicReflection, LoopEvent, Planner, ReflectionPolicy, StepTracker,
    Summarizer,
};
use crate::tools::{EchoTool, RegistryExecutor, ShellTool, ToolExecutor, ToolRegistry};

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    if provider == "mock" {
        tracing::info!("Using Mock LLM");
        return Arc::new(MockLlmClient);
    }
    match std::env::var("OPENAI_API_KEY") {
        Ok(key) if !key.is_empty() => {
            tracing::info!(model = %cfg.llm.model, "Using OpenAI-compatible LLM");
            Arc::new(
                OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, Some(&key))
                    .with_default_max_tokens(cfg.llm.max_tokens),
            )
        }
        _ => {
            tracing::warn!("No API key set, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    }
}

pub struct OrchestratorBuilder {
    config: AppConfig,
    storage: Option<Arc<dyn StateStorage>>,
    llm: Option<Arc<dyn LlmClient>>,
    executor: Option<Arc<dyn ToolExecutor>>,
    approval_channel: Option<Arc<dyn ApprovalChannel>>,
    reflection: Option<Arc<dyn ReflectionPolicy>>,
    events: Option<mpsc::UnboundedSender<LoopEvent>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            storage: None,
            llm: None,
            executor: None,
            approval_channel: None,
            reflection: None,
            events: None,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn StateStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_approval_channel(mut self, channel: Arc<dyn ApprovalChannel>) -> Self {
        self.approval_channel = Some(channel);
        self
    }

    pub fn with_reflection(mut self, policy: Arc<dyn ReflectionPolicy>) -> Self {
        self.reflection = Some(policy);
        self
    }

    /// 过程事件发送端（流式展示用）
    pub fn with_event_sender(mut self, tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 按 [app].storage 创建持久化后端
    pub fn build_storage(&self) -> Result<Arc<dyn StateStorage>, AgentError> {
        let dir = &self.config.app.data_dir;
        let storage: Arc<dyn StateStorage> = match self.config.app.storage {
            StorageBackend::File => Arc::new(FileStorage::new(dir)),
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
            StorageBackend::Sqlite => {
                std::fs::create_dir_all(dir).map_err(StorageError::from)?;
                Arc::new(SqliteStorage::open(dir.join("state.db"))?)
            }
        };
        Ok(storage)
    }

    /// 内置工具：echo 与白名单 shell
    pub fn build_tool_registry(&self) -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        tools.register(ShellTool::from_config(
            &self.config.tools.shell,
            Duration::from_secs(self.config.tools.tool_timeout_secs),
        ));
        tools
    }

    /// 系统提示词附带工具列表
    fn build_system_prompt(&self, tool_section: &str) -> String {
        let base = &self.config.orchestrator.system_prompt;
        if tool_section.is_empty() {
            base.clone()
        } else {
            format!("{base}\n\n{tool_section}")
        }
    }

    pub fn build(self) -> Result<Orchestrator, AgentError> {
        let config = self.config.clone();
        let capability_timeout = Duration::from_secs(config.orchestrator.capability_timeout_secs);

        let storage = match self.storage.clone() {
            Some(s) => s,
            None => self.build_storage()?,
        };
        let llm = self
            .llm
            .clone()
            .unwrap_or_else(|| create_llm_from_config(&config));

        let (executor, tool_section): (Arc<dyn ToolExecutor>, String) = match self.executor.clone() {
            Some(executor) => {
                let names = executor.tool_names();
                let section = if names.is_empty() {
                    String::new()
                } else {
                    format!("## Available tools\n{}", names.join(", "))
                };
                (executor, section)
            }
            None => {
                let registry = self.build_tool_registry();
                let section = registry.prompt_section();
                let timeout = Duration::from_secs(config.tools.tool_timeout_secs);
                (Arc::new(RegistryExecutor::new(registry, timeout)) as Arc<dyn ToolExecutor>, section)
            }
        };
        let system_prompt = self.build_system_prompt(&tool_section);

        let planner = Arc::new(
            Planner::new(llm.clone(), system_prompt)
                .with_timeout(capability_timeout)
                .with_max_tokens(config.llm.max_tokens)
                .with_plan_min_words(config.orchestrator.plan_min_words),
        );

        let checkpoints = Arc::new(CheckpointManager::new(
            storage.clone(),
            config.checkpoint.max_checkpoints_per_session,
        ));
        let store = Arc::new(PlanStateStore::new(
            storage,
            checkpoints.clone(),
            config.plan.auto_save_every,
        ));

        let channel = self
            .approval_channel
            .clone()
            .unwrap_or_else(|| Arc::new(LogApprovalChannel));
        let gate = Arc::new(ApprovalGate::from_config(&config.approval, channel)?);

        let retry = RetryEngine::new(config.retry.max_retries)
            .with_alternative_source(planner.clone())
            .with_request_alternatives(config.retry.request_alternatives);

        let tracker = StepTracker::new(config.tracker.clone(), Some(llm.clone()))
            .with_timeout(capability_timeout);

        let reflection: Arc<dyn ReflectionPolicy> = match self.reflection.clone() {
            Some(policy) => policy,
            None => match config.orchestrator.reflection {
                ReflectionMode::Heuristic => Arc::new(HeuristicReflection),
                ReflectionMode::Critic => {
                    Arc::new(CriticReflection::new(llm.clone()).with_timeout(capability_timeout))
                }
            },
        };

        let summarizer = Summarizer::new(
            config.context.summarize.then(|| llm.clone()),
            capability_timeout,
            config.context.summary_max_tokens,
        );

        Ok(Orchestrator {
            config,
            store,
            checkpoints,
            planner,
            executor,
            gate,
            retry,
            tracker,
            reflection,
            summarizer,
            supervisor: SessionSupervisor::new(),
            events: self.events,
            sessions: Mutex::new(HashMap::new()),
        })
    }
}
