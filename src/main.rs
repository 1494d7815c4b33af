//! Bee Loop 命令行入口
//!
//! 用法：bee-loop [OPTIONS] <GOAL>...（bee-loop --help 查看全部选项）
//! 初始化日志、加载配置、构建编排器并执行一轮，最后把 TurnResult 以 JSON 打印到标准输出。
//! Ctrl+C 取消当前会话（计划保持可恢复）。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bee_loop::config::{load_config, AppConfig, ConfigOverrides, ReflectionMode, StorageBackend};
use bee_loop::core::{ApprovalDecision, MpscApprovalChannel, OrchestratorBuilder};
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "bee-loop")]
#[command(version)]
#[command(about = "Run one turn of the Bee agent loop for a goal.", long_about = None)]
struct Cli {
    /// Extra TOML config file (layered over config/default.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "default")]
    session: String,

    #[arg(long, value_enum)]
    storage: Option<StorageArg>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// LLM provider (openai / mock)
    #[arg(long)]
    provider: Option<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    max_retries: Option<u32>,

    #[arg(long)]
    max_iterations: Option<usize>,

    #[arg(long, value_enum)]
    reflection: Option<ReflectionArg>,

    /// Return pending approvals instead of waiting for them
    #[arg(long)]
    defer_approvals: bool,

    /// Discard the session's saved plan and checkpoints before running
    #[arg(long)]
    reset: bool,

    #[arg(required = true)]
    goal: Vec<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StorageArg {
    File,
    Memory,
    Sqlite,
}

impl From<StorageArg> for StorageBackend {
    fn from(arg: StorageArg) -> Self {
        match arg {
            StorageArg::File => StorageBackend::File,
            StorageArg::Memory => StorageBackend::Memory,
            StorageArg::Sqlite => StorageBackend::Sqlite,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ReflectionArg {
    Heuristic,
    Critic,
}

impl From<ReflectionArg> for ReflectionMode {
    fn from(arg: ReflectionArg) -> Self {
        match arg {
            ReflectionArg::Heuristic => ReflectionMode::Heuristic,
            ReflectionArg::Critic => ReflectionMode::Critic,
        }
    }
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            storage: self.storage.map(Into::into),
            data_dir: self.data_dir.clone(),
            llm_provider: self.provider.clone(),
            llm_model: self.model.clone(),
            max_retries: self.max_retries,
            max_iterations_per_turn: self.max_iterations,
            reflection: self.reflection.map(Into::into),
            defer_approvals: self.defer_approvals.then_some(true),
            ..ConfigOverrides::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bee_loop::observability::init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    cli.overrides().apply(&mut config);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (channel, mut approvals_rx) = MpscApprovalChannel::new();
    let orchestrator = Arc::new(
        OrchestratorBuilder::new(config)
            .with_approval_channel(Arc::new(channel))
            .with_event_sender(events_tx)
            .build()
            .context("Failed to build orchestrator")?,
    );

    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                tracing::debug!(event = %line, "loop event");
            }
        }
    });

    // 命令行没有交互式审批：在标准错误提示后按 BEELOOP_AUTO_APPROVE 裁决，否则交给超时策略
    let auto_approve = std::env::var("BEELOOP_AUTO_APPROVE").is_ok_and(|v| v == "1");
    let approver = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        while let Some(request) = approvals_rx.recv().await {
            eprintln!(
                "approval required: {} (tier {}) {}",
                request.tool_call.tool, request.tier, request.args_summary
            );
            if auto_approve {
                approver.resolve_approval(&request.id, ApprovalDecision::Approve);
            }
        }
    });

    let canceller = Arc::clone(&orchestrator);
    let session = cli.session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(session_id = %session, "interrupt received, cancelling session");
            canceller.cancel(&session);
        }
    });

    if cli.reset {
        orchestrator
            .reset_session(&cli.session)
            .await
            .context("Failed to reset session")?;
    }

    let result = orchestrator
        .run_turn(&cli.session, &cli.goal.join(" "))
        .await
        .context("Turn failed")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
