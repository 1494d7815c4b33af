//! Bee Loop - 增强型 Agent 循环
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量 + 类型化覆盖）
//! - **core**: 计划状态、状态机、审批闸门、重试、检查点、任务镜像与编排器
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock / 脚本化）
//! - **memory**: 对话历史、工作记忆、token 预算与持久化后端
//! - **observability**: 日志初始化
//! - **react**: Planner、步骤判定、反思策略、上下文管理与过程事件
//! - **tools**: 工具注册表、执行器与内置工具（echo、shell）

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use crate::core::{Orchestrator, OrchestratorBuilder, TurnResult};
