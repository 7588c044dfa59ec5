//! planloop - 计划 → 执行 → 评估 → 重规划 的有界编排循环
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话状态、错误分类、过程事件、状态机驱动（Orchestrator）与构建器
//! - **llm**: 推理能力抽象与实现（OpenAI 兼容 / Mock），能力边界上的超时与重试
//! - **memory**: 会话消息记录与相似计划库
//! - **observability**: tracing 初始化
//! - **plan**: Plan / Step 数据模型、线格式、容错解析、校验与规范化、依赖图
//! - **stages**: 意图识别、计划生成、步骤执行、结果评估、重规划、答案合成
//! - **tools**: 工具抽象、注册表、带超时与审计日志的执行器、内置计算器

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod plan;
pub mod stages;
pub mod tools;

pub use crate::core::{AgentError, Orchestrator, OrchestratorBuilder, SessionOutcome, SessionReport};
pub use crate::plan::{Plan, Step};
