//! Orchestrator 构建器：从 AppConfig 显式构造各阶段组件
//!
//! 配置值逐项传入组件构造函数，不存在全局配置单例。未指定 LLM 时按配置与环境变量选择后端。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::{load_config, AppConfig};
use crate::core::error::AgentError;
use crate::core::events::{EventSink, SessionEvent};
use crate::core::orchestrator::{create_llm_from_config, Orchestrator};
use crate::llm::{LlmClient, RetryConfig, RetryingLlmClient};
use crate::memory::PlanLibrary;
use crate::plan::PlanNormalizer;
use crate::stages::{
    AnswerComposer, IntentClassifier, OutcomeEvaluator, PlanGenerator, Replanner, StepExecutor,
};
use crate::tools::{CalculatorTool, Tool, ToolExecutor, ToolRegistry};

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    tools: ToolRegistry,
    library: Option<PlanLibrary>,
    event_tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            tools: ToolRegistry::new(),
            library: None,
            event_tx: None,
        }
    }

    /// 按 load_config 的查找顺序加载配置；配置无法解析时返回 ConfigError
    pub fn from_config_path(config_path: Option<PathBuf>) -> Result<Self, AgentError> {
        Ok(Self::new(load_config(config_path)?))
    }

    /// 指定 LLM 客户端（测试中注入 MockLlmClient）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.register(tool);
        self
    }

    /// 注册内置工具（calculate）
    pub fn with_default_tools(self) -> Self {
        self.with_tool(CalculatorTool)
    }

    /// 共享的相似计划库；多个编排器可传入同一个库
    pub fn with_library(mut self, library: PlanLibrary) -> Self {
        self.library = Some(library);
        self
    }

    /// 订阅会话过程事件
    pub fn with_event_tx(mut self, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn build(self) -> Orchestrator {
        let cfg = self.config;
        // 注入的与按配置选择的客户端一样，每次调用都带超时与重试
        let backend = self.llm.unwrap_or_else(|| create_llm_from_config(&cfg));
        let llm: Arc<dyn LlmClient> = Arc::new(RetryingLlmClient::new(backend, RetryConfig::from(&cfg.llm)));
        let library = self.library.unwrap_or_default();

        let tools_schema = self.tools.to_schema_json();
        let known_tools = self.tools.tool_names();
        if known_tools.is_empty() {
            tracing::warn!("no tools registered, every step will be reasoning-only");
        }
        let tool_executor = Arc::new(ToolExecutor::with_timeout(
            self.tools,
            Duration::from_secs(cfg.tools.tool_timeout_secs),
        ));

        let generator = PlanGenerator::new(
            llm.clone(),
            PlanNormalizer::new(known_tools),
            tools_schema.clone(),
            cfg.planner.clone(),
        )
        .with_library(library.clone());
        let replanner = Replanner::new(llm.clone(), generator.normalizer().clone(), tools_schema)
            .with_limits(
                cfg.orchestrator.max_compensating_steps,
                cfg.orchestrator.result_preview_chars,
            );

        tracing::debug!(
            max_replan_count = cfg.orchestrator.max_replan_count,
            evaluator = ?cfg.evaluator.strategy,
            "orchestrator built"
        );

        Orchestrator {
            classifier: IntentClassifier::new(llm.clone()),
            generator,
            executor: StepExecutor::new(llm.clone(), tool_executor),
            evaluator: OutcomeEvaluator::new(llm.clone(), &cfg.evaluator),
            replanner,
            composer: AnswerComposer::new(llm, cfg.orchestrator.synthesize_answer),
            library,
            config: cfg.orchestrator,
            events: EventSink::new(self.event_tx),
        }
    }
}

/// 便捷函数：加载配置（失败时回退默认值）并注册内置工具
pub fn create_orchestrator_builder(config_path: Option<PathBuf>) -> OrchestratorBuilder {
    let config = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    OrchestratorBuilder::new(config).with_default_tools()
}
