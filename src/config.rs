//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PLANLOOP__*` 覆盖
//! （双下划线表示嵌套，如 `PLANLOOP__ORCHESTRATOR__MAX_REPLAN_COUNT=3`）。
//! 配置值显式传入各组件构造函数，不存在全局单例。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub planner: PlannerConfig,
    pub evaluator: EvaluatorConfig,
    pub orchestrator: OrchestratorConfig,
}

/// [app] 段
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择、模型与能力边界上的超时重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai（需要 OPENAI_API_KEY）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub timeouts: LlmTimeoutsSection,
    pub retry: LlmRetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            temperature: 0.1,
            timeouts: LlmTimeoutsSection::default(),
            retry: LlmRetrySection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmRetrySection {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for LlmRetrySection {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 500,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
        }
    }
}

/// [planner] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// LLM 未给出置信度时使用
    pub default_confidence: f64,
    /// 应急计划置信度，实际使用时夹到 [0.3, 0.5]
    pub emergency_confidence: f64,
    /// 应急计划使用的通用工具（须已注册，否则应急步骤为纯推理）
    pub fallback_tool: Option<String>,
    pub max_similar_plans: usize,
    pub min_estimated_duration_secs: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            default_confidence: 0.7,
            emergency_confidence: 0.4,
            fallback_tool: None,
            max_similar_plans: 2,
            min_estimated_duration_secs: 10.0,
        }
    }
}

/// 评估策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluatorStrategy {
    #[default]
    Heuristic,
    Llm,
}

/// [evaluator] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub strategy: EvaluatorStrategy,
    /// 结果文本中出现即视为失败的标记（大小写不敏感）
    pub failure_markers: Vec<String>,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            strategy: EvaluatorStrategy::Heuristic,
            failure_markers: [
                "error", "failed", "exception", "not found", "unable to", "异常", "错误", "失败",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// 重规划次数上限
    pub max_replan_count: u32,
    /// 为 false 时跳过意图识别，使用 SIMPLE_QUERY
    pub classify_intent: bool,
    /// 为 false 时直接输出 "Result:\n..." 而不调用 LLM 合成答案
    pub synthesize_answer: bool,
    /// 重规划 prompt 中已完成步骤结果的截断长度（字符）
    pub result_preview_chars: usize,
    /// 重规划后步骤数上限 = 原计划步骤数 + 该值
    pub max_compensating_steps: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_replan_count: 2,
            classify_intent: true,
            synthesize_answer: true,
            result_preview_chars: 100,
            max_compensating_steps: 2,
        }
    }
}

/// 从 config 目录加载配置，环境变量 PLANLOOP__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PLANLOOP__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("PLANLOOP")
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
        let cfg = AppConfig::default();
        assert_eq!(cfg.orchestrator.max_replan_count, 2);
        assert_eq!(cfg.orchestrator.result_preview_chars, 100);
        assert_eq!(cfg.planner.emergency_confidence, 0.4);
        assert_eq!(cfg.evaluator.strategy, EvaluatorStrategy::Heuristic);
        assert!(cfg.evaluator.failure_markers.iter().any(|m| m == "失败"));
        assert_eq!(cfg.llm.timeouts.request, 30);
    }

    #[test]
    fn test_load_explicit_file_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[llm]\nprovider = \"mock\"\n\n[orchestrator]\nmax_replan_count = 5\nclassify_intent = false\n\n[evaluator]\nstrategy = \"llm\"\n\n[planner]\nfallback_tool = \"calculate\""
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.llm.provider, "mock");
        assert_eq!(cfg.orchestrator.max_replan_count, 5);
        assert!(!cfg.orchestrator.classify_intent);
        assert_eq!(cfg.evaluator.strategy, EvaluatorStrategy::Llm);
        assert_eq!(cfg.planner.fallback_tool.as_deref(), Some("calculate"));
        // 未出现的键保持默认
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
        assert_eq!(cfg.orchestrator.max_compensating_steps, 2);
    }

    #[test]
    fn test_missing_explicit_file_is_ignored() {
        let cfg = load_config(Some(PathBuf::from("/nonexistent/planloop.toml"))).unwrap();
        assert!(cfg.orchestrator.max_replan_count >= 1);
    }
}
