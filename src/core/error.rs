//! 编排错误类型
//!
//! 组件内部错误在越过组件边界前被转换为类型化结果；只有 ReplanBudgetExhausted、
//! NoReplanTarget 与 Cancelled 会让一次会话直接进入终态。

use thiserror::Error;

use crate::llm::LlmError;

/// 编排过程中可能出现的错误（LLM、解析、工具、预算、取消等）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    LlmError(#[from] LlmError),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Malformed plan: {0}")]
    MalformedPlan(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Replan budget exhausted after {attempts} attempts")]
    ReplanBudgetExhausted { attempts: u32 },

    #[error("No replan target: {0}")]
    NoReplanTarget(String),

    #[error("Session cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    /// 是否终止整个会话（其余错误都在组件内被降级处理）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::ReplanBudgetExhausted { .. }
                | AgentError::NoReplanTarget(_)
                | AgentError::Cancelled
                | AgentError::ConfigError(_)
        )
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        AgentError::ConfigError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(AgentError::ReplanBudgetExhausted { attempts: 2 }.is_fatal());
        assert!(AgentError::NoReplanTarget("no plan".into()).is_fatal());
        assert!(!AgentError::ToolTimeout("calculate".into()).is_fatal());
        assert!(!AgentError::from(LlmError::EmptyResponse).is_fatal());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            AgentError::UnknownTool("weather_lookup".into()).to_string(),
            "Unknown tool: weather_lookup"
        );
    }
}
