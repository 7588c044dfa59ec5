//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，execute(tool_name, args) 在超时内调用工具，
//! 未注册、超时或失败时转为 AgentError（UnknownTool / ToolTimeout / ToolExecutionFailed）；
//! 每次调用输出一行结构化审计日志（JSON）。

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::tools::ToolRegistry;

/// 工具执行器：对每次调用施加超时，并将结果映射为 AgentError
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn with_timeout(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// 执行指定工具；输出 JSON 审计日志
    pub async fn execute(&self, tool_name: &str, args: Value) -> Result<Value, AgentError> {
        let start = Instant::now();
        let args_preview = args_preview(&args);

        let result = match self.registry.get(tool_name) {
            None => Err(AgentError::UnknownTool(tool_name.to_string())),
            Some(tool) => match timeout(self.timeout, tool.execute(args)).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(AgentError::ToolExecutionFailed(e)),
                Err(_) => Err(AgentError::ToolTimeout(tool_name.to_string())),
            },
        };

        let (ok, outcome): (bool, &str) = match &result {
            Ok(_) => (true, "ok"),
            Err(AgentError::ToolTimeout(_)) => (false, "timeout"),
            Err(AgentError::UnknownTool(_)) => (false, "unknown_tool"),
            Err(_) => (false, "error"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }

    pub fn known_tools(&self) -> BTreeSet<String> {
        self.registry.tool_names()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{CalculatorTool, Tool};
    use async_trait::async_trait;
    use serde_json::json;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        async fn execute(&self, _args: Value) -> Result<Value, String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!("late"))
        }
    }

    fn executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(CalculatorTool);
        registry.register(SlowTool);
        ToolExecutor::with_timeout(registry, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_execute_ok() {
        let out = executor()
            .execute("calculate", json!({"expression": "2+2"}))
            .await
            .unwrap();
        assert_eq!(out, json!(4));
    }

    #[tokio::test]
    async fn test_execute_errors_are_typed() {
        let exec = executor();
        assert!(matches!(
            exec.execute("weather_lookup", json!({})).await,
            Err(AgentError::UnknownTool(_))
        ));
        assert!(matches!(
            exec.execute("slow", json!({})).await,
            Err(AgentError::ToolTimeout(_))
        ));
        assert!(matches!(
            exec.execute("calculate", json!({"expression": "1/0"})).await,
            Err(AgentError::ToolExecutionFailed(_))
        ));
    }

    #[test]
    fn test_args_preview_truncates() {
        let long = json!({"text": "x".repeat(500)});
        assert!(args_preview(&long).ends_with("..."));
    }
}
