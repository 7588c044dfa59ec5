//! 步骤选择与执行
//!
//! select_next：按计划原始顺序，取第一个「未执行且依赖全部已完成」的步骤（确定性，无优先级）。
//! execute：解析 `{step_id_result}` 回引占位符后调用工具；无工具的步骤交给 LLM 纯推理。
//! 任何失败（工具报错、超时、未注册工具、LLM 失败）都转成 status = failed 的执行记录，从不中断循环。

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, OnceLock};

use regex::{Captures, Regex};
use serde_json::Value;

use crate::core::state::{ExecutionRecord, SessionState};
use crate::llm::{complete_prompt, LlmClient};
use crate::plan::{Plan, Step, StepId, StepStatus};
use crate::stages::prompts;
use crate::tools::ToolExecutor;

static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn placeholder_re() -> &'static Regex {
    PLACEHOLDER_RE.get_or_init(|| Regex::new(r"\{([A-Za-z0-9_\-]+)_result\}").unwrap())
}

/// 选择下一个可执行步骤；completed 为当前计划周期内已完成的步骤 ID
pub fn select_next<'a>(plan: &'a Plan, completed: &HashSet<StepId>) -> Option<&'a Step> {
    plan.steps.iter().find(|step| {
        step.status == StepStatus::Pending
            && !completed.contains(&step.id)
            && step.dependencies.iter().all(|dep| completed.contains(dep))
    })
}

/// 步骤执行器
pub struct StepExecutor {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolExecutor>,
}

impl StepExecutor {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<ToolExecutor>) -> Self {
        Self { llm, tools }
    }

    /// 执行单个步骤，返回一条执行记录（成功或失败）
    pub async fn execute(&self, step: &Step, state: &SessionState) -> ExecutionRecord {
        if step.is_reasoning_only() {
            return self.execute_reasoning(step, state).await;
        }

        let args = resolve_args(&step.tool_args, state);
        tracing::debug!(step_id = %step.id, tool = %step.tool, "executing tool step");
        match self.tools.execute(&step.tool, Value::Object(args.into_iter().collect())).await {
            Ok(value) => match error_payload(&value) {
                Some(message) => {
                    tracing::warn!(step_id = %step.id, tool = %step.tool, error = %message, "tool returned error payload");
                    ExecutionRecord::failed(step, &step.tool, format!("Tool '{}' returned an error: {message}", step.tool))
                }
                None => ExecutionRecord::completed(step, &step.tool, value),
            },
            Err(e) => {
                tracing::warn!(step_id = %step.id, tool = %step.tool, error = %e, "tool step failed");
                ExecutionRecord::failed(step, &step.tool, format!("Tool '{}' failed: {e}", step.tool))
            }
        }
    }

    async fn execute_reasoning(&self, step: &Step, state: &SessionState) -> ExecutionRecord {
        let input = resolve_text(&step.input_template, state);
        let dependency_results: Vec<(String, String)> = step
            .dependencies
            .iter()
            .filter_map(|dep| {
                state
                    .latest_completed_result(dep)
                    .map(|r| (dep.clone(), r.result_text()))
            })
            .collect();
        let user = prompts::reasoning_step_prompt(state.input(), step, &input, &dependency_results);
        tracing::debug!(step_id = %step.id, "executing reasoning-only step");

        match complete_prompt(self.llm.as_ref(), prompts::REASONING_STEP_SYSTEM, &user).await {
            Ok(text) if !text.trim().is_empty() => {
                ExecutionRecord::completed(step, "", Value::String(text.trim().to_string()))
            }
            Ok(_) => ExecutionRecord::failed(step, "", "Reasoning step produced no output"),
            Err(e) => {
                tracing::warn!(step_id = %step.id, error = %e, "reasoning step failed");
                ExecutionRecord::failed(step, "", format!("Reasoning failed: {e}"))
            }
        }
    }
}

/// 解析参数中的占位符；整值恰好是一个占位符时保留被引用结果的原始 JSON 类型
fn resolve_args(args: &BTreeMap<String, Value>, state: &SessionState) -> BTreeMap<String, Value> {
    args.iter()
        .map(|(key, value)| {
            let resolved = match value {
                Value::String(s) => resolve_value(s, state),
                other => other.clone(),
            };
            (key.clone(), resolved)
        })
        .collect()
}

fn resolve_value(s: &str, state: &SessionState) -> Value {
    if let Some(caps) = placeholder_re().captures(s.trim()) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(s.trim().len()) {
            if let Some(record) = state.latest_completed_result(&caps[1]) {
                return record.result().clone();
            }
        }
    }
    Value::String(resolve_text(s, state))
}

/// 将文本中的 `{step_id_result}` 替换为该步骤最近一次成功结果的文本；找不到则原样保留
pub fn resolve_text(text: &str, state: &SessionState) -> String {
    placeholder_re()
        .replace_all(text, |caps: &Captures| match state.latest_completed_result(&caps[1]) {
            Some(record) => record.result_text(),
            None => {
                tracing::warn!(placeholder = &caps[0], "unresolved step result placeholder");
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// 工具以 `{"error": "..."}` 形式返回的失败
fn error_payload(value: &Value) -> Option<String> {
    let error = value.as_object()?.get("error")?;
    match error {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::tools::{CalculatorTool, Tool, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct BrokenTool;

    #[async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &str {
            "metric"
        }

        fn description(&self) -> &str {
            "always reports an error payload"
        }

        async fn execute(&self, _args: Value) -> Result<Value, String> {
            Ok(json!({"error": "metric not found"}))
        }
    }

    fn executor(llm: MockLlmClient) -> StepExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(CalculatorTool);
        registry.register(BrokenTool);
        StepExecutor::new(Arc::new(llm), Arc::new(ToolExecutor::with_timeout(registry, Duration::from_secs(5))))
    }

    fn two_step_plan() -> Plan {
        Plan::new(
            "q",
            "g",
            vec![
                Step::new("step_2", "double").with_tool("calculate", [("expression", json!("{step_1_result} * 2"))]).depends_on(["step_1"]),
                Step::new("step_1", "add").with_tool("calculate", [("expression", json!("2+2"))]),
            ],
        )
    }

    #[test]
    fn test_select_next_respects_dependencies() {
        let plan = two_step_plan();
        let mut done = HashSet::new();
        assert_eq!(select_next(&plan, &done).unwrap().id, "step_1");
        // 多次调用结果一致
        assert_eq!(select_next(&plan, &done).unwrap().id, "step_1");
        done.insert("step_1".to_string());
        assert_eq!(select_next(&plan, &done).unwrap().id, "step_2");
        done.insert("step_2".to_string());
        assert!(select_next(&plan, &done).is_none());
    }

    #[test]
    fn test_failed_step_blocks_dependents() {
        let mut plan = two_step_plan();
        plan.mark_step("step_1", StepStatus::Failed);
        assert!(select_next(&plan, &HashSet::new()).is_none());
    }

    #[tokio::test]
    async fn test_placeholder_resolution_between_steps() {
        let exec = executor(MockLlmClient::default());
        let mut state = SessionState::new("q");
        state.install_plan(two_step_plan());

        let plan = state.current_plan().unwrap().clone();
        let first = select_next(&plan, &state.completed_step_ids()).unwrap().clone();
        let record = exec.execute(&first, &state).await;
        assert_eq!(record.result(), &json!(4));
        state.record_execution(record);

        let plan = state.current_plan().unwrap().clone();
        let second = select_next(&plan, &state.completed_step_ids()).unwrap().clone();
        let record = exec.execute(&second, &state).await;
        assert_eq!(record.result(), &json!(8));
        assert!(record.is_completed());
    }

    #[tokio::test]
    async fn test_tool_failures_become_failed_records() {
        let exec = executor(MockLlmClient::default());
        let state = SessionState::new("q");

        let step = Step::new("s1", "div").with_tool("calculate", [("expression", json!("1/0"))]);
        let record = exec.execute(&step, &state).await;
        assert_eq!(record.status(), StepStatus::Failed);
        assert!(record.result_text().contains("division by zero"));

        let step = Step::new("s2", "metric").with_tool("metric", [("name", json!("x"))]);
        let record = exec.execute(&step, &state).await;
        assert_eq!(record.status(), StepStatus::Failed);
        assert!(record.result_text().contains("metric not found"));

        let step = Step::new("s3", "ghost").with_tool("weather_lookup", [("city", json!("x"))]);
        let record = exec.execute(&step, &state).await;
        assert_eq!(record.status(), StepStatus::Failed);
        assert_eq!(record.tool_used(), "weather_lookup");
    }

    #[tokio::test]
    async fn test_reasoning_only_step() {
        let exec = executor(MockLlmClient::scripted(vec![Ok("It is sunny.".into())]));
        let state = SessionState::new("weather?");
        let record = exec.execute(&Step::new("step_1", "describe weather"), &state).await;
        assert!(record.is_completed());
        assert_eq!(record.tool_used(), "");
        assert_eq!(record.result_text(), "It is sunny.");

        let exec = executor(MockLlmClient::scripted(vec![Err(LlmError::ApiError("down".into()))]));
        let record = exec.execute(&Step::new("step_1", "describe weather"), &state).await;
        assert_eq!(record.status(), StepStatus::Failed);
    }

    #[test]
    fn test_unresolved_placeholder_left_in_place() {
        let state = SessionState::new("q");
        assert_eq!(resolve_text("x = {step_9_result}", &state), "x = {step_9_result}");
    }
}
