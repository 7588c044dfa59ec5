//! 结果评估
//!
//! 两种策略遵循同一契约：
//! - heuristic：任一执行记录失败，或结果文本命中失败标记 → 需要重规划
//! - llm：先做同样的失败记录检查，再请 LLM 给出结构化判定
//!
//! 没有任何输出时总是要求重规划；评估自身出错时同样要求重规划（不在含糊输入上静默通过）。

use std::sync::Arc;

use crate::config::{EvaluatorConfig, EvaluatorStrategy};
use crate::core::state::{Evaluation, ExecutionRecord};
use crate::llm::{complete_prompt, LlmClient};
use crate::plan::{extract_json_object, Plan};
use crate::stages::prompts;

/// 结果评估器
pub struct OutcomeEvaluator {
    llm: Arc<dyn LlmClient>,
    strategy: EvaluatorStrategy,
    failure_markers: Vec<String>,
}

impl OutcomeEvaluator {
    pub fn new(llm: Arc<dyn LlmClient>, config: &EvaluatorConfig) -> Self {
        Self {
            llm,
            strategy: config.strategy,
            failure_markers: config
                .failure_markers
                .iter()
                .map(|m| m.to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    /// 评估当前周期的执行结果；records 为本周期的执行记录
    pub async fn evaluate(&self, query: &str, output: &str, plan: &Plan, records: &[ExecutionRecord]) -> Evaluation {
        if output.trim().is_empty() {
            return Evaluation::replan(
                "no output was produced",
                vec!["execution produced no result".to_string()],
                vec!["regenerate the plan with steps that produce a result".to_string()],
            );
        }

        let failed = failed_step_issues(records);
        if !failed.is_empty() {
            return Evaluation::replan(
                format!("{} step(s) failed", failed.len()),
                failed,
                vec!["repair the failed steps or use an alternative tool".to_string()],
            );
        }

        match self.strategy {
            EvaluatorStrategy::Heuristic => self.heuristic(output, records),
            EvaluatorStrategy::Llm => self.llm_evaluate(query, output, plan, records).await,
        }
    }

    fn heuristic(&self, output: &str, records: &[ExecutionRecord]) -> Evaluation {
        let mut issues = Vec::new();
        for record in records.iter().filter(|r| r.is_completed()) {
            if let Some(marker) = self.find_marker(&record.result_text()) {
                issues.push(format!(
                    "step {} result looks like a failure (contains '{marker}')",
                    record.step_id()
                ));
            }
        }
        if issues.is_empty() {
            if let Some(marker) = self.find_marker(output) {
                issues.push(format!("final output looks like a failure (contains '{marker}')"));
            }
        }

        if issues.is_empty() {
            Evaluation::accept("all steps completed without failure markers")
        } else {
            Evaluation::replan(
                format!("{} unexpected result(s)", issues.len()),
                issues,
                vec!["adjust the following steps to handle the unexpected results".to_string()],
            )
        }
    }

    fn find_marker(&self, text: &str) -> Option<&str> {
        let lower = text.to_lowercase();
        self.failure_markers
            .iter()
            .find(|m| lower.contains(m.as_str()))
            .map(|m| m.as_str())
    }

    async fn llm_evaluate(&self, query: &str, output: &str, plan: &Plan, records: &[ExecutionRecord]) -> Evaluation {
        let user = prompts::evaluator_user_prompt(query, output, plan, records);
        let verdict = match complete_prompt(self.llm.as_ref(), prompts::EVALUATOR_SYSTEM, &user).await {
            Ok(text) => extract_json_object(&text)
                .map_err(|e| e.to_string())
                .and_then(|v| serde_json::from_value::<Evaluation>(v).map_err(|e| e.to_string())),
            Err(e) => Err(e.to_string()),
        };
        match verdict {
            Ok(evaluation) => evaluation,
            Err(e) => {
                tracing::warn!(error = %e, "evaluation failed, requesting replan");
                Evaluation::replan(
                    "evaluation unavailable, treating result as unverified",
                    vec![format!("evaluator error: {e}")],
                    Vec::new(),
                )
            }
        }
    }
}

fn failed_step_issues(records: &[ExecutionRecord]) -> Vec<String> {
    records
        .iter()
        .filter(|r| !r.is_completed())
        .map(|r| format!("step {} failed: {}", r.step_id(), prompts::truncate_chars(&r.result_text(), 200)))
        .collect()
}
