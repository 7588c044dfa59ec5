//! 重规划
//!
//! 输入：当前计划、全部执行记录、最近一次评估结论与最近错误。
//! LLM 以带标签的 JSON 回复 `{"outcome": "plan", ...}` 或 `{"outcome": "final_answer", ...}`。
//! 修订计划若存在结构性问题，追加格式警告重试一次；再次失败则本轮视为耗尽（Exhausted），
//! 由 Orchestrator 照常累加重规划次数以保证终止。
//!
//! 修订计划的后处理：去掉重复已完成工作的步骤（沿用旧 ID 的新工作改用新 ID）、步骤数封顶、置信度不高于上一计划、
//! 写入 original_plan_id / replan_reason。

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::core::state::{ExecutionRecord, SessionState};
use crate::core::AgentError;
use crate::llm::{complete_prompt, LlmClient};
use crate::plan::{
    extract_json_object, new_plan_id, DependencyGraph, NormalizedPlan, Plan, PlanNormalizer, Step, StepId,
    StepStatus, META_GENERATED_BY, META_INTENT_TYPE, META_ORIGINAL_PLAN_ID, META_REPLAN_REASON,
};
use crate::stages::intent::IntentType;
use crate::stages::prompts::{self, ReplanView};

/// 重规划结果
#[derive(Debug, Clone, PartialEq)]
pub enum ReplanOutcome {
    /// 修订后的计划（步骤可以为空，表示工作已完成）
    Plan(Plan),
    /// 直接给用户的最终答案
    FinalAnswer(String),
    /// 本轮未得到可用结果（附原因）
    Exhausted(String),
}

impl ReplanOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            ReplanOutcome::Plan(_) => "plan",
            ReplanOutcome::FinalAnswer(_) => "final_answer",
            ReplanOutcome::Exhausted(_) => "exhausted",
        }
    }
}

/// LLM 回复的标签格式
#[derive(Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum ReplanResponse {
    Plan { plan: Value },
    FinalAnswer { answer: String },
}

enum ParsedReply {
    Plan(NormalizedPlan),
    FinalAnswer(String),
}

/// 重规划器
pub struct Replanner {
    llm: Arc<dyn LlmClient>,
    normalizer: PlanNormalizer,
    tools_schema: String,
    max_compensating_steps: usize,
    result_preview_chars: usize,
}

impl Replanner {
    pub fn new(llm: Arc<dyn LlmClient>, normalizer: PlanNormalizer, tools_schema: String) -> Self {
        Self {
            llm,
            normalizer,
            tools_schema,
            max_compensating_steps: 2,
            result_preview_chars: 100,
        }
    }

    pub fn with_limits(mut self, max_compensating_steps: usize, result_preview_chars: usize) -> Self {
        self.max_compensating_steps = max_compensating_steps;
        self.result_preview_chars = result_preview_chars;
        self
    }

    /// 无当前计划或无评估结论时返回 NoReplanTarget
    pub async fn replan(&self, state: &SessionState) -> Result<ReplanOutcome, AgentError> {
        let plan = state
            .current_plan()
            .ok_or_else(|| AgentError::NoReplanTarget("no current plan".to_string()))?;
        let evaluation = state
            .last_evaluation()
            .ok_or_else(|| AgentError::NoReplanTarget("no evaluation available".to_string()))?;

        let completed: Vec<&ExecutionRecord> = state
            .executed_steps()
            .iter()
            .filter(|r| r.is_completed())
            .collect();
        let failed: Vec<&ExecutionRecord> = state
            .current_cycle_records()
            .iter()
            .filter(|r| !r.is_completed())
            .collect();
        let failed_ids: BTreeSet<StepId> = failed.iter().map(|r| r.step_id().to_string()).collect();
        let view = ReplanView {
            query: state.input(),
            plan,
            completed,
            failed,
            remaining: plan
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Pending)
                .collect(),
            blocked: DependencyGraph::new(&plan.steps).blocked_by(&failed_ids),
            evaluation,
            last_error: state.last_error(),
            tools_schema: &self.tools_schema,
            max_steps: plan.steps.len() + self.max_compensating_steps,
            preview_chars: self.result_preview_chars,
        };

        let intent = plan
            .meta_str(META_INTENT_TYPE)
            .and_then(IntentType::parse)
            .unwrap_or_else(|| state.intent());
        let system = prompts::replanning_system_prompt(intent);

        for attempt in 0..2 {
            let user = prompts::replanning_user_prompt(&view, attempt > 0);
            let text = match complete_prompt(self.llm.as_ref(), &system, &user).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "replanning call failed");
                    return Ok(ReplanOutcome::Exhausted(format!("replanning call failed: {e}")));
                }
            };

            match self.parse_reply(state.input(), &text) {
                Ok(ParsedReply::FinalAnswer(answer)) => {
                    tracing::info!(plan_id = %plan.id, "replanner returned a final answer");
                    return Ok(ReplanOutcome::FinalAnswer(answer));
                }
                Ok(ParsedReply::Plan(normalized)) if !normalized.has_structural_issues() => {
                    for issue in &normalized.issues {
                        tracing::warn!(issue = %issue, "revised plan validation");
                    }
                    let revised = self.post_process(normalized.plan, plan, state);
                    tracing::info!(
                        plan_id = %revised.id,
                        original_plan_id = %plan.id,
                        steps = revised.steps.len(),
                        confidence = revised.confidence,
                        "plan revised"
                    );
                    return Ok(ReplanOutcome::Plan(revised));
                }
                Ok(ParsedReply::Plan(normalized)) => {
                    let issues: Vec<String> = normalized
                        .issues
                        .iter()
                        .filter(|i| i.is_structural())
                        .map(|i| i.to_string())
                        .collect();
                    tracing::warn!(attempt, issues = ?issues, "revised plan is structurally invalid");
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "replanning reply unusable");
                }
            }
        }

        Ok(ReplanOutcome::Exhausted(
            "revised plan failed validation twice".to_string(),
        ))
    }

    fn parse_reply(&self, query: &str, text: &str) -> Result<ParsedReply, AgentError> {
        let value = extract_json_object(text).map_err(|e| AgentError::JsonParseError(e.to_string()))?;

        let tagged = match serde_json::from_value::<ReplanResponse>(value.clone()) {
            Ok(tagged) => tagged,
            // 未带标签：含 steps 视为计划，含 answer 视为最终答案
            Err(e) => {
                if value.get("steps").is_some() {
                    ReplanResponse::Plan { plan: value }
                } else if let Some(answer) = value.get("answer").and_then(|v| v.as_str()) {
                    ReplanResponse::FinalAnswer {
                        answer: answer.to_string(),
                    }
                } else {
                    return Err(AgentError::MalformedPlan(format!("untagged reply: {e}")));
                }
            }
        };

        match tagged {
            ReplanResponse::FinalAnswer { answer } if answer.trim().is_empty() => {
                Err(AgentError::MalformedPlan("final answer is empty".to_string()))
            }
            ReplanResponse::FinalAnswer { answer } => Ok(ParsedReply::FinalAnswer(answer.trim().to_string())),
            ReplanResponse::Plan { plan } => self
                .normalizer
                .from_value(query, &plan)
                .map(ParsedReply::Plan)
                .map_err(|e| AgentError::MalformedPlan(e.to_string())),
        }
    }

    fn post_process(&self, mut revised: Plan, prior: &Plan, state: &SessionState) -> Plan {
        let completed = completed_steps(state);
        let before = revised.steps.len();
        revised
            .steps
            .retain(|s| !completed.get(&s.id).is_some_and(|done| same_work(done, s)));
        if revised.steps.len() < before {
            tracing::debug!(dropped = before - revised.steps.len(), "completed steps removed from revised plan");
        }
        rename_reused_ids(&mut revised, &completed);

        let max_steps = prior.steps.len() + self.max_compensating_steps;
        if revised.steps.len() > max_steps {
            tracing::warn!(steps = revised.steps.len(), max_steps, "revised plan truncated");
            revised.steps.truncate(max_steps);
        }

        let ids: HashSet<StepId> = revised.steps.iter().map(|s| s.id.clone()).collect();
        for step in &mut revised.steps {
            step.dependencies.retain(|d| ids.contains(d));
        }

        if revised.id == prior.id || state.plan_history().iter().any(|p| p.id == revised.id) {
            revised.id = new_plan_id();
        }
        revised.set_confidence(revised.confidence.min(prior.confidence));

        let reason = state
            .last_error()
            .map(str::to_string)
            .or_else(|| state.last_evaluation().map(|e| e.reason.clone()))
            .unwrap_or_else(|| "evaluation requested replanning".to_string());
        revised.set_meta(META_ORIGINAL_PLAN_ID, prior.id.clone());
        revised.set_meta(META_REPLAN_REASON, reason);
        revised.set_meta(META_GENERATED_BY, "replanner");
        if let Some(intent) = prior.meta_str(META_INTENT_TYPE) {
            revised.set_meta(META_INTENT_TYPE, intent.to_string());
        }
        revised.touch();
        revised
    }
}

/// 会话中已完成的步骤定义（按 ID；同 ID 以较新的计划为准）
fn completed_steps(state: &SessionState) -> HashMap<StepId, Step> {
    state
        .plan_history()
        .iter()
        .chain(state.current_plan())
        .flat_map(|plan| plan.steps.iter())
        .filter(|s| s.status == StepStatus::Completed)
        .map(|s| (s.id.clone(), s.clone()))
        .collect()
}

/// 工具与参数一致（纯推理步骤还要求描述一致）才视为同一工作
fn same_work(done: &Step, candidate: &Step) -> bool {
    done.tool == candidate.tool
        && done.tool_args == candidate.tool_args
        && (!done.tool.is_empty() || done.description == candidate.description)
}

/// 新工作沿用了已完成步骤的 ID：改名为新 ID，并同步计划内对它的依赖
fn rename_reused_ids(plan: &mut Plan, completed: &HashMap<StepId, Step>) {
    let mut taken: HashSet<StepId> = plan.steps.iter().map(|s| s.id.clone()).collect();
    taken.extend(completed.keys().cloned());

    let mut renames: HashMap<StepId, StepId> = HashMap::new();
    for step in &mut plan.steps {
        if !completed.contains_key(&step.id) {
            continue;
        }
        let mut n = 2;
        let mut fresh = format!("{}_{n}", step.id);
        while taken.contains(&fresh) {
            n += 1;
            fresh = format!("{}_{n}", step.id);
        }
        tracing::warn!(step_id = %step.id, renamed = %fresh, "revised step reuses a completed id for new work");
        taken.insert(fresh.clone());
        renames.insert(std::mem::replace(&mut step.id, fresh.clone()), fresh);
    }
    if renames.is_empty() {
        return;
    }
    for step in &mut plan.steps {
        for dep in &mut step.dependencies {
            if let Some(fresh) = renames.get(dep) {
                *dep = fresh.clone();
            }
        }
        for value in step.tool_args.values_mut() {
            if let Value::String(text) = value {
                for (old, fresh) in &renames {
                    *text = text.replace(&format!("{{{old}_result}}"), &format!("{{{fresh}_result}}"));
                }
            }
        }
    }
}
