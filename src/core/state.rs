//! 会话状态：一次查询在控制循环中的唯一可变聚合
//!
//! SessionState 由 Orchestrator 独占并在调用各阶段组件时按引用借出；
//! 进入 Terminal 后所有修改操作变为空操作（记录 warn），保证终态不可变。
//! ExecutionRecord 只追加：同一步骤的每次执行尝试各产生一条新记录。

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::memory::{Message, Transcript};
use crate::plan::{Plan, Step, StepId, StepStatus};
use crate::stages::intent::IntentType;

/// 状态机阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Classifying,
    Planning,
    Executing,
    Evaluating,
    Replanning,
    Terminal,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Classifying => "classifying",
            SessionPhase::Planning => "planning",
            SessionPhase::Executing => "executing",
            SessionPhase::Evaluating => "evaluating",
            SessionPhase::Replanning => "replanning",
            SessionPhase::Terminal => "terminal",
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话终态结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    Answered { answer: String },
    Failed { reason: String },
    Cancelled,
}

impl SessionOutcome {
    pub fn is_answered(&self) -> bool {
        matches!(self, SessionOutcome::Answered { .. })
    }
}

/// 单次步骤执行记录（创建后不可修改）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    step_id: StepId,
    description: String,
    tool_used: String,
    result: Value,
    status: StepStatus,
    executed_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn completed(step: &Step, tool_used: impl Into<String>, result: Value) -> Self {
        Self::new(step, tool_used, result, StepStatus::Completed)
    }

    /// 失败记录：result 为合成的错误说明
    pub fn failed(step: &Step, tool_used: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(step, tool_used, Value::String(message.into()), StepStatus::Failed)
    }

    fn new(step: &Step, tool_used: impl Into<String>, result: Value, status: StepStatus) -> Self {
        Self {
            step_id: step.id.clone(),
            description: step.description.clone(),
            tool_used: tool_used.into(),
            result,
            status,
            executed_at: Utc::now(),
        }
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// 使用的工具名；纯推理步骤为空字符串
    pub fn tool_used(&self) -> &str {
        &self.tool_used
    }

    pub fn result(&self) -> &Value {
        &self.result
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn executed_at(&self) -> DateTime<Utc> {
        self.executed_at
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }

    /// 结果的文本形式（字符串原样返回，其它 JSON 序列化）
    pub fn result_text(&self) -> String {
        match &self.result {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// 评估结论
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub need_replan: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl Evaluation {
    pub fn accept(reason: impl Into<String>) -> Self {
        Self {
            need_replan: false,
            reason: reason.into(),
            ..Default::default()
        }
    }

    pub fn replan(reason: impl Into<String>, issues: Vec<String>, suggestions: Vec<String>) -> Self {
        Self {
            need_replan: true,
            reason: reason.into(),
            issues,
            suggestions,
        }
    }
}

/// 会话状态
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    input: String,
    intent: IntentType,
    current_plan: Option<Plan>,
    plan_history: Vec<Plan>,
    executed_steps: Vec<ExecutionRecord>,
    replan_count: u32,
    need_replan: bool,
    task_completed: bool,
    last_error: Option<String>,
    last_evaluation: Option<Evaluation>,
    messages: Transcript,
    context: Map<String, Value>,
    phase: SessionPhase,
    outcome: Option<SessionOutcome>,
    /// 当前计划的第一条执行记录下标
    #[serde(skip)]
    cycle_start: usize,
}

impl SessionState {
    pub fn new(input: impl Into<String>) -> Self {
        let input = input.into();
        let mut messages = Transcript::default();
        messages.push(Message::user(input.clone()));
        Self {
            input,
            intent: IntentType::default(),
            current_plan: None,
            plan_history: Vec::new(),
            executed_steps: Vec::new(),
            replan_count: 0,
            need_replan: false,
            task_completed: false,
            last_error: None,
            last_evaluation: None,
            messages,
            context: Map::new(),
            phase: SessionPhase::Classifying,
            outcome: None,
            cycle_start: 0,
        }
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn intent(&self) -> IntentType {
        self.intent
    }

    pub fn current_plan(&self) -> Option<&Plan> {
        self.current_plan.as_ref()
    }

    pub fn plan_history(&self) -> &[Plan] {
        &self.plan_history
    }

    pub fn executed_steps(&self) -> &[ExecutionRecord] {
        &self.executed_steps
    }

    pub fn replan_count(&self) -> u32 {
        self.replan_count
    }

    pub fn need_replan(&self) -> bool {
        self.need_replan
    }

    pub fn task_completed(&self) -> bool {
        self.task_completed
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_evaluation(&self) -> Option<&Evaluation> {
        self.last_evaluation.as_ref()
    }

    pub fn messages(&self) -> &Transcript {
        &self.messages
    }

    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.phase == SessionPhase::Terminal
    }

    /// 当前计划周期内的执行记录
    pub fn current_cycle_records(&self) -> &[ExecutionRecord] {
        &self.executed_steps[self.cycle_start.min(self.executed_steps.len())..]
    }

    /// 当前计划周期内已完成的步骤 ID（选步时的「已执行集合」）
    pub fn completed_step_ids(&self) -> HashSet<StepId> {
        self.current_cycle_records()
            .iter()
            .filter(|r| r.is_completed())
            .map(|r| r.step_id.clone())
            .collect()
    }

    /// 历史上所有已完成的步骤 ID（跨计划）
    pub fn all_completed_step_ids(&self) -> HashSet<StepId> {
        self.executed_steps
            .iter()
            .filter(|r| r.is_completed())
            .map(|r| r.step_id.clone())
            .collect()
    }

    /// 某步骤最近一次成功的执行记录（占位符回引使用）
    pub fn latest_completed_result(&self, step_id: &str) -> Option<&ExecutionRecord> {
        self.executed_steps
            .iter()
            .rev()
            .find(|r| r.is_completed() && r.step_id == step_id)
    }

    /// 当前周期的输出：最后一条成功记录的结果文本
    pub fn current_output(&self) -> String {
        self.current_cycle_records()
            .iter()
            .rev()
            .find(|r| r.is_completed())
            .map(|r| r.result_text())
            .unwrap_or_default()
    }

    /// 整个会话中最新的成功输出
    pub fn latest_output(&self) -> String {
        self.executed_steps
            .iter()
            .rev()
            .find(|r| r.is_completed())
            .map(|r| r.result_text())
            .unwrap_or_default()
    }

    fn guard(&self, op: &str) -> bool {
        if self.is_terminal() {
            tracing::warn!(op, "session is terminal, mutation ignored");
            return false;
        }
        true
    }

    pub(crate) fn set_phase(&mut self, phase: SessionPhase) {
        if self.guard("set_phase") {
            tracing::debug!(from = %self.phase, to = %phase, "phase transition");
            self.phase = phase;
        }
    }

    pub(crate) fn set_intent(&mut self, intent: IntentType) {
        if self.guard("set_intent") {
            self.intent = intent;
        }
    }

    /// 安装新计划：旧计划进入历史，开启新的执行周期
    pub(crate) fn install_plan(&mut self, plan: Plan) {
        if !self.guard("install_plan") {
            return;
        }
        if let Some(previous) = self.current_plan.take() {
            self.plan_history.push(previous);
        }
        self.current_plan = Some(plan);
        self.cycle_start = self.executed_steps.len();
        self.need_replan = false;
    }

    /// 追加执行记录，同步步骤状态与上下文
    pub(crate) fn record_execution(&mut self, record: ExecutionRecord) {
        if !self.guard("record_execution") {
            return;
        }
        if let Some(plan) = self.current_plan.as_mut() {
            plan.mark_step(&record.step_id, record.status);
        }
        if record.is_completed() {
            self.context
                .insert(format!("{}_result", record.step_id), record.result.clone());
        } else {
            self.last_error = Some(format!("step '{}' failed: {}", record.step_id, record.result_text()));
        }
        self.executed_steps.push(record);
    }

    pub(crate) fn set_evaluation(&mut self, evaluation: Evaluation) {
        if self.guard("set_evaluation") {
            self.need_replan = evaluation.need_replan;
            self.last_evaluation = Some(evaluation);
        }
    }

    pub(crate) fn increment_replan(&mut self) {
        if self.guard("increment_replan") {
            self.replan_count += 1;
        }
    }

    pub(crate) fn set_last_error(&mut self, error: impl Into<String>) {
        if self.guard("set_last_error") {
            self.last_error = Some(error.into());
        }
    }

    pub(crate) fn push_message(&mut self, message: Message) {
        if self.guard("push_message") {
            self.messages.push(message);
        }
    }

    pub(crate) fn set_context(&mut self, key: impl Into<String>, value: Value) {
        if self.guard("set_context") {
            self.context.insert(key.into(), value);
        }
    }

    /// 进入终态；之后状态不再可变
    pub(crate) fn finish(&mut self, outcome: SessionOutcome) {
        if !self.guard("finish") {
            return;
        }
        if let SessionOutcome::Answered { answer } = &outcome {
            self.messages.push(Message::assistant(answer.clone()));
            self.task_completed = true;
        }
        self.need_replan = false;
        self.outcome = Some(outcome);
        self.phase = SessionPhase::Terminal;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan() -> Plan {
        Plan::new(
            "q",
            "g",
            vec![Step::new("step_1", "a"), Step::new("step_2", "b").depends_on(["step_1"])],
        )
    }

    #[test]
    fn test_record_execution_marks_plan_and_context() {
        let mut state = SessionState::new("q");
        state.install_plan(plan());
        let step = state.current_plan().unwrap().steps[0].clone();
        state.record_execution(ExecutionRecord::completed(&step, "calculate", json!(4)));

        assert_eq!(state.current_plan().unwrap().steps[0].status, StepStatus::Completed);
        assert_eq!(state.context()["step_1_result"], json!(4));
        assert!(state.completed_step_ids().contains("step_1"));
        assert_eq!(state.current_output(), "4");
    }

    #[test]
    fn test_failed_record_sets_last_error() {
        let mut state = SessionState::new("q");
        state.install_plan(plan());
        let step = state.current_plan().unwrap().steps[0].clone();
        state.record_execution(ExecutionRecord::failed(&step, "calculate", "division by zero"));
        assert!(state.last_error().unwrap().contains("division by zero"));
        assert!(state.completed_step_ids().is_empty());
        assert_eq!(state.current_output(), "");
    }

    #[test]
    fn test_install_plan_starts_new_cycle() {
        let mut state = SessionState::new("q");
        state.install_plan(plan());
        let step = state.current_plan().unwrap().steps[0].clone();
        state.record_execution(ExecutionRecord::completed(&step, "", json!("x")));
        state.install_plan(plan());
        assert_eq!(state.plan_history().len(), 1);
        assert!(state.current_cycle_records().is_empty());
        assert_eq!(state.latest_output(), "x");
        assert!(state.latest_completed_result("step_1").is_some());
    }

    #[test]
    fn test_terminal_is_absorbing() {
        let mut state = SessionState::new("q");
        state.finish(SessionOutcome::Answered { answer: "done".into() });
        assert!(state.task_completed());

        state.increment_replan();
        state.set_phase(SessionPhase::Planning);
        state.install_plan(plan());
        state.finish(SessionOutcome::Cancelled);

        assert_eq!(state.replan_count(), 0);
        assert_eq!(state.phase(), SessionPhase::Terminal);
        assert!(state.current_plan().is_none());
        assert!(state.outcome().unwrap().is_answered());
        assert_eq!(state.messages().last().unwrap().content, "done");
    }
}
