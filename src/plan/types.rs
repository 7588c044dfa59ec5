//! 计划类型定义
//!
//! Plan / Step 的字段名即 JSON 线格式（plan_type、tool_args、expected_output 等），
//! 与 prompt、日志互通；置信度在构造与解析时都被夹到 [0.0, 1.0]。

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::plan::validate::ValidationIssue;

pub type PlanId = String;
pub type StepId = String;

/// 步骤默认置信度
pub const DEFAULT_CONFIDENCE: f64 = 0.7;
/// 计划默认预计耗时（秒）
pub const DEFAULT_ESTIMATED_DURATION: f64 = 60.0;

/// metadata 中约定的键
pub const META_FALLBACK: &str = "fallback";
pub const META_INTENT_TYPE: &str = "intent_type";
pub const META_ORIGINAL_PLAN_ID: &str = "original_plan_id";
pub const META_REPLAN_REASON: &str = "replan_reason";
pub const META_GENERATED_BY: &str = "generated_by";
pub const META_ERROR: &str = "error";

/// 计划类型；目前只执行 sequential，parallel 为预留扩展
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    #[default]
    Sequential,
    Parallel,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Sequential => "sequential",
            PlanType::Parallel => "parallel",
        }
    }
}

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

/// 计划中的单个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub description: String,
    /// 工具名；为空表示纯推理步骤
    #[serde(default)]
    pub tool: String,
    /// 工具参数（扁平键值）；字符串值可含 `{step_id_result}` 回引占位符
    #[serde(default)]
    pub tool_args: BTreeMap<String, Value>,
    #[serde(default)]
    pub input_template: String,
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    #[serde(default)]
    pub expected_output: String,
    #[serde(default = "default_confidence", deserialize_with = "clamped_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub status: StepStatus,
}

impl Step {
    pub fn new(id: impl Into<StepId>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            tool: String::new(),
            tool_args: BTreeMap::new(),
            input_template: String::new(),
            dependencies: Vec::new(),
            expected_output: String::new(),
            confidence: DEFAULT_CONFIDENCE,
            status: StepStatus::Pending,
        }
    }

    pub fn with_tool<I, K>(mut self, tool: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.tool = tool.into();
        self.tool_args = args.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        for id in ids {
            let id = id.into();
            if !self.dependencies.contains(&id) {
                self.dependencies.push(id);
            }
        }
        self
    }

    pub fn with_input_template(mut self, template: impl Into<String>) -> Self {
        self.input_template = template.into();
        self
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = expected.into();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }

    /// 是否为纯推理步骤（不调用工具）
    pub fn is_reasoning_only(&self) -> bool {
        self.tool.trim().is_empty()
    }
}

/// 完整任务计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    /// 用户原始查询，重规划时保持不变
    pub query: String,
    pub goal: String,
    #[serde(default)]
    pub plan_type: PlanType,
    pub steps: Vec<Step>,
    #[serde(default = "default_estimated_duration")]
    pub estimated_duration: f64,
    #[serde(default = "default_confidence", deserialize_with = "clamped_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Unix 秒
    #[serde(default = "now_secs", deserialize_with = "lenient_timestamp")]
    pub created_at: i64,
    #[serde(default = "now_secs", deserialize_with = "lenient_timestamp")]
    pub updated_at: i64,
}

impl Plan {
    pub fn new(query: impl Into<String>, goal: impl Into<String>, steps: Vec<Step>) -> Self {
        let now = now_secs();
        Self {
            id: new_plan_id(),
            query: query.into(),
            goal: goal.into(),
            plan_type: PlanType::Sequential,
            steps: steps
                .into_iter()
                .map(|mut s| {
                    s.confidence = clamp_confidence(s.confidence);
                    s
                })
                .collect(),
            estimated_duration: DEFAULT_ESTIMATED_DURATION,
            confidence: DEFAULT_CONFIDENCE,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_ids(&self) -> Vec<StepId> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    /// 标记步骤状态并刷新 updated_at；步骤不存在时返回 false
    pub fn mark_step(&mut self, id: &str, status: StepStatus) -> bool {
        match self.steps.iter_mut().find(|s| s.id == id) {
            Some(step) => {
                step.status = status;
                self.touch();
                true
            }
            None => false,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_secs();
    }

    /// 空步骤列表表示「工作已完成」
    pub fn is_done_signal(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn set_confidence(&mut self, confidence: f64) {
        self.confidence = clamp_confidence(confidence);
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// 应急计划（解析失败后的降级产物）
    pub fn is_fallback(&self) -> bool {
        self.metadata
            .get(META_FALLBACK)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// 出现在该计划里的工具名（去重、保持顺序）
    pub fn tools_used(&self) -> Vec<&str> {
        let mut tools: Vec<&str> = Vec::new();
        for step in &self.steps {
            if !step.tool.is_empty() && !tools.contains(&step.tool.as_str()) {
                tools.push(step.tool.as_str());
            }
        }
        tools
    }

    pub fn to_wire_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 严格解析线格式（LLM 输出请走 PlanNormalizer 的容错路径）
    pub fn from_wire_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// 计划构建错误
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("invalid plan: {}", join_issues(.0))]
    Invalid(Vec<ValidationIssue>),
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

pub fn new_plan_id() -> PlanId {
    format!("plan_{}", uuid::Uuid::new_v4().simple())
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn default_confidence() -> f64 {
    DEFAULT_CONFIDENCE
}

fn default_estimated_duration() -> f64 {
    DEFAULT_ESTIMATED_DURATION
}

fn clamped_confidence<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(value
        .as_f64()
        .map(clamp_confidence)
        .unwrap_or(DEFAULT_CONFIDENCE))
}

/// 时间戳既接受整数也接受浮点（LLM 常输出 time.time() 风格的小数秒）
fn lenient_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .unwrap_or_else(now_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_plan() -> Plan {
        let mut plan = Plan::new(
            "compare A and B",
            "compare two metrics",
            vec![
                Step::new("step_1", "fetch A").with_tool("metric", [("name", json!("A"))]),
                Step::new("step_2", "fetch B").with_tool("metric", [("name", json!("B"))]),
                Step::new("step_3", "compute diff")
                    .with_tool(
                        "calculate",
                        [("expression", json!("{step_1_result} - {step_2_result}"))],
                    )
                    .depends_on(["step_1", "step_2"])
                    .with_confidence(0.5),
            ],
        );
        plan.set_confidence(0.75);
        plan.set_meta(META_INTENT_TYPE, "COMPARISON");
        plan
    }

    #[test]
    fn test_wire_round_trip() {
        let plan = sample_plan();
        let json = plan.to_wire_json().unwrap();
        let back = Plan::from_wire_json(&json).unwrap();
        assert_eq!(back, plan);
        assert_eq!(back.step_ids(), vec!["step_1", "step_2", "step_3"]);
        assert_eq!(back.steps[2].tool_args, plan.steps[2].tool_args);
    }

    #[test]
    fn test_wire_field_names() {
        let value: Value = serde_json::from_str(&sample_plan().to_wire_json().unwrap()).unwrap();
        for key in ["id", "query", "goal", "plan_type", "steps", "estimated_duration", "confidence", "created_at"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        let step = &value["steps"][0];
        for key in ["id", "description", "tool", "tool_args", "input_template", "dependencies", "expected_output", "confidence"] {
            assert!(step.get(key).is_some(), "missing step.{key}");
        }
        assert_eq!(value["plan_type"], "sequential");
    }

    #[test]
    fn test_confidence_clamped_on_parse() {
        let json = r#"{"id":"plan_x","query":"q","goal":"g","steps":[{"id":"step_1","description":"d","confidence":7}],"confidence":-2,"created_at":1690000000.75}"#;
        let plan = Plan::from_wire_json(json).unwrap();
        assert_eq!(plan.confidence, 0.0);
        assert_eq!(plan.steps[0].confidence, 1.0);
        assert_eq!(plan.created_at, 1_690_000_000);
        assert_eq!(plan.steps[0].status, StepStatus::Pending);
    }

    #[test]
    fn test_step_builder_clamps() {
        let step = Step::new("s", "d").with_confidence(3.0);
        assert_eq!(step.confidence, 1.0);
        assert!(step.is_reasoning_only());
    }

    #[test]
    fn test_mark_step() {
        let mut plan = sample_plan();
        assert!(plan.mark_step("step_2", StepStatus::Failed));
        assert_eq!(plan.step("step_2").unwrap().status, StepStatus::Failed);
        assert!(!plan.mark_step("nope", StepStatus::Completed));
    }
}
