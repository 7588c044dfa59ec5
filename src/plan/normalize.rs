//! LLM 输出 → 可执行 Plan 的容错归一化
//!
//! 只要核心 JSON 结构（对象 + steps 数组）能解析，就尽量修复而不是拒绝：
//! - 缺失/非法的步骤 ID 按位置补为 `step_N`，重复 ID 追加后缀
//! - 未注册的工具被清空（连同参数），步骤退化为纯推理
//! - 悬空依赖被移除，依赖环按计划顺序切断回边
//! - 置信度夹到 [0, 1]，计划类型统一为 sequential
//!
//! 每一处修复都会留下一条 ValidationIssue，由调用方决定记录警告还是重试。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde_json::{Map, Value};

use crate::plan::graph::DependencyGraph;
use crate::plan::parse::{extract_json_object, PlanParseError};
use crate::plan::types::{
    clamp_confidence, new_plan_id, now_secs, Plan, PlanType, Step, StepId, StepStatus,
    DEFAULT_CONFIDENCE, DEFAULT_ESTIMATED_DURATION,
};
use crate::plan::validate::{is_well_formed_id, ValidationIssue};

/// 归一化结果：修复后的计划 + 修复过程中发现的问题
#[derive(Debug, Clone)]
pub struct NormalizedPlan {
    pub plan: Plan,
    pub issues: Vec<ValidationIssue>,
}

impl NormalizedPlan {
    pub fn has_structural_issues(&self) -> bool {
        self.issues.iter().any(|i| i.is_structural())
    }
}

/// 计划归一化器
#[derive(Debug, Clone)]
pub struct PlanNormalizer {
    known_tools: BTreeSet<String>,
    default_confidence: f64,
    min_estimated_duration: f64,
}

impl PlanNormalizer {
    pub fn new(known_tools: BTreeSet<String>) -> Self {
        Self {
            known_tools,
            default_confidence: DEFAULT_CONFIDENCE,
            min_estimated_duration: 0.0,
        }
    }

    pub fn with_default_confidence(mut self, confidence: f64) -> Self {
        self.default_confidence = clamp_confidence(confidence);
        self
    }

    pub fn with_min_estimated_duration(mut self, secs: f64) -> Self {
        self.min_estimated_duration = secs.max(0.0);
        self
    }

    pub fn known_tools(&self) -> &BTreeSet<String> {
        &self.known_tools
    }

    /// 从 LLM 原始回复解析
    pub fn from_response(&self, query: &str, text: &str) -> Result<NormalizedPlan, PlanParseError> {
        let value = extract_json_object(text)?;
        self.from_value(query, &value)
    }

    /// 从已提取的 JSON 对象构造计划；query 永远取调用方传入的原始请求
    pub fn from_value(&self, query: &str, value: &Value) -> Result<NormalizedPlan, PlanParseError> {
        let obj = value.as_object().ok_or(PlanParseError::NotAnObject)?;
        let raw_steps = obj
            .get("steps")
            .and_then(|v| v.as_array())
            .ok_or(PlanParseError::MissingSteps)?;

        let mut issues = Vec::new();

        let id = match obj.get("id").and_then(|v| v.as_str()) {
            Some(id) if is_well_formed_id(id) => id.to_string(),
            Some(id) => {
                issues.push(ValidationIssue::MalformedPlanId(id.to_string()));
                new_plan_id()
            }
            None => new_plan_id(),
        };

        match obj.get("plan_type").and_then(|v| v.as_str()) {
            None | Some("sequential") => {}
            Some(other) => issues.push(ValidationIssue::UnsupportedPlanType(other.to_string())),
        }

        let mut steps = Vec::with_capacity(raw_steps.len());
        let mut seen: HashSet<StepId> = HashSet::new();
        for (index, raw) in raw_steps.iter().enumerate() {
            let Some(raw) = raw.as_object() else {
                issues.push(ValidationIssue::MalformedStep { index });
                continue;
            };
            let step = self.normalize_step(index, raw, &mut seen, &mut issues);
            steps.push(step);
        }

        drop_dangling_dependencies(&mut steps, &mut issues);
        break_cycles(&mut steps, &mut issues);

        let goal = obj
            .get("goal")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .unwrap_or(query)
            .to_string();

        let estimated_duration = obj
            .get("estimated_duration")
            .and_then(|v| v.as_f64())
            .filter(|d| d.is_finite() && *d > 0.0)
            .unwrap_or(DEFAULT_ESTIMATED_DURATION)
            .max(self.min_estimated_duration);

        let confidence = self.read_confidence(obj.get("confidence"), || format!("plan '{id}'"), &mut issues);

        let metadata = obj
            .get("metadata")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_else(Map::new);

        let now = now_secs();
        let created_at = obj
            .get("created_at")
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .unwrap_or(now);

        let plan = Plan {
            id,
            query: query.to_string(),
            goal,
            plan_type: PlanType::Sequential,
            steps,
            estimated_duration,
            confidence,
            metadata,
            created_at,
            updated_at: now,
        };

        Ok(NormalizedPlan { plan, issues })
    }

    fn normalize_step(
        &self,
        index: usize,
        raw: &Map<String, Value>,
        seen: &mut HashSet<StepId>,
        issues: &mut Vec<ValidationIssue>,
    ) -> Step {
        let raw_id = raw.get("id").and_then(scalar_to_string);
        let mut id = match raw_id {
            Some(id) if is_well_formed_id(&id) => id,
            other => {
                issues.push(ValidationIssue::MalformedStepId {
                    index,
                    id: other.unwrap_or_default(),
                });
                format!("step_{}", index + 1)
            }
        };
        if seen.contains(&id) {
            issues.push(ValidationIssue::DuplicateStepId(id.clone()));
            let base = id.clone();
            let mut n = 2;
            while seen.contains(&id) {
                id = format!("{base}_{n}");
                n += 1;
            }
        }
        seen.insert(id.clone());

        let mut tool = raw
            .get("tool")
            .and_then(|v| v.as_str())
            .map(|t| t.trim().to_string())
            .unwrap_or_default();

        let mut tool_args = BTreeMap::new();
        if !tool.is_empty() && !self.known_tools.contains(&tool) {
            issues.push(ValidationIssue::UnknownTool {
                step: id.clone(),
                tool: tool.clone(),
            });
            tool.clear();
        } else {
            let raw_args = raw.get("tool_args").or_else(|| raw.get("args"));
            match read_args(raw_args) {
                Some(args) => tool_args = args,
                None => issues.push(ValidationIssue::InvalidArguments { step: id.clone() }),
            }
            for (key, value) in &tool_args {
                if value.is_object() || value.is_array() {
                    issues.push(ValidationIssue::NonFlatArgument {
                        step: id.clone(),
                        key: key.clone(),
                    });
                }
            }
        }

        let mut dependencies: Vec<StepId> = Vec::new();
        let raw_deps: Vec<StepId> = match raw.get("dependencies") {
            Some(Value::Array(items)) => items.iter().filter_map(scalar_to_string).collect(),
            Some(other) => scalar_to_string(other).into_iter().collect(),
            None => Vec::new(),
        };
        for dep in raw_deps {
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }

        let confidence = self.read_confidence(raw.get("confidence"), || format!("step '{id}'"), issues);

        Step {
            description: text_field(raw, "description"),
            input_template: text_field(raw, "input_template"),
            expected_output: text_field(raw, "expected_output"),
            id,
            tool,
            tool_args,
            dependencies,
            confidence,
            status: StepStatus::Pending,
        }
    }

    fn read_confidence(
        &self,
        raw: Option<&Value>,
        target: impl FnOnce() -> String,
        issues: &mut Vec<ValidationIssue>,
    ) -> f64 {
        match raw.and_then(|v| v.as_f64()) {
            Some(value) if (0.0..=1.0).contains(&value) => value,
            Some(value) => {
                issues.push(ValidationIssue::ConfidenceOutOfRange {
                    target: target(),
                    value,
                });
                clamp_confidence(value)
            }
            None => self.default_confidence,
        }
    }
}

fn text_field(raw: &Map<String, Value>, key: &str) -> String {
    raw.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 参数允许是对象，或是编码成 JSON 字符串的对象；其它形态返回 None
fn read_args(raw: Option<&Value>) -> Option<BTreeMap<String, Value>> {
    match raw {
        None | Some(Value::Null) => Some(BTreeMap::new()),
        Some(Value::Object(map)) => Some(map.clone().into_iter().collect()),
        Some(Value::String(s)) if s.trim().is_empty() => Some(BTreeMap::new()),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => Some(map.into_iter().collect()),
            _ => None,
        },
        Some(_) => None,
    }
}

fn drop_dangling_dependencies(steps: &mut [Step], issues: &mut Vec<ValidationIssue>) {
    let ids: HashSet<StepId> = steps.iter().map(|s| s.id.clone()).collect();
    for step in steps.iter_mut() {
        let step_id = step.id.clone();
        step.dependencies.retain(|dep| {
            let keep = ids.contains(dep);
            if !keep {
                issues.push(ValidationIssue::DanglingDependency {
                    step: step_id.clone(),
                    dependency: dep.clone(),
                });
            }
            keep
        });
    }
}

/// 环上的步骤只保留指向计划中更早位置的依赖，剩余边全部「前指后」，必然无环
fn break_cycles(steps: &mut [Step], issues: &mut Vec<ValidationIssue>) {
    let Err(cycle) = DependencyGraph::new(steps).topological_order() else {
        return;
    };
    let position: HashMap<StepId, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.clone(), i))
        .collect();
    let members: HashSet<&StepId> = cycle.iter().collect();
    for (index, step) in steps.iter_mut().enumerate() {
        if !members.contains(&step.id) {
            continue;
        }
        step.dependencies.retain(|dep| {
            !members.contains(dep) || position.get(dep).is_some_and(|p| *p < index)
        });
    }
    issues.push(ValidationIssue::Cycle(cycle));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::validate::validate_plan;
    use serde_json::json;

    fn normalizer() -> PlanNormalizer {
        PlanNormalizer::new(["calculate".to_string()].into_iter().collect())
    }

    #[test]
    fn test_well_formed_response() {
        let text = r#"Here you go:
```json
{"goal": "add numbers", "plan_type": "sequential", "confidence": 0.9,
 "steps": [{"id": "step_1", "description": "add", "tool": "calculate",
            "tool_args": {"expression": "2+2"}, "dependencies": [], "confidence": 0.9}]}
```"#;
        let out = normalizer().from_response("2+2 is what?", text).unwrap();
        assert!(out.issues.is_empty(), "{:?}", out.issues);
        assert_eq!(out.plan.query, "2+2 is what?");
        assert_eq!(out.plan.steps[0].tool, "calculate");
        assert_eq!(out.plan.steps[0].tool_args["expression"], json!("2+2"));
    }

    #[test]
    fn test_unknown_tool_cleared_with_args() {
        let value = json!({"goal": "g", "steps": [
            {"id": "step_1", "description": "weather", "tool": "weather_lookup", "tool_args": {"city": "Paris"}}
        ]});
        let out = normalizer().from_value("q", &value).unwrap();
        let step = &out.plan.steps[0];
        assert!(step.is_reasoning_only());
        assert!(step.tool_args.is_empty());
        assert!(out.issues.iter().any(|i| matches!(i, ValidationIssue::UnknownTool { .. })));
        assert!(!out.has_structural_issues());
    }

    #[test]
    fn test_ids_repaired_and_dangling_dropped() {
        let value = json!({"steps": [
            {"id": "step_1", "description": "a"},
            {"id": "step_1", "description": "b", "dependencies": ["step_1", "ghost"]},
            {"description": "c", "dependencies": "step_1"},
            "not a step"
        ]});
        let out = normalizer().from_value("q", &value).unwrap();
        assert_eq!(out.plan.step_ids(), vec!["step_1", "step_1_2", "step_3"]);
        assert_eq!(out.plan.steps[1].dependencies, vec!["step_1"]);
        assert_eq!(out.plan.steps[2].dependencies, vec!["step_1"]);
        assert!(out.has_structural_issues());
        assert_eq!(out.plan.goal, "q");
        assert!(validate_plan(&out.plan, Some(normalizer().known_tools())).is_empty());
    }

    #[test]
    fn test_cycle_broken_in_plan_order() {
        let value = json!({"steps": [
            {"id": "a", "description": "a", "dependencies": ["b"]},
            {"id": "b", "description": "b", "dependencies": ["a"]}
        ]});
        let out = normalizer().from_value("q", &value).unwrap();
        assert!(out.plan.steps[0].dependencies.is_empty());
        assert_eq!(out.plan.steps[1].dependencies, vec!["a"]);
        assert!(out.issues.iter().any(|i| matches!(i, ValidationIssue::Cycle(_))));
    }

    #[test]
    fn test_args_as_string_and_confidence_clamped() {
        let value = json!({"confidence": 4, "plan_type": "parallel", "steps": [
            {"id": "s1", "description": "x", "tool": "calculate",
             "tool_args": "{\"expression\": \"3*3\"}", "confidence": -1}
        ]});
        let out = normalizer().from_value("q", &value).unwrap();
        assert_eq!(out.plan.confidence, 1.0);
        assert_eq!(out.plan.steps[0].confidence, 0.0);
        assert_eq!(out.plan.steps[0].tool_args["expression"], json!("3*3"));
        assert_eq!(out.plan.plan_type, PlanType::Sequential);
    }

    #[test]
    fn test_missing_steps() {
        let err = normalizer().from_value("q", &json!({"goal": "g"})).unwrap_err();
        assert_eq!(err, PlanParseError::MissingSteps);
    }

    #[test]
    fn test_min_duration() {
        let out = normalizer()
            .with_min_estimated_duration(10.0)
            .from_value("q", &json!({"estimated_duration": 2, "steps": []}))
            .unwrap();
        assert_eq!(out.plan.estimated_duration, 10.0);
        assert!(out.plan.is_done_signal());
    }
}
