//! 计划构建器
//!
//! 提供流畅的 API 在代码中构建计划（PlanGenerator 的应急计划经此构建并校验）

use serde_json::Value;

use crate::plan::types::{clamp_confidence, Plan, PlanError, PlanType, Step, StepId};
use crate::plan::validate::validate_plan;

/// 计划构建器
pub struct PlanBuilder {
    plan: Plan,
}

impl PlanBuilder {
    /// 创建新的计划构建器；goal 默认等于 query
    pub fn new(query: impl Into<String>) -> Self {
        let query = query.into();
        Self {
            plan: Plan::new(query.clone(), query, Vec::new()),
        }
    }

    /// 指定计划 ID（默认随机生成）
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.plan.id = id.into();
        self
    }

    /// 设置目标
    pub fn goal(mut self, goal: impl Into<String>) -> Self {
        self.plan.goal = goal.into();
        self
    }

    /// 添加步骤
    pub fn step(mut self, step: Step) -> Self {
        self.plan.steps.push(step);
        self
    }

    /// 设置顺序依赖：to 依赖 from
    pub fn sequential(mut self, from: impl Into<StepId>, to: impl AsRef<str>) -> Self {
        let from = from.into();
        if let Some(step) = self.plan.steps.iter_mut().find(|s| s.id == to.as_ref()) {
            if !step.dependencies.contains(&from) {
                step.dependencies.push(from);
            }
        }
        self
    }

    /// 设置 AND 依赖（所有前置步骤）
    pub fn depends_on_all(mut self, step_id: impl AsRef<str>, deps: Vec<StepId>) -> Self {
        if let Some(step) = self.plan.steps.iter_mut().find(|s| s.id == step_id.as_ref()) {
            for dep in deps {
                if !step.dependencies.contains(&dep) {
                    step.dependencies.push(dep);
                }
            }
        }
        self
    }

    pub fn plan_type(mut self, plan_type: PlanType) -> Self {
        self.plan.plan_type = plan_type;
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.plan.confidence = clamp_confidence(confidence);
        self
    }

    pub fn estimated_duration(mut self, secs: f64) -> Self {
        self.plan.estimated_duration = secs;
        self
    }

    pub fn metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.plan.set_meta(key, value);
        self
    }

    /// 构建计划；结构性问题（重复 ID、悬空依赖、环、非 sequential）直接拒绝
    pub fn build(self) -> Result<Plan, PlanError> {
        let structural: Vec<_> = validate_plan(&self.plan, None)
            .into_iter()
            .filter(|i| i.is_structural())
            .collect();
        if !structural.is_empty() {
            return Err(PlanError::Invalid(structural));
        }
        Ok(self.plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::validate::ValidationIssue;
    use serde_json::json;

    #[test]
    fn test_build_sequential_plan() {
        let plan = PlanBuilder::new("compare A and B")
            .goal("compare")
            .step(Step::new("step_1", "fetch A"))
            .step(Step::new("step_2", "fetch B"))
            .step(Step::new("step_3", "diff").with_tool("calculate", [("expression", json!("{step_1_result}-{step_2_result}"))]))
            .sequential("step_1", "step_2")
            .depends_on_all("step_3", vec!["step_1".into(), "step_2".into()])
            .confidence(0.8)
            .metadata("intent_type", "COMPARISON")
            .build()
            .expect("Failed to build plan");

        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[1].dependencies, vec!["step_1"]);
        assert_eq!(plan.steps[2].dependencies, vec!["step_1", "step_2"]);
        assert_eq!(plan.meta_str("intent_type"), Some("COMPARISON"));
    }

    #[test]
    fn test_build_rejects_cycle() {
        let result = PlanBuilder::new("q")
            .step(Step::new("a", "a"))
            .step(Step::new("b", "b"))
            .sequential("a", "b")
            .sequential("b", "a")
            .build();

        match result {
            Err(PlanError::Invalid(issues)) => {
                assert!(issues.iter().any(|i| matches!(i, ValidationIssue::Cycle(_))))
            }
            Ok(_) => panic!("cycle should be rejected"),
        }
    }

    #[test]
    fn test_build_rejects_parallel() {
        let result = PlanBuilder::new("q").plan_type(PlanType::Parallel).build();
        assert!(result.is_err());
    }
}
