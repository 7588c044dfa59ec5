//! 计划校验
//!
//! validate_plan 给出问题清单而不是直接拒绝：调用方决定记录警告、修复还是重试。
//! is_structural() 区分「结构性问题」（重复 ID、悬空依赖、环、未知计划类型）与可就地中和的问题。

use std::collections::{BTreeSet, HashSet};

use thiserror::Error;

use crate::plan::graph::DependencyGraph;
use crate::plan::types::{Plan, PlanType, StepId};

/// 校验发现的问题
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationIssue {
    #[error("plan id '{0}' is malformed")]
    MalformedPlanId(String),

    #[error("plan type '{0}' is not supported, only sequential plans run")]
    UnsupportedPlanType(String),

    #[error("step #{index} is not a JSON object")]
    MalformedStep { index: usize },

    #[error("step #{index} has malformed id '{id}'")]
    MalformedStepId { index: usize, id: String },

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(StepId),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    DanglingDependency { step: StepId, dependency: StepId },

    #[error("dependency cycle among steps {0:?}")]
    Cycle(Vec<StepId>),

    #[error("step '{step}' references unknown tool '{tool}'")]
    UnknownTool { step: StepId, tool: String },

    #[error("step '{step}' tool_args is not a key/value object")]
    InvalidArguments { step: StepId },

    #[error("step '{step}' argument '{key}' is nested, tool_args must be flat")]
    NonFlatArgument { step: StepId, key: String },

    #[error("confidence {value} of {target} is outside [0, 1]")]
    ConfidenceOutOfRange { target: String, value: f64 },
}

impl ValidationIssue {
    /// 结构性问题会让计划无法按依赖顺序正确执行
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ValidationIssue::UnsupportedPlanType(_)
                | ValidationIssue::MalformedStep { .. }
                | ValidationIssue::MalformedStepId { .. }
                | ValidationIssue::DuplicateStepId(_)
                | ValidationIssue::DanglingDependency { .. }
                | ValidationIssue::Cycle(_)
        )
    }
}

/// ID 只允许字母、数字、下划线与连字符（保证 `{id_result}` 占位符可解析）
pub fn is_well_formed_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// 校验计划；known_tools 为 None 时不检查工具名
pub fn validate_plan(plan: &Plan, known_tools: Option<&BTreeSet<String>>) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if !is_well_formed_id(&plan.id) {
        issues.push(ValidationIssue::MalformedPlanId(plan.id.clone()));
    }
    if plan.plan_type != PlanType::Sequential {
        issues.push(ValidationIssue::UnsupportedPlanType(
            plan.plan_type.as_str().to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&plan.confidence) {
        issues.push(ValidationIssue::ConfidenceOutOfRange {
            target: format!("plan '{}'", plan.id),
            value: plan.confidence,
        });
    }

    let ids: HashSet<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
    let mut seen = HashSet::new();
    for (index, step) in plan.steps.iter().enumerate() {
        if !is_well_formed_id(&step.id) {
            issues.push(ValidationIssue::MalformedStepId {
                index,
                id: step.id.clone(),
            });
        }
        if !seen.insert(step.id.as_str()) {
            issues.push(ValidationIssue::DuplicateStepId(step.id.clone()));
        }
        for dep in &step.dependencies {
            if !ids.contains(dep.as_str()) {
                issues.push(ValidationIssue::DanglingDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        if let Some(tools) = known_tools {
            if !step.tool.is_empty() && !tools.contains(&step.tool) {
                issues.push(ValidationIssue::UnknownTool {
                    step: step.id.clone(),
                    tool: step.tool.clone(),
                });
            }
        }
        for (key, value) in &step.tool_args {
            if value.is_object() || value.is_array() {
                issues.push(ValidationIssue::NonFlatArgument {
                    step: step.id.clone(),
                    key: key.clone(),
                });
            }
        }
        if !(0.0..=1.0).contains(&step.confidence) {
            issues.push(ValidationIssue::ConfidenceOutOfRange {
                target: format!("step '{}'", step.id),
                value: step.confidence,
            });
        }
    }

    if let Err(cycle) = DependencyGraph::new(&plan.steps).topological_order() {
        issues.push(ValidationIssue::Cycle(cycle));
    }

    issues
}
