//! 计划 JSON Schema 生成（schemars 自动生成）
//!
//! 用于将「合法计划」的 JSON 结构注入规划 prompt，减少 LLM 输出格式错误。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};

/// 计划格式：与 Plan 线格式一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct PlanFormat {
    /// 计划要达成的目标
    pub goal: String,
    /// 只支持 "sequential"
    pub plan_type: String,
    /// 按执行顺序排列的步骤
    pub steps: Vec<StepFormat>,
    /// 预计耗时（秒）
    pub estimated_duration: f64,
    /// 0.0 ~ 1.0
    pub confidence: f64,
}

/// 步骤格式
#[allow(dead_code)]
#[derive(JsonSchema)]
struct StepFormat {
    /// 计划内唯一，仅字母数字、下划线、连字符，如 step_1
    pub id: String,
    pub description: String,
    /// 已注册工具名；纯推理步骤留空字符串
    pub tool: String,
    /// 扁平键值参数；可用 {step_1_result} 引用前序步骤结果
    pub tool_args: HashMap<String, serde_json::Value>,
    /// 纯推理步骤的输入说明，可含 {step_id_result} 占位符
    pub input_template: String,
    /// 必须先完成的步骤 ID
    pub dependencies: Vec<String>,
    pub expected_output: String,
    /// 0.0 ~ 1.0
    pub confidence: f64,
}

/// 返回计划的 JSON Schema 字符串，可拼入 system prompt
pub fn plan_schema_json() -> String {
    let schema = schema_for!(PlanFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}
