//! 各阶段的 prompt 构建
//!
//! 规划、重规划、评估、答案合成与纯推理步骤共用；措辞集中在此处，阶段组件只负责拼装数据。

use serde_json::{Map, Value};

use crate::core::state::{Evaluation, ExecutionRecord};
use crate::memory::PlanHint;
use crate::plan::{Plan, Step};
use crate::stages::intent::IntentType;

/// 重规划输出格式校验失败后追加的强化警告
pub const FORMAT_WARNING: &str = "WARNING: your previous reply could not be used as a plan. \
Reply with ONE JSON object only, no prose and no code fences. Every step needs a unique id \
(letters, digits, '_' or '-'), dependencies may only name ids of steps in the same plan, \
and there must be no dependency cycles.";

/// 按字符截断，超出部分以 "..." 结尾
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    format!("{}...", s.chars().take(max_chars).collect::<String>())
}

const PLANNING_BASE: &str = r#"You are a senior task planner. You turn a user request into a precise, executable plan.

Rules:
1. Only use tools from the available tool list. Use an empty "tool" for steps that need reasoning only.
2. Keep steps logically ordered and declare dependencies explicitly.
3. tool_args must be a flat key/value object. A value may reference an earlier step's result as {step_id_result}, e.g. {step_1_result}.
4. Confidence values (0.0-1.0) must honestly reflect how feasible each step is.
5. Output strict JSON only, without any explanation."#;

pub fn planning_system_prompt(intent: IntentType) -> String {
    let focus = match intent {
        IntentType::SimpleQuery => {
            "Focus:\n- Aim at the single goal of the request, avoid redundant steps\n- Prefer tools that compute or fetch the answer directly\n- Make sure tool arguments are complete"
        }
        IntentType::Comparison => {
            "Focus:\n- Include two phases: obtain the data for every compared object, then analyse the differences\n- Compare along dimensions that matter to the request\n- State the evaluation criterion in the analysis step"
        }
        IntentType::RootCauseAnalysis => {
            "Focus:\n- Include two phases: obtain the data, then analyse the risk factors\n- When the analysis is uncertain, add drill-down steps per sub-dimension\n- Add a step that verifies the suspected cause-effect relation"
        }
    };
    format!("{PLANNING_BASE}\n\n{focus}")
}

pub fn planning_user_prompt(
    query: &str,
    tools_schema: &str,
    plan_schema: &str,
    context: &Map<String, Value>,
    hints: &[PlanHint],
) -> String {
    let context_str = if context.is_empty() {
        "none".to_string()
    } else {
        serde_json::to_string(context).unwrap_or_else(|_| "none".to_string())
    };
    let hints_str = if hints.is_empty() {
        "none".to_string()
    } else {
        hints.iter().map(|h| h.summary()).collect::<Vec<_>>().join("\n")
    };

    format!(
        r#"### Request
{query}

### Available tools
{tools_schema}

### Context
{context_str}

### Similar successful plans
{hints_str}

### Output format
Reply with one JSON object matching this schema ("plan_type" must be "sequential"):
{plan_schema}

Example:
{{"goal": "compute the sum", "plan_type": "sequential", "steps": [{{"id": "step_1", "description": "add the numbers", "tool": "calculate", "tool_args": {{"expression": "2+2"}}, "input_template": "", "dependencies": [], "expected_output": "the sum", "confidence": 0.9}}], "estimated_duration": 10, "confidence": 0.9}}"#
    )
}

pub fn replanning_system_prompt(intent: IntentType) -> String {
    format!(
        r#"You are a senior task planner repairing a plan that did not fully succeed (request intent: {intent}).
You receive the original plan, what has already been executed, and the evaluator's findings.
Decide ONE of two outcomes:
- "plan": a revised plan that contains only the work still to do. Do not repeat completed steps; you may reference their results as {{step_id_result}}. Repair broken steps (fix arguments or choose another tool) and add compensating steps only when needed.
- "final_answer": a natural-language answer for the user, when the remaining work cannot be meaningfully repaired or the results already answer the request.

Output strict JSON only:
{{"outcome": "plan", "plan": {{"goal": "...", "plan_type": "sequential", "steps": [...], "confidence": 0.0-1.0}}}}
or
{{"outcome": "final_answer", "answer": "..."}}"#
    )
}

/// 重规划 prompt 所需的视图（由 Replanner 从 SessionState 组装）
pub struct ReplanView<'a> {
    pub query: &'a str,
    pub plan: &'a Plan,
    pub completed: Vec<&'a ExecutionRecord>,
    pub failed: Vec<&'a ExecutionRecord>,
    pub remaining: Vec<&'a Step>,
    pub blocked: Vec<String>,
    pub evaluation: &'a Evaluation,
    pub last_error: Option<&'a str>,
    pub tools_schema: &'a str,
    pub max_steps: usize,
    pub preview_chars: usize,
}

pub fn replanning_user_prompt(view: &ReplanView<'_>, format_warning: bool) -> String {
    let original_steps = view
        .plan
        .steps
        .iter()
        .map(|s| {
            let tool = if s.tool.is_empty() { "(reasoning)" } else { s.tool.as_str() };
            let args = serde_json::to_string(&s.tool_args).unwrap_or_default();
            format!("- {} [{}] tool: {} args: {} | {}", s.id, status_str(s), tool, args, s.description)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let completed = bullet_list(view.completed.iter().map(|r| {
        format!(
            "- {} ({}): {}",
            r.step_id(),
            tool_label(r.tool_used()),
            truncate_chars(&r.result_text(), view.preview_chars)
        )
    }));

    let failed = bullet_list(view.failed.iter().map(|r| {
        format!(
            "- {} ({}): {}",
            r.step_id(),
            tool_label(r.tool_used()),
            truncate_chars(&r.result_text(), view.preview_chars)
        )
    }));

    let remaining = bullet_list(
        view.remaining
            .iter()
            .map(|s| format!("- {}: {}", s.id, s.description)),
    );

    let blocked = if view.blocked.is_empty() {
        "none".to_string()
    } else {
        view.blocked.join(", ")
    };

    let issues = bullet_list(view.evaluation.issues.iter().map(|i| format!("- {i}")));
    let suggestions = bullet_list(view.evaluation.suggestions.iter().map(|s| format!("- {s}")));
    let last_error = view.last_error.unwrap_or("none");

    let mut prompt = format!(
        r#"### Request
{query}

### Original plan ({plan_id}, goal: {goal})
{original_steps}

### Completed steps
{completed}

### Failed steps
{failed}

### Remaining steps
{remaining}

### Blocked by failed dependencies
{blocked}

### Evaluation
Reason: {reason}
Issues:
{issues}
Suggestions:
{suggestions}

### Last error
{last_error}

### Available tools
{tools_schema}

### Constraints
- At most {max_steps} steps in the revised plan.
- Do not include completed steps again."#,
        query = view.query,
        plan_id = view.plan.id,
        goal = view.plan.goal,
        reason = view.evaluation.reason,
        tools_schema = view.tools_schema,
        max_steps = view.max_steps,
    );
    if format_warning {
        prompt.push_str("\n\n");
        prompt.push_str(FORMAT_WARNING);
    }
    prompt
}

pub const EVALUATOR_SYSTEM: &str = r#"You judge whether the execution output answers the user's request.
Output strict JSON only:
{"need_replan": true|false, "reason": "...", "issues": ["..."], "suggestions": ["..."]}
Set need_replan to true when the output is missing, wrong, an error message, or does not answer the request."#;

pub fn evaluator_user_prompt(query: &str, output: &str, plan: &Plan, records: &[ExecutionRecord]) -> String {
    let steps = bullet_list(records.iter().map(|r| {
        format!(
            "- {} ({}) {:?}: {}",
            r.step_id(),
            tool_label(r.tool_used()),
            r.status(),
            truncate_chars(&r.result_text(), 200)
        )
    }));
    format!(
        "### Request\n{query}\n\n### Plan\nid: {}, goal: {}, confidence: {}, fallback: {}\n\n### Executed steps\n{steps}\n\n### Final output\n{output}",
        plan.id,
        plan.goal,
        plan.confidence,
        plan.is_fallback()
    )
}

pub const ANSWER_SYSTEM: &str = "You write the final answer for the user based only on the execution results. \
Be concise and state the result directly. Do not invent data that is not in the results.";

pub fn answer_user_prompt(query: &str, output: &str) -> String {
    format!("### Request\n{query}\n\n### Execution result\n{output}\n\nWrite the answer.")
}

pub const REASONING_STEP_SYSTEM: &str = "You carry out one step of a plan by reasoning only (no tools are available for this step). \
Reply with the step's result as plain text, without preamble.";

pub fn reasoning_step_prompt(query: &str, step: &Step, input: &str, dependency_results: &[(String, String)]) -> String {
    let deps = bullet_list(
        dependency_results
            .iter()
            .map(|(id, text)| format!("- {id}: {}", truncate_chars(text, 500))),
    );
    let expected = if step.expected_output.is_empty() {
        "not specified"
    } else {
        step.expected_output.as_str()
    };
    let input = if input.is_empty() { "none" } else { input };
    format!(
        "### Request\n{query}\n\n### Step {}\n{}\n\nInput: {input}\nExpected output: {expected}\n\n### Results of earlier steps\n{deps}",
        step.id, step.description
    )
}

fn bullet_list(items: impl Iterator<Item = String>) -> String {
    let lines: Vec<String> = items.collect();
    if lines.is_empty() {
        "none".to_string()
    } else {
        lines.join("\n")
    }
}

fn tool_label(tool: &str) -> &str {
    if tool.is_empty() {
        "reasoning"
    } else {
        tool
    }
}

fn status_str(step: &Step) -> &'static str {
    match step.status {
        crate::plan::StepStatus::Pending => "pending",
        crate::plan::StepStatus::Completed => "completed",
        crate::plan::StepStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abc", 5), "abc");
        assert_eq!(truncate_chars("abcdef", 3), "abc...");
        assert_eq!(truncate_chars("计算结果很长", 2), "计算...");
    }

    #[test]
    fn test_intent_specific_planning_prompt() {
        assert!(planning_system_prompt(IntentType::Comparison).contains("compared object"));
        assert!(planning_system_prompt(IntentType::RootCauseAnalysis).contains("cause-effect"));
    }

    #[test]
    fn test_planning_prompt_lists_hints() {
        let hint = PlanHint {
            plan_id: "plan_1".into(),
            query: "q".into(),
            goal: "add".into(),
            tools: vec!["calculate".into()],
            step_count: 1,
            score: 0.5,
        };
        let prompt = planning_user_prompt("2+2", "[]", "{}", &Map::new(), &[hint]);
        assert!(prompt.contains("plan_1"));
        assert!(prompt.contains("### Context\nnone"));
    }
}
