//! 计划生成
//!
//! 组装规划 prompt（意图专项约束、工具 schema、计划 schema、上下文、相似计划），
//! 调用 LLM 并经 PlanNormalizer 容错解析。LLM 失败或回复完全无法解析时，
//! 确定性地返回单步应急计划（metadata.fallback = true，置信度 0.3 ~ 0.5）。

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::config::PlannerConfig;
use crate::llm::{complete_prompt, LlmClient};
use crate::memory::PlanLibrary;
use crate::plan::{
    Plan, PlanBuilder, PlanNormalizer, Step, META_ERROR, META_FALLBACK, META_GENERATED_BY,
    META_INTENT_TYPE,
};
use crate::stages::intent::IntentType;
use crate::stages::prompts;
use crate::tools::plan_schema_json;

/// 应急计划置信度区间
const EMERGENCY_CONFIDENCE_RANGE: (f64, f64) = (0.3, 0.5);

/// 计划生成器
pub struct PlanGenerator {
    llm: Arc<dyn LlmClient>,
    normalizer: PlanNormalizer,
    tools_schema: String,
    plan_schema: String,
    library: Option<PlanLibrary>,
    config: PlannerConfig,
}

impl PlanGenerator {
    /// normalizer 携带已注册工具集合；tools_schema 为注册表导出的工具描述
    pub fn new(
        llm: Arc<dyn LlmClient>,
        normalizer: PlanNormalizer,
        tools_schema: String,
        config: PlannerConfig,
    ) -> Self {
        let normalizer = normalizer
            .with_default_confidence(config.default_confidence)
            .with_min_estimated_duration(config.min_estimated_duration_secs);
        Self {
            llm,
            normalizer,
            tools_schema,
            plan_schema: plan_schema_json(),
            library: None,
            config,
        }
    }

    pub fn with_library(mut self, library: PlanLibrary) -> Self {
        self.library = Some(library);
        self
    }

    pub fn normalizer(&self) -> &PlanNormalizer {
        &self.normalizer
    }

    /// 生成计划；永不失败，最坏情况返回应急计划
    pub async fn generate(&self, query: &str, intent: IntentType, context: &Map<String, Value>) -> Plan {
        let hints = match &self.library {
            Some(library) => library.similar(query, self.config.max_similar_plans),
            None => Vec::new(),
        };
        let system = prompts::planning_system_prompt(intent);
        let user = prompts::planning_user_prompt(query, &self.tools_schema, &self.plan_schema, context, &hints);

        let response = match complete_prompt(self.llm.as_ref(), &system, &user).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "planning call failed, using emergency plan");
                return self.emergency_plan(query, intent, &e.to_string());
            }
        };

        let normalized = match self.normalizer.from_response(query, &response) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "plan response unparsable, using emergency plan");
                return self.emergency_plan(query, intent, &e.to_string());
            }
        };

        for issue in &normalized.issues {
            tracing::warn!(issue = %issue, "plan validation");
        }

        let mut plan = normalized.plan;
        plan.set_meta(META_INTENT_TYPE, intent.as_str());
        plan.set_meta(META_GENERATED_BY, "planner");
        tracing::info!(
            plan_id = %plan.id,
            steps = plan.steps.len(),
            confidence = plan.confidence,
            intent = %intent,
            "plan generated"
        );
        plan
    }

    /// 单步应急计划：有可用的通用工具则调用之，否则为纯推理步骤
    pub fn emergency_plan(&self, query: &str, intent: IntentType, error: &str) -> Plan {
        let (low, high) = EMERGENCY_CONFIDENCE_RANGE;
        let confidence = self.config.emergency_confidence.clamp(low, high);

        let mut step = Step::new("emergency_step_1", format!("Answer the request directly: {query}"))
            .with_input_template(query)
            .with_expected_output("a best-effort answer to the request")
            .with_confidence(confidence);
        if let Some(tool) = self
            .config
            .fallback_tool
            .as_deref()
            .filter(|t| self.normalizer.known_tools().contains(*t))
        {
            step = step.with_tool(tool, [("query", json!(query))]);
        }

        let goal = format!("Best-effort answer for: {query}");
        let built = PlanBuilder::new(query)
            .id(format!("emergency_plan_{}", uuid::Uuid::new_v4().simple()))
            .goal(goal.clone())
            .step(step.clone())
            .confidence(confidence)
            .estimated_duration(self.config.min_estimated_duration_secs.max(1.0))
            .metadata(META_FALLBACK, true)
            .metadata(META_ERROR, error)
            .metadata(META_INTENT_TYPE, intent.as_str())
            .metadata(META_GENERATED_BY, "emergency")
            .build();
        let plan = match built {
            Ok(plan) => plan,
            Err(e) => {
                // 单步无依赖的计划不会有结构性问题；保底仍返回可执行的一步
                tracing::error!(error = %e, "emergency plan rejected by builder");
                let mut plan = Plan::new(query, goal, vec![step]);
                plan.set_meta(META_FALLBACK, true);
                plan
            }
        };
        tracing::warn!(plan_id = %plan.id, confidence, "emergency plan created");
        plan
    }
}
