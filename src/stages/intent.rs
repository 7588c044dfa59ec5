//! 意图识别
//!
//! 先走关键词快速匹配（不调用 LLM），未命中再请 LLM 给出 JSON 判定；
//! 任何失败都降级为 SIMPLE_QUERY（置信度 0.5）。意图决定规划 prompt 的专项约束。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::llm::{complete_prompt, LlmClient};
use crate::memory::tokenizer::contains_cjk;
use crate::plan::extract_json_object;

/// 意图类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentType {
    /// 单一目标的直接查询
    #[default]
    SimpleQuery,
    /// 多对象对比
    Comparison,
    /// 根因分析
    RootCauseAnalysis,
}

impl IntentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentType::SimpleQuery => "SIMPLE_QUERY",
            IntentType::Comparison => "COMPARISON",
            IntentType::RootCauseAnalysis => "ROOT_CAUSE_ANALYSIS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().replace([' ', '-'], "_").as_str() {
            "SIMPLE_QUERY" => Some(IntentType::SimpleQuery),
            "COMPARISON" => Some(IntentType::Comparison),
            "ROOT_CAUSE_ANALYSIS" => Some(IntentType::RootCauseAnalysis),
            _ => None,
        }
    }
}

impl std::fmt::Display for IntentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 识别结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentResult {
    pub intent: IntentType,
    pub confidence: f64,
    pub reason: String,
}

impl IntentResult {
    fn fallback(reason: impl Into<String>) -> Self {
        Self {
            intent: IntentType::SimpleQuery,
            confidence: 0.5,
            reason: reason.into(),
        }
    }
}

/// 英文关键词按整词（连续词序列）匹配，中文关键词按子串匹配
const COMPARISON_KEYWORDS: &[&str] = &[
    "compare", "compared", "comparing", "comparison", "vs", "versus", "对比", "比较", "相比",
];
const ROOT_CAUSE_KEYWORDS: &[&str] = &["why", "root cause", "cause of", "原因", "为什么", "为何", "根因"];

const CLASSIFIER_PROMPT: &str = r#"You are an intent classifier for a task planner.
Classify the user request into exactly one intent:
- SIMPLE_QUERY: a single direct question or computation
- COMPARISON: compares two or more objects, periods or metrics
- ROOT_CAUSE_ANALYSIS: asks why something happened or what caused it

Output ONLY a JSON object: {"intent": "<INTENT>", "confidence": 0.0-1.0, "reason": "<short reason>"}"#;

#[derive(Deserialize)]
struct IntentVerdict {
    intent: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reason: String,
}

/// 意图识别器
pub struct IntentClassifier {
    llm: Arc<dyn LlmClient>,
    /// 启用快速规则匹配（不调用 LLM）
    enable_fast_match: bool,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            enable_fast_match: true,
        }
    }

    pub fn with_fast_match(mut self, enabled: bool) -> Self {
        self.enable_fast_match = enabled;
        self
    }

    /// 识别用户意图
    pub async fn classify(&self, query: &str) -> IntentResult {
        if self.enable_fast_match {
            if let Some(result) = fast_match(query) {
                tracing::debug!(intent = %result.intent, "intent matched by keyword rule");
                return result;
            }
        }

        match self.llm_classify(query).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "intent classification failed, defaulting to SIMPLE_QUERY");
                IntentResult::fallback(format!("classification failed: {e}"))
            }
        }
    }

    async fn llm_classify(&self, query: &str) -> Result<IntentResult, AgentError> {
        let response = complete_prompt(self.llm.as_ref(), CLASSIFIER_PROMPT, &format!("User request: {query}")).await?;
        let value = extract_json_object(&response).map_err(|e| AgentError::JsonParseError(e.to_string()))?;
        let verdict: IntentVerdict =
            serde_json::from_value(value).map_err(|e| AgentError::JsonParseError(e.to_string()))?;
        let intent = IntentType::parse(&verdict.intent)
            .ok_or_else(|| AgentError::JsonParseError(format!("unknown intent '{}'", verdict.intent)))?;
        Ok(IntentResult {
            intent,
            confidence: crate::plan::clamp_confidence(verdict.confidence.unwrap_or(0.7)),
            reason: verdict.reason,
        })
    }
}

/// 快速规则匹配
fn fast_match(query: &str) -> Option<IntentResult> {
    let lower = query.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let rules = [
        (IntentType::Comparison, COMPARISON_KEYWORDS),
        (IntentType::RootCauseAnalysis, ROOT_CAUSE_KEYWORDS),
    ];
    rules.into_iter().find_map(|(intent, keywords)| {
        keywords
            .iter()
            .find(|k| has_keyword(&lower, &words, k))
            .map(|k| IntentResult {
                intent,
                confidence: 0.9,
                reason: format!("keyword '{k}'"),
            })
    })
}

fn has_keyword(lower: &str, words: &[&str], keyword: &str) -> bool {
    if contains_cjk(keyword) {
        return lower.contains(keyword);
    }
    let phrase: Vec<&str> = keyword.split_whitespace().collect();
    words.windows(phrase.len()).any(|w| w == phrase.as_slice())
}
