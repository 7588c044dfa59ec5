//! 最终答案合成
//!
//! synthesize = true 时请 LLM 基于执行结果写答案；LLM 失败、回复为空或关闭合成时，
//! 使用确定性模板：`Result:\n<输出>`，无输出时给出致歉文本。

use std::sync::Arc;

use crate::llm::{complete_prompt, LlmClient};
use crate::stages::prompts;

/// 无任何输出时的回复
pub const NO_RESULT_ANSWER: &str = "Sorry, I could not gather enough information to answer your request.";

pub struct AnswerComposer {
    llm: Arc<dyn LlmClient>,
    synthesize: bool,
}

impl AnswerComposer {
    pub fn new(llm: Arc<dyn LlmClient>, synthesize: bool) -> Self {
        Self { llm, synthesize }
    }

    pub async fn compose(&self, query: &str, output: &str) -> String {
        if output.trim().is_empty() {
            return NO_RESULT_ANSWER.to_string();
        }
        if self.synthesize {
            let user = prompts::answer_user_prompt(query, output);
            match complete_prompt(self.llm.as_ref(), prompts::ANSWER_SYSTEM, &user).await {
                Ok(text) if !text.trim().is_empty() => return text.trim().to_string(),
                Ok(_) => tracing::warn!("answer synthesis returned empty text, using raw result"),
                Err(e) => tracing::warn!(error = %e, "answer synthesis failed, using raw result"),
            }
        }
        deterministic_answer(output)
    }
}

pub fn deterministic_answer(output: &str) -> String {
    if output.trim().is_empty() {
        NO_RESULT_ANSWER.to_string()
    } else {
        format!("Result:\n{output}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};

    #[tokio::test]
    async fn test_deterministic_when_disabled() {
        let llm = Arc::new(MockLlmClient::default());
        let composer = AnswerComposer::new(llm.clone(), false);
        assert_eq!(composer.compose("2+2", "4").await, "Result:\n4");
        assert_eq!(composer.compose("2+2", "").await, NO_RESULT_ANSWER);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_synthesized_and_fallback() {
        let llm = Arc::new(MockLlmClient::scripted(vec![
            Ok("2 + 2 equals 4.".into()),
            Err(LlmError::ApiError("down".into())),
        ]));
        let composer = AnswerComposer::new(llm, true);
        assert_eq!(composer.compose("2+2", "4").await, "2 + 2 equals 4.");
        assert_eq!(composer.compose("2+2", "4").await, "Result:\n4");
    }
}
