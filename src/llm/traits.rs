//! LLM 客户端抽象
//!
//! 编排内核只依赖 LlmClient::complete（非流式）。超时与重试放在能力边界上：
//! RetryingLlmClient 包装任意后端，每次尝试都带超时，可重试错误按退避间隔重试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{sleep, timeout};

use crate::config::LlmSection;
use crate::memory::Message;

/// LLM 调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM API error: {0}")]
    ApiError(String),

    #[error("LLM rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("LLM returned empty content")]
    EmptyResponse,
}

impl LlmError {
    /// 超时、限流与接口错误可以重试；空回复重试通常无意义
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::EmptyResponse)
    }
}

/// LLM 客户端 trait（推理能力）：给定消息列表返回自由文本
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 便捷调用：system + user 两条消息
pub async fn complete_prompt(
    llm: &dyn LlmClient,
    system: &str,
    user: &str,
) -> Result<String, LlmError> {
    let messages = [
        Message::system(system.trim().to_string()),
        Message::user(user.trim().to_string()),
    ];
    llm.complete(&messages).await
}

/// 重试配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 单次请求超时
    pub request_timeout: Duration,
    /// 首次失败后的最大重试次数
    pub max_retries: u32,
    /// 重试间隔基数（按尝试次数线性增长）
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

impl From<&LlmSection> for RetryConfig {
    fn from(cfg: &LlmSection) -> Self {
        Self {
            request_timeout: Duration::from_secs(cfg.timeouts.request.max(1)),
            max_retries: cfg.retry.max_retries,
            backoff: Duration::from_millis(cfg.retry.backoff_ms),
        }
    }
}

/// 带超时与重试的 LLM 包装器
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    fn delay_for(&self, attempt: u32, err: &LlmError) -> Duration {
        match err {
            LlmError::RateLimited { retry_after_ms } => Duration::from_millis(*retry_after_ms),
            _ => self.config.backoff * attempt,
        }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match timeout(self.config.request_timeout, self.inner.complete(messages)).await {
                Ok(Ok(text)) if text.trim().is_empty() => Err(LlmError::EmptyResponse),
                Ok(other) => other,
                Err(_) => Err(LlmError::Timeout(self.config.request_timeout)),
            };

            match result {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt <= self.config.max_retries => {
                    let delay = self.delay_for(attempt, &e);
                    tracing::warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "LLM call failed, retrying");
                    sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(attempt, error = %e, "LLM call failed");
                    return Err(e);
                }
            }
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            request_timeout: Duration::from_millis(200),
            max_retries,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let mock = Arc::new(MockLlmClient::scripted(vec![
            Err(LlmError::ApiError("boom".into())),
            Ok("fine".into()),
        ]));
        let client = RetryingLlmClient::new(mock.clone(), fast_retry(2));
        let out = client.complete(&[Message::user("hi")]).await.unwrap();
        assert_eq!(out, "fine");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let mock = Arc::new(MockLlmClient::scripted(vec![
            Err(LlmError::ApiError("1".into())),
            Err(LlmError::ApiError("2".into())),
            Err(LlmError::ApiError("3".into())),
        ]));
        let client = RetryingLlmClient::new(mock.clone(), fast_retry(1));
        let err = client.complete(&[Message::user("hi")]).await.unwrap_err();
        assert_eq!(err, LlmError::ApiError("2".into()));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_response_not_retried() {
        let mock = Arc::new(MockLlmClient::scripted(vec![Ok("   ".into()), Ok("late".into())]));
        let client = RetryingLlmClient::new(mock.clone(), fast_retry(3));
        let err = client.complete(&[Message::user("hi")]).await.unwrap_err();
        assert_eq!(err, LlmError::EmptyResponse);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let mock = Arc::new(MockLlmClient::scripted(vec![Ok("slow".into())]).with_delay(Duration::from_millis(500)));
        let client = RetryingLlmClient::new(mock, fast_retry(0));
        let err = client.complete(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, LlmError::Timeout(_)));
    }
}
