//! LLM 层：推理能力抽象与实现（OpenAI 兼容 / Mock）以及能力边界上的超时重试

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{complete_prompt, LlmClient, LlmError, RetryConfig, RetryingLlmClient};
