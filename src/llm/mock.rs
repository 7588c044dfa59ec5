//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 三种用法：
//! - `MockLlmClient::default()`：回显最后一条 User 消息
//! - `scripted(...)`：按顺序弹出预设回复，耗尽后回显
//! - `with_handler(...)`：由闭包根据消息内容决定回复
//!
//! 每次调用都会记录收到的消息，测试可断言 prompt 内容与调用次数。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};

type Handler = Box<dyn Fn(&[Message]) -> Result<String, LlmError> + Send + Sync>;

/// Mock 客户端
#[derive(Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    handler: Option<Handler>,
    delay: Option<Duration>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    /// 按顺序返回预设回复
    pub fn scripted(responses: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    /// 由闭包生成回复（预设队列优先）
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&[Message]) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            handler: Some(Box::new(handler)),
            ..Self::default()
        }
    }

    /// 每次回复前等待，用于测试超时与取消
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// 所有调用收到的消息（按调用顺序）
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

fn echo_last_user(messages: &[Message]) -> String {
    let last_user = messages
        .iter()
        .rev()
        .find(|m| matches!(m.role, Role::User))
        .map(|m| m.content.as_str())
        .unwrap_or("(no input)");
    format!("Echo from Mock: {last_user}")
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        if let Some(response) = scripted {
            return response;
        }
        match &self.handler {
            Some(handler) => handler(messages),
            None => Ok(echo_last_user(messages)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_echo() {
        let mock = MockLlmClient::scripted(vec![Ok("first".into())]);
        let msgs = [Message::user("hello")];
        assert_eq!(mock.complete(&msgs).await.unwrap(), "first");
        assert_eq!(mock.complete(&msgs).await.unwrap(), "Echo from Mock: hello");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_handler_sees_messages() {
        let mock = MockLlmClient::with_handler(|msgs| Ok(format!("{} messages", msgs.len())));
        let msgs = [Message::system("s"), Message::user("u")];
        assert_eq!(mock.complete(&msgs).await.unwrap(), "2 messages");
        assert_eq!(mock.calls()[0][0].content, "s");
    }
}
