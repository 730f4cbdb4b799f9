//! Mock 模型客户端（用于测试与演示，无需 API）
//!
//! 按脚本队列出队回复；队列耗尽后返回固定的 idle 回复。
//! 记录每次 chat 收到的消息序列，测试据此断言提示构建与 FIFO 顺序。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::LlmError;
use crate::history::Message;
use crate::llm::{LlmClient, SpeechSynthesis};

/// 队列耗尽后的缺省回复
const DEFAULT_REPLY: &str = r#"{"command": "idle", "message": "Just taking in the scenery."}"#;

/// 脚本化 Mock 客户端
#[derive(Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: Mutex<Vec<Vec<Message>>>,
    speech: Option<RecordingSpeech>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 附带语音合成能力（记录所有请求的文本）
    pub fn with_speech() -> Self {
        Self {
            speech: Some(RecordingSpeech::default()),
            ..Self::default()
        }
    }

    /// 追加一条脚本回复
    pub fn push_reply(&self, content: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Ok(content.into()));
    }

    /// 追加一次失败的调用
    pub fn push_error(&self, message: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Err(message.into()));
    }

    /// 已记录的 chat 调用（每次调用的完整消息序列）
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap().clone()
    }

    /// 已请求合成的语音文本
    pub fn spoken(&self) -> Vec<String> {
        self.speech
            .as_ref()
            .map(|s| s.spoken.lock().unwrap().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(&self, messages: &[Message]) -> Result<Message, LlmError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(content)) => Ok(Message::assistant(content)),
            Some(Err(message)) => Err(LlmError::Provider(message)),
            None => Ok(Message::assistant(DEFAULT_REPLY)),
        }
    }

    fn speech(&self) -> Option<&dyn SpeechSynthesis> {
        self.speech.as_ref().map(|s| s as &dyn SpeechSynthesis)
    }
}

/// 记录式语音合成（能力接口的测试实现）
#[derive(Default)]
pub struct RecordingSpeech {
    spoken: Mutex<Vec<String>>,
}

#[async_trait]
impl SpeechSynthesis for RecordingSpeech {
    async fn synthesize(&self, text: &str, _voice_id: &str) -> Result<(), LlmError> {
        self.spoken.lock().unwrap().push(text.to_string());
        Ok(())
    }
}
