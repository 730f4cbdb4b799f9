//! 模型客户端抽象
//!
//! chat 为唯一必须实现的操作。语音合成是能力接口：支持的后端通过
//! `speech()` 暴露 `SpeechSynthesis`，流水线检查能力存在性而非具体类型。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::history::Message;

/// 模型家族，决定系统提示的格式要求
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmFamily {
    /// OpenAI 兼容 chat 后端
    OpenAi,
    /// 本地小模型（严格输出格式提示）
    Ollama,
}

impl Default for LlmFamily {
    fn default() -> Self {
        Self::Ollama
    }
}

/// 模型客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 单次对话补全：输入有序消息序列，返回一条 assistant 消息
    async fn chat(&self, messages: &[Message]) -> Result<Message, LlmError>;

    /// 语音合成能力；不支持的后端返回 None
    fn speech(&self) -> Option<&dyn SpeechSynthesis> {
        None
    }

    /// 释放后台资源（连接池、播放线程等）；NPC 移除时调用
    fn stop(&self) {}
}

/// 语音合成能力接口
#[async_trait]
pub trait SpeechSynthesis: Send + Sync {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<(), LlmError>;
}
