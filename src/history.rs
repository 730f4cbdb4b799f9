//! 会话历史：有界、自动摘要压缩的对话记录
//!
//! 每个 NPC 独占一份历史。所有变更（追加、压缩）都在同一把锁内串行化，
//! 达到阈值时在锁内同步调用模型做摘要压缩（调用方阻塞到压缩完成）。
//! 存储序列永远不含 system 消息，system 提示在每次调用时临时合成。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{HistoryError, LlmError};
use crate::llm::LlmClient;
use crate::prompts;

/// 历史长度软上限；达到后压缩最旧的 1/3
pub const MAX_HISTORY_LENGTH: usize = 30;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// 解析持久化的角色字符串；未知值归入 System（加载时会被过滤掉）
    pub fn parse(s: &str) -> Role {
        match s {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => Role::System,
        }
    }
}

/// 单条消息，创建后不可变
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 单个 NPC 的会话历史
pub struct ConversationHistory {
    llm: Arc<dyn LlmClient>,
    messages: Mutex<Vec<Message>>,
}

impl ConversationHistory {
    /// 用已加载的消息初始化；system 消息被过滤，不进入存储序列
    pub fn new(llm: Arc<dyn LlmClient>, initial: Vec<Message>) -> Self {
        let messages = initial
            .into_iter()
            .filter(|m| m.role != Role::System)
            .collect();
        Self {
            llm,
            messages: Mutex::new(messages),
        }
    }

    /// 追加一条消息；system 角色为 no-op。达到阈值时在锁内同步压缩，
    /// 压缩的模型调用失败会向上传播（调用方按流水线错误上报）。
    pub async fn add(&self, message: Message) -> Result<(), LlmError> {
        if message.role == Role::System {
            return Ok(());
        }
        let mut messages = self.messages.lock().await;
        messages.push(message);

        if messages.len() >= MAX_HISTORY_LENGTH {
            self.compact(&mut messages).await?;
        }
        Ok(())
    }

    /// 摘要并替换最旧的 MAX_HISTORY_LENGTH/3 条消息。在 `add` 的锁内运行，
    /// 不会与其他变更并发。
    async fn compact(&self, messages: &mut Vec<Message>) -> Result<(), LlmError> {
        let remove_count = MAX_HISTORY_LENGTH / 3;
        let slice = &messages[..remove_count];
        let json = serde_json::to_string(slice)
            .map_err(|e| LlmError::Provider(format!("failed to serialize summary slice: {e}")))?;

        let request = Message::user(prompts::summary_prompt(&json));
        let summary = self.llm.chat(&[request]).await?;

        messages.drain(..remove_count);
        // 摘要固定按 assistant 角色入库，保证序列不含 system 消息
        messages.insert(0, Message::assistant(summary.content));
        Ok(())
    }

    /// 为一次模型调用构建消息序列：恰好一条前导 system 消息 + 当前存储序列。
    /// 每次调用返回全新序列，不跨调用累积。
    pub async fn build_for_call(&self, system_prompt: &str) -> Vec<Message> {
        let messages = self.messages.lock().await;
        let mut result = Vec::with_capacity(messages.len() + 1);
        result.push(Message::system(system_prompt));
        result.extend(messages.iter().cloned());
        result
    }

    /// 最近一条存储消息的文本
    pub async fn last_message_text(&self) -> Result<String, HistoryError> {
        self.messages
            .lock()
            .await
            .last()
            .map(|m| m.content.clone())
            .ok_or(HistoryError::EmptyHistory)
    }

    /// 当前存储序列的只读快照（用于持久化移交）
    pub async fn snapshot(&self) -> Vec<Message> {
        self.messages.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }
}
