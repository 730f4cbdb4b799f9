//! 错误类型与错误链分类
//!
//! 校验错误（创建 NPC 时）用 `CreationError`，流水线内部用 `PipelineError`；
//! `describe_error_chain` 沿 cause 链挑选最有价值的一条信息展示给操作者。

use thiserror::Error;
use uuid::Uuid;

/// 创建 NPC 时的校验/构建错误（同步拒绝，不产生副作用）
#[derive(Error, Debug)]
pub enum CreationError {
    #[error("no more than {0} parallel running NPCs are supported")]
    LimitExceeded(usize),

    #[error("NPC name '{0}' is not valid. Use 3-16 characters: letters, numbers, or underscores only")]
    InvalidName(String),

    #[error("an NPC with the name '{0}' already exists")]
    DuplicateName(String),

    #[error("failed to spawn NPC entity: {0}")]
    Spawn(String),

    #[error("failed to create LLM client: {0}")]
    Llm(String),

    #[error("failed to persist NPC configuration: {0}")]
    Persistence(String),

    /// 注册表已关闭，创建请求未被处理
    #[error("registry is shut down")]
    RegistryClosed,
}

/// 会话历史错误
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("conversation history is empty")]
    EmptyHistory,
}

/// 模型客户端错误（provider 侧，按消息分类，不区分具体后端）
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("{0}")]
    Provider(String),

    #[error("speech synthesis failed: {0}")]
    Speech(String),
}

/// 流水线处理单个事件时的错误；worker 捕获后上报，不会终止流水线
#[derive(Error, Debug)]
pub enum PipelineError {
    /// 模型回复两次解析（原文 + 去围栏重试）均失败
    #[error(
        "the selected model may be too small to understand the context or to reliably \
         produce valid JSON. Please switch to a larger or more capable LLM model."
    )]
    UnparsableResponse {
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    History(#[from] HistoryError),
}

/// 注册表中不存在该 NPC
#[derive(Error, Debug)]
#[error("no NPC registered under id {0}")]
pub struct AgentNotFound(pub Uuid);

/// provider 返回空错误体时的兜底提示
const FALLBACK_PROVIDER_MESSAGE: &str =
    "LLM request failed: provider returned a non-2xx response with an empty error body. \
     Check base URL, model, and API key.";

/// 沿 cause 链生成操作者可读的错误描述：
/// 优先取链上第一个 `UnparsableResponse`（自定义事件错误），
/// 其次取第一条非空且非噪声（"ERROR :"）的消息，最后回退到通用 provider 提示。
pub fn describe_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let chain = std::iter::successors(Some(err), |e| e.source());

    for link in chain.clone() {
        if let Some(PipelineError::UnparsableResponse { .. }) = link.downcast_ref::<PipelineError>()
        {
            return link.to_string();
        }
    }

    for link in chain {
        let message = link.to_string();
        let trimmed = message.trim();
        if !trimmed.is_empty() && trimmed != "ERROR :" {
            return message;
        }
    }

    FALLBACK_PROVIDER_MESSAGE.to_string()
}
