//! 模型回复解析
//!
//! 回复应为 `{"command": ..., "message": ...}` 的单个 JSON 对象。
//! 小模型常把 JSON 包进 Markdown 代码围栏，先按原文解析，失败后剥掉
//! 围栏标记重试一次；仍失败则判定为不可解析，不再重试模型调用。

use serde::Deserialize;

use crate::error::PipelineError;

/// 从一条 assistant 回复解码出的结构化结果
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ParsedResponse {
    pub command: String,
    pub message: String,
}

/// 解析模型回复；一次围栏清理重试后仍失败则返回 `UnparsableResponse`
pub fn parse_response(content: &str) -> Result<ParsedResponse, PipelineError> {
    match try_parse(content) {
        Ok(parsed) => Ok(parsed),
        Err(_) => {
            let cleaned = content.replace("```json", "").replace("```", "");
            try_parse(&cleaned).map_err(|source| PipelineError::UnparsableResponse {
                raw: content.to_string(),
                source,
            })
        }
    }
}

fn try_parse(content: &str) -> Result<ParsedResponse, serde_json::Error> {
    serde_json::from_str(content.trim())
}
