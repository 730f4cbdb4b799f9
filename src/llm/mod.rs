//! 模型客户端抽象与实现
//!
//! 真实后端（HTTP/provider 协议）由使用方实现 `LlmClient` 接入；
//! 本 crate 自带脚本化 Mock 供测试与演示。

pub mod mock;
pub mod traits;

pub use mock::MockLlmClient;
pub use traits::{LlmClient, LlmFamily, SpeechSynthesis};
