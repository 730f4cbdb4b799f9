//! Animus - LLM 驱动的世界 NPC 智能体运行时
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **error**: 错误类型与错误链分类
//! - **history**: 会话历史（有界长度 + 旧消息摘要压缩）
//! - **llm**: 模型客户端抽象（chat / 语音合成能力 / Mock）
//! - **npc**: NPC 配置记录、记忆片段、区域行为与 SQLite 配置存储
//! - **persistence**: 会话持久化与加载/保存任务的资源移交
//! - **pipeline**: 每个 NPC 的事件流水线（有界队列 + 单 worker）
//! - **prompts**: 系统提示词、环境上下文与摘要提示词构建
//! - **registry**: NPC 注册表与生命周期（创建/移除/删除/关停）
//! - **world**: 世界侧协作者接口（上下文、命令、聊天、实体生成）

pub mod config;
pub mod error;
pub mod history;
pub mod llm;
pub mod npc;
pub mod persistence;
pub mod pipeline;
pub mod prompts;
pub mod registry;
pub mod world;

pub use registry::{NpcRegistry, RegistryDeps, RegistryOptions};
