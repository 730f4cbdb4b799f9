//! 世界侧协作者契约
//!
//! 核心不关心实体/世界的具体表示：上下文快照、命令执行、聊天输出、
//! 实体生成都是 trait 缝。本文件同时提供内存版实现，供测试与演示进程使用。

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::npc::NpcConfig;

/// 世界坐标
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Position {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

/// 世界上下文快照（同步获取）
#[derive(Clone, Debug, Default)]
pub struct WorldContext {
    pub position: Position,
    pub nearby_entities: Vec<String>,
    pub nearest_blocks: Vec<String>,
    pub inventory: Vec<String>,
    pub state: String,
}

/// 可用命令描述，用于系统提示合成
#[derive(Clone, Debug)]
pub struct CommandDescriptor {
    pub name: String,
    pub description: String,
}

impl CommandDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// 世界上下文提供者
pub trait ContextProvider: Send + Sync {
    /// 取指定实体当前的世界快照
    fn build_context(&self, entity: Uuid) -> WorldContext;
}

/// 命令执行协作者。执行是异步的，完成状态通过返回值传回
/// （成功/失败分支与回调版本语义一致）。
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    fn list_commands(&self) -> Vec<CommandDescriptor>;

    /// 本地命令不加派发前缀
    fn is_local_only(&self, command: &str) -> bool;

    fn command_prefix(&self) -> &str {
        "@"
    }

    async fn execute(&self, command: &str) -> Result<(), String>;
}

/// 聊天/输出接收端；核心不做任何 UI 格式化
pub trait ChatSink: Send + Sync {
    fn send(&self, npc_name: &str, text: &str);
}

/// 已生成实体的绑定信息
#[derive(Clone, Debug)]
pub struct EntityBinding {
    pub uuid: Uuid,
    pub name: String,
}

/// 生成参数
#[derive(Clone, Debug, Default)]
pub struct SpawnParams {
    pub position: Option<Position>,
}

/// 实体生成协作者
#[async_trait]
pub trait EntitySpawner: Send + Sync {
    async fn spawn(&self, config: &NpcConfig, params: &SpawnParams)
        -> Result<EntityBinding, String>;

    fn despawn(&self, uuid: Uuid);
}

// ---- 内存版实现（测试与演示） ----

/// 固定快照的上下文提供者
#[derive(Default)]
pub struct StaticContext {
    pub context: WorldContext,
}

impl StaticContext {
    pub fn at(position: Position) -> Self {
        Self {
            context: WorldContext {
                position,
                state: "idle".to_string(),
                ..WorldContext::default()
            },
        }
    }
}

impl ContextProvider for StaticContext {
    fn build_context(&self, _entity: Uuid) -> WorldContext {
        self.context.clone()
    }
}

/// 记录式命令执行器：记录派发的命令，可预置失败脚本
#[derive(Default)]
pub struct RecordingExecutor {
    executed: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一次失败：下一次 execute 返回该错误
    pub fn fail_next(&self, error: impl Into<String>) {
        self.failures.lock().unwrap().push(error.into());
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    fn list_commands(&self) -> Vec<CommandDescriptor> {
        vec![
            CommandDescriptor::new("idle", "stand still and wait"),
            CommandDescriptor::new("goto", "walk to a named place"),
            CommandDescriptor::new("follow", "follow a nearby player"),
            CommandDescriptor::new("stop", "cancel the current action"),
        ]
    }

    fn is_local_only(&self, _command: &str) -> bool {
        true
    }

    async fn execute(&self, command: &str) -> Result<(), String> {
        self.executed.lock().unwrap().push(command.to_string());
        match self.failures.lock().unwrap().pop() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// 记录式聊天接收端
#[derive(Default)]
pub struct RecordingChat {
    messages: Mutex<Vec<(String, String)>>,
}

impl RecordingChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }
}

impl ChatSink for RecordingChat {
    fn send(&self, npc_name: &str, text: &str) {
        self.messages.lock().unwrap().push((npc_name.to_string(), text.to_string()));
    }
}

/// 内存实体生成器：沿用配置 uuid 作为实体身份（跨会话稳定），记录 despawn
#[derive(Default)]
pub struct LocalSpawner {
    despawned: Mutex<Vec<Uuid>>,
}

impl LocalSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn despawned(&self) -> Vec<Uuid> {
        self.despawned.lock().unwrap().clone()
    }
}

#[async_trait]
impl EntitySpawner for LocalSpawner {
    async fn spawn(
        &self,
        config: &NpcConfig,
        _params: &SpawnParams,
    ) -> Result<EntityBinding, String> {
        Ok(EntityBinding {
            uuid: config.uuid,
            name: config.name.clone(),
        })
    }

    fn despawn(&self, uuid: Uuid) {
        self.despawned.lock().unwrap().push(uuid);
    }
}
