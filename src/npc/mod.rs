//! NPC 配置与运行时聚合
//!
//! `NpcConfig` 是持久化的配置记录（移除 NPC 时保留、仅置 inactive）；
//! `NpcHandle` 是运行时聚合，生命周期由注册表独占管理。

pub mod config_store;

pub use config_store::NpcConfigStore;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::history::ConversationHistory;
use crate::llm::{LlmClient, LlmFamily};
use crate::pipeline::EventPipeline;
use crate::prompts;
use crate::world::{EntityBinding, Position};

/// 区域行为：落在区域内的 NPC 在提示中注入附加指令。
/// 多个区域命中时取 priority 最高者；同 priority 按区域名字典序取最大，
/// 保证选择确定性。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ZoneBehavior {
    pub name: String,
    pub from: Position,
    pub to: Position,
    pub priority: i32,
    pub instructions: String,
}

impl ZoneBehavior {
    /// 闭区间包含测试，from/to 任意顺序
    pub fn contains(&self, pos: Position) -> bool {
        let within = |a: i32, b: i32, v: i32| v >= a.min(b) && v <= a.max(b);
        within(self.from.x, self.to.x, pos.x)
            && within(self.from.y, self.to.y, pos.y)
            && within(self.from.z, self.to.z, pos.z)
    }
}

/// 可解锁的记忆片段；解锁后其提示并入系统提示的角色设定
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryFragment {
    pub id: String,
    pub prompt: String,
    pub unlocked: bool,
}

/// NPC 配置记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NpcConfig {
    pub name: String,
    pub uuid: Uuid,
    pub active: bool,
    /// 角色设定/人格描述
    pub character: String,
    pub llm_family: LlmFamily,
    pub llm_model: String,
    pub tts: bool,
    pub voice_id: String,
    pub skin_url: String,
    #[serde(default)]
    pub zone_behaviors: Vec<ZoneBehavior>,
    #[serde(default)]
    pub memory_fragments: Vec<MemoryFragment>,
}

impl NpcConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: Uuid::new_v4(),
            active: true,
            character: prompts::DEFAULT_CHARACTER_TRAITS.to_string(),
            llm_family: LlmFamily::default(),
            llm_model: "llama3.2".to_string(),
            tts: false,
            voice_id: "not set".to_string(),
            skin_url: String::new(),
            zone_behaviors: Vec::new(),
            memory_fragments: Vec::new(),
        }
    }

    /// 配置记录的存储键（大小写不敏感）
    pub fn record_name(&self) -> String {
        self.name.to_lowercase()
    }

    pub fn memory_fragment(&self, id: &str) -> Option<&MemoryFragment> {
        self.memory_fragments.iter().find(|m| m.id == id)
    }

    pub fn memory_fragment_mut(&mut self, id: &str) -> Option<&mut MemoryFragment> {
        self.memory_fragments.iter_mut().find(|m| m.id == id)
    }

    /// 已解锁记忆片段的提示文本
    pub fn unlocked_memory_prompts(&self) -> Vec<&str> {
        self.memory_fragments
            .iter()
            .filter(|m| m.unlocked)
            .map(|m| m.prompt.as_str())
            .collect()
    }

    /// 用新的创建请求刷新既有记录：重新激活并覆盖可调字段，
    /// uuid、区域行为与记忆片段保留
    pub fn refresh_from(&mut self, incoming: &NpcConfig) {
        self.active = true;
        self.character = incoming.character.clone();
        self.llm_family = incoming.llm_family;
        self.llm_model = incoming.llm_model.clone();
        self.tts = incoming.tts;
        self.voice_id = incoming.voice_id.clone();
        self.skin_url = incoming.skin_url.clone();
    }
}

/// 运行中 NPC 的聚合：注册表 map 独占所有权
pub struct NpcHandle {
    pub id: Uuid,
    pub config: Arc<NpcConfig>,
    pub entity: EntityBinding,
    pub history: Arc<ConversationHistory>,
    pub pipeline: EventPipeline,
    pub llm: Arc<dyn LlmClient>,
}
