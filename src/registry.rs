//! NPC 注册表与生命周期
//!
//! 创建请求经单独的后台 worker 串行处理（调用方不被阻塞，结果经
//! oneshot 通道回报）。注册表独占 uuid → NpcHandle 的映射；移除只
//! 拆运行时资源并把配置记录置 inactive，删除才抹掉持久化记录。
//! 死亡事件监听在构造时注册恰好一次。

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AgentNotFound, CreationError};
use crate::history::ConversationHistory;
use crate::llm::LlmClient;
use crate::npc::{MemoryFragment, NpcConfig, NpcConfigStore, NpcHandle};
use crate::persistence::{ConversationRepository, ResourceHandoff};
use crate::pipeline::{EventPipeline, PipelineContext};
use crate::prompts;
use crate::world::{ChatSink, CommandExecutor, ContextProvider, EntitySpawner, SpawnParams};

/// 并行运行 NPC 数量的缺省硬上限
pub const DEFAULT_MAX_NPC_COUNT: usize = 10;

static NAME_PATTERN: OnceLock<Regex> = OnceLock::new();

fn name_pattern() -> &'static Regex {
    NAME_PATTERN.get_or_init(|| Regex::new("^[A-Za-z0-9_]{3,16}$").unwrap())
}

/// 按配置为每个 NPC 构建模型客户端
pub trait LlmClientFactory: Send + Sync {
    fn create(&self, config: &NpcConfig) -> Result<Arc<dyn LlmClient>, String>;
}

/// 注册表依赖的外部协作者与存储
pub struct RegistryDeps {
    pub config_store: Arc<NpcConfigStore>,
    pub repository: Arc<ConversationRepository>,
    pub llm_factory: Arc<dyn LlmClientFactory>,
    pub spawner: Arc<dyn EntitySpawner>,
    pub context: Arc<dyn ContextProvider>,
    pub executor: Arc<dyn CommandExecutor>,
    pub chat: Arc<dyn ChatSink>,
}

/// 注册表选项
#[derive(Clone, Copy, Debug)]
pub struct RegistryOptions {
    pub max_npcs: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            max_npcs: DEFAULT_MAX_NPC_COUNT,
        }
    }
}

struct CreateRequest {
    config: NpcConfig,
    params: SpawnParams,
    reply: oneshot::Sender<Result<Uuid, CreationError>>,
}

struct RegistryInner {
    npcs: RwLock<HashMap<Uuid, NpcHandle>>,
    resources: Arc<ResourceHandoff>,
    deps: RegistryDeps,
    max_npcs: usize,
}

/// NPC 注册表
pub struct NpcRegistry {
    inner: Arc<RegistryInner>,
    creation_tx: mpsc::UnboundedSender<CreateRequest>,
    cancel: CancellationToken,
    creation_worker: JoinHandle<()>,
    death_listener: JoinHandle<()>,
}

impl NpcRegistry {
    /// 构建注册表并启动后台 worker。`death_rx` 上的实体死亡事件触发
    /// 对应 NPC 的移除（监听只在这里注册一次）。
    pub fn new(
        deps: RegistryDeps,
        options: RegistryOptions,
        death_rx: mpsc::UnboundedReceiver<Uuid>,
    ) -> Self {
        let resources = Arc::new(ResourceHandoff::new(Arc::clone(&deps.repository)));
        let inner = Arc::new(RegistryInner {
            npcs: RwLock::new(HashMap::new()),
            resources,
            deps,
            max_npcs: options.max_npcs,
        });

        let cancel = CancellationToken::new();
        let (creation_tx, creation_rx) = mpsc::unbounded_channel();
        let creation_worker = tokio::spawn(run_creation_worker(
            Arc::clone(&inner),
            creation_rx,
            cancel.clone(),
        ));
        let death_listener = tokio::spawn(run_death_listener(
            Arc::clone(&inner),
            death_rx,
            cancel.clone(),
        ));

        Self {
            inner,
            creation_tx,
            cancel,
            creation_worker,
            death_listener,
        }
    }

    /// 异步创建 NPC：请求入队后立即返回。结果（uuid 或创建错误）经
    /// 返回的通道回报；失败同时上报到聊天输出与日志，不会 panic。
    pub fn create(
        &self,
        config: NpcConfig,
        params: SpawnParams,
    ) -> oneshot::Receiver<Result<Uuid, CreationError>> {
        let (reply, rx) = oneshot::channel();
        let request = CreateRequest {
            config,
            params,
            reply,
        };
        if let Err(rejected) = self.creation_tx.send(request) {
            let _ = rejected.0.reply.send(Err(CreationError::RegistryClosed));
        }
        rx
    }

    /// 把外部刺激路由到所属 NPC 的事件流水线
    pub async fn submit_event(
        &self,
        uuid: Uuid,
        prompt: impl Into<String>,
    ) -> Result<(), AgentNotFound> {
        let npcs = self.inner.npcs.read().await;
        let handle = npcs.get(&uuid).ok_or(AgentNotFound(uuid))?;
        handle.pipeline.submit(prompt.into());
        Ok(())
    }

    /// 移除 NPC：中断流水线、停模型客户端、登记会话快照、despawn、
    /// 配置记录置 inactive（记录保留）
    pub async fn remove(&self, uuid: Uuid) -> Result<(), AgentNotFound> {
        remove_npc(&self.inner, uuid).await
    }

    /// 彻底删除：移除 + 抹掉持久化会话与配置记录
    pub async fn delete(&self, uuid: Uuid) -> Result<(), AgentNotFound> {
        let was_live = remove_npc(&self.inner, uuid).await.is_ok();
        let had_record = matches!(self.inner.deps.config_store.get(uuid), Ok(Some(_)));

        self.inner.resources.remove(uuid).await;
        if let Err(err) = self.inner.deps.repository.delete_by_uuid(uuid) {
            tracing::error!(%uuid, error = %err, "failed to erase conversations");
        }
        if let Err(err) = self.inner.deps.config_store.delete(uuid) {
            tracing::error!(%uuid, error = %err, "failed to erase config record");
        }

        if was_live || had_record {
            Ok(())
        } else {
            Err(AgentNotFound(uuid))
        }
    }

    /// 移除所有活跃 NPC、回写会话快照，然后停掉注册表自身的后台资源
    pub async fn shutdown_all(&self) {
        let uuids: Vec<Uuid> = self.inner.npcs.read().await.keys().copied().collect();
        for uuid in uuids {
            let _ = remove_npc(&self.inner, uuid).await;
        }
        self.inner.resources.save().await;
        self.cancel.cancel();
    }

    /// 启动时把所有已知配置的持久化会话装入内存（后台执行，错误只记日志）
    pub async fn load_conversations(&self) {
        match self.inner.deps.config_store.all() {
            Ok(configs) => {
                let uuids = configs.iter().map(|c| c.uuid).collect();
                let _ = self.inner.resources.load(uuids).await;
            }
            Err(err) => tracing::warn!(error = %err, "failed to list configs for loading"),
        }
    }

    /// 会话状态移交（测试与停服流程使用）
    pub fn resources(&self) -> &Arc<ResourceHandoff> {
        &self.inner.resources
    }

    pub async fn active_count(&self) -> usize {
        self.inner.npcs.read().await.len()
    }

    pub async fn find_by_name(&self, name: &str) -> Option<Uuid> {
        self.inner
            .npcs
            .read()
            .await
            .values()
            .find(|h| h.config.name == name)
            .map(|h| h.id)
    }

    /// 解锁一个记忆片段；结果用状态枚举表达，不抛错
    pub fn unlock_memory(&self, npc_name: &str, memory_id: &str) -> MemoryUnlockStatus {
        let store = &self.inner.deps.config_store;
        let mut config = match store.get_by_name(npc_name) {
            Ok(Some(config)) => config,
            Ok(None) => return MemoryUnlockStatus::NpcNotFound,
            Err(err) => {
                tracing::warn!(npc = %npc_name, error = %err, "config lookup failed");
                return MemoryUnlockStatus::NpcNotFound;
            }
        };
        let Some(fragment) = config.memory_fragment_mut(memory_id) else {
            return MemoryUnlockStatus::MemoryNotFound;
        };
        if fragment.unlocked {
            return MemoryUnlockStatus::AlreadyUnlocked;
        }
        fragment.unlocked = true;
        if let Err(err) = store.save(&config) {
            tracing::error!(npc = %npc_name, error = %err, "failed to persist unlocked memory");
        }
        MemoryUnlockStatus::Success
    }

    /// 新建一个已解锁的记忆片段，id 自动生成（memory_N）
    pub fn create_memory(&self, npc_name: &str, memory_prompt: &str) -> MemoryCreateResult {
        let normalized = memory_prompt.trim();
        if normalized.is_empty() {
            return MemoryCreateResult::status_only(MemoryCreateStatus::InvalidInput);
        }

        let store = &self.inner.deps.config_store;
        let mut config = match store.get_by_name(npc_name) {
            Ok(Some(config)) => config,
            Ok(None) => return MemoryCreateResult::status_only(MemoryCreateStatus::NpcNotFound),
            Err(err) => {
                tracing::warn!(npc = %npc_name, error = %err, "config lookup failed");
                return MemoryCreateResult::status_only(MemoryCreateStatus::NpcNotFound);
            }
        };

        let memory_id = next_memory_id(&config);
        if config.memory_fragment(&memory_id).is_some() {
            return MemoryCreateResult {
                status: MemoryCreateStatus::IdConflict,
                memory_id,
            };
        }

        config.memory_fragments.push(MemoryFragment {
            id: memory_id.clone(),
            prompt: normalized.to_string(),
            unlocked: true,
        });
        if let Err(err) = store.save(&config) {
            tracing::error!(npc = %npc_name, error = %err, "failed to persist new memory");
        }
        MemoryCreateResult {
            status: MemoryCreateStatus::Success,
            memory_id,
        }
    }
}

impl Drop for NpcRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.creation_worker.abort();
        self.death_listener.abort();
    }
}

/// 记忆片段解锁结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryUnlockStatus {
    Success,
    NpcNotFound,
    MemoryNotFound,
    AlreadyUnlocked,
}

/// 记忆片段创建结果状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryCreateStatus {
    Success,
    NpcNotFound,
    InvalidInput,
    IdConflict,
}

/// 记忆片段创建结果（含生成的 id）
#[derive(Clone, Debug)]
pub struct MemoryCreateResult {
    pub status: MemoryCreateStatus,
    pub memory_id: String,
}

impl MemoryCreateResult {
    fn status_only(status: MemoryCreateStatus) -> Self {
        Self {
            status,
            memory_id: String::new(),
        }
    }
}

fn next_memory_id(config: &NpcConfig) -> String {
    let mut next = 1;
    while config.memory_fragment(&format!("memory_{next}")).is_some() {
        next += 1;
    }
    format!("memory_{next}")
}

async fn run_creation_worker(
    inner: Arc<RegistryInner>,
    mut rx: mpsc::UnboundedReceiver<CreateRequest>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            request = rx.recv() => {
                let Some(CreateRequest { config, params, reply }) = request else {
                    break;
                };
                let name = config.name.clone();
                let result = create_npc(&inner, config, params).await;
                if let Err(err) = &result {
                    inner.deps.chat.send(&name, &format!("Could not create NPC: {err}"));
                    tracing::error!(npc = %name, error = %err, "NPC creation failed");
                }
                let _ = reply.send(result);
            }
        }
    }
}

async fn run_death_listener(
    inner: Arc<RegistryInner>,
    mut rx: mpsc::UnboundedReceiver<Uuid>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                let Some(uuid) = event else { break };
                if remove_npc(&inner, uuid).await.is_err() {
                    tracing::debug!(%uuid, "death event for unknown NPC");
                }
            }
        }
    }
}

async fn create_npc(
    inner: &Arc<RegistryInner>,
    incoming: NpcConfig,
    params: SpawnParams,
) -> Result<Uuid, CreationError> {
    {
        let npcs = inner.npcs.read().await;
        if npcs.len() >= inner.max_npcs {
            return Err(CreationError::LimitExceeded(inner.max_npcs));
        }
        if !name_pattern().is_match(&incoming.name) {
            return Err(CreationError::InvalidName(incoming.name));
        }
        if npcs.values().any(|h| h.config.name == incoming.name) {
            return Err(CreationError::DuplicateName(incoming.name));
        }
    }

    // 同名持久化记录存在则重新激活并刷新，否则用新配置
    let mut config = match inner
        .deps
        .config_store
        .get_by_name(&incoming.name)
        .map_err(|e| CreationError::Persistence(e.to_string()))?
    {
        Some(mut existing) => {
            existing.refresh_from(&incoming);
            existing
        }
        None => incoming,
    };

    let binding = inner
        .deps
        .spawner
        .spawn(&config, &params)
        .await
        .map_err(CreationError::Spawn)?;
    // 实体身份即配置身份
    config.uuid = binding.uuid;
    inner
        .deps
        .config_store
        .save(&config)
        .map_err(|e| CreationError::Persistence(e.to_string()))?;

    let llm = inner
        .deps
        .llm_factory
        .create(&config)
        .map_err(CreationError::Llm)?;
    let seed = inner.resources.get(config.uuid).await.unwrap_or_default();
    let history = Arc::new(ConversationHistory::new(Arc::clone(&llm), seed));
    let config = Arc::new(config);

    let pipeline = EventPipeline::start(PipelineContext {
        config: Arc::clone(&config),
        entity: binding.clone(),
        llm: Arc::clone(&llm),
        history: Arc::clone(&history),
        context: Arc::clone(&inner.deps.context),
        executor: Arc::clone(&inner.deps.executor),
        chat: Arc::clone(&inner.deps.chat),
    });
    pipeline.submit(prompts::INITIAL_PROMPT);

    let uuid = config.uuid;
    let handle = NpcHandle {
        id: uuid,
        config: Arc::clone(&config),
        entity: binding,
        history,
        pipeline,
        llm,
    };
    inner.npcs.write().await.insert(uuid, handle);

    inner
        .deps
        .chat
        .send(&config.name, &format!("Added NPC with name: {}", config.name));
    tracing::info!(npc = %config.name, %uuid, "NPC created");
    Ok(uuid)
}

async fn remove_npc(inner: &Arc<RegistryInner>, uuid: Uuid) -> Result<(), AgentNotFound> {
    let handle = inner
        .npcs
        .write()
        .await
        .remove(&uuid)
        .ok_or(AgentNotFound(uuid))?;

    handle.pipeline.stop();
    handle.llm.stop();
    inner
        .resources
        .store(uuid, handle.history.snapshot().await)
        .await;
    inner.deps.spawner.despawn(uuid);

    match inner.deps.config_store.get(uuid) {
        Ok(Some(mut config)) => {
            config.active = false;
            if let Err(err) = inner.deps.config_store.save(&config) {
                tracing::error!(%uuid, error = %err, "failed to mark config inactive");
            }
            inner
                .deps
                .chat
                .send(&config.name, &format!("Removed NPC with name: {}", config.name));
        }
        _ => {
            inner
                .deps
                .chat
                .send(&handle.config.name, &format!("Removed NPC with uuid: {uuid}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_pattern_accepts_3_to_16_word_chars() {
        assert!(name_pattern().is_match("Bob"));
        assert!(name_pattern().is_match("npc_42"));
        assert!(name_pattern().is_match("A234567890123456"));
        assert!(!name_pattern().is_match("Al"));
        assert!(!name_pattern().is_match("A2345678901234567"));
        assert!(!name_pattern().is_match("bad name"));
        assert!(!name_pattern().is_match("bad-name"));
    }

    #[test]
    fn test_next_memory_id_skips_existing() {
        let mut config = NpcConfig::new("Mira");
        assert_eq!(next_memory_id(&config), "memory_1");
        config.memory_fragments.push(MemoryFragment {
            id: "memory_1".to_string(),
            prompt: "one".to_string(),
            unlocked: false,
        });
        config.memory_fragments.push(MemoryFragment {
            id: "memory_2".to_string(),
            prompt: "two".to_string(),
            unlocked: false,
        });
        assert_eq!(next_memory_id(&config), "memory_3");
    }
}
