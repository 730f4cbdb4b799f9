//! Animus - LLM 驱动的世界 NPC 智能体运行时
//!
//! 演示入口：初始化日志、加载配置、打开 SQLite 存储，
//! 用 Mock 模型客户端跑一个 NPC 的完整创建/对话/关停流程。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use animus::config::load_config;
use animus::llm::{LlmClient, MockLlmClient};
use animus::npc::{NpcConfig, NpcConfigStore};
use animus::persistence::ConversationRepository;
use animus::registry::LlmClientFactory;
use animus::world::{
    ChatSink, CommandDescriptor, CommandExecutor, LocalSpawner, SpawnParams, StaticContext,
};
use animus::{NpcRegistry, RegistryDeps, RegistryOptions};

/// 把 NPC 的发言打到标准输出
struct ConsoleChat;

impl ChatSink for ConsoleChat {
    fn send(&self, npc_name: &str, text: &str) {
        println!("<{npc_name}> {text}");
    }
}

/// 把 NPC 的动作命令打到标准输出（演示环境没有真正的世界）
struct ConsoleExecutor;

#[async_trait]
impl CommandExecutor for ConsoleExecutor {
    fn list_commands(&self) -> Vec<CommandDescriptor> {
        vec![
            CommandDescriptor::new("idle", "Stand still and do nothing."),
            CommandDescriptor::new("wander", "Walk around the current area."),
            CommandDescriptor::new("follow <player>", "Follow the named player."),
        ]
    }

    fn is_local_only(&self, _command: &str) -> bool {
        false
    }

    async fn execute(&self, command: &str) -> Result<(), String> {
        println!("  [action] {command}");
        Ok(())
    }
}

/// 每个 NPC 一个脚本化 Mock 客户端
struct MockFactory;

impl LlmClientFactory for MockFactory {
    fn create(&self, config: &NpcConfig) -> Result<Arc<dyn LlmClient>, String> {
        tracing::info!(npc = %config.name, model = %config.llm_model, "using mock LLM client");
        let client = MockLlmClient::new();
        client.push_reply(
            r#"{"command": "wander", "message": "A fine day to stretch my legs."}"#,
        );
        client.push_reply(
            r#"{"command": "idle", "message": "Hello there, traveler. What brings you here?"}"#,
        );
        Ok(Arc::new(client))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();

    let config = load_config(None).context("Failed to load configuration")?;
    if let Some(parent) = config.storage.database_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let config_store = Arc::new(
        NpcConfigStore::open(&config.storage.database_path)
            .context("Failed to open NPC config store")?,
    );
    let repository = Arc::new(
        ConversationRepository::open(&config.storage.database_path)
            .context("Failed to open conversation repository")?,
    );

    let (_death_tx, death_rx) = mpsc::unbounded_channel();
    let registry = NpcRegistry::new(
        RegistryDeps {
            config_store,
            repository,
            llm_factory: Arc::new(MockFactory),
            spawner: Arc::new(LocalSpawner::new()),
            context: Arc::new(StaticContext::default()),
            executor: Arc::new(ConsoleExecutor),
            chat: Arc::new(ConsoleChat),
        },
        RegistryOptions {
            max_npcs: config.limits.max_npcs,
        },
        death_rx,
    );
    registry.load_conversations().await;

    let uuid = registry
        .create(NpcConfig::new("Sage"), SpawnParams::default())
        .await
        .context("Registry shut down before replying")?
        .context("Failed to create NPC")?;

    registry
        .submit_event(uuid, "Player Alex says: hello!")
        .await
        .context("NPC vanished before the event was delivered")?;

    // 留出时间让事件流水线消化两条事件
    tokio::time::sleep(Duration::from_millis(300)).await;

    registry.shutdown_all().await;
    tracing::info!("demo finished, conversations persisted");
    Ok(())
}
