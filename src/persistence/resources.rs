//! 会话状态移交
//!
//! 启动时把持久化会话装入内存（供 NPC 创建时取用），移除/停服时把内存
//! 快照写回数据库。装载/保存跑在临时小池（并发 2）上；新任务启动前会
//! 取消在途任务：先打断，短暂等待优雅结束，超时则强制中止。
//! 任何装载/保存错误只记日志，不向调用方传播，允许部分完成。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::future::join_all;
use tokio::sync::{oneshot, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::ConversationRepository;
use crate::history::Message;

/// 装载/保存任务池的并发上限
const POOL_SIZE: usize = 2;

/// 在途任务优雅结束的等待时长
const GRACE_PERIOD: Duration = Duration::from_millis(500);

struct ResourceTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 每 NPC 会话快照的装载与回写
pub struct ResourceHandoff {
    repository: Arc<ConversationRepository>,
    loaded: RwLock<HashMap<Uuid, Vec<Message>>>,
    active: Mutex<Option<ResourceTask>>,
}

impl ResourceHandoff {
    pub fn new(repository: Arc<ConversationRepository>) -> Self {
        Self {
            repository,
            loaded: RwLock::new(HashMap::new()),
            active: Mutex::new(None),
        }
    }

    /// 把给定 NPC 的持久化会话装入内存。后台执行；返回的接收端可用来
    /// 等待完成（被后续任务取代时接收端以 Err 结束）。
    pub async fn load(self: &Arc<Self>, uuids: Vec<Uuid>) -> oneshot::Receiver<()> {
        self.interrupt_active().await;

        let token = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let this = Arc::clone(self);
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            this.run_load(uuids, task_token).await;
            let _ = done_tx.send(());
        });
        *self.active.lock().await = Some(ResourceTask { token, handle });
        done_rx
    }

    /// 把全部已装载会话整体回写数据库（先删后插，重复保存不累积）。
    /// 从调用方视角同步：返回即写入完成（或被后续任务取代/出错放弃）。
    pub async fn save(self: &Arc<Self>) {
        self.interrupt_active().await;

        let token = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let this = Arc::clone(self);
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            this.run_save(task_token).await;
            let _ = done_tx.send(());
        });
        *self.active.lock().await = Some(ResourceTask { token, handle });
        let _ = done_rx.await;
    }

    /// NPC 移除时登记当前内存快照
    pub async fn store(&self, uuid: Uuid, messages: Vec<Message>) {
        self.loaded.write().await.insert(uuid, messages);
    }

    pub async fn get(&self, uuid: Uuid) -> Option<Vec<Message>> {
        self.loaded.read().await.get(&uuid).cloned()
    }

    /// 彻底删除 NPC 时移除其内存快照
    pub async fn remove(&self, uuid: Uuid) {
        self.loaded.write().await.remove(&uuid);
    }

    pub async fn loaded_count(&self) -> usize {
        self.loaded.read().await.len()
    }

    async fn run_load(&self, uuids: Vec<Uuid>, token: CancellationToken) {
        tracing::info!(count = uuids.len(), "loading conversations into memory");
        let semaphore = Arc::new(Semaphore::new(POOL_SIZE));

        let tasks = uuids.into_iter().map(|uuid| {
            let semaphore = Arc::clone(&semaphore);
            let token = token.clone();
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if token.is_cancelled() {
                    return;
                }
                match self.repository.select_by_uuid(uuid) {
                    Ok(messages) => {
                        self.loaded.write().await.insert(uuid, messages);
                    }
                    Err(err) => {
                        tracing::warn!(%uuid, error = %err, "failed to load conversations");
                    }
                }
            }
        });
        join_all(tasks).await;
    }

    async fn run_save(&self, token: CancellationToken) {
        let snapshot = self.loaded.read().await.clone();
        for (uuid, messages) in snapshot {
            if token.is_cancelled() {
                tracing::info!("save superseded, stopping early");
                return;
            }
            if let Err(err) = self.persist_one(uuid, &messages) {
                tracing::error!(%uuid, error = %err, "failed to save conversations");
            }
        }
        tracing::info!("saved conversations to database");
    }

    /// 整体替换一个 NPC 的持久化记录，避免重复累积
    fn persist_one(&self, uuid: Uuid, messages: &[Message]) -> Result<()> {
        self.repository.delete_by_uuid(uuid)?;
        for message in messages {
            self.repository.insert(uuid, message)?;
        }
        Ok(())
    }

    /// 取消在途任务：打断 → 等 500ms → 强制中止
    async fn interrupt_active(&self) {
        let task = self.active.lock().await.take();
        if let Some(ResourceTask { token, mut handle }) = task {
            if handle.is_finished() {
                return;
            }
            token.cancel();
            tracing::info!("interrupted in-flight resource task");
            if tokio::time::timeout(GRACE_PERIOD, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }
}
