//! 每 NPC 事件流水线
//!
//! 单 worker、有界队列：外部刺激经 `submit` 进入队列（满则丢弃并记录，
//! 绝不阻塞调用方），worker 串行执行 建上下文 → 格式化提示 → 写历史 →
//! 模型调用 → 解析 → 安全过滤 → 命令派发 → 输出。同一 NPC 任意时刻至多
//! 一个事件在处理中，副作用与事件被接受的顺序一致。

pub mod parse;
pub mod safety;

pub use parse::ParsedResponse;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::error::{describe_error_chain, PipelineError};
use crate::history::{ConversationHistory, Message};
use crate::llm::LlmClient;
use crate::npc::{NpcConfig, ZoneBehavior};
use crate::prompts;
use crate::world::{ChatSink, CommandExecutor, ContextProvider, EntityBinding, Position};

/// 每 NPC 待处理事件队列容量；超出即丢弃（背压）
pub const QUEUE_CAPACITY: usize = 10;

/// 流水线依赖集合
pub struct PipelineContext {
    pub config: Arc<NpcConfig>,
    pub entity: EntityBinding,
    pub llm: Arc<dyn LlmClient>,
    pub history: Arc<ConversationHistory>,
    pub context: Arc<dyn ContextProvider>,
    pub executor: Arc<dyn CommandExecutor>,
    pub chat: Arc<dyn ChatSink>,
}

/// 事件入口：worker 持有一份克隆用于失败事件回灌
#[derive(Clone)]
struct Intake {
    tx: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
    npc_name: String,
}

impl Intake {
    fn submit(&self, prompt: String) {
        match self.tx.try_send(prompt) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    npc = %self.npc_name,
                    prompt = %dropped,
                    "event queue full, dropping event"
                );
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(npc = %self.npc_name, "pipeline stopped, event discarded");
            }
        }
    }
}

/// 每 NPC 的事件流水线句柄
pub struct EventPipeline {
    intake: Intake,
    worker: JoinHandle<()>,
}

impl EventPipeline {
    /// 启动 worker 并返回句柄
    pub fn start(ctx: PipelineContext) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let intake = Intake {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            npc_name: ctx.config.name.clone(),
        };
        let worker = tokio::spawn(run_worker(rx, Arc::new(ctx), intake.clone()));
        Self { intake, worker }
    }

    /// 提交一个事件。队列满时事件被丢弃（计数 + 日志），调用方不被阻塞、
    /// 也不会收到错误。
    pub fn submit(&self, prompt: impl Into<String>) {
        self.intake.submit(prompt.into());
    }

    /// 因背压被丢弃的事件数
    pub fn dropped_events(&self) -> u64 {
        self.intake.dropped.load(Ordering::Relaxed)
    }

    /// 立即中断 worker；在途工作被放弃，不等待
    pub fn stop(&self) {
        self.worker.abort();
    }
}

impl Drop for EventPipeline {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(mut rx: mpsc::Receiver<String>, ctx: Arc<PipelineContext>, feedback: Intake) {
    while let Some(prompt) = rx.recv().await {
        tracing::info!(npc = %ctx.config.name, %prompt, "handling event");
        if let Err(err) = handle_event(&ctx, &prompt, &feedback).await {
            let description = describe_error_chain(&err);
            ctx.chat.send(
                &ctx.config.name,
                &format!("Could not generate a response: {description}"),
            );
            tracing::error!(npc = %ctx.config.name, %prompt, error = %err, "event handling failed");
        }
    }
}

/// 单个事件的处理步骤 2-8；错误由 worker 统一上报，不终止流水线
async fn handle_event(
    ctx: &PipelineContext,
    prompt: &str,
    feedback: &Intake,
) -> Result<(), PipelineError> {
    // 上下文与区域行为
    let world = ctx.context.build_context(ctx.entity.uuid);
    let zone_aware = apply_zone_behavior(prompt, world.position, &ctx.config.zone_behaviors);
    let formatted = prompts::format_prompt(&zone_aware, &world);

    // 历史写入（可能触发锁内压缩）与模型调用
    ctx.history.add(Message::user(formatted)).await?;
    let system = prompts::system_prompt(
        &ctx.config.name,
        &ctx.config.character,
        &ctx.config.unlocked_memory_prompts(),
        &ctx.executor.list_commands(),
        ctx.config.llm_family,
    );
    let messages = ctx.history.build_for_call(&system).await;
    let reply = ctx.llm.chat(&messages).await?;
    ctx.history.add(reply.clone()).await?;

    // 解析 + 安全过滤
    let parsed = parse::parse_response(&reply.content)?;
    let safe = safety::sanitize(&parsed.command);
    let command = if ctx.executor.is_local_only(safe) {
        safe.to_string()
    } else {
        format!("{}{}", ctx.executor.command_prefix(), safe)
    };

    // 派发；失败合成自纠错事件回灌队列，本轮不再输出
    if let Err(error) = ctx.executor.execute(&command).await {
        tracing::error!(npc = %ctx.config.name, %command, %error, "command execution failed");
        feedback.submit(prompts::command_error_prompt(&command, &error));
        return Ok(());
    }

    // 输出：与上一条存储消息相同或为空则不重复发声
    let last = ctx.history.last_message_text().await?;
    if !parsed.message.is_empty() && parsed.message != last {
        ctx.chat.send(&ctx.config.name, &parsed.message);
        if ctx.config.tts {
            if let Some(speech) = ctx.llm.speech() {
                if let Err(err) = speech
                    .synthesize(&parsed.message, &ctx.config.voice_id)
                    .await
                {
                    tracing::warn!(npc = %ctx.config.name, error = %err, "speech synthesis failed");
                }
            }
        }
    }
    Ok(())
}

/// 取优先级最高的命中区域（同优先级按区域名字典序取最大），把区域指令
/// 附加到提示尾部；无命中则原样返回
fn apply_zone_behavior(prompt: &str, position: Position, zones: &[ZoneBehavior]) -> String {
    let matching = zones
        .iter()
        .filter(|z| !z.instructions.trim().is_empty() && z.contains(position))
        .max_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

    match matching {
        None => prompt.to_string(),
        Some(zone) => format!(
            "{prompt}\n\nAdditional zone instructions (zone: {}, priority: {}):\n{}",
            zone.name, zone.priority, zone.instructions
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::Semaphore;

    use crate::error::LlmError;
    use crate::llm::MockLlmClient;
    use crate::world::{RecordingChat, RecordingExecutor, StaticContext};
    use async_trait::async_trait;
    use uuid::Uuid;

    fn reply(command: &str, message: &str) -> String {
        format!(r#"{{"command": "{command}", "message": "{message}"}}"#)
    }

    struct Fixture {
        llm: Arc<MockLlmClient>,
        executor: Arc<RecordingExecutor>,
        chat: Arc<RecordingChat>,
        pipeline: EventPipeline,
    }

    fn fixture_with(configure: impl FnOnce(&mut NpcConfig)) -> Fixture {
        let mut config = NpcConfig::new("Mira");
        configure(&mut config);
        let llm = Arc::new(MockLlmClient::new());
        build_fixture(config, llm)
    }

    fn build_fixture(config: NpcConfig, llm: Arc<MockLlmClient>) -> Fixture {
        let executor = Arc::new(RecordingExecutor::new());
        let chat = Arc::new(RecordingChat::new());
        let llm_dyn: Arc<dyn LlmClient> = llm.clone();
        let history = Arc::new(ConversationHistory::new(llm_dyn.clone(), Vec::new()));
        let pipeline = EventPipeline::start(PipelineContext {
            config: Arc::new(config),
            entity: EntityBinding {
                uuid: Uuid::new_v4(),
                name: "Mira".to_string(),
            },
            llm: llm_dyn,
            history,
            context: Arc::new(StaticContext::default()),
            executor: executor.clone(),
            chat: chat.clone(),
        });
        Fixture {
            llm,
            executor,
            chat,
            pipeline,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    /// 取一次 chat 调用中最后一条 user 消息的 INSTRUCTION 首行
    fn instruction_of(call: &[Message]) -> String {
        let content = &call
            .iter()
            .rev()
            .find(|m| m.role == crate::history::Role::User)
            .expect("no user message in call")
            .content;
        content.lines().nth(1).unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_events_processed_in_fifo_order() {
        let f = fixture_with(|_| {});
        for i in 0..3 {
            f.llm.push_reply(reply("idle", &format!("m{i}")));
        }
        for i in 0..3 {
            f.pipeline.submit(format!("event-{i}"));
        }
        wait_until(|| f.chat.messages().len() == 3).await;

        let texts: Vec<String> = f.chat.messages().into_iter().map(|(_, t)| t).collect();
        assert_eq!(texts, vec!["m0", "m1", "m2"]);

        let calls = f.llm.calls();
        assert_eq!(calls.len(), 3);
        for (i, call) in calls.iter().enumerate() {
            assert_eq!(instruction_of(call), format!("event-{i}"));
            // 每次调用恰好一条前导 system 消息
            assert_eq!(call[0].role, crate::history::Role::System);
            assert_eq!(
                call.iter()
                    .filter(|m| m.role == crate::history::Role::System)
                    .count(),
                1
            );
        }
    }

    /// 卡在 chat 调用里的客户端：进入时发信号，拿到许可才返回
    struct GatedLlm {
        entered_tx: mpsc::UnboundedSender<()>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl LlmClient for GatedLlm {
        async fn chat(&self, _messages: &[Message]) -> Result<Message, LlmError> {
            let _ = self.entered_tx.send(());
            let permit = self.gate.acquire().await.map_err(|e| {
                LlmError::Provider(e.to_string())
            })?;
            permit.forget();
            Ok(Message::assistant(reply("idle", "")))
        }
    }

    #[tokio::test]
    async fn test_overflow_drops_newest_event_and_keeps_fifo() {
        let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        let llm: Arc<dyn LlmClient> = Arc::new(GatedLlm {
            entered_tx,
            gate: gate.clone(),
        });

        let executor = Arc::new(RecordingExecutor::new());
        let chat = Arc::new(RecordingChat::new());
        let pipeline = EventPipeline::start(PipelineContext {
            config: Arc::new(NpcConfig::new("Mira")),
            entity: EntityBinding {
                uuid: Uuid::new_v4(),
                name: "Mira".to_string(),
            },
            llm: llm.clone(),
            history: Arc::new(ConversationHistory::new(llm, Vec::new())),
            context: Arc::new(StaticContext::default()),
            executor: executor.clone(),
            chat,
        });

        // 第一个事件进入模型调用后，队列再装满 QUEUE_CAPACITY 个
        pipeline.submit("event-0");
        entered_rx.recv().await.unwrap();
        for i in 1..=QUEUE_CAPACITY {
            pipeline.submit(format!("event-{i}"));
        }
        assert_eq!(pipeline.dropped_events(), 0);

        // 超出容量的最新事件被丢弃，已接受的事件原样保留
        pipeline.submit("event-overflow");
        assert_eq!(pipeline.dropped_events(), 1);

        // 放行全部调用，确认只处理了被接受的 1 + QUEUE_CAPACITY 个事件
        gate.add_permits(1000);
        wait_until(|| executor.executed().len() == 1 + QUEUE_CAPACITY).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.executed().len(), 1 + QUEUE_CAPACITY);
        assert_eq!(pipeline.dropped_events(), 1);
    }

    #[tokio::test]
    async fn test_blocked_command_is_replaced_before_dispatch() {
        let f = fixture_with(|_| {});
        f.llm.push_reply(reply("Attack zombie", "grr"));
        f.pipeline.submit("a zombie approaches");
        wait_until(|| !f.executor.executed().is_empty()).await;
        assert_eq!(f.executor.executed(), vec!["idle"]);
    }

    #[tokio::test]
    async fn test_command_failure_feeds_error_event_back() {
        let f = fixture_with(|_| {});
        f.executor.fail_next("no path to target");
        f.llm.push_reply(reply("goto market", "on my way"));
        f.llm.push_reply(reply("idle", "staying put"));

        f.pipeline.submit("please go to the market");
        wait_until(|| f.llm.calls().len() == 2).await;

        let second = instruction_of(&f.llm.calls()[1]);
        assert!(second.contains("Command goto market failed"));
        assert!(second.contains("no path to target"));

        // 失败的那轮不输出；自纠错轮正常输出
        wait_until(|| !f.chat.messages().is_empty()).await;
        let texts: Vec<String> = f.chat.messages().into_iter().map(|(_, t)| t).collect();
        assert_eq!(texts, vec!["staying put"]);
        assert_eq!(f.executor.executed(), vec!["goto market", "idle"]);
    }

    #[tokio::test]
    async fn test_unparsable_reply_reports_degraded_message_and_continues() {
        let f = fixture_with(|_| {});
        f.llm.push_reply("I will not answer in JSON today");
        f.llm.push_reply(reply("idle", "back to normal"));

        f.pipeline.submit("hello?");
        wait_until(|| !f.chat.messages().is_empty()).await;
        let (_, first) = f.chat.messages()[0].clone();
        assert!(first.starts_with("Could not generate a response:"));
        assert!(first.contains("too small"));

        // 流水线未停：下一个事件照常处理
        f.pipeline.submit("still there?");
        wait_until(|| f.chat.messages().len() == 2).await;
        assert_eq!(f.chat.messages()[1].1, "back to normal");
    }

    #[tokio::test]
    async fn test_provider_error_is_reported_not_fatal() {
        let f = fixture_with(|_| {});
        f.llm.push_error("model not found");
        f.pipeline.submit("hello?");
        wait_until(|| !f.chat.messages().is_empty()).await;
        assert_eq!(
            f.chat.messages()[0].1,
            "Could not generate a response: model not found"
        );
    }

    #[tokio::test]
    async fn test_empty_message_is_not_chatted() {
        let f = fixture_with(|_| {});
        f.llm.push_reply(reply("idle", ""));
        f.pipeline.submit("anything to say?");
        wait_until(|| !f.executor.executed().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.chat.messages().is_empty());
    }

    #[tokio::test]
    async fn test_tts_runs_only_when_enabled_and_capable() {
        let llm = Arc::new(MockLlmClient::with_speech());
        llm.push_reply(reply("idle", "hello traveler"));
        let f = build_fixture(
            {
                let mut c = NpcConfig::new("Mira");
                c.tts = true;
                c
            },
            llm,
        );
        f.pipeline.submit("greet");
        wait_until(|| !f.llm.spoken().is_empty()).await;
        assert_eq!(f.llm.spoken(), vec!["hello traveler"]);

        // 未开启 tts 时即便有能力也不合成
        let silent = Arc::new(MockLlmClient::with_speech());
        silent.push_reply(reply("idle", "quiet hello"));
        let f2 = build_fixture(NpcConfig::new("Mira"), silent);
        f2.pipeline.submit("greet");
        wait_until(|| !f2.chat.messages().is_empty()).await;
        assert!(f2.llm.spoken().is_empty());
    }

    #[test]
    fn test_zone_with_higher_priority_wins() {
        let zones = vec![
            ZoneBehavior {
                name: "market".to_string(),
                from: Position::new(0, 0, 0),
                to: Position::new(10, 10, 10),
                priority: 1,
                instructions: "haggle with customers".to_string(),
            },
            ZoneBehavior {
                name: "shrine".to_string(),
                from: Position::new(0, 0, 0),
                to: Position::new(10, 10, 10),
                priority: 2,
                instructions: "speak in hushed tones".to_string(),
            },
        ];
        let result = apply_zone_behavior("hi", Position::new(5, 5, 5), &zones);
        assert!(result.contains("speak in hushed tones"));
        assert!(!result.contains("haggle"));
    }

    #[test]
    fn test_equal_priority_zones_yield_exactly_one_winner() {
        let zones = vec![
            ZoneBehavior {
                name: "east-wing".to_string(),
                from: Position::new(0, 0, 0),
                to: Position::new(10, 10, 10),
                priority: 3,
                instructions: "east instructions".to_string(),
            },
            ZoneBehavior {
                name: "west-wing".to_string(),
                from: Position::new(0, 0, 0),
                to: Position::new(10, 10, 10),
                priority: 3,
                instructions: "west instructions".to_string(),
            },
        ];
        let result = apply_zone_behavior("hi", Position::new(5, 5, 5), &zones);
        let east = result.contains("east instructions");
        let west = result.contains("west instructions");
        assert!(east ^ west, "exactly one zone's instructions must appear");
    }

    #[test]
    fn test_blank_instruction_zones_are_ignored() {
        let zones = vec![ZoneBehavior {
            name: "void".to_string(),
            from: Position::new(0, 0, 0),
            to: Position::new(10, 10, 10),
            priority: 9,
            instructions: "   ".to_string(),
        }];
        let result = apply_zone_behavior("hi", Position::new(5, 5, 5), &zones);
        assert_eq!(result, "hi");
    }
}
