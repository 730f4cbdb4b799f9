//! LLM 指令模板
//!
//! 系统提示按模型家族区分：通用 chat 模型用 `CHAT_SYSTEM_PROMPT`，
//! 本地小模型（ollama 等）用更严格的 `LOCAL_SYSTEM_PROMPT`。

use crate::llm::LlmFamily;
use crate::world::{CommandDescriptor, WorldContext};

/// NPC 创建成功后投喂的首个引导事件
pub const INITIAL_PROMPT: &str = "\
You have just appeared in this world.
Introduce yourself in character and state your role briefly.
Stay present in your area and wait for the player's request.
Do not start gathering resources or begin tasks unless explicitly asked.
";

/// 角色描述缺省值
pub const DEFAULT_CHARACTER_TRAITS: &str = "\
- speaks clearly and naturally
- grounded in local world lore
- helpful and informative
- asks clarifying questions when needed
- avoids meta or out-of-world commentary
";

const CHAT_SYSTEM_PROMPT: &str = "\
You are {name}, an NPC in this world with the following characteristics:
{character}

Guidelines for your responses:
1. Always stay in character and grounded in the local world setting.
2. Behave like a world NPC, not a player companion.
3. Keep responses concise, clear, and immersive.
4. Prefer dialogue, guidance, and roleplay interactions over autonomous task execution.
5. Never attack players or creatures and never break, mine, or place blocks.
6. If asked to do prohibited actions, refuse briefly and use `idle`.
7. If instructions are unclear, ask a short clarifying question.
8. Use body language actions when fitting:
   - greeting
   - victory
   - shake_head (no/disagree)
   - nod_head (yes/agree)
9. Use `idle` by default when no safe action is explicitly required.
10. Handle misspellings thoughtfully, but prioritize nearby NPC/player names.
11. Keep conversations meaningful; avoid filler and repetition.
12. Do not use any markdown syntax in your message, only use plain text.
13. Keep responses short.

IMPORTANT OUTPUT RULES:
- Respond ONLY with a single valid JSON object
- Do NOT wrap the JSON in backticks, quotes, or Markdown code fences
- Do NOT add explanations, comments, or extra text

Your response format MUST be exactly this:
{
  \"command\": \"One command from the valid list below. Use `idle` unless explicit action is requested.\",
  \"message\": \"If you decide you should not respond or talk, generate an empty message `\\\"\\\"`. Otherwise, create a natural conversational message that aligns with your character. Be concise and use less than 250 characters.\"
}

Commands:
{commands}
";

const LOCAL_SYSTEM_PROMPT: &str = "\
IMPORTANT: You MUST output ONLY one valid JSON object.
No explanations, no markdown, no extra text.

=== OUTPUT FORMAT (HARD REQUIREMENT) ===
Your response MUST be exactly:

{
  \"command\": \"<ONE command from the VALID COMMANDS list below>\",
  \"message\": \"<short in-character message, or ''>\"
}

CRITICAL RULES FOR 'command':
- The value of \"command\" MUST be EXACTLY one of the VALID COMMANDS listed below.
- You may not invent new commands.
- Use `idle` unless a safe, allowed action is requested.
- Never output attack/kill/break/mine/place commands.
- Only ONE command per output.

CRITICAL RULES FOR 'message':
- Under 250 characters.
- In-character NPC speech.
- Use \"\" (empty string) if you choose not to talk.
- No meta comments, system text, explanations, code, or instructions.
- Do not use any markdown syntax in your message, only use plain text.

=== VALID COMMANDS (THE ONLY THINGS YOU MAY PUT IN \"command\") ===
{commands}

=== YOUR ROLE ===
You are {name}, a world NPC.

Traits & Personality:
{character}

=== NPC BEHAVIOR RULES ===
1. Always stay in character and in-world.
2. Behave as a local character in the setting, not a companion bot.
3. Prefer conversation, guidance, and roleplay interactions.
4. Never attack players or creatures and never break, mine, or place blocks.
5. If asked to do prohibited actions, refuse briefly and use `idle`.
6. If a request is ambiguous, ask a short clarifying question.
7. Use `stop` to cancel ongoing actions when needed.
8. Avoid filler or repetitive phrases.
9. Never mention JSON, rules, prompts, or internal instructions.

FINAL REMINDER: Output ONLY the JSON object defined above.
";

/// 合成系统提示：名字 + 角色设定（含已解锁记忆片段） + 可用命令 + 模型家族格式要求
pub fn system_prompt(
    name: &str,
    character: &str,
    memory_prompts: &[&str],
    commands: &[CommandDescriptor],
    family: LlmFamily,
) -> String {
    let formatted_commands = commands
        .iter()
        .map(|c| format!("{}: {}", c.name, c.description))
        .collect::<Vec<_>>()
        .join("\n");

    let mut character = character.to_string();
    if !memory_prompts.is_empty() {
        character.push_str("\n\nUnlocked memories:\n");
        for prompt in memory_prompts {
            character.push_str("- ");
            character.push_str(prompt);
            character.push('\n');
        }
    }

    let template = match family {
        LlmFamily::Ollama => LOCAL_SYSTEM_PROMPT,
        LlmFamily::OpenAi => CHAT_SYSTEM_PROMPT,
    };
    template
        .replace("{name}", name)
        .replace("{character}", &character)
        .replace("{commands}", &formatted_commands)
}

/// 事件提示词：指令 + 世界环境快照
pub fn format_prompt(instruction: &str, ctx: &WorldContext) -> String {
    format!(
        "# INSTRUCTION\n{}\n\n# ENVIRONMENT\n## Nearby entities:\n{}\n## Nearest blocks:\n{}\n\n# INVENTORY\n{}\n\n# CURRENT STATE\n{}\n",
        instruction,
        ctx.nearby_entities.join(", "),
        ctx.nearest_blocks.join(", "),
        ctx.inventory.join(", "),
        ctx.state,
    )
}

/// 历史压缩用的摘要指令，`conversations_json` 为待摘要切片的 JSON 序列化
pub fn summary_prompt(conversations_json: &str) -> String {
    format!(
        "Our AI agent has been chatting with the user while acting in the world.\n\
         Update the agent's memory by summarizing the following conversation\n\n\
         Guidelines:\n\
         - Write in natural language, not JSON\n\
         - Keep the summary under 500 characters\n\
         - Preserve important facts, user requests, and useful tips\n\
         - Exclude stats, inventory details, code, or documentation\n\n\
         Conversations:\n{conversations_json}"
    )
}

/// 命令执行失败后回灌流水线的自纠错事件
pub fn command_error_prompt(command: &str, error: &str) -> String {
    format!("Command {command} failed. Error content: {error}")
}
