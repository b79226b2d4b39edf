//! Agent lookup and upstream prompt assembly.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::config::{AgentConfig, AppConfig, ResponseStyle};
use crate::store::{ChatTurn, Role};
use crate::transport::{ChatMessage, CompletionRequest};

/// Active agents indexed by id. Inactive agents are not resolvable.
#[derive(Debug, Default)]
pub struct AgentDirectory {
    agents: FxHashMap<i64, Arc<AgentConfig>>,
}

impl AgentDirectory {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        let agents = config
            .agents
            .iter()
            .filter(|agent| agent.active)
            .map(|agent| (agent.id, Arc::new(agent.clone())))
            .collect();
        Self { agents }
    }

    #[must_use]
    pub fn get(&self, agent_id: i64) -> Option<Arc<AgentConfig>> {
        self.agents.get(&agent_id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

fn style_instruction(style: ResponseStyle) -> Option<&'static str> {
    match style {
        ResponseStyle::Direct => None,
        ResponseStyle::Casual => Some("Respond in a casual, friendly manner."),
        ResponseStyle::Parables => {
            Some("Respond using parables and metaphors to illustrate your points.")
        }
        ResponseStyle::KingJames => {
            Some("Respond in the style of the King James Bible, using archaic English.")
        }
    }
}

/// Render the system prompt for `agent` answering `user_message`.
///
/// Only the first `{agent_name}` and `{user_message}` placeholders are filled.
#[must_use]
pub fn build_system_prompt(agent: &AgentConfig, user_message: &str) -> String {
    let mut prompt = agent
        .prompt_template
        .replacen("{agent_name}", &agent.name, 1)
        .replacen("{user_message}", user_message, 1);
    if let Some(instruction) = style_instruction(agent.response_style) {
        prompt.push_str("\n\n");
        prompt.push_str(instruction);
    }
    prompt
}

/// System prompt followed by `history` (oldest first, ending with the new user turn).
#[must_use]
pub fn build_messages(
    agent: &AgentConfig,
    user_message: &str,
    history: &[ChatTurn],
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatMessage::new("system", build_system_prompt(agent, user_message)));
    messages.extend(history.iter().map(|turn| {
        let role = match turn.role {
            Role::Assistant => "assistant",
            Role::User => "user",
        };
        ChatMessage::new(role, turn.content.clone())
    }));
    messages
}

/// Full upstream request body for `agent`.
#[must_use]
pub fn build_completion_request(
    agent: &AgentConfig,
    user_message: &str,
    history: &[ChatTurn],
    stream: bool,
) -> CompletionRequest {
    CompletionRequest {
        model: agent.model.clone(),
        messages: build_messages(agent, user_message, history),
        temperature: agent.temperature,
        max_tokens: agent.max_tokens,
        stream,
    }
}
