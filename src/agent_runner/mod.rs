//! For each agent, produces one [`AgentAction`] per step by prompting an
//! LLM with a situation- and state-derived view. The prompt is fully
//! data-derived: no free-form string concatenation of hidden state leaks
//! into another agent's prompt.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use tracing::{instrument, warn};

use crate::situation::{AgentDefinition, Availability, Membership, Situation};
use crate::state::{AgentAction, Message, SimulationState};

use crate::llm::{CompletionRequest, LlmClient, StructuredExtractor};

const RECENT_MESSAGES_WINDOW: usize = 30;
const RECENT_ACTIONS_WINDOW: usize = 20;

/// Returns every message the given agent is entitled to see: broadcast to a
/// channel it belongs to ("everyone" or explicit membership), or a DM
/// (`channel = None`) addressed to it.
pub fn visible_messages<'a>(
    agent_name: &str,
    state: &'a SimulationState,
    situation: &Situation,
) -> Vec<&'a Message> {
    state
        .message_history
        .iter()
        .filter(|m| match &m.channel {
            Some(channel_name) => situation
                .communication
                .channel(channel_name)
                .is_some_and(|c| c.allows(agent_name)),
            None => m.recipients.iter().any(|r| r == agent_name),
        })
        .collect()
}

/// Returns the persona fields of `target` visible to `viewer`: non-hidden
/// fields are visible to everyone, hidden fields only to `target` itself.
pub fn visible_persona<'a>(viewer: &str, target: &'a AgentDefinition) -> Vec<&'a crate::situation::PersonaField> {
    target
        .persona
        .iter()
        .filter(|field| !field.hidden || viewer == target.name)
        .collect()
}

fn is_available_to(availability: &Availability, agent_name: &str) -> bool {
    match availability {
        Membership::Everyone(_) => true,
        Membership::Agents(names) => names.iter().any(|n| n == agent_name),
    }
}

/// Builds the complete, deterministic prompt shown to one agent for one step.
#[instrument(skip(state, situation), fields(agent = %agent.name, step = state.step_number))]
pub fn build_prompt(agent: &AgentDefinition, state: &SimulationState, situation: &Situation) -> String {
    let mut prompt = String::new();

    let _ = writeln!(prompt, "# {}", situation.name);
    let _ = writeln!(prompt, "{}\n", situation.rules_text);

    let _ = writeln!(prompt, "## Your Identity");
    let _ = writeln!(prompt, "You are {}.", agent.name);
    let _ = writeln!(prompt, "### Your Persona");
    for field in visible_persona(&agent.name, agent) {
        let suffix = if field.hidden { " [HIDDEN from others]" } else { "" };
        let _ = writeln!(prompt, "- {}: {}{}", field.key, field.value, suffix);
    }

    let _ = writeln!(prompt, "\n### Other Agents");
    for other in &situation.agents {
        if other.name == agent.name {
            continue;
        }
        let _ = writeln!(prompt, "- {}:", other.name);
        for field in visible_persona(&agent.name, other) {
            let _ = writeln!(prompt, "  - {}: {}", field.key, field.value);
        }
    }

    let _ = writeln!(prompt, "\n## Your Inventory");
    for (item, qty) in state.agent_inventory(&agent.name) {
        let _ = writeln!(prompt, "- {item}: {qty}");
    }

    let _ = writeln!(prompt, "\n## Environment Inventory");
    for (item, qty) in &state.environment_inventory {
        let _ = writeln!(prompt, "- {item}: {qty}");
    }

    let _ = writeln!(prompt, "\n## Recent Messages");
    let visible = visible_messages(&agent.name, state, situation);
    for message in visible.iter().rev().take(RECENT_MESSAGES_WINDOW).rev() {
        match &message.channel {
            Some(channel) => {
                let _ = writeln!(prompt, "[step {}] #{channel} {}: {}", message.step, message.sender, message.content);
            }
            None => {
                let others: Vec<_> = message.recipients.iter().filter(|r| **r != message.sender).collect();
                let target = others.first().map(|s| s.as_str()).unwrap_or("?");
                let _ = writeln!(prompt, "[step {}] DM {} -> {}: {}", message.step, message.sender, target, message.content);
            }
        }
    }

    let _ = writeln!(prompt, "\n## Recent Actions");
    for action in state.action_log.iter().rev().take(RECENT_ACTIONS_WINDOW).rev() {
        if action.action_name == crate::state::builtin_actions::NO_ACTION {
            let _ = writeln!(prompt, "{}: no_action", action.agent_name);
        } else {
            let _ = writeln!(prompt, "{}: {}({:?})", action.agent_name, action.action_name, action.parameters);
        }
    }

    let _ = writeln!(prompt, "\n## Available Actions");
    let _ = writeln!(prompt, "- no_action");
    let _ = writeln!(prompt, "- trade_propose");
    let _ = writeln!(prompt, "- trade_accept");
    let _ = writeln!(prompt, "- trade_reject");
    for action in &situation.environment.global_actions {
        if is_available_to(&action.available_to, &agent.name) {
            let _ = writeln!(prompt, "- {}: {}", action.name, action.description);
        }
    }
    for action in &agent.special_actions {
        if is_available_to(&action.available_to, &agent.name) {
            let _ = writeln!(prompt, "- {}: {}", action.name, action.description);
        }
    }

    let _ = writeln!(prompt, "\n## Pending Trades You May Accept or Reject");
    for trade in &state.pending_trades {
        if trade.status == crate::state::TradeStatus::Pending
            && trade.eligible_acceptors.iter().any(|a| a == &agent.name)
        {
            let _ = writeln!(
                prompt,
                "- trade {:?} from {}: offering {:?} for {:?}",
                trade.id, trade.proposer, trade.offering, trade.requesting
            );
        }
    }

    prompt
}

/// Asks the LLM for one agent's action for this step. Parse failures,
/// structural errors, or a failed LLM call all yield a safe `no_action`
/// fallback for that agent rather than aborting the step.
#[instrument(skip(llm, extractor, state, situation), fields(agent = %agent.name))]
pub async fn get_agent_action(
    agent: &AgentDefinition,
    state: &SimulationState,
    situation: &Situation,
    llm: &dyn LlmClient,
    extractor: &dyn StructuredExtractor,
) -> AgentAction {
    let prompt = build_prompt(agent, state, situation);

    let request = CompletionRequest::new(agent.ai_model.clone(), prompt)
        .with_system_prompt("Choose exactly one action for this agent this step and respond with its parameters.");

    let completion = match crate::cost::ensure_budget_available() {
        Ok(()) => llm.complete(request).await,
        Err(e) => Err(e),
    };

    let completion = match completion {
        Ok(response) => {
            if let Err(e) = crate::cost::record_cost(response.cost_usd) {
                warn!("agent '{}' action discarded: cost budget exceeded: {e}", agent.name);
                return AgentAction::no_action(agent.name.clone());
            }
            response
        }
        Err(e) => {
            warn!("agent '{}' action defaulted to no_action: LLM call failed: {e}", agent.name);
            return AgentAction::no_action(agent.name.clone());
        }
    };

    match crate::llm::extract::<AgentAction>(extractor, &completion.text, ACTION_EXTRACTION_INSTRUCTIONS).await {
        Ok(mut action) => {
            action.agent_name = agent.name.clone();
            action
        }
        Err(e) => {
            warn!("agent '{}' action defaulted to no_action: {e}", agent.name);
            AgentAction::no_action(agent.name.clone())
        }
    }
}

const ACTION_EXTRACTION_INSTRUCTIONS: &str = concat!(
    "Parse the model's free-form response into an AgentAction object with ",
    "fields: agent_name, action_name, parameters (string map), ",
    "messages_to_send (list of Message), trade_proposal (optional), and ",
    "trade_acceptance_id (optional). If the response does not clearly name ",
    "an action, use action_name \"no_action\"."
);

/// Lookup used by the simulator to find a named, non-builtin action: the
/// environment's global actions first (filtered by `available_to`), then
/// the agent's own special actions.
pub fn find_action_definition<'a>(
    agent: &'a AgentDefinition,
    situation: &'a Situation,
    action_name: &str,
) -> Option<&'a crate::situation::ActionDefinition> {
    situation
        .environment
        .global_actions
        .iter()
        .find(|a| a.name == action_name && a.is_available_to(&agent.name))
        .or_else(|| agent.special_actions.iter().find(|a| a.name == action_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::situation::*;
    use std::collections::BTreeMap as Map;

    fn situation() -> Situation {
        Situation {
            name: "Test Situation".into(),
            description: String::new(),
            rules_text: "Test rules".into(),
            items: vec![ItemDefinition { name: "gold".into(), description: String::new(), tradable: true }],
            agents: vec![
                AgentDefinition {
                    name: "Alice".into(),
                    persona: vec![
                        PersonaField { key: "role".into(), value: "trader".into(), hidden: false },
                        PersonaField { key: "secret_goal".into(), value: "hoard gold".into(), hidden: true },
                    ],
                    starting_inventory: Map::from([("gold".to_string(), 10)]),
                    special_actions: vec![],
                    inventory_rules: vec![],
                    ai_model: "test-model".into(),
                },
                AgentDefinition {
                    name: "Bob".into(),
                    persona: vec![],
                    starting_inventory: Map::new(),
                    special_actions: vec![],
                    inventory_rules: vec![],
                    ai_model: "test-model".into(),
                },
            ],
            environment: EnvironmentDefinition {
                description: String::new(),
                inventory: Map::new(),
                global_actions: vec![],
                inventory_rules: vec![],
            },
            communication: Communication { channels: vec![], dm_blacklist: vec![] },
            max_steps: 10,
        }
    }

    #[test]
    fn prompt_contains_key_sections() {
        let situation = situation();
        let state = SimulationState::new(
            Map::from([("Alice".to_string(), Map::from([("gold".to_string(), 10)]))]),
            Map::new(),
        );
        let prompt = build_prompt(&situation.agents[0], &state, &situation);
        for expected in ["Test Situation", "Test rules", "Alice", "Your Inventory", "Available Actions", "no_action", "trade_propose"] {
            assert!(prompt.contains(expected), "prompt missing '{expected}'");
        }
    }

    #[test]
    fn prompt_includes_hidden_persona_for_self() {
        let situation = situation();
        let state = SimulationState::new(Map::new(), Map::new());
        let prompt = build_prompt(&situation.agents[0], &state, &situation);
        assert!(prompt.contains("secret_goal"));
    }

    #[test]
    fn prompt_excludes_hidden_persona_for_others() {
        let situation = situation();
        let state = SimulationState::new(Map::new(), Map::new());
        let prompt = build_prompt(&situation.agents[1], &state, &situation);
        assert!(!prompt.contains("secret_goal"));
    }

    #[test]
    fn visible_messages_respects_channel_membership() {
        let mut situation = situation();
        situation.communication.channels.push(Channel {
            name: "general".into(),
            members: Membership::Agents(vec!["Alice".into()]),
            description: String::new(),
        });
        let mut state = SimulationState::new(Map::new(), Map::new());
        state.message_history.push(Message {
            step: 1,
            sender: "Bob".into(),
            channel: Some("general".into()),
            recipients: vec!["Alice".into()],
            content: "hi".into(),
        });
        assert_eq!(visible_messages("Alice", &state, &situation).len(), 1);
        assert_eq!(visible_messages("Bob", &state, &situation).len(), 0);
    }

    #[test]
    fn visible_messages_includes_dms_addressed_to_agent() {
        let situation = situation();
        let mut state = SimulationState::new(Map::new(), Map::new());
        state.message_history.push(Message {
            step: 1,
            sender: "Bob".into(),
            channel: None,
            recipients: vec!["Alice".into(), "Bob".into()],
            content: "psst".into(),
        });
        assert_eq!(visible_messages("Alice", &state, &situation).len(), 1);
        assert_eq!(visible_messages("Bob", &state, &situation).len(), 1);
        assert_eq!(visible_messages("Carol", &state, &situation).len(), 0);
    }
}
