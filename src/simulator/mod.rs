//! Step loop, action dispatch, and deep-copy branching.

use std::collections::BTreeMap;
use std::sync::Mutex;

use rand::{rngs::StdRng, SeedableRng};
use tracing::{info, instrument, warn};

use crate::agent_runner::{find_action_definition, get_agent_action};
use crate::cost::CostScope;
use crate::engine;
use crate::error::SitsimResult;
use crate::llm::{LlmClient, StructuredExtractor};
use crate::situation::Situation;
use crate::state::{
    builtin_actions, AgentAction, SimulationResult, SimulationState, SimulationStep, TradeProposal,
    TradeStatus,
};

/// Builds a [`SimulationState`] at step 0 with per-agent starting
/// inventories and the declared environment inventory.
pub fn create_initial_state(situation: &Situation) -> SimulationState {
    let inventories = situation
        .agents
        .iter()
        .map(|a| (a.name.clone(), a.starting_inventory.clone()))
        .collect::<BTreeMap<_, _>>();

    SimulationState::new(inventories, situation.environment.inventory.clone())
}

/// Owns one running simulation: a `Situation` plus the LLM collaborators
/// agents call into. Each counterfactual branch gets its own `Simulator`
/// wrapping its own deep-copied state, so the two never share mutable data.
pub struct Simulator<'a> {
    situation: &'a Situation,
    llm: &'a dyn LlmClient,
    extractor: &'a dyn StructuredExtractor,
    rng: Mutex<StdRng>,
}

impl<'a> Simulator<'a> {
    pub fn new(situation: &'a Situation, llm: &'a dyn LlmClient, extractor: &'a dyn StructuredExtractor) -> Self {
        Self { situation, llm, extractor, rng: Mutex::new(StdRng::from_os_rng()) }
    }

    /// Same as [`Simulator::new`] but with a fixed RNG seed, so
    /// `random_outcome` effects draw reproducibly across runs — exercises
    /// the seeded-determinism guarantee documented for this engine.
    pub fn seeded(situation: &'a Situation, llm: &'a dyn LlmClient, extractor: &'a dyn StructuredExtractor, seed: u64) -> Self {
        Self { situation, llm, extractor, rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }

    /// Runs exactly one tick: every agent acts in declaration order, then
    /// trades expire and step-end rules fire.
    #[instrument(skip(self, state), fields(situation = %self.situation.name))]
    pub async fn run_step(&self, state: &mut SimulationState) -> SimulationStep {
        state.step_number += 1;
        let state_before = state.clone();

        let mut agent_actions = Vec::with_capacity(self.situation.agents.len());
        let mut triggered_effects_log = Vec::new();

        for agent in &self.situation.agents {
            let action = get_agent_action(agent, state, self.situation, self.llm, self.extractor).await;
            state.action_log.push(action.clone());

            let log = self.dispatch(state, agent, &action);
            triggered_effects_log.extend(log);

            for message in action.messages_to_send.clone() {
                state.message_history.push(message);
            }

            agent_actions.push(action);
        }

        triggered_effects_log.extend(engine::expire_trades(state));
        triggered_effects_log.extend(engine::process_step_end_rules(state, self.situation, &mut *self.rng.lock().unwrap()));

        let state_after = state.clone();

        SimulationStep {
            step_number: state.step_number,
            agent_actions,
            triggered_effects_log,
            state_before,
            state_after,
        }
    }

    fn dispatch(&self, state: &mut SimulationState, agent: &crate::situation::AgentDefinition, action: &AgentAction) -> Vec<String> {
        match action.action_name.as_str() {
            builtin_actions::NO_ACTION => Vec::new(),
            builtin_actions::TRADE_PROPOSE => {
                let Some(request) = &action.trade_proposal else {
                    warn!("'{}' proposed a trade with no trade_proposal payload", agent.name);
                    return Vec::new();
                };
                let id = state.next_trade_id();
                state.pending_trades.push(TradeProposal {
                    id,
                    proposer: agent.name.clone(),
                    eligible_acceptors: request.eligible_acceptors.clone(),
                    offering: request.offering.clone(),
                    requesting: request.requesting.clone(),
                    proposed_at_step: state.step_number,
                    expires_at_step: request.expires_at_step,
                    status: TradeStatus::Pending,
                });
                vec![format!("{} proposed trade {:?}", agent.name, id)]
            }
            builtin_actions::TRADE_ACCEPT => match action.trade_acceptance_id {
                Some(id) => {
                    let (_, message) = engine::resolve_trade(state, id, &agent.name);
                    vec![message]
                }
                None => {
                    warn!("'{}' attempted trade_accept with no trade_acceptance_id", agent.name);
                    Vec::new()
                }
            },
            builtin_actions::TRADE_REJECT => match action.trade_acceptance_id {
                Some(id) => {
                    let (_, message) = engine::reject_trade(state, id);
                    vec![message]
                }
                None => {
                    warn!("'{}' attempted trade_reject with no trade_acceptance_id", agent.name);
                    Vec::new()
                }
            },
            other => match find_action_definition(agent, self.situation, other) {
                Some(definition) => engine::apply_effects(
                    state,
                    self.situation,
                    &definition.effects,
                    &agent.name,
                    &action.parameters,
                    &mut *self.rng.lock().unwrap(),
                ),
                None => {
                    warn!("'{}' attempted unknown action '{other}', ignoring", agent.name);
                    Vec::new()
                }
            },
        }
    }

    /// Runs `max_steps` ticks starting from `from_state` (or a fresh initial
    /// state if `None`), inside its own monetary cost scope.
    #[instrument(skip(self, from_state), fields(situation = %self.situation.name, max_steps))]
    pub async fn run_simulation(
        &self,
        from_state: Option<SimulationState>,
        max_steps: u32,
        cost_limit_usd: Option<f64>,
    ) -> SitsimResult<SimulationResult> {
        info!("starting simulation run for '{}' ({max_steps} steps)", self.situation.name);

        let (result, _spent) = CostScope::scoped(cost_limit_usd, || async move {
            let mut state = from_state.unwrap_or_else(|| create_initial_state(self.situation));
            let mut steps = Vec::with_capacity(max_steps as usize);

            for _ in 0..max_steps {
                let step = self.run_step(&mut state).await;
                steps.push(step);
            }

            Ok(SimulationResult {
                situation: self.situation.clone(),
                steps,
                final_state: state,
            })
        })
        .await?;

        Ok(result)
    }
}
