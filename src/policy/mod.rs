//! Produces a complete [`PolicyAgentResult`] from `(situation, state,
//! target_agent)` in a single LLM invocation: a goals analysis, evaluation
//! criteria, baseline forecasts, an intervention description, and
//! conditional forecasts — extracted afterward into exactly 16 typed
//! [`InterventionForecast`] records.

use std::fmt::Write as _;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::{LlmError, SitsimResult};
use crate::forecast::InterventionForecast;
use crate::llm::{CompletionRequest, LlmClient, StructuredExtractor};
use crate::situation::{AgentDefinition, Situation};
use crate::state::SimulationState;

const POLICY_AGENT_TIMEOUT_SECS: u64 = 300;
const REQUIRED_BASELINE_FORECASTS: usize = 8;
const REQUIRED_CONDITIONAL_FORECASTS: usize = 8;
const REQUIRED_TOTAL_FORECASTS: usize = REQUIRED_BASELINE_FORECASTS + REQUIRED_CONDITIONAL_FORECASTS;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct PolicyAgentResult {
    pub agent_goals_analysis: String,
    pub evaluation_criteria: Vec<String>,
    pub intervention_description: String,
    pub policy_proposal_markdown: String,
    pub forecasts: Vec<InterventionForecast>,
}

impl PolicyAgentResult {
    pub fn baseline_forecasts(&self) -> impl Iterator<Item = &InterventionForecast> {
        self.forecasts.iter().filter(|f| !f.is_conditional)
    }

    pub fn conditional_forecasts(&self) -> impl Iterator<Item = &InterventionForecast> {
        self.forecasts.iter().filter(|f| f.is_conditional)
    }

    pub fn hard_metric_forecasts(&self) -> impl Iterator<Item = &InterventionForecast> {
        self.forecasts
            .iter()
            .filter(|f| f.category == crate::forecast::ForecastCategory::HardMetric)
    }

    pub fn qualitative_forecasts(&self) -> impl Iterator<Item = &InterventionForecast> {
        self.forecasts
            .iter()
            .filter(|f| f.category == crate::forecast::ForecastCategory::Qualitative)
    }
}

/// Builds the prompt asking an LLM to produce the five phases in order:
/// goals analysis, 4-6 evaluation criteria, 8 baseline forecasts (3
/// hard-metric + 5 qualitative), an intervention description, and 8
/// conditional forecasts (3 hard-metric + 5 qualitative).
fn build_policy_prompt(situation: &Situation, state: &SimulationState, target_agent: &AgentDefinition) -> String {
    let mut prompt = String::new();

    let _ = writeln!(prompt, "# Situation: {}", situation.name);
    let _ = writeln!(prompt, "{}\n", situation.rules_text);

    let _ = writeln!(prompt, "## Target Agent: {}", target_agent.name);
    for field in &target_agent.persona {
        let _ = writeln!(prompt, "- {}: {}", field.key, field.value);
    }

    let _ = writeln!(prompt, "\n## Current State (step {})", state.step_number);
    for (agent, inventory) in &state.inventories {
        let _ = writeln!(prompt, "- {agent}: {inventory:?}");
    }

    let _ = writeln!(
        prompt,
        "\n## Instructions\n\
        Produce, in order:\n\
        1. A goals analysis for {}.\n\
        2. Exactly 4-6 evaluation criteria (one per line).\n\
        3. Exactly 8 baseline forecasts about the remaining steps with NO intervention: \
           3 hard-metric (an inventory threshold on a declared agent/item) and 5 qualitative.\n\
        4. An intervention: a direct-instruction message to {} that would change their behavior.\n\
        5. Exactly 8 conditional forecasts under that intervention: 3 hard-metric and 5 qualitative.\n\n\
        EXACTLY 16 forecasts total: 8 baseline + 8 conditional. Each hard-metric forecast must name a \
        declared agent, a declared item, a comparison operator, and a threshold.",
        target_agent.name, target_agent.name,
    );

    prompt
}

const EXTRACTION_INSTRUCTIONS: &str = concat!(
    "Extract a PolicyAgentResult object with fields: agent_goals_analysis (string), ",
    "evaluation_criteria (list of 4-6 strings), intervention_description (string), ",
    "policy_proposal_markdown (string), and forecasts (a list of exactly 16 ",
    "InterventionForecast objects: 8 with is_conditional=false and 8 with ",
    "is_conditional=true; within each group, exactly 3 category=hard_metric and ",
    "5 category=qualitative)."
);

/// Runs the single LLM call plus structured-output extraction and validates
/// the "exactly 16 forecasts" invariant before returning.
#[instrument(skip(situation, state, llm, extractor), fields(situation = %situation.name, target = %target_agent.name))]
pub async fn analyze_and_propose(
    situation: &Situation,
    state: &SimulationState,
    target_agent: &AgentDefinition,
    llm: &dyn LlmClient,
    extractor: &dyn StructuredExtractor,
) -> SitsimResult<PolicyAgentResult> {
    let prompt = build_policy_prompt(situation, state, target_agent);

    let request = CompletionRequest::new(target_agent.ai_model.clone(), prompt)
        .with_system_prompt("You are a simulation policy analyst. Follow the five-phase instructions exactly.")
        .with_temperature(0.7)
        .with_timeout(std::time::Duration::from_secs(POLICY_AGENT_TIMEOUT_SECS));

    crate::cost::ensure_budget_available()?;
    let response = llm.complete(request).await?;
    crate::cost::record_cost(response.cost_usd)?;

    let result: PolicyAgentResult = crate::llm::extract(extractor, &response.text, EXTRACTION_INSTRUCTIONS).await?;

    if result.forecasts.len() != REQUIRED_TOTAL_FORECASTS {
        return Err(LlmError::Extraction(format!(
            "expected {REQUIRED_TOTAL_FORECASTS} forecasts, got {}",
            result.forecasts.len()
        ))
        .into());
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::ForecastCategory;
    use crate::llm::mock::{ScriptedLlmClient, ScriptedStructuredExtractor};

    fn sample_forecast(is_conditional: bool) -> InterventionForecast {
        InterventionForecast {
            question_title: "q".into(),
            question_text: "q?".into(),
            resolution_criteria: "c".into(),
            prediction: 0.5,
            reasoning: "r".into(),
            is_conditional,
            category: ForecastCategory::Qualitative,
            hard_metric_criteria: None,
            resolved: false,
            resolution: None,
            brier_score: None,
        }
    }

    fn sample_result() -> PolicyAgentResult {
        let mut forecasts = Vec::new();
        for _ in 0..8 {
            forecasts.push(sample_forecast(false));
        }
        for _ in 0..8 {
            forecasts.push(sample_forecast(true));
        }
        PolicyAgentResult {
            agent_goals_analysis: "analysis".into(),
            evaluation_criteria: vec!["c1".into(), "c2".into()],
            intervention_description: "do this".into(),
            policy_proposal_markdown: "# proposal".into(),
            forecasts,
        }
    }

    #[tokio::test]
    async fn analyze_and_propose_rejects_wrong_forecast_count() {
        let situation = crate::situation::Situation {
            name: "s".into(),
            description: "".into(),
            rules_text: "".into(),
            items: vec![],
            agents: vec![crate::situation::AgentDefinition {
                name: "Alice".into(),
                persona: vec![],
                starting_inventory: Default::default(),
                special_actions: vec![],
                inventory_rules: vec![],
                ai_model: "test-model".into(),
            }],
            environment: crate::situation::EnvironmentDefinition {
                description: "".into(),
                inventory: Default::default(),
                global_actions: vec![],
                inventory_rules: vec![],
            },
            communication: crate::situation::Communication { channels: vec![], dm_blacklist: vec![] },
            max_steps: 5,
        };
        let state = crate::simulator::create_initial_state(&situation);

        let mut bad_result = sample_result();
        bad_result.forecasts.pop();
        let value = serde_json::to_value(&bad_result).unwrap();

        let llm = ScriptedLlmClient::constant("five phases here", 0.01);
        let extractor = ScriptedStructuredExtractor::new([value]);

        let result = analyze_and_propose(&situation, &state, &situation.agents[0], &llm, &extractor).await;
        assert!(result.is_err());
    }

    #[test]
    fn filters_partition_forecasts_correctly() {
        let result = sample_result();
        assert_eq!(result.baseline_forecasts().count(), 8);
        assert_eq!(result.conditional_forecasts().count(), 8);
    }
}
