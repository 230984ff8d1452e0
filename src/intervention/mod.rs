//! Orchestrates one full intervention test: warmup -> pick target -> policy
//! agent -> branch -> parallel tails -> forecast resolution -> run record.

use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::cost::CostScope;
use crate::error::SitsimResult;
use crate::forecast::{resolve_all_forecasts, InterventionForecast};
use crate::llm::{LlmClient, StructuredExtractor};
use crate::policy::{analyze_and_propose, PolicyAgentResult};
use crate::simulator::{create_initial_state, Simulator};
use crate::situation::Situation;
use crate::state::{Message, SimulationState};

pub const INTERVENTION_ADVISOR_NAME: &str = "Intervention Advisor";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct RunId(pub String);

crate::impl_from_primitive!(RunId, String);

impl RunId {
    /// 8-char UUID truncation. Collisions are possible but unhandled, per
    /// the source design this was ported from — treated as cosmetic.
    pub fn generate() -> Self {
        let full = uuid::Uuid::new_v4().simple().to_string();
        Self(full[..8].to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterventionRun {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub model_name: String,
    pub situation_name: String,
    pub target_agent_name: String,
    pub intervention_description: String,
    pub policy_proposal_markdown: String,
    pub evaluation_criteria: Vec<String>,
    pub warmup_steps: u32,
    pub total_steps: u32,
    pub forecasts: Vec<InterventionForecast>,
    pub total_cost: f64,
}

impl InterventionRun {
    pub fn resolved_forecasts(&self) -> impl Iterator<Item = &InterventionForecast> {
        self.forecasts.iter().filter(|f| f.resolved)
    }

    pub fn average_brier_score(&self) -> Option<f64> {
        average(self.resolved_forecasts().filter_map(|f| f.brier_score))
    }

    pub fn average_hard_metric_brier_score(&self) -> Option<f64> {
        average(
            self.resolved_forecasts()
                .filter(|f| f.category == crate::forecast::ForecastCategory::HardMetric)
                .filter_map(|f| f.brier_score),
        )
    }

    pub fn average_qualitative_brier_score(&self) -> Option<f64> {
        average(
            self.resolved_forecasts()
                .filter(|f| f.category == crate::forecast::ForecastCategory::Qualitative)
                .filter_map(|f| f.brier_score),
        )
    }
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Runs one complete intervention test against `situation`, starting from a
/// fresh initial state.
pub struct InterventionRunner<'a> {
    pub model_name: String,
    pub cost_limit_usd: Option<f64>,
    llm: &'a dyn LlmClient,
    extractor: &'a dyn StructuredExtractor,
}

impl<'a> InterventionRunner<'a> {
    pub fn new(model_name: impl Into<String>, cost_limit_usd: Option<f64>, llm: &'a dyn LlmClient, extractor: &'a dyn StructuredExtractor) -> Self {
        Self {
            model_name: model_name.into(),
            cost_limit_usd,
            llm,
            extractor,
        }
    }

    #[instrument(skip(self, situation), fields(situation = %situation.name, warmup_steps))]
    pub async fn run_intervention_test(&self, situation: &Situation, warmup_steps: u32) -> SitsimResult<InterventionRun> {
        let run_id = RunId::generate();
        let model_name = self.model_name.clone();
        let cost_limit = self.cost_limit_usd;

        let (run, total_cost) = CostScope::scoped(cost_limit, || async move {
            let warmup_steps = warmup_steps.min(situation.max_steps.saturating_sub(1));
            info!("warming up '{}' for {warmup_steps} steps", situation.name);

            let simulator = Simulator::new(situation, self.llm, self.extractor);
            let mut state = create_initial_state(situation);
            for _ in 0..warmup_steps {
                simulator.run_step(&mut state).await;
            }

            let target_agent = situation
                .agents
                .choose(&mut rand::rng())
                .expect("situation.validate() guarantees at least one agent");

            let policy_result: PolicyAgentResult =
                analyze_and_propose(situation, &state, target_agent, self.llm, self.extractor).await?;

            let status_quo_state = state.clone();
            let intervention_state =
                inject_intervention_message(state.clone(), &policy_result.intervention_description, &target_agent.name);

            let intervention_situation = build_intervention_situation(situation, &policy_result.intervention_description, &target_agent.name);

            let remaining_steps = situation.max_steps - warmup_steps;

            let status_quo_sim = Simulator::new(situation, self.llm, self.extractor);
            let intervention_sim = Simulator::new(&intervention_situation, self.llm, self.extractor);

            let (status_quo_result, intervention_result) = tokio::try_join!(
                status_quo_sim.run_simulation(Some(status_quo_state), remaining_steps, None),
                intervention_sim.run_simulation(Some(intervention_state), remaining_steps, None),
            )?;

            let forecasts = resolve_all_forecasts(
                &policy_result.forecasts,
                &status_quo_result.final_state,
                &intervention_result.final_state,
                situation,
                self.llm,
                self.extractor,
            )
            .await;

            Ok(InterventionRun {
                run_id: run_id.0,
                timestamp: Utc::now(),
                model_name,
                situation_name: situation.name.clone(),
                target_agent_name: target_agent.name.clone(),
                intervention_description: policy_result.intervention_description,
                policy_proposal_markdown: policy_result.policy_proposal_markdown,
                evaluation_criteria: policy_result.evaluation_criteria,
                warmup_steps,
                total_steps: situation.max_steps,
                forecasts,
                total_cost: 0.0,
            })
        })
        .await?;

        Ok(InterventionRun { total_cost, ..run })
    }
}

/// Appends a synthetic DM from the Intervention Advisor to `target_agent`,
/// on the step equal to the current (post-warmup) step number.
fn inject_intervention_message(mut state: SimulationState, intervention_description: &str, target_agent: &str) -> SimulationState {
    state.message_history.push(Message {
        step: state.step_number,
        sender: INTERVENTION_ADVISOR_NAME.to_string(),
        channel: None,
        recipients: vec![target_agent.to_string(), INTERVENTION_ADVISOR_NAME.to_string()],
        content: format!("MANDATORY INTERVENTION INSTRUCTIONS:\n\n{intervention_description}"),
    });
    state
}

/// Builds a modified copy of `situation` whose `rules_text` carries a
/// mandatory intervention notice. The original `Situation` is untouched.
fn build_intervention_situation(situation: &Situation, intervention_description: &str, target_agent: &str) -> Situation {
    let mut copy = situation.clone();
    copy.rules_text = format!(
        "{}\n\nMANDATORY INTERVENTION NOTICE: {target_agent} has received the following \
         instructions and must follow them, overriding any other goals:\n\n{intervention_description}",
        situation.rules_text,
    );
    copy
}

/// Records the outcome of each situation in a batch independently; one
/// failed run does not cancel the others.
#[derive(Debug, Default)]
pub struct BatchRunReport {
    pub succeeded: Vec<InterventionRun>,
    pub failed: Vec<(String, crate::error::SitsimError)>,
}

impl BatchRunReport {
    pub fn record(&mut self, situation_name: String, outcome: SitsimResult<InterventionRun>) {
        match outcome {
            Ok(run) => self.succeeded.push(run),
            Err(e) => self.failed.push((situation_name, e)),
        }
    }
}
