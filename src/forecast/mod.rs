//! Resolves [`InterventionForecast`]s against the branch they describe and
//! scores them with Brier scores.

use std::fmt::Write as _;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::llm::{CompletionRequest, LlmClient, StructuredExtractor};
use crate::situation::{ComparisonOperator, Situation};
use crate::state::SimulationState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::EnumString, JsonSchema)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ForecastCategory {
    HardMetric,
    Qualitative,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct HardMetricCriteria {
    pub agent_name: String,
    pub item_name: String,
    #[serde(default = "default_operator")]
    pub operator: ComparisonOperator,
    #[serde(default)]
    pub threshold: i64,
}

fn default_operator() -> ComparisonOperator {
    ComparisonOperator::Ge
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct InterventionForecast {
    pub question_title: String,
    pub question_text: String,
    pub resolution_criteria: String,
    pub prediction: f64,
    pub reasoning: String,
    #[serde(default)]
    pub is_conditional: bool,
    #[serde(default = "default_category")]
    pub category: ForecastCategory,
    #[serde(default)]
    pub hard_metric_criteria: Option<HardMetricCriteria>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub resolution: Option<bool>,
    #[serde(default)]
    pub brier_score: Option<f64>,
}

fn default_category() -> ForecastCategory {
    ForecastCategory::Qualitative
}

pub fn calculate_brier_score(prediction: f64, resolution: bool) -> f64 {
    let outcome = if resolution { 1.0 } else { 0.0 };
    (prediction - outcome).powi(2)
}

/// Pure, deterministic: looks up the agent's item count in the final state
/// and evaluates it against the criteria's operator/threshold. Missing
/// agents/items default to 0. An already-resolved forecast is never
/// re-resolved; a forecast with no criteria is returned unchanged.
pub fn resolve_hard_metric_forecast(forecast: &InterventionForecast, final_state: &SimulationState) -> InterventionForecast {
    let Some(criteria) = &forecast.hard_metric_criteria else {
        warn!("forecast '{}' has no hard_metric_criteria; leaving unresolved", forecast.question_title);
        return forecast.clone();
    };

    let actual = final_state.item_count(&criteria.agent_name, &criteria.item_name) as i64;
    let resolution = criteria.operator.evaluate(actual, criteria.threshold);
    let brier_score = calculate_brier_score(forecast.prediction, resolution);

    InterventionForecast {
        resolved: true,
        resolution: Some(resolution),
        brier_score: Some(brier_score),
        ..forecast.clone()
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
struct QualitativeResolution {
    resolved_yes: bool,
    #[allow(dead_code)]
    reasoning: String,
}

/// LLM-judged: builds a transcript of the branch's final state and asks the
/// judge for a strict yes/no verdict against `resolution_criteria`. The
/// judge must base its verdict only on the transcript, never on anything
/// else in the run.
pub async fn resolve_qualitative_forecast(
    forecast: &InterventionForecast,
    final_state: &SimulationState,
    situation: &Situation,
    llm: &dyn LlmClient,
    extractor: &dyn StructuredExtractor,
) -> crate::error::SitsimResult<InterventionForecast> {
    let transcript = build_simulation_transcript(final_state, situation);

    let prompt = format!(
        "Question: {}\n\n{}\n\nResolution criteria: {}\n\nTranscript:\n{}\n\nDid this resolve YES?",
        forecast.question_title, forecast.question_text, forecast.resolution_criteria, transcript
    );

    let request = CompletionRequest::new("judge-model", prompt)
        .with_system_prompt("You are a strict forecast judge. Base your verdict only on the transcript provided.")
        .with_temperature(0.1)
        .with_timeout(std::time::Duration::from_secs(120));

    crate::cost::ensure_budget_available()?;
    let response = llm.complete(request).await?;
    crate::cost::record_cost(response.cost_usd)?;

    let verdict: QualitativeResolution =
        crate::llm::extract(extractor, &response.text, "Extract resolved_yes (bool) and reasoning (string).").await?;

    let brier_score = calculate_brier_score(forecast.prediction, verdict.resolved_yes);

    Ok(InterventionForecast {
        resolved: true,
        resolution: Some(verdict.resolved_yes),
        brier_score: Some(brier_score),
        ..forecast.clone()
    })
}

/// Dispatches every forecast to the branch it describes (baseline ->
/// status-quo, conditional -> intervention) and the resolution algorithm
/// its category names.
pub async fn resolve_all_forecasts(
    forecasts: &[InterventionForecast],
    status_quo_final_state: &SimulationState,
    intervention_final_state: &SimulationState,
    situation: &Situation,
    llm: &dyn LlmClient,
    extractor: &dyn StructuredExtractor,
) -> Vec<InterventionForecast> {
    let mut resolved = Vec::with_capacity(forecasts.len());
    for forecast in forecasts {
        let final_state = if forecast.is_conditional {
            intervention_final_state
        } else {
            status_quo_final_state
        };

        let outcome = match forecast.category {
            ForecastCategory::HardMetric => resolve_hard_metric_forecast(forecast, final_state),
            ForecastCategory::Qualitative => {
                match resolve_qualitative_forecast(forecast, final_state, situation, llm, extractor).await {
                    Ok(f) => f,
                    Err(e) => {
                        warn!("qualitative forecast '{}' left unresolved: {e}", forecast.question_title);
                        forecast.clone()
                    }
                }
            }
        };
        resolved.push(outcome);
    }
    resolved
}

fn build_simulation_transcript(state: &SimulationState, situation: &Situation) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "## Final Inventories");
    for agent in &situation.agents {
        let inventory = state.agent_inventory(&agent.name);
        let _ = writeln!(out, "- {}: {:?}", agent.name, inventory);
    }
    let _ = writeln!(out, "- environment: {:?}", state.environment_inventory);

    let _ = writeln!(out, "\n## Messages");
    for message in &state.message_history {
        match &message.channel {
            Some(channel) => {
                let _ = writeln!(out, "[step {}] #{channel} {}: {}", message.step, message.sender, message.content);
            }
            None => {
                let target = message
                    .recipients
                    .iter()
                    .find(|r| **r != message.sender)
                    .map(|s| s.as_str())
                    .unwrap_or("?");
                let _ = writeln!(out, "[step {}] DM {} -> {}: {}", message.step, message.sender, target, message.content);
            }
        }
    }

    let _ = writeln!(out, "\n## Actions");
    for action in &state.action_log {
        if action.action_name == crate::state::builtin_actions::NO_ACTION {
            let _ = writeln!(out, "{}: no_action", action.agent_name);
        } else {
            let _ = writeln!(out, "{}: {}({:?})", action.agent_name, action.action_name, action.parameters);
        }
    }

    let _ = writeln!(out, "\n## Trades");
    for trade in &state.trade_history {
        let _ = writeln!(
            out,
            "trade {:?}: {} {} -> {} (step {})",
            trade.trade_id, trade.quantity, trade.item_name, trade.to_agent, trade.step
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    fn base_forecast() -> InterventionForecast {
        InterventionForecast {
            question_title: "Alice has at least 40 gold".into(),
            question_text: "Will Alice have >= 40 gold?".into(),
            resolution_criteria: "Alice.gold >= 40".into(),
            prediction: 0.7,
            reasoning: "seems likely".into(),
            is_conditional: false,
            category: ForecastCategory::HardMetric,
            hard_metric_criteria: Some(HardMetricCriteria {
                agent_name: "Alice".into(),
                item_name: "gold".into(),
                operator: ComparisonOperator::Ge,
                threshold: 40,
            }),
            resolved: false,
            resolution: None,
            brier_score: None,
        }
    }

    #[test]
    fn brier_score_exact_values() {
        assert!((calculate_brier_score(1.0, true) - 0.0).abs() < 1e-9);
        assert!((calculate_brier_score(0.0, true) - 1.0).abs() < 1e-9);
        assert!((calculate_brier_score(0.5, true) - 0.25).abs() < 1e-9);
        assert!((calculate_brier_score(0.5, false) - 0.25).abs() < 1e-9);
        assert!((calculate_brier_score(0.7, true) - 0.09).abs() < 1e-3);
    }

    #[test]
    fn hard_metric_resolves_true_above_threshold() {
        let forecast = base_forecast();
        let state = SimulationState::new(
            Map::from([("Alice".to_string(), Map::from([("gold".to_string(), 45)]))]),
            Map::new(),
        );
        let resolved = resolve_hard_metric_forecast(&forecast, &state);
        assert_eq!(resolved.resolution, Some(true));
        assert!((resolved.brier_score.unwrap() - 0.09).abs() < 1e-3);
    }

    #[test]
    fn hard_metric_defaults_missing_agent_to_zero() {
        let forecast = base_forecast();
        let state = SimulationState::new(Map::new(), Map::new());
        let resolved = resolve_hard_metric_forecast(&forecast, &state);
        assert_eq!(resolved.resolution, Some(false));
    }

    #[test]
    fn hard_metric_gt_boundary_exact() {
        let mut forecast = base_forecast();
        forecast.hard_metric_criteria.as_mut().unwrap().operator = ComparisonOperator::Gt;
        forecast.hard_metric_criteria.as_mut().unwrap().threshold = 45;

        let state_at_45 = SimulationState::new(
            Map::from([("Alice".to_string(), Map::from([("gold".to_string(), 45)]))]),
            Map::new(),
        );
        assert_eq!(resolve_hard_metric_forecast(&forecast, &state_at_45).resolution, Some(false));

        let state_at_46 = SimulationState::new(
            Map::from([("Alice".to_string(), Map::from([("gold".to_string(), 46)]))]),
            Map::new(),
        );
        assert_eq!(resolve_hard_metric_forecast(&forecast, &state_at_46).resolution, Some(true));
    }
}
