//! Dumps the intermediate artifacts of one intervention run to a dedicated
//! directory, for debugging and manual inspection. Entirely optional: a run
//! with no [`RunDirWriter`] still produces its [`InterventionRun`] record,
//! just with nothing written to disk beyond the JSONL ledger.

use std::path::{Path, PathBuf};

use tracing::{info, instrument};

use crate::error::{IoError, SitsimResult};
use crate::intervention::InterventionRun;
use crate::policy::PolicyAgentResult;
use crate::state::SimulationResult;

pub struct RunDirWriter {
    results_dir: PathBuf,
}

impl RunDirWriter {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }

    /// `<results_dir>/run_<batch_timestamp>/<situation>_<run_id>_<run_timestamp>/`
    fn run_dir(&self, batch_timestamp: &str, run: &InterventionRun) -> PathBuf {
        self.results_dir.join(format!("run_{batch_timestamp}")).join(format!(
            "{}_{}_{}",
            slugify(&run.situation_name),
            run.run_id,
            run.timestamp.format("%Y%m%dT%H%M%SZ"),
        ))
    }

    /// Writes `policy_result.json`, `status_quo_simulation.json`,
    /// `intervention_simulation.json`, and `run_summary.json` into a fresh
    /// directory for this run. Creates every missing parent directory.
    #[instrument(skip_all, fields(situation = %run.situation_name, run_id = %run.run_id))]
    pub async fn write_run_artifacts(
        &self,
        batch_timestamp: &str,
        run: &InterventionRun,
        policy_result: &PolicyAgentResult,
        status_quo_result: &SimulationResult,
        intervention_result: &SimulationResult,
    ) -> SitsimResult<PathBuf> {
        let dir = self.run_dir(batch_timestamp, run);
        tokio::fs::create_dir_all(&dir).await.map_err(IoError::Io)?;

        write_json(&dir.join("policy_result.json"), policy_result).await?;
        write_json(&dir.join("status_quo_simulation.json"), status_quo_result).await?;
        write_json(&dir.join("intervention_simulation.json"), intervention_result).await?;
        write_json(&dir.join("run_summary.json"), run).await?;

        info!("wrote run artifacts to {}", dir.display());
        Ok(dir)
    }
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> SitsimResult<()> {
    let body = serde_json::to_vec_pretty(value).map_err(IoError::Json)?;
    tokio::fs::write(path, body).await.map_err(IoError::Io)?;
    Ok(())
}

fn slugify(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_replaces_non_alphanumerics() {
        assert_eq!(slugify("Trade Summit v2"), "trade_summit_v2");
    }

    #[tokio::test]
    async fn write_run_artifacts_creates_expected_files() {
        use chrono::Utc;
        use std::collections::BTreeMap as Map;

        let dir = std::env::temp_dir().join(format!("sitsim-rundir-test-{}", std::process::id()));
        let writer = RunDirWriter::new(&dir);

        let run = InterventionRun {
            run_id: "abcd1234".into(),
            timestamp: Utc::now(),
            model_name: "m".into(),
            situation_name: "Trade Summit".into(),
            target_agent_name: "Alice".into(),
            intervention_description: "d".into(),
            policy_proposal_markdown: "#".into(),
            evaluation_criteria: vec![],
            warmup_steps: 1,
            total_steps: 5,
            forecasts: vec![],
            total_cost: 0.0,
        };

        let policy_result = PolicyAgentResult {
            agent_goals_analysis: "a".into(),
            evaluation_criteria: vec![],
            intervention_description: "d".into(),
            policy_proposal_markdown: "#".into(),
            forecasts: vec![],
        };

        let situation = crate::situation::Situation {
            name: "Trade Summit".into(),
            description: "".into(),
            rules_text: "".into(),
            items: vec![],
            agents: vec![],
            environment: crate::situation::EnvironmentDefinition {
                description: "".into(),
                inventory: Map::new(),
                global_actions: vec![],
                inventory_rules: vec![],
            },
            communication: crate::situation::Communication { channels: vec![], dm_blacklist: vec![] },
            max_steps: 5,
        };
        let state = crate::state::SimulationState::new(Map::new(), Map::new());
        let sim_result = SimulationResult {
            situation,
            steps: vec![],
            final_state: state,
        };

        let written_dir = writer
            .write_run_artifacts("20260728T000000Z", &run, &policy_result, &sim_result, &sim_result)
            .await
            .unwrap();

        assert!(written_dir.join("policy_result.json").exists());
        assert!(written_dir.join("status_quo_simulation.json").exists());
        assert!(written_dir.join("intervention_simulation.json").exists());
        assert!(written_dir.join("run_summary.json").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
