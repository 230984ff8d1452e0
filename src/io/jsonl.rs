//! Append-only JSONL ledger of [`InterventionRun`]s, one JSON object per
//! line, plus the read-side queries over that same file.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::error::{IoError, SitsimResult};
use crate::intervention::InterventionRun;

/// A single JSONL file shared by every run in a batch. The file handle
/// itself is opened fresh per write (so concurrent writers never race over
/// a shared seek position); the [`Mutex`] only serializes the
/// open-append-close sequence so two runs racing to append never interleave
/// their lines.
pub struct JsonlRunStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlRunStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Appends `run` as a single line. Creates the file (and its parent
    /// directory) if it doesn't exist yet.
    #[instrument(skip(self, run), fields(path = %self.path.display(), run_id = %run.run_id))]
    pub async fn append(&self, run: &InterventionRun) -> SitsimResult<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(IoError::Io)?;
        }

        let mut line = serde_json::to_string(run).map_err(IoError::Json)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(IoError::Io)?;

        file.write_all(line.as_bytes()).await.map_err(IoError::Io)?;
        info!("appended run '{}' to {}", run.run_id, self.path.display());
        Ok(())
    }
}

/// Reads every run recorded in `path`, in file order. A blank trailing line
/// is ignored; any other malformed line is a hard error naming its 1-based
/// line number, since a corrupt ledger should never be silently truncated.
pub fn read_all_runs(path: impl AsRef<Path>) -> SitsimResult<Vec<InterventionRun>> {
    let contents = std::fs::read_to_string(path.as_ref()).map_err(IoError::Io)?;
    parse_runs(&contents)
}

fn parse_runs(contents: &str) -> SitsimResult<Vec<InterventionRun>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| {
                IoError::MalformedRecord {
                    line: i + 1,
                    msg: e.to_string(),
                }
                .into()
            })
        })
        .collect()
}

/// Filters [`read_all_runs`] down to the runs recorded under `model_name`.
pub fn read_runs_for_model(path: impl AsRef<Path>, model_name: &str) -> SitsimResult<Vec<InterventionRun>> {
    Ok(read_all_runs(path)?
        .into_iter()
        .filter(|run| run.model_name == model_name)
        .collect())
}

/// Lists the distinct `model_name`s recorded in the ledger, in first-seen
/// order.
pub fn list_model_names(path: impl AsRef<Path>) -> SitsimResult<Vec<String>> {
    let runs = read_all_runs(path)?;
    let mut seen = Vec::new();
    for run in runs {
        if !seen.contains(&run.model_name) {
            seen.push(run.model_name);
        }
    }
    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_run(model_name: &str) -> InterventionRun {
        InterventionRun {
            run_id: "abcd1234".into(),
            timestamp: Utc::now(),
            model_name: model_name.into(),
            situation_name: "s".into(),
            target_agent_name: "Alice".into(),
            intervention_description: "d".into(),
            policy_proposal_markdown: "#".into(),
            evaluation_criteria: vec![],
            warmup_steps: 1,
            total_steps: 5,
            forecasts: vec![],
            total_cost: 0.01,
        }
    }

    #[tokio::test]
    async fn append_then_read_round_trips() {
        let dir = std::env::temp_dir().join(format!("sitsim-jsonl-test-{}", std::process::id()));
        let path = dir.join("runs.jsonl");
        let store = JsonlRunStore::new(&path);

        store.append(&sample_run("gpt-test")).await.unwrap();
        store.append(&sample_run("gpt-test")).await.unwrap();
        store.append(&sample_run("other-model")).await.unwrap();

        let all = read_all_runs(&path).unwrap();
        assert_eq!(all.len(), 3);

        let gpt_only = read_runs_for_model(&path, "gpt-test").unwrap();
        assert_eq!(gpt_only.len(), 2);

        let models = list_model_names(&path).unwrap();
        assert_eq!(models, vec!["gpt-test".to_string(), "other-model".to_string()]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn malformed_line_names_its_line_number() {
        let contents = "{\"not\":\"a run\"}\nnot even json\n";
        let err = parse_runs(contents).unwrap_err();
        match err {
            crate::error::SitsimError::Io(IoError::MalformedRecord { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected MalformedRecord, got {other:?}"),
        }
    }
}
