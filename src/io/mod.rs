//! Persists [`InterventionRun`](crate::intervention::InterventionRun)s to
//! disk: an append-only JSONL ledger (`jsonl`) and an optional per-run
//! directory dump of intermediate artifacts (`run_dir`).

pub mod jsonl;
pub mod run_dir;

pub use jsonl::JsonlRunStore;
pub use run_dir::RunDirWriter;
