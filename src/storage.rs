//! Storage collaborator boundary
//!
//! Run records are persisted fire-and-forget through an opaque interface;
//! failures are logged, never propagated into the interactive session.
//! Real persistence lives behind this trait in a separate service.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// One finished run, as handed to the storage collaborator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRecord {
    pub user_id: i64,
    pub exercise_id: Option<i64>,
    pub source: String,
    pub output: String,
    pub error: String,
    /// Student-facing analysis (empty for exam submissions)
    pub analysis: String,
    /// Instructor-facing grading feedback
    pub grading: String,
    pub score: f64,
    pub success: bool,
}

/// Exercise metadata needed by the run sequence
#[derive(Debug, Clone, Default)]
pub struct ExerciseContext {
    /// Exam mode: withhold diagnostics from the submitter
    pub is_exam: bool,
    /// Reference output for grading
    pub expected_output: String,
    /// Maximum grade for the exercise
    pub max_score: f64,
}

/// Opaque persistence boundary
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a run record. Callers treat failures as log-only.
    async fn record_run(&self, record: RunRecord) -> Result<()>;

    /// Look up exercise metadata; `None` when unknown.
    async fn exercise_context(&self, exercise_id: i64) -> Result<Option<ExerciseContext>>;
}

/// Persist a record, downgrading any failure to a warning.
pub async fn record_run_logged(store: &dyn RunStore, record: RunRecord) {
    let user_id = record.user_id;
    if let Err(err) = store.record_run(record).await {
        warn!(user_id, "Failed to save run record: {err}");
    }
}

/// Log-only store for deployments without a persistence service
#[derive(Debug, Default)]
pub struct NoopStore;

#[async_trait]
impl RunStore for NoopStore {
    async fn record_run(&self, record: RunRecord) -> Result<()> {
        info!(
            user_id = record.user_id,
            exercise_id = record.exercise_id,
            success = record.success,
            "Run record (not persisted)"
        );
        Ok(())
    }

    async fn exercise_context(&self, _exercise_id: i64) -> Result<Option<ExerciseContext>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_store_accepts_records() {
        let store = NoopStore;
        store.record_run(RunRecord::default()).await.unwrap();
        assert!(store.exercise_context(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_run_logged_swallows_errors() {
        struct Failing;

        #[async_trait]
        impl RunStore for Failing {
            async fn record_run(&self, _record: RunRecord) -> Result<()> {
                Err(crate::error::Error::Storage("db down".to_string()))
            }

            async fn exercise_context(
                &self,
                _exercise_id: i64,
            ) -> Result<Option<ExerciseContext>> {
                Ok(None)
            }
        }

        // Must not panic or propagate
        record_run_logged(&Failing, RunRecord::default()).await;
    }
}
