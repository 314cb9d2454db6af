//! Batch driving across the (query, measure) product.
//!
//! Queries form the outer loop and measures the inner loop, both in configured
//! order, so progress numbering and artifact production order are
//! deterministic. One pair's failure is reported and the batch moves on; only
//! caller-initiated cancellation stops the whole batch early.

use crate::{
    error::{SweepError, SweepResult},
    orchestrator::{RunConfig, RunOutcome, run_one},
    stage::StageExecutor,
};

#[derive(Debug)]
pub struct RunFailure {
    pub query: String,
    pub measure: String,
    pub error: SweepError,
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: Vec<(String, String, RunOutcome)>,
    pub failures: Vec<RunFailure>,
}

impl BatchSummary {
    pub fn any_failed(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Run the pipeline once per (query, measure) pair.
pub fn run_batch(
    cfg: &RunConfig,
    queries: &[String],
    measures: &[String],
    exec: &mut dyn StageExecutor,
) -> SweepResult<BatchSummary> {
    if queries.is_empty() {
        return Err(SweepError::configuration("no queries configured"));
    }
    if measures.is_empty() {
        return Err(SweepError::configuration("no measures configured"));
    }

    let mut summary = BatchSummary {
        total: queries.len() * measures.len(),
        ..BatchSummary::default()
    };

    let mut index = 0usize;
    'batch: for query in queries {
        for measure in measures {
            index += 1;
            eprintln!("[{index}/{}] {query}/{measure}", summary.total);

            match run_one(cfg, query, measure, exec) {
                Ok(outcome) => {
                    eprintln!("Output: {}", outcome.video.display());
                    summary
                        .completed
                        .push((query.clone(), measure.clone(), outcome));
                }
                Err(error) => {
                    let cancelled = matches!(error, SweepError::Cancelled { .. });
                    tracing::error!(query = %query, measure = %measure, "run failed: {error}");
                    eprintln!("Failed: {query}/{measure}: {error}");
                    summary.failures.push(RunFailure {
                        query: query.clone(),
                        measure: measure.clone(),
                        error,
                    });
                    if cancelled {
                        break 'batch;
                    }
                }
            }
        }
    }

    Ok(summary)
}
