use crate::aggregator::{Aggregator, UserOutcome};
use crate::observer::PipelineObserver;
use crate::store::{Store, StoreError};
use faceprint_core::FaceEncoder;
use std::path::Path;
use std::time::{Duration, Instant};

/// Counts for one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunStats {
    /// Candidate users attempted.
    pub processed: usize,
    /// Users whose aggregate was replaced.
    pub succeeded: usize,
    /// Vectors written to user aggregates.
    pub embeddings_stored: usize,
    pub elapsed: Duration,
}

impl RunStats {
    pub fn failed(&self) -> usize {
        self.processed - self.succeeded
    }

    fn record(&mut self, outcome: &UserOutcome) {
        self.processed += 1;
        if outcome.is_success() {
            self.succeeded += 1;
        }
        if let UserOutcome::Stored { embeddings, .. } = outcome {
            self.embeddings_stored += embeddings;
        }
    }
}

/// Drives the aggregator over every candidate user, one at a time.
pub struct Orchestrator<'a> {
    aggregator: Aggregator<'a>,
    observer: &'a dyn PipelineObserver,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        encoder: &'a mut dyn FaceEncoder,
        upload_dir: &'a Path,
        observer: &'a dyn PipelineObserver,
    ) -> Self {
        Self {
            aggregator: Aggregator::new(encoder, upload_dir, observer),
            observer,
        }
    }

    /// Process `target` alone, or every user with images in id order.
    ///
    /// Per-user failures are counted, never returned; only selecting the
    /// candidates can fail the run.
    pub fn run(&mut self, store: &mut Store, target: Option<i64>) -> Result<RunStats, StoreError> {
        let started = Instant::now();

        let candidates = store.candidate_users(target)?;
        self.observer.run_started(target, candidates.len());

        let mut stats = RunStats::default();
        for user in &candidates {
            let outcome = self.aggregator.process_user(store, user);
            stats.record(&outcome);
        }

        stats.elapsed = started.elapsed();
        self.observer.run_finished(&stats);
        Ok(stats)
    }
}
