//! Progress reporting hooks for the extraction pipeline.

use crate::aggregator::{ImageOutcome, UserOutcome};
use crate::orchestrator::RunStats;
use crate::store::{ImageRecord, UserRef};

/// Receives pipeline checkpoints. Every method defaults to doing nothing.
pub trait PipelineObserver {
    fn run_started(&self, _target: Option<i64>, _candidates: usize) {}

    fn user_started(&self, _user: &UserRef, _images: usize) {}

    fn image_processed(&self, _user: &UserRef, _image: &ImageRecord, _outcome: &ImageOutcome) {}

    fn user_completed(&self, _user: &UserRef, _outcome: &UserOutcome) {}

    fn run_finished(&self, _stats: &RunStats) {}
}

/// Reports checkpoints as structured `tracing` events.
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn run_started(&self, target: Option<i64>, candidates: usize) {
        match (target, candidates) {
            (Some(user_id), 0) => tracing::warn!(user_id, "no face images found for user"),
            (None, 0) => tracing::warn!("no users with face images found"),
            _ => tracing::info!(users = candidates, "found users with face images"),
        }
    }

    fn user_started(&self, user: &UserRef, images: usize) {
        tracing::info!(user_id = user.id, name = %user.name, images, "processing user");
    }

    fn image_processed(&self, user: &UserRef, image: &ImageRecord, outcome: &ImageOutcome) {
        let file = image.file_name().unwrap_or(&image.image_url);
        match outcome {
            ImageOutcome::Embedded { dimension, norm, model } => {
                tracing::info!(
                    user_id = user.id,
                    image_id = image.id,
                    file,
                    uploaded = %image.created_at,
                    dimension,
                    norm,
                    model = model.as_deref(),
                    "embedding extracted"
                );
            }
            ImageOutcome::Missing(path) => {
                tracing::warn!(user_id = user.id, image_id = image.id, path = %path.display(), "image not found");
            }
            ImageOutcome::Skipped(reason) => {
                tracing::warn!(user_id = user.id, image_id = image.id, file, %reason, "extraction failed");
            }
        }
    }

    fn user_completed(&self, user: &UserRef, outcome: &UserOutcome) {
        match outcome {
            UserOutcome::Stored { embeddings, images } => {
                tracing::info!(user_id = user.id, embeddings, images, "user embeddings saved");
            }
            UserOutcome::NoImages => {
                tracing::warn!(user_id = user.id, "no images found for user");
            }
            UserOutcome::NoEmbeddings { images } => {
                tracing::error!(user_id = user.id, images, "no valid embeddings extracted; user left unchanged");
            }
            UserOutcome::Failed(error) => {
                tracing::error!(user_id = user.id, %error, "user rolled back");
            }
        }
    }

    fn run_finished(&self, stats: &RunStats) {
        tracing::info!(
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed(),
            embeddings = stats.embeddings_stored,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "run complete"
        );
    }
}
