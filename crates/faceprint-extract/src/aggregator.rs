//! Per-user embedding aggregation.
//!
//! Every image of a user is embedded in upload order. Successful vectors are
//! written to their image rows and collected into the user's aggregate, all
//! inside one transaction per user. A user with no successful image is left
//! untouched.

use crate::observer::PipelineObserver;
use crate::store::{ImageRecord, Store, StoreError, UserBatch, UserRef};
use chrono::Utc;
use faceprint_core::{EncodeError, FaceEncoder};
use std::path::{Path, PathBuf};

/// What happened to one image.
#[derive(Debug)]
pub enum ImageOutcome {
    Embedded {
        dimension: usize,
        norm: f32,
        model: Option<String>,
    },
    /// The referenced file is not in the upload directory.
    Missing(PathBuf),
    Skipped(EncodeError),
}

/// What happened to one user.
#[derive(Debug)]
pub enum UserOutcome {
    /// Aggregate replaced with `embeddings` vectors out of `images` images.
    Stored { embeddings: usize, images: usize },
    NoImages,
    /// No image produced a vector; nothing was written.
    NoEmbeddings { images: usize },
    /// A database error; every write for this user was rolled back.
    Failed(StoreError),
}

impl UserOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UserOutcome::Stored { .. })
    }
}

pub struct Aggregator<'a> {
    encoder: &'a mut dyn FaceEncoder,
    upload_dir: &'a Path,
    observer: &'a dyn PipelineObserver,
}

impl<'a> Aggregator<'a> {
    pub fn new(
        encoder: &'a mut dyn FaceEncoder,
        upload_dir: &'a Path,
        observer: &'a dyn PipelineObserver,
    ) -> Self {
        Self { encoder, upload_dir, observer }
    }

    /// Recompute and replace one user's embeddings.
    pub fn process_user(&mut self, store: &mut Store, user: &UserRef) -> UserOutcome {
        let outcome = self
            .try_process_user(store, user)
            .unwrap_or_else(UserOutcome::Failed);
        self.observer.user_completed(user, &outcome);
        outcome
    }

    fn try_process_user(&mut self, store: &mut Store, user: &UserRef) -> Result<UserOutcome, StoreError> {
        let images = store.user_images(user.id)?;
        if images.is_empty() {
            return Ok(UserOutcome::NoImages);
        }
        self.observer.user_started(user, images.len());

        let previous_dimension = store.stored_dimension(user.id)?;

        let batch = store.begin_user()?;
        let vectors = match self.embed_images(&batch, user, &images) {
            Ok(vectors) => vectors,
            Err(e) => {
                discard(batch, user.id);
                return Err(e);
            }
        };

        let Some(dimension) = vectors.first().map(Vec::len) else {
            discard(batch, user.id);
            return Ok(UserOutcome::NoEmbeddings { images: images.len() });
        };

        if let Some(previous) = previous_dimension.filter(|&d| d != dimension) {
            tracing::warn!(
                user_id = user.id,
                previous,
                dimension,
                model = self.encoder.model_version(),
                "replacing embeddings of a different dimension; backend changed since last run"
            );
        }

        if let Err(e) = batch.replace_user_embeddings(user.id, &vectors, Utc::now()) {
            discard(batch, user.id);
            return Err(e);
        }
        batch.commit()?;

        Ok(UserOutcome::Stored {
            embeddings: vectors.len(),
            images: images.len(),
        })
    }

    /// Embed each image, writing successes into the batch as they happen.
    fn embed_images(
        &mut self,
        batch: &UserBatch<'_>,
        user: &UserRef,
        images: &[ImageRecord],
    ) -> Result<Vec<Vec<f32>>, StoreError> {
        let mut vectors = Vec::with_capacity(images.len());

        for image in images {
            let outcome = match self.locate_file(image) {
                Err(path) => ImageOutcome::Missing(path),
                Ok(path) => match self.encoder.embed(&path) {
                    Ok(embedding) => {
                        batch.set_image_embedding(image.id, &embedding.values)?;
                        let outcome = ImageOutcome::Embedded {
                            dimension: embedding.dimension(),
                            norm: embedding.norm(),
                            model: embedding.model_version.clone(),
                        };
                        vectors.push(embedding.values);
                        outcome
                    }
                    Err(e) => ImageOutcome::Skipped(e),
                },
            };
            self.observer.image_processed(user, image, &outcome);
        }

        Ok(vectors)
    }

    /// Path of the image in the upload directory; `Err` carries the path that was missing.
    fn locate_file(&self, image: &ImageRecord) -> Result<PathBuf, PathBuf> {
        match image.file_name() {
            Some(name) => {
                let path = self.upload_dir.join(name);
                if path.is_file() { Ok(path) } else { Err(path) }
            }
            None => Err(PathBuf::from(&image.image_url)),
        }
    }
}

fn discard(batch: UserBatch<'_>, user_id: i64) {
    if let Err(e) = batch.rollback() {
        tracing::warn!(user_id, error = %e, "rollback failed");
    }
}
