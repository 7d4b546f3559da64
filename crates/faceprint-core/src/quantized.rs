//! Quantized MobileFaceNet encoder via ONNX Runtime.
//!
//! Extracts 192-dimensional unit-length embeddings. Face localization is
//! best-effort: when no face is found the center square of the image is
//! encoded instead.

use crate::detector::{FaceDetector, FaceLocalizer};
use crate::encoder::{decode_rgb, expect_dimension, EncodeError, FaceEncoder};
use crate::preprocess;
use crate::types::{l2_normalize, Embedding, FaceRegion};
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

pub(crate) const EMBEDDING_DIM: usize = 192;
const MODEL_VERSION: &str = "mobilefacenet";

pub struct QuantizedEncoder<L: FaceLocalizer = FaceDetector> {
    localizer: L,
    session: Session,
}

impl<L: FaceLocalizer> QuantizedEncoder<L> {
    pub fn new(localizer: L, session: Session) -> Self {
        Self { localizer, session }
    }
}

/// Run the localizer, treating detector failures like "no face".
fn locate_or_fallback<L: FaceLocalizer>(localizer: &mut L, image: &RgbImage) -> Option<FaceRegion> {
    match localizer.locate(image) {
        Ok(Some(face)) => Some(face),
        Ok(None) => {
            tracing::debug!("quantized: no face located, using center crop");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "quantized: face localization failed, using center crop");
            None
        }
    }
}

impl<L: FaceLocalizer> FaceEncoder for QuantizedEncoder<L> {
    fn model_version(&self) -> &str {
        MODEL_VERSION
    }

    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }

    fn embed(&mut self, path: &Path) -> Result<Embedding, EncodeError> {
        let image = decode_rgb(path)?;

        let face = locate_or_fallback(&mut self.localizer, &image);
        let input = preprocess::preprocess(&image, face.as_ref()).ok_or(EncodeError::EmptyImage)?;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncodeError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw = expect_dimension(raw.to_vec(), EMBEDDING_DIM)?;

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(MODEL_VERSION.to_string()),
        })
    }
}
