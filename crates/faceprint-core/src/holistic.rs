//! Holistic 128-d face encoder via ONNX Runtime.
//!
//! Detects the face itself, aligns it to the canonical 112×112 crop and runs
//! an SFace-style recognizer. The raw encoding is returned without
//! normalization; an image with no detectable face yields [`EncodeError::NoFace`].

use crate::alignment::{self, ALIGNED_SIZE};
use crate::detector::{FaceDetector, FaceLocalizer};
use crate::encoder::{decode_rgb, expect_dimension, EncodeError, FaceEncoder};
use crate::types::Embedding;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

pub(crate) const EMBEDDING_DIM: usize = 128;
const MODEL_VERSION: &str = "sface-128";

pub struct HolisticEncoder {
    detector: FaceDetector,
    session: Session,
}

impl HolisticEncoder {
    pub fn new(detector: FaceDetector, session: Session) -> Self {
        Self { detector, session }
    }

    /// Aligned RGB crop → NCHW tensor of raw 0–255 intensities.
    fn input_tensor(aligned: &RgbImage) -> Array4<f32> {
        let size = ALIGNED_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in aligned.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32;
            }
        }
        tensor
    }
}

impl FaceEncoder for HolisticEncoder {
    fn model_version(&self) -> &str {
        MODEL_VERSION
    }

    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }

    fn embed(&mut self, path: &Path) -> Result<Embedding, EncodeError> {
        let image = decode_rgb(path)?;

        let face = self.detector.locate(&image)?.ok_or(EncodeError::NoFace)?;
        let landmarks = face.landmarks.as_ref().ok_or(EncodeError::NoLandmarks)?;
        tracing::debug!(score = face.score, width = face.width, height = face.height, "holistic: face located");

        let aligned = alignment::align_face(&image, landmarks);
        let input = Self::input_tensor(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncodeError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let values = expect_dimension(raw.to_vec(), EMBEDDING_DIM)?;

        Ok(Embedding {
            values,
            model_version: Some(MODEL_VERSION.to_string()),
        })
    }
}
