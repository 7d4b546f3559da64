//! The face encoder capability and its backend selection.
//!
//! Two implementations share one contract: an image file in, a fixed-length
//! embedding out. Every per-image failure is reported as an [`EncodeError`]
//! so callers can skip the image and continue.

use crate::detector::{DetectorError, FaceDetector};
use crate::holistic::HolisticEncoder;
use crate::quantized::QuantizedEncoder;
use crate::types::Embedding;
use image::{DynamicImage, ImageDecoder, ImageReader, RgbImage};
use ort::session::Session;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Per-image failure. Never fatal for a run.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("cannot read image: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image is empty")]
    EmptyImage,
    #[error("no face detected")]
    NoFace,
    #[error("face has no landmarks for alignment")]
    NoLandmarks,
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected {expected}-dim embedding, got {actual}")]
    UnexpectedDimension { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Startup failure while loading an encoder. Fatal for a run.
#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns one face image into one embedding.
pub trait FaceEncoder {
    /// Identifier of the model producing the vectors.
    fn model_version(&self) -> &str;

    /// Length of every vector this encoder returns.
    fn dimension(&self) -> usize;

    fn embed(&mut self, path: &Path) -> Result<Embedding, EncodeError>;
}

/// Which encoder implementation a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Detector + alignment + 128-d encoder, raw output.
    Holistic,
    /// Localizer + crop + 192-d encoder, unit-normalized output.
    Quantized,
}

impl Backend {
    pub fn dimension(self) -> usize {
        match self {
            Backend::Holistic => crate::holistic::EMBEDDING_DIM,
            Backend::Quantized => crate::quantized::EMBEDDING_DIM,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Holistic => f.write_str("holistic"),
            Backend::Quantized => f.write_str("quantized"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "holistic" => Ok(Backend::Holistic),
            "quantized" => Ok(Backend::Quantized),
            other => Err(format!("unknown backend '{other}' (expected holistic or quantized)")),
        }
    }
}

/// Model asset locations.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub holistic: PathBuf,
    pub quantized: PathBuf,
}

/// Load the encoder for `backend`. Fails if any required model asset is missing.
pub fn load_encoder(backend: Backend, models: &ModelPaths) -> Result<Box<dyn FaceEncoder>, EncoderError> {
    let detector = FaceDetector::load(&models.detector)?;
    let encoder: Box<dyn FaceEncoder> = match backend {
        Backend::Holistic => Box::new(HolisticEncoder::new(detector, load_session(&models.holistic, "holistic")?)),
        Backend::Quantized => Box::new(QuantizedEncoder::new(detector, load_session(&models.quantized, "quantized")?)),
    };
    tracing::info!(
        %backend,
        model = encoder.model_version(),
        dimension = encoder.dimension(),
        "encoder ready"
    );
    Ok(encoder)
}

pub(crate) fn load_session(model_path: &Path, label: &str) -> Result<Session, EncoderError> {
    if !model_path.exists() {
        return Err(EncoderError::ModelNotFound(model_path.display().to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(model_path)?;

    tracing::info!(
        path = %model_path.display(),
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded {label} encoder model"
    );

    Ok(session)
}

/// Decode an image file to RGB, honoring its EXIF orientation.
pub fn decode_rgb(path: &Path) -> Result<RgbImage, EncodeError> {
    let mut decoder = ImageReader::open(path)?.with_guessed_format()?.into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);

    let rgb = image.to_rgb8();
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(EncodeError::EmptyImage);
    }
    Ok(rgb)
}

/// Check an inference output length against the encoder's fixed dimension.
pub(crate) fn expect_dimension(raw: Vec<f32>, expected: usize) -> Result<Vec<f32>, EncodeError> {
    if raw.len() != expected {
        return Err(EncodeError::UnexpectedDimension { expected, actual: raw.len() });
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::io::Write;

    #[test]
    fn test_backend_parse() {
        assert_eq!("holistic".parse::<Backend>().unwrap(), Backend::Holistic);
        assert_eq!("Quantized".parse::<Backend>().unwrap(), Backend::Quantized);
        assert!("dlib".parse::<Backend>().is_err());
    }

    #[test]
    fn test_backend_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Backend::Holistic).unwrap(), "\"holistic\"");
        let parsed: Backend = serde_json::from_str("\"quantized\"").unwrap();
        assert_eq!(parsed, Backend::Quantized);
    }

    #[test]
    fn test_backend_dimensions() {
        assert_eq!(Backend::Holistic.dimension(), 128);
        assert_eq!(Backend::Quantized.dimension(), 192);
    }

    #[test]
    fn test_load_encoder_missing_models() {
        let dir = tempfile::tempdir().unwrap();
        let models = ModelPaths {
            detector: dir.path().join("det.onnx"),
            holistic: dir.path().join("holistic.onnx"),
            quantized: dir.path().join("quantized.onnx"),
        };
        let err = load_encoder(Backend::Quantized, &models).err().unwrap();
        assert!(matches!(err, EncoderError::Detector(DetectorError::ModelNotFound(_))));
    }

    #[test]
    fn test_load_session_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_session(&dir.path().join("mobilefacenet.onnx"), "quantized").err().unwrap();
        assert!(matches!(err, EncoderError::ModelNotFound(p) if p.ends_with("mobilefacenet.onnx")));
    }

    #[test]
    fn test_decode_rgb_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.png");
        RgbImage::from_pixel(12, 8, Rgb([1, 2, 3])).save(&path).unwrap();

        let image = decode_rgb(&path).unwrap();
        assert_eq!(image.dimensions(), (12, 8));
        assert_eq!(image.get_pixel(0, 0), &Rgb([1, 2, 3]));
    }

    #[test]
    fn test_decode_rgb_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::File::create(&path).unwrap().write_all(b"not an image").unwrap();
        assert!(decode_rgb(&path).is_err());
    }

    #[test]
    fn test_decode_rgb_missing_file() {
        let err = decode_rgb(Path::new("/nonexistent/face.jpg")).unwrap_err();
        assert!(matches!(err, EncodeError::Io(_)));
    }

    #[test]
    fn test_expect_dimension() {
        assert!(expect_dimension(vec![0.0; 192], 192).is_ok());
        let err = expect_dimension(vec![0.0; 512], 192).unwrap_err();
        assert!(matches!(err, EncodeError::UnexpectedDimension { expected: 192, actual: 512 }));
    }
}
