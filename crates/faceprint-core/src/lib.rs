//! faceprint-core — Face localization, preprocessing and embedding backends.
//!
//! Uses SCRFD for face localization and one of two encoders, both running
//! via ONNX Runtime on the CPU:
//! - holistic: aligned 112×112 crop → 128-d raw embedding
//! - quantized: padded or center crop → 192-d unit-length embedding

pub mod alignment;
pub mod detector;
pub mod encoder;
pub mod holistic;
pub mod preprocess;
pub mod quantized;
pub mod types;

pub use detector::{FaceDetector, FaceLocalizer};
pub use encoder::{load_encoder, Backend, EncodeError, EncoderError, FaceEncoder, ModelPaths};
pub use types::{Embedding, FaceRegion};
