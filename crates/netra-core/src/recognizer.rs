//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional face embeddings from face crops,
//! using the w600k_r50 ArcFace model.

use crate::detector::resize_bilinear_rgb;
use crate::types::Embedding;
use ndarray::Array4;
use netra_hw::Crop;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (different from SCRFD!) ---
const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // NOT 128.0: ArcFace uses symmetric normalization
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}; download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that turns a face crop into an embedding.
///
/// Returns `Ok(None)` for an empty or zero-area crop.
pub trait FaceEmbed {
    fn embed(&mut self, crop: &Crop) -> Result<Option<Embedding>, RecognizerError>;
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Resize an RGB crop to 112x112 and normalise into a NCHW float tensor.
    fn preprocess(crop: &Crop) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let resized = resize_bilinear_rgb(
            &crop.data,
            crop.width as usize,
            crop.height as usize,
            size,
            size,
        );

        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for y in 0..size {
            for x in 0..size {
                let src = (y * size + x) * 3;
                for c in 0..3 {
                    tensor[[0, c, y, x]] = (resized[src + c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
                }
            }
        }

        tensor
    }
}

impl FaceEmbed for FaceRecognizer {
    fn embed(&mut self, crop: &Crop) -> Result<Option<Embedding>, RecognizerError> {
        if crop.is_empty() {
            return Ok(None);
        }

        let input = Self::preprocess(crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        let embedding = Embedding {
            values: raw_data.to_vec(),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        };
        Ok(Some(embedding.l2_normalized()))
    }
}
