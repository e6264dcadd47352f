//! rollcall-core — face matching for group-photo attendance.
//!
//! Batch nearest-neighbour recognition over registered face embeddings,
//! plus the image handling and ONNX face models (SCRFD detection, ArcFace
//! embedding) the daemon drives.

pub mod detector;
pub mod embedder;
pub mod imaging;
pub mod matcher;
pub mod types;

pub use detector::{DetectorError, FaceExtractor, ScrfdDetector};
pub use embedder::{ArcFaceEmbedder, Embedder, EmbedderError};
pub use matcher::{recognize_batch, L2Matcher, MatchError, Matcher};
pub use ab_glyph::FontArc;
pub use imaging::FaceMark;
pub use types::{BoundingBox, Embedding, Identity, Recognition, ReferenceSet, Scope, TypeError, UNKNOWN_LABEL};

/// The face models one worker drives: an extractor and an embedder.
///
/// Constructed explicitly and handed to the engine, so tests can substitute
/// fakes for the ONNX models.
pub struct FaceModels {
    pub extractor: Box<dyn FaceExtractor>,
    pub embedder: Box<dyn Embedder>,
}

impl FaceModels {
    /// Load SCRFD and ArcFace from their model files.
    pub fn load_onnx(scrfd_path: &str, arcface_path: &str, intra_threads: usize) -> Result<Self, ModelLoadError> {
        Ok(Self {
            extractor: Box::new(ScrfdDetector::load(scrfd_path, intra_threads)?),
            embedder: Box::new(ArcFaceEmbedder::load(arcface_path, intra_threads)?),
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ModelLoadError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
}
