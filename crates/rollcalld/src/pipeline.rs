//! Recognition pipeline: decode → downscale → detect → embed (in parallel)
//! → batch recognition, for one uploaded image.
//!
//! The pipeline never writes anything except through `register`, which
//! appends to the embedding store only after every photo has been embedded.

use crate::engine::{EngineError, EngineHandle};
use crate::store::{EmbeddingStore, StoreError};
use image::RgbImage;
use rollcall_core::imaging::{self, ImagingError};
use rollcall_core::{recognize_batch, BoundingBox, Embedding, Identity, MatchError, Recognition, Scope};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("image decode failed: {0}")]
    Decode(#[source] ImagingError),
    #[error("face detection failed: {0}")]
    Extractor(#[source] EngineError),
    #[error("embedding face {face} failed: {source}")]
    Embedder {
        face: usize,
        #[source]
        source: EngineError,
    },
    #[error("no face detected in photo {photo}")]
    NoFaceInPhoto { photo: usize },
    #[error("{stage} stage exceeded {timeout:?}")]
    Timeout { stage: Stage, timeout: Duration },
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("recognition failed: {0}")]
    Recognize(#[from] MatchError),
    #[error("pipeline worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Detection,
    Embedding,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Detection => "detection",
            Stage::Embedding => "embedding",
        })
    }
}

/// Whether the caller should fix its input or try again later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    BadInput,
    RetryLater,
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Decode(_) | PipelineError::NoFaceInPhoto { .. } => ErrorClass::BadInput,
            // The detector placed a box the photo cannot supply; retrying fails the same way.
            PipelineError::Embedder { source: EngineError::Crop(_), .. } => ErrorClass::BadInput,
            _ => ErrorClass::RetryLater,
        }
    }
}

/// A detected face paired with its recognition result.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedFace {
    pub face: BoundingBox,
    pub recognition: Recognition,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionOutcome {
    NoFacesDetected,
    /// Faces were found but nothing is registered for the scope.
    NoReferenceData { faces: Vec<BoundingBox> },
    /// One entry per detected face, in detection order.
    Recognized(Vec<RecognizedFace>),
}

/// Result of [`Pipeline::process`]: the normalized image the boxes refer to,
/// and the outcome.
pub struct Processed {
    pub image: Arc<RgbImage>,
    pub outcome: RecognitionOutcome,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub match_threshold: f32,
    pub max_image_dimension: u32,
    pub stage_timeout: Duration,
}

#[derive(Clone)]
pub struct Pipeline {
    engine: EngineHandle,
    store: EmbeddingStore,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(engine: EngineHandle, store: EmbeddingStore, settings: PipelineSettings) -> Self {
        Self { engine, store, settings }
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    /// Recognize every face in `bytes` against the scope's reference set.
    pub async fn process(&self, bytes: Vec<u8>, scope: &Scope) -> Result<Processed, PipelineError> {
        let image = self.decode(bytes).await?;

        let faces = self
            .with_timeout(Stage::Detection, self.engine.detect(image.clone()))
            .await?
            .map_err(PipelineError::Extractor)?;

        if faces.is_empty() {
            tracing::info!(scope = %scope, "no faces detected");
            return Ok(Processed { image, outcome: RecognitionOutcome::NoFacesDetected });
        }

        let reference = self.store.load(scope).await?;
        if reference.is_empty() {
            tracing::info!(scope = %scope, faces = faces.len(), "no reference data for scope");
            return Ok(Processed { image, outcome: RecognitionOutcome::NoReferenceData { faces } });
        }

        let jobs = faces.iter().map(|face| (image.clone(), *face)).collect();
        let embeddings = self
            .with_timeout(Stage::Embedding, embed_all(&self.engine, jobs))
            .await??;

        let recognitions = recognize_batch(&embeddings, &reference, self.settings.match_threshold)?;

        let recognized: Vec<RecognizedFace> = faces
            .into_iter()
            .zip(recognitions)
            .map(|(face, recognition)| RecognizedFace { face, recognition })
            .collect();

        tracing::info!(
            scope = %scope,
            faces = recognized.len(),
            known = recognized.iter().filter(|r| r.recognition.is_known()).count(),
            reference = reference.len(),
            "recognition complete"
        );

        Ok(Processed { image, outcome: RecognitionOutcome::Recognized(recognized) })
    }

    /// Register `identity` in `scope` from one or more photos.
    ///
    /// The most confident face of each photo is embedded; a photo without a
    /// face rejects the whole registration. Returns embeddings stored.
    pub async fn register(
        &self,
        scope: &Scope,
        identity: &Identity,
        photos: Vec<Vec<u8>>,
    ) -> Result<usize, PipelineError> {
        let mut jobs = Vec::with_capacity(photos.len());
        for (photo, bytes) in photos.into_iter().enumerate() {
            let image = self.decode(bytes).await?;
            let faces = self
                .with_timeout(Stage::Detection, self.engine.detect(image.clone()))
                .await?
                .map_err(PipelineError::Extractor)?;

            let best = faces
                .into_iter()
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
                .ok_or(PipelineError::NoFaceInPhoto { photo })?;
            tracing::debug!(photo, confidence = best.confidence, "registration face selected");
            jobs.push((image, best));
        }

        let embeddings = self
            .with_timeout(Stage::Embedding, embed_all(&self.engine, jobs))
            .await??;

        let stored = self.store.append(scope, &embeddings, identity).await?;
        tracing::info!(scope = %scope, identity = %identity, stored, "registration complete");
        Ok(stored)
    }

    async fn decode(&self, bytes: Vec<u8>) -> Result<Arc<RgbImage>, PipelineError> {
        let max_dimension = self.settings.max_image_dimension;
        let image = tokio::task::spawn_blocking(move || {
            imaging::decode(&bytes).map(|img| imaging::fit_within(img, max_dimension))
        })
        .await?
        .map_err(PipelineError::Decode)?;
        Ok(Arc::new(image))
    }

    async fn with_timeout<T>(&self, stage: Stage, fut: impl Future<Output = T>) -> Result<T, PipelineError> {
        let timeout = self.settings.stage_timeout;
        tokio::time::timeout(timeout, fut).await.map_err(|_| {
            tracing::warn!(%stage, ?timeout, "pipeline stage timed out");
            PipelineError::Timeout { stage, timeout }
        })
    }
}

/// Embed every (image, face) job on the engine and gather the results.
///
/// Results are slotted by job index, so output `i` belongs to job `i`
/// whatever order the workers finish in. The first failure aborts the
/// remaining jobs.
async fn embed_all(
    engine: &EngineHandle,
    jobs: Vec<(Arc<RgbImage>, BoundingBox)>,
) -> Result<Vec<Embedding>, PipelineError> {
    let mut slots: Vec<Option<Embedding>> = vec![None; jobs.len()];
    let mut tasks = JoinSet::new();

    for (index, (image, face)) in jobs.into_iter().enumerate() {
        let engine = engine.clone();
        tasks.spawn(async move { (index, engine.embed(image, face).await) });
    }

    while let Some(joined) = tasks.join_next().await {
        let (index, result) = joined?;
        match result {
            Ok(embedding) => slots[index] = Some(embedding),
            Err(source) => {
                tasks.abort_all();
                tracing::warn!(face = index, error = %source, "embedding failed, aborting request");
                return Err(PipelineError::Embedder { face: index, source });
            }
        }
    }

    Ok(slots.into_iter().flatten().collect())
}
