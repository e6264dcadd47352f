use image::RgbImage;
use rollcall_core::detector::DetectorError;
use rollcall_core::embedder::EmbedderError;
use rollcall_core::imaging::{self, ImagingError};
use rollcall_core::{BoundingBox, Embedding, FaceModels, ModelLoadError};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Requests a worker can hold queued per worker thread.
const QUEUE_DEPTH_PER_WORKER: usize = 4;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model load failed: {0}")]
    ModelLoad(#[from] ModelLoadError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("face crop failed: {0}")]
    Crop(#[from] ImagingError),
    #[error("failed to spawn engine worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine needs at least one worker")]
    NoWorkers,
    #[error("engine workers exited")]
    ChannelClosed,
}

/// Messages sent from request handlers to the worker threads.
enum EngineRequest {
    Detect {
        image: Arc<RgbImage>,
        reply: oneshot::Sender<Result<Vec<BoundingBox>, EngineError>>,
    },
    Embed {
        image: Arc<RgbImage>,
        face: BoundingBox,
        reply: oneshot::Sender<Result<Embedding, EngineError>>,
    },
}

/// Clone-safe handle to the worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    workers: usize,
}

impl EngineHandle {
    /// Detect every face in `image`.
    pub async fn detect(&self, image: Arc<RgbImage>) -> Result<Vec<BoundingBox>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Detect { image, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Crop `face` out of `image` and compute its embedding.
    pub async fn embed(&self, image: Arc<RgbImage>, face: BoundingBox) -> Result<Embedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Embed { image, face, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

/// Spawn `workers` inference threads, each owning the models `load` returns.
///
/// All models are loaded before any thread starts, so a missing or broken
/// model fails startup. Workers share one bounded request queue and exit
/// when every handle has been dropped.
pub fn spawn_engine<F>(workers: usize, load: F) -> Result<EngineHandle, EngineError>
where
    F: Fn(usize) -> Result<FaceModels, EngineError>,
{
    if workers == 0 {
        return Err(EngineError::NoWorkers);
    }

    let models = (0..workers).map(&load).collect::<Result<Vec<_>, _>>()?;
    tracing::info!(workers, "face models loaded");

    let (tx, rx) = mpsc::channel::<EngineRequest>(workers * QUEUE_DEPTH_PER_WORKER);
    let rx = Arc::new(Mutex::new(rx));

    for (index, models) in models.into_iter().enumerate() {
        let rx = Arc::clone(&rx);
        std::thread::Builder::new()
            .name(format!("rollcall-engine-{index}"))
            .spawn(move || worker_loop(index, models, rx))
            .map_err(EngineError::Spawn)?;
    }

    Ok(EngineHandle { tx, workers })
}

fn worker_loop(index: usize, mut models: FaceModels, rx: Arc<Mutex<mpsc::Receiver<EngineRequest>>>) {
    tracing::debug!(worker = index, "engine worker started");
    loop {
        // Hold the queue lock only while waiting for the next request.
        let next = match rx.lock() {
            Ok(mut queue) => queue.blocking_recv(),
            Err(_) => None,
        };
        let Some(req) = next else { break };

        match req {
            EngineRequest::Detect { image, reply } => {
                if reply.is_closed() {
                    continue;
                }
                let result = models.extractor.detect(&image).map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Embed { image, face, reply } => {
                // Requester gave up (timeout or a sibling face failed).
                if reply.is_closed() {
                    tracing::trace!(worker = index, "skipping cancelled embed request");
                    continue;
                }
                let result = run_embed(&mut models, &image, &face);
                let _ = reply.send(result);
            }
        }
    }
    tracing::debug!(worker = index, "engine worker exiting");
}

fn run_embed(models: &mut FaceModels, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, EngineError> {
    let crop = imaging::crop(image, face)?;
    Ok(models.embedder.embed(&crop)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rollcall_core::{Embedder, FaceExtractor};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Returns the same boxes for every image.
    pub(crate) struct FixedFaces(pub Vec<BoundingBox>);

    impl FaceExtractor for FixedFaces {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    /// Embeds a crop as its mean colour scaled to [0, 1] after a delay drawn
    /// from `min_delay_ms..max_delay_ms`, and fails on crops whose mean red
    /// channel is exactly 13.
    pub(crate) struct MeanColor {
        pub min_delay_ms: u64,
        pub max_delay_ms: u64,
        pub calls: Arc<AtomicUsize>,
    }

    pub(crate) const POISON_RED: u8 = 13;

    impl Embedder for MeanColor {
        fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = if self.max_delay_ms > self.min_delay_ms {
                self.min_delay_ms + rand::random::<u64>() % (self.max_delay_ms - self.min_delay_ms)
            } else {
                self.min_delay_ms
            };
            if delay > 0 {
                std::thread::sleep(Duration::from_millis(delay));
            }

            let n = (face.width() * face.height()) as f32;
            let mut sum = [0.0f32; 3];
            for p in face.pixels() {
                for c in 0..3 {
                    sum[c] += p[c] as f32;
                }
            }
            let mean = sum.map(|s| s / n);
            if mean[0].round() as u8 == POISON_RED {
                return Err(EmbedderError::InferenceFailed("poisoned crop".into()));
            }
            Ok(Embedding::new(mean.iter().map(|m| m / 255.0).collect()))
        }
    }

    pub(crate) fn fake_models(faces: Vec<BoundingBox>, max_delay_ms: u64, calls: Arc<AtomicUsize>) -> FaceModels {
        FaceModels {
            extractor: Box::new(FixedFaces(faces)),
            embedder: Box::new(MeanColor { min_delay_ms: 0, max_delay_ms, calls }),
        }
    }

    /// Models whose every embedding takes exactly `delay_ms`.
    pub(crate) fn slow_models(faces: Vec<BoundingBox>, delay_ms: u64, calls: Arc<AtomicUsize>) -> FaceModels {
        FaceModels {
            extractor: Box::new(FixedFaces(faces)),
            embedder: Box::new(MeanColor { min_delay_ms: delay_ms, max_delay_ms: delay_ms, calls }),
        }
    }

    #[tokio::test]
    async fn test_detect_and_embed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let faces = vec![BoundingBox::new(0, 0, 10, 10)];
        let engine = spawn_engine(2, |_| Ok(fake_models(faces.clone(), 0, calls.clone()))).unwrap();
        assert_eq!(engine.workers(), 2);

        let image = Arc::new(RgbImage::from_pixel(20, 20, image::Rgb([255, 0, 0])));
        let found = engine.detect(image.clone()).await.unwrap();
        assert_eq!(found, faces);

        let embedding = engine.embed(image, found[0]).await.unwrap();
        assert_eq!(embedding.values, vec![1.0, 0.0, 0.0]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_embed_outside_image_is_crop_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = spawn_engine(1, |_| Ok(fake_models(vec![], 0, calls.clone()))).unwrap();
        let image = Arc::new(RgbImage::new(20, 20));
        let err = engine.embed(image, BoundingBox::new(50, 50, 5, 5)).await.unwrap_err();
        assert!(matches!(err, EngineError::Crop(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_abandoned_request_is_skipped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = spawn_engine(1, |_| Ok(slow_models(vec![], 100, calls.clone()))).unwrap();
        let image = Arc::new(RgbImage::from_pixel(20, 20, image::Rgb([0, 0, 255])));

        // Occupies the only worker.
        let busy = tokio::spawn({
            let engine = engine.clone();
            let image = image.clone();
            async move { engine.embed(image, BoundingBox::new(0, 0, 10, 10)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Queued behind it, then given up on before the worker reaches it.
        let queued = engine.embed(image, BoundingBox::new(5, 5, 10, 10));
        let gave_up = tokio::time::timeout(Duration::from_millis(20), queued).await;
        assert!(gave_up.is_err());

        busy.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_load_failure_is_fatal() {
        let result = spawn_engine(3, |i| {
            if i == 2 {
                Err(EngineError::Embedder(EmbedderError::ModelNotFound("w600k_r50.onnx".into())))
            } else {
                Ok(fake_models(vec![], 0, Arc::new(AtomicUsize::new(0))))
            }
        });
        assert!(matches!(result, Err(EngineError::Embedder(_))));
        assert!(matches!(spawn_engine(0, |_| unreachable!()), Err(EngineError::NoWorkers)));
    }

    #[tokio::test]
    async fn test_many_concurrent_requests_share_workers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = spawn_engine(3, |_| Ok(fake_models(vec![], 5, calls.clone()))).unwrap();
        let image = Arc::new(RgbImage::from_pixel(40, 40, image::Rgb([0, 255, 0])));

        let mut handles = Vec::new();
        for i in 0..30 {
            let engine = engine.clone();
            let image = image.clone();
            handles.push(tokio::spawn(async move {
                engine.embed(image, BoundingBox::new(i % 30, 0, 10, 10)).await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap().values, vec![0.0, 1.0, 0.0]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 30);
    }
}
