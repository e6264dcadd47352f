//! Attendance marking on top of the recognition pipeline.
//!
//! Nothing is written until the pipeline has fully succeeded: the annotated
//! photo is written to a temporary file and renamed into place, then the
//! recognized identities are recorded in the attendance ledger.

use crate::pipeline::{Pipeline, PipelineError, Processed, RecognitionOutcome};
use crate::store::StoreError;
use chrono::{Local, NaiveDate};
use image::{ImageFormat, RgbImage};
use rollcall_core::imaging;
use rollcall_core::{BoundingBox, FaceMark, FontArc, Identity, Scope};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("writing annotated image {path}: {source}")]
    Annotate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("annotation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkStatus {
    Recognized,
    NoFacesDetected,
    NoReferenceData,
}

#[derive(Debug, Clone, Serialize)]
pub struct FaceReport {
    #[serde(rename = "box")]
    pub face: BoundingBox,
    pub identity: String,
    pub distance: Option<f32>,
}

/// Outcome of one attendance-marking request.
#[derive(Debug, Clone, Serialize)]
pub struct MarkReport {
    pub status: MarkStatus,
    pub date: NaiveDate,
    pub faces: Vec<FaceReport>,
    /// Distinct recognized identities, in detection order.
    pub present: Vec<String>,
    pub annotated_image: Option<PathBuf>,
}

#[derive(Clone)]
pub struct AttendanceService {
    pipeline: Pipeline,
    annotated_dir: PathBuf,
    label_font: Option<FontArc>,
}

impl AttendanceService {
    pub fn new(pipeline: Pipeline, annotated_dir: PathBuf) -> Self {
        Self { pipeline, annotated_dir, label_font: None }
    }

    /// Write each face's identity next to its box on annotated photos.
    pub fn with_label_font(mut self, font: FontArc) -> Self {
        self.label_font = Some(font);
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Recognize the faces in a group photo and mark attendance for today.
    pub async fn mark_attendance(&self, scope: &Scope, photo: Vec<u8>) -> Result<MarkReport, ServiceError> {
        self.mark_attendance_on(scope, photo, Local::now().date_naive()).await
    }

    pub async fn mark_attendance_on(
        &self,
        scope: &Scope,
        photo: Vec<u8>,
        date: NaiveDate,
    ) -> Result<MarkReport, ServiceError> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("mark_attendance", %request_id, scope = %scope);
        self.mark(scope, photo, date, request_id).instrument(span).await
    }

    async fn mark(
        &self,
        scope: &Scope,
        photo: Vec<u8>,
        date: NaiveDate,
        request_id: Uuid,
    ) -> Result<MarkReport, ServiceError> {
        let Processed { image, outcome } = self.pipeline.process(photo, scope).await?;

        let recognized = match outcome {
            RecognitionOutcome::NoFacesDetected => {
                return Ok(MarkReport::empty(MarkStatus::NoFacesDetected, date, Vec::new()));
            }
            RecognitionOutcome::NoReferenceData { faces } => {
                let faces = faces
                    .into_iter()
                    .map(|face| FaceReport { face, identity: rollcall_core::UNKNOWN_LABEL.into(), distance: None })
                    .collect();
                return Ok(MarkReport::empty(MarkStatus::NoReferenceData, date, faces));
            }
            RecognitionOutcome::Recognized(recognized) => recognized,
        };

        let mut present: Vec<Identity> = Vec::new();
        for r in &recognized {
            if let Some(identity) = r.recognition.identity() {
                if !present.contains(identity) {
                    present.push(identity.clone());
                }
            }
        }

        let marks: Vec<FaceMark> = recognized
            .iter()
            .map(|r| FaceMark {
                face: r.face,
                known: r.recognition.is_known(),
                label: r.recognition.label().to_string(),
            })
            .collect();
        let path = self.annotated_path(scope, date, request_id);
        let image = Arc::try_unwrap(image).unwrap_or_else(|shared| (*shared).clone());
        let annotated = write_annotated(image, marks, self.label_font.clone(), path).await?;

        self.pipeline.store().record_attendance(scope, date, &present).await?;

        tracing::info!(
            faces = recognized.len(),
            present = present.len(),
            path = %annotated.display(),
            "attendance marked"
        );

        Ok(MarkReport {
            status: MarkStatus::Recognized,
            date,
            faces: recognized
                .into_iter()
                .map(|r| FaceReport {
                    face: r.face,
                    identity: r.recognition.label().to_string(),
                    distance: r.recognition.distance(),
                })
                .collect(),
            present: present.into_iter().map(String::from).collect(),
            annotated_image: Some(annotated),
        })
    }

    fn annotated_path(&self, scope: &Scope, date: NaiveDate, request_id: Uuid) -> PathBuf {
        let mut dir = self.annotated_dir.clone();
        for segment in scope.segments() {
            dir.push(sanitize(segment));
        }
        dir.join(format!("{date}-{request_id}.png"))
    }
}

impl MarkReport {
    fn empty(status: MarkStatus, date: NaiveDate, faces: Vec<FaceReport>) -> Self {
        Self { status, date, faces, present: Vec::new(), annotated_image: None }
    }
}

/// Keep path segments to a conservative character set.
fn sanitize(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        "_".into()
    } else {
        cleaned
    }
}

/// Draw the face boxes and write the PNG via temp file + rename.
async fn write_annotated(
    mut image: RgbImage,
    marks: Vec<FaceMark>,
    font: Option<FontArc>,
    path: PathBuf,
) -> Result<PathBuf, ServiceError> {
    tokio::task::spawn_blocking(move || {
        imaging::annotate(&mut image, &marks, font.as_ref());
        let io_err = |source| ServiceError::Annotate { path: path.clone(), source };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = path.with_extension("png.tmp");
        image
            .save_with_format(&tmp, ImageFormat::Png)
            .map_err(|e| io_err(std::io::Error::other(e)))?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(e));
        }
        Ok(path)
    })
    .await?
}
