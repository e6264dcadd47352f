use crate::pipeline::ErrorClass;
use crate::service::{AttendanceService, ServiceError};
use crate::store::StoreError;
use chrono::NaiveDate;
use rollcall_core::{Identity, Scope};
use serde::Serialize;
use std::path::PathBuf;
use zbus::interface;

/// Static daemon facts reported by `Status()`.
#[derive(Debug, Clone)]
pub struct DaemonInfo {
    pub workers: usize,
    pub match_threshold: f32,
    pub max_image_dimension: u32,
    pub db_path: PathBuf,
    pub model_dir: PathBuf,
}

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.freedesktop.RollCall1
/// Object path: /org/freedesktop/RollCall1
pub struct RollCallService {
    service: AttendanceService,
    info: DaemonInfo,
}

impl RollCallService {
    pub fn new(service: AttendanceService, info: DaemonInfo) -> Self {
        Self { service, info }
    }
}

#[interface(name = "org.freedesktop.RollCall1")]
impl RollCallService {
    /// Register an identity in a scope from one or more portrait photos.
    async fn register(&self, scope: &str, identity: &str, photos: Vec<Vec<u8>>) -> zbus::fdo::Result<u32> {
        tracing::info!(scope, identity, photos = photos.len(), "register requested");
        let scope = parse_scope(scope)?;
        let identity = Identity::new(identity).map_err(|e| invalid(format!("identity: {e}")))?;
        if photos.is_empty() {
            return Err(invalid("at least one photo is required".into()));
        }

        let stored = self
            .service
            .pipeline()
            .register(&scope, &identity, photos)
            .await
            .map_err(|e| fdo_error(&ServiceError::Pipeline(e)))?;
        Ok(u32::try_from(stored).unwrap_or(u32::MAX))
    }

    /// Recognize a group photo and mark attendance for today.
    async fn mark_attendance(&self, scope: &str, photo: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(scope, bytes = photo.len(), "mark_attendance requested");
        let scope = parse_scope(scope)?;
        let report = self
            .service
            .mark_attendance(&scope, photo)
            .await
            .map_err(|e| fdo_error(&e))?;
        to_json(&report)
    }

    /// Attendance for one date (`YYYY-MM-DD`), or the full history when empty.
    async fn attendance(&self, scope: &str, date: &str) -> zbus::fdo::Result<String> {
        let scope = parse_scope(scope)?;
        let store = self.service.pipeline().store();
        if date.trim().is_empty() {
            let history = store.attendance_history(&scope).await.map_err(store_error)?;
            return to_json(&history);
        }

        let date: NaiveDate = date
            .trim()
            .parse()
            .map_err(|e| invalid(format!("date {date:?}: {e}")))?;
        let record = store.attendance(&scope, date).await.map_err(store_error)?;
        to_json(&record)
    }

    /// Registered identities in a scope with their embedding counts.
    async fn list_identities(&self, scope: &str) -> zbus::fdo::Result<String> {
        let scope = parse_scope(scope)?;
        let identities = self
            .service
            .pipeline()
            .store()
            .identities(&scope)
            .await
            .map_err(store_error)?;
        to_json(&identities)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "models_loaded": true,
            "workers": self.info.workers,
            "match_threshold": self.info.match_threshold,
            "max_image_dimension": self.info.max_image_dimension,
            "db_path": self.info.db_path,
            "model_dir": self.info.model_dir,
        })
        .to_string())
    }
}

fn parse_scope(raw: &str) -> zbus::fdo::Result<Scope> {
    raw.parse().map_err(|e| invalid(format!("scope {raw:?}: {e}")))
}

fn invalid(msg: String) -> zbus::fdo::Error {
    zbus::fdo::Error::InvalidArgs(msg)
}

fn store_error(e: StoreError) -> zbus::fdo::Error {
    fdo_error(&ServiceError::Store(e))
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("encoding reply: {e}")))
}

fn error_class(e: &ServiceError) -> ErrorClass {
    match e {
        ServiceError::Pipeline(p) => p.class(),
        ServiceError::Store(StoreError::DimensionMismatch { .. }) => ErrorClass::BadInput,
        _ => ErrorClass::RetryLater,
    }
}

fn fdo_error(e: &ServiceError) -> zbus::fdo::Error {
    match error_class(e) {
        ErrorClass::BadInput => {
            tracing::info!(error = %e, "request rejected");
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        ErrorClass::RetryLater => {
            tracing::warn!(error = %e, "request failed");
            zbus::fdo::Error::Failed(format!("{e} (temporary, retry later)"))
        }
    }
}
