use anyhow::{Context, Result};
use rollcall_core::{imaging, FaceModels};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod pipeline;
mod service;
mod store;

use config::Config;
use dbus_interface::{DaemonInfo, RollCallService};
use engine::EngineError;
use pipeline::{Pipeline, PipelineSettings};
use service::AttendanceService;
use store::EmbeddingStore;

const BUS_NAME: &str = "org.freedesktop.RollCall1";
const OBJECT_PATH: &str = "/org/freedesktop/RollCall1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db_path = %config.db_path.display(),
        workers = config.workers,
        threshold = config.match_threshold,
        "configuration loaded"
    );

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let store = EmbeddingStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening store {}", config.db_path.display()))?;

    let scrfd = config.scrfd_model_path();
    let arcface = config.arcface_model_path();
    let engine = engine::spawn_engine(config.workers, |_| {
        FaceModels::load_onnx(&scrfd, &arcface, 1).map_err(EngineError::from)
    })
    .context("starting inference engine")?;
    tracing::info!(workers = engine.workers(), "inference engine ready");

    let pipeline = Pipeline::new(
        engine,
        store,
        PipelineSettings {
            match_threshold: config.match_threshold,
            max_image_dimension: config.max_image_dimension,
            stage_timeout: config.stage_timeout,
        },
    );
    let mut service = AttendanceService::new(pipeline, config.annotated_dir.clone());
    if !config.label_font.as_os_str().is_empty() {
        match imaging::load_label_font(&config.label_font) {
            Ok(font) => service = service.with_label_font(font),
            Err(e) => tracing::warn!(error = %e, "annotated photos will carry boxes without labels"),
        }
    }
    let info = DaemonInfo {
        workers: config.workers,
        match_threshold: config.match_threshold,
        max_image_dimension: config.max_image_dimension,
        db_path: config.db_path.clone(),
        model_dir: config.model_dir.clone(),
    };

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RollCallService::new(service, info))?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME} on the D-Bus"))?;

    tracing::info!(bus = BUS_NAME, session = config.session_bus, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
