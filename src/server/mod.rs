//! HTTP API for driving batch jobs and the chunked pipeline.
//!
//! Provides:
//! - CSV upload and single-batch submit/status/cancel/delete
//! - Result download, image extraction and dated zip archives
//! - Pipeline control (init/start/pause/resume/stop) and progress
//! - Recent structured log entries

mod handlers;
mod routes;

pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::config::Settings;
use crate::gemini::{BatchJobService, GeminiBatchClient};
use crate::logging::{MemorySink, PipelineLogger, TracingSink};
use crate::models::Item;
use crate::pipeline::{ImagePayloadAssembler, PayloadAssembler, PipelineController};
use crate::results::ResultStore;

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub service: Arc<dyn BatchJobService>,
    pub assembler: Arc<dyn PayloadAssembler>,
    pub results: Arc<ResultStore>,
    pub logger: PipelineLogger,
    /// Backs `GET /api/logs`.
    pub log_sink: Arc<MemorySink>,
    /// Current pipeline, if one has been initialized.
    pub pipeline: Arc<Mutex<Option<PipelineController>>>,
    /// Items from the most recent upload.
    pub items: Arc<RwLock<Vec<Item>>>,
}

impl AppState {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        let log_sink = Arc::new(MemorySink::new(settings.log_capacity));
        let logger = PipelineLogger::new(vec![Arc::new(TracingSink), log_sink.clone()]);

        let service = Arc::new(GeminiBatchClient::new(settings.client_config())?);
        let assembler = Arc::new(ImagePayloadAssembler::new(
            settings.assembler_options(),
            logger.clone(),
        )?);

        Ok(Self::with_services(
            settings.clone(),
            service,
            assembler,
            logger,
            log_sink,
        ))
    }

    /// Build state around caller-provided services.
    pub fn with_services(
        settings: Settings,
        service: Arc<dyn BatchJobService>,
        assembler: Arc<dyn PayloadAssembler>,
        logger: PipelineLogger,
        log_sink: Arc<MemorySink>,
    ) -> Self {
        let results = Arc::new(ResultStore::new(settings.output_dir.clone(), logger.clone()));
        Self {
            settings: Arc::new(settings),
            service,
            assembler,
            results,
            logger,
            log_sink,
            pipeline: Arc::new(Mutex::new(None)),
            items: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

/// Start the web server.
pub async fn serve(settings: &Settings, host: &str, port: u16) -> anyhow::Result<()> {
    settings.ensure_directories()?;
    let state = AppState::new(settings)?;
    let pipeline = state.pipeline.clone();
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Some(controller) = pipeline.lock().await.take() {
        tracing::info!("Stopping pipeline before exit");
        let _ = controller.stop().await;
    }

    Ok(())
}
