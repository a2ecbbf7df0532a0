use crate::config::Config;
use rollcall_core::detector::DetectorError;
use rollcall_core::registry::{RecordSummary, Registry, RegistryError};
use rollcall_core::vector_store::{self, IdentityRecord};
use rollcall_core::{
    codec, EnrollOutcome, EnrollRequest, FaceLocalizer, FacePipeline, OutcomeKind, PipelineError,
    Recognition, Region, Response,
};
use rollcall_store::SqliteRegistry;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Requests queued per worker before senders wait.
pub(crate) const QUEUE_DEPTH: usize = 8;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    pub fn to_response(&self) -> Response {
        match self {
            EngineError::Pipeline(err) => Response::from_error(err),
            EngineError::Registry(err) => {
                Response::with_outcome(OutcomeKind::PersistenceError, err.to_string())
            }
            EngineError::Detector(_) | EngineError::ChannelClosed => {
                Response::with_outcome(OutcomeKind::EngineUnavailable, self.to_string())
            }
        }
    }
}

/// Faces found in a photo, without touching the registry.
#[derive(Debug, Clone, Serialize)]
pub struct DetectReport {
    pub width: u32,
    pub height: u32,
    pub faces: Vec<Region>,
    /// The face enrollment and recognition would use.
    pub primary: Option<Region>,
}

/// Messages sent from callers to a worker thread.
enum EngineRequest {
    Enroll {
        request: EnrollRequest,
        reply: oneshot::Sender<Result<EnrollOutcome, EngineError>>,
    },
    Recognize {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Recognition, EngineError>>,
    },
    Detect {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<DetectReport, EngineError>>,
    },
    Show {
        code: String,
        reply: oneshot::Sender<Result<Option<IdentityRecord>, EngineError>>,
    },
    List {
        reply: oneshot::Sender<Result<Vec<RecordSummary>, EngineError>>,
    },
    Remove {
        code: String,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
}

/// Clone-safe handle to the worker pool. Requests are spread round-robin.
#[derive(Clone)]
pub struct EngineHandle {
    workers: Arc<Vec<mpsc::Sender<EngineRequest>>>,
    next: Arc<AtomicUsize>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.workers[idx]
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Requests the pool can hold queued at once.
    pub fn capacity(&self) -> usize {
        self.workers.len() * QUEUE_DEPTH
    }

    /// Create or update an identity, optionally with a new photo.
    pub async fn enroll(&self, request: EnrollRequest) -> Result<EnrollOutcome, EngineError> {
        self.call(|reply| EngineRequest::Enroll { request, reply }).await
    }

    /// Identify the person in `image` against every enrolled identity.
    pub async fn recognize(&self, image: Vec<u8>) -> Result<Recognition, EngineError> {
        self.call(|reply| EngineRequest::Recognize { image, reply }).await
    }

    pub async fn detect(&self, image: Vec<u8>) -> Result<DetectReport, EngineError> {
        self.call(|reply| EngineRequest::Detect { image, reply }).await
    }

    pub async fn show(&self, code: String) -> Result<Option<IdentityRecord>, EngineError> {
        self.call(|reply| EngineRequest::Show { code, reply }).await
    }

    pub async fn list(&self) -> Result<Vec<RecordSummary>, EngineError> {
        self.call(|reply| EngineRequest::List { reply }).await
    }

    pub async fn remove(&self, code: String) -> Result<usize, EngineError> {
        self.call(|reply| EngineRequest::Remove { code, reply }).await
    }
}

/// Spawn the worker pool on dedicated OS threads.
///
/// Loads the cascade once and opens one registry connection per worker
/// before any thread starts, so a bad model or database fails fast.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let localizer =
        FaceLocalizer::load(config.detector, &config.cascade_path, config.detection_params())?;
    let pipeline = FacePipeline::new(localizer, config.pipeline_settings());
    tracing::info!(
        detector = %config.detector,
        threshold = config.distance_threshold,
        policy = ?config.face_policy,
        workers = config.workers,
        "pipeline ready"
    );

    let registries = (0..config.workers.max(1))
        .map(|_| SqliteRegistry::open(&config.db_path))
        .collect::<Result<Vec<_>, _>>()?;

    let workers = registries
        .into_iter()
        .enumerate()
        .map(|(idx, registry)| {
            let (tx, rx) = mpsc::channel::<EngineRequest>(QUEUE_DEPTH);
            let pipeline = pipeline.clone();
            std::thread::Builder::new()
                .name(format!("rollcall-worker-{idx}"))
                .spawn(move || run_worker(idx, pipeline, registry, rx))
                .expect("failed to spawn engine thread");
            tx
        })
        .collect();

    Ok(EngineHandle {
        workers: Arc::new(workers),
        next: Arc::new(AtomicUsize::new(0)),
    })
}

fn run_worker(
    idx: usize,
    pipeline: FacePipeline,
    mut registry: SqliteRegistry,
    mut rx: mpsc::Receiver<EngineRequest>,
) {
    tracing::info!(worker = idx, "engine thread started");
    while let Some(req) = rx.blocking_recv() {
        match req {
            EngineRequest::Enroll { request, reply } => {
                let result = pipeline.enroll(&mut registry, request).map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Recognize { image, reply } => {
                let result = pipeline.recognize(&registry, &image).map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Detect { image, reply } => {
                let _ = reply.send(run_detect(&pipeline, &image));
            }
            EngineRequest::Show { code, reply } => {
                let result = vector_store::read_identity(&registry, &code).map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::List { reply } => {
                let _ = reply.send(registry.list().map_err(EngineError::from));
            }
            EngineRequest::Remove { code, reply } => {
                let _ = reply.send(registry.delete(&code).map_err(EngineError::from));
            }
        }
    }
    tracing::info!(worker = idx, "engine thread exiting");
}

fn run_detect(pipeline: &FacePipeline, bytes: &[u8]) -> Result<DetectReport, EngineError> {
    let image = codec::decode(bytes).map_err(PipelineError::from)?;
    let faces = pipeline.localizer().detect(&image).map_err(PipelineError::from)?;
    Ok(DetectReport {
        width: image.width(),
        height: image.height(),
        primary: rollcall_core::detector::largest(&faces),
        faces,
    })
}
