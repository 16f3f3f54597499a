use crate::api::{ApiError, ApiVerdict, EnrollmentApi, RestEnrollmentApi};
use crate::config::{CameraBackend, Config};
use faceid_core::orchestrator::PoseSummary;
use faceid_core::{
    cancel_channel, CameraConstraints, CameraDriver, CameraError, CameraSession, CancelHandle,
    CancelSignal, CapabilityLoader, CaptureError, CaptureOutcome, CaptureProgress,
    GuidedCaptureOrchestrator, ModelLifecycleService, OnnxLoader, RankedCandidate,
};
use faceid_hw::{StillsDriver, V4lDriver};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error("backend error: {0}")]
    Api(#[from] ApiError),
    #[error("failed to start engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of an enrollment: what was captured and what the backend said.
#[derive(Debug, Serialize)]
pub struct EnrollResult {
    pub session_id: Uuid,
    pub accepted: usize,
    pub attempts: usize,
    pub per_pose: Vec<PoseSummary>,
    pub verdict: ApiVerdict,
}

/// Result of a login attempt.
#[derive(Debug, Serialize)]
pub struct VerifyResult {
    pub verdict: ApiVerdict,
    /// Frontal samples accepted during capture.
    pub captured: usize,
    /// Candidates sent to the backend.
    pub submitted: usize,
    /// Distance of the closest candidate to the consensus embedding.
    pub best_distance: Option<f32>,
}

/// Point-in-time view of the engine, returned by `Status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatus {
    pub busy: bool,
    pub models_loaded: bool,
    pub camera_active: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub engine: EngineStatus,
    pub progress: CaptureProgress,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        identity: String,
        reply: oneshot::Sender<Result<EnrollResult, EngineError>>,
    },
    Verify {
        reply: oneshot::Sender<Result<VerifyResult, EngineError>>,
    },
}

/// State the engine thread shares with handle holders.
#[derive(Default)]
struct Shared {
    cancel: Mutex<Option<CancelHandle>>,
    status: Mutex<EngineStatus>,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    shared: Arc<Shared>,
    progress: watch::Receiver<CaptureProgress>,
}

impl EngineHandle {
    /// Run a guided capture and submit the aggregate for `identity`.
    pub async fn enroll(&self, identity: String) -> Result<EnrollResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                identity,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Capture frontal samples and submit ranked candidates for login.
    pub async fn verify(&self) -> Result<VerifyResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Verify { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Cancel the capture in progress. Returns false when nothing was running.
    pub fn cancel(&self) -> bool {
        let slot = self
            .shared
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(handle) => {
                handle.cancel();
                tracing::info!("capture cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> StatusReport {
        let engine = self
            .shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        StatusReport {
            engine,
            progress: self.progress.borrow().clone(),
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread drives its own single-threaded runtime, so captures run
/// cooperatively and never overlap. Models load in the background on
/// startup; a failed load is retried on the next request.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let api = RestEnrollmentApi::new(config.api.clone())?;
    let loader = OnnxLoader::from_model_dir(&config.model_dir);

    tracing::info!(
        backend = ?config.camera_backend,
        device = %config.camera.device,
        model_dir = %config.model_dir.display(),
        "starting engine"
    );

    match config.camera_backend {
        CameraBackend::V4l2 => start(Engine::new(V4lDriver, loader, api, config)?),
        CameraBackend::Stills => start(Engine::new(StillsDriver, loader, api, config)?),
    }
}

fn start<D, L, A>(engine: Engine<D, L, A>) -> Result<EngineHandle, EngineError>
where
    D: CameraDriver + Send + 'static,
    D::Device: Send,
    L: CapabilityLoader + Send + 'static,
    A: EnrollmentApi + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<EngineRequest>(4);
    let handle = EngineHandle {
        tx,
        shared: Arc::clone(&engine.shared),
        progress: engine.orchestrator.subscribe(),
    };

    std::thread::Builder::new()
        .name("faceid-engine".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(error = %e, "failed to build engine runtime");
                    return;
                }
            };
            tracing::info!("engine thread started");
            runtime.block_on(engine.run(rx));
            tracing::info!("engine thread exiting");
        })?;

    Ok(handle)
}

struct Engine<D: CameraDriver, L, A> {
    camera: CameraSession<D>,
    constraints: CameraConstraints,
    models: ModelLifecycleService<L>,
    orchestrator: GuidedCaptureOrchestrator,
    api: A,
    login_attempts: usize,
    match_threshold: f32,
    retry_window: Duration,
    shared: Arc<Shared>,
}

impl<D: CameraDriver, L: CapabilityLoader, A: EnrollmentApi> Engine<D, L, A> {
    fn new(driver: D, loader: L, api: A, config: &Config) -> Result<Self, EngineError> {
        Ok(Self {
            camera: CameraSession::new(driver),
            constraints: config.camera.clone(),
            models: ModelLifecycleService::new(loader, config.model_load_timeout),
            orchestrator: GuidedCaptureOrchestrator::new(config.capture.clone())?,
            api,
            login_attempts: config.login_attempts.max(1),
            match_threshold: config.match_threshold,
            retry_window: config.retry_window,
            shared: Arc::new(Shared::default()),
        })
    }

    async fn run(mut self, mut rx: mpsc::Receiver<EngineRequest>) {
        if let Err(e) = self.models.ensure_loaded().await {
            tracing::warn!(error = %e, "model preload failed; will retry on first request");
        }
        self.record(None);

        loop {
            // A camera kept after an unusable capture is held only for a bounded retry window.
            let request = if self.camera.is_active() {
                match tokio::time::timeout(self.retry_window, rx.recv()).await {
                    Ok(request) => request,
                    Err(_) => {
                        tracing::info!("retry window elapsed; releasing camera");
                        self.camera.release();
                        self.record(None);
                        continue;
                    }
                }
            } else {
                rx.recv().await
            };

            let Some(request) = request else { break };
            match request {
                EngineRequest::Enroll { identity, reply } => {
                    let mut cancel = self.begin();
                    let result = self.enroll(&identity, &mut cancel).await;
                    self.record(result.as_ref().err());
                    let _ = reply.send(result);
                }
                EngineRequest::Verify { reply } => {
                    let mut cancel = self.begin();
                    let result = self.verify(&mut cancel).await;
                    self.record(result.as_ref().err());
                    let _ = reply.send(result);
                }
            }
        }

        self.camera.release();
    }

    async fn enroll(
        &mut self,
        identity: &str,
        cancel: &mut CancelSignal,
    ) -> Result<EnrollResult, EngineError> {
        self.acquire()?;
        let outcome: CaptureOutcome = self
            .orchestrator
            .run(&mut self.camera, &self.models, cancel)
            .await?;

        tracing::info!(
            identity,
            session = %outcome.session_id,
            accepted = outcome.accepted,
            attempts = outcome.attempts,
            "enrollment captured"
        );

        let verdict = self.api.enroll(identity, &outcome).await?;
        Ok(EnrollResult {
            session_id: outcome.session_id,
            accepted: outcome.accepted,
            attempts: outcome.attempts,
            per_pose: outcome.per_pose,
            verdict,
        })
    }

    async fn verify(&mut self, cancel: &mut CancelSignal) -> Result<VerifyResult, EngineError> {
        self.acquire()?;
        let ranked = self
            .orchestrator
            .run_login(&mut self.camera, &self.models, cancel, self.login_attempts)
            .await?;

        let submitted = select_candidates(&ranked, self.match_threshold);
        tracing::info!(
            captured = ranked.len(),
            submitted = submitted.len(),
            best_distance = ranked.first().map(|c| c.distance),
            "login candidates ranked"
        );

        let verdict = self.api.login(&submitted).await?;
        Ok(VerifyResult {
            verdict,
            captured: ranked.len(),
            submitted: submitted.len(),
            best_distance: ranked.first().map(|c| c.distance),
        })
    }

    fn acquire(&mut self) -> Result<(), CameraError> {
        if !self.camera.is_active() {
            self.camera.acquire(&self.constraints)?;
        }
        Ok(())
    }

    /// Install a fresh cancellation channel and mark the engine busy.
    fn begin(&self) -> CancelSignal {
        let (handle, signal) = cancel_channel();
        *self
            .shared
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        self.shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .busy = true;
        signal
    }

    fn record(&self, error: Option<&EngineError>) {
        self.shared
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut status = self
            .shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        status.busy = false;
        status.models_loaded = self.models.is_loaded();
        status.camera_active = self.camera.is_active();
        if let Some(e) = error {
            tracing::warn!(error = %e, "request failed");
            status.last_error = match e {
                EngineError::Capture(CaptureError::Cancelled) => None,
                other => Some(other.to_string()),
            };
        }
    }
}

/// Candidates within `threshold` of the consensus, closest first.
/// Falls back to the single closest candidate when none qualify.
fn select_candidates(ranked: &[RankedCandidate], threshold: f32) -> Vec<RankedCandidate> {
    let close: Vec<RankedCandidate> = ranked
        .iter()
        .filter(|c| c.distance < threshold)
        .cloned()
        .collect();
    if close.is_empty() {
        ranked.first().cloned().into_iter().collect()
    } else {
        close
    }
}
