//! Guided multi-pose capture.
//!
//! The orchestrator walks `Idle → Center → Left → Right → Up → Down →
//! Complete`, taking a fixed number of sampling attempts per pose. Attempts
//! run strictly one after another; cancellation is checked before every
//! attempt and raced against every delay.

use crate::aggregator::{aggregate, normalize, AggregateError};
use crate::camera::{CameraDriver, CameraError, ReleaseGuard, CameraSession};
use crate::matcher::{rank_by_distance, MatchError, RankedCandidate};
use crate::model::{CapabilityError, CapabilityHandle, CapabilityLoader, ModelLifecycleService, ModelLoadError};
use crate::sampler::{FaceSampler, SampleError};
use crate::types::{CaptureSample, FaceEmbedding, PoseTag};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("camera has not been acquired")]
    CameraNotAcquired,
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("model error: {0}")]
    ModelLoad(#[from] ModelLoadError),
    #[error("capability error: {0}")]
    Capability(#[from] CapabilityError),
    #[error("no usable face captures; please try again")]
    NoUsableCaptures,
    #[error("capture cancelled")]
    Cancelled,
    #[error("aggregation failed: {0}")]
    Aggregate(#[from] AggregateError),
    #[error("ranking failed: {0}")]
    Match(#[from] MatchError),
    #[error("invalid capture settings: {0}")]
    InvalidSettings(String),
}

/// Timing and acceptance parameters for guided capture.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Sampling attempts per pose (K). Must be at least 2.
    pub attempts_per_pose: usize,
    /// Wait after entering a pose before the first attempt.
    pub settle_delay: Duration,
    /// Wait between consecutive attempts within a pose.
    pub attempt_interval: Duration,
    /// Minimum detector confidence for an accepted sample.
    pub min_confidence: f32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            attempts_per_pose: 2,
            settle_delay: Duration::from_millis(1500),
            attempt_interval: Duration::from_millis(300),
            min_confidence: 0.5,
        }
    }
}

impl CaptureSettings {
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.attempts_per_pose < 2 {
            return Err(CaptureError::InvalidSettings(format!(
                "attempts_per_pose must be >= 2, got {}",
                self.attempts_per_pose
            )));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(CaptureError::InvalidSettings(format!(
                "min_confidence must be within [0, 1], got {}",
                self.min_confidence
            )));
        }
        Ok(())
    }

    fn total_attempts(&self) -> usize {
        PoseTag::ALL.len() * self.attempts_per_pose
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "pose")]
pub enum CaptureState {
    Idle,
    Capturing(PoseTag),
    Complete,
}

/// Snapshot published after every attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureProgress {
    pub state: CaptureState,
    /// attempts_done / attempts_total × 100.
    pub percent: f32,
    pub attempts_done: usize,
    pub attempts_total: usize,
    pub accepted: usize,
}

impl CaptureProgress {
    fn idle() -> Self {
        Self {
            state: CaptureState::Idle,
            percent: 0.0,
            attempts_done: 0,
            attempts_total: 0,
            accepted: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoseSummary {
    pub pose: PoseTag,
    pub accepted: usize,
}

/// Result of a completed guided capture.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub session_id: Uuid,
    /// Unit-norm aggregate of all accepted samples.
    pub embedding: FaceEmbedding,
    pub accepted: usize,
    pub attempts: usize,
    pub per_pose: Vec<PoseSummary>,
}

/// Requests cancellation of the capture holding the paired [`CancelSignal`].
#[derive(Clone, Debug)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Observed by the orchestrator between attempts and during delays.
#[derive(Debug)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the
    /// handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn cancel_channel() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(Arc::new(tx)), CancelSignal(rx))
}

/// Ephemeral per-attempt state. Never persisted.
struct EnrollmentSession {
    id: Uuid,
    accepted: Vec<CaptureSample>,
    attempts_done: usize,
    attempts_total: usize,
}

impl EnrollmentSession {
    fn new(attempts_total: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            accepted: Vec::new(),
            attempts_done: 0,
            attempts_total,
        }
    }

    fn percent(&self) -> f32 {
        if self.attempts_total == 0 {
            return 0.0;
        }
        self.attempts_done as f32 / self.attempts_total as f32 * 100.0
    }
}

pub struct GuidedCaptureOrchestrator {
    settings: CaptureSettings,
    sampler: FaceSampler,
    state: CaptureState,
    progress: watch::Sender<CaptureProgress>,
    current_error: Option<String>,
}

impl GuidedCaptureOrchestrator {
    pub fn new(settings: CaptureSettings) -> Result<Self, CaptureError> {
        settings.validate()?;
        let (progress, _) = watch::channel(CaptureProgress::idle());
        Ok(Self {
            settings,
            sampler: FaceSampler,
            state: CaptureState::Idle,
            progress,
            current_error: None,
        })
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Message of the last failed session, cleared when a new one starts.
    pub fn current_error(&self) -> Option<&str> {
        self.current_error.as_deref()
    }

    pub fn subscribe(&self) -> watch::Receiver<CaptureProgress> {
        self.progress.subscribe()
    }

    /// Run the full pose sequence and aggregate the accepted samples.
    ///
    /// The camera in `camera` must already be acquired. It is released on
    /// every outcome except `NoUsableCaptures`, which keeps it so the
    /// caller can retry without re-acquiring.
    pub async fn run<D: CameraDriver, L: CapabilityLoader>(
        &mut self,
        camera: &mut CameraSession<D>,
        models: &ModelLifecycleService<L>,
        cancel: &mut CancelSignal,
    ) -> Result<CaptureOutcome, CaptureError> {
        self.current_error = None;
        let result = self.run_enrollment(camera, models, cancel).await;
        self.finish(result.as_ref().err());
        result
    }

    /// Take `attempts` frontal samples and rank them by distance to their
    /// consensus embedding, closest first.
    pub async fn run_login<D: CameraDriver, L: CapabilityLoader>(
        &mut self,
        camera: &mut CameraSession<D>,
        models: &ModelLifecycleService<L>,
        cancel: &mut CancelSignal,
        attempts: usize,
    ) -> Result<Vec<RankedCandidate>, CaptureError> {
        self.current_error = None;
        let result = self.collect_login(camera, models, cancel, attempts).await;
        self.finish(result.as_ref().err());
        result
    }

    async fn run_enrollment<D: CameraDriver, L: CapabilityLoader>(
        &mut self,
        camera: &mut CameraSession<D>,
        models: &ModelLifecycleService<L>,
        cancel: &mut CancelSignal,
    ) -> Result<CaptureOutcome, CaptureError> {
        let mut guard = camera.guard();
        let capability = enter(&mut guard, models, cancel).await?;

        let mut session = EnrollmentSession::new(self.settings.total_attempts());
        tracing::info!(session = %session.id, attempts = session.attempts_total, "guided capture started");
        self.publish(&session);

        let k = self.settings.attempts_per_pose;
        for pose in PoseTag::ALL {
            self.capture_pose(&mut guard, &capability, pose, k, &mut session, cancel)
                .await?;
        }

        if session.accepted.is_empty() {
            tracing::warn!(session = %session.id, "no usable captures across all poses");
            guard.keep();
            return Err(CaptureError::NoUsableCaptures);
        }

        let embedding = aggregate(&session.accepted)?;
        let per_pose = PoseTag::ALL
            .iter()
            .map(|&pose| PoseSummary {
                pose,
                accepted: session.accepted.iter().filter(|s| s.pose() == pose).count(),
            })
            .collect();

        self.state = CaptureState::Complete;
        self.publish(&session);
        tracing::info!(
            session = %session.id,
            accepted = session.accepted.len(),
            attempts = session.attempts_done,
            "guided capture complete"
        );

        Ok(CaptureOutcome {
            session_id: session.id,
            embedding,
            accepted: session.accepted.len(),
            attempts: session.attempts_done,
            per_pose,
        })
    }

    async fn collect_login<D: CameraDriver, L: CapabilityLoader>(
        &mut self,
        camera: &mut CameraSession<D>,
        models: &ModelLifecycleService<L>,
        cancel: &mut CancelSignal,
        attempts: usize,
    ) -> Result<Vec<RankedCandidate>, CaptureError> {
        if attempts == 0 {
            return Err(CaptureError::InvalidSettings(
                "login attempts must be >= 1".to_string(),
            ));
        }

        let mut guard = camera.guard();
        let capability = enter(&mut guard, models, cancel).await?;

        let mut session = EnrollmentSession::new(attempts);
        tracing::info!(session = %session.id, attempts, "login capture started");
        self.publish(&session);

        self.capture_pose(&mut guard, &capability, PoseTag::Center, attempts, &mut session, cancel)
            .await?;

        if session.accepted.is_empty() {
            tracing::warn!(session = %session.id, "no usable login captures");
            guard.keep();
            return Err(CaptureError::NoUsableCaptures);
        }

        let consensus = aggregate(&session.accepted)?;
        let candidates: Vec<FaceEmbedding> = session
            .accepted
            .iter()
            .map(|s| normalize(s.embedding()))
            .collect();
        let ranked = rank_by_distance(&consensus, &candidates)?;

        self.state = CaptureState::Complete;
        self.publish(&session);
        tracing::info!(
            session = %session.id,
            candidates = ranked.len(),
            best_distance = ranked.first().map(|c| c.distance),
            "login capture complete"
        );

        Ok(ranked)
    }

    async fn capture_pose<D: CameraDriver>(
        &mut self,
        guard: &mut ReleaseGuard<'_, D>,
        capability: &CapabilityHandle,
        pose: PoseTag,
        attempts: usize,
        session: &mut EnrollmentSession,
        cancel: &mut CancelSignal,
    ) -> Result<(), CaptureError> {
        self.state = CaptureState::Capturing(pose);
        self.publish(session);
        tracing::info!(session = %session.id, ?pose, instruction = pose.instruction(), "pose started");

        pause(self.settings.settle_delay, cancel).await?;

        let mut accepted_here = 0usize;
        for attempt in 0..attempts {
            if attempt > 0 {
                pause(self.settings.attempt_interval, cancel).await?;
            }
            if cancel.is_cancelled() {
                return Err(CaptureError::Cancelled);
            }

            let handle = guard.handle_mut().ok_or(CaptureError::CameraNotAcquired)?;
            match self
                .sampler
                .sample(handle, capability, self.settings.min_confidence, pose)
                .await
            {
                Ok(sample) => {
                    accepted_here += 1;
                    session.accepted.push(sample);
                }
                Err(SampleError::Camera(e)) => return Err(e.into()),
                Err(SampleError::Capability(e)) => return Err(e.into()),
                Err(e) => {
                    tracing::debug!(?pose, attempt, error = %e, "attempt skipped");
                }
            }

            session.attempts_done += 1;
            self.publish(session);
        }

        tracing::info!(?pose, accepted = accepted_here, attempts, "pose finished");
        Ok(())
    }

    fn publish(&self, session: &EnrollmentSession) {
        self.progress.send_replace(CaptureProgress {
            state: self.state,
            percent: session.percent(),
            attempts_done: session.attempts_done,
            attempts_total: session.attempts_total,
            accepted: session.accepted.len(),
        });
    }

    fn finish(&mut self, error: Option<&CaptureError>) {
        let Some(error) = error else {
            return;
        };

        self.state = CaptureState::Idle;
        match error {
            CaptureError::Cancelled => tracing::info!("capture cancelled"),
            other => {
                tracing::warn!(error = %other, "capture failed");
                self.current_error = Some(other.to_string());
            }
        }

        self.progress.send_modify(|p| p.state = CaptureState::Idle);
    }
}

/// Verify the camera is held and the capability is loaded. A cancel
/// arriving mid-load abandons the wait; the load itself resets for the
/// next caller.
async fn enter<D: CameraDriver, L: CapabilityLoader>(
    guard: &mut ReleaseGuard<'_, D>,
    models: &ModelLifecycleService<L>,
    cancel: &mut CancelSignal,
) -> Result<CapabilityHandle, CaptureError> {
    if guard.handle_mut().is_none() {
        return Err(CaptureError::CameraNotAcquired);
    }
    if cancel.is_cancelled() {
        return Err(CaptureError::Cancelled);
    }
    tokio::select! {
        loaded = models.ensure_loaded() => Ok(loaded?),
        _ = cancel.cancelled() => Err(CaptureError::Cancelled),
    }
}

async fn pause(delay: Duration, cancel: &mut CancelSignal) -> Result<(), CaptureError> {
    if cancel.is_cancelled() {
        return Err(CaptureError::Cancelled);
    }
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(CaptureError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_reject_single_attempt() {
        let settings = CaptureSettings {
            attempts_per_pose: 1,
            ..CaptureSettings::default()
        };
        assert!(matches!(
            GuidedCaptureOrchestrator::new(settings),
            Err(CaptureError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_settings_reject_confidence_out_of_range() {
        let settings = CaptureSettings {
            min_confidence: 1.5,
            ..CaptureSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_progress_percent() {
        let mut session = EnrollmentSession::new(10);
        assert_eq!(session.percent(), 0.0);
        session.attempts_done = 7;
        assert!((session.percent() - 70.0).abs() < 1e-4);
        session.attempts_done = 10;
        assert_eq!(session.percent(), 100.0);
    }

    #[tokio::test]
    async fn test_cancel_signal() {
        let (handle, mut signal) = cancel_channel();
        assert!(!signal.is_cancelled());
        handle.cancel();
        assert!(signal.is_cancelled());
        signal.cancelled().await;
        assert_eq!(
            pause(Duration::from_secs(60), &mut signal).await,
            Err(CaptureError::Cancelled)
        );
    }

    #[test]
    fn test_capture_state_serializes_with_pose() {
        let json = serde_json::to_string(&CaptureState::Capturing(PoseTag::Left)).unwrap();
        assert_eq!(json, r#"{"state":"capturing","pose":"left"}"#);
        let idle = serde_json::to_string(&CaptureState::Idle).unwrap();
        assert_eq!(idle, r#"{"state":"idle"}"#);
    }
}
