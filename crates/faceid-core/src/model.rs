//! Embedding capability loading with single-flight semantics.
//!
//! `ModelLifecycleService::ensure_loaded` loads the capability at most once.
//! Callers arriving while a load is in flight wait on the same attempt and
//! observe the same outcome. A failed or abandoned attempt clears the
//! in-flight state so the next caller starts a fresh load.

use crate::types::{Detection, Frame};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelLoadError {
    #[error("model file not found: {0}")]
    NotFound(String),
    #[error("model load failed: {0}")]
    Failed(String),
    #[error("model load timed out after {0:?}")]
    Timeout(Duration),
    #[error("model load was abandoned before completion")]
    Abandoned,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("descriptor has {actual} values, capability declares {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Black-box face embedding capability.
///
/// Given a frame, returns zero or one detected face with a fixed-length
/// descriptor and a confidence score.
pub trait EmbeddingCapability: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Option<Detection>, CapabilityError>;

    /// Length of every descriptor this capability produces.
    fn dimension(&self) -> usize;

    fn name(&self) -> &str {
        "embedding-capability"
    }
}

/// Shared, read-only reference to a loaded capability.
#[derive(Clone)]
pub struct CapabilityHandle(Arc<dyn EmbeddingCapability>);

impl CapabilityHandle {
    pub fn new<C: EmbeddingCapability + 'static>(capability: C) -> Self {
        Self(Arc::new(capability))
    }

    /// True if both handles refer to the same loaded capability.
    pub fn same_as(&self, other: &CapabilityHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for CapabilityHandle {
    type Target = dyn EmbeddingCapability;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for CapabilityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityHandle")
            .field("name", &self.0.name())
            .field("dimension", &self.0.dimension())
            .finish()
    }
}

/// Produces a capability. Called by the lifecycle service, never directly.
#[allow(async_fn_in_trait)]
pub trait CapabilityLoader {
    async fn load(&self) -> Result<CapabilityHandle, ModelLoadError>;
}

type LoadOutcome = Option<Result<CapabilityHandle, ModelLoadError>>;

enum LoadState {
    Unloaded,
    Loading(watch::Receiver<LoadOutcome>),
    Loaded(CapabilityHandle),
}

/// Loads and caches the embedding capability.
pub struct ModelLifecycleService<L> {
    loader: L,
    load_timeout: Duration,
    state: Mutex<LoadState>,
}

impl<L: CapabilityLoader> ModelLifecycleService<L> {
    pub fn new(loader: L, load_timeout: Duration) -> Self {
        Self {
            loader,
            load_timeout,
            state: Mutex::new(LoadState::Unloaded),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(*self.lock_state(), LoadState::Loaded(_))
    }

    /// Return the loaded capability, loading it first if necessary.
    pub async fn ensure_loaded(&self) -> Result<CapabilityHandle, ModelLoadError> {
        let leader = {
            let mut state = self.lock_state();
            let waiter = match &*state {
                LoadState::Loaded(handle) => return Ok(handle.clone()),
                LoadState::Loading(rx) => Some(rx.clone()),
                LoadState::Unloaded => None,
            };
            match waiter {
                Some(rx) => Err(rx),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *state = LoadState::Loading(rx);
                    Ok(tx)
                }
            }
        };

        match leader {
            Ok(tx) => self.lead_load(tx).await,
            Err(mut rx) => {
                tracing::debug!("model load in flight; waiting on existing attempt");
                let outcome = match rx.wait_for(Option::is_some).await {
                    Ok(slot) => (*slot).clone(),
                    Err(_) => None,
                };
                outcome.unwrap_or(Err(ModelLoadError::Abandoned))
            }
        }
    }

    async fn lead_load(
        &self,
        tx: watch::Sender<LoadOutcome>,
    ) -> Result<CapabilityHandle, ModelLoadError> {
        let mut reset = ResetOnDrop {
            state: &self.state,
            armed: true,
        };

        tracing::info!(timeout = ?self.load_timeout, "loading embedding capability");
        let result = match tokio::time::timeout(self.load_timeout, self.loader.load()).await {
            Ok(result) => result,
            Err(_) => Err(ModelLoadError::Timeout(self.load_timeout)),
        };

        {
            let mut state = self.lock_state();
            *state = match &result {
                Ok(handle) => LoadState::Loaded(handle.clone()),
                Err(_) => LoadState::Unloaded,
            };
        }
        reset.armed = false;

        match &result {
            Ok(handle) => tracing::info!(
                name = handle.name(),
                dimension = handle.dimension(),
                "embedding capability loaded"
            ),
            Err(e) => tracing::warn!(error = %e, "embedding capability load failed"),
        }

        tx.send_replace(Some(result.clone()));
        result
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LoadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the in-flight state if the leading load future is dropped early.
/// Waiters then observe a closed channel and receive `Abandoned`.
struct ResetOnDrop<'a> {
    state: &'a Mutex<LoadState>,
    armed: bool,
}

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            *state = LoadState::Unloaded;
        }
    }
}
