//! Model session manager.
//!
//! Owns the vision and text encoder sessions and is the only process-wide
//! mutable state in the crate. Sessions are loaded on first use, cached, and
//! discarded when the host reports that the app went to the background.
//!
//! ```text
//!                 vision_session()                 text_session()
//!   Unloaded ───────────────────▶ VisionLoaded ◀────────────────▶ TextLoaded
//!      ▲                              │        vision_session()       │
//!      └──────── Background / Inactive ┴──────────────────────────────┘
//! ```
//!
//! Under [`SessionPolicy::Exclusive`] requesting one modality evicts the
//! other. [`SessionPolicy::Coresident`] keeps both, adding a `BothLoaded`
//! state.
//!
//! Loads run while the manager's async lock is held, so concurrent requests
//! for the same modality wait for the first load instead of starting another
//! one. Callers never own a session; a [`SessionLease`] borrows it for one
//! inference call, which runs on the blocking pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::Array4;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::tokenizer::TokenSequence;
use crate::{Result, VaultError};

/// Encoder kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Vision,
    Text,
}

impl Modality {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vision => "vision",
            Self::Text => "text",
        }
    }

    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Vision => Self::Text,
            Self::Text => Self::Vision,
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input for one inference call.
#[derive(Debug, Clone)]
pub enum ModelInput {
    /// `[1, 3, 224, 224]` pixel tensor
    Pixels(Array4<f32>),
    /// Fixed-length token ids
    Tokens(TokenSequence),
}

/// A loaded inference engine for one modality.
pub trait InferenceSession: Send {
    /// Run the graph and return its named output flattened to `f32`s.
    fn run(&mut self, input: ModelInput) -> Result<Vec<f32>>;
}

/// Builds sessions from model artifacts. Called on a blocking thread.
pub trait SessionLoader: Send + Sync + 'static {
    fn load(&self, modality: Modality) -> Result<Box<dyn InferenceSession>>;
}

/// Whether vision and text sessions may be resident at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPolicy {
    /// At most one session resident; requesting one evicts the other.
    #[default]
    Exclusive,
    /// Both sessions may stay loaded.
    Coresident,
}

/// Observable manager state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unloaded,
    VisionLoaded,
    TextLoaded,
    /// Only reachable under [`SessionPolicy::Coresident`].
    BothLoaded,
}

/// Host application lifecycle signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Inactive,
    Background,
}

#[derive(Default)]
struct Slots {
    vision: Option<Box<dyn InferenceSession>>,
    text: Option<Box<dyn InferenceSession>>,
}

impl Slots {
    fn slot_mut(&mut self, modality: Modality) -> &mut Option<Box<dyn InferenceSession>> {
        match modality {
            Modality::Vision => &mut self.vision,
            Modality::Text => &mut self.text,
        }
    }

    fn state(&self) -> SessionState {
        match (self.vision.is_some(), self.text.is_some()) {
            (false, false) => SessionState::Unloaded,
            (true, false) => SessionState::VisionLoaded,
            (false, true) => SessionState::TextLoaded,
            (true, true) => SessionState::BothLoaded,
        }
    }
}

/// Lazily loads, caches and evicts encoder sessions.
pub struct ModelSessionManager {
    loader: Arc<dyn SessionLoader>,
    policy: SessionPolicy,
    slots: Arc<Mutex<Slots>>,
    loads: AtomicU64,
}

impl ModelSessionManager {
    pub fn new(loader: Arc<dyn SessionLoader>, policy: SessionPolicy) -> Self {
        Self {
            loader,
            policy,
            slots: Arc::new(Mutex::new(Slots::default())),
            loads: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    /// Borrow the vision session, loading it if absent.
    pub async fn vision_session(&self) -> Result<SessionLease> {
        self.acquire(Modality::Vision).await
    }

    /// Borrow the text session, loading it if absent.
    pub async fn text_session(&self) -> Result<SessionLease> {
        self.acquire(Modality::Text).await
    }

    async fn acquire(&self, modality: Modality) -> Result<SessionLease> {
        let mut slots = Arc::clone(&self.slots).lock_owned().await;

        if self.policy == SessionPolicy::Exclusive
            && slots.slot_mut(modality.other()).take().is_some()
        {
            tracing::debug!(evicted = %modality.other(), requested = %modality, "evicted session");
        }

        if slots.slot_mut(modality).is_none() {
            tracing::debug!(modality = %modality, "loading session");
            let loader = Arc::clone(&self.loader);
            let session = tokio::task::spawn_blocking(move || loader.load(modality))
                .await
                .map_err(|e| VaultError::model_load(modality.as_str(), format!("load task failed: {e}")))??;
            *slots.slot_mut(modality) = Some(session);
            self.loads.fetch_add(1, Ordering::Relaxed);
            tracing::info!(modality = %modality, "session loaded");
        }

        Ok(SessionLease {
            guard: slots,
            modality,
        })
    }

    /// Apply a host lifecycle signal. `Inactive` and `Background` discard all
    /// sessions; `Active` leaves them untouched.
    pub async fn set_lifecycle(&self, lifecycle: Lifecycle) {
        match lifecycle {
            Lifecycle::Active => {}
            Lifecycle::Inactive | Lifecycle::Background => {
                tracing::debug!(?lifecycle, "app left foreground");
                self.unload().await;
            }
        }
    }

    /// Discard every resident session.
    pub async fn unload(&self) {
        let mut slots = self.slots.lock().await;
        let was = slots.state();
        *slots = Slots::default();
        if was != SessionState::Unloaded {
            tracing::info!(previous = ?was, "sessions unloaded");
        }
    }

    pub async fn state(&self) -> SessionState {
        self.slots.lock().await.state()
    }

    /// Total session loads performed since construction.
    #[must_use]
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
}

/// Exclusive borrow of one loaded session, held for a single inference call.
pub struct SessionLease {
    guard: OwnedMutexGuard<Slots>,
    modality: Modality,
}

impl SessionLease {
    /// Run one inference on the blocking pool, releasing the session when it
    /// finishes.
    pub async fn infer(mut self, input: ModelInput) -> Result<Vec<f32>> {
        let modality = self.modality;
        tokio::task::spawn_blocking(move || self.run(input))
            .await
            .map_err(|e| VaultError::inference(format!("{modality} inference task failed: {e}")))?
    }

    /// Run one inference on the current thread.
    pub fn run(&mut self, input: ModelInput) -> Result<Vec<f32>> {
        let session = self
            .guard
            .slot_mut(self.modality)
            .as_mut()
            .ok_or_else(|| VaultError::inference(format!("{} session not loaded", self.modality)))?;
        session.run(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct ConstSession {
        value: f32,
        delay: Option<Duration>,
    }

    impl InferenceSession for ConstSession {
        fn run(&mut self, _input: ModelInput) -> Result<Vec<f32>> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            Ok(vec![self.value; 4])
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        vision: AtomicUsize,
        text: AtomicUsize,
        delay: Option<Duration>,
        run_delay: Option<Duration>,
        fail: bool,
    }

    impl SessionLoader for CountingLoader {
        fn load(&self, modality: Modality) -> Result<Box<dyn InferenceSession>> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            if self.fail {
                return Err(VaultError::model_load(modality.as_str(), "weights missing"));
            }
            let counter = match modality {
                Modality::Vision => &self.vision,
                Modality::Text => &self.text,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ConstSession {
                value: 1.0,
                delay: self.run_delay,
            }))
        }
    }

    fn manager(loader: &Arc<CountingLoader>, policy: SessionPolicy) -> ModelSessionManager {
        let dyn_loader: Arc<dyn SessionLoader> = loader.clone();
        ModelSessionManager::new(dyn_loader, policy)
    }

    fn pixels() -> ModelInput {
        ModelInput::Pixels(Array4::zeros((1, 3, 2, 2)))
    }

    #[tokio::test]
    async fn sessions_are_cached() {
        let loader = Arc::new(CountingLoader::default());
        let manager = manager(&loader, SessionPolicy::Exclusive);

        for _ in 0..3 {
            let mut lease = manager.vision_session().await.unwrap();
            assert_eq!(lease.run(pixels()).unwrap().len(), 4);
        }
        assert_eq!(loader.vision.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state().await, SessionState::VisionLoaded);
    }

    #[tokio::test]
    async fn text_session_evicts_vision_under_exclusive_policy() {
        let loader = Arc::new(CountingLoader::default());
        let manager = manager(&loader, SessionPolicy::Exclusive);

        drop(manager.vision_session().await.unwrap());
        drop(manager.text_session().await.unwrap());
        assert_eq!(manager.state().await, SessionState::TextLoaded);

        drop(manager.vision_session().await.unwrap());
        assert_eq!(loader.vision.load(Ordering::SeqCst), 2);
        assert_eq!(loader.text.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state().await, SessionState::VisionLoaded);
        assert_eq!(manager.load_count(), 3);
    }

    #[tokio::test]
    async fn coresident_policy_keeps_both_sessions() {
        let loader = Arc::new(CountingLoader::default());
        let manager = manager(&loader, SessionPolicy::Coresident);

        drop(manager.vision_session().await.unwrap());
        drop(manager.text_session().await.unwrap());
        drop(manager.vision_session().await.unwrap());
        assert_eq!(manager.state().await, SessionState::BothLoaded);
        assert_eq!(loader.vision.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn background_signal_unloads_everything() {
        let loader = Arc::new(CountingLoader::default());
        let manager = manager(&loader, SessionPolicy::Coresident);

        drop(manager.vision_session().await.unwrap());
        drop(manager.text_session().await.unwrap());

        manager.set_lifecycle(Lifecycle::Active).await;
        assert_eq!(manager.state().await, SessionState::BothLoaded);

        manager.set_lifecycle(Lifecycle::Background).await;
        assert_eq!(manager.state().await, SessionState::Unloaded);

        drop(manager.vision_session().await.unwrap());
        assert_eq!(loader.vision.load(Ordering::SeqCst), 2);

        manager.set_lifecycle(Lifecycle::Inactive).await;
        assert_eq!(manager.state().await, SessionState::Unloaded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_share_one_load() {
        let loader = Arc::new(CountingLoader {
            delay: Some(Duration::from_millis(50)),
            ..CountingLoader::default()
        });
        let manager = Arc::new(manager(&loader, SessionPolicy::Exclusive));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                let lease = manager.vision_session().await?;
                lease
                    .infer(ModelInput::Pixels(Array4::zeros((1, 3, 2, 2))))
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().len(), 4);
        }
        assert_eq!(loader.vision.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn inference_leaves_the_runtime_responsive() {
        let loader = Arc::new(CountingLoader {
            run_delay: Some(Duration::from_millis(300)),
            ..CountingLoader::default()
        });
        let manager = manager(&loader, SessionPolicy::Exclusive);
        drop(manager.vision_session().await.unwrap());

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        let lease = manager.vision_session().await.unwrap();
        assert_eq!(lease.infer(pixels()).await.unwrap().len(), 4);
        ticker.abort();

        assert!(ticks.load(Ordering::SeqCst) >= 5);
        // The lease was released when the inference finished.
        assert_eq!(manager.state().await, SessionState::VisionLoaded);
    }

    #[tokio::test]
    async fn failed_load_is_reported_and_retryable() {
        let failing = Arc::new(CountingLoader {
            fail: true,
            ..CountingLoader::default()
        });
        let manager = manager(&failing, SessionPolicy::Exclusive);

        let err = manager.vision_session().await.err().unwrap();
        assert!(matches!(err, VaultError::ModelLoad { .. }));
        assert_eq!(manager.state().await, SessionState::Unloaded);

        // A second attempt goes back to the loader rather than caching the failure.
        assert!(manager.vision_session().await.is_err());
        assert_eq!(manager.load_count(), 0);
    }
}
