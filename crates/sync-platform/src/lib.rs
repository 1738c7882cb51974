use std::{
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use sync_core::{ComposeDraft, ReloadTokenSlot, SessionSnapshot};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("page host unavailable: {0}")]
    Unavailable(String),
    #[error("page host backend failure: {0}")]
    Backend(String),
}

/// The page the engine runs in: its URL fragment, session and navigation.
pub trait PageHost: Send + Sync {
    /// URL fragment present at cold start; yields it once.
    fn take_fragment(&self) -> Result<Option<String>, PlatformError>;

    fn csrf_token(&self) -> Result<String, PlatformError>;

    /// Compose, scroll and hash state to carry across a reload.
    fn capture_session(&self) -> Result<SessionSnapshot, PlatformError>;

    /// Replace the page with a fresh load carrying `fragment`.
    fn navigate_reload(&self, fragment: &str) -> Result<(), PlatformError>;

    /// Wrap the cold-start fragment for exactly-once consumption.
    fn reload_slot(&self) -> Result<ReloadTokenSlot, PlatformError> {
        Ok(ReloadTokenSlot::new(self.take_fragment()?))
    }
}

/// Wall clock in milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Clock moved by hand, for suspend detection and idle-timer tests.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct PageState {
    fragment: Option<String>,
    csrf_token: String,
    compose: Option<ComposeDraft>,
    current_hash: Option<String>,
    navigations: Vec<String>,
}

/// Page host kept in memory; records navigations instead of performing them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPageHost {
    state: Arc<RwLock<PageState>>,
}

impl InMemoryPageHost {
    pub fn new(csrf_token: impl Into<String>) -> Self {
        let host = Self::default();
        if let Ok(mut state) = host.state.write() {
            state.csrf_token = csrf_token.into();
        }
        host
    }

    pub fn with_fragment(self, fragment: impl Into<String>) -> Self {
        if let Ok(mut state) = self.state.write() {
            state.fragment = Some(fragment.into());
        }
        self
    }

    pub fn set_compose(&self, compose: Option<ComposeDraft>) -> Result<(), PlatformError> {
        self.write()?.compose = compose;
        Ok(())
    }

    pub fn set_hash(&self, hash: impl Into<String>) -> Result<(), PlatformError> {
        self.write()?.current_hash = Some(hash.into());
        Ok(())
    }

    /// Fragments passed to [`PageHost::navigate_reload`], oldest first.
    pub fn navigations(&self) -> Result<Vec<String>, PlatformError> {
        Ok(self.read()?.navigations.clone())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, PageState>, PlatformError> {
        self.state
            .read()
            .map_err(|_| PlatformError::Backend("poisoned lock".to_owned()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, PageState>, PlatformError> {
        self.state
            .write()
            .map_err(|_| PlatformError::Backend("poisoned lock".to_owned()))
    }
}

impl PageHost for InMemoryPageHost {
    fn take_fragment(&self) -> Result<Option<String>, PlatformError> {
        Ok(self.write()?.fragment.take())
    }

    fn csrf_token(&self) -> Result<String, PlatformError> {
        Ok(self.read()?.csrf_token.clone())
    }

    fn capture_session(&self) -> Result<SessionSnapshot, PlatformError> {
        let state = self.read()?;
        Ok(SessionSnapshot {
            csrf_token: state.csrf_token.clone(),
            compose: state.compose.clone(),
            current_hash: state.current_hash.clone(),
            ..SessionSnapshot::default()
        })
    }

    fn navigate_reload(&self, fragment: &str) -> Result<(), PlatformError> {
        info!(fragment_len = fragment.len(), "navigating to reload");
        let mut state = self.write()?;
        state.navigations.push(fragment.to_owned());
        debug!(count = state.navigations.len(), "navigation recorded");
        Ok(())
    }
}
