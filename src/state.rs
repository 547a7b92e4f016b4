//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket session.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets every session task and request handler hold the same state
//! - **Memory safety**: The state is freed when the last reference is dropped
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Many readers (health checks) OR one writer (a session updating counters)
//! - **Poisoning**: A panic while holding the lock poisons it; the counters are
//!   plain integers that cannot be left half-updated, so the guard is recovered
//!   with `PoisonError::into_inner` instead of propagating the panic
//!
//! ### RAII Guards
//! - `SessionGuard` decrements the active-session counter in `Drop`, so the
//!   count stays correct however the session task ends

use crate::config::AppConfig;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// State shared by all handlers and session tasks.
///
/// The configuration is immutable after startup; only the relay counters
/// change at runtime.
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub metrics: Arc<RwLock<RelayMetrics>>,
    pub start_time: Instant,
}

/// Counters reported by `/health`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RelayMetrics {
    /// Sessions currently connected.
    pub active_sessions: u32,
    /// Sessions accepted since startup.
    pub total_sessions: u64,
    /// Sessions that could not start their provider or lost their client mid-stream.
    pub failed_sessions: u64,
    /// Audio bytes forwarded to providers.
    pub audio_bytes_relayed: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(RelayMetrics::default())),
            start_time: Instant::now(),
        }
    }

    pub fn config(&self) -> Arc<AppConfig> {
        self.config.clone()
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, RelayMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, RelayMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a new session; it stays active until the returned guard drops.
    pub fn session_started(&self) -> SessionGuard {
        let mut metrics = self.write_metrics();
        metrics.active_sessions += 1;
        metrics.total_sessions += 1;

        SessionGuard {
            metrics: self.metrics.clone(),
        }
    }

    /// Fold a finished session's numbers into the totals.
    pub fn record_session_end(&self, failed: bool, audio_bytes: u64) {
        let mut metrics = self.write_metrics();
        if failed {
            metrics.failed_sessions += 1;
        }
        metrics.audio_bytes_relayed += audio_bytes;
    }

    /// Consistent copy of the counters.
    pub fn metrics_snapshot(&self) -> RelayMetrics {
        self.read_metrics().clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Marks one session as active for as long as it lives.
#[derive(Debug)]
pub struct SessionGuard {
    metrics: Arc<RwLock<RelayMetrics>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        // Underflow would mean a guard was dropped twice.
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_guard_tracks_active_sessions() {
        let state = AppState::new(AppConfig::default());

        let first = state.session_started();
        let second = state.session_started();
        assert_eq!(state.metrics_snapshot().active_sessions, 2);

        drop(first);
        assert_eq!(state.metrics_snapshot().active_sessions, 1);
        drop(second);

        let metrics = state.metrics_snapshot();
        assert_eq!(metrics.active_sessions, 0);
        assert_eq!(metrics.total_sessions, 2);
    }

    #[test]
    fn test_record_session_end() {
        let state = AppState::new(AppConfig::default());
        state.record_session_end(false, 3200);
        state.record_session_end(true, 640);

        let metrics = state.metrics_snapshot();
        assert_eq!(metrics.failed_sessions, 1);
        assert_eq!(metrics.audio_bytes_relayed, 3840);
    }

    #[test]
    fn test_clones_share_metrics() {
        let state = AppState::new(AppConfig::default());
        let clone = state.clone();
        let _guard = clone.session_started();
        assert_eq!(state.metrics_snapshot().active_sessions, 1);
    }
}
