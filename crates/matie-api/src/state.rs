//! Application state management

use matie_core::config::AppConfig;
use matie_runner::BatchCoordinator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Application state shared across handlers
///
/// Holds no per-batch data: every request gets its own workspace from the
/// coordinator.
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,
    /// Batch coordinator driving the decoder
    pub coordinator: BatchCoordinator,
    /// Server start time
    pub start_time: Instant,
    /// Request counter
    pub request_count: AtomicU64,
}

impl AppState {
    /// Create new application state running the configured decoder
    pub fn new(config: AppConfig) -> Self {
        let coordinator = BatchCoordinator::from_config(&config.annotator);
        Self::with_coordinator(config, coordinator)
    }

    /// Create state around an existing coordinator
    pub fn with_coordinator(config: AppConfig, coordinator: BatchCoordinator) -> Self {
        Self {
            config,
            coordinator,
            start_time: Instant::now(),
            request_count: AtomicU64::new(0),
        }
    }

    /// Increment request counter
    pub fn increment_requests(&self) -> u64 {
        self.request_count.fetch_add(1, Ordering::SeqCst)
    }

    /// Get total request count
    pub fn get_request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}
