//! Backpressure management for the Worker Pool.
//!
//! Gives the lease/execute loop a load-aware accept/reject signal so a
//! worker process stops leasing new work once its local in-flight count
//! crosses a high watermark and resumes below a low watermark
//! (SPEC_FULL.md §4.4 / §5).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Backpressure configuration.
///
/// Controls when a worker starts rejecting new work based on its local
/// in-flight count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureConfig {
    /// Stop accepting work once load exceeds this ratio of `max_concurrency`.
    pub high_watermark: f64,

    /// Resume accepting work once load drops below this ratio.
    pub low_watermark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: 0.9,
            low_watermark: 0.7,
        }
    }
}

impl BackpressureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn validate(&self) -> Result<(), BackpressureError> {
        if self.low_watermark >= self.high_watermark {
            return Err(BackpressureError::InvalidConfig(
                "low_watermark must be less than high_watermark".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackpressureError {
    #[error("invalid backpressure configuration: {0}")]
    InvalidConfig(String),
}

/// Tracks current load and implements the hysteresis accept/reject
/// decision using atomics so it is cheap to consult from the poll loop.
pub struct BackpressureState {
    config: BackpressureConfig,
    current_load: AtomicUsize,
    max_concurrency: usize,
    accepting: AtomicBool,
}

impl BackpressureState {
    pub fn new(config: BackpressureConfig, max_concurrency: usize) -> Self {
        Self {
            config,
            current_load: AtomicUsize::new(0),
            max_concurrency,
            accepting: AtomicBool::new(true),
        }
    }

    /// Whether the worker should keep leasing. Implements hysteresis: once
    /// tripped by the high watermark, stays tripped until load falls to
    /// the low watermark, preventing oscillation under load.
    pub fn should_accept(&self) -> bool {
        let currently_accepting = self.accepting.load(Ordering::Relaxed);
        let ratio = self.load_ratio();

        if currently_accepting {
            if ratio >= self.config.high_watermark {
                self.accepting.store(false, Ordering::Relaxed);
                return false;
            }
            true
        } else if ratio <= self.config.low_watermark {
            self.accepting.store(true, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn current_load(&self) -> usize {
        self.current_load.load(Ordering::Relaxed)
    }

    pub fn load_ratio(&self) -> f64 {
        self.current_load.load(Ordering::Relaxed) as f64 / self.max_concurrency.max(1) as f64
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    pub fn task_started(&self) {
        self.current_load.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_completed(&self) {
        self.current_load.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn available_slots(&self) -> usize {
        self.max_concurrency.saturating_sub(self.current_load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_watermarks() {
        let config = BackpressureConfig::default();
        assert_eq!(config.high_watermark, 0.9);
        assert_eq!(config.low_watermark, 0.7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn low_watermark_at_or_above_high_is_rejected() {
        let config = BackpressureConfig::new()
            .with_high_watermark(0.5)
            .with_low_watermark(0.8);
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_initially() {
        let state = BackpressureState::new(BackpressureConfig::default(), 10);
        assert!(state.should_accept());
    }

    #[test]
    fn stops_at_high_watermark() {
        let config = BackpressureConfig::new()
            .with_high_watermark(0.8)
            .with_low_watermark(0.5);
        let state = BackpressureState::new(config, 10);
        for _ in 0..8 {
            state.task_started();
        }
        assert!(!state.should_accept());
        assert!(!state.is_accepting());
    }

    #[test]
    fn hysteresis_prevents_oscillation_between_watermarks() {
        let config = BackpressureConfig::new()
            .with_high_watermark(0.8)
            .with_low_watermark(0.5);
        let state = BackpressureState::new(config, 10);
        for _ in 0..8 {
            state.task_started();
        }
        assert!(!state.should_accept());

        state.task_completed();
        assert!(!state.should_accept());

        for _ in 0..2 {
            state.task_completed();
        }
        assert!(state.should_accept());
    }

    #[test]
    fn available_slots_tracks_current_load() {
        let state = BackpressureState::new(BackpressureConfig::default(), 10);
        assert_eq!(state.available_slots(), 10);
        state.task_started();
        state.task_started();
        assert_eq!(state.available_slots(), 8);
    }
}
