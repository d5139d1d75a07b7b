// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exponential backoff shared by every registration worker.
//!
//! All workers draw their retry delays from a single [`SharedBackoff`], so consecutive
//! failures anywhere in the pool push the delay up for everyone and one successful
//! registration call brings it back to the base delay.

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Configuration parameters for exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay returned after the first failure.
    pub base: Duration,
    /// Upper bound for any returned delay.
    pub max_backoff: Duration,
    /// Growth factor applied per consecutive failure. Must be greater than 1.
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            factor: 2.0,
        }
    }
}

/// Tracks the state of the exponential backoff algorithm.
#[derive(Debug)]
pub struct BackoffState {
    config: BackoffConfig,
    error_count: usize,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            error_count: 0,
        }
    }

    /// Registers a failure and returns the delay to wait before retrying.
    pub fn register_error(&mut self) -> Duration {
        self.error_count = self.error_count.saturating_add(1);
        // exponents past 100 are far beyond any sane cap
        let exponent = self.error_count.saturating_sub(1).min(100) as i32;
        if exponent == 0 {
            return self.config.base.min(self.config.max_backoff);
        }
        let backoff_secs = self.config.base.as_secs_f64() * self.config.factor.powi(exponent);
        if backoff_secs >= self.config.max_backoff.as_secs_f64() {
            return self.config.max_backoff;
        }
        Duration::from_secs_f64(backoff_secs)
    }

    /// Registers a success, sending the next failure back to the base delay.
    pub fn register_success(&mut self) {
        self.error_count = 0;
    }

    pub fn consecutive_errors(&self) -> usize {
        self.error_count
    }
}

/// Backoff state shared between tasks. Cloning shares the same cadence.
#[derive(Debug, Clone)]
pub struct SharedBackoff {
    state: Arc<Mutex<BackoffState>>,
}

impl SharedBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BackoffState::new(config))),
        }
    }

    pub fn register_error(&self) -> Duration {
        match self.state.lock() {
            Ok(mut state) => state.register_error(),
            Err(poisoned) => poisoned.into_inner().register_error(),
        }
    }

    pub fn register_success(&self) {
        match self.state.lock() {
            Ok(mut state) => state.register_success(),
            Err(poisoned) => poisoned.into_inner().register_success(),
        }
    }

    pub fn consecutive_errors(&self) -> usize {
        match self.state.lock() {
            Ok(state) => state.consecutive_errors(),
            Err(poisoned) => poisoned.into_inner().consecutive_errors(),
        }
    }
}

impl Default for SharedBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
