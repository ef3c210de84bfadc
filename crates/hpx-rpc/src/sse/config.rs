//! Event source configuration.

use std::time::Duration;

use rand::RngExt;

use super::parse::TextDecoding;

/// Configuration for a reconnecting event source.
///
/// Reconnection is disabled by default (`max_reconnects == 0`): the first
/// failure is terminal.
#[derive(Clone, Debug)]
pub struct EventSourceConfig {
    /// Reconnect budget after the initial attempt.
    pub max_reconnects: u32,
    /// Delay before the first reconnect.
    pub reconnect_initial_delay: Duration,
    /// Upper bound on the reconnect delay.
    pub reconnect_max_delay: Duration,
    /// Backoff multiplier between reconnects.
    pub reconnect_backoff_factor: f64,
    /// Random jitter factor (0.0–1.0) for reconnect delays.
    pub reconnect_jitter: f64,
    /// Abort the connection while the host is hidden and reopen on show.
    pub pause_when_hidden: bool,
    /// How often a waiting consumer re-checks the buffer while the
    /// connection is down.
    pub poll_interval: Duration,
    /// Optional bound on the time to receive response headers.
    pub connect_timeout: Option<Duration>,
    /// Text decoding for field values.
    pub decoding: TextDecoding,
}

impl Default for EventSourceConfig {
    fn default() -> Self {
        Self {
            max_reconnects: 0,
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_backoff_factor: 2.0,
            reconnect_jitter: 0.0,
            pause_when_hidden: true,
            poll_interval: Duration::from_millis(100),
            connect_timeout: None,
            decoding: TextDecoding::Utf8Lossy,
        }
    }
}

impl EventSourceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reconnect budget.
    #[must_use]
    pub fn max_reconnects(mut self, attempts: u32) -> Self {
        self.max_reconnects = attempts;
        self
    }

    /// Set the initial reconnection delay.
    #[must_use]
    pub fn reconnect_initial_delay(mut self, delay: Duration) -> Self {
        self.reconnect_initial_delay = delay;
        self
    }

    /// Set the maximum reconnection delay.
    #[must_use]
    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = delay;
        self
    }

    /// Set the reconnection backoff factor.
    #[must_use]
    pub fn reconnect_backoff_factor(mut self, factor: f64) -> Self {
        self.reconnect_backoff_factor = factor;
        self
    }

    /// Set the reconnection jitter factor.
    #[must_use]
    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    #[must_use]
    pub fn pause_when_hidden(mut self, pause: bool) -> Self {
        self.pause_when_hidden = pause;
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn decoding(mut self, decoding: TextDecoding) -> Self {
        self.decoding = decoding;
        self
    }

    /// Returns `true` when failures may be retried.
    pub fn retries_enabled(&self) -> bool {
        self.max_reconnects > 0
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid setting.
    pub fn validate(&self) -> Result<(), String> {
        if self.reconnect_initial_delay.is_zero() {
            return Err("Reconnect initial delay must be non-zero".to_string());
        }
        if self.reconnect_max_delay < self.reconnect_initial_delay {
            return Err("Reconnect max delay must not be below the initial delay".to_string());
        }
        let factor = self.reconnect_backoff_factor;
        if !factor.is_finite() || factor < 1.0 {
            return Err(format!("Reconnect backoff factor must be finite and >= 1, got {factor}"));
        }
        let jitter = self.reconnect_jitter;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(format!("Reconnect jitter must be within 0.0..=1.0, got {jitter}"));
        }
        if self.poll_interval.is_zero() {
            return Err("Poll interval must be > 0".to_string());
        }
        if self.connect_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err("Connect timeout must be > 0".to_string());
        }
        Ok(())
    }

    /// Delay before reconnect number `failures` (1-based).
    ///
    /// A delay requested by the handler wins, then the last `retry` value
    /// sent by the server. Otherwise the delay starts at
    /// `reconnect_initial_delay`, grows by `reconnect_backoff_factor` per
    /// failure and is clamped to `reconnect_max_delay`, even when the
    /// growth overflows. Jitter only ever shortens the backoff.
    pub(crate) fn reconnect_delay(
        &self,
        failures: u32,
        server_retry: Option<Duration>,
        requested: Option<Duration>,
    ) -> Duration {
        if let Some(delay) = requested.or(server_retry) {
            return delay;
        }

        let cap = self.reconnect_max_delay;
        let growth = self
            .reconnect_backoff_factor
            .powf(f64::from(failures.saturating_sub(1)));
        let secs = self.reconnect_initial_delay.as_secs_f64() * growth;
        let backoff = Duration::try_from_secs_f64(secs).map_or(cap, |delay| delay.min(cap));
        if self.reconnect_jitter == 0.0 {
            return backoff;
        }

        let base = backoff.as_secs_f64();
        let sample = rand::rng().random_range(0.0..=base);
        let blended = base * (1.0 - self.reconnect_jitter) + sample * self.reconnect_jitter;
        Duration::try_from_secs_f64(blended).map_or(backoff, |delay| delay.min(backoff))
    }
}
