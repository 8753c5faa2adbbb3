//! Timely-style congestion controller and pacing budget.

use std::time::{Duration, Instant};

use crate::config::CongestionConfig;

#[derive(Debug, Clone)]
pub struct CongestionState {
    rate_bytes_per_sec: f64,
    smoothed_rtt: Option<Duration>,
    budget_bytes: f64,
    last_tick: Instant,
}

const EWMA_ALPHA: f64 = 0.02;

impl CongestionState {
    pub fn new(cfg: &CongestionConfig, now: Instant) -> Self {
        Self {
            rate_bytes_per_sec: cfg.rate_max_bytes_per_sec,
            smoothed_rtt: None,
            budget_bytes: 0.0,
            last_tick: now,
        }
    }

    pub fn rate_bytes_per_sec(&self) -> f64 {
        self.rate_bytes_per_sec
    }

    /// Updates the target rate from a fresh RTT sample taken at an
    /// acknowledged packet.
    pub fn on_rtt_sample(&mut self, rtt: Duration, cfg: &CongestionConfig) {
        if rtt < cfg.t_low {
            self.rate_bytes_per_sec += cfg.rate_max_bytes_per_sec * cfg.additive_increase_fraction;
        } else if rtt > cfg.t_high {
            let rtt_secs = rtt.as_secs_f64();
            let excess = (rtt_secs - cfg.t_high.as_secs_f64()) / rtt_secs;
            let factor = excess.clamp(0.0, cfg.max_decrease_factor);
            self.rate_bytes_per_sec -= self.rate_bytes_per_sec * factor;
        } else if let Some(smoothed) = self.smoothed_rtt {
            let gradient = (rtt.as_secs_f64() - smoothed.as_secs_f64()) / smoothed.as_secs_f64().max(1e-9);
            if gradient > 0.0 {
                self.rate_bytes_per_sec -= self.rate_bytes_per_sec * (gradient * cfg.max_decrease_factor).min(cfg.max_decrease_factor);
            } else {
                self.rate_bytes_per_sec += cfg.rate_max_bytes_per_sec * cfg.additive_increase_fraction * 0.5;
            }
        }
        self.rate_bytes_per_sec =
            self.rate_bytes_per_sec.clamp(cfg.rate_min_bytes_per_sec, cfg.rate_max_bytes_per_sec);

        self.smoothed_rtt = Some(match self.smoothed_rtt {
            Some(prev) => Duration::from_secs_f64(
                prev.as_secs_f64() * (1.0 - EWMA_ALPHA) + rtt.as_secs_f64() * EWMA_ALPHA,
            ),
            None => rtt,
        });
    }

    /// Replenishes the per-tick byte budget from elapsed wall-clock time.
    /// Unspent budget carries forward to the next tick.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_tick);
        self.budget_bytes += self.rate_bytes_per_sec * elapsed.as_secs_f64();
        self.last_tick = now;
    }

    /// Attempts to spend `len` bytes of pacing budget; returns whether the
    /// packet may be released this tick.
    pub fn try_spend(&mut self, len: usize) -> bool {
        if self.budget_bytes >= len as f64 {
            self.budget_bytes -= len as f64;
            true
        } else {
            false
        }
    }
}
