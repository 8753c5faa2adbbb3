use std::time::Duration;

/// Per-RPC-instance tunables. Constructed programmatically by the embedding
/// application; this crate never reads a config file or parses argv.
#[derive(Debug, Clone)]
pub struct Config {
    pub window_size: usize,
    pub rto_floor: Duration,
    pub max_message_size: u32,
    pub background_workers: usize,
    pub congestion: CongestionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window_size: nexus_rpc_abi::DEFAULT_WINDOW_SIZE,
            rto_floor: Duration::from_millis(5),
            max_message_size: nexus_rpc_abi::MAX_MESSAGE_SIZE,
            background_workers: 2,
            congestion: CongestionConfig::default(),
        }
    }
}

/// Timely-style congestion controller parameters. These are left tunable
/// rather than hardcoded; the defaults below are the published Timely values
/// for low-RTT datacenter fabrics, recorded as `Config` fields so a
/// deployment can tune them without touching the engine.
#[derive(Debug, Clone, Copy)]
pub struct CongestionConfig {
    pub t_low: Duration,
    pub t_high: Duration,
    pub additive_increase_fraction: f64,
    pub max_decrease_factor: f64,
    pub rate_min_bytes_per_sec: f64,
    pub rate_max_bytes_per_sec: f64,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            t_low: Duration::from_micros(50),
            t_high: Duration::from_micros(200),
            additive_increase_fraction: 1.0 / 1000.0,
            max_decrease_factor: 0.8,
            rate_min_bytes_per_sec: 1.0 * 1024.0 * 1024.0,
            rate_max_bytes_per_sec: 10.0 * 1024.0 * 1024.0 * 1024.0,
        }
    }
}

/// Retransmission backoff policy: exponential, capped at 32x, resets on any
/// ack for the slot.
pub const MAX_BACKOFF_MULTIPLIER: u32 = 32;
