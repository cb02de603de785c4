//! Tunables of the simulated swarm.

use std::time::Duration;

/// Configuration for the simulated swarm.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Seed for generated content
    pub seed: u64,
    /// Aggregate download rate in bytes per second, 0 for unthrottled
    pub download_rate_bps: u64,
    /// Bytes written to the cache per simulated block
    pub block_size: usize,
    /// Delay before metadata becomes available
    pub metadata_delay: Duration,
    /// Peers reported in transfer statistics
    pub peers: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 12345,
            download_rate_bps: 8 * 1024 * 1024, // 8 MB/s
            block_size: 16 * 1024,
            metadata_delay: Duration::from_millis(250),
            peers: 12,
        }
    }
}

impl SimulationConfig {
    /// Unthrottled downloads and near-immediate metadata.
    pub fn instant() -> Self {
        Self {
            download_rate_bps: 0,
            metadata_delay: Duration::from_millis(1),
            ..Self::default()
        }
    }

    /// Default configuration with specified seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    /// Time spent transferring one block of `len` bytes.
    pub fn block_delay(&self, len: usize) -> Duration {
        if self.download_rate_bps == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(len as f64 / self.download_rate_bps as f64)
    }
}
