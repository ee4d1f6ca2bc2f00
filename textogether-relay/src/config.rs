use anyhow::{ensure, Result};

use crate::cli::Cli;
use crate::ratelimit::RateLimitConfig;

/// Runtime configuration derived from CLI/env.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub max_frame_bytes: usize,
    pub topic_capacity: usize,
    pub rate_limit: RateLimitConfig,
}

impl RelayConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        ensure!(cli.max_frame_bytes > 0, "--max-frame-bytes must be positive");
        ensure!(cli.topic_capacity > 0, "--topic-capacity must be positive");
        ensure!(
            !cli.rate_limit || cli.rate_per_sec > 0.0,
            "--rate-per-sec must be positive when rate limiting is enabled"
        );

        Ok(Self {
            listen_addr: cli.listen_addr.clone(),
            max_frame_bytes: cli.max_frame_bytes,
            topic_capacity: cli.topic_capacity,
            rate_limit: RateLimitConfig {
                capacity: cli.rate_burst,
                per_second: cli.rate_per_sec,
                enabled: cli.rate_limit,
            },
        })
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8787".to_string(),
            max_frame_bytes: 8 * 1024 * 1024,
            topic_capacity: 256,
            rate_limit: RateLimitConfig::default(),
        }
    }
}
