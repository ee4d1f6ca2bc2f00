use clap::{ArgAction, Parser};

/// CLI for the broadcast relay.
#[derive(Debug, Clone, Parser)]
#[command(name = "textogether-relay", about = "Topic broadcast relay for textogether sync clients")]
pub struct Cli {
    /// Listen address for HTTP/WS endpoints
    #[arg(long, env = "TEXTOGETHER_RELAY_ADDR", default_value = "127.0.0.1:8787")]
    pub listen_addr: String,

    /// Largest accepted frame, in bytes
    #[arg(long, env = "TEXTOGETHER_MAX_FRAME_BYTES", default_value = "8388608")]
    pub max_frame_bytes: usize,

    /// Frames buffered per topic before slow subscribers are dropped
    #[arg(long, env = "TEXTOGETHER_TOPIC_CAPACITY", default_value = "256")]
    pub topic_capacity: usize,

    /// Enable debug logging
    #[arg(long, short)]
    pub verbose: bool,

    /// Limit frames published per connection (`--rate-limit false` to disable)
    #[arg(long, env = "TEXTOGETHER_RATE_LIMIT", default_value_t = true, action = ArgAction::Set)]
    pub rate_limit: bool,

    /// Frames a connection may publish back to back
    #[arg(long, env = "TEXTOGETHER_RATE_BURST", default_value = "500")]
    pub rate_burst: u32,

    /// Sustained frames per second per connection
    #[arg(long, env = "TEXTOGETHER_RATE_PER_SEC", default_value = "100.0")]
    pub rate_per_sec: f64,
}
