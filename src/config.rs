use rand::Rng;
use rand::distributions::Alphanumeric;
use std::time::Duration;

use crate::error::ApplicationError;

/// Client identification prefix, Azureus style
const PEER_ID_PREFIX: &[u8; 8] = b"-LE0001-";

/// Standard request size; most clients refuse anything larger.
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

/// Knobs shared by the pool and every peer connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Our 20-byte id, sent in handshakes and announces
    pub peer_id: [u8; 20],
    /// Port reported to the tracker. Nothing listens on it.
    pub port: u16,
    /// Upper bound on simultaneously live peer connections
    pub max_connections: usize,
    pub block_size: usize,
    /// Requests kept in flight per unchoked peer
    pub pipeline_depth: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// An unanswered request older than this is cancelled and handed back
    pub request_timeout: Duration,
    /// A peer silent for this long is dropped
    pub idle_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Housekeeping period of the pool and of each connection
    pub tick_interval: Duration,
    /// Floor between two announces, also the retry delay after a failure
    pub min_announce_interval: Duration,
    /// Used when the tracker does not send an interval
    pub default_announce_interval: Duration,
    pub tracker_timeout: Duration,
    /// Upper bound on the `completed`/`stopped` announce at shutdown
    pub final_announce_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            peer_id: generate_peer_id(),
            port: 6881,
            max_connections: 40,
            block_size: DEFAULT_BLOCK_SIZE,
            pipeline_depth: 5,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(90),
            tick_interval: Duration::from_secs(1),
            min_announce_interval: Duration::from_secs(30),
            default_announce_interval: Duration::from_secs(1800),
            tracker_timeout: Duration::from_secs(15),
            final_announce_timeout: Duration::from_secs(3),
        }
    }
}

impl ClientConfig {
    /// Rejects values that would stall the client.
    pub fn validate(&self) -> Result<(), ApplicationError> {
        let invalid = |what: &str| Err(ApplicationError::ParserError(format!("invalid config: {}", what)));

        if self.max_connections == 0 {
            return invalid("max_connections must be at least 1");
        }
        if self.pipeline_depth == 0 {
            return invalid("pipeline_depth must be at least 1");
        }
        if self.block_size == 0 || self.block_size > 128 * 1024 {
            return invalid("block_size must be between 1 byte and 128 KiB");
        }
        if self.tick_interval.is_zero() {
            return invalid("tick_interval must be positive");
        }
        Ok(())
    }
}

/// Generates a fresh peer id: fixed client prefix plus 12 random
/// alphanumerics.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for byte in id[8..].iter_mut() {
        *byte = rng.sample(Alphanumeric);
    }
    id
}
