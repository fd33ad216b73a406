//! Configuration types for the network tap (light).

use serde::{Deserialize, Serialize};

/// Bound on buffered responses kept while racing a download.
pub const DEFAULT_RESPONSE_CAPACITY: usize = 80;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TapConfig {
    /// Zero in-flight requests for this long counts as network idle.
    pub quiet_window_ms: u64,
    pub response_capacity: usize,
    pub poll_interval_ms: u64,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            quiet_window_ms: 500,
            response_capacity: DEFAULT_RESPONSE_CAPACITY,
            poll_interval_ms: 50,
        }
    }
}
