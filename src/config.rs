//! # Module configuration.
//!
//! Provides [`Config`], the settings consumed by the listener, the propagation
//! worker and the shutdown coordinator.
//!
//! Values are stored in milliseconds so they map one-to-one onto the daemon's
//! configuration file. Prefer the accessors ([`Config::ack_timeout`] and friends),
//! they convert to [`Duration`] and clamp zero to a 1 ms minimum.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use statecast::Config;
//!
//! let cfg = Config::from_toml_str("ack_timeout_ms = 2500").unwrap();
//! assert_eq!(cfg.ack_timeout(), Duration::from_millis(2500));
//! assert_eq!(cfg.connect_timeout(), Duration::from_secs(5));
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::transport::ServiceAddr;

const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Settings for one worker module.
///
/// ## Field semantics
/// - `connect_timeout_ms`: how long start-up waits for the first successful connection
/// - `ack_timeout_ms`: session timeout applied to every acknowledgement
/// - `finalize_ceiling_ms`: how long the shutdown timer waits for [`close`](crate::Listener::close)
/// - `coordinator_service` / `coordinator_service_id`: acknowledgement endpoint
/// - `dispatch_capacity`: local bus post queue size (min 1)
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Initial-connection timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Acknowledgement session timeout in milliseconds.
    pub ack_timeout_ms: u64,

    /// Ceiling for the shutdown timer in milliseconds.
    ///
    /// Exceeding it means finalization was never invoked after a stop trigger;
    /// it is logged as fatal and never hangs the process.
    pub finalize_ceiling_ms: u64,

    /// Name of the coordinator's acknowledgement service.
    pub coordinator_service: String,

    /// Instance id of the coordinator's acknowledgement service.
    pub coordinator_service_id: u32,

    /// Capacity of the local bus post queue.
    pub dispatch_capacity: usize,
}

impl Config {
    /// Parses a TOML document; missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Start-up connection wait.
    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        clamp_ms(self.connect_timeout_ms)
    }

    /// Acknowledgement session timeout.
    #[inline]
    pub fn ack_timeout(&self) -> Duration {
        clamp_ms(self.ack_timeout_ms)
    }

    /// Shutdown timer ceiling.
    #[inline]
    pub fn finalize_ceiling(&self) -> Duration {
        clamp_ms(self.finalize_ceiling_ms)
    }

    /// Address acknowledgements are sent to.
    pub fn ack_endpoint(&self) -> ServiceAddr {
        ServiceAddr::new(self.coordinator_service.clone(), self.coordinator_service_id)
    }

    /// Post queue capacity clamped to a minimum of 1.
    #[inline]
    pub fn dispatch_capacity_clamped(&self) -> usize {
        self.dispatch_capacity.max(1)
    }
}

fn clamp_ms(ms: u64) -> Duration {
    Duration::from_millis(ms).max(MIN_TIMEOUT)
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `connect_timeout_ms = 5000`
    /// - `ack_timeout_ms = 5000`
    /// - `finalize_ceiling_ms = 30000`
    /// - `coordinator_service = "coordinator"`, id `0`
    /// - `dispatch_capacity = 16`
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            ack_timeout_ms: 5_000,
            finalize_ceiling_ms: 30_000,
            coordinator_service: "coordinator".to_string(),
            coordinator_service_id: 0,
            dispatch_capacity: 16,
        }
    }
}
