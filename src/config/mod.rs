//! Configuration for the TCP data plane.
//!
//! Loaded from TOML; every knob has a default so an empty file yields a
//! working configuration.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Tunables of the TCP protocol handler.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Drop non-SYN traffic addressed to a virtual IP with no matching
    /// service port.
    pub drop_non_service: bool,
    /// Shrink the MSS advertised in backend SYN|ACKs so packets still fit
    /// after the client-address option is injected.
    pub adjust_mss: bool,
    /// Replace the timestamp option with NOPs on client SYNs.
    pub remove_timestamp: bool,
    /// Inject the client-address option on full-NAT connections.
    pub insert_client_addr: bool,
    /// Send RSTs toward both peers when a connection expires.
    pub rst_on_expire: bool,
    /// Allow re-initializing the backend-side ISN when a fresh SYN arrives
    /// on a connection still in a handshake state.
    pub allow_conn_reuse: bool,
    /// Per-state idle timeouts.
    pub timeouts: TimeoutConfig,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            drop_non_service: false,
            adjust_mss: true,
            remove_timestamp: true,
            insert_client_addr: true,
            rst_on_expire: true,
            allow_conn_reuse: true,
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Idle timeouts in seconds, one per connection state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub none: u64,
    pub established: u64,
    pub syn_sent: u64,
    pub syn_recv: u64,
    pub fin_wait: u64,
    pub time_wait: u64,
    pub close: u64,
    pub close_wait: u64,
    pub last_ack: u64,
    pub listen: u64,
    pub synack: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            none: 2,
            established: 90,
            syn_sent: 3,
            syn_recv: 30,
            fin_wait: 3,
            time_wait: 3,
            close: 3,
            close_wait: 3,
            last_ack: 3,
            listen: 2 * 60,
            synack: 30,
        }
    }
}

/// Load configuration from a TOML file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<TcpConfig> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    parse(&content)
}

/// Parse configuration from TOML text.
pub fn parse(content: &str) -> Result<TcpConfig> {
    toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
}
