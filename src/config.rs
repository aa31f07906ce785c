//! Configuration types for pacerpc.

/// Number of credits (and session slots) per session.
///
/// A client session starts with this many credits; every request or RFR
/// packet on the wire consumes one until it is acknowledged. The per-sslot
/// transmit-timestamp and wheel-membership arrays are sized by this constant,
/// so it is compile-time fixed.
pub const SESSION_CREDITS: usize = 8;

/// RPC configuration.
///
/// Controls the behavior of one endpoint: session management timing,
/// reliability parameters, congestion control and background threading.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Bind address for the session-management channel; also the hostname
    /// part of this endpoint's URI.
    /// Default: "127.0.0.1"
    pub sm_bind_ip: String,
    /// UDP port for the session-management channel. 0 picks an ephemeral port.
    /// Default: 0
    pub sm_udp_port: u16,
    /// Number of background threads running request handlers and
    /// continuations. 0 runs everything on the dispatcher.
    /// Default: 0
    pub num_bg_threads: usize,
    /// Datapath retransmission timeout in microseconds.
    /// Default: 5000 (5 ms)
    pub rto_us: u64,
    /// Period of the packet-loss scan over active RPCs, in microseconds.
    /// Default: 500
    pub pkt_loss_scan_us: u64,
    /// Session-management request timeout in milliseconds.
    /// Default: 100 (use 10 in tests)
    pub sm_timeout_ms: u64,
    /// Number of rollbacks on a single sslot after which the session is
    /// declared failed and reset.
    /// Default: 8
    pub session_failure_re_tx_limit: usize,
    /// Enable Timely rate updates from RTT samples.
    /// Default: true
    pub enable_cc: bool,
    /// Enable the pacing wheel. When disabled all packets bypass the wheel.
    /// Default: false
    pub enable_pacing: bool,
    /// Allow uncongested sessions to bypass the wheel even when pacing is on.
    /// Default: true
    pub cc_opt_wheel_bypass: bool,
    /// Sample the TX timestamp once per burst instead of once per packet.
    /// Default: true
    pub cc_opt_batch_tsc: bool,
    /// Width of one pacing-wheel slot in microseconds.
    /// Default: 0.5
    pub wheel_slot_width_us: f64,
    /// Initial hugepage reservation for the message-buffer arena, in bytes.
    /// Default: 8 MiB
    pub initial_alloc_size: usize,
    /// Enable testing knobs (fault injection). Off in production.
    /// Default: false
    pub testing: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            sm_bind_ip: "127.0.0.1".to_string(),
            sm_udp_port: 0,
            num_bg_threads: 0,
            rto_us: 5000,
            pkt_loss_scan_us: 500,
            sm_timeout_ms: 100,
            session_failure_re_tx_limit: 8,
            enable_cc: true,
            enable_pacing: false,
            cc_opt_wheel_bypass: true,
            cc_opt_batch_tsc: true,
            wheel_slot_width_us: 0.5,
            initial_alloc_size: 8 * 1024 * 1024,
            testing: false,
        }
    }
}

impl RpcConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session-management UDP port.
    pub fn with_sm_udp_port(mut self, port: u16) -> Self {
        self.sm_udp_port = port;
        self
    }

    /// Set the number of background threads.
    pub fn with_bg_threads(mut self, n: usize) -> Self {
        self.num_bg_threads = n;
        self
    }

    /// Set the retransmission timeout.
    pub fn with_rto_us(mut self, rto_us: u64) -> Self {
        self.rto_us = rto_us;
        self
    }

    /// Set the packet-loss scan period.
    pub fn with_pkt_loss_scan_us(mut self, us: u64) -> Self {
        self.pkt_loss_scan_us = us;
        self
    }

    /// Set the session-management timeout.
    pub fn with_sm_timeout_ms(mut self, ms: u64) -> Self {
        self.sm_timeout_ms = ms;
        self
    }

    /// Set the rollback limit that escalates to a session reset.
    pub fn with_session_failure_re_tx_limit(mut self, n: usize) -> Self {
        self.session_failure_re_tx_limit = n;
        self
    }

    /// Enable or disable Timely congestion control.
    pub fn with_cc(mut self, enable: bool) -> Self {
        self.enable_cc = enable;
        self
    }

    /// Enable or disable the pacing wheel.
    pub fn with_pacing(mut self, enable: bool) -> Self {
        self.enable_pacing = enable;
        self
    }

    /// Enable or disable testing knobs (fault injection).
    pub fn with_testing(mut self, testing: bool) -> Self {
        self.testing = testing;
        self
    }

    /// Set the initial arena reservation.
    pub fn with_initial_alloc_size(mut self, bytes: usize) -> Self {
        self.initial_alloc_size = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = RpcConfig::default()
            .with_bg_threads(2)
            .with_rto_us(2000)
            .with_sm_timeout_ms(10)
            .with_pacing(true)
            .with_testing(true);

        assert_eq!(config.num_bg_threads, 2);
        assert_eq!(config.rto_us, 2000);
        assert_eq!(config.sm_timeout_ms, 10);
        assert!(config.enable_pacing);
        assert!(config.testing);
    }
}
