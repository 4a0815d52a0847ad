use std::net::Ipv4Addr;

use serde::Deserialize;

/// Default PD port of the reference deployment.
pub const DEFAULT_PD_PORT: u16 = 17224;

/// Default type-of-service class for PD traffic.
pub const DEFAULT_QOS: u8 = 5;

/// Default time-to-live for unicast and multicast sends.
pub const DEFAULT_TTL: u8 = 64;

/// Default capacity of the per-subscriber sequence tracker.
pub const DEFAULT_SEQ_TRACKER_CAP: usize = 64;

/// Session-wide settings. Deserializable so deployments can ship it as a
/// config file; every field but `own_ip` has a sensible default.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Interface address this session sends from and listens on.
    pub own_ip: Ipv4Addr,
    /// UDP port for PD traffic. Port 0 binds ephemerally (tests).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Train-backbone topology counter, 0 = local/wildcard.
    #[serde(default)]
    pub etb_topo_cnt: u32,
    /// Operational-train topology counter, 0 = local/wildcard.
    #[serde(default)]
    pub op_trn_topo_cnt: u32,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_ttl")]
    pub ttl: u8,
    /// Bound on distinct (source, message type) pairs tracked per
    /// subscriber before `Mem` is surfaced.
    #[serde(default = "default_seq_tracker_cap")]
    pub seq_tracker_cap: usize,
}

fn default_port() -> u16 {
    DEFAULT_PD_PORT
}

fn default_qos() -> u8 {
    DEFAULT_QOS
}

fn default_ttl() -> u8 {
    DEFAULT_TTL
}

fn default_seq_tracker_cap() -> usize {
    DEFAULT_SEQ_TRACKER_CAP
}

impl SessionConfig {
    pub fn new(own_ip: Ipv4Addr) -> Self {
        Self {
            own_ip,
            port: DEFAULT_PD_PORT,
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
            qos: DEFAULT_QOS,
            ttl: DEFAULT_TTL,
            seq_tracker_cap: DEFAULT_SEQ_TRACKER_CAP,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_topo_counts(mut self, etb: u32, op_trn: u32) -> Self {
        self.etb_topo_cnt = etb;
        self.op_trn_topo_cnt = op_trn;
        self
    }
}
