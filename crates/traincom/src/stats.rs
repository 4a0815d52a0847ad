use std::net::Ipv4Addr;

use crate::error::PdError;

/// Version stamped into the statistics snapshot (major.minor in the upper
/// half-words).
pub const STATS_VERSION: u32 = 0x0001_0000;

/// ComID that requests a statistics snapshot.
pub const STATISTICS_PULL_COMID: u32 = 31;

/// ComID of the statistics reply telegram.
pub const GLOBAL_STATISTICS_COMID: u32 = 35;

/// Aggregate PD counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PdCounters {
    /// Telegrams handed to the transport.
    pub num_send: u64,
    /// Frames that passed the wire check.
    pub num_rcv: u64,
    /// Frames dropped for an FCS mismatch.
    pub num_crc_err: u64,
    /// Frames dropped as structurally malformed.
    pub num_prot_err: u64,
    /// Frames dropped or flagged for topology disagreement.
    pub num_topo_err: u64,
    /// Subscriber watchdog episodes.
    pub num_timeout: u64,
    /// Valid frames nobody subscribed to.
    pub num_no_subs: u64,
    /// Sequence gaps accumulated across subscribers.
    pub num_missed: u64,
}

/// Snapshot answering a statistics pull, marshalled to a fixed
/// network-byte-order layout so any node can decode it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdStatistics {
    pub version: u32,
    pub uptime_secs: u32,
    pub own_ip: Ipv4Addr,
    pub etb_topo_cnt: u32,
    pub op_trn_topo_cnt: u32,
    pub counters: PdCounters,
    pub num_publishers: u32,
    pub num_subscribers: u32,
}

impl PdStatistics {
    /// Serialized snapshot size.
    pub const WIRE_SIZE: usize = 60;

    /// Marshal the snapshot in network byte order.
    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let c = &self.counters;
        let mut buf = [0u8; Self::WIRE_SIZE];
        let words = [
            self.version,
            self.uptime_secs,
            u32::from(self.own_ip),
            self.etb_topo_cnt,
            self.op_trn_topo_cnt,
            clamp32(c.num_send),
            clamp32(c.num_rcv),
            clamp32(c.num_crc_err),
            clamp32(c.num_prot_err),
            clamp32(c.num_topo_err),
            clamp32(c.num_timeout),
            clamp32(c.num_no_subs),
            clamp32(c.num_missed),
            self.num_publishers,
            self.num_subscribers,
        ];
        for (i, w) in words.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&w.to_be_bytes());
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PdError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(PdError::Wire);
        }
        let word = |i: usize| {
            u32::from_be_bytes(buf[i * 4..i * 4 + 4].try_into().expect("4-byte slice"))
        };
        Ok(Self {
            version: word(0),
            uptime_secs: word(1),
            own_ip: Ipv4Addr::from(word(2)),
            etb_topo_cnt: word(3),
            op_trn_topo_cnt: word(4),
            counters: PdCounters {
                num_send: word(5) as u64,
                num_rcv: word(6) as u64,
                num_crc_err: word(7) as u64,
                num_prot_err: word(8) as u64,
                num_topo_err: word(9) as u64,
                num_timeout: word(10) as u64,
                num_no_subs: word(11) as u64,
                num_missed: word(12) as u64,
            },
            num_publishers: word(13),
            num_subscribers: word(14),
        })
    }
}

fn clamp32(v: u64) -> u32 {
    v.min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_roundtrip() {
        let stats = PdStatistics {
            version: STATS_VERSION,
            uptime_secs: 3600,
            own_ip: Ipv4Addr::new(10, 0, 0, 1),
            etb_topo_cnt: 2,
            op_trn_topo_cnt: 9,
            counters: PdCounters {
                num_send: 100,
                num_rcv: 200,
                num_crc_err: 1,
                num_prot_err: 2,
                num_topo_err: 3,
                num_timeout: 4,
                num_no_subs: 5,
                num_missed: 6,
            },
            num_publishers: 2,
            num_subscribers: 3,
        };
        let wire = stats.encode();
        assert_eq!(PdStatistics::decode(&wire).unwrap(), stats);
    }

    #[test]
    fn short_buffer_rejected() {
        assert_eq!(
            PdStatistics::decode(&[0u8; PdStatistics::WIRE_SIZE - 1]),
            Err(PdError::Wire)
        );
    }
}
