use std::net::{Ipv4Addr, SocketAddrV4};

use bitflags::bitflags;
use traincom_wire::{HEADER_SIZE, MAX_PD_DATA, MsgType, gross_size, set_dataset_length};

use crate::{error::PdError, event::{Marshaller, PdCallback}, time::Nanos};

bitflags! {
    /// Application-visible endpoint options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PktFlags: u8 {
        /// Deliver received data / emission notices through the callback.
        const CALLBACK = 0x01;
        /// Route payloads through the session marshaller.
        const MARSHALL = 0x02;
        /// Fire the callback on every frame, not only on change.
        const FORCE_CB = 0x04;
        /// Silent publisher while a redundancy peer leads.
        const REDUNDANT = 0x08;
    }

    /// Engine-internal element state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct PrivFlags: u8 {
        /// No valid payload yet; the sender must not emit this element.
        const INVALID_DATA = 0x01;
        /// Watchdog fired; cleared by the next accepted frame.
        const TIMED_OUT = 0x02;
        /// Emit on the next sender pass regardless of the cycle timer.
        const REQ_2B_SENT = 0x04;
    }
}

/// Addressing of one telegram stream.
///
/// Subscription matching keys on `com_id`, the delivering destination
/// address and the optional source filter; topology counters are
/// validated, never keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpec {
    pub com_id: u32,
    pub etb_topo_cnt: u32,
    pub op_trn_topo_cnt: u32,
    /// Only accept frames from this source when set.
    pub src: Option<Ipv4Addr>,
    /// Publisher: where to send. Subscriber: unicast own address or the
    /// multicast group to join; `0.0.0.0` matches any delivery address.
    pub dest: SocketAddrV4,
    pub qos: u8,
    pub ttl: u8,
}

impl AddressSpec {
    pub fn new(com_id: u32, dest: SocketAddrV4) -> Self {
        Self {
            com_id,
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
            src: None,
            dest,
            qos: crate::config::DEFAULT_QOS,
            ttl: crate::config::DEFAULT_TTL,
        }
    }

    pub fn with_topo_counts(mut self, etb: u32, op_trn: u32) -> Self {
        self.etb_topo_cnt = etb;
        self.op_trn_topo_cnt = op_trn;
        self
    }

    pub fn with_src_filter(mut self, src: Ipv4Addr) -> Self {
        self.src = Some(src);
        self
    }
}

/// Verdict of the per-source sequence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SeqVerdict {
    /// Strictly newer than anything seen from this source and type.
    Fresh,
    /// Duplicate or older than the last accepted counter.
    Stale,
}

/// Bounded last-seen sequence map, keyed by (source, message type).
///
/// The cap guards against unbounded growth on busy networks; hitting it
/// surfaces `Mem` so operators can raise the limit.
#[derive(Debug)]
pub(crate) struct SeqTracker {
    entries: Vec<(Ipv4Addr, MsgType, u32)>,
    cap: usize,
}

impl SeqTracker {
    pub(crate) fn new(cap: usize) -> Self {
        Self { entries: Vec::new(), cap }
    }

    /// Forget a source, e.g. when its counter restarts at zero.
    pub(crate) fn reset(&mut self, src: Ipv4Addr, msg_type: MsgType) {
        self.entries.retain(|(s, t, _)| !(*s == src && *t == msg_type));
    }

    pub(crate) fn check(
        &mut self,
        src: Ipv4Addr,
        msg_type: MsgType,
        seq: u32,
    ) -> Result<SeqVerdict, PdError> {
        match self.entries.iter_mut().find(|(s, t, _)| *s == src && *t == msg_type) {
            Some((_, _, last)) => {
                if seq > *last {
                    *last = seq;
                    Ok(SeqVerdict::Fresh)
                } else {
                    Ok(SeqVerdict::Stale)
                }
            }
            None => {
                if self.entries.len() >= self.cap {
                    return Err(PdError::Mem);
                }
                self.entries.push((src, msg_type, seq));
                Ok(SeqVerdict::Fresh)
            }
        }
    }
}

/// One send- or receive-queue element: the per-endpoint record of a
/// published or subscribed ComID.
///
/// Owns its frame buffer (header + padded payload); the receive path swaps
/// the session scratch in here so the element always holds the most recent
/// validated frame.
pub(crate) struct Endpoint {
    pub spec: AddressSpec,
    /// One-shot destination override for the next emission (pull reply).
    pub pull_reply_dest: Option<SocketAddrV4>,
    /// Publisher: send cycle. Subscriber: timeout limit. ZERO disables
    /// cyclic scheduling and timeout supervision.
    pub interval: Nanos,
    /// Absolute next-due time (send or watchdog), `None` when unarmed.
    pub time_to_go: Option<Nanos>,
    pub pkt_flags: PktFlags,
    pub priv_flags: PrivFlags,
    pub msg_type: MsgType,
    pub frame: Vec<u8>,
    pub data_size: usize,
    /// Outgoing counters, kept separately per emitted type.
    pub seq_out: u32,
    pub seq_out_pull: u32,
    /// Last accepted incoming counter.
    pub seq_in: u32,
    pub seq_tracker: SeqTracker,
    pub upd_pkts: u64,
    pub get_pkts: u64,
    pub num_rx_tx: u64,
    pub num_missed: u64,
    pub last_err: Option<PdError>,
    pub last_src: Option<Ipv4Addr>,
    /// Address the last accepted frame was delivered to (group or
    /// unicast); the subscription key in `spec` is never narrowed by it.
    pub last_dest: Option<Ipv4Addr>,
    /// Index into the session socket table, `None` if unbound.
    pub socket: Option<usize>,
    pub callback: Option<Box<dyn PdCallback>>,
    pub user_ref: u32,
}

impl Endpoint {
    pub(crate) fn new(
        spec: AddressSpec,
        msg_type: MsgType,
        interval: Nanos,
        pkt_flags: PktFlags,
        user_ref: u32,
        seq_tracker_cap: usize,
    ) -> Self {
        Self {
            spec,
            pull_reply_dest: None,
            interval,
            time_to_go: None,
            pkt_flags,
            priv_flags: PrivFlags::INVALID_DATA,
            msg_type,
            frame: Vec::new(),
            data_size: 0,
            seq_out: 0,
            seq_out_pull: 0,
            seq_in: 0,
            seq_tracker: SeqTracker::new(seq_tracker_cap),
            upd_pkts: 0,
            get_pkts: 0,
            num_rx_tx: 0,
            num_missed: 0,
            last_err: None,
            last_src: None,
            last_dest: None,
            socket: None,
            callback: None,
            user_ref,
        }
    }

    /// Last valid payload bytes, clamped to the frame actually held (a
    /// swapped-in shorter frame never yields an out-of-bounds slice).
    pub(crate) fn payload(&self) -> &[u8] {
        let end = (HEADER_SIZE + self.data_size).min(self.frame.len());
        if end > HEADER_SIZE { &self.frame[HEADER_SIZE..end] } else { &[] }
    }

    /// Does a received frame belong to this subscription?
    pub(crate) fn matches_incoming(
        &self,
        com_id: u32,
        delivered_to: Ipv4Addr,
        src: Ipv4Addr,
    ) -> bool {
        if self.spec.com_id != com_id {
            return false;
        }
        let want = *self.spec.dest.ip();
        if !want.is_unspecified() && want != delivered_to {
            return false;
        }
        match self.spec.src {
            Some(filter) => filter == src,
            None => true,
        }
    }

    /// Updates the outgoing payload. `None` marks a data-less telegram as
    /// valid so publishers that never carry data still emit.
    pub(crate) fn put(
        &mut self,
        marshaller: Option<&mut (dyn Marshaller + '_)>,
        data: Option<&[u8]>,
    ) -> Result<(), PdError> {
        let Some(data) = data else {
            if self.data_size != 0 {
                return Err(PdError::Param);
            }
            self.priv_flags.remove(PrivFlags::INVALID_DATA);
            self.upd_pkts += 1;
            return Ok(());
        };
        if data.is_empty() && self.data_size == 0 {
            self.priv_flags.remove(PrivFlags::INVALID_DATA);
            self.upd_pkts += 1;
            return Ok(());
        }
        if data.len() > MAX_PD_DATA {
            return Err(PdError::Param);
        }

        // A buffer sized for an empty payload grows here; the header bytes
        // at the front are preserved by the resize.
        if self.frame.len() < gross_size(data.len()) {
            self.frame.resize(gross_size(data.len()), 0);
        }

        let written = match marshaller {
            Some(m) if self.pkt_flags.contains(PktFlags::MARSHALL) => {
                let dst = &mut self.frame[HEADER_SIZE..HEADER_SIZE + data.len()];
                m.marshall(self.spec.com_id, data, dst)?
            }
            _ => {
                self.frame[HEADER_SIZE..HEADER_SIZE + data.len()].copy_from_slice(data);
                data.len()
            }
        };
        if written > MAX_PD_DATA {
            return Err(PdError::Param);
        }

        self.data_size = written;
        self.frame.truncate(gross_size(written));
        // Pad octets must be zero on the wire.
        for b in &mut self.frame[HEADER_SIZE + written..] {
            *b = 0;
        }
        set_dataset_length(&mut self.frame, written as u32);

        self.priv_flags.remove(PrivFlags::INVALID_DATA);
        self.upd_pkts += 1;
        Ok(())
    }

    /// Copies (or unmarshalls) the last valid payload into `out`,
    /// returning the payload size.
    pub(crate) fn get(
        &mut self,
        marshaller: Option<&mut (dyn Marshaller + '_)>,
        out: &mut [u8],
    ) -> Result<usize, PdError> {
        if self.priv_flags.contains(PrivFlags::INVALID_DATA) {
            return Err(PdError::NoData);
        }
        if self.priv_flags.contains(PrivFlags::TIMED_OUT) {
            return Err(PdError::Timeout);
        }

        let size = match marshaller {
            Some(m) if self.pkt_flags.contains(PktFlags::MARSHALL) => {
                let payload = &self.frame[HEADER_SIZE..HEADER_SIZE + self.data_size];
                m.unmarshall(self.spec.com_id, payload, out)?
            }
            _ => {
                if out.len() < self.data_size {
                    return Err(PdError::Param);
                }
                out[..self.data_size]
                    .copy_from_slice(&self.frame[HEADER_SIZE..HEADER_SIZE + self.data_size]);
                self.data_size
            }
        };
        self.get_pkts += 1;
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(data: Option<&[u8]>) -> Endpoint {
        let spec = AddressSpec::new(1000, "10.0.0.5:17224".parse().unwrap());
        let mut ep = Endpoint::new(spec, MsgType::Pd, Nanos::from_millis(100), PktFlags::empty(), 0, 8);
        ep.frame = vec![0u8; gross_size(0)];
        if let Some(data) = data {
            ep.put(None, Some(data)).unwrap();
        }
        ep
    }

    #[test]
    fn put_get_roundtrip() {
        let mut ep = endpoint(Some(b"hello pd"));
        let mut out = [0u8; 64];
        let n = ep.get(None, &mut out).unwrap();
        assert_eq!(&out[..n], b"hello pd");
        assert_eq!(ep.upd_pkts, 1);
        assert_eq!(ep.get_pkts, 1);
    }

    #[test]
    fn dataless_put_marks_valid() {
        let mut ep = endpoint(None);
        assert!(ep.priv_flags.contains(PrivFlags::INVALID_DATA));
        ep.put(None, None).unwrap();
        assert!(!ep.priv_flags.contains(PrivFlags::INVALID_DATA));
        assert_eq!(ep.data_size, 0);
    }

    #[test]
    fn get_before_put_is_no_data() {
        let mut ep = endpoint(None);
        let mut out = [0u8; 4];
        assert_eq!(ep.get(None, &mut out), Err(PdError::NoData));
    }

    #[test]
    fn oversize_put_rejected() {
        let mut ep = endpoint(None);
        let big = vec![0u8; MAX_PD_DATA + 1];
        assert_eq!(ep.put(None, Some(&big)), Err(PdError::Param));
    }

    #[test]
    fn growing_put_preserves_header() {
        let mut ep = endpoint(None);
        ep.frame[0..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        ep.put(None, Some(&[1u8; 100])).unwrap();
        assert_eq!(&ep.frame[0..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(ep.frame.len(), gross_size(100));
    }

    #[test]
    fn seq_tracker_orders_per_source() {
        let a = Ipv4Addr::new(10, 0, 0, 1);
        let b = Ipv4Addr::new(10, 0, 0, 2);
        let mut tracker = SeqTracker::new(4);
        assert_eq!(tracker.check(a, MsgType::Pd, 5), Ok(SeqVerdict::Fresh));
        assert_eq!(tracker.check(a, MsgType::Pd, 5), Ok(SeqVerdict::Stale));
        assert_eq!(tracker.check(a, MsgType::Pd, 4), Ok(SeqVerdict::Stale));
        assert_eq!(tracker.check(a, MsgType::Pd, 6), Ok(SeqVerdict::Fresh));
        // Independent per source and per type.
        assert_eq!(tracker.check(b, MsgType::Pd, 1), Ok(SeqVerdict::Fresh));
        assert_eq!(tracker.check(a, MsgType::Pp, 1), Ok(SeqVerdict::Fresh));
    }

    #[test]
    fn seq_tracker_reset_accepts_restart() {
        let a = Ipv4Addr::new(10, 0, 0, 1);
        let mut tracker = SeqTracker::new(4);
        tracker.check(a, MsgType::Pd, 42).unwrap();
        tracker.reset(a, MsgType::Pd);
        assert_eq!(tracker.check(a, MsgType::Pd, 0), Ok(SeqVerdict::Fresh));
    }

    #[test]
    fn seq_tracker_cap_surfaces_mem() {
        let mut tracker = SeqTracker::new(2);
        tracker.check(Ipv4Addr::new(10, 0, 0, 1), MsgType::Pd, 1).unwrap();
        tracker.check(Ipv4Addr::new(10, 0, 0, 2), MsgType::Pd, 1).unwrap();
        assert_eq!(
            tracker.check(Ipv4Addr::new(10, 0, 0, 3), MsgType::Pd, 1),
            Err(PdError::Mem)
        );
    }
}
