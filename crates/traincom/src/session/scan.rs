use std::net::Ipv4Addr;

use tracing::debug;
use traincom_wire::{MsgType, PROTO_VERSION, PdHeader};

use crate::{
    element::PrivFlags,
    error::PdError,
    event::PdInfo,
    session::PdSession,
    stats::GLOBAL_STATISTICS_COMID,
    time::Nanos,
};

impl PdSession {
    /// Marks every subscriber whose watchdog expired and delivers exactly
    /// one timeout notification per episode. The subscription stays; a
    /// later fresh frame clears the latch (and always notifies).
    pub fn handle_timeouts(&mut self, now: Nanos) {
        for i in 0..self.rcv_queue.len() {
            let id = self.rcv_queue[i];
            let Some(ep) = self.arena.get_mut(id) else {
                continue;
            };
            if ep.interval.is_zero()
                || ep.spec.com_id == GLOBAL_STATISTICS_COMID
                || ep.priv_flags.contains(PrivFlags::TIMED_OUT)
            {
                continue;
            }
            let Some(due) = ep.time_to_go else {
                continue;
            };
            if due > now {
                continue;
            }

            self.counters.num_timeout += 1;
            ep.last_err = Some(PdError::Timeout);
            ep.priv_flags.insert(PrivFlags::TIMED_OUT);

            // Notification carries the stale frame when one was ever
            // received, a zeroed view otherwise.
            let user_ref = ep.user_ref;
            let src = ep.last_src.unwrap_or(Ipv4Addr::UNSPECIFIED);
            let dest = ep.last_dest.unwrap_or(Ipv4Addr::UNSPECIFIED);
            let info = match PdHeader::decode(&ep.frame) {
                Ok(header) => {
                    PdInfo::from_header(&header, src, dest, user_ref, Err(PdError::Timeout))
                }
                Err(_) => PdInfo {
                    com_id: ep.spec.com_id,
                    src,
                    dest,
                    etb_topo_cnt: 0,
                    op_trn_topo_cnt: 0,
                    msg_type: MsgType::Pd,
                    seq: 0,
                    proto_version: PROTO_VERSION,
                    reply_com_id: 0,
                    reply_ip: Ipv4Addr::UNSPECIFIED,
                    user_ref,
                    result: Err(PdError::Timeout),
                },
            };
            debug!(com_id = info.com_id, "subscriber timed out");
            self.notify(id, info);
        }
    }

    /// Rebuilds the earliest pending deadline across both queues. Timed
    /// out subscribers and pull-only elements have nothing scheduled and
    /// are skipped; socket readiness is watched by the session poll, not
    /// here.
    pub fn check_pending(&mut self) -> Option<Nanos> {
        let mut next: Option<Nanos> = None;
        for &id in self.snd_queue.iter().chain(self.rcv_queue.iter()) {
            let Some(ep) = self.arena.get(id) else {
                continue;
            };
            if ep.interval.is_zero() || ep.priv_flags.contains(PrivFlags::TIMED_OUT) {
                continue;
            }
            if let Some(due) = ep.time_to_go {
                next = Some(next.map_or(due, |n| n.min(due)));
            }
        }
        self.next_job = next;
        next
    }

    /// Bounded wait for the application's poll call: time until the next
    /// deadline, capped by `max_wait` so external registrations become
    /// visible promptly.
    pub fn poll_timeout(&self, now: Nanos, max_wait: Nanos) -> std::time::Duration {
        match self.next_job {
            Some(due) => due.saturating_sub(now).min(max_wait).into(),
            None => max_wait.into(),
        }
    }
}
