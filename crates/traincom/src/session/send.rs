use std::net::SocketAddrV4;

use tracing::{debug, trace, warn};
use traincom_wire::{MsgType, PdHeader, set_msg_type, set_sequence, write_fcs};

use crate::{
    arena::EndpointId,
    element::{Endpoint, PktFlags, PrivFlags},
    error::PdError,
    event::PdInfo,
    session::PdSession,
    time::Nanos,
};

/// Outcome of the per-element planning step, computed under the element
/// borrow and acted on afterwards.
enum Action {
    /// Not due; leave untouched.
    Idle,
    /// Due but nothing leaves the wire (invalid data, redundant, topology
    /// mismatch, unbound socket); carries the classification if any.
    Suppressed(Option<PdError>),
    Emit { socket: usize, dest: SocketAddrV4, header: PdHeader },
}

impl PdSession {
    /// Walks the send queue once, emitting every due element. Errors are
    /// recorded per element and the walk continues; the last non-ok
    /// classification is returned.
    pub fn send_due(&mut self, now: Nanos) -> Result<(), PdError> {
        let mut result = Ok(());
        let mut i = 0;
        while i < self.snd_queue.len() {
            let id = self.snd_queue[i];
            if self.arena.get(id).is_none() {
                self.snd_queue.remove(i);
                continue;
            }

            let (action, was_pull_reply) = self.plan_emission(id, now);

            match action {
                Action::Idle => {
                    i += 1;
                    continue;
                }
                Action::Suppressed(err) => {
                    if let Some(err) = err {
                        result = Err(err);
                    }
                }
                Action::Emit { socket, dest, header } => {
                    let info_src = self.cfg.own_ip;
                    let user_ref = self.arena.get(id).map_or(0, |ep| ep.user_ref);
                    let info =
                        PdInfo::from_header(&header, info_src, *dest.ip(), user_ref, Ok(()));
                    self.notify(id, info);

                    match self.transmit(id, socket, dest) {
                        Ok(sent) => {
                            trace!(com_id = header.com_id, seq = header.sequence_counter,
                                   %dest, sent, "pd emitted");
                            self.counters.num_send += 1;
                            if let Some(ep) = self.arena.get_mut(id) {
                                ep.num_rx_tx += 1;
                            }
                        }
                        Err(err) => {
                            warn!(com_id = header.com_id, %dest, ?err, "pd send failed");
                            if let Some(ep) = self.arena.get_mut(id) {
                                ep.last_err = Some(PdError::Io);
                            }
                            result = Err(PdError::Io);
                        }
                    }
                }
            }

            let remove = self.advance_timer(id, now, was_pull_reply);
            if remove {
                self.snd_queue.remove(i);
                let _ = self.release_endpoint(id);
                debug!("pull request retired");
            } else {
                i += 1;
            }
        }
        result
    }

    /// Eligibility, sequence stamping and the topology gate for one
    /// element. Returns the action plus whether this emission is a pull
    /// reply borrowed from a cyclic publisher.
    fn plan_emission(&mut self, id: EndpointId, now: Nanos) -> (Action, bool) {
        let session_topo = (self.cfg.etb_topo_cnt, self.cfg.op_trn_topo_cnt);
        let Some(ep) = self.arena.get_mut(id) else {
            return (Action::Idle, false);
        };

        let cyclic_due =
            !ep.interval.is_zero() && ep.time_to_go.is_some_and(|t| t <= now);
        let requested = ep.priv_flags.contains(PrivFlags::REQ_2B_SENT);
        if !cyclic_due && !requested {
            return (Action::Idle, false);
        }

        if ep.priv_flags.contains(PrivFlags::INVALID_DATA) {
            return (Action::Suppressed(None), false);
        }

        // A pull request against a cyclic publisher borrows the element
        // for one PP emission; the type is restored by the timer step.
        let was_pull_reply = requested && ep.msg_type == MsgType::Pd;
        if was_pull_reply {
            ep.msg_type = MsgType::Pp;
        }

        let seq = update_outgoing(ep);

        let stamped = (ep.spec.etb_topo_cnt, ep.spec.op_trn_topo_cnt);
        if topo_mismatch(session_topo.0, stamped.0) || topo_mismatch(session_topo.1, stamped.1)
        {
            ep.last_err = Some(PdError::Topo);
            self.counters.num_topo_err += 1;
            return (Action::Suppressed(Some(PdError::Topo)), was_pull_reply);
        }

        let Some(socket) = ep.socket else {
            warn!(com_id = ep.spec.com_id, "publisher without socket, skipped");
            return (Action::Suppressed(None), was_pull_reply);
        };

        if ep.pkt_flags.contains(PktFlags::REDUNDANT) {
            return (Action::Suppressed(None), was_pull_reply);
        }

        let dest = if requested {
            ep.pull_reply_dest.take().unwrap_or(ep.spec.dest)
        } else {
            ep.spec.dest
        };

        let mut header = PdHeader::decode(&ep.frame).expect("own frame is well-formed");
        header.sequence_counter = seq;
        (Action::Emit { socket, dest, header }, was_pull_reply)
    }

    fn transmit(
        &self,
        id: EndpointId,
        socket: usize,
        dest: SocketAddrV4,
    ) -> std::io::Result<usize> {
        let ep = self.arena.get(id).expect("endpoint alive");
        let slot = self
            .sockets
            .get(socket)
            .ok_or_else(|| std::io::Error::other("socket slot vanished"))?;
        slot.sock.send_to(&ep.frame, std::net::SocketAddr::V4(dest))
    }

    /// Timer advance and one-shot retirement; returns whether the element
    /// must be removed (pull request after its single emission).
    fn advance_timer(
        &mut self,
        id: EndpointId,
        now: Nanos,
        was_pull_reply: bool,
    ) -> bool {
        let Some(ep) = self.arena.get_mut(id) else {
            return false;
        };
        if was_pull_reply {
            // The reply was extra; the cyclic schedule is untouched.
            ep.msg_type = MsgType::Pd;
        } else if !ep.interval.is_zero() && ep.time_to_go.is_some_and(|t| t <= now) {
            let advanced = ep.time_to_go.expect("checked above") + ep.interval;
            // More than one interval late: snap forward instead of
            // emitting a catch-up burst.
            ep.time_to_go =
                Some(if advanced <= now { now + ep.interval } else { advanced });
        }
        ep.priv_flags.remove(PrivFlags::REQ_2B_SENT);
        ep.msg_type == MsgType::Pr
    }

    /// Respaces the send times of all cyclic publishers across the
    /// smallest interval so telegrams do not cluster. Runs after every
    /// publish/unpublish; a queue with fewer than two cyclic elements is
    /// left alone.
    pub fn distribute(&mut self) {
        let mut items: Vec<(EndpointId, Nanos, Nanos)> = Vec::new();
        for &id in &self.snd_queue {
            if let Some(ep) = self.arena.get(id) {
                if !ep.interval.is_zero() {
                    if let Some(ttg) = ep.time_to_go {
                        items.push((id, ep.interval, ttg));
                    }
                }
            }
        }

        let mut slots: Vec<(Nanos, Nanos)> =
            items.iter().map(|(_, interval, ttg)| (*interval, *ttg)).collect();
        respace(&mut slots);

        for ((id, _, _), (_, shaped)) in items.iter().zip(&slots) {
            if let Some(ep) = self.arena.get_mut(*id) {
                ep.time_to_go = Some(*shaped);
            }
        }
    }
}

/// Advances the per-type sequence counter and restamps type, counter and
/// FCS into the element's frame.
fn update_outgoing(ep: &mut Endpoint) -> u32 {
    let seq = if ep.msg_type == MsgType::Pp {
        ep.seq_out_pull = ep.seq_out_pull.wrapping_add(1);
        ep.seq_out_pull
    } else {
        ep.seq_out = ep.seq_out.wrapping_add(1);
        ep.seq_out
    };
    set_msg_type(&mut ep.frame, ep.msg_type);
    set_sequence(&mut ep.frame, seq);
    write_fcs(&mut ep.frame);
    seq
}

/// Both counters nonzero and different is the only failing combination;
/// zero on either side is a wildcard.
pub(crate) fn topo_mismatch(ours: u32, theirs: u32) -> bool {
    ours != 0 && theirs != 0 && ours != theirs
}

/// The shaping rule: slot = smallest interval / element count; element `i`
/// moves to `t_null + slot * i` unless twice that shift exceeds its own
/// interval (a shaped send must stay within half its period or it risks a
/// missed deadline).
fn respace(items: &mut [(Nanos, Nanos)]) {
    let count = items.len() as u64;
    if count < 2 {
        return;
    }
    let delta_t_max = items.iter().map(|(interval, _)| *interval).min().expect("non-empty");
    if delta_t_max.is_zero() {
        return;
    }
    let t_null = items.iter().map(|(_, ttg)| *ttg).max().expect("non-empty");
    let slot = delta_t_max / count;

    for (idx, (interval, ttg)) in items.iter_mut().enumerate() {
        let shift = slot * idx as u64;
        if shift * 2 > *interval {
            continue;
        }
        *ttg = t_null + shift;
    }
}
