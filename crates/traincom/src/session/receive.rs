use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

use mio::{Events, Token};
use tracing::{debug, trace, warn};
use traincom_wire::{HEADER_SIZE, MAX_PD_PACKET, MsgType, PdHeader, WireError, check};

use crate::{
    arena::EndpointId,
    element::{PktFlags, PrivFlags, SeqVerdict},
    error::PdError,
    event::PdInfo,
    session::{PdSession, send::topo_mismatch},
    stats::{GLOBAL_STATISTICS_COMID, STATISTICS_PULL_COMID},
    time::Nanos,
};

impl PdSession {
    /// Blocks for at most `timeout` on the session poll. The only
    /// suspension point of the engine; everything else runs to completion.
    pub fn poll_io(
        &mut self,
        events: &mut Events,
        timeout: Option<std::time::Duration>,
    ) -> io::Result<()> {
        self.poll.poll(events, timeout)
    }

    /// Drains every socket the poll reported readable. Readiness is
    /// edge-style, so each socket is read until it blocks; routine
    /// classifications (no subscriber, no data) stay quiet, everything
    /// else is logged at warning level.
    pub fn check_listen_socks(&mut self, events: &Events, now: Nanos) {
        for event in events.iter() {
            if !event.is_readable() {
                continue;
            }
            let token = event.token();
            loop {
                match self.receive(token, now) {
                    Ok(()) => {}
                    Err(PdError::Block) => break,
                    Err(PdError::Param | PdError::Io) => {
                        // Stale token or broken socket: nothing more to
                        // drain here.
                        warn!(token = token.0, "pd socket unusable");
                        break;
                    }
                    Err(err) if err.is_quiet() => {}
                    Err(err) => warn!(?err, token = token.0, "pd receive"),
                }
            }
        }
    }

    /// Processes exactly one frame off the socket behind `token`.
    pub fn receive(&mut self, token: Token, now: Nanos) -> Result<(), PdError> {
        // 1. Read into the session scratch.
        let (len, src, delivered_to) = {
            let slot = self.sockets.get(token.0).ok_or(PdError::Param)?;
            let (len, src_addr) = match slot.sock.recv_from(&mut self.rx_scratch) {
                Ok(ok) => ok,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(PdError::Block);
                }
                Err(err) => {
                    warn!(?err, token = token.0, "pd recv failed");
                    return Err(PdError::Io);
                }
            };
            let SocketAddr::V4(src) = src_addr else {
                trace!("non-ipv4 datagram ignored");
                return Ok(());
            };
            (len, src, slot.delivered_to(self.cfg.own_ip))
        };

        // 2. Validate.
        let header = match check(&self.rx_scratch[..len]) {
            Ok(header) => header,
            Err(WireError::BadFcs) => {
                self.counters.num_crc_err += 1;
                return Err(PdError::Crc);
            }
            Err(err) => {
                trace!(?err, "malformed pd frame");
                self.counters.num_prot_err += 1;
                return Err(PdError::Wire);
            }
        };
        self.counters.num_rcv += 1;

        // 3. Session-level topology gate.
        if topo_mismatch(self.cfg.etb_topo_cnt, header.etb_topo_cnt)
            || topo_mismatch(self.cfg.op_trn_topo_cnt, header.op_trn_topo_cnt)
        {
            self.counters.num_topo_err += 1;
            return Err(PdError::Topo);
        }

        // 4. Pull requests are routed to the matching publisher.
        if header.msg_type == MsgType::Pr {
            return self.handle_pull_request(&header, src, now);
        }
        if header.msg_type == MsgType::Pe {
            // Error notifications are counted but carry nothing to
            // deliver.
            trace!(com_id = header.com_id, "pe frame dropped");
            return Ok(());
        }

        // 5. Subscription match.
        let Some(id) = self.find_subscriber(header.com_id, delivered_to, *src.ip()) else {
            self.counters.num_no_subs += 1;
            return Err(PdError::NoSub);
        };

        let Some((inform, result)) = self.vet_and_update(id, &header, src, delivered_to, now)?
        else {
            // Duplicate or stale frame: dropped without a swap, no error.
            return Ok(());
        };

        // 11. Swap: the subscriber takes the validated frame, the scratch
        // inherits its old buffer.
        {
            let ep = self.arena.get_mut(id).expect("matched subscriber");
            std::mem::swap(&mut ep.frame, &mut self.rx_scratch);
            ep.frame.truncate(len);
            self.rx_scratch.resize(MAX_PD_PACKET, 0);
        }

        // 12. Callback with a PdInfo built from the accepted frame.
        if inform {
            let user_ref = self.arena.get(id).map_or(0, |ep| ep.user_ref);
            let info =
                PdInfo::from_header(&header, *src.ip(), delivered_to, user_ref, result);
            self.notify(id, info);
        }
        result
    }

    /// Steps 6-10: subscriber topology gate, sequence discipline, change
    /// detection and bookkeeping.
    ///
    /// Returns `Ok(Some((inform, result)))` when the frame is taken (the
    /// caller swaps it in, even on a topology mismatch), `Ok(None)` for a
    /// quietly dropped duplicate, `Err` when the frame is dropped with a
    /// classification.
    fn vet_and_update(
        &mut self,
        id: EndpointId,
        header: &PdHeader,
        src: SocketAddrV4,
        delivered_to: Ipv4Addr,
        now: Nanos,
    ) -> Result<Option<(bool, Result<(), PdError>)>, PdError> {
        let ep = self.arena.get_mut(id).expect("matched subscriber");
        let src_ip = *src.ip();

        // 6. Subscriber topology gate: (0,0) accepts anything, otherwise
        // the frame must match exactly. A failure is still swapped in and
        // announced.
        let stored = (ep.spec.etb_topo_cnt, ep.spec.op_trn_topo_cnt);
        if stored != (0, 0)
            && (stored.0 != header.etb_topo_cnt || stored.1 != header.op_trn_topo_cnt)
        {
            self.counters.num_topo_err += 1;
            ep.last_err = Some(PdError::Topo);
            let inform = ep.pkt_flags.contains(PktFlags::CALLBACK);
            return Ok(Some((inform, Err(PdError::Topo))));
        }

        // 7. Sequence discipline, tracked per (source, message type).
        if header.sequence_counter == 0 {
            // Counter restart: forget the source and accept as new.
            ep.seq_tracker.reset(src_ip, header.msg_type);
        }
        match ep.seq_tracker.check(src_ip, header.msg_type, header.sequence_counter)? {
            SeqVerdict::Fresh => {}
            SeqVerdict::Stale => {
                trace!(
                    com_id = header.com_id,
                    seq = header.sequence_counter,
                    %src_ip,
                    "duplicate or stale frame dropped"
                );
                return Ok(None);
            }
        }

        // Gap accounting against the last accepted counter; a restarted
        // counter (zero) starts a fresh span instead of booking a wrap.
        let new_seq = header.sequence_counter;
        if new_seq != 0 {
            let cur = ep.seq_in;
            if u64::from(new_seq) > u64::from(cur) + 1 {
                let gap = u64::from(new_seq - cur - 1);
                ep.num_missed += gap;
                self.counters.num_missed += gap;
            } else if new_seq < cur {
                let wrapped = u64::from(u32::MAX - cur) + u64::from(new_seq);
                ep.num_missed += wrapped;
                self.counters.num_missed += wrapped;
            }
        }
        ep.seq_in = new_seq;

        // 8. Sizes follow the validated dataset length.
        let new_size = header.dataset_length as usize;

        // 9. Change detection governs the callback.
        let mut inform = false;
        if ep.pkt_flags.contains(PktFlags::CALLBACK) {
            if ep.pkt_flags.contains(PktFlags::FORCE_CB)
                || ep.priv_flags.contains(PrivFlags::TIMED_OUT)
            {
                // First frame after a timeout episode always notifies.
                inform = true;
            } else {
                let fresh = &self.rx_scratch[HEADER_SIZE..HEADER_SIZE + new_size];
                inform = fresh != ep.payload();
            }
        }
        ep.data_size = new_size;

        // 10. Re-arm the watchdog and refresh bookkeeping.
        if !ep.interval.is_zero() {
            ep.time_to_go = Some(now + ep.interval);
        }
        ep.num_rx_tx += 1;
        ep.priv_flags.remove(PrivFlags::TIMED_OUT | PrivFlags::INVALID_DATA);
        ep.last_err = None;
        ep.last_src = Some(src_ip);
        ep.last_dest = Some(delivered_to);

        Ok(Some((inform, Ok(()))))
    }

    /// Step 4 of the receive path: a PR frame triggers one PP emission
    /// from the matching publisher within this event turn.
    fn handle_pull_request(
        &mut self,
        header: &PdHeader,
        src: SocketAddrV4,
        now: Nanos,
    ) -> Result<(), PdError> {
        let publisher = if header.com_id == STATISTICS_PULL_COMID {
            let Some(id) = self.find_publisher(GLOBAL_STATISTICS_COMID) else {
                trace!("statistics pull without a published statistics element");
                return Err(PdError::NoSub);
            };
            // The distinguished case: refresh the reply element with a
            // counter snapshot addressed at the requester.
            let snapshot = self.statistics(now).encode();
            let reply_dest = pick_reply_dest(header.reply_ip, src, self.cfg.port);
            let ep = self.arena.get_mut(id).expect("publisher just found");
            ep.spec.dest = reply_dest;
            ep.msg_type = MsgType::Pp;
            ep.put(None, Some(&snapshot))?;
            id
        } else {
            let reply_com_id = if header.reply_com_id != 0 {
                header.reply_com_id
            } else {
                header.com_id
            };
            let Some(id) = self.find_publisher(reply_com_id) else {
                trace!(reply_com_id, "pull request without matching publisher");
                return Err(PdError::NoSub);
            };
            id
        };

        {
            let reply_dest = pick_reply_dest(header.reply_ip, src, self.cfg.port);
            let ep = self.arena.get_mut(publisher).expect("publisher alive");
            ep.pull_reply_dest = Some(reply_dest);
            ep.priv_flags.insert(PrivFlags::REQ_2B_SENT);
        }
        debug!(com_id = header.com_id, %src, "pull request served");

        // The reply must leave within this event turn.
        if let Err(err) = self.send_due(now) {
            debug!(?err, "send pass after pull request");
        }
        Ok(())
    }
}

/// An explicitly named reply address is answered on the well-known PD
/// port; without one the reply goes straight back to the request's source
/// endpoint.
fn pick_reply_dest(reply_ip: Ipv4Addr, src: SocketAddrV4, pd_port: u16) -> SocketAddrV4 {
    if reply_ip.is_unspecified() {
        src
    } else {
        SocketAddrV4::new(reply_ip, pd_port)
    }
}
