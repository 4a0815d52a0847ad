mod receive;
mod scan;
mod send;

use std::{io, net::Ipv4Addr};

use mio::Poll;
use tracing::debug;
use traincom_wire::{MAX_PD_PACKET, MsgType, PdHeader, gross_size, write_fcs};

use crate::{
    arena::{Arena, EndpointId},
    config::SessionConfig,
    element::{AddressSpec, Endpoint, PktFlags, PrivFlags},
    error::PdError,
    event::{Marshaller, PdCallback, PdInfo},
    sockets::{SockDir, SocketKey, SocketTable},
    stats::{GLOBAL_STATISTICS_COMID, PdCounters, PdStatistics, STATS_VERSION},
    time::Nanos,
};

/// Publisher registration options.
#[derive(Default)]
pub struct PubOptions {
    /// Send cycle; ZERO registers a pull-only publisher.
    pub interval: Nanos,
    pub flags: PktFlags,
    pub user_ref: u32,
    pub callback: Option<Box<dyn PdCallback>>,
}

/// Subscriber registration options.
#[derive(Default)]
pub struct SubOptions {
    /// Watchdog limit; ZERO disables timeout supervision.
    pub timeout: Nanos,
    pub flags: PktFlags,
    pub user_ref: u32,
    pub callback: Option<Box<dyn PdCallback>>,
}

/// One PD session: two queues of endpoint elements (publishers and
/// subscribers) plus the sockets, counters and scratch buffer that drive
/// them.
///
/// The application owns the loop and calls the process entry points in
/// order:
/// 1. [`check_pending`](Self::check_pending) computes the next deadline,
/// 2. [`poll_io`](Self::poll_io) waits (the only blocking point),
/// 3. [`check_listen_socks`](Self::check_listen_socks) drains readable
///    sockets,
/// 4. [`send_due`](Self::send_due) emits due telegrams,
/// 5. [`handle_timeouts`](Self::handle_timeouts) runs subscriber
///    watchdogs.
///
/// All mutation happens on the caller's thread; there is no internal
/// locking and callbacks run inline, so they must not block or re-enter
/// the session.
pub struct PdSession {
    pub(crate) cfg: SessionConfig,
    pub(crate) poll: Poll,
    pub(crate) arena: Arena,
    pub(crate) snd_queue: Vec<EndpointId>,
    pub(crate) rcv_queue: Vec<EndpointId>,
    pub(crate) sockets: SocketTable,
    /// Receive scratch; swapped with a subscriber's frame on accept.
    pub(crate) rx_scratch: Vec<u8>,
    pub(crate) counters: PdCounters,
    pub(crate) marshaller: Option<Box<dyn Marshaller>>,
    /// Earliest pending deadline, rebuilt by `check_pending`.
    pub(crate) next_job: Option<Nanos>,
    /// Session-lifetime PD port socket opened by [`listen`](Self::listen).
    pd_port_socket: Option<usize>,
    started_at: Nanos,
}

impl PdSession {
    pub fn new(cfg: SessionConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let sockets = SocketTable::new(cfg.own_ip);
        debug!(own_ip = %cfg.own_ip, port = cfg.port, "pd session up");
        Ok(Self {
            cfg,
            poll,
            arena: Arena::default(),
            snd_queue: Vec::new(),
            rcv_queue: Vec::new(),
            sockets,
            rx_scratch: vec![0u8; MAX_PD_PACKET],
            counters: PdCounters::default(),
            marshaller: None,
            next_job: None,
            pd_port_socket: None,
            started_at: Nanos::now(),
        })
    }

    /// Opens the session's PD port for incoming traffic. Subscriptions on
    /// the same port share the socket; a pure replier (publishers only)
    /// needs this to hear pull requests.
    pub fn listen(&mut self) -> Result<(), PdError> {
        if self.pd_port_socket.is_some() {
            return Ok(());
        }
        let key = SocketKey {
            dir: SockDir::Recv,
            port: self.cfg.port,
            mc_group: None,
            qos: self.cfg.qos,
            ttl: self.cfg.ttl,
        };
        let idx = self.sockets.acquire(self.poll.registry(), key).map_err(|err| {
            tracing::warn!(?err, port = self.cfg.port, "pd port bind failed");
            PdError::Io
        })?;
        self.pd_port_socket = Some(idx);
        Ok(())
    }

    /// Registers a cyclic (or pull-only, `interval` ZERO) publisher.
    /// Without initial data the element stays invalid and silent until the
    /// first [`put`](Self::put).
    pub fn publish(
        &mut self,
        now: Nanos,
        spec: AddressSpec,
        opts: PubOptions,
        data: Option<&[u8]>,
    ) -> Result<EndpointId, PdError> {
        let socket = self.acquire_socket(SockDir::Send, &spec)?;
        let mut ep = Endpoint::new(
            spec,
            MsgType::Pd,
            opts.interval,
            opts.flags,
            opts.user_ref,
            self.cfg.seq_tracker_cap,
        );
        ep.socket = Some(socket);
        ep.callback = opts.callback;
        ep.frame = vec![0u8; gross_size(0)];
        init_header(&mut ep, MsgType::Pd, 0, Ipv4Addr::UNSPECIFIED);
        if let Some(data) = data {
            ep.put(self.marshaller.as_deref_mut(), Some(data))?;
        }
        if !ep.interval.is_zero() {
            ep.time_to_go = Some(now + ep.interval);
        }

        let id = self.arena.insert(ep);
        self.snd_queue.push(id);
        self.distribute();
        debug!(com_id = spec.com_id, dest = %spec.dest, interval = %opts.interval, "published");
        Ok(id)
    }

    /// Registers a subscriber for incoming telegrams. The watchdog is
    /// armed immediately so a publisher that never shows up times out.
    pub fn subscribe(
        &mut self,
        now: Nanos,
        spec: AddressSpec,
        opts: SubOptions,
    ) -> Result<EndpointId, PdError> {
        let socket = self.acquire_socket(SockDir::Recv, &spec)?;
        let mut ep = Endpoint::new(
            spec,
            MsgType::Pd,
            opts.timeout,
            opts.flags,
            opts.user_ref,
            self.cfg.seq_tracker_cap,
        );
        ep.socket = Some(socket);
        ep.callback = opts.callback;
        if !ep.interval.is_zero() {
            ep.time_to_go = Some(now + ep.interval);
        }

        let id = self.arena.insert(ep);
        self.rcv_queue.push(id);
        debug!(com_id = spec.com_id, dest = %spec.dest, timeout = %opts.timeout, "subscribed");
        Ok(id)
    }

    /// Queues a one-shot pull request. The PR element is emitted by the
    /// next sender pass and destroyed with that emission; the remote
    /// publisher of `reply_com_id` answers to `reply_ip`.
    pub fn request(
        &mut self,
        spec: AddressSpec,
        reply_com_id: u32,
        reply_ip: Ipv4Addr,
    ) -> Result<(), PdError> {
        let socket = self.acquire_socket(SockDir::Send, &spec)?;
        let mut ep = Endpoint::new(
            spec,
            MsgType::Pr,
            Nanos::ZERO,
            PktFlags::empty(),
            0,
            self.cfg.seq_tracker_cap,
        );
        ep.socket = Some(socket);
        ep.frame = vec![0u8; gross_size(0)];
        init_header(&mut ep, MsgType::Pr, reply_com_id, reply_ip);
        // A PR carries no payload; it is valid as soon as it exists.
        ep.priv_flags = PrivFlags::REQ_2B_SENT;

        let id = self.arena.insert(ep);
        self.snd_queue.push(id);
        debug!(com_id = spec.com_id, reply_com_id, %reply_ip, "pull request queued");
        Ok(())
    }

    /// Publishes the distinguished global-statistics reply element. It is
    /// pull-only; its payload is snapshotted when a statistics pull
    /// arrives.
    pub fn publish_statistics(&mut self, now: Nanos) -> Result<EndpointId, PdError> {
        let dest = std::net::SocketAddrV4::new(self.cfg.own_ip, self.cfg.port);
        let spec = AddressSpec::new(GLOBAL_STATISTICS_COMID, dest);
        let snapshot = self.statistics(now).encode();
        self.publish(now, spec, PubOptions::default(), Some(&snapshot))
    }

    pub fn unpublish(&mut self, id: EndpointId) -> Result<(), PdError> {
        let pos = self.snd_queue.iter().position(|&e| e == id).ok_or(PdError::Param)?;
        self.snd_queue.remove(pos);
        self.release_endpoint(id)?;
        self.distribute();
        Ok(())
    }

    pub fn unsubscribe(&mut self, id: EndpointId) -> Result<(), PdError> {
        let pos = self.rcv_queue.iter().position(|&e| e == id).ok_or(PdError::Param)?;
        self.rcv_queue.remove(pos);
        self.release_endpoint(id)
    }

    /// Updates a publisher's payload; see [`Endpoint::put`] for the
    /// data-less rule.
    pub fn put(&mut self, id: EndpointId, data: Option<&[u8]>) -> Result<(), PdError> {
        if !self.snd_queue.contains(&id) {
            return Err(PdError::Param);
        }
        let marshaller = self.marshaller.as_deref_mut();
        let ep = self.arena.get_mut(id).ok_or(PdError::Param)?;
        ep.put(marshaller, data)
    }

    /// Copies a subscriber's last valid payload into `out`.
    pub fn get(&mut self, id: EndpointId, out: &mut [u8]) -> Result<usize, PdError> {
        let marshaller = self.marshaller.as_deref_mut();
        let ep = self.arena.get_mut(id).ok_or(PdError::Param)?;
        ep.get(marshaller, out)
    }

    /// Silences (or re-enables) all publishers of `com_id` while a
    /// redundancy peer leads.
    pub fn set_redundant(&mut self, com_id: u32, silent: bool) -> Result<(), PdError> {
        let mut found = false;
        for &id in &self.snd_queue {
            if let Some(ep) = self.arena.get_mut(id) {
                if ep.spec.com_id == com_id {
                    ep.pkt_flags.set(PktFlags::REDUNDANT, silent);
                    found = true;
                }
            }
        }
        if found { Ok(()) } else { Err(PdError::Param) }
    }

    /// Updates the session topology counters. Publisher frames keep their
    /// stamp until [`refresh_topo_counts`](Self::refresh_topo_counts), so
    /// a stale nonzero stamp stops emitting (the sender's topology gate).
    pub fn set_topo_counts(&mut self, etb: u32, op_trn: u32) {
        self.cfg.etb_topo_cnt = etb;
        self.cfg.op_trn_topo_cnt = op_trn;
    }

    /// Restamps all publisher frames with the session topology counters.
    pub fn refresh_topo_counts(&mut self) {
        for &id in &self.snd_queue {
            let (etb, op_trn) = (self.cfg.etb_topo_cnt, self.cfg.op_trn_topo_cnt);
            if let Some(ep) = self.arena.get_mut(id) {
                ep.spec.etb_topo_cnt = etb;
                ep.spec.op_trn_topo_cnt = op_trn;
                if let Ok(mut header) = PdHeader::decode(&ep.frame) {
                    header.etb_topo_cnt = etb;
                    header.op_trn_topo_cnt = op_trn;
                    header.encode_into(&mut ep.frame);
                    write_fcs(&mut ep.frame);
                }
            }
        }
    }

    pub fn set_marshaller(&mut self, marshaller: Box<dyn Marshaller>) {
        self.marshaller = Some(marshaller);
    }

    pub fn reset_statistics(&mut self) {
        self.counters = PdCounters::default();
    }

    pub fn counters(&self) -> &PdCounters {
        &self.counters
    }

    /// Statistics snapshot as it would answer a pull right now.
    pub fn statistics(&self, now: Nanos) -> PdStatistics {
        PdStatistics {
            version: STATS_VERSION,
            uptime_secs: now.saturating_sub(self.started_at).as_secs_f64() as u32,
            own_ip: self.cfg.own_ip,
            etb_topo_cnt: self.cfg.etb_topo_cnt,
            op_trn_topo_cnt: self.cfg.op_trn_topo_cnt,
            counters: self.counters,
            num_publishers: self.snd_queue.len() as u32,
            num_subscribers: self.rcv_queue.len() as u32,
        }
    }

    /// Local address of the endpoint's socket; subscribers bound to port 0
    /// learn their ephemeral port here.
    pub fn bound_addr(&self, id: EndpointId) -> Option<std::net::SocketAddr> {
        let ep = self.arena.get(id)?;
        self.sockets.get(ep.socket?).map(|s| s.local)
    }

    fn acquire_socket(&mut self, dir: SockDir, spec: &AddressSpec) -> Result<usize, PdError> {
        let mc_group = match dir {
            SockDir::Recv if spec.dest.ip().is_multicast() => Some(*spec.dest.ip()),
            _ => None,
        };
        let key = SocketKey { dir, port: spec.dest.port(), mc_group, qos: spec.qos, ttl: spec.ttl };
        self.sockets.acquire(self.poll.registry(), key).map_err(|err| {
            tracing::warn!(?err, com_id = spec.com_id, "socket setup failed");
            PdError::Io
        })
    }

    /// Detaches an element from its socket and frees its arena slot.
    pub(crate) fn release_endpoint(&mut self, id: EndpointId) -> Result<(), PdError> {
        let ep = self.arena.remove(id).ok_or(PdError::Param)?;
        if let Some(idx) = ep.socket {
            self.sockets.release(self.poll.registry(), idx);
        }
        Ok(())
    }

    /// Take-call-restore around a stored callback so the arena borrow is
    /// released while application code runs.
    pub(crate) fn notify(&mut self, id: EndpointId, info: PdInfo) {
        let Some(ep) = self.arena.get_mut(id) else { return };
        if !ep.pkt_flags.contains(PktFlags::CALLBACK) {
            return;
        }
        let Some(mut cb) = ep.callback.take() else { return };
        {
            let ep = self.arena.get(id).expect("endpoint alive during callback");
            cb.on_pd_event(&info, ep.payload());
        }
        if let Some(ep) = self.arena.get_mut(id) {
            ep.callback = Some(cb);
        }
    }

    /// First publisher matching `com_id` in queue order.
    pub(crate) fn find_publisher(&self, com_id: u32) -> Option<EndpointId> {
        self.snd_queue
            .iter()
            .copied()
            .find(|&id| self.arena.get(id).is_some_and(|ep| ep.spec.com_id == com_id))
    }

    /// First subscriber matching the incoming address tuple.
    pub(crate) fn find_subscriber(
        &self,
        com_id: u32,
        delivered_to: Ipv4Addr,
        src: Ipv4Addr,
    ) -> Option<EndpointId> {
        self.rcv_queue.iter().copied().find(|&id| {
            self.arena
                .get(id)
                .is_some_and(|ep| ep.matches_incoming(com_id, delivered_to, src))
        })
    }
}

/// Writes a fresh header into the element's frame; the FCS is stamped on
/// emission.
fn init_header(ep: &mut Endpoint, msg_type: MsgType, reply_com_id: u32, reply_ip: Ipv4Addr) {
    let mut header = PdHeader::new(msg_type, ep.spec.com_id);
    header.etb_topo_cnt = ep.spec.etb_topo_cnt;
    header.op_trn_topo_cnt = ep.spec.op_trn_topo_cnt;
    header.dataset_length = ep.data_size as u32;
    header.reply_com_id = reply_com_id;
    header.reply_ip = reply_ip;
    header.encode_into(&mut ep.frame);
}
