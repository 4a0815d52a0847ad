use std::{
    net::{Ipv4Addr, SocketAddrV4, UdpSocket},
    time::Duration,
};

use traincom::{
    AddressSpec, Nanos, PdError, PdSession, PktFlags, PubOptions, SessionConfig,
    wire::{self, HEADER_SIZE, MsgType, PdHeader, gross_size, write_fcs},
};

const COM_ID: u32 = 2400;
const OWN_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

struct Capture {
    sock: UdpSocket,
    buf: [u8; 2048],
}

impl Capture {
    fn new() -> Self {
        let sock = UdpSocket::bind((OWN_IP, 0)).unwrap();
        sock.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        Self { sock, buf: [0u8; 2048] }
    }

    fn addr(&self) -> SocketAddrV4 {
        match self.sock.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            std::net::SocketAddr::V6(_) => unreachable!("bound v4"),
        }
    }

    fn next(&mut self) -> Option<PdHeader> {
        let (len, _) = self.sock.recv_from(&mut self.buf).ok()?;
        Some(wire::check(&self.buf[..len]).expect("emitted frame is valid"))
    }

    fn assert_silent(&mut self) {
        assert!(self.sock.recv_from(&mut self.buf).is_err(), "unexpected emission");
    }
}

#[test]
fn cyclic_publisher_sequences_and_advances() {
    let mut capture = Capture::new();
    let mut session = PdSession::new(SessionConfig::new(OWN_IP).with_port(0)).unwrap();

    let t0 = Nanos::from_millis(10);
    let interval = Nanos::from_millis(100);
    let id = session
        .publish(
            t0,
            AddressSpec::new(COM_ID, capture.addr()),
            PubOptions { interval, ..Default::default() },
            Some(b"cycle"),
        )
        .unwrap();

    // Not due yet.
    session.send_due(t0 + Nanos::from_millis(50)).unwrap();
    capture.assert_silent();

    // Due: one emission, sequence starts at one.
    session.send_due(t0 + interval).unwrap();
    let first = capture.next().unwrap();
    assert_eq!(first.msg_type, MsgType::Pd);
    assert_eq!(first.sequence_counter, 1);
    assert_eq!(first.com_id, COM_ID);
    assert_eq!(first.dataset_length, 5);

    // Same pass does not emit twice; the next cycle does, one higher.
    session.send_due(t0 + interval).unwrap();
    capture.assert_silent();
    session.send_due(t0 + interval * 2).unwrap();
    assert_eq!(capture.next().unwrap().sequence_counter, 2);

    // Far behind schedule: a single emission, no catch-up burst.
    session.send_due(t0 + interval * 10).unwrap();
    assert_eq!(capture.next().unwrap().sequence_counter, 3);
    capture.assert_silent();

    session.unpublish(id).unwrap();
    session.send_due(t0 + interval * 20).unwrap();
    capture.assert_silent();
}

#[test]
fn publisher_without_data_stays_silent_until_put() {
    let mut capture = Capture::new();
    let mut session = PdSession::new(SessionConfig::new(OWN_IP).with_port(0)).unwrap();

    let t0 = Nanos::from_millis(10);
    let interval = Nanos::from_millis(100);
    let id = session
        .publish(
            t0,
            AddressSpec::new(COM_ID, capture.addr()),
            PubOptions { interval, ..Default::default() },
            None,
        )
        .unwrap();

    session.send_due(t0 + interval).unwrap();
    capture.assert_silent();

    // A data-less put marks the element valid; it emits with an empty
    // dataset.
    session.put(id, None).unwrap();
    session.send_due(t0 + interval * 2).unwrap();
    let header = capture.next().unwrap();
    assert_eq!(header.dataset_length, 0);
}

#[test]
fn redundant_publisher_is_silent() {
    let mut capture = Capture::new();
    let mut session = PdSession::new(SessionConfig::new(OWN_IP).with_port(0)).unwrap();

    let t0 = Nanos::from_millis(10);
    let interval = Nanos::from_millis(100);
    session
        .publish(
            t0,
            AddressSpec::new(COM_ID, capture.addr()),
            PubOptions { interval, ..Default::default() },
            Some(b"standby"),
        )
        .unwrap();

    session.set_redundant(COM_ID, true).unwrap();
    session.send_due(t0 + interval).unwrap();
    capture.assert_silent();

    // Taking the lead resumes emission on the existing schedule.
    session.set_redundant(COM_ID, false).unwrap();
    session.send_due(t0 + interval * 2).unwrap();
    assert_eq!(capture.next().unwrap().sequence_counter, 2);
}

#[test]
fn pull_request_yields_single_pp_reply() {
    let mut capture = Capture::new();
    let mut session = PdSession::new(SessionConfig::new(OWN_IP).with_port(0)).unwrap();
    session.listen().unwrap();

    let t0 = Nanos::from_millis(10);
    // Pull-only publisher: no cyclic schedule at all.
    session
        .publish(
            t0,
            AddressSpec::new(COM_ID, capture.addr()),
            PubOptions { interval: Nanos::ZERO, ..Default::default() },
            Some(b"on demand"),
        )
        .unwrap();
    session.send_due(t0 + Nanos::from_secs(60)).unwrap();
    capture.assert_silent();

    // Hand-built PR aimed at the session's listening socket. The reply
    // address is zero, so the reply goes back to the request's source,
    // which is the capture socket itself.
    let mut header = PdHeader::new(MsgType::Pr, COM_ID);
    header.sequence_counter = 1;
    let mut frame = vec![0u8; gross_size(0)];
    header.encode_into(&mut frame);
    write_fcs(&mut frame);

    // The session listens on an ephemeral PD port; find it through a
    // helper subscription on the same port settings.
    let listen_addr = {
        let probe = session
            .subscribe(
                t0,
                AddressSpec::new(9999, SocketAddrV4::new(OWN_IP, 0)),
                Default::default(),
            )
            .unwrap();
        session.bound_addr(probe).unwrap()
    };
    capture.sock.send_to(&frame, listen_addr).unwrap();

    let mut events = traincom::mio::Events::with_capacity(8);
    let mut got: Option<PdHeader> = None;
    for _ in 0..10 {
        session.poll_io(&mut events, Some(Duration::from_millis(20))).unwrap();
        session.check_listen_socks(&events, t0);
        if let Some(header) = capture.next() {
            got = Some(header);
            break;
        }
    }

    let reply = got.expect("pull reply arrived");
    assert_eq!(reply.msg_type, MsgType::Pp);
    assert_eq!(reply.com_id, COM_ID);
    assert_eq!(reply.sequence_counter, 1, "pull counter runs separately");
    assert_eq!(&capture.buf[HEADER_SIZE..HEADER_SIZE + 9], b"on demand");

    // One-shot: no further replies without a new request.
    session.send_due(t0 + Nanos::from_secs(120)).unwrap();
    capture.assert_silent();
}

#[test]
fn stale_topology_stamp_blocks_emission() {
    let mut capture = Capture::new();
    let mut session = PdSession::new(SessionConfig::new(OWN_IP).with_port(0)).unwrap();

    let t0 = Nanos::from_millis(10);
    let interval = Nanos::from_millis(100);
    session
        .publish(
            t0,
            AddressSpec::new(COM_ID, capture.addr()).with_topo_counts(7, 0),
            PubOptions { interval, ..Default::default() },
            Some(b"topo"),
        )
        .unwrap();

    // Counters agree (or wildcard): emission passes.
    session.set_topo_counts(7, 0);
    session.send_due(t0 + interval).unwrap();
    assert_eq!(capture.next().unwrap().etb_topo_cnt, 7);

    // The train reconfigures; the stale stamp must not leave the node.
    session.set_topo_counts(8, 0);
    assert_eq!(session.send_due(t0 + interval * 2), Err(PdError::Topo));
    capture.assert_silent();

    // Restamping publishers resumes emission with the new counters.
    session.refresh_topo_counts();
    session.send_due(t0 + interval * 3).unwrap();
    assert_eq!(capture.next().unwrap().etb_topo_cnt, 8);
}
