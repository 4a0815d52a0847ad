use std::{
    net::{Ipv4Addr, SocketAddrV4, UdpSocket},
    sync::{Arc, Mutex},
    time::Duration,
};

use traincom::{
    AddressSpec, Nanos, PdError, PdSession, PktFlags, SessionConfig, SubOptions,
    mio::Events,
    wire::{HEADER_SIZE, MsgType, PdHeader, gross_size, write_fcs},
};

const COM_ID: u32 = 2200;
const OWN_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

fn pd_frame(seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut header = PdHeader::new(MsgType::Pd, COM_ID);
    header.sequence_counter = seq;
    header.dataset_length = payload.len() as u32;
    let mut frame = vec![0u8; gross_size(payload.len())];
    header.encode_into(&mut frame);
    frame[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
    write_fcs(&mut frame);
    frame
}

#[test]
fn timeout_fires_once_and_recovery_notifies() {
    let mut session = PdSession::new(SessionConfig::new(OWN_IP).with_port(0)).unwrap();
    let log: Arc<Mutex<Vec<Result<(), PdError>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();

    let t0 = Nanos::from_millis(100);
    let id = session
        .subscribe(
            t0,
            AddressSpec::new(COM_ID, SocketAddrV4::new(OWN_IP, 0)),
            SubOptions {
                timeout: Nanos::from_millis(500),
                flags: PktFlags::CALLBACK,
                user_ref: 0,
                callback: Some(Box::new(move |info: &traincom::PdInfo, _: &[u8]| {
                    sink.lock().unwrap().push(info.result);
                })),
            },
        )
        .unwrap();

    // Before the limit: silent.
    session.handle_timeouts(t0 + Nanos::from_millis(400));
    assert!(log.lock().unwrap().is_empty());

    // Past the limit: exactly one Timeout notification, repeated scans
    // stay quiet while the episode lasts.
    session.handle_timeouts(t0 + Nanos::from_millis(600));
    session.handle_timeouts(t0 + Nanos::from_millis(700));
    session.handle_timeouts(t0 + Nanos::from_millis(900));
    assert_eq!(*log.lock().unwrap(), vec![Err(PdError::Timeout)]);
    assert_eq!(session.counters().num_timeout, 1);

    // Nothing was ever received, so get still reports the missing data.
    let mut buf = [0u8; 16];
    assert_eq!(session.get(id, &mut buf), Err(PdError::NoData));

    // Fresh frame: the latch clears and the first packet always notifies.
    let sender = UdpSocket::bind((OWN_IP, 0)).unwrap();
    sender
        .send_to(&pd_frame(1, b"back"), session.bound_addr(id).unwrap())
        .unwrap();
    let mut events = Events::with_capacity(8);
    let arrival = t0 + Nanos::from_millis(1000);
    for _ in 0..10 {
        session
            .poll_io(&mut events, Some(Duration::from_millis(20)))
            .unwrap();
        session.check_listen_socks(&events, arrival);
        if !events.is_empty() {
            break;
        }
    }
    assert_eq!(
        *log.lock().unwrap(),
        vec![Err(PdError::Timeout), Ok(())],
        "recovery notifies exactly once"
    );

    let n = session.get(id, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"back");

    // The watchdog re-armed at arrival time.
    session.handle_timeouts(arrival + Nanos::from_millis(400));
    assert_eq!(session.counters().num_timeout, 1);
    session.handle_timeouts(arrival + Nanos::from_millis(600));
    assert_eq!(session.counters().num_timeout, 2);

    // With valid data on board, a timed out subscriber reports Timeout.
    assert_eq!(session.get(id, &mut buf), Err(PdError::Timeout));
}

#[test]
fn next_deadline_skips_timed_out_subscribers() {
    let mut session = PdSession::new(SessionConfig::new(OWN_IP).with_port(0)).unwrap();
    let t0 = Nanos::from_millis(100);
    session
        .subscribe(
            t0,
            AddressSpec::new(COM_ID, SocketAddrV4::new(OWN_IP, 0)),
            SubOptions { timeout: Nanos::from_millis(500), ..Default::default() },
        )
        .unwrap();

    assert_eq!(session.check_pending(), Some(t0 + Nanos::from_millis(500)));

    session.handle_timeouts(t0 + Nanos::from_millis(600));
    assert_eq!(session.check_pending(), None, "timed out subscriber is unscheduled");
}
