use std::{
    net::{Ipv4Addr, SocketAddrV4},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use clap::Parser;
use tracing::{debug, info};
use traincom::{
    AddressSpec, DEFAULT_PD_PORT, GLOBAL_STATISTICS_COMID, Nanos, PdSession, PdStatistics,
    PktFlags, STATISTICS_PULL_COMID, SessionConfig, SubOptions,
    mio::Events,
};

/// Upper bound on one poll wait so ctrl-c and new deadlines are honored
/// promptly.
const MAX_POLL_WAIT: Nanos = Nanos::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "traincom-ctl", about = "PD statistics pull demo", version)]
pub struct Opts {
    /// Interface address to send from and listen on.
    #[arg(short = 'o', long = "own-ip")]
    pub own_ip: Option<Ipv4Addr>,

    /// Address the remote should answer to (defaults to the own address).
    #[arg(short = 'r', long = "reply-ip")]
    pub reply_ip: Option<Ipv4Addr>,

    /// Node to pull statistics from.
    #[arg(short = 't', long = "target-ip")]
    pub target_ip: Ipv4Addr,

    /// PD port for requests and replies.
    #[arg(long, default_value_t = DEFAULT_PD_PORT)]
    pub port: u16,

    /// Re-request cycle, e.g. "1s" or "500ms".
    #[arg(short = 'c', long, default_value = "1s")]
    pub cycle: Nanos,

    /// Raise log verbosity (repeatable).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// JSON session config; overrides the address flags.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Opts {
    fn session_config(&self) -> Result<SessionConfig, Box<dyn std::error::Error>> {
        if let Some(path) = &self.config {
            let raw = std::fs::read_to_string(path)?;
            return Ok(serde_json::from_str(&raw)?);
        }
        let own_ip = self.own_ip.ok_or("either --own-ip or --config is required")?;
        Ok(SessionConfig::new(own_ip).with_port(self.port))
    }
}

/// Demo loop: pulls the global statistics telegram from the target node
/// every cycle and prints each snapshot that comes back, until
/// `keep_running` clears.
pub fn run(opts: &Opts, keep_running: &Arc<AtomicBool>) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = opts.session_config()?;
    let own_ip = cfg.own_ip;
    let port = cfg.port;
    let reply_ip = opts.reply_ip.unwrap_or(own_ip);

    let mut session = PdSession::new(cfg)?;
    let now = Nanos::now();

    // Answer statistics pulls ourselves, and listen for the remote reply.
    session.publish_statistics(now)?;
    let reply_addr = SocketAddrV4::new(own_ip, port);
    session.subscribe(
        now,
        AddressSpec::new(GLOBAL_STATISTICS_COMID, reply_addr),
        SubOptions {
            timeout: Nanos::ZERO,
            flags: PktFlags::CALLBACK | PktFlags::FORCE_CB,
            user_ref: 0,
            callback: Some(Box::new(|info: &traincom::PdInfo, payload: &[u8]| {
                match info.result {
                    Ok(()) => match PdStatistics::decode(payload) {
                        Ok(stats) => print_stats(info.src, &stats),
                        Err(err) => info!(?err, "undecodable statistics reply"),
                    },
                    Err(err) => info!(?err, com_id = info.com_id, "statistics subscription"),
                }
            })),
        },
    )?;

    let target = SocketAddrV4::new(opts.target_ip, port);
    info!(%target, %reply_ip, "pulling global statistics");

    let mut events = Events::with_capacity(16);
    let mut next_request = Nanos::ZERO;
    while keep_running.load(Ordering::Relaxed) {
        let now = Nanos::now();
        if now >= next_request {
            session.request(
                AddressSpec::new(STATISTICS_PULL_COMID, target),
                GLOBAL_STATISTICS_COMID,
                reply_ip,
            )?;
            // Requests should not wait out the next poll.
            if let Err(err) = session.send_due(now) {
                debug!(?err, "request emission");
            }
            next_request = now + opts.cycle;
        }

        session.check_pending();
        let wait = session.poll_timeout(now, opts.cycle.min(MAX_POLL_WAIT));
        session.poll_io(&mut events, Some(wait))?;

        let now = Nanos::now();
        session.check_listen_socks(&events, now);
        if let Err(err) = session.send_due(now) {
            debug!(?err, "send pass");
        }
        session.handle_timeouts(now);
    }

    info!("shutting down");
    Ok(())
}

fn print_stats(from: Ipv4Addr, stats: &PdStatistics) {
    let c = &stats.counters;
    println!("--- statistics from {from} ---");
    println!("  version      {:#010x}", stats.version);
    println!("  uptime       {}s", stats.uptime_secs);
    println!("  own ip       {}", stats.own_ip);
    println!("  topo (etb/op) {}/{}", stats.etb_topo_cnt, stats.op_trn_topo_cnt);
    println!("  publishers   {}", stats.num_publishers);
    println!("  subscribers  {}", stats.num_subscribers);
    println!("  sent         {}", c.num_send);
    println!("  received     {}", c.num_rcv);
    println!("  crc errors   {}", c.num_crc_err);
    println!("  proto errors {}", c.num_prot_err);
    println!("  topo errors  {}", c.num_topo_err);
    println!("  timeouts     {}", c.num_timeout);
    println!("  no subscriber {}", c.num_no_subs);
    println!("  missed       {}", c.num_missed);
}
