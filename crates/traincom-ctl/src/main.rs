use std::{
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use clap::Parser;
use tracing::error;
use traincom_ctl::{Opts, run};

fn main() -> ExitCode {
    let opts = Opts::parse();

    let level = match opts.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let keep_running = Arc::new(AtomicBool::new(true));
    let flag = keep_running.clone();
    if let Err(err) = ctrlc::set_handler(move || flag.store(false, Ordering::Relaxed)) {
        error!(?err, "could not install signal handler");
        return ExitCode::FAILURE;
    }

    match run(&opts, &keep_running) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
