//! Demo binary: a loopback TCP echo server built on [`corewire::Core`].
//!
//! Not a protocol engine itself — just enough wiring (CLI flags, logging,
//! a shutdown signal) to exercise the library end to end.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use corewire::broker::BrokerId;
use corewire::scheme::SchemeConfig;
use corewire::{Core, CoreConfig};
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// corewire demo: a loopback echo server.
#[derive(Parser, Debug)]
#[command(name = "corewire", version, about = "Single-threaded network I/O reactor demo")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:0")]
    listen: SocketAddr,

    /// Dispatcher polling frequency in milliseconds (0 = block between turns).
    #[arg(long, default_value_t = 10)]
    frequency_ms: u64,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    ctrlc::set_handler(|| {
        SHUTDOWN.store(true, Ordering::SeqCst);
    })
    .expect("install ctrlc handler");

    #[cfg(unix)]
    {
        let term = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))
            .expect("install SIGTERM handler");
        std::thread::spawn(move || loop {
            if term.load(Ordering::SeqCst) {
                SHUTDOWN.store(true, Ordering::SeqCst);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        });
    }

    let config = CoreConfig::builder()
        .dispatcher_frequency_ms(args.frequency_ms)
        .build();
    let mut core = Core::new(config).expect("core init");

    let sid = core.add(SchemeConfig::default());
    let echo_buffers: Rc<RefCell<std::collections::HashMap<BrokerId, Vec<u8>>>> =
        Rc::new(RefCell::new(std::collections::HashMap::new()));

    if let Some(callbacks) = core.scheme_callbacks(sid) {
        let sink = Rc::clone(&echo_buffers);
        callbacks.on_read(Box::new(move |bid, bytes| {
            sink.borrow_mut().entry(bid).or_default().extend_from_slice(bytes);
        }));
        callbacks.on_disconnect(Box::new(move |bid| {
            log::info!("demo: broker {bid} disconnected");
        }));
    }

    let bid = core
        .open_server(sid, args.listen)
        .expect("bind/listen failed");
    log::info!("demo: listening on broker {bid}, ctrl-c to stop");

    core.start();
    while core.status() == corewire::core::Status::Start && !SHUTDOWN.load(Ordering::SeqCst) {
        if let Err(e) = core.tick() {
            log::warn!("demo: reactor tick failed: {e}");
            break;
        }
        let pending: Vec<BrokerId> = echo_buffers.borrow().keys().copied().collect();
        for pending_bid in pending {
            let bytes = echo_buffers.borrow_mut().remove(&pending_bid).unwrap_or_default();
            if !bytes.is_empty() {
                let _ = core.write(pending_bid, &bytes);
            }
        }
    }
    core.stop();
    log::info!("demo: shut down cleanly");
}
