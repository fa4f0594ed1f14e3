//! gntshm-sink
//!
//! Reads pages another domain granted to this one and releases them.
//! Run in the consuming domain, usually dom0.

use std::error::Error as _;
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use gntshm::backend::xen::GNTDEV_PATH;
use gntshm::{CancelToken, ChannelConfig, GrantSink, Result, TransferStrategy, UnmapNotify};

#[derive(Parser, Debug)]
#[command(name = "gntshm-sink", version, about = "Read pages granted by another Xen domain")]
struct Args {
    /// Domain that granted the pages
    domid: u16,

    /// Grant references, in page order
    #[arg(required = true)]
    grefs: Vec<u32>,

    /// Use a hypervisor copy instead of mapping the pages
    #[arg(long)]
    copy: bool,

    /// Do not clear the source's notify byte on release
    #[arg(long)]
    no_notify: bool,

    /// Keep the pages for this many seconds before releasing them
    #[arg(long)]
    hold: Option<u64>,

    /// Also signal this event channel port on release (map only)
    #[arg(long)]
    event_port: Option<u32>,

    /// Mapping device
    #[arg(long, default_value = GNTDEV_PATH)]
    device: PathBuf,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Args::parse()) {
        eprintln!("Error: {}", e);
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {}", cause);
            source = cause.source();
        }
        process::exit(e.exit_code());
    }
}

fn run(args: Args) -> Result<()> {
    let mut builder = ChannelConfig::builder()
        .domid(args.domid)
        .pages(args.grefs.len() as u32)
        .gntdev_path(&args.device);
    if args.copy {
        builder = builder.strategy(TransferStrategy::OneShotCopy);
    }
    if let Some(port) = args.event_port {
        builder = builder.event_port(port);
    }
    let config = builder.build()?;

    let sink = GrantSink::from_config(&config)?;
    let notify = (!args.no_notify).then(|| {
        let notify = UnmapNotify::clear_byte();
        match config.event_port() {
            Some(port) => notify.with_event(port),
            None => notify,
        }
    });

    let hold = match args.hold {
        Some(secs) => Some((CancelToken::from_signals()?, Duration::from_secs(secs))),
        None => None,
    };

    config
        .strategy()
        .with_pages(&sink, config.domid(), &args.grefs, notify, |data| {
            print_payload(data);
            if let Some((token, hold)) = &hold {
                wait(token, *hold);
            }
        })
}

/// Sleep for `hold` or until interrupted.
fn wait(token: &CancelToken, hold: Duration) {
    let deadline = Instant::now() + hold;
    while !token.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}

fn print_payload(data: &[u8]) {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    println!("{}", String::from_utf8_lossy(&data[..end]));
}
