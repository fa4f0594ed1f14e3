//! gntshm-source
//!
//! Shares a payload with another domain and revokes it once the consumer is
//! done. Run in the memory-owning domain.

use std::error::Error as _;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use gntshm::backend::xen::GNTALLOC_PATH;
use gntshm::memory::pages_for_bytes;
use gntshm::{
    CancelToken, ChannelConfig, Error, GrantSource, ReleaseMode, Result, TeardownCoordinator, WaitOutcome,
};

#[derive(Parser, Debug)]
#[command(name = "gntshm-source", version, about = "Share pages with another Xen domain")]
struct Args {
    /// Domain allowed to map the pages
    #[arg(long, default_value_t = 0)]
    domid: u16,

    /// Number of pages to share (default: enough for the payload)
    #[arg(long)]
    pages: Option<u32>,

    /// Grant the pages read-only
    #[arg(long)]
    read_only: bool,

    /// File to share (default: this host's name)
    #[arg(long)]
    payload: Option<PathBuf>,

    /// Wait for Ctrl-C instead of the unmap notification
    #[arg(long)]
    manual: bool,

    /// Give up waiting for the consumer after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Allocation device
    #[arg(long, default_value = GNTALLOC_PATH)]
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
    let payload = match args.payload {
        Some(ref path) => std::fs::read(path)?,
        None => hostname()?.into_bytes(),
    };

    // The notify byte must stay clear of the payload.
    let needed = pages_for_bytes(payload.len() + 1) as u32;
    let mut builder = ChannelConfig::builder()
        .domid(args.domid)
        .pages(args.pages.unwrap_or(needed))
        .writable(!args.read_only)
        .gntalloc_path(&args.device);
    if args.manual {
        builder = builder.release_mode(ReleaseMode::Manual);
    }
    if let Some(secs) = args.timeout {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    let config = builder.build()?;

    let capacity = config.pages() as usize * gntshm::PAGE_SIZE;
    if payload.len() >= capacity {
        return Err(Error::BufferTooSmall {
            needed: payload.len() + 1,
            actual: capacity,
        });
    }

    let source = GrantSource::from_config(&config)?;
    let (handle, mut page) = source.allocate_mapped(config.domid(), config.pages(), config.grant_flags())?;
    page.write(0, &payload)?;

    let mut channel = TeardownCoordinator::arm(handle, page)?;
    if let Some(handle) = channel.handle() {
        for (i, gref) in handle.refs().iter().enumerate() {
            println!("{}: {}", i, gref);
        }
    }

    let token = CancelToken::from_signals()?;
    let policy = config.wait_policy();

    match config.release_mode() {
        ReleaseMode::Notify => match channel.wait_for_release(&token, &policy)? {
            WaitOutcome::Released => channel.release(&source)?,
            WaitOutcome::Cancelled | WaitOutcome::TimedOut => channel.abandon(&source),
        },
        ReleaseMode::Manual => {
            println!("Press Ctrl-C once the consumer has unmapped the pages");
            token.wait(policy.poll_interval);
            channel.confirm_consumer_done();
            channel.poll()?;
            channel.release(&source)?;
        }
    }

    Ok(())
}

fn hostname() -> Result<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is writable for its full length.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}
