//! # gntshm
//!
//! Page-granularity shared memory between Xen domains over the grant table.
//!
//! One domain owns the memory and grants it ([`GrantSource`]); another maps
//! or copies it ([`GrantSink`] / [`CopyPath`]). A [`TeardownCoordinator`]
//! makes sure the owner never revokes a page the consumer still has mapped.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gntshm::{GrantFlags, GrantSink, GrantSource, Result};
//!
//! fn main() -> Result<()> {
//!     // Memory-owning domain
//!     let source = GrantSource::open_default()?;
//!     let (handle, mut page) = source.allocate_mapped(0, 1, GrantFlags::WRITABLE)?;
//!     page.write(0, b"hello")?;
//!     println!("{}: {}", handle.index(), handle.refs()[0]);
//!
//!     // Consuming domain, with the reference received out of band
//!     let sink = GrantSink::open_default()?;
//!     let mapping = sink.map_remote(1, handle.refs())?;
//!     let shared = sink.map_local_readonly(&mapping)?;
//!     assert_eq!(&shared.as_slice()[..5], b"hello");
//!     Ok(())
//! }
//! ```
//!
//! ## Backends
//!
//! - **xen**: `/dev/xen/gntalloc` and `/dev/xen/gntdev` (Linux, in a Xen domain)
//! - **sim**: an in-process grant table for tests and demos

mod config;
mod copy;
mod error;
mod sink;
mod source;
pub mod teardown;
mod transfer;

pub mod backend;
pub mod memory;

/// Xen domain identifier (`domid_t`).
pub type DomainId = u16;

/// Hypervisor-issued reference to one granted page.
pub type GrantRef = u32;

// Re-exports
pub use backend::{GrantFlags, NotifyAction};
pub use config::{ChannelBuilder, ChannelConfig, ReleaseMode};
pub use copy::CopyPath;
pub use error::{Error, GntStatus, Result, EXIT_DEVICE_UNAVAILABLE, EXIT_FAILURE};
pub use memory::{SharedPage, NOTIFY_SENTINEL, PAGE_SIZE};
pub use sink::{GrantSink, MappingHandle};
pub use source::{GrantHandle, GrantSource};
pub use teardown::{CancelToken, ChannelState, TeardownCoordinator, WaitOutcome, WaitPolicy};
pub use transfer::{TransferStrategy, UnmapNotify};

/// Check if the Xen grant devices are present on this system.
pub fn is_supported() -> bool {
    backend::is_available()
}
