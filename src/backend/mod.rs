//! Grant device abstraction.
//!
//! The grant table is driven through two kernel devices: an allocation
//! device on the side that owns the memory and a mapping device on the side
//! that consumes it. This module defines the traits both backends implement:
//!
//! - [`xen`] talks to `/dev/xen/gntalloc` and `/dev/xen/gntdev`.
//! - [`sim`] keeps an in-process grant table with the same semantics, for
//!   tests and for trying the protocol without a hypervisor.
//!
//! Indices returned by a device are only meaningful to the session that
//! returned them. Handles keep an `Arc` to their session, so an index cannot
//! outlive the open device.

use std::io;
use std::ptr::NonNull;

use bitflags::bitflags;

use crate::error::GntStatus;
use crate::{DomainId, GrantRef};

pub mod sim;
pub mod xen;

/// Check if a real grant backend is available on this system.
pub fn is_available() -> bool {
    xen::is_available()
}

bitflags! {
    /// Access granted to the consuming domain.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GrantFlags: u16 {
        /// Consumer may write the page (`GNTALLOC_FLAG_WRITABLE`).
        const WRITABLE = 0x1;
    }
}

bitflags! {
    /// What the kernel does when a mapping with a registered notify goes away.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NotifyAction: u32 {
        /// Clear the byte at the registered offset (`UNMAP_NOTIFY_CLEAR_BYTE`).
        const CLEAR_BYTE = 0x1;
        /// Signal the registered event channel port (`UNMAP_NOTIFY_SEND_EVENT`).
        const SEND_EVENT = 0x2;
    }
}

/// One end of a grant copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyEndpoint {
    /// A page granted by another domain.
    Foreign {
        domid: DomainId,
        gref: GrantRef,
        offset: u16,
    },
    /// Memory in this process.
    Local(*mut u8),
}

/// One `GRANT_COPY` segment. The device fills in `status`.
#[derive(Debug, Clone, Copy)]
pub struct CopySegment {
    pub source: CopyEndpoint,
    pub dest: CopyEndpoint,
    pub len: u16,
    pub status: GntStatus,
}

impl CopySegment {
    /// Copy `len` bytes out of a granted page into local memory.
    pub fn from_foreign(domid: DomainId, gref: GrantRef, offset: u16, dest: *mut u8, len: u16) -> Self {
        Self {
            source: CopyEndpoint::Foreign { domid, gref, offset },
            dest: CopyEndpoint::Local(dest),
            len,
            status: GntStatus::OKAY,
        }
    }

    /// Copy `len` bytes of local memory into a granted page.
    pub fn to_foreign(src: *const u8, domid: DomainId, gref: GrantRef, offset: u16, len: u16) -> Self {
        Self {
            source: CopyEndpoint::Local(src as *mut u8),
            dest: CopyEndpoint::Foreign { domid, gref, offset },
            len,
            status: GntStatus::OKAY,
        }
    }
}

/// Result of a successful `ALLOC_GRANT_REF`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// Offset to pass to mmap and to `DEALLOC_GRANT_REF`.
    pub index: u64,
    /// One reference per allocated page.
    pub refs: Vec<GrantRef>,
}

/// Allocation device of the memory-owning domain (`gntalloc`).
///
/// Errors are the raw OS errors of the device; callers classify them.
pub trait GrantAllocDevice: Send + Sync {
    /// Allocate `count` pages and grant each to `domid`.
    fn alloc_grant_ref(&self, domid: DomainId, count: u32, flags: GrantFlags) -> io::Result<Allocation>;

    /// Revoke the grants starting at `index`.
    fn dealloc_grant_ref(&self, index: u64, count: u32) -> io::Result<()>;

    /// Register a notify on the byte at `index + byte offset`.
    fn set_unmap_notify(&self, offset: u64, action: NotifyAction, event_port: u32) -> io::Result<()>;

    /// Map `len` bytes at `index` into this process.
    fn mmap(&self, index: u64, len: usize, writable: bool) -> io::Result<NonNull<u8>>;

    /// Backend name (e.g. "xen", "sim").
    fn name(&self) -> &'static str;
}

/// Mapping device of the consuming domain (`gntdev`).
pub trait GrantMapDevice: Send + Sync {
    /// Create one mapping-table entry for the given references, in order.
    fn map_grant_ref(&self, refs: &[(DomainId, GrantRef)]) -> io::Result<u64>;

    /// Tear down the mapping-table entry at `index`.
    fn unmap_grant_ref(&self, index: u64, count: u32) -> io::Result<()>;

    /// Register a notify on the byte at `index + byte offset`.
    fn set_unmap_notify(&self, offset: u64, action: NotifyAction, event_port: u32) -> io::Result<()>;

    /// Run a batch of grant copies, writing each segment's status.
    ///
    /// # Safety
    ///
    /// Every [`CopyEndpoint::Local`] pointer must be valid for `len` bytes,
    /// writable when it is a destination.
    unsafe fn grant_copy(&self, segments: &mut [CopySegment]) -> io::Result<()>;

    /// Map `len` bytes at `index` into this process.
    fn mmap(&self, index: u64, len: usize, writable: bool) -> io::Result<NonNull<u8>>;

    /// Backend name (e.g. "xen", "sim").
    fn name(&self) -> &'static str;
}
