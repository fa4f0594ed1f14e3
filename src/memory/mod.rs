//! Shared page management.
//!
//! Grant mappings are always whole pages. This module holds the page size
//! constants and the [`SharedPage`] view that both sides of a channel use
//! to read and write the granted memory.

mod shared;

pub use shared::{mmap_device, SharedPage};

/// Hypervisor page shift.
pub const PAGE_SHIFT: usize = 12;

/// Hypervisor page size. Must match the page size Xen was configured with.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Non-zero value the source writes into the notify byte before publishing.
pub const NOTIFY_SENTINEL: u8 = 0xA5;

/// Number of pages needed to hold `len` bytes.
pub fn pages_for_bytes(len: usize) -> usize {
    (len + PAGE_SIZE - 1) / PAGE_SIZE
}

/// Byte offset of the notify byte in a mapping of `page_count` pages.
///
/// The notify byte is the last byte of the last page.
pub fn notify_byte_offset(page_count: usize) -> usize {
    page_count * PAGE_SIZE - 1
}
