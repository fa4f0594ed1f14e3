//! Xen grant device UAPI.
//!
//! Layouts and request numbers follow `include/uapi/xen/gntalloc.h` and
//! `include/uapi/xen/gntdev.h`. Every request is encoded as
//! `_IOC(_IOC_NONE, 'G', nr, sizeof(struct))`.

#![allow(non_camel_case_types)]

use std::mem::size_of;
use std::os::raw::{c_uint, c_ulong, c_void};

use vmm_sys_util::ioctl::{ioctl_expr, _IOC_NONE};

const XEN_GNT_TYPE: c_uint = b'G' as c_uint;

/// `GNTALLOC_FLAG_WRITABLE`
pub const GNTALLOC_FLAG_WRITABLE: u16 = 1;

/// `UNMAP_NOTIFY_CLEAR_BYTE`
pub const UNMAP_NOTIFY_CLEAR_BYTE: u32 = 0x1;
/// `UNMAP_NOTIFY_SEND_EVENT`
pub const UNMAP_NOTIFY_SEND_EVENT: u32 = 0x2;

/// `GNTCOPY_source_gref`
pub const GNTCOPY_SOURCE_GREF: u16 = 1 << 0;
/// `GNTCOPY_dest_gref`
pub const GNTCOPY_DEST_GREF: u16 = 1 << 1;

/// `struct ioctl_gntalloc_alloc_gref`
///
/// Variable length: `gref_ids` really holds `count` entries.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ioctl_gntalloc_alloc_gref {
    /// Domain that will be allowed to map the pages.
    pub domid: u16,
    /// `GNTALLOC_FLAG_*`
    pub flags: u16,
    /// Number of pages to share.
    pub count: u32,
    /// Offset to use for mmap, filled by the driver.
    pub index: u64,
    /// Grant references, filled by the driver.
    pub gref_ids: [u32; 1],
}

/// `struct ioctl_gntalloc_dealloc_gref`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ioctl_gntalloc_dealloc_gref {
    pub index: u64,
    pub count: u32,
    pub pad: u32,
}

/// `struct ioctl_gntalloc_unmap_notify`, shared with gntdev's
/// `struct ioctl_gntdev_unmap_notify`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ioctl_unmap_notify {
    /// Offset of the byte to clear, relative to a mapping index.
    pub index: u64,
    /// `UNMAP_NOTIFY_*`
    pub action: u32,
    /// Event channel to signal.
    pub event_channel_port: u32,
}

/// `struct ioctl_gntdev_grant_ref`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ioctl_gntdev_grant_ref {
    pub domid: u32,
    pub r#ref: u32,
}

/// `struct ioctl_gntdev_map_grant_ref`
///
/// Variable length: `refs` really holds `count` entries.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ioctl_gntdev_map_grant_ref {
    pub count: u32,
    pub pad: u32,
    /// Offset to use for mmap, filled by the driver.
    pub index: u64,
    pub refs: [ioctl_gntdev_grant_ref; 1],
}

/// `struct ioctl_gntdev_unmap_grant_ref`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ioctl_gntdev_unmap_grant_ref {
    pub index: u64,
    pub count: u32,
    pub pad: u32,
}

/// Foreign half of `union gntdev_grant_copy_segment.{source,dest}`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct gntdev_copy_foreign {
    pub r#ref: u32,
    pub offset: u16,
    pub domid: u16,
}

/// One side of a grant copy segment.
#[repr(C)]
#[derive(Clone, Copy)]
pub union gntdev_copy_ptr {
    pub virt: *mut c_void,
    pub foreign: gntdev_copy_foreign,
}

/// `struct gntdev_grant_copy_segment`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct gntdev_grant_copy_segment {
    pub source: gntdev_copy_ptr,
    pub dest: gntdev_copy_ptr,
    pub len: u16,
    /// `GNTCOPY_*`
    pub flags: u16,
    /// `GNTST_*`, filled by the driver.
    pub status: i16,
}

/// `struct ioctl_gntdev_grant_copy`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ioctl_gntdev_grant_copy {
    pub count: u32,
    pub segments: *mut gntdev_grant_copy_segment,
}

fn gnt_ioc(nr: c_uint, size: usize) -> c_ulong {
    ioctl_expr(_IOC_NONE, XEN_GNT_TYPE, nr, size as c_uint)
}

// #define IOCTL_GNTALLOC_ALLOC_GREF _IOC(_IOC_NONE, 'G', 5, sizeof(struct ioctl_gntalloc_alloc_gref))
pub fn ioctl_gntalloc_alloc_gref_nr() -> c_ulong {
    gnt_ioc(5, size_of::<ioctl_gntalloc_alloc_gref>())
}

// #define IOCTL_GNTALLOC_DEALLOC_GREF _IOC(_IOC_NONE, 'G', 6, sizeof(struct ioctl_gntalloc_dealloc_gref))
pub fn ioctl_gntalloc_dealloc_gref_nr() -> c_ulong {
    gnt_ioc(6, size_of::<ioctl_gntalloc_dealloc_gref>())
}

// #define IOCTL_GNTALLOC_SET_UNMAP_NOTIFY _IOC(_IOC_NONE, 'G', 7, sizeof(struct ioctl_gntalloc_unmap_notify))
pub fn ioctl_gntalloc_set_unmap_notify_nr() -> c_ulong {
    gnt_ioc(7, size_of::<ioctl_unmap_notify>())
}

// #define IOCTL_GNTDEV_MAP_GRANT_REF _IOC(_IOC_NONE, 'G', 0, sizeof(struct ioctl_gntdev_map_grant_ref))
pub fn ioctl_gntdev_map_grant_ref_nr() -> c_ulong {
    gnt_ioc(0, size_of::<ioctl_gntdev_map_grant_ref>())
}

// #define IOCTL_GNTDEV_UNMAP_GRANT_REF _IOC(_IOC_NONE, 'G', 1, sizeof(struct ioctl_gntdev_unmap_grant_ref))
pub fn ioctl_gntdev_unmap_grant_ref_nr() -> c_ulong {
    gnt_ioc(1, size_of::<ioctl_gntdev_unmap_grant_ref>())
}

// #define IOCTL_GNTDEV_SET_UNMAP_NOTIFY _IOC(_IOC_NONE, 'G', 7, sizeof(struct ioctl_gntdev_unmap_notify))
pub fn ioctl_gntdev_set_unmap_notify_nr() -> c_ulong {
    gnt_ioc(7, size_of::<ioctl_unmap_notify>())
}

// #define IOCTL_GNTDEV_GRANT_COPY _IOC(_IOC_NONE, 'G', 8, sizeof(struct ioctl_gntdev_grant_copy))
pub fn ioctl_gntdev_grant_copy_nr() -> c_ulong {
    gnt_ioc(8, size_of::<ioctl_gntdev_grant_copy>())
}

/// Zeroed, 8-byte aligned storage for a variable length ioctl argument of
/// `header` bytes followed by `count` trailing entries of `entry` bytes.
///
/// The fixed struct already includes room for one entry.
pub fn fam_buffer(header: usize, entry: usize, count: usize) -> Vec<u64> {
    let extra = count.saturating_sub(1) * entry;
    let words = (header + extra + 7) / 8;
    vec![0u64; words]
}
