//! Linux Xen grant device backend.
//!
//! This backend drives the grant table through the Linux kernel drivers.
//!
//! ## Requirements
//!
//! - Running in a Xen domain with a Linux kernel
//! - `xen-gntalloc` loaded for the sharing side (`/dev/xen/gntalloc`)
//! - `xen-gntdev` loaded for the mapping side (`/dev/xen/gntdev`)
//! - Permission to open the device nodes (usually root)

pub mod bindings;

use std::fs::{File, OpenOptions};
use std::io;
use std::mem::size_of;
use std::os::raw::c_void;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use vmm_sys_util::ioctl::{ioctl_with_mut_ptr, ioctl_with_mut_ref, ioctl_with_ref};

use self::bindings::*;
use crate::backend::{Allocation, CopyEndpoint, CopySegment, GrantAllocDevice, GrantFlags, GrantMapDevice, NotifyAction};
use crate::error::{Error, GntStatus, Result};
use crate::memory::mmap_device;
use crate::{DomainId, GrantRef};

/// Default path of the allocation device.
pub const GNTALLOC_PATH: &str = "/dev/xen/gntalloc";

/// Default path of the mapping device.
pub const GNTDEV_PATH: &str = "/dev/xen/gntdev";

/// Check if the grant devices are present on this system.
pub fn is_available() -> bool {
    Path::new(GNTALLOC_PATH).exists() || Path::new(GNTDEV_PATH).exists()
}

fn open_device(path: &Path, driver: &'static str) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| match source.raw_os_error() {
            Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO) => Error::DeviceUnavailable {
                path: path.to_path_buf(),
                driver,
                source,
            },
            _ => Error::Io(source),
        })
}

fn check(ret: i32) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// An open `/dev/xen/gntalloc` session.
///
/// Closing the session revokes every grant it still holds.
#[derive(Debug)]
pub struct XenAllocDevice {
    file: File,
    path: PathBuf,
}

impl XenAllocDevice {
    /// Open the allocation device at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = open_device(path, "xen-gntalloc")?;
        log::debug!("opened {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Path the device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRawFd for XenAllocDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl GrantAllocDevice for XenAllocDevice {
    fn alloc_grant_ref(&self, domid: DomainId, count: u32, flags: GrantFlags) -> io::Result<Allocation> {
        let mut buf = fam_buffer(
            size_of::<ioctl_gntalloc_alloc_gref>(),
            size_of::<u32>(),
            count as usize,
        );
        let arg = buf.as_mut_ptr() as *mut ioctl_gntalloc_alloc_gref;

        let mut gnt_flags = 0;
        if flags.contains(GrantFlags::WRITABLE) {
            gnt_flags |= GNTALLOC_FLAG_WRITABLE;
        }

        // SAFETY: buf is zeroed, 8-byte aligned and large enough for the
        // header plus `count` grant ids.
        unsafe {
            (*arg).domid = domid;
            (*arg).flags = gnt_flags;
            (*arg).count = count;
        }

        // SAFETY: the driver writes at most `count` ids past the header.
        check(unsafe { ioctl_with_mut_ptr(self, ioctl_gntalloc_alloc_gref_nr(), arg) })?;

        // SAFETY: the driver filled index and `count` ids.
        let allocation = unsafe {
            let ids = std::ptr::addr_of!((*arg).gref_ids) as *const u32;
            Allocation {
                index: (*arg).index,
                refs: std::slice::from_raw_parts(ids, count as usize).to_vec(),
            }
        };
        Ok(allocation)
    }

    fn dealloc_grant_ref(&self, index: u64, count: u32) -> io::Result<()> {
        let arg = ioctl_gntalloc_dealloc_gref {
            index,
            count,
            pad: 0,
        };
        // SAFETY: the driver only reads the argument.
        check(unsafe { ioctl_with_ref(self, ioctl_gntalloc_dealloc_gref_nr(), &arg) })
    }

    fn set_unmap_notify(&self, offset: u64, action: NotifyAction, event_port: u32) -> io::Result<()> {
        let arg = notify_arg(offset, action, event_port);
        // SAFETY: the driver only reads the argument.
        check(unsafe { ioctl_with_ref(self, ioctl_gntalloc_set_unmap_notify_nr(), &arg) })
    }

    fn mmap(&self, index: u64, len: usize, writable: bool) -> io::Result<NonNull<u8>> {
        mmap_device(self, index, len, writable)
    }

    fn name(&self) -> &'static str {
        "xen"
    }
}

/// An open `/dev/xen/gntdev` session.
///
/// Closing the session unmaps every grant it still maps, firing any
/// registered unmap notifications.
#[derive(Debug)]
pub struct XenMapDevice {
    file: File,
    path: PathBuf,
}

impl XenMapDevice {
    /// Open the mapping device at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = open_device(path, "xen-gntdev")?;
        log::debug!("opened {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Path the device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRawFd for XenMapDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl GrantMapDevice for XenMapDevice {
    fn map_grant_ref(&self, refs: &[(DomainId, GrantRef)]) -> io::Result<u64> {
        let mut buf = fam_buffer(
            size_of::<ioctl_gntdev_map_grant_ref>(),
            size_of::<ioctl_gntdev_grant_ref>(),
            refs.len(),
        );
        let arg = buf.as_mut_ptr() as *mut ioctl_gntdev_map_grant_ref;

        // SAFETY: buf is zeroed, 8-byte aligned and holds `refs.len()` entries.
        unsafe {
            (*arg).count = refs.len() as u32;
            let entries = std::ptr::addr_of_mut!((*arg).refs) as *mut ioctl_gntdev_grant_ref;
            for (i, &(domid, gref)) in refs.iter().enumerate() {
                entries.add(i).write(ioctl_gntdev_grant_ref {
                    domid: domid as u32,
                    r#ref: gref,
                });
            }
        }

        // SAFETY: the driver reads `count` entries and writes index.
        check(unsafe { ioctl_with_mut_ptr(self, ioctl_gntdev_map_grant_ref_nr(), arg) })?;

        // SAFETY: filled by the driver above.
        Ok(unsafe { (*arg).index })
    }

    fn unmap_grant_ref(&self, index: u64, count: u32) -> io::Result<()> {
        let arg = ioctl_gntdev_unmap_grant_ref {
            index,
            count,
            pad: 0,
        };
        // SAFETY: the driver only reads the argument.
        check(unsafe { ioctl_with_ref(self, ioctl_gntdev_unmap_grant_ref_nr(), &arg) })
    }

    fn set_unmap_notify(&self, offset: u64, action: NotifyAction, event_port: u32) -> io::Result<()> {
        let arg = notify_arg(offset, action, event_port);
        // SAFETY: the driver only reads the argument.
        check(unsafe { ioctl_with_ref(self, ioctl_gntdev_set_unmap_notify_nr(), &arg) })
    }

    unsafe fn grant_copy(&self, segments: &mut [CopySegment]) -> io::Result<()> {
        let mut raw: Vec<gntdev_grant_copy_segment> = segments.iter().map(raw_segment).collect();
        let mut arg = ioctl_gntdev_grant_copy {
            count: raw.len() as u32,
            segments: raw.as_mut_ptr(),
        };

        // SAFETY: `raw` outlives the call and the caller vouches for every
        // local pointer in it.
        check(ioctl_with_mut_ref(self, ioctl_gntdev_grant_copy_nr(), &mut arg))?;

        for (seg, raw) in segments.iter_mut().zip(raw.iter()) {
            seg.status = GntStatus(raw.status);
        }
        Ok(())
    }

    fn mmap(&self, index: u64, len: usize, writable: bool) -> io::Result<NonNull<u8>> {
        mmap_device(self, index, len, writable)
    }

    fn name(&self) -> &'static str {
        "xen"
    }
}

fn notify_arg(offset: u64, action: NotifyAction, event_port: u32) -> ioctl_unmap_notify {
    let mut raw_action = 0;
    if action.contains(NotifyAction::CLEAR_BYTE) {
        raw_action |= UNMAP_NOTIFY_CLEAR_BYTE;
    }
    if action.contains(NotifyAction::SEND_EVENT) {
        raw_action |= UNMAP_NOTIFY_SEND_EVENT;
    }
    ioctl_unmap_notify {
        index: offset,
        action: raw_action,
        event_channel_port: event_port,
    }
}

fn raw_endpoint(endpoint: &CopyEndpoint) -> (gntdev_copy_ptr, bool) {
    match *endpoint {
        CopyEndpoint::Foreign { domid, gref, offset } => (
            gntdev_copy_ptr {
                foreign: gntdev_copy_foreign {
                    r#ref: gref,
                    offset,
                    domid,
                },
            },
            true,
        ),
        CopyEndpoint::Local(ptr) => (
            gntdev_copy_ptr {
                virt: ptr as *mut c_void,
            },
            false,
        ),
    }
}

fn raw_segment(seg: &CopySegment) -> gntdev_grant_copy_segment {
    let (source, source_gref) = raw_endpoint(&seg.source);
    let (dest, dest_gref) = raw_endpoint(&seg.dest);

    let mut flags = 0;
    if source_gref {
        flags |= GNTCOPY_SOURCE_GREF;
    }
    if dest_gref {
        flags |= GNTCOPY_DEST_GREF;
    }

    gntdev_grant_copy_segment {
        source,
        dest,
        len: seg.len,
        flags,
        status: 0,
    }
}
