//! Local mapping of granted pages.

use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Map `len` bytes of a grant device at `index`.
///
/// Both `gntalloc` and `gntdev` hand out an index that is used directly as
/// the mmap offset of the device file.
pub fn mmap_device<F: AsRawFd>(
    fd: &F,
    index: u64,
    len: usize,
    writable: bool,
) -> io::Result<NonNull<u8>> {
    let prot = if writable {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_READ
    };

    // SAFETY: we request a fresh mapping chosen by the kernel, nothing else
    // in the address space is touched.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            prot,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            index as libc::off_t,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))
}

/// A locally mapped run of granted pages.
///
/// The memory may be written concurrently by the other domain at any time;
/// this type gives no consistency guarantee beyond what the payload protocol
/// builds on top. The mapping is released on [`SharedPage::unmap`] or drop.
#[derive(Debug)]
pub struct SharedPage {
    /// Start of the mapping, `None` once unmapped
    ptr: Option<NonNull<u8>>,
    /// Size of the mapping in bytes
    len: usize,
    /// Device index the mapping was created from
    index: u64,
}

// Safety: SharedPage owns its mapping and can be sent between threads
unsafe impl Send for SharedPage {}

impl SharedPage {
    /// Wrap an existing mapping.
    ///
    /// # Safety
    ///
    /// `ptr` must be the start of a live `mmap` of exactly `len` bytes that
    /// nothing else will unmap.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize, index: u64) -> Self {
        Self {
            ptr: Some(ptr),
            len,
            index,
        }
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of pages in the mapping.
    pub fn page_count(&self) -> usize {
        self.len / super::PAGE_SIZE
    }

    /// Device index this mapping belongs to.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Whether the mapping is still live.
    pub fn is_mapped(&self) -> bool {
        self.ptr.is_some()
    }

    /// Get a raw pointer to the mapping, null once unmapped.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.map_or(std::ptr::null(), |p| p.as_ptr() as *const u8)
    }

    /// Get a mutable raw pointer to the mapping, null once unmapped.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.map_or(std::ptr::null_mut(), |p| p.as_ptr())
    }

    /// Get a slice view of the mapping. Empty once unmapped.
    pub fn as_slice(&self) -> &[u8] {
        match self.ptr {
            // SAFETY: the mapping is live for as long as self.ptr is set.
            Some(p) => unsafe { std::slice::from_raw_parts(p.as_ptr(), self.len) },
            None => &[],
        }
    }

    /// Get a mutable slice view of the mapping. Empty once unmapped.
    ///
    /// Writing through a read-only mapping faults; only call this on pages
    /// mapped writable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.ptr {
            // SAFETY: the mapping is live for as long as self.ptr is set.
            Some(p) => unsafe { std::slice::from_raw_parts_mut(p.as_ptr(), self.len) },
            None => &mut [],
        }
    }

    /// Read bytes starting at `offset`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let src = self.range(offset, buf.len())?;
        // SAFETY: range() checked the bounds against the live mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Write bytes starting at `offset`.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let dst = self.range(offset, data.len())? as *mut u8;
        // SAFETY: range() checked the bounds against the live mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }

    /// Read one byte that the other domain or the hypervisor may change.
    pub fn read_volatile(&self, offset: usize) -> Result<u8> {
        let src = self.range(offset, 1)?;
        // SAFETY: in bounds of the live mapping.
        Ok(unsafe { std::ptr::read_volatile(src) })
    }

    /// Write one byte the other domain may be observing.
    pub fn write_volatile(&mut self, offset: usize, value: u8) -> Result<()> {
        let dst = self.range(offset, 1)? as *mut u8;
        // SAFETY: in bounds of the live mapping.
        unsafe { std::ptr::write_volatile(dst, value) };
        Ok(())
    }

    /// Current value of the notify byte (last byte of the last page).
    pub fn notify_byte(&self) -> Result<u8> {
        self.read_volatile(self.len.saturating_sub(1))
    }

    /// Set the notify byte.
    pub fn set_notify_byte(&mut self, value: u8) -> Result<()> {
        self.write_volatile(self.len.saturating_sub(1), value)
    }

    /// Release the mapping. Calling this again is a no-op.
    pub fn unmap(&mut self) -> Result<()> {
        let Some(ptr) = self.ptr.take() else {
            return Ok(());
        };

        // SAFETY: ptr/len describe a mapping we own, and taking ptr above
        // guarantees it is never unmapped twice.
        let ret = unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, self.len) };
        if ret != 0 {
            return Err(Error::Device {
                op: "munmap",
                source: io::Error::last_os_error(),
            });
        }

        log::debug!("unmapped {} bytes of index 0x{:x}", self.len, self.index);
        Ok(())
    }

    fn range(&self, offset: usize, len: usize) -> Result<*const u8> {
        let ptr = self.ptr.ok_or_else(|| Error::MapFailed {
            index: self.index,
            len: self.len,
            source: io::Error::from_raw_os_error(libc::EFAULT),
        })?;

        match offset.checked_add(len) {
            Some(end) if end <= self.len => {}
            _ => {
                return Err(Error::BufferTooSmall {
                    needed: offset.saturating_add(len),
                    actual: self.len,
                })
            }
        }

        // SAFETY: offset is within the mapping.
        Ok(unsafe { ptr.as_ptr().add(offset) })
    }
}

impl Drop for SharedPage {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            log::warn!("dropping shared page at index 0x{:x}: {}", self.index, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PAGE_SIZE;

    fn anonymous(len: usize) -> SharedPage {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED);
        unsafe { SharedPage::from_raw(NonNull::new(ptr as *mut u8).unwrap(), len, 0) }
    }

    #[test]
    fn test_shared_page_read_write() {
        let mut page = anonymous(PAGE_SIZE);

        page.write(0, b"hello").unwrap();

        let mut buf = [0u8; 5];
        page.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(page.as_slice()[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_shared_page_bounds() {
        let mut page = anonymous(PAGE_SIZE);
        assert!(page.write(PAGE_SIZE - 2, b"abc").is_err());
        assert!(page.read_volatile(PAGE_SIZE).is_err());
        assert!(page.write(usize::MAX, b"a").is_err());
    }

    #[test]
    fn test_notify_byte_is_last_byte() {
        let mut page = anonymous(2 * PAGE_SIZE);
        page.set_notify_byte(0x5a).unwrap();
        assert_eq!(page.notify_byte().unwrap(), 0x5a);
        assert_eq!(page.as_slice()[2 * PAGE_SIZE - 1], 0x5a);
        assert_eq!(page.page_count(), 2);
    }

    #[test]
    fn test_unmap_twice_is_noop() {
        let mut page = anonymous(PAGE_SIZE);
        page.unmap().unwrap();
        assert!(!page.is_mapped());
        page.unmap().unwrap();
        assert!(page.as_slice().is_empty());
        assert!(page.notify_byte().is_err());
    }

    #[test]
    fn test_mmap_device_rejects_unaligned_index() {
        let file = tempfile::tempfile().unwrap();
        let err = mmap_device(&file, 1, PAGE_SIZE, true).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }
}
