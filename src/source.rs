//! Memory-owning side of a channel.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::backend::xen::{XenAllocDevice, GNTALLOC_PATH};
use crate::backend::{GrantAllocDevice, GrantFlags, NotifyAction};
use crate::config::ChannelConfig;
use crate::error::{Error, Result};
use crate::memory::{SharedPage, PAGE_SIZE};
use crate::{DomainId, GrantRef};

/// Pages granted to one remote domain.
///
/// Returned by [`GrantSource::allocate`] and consumed by
/// [`GrantSource::deallocate`]. A handle that is dropped while still live
/// revokes its grants on the way out.
pub struct GrantHandle {
    refs: Vec<GrantRef>,
    domid: DomainId,
    index: u64,
    device: Arc<dyn GrantAllocDevice>,
    live: bool,
}

impl GrantHandle {
    /// References to publish to the consumer, one per page.
    pub fn refs(&self) -> &[GrantRef] {
        &self.refs
    }

    /// Number of granted pages.
    pub fn count(&self) -> u32 {
        self.refs.len() as u32
    }

    /// Domain the pages are granted to.
    pub fn domid(&self) -> DomainId {
        self.domid
    }

    /// Device index of the allocation.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Size of the allocation in bytes.
    pub fn len(&self) -> usize {
        self.refs.len() * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Whether the grants have not been revoked yet.
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Revoke the grants. Stays live, and so retryable, if the device refuses.
    pub(crate) fn dealloc(&mut self) -> Result<()> {
        if !self.live {
            return Ok(());
        }

        self.device
            .dealloc_grant_ref(self.index, self.count())
            .map_err(|source| Error::Device {
                op: "DEALLOC_GRANT_REF",
                source,
            })?;
        self.live = false;

        log::info!(
            "revoked {} grant(s) {:?} to domain {}",
            self.refs.len(),
            self.refs,
            self.domid
        );
        Ok(())
    }
}

impl fmt::Debug for GrantHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrantHandle")
            .field("refs", &self.refs)
            .field("domid", &self.domid)
            .field("index", &format_args!("0x{:x}", self.index))
            .field("backend", &self.device.name())
            .field("live", &self.live)
            .finish()
    }
}

impl Drop for GrantHandle {
    fn drop(&mut self) {
        if self.live {
            log::warn!(
                "grant handle at index 0x{:x} dropped while live, revoking",
                self.index
            );
            if let Err(e) = self.dealloc() {
                log::warn!("{}", e);
            }
        }
    }
}

/// Allocates pages and grants them to another domain.
///
/// # Example
///
/// ```rust,no_run
/// use gntshm::{GrantFlags, GrantSource};
///
/// let source = GrantSource::open_default()?;
/// let handle = source.allocate(0, 1, GrantFlags::WRITABLE)?;
/// for gref in handle.refs() {
///     println!("gref: {}", gref);
/// }
/// source.deallocate(handle)?;
/// # Ok::<(), gntshm::Error>(())
/// ```
#[derive(Clone)]
pub struct GrantSource {
    device: Arc<dyn GrantAllocDevice>,
}

impl GrantSource {
    /// Use an already open allocation device.
    pub fn new(device: Arc<dyn GrantAllocDevice>) -> Self {
        Self { device }
    }

    /// Open the allocation device at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Arc::new(XenAllocDevice::open(path)?)))
    }

    /// Open `/dev/xen/gntalloc`.
    pub fn open_default() -> Result<Self> {
        Self::open(GNTALLOC_PATH)
    }

    /// Open the allocation device named by `config`.
    pub fn from_config(config: &ChannelConfig) -> Result<Self> {
        Self::open(config.gntalloc_path())
    }

    /// Name of the backend in use.
    pub fn backend_name(&self) -> &'static str {
        self.device.name()
    }

    /// Allocate `page_count` zeroed pages and grant each to `domid`.
    pub fn allocate(&self, domid: DomainId, page_count: u32, flags: GrantFlags) -> Result<GrantHandle> {
        if page_count == 0 {
            return Err(Error::InvalidPageCount(page_count));
        }

        let allocation = self
            .device
            .alloc_grant_ref(domid, page_count, flags)
            .map_err(|source| Error::AllocationRejected {
                domid,
                count: page_count,
                source,
            })?;

        log::info!(
            "granted {} page(s) to domain {} at index 0x{:x}: {:?}",
            page_count,
            domid,
            allocation.index,
            allocation.refs
        );

        Ok(GrantHandle {
            refs: allocation.refs,
            domid,
            index: allocation.index,
            device: Arc::clone(&self.device),
            live: true,
        })
    }

    /// Allocate and map in one step.
    ///
    /// If the local mapping fails the fresh grants are revoked before the
    /// error is returned.
    pub fn allocate_mapped(
        &self,
        domid: DomainId,
        page_count: u32,
        flags: GrantFlags,
    ) -> Result<(GrantHandle, SharedPage)> {
        let handle = self.allocate(domid, page_count, flags)?;
        match self.map_local(&handle) {
            Ok(page) => Ok((handle, page)),
            Err(e) => {
                if let Err(dealloc) = self.deallocate(handle) {
                    log::warn!("{}", dealloc);
                }
                Err(e)
            }
        }
    }

    /// Map the granted pages into this process, read/write.
    pub fn map_local(&self, handle: &GrantHandle) -> Result<SharedPage> {
        let len = handle.len();
        let ptr = handle
            .device
            .mmap(handle.index, len, true)
            .map_err(|source| Error::MapFailed {
                index: handle.index,
                len,
                source,
            })?;

        log::debug!("mapped {} bytes of index 0x{:x}", len, handle.index);
        // SAFETY: fresh mapping of exactly `len` bytes, owned by the page from here on.
        Ok(unsafe { SharedPage::from_raw(ptr, len, handle.index) })
    }

    /// Drop the local mapping. Calling this again is a no-op.
    pub fn unmap_local(&self, page: &mut SharedPage) -> Result<()> {
        page.unmap()
    }

    /// Revoke the grants.
    ///
    /// The consumer must have unmapped the pages first; use a
    /// [`TeardownCoordinator`](crate::TeardownCoordinator) to enforce that.
    /// If the device refuses, dropping the handle tries once more.
    pub fn deallocate(&self, mut handle: GrantHandle) -> Result<()> {
        handle.dealloc()
    }

    /// Register a notification on the byte at `offset` into the allocation.
    ///
    /// Fires when this side's grants go away, letting the consumer notice.
    pub fn set_unmap_notify(
        &self,
        handle: &GrantHandle,
        offset: usize,
        action: NotifyAction,
        event_port: u32,
    ) -> Result<()> {
        if offset >= handle.len() {
            return Err(Error::BufferTooSmall {
                needed: offset + 1,
                actual: handle.len(),
            });
        }

        handle
            .device
            .set_unmap_notify(handle.index + offset as u64, action, event_port)
            .map_err(|source| Error::Device {
                op: "SET_UNMAP_NOTIFY",
                source,
            })
    }
}

impl fmt::Debug for GrantSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrantSource")
            .field("backend", &self.device.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{FaultOp, SimHypervisor};

    fn source(hv: &SimHypervisor, domid: DomainId) -> GrantSource {
        GrantSource::new(Arc::new(hv.open_alloc(domid)))
    }

    #[test]
    fn test_allocate_zero_pages() {
        let hv = SimHypervisor::new().unwrap();
        let err = source(&hv, 1).allocate(0, 0, GrantFlags::WRITABLE).unwrap_err();
        assert!(matches!(err, Error::InvalidPageCount(0)));
        assert_eq!(hv.live_grants(), 0);
    }

    #[test]
    fn test_allocate_and_deallocate() {
        let hv = SimHypervisor::new().unwrap();
        let source = source(&hv, 1);

        let handle = source.allocate(0, 3, GrantFlags::WRITABLE).unwrap();
        assert_eq!(handle.count(), 3);
        assert_eq!(handle.len(), 3 * PAGE_SIZE);
        assert!(handle.refs().iter().all(|&r| hv.is_granted(1, r)));

        let refs = handle.refs().to_vec();
        source.deallocate(handle).unwrap();
        assert!(refs.iter().all(|&r| !hv.is_granted(1, r)));
    }

    #[test]
    fn test_drop_revokes() {
        let hv = SimHypervisor::new().unwrap();
        let source = source(&hv, 1);

        let gref = {
            let handle = source.allocate(0, 1, GrantFlags::WRITABLE).unwrap();
            handle.refs()[0]
        };
        assert!(!hv.is_granted(1, gref));
    }

    #[test]
    fn test_allocate_mapped_is_zeroed() {
        let hv = SimHypervisor::new().unwrap();
        let source = source(&hv, 1);

        let (handle, mut page) = source.allocate_mapped(0, 2, GrantFlags::WRITABLE).unwrap();
        assert_eq!(page.len(), 2 * PAGE_SIZE);
        assert!(page.as_slice().iter().all(|&b| b == 0));

        page.write(PAGE_SIZE, b"second").unwrap();
        let frame = hv.read_page(1, handle.refs()[1]).unwrap();
        assert_eq!(&frame[..6], b"second");

        source.unmap_local(&mut page).unwrap();
        source.unmap_local(&mut page).unwrap();
        source.deallocate(handle).unwrap();
    }

    #[test]
    fn test_failed_dealloc_is_retried_on_drop() {
        let hv = SimHypervisor::new().unwrap();
        let source = source(&hv, 1);
        let handle = source.allocate(0, 1, GrantFlags::WRITABLE).unwrap();
        let gref = handle.refs()[0];

        hv.fail_next(FaultOp::Dealloc, libc::EINTR);
        let err = source.deallocate(handle).unwrap_err();
        assert!(matches!(err, Error::Device { op: "DEALLOC_GRANT_REF", .. }));
        assert!(!hv.is_granted(1, gref));
    }

    #[test]
    fn test_exhaustion_is_rejected() {
        let hv = SimHypervisor::new().unwrap().with_grant_limit(1);
        let source = source(&hv, 1);

        let _held = source.allocate(0, 1, GrantFlags::WRITABLE).unwrap();
        let err = source.allocate(0, 1, GrantFlags::WRITABLE).unwrap_err();
        assert!(matches!(err, Error::AllocationRejected { domid: 0, count: 1, .. }));
    }

    #[test]
    fn test_set_unmap_notify_bounds() {
        let hv = SimHypervisor::new().unwrap();
        let source = source(&hv, 1);
        let handle = source.allocate(0, 1, GrantFlags::WRITABLE).unwrap();

        let err = source
            .set_unmap_notify(&handle, PAGE_SIZE, NotifyAction::CLEAR_BYTE, 0)
            .unwrap_err();
        assert!(matches!(err, Error::BufferTooSmall { .. }));
        source
            .set_unmap_notify(&handle, PAGE_SIZE - 1, NotifyAction::SEND_EVENT, 4)
            .unwrap();

        source.deallocate(handle).unwrap();
        assert_eq!(hv.events(), vec![4]);
    }
}
