//! Consuming side of a channel.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::backend::xen::{XenMapDevice, GNTDEV_PATH};
use crate::backend::{GrantMapDevice, NotifyAction};
use crate::config::ChannelConfig;
use crate::error::{Error, Result};
use crate::memory::{notify_byte_offset, SharedPage, PAGE_SIZE};
use crate::{DomainId, GrantRef};

/// Remote pages entered in this domain's mapping table.
///
/// Dropping a live handle unmaps it.
pub struct MappingHandle {
    refs: Vec<(DomainId, GrantRef)>,
    index: u64,
    device: Arc<dyn GrantMapDevice>,
    live: bool,
}

impl MappingHandle {
    /// Mapped references with their granting domains, in layout order.
    pub fn refs(&self) -> &[(DomainId, GrantRef)] {
        &self.refs
    }

    /// Number of mapped pages.
    pub fn count(&self) -> u32 {
        self.refs.len() as u32
    }

    /// Device index of the mapping.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.refs.len() * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Whether the mapping-table entry still exists.
    pub fn is_live(&self) -> bool {
        self.live
    }

    fn grant_refs(&self) -> Vec<GrantRef> {
        self.refs.iter().map(|&(_, r)| r).collect()
    }

    fn unmap(&mut self) -> Result<()> {
        if !self.live {
            return Ok(());
        }

        self.device
            .unmap_grant_ref(self.index, self.count())
            .map_err(|source| Error::Device {
                op: "UNMAP_GRANT_REF",
                source,
            })?;
        self.live = false;

        log::info!("unmapped {} remote page(s) at index 0x{:x}", self.refs.len(), self.index);
        Ok(())
    }
}

impl fmt::Debug for MappingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingHandle")
            .field("refs", &self.refs)
            .field("index", &format_args!("0x{:x}", self.index))
            .field("backend", &self.device.name())
            .field("live", &self.live)
            .finish()
    }
}

impl Drop for MappingHandle {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            log::warn!("dropping mapping at index 0x{:x}: {}", self.index, e);
        }
    }
}

/// Maps pages another domain granted to this one.
#[derive(Clone)]
pub struct GrantSink {
    device: Arc<dyn GrantMapDevice>,
}

impl GrantSink {
    /// Use an already open mapping device.
    pub fn new(device: Arc<dyn GrantMapDevice>) -> Self {
        Self { device }
    }

    /// Open the mapping device at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Arc::new(XenMapDevice::open(path)?)))
    }

    /// Open `/dev/xen/gntdev`.
    pub fn open_default() -> Result<Self> {
        Self::open(GNTDEV_PATH)
    }

    /// Open the mapping device named by `config`.
    pub fn from_config(config: &ChannelConfig) -> Result<Self> {
        Self::open(config.gntdev_path())
    }

    /// Name of the backend in use.
    pub fn backend_name(&self) -> &'static str {
        self.device.name()
    }

    pub(crate) fn device(&self) -> &Arc<dyn GrantMapDevice> {
        &self.device
    }

    /// Enter `refs` granted by `domid` into the mapping table.
    pub fn map_remote(&self, domid: DomainId, refs: &[GrantRef]) -> Result<MappingHandle> {
        let pairs: Vec<(DomainId, GrantRef)> = refs.iter().map(|&r| (domid, r)).collect();
        self.map_remote_pairs(&pairs)
    }

    /// Enter references that may come from different domains.
    ///
    /// Page `i` of the resulting mapping is `refs[i]`.
    pub fn map_remote_pairs(&self, refs: &[(DomainId, GrantRef)]) -> Result<MappingHandle> {
        let Some(&(first_domid, _)) = refs.first() else {
            return Err(Error::NoReferences);
        };

        let index = self.device.map_grant_ref(refs).map_err(|source| {
            Error::from_map(
                "MAP_GRANT_REF",
                first_domid,
                refs.iter().map(|&(_, r)| r).collect(),
                source,
            )
        })?;

        log::info!("mapped {} remote page(s) at index 0x{:x}: {:?}", refs.len(), index, refs);

        Ok(MappingHandle {
            refs: refs.to_vec(),
            index,
            device: Arc::clone(&self.device),
            live: true,
        })
    }

    /// Map the pages into this process, read/write.
    pub fn map_local(&self, handle: &MappingHandle) -> Result<SharedPage> {
        self.mmap(handle, true)
    }

    /// Map the pages into this process, read-only.
    ///
    /// Required for pages granted without write access.
    pub fn map_local_readonly(&self, handle: &MappingHandle) -> Result<SharedPage> {
        self.mmap(handle, false)
    }

    /// The grants themselves are checked here, so a revoked or foreign
    /// reference fails as `InvalidReference` or `PermissionDenied`.
    fn mmap(&self, handle: &MappingHandle, writable: bool) -> Result<SharedPage> {
        let Some(&(domid, _)) = handle.refs.first() else {
            return Err(Error::NoReferences);
        };
        let len = handle.len();
        let ptr = handle
            .device
            .mmap(handle.index, len, writable)
            .map_err(|source| Error::from_map("mmap", domid, handle.grant_refs(), source))?;

        log::debug!(
            "mapped {} bytes of index 0x{:x} ({})",
            len,
            handle.index,
            if writable { "rw" } else { "ro" }
        );
        // SAFETY: fresh mapping of exactly `len` bytes, owned by the page from here on.
        Ok(unsafe { SharedPage::from_raw(ptr, len, handle.index) })
    }

    /// Drop the local mapping. Calling this again is a no-op.
    pub fn unmap_local(&self, page: &mut SharedPage) -> Result<()> {
        page.unmap()
    }

    /// Remove the mapping-table entry. Calling this again is a no-op.
    ///
    /// The handle stays live if the device refuses, so the call can be retried.
    ///
    /// Local mappings of the pages should be dropped first.
    pub fn unmap_remote(&self, handle: &mut MappingHandle) -> Result<()> {
        handle.unmap()
    }

    /// Ask the kernel to act on the notify byte when this mapping goes away.
    ///
    /// With [`NotifyAction::CLEAR_BYTE`] the last byte of the last page is
    /// zeroed, which is what the source's
    /// [`TeardownCoordinator`](crate::TeardownCoordinator) waits for. The
    /// notification also fires if this process exits without unmapping.
    pub fn set_unmap_notify(&self, handle: &MappingHandle, action: NotifyAction, event_port: u32) -> Result<()> {
        if !handle.live {
            return Err(Error::InvalidReference {
                op: "SET_UNMAP_NOTIFY",
                domid: handle.refs.first().map_or(0, |&(d, _)| d),
                refs: handle.grant_refs(),
                source: io::Error::new(io::ErrorKind::NotFound, "mapping already removed"),
            });
        }

        let offset = handle.index + notify_byte_offset(handle.refs.len()) as u64;
        handle
            .device
            .set_unmap_notify(offset, action, event_port)
            .map_err(|source| Error::Device {
                op: "SET_UNMAP_NOTIFY",
                source,
            })?;

        log::debug!("unmap notify {:?} registered at 0x{:x}", action, offset);
        Ok(())
    }
}

impl fmt::Debug for GrantSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrantSink")
            .field("backend", &self.device.name())
            .finish()
    }
}
