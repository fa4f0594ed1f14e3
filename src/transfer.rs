//! Getting remote bytes into this process.

use crate::backend::NotifyAction;
use crate::copy::CopyPath;
use crate::error::{Error, Result};
use crate::memory::PAGE_SIZE;
use crate::sink::GrantSink;
use crate::{DomainId, GrantRef};

/// How a sink reads a channel. Chosen by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferStrategy {
    /// Map the pages, read them, unmap.
    #[default]
    DirectMap,
    /// Have the hypervisor copy the pages; no mapping ever exists.
    OneShotCopy,
}

/// What the sink asks for when it lets go of the pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmapNotify {
    pub action: NotifyAction,
    /// Event channel port for [`NotifyAction::SEND_EVENT`].
    pub event_port: u32,
}

impl UnmapNotify {
    /// Clear the source's notify byte.
    pub fn clear_byte() -> Self {
        Self {
            action: NotifyAction::CLEAR_BYTE,
            event_port: 0,
        }
    }

    /// Also signal `port`.
    pub fn with_event(mut self, port: u32) -> Self {
        self.action |= NotifyAction::SEND_EVENT;
        self.event_port = port;
        self
    }

    fn clears_byte(&self) -> bool {
        self.action.contains(NotifyAction::CLEAR_BYTE)
    }
}

impl TransferStrategy {
    /// Read all pages of `refs` granted by `domid`.
    ///
    /// See [`with_pages`](Self::with_pages) for what `notify` does. The
    /// returned bytes are the ones read before the notification.
    pub fn fetch(
        self,
        sink: &GrantSink,
        domid: DomainId,
        refs: &[GrantRef],
        notify: Option<UnmapNotify>,
    ) -> Result<Vec<u8>> {
        self.with_pages(sink, domid, refs, notify, |data| data.to_vec())
    }

    /// Run `f` over the contents of `refs`, then let go of them.
    ///
    /// A byte-clearing `notify` is honoured by the unmap notification for
    /// [`DirectMap`](Self::DirectMap), which then maps the pages writable,
    /// and by a one-byte grant copy for [`OneShotCopy`](Self::OneShotCopy).
    /// Either way the grant must be writable. Event ports only work with
    /// [`DirectMap`](Self::DirectMap).
    pub fn with_pages<R>(
        self,
        sink: &GrantSink,
        domid: DomainId,
        refs: &[GrantRef],
        notify: Option<UnmapNotify>,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R> {
        let last_ref = *refs.last().ok_or(Error::NoReferences)?;
        log::debug!("fetching {} page(s) from domain {} by {:?}", refs.len(), domid, self);

        match self {
            TransferStrategy::DirectMap => {
                let mut mapping = sink.map_remote(domid, refs)?;
                // The kernel writes the byte through this mapping on unmap.
                let mut page = if notify.map_or(false, |n| n.clears_byte()) {
                    sink.map_local(&mapping)?
                } else {
                    sink.map_local_readonly(&mapping)?
                };
                if let Some(n) = notify {
                    sink.set_unmap_notify(&mapping, n.action, n.event_port)?;
                }

                let out = f(page.as_slice());
                sink.unmap_local(&mut page)?;
                sink.unmap_remote(&mut mapping)?;
                Ok(out)
            }
            TransferStrategy::OneShotCopy => {
                let copy = CopyPath::for_sink(sink);
                let mut data = vec![0u8; refs.len() * PAGE_SIZE];
                copy.copy_from(domid, refs, &mut data)?;
                let out = f(&data);

                if let Some(n) = notify {
                    if n.action.contains(NotifyAction::SEND_EVENT) {
                        log::warn!("event port {} is not signalled after a copy", n.event_port);
                    }
                    if n.clears_byte() {
                        copy.clear_notify_byte(domid, last_ref)?;
                    }
                }
                Ok(out)
            }
        }
    }
}

impl std::fmt::Display for TransferStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStrategy::DirectMap => f.write_str("map"),
            TransferStrategy::OneShotCopy => f.write_str("copy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimHypervisor;
    use crate::backend::{GrantAllocDevice, GrantFlags};
    use std::sync::Arc;

    #[test]
    fn test_fetch_no_references() {
        let hv = SimHypervisor::new().unwrap();
        let sink = GrantSink::new(Arc::new(hv.open_map(0)));
        for strategy in [TransferStrategy::DirectMap, TransferStrategy::OneShotCopy] {
            assert!(matches!(strategy.fetch(&sink, 1, &[], None), Err(Error::NoReferences)));
        }
    }

    #[test]
    fn test_strategies_agree() {
        let hv = SimHypervisor::new().unwrap();
        let alloc = hv.open_alloc(1);
        let g = alloc.alloc_grant_ref(0, 2, GrantFlags::WRITABLE).unwrap();
        let sink = GrantSink::new(Arc::new(hv.open_map(0)));

        let mut payload = vec![0u8; 2 * PAGE_SIZE];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        CopyPath::for_sink(&sink).copy_to(1, &g.refs, &payload).unwrap();

        let mapped = TransferStrategy::DirectMap.fetch(&sink, 1, &g.refs, None).unwrap();
        let copied = TransferStrategy::OneShotCopy.fetch(&sink, 1, &g.refs, None).unwrap();
        assert_eq!(mapped, payload);
        assert_eq!(copied, payload);
    }

    #[test]
    fn test_fetch_clears_notify_byte() {
        for strategy in [TransferStrategy::DirectMap, TransferStrategy::OneShotCopy] {
            let hv = SimHypervisor::new().unwrap();
            let alloc = hv.open_alloc(1);
            let g = alloc.alloc_grant_ref(0, 1, GrantFlags::WRITABLE).unwrap();
            let sink = GrantSink::new(Arc::new(hv.open_map(0)));

            let mut page = vec![0u8; PAGE_SIZE];
            page[PAGE_SIZE - 1] = 0xA5;
            CopyPath::for_sink(&sink).copy_to(1, &g.refs, &page).unwrap();

            let data = strategy.fetch(&sink, 1, &g.refs, Some(UnmapNotify::clear_byte())).unwrap();
            assert_eq!(data[PAGE_SIZE - 1], 0xA5, "{}", strategy);
            assert_eq!(hv.read_page(1, g.refs[0]).unwrap()[PAGE_SIZE - 1], 0, "{}", strategy);
        }
    }

    #[test]
    fn test_clear_byte_refused_on_readonly_grant() {
        for strategy in [TransferStrategy::DirectMap, TransferStrategy::OneShotCopy] {
            let hv = SimHypervisor::new().unwrap();
            let alloc = hv.open_alloc(1);
            let g = alloc.alloc_grant_ref(0, 1, GrantFlags::empty()).unwrap();
            let ptr = alloc.mmap(g.index, PAGE_SIZE, true).unwrap().as_ptr();
            // SAFETY: one page was just mapped.
            unsafe { *ptr.add(PAGE_SIZE - 1) = 0xA5 };
            let sink = GrantSink::new(Arc::new(hv.open_map(0)));

            let err = strategy
                .fetch(&sink, 1, &g.refs, Some(UnmapNotify::clear_byte()))
                .unwrap_err();
            assert!(
                matches!(err, Error::PermissionDenied { .. } | Error::CopySegmentFailed { .. }),
                "{}: {}",
                strategy,
                err
            );
            drop(sink);
            assert_eq!(hv.read_page(1, g.refs[0]).unwrap()[PAGE_SIZE - 1], 0xA5, "{}", strategy);

            // Reading without asking for the byte still works.
            let sink = GrantSink::new(Arc::new(hv.open_map(0)));
            let data = strategy.fetch(&sink, 1, &g.refs, None).unwrap();
            assert_eq!(data[PAGE_SIZE - 1], 0xA5, "{}", strategy);
            unsafe { libc::munmap(ptr as *mut libc::c_void, PAGE_SIZE) };
        }
    }

    #[test]
    fn test_event_port_signalled_by_direct_map() {
        let hv = SimHypervisor::new().unwrap();
        let alloc = hv.open_alloc(1);
        let g = alloc.alloc_grant_ref(0, 1, GrantFlags::WRITABLE).unwrap();
        let sink = GrantSink::new(Arc::new(hv.open_map(0)));

        let notify = UnmapNotify::clear_byte().with_event(7);
        let len = TransferStrategy::DirectMap
            .with_pages(&sink, 1, &g.refs, Some(notify), |data| data.len())
            .unwrap();
        assert_eq!(len, PAGE_SIZE);
        assert_eq!(hv.events(), vec![7]);

        TransferStrategy::OneShotCopy
            .fetch(&sink, 1, &g.refs, Some(notify))
            .unwrap();
        assert_eq!(hv.events(), vec![7]);
    }
}
