//! One-shot hypervisor copies to and from granted pages.
//!
//! A copy needs no mapping-table entry and leaves nothing to tear down, at
//! the price of moving the bytes on every access.

use std::sync::Arc;

use crate::backend::{CopySegment, GrantMapDevice};
use crate::error::{Error, Result};
use crate::memory::PAGE_SIZE;
use crate::sink::GrantSink;
use crate::{DomainId, GrantRef};

/// Copies through `GRANT_COPY` on a mapping device.
#[derive(Clone)]
pub struct CopyPath {
    device: Arc<dyn GrantMapDevice>,
}

impl CopyPath {
    /// Use an already open mapping device.
    pub fn new(device: Arc<dyn GrantMapDevice>) -> Self {
        Self { device }
    }

    /// Share the device of `sink`.
    pub fn for_sink(sink: &GrantSink) -> Self {
        Self::new(Arc::clone(sink.device()))
    }

    /// Copy whole pages out of `refs` into `dest`.
    ///
    /// Page `i` lands at `dest[i * PAGE_SIZE..]`. Segments are checked in
    /// order and the first failure is returned; pages before it have already
    /// been copied.
    pub fn copy_from(&self, domid: DomainId, refs: &[GrantRef], dest: &mut [u8]) -> Result<()> {
        if refs.is_empty() {
            return Err(Error::NoReferences);
        }
        let needed = refs.len() * PAGE_SIZE;
        if dest.len() < needed {
            return Err(Error::BufferTooSmall {
                needed,
                actual: dest.len(),
            });
        }

        let mut segments: Vec<CopySegment> = refs
            .iter()
            .zip(dest.chunks_exact_mut(PAGE_SIZE))
            .map(|(&gref, page)| CopySegment::from_foreign(domid, gref, 0, page.as_mut_ptr(), PAGE_SIZE as u16))
            .collect();

        // SAFETY: every local pointer is a distinct PAGE_SIZE chunk of `dest`.
        unsafe { self.run(&mut segments)? };
        check(domid, refs, &segments)?;

        log::debug!("copied {} page(s) from domain {}", refs.len(), domid);
        Ok(())
    }

    /// Copy `src` into `refs`, one page per reference.
    ///
    /// The last chunk may be shorter than a page; the rest of that page is
    /// left untouched.
    pub fn copy_to(&self, domid: DomainId, refs: &[GrantRef], src: &[u8]) -> Result<()> {
        if refs.is_empty() {
            return Err(Error::NoReferences);
        }
        let capacity = refs.len() * PAGE_SIZE;
        if src.len() > capacity {
            return Err(Error::BufferTooSmall {
                needed: src.len(),
                actual: capacity,
            });
        }

        let mut segments: Vec<CopySegment> = refs
            .iter()
            .zip(src.chunks(PAGE_SIZE))
            .map(|(&gref, chunk)| CopySegment::to_foreign(chunk.as_ptr(), domid, gref, 0, chunk.len() as u16))
            .collect();

        // SAFETY: local pointers are chunks of `src` and only read.
        unsafe { self.run(&mut segments)? };
        check(domid, refs, &segments)?;

        log::debug!("copied {} bytes to domain {}", src.len(), domid);
        Ok(())
    }

    /// Zero the notify byte of a writable grant.
    ///
    /// Signals the owner that the consumer is done when it never mapped the
    /// pages. `last_ref` is the reference of the last page of the channel.
    pub fn clear_notify_byte(&self, domid: DomainId, last_ref: GrantRef) -> Result<()> {
        let zero = 0u8;
        let mut segments = [CopySegment::to_foreign(
            &zero,
            domid,
            last_ref,
            (PAGE_SIZE - 1) as u16,
            1,
        )];

        // SAFETY: the only local pointer is `zero`, read for one byte.
        unsafe { self.run(&mut segments)? };
        check(domid, &[last_ref], &segments)?;

        log::info!("cleared notify byte of gref {} in domain {}", last_ref, domid);
        Ok(())
    }

    unsafe fn run(&self, segments: &mut [CopySegment]) -> Result<()> {
        self.device
            .grant_copy(segments)
            .map_err(|source| Error::Device {
                op: "GRANT_COPY",
                source,
            })
    }
}

fn check(domid: DomainId, refs: &[GrantRef], segments: &[CopySegment]) -> Result<()> {
    for (segment, (seg, &gref)) in segments.iter().zip(refs).enumerate() {
        if !seg.status.is_okay() {
            log::warn!(
                "grant copy segment {} (gref {}) failed: {}",
                segment,
                gref,
                seg.status
            );
            return Err(Error::CopySegmentFailed {
                domid,
                gref,
                segment,
                status: seg.status,
            });
        }
    }
    Ok(())
}
