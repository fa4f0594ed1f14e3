//! Simulated grant table.
//!
//! `SimHypervisor` keeps a grant table and a pool of "physical" frames in
//! one process. Frames live in a memfd, so the pages a sink maps are real
//! shared mappings of the very same memory the source maps: writes on one
//! side are visible on the other, and a cleared notify byte is observed by
//! the source exactly as under Xen.
//!
//! The simulator follows the gntalloc/gntdev semantics that matter to the
//! channel protocol:
//!
//! - grants are per (granting domain, reference) and name one consumer
//! - revoking a grant that is still mapped is deferred until the last
//!   mapping goes away, and is recorded as an [`OrderingViolation`]
//! - closing a session tears down everything it still holds, firing the
//!   registered unmap notifications
//! - grant copies report a `GNTST_*` status per segment

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{Allocation, CopyEndpoint, CopySegment, GrantAllocDevice, GrantFlags, GrantMapDevice, NotifyAction};
use crate::error::GntStatus;
use crate::memory::PAGE_SIZE;
use crate::{DomainId, GrantRef};

/// Default number of frames backing a simulator.
pub const DEFAULT_FRAMES: usize = 256;

/// First reference handed out. Xen reserves the low entries of the table.
const FIRST_GREF: GrantRef = 8;

/// A grant that was revoked while a consumer still had it mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderingViolation {
    /// Domain that issued the grant.
    pub domid: DomainId,
    /// The revoked reference.
    pub gref: GrantRef,
    /// Consumer mappings still live at revocation time.
    pub mappings: u32,
}

/// Device operation that can be made to fail with [`SimHypervisor::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    /// `DEALLOC_GRANT_REF`
    Dealloc,
    /// `UNMAP_GRANT_REF`
    Unmap,
}

/// Frames shared by every session of one simulator.
struct FramePool {
    file: File,
    base: NonNull<u8>,
    frames: usize,
}

// Safety: the pool owns its mapping; all access goes through the state mutex
unsafe impl Send for FramePool {}

impl FramePool {
    fn new(frames: usize) -> io::Result<Self> {
        let len = frames * PAGE_SIZE;

        // SAFETY: the name is NUL terminated.
        let fd = unsafe { libc::memfd_create(b"gntshm-sim\0".as_ptr() as *const libc::c_char, libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just created and is owned by nothing else.
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(len as u64)?;

        // SAFETY: fresh shared mapping of the whole memfd.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            file,
            base: NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))?,
            frames,
        })
    }

    fn frame_ptr(&self, frame: usize) -> *mut u8 {
        debug_assert!(frame < self.frames);
        // SAFETY: frame is within the pool.
        unsafe { self.base.as_ptr().add(frame * PAGE_SIZE) }
    }

    fn zero(&self, frame: usize) {
        // SAFETY: one whole frame inside the pool.
        unsafe { std::ptr::write_bytes(self.frame_ptr(frame), 0, PAGE_SIZE) };
    }

    /// Map `frames` contiguously, in order, into this process.
    fn map(&self, frames: &[usize], writable: bool) -> io::Result<NonNull<u8>> {
        let len = frames.len() * PAGE_SIZE;
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };

        // Reserve the range first so every frame lands at i * PAGE_SIZE.
        // SAFETY: fresh anonymous reservation.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        for (i, &frame) in frames.iter().enumerate() {
            // SAFETY: replaces one page of the reservation made above.
            let ret = unsafe {
                libc::mmap(
                    (base as *mut u8).add(i * PAGE_SIZE) as *mut libc::c_void,
                    PAGE_SIZE,
                    prot,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    self.file.as_raw_fd(),
                    (frame * PAGE_SIZE) as libc::off_t,
                )
            };
            if ret == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                // SAFETY: drops the whole reservation, including pages mapped so far.
                unsafe { libc::munmap(base, len) };
                return Err(err);
            }
        }

        NonNull::new(base as *mut u8).ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        // SAFETY: base/len is the mapping made in new().
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.frames * PAGE_SIZE);
        }
    }
}

#[derive(Debug)]
struct SimGrant {
    frame: usize,
    grantee: DomainId,
    writable: bool,
    mappings: u32,
    revoked: bool,
}

struct SimState {
    pool: FramePool,
    free_frames: Vec<usize>,
    grants: HashMap<(DomainId, GrantRef), SimGrant>,
    next_gref: GrantRef,
    max_grants: usize,
    violations: Vec<OrderingViolation>,
    events: Vec<u32>,
    faults: Vec<(FaultOp, i32)>,
}

impl SimState {
    fn live_grants(&self) -> usize {
        self.grants.values().filter(|g| !g.revoked).count()
    }

    /// Look up a grant `owner` issued, as seen by `consumer`.
    fn lookup(&self, owner: DomainId, gref: GrantRef, consumer: DomainId) -> Result<&SimGrant, GntStatus> {
        match self.grants.get(&(owner, gref)) {
            None => Err(GntStatus::BAD_GNTREF),
            Some(g) if g.revoked => Err(GntStatus::BAD_GNTREF),
            Some(g) if g.grantee != consumer => Err(GntStatus::PERMISSION_DENIED),
            Some(g) => Ok(g),
        }
    }

    fn revoke(&mut self, owner: DomainId, gref: GrantRef) {
        let Some(grant) = self.grants.get_mut(&(owner, gref)) else {
            return;
        };

        if grant.mappings > 0 {
            log::warn!(
                "sim: domain {} revoked gref {} while mapped {} time(s)",
                owner,
                gref,
                grant.mappings
            );
            self.violations.push(OrderingViolation {
                domid: owner,
                gref,
                mappings: grant.mappings,
            });
            grant.revoked = true;
        } else if let Some(grant) = self.grants.remove(&(owner, gref)) {
            self.free_frames.push(grant.frame);
        }
    }

    fn unmap_one(&mut self, owner: DomainId, gref: GrantRef) {
        let Some(grant) = self.grants.get_mut(&(owner, gref)) else {
            return;
        };
        grant.mappings = grant.mappings.saturating_sub(1);
        if grant.revoked && grant.mappings == 0 {
            if let Some(grant) = self.grants.remove(&(owner, gref)) {
                self.free_frames.push(grant.frame);
            }
        }
    }

    fn fire_notify(&mut self, frames: &[usize], notify: &Notify) {
        if notify.action.contains(NotifyAction::CLEAR_BYTE) {
            let page = notify.offset / PAGE_SIZE;
            if let Some(&frame) = frames.get(page) {
                // SAFETY: the byte lies inside a frame of the pool.
                unsafe {
                    std::ptr::write_volatile(self.pool.frame_ptr(frame).add(notify.offset % PAGE_SIZE), 0);
                }
            }
        }
        if notify.action.contains(NotifyAction::SEND_EVENT) {
            self.events.push(notify.event_port);
        }
    }
}

/// An in-process grant table shared by simulated domains.
///
/// Cloning gives another handle to the same table.
#[derive(Clone)]
pub struct SimHypervisor {
    state: Arc<Mutex<SimState>>,
}

impl SimHypervisor {
    /// Create a simulator with [`DEFAULT_FRAMES`] frames.
    pub fn new() -> io::Result<Self> {
        Self::with_frames(DEFAULT_FRAMES)
    }

    /// Create a simulator with `frames` frames; the grant limit equals the frame count.
    pub fn with_frames(frames: usize) -> io::Result<Self> {
        let pool = FramePool::new(frames)?;
        Ok(Self {
            state: Arc::new(Mutex::new(SimState {
                pool,
                free_frames: (0..frames).rev().collect(),
                grants: HashMap::new(),
                next_gref: FIRST_GREF,
                max_grants: frames,
                violations: Vec::new(),
                events: Vec::new(),
                faults: Vec::new(),
            })),
        })
    }

    /// Cap the number of live grants, to exercise table exhaustion.
    pub fn with_grant_limit(self, limit: usize) -> Self {
        self.lock().max_grants = limit;
        self
    }

    /// Open an allocation session for domain `domid`.
    pub fn open_alloc(&self, domid: DomainId) -> SimAllocDevice {
        SimAllocDevice {
            hv: self.clone(),
            domid,
            session: Mutex::new(Session::default()),
        }
    }

    /// Open a mapping session for domain `domid`.
    pub fn open_map(&self, domid: DomainId) -> SimMapDevice {
        SimMapDevice {
            hv: self.clone(),
            domid,
            session: Mutex::new(Session::default()),
        }
    }

    /// Whether `domid` currently grants `gref`.
    pub fn is_granted(&self, domid: DomainId, gref: GrantRef) -> bool {
        self.lock()
            .grants
            .get(&(domid, gref))
            .map_or(false, |g| !g.revoked)
    }

    /// Number of grants that have not been revoked.
    pub fn live_grants(&self) -> usize {
        self.lock().live_grants()
    }

    /// Revocations that happened while the page was still mapped.
    pub fn violations(&self) -> Vec<OrderingViolation> {
        self.lock().violations.clone()
    }

    /// Event channel ports signalled by unmap notifications, in order.
    pub fn events(&self) -> Vec<u32> {
        self.lock().events.clone()
    }

    /// Make the next `op` on any session fail with `errno`.
    pub fn fail_next(&self, op: FaultOp, errno: i32) {
        self.lock().faults.push((op, errno));
    }

    fn take_fault(&self, op: FaultOp) -> io::Result<()> {
        let mut state = self.lock();
        match state.faults.iter().position(|&(o, _)| o == op) {
            Some(i) => Err(io::Error::from_raw_os_error(state.faults.remove(i).1)),
            None => Ok(()),
        }
    }

    /// Current contents of a granted page, bypassing access checks.
    pub fn read_page(&self, domid: DomainId, gref: GrantRef) -> Option<Vec<u8>> {
        let state = self.lock();
        let grant = state.grants.get(&(domid, gref))?;
        let ptr = state.pool.frame_ptr(grant.frame);
        // SAFETY: one whole frame inside the pool.
        Some(unsafe { std::slice::from_raw_parts(ptr, PAGE_SIZE) }.to_vec())
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for SimHypervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SimHypervisor")
            .field("frames", &state.pool.frames)
            .field("live_grants", &state.live_grants())
            .field("violations", &state.violations.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct Notify {
    /// Byte offset from the start of the entry.
    offset: usize,
    action: NotifyAction,
    event_port: u32,
}

#[derive(Debug)]
struct Entry<R> {
    refs: Vec<R>,
    frames: Vec<usize>,
    writable: bool,
    /// Some local mapping of this entry is read-only.
    mapped_readonly: bool,
    notify: Option<Notify>,
}

impl<R> Entry<R> {
    fn len(&self) -> usize {
        self.frames.len() * PAGE_SIZE
    }
}

/// Per-open-file state: entries keyed by their mmap index.
#[derive(Debug)]
struct Session<R> {
    entries: BTreeMap<u64, Entry<R>>,
    next_index: u64,
}

impl<R> Default for Session<R> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_index: 0,
        }
    }
}

impl<R> Session<R> {
    fn insert(&mut self, entry: Entry<R>) -> u64 {
        let index = self.next_index;
        self.next_index += entry.len() as u64;
        self.entries.insert(index, entry);
        index
    }

    fn set_notify(&mut self, offset: u64, action: NotifyAction, event_port: u32) -> io::Result<()> {
        let (index, entry) = self
            .entries
            .range_mut(..=offset)
            .next_back()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        let rel = (offset - *index) as usize;
        if rel >= entry.len() {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        // Clearing the byte is a write through the mapping.
        if action.contains(NotifyAction::CLEAR_BYTE) && (!entry.writable || entry.mapped_readonly) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        entry.notify = Some(Notify {
            offset: rel,
            action,
            event_port,
        });
        Ok(())
    }

    fn entry(&self, index: u64) -> io::Result<&Entry<R>> {
        self.entries
            .get(&index)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
    }

    fn mmap(&mut self, pool: &FramePool, index: u64, len: usize, writable: bool) -> io::Result<NonNull<u8>> {
        let entry = self
            .entries
            .get_mut(&index)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        if len == 0 || len % PAGE_SIZE != 0 || len > entry.len() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if writable && !entry.writable {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        let clears_byte = entry
            .notify
            .map_or(false, |n| n.action.contains(NotifyAction::CLEAR_BYTE));
        if !writable && clears_byte {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let ptr = pool.map(&entry.frames[..len / PAGE_SIZE], writable)?;
        entry.mapped_readonly |= !writable;
        Ok(ptr)
    }
}

/// Simulated `gntalloc` session of one domain.
pub struct SimAllocDevice {
    hv: SimHypervisor,
    domid: DomainId,
    session: Mutex<Session<GrantRef>>,
}

impl SimAllocDevice {
    /// Domain this session allocates for.
    pub fn domid(&self) -> DomainId {
        self.domid
    }

    fn session(&self) -> MutexGuard<'_, Session<GrantRef>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl GrantAllocDevice for SimAllocDevice {
    fn alloc_grant_ref(&self, domid: DomainId, count: u32, flags: GrantFlags) -> io::Result<Allocation> {
        if count == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let mut state = self.hv.lock();
        let count = count as usize;
        if state.live_grants() + count > state.max_grants || state.free_frames.len() < count {
            return Err(io::Error::from_raw_os_error(libc::ENOSPC));
        }

        let writable = flags.contains(GrantFlags::WRITABLE);
        let mut refs = Vec::with_capacity(count);
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let frame = state.free_frames.pop().ok_or_else(|| io::Error::from_raw_os_error(libc::ENOSPC))?;
            state.pool.zero(frame);

            let gref = state.next_gref;
            state.next_gref = state.next_gref.wrapping_add(1).max(FIRST_GREF);
            state.grants.insert(
                (self.domid, gref),
                SimGrant {
                    frame,
                    grantee: domid,
                    writable,
                    mappings: 0,
                    revoked: false,
                },
            );
            refs.push(gref);
            frames.push(frame);
        }
        drop(state);

        let index = self.session().insert(Entry {
            refs: refs.clone(),
            frames,
            writable: true,
            mapped_readonly: false,
            notify: None,
        });
        Ok(Allocation { index, refs })
    }

    fn dealloc_grant_ref(&self, index: u64, count: u32) -> io::Result<()> {
        self.hv.take_fault(FaultOp::Dealloc)?;
        let mut session = self.session();
        match session.entries.get(&index) {
            Some(entry) if entry.refs.len() == count as usize => {}
            _ => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
        let Some(entry) = session.entries.remove(&index) else {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        };
        drop(session);

        let mut state = self.hv.lock();
        if let Some(notify) = entry.notify {
            state.fire_notify(&entry.frames, &notify);
        }
        for gref in entry.refs {
            state.revoke(self.domid, gref);
        }
        Ok(())
    }

    fn set_unmap_notify(&self, offset: u64, action: NotifyAction, event_port: u32) -> io::Result<()> {
        self.session().set_notify(offset, action, event_port)
    }

    fn mmap(&self, index: u64, len: usize, writable: bool) -> io::Result<NonNull<u8>> {
        let state = self.hv.lock();
        self.session().mmap(&state.pool, index, len, writable)
    }

    fn name(&self) -> &'static str {
        "sim"
    }
}

impl Drop for SimAllocDevice {
    fn drop(&mut self) {
        let entries = std::mem::take(&mut self.session().entries);
        let mut state = self.hv.lock();
        for (_, entry) in entries {
            if let Some(notify) = entry.notify {
                state.fire_notify(&entry.frames, &notify);
            }
            for gref in entry.refs {
                state.revoke(self.domid, gref);
            }
        }
    }
}

/// Simulated `gntdev` session of one domain.
pub struct SimMapDevice {
    hv: SimHypervisor,
    domid: DomainId,
    session: Mutex<Session<(DomainId, GrantRef)>>,
}

impl SimMapDevice {
    /// Domain this session maps into.
    pub fn domid(&self) -> DomainId {
        self.domid
    }

    fn session(&self) -> MutexGuard<'_, Session<(DomainId, GrantRef)>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn teardown(state: &mut SimState, entry: Entry<(DomainId, GrantRef)>) {
        if let Some(notify) = entry.notify {
            state.fire_notify(&entry.frames, &notify);
        }
        for (owner, gref) in entry.refs {
            state.unmap_one(owner, gref);
        }
    }

    /// Resolve a copy endpoint to a pointer, checking access.
    fn resolve(&self, state: &SimState, endpoint: CopyEndpoint, len: u16, write: bool) -> Result<*mut u8, GntStatus> {
        match endpoint {
            CopyEndpoint::Local(ptr) => Ok(ptr),
            CopyEndpoint::Foreign { domid, gref, offset } => {
                let grant = state.lookup(domid, gref, self.domid)?;
                if write && !grant.writable {
                    return Err(GntStatus::PERMISSION_DENIED);
                }
                if offset as usize + len as usize > PAGE_SIZE {
                    return Err(GntStatus::BAD_COPY_ARG);
                }
                // SAFETY: offset + len stays inside the frame.
                Ok(unsafe { state.pool.frame_ptr(grant.frame).add(offset as usize) })
            }
        }
    }
}

impl GrantMapDevice for SimMapDevice {
    fn map_grant_ref(&self, refs: &[(DomainId, GrantRef)]) -> io::Result<u64> {
        if refs.is_empty() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let mut state = self.hv.lock();
        let mut frames = Vec::with_capacity(refs.len());
        let mut writable = true;
        for &(owner, gref) in refs {
            let grant = state.lookup(owner, gref, self.domid).map_err(status_errno)?;
            writable &= grant.writable;
            frames.push(grant.frame);
        }
        for &(owner, gref) in refs {
            if let Some(grant) = state.grants.get_mut(&(owner, gref)) {
                grant.mappings += 1;
            }
        }
        drop(state);

        Ok(self.session().insert(Entry {
            refs: refs.to_vec(),
            frames,
            writable,
            mapped_readonly: false,
            notify: None,
        }))
    }

    fn unmap_grant_ref(&self, index: u64, count: u32) -> io::Result<()> {
        self.hv.take_fault(FaultOp::Unmap)?;
        let mut session = self.session();
        match session.entries.get(&index) {
            Some(entry) if entry.refs.len() == count as usize => {}
            _ => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
        let Some(entry) = session.entries.remove(&index) else {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        };
        drop(session);

        Self::teardown(&mut self.hv.lock(), entry);
        Ok(())
    }

    fn set_unmap_notify(&self, offset: u64, action: NotifyAction, event_port: u32) -> io::Result<()> {
        self.session().set_notify(offset, action, event_port)
    }

    unsafe fn grant_copy(&self, segments: &mut [CopySegment]) -> io::Result<()> {
        let state = self.hv.lock();
        for seg in segments.iter_mut() {
            let resolved = self
                .resolve(&state, seg.source, seg.len, false)
                .and_then(|src| Ok((src, self.resolve(&state, seg.dest, seg.len, true)?)));
            seg.status = match resolved {
                Ok((src, dst)) => {
                    // SAFETY: foreign ends were bounds checked by resolve(),
                    // local ends are vouched for by the caller.
                    std::ptr::copy(src as *const u8, dst, seg.len as usize);
                    GntStatus::OKAY
                }
                Err(status) => status,
            };
        }
        Ok(())
    }

    fn mmap(&self, index: u64, len: usize, writable: bool) -> io::Result<NonNull<u8>> {
        let state = self.hv.lock();
        let mut session = self.session();

        // The grants are only checked against the table when the pages are
        // actually mapped, as gntdev does.
        for &(owner, gref) in &session.entry(index)?.refs {
            state.lookup(owner, gref, self.domid).map_err(status_errno)?;
        }
        session.mmap(&state.pool, index, len, writable)
    }

    fn name(&self) -> &'static str {
        "sim"
    }
}

/// Errno gntdev reports for a failed grant operation.
fn status_errno(status: GntStatus) -> io::Error {
    if status == GntStatus::PERMISSION_DENIED {
        io::Error::from_raw_os_error(libc::EPERM)
    } else {
        io::Error::from_raw_os_error(libc::EINVAL)
    }
}

impl Drop for SimMapDevice {
    fn drop(&mut self) {
        let entries = std::mem::take(&mut self.session().entries);
        let mut state = self.hv.lock();
        for (_, entry) in entries {
            Self::teardown(&mut state, entry);
        }
    }
}
