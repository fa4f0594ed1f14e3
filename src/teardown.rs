//! Ordered teardown of a channel.
//!
//! The owner must not revoke a page while the consumer still maps it. The
//! coordinator enforces that with a notify byte: the source writes a non-zero
//! sentinel into the last byte of the last page before publishing the
//! references, the sink registers `CLEAR_BYTE` on its mapping, and the kernel
//! zeroes the byte when that mapping goes away (or the sink process dies).
//! The source only deallocates once it has seen the zero.
//!
//! ```text
//! Mapped -> ConsumerDone -> SourceNotified -> Released
//! ```

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::memory::{SharedPage, NOTIFY_SENTINEL};
use crate::source::{GrantHandle, GrantSource};

/// Default interval between notify byte checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Teardown state of one channel, as seen by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Pages published, consumer may hold a mapping.
    Mapped,
    /// Consumer released its mapping, not yet acknowledged by the source.
    ConsumerDone,
    /// Source saw the release; deallocation is safe.
    SourceNotified,
    /// Grants revoked.
    Released,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Mapped => "mapped",
            ChannelState::ConsumerDone => "consumer-done",
            ChannelState::SourceNotified => "source-notified",
            ChannelState::Released => "released",
        };
        f.write_str(s)
    }
}

/// Cooperative cancellation flag.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is cancelled by `SIGINT` or `SIGTERM`.
    pub fn from_signals() -> io::Result<Self> {
        let token = Self::new();
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&token.flag))?;
        }
        Ok(token)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Block until the token is cancelled, checking every `interval`.
    pub fn wait(&self, interval: Duration) {
        while !self.is_cancelled() {
            thread::sleep(interval);
        }
    }
}

/// How [`TeardownCoordinator::wait_for_release`] waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Interval between notify byte checks.
    pub poll_interval: Duration,
    /// Give up after this long. `None` waits until cancelled.
    pub timeout: Option<Duration>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }
}

/// Why [`TeardownCoordinator::wait_for_release`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The consumer released the pages; [`TeardownCoordinator::release`] may proceed.
    Released,
    /// The cancel token fired first.
    Cancelled,
    /// The timeout elapsed first.
    TimedOut,
}

/// Owns a published allocation until it can be revoked safely.
///
/// # Example
///
/// ```rust,no_run
/// use gntshm::{CancelToken, GrantFlags, GrantSource, TeardownCoordinator, WaitOutcome, WaitPolicy};
///
/// let source = GrantSource::open_default()?;
/// let (handle, page) = source.allocate_mapped(0, 1, GrantFlags::WRITABLE)?;
/// let mut channel = TeardownCoordinator::arm(handle, page)?;
///
/// // publish channel.handle().refs() to the consumer ...
///
/// let token = CancelToken::from_signals()?;
/// match channel.wait_for_release(&token, &WaitPolicy::default())? {
///     WaitOutcome::Released => channel.release(&source)?,
///     _ => channel.abandon(&source),
/// }
/// # Ok::<(), gntshm::Error>(())
/// ```
#[derive(Debug)]
pub struct TeardownCoordinator {
    handle: Option<GrantHandle>,
    page: SharedPage,
    index: u64,
    state: ChannelState,
}

impl TeardownCoordinator {
    /// Take ownership of a freshly allocated channel and write the sentinel.
    ///
    /// Call this before publishing the references.
    pub fn arm(handle: GrantHandle, mut page: SharedPage) -> Result<Self> {
        if page.len() != handle.len() {
            return Err(Error::BufferTooSmall {
                needed: handle.len(),
                actual: page.len(),
            });
        }

        page.set_notify_byte(NOTIFY_SENTINEL)?;
        log::debug!(
            "armed notify byte of index 0x{:x} with 0x{:02x}",
            handle.index(),
            NOTIFY_SENTINEL
        );

        Ok(Self {
            index: handle.index(),
            handle: Some(handle),
            page,
            state: ChannelState::Mapped,
        })
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// The published grants, `None` once released.
    pub fn handle(&self) -> Option<&GrantHandle> {
        self.handle.as_ref()
    }

    /// The local mapping of the pages.
    pub fn page(&self) -> &SharedPage {
        &self.page
    }

    pub fn page_mut(&mut self) -> &mut SharedPage {
        &mut self.page
    }

    /// Check the notify byte once and advance the state.
    pub fn poll(&mut self) -> Result<ChannelState> {
        match self.state {
            ChannelState::Mapped => {
                if self.page.notify_byte()? == 0 {
                    log::debug!("notify byte of index 0x{:x} cleared", self.index);
                    self.state = ChannelState::ConsumerDone;
                    self.acknowledge();
                }
            }
            ChannelState::ConsumerDone => self.acknowledge(),
            ChannelState::SourceNotified | ChannelState::Released => {}
        }
        Ok(self.state)
    }

    fn acknowledge(&mut self) {
        log::info!("consumer released index 0x{:x}", self.index);
        self.state = ChannelState::SourceNotified;
    }

    /// Operator assertion that the consumer is done.
    ///
    /// Fallback for consumers that cannot register an unmap notify.
    pub fn confirm_consumer_done(&mut self) {
        if self.state == ChannelState::Mapped {
            log::warn!(
                "index 0x{:x}: consumer release confirmed manually, notify byte not observed",
                self.index
            );
            self.state = ChannelState::ConsumerDone;
        }
    }

    /// Poll until the consumer releases, `token` fires or the timeout passes.
    pub fn wait_for_release(&mut self, token: &CancelToken, policy: &WaitPolicy) -> Result<WaitOutcome> {
        let deadline = policy.timeout.map(|t| Instant::now() + t);

        loop {
            if let ChannelState::SourceNotified | ChannelState::Released = self.poll()? {
                return Ok(WaitOutcome::Released);
            }
            if token.is_cancelled() {
                log::info!("wait for release of index 0x{:x} cancelled", self.index);
                return Ok(WaitOutcome::Cancelled);
            }

            let mut sleep = policy.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    log::warn!("wait for release of index 0x{:x} timed out", self.index);
                    return Ok(WaitOutcome::TimedOut);
                }
                sleep = sleep.min(deadline - now);
            }
            thread::sleep(sleep);
        }
    }

    /// Unmap locally and revoke the grants.
    ///
    /// Refused with [`Error::TeardownRaceViolation`] unless the consumer's
    /// release was observed; the grants stay owned by the coordinator.
    /// If the device fails to revoke them the state stays
    /// [`ChannelState::SourceNotified`] and the call can be repeated.
    pub fn release(&mut self, source: &GrantSource) -> Result<()> {
        match self.state {
            ChannelState::SourceNotified => {}
            ChannelState::Released => return Ok(()),
            state => {
                log::error!(
                    "refusing to revoke index 0x{:x} in state {}: consumer may still map it",
                    self.index,
                    state
                );
                return Err(Error::TeardownRaceViolation {
                    index: self.index,
                    state,
                });
            }
        }

        source.unmap_local(&mut self.page)?;
        // Keep the handle until the device has revoked it, so release can be retried.
        if let Some(handle) = self.handle.as_mut() {
            handle.dealloc()?;
        }
        self.handle = None;
        self.state = ChannelState::Released;
        Ok(())
    }

    /// Best-effort teardown after cancellation or timeout.
    ///
    /// Failures are logged, never returned.
    pub fn abandon(&mut self, source: &GrantSource) {
        if self.state == ChannelState::Released {
            return;
        }
        if self.state != ChannelState::SourceNotified {
            log::warn!(
                "abandoning index 0x{:x} in state {}, consumer may still map it",
                self.index,
                self.state
            );
        }

        if let Err(e) = source.unmap_local(&mut self.page) {
            log::warn!("{}", e);
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = source.deallocate(handle) {
                log::warn!("{}", e);
            }
        }
        self.state = ChannelState::Released;
    }
}
