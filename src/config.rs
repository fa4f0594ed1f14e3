//! Channel configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::xen::{GNTALLOC_PATH, GNTDEV_PATH};
use crate::backend::GrantFlags;
use crate::error::{Error, Result};
use crate::teardown::{WaitPolicy, DEFAULT_POLL_INTERVAL};
use crate::transfer::TransferStrategy;
use crate::DomainId;

/// How the source learns that the consumer is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseMode {
    /// Wait for the kernel to clear the notify byte.
    #[default]
    Notify,
    /// Wait for an operator interrupt. Diagnostic fallback only.
    Manual,
}

/// Validated settings for one channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    domid: DomainId,
    pages: u32,
    writable: bool,
    release: ReleaseMode,
    strategy: TransferStrategy,
    poll_interval: Duration,
    timeout: Option<Duration>,
    event_port: Option<u32>,
    gntalloc_path: PathBuf,
    gntdev_path: PathBuf,
}

impl ChannelConfig {
    pub fn builder() -> ChannelBuilder {
        ChannelBuilder::new()
    }

    /// Peer domain: the grantee on the source side, the granter on the sink side.
    pub fn domid(&self) -> DomainId {
        self.domid
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Grant flags matching [`ChannelConfig::writable`].
    pub fn grant_flags(&self) -> GrantFlags {
        if self.writable {
            GrantFlags::WRITABLE
        } else {
            GrantFlags::empty()
        }
    }

    pub fn release_mode(&self) -> ReleaseMode {
        self.release
    }

    pub fn strategy(&self) -> TransferStrategy {
        self.strategy
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            poll_interval: self.poll_interval,
            timeout: self.timeout,
        }
    }

    /// Event channel port to signal on unmap, if any.
    pub fn event_port(&self) -> Option<u32> {
        self.event_port
    }

    pub fn gntalloc_path(&self) -> &Path {
        &self.gntalloc_path
    }

    pub fn gntdev_path(&self) -> &Path {
        &self.gntdev_path
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            domid: 0,
            pages: 1,
            writable: true,
            release: ReleaseMode::Notify,
            strategy: TransferStrategy::DirectMap,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
            event_port: None,
            gntalloc_path: PathBuf::from(GNTALLOC_PATH),
            gntdev_path: PathBuf::from(GNTDEV_PATH),
        }
    }
}

/// Builder for a [`ChannelConfig`].
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use gntshm::{ChannelConfig, TransferStrategy};
///
/// let config = ChannelConfig::builder()
///     .domid(3)
///     .pages(2)
///     .strategy(TransferStrategy::OneShotCopy)
///     .timeout(Duration::from_secs(30))
///     .build()?;
/// assert_eq!(config.pages(), 2);
/// # Ok::<(), gntshm::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct ChannelBuilder {
    domid: Option<DomainId>,
    pages: Option<u32>,
    writable: Option<bool>,
    release: Option<ReleaseMode>,
    strategy: Option<TransferStrategy>,
    poll_interval: Option<Duration>,
    timeout: Option<Duration>,
    event_port: Option<u32>,
    gntalloc_path: Option<PathBuf>,
    gntdev_path: Option<PathBuf>,
}

impl ChannelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the peer domain.
    ///
    /// Default: 0 (dom0)
    pub fn domid(mut self, domid: DomainId) -> Self {
        self.domid = Some(domid);
        self
    }

    /// Set the number of pages to share.
    ///
    /// Default: 1
    pub fn pages(mut self, pages: u32) -> Self {
        self.pages = Some(pages);
        self
    }

    /// Let the consumer write the pages.
    ///
    /// Default: true. Copy-based release needs a writable grant.
    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = Some(writable);
        self
    }

    /// Default: [`ReleaseMode::Notify`]
    pub fn release_mode(mut self, mode: ReleaseMode) -> Self {
        self.release = Some(mode);
        self
    }

    /// Default: [`TransferStrategy::DirectMap`]
    pub fn strategy(mut self, strategy: TransferStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Set the interval between notify byte checks.
    ///
    /// Default: 10 ms
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Give up waiting for the consumer after `timeout`.
    ///
    /// Default: wait until interrupted
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Also signal this event channel port when the mapping goes away.
    pub fn event_port(mut self, port: u32) -> Self {
        self.event_port = Some(port);
        self
    }

    /// Default: `/dev/xen/gntalloc`
    pub fn gntalloc_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.gntalloc_path = Some(path.into());
        self
    }

    /// Default: `/dev/xen/gntdev`
    pub fn gntdev_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.gntdev_path = Some(path.into());
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<ChannelConfig> {
        let defaults = ChannelConfig::default();

        let pages = self.pages.unwrap_or(defaults.pages);
        if pages == 0 {
            return Err(Error::InvalidPageCount(pages));
        }

        let poll_interval = self.poll_interval.unwrap_or(defaults.poll_interval);
        if poll_interval.is_zero() {
            return Err(Error::InvalidPollInterval);
        }

        Ok(ChannelConfig {
            domid: self.domid.unwrap_or(defaults.domid),
            pages,
            writable: self.writable.unwrap_or(defaults.writable),
            release: self.release.unwrap_or(defaults.release),
            strategy: self.strategy.unwrap_or(defaults.strategy),
            poll_interval,
            timeout: self.timeout,
            event_port: self.event_port,
            gntalloc_path: self.gntalloc_path.unwrap_or(defaults.gntalloc_path),
            gntdev_path: self.gntdev_path.unwrap_or(defaults.gntdev_path),
        })
    }
}
