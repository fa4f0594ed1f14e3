//! Error types for gntshm.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::{DomainId, GrantRef};
use crate::teardown::ChannelState;

/// Result type alias using gntshm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Exit status for a missing grant device (`EX_UNAVAILABLE` from sysexits.h).
pub const EXIT_DEVICE_UNAVAILABLE: i32 = 69;

/// Exit status for every other failure.
pub const EXIT_FAILURE: i32 = 1;

/// Errors that can occur while sharing pages through the grant table.
#[derive(Error, Debug)]
pub enum Error {
    // Environment errors
    #[error("cannot open {}: {source} (load the {driver} driver)", .path.display())]
    DeviceUnavailable {
        path: PathBuf,
        driver: &'static str,
        #[source]
        source: io::Error,
    },

    // Hypervisor refusals
    #[error("allocation of {count} grant(s) for domain {domid} rejected: {source}")]
    AllocationRejected {
        domid: DomainId,
        count: u32,
        #[source]
        source: io::Error,
    },

    #[error("{op}: invalid grant reference(s) {refs:?} from domain {domid}: {source}")]
    InvalidReference {
        op: &'static str,
        domid: DomainId,
        refs: Vec<GrantRef>,
        #[source]
        source: io::Error,
    },

    #[error("{op}: domain {domid} did not grant access to this domain: {source}")]
    PermissionDenied {
        op: &'static str,
        domid: DomainId,
        #[source]
        source: io::Error,
    },

    // Virtual memory errors
    #[error("mmap of {len} bytes at index 0x{index:x} failed: {source}")]
    MapFailed {
        index: u64,
        len: usize,
        #[source]
        source: io::Error,
    },

    // Copy errors
    #[error("grant copy segment {segment} (domain {domid}, gref {gref}) failed: {status}")]
    CopySegmentFailed {
        domid: DomainId,
        gref: GrantRef,
        segment: usize,
        status: GntStatus,
    },

    // Teardown ordering
    #[error("refusing to deallocate grant index 0x{index:x}: channel is {state}, consumer may still map it")]
    TeardownRaceViolation { index: u64, state: ChannelState },

    // Argument errors
    #[error("invalid page count: {0} (must be > 0)")]
    InvalidPageCount(u32),

    #[error("invalid poll interval: must be non-zero")]
    InvalidPollInterval,

    #[error("no grant references given")]
    NoReferences,

    #[error("buffer too small: need {needed} bytes, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },

    // Other device failures
    #[error("{op} failed: {source}")]
    Device {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Classify a failed `MAP_GRANT_REF` style request.
    pub(crate) fn from_map(
        op: &'static str,
        domid: DomainId,
        refs: Vec<GrantRef>,
        source: io::Error,
    ) -> Self {
        match source.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => Error::PermissionDenied { op, domid, source },
            Some(libc::EINVAL) | Some(libc::ENOENT) | Some(libc::EFAULT) => Error::InvalidReference {
                op,
                domid,
                refs,
                source,
            },
            _ => Error::Device { op, source },
        }
    }

    /// Whether this error means the grant driver is not loaded.
    pub fn is_device_unavailable(&self) -> bool {
        matches!(self, Error::DeviceUnavailable { .. })
    }

    /// Process exit status for a CLI that fails with this error.
    pub fn exit_code(&self) -> i32 {
        if self.is_device_unavailable() {
            EXIT_DEVICE_UNAVAILABLE
        } else {
            EXIT_FAILURE
        }
    }
}

/// A `GNTST_*` status code reported by the hypervisor for one grant operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GntStatus(pub i16);

impl GntStatus {
    pub const OKAY: GntStatus = GntStatus(0);
    pub const GENERAL_ERROR: GntStatus = GntStatus(-1);
    pub const BAD_DOMAIN: GntStatus = GntStatus(-2);
    pub const BAD_GNTREF: GntStatus = GntStatus(-4);
    pub const PERMISSION_DENIED: GntStatus = GntStatus(-8);
    pub const BAD_COPY_ARG: GntStatus = GntStatus(-10);

    pub fn is_okay(self) -> bool {
        self == Self::OKAY
    }

    fn as_str(self) -> &'static str {
        match self.0 {
            0 => "okay",
            -1 => "general error",
            -2 => "bad domain",
            -3 => "bad grant handle",
            -4 => "bad grant reference",
            -5 => "bad virtual address",
            -6 => "bad device address",
            -7 => "no device space",
            -8 => "permission denied",
            -9 => "bad page",
            -10 => "bad copy argument",
            -11 => "address too big",
            -12 => "eagain",
            -13 => "no space",
            _ => "unknown status",
        }
    }
}

impl std::fmt::Display for GntStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let err = Error::DeviceUnavailable {
            path: "/dev/xen/gntdev".into(),
            driver: "xen-gntdev",
            source: io::Error::from_raw_os_error(libc::ENOENT),
        };
        assert_eq!(err.exit_code(), EXIT_DEVICE_UNAVAILABLE);
        assert!(err.to_string().contains("load the xen-gntdev driver"));

        assert_eq!(Error::NoReferences.exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn test_map_errno_classification() {
        let err = Error::from_map("MAP_GRANT_REF", 3, vec![8], io::Error::from_raw_os_error(libc::EPERM));
        assert!(matches!(err, Error::PermissionDenied { domid: 3, .. }));

        let err = Error::from_map("MAP_GRANT_REF", 3, vec![8], io::Error::from_raw_os_error(libc::EINVAL));
        assert!(matches!(err, Error::InvalidReference { ref refs, .. } if refs == &[8]));

        let err = Error::from_map("MAP_GRANT_REF", 3, vec![8], io::Error::from_raw_os_error(libc::ENOMEM));
        assert!(matches!(err, Error::Device { op: "MAP_GRANT_REF", .. }));
    }

    #[test]
    fn test_copy_segment_message() {
        let err = Error::CopySegmentFailed {
            domid: 1,
            gref: 42,
            segment: 2,
            status: GntStatus::BAD_GNTREF,
        };
        assert_eq!(
            err.to_string(),
            "grant copy segment 2 (domain 1, gref 42) failed: bad grant reference (-4)"
        );
    }
}
