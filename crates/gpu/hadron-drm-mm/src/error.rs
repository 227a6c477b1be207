//! Allocator error types.

use core::fmt;

/// Errors returned by [`DrmMm`](crate::DrmMm) insertion and reservation.
///
/// Caller bugs (removing a free node, touching the allocator mid-scan) are
/// not reported here; they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrmMmError {
    /// No hole can hold the requested range. The caller may run an eviction
    /// scan and retry, or fail the higher-level request.
    NoSpace,
}

impl fmt::Display for DrmMmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSpace => f.write_str("no suitable hole in range allocator"),
        }
    }
}

impl core::error::Error for DrmMmError {}
