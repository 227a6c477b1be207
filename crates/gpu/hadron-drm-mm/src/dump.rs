//! Allocator dumps.

use core::convert::Infallible;
use core::fmt::{self, Write};

use crate::color::ColorAdjust;
use crate::log::mm_debug;
use crate::mm::DrmMm;
use crate::node::{HEAD, NodeFlags};

/// Space accounting of an allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrmMmUsage {
    /// `used + free`; equals the allocator size.
    pub total: u64,
    /// Sum of allocated node sizes.
    pub used: u64,
    /// Sum of hole sizes.
    pub free: u64,
}

impl fmt::Display for DrmMmUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total: {}, used {} free {}",
            self.total, self.used, self.free
        )
    }
}

/// One line of a dump.
enum Entry {
    Used { start: u64, size: u64 },
    Free { start: u64, size: u64 },
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (start, size, what) = match *self {
            Self::Used { start, size } => (start, size, "used"),
            Self::Free { start, size } => (start, size, "free"),
        };
        write!(f, "{start:#018x}-{:#018x}: {size}: {what}", start + size)
    }
}

impl<C: ColorAdjust> DrmMm<C> {
    /// Walks nodes and holes in address order, feeding each line to `visit`,
    /// and returns the totals.
    fn walk<E>(&self, mut visit: impl FnMut(&Entry) -> Result<(), E>) -> Result<DrmMmUsage, E> {
        let mut usage = DrmMmUsage::default();
        let mut index = HEAD;
        loop {
            let slot = self.arena.slot(index);
            if index != HEAD {
                usage.used += slot.size;
                visit(&Entry::Used {
                    start: slot.start,
                    size: slot.size,
                })?;
            }
            if slot.flags.contains(NodeFlags::HOLE_FOLLOWS) {
                let start = self.hole_start(index);
                let size = self.hole_end(index) - start;
                usage.free += size;
                visit(&Entry::Free { start, size })?;
            }
            index = slot.next;
            if index == HEAD {
                break;
            }
        }
        usage.total = usage.used + usage.free;
        Ok(usage)
    }

    /// Returns used and free space totals.
    pub fn usage(&self) -> DrmMmUsage {
        let Ok(usage) = self.walk::<Infallible>(|_| Ok(()));
        usage
    }

    /// Writes a listing of every node and hole in address order, followed by
    /// the totals.
    ///
    /// ```text
    /// 0x0000000000000000-0x0000000000000064: 100: used
    /// 0x0000000000000064-0x0000000000000400: 924: free
    /// total: 1024, used 100 free 924
    /// ```
    ///
    /// # Errors
    ///
    /// Propagates errors from `out`.
    pub fn print(&self, out: &mut impl Write) -> fmt::Result {
        let usage = self.walk(|entry| writeln!(out, "{entry}"))?;
        writeln!(out, "{usage}")
    }

    /// Sends the [`print`](Self::print) listing to the log sink at debug
    /// level, each line prefixed with `prefix`.
    pub fn debug_table(&self, prefix: &str) {
        let Ok(usage) = self.walk::<Infallible>(|entry| {
            mm_debug!("{prefix} {entry}");
            Ok(())
        });
        mm_debug!("{prefix} {usage}");
    }
}
