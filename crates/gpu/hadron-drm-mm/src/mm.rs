//! The range allocator.
//!
//! A [`DrmMm`] covers `[start, start + size)`. Allocated nodes sit on an
//! address-ordered list anchored at a sentinel head; the free space between
//! two neighbors is "the hole after" the lower one. The head is set up so
//! that its hole starts at the allocator base and the hole of the last node
//! ends at the allocator end, which removes every boundary special case:
//!
//! ```text
//!   head.start = base + size
//!   head.size  = base - head.start          (wrapping)
//!   hole_start(n) = n.start + n.size        (== base for the head)
//!   hole_end(n)   = next(n).start           (== base + size for the last node)
//! ```
//!
//! Every node with a non-empty hole after it is also on the hole stack,
//! most recently freed first. Searches walk that stack.

use core::ops::Range;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::Color;
use crate::assert::{mm_bug_on, mm_debug_bug_on};
use crate::color::{ColorAdjust, HoleNeighbors};
use crate::error::DrmMmError;
use crate::log::{mm_trace, mm_warn};
use crate::mode::{InsertMode, Placement, SearchDirection, SearchPolicy, align_down, align_up};
use crate::node::{Arena, DrmMmNode, HEAD, NodeFlags, NodeId};

/// Source of per-allocator serials, used to tie a scan to its allocator.
static NEXT_SERIAL: AtomicU32 = AtomicU32::new(1);

/// Whether an eviction scan is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmState {
    /// Normal operation.
    Idle,
    /// At least one node is on a scan roster. Only
    /// [`scan_add_block`](DrmMm::scan_add_block) and
    /// [`scan_remove_block`](DrmMm::scan_remove_block) are allowed.
    Scanning,
}

/// A range allocator over `[start, start + size)`.
///
/// `C` is the color adjust strategy; the default `()` uses holes as they are.
/// The allocator owns the node arena; callers work with [`NodeId`] handles.
///
/// There is no internal locking. Use [`SharedDrmMm`](crate::SharedDrmMm) or
/// another lock to share an allocator.
#[derive(Debug)]
pub struct DrmMm<C: ColorAdjust = ()> {
    pub(crate) arena: Arena,
    start: u64,
    size: u64,
    color_adjust: C,
    /// Number of nodes currently on a scan roster.
    pub(crate) scan_active: u32,
    /// Id of the scan owning the roster while `scan_active > 0`.
    pub(crate) scan_owner: Option<u32>,
    pub(crate) serial: u32,
}

impl DrmMm<()> {
    /// Creates an allocator managing `[start, start + size)` with no color
    /// adjustment.
    ///
    /// # Panics
    ///
    /// Panics if `start + size` overflows.
    pub fn new(start: u64, size: u64) -> Self {
        Self::with_color_adjust(start, size, ())
    }
}

impl<C: ColorAdjust> DrmMm<C> {
    /// Creates an allocator managing `[start, start + size)` that narrows
    /// holes through `color_adjust`.
    ///
    /// # Panics
    ///
    /// Panics if `start + size` overflows.
    pub fn with_color_adjust(start: u64, size: u64, color_adjust: C) -> Self {
        let end = start.checked_add(size);
        mm_bug_on!(end.is_none(), "range {:#x}+{:#x} overflows", start, size);
        let head_start = start.wrapping_add(size);
        let mut arena = Arena::new(head_start, start.wrapping_sub(head_start));
        if size > 0 {
            arena.slot_mut(HEAD).flags = NodeFlags::HOLE_FOLLOWS;
            arena.push_hole(HEAD);
        }
        Self {
            arena,
            start,
            size,
            color_adjust,
            scan_active: 0,
            scan_owner: None,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Replaces the color adjust strategy.
    pub fn set_color_adjust(&mut self, color_adjust: C) {
        self.color_adjust = color_adjust;
    }

    /// Returns the color adjust strategy.
    pub fn color_adjust(&self) -> &C {
        &self.color_adjust
    }

    /// Returns the base of the managed range.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Returns the length of the managed range.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the first offset past the managed range.
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    /// Returns whether an eviction scan is in progress.
    pub fn state(&self) -> MmState {
        if self.scan_active == 0 {
            MmState::Idle
        } else {
            MmState::Scanning
        }
    }

    /// Returns `true` if no node is allocated.
    pub fn is_clean(&self) -> bool {
        self.arena.slot(HEAD).next == HEAD
    }

    /// Tears the allocator down. Tearing down an allocator that still has
    /// allocated nodes is a caller bug; it is logged, not fatal.
    pub fn takedown(self) {
        if !self.is_clean() {
            mm_warn!("drm_mm: memory manager not clean during takedown");
        }
    }

    // -----------------------------------------------------------------------
    // Node handles
    // -----------------------------------------------------------------------

    /// Creates an unallocated node and returns its handle.
    pub fn create_node(&mut self) -> NodeId {
        self.arena.create()
    }

    /// Releases a node handle. The node must not be allocated.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale or the node is still allocated.
    pub fn destroy_node(&mut self, id: NodeId) {
        let index = self.arena.resolve(id);
        mm_bug_on!(
            self.arena.slot(index).flags.contains(NodeFlags::ALLOCATED),
            "destroying allocated {}",
            id
        );
        self.arena.destroy(index);
    }

    /// Returns the placement of a node.
    ///
    /// For an unallocated node this is its last placement, or zeros for a
    /// node that was never inserted.
    pub fn node(&self, id: NodeId) -> DrmMmNode {
        self.arena.slot(self.arena.resolve(id)).view()
    }

    /// Returns `true` if the node is inserted in the allocator.
    pub fn is_allocated(&self, id: NodeId) -> bool {
        let index = self.arena.resolve(id);
        self.arena.slot(index).flags.contains(NodeFlags::ALLOCATED)
    }

    /// Returns `true` if a non-empty hole follows the node.
    pub fn hole_follows(&self, id: NodeId) -> bool {
        let index = self.arena.resolve(id);
        self.arena.slot(index).flags.contains(NodeFlags::HOLE_FOLLOWS)
    }

    /// Returns the hole after the node, if there is one.
    pub fn hole_after(&self, id: NodeId) -> Option<Range<u64>> {
        let index = self.arena.resolve(id);
        self.arena
            .slot(index)
            .flags
            .contains(NodeFlags::HOLE_FOLLOWS)
            .then(|| self.hole_start(index)..self.hole_end(index))
    }

    /// Returns the number of live node handles, allocated or not.
    pub fn handle_count(&self) -> usize {
        self.arena.len()
    }

    /// Returns the number of allocated nodes.
    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    /// Iterates over the allocated nodes in address order.
    pub fn nodes(&self) -> Nodes<'_> {
        Nodes {
            arena: &self.arena,
            cursor: self.arena.slot(HEAD).next,
        }
    }

    /// Iterates over the holes, most recently freed first.
    pub fn holes(&self) -> Holes<'_> {
        Holes {
            arena: &self.arena,
            cursor: self.arena.hole_first(),
        }
    }

    /// Returns the first node, in address order, overlapping `[start, last)`.
    pub fn interval_first(&self, start: u64, last: u64) -> Option<NodeId> {
        self.nodes()
            .find(|(_, node)| node.end() > start && node.start < last)
            .map(|(id, _)| id)
    }

    // -----------------------------------------------------------------------
    // Insertion
    // -----------------------------------------------------------------------

    /// Inserts a node at a caller-chosen position.
    ///
    /// Used to take over ranges that are already in use before the allocator
    /// exists, e.g. a firmware framebuffer. No color adjustment is applied.
    ///
    /// # Errors
    ///
    /// [`DrmMmError::NoSpace`] if `[start, start + size)` is empty or not
    /// entirely free.
    ///
    /// # Panics
    ///
    /// Panics if the node is already allocated or a scan is in progress.
    pub fn reserve_node(
        &mut self,
        id: NodeId,
        start: u64,
        size: u64,
        color: Color,
    ) -> Result<(), DrmMmError> {
        let index = self.prepare_insert(id);
        let end = start.checked_add(size).ok_or(DrmMmError::NoSpace)?;
        if size == 0 {
            return Err(DrmMmError::NoSpace);
        }

        let mut cursor = self.arena.hole_first();
        while let Some(hole) = cursor {
            cursor = self.arena.slot(hole).hole_next;
            if self.hole_start(hole) <= start && end <= self.hole_end(hole) {
                self.insert_at(hole, index, start, size, color);
                mm_trace!("drm_mm: reserved {} at {:#x}+{:#x}", id, start, size);
                return Ok(());
            }
        }
        Err(DrmMmError::NoSpace)
    }

    /// Searches for a hole and inserts the node there.
    ///
    /// # Errors
    ///
    /// [`DrmMmError::NoSpace`] if `size` is zero or no hole fits.
    ///
    /// # Panics
    ///
    /// Panics if the node is already allocated or a scan is in progress.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_node_generic(
        &mut self,
        id: NodeId,
        size: u64,
        alignment: u64,
        color: Color,
        policy: SearchPolicy,
        direction: SearchDirection,
        placement: Placement,
    ) -> Result<(), DrmMmError> {
        self.insert_node_in_range_generic(
            id,
            size,
            alignment,
            color,
            0,
            u64::MAX,
            policy,
            direction,
            placement,
        )
    }

    /// Searches for a hole inside `[range_start, range_end)` and inserts the
    /// node there.
    ///
    /// Hole bounds are clamped to the range first and then passed through
    /// the color adjust strategy, before alignment.
    ///
    /// # Errors
    ///
    /// [`DrmMmError::NoSpace`] if `size` is zero, the range is narrower than
    /// `size`, or no hole fits.
    ///
    /// # Panics
    ///
    /// Panics if the node is already allocated or a scan is in progress.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_node_in_range_generic(
        &mut self,
        id: NodeId,
        size: u64,
        alignment: u64,
        color: Color,
        range_start: u64,
        range_end: u64,
        policy: SearchPolicy,
        direction: SearchDirection,
        placement: Placement,
    ) -> Result<(), DrmMmError> {
        let index = self.prepare_insert(id);
        if size == 0 || range_end <= range_start || range_end - range_start < size {
            return Err(DrmMmError::NoSpace);
        }

        let fit = Fit {
            size,
            alignment,
            color,
            range: range_start..range_end,
            placement,
        };
        let (hole, start) = self
            .search(&fit, policy, direction)
            .ok_or(DrmMmError::NoSpace)?;

        mm_debug_bug_on!(
            start < range_start || start + size > range_end,
            "placement {:#x}+{:#x} outside range {:#x}..{:#x}",
            start,
            size,
            range_start,
            range_end
        );
        self.insert_at(hole, index, start, size, color);
        mm_trace!("drm_mm: inserted {} at {:#x}+{:#x}", id, start, size);
        Ok(())
    }

    /// Inserts a node of color 0 anywhere, bottom-up.
    ///
    /// # Errors
    ///
    /// [`DrmMmError::NoSpace`] if `size` is zero or no hole fits.
    pub fn insert_node(
        &mut self,
        id: NodeId,
        size: u64,
        alignment: u64,
        policy: SearchPolicy,
    ) -> Result<(), DrmMmError> {
        self.insert_node_generic(
            id,
            size,
            alignment,
            0,
            policy,
            SearchDirection::Forward,
            Placement::Bottom,
        )
    }

    /// Inserts a node inside `[range_start, range_end)` using one of the
    /// common [`InsertMode`]s.
    ///
    /// # Errors
    ///
    /// [`DrmMmError::NoSpace`] if no hole in the range fits.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_node_in_range(
        &mut self,
        id: NodeId,
        size: u64,
        alignment: u64,
        color: Color,
        range_start: u64,
        range_end: u64,
        mode: InsertMode,
    ) -> Result<(), DrmMmError> {
        self.insert_node_in_range_generic(
            id,
            size,
            alignment,
            color,
            range_start,
            range_end,
            mode.policy(),
            mode.direction(),
            mode.placement(),
        )
    }

    // -----------------------------------------------------------------------
    // Removal
    // -----------------------------------------------------------------------

    /// Removes an allocated node. O(1).
    ///
    /// The freed range merges with the hole before it, and that hole moves
    /// to the top of the hole stack.
    ///
    /// # Panics
    ///
    /// Panics if the node is not allocated, is on a scan roster, or a scan is
    /// in progress.
    pub fn remove_node(&mut self, id: NodeId) {
        let index = self.arena.resolve(id);
        let flags = self.arena.slot(index).flags;
        mm_bug_on!(
            !flags.contains(NodeFlags::ALLOCATED),
            "removing unallocated {}",
            id
        );
        mm_bug_on!(
            flags.contains(NodeFlags::SCANNED_BLOCK),
            "removing {} while it is on a scan roster",
            id
        );
        self.assert_idle();

        let hole_empty = self.hole_start(index) == self.hole_end(index);
        if flags.contains(NodeFlags::HOLE_FOLLOWS) {
            mm_debug_bug_on!(hole_empty, "{} flagged with an empty hole", id);
            self.arena.pop_hole(index);
        } else {
            mm_debug_bug_on!(!hole_empty, "{} has an untracked hole", id);
        }

        let prev = self.arena.slot(index).prev;
        if self.arena.slot(prev).flags.contains(NodeFlags::HOLE_FOLLOWS) {
            self.arena.raise_hole(prev);
        } else {
            self.arena.slot_mut(prev).flags.insert(NodeFlags::HOLE_FOLLOWS);
            self.arena.push_hole(prev);
        }

        self.arena.unlink(index);
        let slot = self.arena.slot_mut(index);
        slot.flags = NodeFlags::empty();
        slot.prev = index;
        slot.next = index;
        mm_trace!("drm_mm: removed {}", id);
    }

    /// Moves the allocation of `old` to `new` without touching free space.
    ///
    /// `new` takes over the range, color and both list positions of `old`;
    /// `old` becomes unallocated.
    ///
    /// # Panics
    ///
    /// Panics if `old` is not allocated, `new` is, or a scan is in progress.
    pub fn replace_node(&mut self, old: NodeId, new: NodeId) {
        let from = self.arena.resolve(old);
        let to = self.arena.resolve(new);
        mm_bug_on!(
            !self.arena.slot(from).flags.contains(NodeFlags::ALLOCATED),
            "replacing unallocated {}",
            old
        );
        mm_bug_on!(
            self.arena.slot(to).flags.contains(NodeFlags::ALLOCATED),
            "replacement {} is already allocated",
            new
        );
        self.assert_idle();

        self.arena.transplant(from, to);
        let src = self.arena.slot(from).clone();
        let dst = self.arena.slot_mut(to);
        dst.start = src.start;
        dst.size = src.size;
        dst.color = src.color;
        dst.flags = src.flags & (NodeFlags::ALLOCATED | NodeFlags::HOLE_FOLLOWS);
        self.arena.slot_mut(from).flags = NodeFlags::empty();
        mm_trace!("drm_mm: replaced {} with {}", old, new);
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    pub(crate) fn assert_idle(&self) {
        mm_bug_on!(
            self.scan_active > 0,
            "structural operation while an eviction scan is active"
        );
    }

    fn prepare_insert(&self, id: NodeId) -> usize {
        let index = self.arena.resolve(id);
        mm_bug_on!(
            self.arena.slot(index).flags.contains(NodeFlags::ALLOCATED),
            "{} is already allocated",
            id
        );
        self.assert_idle();
        index
    }

    pub(crate) fn hole_start(&self, index: usize) -> u64 {
        self.arena.slot(index).hole_start()
    }

    pub(crate) fn hole_end(&self, index: usize) -> u64 {
        self.arena.slot(self.arena.slot(index).next).start
    }

    /// Runs the color adjust strategy on the hole after `hole`.
    pub(crate) fn adjust_hole(&self, hole: usize, color: Color, start: &mut u64, end: &mut u64) {
        if !C::ENABLED {
            return;
        }
        let neighbor = |index: usize| {
            let slot = self.arena.slot(index);
            (index != HEAD && slot.flags.contains(NodeFlags::ALLOCATED)).then(|| slot.view())
        };
        let neighbors = HoleNeighbors {
            before: neighbor(hole),
            after: neighbor(self.arena.slot(hole).next),
        };
        let (orig_start, orig_end) = (*start, *end);
        self.color_adjust.adjust(&neighbors, color, start, end);
        mm_debug_bug_on!(
            *start < orig_start || *end > orig_end,
            "color adjust grew {:#x}..{:#x} to {:#x}..{:#x}",
            orig_start,
            orig_end,
            *start,
            *end
        );
    }

    /// Finds where a node described by `fit` would go in the hole after
    /// `hole`, if it fits at all.
    fn place(&self, hole: usize, fit: &Fit) -> Option<u64> {
        let mut adj_start = self.hole_start(hole).max(fit.range.start);
        let mut adj_end = self.hole_end(hole).min(fit.range.end);
        if adj_end <= adj_start {
            return None;
        }
        self.adjust_hole(hole, fit.color, &mut adj_start, &mut adj_end);
        if adj_end <= adj_start || adj_end - adj_start < fit.size {
            return None;
        }

        let start = match fit.placement {
            Placement::Bottom => align_up(adj_start, fit.alignment)?,
            Placement::Top => align_down(adj_end - fit.size, fit.alignment),
        };
        let fits = start >= adj_start && start.checked_add(fit.size).is_some_and(|e| e <= adj_end);
        fits.then_some(start)
    }

    /// Walks the hole stack for a hole that can take `fit`.
    fn search(
        &self,
        fit: &Fit,
        policy: SearchPolicy,
        direction: SearchDirection,
    ) -> Option<(usize, u64)> {
        let mut best: Option<(usize, u64, u64)> = None;
        let mut cursor = match direction {
            SearchDirection::Forward => self.arena.hole_first(),
            SearchDirection::Backward => self.arena.hole_last(),
        };

        while let Some(hole) = cursor {
            let slot = self.arena.slot(hole);
            cursor = match direction {
                SearchDirection::Forward => slot.hole_next,
                SearchDirection::Backward => slot.hole_prev,
            };

            let Some(start) = self.place(hole, fit) else {
                continue;
            };
            match policy {
                SearchPolicy::FirstFit => return Some((hole, start)),
                SearchPolicy::BestFit => {
                    let hole_size = self.hole_end(hole) - self.hole_start(hole);
                    if best.is_none_or(|(_, _, best_size)| hole_size < best_size) {
                        best = Some((hole, start, hole_size));
                    }
                }
            }
        }
        best.map(|(hole, start, _)| (hole, start))
    }

    /// Links `index` into the hole after `hole` at `[start, start + size)`
    /// and splits the hole around it.
    fn insert_at(&mut self, hole: usize, index: usize, start: u64, size: u64, color: Color) {
        let hole_start = self.hole_start(hole);
        let hole_end = self.hole_end(hole);
        let end = start + size;
        mm_debug_bug_on!(
            start < hole_start || end > hole_end,
            "placement {:#x}..{:#x} outside hole {:#x}..{:#x}",
            start,
            end,
            hole_start,
            hole_end
        );

        if start == hole_start {
            self.arena.slot_mut(hole).flags.remove(NodeFlags::HOLE_FOLLOWS);
            self.arena.pop_hole(hole);
        }

        let slot = self.arena.slot_mut(index);
        slot.start = start;
        slot.size = size;
        slot.color = color;
        slot.flags = NodeFlags::ALLOCATED;
        self.arena.link_after(hole, index);

        if end < hole_end {
            self.arena.slot_mut(index).flags.insert(NodeFlags::HOLE_FOLLOWS);
            self.arena.push_hole(index);
        }
    }
}

/// Parameters of one insertion, shared by search and placement.
struct Fit {
    size: u64,
    alignment: u64,
    color: Color,
    range: Range<u64>,
    placement: Placement,
}

/// Iterator over allocated nodes in address order, see [`DrmMm::nodes`].
#[derive(Debug, Clone)]
pub struct Nodes<'a> {
    arena: &'a Arena,
    cursor: usize,
}

impl Iterator for Nodes<'_> {
    type Item = (NodeId, DrmMmNode);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == HEAD {
            return None;
        }
        let index = self.cursor;
        let slot = self.arena.slot(index);
        self.cursor = slot.next;
        Some((self.arena.id_of(index), slot.view()))
    }
}

/// Iterator over holes in hole-stack order, see [`DrmMm::holes`].
#[derive(Debug, Clone)]
pub struct Holes<'a> {
    arena: &'a Arena,
    cursor: Option<usize>,
}

impl Iterator for Holes<'_> {
    type Item = Range<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let slot = self.arena.slot(index);
        self.cursor = slot.hole_next;
        Some(slot.hole_start()..self.arena.slot(slot.next).start)
    }
}
