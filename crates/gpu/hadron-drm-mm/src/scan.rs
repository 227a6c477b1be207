//! Eviction scans.
//!
//! When no hole fits an allocation, a memory manager can pick victims from
//! its LRU and ask the allocator which of them actually need to go:
//!
//! 1. Create a [`DrmMmScan`] describing the pending allocation.
//! 2. Call [`DrmMm::scan_add_block`] for each candidate until it returns
//!    `true`. Each added node is provisionally unlinked, so the hole around
//!    it grows.
//! 3. Call [`DrmMm::scan_remove_block`] for **every** added node in exactly
//!    the reverse order. It relinks the node and reports whether it overlaps
//!    the hole that was found.
//! 4. Remove the nodes reported `true`, then insert with
//!    [`InsertMode::Evict`]: the freed hole is on top of the hole stack.
//!
//! While any node is on the roster the allocator is in
//! [`MmState::Scanning`](crate::MmState::Scanning) and every other
//! structural operation panics.

use core::ops::Range;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::Color;
use crate::assert::{mm_bug_on, mm_debug_bug_on};
use crate::color::ColorAdjust;
use crate::log::mm_trace;
use crate::mm::DrmMm;
use crate::mode::{InsertMode, Placement};
use crate::node::{HEAD, NodeFlags, NodeId};

/// Source of scan ids; a roster belongs to exactly one scan.
static NEXT_SCAN_ID: AtomicU32 = AtomicU32::new(1);

/// State of one eviction scan.
#[derive(Debug, Clone)]
pub struct DrmMmScan {
    serial: u32,
    id: u32,
    size: u64,
    alignment: u64,
    remainder_mask: u64,
    range_start: u64,
    range_end: u64,
    color: Color,
    mode: InsertMode,
    hit_start: u64,
    hit_end: u64,
}

impl DrmMmScan {
    /// Starts a scan for a `size`-unit allocation anywhere in `mm`.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or `mm` is already scanning.
    pub fn new<C: ColorAdjust>(
        mm: &DrmMm<C>,
        size: u64,
        alignment: u64,
        color: Color,
        mode: InsertMode,
    ) -> Self {
        Self::with_range(mm, size, alignment, color, 0, u64::MAX, mode)
    }

    /// Starts a scan for a `size`-unit allocation inside
    /// `[range_start, range_end)`.
    ///
    /// # Panics
    ///
    /// Panics if the range is empty, `size` is zero or larger than the
    /// range, or `mm` is already scanning.
    pub fn with_range<C: ColorAdjust>(
        mm: &DrmMm<C>,
        size: u64,
        alignment: u64,
        color: Color,
        range_start: u64,
        range_end: u64,
        mode: InsertMode,
    ) -> Self {
        mm_bug_on!(range_start >= range_end, "empty scan range");
        mm_bug_on!(
            size == 0 || size > range_end - range_start,
            "scan size {:#x} does not fit range {:#x}..{:#x}",
            size,
            range_start,
            range_end
        );
        mm.assert_idle();

        let alignment = if alignment <= 1 { 0 } else { alignment };
        let remainder_mask = if alignment.is_power_of_two() {
            alignment - 1
        } else {
            0
        };
        Self {
            serial: mm.serial,
            id: NEXT_SCAN_ID.fetch_add(1, Ordering::Relaxed),
            size,
            alignment,
            remainder_mask,
            range_start,
            range_end,
            color,
            mode,
            hit_start: u64::MAX,
            hit_end: 0,
        }
    }

    /// Returns the hole found so far, if any.
    pub fn hit(&self) -> Option<Range<u64>> {
        (self.hit_start < self.hit_end).then_some(self.hit_start..self.hit_end)
    }

    /// Returns the size of the pending allocation.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the effective alignment (`0` for none).
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Returns the color of the pending allocation.
    pub fn color(&self) -> Color {
        self.color
    }

    /// Returns the placement mode of the pending allocation.
    pub fn mode(&self) -> InsertMode {
        self.mode
    }

    /// Returns the range the allocation must fall in.
    pub fn range(&self) -> Range<u64> {
        self.range_start..self.range_end
    }

    fn remainder(&self, offset: u64) -> u64 {
        if self.remainder_mask != 0 {
            offset & self.remainder_mask
        } else {
            offset % self.alignment
        }
    }

    /// Places the allocation in the color-adjusted hole `[col_start, col_end)`.
    fn fit(&self, col_start: u64, col_end: u64) -> Option<u64> {
        let lower = col_start.max(self.range_start);
        let adj_end = col_end.min(self.range_end);
        if adj_end <= lower || adj_end - lower < self.size {
            return None;
        }

        let top = self.mode.placement() == Placement::Top;
        let mut adj_start = if top { adj_end - self.size } else { lower };
        if self.alignment != 0 {
            let rem = self.remainder(adj_start);
            if rem != 0 {
                adj_start -= rem;
                if !top {
                    adj_start = adj_start.checked_add(self.alignment)?;
                }
                if adj_start < lower || adj_end <= adj_start || adj_end - adj_start < self.size {
                    return None;
                }
            }
        }
        Some(adj_start)
    }
}

impl<C: ColorAdjust> DrmMm<C> {
    /// Adds a node to the eviction roster of `scan`.
    ///
    /// Returns `true` once the nodes added so far free a hole the pending
    /// allocation fits in. The first such hole is kept as the scan's
    /// [`hit`](DrmMmScan::hit); later calls report whether they fit but do
    /// not move it.
    ///
    /// # Panics
    ///
    /// Panics if `scan` belongs to another allocator, another scan has
    /// nodes on its roster, or the node is not allocated or already on the
    /// roster.
    pub fn scan_add_block(&mut self, scan: &mut DrmMmScan, id: NodeId) -> bool {
        mm_bug_on!(scan.serial != self.serial, "scan belongs to another allocator");
        mm_bug_on!(
            self.scan_owner.is_some_and(|owner| owner != scan.id),
            "another eviction scan is active"
        );
        let index = self.arena.resolve(id);
        let flags = self.arena.slot(index).flags;
        mm_bug_on!(
            !flags.contains(NodeFlags::ALLOCATED),
            "scanning unallocated {}",
            id
        );
        mm_bug_on!(
            flags.contains(NodeFlags::SCANNED_BLOCK),
            "{} is already on the scan roster",
            id
        );
        self.arena.slot_mut(index).flags.insert(NodeFlags::SCANNED_BLOCK);
        self.scan_active += 1;
        self.scan_owner = Some(scan.id);

        // Unlink but keep the node's own links for scan_remove_block().
        let hole = self.arena.slot(index).prev;
        mm_debug_bug_on!(
            self.arena.slot(hole).next != index,
            "node list broken before {}",
            id
        );
        self.arena.unlink(index);

        let hole_start = self.hole_start(hole);
        let hole_end = self.hole_end(hole);
        let (mut col_start, mut col_end) = (hole_start, hole_end);
        self.adjust_hole(hole, scan.color, &mut col_start, &mut col_end);

        let Some(start) = scan.fit(col_start, col_end) else {
            return false;
        };
        if scan.hit().is_none() {
            scan.hit_start = start;
            scan.hit_end = start + scan.size;
            mm_debug_bug_on!(
                scan.hit_start < hole_start || scan.hit_end > hole_end,
                "scan hit {:#x}..{:#x} outside hole {:#x}..{:#x}",
                scan.hit_start,
                scan.hit_end,
                hole_start,
                hole_end
            );
            mm_trace!(
                "drm_mm: scan hit {:#x}..{:#x} after adding {}",
                scan.hit_start,
                scan.hit_end,
                id
            );
        }
        true
    }

    /// Takes a node off the eviction roster of `scan` and relinks it.
    ///
    /// Nodes must be removed in exactly the reverse order they were added.
    /// Returns `true` if the node overlaps the scan's hit and must be evicted.
    /// Always `false` when no hit was found.
    ///
    /// # Panics
    ///
    /// Panics if `scan` belongs to another allocator, another scan owns the
    /// roster, or the node is not on the roster. Out-of-order removal is
    /// caught in debug builds and with `--cfg hadron_drm_debug_mm`.
    pub fn scan_remove_block(&mut self, scan: &DrmMmScan, id: NodeId) -> bool {
        mm_bug_on!(scan.serial != self.serial, "scan belongs to another allocator");
        mm_bug_on!(
            self.scan_owner != Some(scan.id),
            "{} is not on the roster of this scan",
            id
        );
        let index = self.arena.resolve(id);
        mm_bug_on!(
            !self.arena.slot(index).flags.contains(NodeFlags::SCANNED_BLOCK),
            "{} is not on the scan roster",
            id
        );
        self.arena.slot_mut(index).flags.remove(NodeFlags::SCANNED_BLOCK);
        self.scan_active -= 1;
        if self.scan_active == 0 {
            self.scan_owner = None;
        }

        // Both sides of the gap must agree on what follows it, otherwise the
        // roster is being unwound out of order.
        let slot = self.arena.slot(index);
        let (prev, next) = (slot.prev, slot.next);
        mm_debug_bug_on!(
            self.arena.slot(prev).next != next,
            "scan roster unwound out of order at {}",
            id
        );
        self.arena.relink(index);

        let node = self.arena.slot(index).view();
        node.end() > scan.hit_start && node.start < scan.hit_end
    }

    /// Finds a node next to the scan's hit that still has to go because the
    /// color adjust strategy keeps the hit out of the freed hole.
    ///
    /// Call after the scan is unwound and the selected nodes are removed,
    /// and repeat until it returns `None`. Without a color adjust strategy
    /// it always returns `None`.
    ///
    /// This query is experimental: it has not been validated against real
    /// color-adjust users.
    ///
    /// # Panics
    ///
    /// Panics if `scan` belongs to another allocator or a scan is active.
    pub fn scan_color_evict(&self, scan: &DrmMmScan) -> Option<NodeId> {
        mm_bug_on!(scan.serial != self.serial, "scan belongs to another allocator");
        self.assert_idle();
        if !C::ENABLED {
            return None;
        }
        let hit = scan.hit()?;

        // Normally the top of the hole stack, unless the caller freed more.
        let mut cursor = self.arena.hole_first();
        let hole = loop {
            let Some(hole) = cursor else {
                mm_debug_bug_on!(true, "no hole covers scan hit {:#x}..{:#x}", hit.start, hit.end);
                return None;
            };
            if self.hole_start(hole) <= hit.start && self.hole_end(hole) >= hit.end {
                break hole;
            }
            cursor = self.arena.slot(hole).hole_next;
        };

        let (mut start, mut end) = (self.hole_start(hole), self.hole_end(hole));
        self.adjust_hole(hole, scan.color, &mut start, &mut end);
        let victim = if start > hit.start {
            hole
        } else if end < hit.end {
            self.arena.slot(hole).next
        } else {
            return None;
        };
        (victim != HEAD).then(|| self.arena.id_of(victim))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::GuardGap;
    use crate::mm::MmState;
    use crate::node::DrmMmNode;

    /// Allocator over `[0, 100 * n)` packed with `n` nodes of 100 units.
    fn packed(n: u64) -> (DrmMm, Vec<NodeId>) {
        let mut mm = DrmMm::new(0, 100 * n);
        let ids = (0..n)
            .map(|i| {
                let id = mm.create_node();
                mm.reserve_node(id, i * 100, 100, 0).unwrap();
                id
            })
            .collect();
        (mm, ids)
    }

    fn snapshot(mm: &DrmMm) -> (Vec<(DrmMmNode, bool)>, Vec<Range<u64>>) {
        let nodes = mm
            .nodes()
            .map(|(id, node)| (node, mm.hole_follows(id)))
            .collect();
        (nodes, mm.holes().collect())
    }

    #[test]
    fn scan_selects_overlapping_victims() {
        let (mut mm, ids) = packed(4);
        let before = snapshot(&mm);
        let mut scan = DrmMmScan::new(&mm, 200, 0, 0, InsertMode::Evict);

        let roster = [ids[2], ids[0], ids[1]];
        assert!(!mm.scan_add_block(&mut scan, roster[0]));
        assert!(!mm.scan_add_block(&mut scan, roster[1]));
        assert_eq!(mm.state(), MmState::Scanning);
        assert!(mm.scan_add_block(&mut scan, roster[2]));
        assert_eq!(scan.hit(), Some(0..200));

        let evict: Vec<_> = roster
            .iter()
            .rev()
            .map(|&id| mm.scan_remove_block(&scan, id))
            .collect();
        assert_eq!(evict, [true, true, false]);
        assert_eq!(mm.state(), MmState::Idle);
        assert_eq!(snapshot(&mm), before);

        mm.remove_node(ids[0]);
        mm.remove_node(ids[1]);
        let new = mm.create_node();
        mm.insert_node_in_range(new, 200, 0, 0, 0, u64::MAX, InsertMode::Evict)
            .unwrap();
        assert_eq!(mm.node(new).start, 0);
    }

    #[test]
    fn first_hit_is_kept() {
        let (mut mm, ids) = packed(4);
        let mut scan = DrmMmScan::new(&mm, 100, 0, 0, InsertMode::Evict);
        assert!(mm.scan_add_block(&mut scan, ids[1]));
        assert_eq!(scan.hit(), Some(100..200));
        assert!(mm.scan_add_block(&mut scan, ids[3]));
        assert_eq!(scan.hit(), Some(100..200));

        assert!(!mm.scan_remove_block(&scan, ids[3]));
        assert!(mm.scan_remove_block(&scan, ids[1]));
    }

    #[test]
    fn no_hit_evicts_nothing() {
        let (mut mm, ids) = packed(3);
        let mut scan = DrmMmScan::new(&mm, 300, 0, 0, InsertMode::Low);
        assert!(!mm.scan_add_block(&mut scan, ids[0]));
        assert!(!mm.scan_add_block(&mut scan, ids[1]));
        assert_eq!(scan.hit(), None);
        assert!(!mm.scan_remove_block(&scan, ids[1]));
        assert!(!mm.scan_remove_block(&scan, ids[0]));
    }

    #[test]
    fn high_mode_hits_top_of_hole() {
        let (mut mm, ids) = packed(4);
        let mut scan = DrmMmScan::new(&mm, 150, 0, 0, InsertMode::High);
        assert!(!mm.scan_add_block(&mut scan, ids[1]));
        assert!(mm.scan_add_block(&mut scan, ids[2]));
        assert_eq!(scan.hit(), Some(150..300));
        assert!(mm.scan_remove_block(&scan, ids[2]));
        assert!(mm.scan_remove_block(&scan, ids[1]));
    }

    #[test]
    fn alignment_and_range_restrict_hit() {
        let (mut mm, ids) = packed(4);
        let mut scan = DrmMmScan::with_range(&mm, 100, 64, 0, 0, 400, InsertMode::Low);
        assert_eq!(scan.alignment(), 64);
        // 100..200 alone cannot hold an aligned 100-unit block.
        assert!(!mm.scan_add_block(&mut scan, ids[1]));
        assert!(mm.scan_add_block(&mut scan, ids[2]));
        assert_eq!(scan.hit(), Some(128..228));
        assert!(mm.scan_remove_block(&scan, ids[2]));
        assert!(mm.scan_remove_block(&scan, ids[1]));

        let mut scan = DrmMmScan::with_range(&mm, 100, 1, 0, 250, 400, InsertMode::Low);
        assert_eq!(scan.alignment(), 0);
        assert!(!mm.scan_add_block(&mut scan, ids[1]));
        assert!(!mm.scan_add_block(&mut scan, ids[2]));
        assert!(mm.scan_add_block(&mut scan, ids[3]));
        assert_eq!(scan.hit(), Some(250..350));
        for id in [ids[3], ids[2], ids[1]] {
            mm.scan_remove_block(&scan, id);
        }
        assert_eq!(mm.state(), MmState::Idle);
    }

    #[test]
    fn non_power_of_two_alignment() {
        let (mut mm, ids) = packed(4);
        let mut scan = DrmMmScan::new(&mm, 100, 3, 0, InsertMode::Low);
        assert!(!mm.scan_add_block(&mut scan, ids[1]));
        assert!(mm.scan_add_block(&mut scan, ids[2]));
        assert_eq!(scan.hit(), Some(102..202));
        mm.scan_remove_block(&scan, ids[2]);
        mm.scan_remove_block(&scan, ids[1]);
    }

    #[test]
    #[should_panic(expected = "eviction scan is active")]
    fn insert_during_scan_panics() {
        let (mut mm, ids) = packed(2);
        let mut scan = DrmMmScan::new(&mm, 100, 0, 0, InsertMode::Low);
        mm.scan_add_block(&mut scan, ids[0]);
        let extra = mm.create_node();
        let _ = mm.insert_node_in_range(extra, 10, 0, 0, 0, 200, InsertMode::Low);
    }

    #[test]
    #[should_panic(expected = "eviction scan is active")]
    fn second_scan_panics() {
        let (mut mm, ids) = packed(2);
        let mut scan = DrmMmScan::new(&mm, 100, 0, 0, InsertMode::Low);
        mm.scan_add_block(&mut scan, ids[0]);
        let _ = DrmMmScan::new(&mm, 100, 0, 0, InsertMode::Low);
    }

    #[test]
    #[should_panic(expected = "another eviction scan is active")]
    fn interleaved_scans_panic() {
        let (mut mm, ids) = packed(4);
        let mut first = DrmMmScan::new(&mm, 100, 0, 0, InsertMode::Evict);
        let mut second = DrmMmScan::new(&mm, 100, 0, 0, InsertMode::Evict);
        mm.scan_add_block(&mut first, ids[0]);
        mm.scan_add_block(&mut second, ids[1]);
    }

    #[test]
    #[should_panic(expected = "not on the roster of this scan")]
    fn unwinding_with_another_scan_panics() {
        let (mut mm, ids) = packed(4);
        let mut first = DrmMmScan::new(&mm, 200, 0, 0, InsertMode::Evict);
        let second = DrmMmScan::new(&mm, 200, 0, 0, InsertMode::Evict);
        mm.scan_add_block(&mut first, ids[0]);
        mm.scan_remove_block(&second, ids[0]);
    }

    #[test]
    fn scans_can_run_one_after_another() {
        let (mut mm, ids) = packed(4);
        let mut first = DrmMmScan::new(&mm, 100, 0, 0, InsertMode::Evict);
        let mut second = DrmMmScan::new(&mm, 100, 0, 0, InsertMode::Evict);
        assert!(mm.scan_add_block(&mut first, ids[0]));
        assert!(mm.scan_remove_block(&first, ids[0]));

        assert!(mm.scan_add_block(&mut second, ids[1]));
        assert_eq!(second.hit(), Some(100..200));
        assert!(mm.scan_remove_block(&second, ids[1]));
        assert_eq!(mm.state(), MmState::Idle);
    }

    #[test]
    #[should_panic(expected = "another allocator")]
    fn foreign_scan_panics() {
        let (mut mm, ids) = packed(2);
        let (other, _) = packed(2);
        let mut scan = DrmMmScan::new(&other, 100, 0, 0, InsertMode::Low);
        mm.scan_add_block(&mut scan, ids[0]);
    }

    #[test]
    #[should_panic(expected = "does not fit range")]
    fn oversized_scan_panics() {
        let (mm, _) = packed(2);
        let _ = DrmMmScan::with_range(&mm, 300, 0, 0, 0, 200, InsertMode::Low);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "out of order")]
    fn out_of_order_unwind_is_caught() {
        let (mut mm, ids) = packed(4);
        let mut scan = DrmMmScan::new(&mm, 400, 0, 0, InsertMode::Low);
        mm.scan_add_block(&mut scan, ids[1]);
        mm.scan_add_block(&mut scan, ids[2]);
        mm.scan_remove_block(&scan, ids[1]);
    }

    #[test]
    fn color_evict_without_strategy_is_none() {
        let (mut mm, ids) = packed(2);
        let mut scan = DrmMmScan::new(&mm, 100, 0, 0, InsertMode::Low);
        assert!(mm.scan_add_block(&mut scan, ids[0]));
        assert!(mm.scan_remove_block(&scan, ids[0]));
        mm.remove_node(ids[0]);
        assert_eq!(mm.scan_color_evict(&scan), None);
    }

    #[test]
    fn color_evict_finds_kept_neighbor() {
        let mut mm = DrmMm::with_color_adjust(0, 300, GuardGap::new(16));
        let ids: Vec<_> = (0..3)
            .map(|i| {
                let id = mm.create_node();
                mm.reserve_node(id, i * 100, 100, 1).unwrap();
                id
            })
            .collect();

        let mut scan = DrmMmScan::new(&mm, 100, 0, 2, InsertMode::Evict);
        let roster = [ids[2], ids[0], ids[1]];
        assert!(!mm.scan_add_block(&mut scan, roster[0]));
        assert!(!mm.scan_add_block(&mut scan, roster[1]));
        assert!(mm.scan_add_block(&mut scan, roster[2]));
        assert_eq!(scan.hit(), Some(0..100));

        let evict: Vec<_> = roster
            .iter()
            .rev()
            .map(|&id| mm.scan_remove_block(&scan, id))
            .collect();
        assert_eq!(evict, [false, true, false]);
        mm.remove_node(ids[0]);

        // ids[1] now borders the hole with another color.
        assert_eq!(mm.scan_color_evict(&scan), Some(ids[1]));
        mm.remove_node(ids[1]);
        assert_eq!(mm.scan_color_evict(&scan), None);

        let new = mm.create_node();
        mm.insert_node_in_range(new, 100, 0, 2, 0, 300, InsertMode::Evict)
            .unwrap();
        assert_eq!(mm.node(new).start, 0);
    }
}
