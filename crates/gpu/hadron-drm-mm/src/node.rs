//! Node handles and the node arena.
//!
//! Every node lives in a slot of an [`Arena`] owned by its allocator and is
//! threaded onto two index-linked lists:
//!
//! - the **node list**: circular, doubly linked, ordered by start address,
//!   anchored at the sentinel head in slot 0;
//! - the **hole stack**: nodes followed by a non-empty gap, most recently
//!   freed first.
//!
//! Callers only ever see [`NodeId`] handles and [`DrmMmNode`] snapshots.

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use crate::Color;
use crate::assert::mm_bug_on;

/// Slot index of the sentinel head node.
pub(crate) const HEAD: usize = 0;

/// Handle to a node owned by a [`DrmMm`](crate::DrmMm).
///
/// Handles are obtained from [`DrmMm::create_node`](crate::DrmMm::create_node)
/// and stay valid until [`DrmMm::destroy_node`](crate::DrmMm::destroy_node).
/// A destroyed handle is never valid again, even if its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns the arena slot index.
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Returns the slot generation this handle was issued for.
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}.{}", self.index, self.generation)
    }
}

bitflags! {
    /// Allocator state bits of a node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        /// The node is linked into the node list.
        const ALLOCATED = 1 << 0;
        /// A non-empty hole follows the node; it is on the hole stack.
        const HOLE_FOLLOWS = 1 << 1;
        /// The node is on an eviction scan roster.
        const SCANNED_BLOCK = 1 << 2;
    }
}

/// Placement of a node: where it starts, how long it is and its color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrmMmNode {
    /// Offset from the base of the address space.
    pub start: u64,
    /// Length, in the same units as `start`.
    pub size: u64,
    /// Placement tag.
    pub color: Color,
}

impl DrmMmNode {
    /// Returns the first offset past the node.
    pub const fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// One arena slot.
#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub(crate) start: u64,
    pub(crate) size: u64,
    pub(crate) color: Color,
    pub(crate) flags: NodeFlags,
    pub(crate) generation: u32,
    /// Slot is handed out to a caller (always true for the head).
    pub(crate) live: bool,
    pub(crate) prev: usize,
    pub(crate) next: usize,
    pub(crate) hole_prev: Option<usize>,
    pub(crate) hole_next: Option<usize>,
}

impl Slot {
    const fn vacant(index: usize) -> Self {
        Self {
            start: 0,
            size: 0,
            color: 0,
            flags: NodeFlags::empty(),
            generation: 0,
            live: false,
            prev: index,
            next: index,
            hole_prev: None,
            hole_next: None,
        }
    }

    pub(crate) const fn view(&self) -> DrmMmNode {
        DrmMmNode {
            start: self.start,
            size: self.size,
            color: self.color,
        }
    }

    /// Start of the gap after this node.
    ///
    /// Wraps for the head, whose `start + size` is the allocator base.
    pub(crate) const fn hole_start(&self) -> u64 {
        self.start.wrapping_add(self.size)
    }
}

/// Slot storage plus the two index-linked lists.
#[derive(Debug)]
pub(crate) struct Arena {
    slots: Vec<Slot>,
    vacant: Vec<usize>,
    hole_first: Option<usize>,
    hole_last: Option<usize>,
}

impl Arena {
    /// Creates an arena holding only the sentinel head, linked to itself.
    pub(crate) fn new(head_start: u64, head_size: u64) -> Self {
        let mut head = Slot::vacant(HEAD);
        head.start = head_start;
        head.size = head_size;
        head.live = true;
        Self {
            slots: alloc::vec![head],
            vacant: Vec::new(),
            hole_first: None,
            hole_last: None,
        }
    }

    // -----------------------------------------------------------------------
    // Slot management
    // -----------------------------------------------------------------------

    #[allow(clippy::cast_possible_truncation, reason = "bounded by the check below")]
    pub(crate) fn create(&mut self) -> NodeId {
        let index = if let Some(index) = self.vacant.pop() {
            index
        } else {
            mm_bug_on!(
                self.slots.len() > u32::MAX as usize,
                "node arena exhausted"
            );
            self.slots.push(Slot::vacant(self.slots.len()));
            self.slots.len() - 1
        };
        let slot = &mut self.slots[index];
        slot.live = true;
        NodeId::new(index as u32, slot.generation)
    }

    pub(crate) fn destroy(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        let generation = slot.generation.wrapping_add(1);
        *slot = Slot::vacant(index);
        slot.generation = generation;
        self.vacant.push(index);
    }

    /// Maps a handle to its slot index, panicking on stale or foreign handles.
    pub(crate) fn resolve(&self, id: NodeId) -> usize {
        let index = id.index as usize;
        let valid = index != HEAD
            && self
                .slots
                .get(index)
                .is_some_and(|s| s.live && s.generation == id.generation);
        mm_bug_on!(!valid, "{} is not a live node of this allocator", id);
        index
    }

    #[allow(clippy::cast_possible_truncation, reason = "indices are issued as u32")]
    pub(crate) fn id_of(&self, index: usize) -> NodeId {
        NodeId::new(index as u32, self.slots[index].generation)
    }

    pub(crate) fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut Slot {
        &mut self.slots[index]
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.vacant.len() - 1
    }

    // -----------------------------------------------------------------------
    // Node list
    // -----------------------------------------------------------------------

    /// Links `index` right after `at` in address order.
    pub(crate) fn link_after(&mut self, at: usize, index: usize) {
        let next = self.slots[at].next;
        self.slots[index].prev = at;
        self.slots[index].next = next;
        self.slots[at].next = index;
        self.slots[next].prev = index;
    }

    /// Unlinks `index` from the node list but leaves its own links intact so
    /// [`relink`](Self::relink) can put it back.
    pub(crate) fn unlink(&mut self, index: usize) {
        let Slot { prev, next, .. } = self.slots[index];
        self.slots[prev].next = next;
        self.slots[next].prev = prev;
    }

    /// Re-links a node removed with [`unlink`](Self::unlink) at its old
    /// position.
    pub(crate) fn relink(&mut self, index: usize) {
        let prev = self.slots[index].prev;
        self.link_after(prev, index);
    }

    /// Moves the node-list position of `old` to `new`.
    pub(crate) fn transplant(&mut self, old: usize, new: usize) {
        let Slot { prev, next, .. } = self.slots[old];
        self.slots[new].prev = prev;
        self.slots[new].next = next;
        self.slots[prev].next = new;
        self.slots[next].prev = new;
        self.slots[old].prev = old;
        self.slots[old].next = old;

        let on_stack = self.slots[old].hole_prev.is_some() || self.hole_first == Some(old);
        if on_stack {
            let Slot {
                hole_prev,
                hole_next,
                ..
            } = self.slots[old];
            self.slots[new].hole_prev = hole_prev;
            self.slots[new].hole_next = hole_next;
            match hole_prev {
                Some(p) => self.slots[p].hole_next = Some(new),
                None => self.hole_first = Some(new),
            }
            match hole_next {
                Some(n) => self.slots[n].hole_prev = Some(new),
                None => self.hole_last = Some(new),
            }
            self.slots[old].hole_prev = None;
            self.slots[old].hole_next = None;
        }
    }

    // -----------------------------------------------------------------------
    // Hole stack
    // -----------------------------------------------------------------------

    /// Pushes `index` onto the front of the hole stack.
    pub(crate) fn push_hole(&mut self, index: usize) {
        let first = self.hole_first;
        self.slots[index].hole_prev = None;
        self.slots[index].hole_next = first;
        match first {
            Some(f) => self.slots[f].hole_prev = Some(index),
            None => self.hole_last = Some(index),
        }
        self.hole_first = Some(index);
    }

    /// Removes `index` from the hole stack.
    pub(crate) fn pop_hole(&mut self, index: usize) {
        let Slot {
            hole_prev,
            hole_next,
            ..
        } = self.slots[index];
        match hole_prev {
            Some(p) => self.slots[p].hole_next = hole_next,
            None => self.hole_first = hole_next,
        }
        match hole_next {
            Some(n) => self.slots[n].hole_prev = hole_prev,
            None => self.hole_last = hole_prev,
        }
        self.slots[index].hole_prev = None;
        self.slots[index].hole_next = None;
    }

    /// Moves `index`, already on the hole stack, to its front.
    pub(crate) fn raise_hole(&mut self, index: usize) {
        self.pop_hole(index);
        self.push_hole(index);
    }

    pub(crate) fn hole_first(&self) -> Option<usize> {
        self.hole_first
    }

    pub(crate) fn hole_last(&self) -> Option<usize> {
        self.hole_last
    }
}
