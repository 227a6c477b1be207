//! Color adjustment strategies.
//!
//! Every node carries an opaque [`Color`]. When an allocator is built with a
//! [`ColorAdjust`] strategy, each candidate hole is passed through it before
//! alignment and fit checks, so the strategy can narrow the usable range
//! depending on the colors around the hole. The classic use is a guard gap
//! between nodes of incompatible cache domains, see [`GuardGap`].

use crate::Color;
use crate::node::DrmMmNode;

/// The allocated nodes on either side of a hole.
///
/// `before` is `None` for the hole at the start of the address space and
/// `after` is `None` for the hole that runs to its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HoleNeighbors {
    /// Node whose end opens the hole.
    pub before: Option<DrmMmNode>,
    /// Node whose start closes the hole.
    pub after: Option<DrmMmNode>,
}

/// Narrows a candidate hole for a given color.
///
/// Implementations may only shrink `[start, end)`, never grow it. Leaving
/// `start >= end` marks the hole unusable for that color.
pub trait ColorAdjust {
    /// Whether this strategy ever adjusts anything. The allocator skips the
    /// call, and the color-evict query, when it is `false`.
    const ENABLED: bool = true;

    /// Adjusts `[start, end)` for a node of `color` placed between
    /// `neighbors`.
    fn adjust(&self, neighbors: &HoleNeighbors, color: Color, start: &mut u64, end: &mut u64);
}

/// No color adjustment: holes are used as they are.
impl ColorAdjust for () {
    const ENABLED: bool = false;

    fn adjust(&self, _: &HoleNeighbors, _: Color, _: &mut u64, _: &mut u64) {}
}

/// Keeps a gap of `gap` units between nodes of different colors.
///
/// A hole next to a node of another color loses `gap` units on that side;
/// holes next to same-colored nodes, or the ends of the address space, are
/// left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardGap {
    gap: u64,
}

impl GuardGap {
    /// Creates a guard-gap strategy.
    pub const fn new(gap: u64) -> Self {
        Self { gap }
    }

    /// Returns the guard size.
    pub const fn gap(&self) -> u64 {
        self.gap
    }
}

impl ColorAdjust for GuardGap {
    fn adjust(&self, neighbors: &HoleNeighbors, color: Color, start: &mut u64, end: &mut u64) {
        if neighbors.before.is_some_and(|n| n.color != color) {
            *start = start.saturating_add(self.gap);
        }
        if neighbors.after.is_some_and(|n| n.color != color) {
            *end = end.saturating_sub(self.gap);
        }
    }
}
