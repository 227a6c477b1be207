//! Search and placement modes.
//!
//! Search policy, walk direction and placement are independent axes, so each
//! is its own enum. [`InsertMode`] bundles the common combinations.

/// How a hole is chosen among the candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchPolicy {
    /// Take the first hole that fits. O(1) amortized in the common case.
    #[default]
    FirstFit,
    /// Take the smallest hole that fits, after walking every hole.
    BestFit,
}

/// Order in which the hole stack is walked.
///
/// The stack is ordered by recency, not by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchDirection {
    /// Most recently freed hole first.
    #[default]
    Forward,
    /// Oldest hole first. Pairs with [`Placement::Top`].
    Backward,
}

/// Where a node goes inside its hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// Lowest suitably aligned offset.
    #[default]
    Bottom,
    /// Highest suitably aligned offset. Alignment applies to the node start.
    Top,
}

/// Common search/placement combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertMode {
    /// Smallest hole that fits; node at the bottom.
    #[default]
    Best,
    /// First hole that fits; node at the bottom.
    Low,
    /// First hole that fits walking from the oldest hole; node at the top.
    High,
    /// Most recently freed hole that fits; node at the bottom. Use right
    /// after an eviction scan has freed its victims.
    Evict,
}

impl InsertMode {
    /// Returns the search policy of this mode.
    pub const fn policy(self) -> SearchPolicy {
        match self {
            Self::Best => SearchPolicy::BestFit,
            Self::Low | Self::High | Self::Evict => SearchPolicy::FirstFit,
        }
    }

    /// Returns the hole-stack walk direction of this mode.
    pub const fn direction(self) -> SearchDirection {
        match self {
            Self::High => SearchDirection::Backward,
            Self::Best | Self::Low | Self::Evict => SearchDirection::Forward,
        }
    }

    /// Returns the in-hole placement of this mode.
    pub const fn placement(self) -> Placement {
        match self {
            Self::High => Placement::Top,
            Self::Best | Self::Low | Self::Evict => Placement::Bottom,
        }
    }
}

/// Rounds `offset` up to a multiple of `alignment` (`0` means none).
///
/// Returns `None` if the rounded value does not fit in a `u64`.
pub(crate) const fn align_up(offset: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 {
        return Some(offset);
    }
    let rem = offset % alignment;
    if rem == 0 {
        Some(offset)
    } else {
        offset.checked_add(alignment - rem)
    }
}

/// Rounds `offset` down to a multiple of `alignment` (`0` means none).
pub(crate) const fn align_down(offset: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        offset
    } else {
        offset - offset % alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parts() {
        assert_eq!(InsertMode::Best.policy(), SearchPolicy::BestFit);
        assert_eq!(InsertMode::Low.placement(), Placement::Bottom);
        assert_eq!(InsertMode::High.direction(), SearchDirection::Backward);
        assert_eq!(InsertMode::High.placement(), Placement::Top);
        assert_eq!(InsertMode::Evict.direction(), SearchDirection::Forward);
        assert_eq!(InsertMode::Evict.policy(), SearchPolicy::FirstFit);
    }

    #[test]
    fn alignment_rounding() {
        assert_eq!(align_up(100, 16), Some(112));
        assert_eq!(align_up(112, 16), Some(112));
        assert_eq!(align_up(100, 0), Some(100));
        // Non power-of-two alignments are allowed.
        assert_eq!(align_up(10, 3), Some(12));
        assert_eq!(align_up(u64::MAX, 16), None);

        assert_eq!(align_down(100, 16), 96);
        assert_eq!(align_down(96, 16), 96);
        assert_eq!(align_down(11, 3), 9);
        assert_eq!(align_down(7, 0), 7);
    }
}
