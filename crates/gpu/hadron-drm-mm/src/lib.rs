//! Range allocator for GPU address spaces.
//!
//! [`DrmMm`] manages a linear interval `[start, start + size)` carved into
//! allocated nodes and the free holes between them. GPU memory managers use
//! it for GTT apertures, GPU virtual address space and framebuffer memory.
//!
//! The allocator keeps a stack of most recently freed holes. Free-space
//! searches walk that stack and are O(holes); removing a node is O(1). On top
//! of plain insertion it supports:
//!
//! - exact reservations ([`DrmMm::reserve_node`]), e.g. taking over a
//!   firmware framebuffer;
//! - alignment and bounded search ranges;
//! - first-fit and best-fit search, bottom-up and top-down placement;
//! - node colors with a caller-supplied [`ColorAdjust`] strategy that can
//!   narrow a hole, e.g. to keep guard pages between cache domains;
//! - an eviction scan ([`DrmMmScan`]) that picks the nodes whose removal
//!   opens a hole big enough for a pending allocation.
//!
//! Node storage is an arena owned by the allocator; callers hold [`NodeId`]
//! handles. The allocator does no locking of its own. Wrap it in a
//! [`SharedDrmMm`] or another lock when it is reachable from several CPUs.
//!
//! ```ignore
//! use hadron_drm_mm::{DrmMm, SearchPolicy};
//!
//! let mut mm = DrmMm::new(0, 1024);
//! let node = mm.create_node();
//! mm.insert_node(node, 100, 0, SearchPolicy::FirstFit)?;
//! assert_eq!(mm.node(node).start, 0);
//! mm.remove_node(node);
//! assert!(mm.is_clean());
//! ```

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

mod assert;
pub mod log;

pub mod color;
mod dump;
pub mod error;
mod mm;
pub mod mode;
pub mod node;
pub mod scan;
pub mod shared;

/// Opaque placement tag attached to every node.
///
/// The allocator never interprets colors itself; only the installed
/// [`ColorAdjust`] strategy does.
pub type Color = u64;

pub use color::{ColorAdjust, GuardGap, HoleNeighbors};
pub use dump::DrmMmUsage;
pub use error::DrmMmError;
pub use mm::{DrmMm, Holes, MmState, Nodes};
pub use mode::{InsertMode, Placement, SearchDirection, SearchPolicy};
pub use node::{DrmMmNode, NodeFlags, NodeId};
pub use scan::DrmMmScan;
pub use shared::SharedDrmMm;
