//! Ready-made node kinds built on [`GraphNode`](crate::GraphNode).
//!
//! - [`GraphTap`] - pass-through with an optional user render handler
//! - [`GraphInputTap`] - receives the device input directly each callback
//! - [`GraphMixer`] - sums any number of inputs
//! - [`GraphRoute`] - moves channels between buses along a route set

pub mod mixer;
pub mod route;
pub mod tap;

pub use mixer::GraphMixer;
pub use route::{GraphRoute, Route, RoutePoint, RouteSet};
pub use tap::{GraphInputTap, GraphTap};

use alloc::sync::Weak;

use crate::config::DEFAULT_MAXIMUM_FRAMES_PER_SLICE;
use crate::node::GraphNode;

/// Frames a kernel's scratch buffer is sized for: `fixed` if given, else
/// the slice limit of the graph `node` is attached to.
pub(crate) fn scratch_frames(node: &Weak<GraphNode>, fixed: Option<u32>) -> u32 {
    fixed
        .or_else(|| {
            node.upgrade()
                .and_then(|node| node.graph())
                .map(|graph| graph.config().maximum_frames_per_slice)
        })
        .unwrap_or(DEFAULT_MAXIMUM_FRAMES_PER_SLICE)
}
