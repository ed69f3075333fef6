//! Graph configuration.

/// Default upper bound on frames delivered by one device callback.
pub const DEFAULT_MAXIMUM_FRAMES_PER_SLICE: u32 = 4096;

/// Settings applied when a [`Graph`](crate::Graph) is created.
///
/// ```
/// use klangnetz::{Graph, GraphConfig};
///
/// let graph = Graph::with_config(GraphConfig::default().with_maximum_frames_per_slice(512));
/// assert_eq!(graph.config().maximum_frames_per_slice, 512);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GraphConfig {
    /// Largest callback the I/O boundary is asked to deliver. Sizes the
    /// silence buffer and the input staging buffer.
    pub maximum_frames_per_slice: u32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            maximum_frames_per_slice: DEFAULT_MAXIMUM_FRAMES_PER_SLICE,
        }
    }
}

impl GraphConfig {
    pub fn with_maximum_frames_per_slice(mut self, frames: u32) -> Self {
        self.maximum_frames_per_slice = frames.max(1);
        self
    }
}
