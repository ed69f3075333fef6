//! A realtime audio routing graph.
//!
//! Nodes with fixed input and output buses are wired together by
//! format-carrying [`Connection`]s owned by a [`Graph`]. The audio callback
//! pulls buffers through the graph from the device output upstream, while the
//! control thread keeps rewiring it.
//!
//! Rendering never waits on the control thread. Every node publishes an
//! immutable [`Kernel`] describing its connections, swapped in atomically
//! whenever they change; a render call keeps the kernel it started with and
//! resolves connections through weak references, so a connection removed
//! mid-callback simply reads as absent.
//!
//! ```
//! use klangnetz::io::offline::OfflineDevice;
//! use klangnetz::{AudioTime, Format, Graph, GraphNode, GraphNodeArgs, PcmBuffer};
//!
//! let format = Format::float32(48000.0, 1);
//! let device = OfflineDevice::new(Some(format), None);
//!
//! let graph = Graph::new();
//! let io = graph.add_io(Some(device.clone()));
//!
//! let tone = GraphNode::new(GraphNodeArgs::with_buses(0, 1));
//! tone.set_render_handler(|args| args.buffer.data_mut(0).fill(0.25));
//! graph.connect(&tone, io.output_node(), format).unwrap();
//!
//! graph.start_render().unwrap();
//! let mut out = PcmBuffer::new(format, 256);
//! device.render(Some(&mut out), None, AudioTime::new(0, 48000.0));
//! assert!(out.data(0).iter().all(|&s| s == 0.25));
//! ```

extern crate alloc;

mod buffer;
mod config;
mod connection;
mod error;
mod format;
mod graph;
pub mod io;
mod kernel;
mod node;
pub mod nodes;
mod notify;

pub use buffer::{PcmBuffer, SilenceBuffer};
pub use config::{GraphConfig, DEFAULT_MAXIMUM_FRAMES_PER_SLICE};
pub use connection::{Connection, ConnectionId};
pub use error::{BufferError, Direction, GraphError, IoError};
pub use format::{AudioTime, Format, PcmFormat};
pub use graph::Graph;
pub use kernel::{ConnectionWeakMap, Kernel};
pub use node::{
    render_source, GraphNode, GraphNodeArgs, LifecycleFn, NodeId, NodeMethod, PrepareKernelFn, RenderArgs, RenderFn,
};
pub use notify::{Notifier, Observer};
