//! Immutable per-node topology snapshots read by the render thread.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::any::Any;

use crate::connection::Connection;
use crate::node::RenderFn;

/// Bus index to connection, as stored by nodes and kernels.
pub type ConnectionWeakMap = BTreeMap<u32, Weak<Connection>>;

/// A node's connection topology and render handler at one point in time.
///
/// Built on the control thread whenever the node's connections change and
/// published with a single pointer swap. A render call holds on to the
/// kernel it started with, so it sees one consistent topology even if the
/// node is rewired while it runs. Connections are held weakly and resolved
/// on each access; one that has been dropped since the snapshot was taken
/// simply reads as absent.
pub struct Kernel {
    input_connections: ConnectionWeakMap,
    output_connections: ConnectionWeakMap,
    render_handler: Option<Arc<RenderFn>>,
    decorator: Option<Box<dyn Any + Send + Sync>>,
}

impl Kernel {
    pub(crate) fn new(
        input_connections: ConnectionWeakMap,
        output_connections: ConnectionWeakMap,
        render_handler: Option<Arc<RenderFn>>,
    ) -> Self {
        Self {
            input_connections,
            output_connections,
            render_handler,
            decorator: None,
        }
    }

    pub fn input_connection(&self, bus: u32) -> Option<Arc<Connection>> {
        self.input_connections.get(&bus).and_then(Weak::upgrade)
    }

    pub fn output_connection(&self, bus: u32) -> Option<Arc<Connection>> {
        self.output_connections.get(&bus).and_then(Weak::upgrade)
    }

    /// Live input connections in bus order. Expired entries are skipped.
    pub fn input_connections(&self) -> impl Iterator<Item = (u32, Arc<Connection>)> + '_ {
        resolve(&self.input_connections)
    }

    /// Live output connections in bus order. Expired entries are skipped.
    pub fn output_connections(&self) -> impl Iterator<Item = (u32, Arc<Connection>)> + '_ {
        resolve(&self.output_connections)
    }

    pub fn render_handler(&self) -> Option<&RenderFn> {
        self.render_handler.as_deref()
    }

    /// Attach extra render-time state. Meant to be called from a node's
    /// prepare-kernel handler, before the kernel is published.
    pub fn set_decorator<T: Any + Send + Sync>(&mut self, decorator: T) {
        self.decorator = Some(Box::new(decorator));
    }

    pub fn decorator<T: Any>(&self) -> Option<&T> {
        self.decorator.as_deref().and_then(|d| d.downcast_ref::<T>())
    }
}

fn resolve(map: &ConnectionWeakMap) -> impl Iterator<Item = (u32, Arc<Connection>)> + '_ {
    map.iter().filter_map(|(bus, weak)| weak.upgrade().map(|c| (*bus, c)))
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("inputs", &self.input_connections.keys().collect::<alloc::vec::Vec<_>>())
            .field("outputs", &self.output_connections.keys().collect::<alloc::vec::Vec<_>>())
            .field("has_render_handler", &self.render_handler.is_some())
            .field("has_decorator", &self.decorator.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::node::{GraphNode, GraphNodeArgs};

    #[test]
    fn expired_connections_read_as_absent() {
        let a = GraphNode::new(GraphNodeArgs::with_buses(0, 2));
        let b = GraphNode::new(GraphNodeArgs::with_buses(2, 0));
        let format = Format::float32(44100.0, 1);
        let c0 = Connection::new(&a, 0, &b, 0, format);
        let c1 = Connection::new(&a, 1, &b, 1, format);

        let mut inputs = ConnectionWeakMap::new();
        inputs.insert(0, Arc::downgrade(&c0));
        inputs.insert(1, Arc::downgrade(&c1));
        let kernel = Kernel::new(inputs, ConnectionWeakMap::new(), None);
        assert_eq!(kernel.input_connections().count(), 2);

        drop(c0);
        assert!(kernel.input_connection(0).is_none());
        let live: alloc::vec::Vec<u32> = kernel.input_connections().map(|(bus, _)| bus).collect();
        assert_eq!(live, [1]);
    }

    #[test]
    fn decorator_downcasts_by_type() {
        let mut kernel = Kernel::new(ConnectionWeakMap::new(), ConnectionWeakMap::new(), None);
        assert!(kernel.decorator::<u32>().is_none());
        kernel.set_decorator(7u32);
        assert_eq!(kernel.decorator::<u32>(), Some(&7));
        assert!(kernel.decorator::<i64>().is_none());
    }
}
