//! Directed, format-carrying edges between node buses.

use alloc::sync::{Arc, Weak};
use core::cell::RefCell;
use core::sync::atomic::{AtomicU64, Ordering};

use parking_lot::ReentrantMutex;

use crate::error::Direction;
use crate::format::Format;
use crate::node::{GraphNode, NodeId};

/// Identity of a [`Connection`] for the lifetime of the process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

struct Endpoints {
    source: Weak<GraphNode>,
    destination: Weak<GraphNode>,
}

/// One output bus of a source node wired to one input bus of a destination node.
///
/// The [`Graph`](crate::Graph) owns every connection; nodes and kernels only
/// hold [`Weak`] references. The endpoint references are cleared when the
/// graph disconnects the edge, after which [`source_node`](Self::source_node)
/// and [`destination_node`](Self::destination_node) resolve to `None` and a
/// render pulling through it becomes a no-op.
pub struct Connection {
    id: ConnectionId,
    source_bus: u32,
    destination_bus: u32,
    source_id: NodeId,
    destination_id: NodeId,
    format: Format,
    endpoints: ReentrantMutex<RefCell<Endpoints>>,
}

impl Connection {
    pub(crate) fn new(
        source: &Arc<GraphNode>,
        source_bus: u32,
        destination: &Arc<GraphNode>,
        destination_bus: u32,
        format: Format,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            source_bus,
            destination_bus,
            source_id: source.id(),
            destination_id: destination.id(),
            format,
            endpoints: ReentrantMutex::new(RefCell::new(Endpoints {
                source: Arc::downgrade(source),
                destination: Arc::downgrade(destination),
            })),
        })
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn source_bus(&self) -> u32 {
        self.source_bus
    }

    #[inline]
    pub fn destination_bus(&self) -> u32 {
        self.destination_bus
    }

    #[inline]
    pub fn format(&self) -> &Format {
        &self.format
    }

    /// Id of the node this connection was created from. Stays valid after
    /// the endpoint reference has been cleared.
    #[inline]
    pub fn source_node_id(&self) -> NodeId {
        self.source_id
    }

    #[inline]
    pub fn destination_node_id(&self) -> NodeId {
        self.destination_id
    }

    pub fn source_node(&self) -> Option<Arc<GraphNode>> {
        let guard = self.endpoints.lock();
        let node = guard.borrow().source.upgrade();
        node
    }

    pub fn destination_node(&self) -> Option<Arc<GraphNode>> {
        let guard = self.endpoints.lock();
        let node = guard.borrow().destination.upgrade();
        node
    }

    /// Whether `node` is either endpoint.
    pub fn touches(&self, node: NodeId) -> bool {
        self.source_id == node || self.destination_id == node
    }

    pub(crate) fn remove_nodes(&self) {
        let _guard = self.endpoints.lock();
        self.remove_source_node();
        self.remove_destination_node();
    }

    pub(crate) fn remove_source_node(&self) {
        let guard = self.endpoints.lock();
        guard.borrow_mut().source = Weak::new();
    }

    pub(crate) fn remove_destination_node(&self) {
        let guard = self.endpoints.lock();
        guard.borrow_mut().destination = Weak::new();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let this: *const Connection = self;
        let endpoints = self.endpoints.get_mut().get_mut();
        if let Some(node) = endpoints.destination.upgrade() {
            node.forget_connection(Direction::Input, self.destination_bus, this);
        }
        if let Some(node) = endpoints.source.upgrade() {
            node.forget_connection(Direction::Output, self.source_bus, this);
        }
    }
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("source", &(self.source_id, self.source_bus))
            .field("destination", &(self.destination_id, self.destination_bus))
            .field("format", &self.format)
            .finish()
    }
}
