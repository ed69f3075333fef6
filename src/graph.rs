//! The graph: owns nodes and connections and drives the I/O lifecycle.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::buffer::SilenceBuffer;
use crate::config::GraphConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::{Direction, GraphError};
use crate::format::Format;
use crate::io::graph_io::GraphIo;
use crate::io::{AudioIo, DeviceMethod, IoDevice, RunningMethod};
use crate::node::{first_free, GraphNode, LifecycleFn, NodeId};
use crate::notify::Observer;

#[derive(Default)]
struct GraphState {
    nodes: HashMap<NodeId, Arc<GraphNode>>,
    connections: HashMap<ConnectionId, Arc<Connection>>,
}

impl GraphState {
    fn used_output_buses(&self, node: &GraphNode) -> Vec<u32> {
        self.connections
            .values()
            .filter(|c| c.source_node_id() == node.id())
            .map(|c| node.logical_output_bus(c.source_bus()))
            .sorted_unstable()
            .collect()
    }

    fn used_input_buses(&self, node: &GraphNode) -> Vec<u32> {
        self.connections
            .values()
            .filter(|c| c.destination_node_id() == node.id())
            .map(|c| c.destination_bus())
            .sorted_unstable()
            .collect()
    }

    fn is_in_use(&self, node: NodeId) -> bool {
        self.connections.values().any(|c| c.touches(node))
    }
}

struct IoBinding {
    graph_io: Arc<GraphIo>,
    _running: Observer,
    _device: Observer,
}

pub(crate) struct GraphCore {
    config: GraphConfig,
    state: Mutex<GraphState>,
    io: Mutex<Option<IoBinding>>,
    silence: Arc<SilenceBuffer>,
}

/// A set of connected nodes and the I/O that renders them.
///
/// The graph holds the only strong references to its connections. Nodes are
/// attached when they are first connected and detached when their last
/// connection goes away.
///
/// Topology changes come from the control thread. While the I/O is running,
/// each change ends with one rewiring pass of the device render handler.
/// Rendering itself never touches the graph's bookkeeping; it only reads the
/// kernels of the nodes it visits.
///
/// `Graph` is a cheap handle; clones share the same graph, which is torn
/// down when the last handle is dropped.
///
/// ```
/// use klangnetz::{Format, Graph, GraphNode, GraphNodeArgs};
///
/// let graph = Graph::new();
/// let a = GraphNode::new(GraphNodeArgs::with_buses(0, 1));
/// let b = GraphNode::new(GraphNodeArgs::with_buses(1, 0));
///
/// let connection = graph.connect(&a, &b, Format::float32(48000.0, 2)).unwrap();
/// assert_eq!((connection.source_bus(), connection.destination_bus()), (0, 0));
/// assert!(a.is_attached() && b.is_attached());
///
/// graph.disconnect(&connection);
/// assert!(!a.is_attached() && !b.is_attached());
/// assert!(graph.connections().is_empty());
/// ```
#[derive(Clone)]
pub struct Graph {
    core: Arc<GraphCore>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::with_config(GraphConfig::default())
    }

    pub fn with_config(config: GraphConfig) -> Self {
        Self {
            core: Arc::new(GraphCore {
                config,
                state: Mutex::default(),
                io: Mutex::new(None),
                silence: Arc::new(SilenceBuffer::new(config.maximum_frames_per_slice)),
            }),
        }
    }

    pub(crate) fn from_core(core: Arc<GraphCore>) -> Self {
        Self { core }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.core.config
    }

    /// Zeros shared by everything in this graph that renders "nothing connected".
    pub fn silence(&self) -> &Arc<SilenceBuffer> {
        &self.core.silence
    }

    // Connect

    /// Connect the lowest free output bus of `source` to the lowest free
    /// input bus of `destination`.
    pub fn connect(
        &self,
        source: &Arc<GraphNode>,
        destination: &Arc<GraphNode>,
        format: Format,
    ) -> Result<Arc<Connection>, GraphError> {
        let (source_bus, destination_bus) = {
            let state = self.core.state.lock();
            let source_bus = first_free(state.used_output_buses(source), source.output_bus_count())
                .map(|bus| source.physical_output_bus(bus))
                .ok_or(GraphError::BusUnavailable {
                    direction: Direction::Output,
                    bus: None,
                })?;
            let destination_bus = first_free(state.used_input_buses(destination), destination.input_bus_count())
                .ok_or(GraphError::BusUnavailable {
                    direction: Direction::Input,
                    bus: None,
                })?;
            (source_bus, destination_bus)
        };
        self.connect_with_buses(source, destination, source_bus, destination_bus, format)
    }

    /// Connect output `source_bus` of `source` to input `destination_bus` of
    /// `destination`, attaching either node first if needed.
    ///
    /// Fails without changing anything if either bus is out of range or
    /// already carries a connection.
    pub fn connect_with_buses(
        &self,
        source: &Arc<GraphNode>,
        destination: &Arc<GraphNode>,
        source_bus: u32,
        destination_bus: u32,
        format: Format,
    ) -> Result<Arc<Connection>, GraphError> {
        let (connection, attached) = {
            let mut state = self.core.state.lock();

            let logical = source.logical_output_bus(source_bus);
            if logical >= source.output_bus_count() || state.used_output_buses(source).contains(&logical) {
                return Err(GraphError::BusUnavailable {
                    direction: Direction::Output,
                    bus: Some(source_bus),
                });
            }
            if destination_bus >= destination.input_bus_count()
                || state.used_input_buses(destination).contains(&destination_bus)
            {
                return Err(GraphError::BusUnavailable {
                    direction: Direction::Input,
                    bus: Some(destination_bus),
                });
            }
            for node in [source, destination] {
                if !state.nodes.contains_key(&node.id()) && node.is_attached() {
                    error!(node = ?node.id(), "node belongs to another graph");
                    return Err(GraphError::NodeAlreadyAttached(node.id()));
                }
            }

            let mut attached = Vec::new();
            for node in [source, destination] {
                if !state.nodes.contains_key(&node.id()) {
                    state.nodes.insert(node.id(), node.clone());
                    attached.push(node.clone());
                }
            }

            let connection = Connection::new(source, source_bus, destination, destination_bus, format);
            state.connections.insert(connection.id(), connection.clone());
            (connection, attached)
        };

        for node in &attached {
            self.core.attach_node(node);
        }

        source.add_output_connection(&connection);
        destination.add_input_connection(&connection);

        debug!(
            source = ?source.id(),
            source_bus,
            destination = ?destination.id(),
            destination_bus,
            "connected"
        );

        if self.is_running() {
            self.core.update_io_rendering();
        }

        Ok(connection)
    }

    /// Connect `source` to the device output. Creates the I/O if there is none.
    pub fn connect_output(&self, source: &Arc<GraphNode>, format: Format) -> Result<Arc<Connection>, GraphError> {
        let io = self.add_io(None);
        self.connect(source, io.output_node(), format)
    }

    /// Connect the device input to `destination`. Creates the I/O if there is none.
    pub fn connect_input(&self, destination: &Arc<GraphNode>, format: Format) -> Result<Arc<Connection>, GraphError> {
        let io = self.add_io(None);
        self.connect(io.input_node(), destination, format)
    }

    // Disconnect

    pub fn disconnect(&self, connection: &Connection) {
        let id = connection.id();
        self.disconnect_node_with_predicate(|c| c.id() == id);
    }

    /// Remove every connection of `node`.
    pub fn disconnect_node(&self, node: &GraphNode) {
        let id = node.id();
        self.disconnect_node_with_predicate(|c| c.touches(id));
    }

    pub fn disconnect_input(&self, node: &GraphNode) {
        let id = node.id();
        self.disconnect_node_with_predicate(|c| c.destination_node_id() == id);
    }

    pub fn disconnect_input_bus(&self, node: &GraphNode, bus: u32) {
        let id = node.id();
        self.disconnect_node_with_predicate(|c| c.destination_node_id() == id && c.destination_bus() == bus);
    }

    pub fn disconnect_output(&self, node: &GraphNode) {
        let id = node.id();
        self.disconnect_node_with_predicate(|c| c.source_node_id() == id);
    }

    /// Remove the connection on output `bus` of `node`. `bus` is physical,
    /// as passed to [`connect_with_buses`](Self::connect_with_buses).
    pub fn disconnect_output_bus(&self, node: &GraphNode, bus: u32) {
        let id = node.id();
        self.disconnect_node_with_predicate(|c| c.source_node_id() == id && c.source_bus() == bus);
    }

    /// Remove every connection matching `predicate`, detach nodes left
    /// without connections, then rewire the I/O once if running.
    ///
    /// `predicate` runs on a snapshot without the graph locked, so it may
    /// query the graph.
    pub fn disconnect_node_with_predicate<P>(&self, predicate: P)
    where
        P: Fn(&Connection) -> bool,
    {
        let matched = self.connections().into_iter().filter(|c| predicate(c)).collect_vec();
        if matched.is_empty() {
            return;
        }

        let (removed, detached) = {
            let mut state = self.core.state.lock();

            let removed = matched
                .into_iter()
                .filter(|c| state.connections.remove(&c.id()).is_some())
                .collect_vec();
            if removed.is_empty() {
                return;
            }

            let candidates: HashSet<NodeId> = removed
                .iter()
                .flat_map(|c| [c.source_node_id(), c.destination_node_id()])
                .collect();
            let unused = candidates
                .into_iter()
                .filter(|id| !state.is_in_use(*id))
                .collect_vec();
            let detached = unused
                .iter()
                .filter_map(|id| state.nodes.remove(id))
                .collect_vec();

            (removed, detached)
        };

        for connection in &removed {
            remove_connection_from_nodes(connection);
            connection.remove_nodes();
        }

        for node in &detached {
            self.core.detach_node(node);
        }

        debug!(removed = removed.len(), detached = detached.len(), "disconnected");

        if self.is_running() {
            self.core.update_io_rendering();
        }
    }

    // I/O

    /// The graph's I/O, created on first call. Later calls return the same
    /// instance and ignore `device`.
    pub fn add_io(&self, device: Option<Arc<dyn IoDevice>>) -> Arc<GraphIo> {
        let mut io = self.core.io.lock();
        if let Some(binding) = io.as_ref() {
            return binding.graph_io.clone();
        }

        let raw_io = AudioIo::with_maximum_frames(device, self.core.config.maximum_frames_per_slice);
        let graph_io = Arc::new(GraphIo::new(raw_io.clone(), self.core.silence.clone()));

        let weak = Arc::downgrade(&self.core);
        let running = raw_io.observe_running(move |method| {
            let Some(core) = weak.upgrade() else {
                return;
            };
            match method {
                RunningMethod::WillStart => {
                    if let Err(err) = core.setup_rendering() {
                        error!(%err, "failed to set up rendering");
                        debug_assert!(false, "{err}");
                    }
                }
                RunningMethod::DidStop => core.dispose_rendering(),
            }
        });

        let weak = Arc::downgrade(&self.core);
        let device = raw_io.observe_device(move |method| {
            if *method == DeviceMethod::Updated {
                if let Some(core) = weak.upgrade() {
                    core.reset_nodes();
                }
            }
        });

        *io = Some(IoBinding {
            graph_io: graph_io.clone(),
            _running: running,
            _device: device,
        });
        debug!("io added");
        graph_io
    }

    /// Stop and drop the graph's I/O. Nodes and connections are left alone.
    pub fn remove_io(&self) {
        self.stop();
        let binding = self.core.io.lock().take();
        if binding.is_some() {
            debug!("io removed");
        }
    }

    pub fn io(&self) -> Option<Arc<GraphIo>> {
        self.core.graph_io()
    }

    /// Start the I/O. Rendering is wired up from its start notification.
    pub fn start_render(&self) -> Result<(), GraphError> {
        let Some(io) = self.core.graph_io() else {
            return Ok(());
        };
        if io.raw_io().is_running() {
            return Err(GraphError::AlreadyRunning);
        }
        io.raw_io().start();
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(io) = self.core.graph_io() {
            io.raw_io().stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    // Inspection

    /// Attached nodes, in creation order.
    pub fn nodes(&self) -> Vec<Arc<GraphNode>> {
        self.core
            .state
            .lock()
            .nodes
            .values()
            .sorted_unstable_by_key(|n| n.id())
            .cloned()
            .collect()
    }

    /// Connections, in creation order.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.core
            .state
            .lock()
            .connections
            .values()
            .sorted_unstable_by_key(|c| c.id())
            .cloned()
            .collect()
    }

    pub fn contains_node(&self, node: &GraphNode) -> bool {
        self.core.state.lock().nodes.contains_key(&node.id())
    }

    pub fn contains_connection(&self, connection: &Connection) -> bool {
        self.core.state.lock().connections.contains_key(&connection.id())
    }
}

impl core::fmt::Debug for Graph {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("Graph")
            .field("nodes", &state.nodes.len())
            .field("connections", &state.connections.len())
            .finish()
    }
}

impl GraphCore {
    fn graph_io(&self) -> Option<Arc<GraphIo>> {
        self.io.lock().as_ref().map(|b| b.graph_io.clone())
    }

    fn is_running(&self) -> bool {
        self.graph_io().is_some_and(|io| io.raw_io().is_running())
    }

    fn update_io_rendering(&self) {
        if let Some(io) = self.graph_io() {
            io.update_rendering();
        }
    }

    fn clear_io_rendering(&self) {
        if let Some(io) = self.graph_io() {
            io.clear_rendering();
        }
    }

    fn attach_node(self: &Arc<Self>, node: &Arc<GraphNode>) {
        let weak = Arc::downgrade(self);
        let hook: Arc<LifecycleFn> = Arc::new(move || {
            if let Some(core) = weak.upgrade() {
                if core.is_running() {
                    core.update_io_rendering();
                }
            }
        });
        node.attach(Arc::downgrade(self), hook);
        if self.is_running() {
            node.setup();
        }
        debug!(node = ?node.id(), "node attached");
    }

    fn detach_node(&self, node: &Arc<GraphNode>) {
        node.teardown();
        node.detach();
        debug!(node = ?node.id(), "node detached");
    }

    fn setup_rendering(&self) -> Result<(), GraphError> {
        let (nodes, connections) = {
            let state = self.state.lock();
            for connection in state.connections.values() {
                for id in [connection.source_node_id(), connection.destination_node_id()] {
                    if !state.nodes.contains_key(&id) {
                        return Err(GraphError::NodeNotAttached(id));
                    }
                }
            }
            (
                state.nodes.values().cloned().collect_vec(),
                state.connections.values().cloned().collect_vec(),
            )
        };

        for node in &nodes {
            node.setup();
        }
        for connection in &connections {
            add_connection_to_nodes(connection);
        }

        self.update_io_rendering();
        info!(nodes = nodes.len(), connections = connections.len(), "rendering set up");
        Ok(())
    }

    fn dispose_rendering(&self) {
        if let Some(io) = self.graph_io() {
            io.raw_io().stop();
        }

        let (nodes, connections) = {
            let state = self.state.lock();
            (
                state.nodes.values().cloned().collect_vec(),
                state.connections.values().cloned().collect_vec(),
            )
        };

        for connection in &connections {
            remove_connection_from_nodes(connection);
        }
        for node in &nodes {
            node.teardown();
        }

        self.clear_io_rendering();
        info!("rendering disposed");
    }

    fn reset_nodes(&self) {
        let nodes = self.state.lock().nodes.values().cloned().collect_vec();
        for node in &nodes {
            node.reset();
        }
        debug!(nodes = nodes.len(), "nodes reset for device update");
    }
}

impl Drop for GraphCore {
    fn drop(&mut self) {
        if let Some(IoBinding { graph_io, .. }) = self.io.get_mut().take() {
            graph_io.clear_rendering();
            graph_io.raw_io().stop();
        }

        let state = core::mem::take(self.state.get_mut());
        for connection in state.connections.values() {
            remove_connection_from_nodes(connection);
            connection.remove_nodes();
        }
        for node in state.nodes.values() {
            node.teardown();
            node.detach();
        }
    }
}

fn add_connection_to_nodes(connection: &Arc<Connection>) {
    if let Some(node) = connection.destination_node() {
        node.add_input_connection(connection);
    }
    if let Some(node) = connection.source_node() {
        node.add_output_connection(connection);
    }
}

fn remove_connection_from_nodes(connection: &Connection) {
    if let Some(node) = connection.destination_node() {
        node.remove_connection(Direction::Input, connection);
    }
    if let Some(node) = connection.source_node() {
        node.remove_connection(Direction::Output, connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::GraphNodeArgs;

    fn format() -> Format {
        Format::float32(48000.0, 2)
    }

    fn source(outputs: u32) -> Arc<GraphNode> {
        GraphNode::new(GraphNodeArgs::with_buses(0, outputs))
    }

    fn sink(inputs: u32) -> Arc<GraphNode> {
        GraphNode::new(GraphNodeArgs::with_buses(inputs, 0))
    }

    #[test]
    fn connect_picks_lowest_free_buses() {
        let graph = Graph::new();
        let a = source(3);
        let b = sink(3);

        let c0 = graph.connect(&a, &b, format()).unwrap();
        let _c1 = graph.connect(&a, &b, format()).unwrap();
        graph.disconnect(&c0);
        let c2 = graph.connect(&a, &b, format()).unwrap();

        assert_eq!((c2.source_bus(), c2.destination_bus()), (0, 0));
        assert_eq!(graph.connections().len(), 2);
    }

    #[test]
    fn explicit_bus_out_of_range_changes_nothing() {
        let graph = Graph::new();
        let a = source(1);
        let b = sink(1);

        assert_eq!(
            graph.connect_with_buses(&a, &b, 1, 0, format()).unwrap_err(),
            GraphError::BusUnavailable {
                direction: Direction::Output,
                bus: Some(1)
            }
        );
        assert_eq!(
            graph.connect_with_buses(&a, &b, 0, 4, format()).unwrap_err(),
            GraphError::BusUnavailable {
                direction: Direction::Input,
                bus: Some(4)
            }
        );
        assert!(graph.nodes().is_empty());
        assert!(!a.is_attached());
    }

    #[test]
    fn override_bus_is_used_for_logical_zero() {
        let graph = Graph::new();
        let fan = GraphNode::new(GraphNodeArgs {
            output_bus_count: 1,
            override_output_bus: Some(2),
            ..Default::default()
        });
        let b = sink(2);

        let connection = graph.connect(&fan, &b, format()).unwrap();
        assert_eq!(connection.source_bus(), 2);
        assert!(graph.connect(&fan, &b, format()).is_err());
        assert!(graph.connect_with_buses(&fan, &b, 2, 1, format()).is_err());
    }

    #[test]
    fn node_cannot_join_two_graphs() {
        let first = Graph::new();
        let second = Graph::new();
        let a = source(2);

        first.connect(&a, &sink(1), format()).unwrap();
        assert_eq!(
            second.connect(&a, &sink(1), format()).unwrap_err(),
            GraphError::NodeAlreadyAttached(a.id())
        );
        assert!(second.nodes().is_empty());
    }

    #[test]
    fn node_reports_its_graph() {
        let graph = Graph::new();
        let a = source(1);
        let b = sink(1);
        graph.connect(&a, &b, format()).unwrap();
        assert!(a.graph().unwrap().contains_node(&b));
    }

    #[test]
    fn disconnect_unknown_connection_is_ignored() {
        let graph = Graph::new();
        let other = Graph::new();
        let a = source(1);
        let b = sink(1);
        let foreign = other.connect(&a, &b, format()).unwrap();

        graph.disconnect(&foreign);
        assert!(other.contains_connection(&foreign));
        assert!(a.output_connection(0).is_some());
    }

    #[test]
    fn dropping_the_graph_detaches_everything() {
        let a = source(1);
        let b = sink(1);
        let connection = {
            let graph = Graph::new();
            graph.connect(&a, &b, format()).unwrap()
        };
        assert!(!a.is_attached());
        assert!(b.input_connection(0).is_none());
        assert!(connection.source_node().is_none());
    }

    #[test]
    fn add_io_is_idempotent() {
        let graph = Graph::new();
        let first = graph.add_io(None);
        let second = graph.add_io(None);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.raw_io().running_observer_count(), 1);

        graph.remove_io();
        assert!(graph.io().is_none());
        assert_eq!(first.raw_io().running_observer_count(), 0);
    }

    #[test]
    fn start_twice_is_rejected() {
        let graph = Graph::new();
        graph.add_io(None);
        graph.start_render().unwrap();
        assert_eq!(graph.start_render(), Err(GraphError::AlreadyRunning));
        graph.stop();
        assert!(!graph.is_running());
    }

    #[test]
    fn predicate_may_query_the_graph() {
        let graph = Graph::new();
        let a = source(2);
        let b = sink(2);
        graph.connect(&a, &b, format()).unwrap();
        graph.connect(&a, &b, format()).unwrap();

        let view = graph.clone();
        graph.disconnect_node_with_predicate(move |c| view.contains_connection(c) && view.connections().len() > 1);

        assert!(graph.connections().is_empty());
        assert!(!a.is_attached());
    }
}
