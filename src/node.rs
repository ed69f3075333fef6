//! Graph nodes: bus bookkeeping, lifecycle hooks and the render entry point.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::buffer::PcmBuffer;
use crate::connection::Connection;
use crate::error::Direction;
use crate::format::{AudioTime, Format};
use crate::graph::{Graph, GraphCore};
use crate::kernel::{ConnectionWeakMap, Kernel};
use crate::notify::{Notifier, Observer};

/// Unique identifier for a node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        NodeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Render callback installed on a node.
pub type RenderFn = dyn Fn(RenderArgs<'_>) + Send + Sync;

/// Setup, teardown and rewiring callbacks.
pub type LifecycleFn = dyn Fn() + Send + Sync;

/// Called with every freshly built kernel before it is published.
pub type PrepareKernelFn = dyn Fn(&mut Kernel) + Send + Sync;

/// Everything a render callback gets to work with.
pub struct RenderArgs<'a> {
    pub buffer: &'a mut PcmBuffer,
    pub bus: u32,
    pub time: AudioTime,
    /// The snapshot this render call started with.
    pub kernel: &'a Kernel,
    pub node: &'a GraphNode,
}

impl RenderArgs<'_> {
    /// Pull `bus` from whatever is connected to the same input bus.
    ///
    /// Returns `false`, leaving the buffer untouched, when nothing is connected
    /// or the upstream node is gone.
    pub fn render_source(&mut self) -> bool {
        render_source(self.kernel, self.buffer, self.bus, self.time)
    }
}

/// Render the source of input `bus` of `kernel` into `buffer`.
pub fn render_source(kernel: &Kernel, buffer: &mut PcmBuffer, bus: u32, time: AudioTime) -> bool {
    let Some(connection) = kernel.input_connection(bus) else {
        return false;
    };
    let Some(source) = connection.source_node() else {
        return false;
    };
    source.render(buffer, connection.source_bus(), time);
    true
}

/// Notifications emitted by a node. See [`GraphNode::observe`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeMethod {
    /// About to drop every connection in [`GraphNode::reset`].
    WillReset,
    /// A new kernel has been published.
    UpdateConnections,
}

/// Construction parameters for [`GraphNode`].
#[derive(Clone, Copy, Debug, Default)]
pub struct GraphNodeArgs {
    pub input_bus_count: u32,
    pub output_bus_count: u32,
    /// Physical output bus that logical bus 0 is routed to.
    pub override_output_bus: Option<u32>,
    /// Whether the node can be handed the device input buffer directly.
    pub input_renderable: bool,
}

impl GraphNodeArgs {
    pub fn with_buses(input_bus_count: u32, output_bus_count: u32) -> Self {
        Self {
            input_bus_count,
            output_bus_count,
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct ConnectionMaps {
    inputs: ConnectionWeakMap,
    outputs: ConnectionWeakMap,
}

#[derive(Default)]
struct Handlers {
    render: Option<Arc<RenderFn>>,
    setup: Option<Arc<LifecycleFn>>,
    teardown: Option<Arc<LifecycleFn>>,
    prepare_kernel: Option<Arc<PrepareKernelFn>>,
    update_rendering: Option<Arc<LifecycleFn>>,
}

/// Last render time, written from the render thread.
#[derive(Default)]
struct RenderClock {
    valid: AtomicBool,
    sample_time: AtomicI64,
    sample_rate: AtomicU64,
}

impl RenderClock {
    fn set(&self, time: AudioTime) {
        self.sample_time.store(time.sample_time, Ordering::Relaxed);
        self.sample_rate.store(time.sample_rate.to_bits(), Ordering::Relaxed);
        self.valid.store(true, Ordering::Release);
    }

    fn get(&self) -> Option<AudioTime> {
        if !self.valid.load(Ordering::Acquire) {
            return None;
        }
        Some(AudioTime::new(
            self.sample_time.load(Ordering::Relaxed),
            f64::from_bits(self.sample_rate.load(Ordering::Relaxed)),
        ))
    }

    fn clear(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

/// A processing unit in a [`Graph`].
///
/// Nodes have a fixed number of input and output buses, each of which can
/// carry at most one [`Connection`]. What a node computes is decided entirely
/// by its render handler; the graph only ever calls [`render`](Self::render).
///
/// Nodes are created on their own and become attached to a graph when first
/// used in [`Graph::connect`]. They are detached again once their last
/// connection is removed.
///
/// ```
/// use klangnetz::{AudioTime, Format, GraphNode, GraphNodeArgs, PcmBuffer};
///
/// // A source producing a constant level on its single output bus.
/// let source = GraphNode::new(GraphNodeArgs::with_buses(0, 1));
/// source.set_render_handler(|args| {
///     for ch in 0..args.buffer.format().buffer_count() {
///         args.buffer.data_mut(ch).fill(0.5);
///     }
/// });
///
/// let mut buffer = PcmBuffer::new(Format::float32(48000.0, 1), 64);
/// source.render(&mut buffer, 0, AudioTime::new(0, 48000.0));
/// assert!(buffer.data(0).iter().all(|&s| s == 0.5));
/// assert_eq!(source.last_render_time().unwrap().sample_time, 0);
/// ```
pub struct GraphNode {
    id: NodeId,
    input_bus_count: u32,
    output_bus_count: u32,
    override_output_bus: Option<u32>,
    input_renderable: bool,
    connections: Mutex<ConnectionMaps>,
    kernel: ArcSwapOption<Kernel>,
    // Replaced kernels stay here until no render call holds them, so the
    // render thread never frees one.
    retired: Mutex<Vec<Arc<Kernel>>>,
    handlers: Mutex<Handlers>,
    graph: Mutex<Weak<GraphCore>>,
    is_set_up: AtomicBool,
    last_render_time: RenderClock,
    notifier: Notifier<NodeMethod>,
}

impl GraphNode {
    pub fn new(args: GraphNodeArgs) -> Arc<Self> {
        Arc::new(Self {
            id: NodeId::next(),
            input_bus_count: args.input_bus_count,
            output_bus_count: args.output_bus_count,
            override_output_bus: args.override_output_bus,
            input_renderable: args.input_renderable,
            connections: Mutex::default(),
            kernel: ArcSwapOption::empty(),
            retired: Mutex::default(),
            handlers: Mutex::default(),
            graph: Mutex::new(Weak::new()),
            is_set_up: AtomicBool::new(false),
            last_render_time: RenderClock::default(),
            notifier: Notifier::new(),
        })
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn input_bus_count(&self) -> u32 {
        self.input_bus_count
    }

    #[inline]
    pub fn output_bus_count(&self) -> u32 {
        self.output_bus_count
    }

    #[inline]
    pub fn override_output_bus(&self) -> Option<u32> {
        self.override_output_bus
    }

    #[inline]
    pub fn is_input_renderable(&self) -> bool {
        self.input_renderable
    }

    /// Map a physical output bus to the logical bus the allocator tracks.
    pub fn logical_output_bus(&self, bus: u32) -> u32 {
        match self.override_output_bus {
            Some(target) if target == bus => 0,
            _ => bus,
        }
    }

    /// Map a logical output bus to the physical bus connections are made on.
    pub fn physical_output_bus(&self, bus: u32) -> u32 {
        match self.override_output_bus {
            Some(target) if bus == 0 => target,
            _ => bus,
        }
    }

    // Handlers

    /// Install the render callback. Takes effect from the next kernel on.
    pub fn set_render_handler<F>(&self, handler: F)
    where
        F: Fn(RenderArgs<'_>) + Send + Sync + 'static,
    {
        self.handlers.lock().render = Some(Arc::new(handler));
        self.update_kernel();
    }

    pub fn clear_render_handler(&self) {
        self.handlers.lock().render = None;
        self.update_kernel();
    }

    pub fn set_setup_handler<F: Fn() + Send + Sync + 'static>(&self, handler: F) {
        self.handlers.lock().setup = Some(Arc::new(handler));
    }

    pub fn set_teardown_handler<F: Fn() + Send + Sync + 'static>(&self, handler: F) {
        self.handlers.lock().teardown = Some(Arc::new(handler));
    }

    /// Install a hook that can stash extra render-time state into each new
    /// kernel through [`Kernel::set_decorator`].
    pub fn set_prepare_kernel_handler<F>(&self, handler: F)
    where
        F: Fn(&mut Kernel) + Send + Sync + 'static,
    {
        self.handlers.lock().prepare_kernel = Some(Arc::new(handler));
        self.update_kernel();
    }

    #[must_use = "dropping the observer unsubscribes immediately"]
    pub fn observe<F>(&self, handler: F) -> Observer
    where
        F: Fn(&NodeMethod) + Send + Sync + 'static,
    {
        self.notifier.observe(handler)
    }

    // Graph attachment

    /// The graph this node is attached to, if any.
    pub fn graph(&self) -> Option<Graph> {
        self.graph.lock().upgrade().map(Graph::from_core)
    }

    pub fn is_attached(&self) -> bool {
        self.graph.lock().strong_count() > 0
    }

    pub(crate) fn attach(&self, graph: Weak<GraphCore>, update_rendering: Arc<LifecycleFn>) {
        *self.graph.lock() = graph;
        self.handlers.lock().update_rendering = Some(update_rendering);
    }

    pub(crate) fn detach(&self) {
        *self.graph.lock() = Weak::new();
        self.handlers.lock().update_rendering = None;
    }

    pub(crate) fn setup(&self) {
        if self.is_set_up.swap(true, Ordering::AcqRel) {
            return;
        }
        let handler = self.handlers.lock().setup.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    pub(crate) fn teardown(&self) {
        if !self.is_set_up.swap(false, Ordering::AcqRel) {
            return;
        }
        let handler = self.handlers.lock().teardown.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Ask the owning graph to rewire its I/O. No-op while detached or stopped.
    pub fn update_rendering(&self) {
        let hook = self.handlers.lock().update_rendering.clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    // Connections

    pub fn input_connection(&self, bus: u32) -> Option<Arc<Connection>> {
        self.connections.lock().inputs.get(&bus).and_then(Weak::upgrade)
    }

    /// Connection on logical output `bus`.
    pub fn output_connection(&self, bus: u32) -> Option<Arc<Connection>> {
        self.connections.lock().outputs.get(&bus).and_then(Weak::upgrade)
    }

    pub fn input_connections(&self) -> Vec<(u32, Arc<Connection>)> {
        resolve(&self.connections.lock().inputs)
    }

    pub fn output_connections(&self) -> Vec<(u32, Arc<Connection>)> {
        resolve(&self.connections.lock().outputs)
    }

    pub fn input_format(&self, bus: u32) -> Option<Format> {
        self.input_connection(bus).map(|c| *c.format())
    }

    pub fn output_format(&self, bus: u32) -> Option<Format> {
        self.output_connection(bus).map(|c| *c.format())
    }

    /// Lowest input bus with no registered connection.
    pub fn next_available_input_bus(&self) -> Option<u32> {
        first_free(self.connections.lock().inputs.keys().copied(), self.input_bus_count)
    }

    /// Lowest free output bus, reported as the physical bus to connect on.
    pub fn next_available_output_bus(&self) -> Option<u32> {
        first_free(self.connections.lock().outputs.keys().copied(), self.output_bus_count)
            .map(|bus| self.physical_output_bus(bus))
    }

    pub fn is_available_input_bus(&self, bus: u32) -> bool {
        bus < self.input_bus_count && !self.connections.lock().inputs.contains_key(&bus)
    }

    pub fn is_available_output_bus(&self, bus: u32) -> bool {
        let bus = self.logical_output_bus(bus);
        bus < self.output_bus_count && !self.connections.lock().outputs.contains_key(&bus)
    }

    pub(crate) fn add_input_connection(&self, connection: &Arc<Connection>) {
        debug_assert_eq!(connection.destination_node_id(), self.id);
        self.connections
            .lock()
            .inputs
            .insert(connection.destination_bus(), Arc::downgrade(connection));
        self.update_kernel();
    }

    pub(crate) fn add_output_connection(&self, connection: &Arc<Connection>) {
        debug_assert_eq!(connection.source_node_id(), self.id);
        let bus = self.logical_output_bus(connection.source_bus());
        self.connections.lock().outputs.insert(bus, Arc::downgrade(connection));
        self.update_kernel();
    }

    /// Drop the registration of `connection`, leaving other connections on
    /// the same bus alone.
    pub(crate) fn remove_connection(&self, direction: Direction, connection: &Connection) {
        let bus = match direction {
            Direction::Input => connection.destination_bus(),
            Direction::Output => connection.source_bus(),
        };
        self.forget_connection(direction, bus, connection);
    }

    pub(crate) fn forget_connection(&self, direction: Direction, bus: u32, connection: *const Connection) {
        let removed = {
            let mut maps = self.connections.lock();
            let (map, key) = match direction {
                Direction::Input => (&mut maps.inputs, bus),
                Direction::Output => (&mut maps.outputs, self.logical_output_bus(bus)),
            };
            match map.get(&key) {
                Some(weak) if Weak::as_ptr(weak) == connection => map.remove(&key).is_some(),
                _ => false,
            }
        };
        if removed {
            self.update_kernel();
        }
    }

    /// Drop every connection and the last render time, then rebuild an empty kernel.
    pub fn reset(&self) {
        self.notifier.notify(&NodeMethod::WillReset);
        {
            let mut maps = self.connections.lock();
            maps.inputs.clear();
            maps.outputs.clear();
        }
        self.last_render_time.clear();
        self.update_kernel();
        self.update_rendering();
    }

    // Kernel

    /// The most recently published kernel.
    pub fn kernel(&self) -> Option<Arc<Kernel>> {
        self.kernel.load_full()
    }

    /// Snapshot the current connections and render handler into a new kernel and publish it.
    pub fn update_kernel(&self) {
        let (inputs, outputs) = {
            let maps = self.connections.lock();
            (maps.inputs.clone(), maps.outputs.clone())
        };
        let (render, prepare) = {
            let handlers = self.handlers.lock();
            (handlers.render.clone(), handlers.prepare_kernel.clone())
        };

        let mut kernel = Kernel::new(inputs, outputs, render);
        if let Some(prepare) = prepare {
            prepare(&mut kernel);
        }

        let previous = self.kernel.swap(Some(Arc::new(kernel)));
        {
            let mut retired = self.retired.lock();
            retired.retain(|k| Arc::strong_count(k) > 1);
            retired.extend(previous);
        }
        self.notifier.notify(&NodeMethod::UpdateConnections);
    }

    // Rendering

    /// Render output `bus` into `buffer`.
    ///
    /// Records `time`, then runs the render handler captured by the current
    /// kernel. Does nothing before the first kernel has been built.
    pub fn render(&self, buffer: &mut PcmBuffer, bus: u32, time: AudioTime) {
        self.last_render_time.set(time);
        let kernel = self.kernel.load_full();
        if let Some(kernel) = kernel.as_deref() {
            if let Some(handler) = kernel.render_handler() {
                handler(RenderArgs {
                    buffer,
                    bus,
                    time,
                    kernel,
                    node: self,
                });
            }
        }
    }

    pub fn last_render_time(&self) -> Option<AudioTime> {
        self.last_render_time.get()
    }
}

impl core::fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GraphNode")
            .field("id", &self.id)
            .field("input_bus_count", &self.input_bus_count)
            .field("output_bus_count", &self.output_bus_count)
            .field("override_output_bus", &self.override_output_bus)
            .field("attached", &self.is_attached())
            .finish()
    }
}

fn resolve(map: &ConnectionWeakMap) -> Vec<(u32, Arc<Connection>)> {
    map.iter().filter_map(|(bus, weak)| weak.upgrade().map(|c| (*bus, c))).collect()
}

/// Lowest index below `capacity` that does not appear in the ascending `used` sequence.
pub(crate) fn first_free(used: impl IntoIterator<Item = u32>, capacity: u32) -> Option<u32> {
    let mut candidate = 0u32;
    for bus in used {
        if bus > candidate {
            break;
        }
        if bus == candidate {
            candidate = candidate.checked_add(1)?;
        }
    }
    (candidate < capacity).then_some(candidate)
}
