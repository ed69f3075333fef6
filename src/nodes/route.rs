//! Route - moves individual channels between buses

use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::Ordering;

use parking_lot::Mutex;

use crate::buffer::PcmBuffer;
use crate::format::Format;
use crate::node::{GraphNode, GraphNodeArgs, NodeMethod, RenderArgs};
use crate::nodes::scratch_frames;
use crate::notify::Observer;

/// One channel on one bus.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RoutePoint {
    pub bus: u32,
    pub channel: u32,
}

impl RoutePoint {
    pub fn new(bus: u32, channel: u32) -> Self {
        Self { bus, channel }
    }
}

/// Channel `source.channel` of input bus `source.bus` goes to channel
/// `destination.channel` of output bus `destination.bus`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Route {
    pub source: RoutePoint,
    pub destination: RoutePoint,
}

impl Route {
    pub fn new(source_bus: u32, source_channel: u32, destination_bus: u32, destination_channel: u32) -> Self {
        Self {
            source: RoutePoint::new(source_bus, source_channel),
            destination: RoutePoint::new(destination_bus, destination_channel),
        }
    }

    /// Same bus and channel on both sides.
    pub fn through(bus: u32, channel: u32) -> Self {
        Self::new(bus, channel, bus, channel)
    }
}

// Bus pairs first, so routes between the same two buses sit together.
impl Ord for Route {
    fn cmp(&self, other: &Self) -> Ordering {
        self.source
            .bus
            .cmp(&other.source.bus)
            .then(self.destination.bus.cmp(&other.destination.bus))
            .then(self.source.channel.cmp(&other.source.channel))
            .then(self.destination.channel.cmp(&other.destination.channel))
    }
}

impl PartialOrd for Route {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub type RouteSet = BTreeSet<Route>;

/// Destination channel for every channel of input bus `source_bus`, as far
/// as `routes` map it onto output bus `destination_bus`.
///
/// Routes naming channels outside either channel count are ignored. Returns
/// `None` when no route connects the two buses at all.
pub fn channel_map_from_routes(
    routes: &RouteSet,
    source_bus: u32,
    source_channels: u32,
    destination_bus: u32,
    destination_channels: u32,
) -> Option<Vec<Option<u32>>> {
    let mut map = vec![None; source_channels as usize];
    let mut exists = false;

    for route in routes {
        if route.source.bus == source_bus
            && route.destination.bus == destination_bus
            && route.source.channel < source_channels
            && route.destination.channel < destination_channels
        {
            map[route.source.channel as usize] = Some(route.destination.channel);
            exists = true;
        }
    }

    exists.then_some(map)
}

/// Routes and scratch space captured into each kernel.
struct RouteKernel {
    routes: RouteSet,
    scratch: Mutex<PcmBuffer>,
}

/// A node with any number of input and output buses that copies channels
/// along its route set.
///
/// Rendering output bus `n` pulls every input bus that has a route to `n`
/// and writes the routed channels; channels nothing routes to are silent.
/// The route set is cleared when the node is reset.
///
/// ```
/// use klangnetz::nodes::{GraphRoute, Route};
///
/// let route = GraphRoute::new();
/// // swap left and right
/// route.add_route(Route::new(0, 0, 0, 1));
/// route.add_route(Route::new(0, 1, 0, 0));
/// assert_eq!(route.routes().len(), 2);
/// ```
pub struct GraphRoute {
    node: Arc<GraphNode>,
    routes: Arc<Mutex<RouteSet>>,
    _reset: Observer,
}

impl GraphRoute {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A route whose scratch space fits callbacks of up to `frames` frames
    /// without reallocating, whatever graph it joins.
    pub fn with_maximum_frames(frames: u32) -> Self {
        Self::build(Some(frames))
    }

    fn build(frames: Option<u32>) -> Self {
        let node = GraphNode::new(GraphNodeArgs::with_buses(u32::MAX, u32::MAX));
        let routes = Arc::new(Mutex::new(RouteSet::new()));

        let cell = routes.clone();
        let weak = Arc::downgrade(&node);
        node.set_prepare_kernel_handler(move |kernel| {
            let widest = kernel
                .input_connections()
                .map(|(_, c)| *c.format())
                .max_by_key(|f| f.channel_count())
                .unwrap_or_else(|| Format::float32(48000.0, 1));
            kernel.set_decorator(RouteKernel {
                routes: cell.lock().clone(),
                scratch: Mutex::new(PcmBuffer::new(widest, scratch_frames(&weak, frames))),
            });
        });

        node.set_render_handler(route);

        let cell = routes.clone();
        let reset = node.observe(move |method| {
            if *method == NodeMethod::WillReset {
                cell.lock().clear();
            }
        });

        Self {
            node,
            routes,
            _reset: reset,
        }
    }

    pub fn node(&self) -> &Arc<GraphNode> {
        &self.node
    }

    pub fn routes(&self) -> RouteSet {
        self.routes.lock().clone()
    }

    /// Add `route`, replacing any route that shares its source or its destination.
    pub fn add_route(&self, route: Route) {
        self.edit(|routes| {
            routes.retain(|r| r.source != route.source && r.destination != route.destination);
            routes.insert(route);
        });
    }

    pub fn remove_route(&self, route: &Route) {
        self.edit(|routes| {
            routes.remove(route);
        });
    }

    pub fn remove_route_for_source(&self, source: RoutePoint) {
        self.edit(|routes| routes.retain(|r| r.source != source));
    }

    pub fn remove_route_for_destination(&self, destination: RoutePoint) {
        self.edit(|routes| routes.retain(|r| r.destination != destination));
    }

    /// Replace the whole route set.
    pub fn set_routes(&self, routes: RouteSet) {
        self.edit(move |current| *current = routes);
    }

    pub fn clear_routes(&self) {
        self.edit(|routes| routes.clear());
    }

    fn edit(&self, f: impl FnOnce(&mut RouteSet)) {
        f(&mut *self.routes.lock());
        self.node.update_kernel();
    }
}

impl Default for GraphRoute {
    fn default() -> Self {
        Self::new()
    }
}

fn route(args: RenderArgs<'_>) {
    let RenderArgs {
        buffer,
        bus,
        time,
        kernel,
        ..
    } = args;
    buffer.clear();

    let Some(state) = kernel.decorator::<RouteKernel>() else {
        return;
    };
    let Some(mut scratch) = state.scratch.try_lock() else {
        return;
    };

    let frames = buffer.frame_length();
    let destination_channels = buffer.format().channel_count();

    for (source_bus, connection) in kernel.input_connections() {
        let Some(source) = connection.source_node() else {
            continue;
        };
        let format = *connection.format();
        let source_channels = format.channel_count();
        let routed = |route: &&Route| {
            route.source.bus == source_bus
                && route.destination.bus == bus
                && route.source.channel < source_channels
                && route.destination.channel < destination_channels
        };
        if !state.routes.iter().any(|r| routed(&r)) {
            continue;
        }

        scratch.reshape(format, frames);
        scratch.clear();
        source.render(&mut scratch, connection.source_bus(), time);

        let frames = scratch.frame_length().min(frames) as usize;
        for route in state.routes.iter().filter(routed) {
            let (from, to) = (route.source.channel as usize, route.destination.channel as usize);
            for frame in 0..frames {
                buffer.set_sample(frame, to, scratch.sample(frame, from));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::AudioTime;
    use crate::Graph;

    fn stereo() -> Format {
        Format::float32(48000.0, 2)
    }

    fn left_right(left: f32, right: f32) -> Arc<GraphNode> {
        let node = GraphNode::new(GraphNodeArgs::with_buses(0, 1));
        node.set_render_handler(move |args| {
            args.buffer.data_mut(0).fill(left);
            args.buffer.data_mut(1).fill(right);
        });
        node
    }

    #[test]
    fn add_route_replaces_routes_sharing_an_end() {
        let route = GraphRoute::new();
        route.add_route(Route::new(0, 0, 0, 0));
        route.add_route(Route::new(0, 0, 0, 1));
        assert_eq!(route.routes().into_iter().collect::<Vec<_>>(), [Route::new(0, 0, 0, 1)]);

        route.add_route(Route::new(0, 1, 0, 1));
        assert_eq!(route.routes().into_iter().collect::<Vec<_>>(), [Route::new(0, 1, 0, 1)]);

        route.add_route(Route::through(1, 0));
        assert_eq!(route.routes().len(), 2);
    }

    #[test]
    fn removal_by_route_source_and_destination() {
        let route = GraphRoute::new();
        route.set_routes(RouteSet::from([
            Route::new(0, 0, 0, 0),
            Route::new(0, 1, 1, 0),
            Route::new(1, 0, 0, 1),
        ]));

        route.remove_route(&Route::new(0, 0, 0, 0));
        route.remove_route_for_source(RoutePoint::new(0, 1));
        assert_eq!(route.routes().into_iter().collect::<Vec<_>>(), [Route::new(1, 0, 0, 1)]);

        route.remove_route_for_destination(RoutePoint::new(0, 1));
        assert!(route.routes().is_empty());

        route.add_route(Route::through(0, 0));
        route.clear_routes();
        assert!(route.routes().is_empty());
    }

    #[test]
    fn channel_map_ignores_out_of_range_channels() {
        let routes = RouteSet::from([Route::new(0, 0, 0, 1), Route::new(0, 1, 0, 5), Route::new(1, 0, 0, 0)]);
        assert_eq!(channel_map_from_routes(&routes, 0, 2, 0, 2), Some(vec![Some(1), None]));
        assert_eq!(channel_map_from_routes(&routes, 0, 2, 1, 2), None);
        assert_eq!(channel_map_from_routes(&routes, 2, 2, 0, 2), None);
    }

    #[test]
    fn renders_swapped_channels() {
        let graph = Graph::new();
        let route = GraphRoute::with_maximum_frames(64);
        graph.connect(&left_right(0.1, 0.2), route.node(), stereo()).unwrap();
        route.add_route(Route::new(0, 0, 0, 1));
        route.add_route(Route::new(0, 1, 0, 0));

        let mut out = PcmBuffer::new(stereo(), 16);
        route.node().render(&mut out, 0, AudioTime::new(0, 48000.0));
        assert_eq!(out.data(0), &[0.2; 16]);
        assert_eq!(out.data(1), &[0.1; 16]);
    }

    #[test]
    fn unrouted_channels_are_silent() {
        let graph = Graph::new();
        let route = GraphRoute::with_maximum_frames(64);
        graph.connect(&left_right(0.1, 0.2), route.node(), stereo()).unwrap();
        route.add_route(Route::through(0, 0));

        let mut out = PcmBuffer::new(stereo(), 8);
        out.data_mut(1).fill(9.0);
        route.node().render(&mut out, 0, AudioTime::new(0, 48000.0));
        assert_eq!(out.data(0), &[0.1; 8]);
        assert_eq!(out.data(1), &[0.0; 8]);

        let mut other_bus = PcmBuffer::new(stereo(), 8);
        other_bus.data_mut(0).fill(9.0);
        route.node().render(&mut other_bus, 1, AudioTime::new(0, 48000.0));
        assert_eq!(other_bus.data(0), &[0.0; 8]);
    }

    #[test]
    fn reset_clears_routes() {
        let graph = Graph::new();
        let route = GraphRoute::with_maximum_frames(64);
        graph.connect(&left_right(0.1, 0.2), route.node(), stereo()).unwrap();
        route.add_route(Route::through(0, 0));

        route.node().reset();
        assert!(route.routes().is_empty());

        let kernel = route.node().kernel().unwrap();
        assert!(kernel.decorator::<RouteKernel>().unwrap().routes.is_empty());
    }
}
