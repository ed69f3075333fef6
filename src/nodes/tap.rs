//! Tap nodes: hook user code into a chain without owning a node kind.

use alloc::sync::Arc;

use parking_lot::Mutex;

use crate::node::{GraphNode, GraphNodeArgs, RenderArgs, RenderFn};

/// Handler captured into each kernel of a tap.
struct TapKernel {
    handler: Option<Arc<RenderFn>>,
}

type HandlerCell = Arc<Mutex<Option<Arc<RenderFn>>>>;

fn install(node: &GraphNode, handler: &HandlerCell) {
    let cell = handler.clone();
    node.set_prepare_kernel_handler(move |kernel| {
        let handler = cell.lock().clone();
        kernel.set_decorator(TapKernel { handler });
    });
}

fn tap_handler(kernel: &crate::Kernel) -> Option<&RenderFn> {
    kernel.decorator::<TapKernel>().and_then(|k| k.handler.as_deref())
}

/// One input, one output. Runs the user handler if there is one, otherwise
/// passes its source through.
///
/// ```
/// use klangnetz::nodes::GraphTap;
///
/// let tap = GraphTap::new();
/// tap.set_render_handler(|mut args| {
///     args.render_source();
///     for ch in 0..args.buffer.format().buffer_count() {
///         args.buffer.data_mut(ch).iter_mut().for_each(|s| *s *= 0.5);
///     }
/// });
/// ```
pub struct GraphTap {
    node: Arc<GraphNode>,
    handler: HandlerCell,
}

impl GraphTap {
    pub fn new() -> Self {
        let node = GraphNode::new(GraphNodeArgs::with_buses(1, 1));
        let handler = HandlerCell::default();
        install(&node, &handler);

        node.set_render_handler(|mut args| {
            let kernel = args.kernel;
            match tap_handler(kernel) {
                Some(handler) => handler(args),
                None => {
                    args.render_source();
                }
            }
        });

        Self { node, handler }
    }

    pub fn node(&self) -> &Arc<GraphNode> {
        &self.node
    }

    /// Replace the user handler and rewire the I/O if the graph is running.
    pub fn set_render_handler<F>(&self, handler: F)
    where
        F: Fn(RenderArgs<'_>) + Send + Sync + 'static,
    {
        *self.handler.lock() = Some(Arc::new(handler));
        self.node.update_kernel();
        self.node.update_rendering();
    }

    /// Go back to passing the source through.
    pub fn remove_render_handler(&self) {
        *self.handler.lock() = None;
        self.node.update_kernel();
        self.node.update_rendering();
    }
}

impl Default for GraphTap {
    fn default() -> Self {
        Self::new()
    }
}

/// One input, no outputs. Handed the device input buffer each callback when
/// connected to the I/O's input node.
pub struct GraphInputTap {
    node: Arc<GraphNode>,
    handler: HandlerCell,
}

impl GraphInputTap {
    pub fn new() -> Self {
        let node = GraphNode::new(GraphNodeArgs {
            input_bus_count: 1,
            input_renderable: true,
            ..Default::default()
        });
        let handler = HandlerCell::default();
        install(&node, &handler);

        node.set_render_handler(|args| {
            let kernel = args.kernel;
            if let Some(handler) = tap_handler(kernel) {
                handler(args);
            }
        });

        Self { node, handler }
    }

    pub fn node(&self) -> &Arc<GraphNode> {
        &self.node
    }

    pub fn set_render_handler<F>(&self, handler: F)
    where
        F: Fn(RenderArgs<'_>) + Send + Sync + 'static,
    {
        *self.handler.lock() = Some(Arc::new(handler));
        self.node.update_kernel();
        self.node.update_rendering();
    }

    pub fn remove_render_handler(&self) {
        *self.handler.lock() = None;
        self.node.update_kernel();
        self.node.update_rendering();
    }
}

impl Default for GraphInputTap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PcmBuffer;
    use crate::format::{AudioTime, Format};
    use crate::Graph;

    fn format() -> Format {
        Format::float32(48000.0, 1)
    }

    fn constant(level: f32) -> Arc<GraphNode> {
        let node = GraphNode::new(GraphNodeArgs::with_buses(0, 1));
        node.set_render_handler(move |args| args.buffer.data_mut(0).fill(level));
        node
    }

    #[test]
    fn passes_source_through_without_handler() {
        let graph = Graph::new();
        let tap = GraphTap::new();
        graph.connect(&constant(0.75), tap.node(), format()).unwrap();

        let mut buffer = PcmBuffer::new(format(), 8);
        tap.node().render(&mut buffer, 0, AudioTime::new(0, 48000.0));
        assert_eq!(buffer.data(0), &[0.75; 8]);
    }

    #[test]
    fn user_handler_replaces_pass_through() {
        let graph = Graph::new();
        let tap = GraphTap::new();
        let source = constant(0.75);
        graph.connect(&source, tap.node(), format()).unwrap();

        tap.set_render_handler(|mut args| {
            args.render_source();
            args.buffer.data_mut(0).iter_mut().for_each(|s| *s *= 2.0);
        });
        let mut buffer = PcmBuffer::new(format(), 4);
        tap.node().render(&mut buffer, 0, AudioTime::new(0, 48000.0));
        assert_eq!(buffer.data(0), &[1.5; 4]);

        tap.remove_render_handler();
        tap.node().render(&mut buffer, 0, AudioTime::new(4, 48000.0));
        assert_eq!(buffer.data(0), &[0.75; 4]);
    }

    #[test]
    fn handler_survives_topology_changes() {
        let graph = Graph::new();
        let tap = GraphTap::new();
        tap.set_render_handler(|args| args.buffer.data_mut(0).fill(-1.0));

        let connection = graph.connect(&constant(0.75), tap.node(), format()).unwrap();
        graph.disconnect(&connection);

        let mut buffer = PcmBuffer::new(format(), 2);
        tap.node().render(&mut buffer, 0, AudioTime::new(0, 48000.0));
        assert_eq!(buffer.data(0), &[-1.0; 2]);
    }
}
