//! Glue between a [`Graph`](crate::Graph) and its [`AudioIo`].

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::{PcmBuffer, SilenceBuffer};
use crate::format::Format;
use crate::io::{AudioIo, IoRenderArgs};
use crate::node::{GraphNode, GraphNodeArgs};

/// The device input of the callback currently running.
struct InputContext {
    staged: Mutex<Option<PcmBuffer>>,
    present: AtomicBool,
}

impl InputContext {
    fn new() -> Self {
        Self {
            staged: Mutex::new(None),
            present: AtomicBool::new(false),
        }
    }

    /// Size the staging buffer for `format`. A buffer that already fits is
    /// kept, so a callback in flight keeps reading its input.
    fn prepare(&self, format: Option<Format>, frames: u32) {
        let mut staged = self.staged.lock();
        let fits = match (staged.as_ref(), format) {
            (Some(buffer), Some(format)) => *buffer.format() == format && buffer.frame_capacity() >= frames,
            (None, None) => true,
            _ => false,
        };
        if fits {
            return;
        }
        *staged = format.map(|f| PcmBuffer::new(f, frames));
        self.present.store(false, Ordering::Release);
    }

    fn stage(&self, input: Option<&PcmBuffer>) {
        let staged = match (self.staged.try_lock(), input) {
            (Some(mut guard), Some(input)) => match guard.as_mut() {
                Some(staged) => staged.copy_from(input).is_ok(),
                None => false,
            },
            _ => false,
        };
        self.present.store(staged, Ordering::Release);
    }

    fn read_into(&self, buffer: &mut PcmBuffer) -> bool {
        if !self.present.load(Ordering::Acquire) {
            return false;
        }
        match self.staged.try_lock() {
            Some(guard) => match guard.as_ref() {
                Some(staged) => buffer.copy_from(staged).is_ok(),
                None => false,
            },
            None => false,
        }
    }

    fn finish(&self) {
        self.present.store(false, Ordering::Release);
    }
}

/// The graph's two endpoint nodes on the device.
///
/// Connect into [`output_node`](Self::output_node) to be heard and out of
/// [`input_node`](Self::input_node) to receive what the device captures. The
/// graph calls [`update_rendering`](Self::update_rendering) whenever its
/// topology changes while running.
pub struct GraphIo {
    raw_io: Arc<AudioIo>,
    output_node: Arc<GraphNode>,
    input_node: Arc<GraphNode>,
    input_context: Arc<InputContext>,
    generation: AtomicU64,
}

impl GraphIo {
    pub(crate) fn new(raw_io: Arc<AudioIo>, silence: Arc<SilenceBuffer>) -> Self {
        let output_node = GraphNode::new(GraphNodeArgs::with_buses(1, 0));
        let input_node = GraphNode::new(GraphNodeArgs::with_buses(0, 1));
        let input_context = Arc::new(InputContext::new());

        let output_silence = silence.clone();
        output_node.set_render_handler(move |mut args| {
            if !args.render_source() {
                output_silence.fill(args.buffer);
            }
        });

        let context = input_context.clone();
        input_node.set_render_handler(move |args| {
            if !context.read_into(args.buffer) {
                silence.fill(args.buffer);
            }
        });

        Self {
            raw_io,
            output_node,
            input_node,
            input_context,
            generation: AtomicU64::new(0),
        }
    }

    pub fn raw_io(&self) -> &Arc<AudioIo> {
        &self.raw_io
    }

    /// Sink feeding the device output. One input bus.
    pub fn output_node(&self) -> &Arc<GraphNode> {
        &self.output_node
    }

    /// Source serving the device input. One output bus.
    pub fn input_node(&self) -> &Arc<GraphNode> {
        &self.input_node
    }

    /// How many times a render handler has been installed.
    pub fn rendering_generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Install a render handler for the current topology, or none at all
    /// if the endpoint connections do not match the device formats.
    ///
    /// The new handler replaces the old one in a single swap; a callback
    /// always finds one of the two.
    pub fn update_rendering(&self) {
        if !self.validate_connections() {
            self.clear_rendering();
            return;
        }

        let device = self.raw_io.device();
        self.input_context.prepare(
            device.as_ref().and_then(|d| d.input_format()),
            self.raw_io.maximum_frames_per_slice(),
        );

        let output_node = self.output_node.clone();
        let input_node = self.input_node.clone();
        let context = self.input_context.clone();

        self.raw_io.set_render_handler(Some(Box::new(move |args: IoRenderArgs<'_>| {
            let IoRenderArgs {
                output_buffer,
                output_time,
                mut input_buffer,
                input_time,
            } = args;

            context.stage(input_buffer.as_deref());

            if let (Some(buffer), Some(time)) = (output_buffer, output_time) {
                output_node.render(buffer, 0, time);
            }

            if let (Some(buffer), Some(time)) = (input_buffer.as_deref_mut(), input_time) {
                let destination = input_node.kernel().and_then(|kernel| kernel.output_connection(0));
                if let Some(connection) = destination {
                    if let Some(node) = connection.destination_node() {
                        if node.is_input_renderable() {
                            node.render(buffer, connection.destination_bus(), time);
                        }
                    }
                }
            }

            context.finish();
        })));

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(generation, "io rendering updated");
    }

    pub fn clear_rendering(&self) {
        self.raw_io.set_render_handler(None);
        self.input_context.prepare(None, 0);
    }

    fn validate_connections(&self) -> bool {
        let device = self.raw_io.device();

        if let Some(connection) = self.output_node.input_connection(0) {
            let device_format = device.as_ref().and_then(|d| d.output_format());
            if device_format.as_ref() != Some(connection.format()) {
                warn!(
                    connection = %connection.format(),
                    device = ?device_format,
                    "output connection does not match the device format"
                );
                return false;
            }
        }

        if let Some(connection) = self.input_node.output_connection(0) {
            let device_format = device.as_ref().and_then(|d| d.input_format());
            if device_format.as_ref() != Some(connection.format()) {
                warn!(
                    connection = %connection.format(),
                    device = ?device_format,
                    "input connection does not match the device format"
                );
                return false;
            }
        }

        true
    }
}

impl core::fmt::Debug for GraphIo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GraphIo")
            .field("output_node", &self.output_node.id())
            .field("input_node", &self.input_node.id())
            .field("running", &self.raw_io.is_running())
            .field("generation", &self.rendering_generation())
            .finish()
    }
}
