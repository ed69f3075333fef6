//! Mixer - sums any number of inputs together

use alloc::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::PcmBuffer;
use crate::format::Format;
use crate::node::{GraphNode, GraphNodeArgs, RenderArgs};
use crate::nodes::scratch_frames;

/// Per-kernel scratch space each input is rendered into before summing.
struct MixerKernel {
    scratch: Mutex<PcmBuffer>,
}

/// A node that sums every connected input into its single output.
///
/// Each input is rendered in its connection's format and summed with equal
/// weight. Inputs with fewer channels than the output repeat their last
/// channel (mono goes to every output channel); extra channels are ignored.
pub struct GraphMixer {
    node: Arc<GraphNode>,
}

impl GraphMixer {
    /// A mixer whose scratch space follows the slice limit of the graph it
    /// is attached to.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A mixer whose scratch space fits callbacks of up to `frames` frames
    /// without reallocating, whatever graph it joins.
    pub fn with_maximum_frames(frames: u32) -> Self {
        Self::build(Some(frames))
    }

    fn build(frames: Option<u32>) -> Self {
        let node = GraphNode::new(GraphNodeArgs::with_buses(u32::MAX, 1));

        let weak = Arc::downgrade(&node);
        node.set_prepare_kernel_handler(move |kernel| {
            let widest = kernel
                .input_connections()
                .map(|(_, c)| *c.format())
                .max_by_key(|f| f.channel_count())
                .unwrap_or_else(|| Format::float32(48000.0, 1));
            kernel.set_decorator(MixerKernel {
                scratch: Mutex::new(PcmBuffer::new(widest, scratch_frames(&weak, frames))),
            });
        });

        node.set_render_handler(mix);

        Self { node }
    }

    pub fn node(&self) -> &Arc<GraphNode> {
        &self.node
    }
}

impl Default for GraphMixer {
    fn default() -> Self {
        Self::new()
    }
}

fn mix(args: RenderArgs<'_>) {
    let RenderArgs {
        buffer, time, kernel, ..
    } = args;
    buffer.clear();

    let Some(mixer) = kernel.decorator::<MixerKernel>() else {
        return;
    };
    let Some(mut scratch) = mixer.scratch.try_lock() else {
        return;
    };

    let frames = buffer.frame_length();
    let out_channels = buffer.format().channel_count() as usize;

    for (_, connection) in kernel.input_connections() {
        let Some(source) = connection.source_node() else {
            continue;
        };
        scratch.reshape(*connection.format(), frames);
        scratch.clear();
        source.render(&mut scratch, connection.source_bus(), time);

        let in_channels = scratch.format().channel_count() as usize;
        if in_channels == 0 {
            continue;
        }
        let frames = scratch.frame_length().min(frames) as usize;
        for out_ch in 0..out_channels {
            let in_ch = out_ch.min(in_channels - 1);
            for frame in 0..frames {
                let sum = buffer.sample(frame, out_ch) + scratch.sample(frame, in_ch);
                buffer.set_sample(frame, out_ch, sum);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::AudioTime;
    use crate::{Graph, GraphConfig};

    fn constant(level: f32) -> Arc<GraphNode> {
        let node = GraphNode::new(GraphNodeArgs::with_buses(0, 1));
        node.set_render_handler(move |args| {
            for ch in 0..args.buffer.format().buffer_count() {
                args.buffer.data_mut(ch).fill(level);
            }
        });
        node
    }

    #[test]
    fn sums_all_inputs() {
        let graph = Graph::new();
        let mixer = GraphMixer::with_maximum_frames(64);
        let stereo = Format::float32(48000.0, 2);
        for level in [0.1, 0.2, 0.3] {
            graph.connect(&constant(level), mixer.node(), stereo).unwrap();
        }
        assert_eq!(mixer.node().input_connections().len(), 3);

        let mut out = PcmBuffer::new(stereo, 16);
        mixer.node().render(&mut out, 0, AudioTime::new(0, 48000.0));
        for ch in 0..2 {
            assert!(out.data(ch).iter().all(|s| (s - 0.6).abs() < 1e-6));
        }
    }

    #[test]
    fn mono_input_reaches_every_output_channel() {
        let graph = Graph::new();
        let mixer = GraphMixer::with_maximum_frames(64);
        graph
            .connect(&constant(0.5), mixer.node(), Format::float32(48000.0, 1))
            .unwrap();

        let mut out = PcmBuffer::new(Format::float32(48000.0, 2), 8);
        out.data_mut(1).fill(4.0);
        mixer.node().render(&mut out, 0, AudioTime::new(0, 48000.0));
        assert_eq!(out.data(0), &[0.5; 8]);
        assert_eq!(out.data(1), &[0.5; 8]);
    }

    #[test]
    fn scratch_follows_the_graph_slice_limit() {
        let graph = Graph::with_config(GraphConfig::default().with_maximum_frames_per_slice(8192));
        let mixer = GraphMixer::new();
        graph.connect(&constant(0.5), mixer.node(), Format::float32(48000.0, 2)).unwrap();

        let kernel = mixer.node().kernel().unwrap();
        let scratch = kernel.decorator::<MixerKernel>().unwrap().scratch.lock();
        assert_eq!(scratch.frame_capacity(), 8192);
        assert_eq!(scratch.format().channel_count(), 2);
    }

    #[test]
    fn unconnected_mixer_renders_silence() {
        let mixer = GraphMixer::new();
        let mut out = PcmBuffer::new(Format::float32(48000.0, 1), 4);
        out.data_mut(0).fill(1.0);
        mixer.node().render(&mut out, 0, AudioTime::new(0, 48000.0));
        assert_eq!(out.data(0), &[0.0; 4]);
    }
}
