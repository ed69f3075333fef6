//! Render a small graph without any hardware.
//!
//! Run with: cargo run --example offline_render
//!
//! Two sines are summed by a mixer, attenuated by a tap and pulled through
//! an offline device one slice at a time.

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use klangnetz::io::offline::OfflineDevice;
use klangnetz::nodes::{GraphMixer, GraphTap};
use klangnetz::{AudioTime, Format, Graph, GraphNode, GraphNodeArgs, PcmBuffer};
use tracing::info;

const SAMPLE_RATE: f64 = 48000.0;
const SLICE: u32 = 256;

fn sine(frequency: f32) -> Arc<GraphNode> {
    let node = GraphNode::new(GraphNodeArgs::with_buses(0, 1));
    node.set_render_handler(move |args| {
        let start = args.time.sample_time;
        let rate = args.time.sample_rate as f32;
        for ch in 0..args.buffer.format().buffer_count() {
            for (i, sample) in args.buffer.data_mut(ch).iter_mut().enumerate() {
                let t = (start + i as i64) as f32 / rate;
                *sample = (TAU * frequency * t).sin();
            }
        }
    });
    node
}

fn main() {
    tracing_subscriber::fmt::init();

    let format = Format::float32(SAMPLE_RATE, 2);
    let device = OfflineDevice::new(Some(format), None);

    let graph = Graph::new();
    let io = graph.add_io(Some(device.clone()));

    let mixer = GraphMixer::with_maximum_frames(SLICE);
    graph.connect(&sine(220.0), mixer.node(), Format::float32(SAMPLE_RATE, 1)).unwrap();
    graph.connect(&sine(330.0), mixer.node(), Format::float32(SAMPLE_RATE, 1)).unwrap();

    let tap = GraphTap::new();
    let pulls = Arc::new(AtomicU64::new(0));
    let counter = pulls.clone();
    tap.set_render_handler(move |mut args| {
        counter.fetch_add(1, Ordering::Relaxed);
        args.render_source();
        for ch in 0..args.buffer.format().buffer_count() {
            args.buffer.data_mut(ch).iter_mut().for_each(|s| *s *= 0.25);
        }
    });
    graph.connect(mixer.node(), tap.node(), format).unwrap();
    graph.connect(tap.node(), io.output_node(), format).unwrap();

    graph.start_render().unwrap();

    let mut out = PcmBuffer::new(format, SLICE);
    let mut peak = 0.0f32;
    let mut sample_time = 0;
    while sample_time < SAMPLE_RATE as i64 {
        device.render(Some(&mut out), None, AudioTime::new(sample_time, SAMPLE_RATE));
        peak = out.data(0).iter().fold(peak, |p, s| p.max(s.abs()));
        sample_time += SLICE as i64;
    }

    graph.stop();
    info!(
        callbacks = device.callback_count(),
        tap_pulls = pulls.load(Ordering::Relaxed),
        peak,
        "rendered one second"
    );
}
