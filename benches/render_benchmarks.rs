use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use klangnetz::nodes::{GraphMixer, GraphTap};
use klangnetz::{AudioTime, Format, Graph, GraphNode, GraphNodeArgs, PcmBuffer};

fn constant(level: f32) -> Arc<GraphNode> {
    let node = GraphNode::new(GraphNodeArgs::with_buses(0, 1));
    node.set_render_handler(move |args| {
        for ch in 0..args.buffer.format().buffer_count() {
            args.buffer.data_mut(ch).fill(level);
        }
    });
    node
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let format = Format::float32(48000.0, 2);

    c.bench_function("render through 16 taps", |b| {
        let graph = Graph::new();
        let mut upstream = constant(0.5);
        let mut taps = Vec::new();
        for _ in 0..16 {
            let tap = GraphTap::new();
            graph.connect(&upstream, tap.node(), format).unwrap();
            upstream = tap.node().clone();
            taps.push(tap);
        }
        let mut buffer = PcmBuffer::new(format, 256);
        let mut sample_time = 0;

        b.iter(|| {
            upstream.render(&mut buffer, 0, AudioTime::new(sample_time, 48000.0));
            sample_time += 256;
            black_box(buffer.data(0)[0]);
        })
    });

    c.bench_function("mix 8 inputs", |b| {
        let graph = Graph::new();
        let mixer = GraphMixer::with_maximum_frames(256);
        for i in 0..8 {
            graph.connect(&constant(i as f32 * 0.1), mixer.node(), format).unwrap();
        }
        let mut buffer = PcmBuffer::new(format, 256);

        b.iter(|| {
            mixer.node().render(&mut buffer, 0, AudioTime::new(0, 48000.0));
            black_box(buffer.data(1)[255]);
        })
    });

    c.bench_function("kernel rebuild", |b| {
        let graph = Graph::new();
        let tap = GraphTap::new();
        graph.connect(&constant(0.0), tap.node(), format).unwrap();

        b.iter(|| tap.node().update_kernel())
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
