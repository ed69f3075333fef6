//! Play a sine wave on a hardware output device.
//!
//! Run with: cargo run --example device_sine --features cpal_io
//!
//! Lists available devices and lets you pick one, then plays 440Hz for a few
//! seconds.

use std::f32::consts::TAU;
use std::io::{self, Write};
use std::thread::sleep;
use std::time::Duration;

use klangnetz::io::cpal::CpalDevice;
use klangnetz::io::IoDevice;
use klangnetz::{Graph, GraphNode, GraphNodeArgs};

fn main() {
    tracing_subscriber::fmt::init();

    let devices = CpalDevice::list_outputs();
    if devices.is_empty() {
        eprintln!("No audio output devices found!");
        return;
    }

    println!("Available audio output devices:");
    for (i, device) in devices.iter().enumerate() {
        println!(
            "  [{}] {} ({}Hz, {} ch)",
            i,
            device.name(),
            device.sample_rate(),
            device.channels()
        );
    }

    print!("\nSelect device [0]: ");
    io::stdout().flush().unwrap();

    let mut input = String::new();
    io::stdin().read_line(&mut input).unwrap();
    let choice: usize = input.trim().parse().unwrap_or(0);

    let device = devices.into_iter().nth(choice).unwrap_or_else(|| {
        println!("Invalid choice, using default device");
        CpalDevice::default_output().expect("No default device")
    });
    let format = device.output_format().expect("output device without a format");

    println!("\nUsing: {} @ {}Hz", device.name(), device.sample_rate());

    let graph = Graph::new();
    graph.add_io(Some(device));

    let sine = GraphNode::new(GraphNodeArgs::with_buses(0, 1));
    sine.set_render_handler(|args| {
        let start = args.time.sample_time;
        let rate = args.time.sample_rate as f32;
        for ch in 0..args.buffer.format().buffer_count() {
            for (i, sample) in args.buffer.data_mut(ch).iter_mut().enumerate() {
                let t = (start + i as i64) as f32 / rate;
                *sample = 0.25 * (TAU * 440.0 * t).sin();
            }
        }
    });
    graph.connect_output(&sine, format).unwrap();

    graph.start_render().unwrap();
    println!("Playing 440Hz sine wave...");
    sleep(Duration::from_secs(3));
    graph.stop();
}
