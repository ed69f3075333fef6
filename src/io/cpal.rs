//! Hardware output through cpal.
//!
//! ```no_run
//! use klangnetz::io::cpal::CpalDevice;
//! use klangnetz::io::IoDevice;
//!
//! for device in CpalDevice::list_outputs() {
//!     println!("{}: {} Hz, {} ch", device.name(), device.sample_rate(), device.channels());
//! }
//! ```

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ::cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ::cpal::{FromSample, Sample, SampleFormat, SizedSample, SupportedStreamConfig};
use parking_lot::Mutex;
use rtrb::{Producer, RingBuffer};
use tracing::error;

use crate::buffer::PcmBuffer;
use crate::error::IoError;
use crate::format::{AudioTime, Format};
use crate::io::{IoCore, IoDevice, IoRenderArgs, RenderSlot};

const START_TIMEOUT: Duration = Duration::from_secs(2);

/// A discovered audio output device.
pub struct CpalDevice {
    device: Mutex<::cpal::Device>,
    config: SupportedStreamConfig,
    name: String,
    sample_rate: u32,
    channels: u16,
}

impl CpalDevice {
    /// The system's default output device, if there is one.
    pub fn default_output() -> Option<Arc<Self>> {
        let host = ::cpal::default_host();
        let device = host.default_output_device()?;
        Self::from_device(device)
    }

    /// Every output device that reports a default configuration.
    pub fn list_outputs() -> Vec<Arc<Self>> {
        let host = ::cpal::default_host();
        host.output_devices()
            .map(|devices| devices.filter_map(Self::from_device).collect())
            .unwrap_or_default()
    }

    fn from_device(device: ::cpal::Device) -> Option<Arc<Self>> {
        let config = device.default_output_config().ok()?;
        let name = device.name().unwrap_or_else(|_| "Unknown".into());
        Some(Arc::new(Self {
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
            name,
            device: Mutex::new(device),
            config,
        }))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

impl IoDevice for CpalDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn input_format(&self) -> Option<Format> {
        None
    }

    /// Non-interleaved float32; the driver converts and interleaves.
    fn output_format(&self) -> Option<Format> {
        Some(Format::float32(self.sample_rate as f64, self.channels as u32))
    }

    fn make_io_core(&self, slot: Arc<RenderSlot>, maximum_frames: u32) -> Result<Box<dyn IoCore>, IoError> {
        Ok(Box::new(CpalCore {
            device: self.device.lock().clone(),
            config: self.config.clone(),
            slot,
            maximum_frames,
            worker: None,
        }))
    }
}

enum Command {
    Stop,
}

struct Worker {
    commands: Producer<Command>,
    thread: JoinHandle<()>,
}

impl Worker {
    fn shut_down(mut self) {
        let _ = self.commands.push(Command::Stop);
        self.thread.thread().unpark();
        if self.thread.join().is_err() {
            error!("audio stream thread panicked");
        }
    }
}

/// Owns the stream thread. The stream lives on its own thread because cpal
/// streams are not `Send` on every platform.
struct CpalCore {
    device: ::cpal::Device,
    config: SupportedStreamConfig,
    slot: Arc<RenderSlot>,
    maximum_frames: u32,
    worker: Option<Worker>,
}

impl IoCore for CpalCore {
    fn start(&mut self) -> Result<(), IoError> {
        if self.worker.is_some() {
            return Ok(());
        }

        let (commands, mut inbox) = RingBuffer::<Command>::new(4);
        let (mut status_tx, mut status_rx) = RingBuffer::<Result<(), String>>::new(1);

        let device = self.device.clone();
        let config = self.config.clone();
        let slot = self.slot.clone();
        let frames = self.maximum_frames;

        let thread = std::thread::Builder::new()
            .name("klangnetz-cpal".into())
            .spawn(move || {
                let stream = match build_stream(&device, &config, slot, frames) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = status_tx.push(Err(err.to_string()));
                        return;
                    }
                };
                if let Err(err) = stream.play() {
                    let _ = status_tx.push(Err(err.to_string()));
                    return;
                }
                let _ = status_tx.push(Ok(()));

                // The stream stays alive until told to stop; dropping it
                // waits for the callback in flight.
                loop {
                    match inbox.pop() {
                        Ok(Command::Stop) => break,
                        Err(_) => std::thread::park(),
                    }
                }
                drop(stream);
            })
            .map_err(|err| IoError::Stream(err.to_string()))?;

        let deadline = Instant::now() + START_TIMEOUT;
        let status = loop {
            if let Ok(status) = status_rx.pop() {
                break status;
            }
            if thread.is_finished() && status_rx.is_empty() {
                break Err("audio stream thread exited".to_string());
            }
            if Instant::now() > deadline {
                break Err("timed out starting audio stream".to_string());
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        let worker = Worker { commands, thread };
        match status {
            Ok(()) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(err) => {
                worker.shut_down();
                Err(IoError::Stream(err))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shut_down();
        }
    }
}

impl Drop for CpalCore {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_stream(
    device: &::cpal::Device,
    config: &SupportedStreamConfig,
    slot: Arc<RenderSlot>,
    frames: u32,
) -> Result<::cpal::Stream, IoError> {
    match config.sample_format() {
        SampleFormat::F32 => build_typed_stream::<f32>(device, config, slot, frames),
        SampleFormat::I16 => build_typed_stream::<i16>(device, config, slot, frames),
        SampleFormat::U16 => build_typed_stream::<u16>(device, config, slot, frames),
        other => Err(IoError::UnsupportedSampleFormat(format!("{other:?}"))),
    }
}

fn build_typed_stream<T>(
    device: &::cpal::Device,
    config: &SupportedStreamConfig,
    slot: Arc<RenderSlot>,
    frames: u32,
) -> Result<::cpal::Stream, IoError>
where
    T: SizedSample + FromSample<f32>,
{
    let stream_config = config.config();
    let channels = stream_config.channels.max(1) as usize;
    let sample_rate = stream_config.sample_rate.0 as f64;
    let format = Format::float32(sample_rate, channels as u32);

    let mut buffer = PcmBuffer::new(format, frames);
    let mut interleaved = vec![0.0f32; frames as usize * channels];
    let mut sample_time = 0i64;

    device
        .build_output_stream(
            &stream_config,
            move |data: &mut [T], _: &::cpal::OutputCallbackInfo| {
                let len = data.len() / channels;
                if buffer.frame_capacity() < len as u32 {
                    buffer.reshape(format, len as u32);
                }
                if interleaved.len() < data.len() {
                    interleaved.resize(data.len(), 0.0);
                }
                let _ = buffer.set_frame_length(len as u32);
                buffer.clear();

                slot.render(IoRenderArgs::output(&mut buffer, AudioTime::new(sample_time, sample_rate)));

                let written = buffer.write_interleaved(&mut interleaved[..data.len()], channels) * channels;
                for (out, sample) in data.iter_mut().zip(&interleaved[..written]) {
                    *out = T::from_sample(*sample);
                }
                sample_time += len as i64;
            },
            |err: ::cpal::StreamError| error!(%err, "cpal stream error"),
            None,
        )
        .map_err(|err| IoError::Stream(err.to_string()))
}
