//! A software driver whose callbacks are pumped by the caller.
//!
//! Useful for rendering without hardware and for deterministic tests:
//! every call to [`OfflineDevice::render`] is one driver callback.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::buffer::PcmBuffer;
use crate::error::IoError;
use crate::format::{AudioTime, Format};
use crate::io::{IoCore, IoDevice, IoRenderArgs, RenderSlot};
use crate::notify::{Notifier, Observer};

#[derive(Default)]
struct Shared {
    slot: Mutex<Option<Arc<RenderSlot>>>,
    running: AtomicBool,
    fail_next_start: AtomicBool,
    callbacks: AtomicU64,
}

/// Device with fixed formats and no hardware behind it.
pub struct OfflineDevice {
    name: String,
    formats: Mutex<(Option<Format>, Option<Format>)>,
    shared: Arc<Shared>,
    updates: Notifier<()>,
}

impl OfflineDevice {
    pub fn new(output_format: Option<Format>, input_format: Option<Format>) -> Arc<Self> {
        Arc::new(Self {
            name: "offline".into(),
            formats: Mutex::new((output_format, input_format)),
            shared: Arc::default(),
            updates: Notifier::new(),
        })
    }

    /// Run one callback. Returns `false` without touching the buffers unless
    /// the driver is started and a render handler is installed.
    pub fn render(
        &self,
        output: Option<&mut PcmBuffer>,
        input: Option<&mut PcmBuffer>,
        time: AudioTime,
    ) -> bool {
        if !self.shared.running.load(Ordering::Acquire) {
            return false;
        }
        let Some(slot) = self.shared.slot.lock().clone() else {
            return false;
        };
        let (output_time, input_time) = (output.as_ref().map(|_| time), input.as_ref().map(|_| time));
        self.shared.callbacks.fetch_add(1, Ordering::Relaxed);
        slot.render(IoRenderArgs {
            output_buffer: output,
            output_time,
            input_buffer: input,
            input_time,
        })
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Number of callbacks delivered while running.
    pub fn callback_count(&self) -> u64 {
        self.shared.callbacks.load(Ordering::Relaxed)
    }

    /// Reconfigure the output side, as a hardware route change would.
    pub fn set_output_format(&self, format: Option<Format>) {
        self.formats.lock().0 = format;
        self.updates.notify(&());
    }

    pub fn set_input_format(&self, format: Option<Format>) {
        self.formats.lock().1 = format;
        self.updates.notify(&());
    }

    /// Make the next driver start fail, as an unavailable device would.
    pub fn fail_next_start(&self) {
        self.shared.fail_next_start.store(true, Ordering::Relaxed);
    }
}

impl IoDevice for OfflineDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn input_format(&self) -> Option<Format> {
        self.formats.lock().1
    }

    fn output_format(&self) -> Option<Format> {
        self.formats.lock().0
    }

    fn make_io_core(&self, slot: Arc<RenderSlot>, _maximum_frames: u32) -> Result<Box<dyn IoCore>, IoError> {
        Ok(Box::new(OfflineCore {
            shared: self.shared.clone(),
            slot,
        }))
    }

    fn observe_updates(&self, handler: Box<dyn Fn() + Send + Sync>) -> Option<Observer> {
        Some(self.updates.observe(move |_| handler()))
    }
}

struct OfflineCore {
    shared: Arc<Shared>,
    slot: Arc<RenderSlot>,
}

impl IoCore for OfflineCore {
    fn start(&mut self) -> Result<(), IoError> {
        if self.shared.fail_next_start.swap(false, Ordering::Relaxed) {
            return Err(IoError::Stream("offline device refused to start".into()));
        }
        *self.shared.slot.lock() = Some(self.slot.clone());
        self.shared.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        *self.shared.slot.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::AudioIo;

    #[test]
    fn renders_only_while_started() {
        let format = Format::float32(48000.0, 1);
        let device = OfflineDevice::new(Some(format), None);
        let io = AudioIo::new(Some(device.clone()));
        io.set_render_handler(Some(Box::new(|args: IoRenderArgs<'_>| {
            if let Some(buffer) = args.output_buffer {
                buffer.data_mut(0).fill(0.5);
            }
        })));

        let mut buffer = PcmBuffer::new(format, 8);
        assert!(!device.render(Some(&mut buffer), None, AudioTime::new(0, 48000.0)));

        io.start();
        assert!(device.render(Some(&mut buffer), None, AudioTime::new(0, 48000.0)));
        assert_eq!(buffer.data(0), &[0.5; 8]);
        assert_eq!(device.callback_count(), 1);

        io.stop();
        assert!(!device.is_running());
        assert!(!device.render(Some(&mut buffer), None, AudioTime::new(8, 48000.0)));
    }
}
