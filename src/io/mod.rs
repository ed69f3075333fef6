//! The boundary to the platform audio driver.
//!
//! [`AudioIo`] wraps one [`IoDevice`] and the driver core it creates. It owns
//! the running flag, tells observers when rendering is about to start or has
//! stopped, and forwards each driver callback to the render handler the graph
//! installed through [`AudioIo::set_render_handler`].
//!
//! Drivers implement [`IoDevice`] and [`IoCore`]. Two ship with the crate:
//! [`OfflineDevice`](offline::OfflineDevice), whose callbacks are pumped by the
//! caller, and, behind the `cpal_io` feature, `CpalDevice` for hardware output.

#[cfg(feature = "cpal_io")]
pub mod cpal;
pub mod graph_io;
pub mod offline;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::buffer::PcmBuffer;
use crate::config::DEFAULT_MAXIMUM_FRAMES_PER_SLICE;
use crate::error::IoError;
use crate::format::{AudioTime, Format};
use crate::notify::{Notifier, Observer};

/// Buffers and timestamps for one driver callback.
#[derive(Default)]
pub struct IoRenderArgs<'a> {
    /// Buffer to fill with output, in the device output format.
    pub output_buffer: Option<&'a mut PcmBuffer>,
    pub output_time: Option<AudioTime>,
    /// Samples captured by the device this period, in the device input format.
    pub input_buffer: Option<&'a mut PcmBuffer>,
    pub input_time: Option<AudioTime>,
}

impl<'a> IoRenderArgs<'a> {
    /// Arguments for an output-only callback.
    pub fn output(buffer: &'a mut PcmBuffer, time: AudioTime) -> Self {
        Self {
            output_buffer: Some(buffer),
            output_time: Some(time),
            ..Default::default()
        }
    }
}

pub type IoRenderFn = dyn Fn(IoRenderArgs<'_>) + Send + Sync;

/// Where a driver finds the current render handler.
///
/// Shared between [`AudioIo`] and the driver core. Swapping the handler never
/// blocks a callback in flight; that callback finishes with the handler it
/// loaded.
#[derive(Default)]
pub struct RenderSlot {
    handler: ArcSwapOption<Box<IoRenderFn>>,
    // Replaced handlers wait here until no callback holds them, so the
    // driver thread never frees one.
    retired: Mutex<Vec<Arc<Box<IoRenderFn>>>>,
}

impl RenderSlot {
    /// Run the installed handler. Returns `false` if there is none.
    pub fn render(&self, args: IoRenderArgs<'_>) -> bool {
        let handler = self.handler.load_full();
        match handler.as_deref() {
            Some(handler) => {
                handler(args);
                true
            }
            None => false,
        }
    }

    fn set(&self, handler: Option<Box<IoRenderFn>>) {
        let previous = self.handler.swap(handler.map(Arc::new));
        let mut retired = self.retired.lock();
        retired.retain(|h| Arc::strong_count(h) > 1);
        retired.extend(previous);
    }

    fn is_set(&self) -> bool {
        self.handler.load().is_some()
    }
}

/// A source of audio callbacks.
pub trait IoDevice: Send + Sync {
    fn name(&self) -> String;

    fn input_format(&self) -> Option<Format>;

    fn output_format(&self) -> Option<Format>;

    /// Create the driver core that will call through `slot`.
    fn make_io_core(&self, slot: Arc<RenderSlot>, maximum_frames: u32) -> Result<Box<dyn IoCore>, IoError>;

    /// Subscribe to reconfiguration of the device (format or route change).
    fn observe_updates(&self, handler: Box<dyn Fn() + Send + Sync>) -> Option<Observer> {
        let _ = handler;
        None
    }
}

/// Driver state for one device, created per initialization.
pub trait IoCore: Send {
    fn start(&mut self) -> Result<(), IoError>;

    /// Stop delivering callbacks. Must not return while a callback is still running.
    fn stop(&mut self);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunningMethod {
    WillStart,
    DidStop,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceMethod {
    /// A different device was set.
    Changed,
    /// The current device reconfigured itself.
    Updated,
}

/// Wrapper around the platform driver.
pub struct AudioIo {
    weak_self: Weak<AudioIo>,
    device: Mutex<Option<Arc<dyn IoDevice>>>,
    device_observer: Mutex<Option<Observer>>,
    core: Mutex<Option<Box<dyn IoCore>>>,
    slot: Arc<RenderSlot>,
    running: AtomicBool,
    maximum_frames: AtomicU32,
    running_notifier: Notifier<RunningMethod>,
    device_notifier: Notifier<DeviceMethod>,
}

impl AudioIo {
    pub fn new(device: Option<Arc<dyn IoDevice>>) -> Arc<Self> {
        Self::with_maximum_frames(device, DEFAULT_MAXIMUM_FRAMES_PER_SLICE)
    }

    pub fn with_maximum_frames(device: Option<Arc<dyn IoDevice>>, maximum_frames: u32) -> Arc<Self> {
        let io = Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            device: Mutex::new(None),
            device_observer: Mutex::new(None),
            core: Mutex::new(None),
            slot: Arc::new(RenderSlot::default()),
            running: AtomicBool::new(false),
            maximum_frames: AtomicU32::new(maximum_frames.max(1)),
            running_notifier: Notifier::new(),
            device_notifier: Notifier::new(),
        });
        io.set_device(device);
        io
    }

    pub fn device(&self) -> Option<Arc<dyn IoDevice>> {
        self.device.lock().clone()
    }

    /// Replace the device. A running I/O is stopped and started again on the new one.
    pub fn set_device(&self, device: Option<Arc<dyn IoDevice>>) {
        let unchanged = match (self.device.lock().as_ref(), device.as_ref()) {
            (None, None) => true,
            (Some(a), Some(b)) => same_device(a, b),
            _ => false,
        };
        if unchanged {
            return;
        }

        let was_running = self.is_running();
        self.uninitialize();

        *self.device_observer.lock() = None;
        *self.device.lock() = device.clone();

        if let Some(device) = &device {
            let weak = self.weak_self.clone();
            *self.device_observer.lock() = device.observe_updates(Box::new(move || {
                if let Some(io) = weak.upgrade() {
                    io.device_updated();
                }
            }));
            info!(device = %device.name(), "audio io device set");
            self.initialize();
        }

        self.device_notifier.notify(&DeviceMethod::Changed);

        if was_running && device.is_some() {
            self.start();
        }
    }

    fn device_updated(&self) {
        let was_running = self.is_running();
        self.uninitialize();
        info!("audio io device updated");
        self.device_notifier.notify(&DeviceMethod::Updated);
        self.initialize();
        if was_running {
            self.start();
        }
    }

    fn initialize(&self) {
        let Some(device) = self.device() else {
            return;
        };
        let frames = self.maximum_frames_per_slice();
        match device.make_io_core(self.slot.clone(), frames) {
            Ok(core) => *self.core.lock() = Some(core),
            Err(err) => error!(%err, device = %device.name(), "failed to create audio io core"),
        }
    }

    fn uninitialize(&self) {
        self.stop();
        *self.core.lock() = None;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start delivering callbacks.
    ///
    /// Observers see [`RunningMethod::WillStart`] before the driver starts.
    /// If the driver fails to start, the error is logged and observers see
    /// [`RunningMethod::DidStop`].
    pub fn start(&self) {
        if self.is_running() {
            return;
        }

        self.running_notifier.notify(&RunningMethod::WillStart);
        self.running.store(true, Ordering::Release);

        let result = match self.core.lock().as_mut() {
            Some(core) => core.start(),
            None => Ok(()),
        };

        match result {
            Ok(()) => info!(device = %self.device_name(), "audio io started"),
            Err(err) => {
                error!(%err, device = %self.device_name(), "failed to start audio io");
                self.running.store(false, Ordering::Release);
                self.running_notifier.notify(&RunningMethod::DidStop);
            }
        }
    }

    /// Stop delivering callbacks. Observers see [`RunningMethod::DidStop`]
    /// once the last callback has returned.
    pub fn stop(&self) {
        if !self.is_running() {
            return;
        }

        if let Some(core) = self.core.lock().as_mut() {
            core.stop();
        }
        self.running.store(false, Ordering::Release);
        info!(device = %self.device_name(), "audio io stopped");

        self.running_notifier.notify(&RunningMethod::DidStop);
    }

    #[must_use = "dropping the observer unsubscribes immediately"]
    pub fn observe_running<F>(&self, handler: F) -> Observer
    where
        F: Fn(&RunningMethod) + Send + Sync + 'static,
    {
        self.running_notifier.observe(handler)
    }

    #[must_use = "dropping the observer unsubscribes immediately"]
    pub fn observe_device<F>(&self, handler: F) -> Observer
    where
        F: Fn(&DeviceMethod) + Send + Sync + 'static,
    {
        self.device_notifier.observe(handler)
    }

    pub fn running_observer_count(&self) -> usize {
        self.running_notifier.observer_count()
    }

    pub fn set_render_handler(&self, handler: Option<Box<IoRenderFn>>) {
        self.slot.set(handler);
    }

    pub fn has_render_handler(&self) -> bool {
        self.slot.is_set()
    }

    /// Run one callback through the installed handler. Drivers normally do
    /// this through their [`RenderSlot`].
    pub fn render(&self, args: IoRenderArgs<'_>) -> bool {
        self.slot.render(args)
    }

    pub fn maximum_frames_per_slice(&self) -> u32 {
        self.maximum_frames.load(Ordering::Relaxed)
    }

    /// Takes effect the next time the driver core is created.
    pub fn set_maximum_frames_per_slice(&self, frames: u32) {
        self.maximum_frames.store(frames.max(1), Ordering::Relaxed);
    }

    fn device_name(&self) -> String {
        self.device().map(|d| d.name()).unwrap_or_else(|| "none".into())
    }
}

impl Drop for AudioIo {
    fn drop(&mut self) {
        if let Some(core) = self.core.get_mut().as_mut() {
            core.stop();
        }
    }
}

fn same_device(a: &Arc<dyn IoDevice>, b: &Arc<dyn IoDevice>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
