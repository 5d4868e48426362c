//! Port-mapper service: lifecycle, hotplug watching, completion dispatch.
//!
//! [`PortMapper::start`] scans the currently attached devices (announcing them
//! through the front-end callbacks in tier order), subscribes to hotplug
//! events, and spawns the single background dispatcher thread that drives the
//! transport event loop. All front-end collaboration goes through the
//! [`HciCallbacks`] value injected at construction; there is no process-wide
//! context.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::device::PassthroughDevice;
use crate::error::Error;
use crate::topology::{self, NativeDeviceInfo};
use crate::transport::{HostDevice, HostStack, HotplugRegistration, HotplugSink};
use crate::xfer::Xfer;

/// Poll interval of the completion dispatcher's event loop.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Front-end contract. All callbacks may be invoked from the dispatcher
/// thread; `on_connect` is additionally invoked from [`PortMapper::start`]
/// during the initial scan.
pub trait HciCallbacks: Send + Sync {
    /// A device arrived (or was present at the initial scan). May call back
    /// into [`PortMapper::open_device`] synchronously.
    fn on_connect(&self, info: &NativeDeviceInfo);

    /// A device departed. Must unwind any outstanding device for this path.
    fn on_disconnect(&self, info: &NativeDeviceInfo);

    /// A transfer finished; `xfer.status` carries the outcome. Runs inside
    /// the per-endpoint critical section. Returns `true` to request a guest
    /// interrupt.
    fn on_transfer_done(&self, xfer: &mut Xfer) -> bool;

    /// Raise a guest interrupt. Only invoked when `on_transfer_done` returned
    /// `true`.
    fn raise_interrupt(&self);
}

/// State shared between the mapper, its devices, their in-flight requests and
/// the dispatcher thread.
pub(crate) struct MapperShared {
    pub(crate) stack: Arc<dyn HostStack>,
    pub(crate) callbacks: Arc<dyn HciCallbacks>,
    next_seq: AtomicU32,
    exit: Mutex<bool>,
    exit_cv: Condvar,
}

impl MapperShared {
    pub(crate) fn next_seq(&self) -> u32 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn should_exit(&self) -> bool {
        *self.exit.lock().unwrap()
    }

    fn request_exit(&self) {
        *self.exit.lock().unwrap() = true;
        self.exit_cv.notify_all();
    }

    /// Sleep for up to `timeout`, returning early when shutdown is requested.
    fn backoff(&self, timeout: Duration) {
        let guard = self.exit.lock().unwrap();
        if !*guard {
            let _ = self.exit_cv.wait_timeout(guard, timeout);
        }
    }
}

/// Forwards transport hotplug events to the front-end.
struct HotplugDispatch {
    callbacks: Arc<dyn HciCallbacks>,
}

impl HotplugSink for HotplugDispatch {
    fn device_arrived(&self, device: Arc<dyn HostDevice>) {
        debug!("connect event");
        match NativeDeviceInfo::from_host_device(device) {
            Some(info) => self.callbacks.on_connect(&info),
            None => debug!("arrived device could not be described, dropped"),
        }
    }

    fn device_left(&self, device: Arc<dyn HostDevice>) {
        debug!("disconnect event");
        match NativeDeviceInfo::from_host_device(device) {
            Some(info) => self.callbacks.on_disconnect(&info),
            None => debug!("departed device could not be described, dropped"),
        }
    }
}

/// The port-mapper core. Owns the hotplug subscription and the dispatcher
/// thread; both are torn down on [`PortMapper::shutdown`] or drop.
pub struct PortMapper {
    shared: Arc<MapperShared>,
    hotplug: Option<Box<dyn HotplugRegistration>>,
    dispatcher: Option<thread::JoinHandle<()>>,
}

impl PortMapper {
    pub fn start(
        stack: Arc<dyn HostStack>,
        callbacks: Arc<dyn HciCallbacks>,
    ) -> Result<Self, Error> {
        let shared = Arc::new(MapperShared {
            stack: Arc::clone(&stack),
            callbacks: Arc::clone(&callbacks),
            next_seq: AtomicU32::new(1),
            exit: Mutex::new(false),
            exit_cv: Condvar::new(),
        });

        let infos = topology::scan(stack.as_ref());
        info!(count = infos.len(), "devices attached before guest boot");
        for info in &infos {
            callbacks.on_connect(info);
        }

        let hotplug = stack.register_hotplug(Arc::new(HotplugDispatch { callbacks }))?;

        let dispatcher = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("usb-portmap".into())
                .spawn(move || dispatcher_loop(shared))
                .map_err(Error::Thread)?
        };

        Ok(Self {
            shared,
            hotplug: Some(hotplug),
            dispatcher: Some(dispatcher),
        })
    }

    /// Open one scanned/arrived device for passthrough. Claiming its
    /// interfaces is deferred until the guest's first SET_CONFIGURATION.
    pub fn open_device(&self, info: &NativeDeviceInfo) -> Result<Arc<PassthroughDevice>, Error> {
        PassthroughDevice::open(Arc::clone(&self.shared), info)
    }

    /// Deregister hotplug callbacks and stop the dispatcher thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.dispatcher.is_none() {
            return;
        }
        info!("port-mapper shutdown");
        self.hotplug = None;
        self.shared.request_exit();
        if let Some(handle) = self.dispatcher.take() {
            if handle.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }
    }
}

impl Drop for PortMapper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatcher_loop(shared: Arc<MapperShared>) {
    while !shared.should_exit() {
        if let Err(err) = shared.stack.handle_events(POLL_INTERVAL) {
            warn!(%err, "transport event loop error");
            shared.backoff(POLL_INTERVAL);
        }
    }
    debug!("dispatcher thread exit");
}
