//! libusb-backed host transport.
//!
//! Implements the [`crate::transport`] seam over `rusb`. Lifecycle, the
//! blocking control path, hotplug and the event loop use the safe binding;
//! asynchronous bulk/interrupt/isochronous submission goes through
//! `rusb::ffi`, since the libusb asynchronous transfer API has no safe
//! wrapper. The completion trampoline reclaims the submission state, detaches
//! the cancellation handle, frees the libusb transfer and hands the buffer
//! back to the submitter's callback.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusb::{ffi, UsbContext};
use tracing::{debug, warn};

use crate::topology::DevicePath;
use crate::transport::{
    Completion, CompletionFn, ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, HostDevice,
    HostHandle, HostStack, HotplugRegistration, HotplugSink, InterfaceAlt, InterfaceDescriptor,
    IsoPacket, NativeSpeed, TransferHandle, TransferKind, TransferRequest, TransferStatus,
    TransportError, TransportResult,
};
use crate::xfer::SetupPacket;

/// libusb context wrapper implementing [`HostStack`].
pub struct LibusbStack {
    context: rusb::Context,
}

impl LibusbStack {
    pub fn new() -> TransportResult<Self> {
        let context = rusb::Context::new().map_err(map_error)?;
        Ok(Self { context })
    }
}

fn map_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Io => TransportError::Io,
        rusb::Error::InvalidParam => TransportError::InvalidParam,
        rusb::Error::Access => TransportError::Access,
        rusb::Error::NoDevice => TransportError::NoDevice,
        rusb::Error::NotFound => TransportError::NotFound,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::Overflow => TransportError::Overflow,
        rusb::Error::Pipe => TransportError::Pipe,
        rusb::Error::Interrupted => TransportError::Interrupted,
        rusb::Error::NoMem => TransportError::NoMem,
        rusb::Error::NotSupported => TransportError::NotSupported,
        rusb::Error::BadDescriptor => TransportError::Other("malformed descriptor"),
        _ => TransportError::Other("unspecified libusb error"),
    }
}

fn map_ffi_error(rc: i32) -> TransportError {
    use ffi::constants::*;
    match rc {
        LIBUSB_ERROR_IO => TransportError::Io,
        LIBUSB_ERROR_INVALID_PARAM => TransportError::InvalidParam,
        LIBUSB_ERROR_ACCESS => TransportError::Access,
        LIBUSB_ERROR_NO_DEVICE => TransportError::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => TransportError::NotFound,
        LIBUSB_ERROR_BUSY => TransportError::Busy,
        LIBUSB_ERROR_TIMEOUT => TransportError::Timeout,
        LIBUSB_ERROR_OVERFLOW => TransportError::Overflow,
        LIBUSB_ERROR_PIPE => TransportError::Pipe,
        LIBUSB_ERROR_INTERRUPTED => TransportError::Interrupted,
        LIBUSB_ERROR_NO_MEM => TransportError::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => TransportError::NotSupported,
        _ => TransportError::Other("unspecified libusb error"),
    }
}

fn map_transfer_status(status: i32) -> TransferStatus {
    use ffi::constants::*;
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_ERROR => TransferStatus::Error,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        other => {
            warn!(status = other, "unknown transfer status");
            TransferStatus::Error
        }
    }
}

fn bcd_from_version(version: rusb::Version) -> u16 {
    (u16::from(version.major()) << 8)
        | (u16::from(version.minor()) << 4)
        | u16::from(version.sub_minor())
}

impl HostStack for LibusbStack {
    fn devices(&self) -> TransportResult<Vec<Arc<dyn HostDevice>>> {
        let list = self.context.devices().map_err(map_error)?;
        Ok(list
            .iter()
            .map(|device| Arc::new(LibusbDevice { device }) as Arc<dyn HostDevice>)
            .collect())
    }

    fn device_present(&self, path: &DevicePath) -> bool {
        let Ok(list) = self.context.devices() else {
            return false;
        };
        list.iter().any(|device| {
            let ports = device.port_numbers().unwrap_or_default();
            DevicePath::new(device.bus_number(), &ports).is_some_and(|p| p == *path)
        })
    }

    fn register_hotplug(
        &self,
        sink: Arc<dyn HotplugSink>,
    ) -> TransportResult<Box<dyn HotplugRegistration>> {
        if !rusb::has_hotplug() {
            return Err(TransportError::NotSupported);
        }
        let registration = rusb::HotplugBuilder::new()
            .enumerate(false)
            .register(self.context.clone(), Box::new(HotplugForwarder { sink }))
            .map_err(map_error)?;
        Ok(Box::new(LibusbHotplugRegistration {
            _registration: registration,
        }))
    }

    fn handle_events(&self, timeout: Duration) -> TransportResult<()> {
        self.context.handle_events(Some(timeout)).map_err(map_error)
    }
}

struct LibusbHotplugRegistration {
    _registration: rusb::Registration<rusb::Context>,
}

impl HotplugRegistration for LibusbHotplugRegistration {}

struct HotplugForwarder {
    sink: Arc<dyn HotplugSink>,
}

impl rusb::Hotplug<rusb::Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: rusb::Device<rusb::Context>) {
        self.sink.device_arrived(Arc::new(LibusbDevice { device }));
    }

    fn device_left(&mut self, device: rusb::Device<rusb::Context>) {
        self.sink.device_left(Arc::new(LibusbDevice { device }));
    }
}

pub struct LibusbDevice {
    device: rusb::Device<rusb::Context>,
}

fn transfer_type_attributes(kind: rusb::TransferType) -> u8 {
    match kind {
        rusb::TransferType::Control => 0,
        rusb::TransferType::Isochronous => 1,
        rusb::TransferType::Bulk => 2,
        rusb::TransferType::Interrupt => 3,
    }
}

impl HostDevice for LibusbDevice {
    fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    fn port_path(&self) -> TransportResult<Vec<u8>> {
        self.device.port_numbers().map_err(map_error)
    }

    fn speed(&self) -> NativeSpeed {
        match self.device.speed() {
            rusb::Speed::Low => NativeSpeed::Low,
            rusb::Speed::Full => NativeSpeed::Full,
            rusb::Speed::High => NativeSpeed::High,
            rusb::Speed::Super => NativeSpeed::Super,
            rusb::Speed::SuperPlus => NativeSpeed::SuperPlus,
            _ => NativeSpeed::Unknown,
        }
    }

    fn device_descriptor(&self) -> TransportResult<DeviceDescriptor> {
        let desc = self.device.device_descriptor().map_err(map_error)?;
        Ok(DeviceDescriptor {
            bcd_usb: bcd_from_version(desc.usb_version()),
            class_code: desc.class_code(),
            sub_class: desc.sub_class_code(),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
        })
    }

    fn active_config_descriptor(&self) -> TransportResult<ConfigDescriptor> {
        let cfg = self.device.active_config_descriptor().map_err(map_error)?;
        let mut interfaces = Vec::new();
        for iface in cfg.interfaces() {
            let mut alt_settings = Vec::new();
            for alt in iface.descriptors() {
                let endpoints = alt
                    .endpoint_descriptors()
                    .map(|ep| EndpointDescriptor {
                        address: ep.address(),
                        attributes: transfer_type_attributes(ep.transfer_type()),
                        max_packet_size: ep.max_packet_size(),
                    })
                    .collect();
                alt_settings.push(InterfaceAlt {
                    alt: alt.setting_number(),
                    endpoints,
                });
            }
            interfaces.push(InterfaceDescriptor {
                number: iface.number(),
                alt_settings,
            });
        }
        Ok(ConfigDescriptor {
            value: cfg.number(),
            interfaces,
        })
    }

    /// Downstream port count via the sysfs `maxchild` attribute; there is no
    /// portable hub-descriptor read in the safe library surface.
    #[cfg(target_os = "linux")]
    fn hub_port_count(&self) -> TransportResult<u8> {
        let ports = self.device.port_numbers().map_err(map_error)?;
        let name = if ports.is_empty() {
            format!("usb{}", self.device.bus_number())
        } else {
            let joined = ports
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(".");
            format!("{}-{}", self.device.bus_number(), joined)
        };
        let path = format!("/sys/bus/usb/devices/{name}/maxchild");
        let raw = std::fs::read_to_string(&path).map_err(|err| {
            debug!(%path, %err, "cannot read hub port count");
            TransportError::NotFound
        })?;
        raw.trim()
            .parse::<u8>()
            .map_err(|_| TransportError::Other("malformed maxchild attribute"))
    }

    #[cfg(not(target_os = "linux"))]
    fn hub_port_count(&self) -> TransportResult<u8> {
        Err(TransportError::NotSupported)
    }

    fn open(&self) -> TransportResult<Box<dyn HostHandle>> {
        let handle = self.device.open().map_err(map_error)?;
        Ok(Box::new(LibusbHandle {
            handle: Mutex::new(handle),
        }))
    }
}

/// Opened device handle. The state-changing half of the `rusb` handle API
/// wants exclusive access, so the handle sits behind a mutex.
pub struct LibusbHandle {
    handle: Mutex<rusb::DeviceHandle<rusb::Context>>,
}

impl HostHandle for LibusbHandle {
    fn kernel_driver_active(&self, iface: u8) -> TransportResult<bool> {
        self.handle
            .lock()
            .unwrap()
            .kernel_driver_active(iface)
            .map_err(map_error)
    }

    fn detach_kernel_driver(&self, iface: u8) -> TransportResult<()> {
        self.handle
            .lock()
            .unwrap()
            .detach_kernel_driver(iface)
            .map_err(map_error)
    }

    fn attach_kernel_driver(&self, iface: u8) -> TransportResult<()> {
        self.handle
            .lock()
            .unwrap()
            .attach_kernel_driver(iface)
            .map_err(map_error)
    }

    fn claim_interface(&self, iface: u8) -> TransportResult<()> {
        self.handle
            .lock()
            .unwrap()
            .claim_interface(iface)
            .map_err(map_error)
    }

    fn release_interface(&self, iface: u8) -> TransportResult<()> {
        self.handle
            .lock()
            .unwrap()
            .release_interface(iface)
            .map_err(map_error)
    }

    fn set_configuration(&self, value: u8) -> TransportResult<()> {
        self.handle
            .lock()
            .unwrap()
            .set_active_configuration(value)
            .map_err(map_error)
    }

    fn set_alt_setting(&self, iface: u8, alt: u8) -> TransportResult<()> {
        self.handle
            .lock()
            .unwrap()
            .set_alternate_setting(iface, alt)
            .map_err(map_error)
    }

    fn clear_halt(&self, epid: u8) -> TransportResult<()> {
        self.handle
            .lock()
            .unwrap()
            .clear_halt(epid)
            .map_err(map_error)
    }

    fn reset(&self) -> TransportResult<()> {
        self.handle.lock().unwrap().reset().map_err(map_error)
    }

    fn control_transfer(
        &self,
        setup: SetupPacket,
        data: &mut [u8],
        timeout: Duration,
    ) -> TransportResult<usize> {
        let handle = self.handle.lock().unwrap();
        let res = if setup.is_in() {
            handle.read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                timeout,
            )
        } else {
            handle.write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                timeout,
            )
        };
        res.map_err(map_error)
    }

    fn submit(
        &self,
        request: TransferRequest,
        on_complete: CompletionFn,
    ) -> TransportResult<Arc<dyn TransferHandle>> {
        let iso_count = request.iso_packet_lengths.len();
        let transfer = unsafe { ffi::libusb_alloc_transfer(iso_count as i32) };
        if transfer.is_null() {
            return Err(TransportError::NoMem);
        }

        let handle = Arc::new(LibusbTransferHandle {
            raw: Mutex::new(transfer),
        });
        let mut state = Box::new(TransferState {
            buffer: request.buffer,
            on_complete: Some(on_complete),
            handle: Arc::clone(&handle),
        });

        let device_handle = self.handle.lock().unwrap();
        unsafe {
            (*transfer).dev_handle = device_handle.as_raw();
            (*transfer).flags = 0;
            (*transfer).endpoint = request.epid;
            (*transfer).transfer_type = match request.kind {
                TransferKind::Bulk => ffi::constants::LIBUSB_TRANSFER_TYPE_BULK,
                TransferKind::Interrupt => ffi::constants::LIBUSB_TRANSFER_TYPE_INTERRUPT,
                TransferKind::Isochronous => ffi::constants::LIBUSB_TRANSFER_TYPE_ISOCHRONOUS,
            };
            // No transport-level timeout; the guest applies its own.
            (*transfer).timeout = 0;
            (*transfer).buffer = state.buffer.as_mut_ptr();
            (*transfer).length = state.buffer.len() as i32;
            (*transfer).num_iso_packets = iso_count as i32;
            (*transfer).callback = transfer_done;
            let descs = (*transfer).iso_packet_desc.as_mut_ptr();
            for (i, len) in request.iso_packet_lengths.iter().enumerate() {
                (*descs.add(i)).length = *len;
                (*descs.add(i)).actual_length = 0;
                (*descs.add(i)).status = 0;
            }
            (*transfer).user_data = Box::into_raw(state) as *mut _;

            let rc = ffi::libusb_submit_transfer(transfer);
            if rc != 0 {
                drop(Box::from_raw((*transfer).user_data as *mut TransferState));
                ffi::libusb_free_transfer(transfer);
                return Err(map_ffi_error(rc));
            }
        }

        Ok(handle)
    }
}

struct TransferState {
    buffer: Vec<u8>,
    on_complete: Option<CompletionFn>,
    handle: Arc<LibusbTransferHandle>,
}

struct LibusbTransferHandle {
    raw: Mutex<*mut ffi::libusb_transfer>,
}

// The raw transfer pointer is never dereferenced on this side; the mutex
// serializes cancellation against completion teardown.
unsafe impl Send for LibusbTransferHandle {}
unsafe impl Sync for LibusbTransferHandle {}

impl TransferHandle for LibusbTransferHandle {
    fn cancel(&self) {
        let raw = self.raw.lock().unwrap();
        if !raw.is_null() {
            let rc = unsafe { ffi::libusb_cancel_transfer(*raw) };
            if rc != 0 {
                debug!(rc, "cancel request not queued");
            }
        }
    }
}

extern "system" fn transfer_done(transfer: *mut ffi::libusb_transfer) {
    let state = unsafe { Box::from_raw((*transfer).user_data as *mut TransferState) };
    let TransferState {
        buffer,
        on_complete,
        handle,
    } = *state;

    let (status, actual_length, iso_packets) = unsafe {
        let status = map_transfer_status((*transfer).status);
        let actual = (*transfer).actual_length.max(0) as usize;
        let count = (*transfer).num_iso_packets.max(0) as usize;
        let descs = (*transfer).iso_packet_desc.as_ptr();
        let iso = (0..count)
            .map(|i| {
                let desc = &*descs.add(i);
                IsoPacket {
                    length: desc.length,
                    actual: desc.actual_length,
                }
            })
            .collect::<Vec<_>>();
        (status, actual, iso)
    };

    // Detach the cancellation handle before the transfer is freed.
    *handle.raw.lock().unwrap() = std::ptr::null_mut();
    unsafe { ffi::libusb_free_transfer(transfer) };

    if let Some(cb) = on_complete {
        cb(Completion {
            status,
            actual_length,
            buffer,
            iso_packets,
        });
    }
}
