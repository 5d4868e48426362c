//! Host transport seam.
//!
//! Object-safe traits covering exactly the slice of the user-space USB access
//! library that the port-mapper consumes: device enumeration, hotplug
//! registration, the blocking control path, and asynchronous data transfers
//! whose completions are delivered from the event loop. The production
//! implementation over libusb lives in [`crate::native`]; tests drive the core
//! through a scripted mock.
//!
//! Contract for implementations: completion callbacks run only from within
//! [`HostStack::handle_events`] (i.e. on the dispatcher thread), never from
//! inside [`HostHandle::submit`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::topology::DevicePath;
use crate::xfer::SetupPacket;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Error set of the underlying USB access library.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("input/output error")]
    Io,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("access denied")]
    Access,
    #[error("no such device")]
    NoDevice,
    #[error("entity not found")]
    NotFound,
    #[error("resource busy")]
    Busy,
    #[error("operation timed out")]
    Timeout,
    #[error("overflow")]
    Overflow,
    #[error("pipe error")]
    Pipe,
    #[error("system call interrupted")]
    Interrupted,
    #[error("insufficient memory")]
    NoMem,
    #[error("operation not supported")]
    NotSupported,
    #[error("transport error: {0}")]
    Other(&'static str),
}

/// Terminal status of an asynchronous transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    Bulk,
    Interrupt,
    Isochronous,
}

/// An asynchronous transfer to submit.
///
/// The buffer carries the full linearized payload: outbound data for OUT
/// endpoints, reserved space for IN. For isochronous transfers
/// `iso_packet_lengths` declares the per-packet framing; it is empty
/// otherwise.
pub struct TransferRequest {
    pub kind: TransferKind,
    /// Endpoint address: number, OR'ed with 0x80 for IN.
    pub epid: u8,
    pub buffer: Vec<u8>,
    pub iso_packet_lengths: Vec<u32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IsoPacket {
    pub length: u32,
    pub actual: u32,
}

/// Completion of an asynchronous transfer. The buffer is handed back to the
/// submitter; for IN transfers it holds the received bytes.
pub struct Completion {
    pub status: TransferStatus,
    pub actual_length: usize,
    pub buffer: Vec<u8>,
    pub iso_packets: Vec<IsoPacket>,
}

pub type CompletionFn = Box<dyn FnOnce(Completion) + Send>;

/// Cancellation handle for a submitted transfer.
pub trait TransferHandle: Send + Sync {
    /// Request cancellation. Asynchronous: the transfer still completes
    /// through its callback, with [`TransferStatus::Cancelled`].
    fn cancel(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub bcd_usb: u16,
    pub class_code: u8,
    pub sub_class: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// `bEndpointAddress`: number plus direction bit 7.
    pub address: u8,
    /// `bmAttributes`: transfer type in bits 0..2.
    pub attributes: u8,
    /// Packed `wMaxPacketSize` word.
    pub max_packet_size: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InterfaceAlt {
    pub alt: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alt_settings: Vec<InterfaceAlt>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigDescriptor {
    /// `bConfigurationValue`.
    pub value: u8,
    pub interfaces: Vec<InterfaceDescriptor>,
}

/// Device speed as reported by the transport library.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NativeSpeed {
    Unknown,
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

/// One attached physical device, not yet opened.
pub trait HostDevice: Send + Sync {
    fn bus_number(&self) -> u8;
    /// Downstream port numbers from the root hub to the device; empty for a
    /// root hub itself.
    fn port_path(&self) -> TransportResult<Vec<u8>>;
    fn speed(&self) -> NativeSpeed;
    fn device_descriptor(&self) -> TransportResult<DeviceDescriptor>;
    fn active_config_descriptor(&self) -> TransportResult<ConfigDescriptor>;
    /// Downstream port count of a hub, from a platform-specific lookup.
    fn hub_port_count(&self) -> TransportResult<u8>;
    fn open(&self) -> TransportResult<Box<dyn HostHandle>>;
}

/// An opened device handle.
pub trait HostHandle: Send + Sync {
    fn kernel_driver_active(&self, iface: u8) -> TransportResult<bool>;
    fn detach_kernel_driver(&self, iface: u8) -> TransportResult<()>;
    fn attach_kernel_driver(&self, iface: u8) -> TransportResult<()>;
    fn claim_interface(&self, iface: u8) -> TransportResult<()>;
    fn release_interface(&self, iface: u8) -> TransportResult<()>;
    fn set_configuration(&self, value: u8) -> TransportResult<()>;
    fn set_alt_setting(&self, iface: u8, alt: u8) -> TransportResult<()>;
    fn clear_halt(&self, epid: u8) -> TransportResult<()>;
    fn reset(&self) -> TransportResult<()>;
    /// Blocking control transfer. Direction follows bit 7 of
    /// `setup.request_type`; returns the number of data-stage bytes moved.
    fn control_transfer(
        &self,
        setup: SetupPacket,
        data: &mut [u8],
        timeout: Duration,
    ) -> TransportResult<usize>;
    /// Submit an asynchronous transfer. `on_complete` is invoked exactly once
    /// from the event loop with the terminal status.
    fn submit(
        &self,
        request: TransferRequest,
        on_complete: CompletionFn,
    ) -> TransportResult<Arc<dyn TransferHandle>>;
}

/// Receiver for hotplug events. Callbacks run on the event-loop thread.
pub trait HotplugSink: Send + Sync {
    fn device_arrived(&self, device: Arc<dyn HostDevice>);
    fn device_left(&self, device: Arc<dyn HostDevice>);
}

/// Active hotplug subscription; dropping it deregisters the callbacks.
pub trait HotplugRegistration: Send {}

/// The transport library context.
pub trait HostStack: Send + Sync {
    fn devices(&self) -> TransportResult<Vec<Arc<dyn HostDevice>>>;
    /// Whether a device with this topological path is currently attached.
    fn device_present(&self, path: &DevicePath) -> bool;
    fn register_hotplug(
        &self,
        sink: Arc<dyn HotplugSink>,
    ) -> TransportResult<Box<dyn HotplugRegistration>>;
    /// Run the event loop once, for at most `timeout`. Completion and hotplug
    /// callbacks fire from inside this call.
    fn handle_events(&self, timeout: Duration) -> TransportResult<()>;
}
