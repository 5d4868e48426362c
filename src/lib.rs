//! USB port-mapper core: bridges a virtualized USB host controller to real
//! USB devices on the host.
//!
//! The emulated xHCI/eHCI front-end hands this crate block-ring transfer
//! requests ([`Xfer`]) and receives completions and virtual interrupts through
//! the [`HciCallbacks`] value it injects at [`PortMapper::start`]. The core
//! takes care of:
//!
//! - discovering and tracking physical devices across a multi-tier hub
//!   topology, in strict tier order ([`topology`]);
//! - claiming and releasing host kernel drivers per device ([`device`]);
//! - translating block rings into asynchronous bulk/interrupt/isochronous
//!   transfers with correct framing and error mapping (the transfer engine);
//! - intercepting the control requests that must not reach the physical
//!   device (SET_ADDRESS, SET_CONFIGURATION, SET_INTERFACE, CLEAR_HALT) and
//!   forwarding the rest synchronously;
//! - rewriting UAS interface descriptors in flight so guests fall back to the
//!   mass-storage class driver ([`descriptor`]).
//!
//! The transport to the kernel is the user-space USB library behind the
//! [`transport`] seam; [`native::LibusbStack`] is the production
//! implementation. Completions are delivered by a single background
//! dispatcher thread owned by the [`PortMapper`].

pub mod descriptor;
pub mod device;
pub mod endpoint;
mod engine;
mod error;
pub mod native;
pub mod service;
pub mod topology;
pub mod transport;
pub mod xfer;

pub use device::{PassthroughDevice, CTRL_TIMEOUT, MAX_INTERFACE};
pub use endpoint::{Dir, Endpoint, EndpointTable, EpType, NUM_ENDPOINT};
pub use error::Error;
pub use service::{HciCallbacks, PortMapper, POLL_INTERVAL};
pub use topology::{scan, DeviceKind, DevicePath, NativeDeviceInfo, Speed, MAX_TIERS};
pub use transport::{TransferStatus, TransportError};
pub use xfer::{Block, BlockKind, BlockState, SetupPacket, Xfer, XferStatus};
