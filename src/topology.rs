//! Physical topology: hub-relative device paths, device classification, and
//! the tier-ordered scanner.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::transport::{HostDevice, HostStack, NativeSpeed};

/// Maximum hub nesting depth (tiers) supported, root hub excluded.
pub const MAX_TIERS: usize = 7;

const CLASS_HUB: u8 = 0x09;

/// Hub-relative topological address of a device.
///
/// `ports[0]` is the root-hub port; `ports[i]` for `0 < i < depth` is the
/// downstream port of the hub at tier `i`. A zero root-hub port marks the
/// entry as a root hub itself. Stable across enumerations while the device
/// stays attached; compared byte-equal (unused trailing ports are zero by
/// construction).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DevicePath {
    pub bus: u8,
    pub depth: u8,
    pub ports: [u8; MAX_TIERS],
}

impl DevicePath {
    /// Build a path from the transport's port-number list. `None` when the
    /// device sits deeper than [`MAX_TIERS`].
    pub fn new(bus: u8, port_numbers: &[u8]) -> Option<Self> {
        if port_numbers.len() > MAX_TIERS {
            return None;
        }
        let mut ports = [0u8; MAX_TIERS];
        ports[..port_numbers.len()].copy_from_slice(port_numbers);
        Some(Self {
            bus,
            depth: port_numbers.len() as u8,
            ports,
        })
    }

    pub fn root_port(&self) -> u8 {
        self.ports[0]
    }

    /// Root hubs have no port path of their own.
    pub fn is_root_hub(&self) -> bool {
        self.root_port() == 0
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-", self.bus)?;
        if self.depth == 0 {
            return write!(f, "0");
        }
        for (i, port) in self.ports[..usize::from(self.depth)].iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{port}")?;
        }
        Ok(())
    }
}

/// Where a device sits in the topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    RootHub,
    RootHubSubDev,
    ExtHub,
    ExtHubSubDev,
}

/// Device speed in the core's enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Speed {
    Unknown,
    Low,
    Full,
    High,
    Super,
}

impl Speed {
    pub(crate) fn from_native(speed: NativeSpeed) -> Self {
        match speed {
            NativeSpeed::Low => Speed::Low,
            NativeSpeed::Full => Speed::Full,
            NativeSpeed::High => Speed::High,
            NativeSpeed::Super => Speed::Super,
            other => {
                warn!(?other, "unexpected device speed");
                Speed::Unknown
            }
        }
    }
}

/// Identity of one attached physical device, as handed to the front-end's
/// connect/disconnect callbacks and to [`crate::PortMapper::open_device`].
#[derive(Clone)]
pub struct NativeDeviceInfo {
    pub path: DevicePath,
    pub speed: Speed,
    pub vid: u16,
    pub pid: u16,
    pub bcd_usb: u16,
    pub kind: DeviceKind,
    /// Downstream port count for external hubs, zero when unknown.
    pub max_child: u8,
    /// Transport-library device backing this entry.
    pub native: Arc<dyn HostDevice>,
}

impl fmt::Debug for NativeDeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeDeviceInfo")
            .field("path", &format_args!("{}", self.path))
            .field("speed", &self.speed)
            .field("vid", &format_args!("{:#06x}", self.vid))
            .field("pid", &format_args!("{:#06x}", self.pid))
            .field("bcd_usb", &format_args!("{:#06x}", self.bcd_usb))
            .field("kind", &self.kind)
            .field("max_child", &self.max_child)
            .finish()
    }
}

impl NativeDeviceInfo {
    /// Build the info record for one transport device. `None` when the device
    /// cannot be described (descriptor read failure, or nested deeper than
    /// [`MAX_TIERS`]).
    pub fn from_host_device(device: Arc<dyn HostDevice>) -> Option<Self> {
        let bus = device.bus_number();
        let port_numbers = match device.port_path() {
            Ok(ports) => ports,
            Err(err) => {
                warn!(bus, %err, "failed to read device port path");
                return None;
            }
        };
        let Some(path) = DevicePath::new(bus, &port_numbers) else {
            warn!(
                bus,
                tiers = port_numbers.len(),
                "device beyond max hub tiers, dropped"
            );
            return None;
        };

        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(err) => {
                warn!(%path, %err, "failed to read device descriptor");
                return None;
            }
        };

        let kind = if path.root_port() == 0 {
            DeviceKind::RootHub
        } else if desc.class_code == CLASS_HUB {
            DeviceKind::ExtHub
        } else if path.ports[1] == 0 {
            DeviceKind::RootHubSubDev
        } else {
            DeviceKind::ExtHubSubDev
        };

        // External hubs assign downstream port numbers dynamically; their port
        // count is needed before children can be mapped.
        let max_child = if kind == DeviceKind::ExtHub {
            match device.hub_port_count() {
                Ok(count) => count,
                Err(err) => {
                    debug!(%path, %err, "failed to read hub port count");
                    0
                }
            }
        } else {
            0
        };

        Some(Self {
            path,
            speed: Speed::from_native(device.speed()),
            vid: desc.vendor_id,
            pid: desc.product_id,
            bcd_usb: desc.bcd_usb,
            kind,
            max_child,
            native: device,
        })
    }
}

/// Enumerate all attached devices in increasing tier order.
///
/// Every tier-`d` device is emitted before any tier-`d + 1` device: external
/// hubs assign downstream port numbers on attach, so a hub's port map must
/// exist before its children are classified. Root hubs are never emitted.
pub fn scan(stack: &dyn HostStack) -> Vec<NativeDeviceInfo> {
    let devices = match stack.devices() {
        Ok(devices) => devices,
        Err(err) => {
            warn!(%err, "failed to list devices");
            return Vec::new();
        }
    };

    let infos: Vec<NativeDeviceInfo> = devices
        .into_iter()
        .filter_map(NativeDeviceInfo::from_host_device)
        .collect();

    let mut ordered = Vec::with_capacity(infos.len());
    for depth in 1..=MAX_TIERS as u8 {
        for info in &infos {
            if info.path.depth == depth && info.path.root_port() != 0 {
                ordered.push(info.clone());
            }
        }
    }
    ordered
}
