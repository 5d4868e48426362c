//! Per-device lifecycle and control-request handling.
//!
//! A [`PassthroughDevice`] wraps one opened transport device: it detaches the
//! host kernel drivers on attach, mirrors the guest-selected configuration and
//! alternate settings, owns the endpoint table, and services the guest's
//! control requests. SET_ADDRESS, SET_CONFIGURATION, SET_INTERFACE and
//! CLEAR_FEATURE(ENDPOINT_HALT) are intercepted; everything else is forwarded
//! to the physical device synchronously.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::descriptor::clear_uas_protocol;
use crate::endpoint::{Dir, Endpoint, EndpointTable, EpType};
use crate::engine;
use crate::error::Error;
use crate::service::MapperShared;
use crate::topology::{DevicePath, NativeDeviceInfo, Speed};
use crate::transport::{HostHandle, TransportError, TransportResult};
use crate::xfer::{index_inc, BlockState, Xfer, XferStatus};

/// Interfaces tracked per configuration.
pub const MAX_INTERFACE: usize = 16;

/// Timeout applied to forwarded control transfers.
pub const CTRL_TIMEOUT: Duration = Duration::from_millis(300);

const UR_CLEAR_FEATURE: u8 = 0x01;
const UR_SET_ADDRESS: u8 = 0x05;
const UR_GET_DESCRIPTOR: u8 = 0x06;
const UR_SET_CONFIG: u8 = 0x09;
const UR_SET_INTERFACE: u8 = 0x0b;

const UT_WRITE_DEVICE: u8 = 0x00;
const UT_WRITE_INTERFACE: u8 = 0x01;
const UT_WRITE_ENDPOINT: u8 = 0x02;
const UT_READ_DEVICE: u8 = 0x80;

/// wValue selecting a configuration descriptor (type 2, index 0).
const DESC_VALUE_CONFIGURATION: u16 = 0x0200;

#[derive(Default)]
struct DeviceState {
    configuration: u8,
    if_count: u8,
    alt_settings: [u8; MAX_INTERFACE],
    /// Guest-assigned address. Advisory only; never written to the device.
    address: u16,
}

/// One physical device attached to the guest.
pub struct PassthroughDevice {
    shared: Arc<MapperShared>,
    info: NativeDeviceInfo,
    version: u8,
    handle: Box<dyn HostHandle>,
    state: Mutex<DeviceState>,
    endpoints: RwLock<EndpointTable>,
}

/// USB major version the emulation presents for a device, from its `bcdUSB`.
///
/// USB 1.x devices are presented with USB 2 semantics: xHCI post-dates USB 1.1
/// by over a decade and has no 1.x wire-level notion.
fn usb_version_from_bcd(bcd: u16) -> Option<u8> {
    match bcd >> 8 {
        3 => Some(3),
        2 => Some(2),
        1 if bcd == 0x0110 => Some(2),
        _ => None,
    }
}

fn toggle_kernel_drivers(
    info: &NativeDeviceInfo,
    handle: &dyn HostHandle,
    attach: bool,
) -> TransportResult<()> {
    let cfg = info.native.active_config_descriptor().map_err(|err| {
        warn!(path = %info.path, %err, "cannot read active configuration");
        err
    })?;

    debug!(path = %info.path, attach, "toggle kernel drivers");

    let mut failed = false;
    for iface in 0..cfg.interfaces.len() as u8 {
        let res = if attach {
            handle.attach_kernel_driver(iface)
        } else if matches!(handle.kernel_driver_active(iface), Ok(true)) {
            handle.detach_kernel_driver(iface)
        } else {
            Ok(())
        };
        if let Err(err) = res {
            failed = true;
            warn!(
                path = %info.path,
                config = cfg.value,
                iface,
                attach,
                %err,
                "cannot toggle interface kernel driver"
            );
        }
    }

    if failed {
        Err(TransportError::Other("kernel driver attach/detach failed"))
    } else {
        Ok(())
    }
}

fn toggle_interfaces(
    info: &NativeDeviceInfo,
    handle: &dyn HostHandle,
    claim: bool,
) -> TransportResult<()> {
    let cfg = info.native.active_config_descriptor().map_err(|err| {
        warn!(path = %info.path, %err, "cannot read active configuration");
        err
    })?;

    let mut failed = false;
    for iface in 0..cfg.interfaces.len() as u8 {
        let res = if claim {
            handle.claim_interface(iface)
        } else {
            match handle.release_interface(iface) {
                // NotFound means the interface was never claimed.
                Err(TransportError::NotFound) => Ok(()),
                other => other,
            }
        };
        if let Err(err) = res {
            failed = true;
            warn!(
                path = %info.path,
                config = cfg.value,
                iface,
                claim,
                %err,
                "cannot toggle interface claim"
            );
        }
    }

    if failed {
        Err(TransportError::Other("interface claim/release failed"))
    } else {
        Ok(())
    }
}

impl PassthroughDevice {
    pub(crate) fn open(
        shared: Arc<MapperShared>,
        info: &NativeDeviceInfo,
    ) -> Result<Arc<Self>, Error> {
        info!(
            path = %info.path,
            vid = format_args!("{:#06x}", info.vid),
            pid = format_args!("{:#06x}", info.pid),
            bcd_usb = format_args!("{:#06x}", info.bcd_usb),
            speed = ?info.speed,
            "attaching USB device"
        );

        if info.path.root_port() == 0 {
            return Err(Error::RootHub(info.path));
        }

        let version = usb_version_from_bcd(info.bcd_usb).ok_or(Error::UnsupportedUsbVersion {
            path: info.path,
            bcd: info.bcd_usb,
        })?;

        let handle = info.native.open()?;
        toggle_kernel_drivers(info, handle.as_ref(), false).map_err(|err| {
            warn!(path = %info.path, "failed to detach interface drivers");
            err
        })?;

        Ok(Arc::new(Self {
            shared,
            info: info.clone(),
            version,
            handle,
            state: Mutex::new(DeviceState::default()),
            endpoints: RwLock::new(EndpointTable::new()),
        }))
    }

    pub fn info(&self) -> &NativeDeviceInfo {
        &self.info
    }

    pub fn path(&self) -> DevicePath {
        self.info.path
    }

    /// USB major version the device is emulated as (2 or 3).
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn speed(&self) -> Speed {
        self.info.speed
    }

    pub fn bus(&self) -> u8 {
        self.info.path.bus
    }

    /// Root-hub port the device (or its hub chain) hangs off.
    pub fn port(&self) -> u8 {
        self.info.path.root_port()
    }

    pub fn vid(&self) -> u16 {
        self.info.vid
    }

    pub fn pid(&self) -> u16 {
        self.info.pid
    }

    /// Guest-assigned device address (advisory).
    pub fn address(&self) -> u16 {
        self.state.lock().unwrap().address
    }

    pub fn configuration(&self) -> u8 {
        self.state.lock().unwrap().configuration
    }

    pub fn alt_setting(&self, iface: u8) -> u8 {
        let state = self.state.lock().unwrap();
        state
            .alt_settings
            .get(usize::from(iface))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn shared(&self) -> &Arc<MapperShared> {
        &self.shared
    }

    pub(crate) fn handle(&self) -> &dyn HostHandle {
        self.handle.as_ref()
    }

    /// Current endpoint-table entry for `(pid, epnum)`.
    pub fn endpoint(&self, pid: Dir, epnum: u8) -> Option<Endpoint> {
        self.endpoints.read().unwrap().get(pid, epnum).copied()
    }

    pub(crate) fn ep_type(&self, pid: Dir, epnum: u8) -> EpType {
        self.endpoints.read().unwrap().ep_type(pid, epnum)
    }

    pub(crate) fn ep_maxp(&self, pid: Dir, epnum: u8) -> u16 {
        self.endpoints.read().unwrap().ep_maxp(pid, epnum)
    }

    /// Reset the physical device and rebuild the endpoint table.
    pub fn reset(&self) -> TransportResult<()> {
        debug!(path = %self.info.path, "reset device");
        self.handle.reset()?;
        self.refresh_endpoints();
        Ok(())
    }

    /// Submit a non-control transfer ring; never blocks on I/O.
    pub fn data(self: &Arc<Self>, xfer: &Arc<Mutex<Xfer>>, dir: Dir, epctx: u8) -> XferStatus {
        engine::submit_data(self, xfer, dir, epctx)
    }

    /// Service a control transfer, blocking for at most [`CTRL_TIMEOUT`].
    pub fn request(&self, xfer: &Mutex<Xfer>) -> XferStatus {
        let mut xfer = xfer.lock().unwrap();
        self.control_request(&mut xfer)
    }

    /// Rebuild the endpoint table from the active configuration and the
    /// recorded alternate settings.
    fn refresh_endpoints(&self) {
        let alts = self.state.lock().unwrap().alt_settings;
        let mut table = self.endpoints.write().unwrap();
        table.reset();
        match self.info.native.active_config_descriptor() {
            Ok(cfg) => table.update_from_config(&cfg, &alts),
            Err(err) => {
                debug!(path = %self.info.path, %err, "cannot refresh endpoint table")
            }
        }
    }

    fn set_config(&self, xfer: &mut Xfer, value: u8) {
        // Detach and release before changing the configuration (libusb
        // contract); failures here are reported by the claim below.
        let _ = toggle_kernel_drivers(&self.info, self.handle.as_ref(), false);
        let _ = toggle_interfaces(&self.info, self.handle.as_ref(), false);

        if let Err(err) = self.handle.set_configuration(value) {
            warn!(path = %self.info.path, value, %err, "failed to set configuration");
            xfer.status = XferStatus::Stalled;
            return;
        }

        let cfg = match self.info.native.active_config_descriptor() {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!(path = %self.info.path, %err, "cannot read new active configuration");
                xfer.status = XferStatus::Stalled;
                return;
            }
        };

        if toggle_interfaces(&self.info, self.handle.as_ref(), true).is_err() {
            let _ = toggle_interfaces(&self.info, self.handle.as_ref(), false);
            warn!(path = %self.info.path, value, "failed to claim new configuration");
            xfer.status = XferStatus::Stalled;
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.configuration = value;
            state.if_count = cfg.interfaces.len() as u8;
        }
        self.refresh_endpoints();
    }

    fn set_if(&self, xfer: &mut Xfer, iface: u16, alt: u16) {
        if usize::from(iface) >= MAX_INTERFACE {
            debug!(path = %self.info.path, iface, alt, "interface out of range");
            xfer.status = XferStatus::Stalled;
            return;
        }

        debug!(path = %self.info.path, iface, alt, "set interface");
        if let Err(err) = self.handle.set_alt_setting(iface as u8, alt as u8) {
            debug!(path = %self.info.path, iface, alt, %err, "failed to set interface");
            xfer.status = XferStatus::Stalled;
            return;
        }

        self.state.lock().unwrap().alt_settings[usize::from(iface)] = alt as u8;
        // The table is keyed by endpoint number/direction only, so effectively
        // interface 0 is reflected; composite devices are a known limitation.
        self.refresh_endpoints();
    }

    fn control_request(&self, xfer: &mut Xfer) -> XferStatus {
        xfer.status = XferStatus::Normal;

        let Some(setup) = xfer.setup else {
            warn!(path = %self.info.path, "control transfer without setup packet");
            xfer.status = XferStatus::IoError;
            return xfer.status;
        };
        let (value, index, len) = (setup.value, setup.index, setup.length);

        let blk_idx = prepare_ctrl_blocks(xfer);
        debug!(
            path = %self.info.path,
            ?setup,
            data_len = blk_idx.map_or(0, |i| xfer.data[i].blen),
            "control request"
        );

        // A control transfer either has a DATA stage (data block + non-zero
        // wLength) or neither; any other pairing is skipped unforwarded.
        if (blk_idx.is_none() && len > 0) || (blk_idx.is_some() && len == 0) {
            return xfer.status;
        }

        let mut check_uas = false;
        match (setup.request, setup.request_type) {
            (UR_SET_ADDRESS, UT_WRITE_DEVICE) => {
                debug!(path = %self.info.path, address = value, "set address");
                self.state.lock().unwrap().address = value;
                return xfer.status;
            }
            (UR_SET_CONFIG, UT_WRITE_DEVICE) => {
                debug!(path = %self.info.path, config = value & 0xff, "set configuration");
                self.set_config(xfer, (value & 0xff) as u8);
                return xfer.status;
            }
            (UR_SET_INTERFACE, UT_WRITE_INTERFACE) => {
                self.set_if(xfer, index, value);
                return xfer.status;
            }
            (UR_GET_DESCRIPTOR, UT_READ_DEVICE) if value == DESC_VALUE_CONFIGURATION => {
                check_uas = true;
            }
            (UR_CLEAR_FEATURE, UT_WRITE_ENDPOINT) => {
                if value != 0 {
                    // Chapter 9 defines no other endpoint feature selector.
                    warn!(path = %self.info.path, value, "CLEAR_FEATURE with non-zero selector");
                } else {
                    debug!(path = %self.info.path, epid = index, "clear halt");
                    if let Err(err) = self.handle.clear_halt(index as u8) {
                        warn!(path = %self.info.path, %err, "failed to clear halted endpoint");
                    }
                    return xfer.status;
                }
            }
            _ => {}
        }

        let result = match blk_idx {
            Some(i) => {
                let blk = &mut xfer.data[i];
                let n = usize::from(len).min(blk.buf.len());
                self.handle
                    .control_transfer(setup, &mut blk.buf[..n], CTRL_TIMEOUT)
            }
            None => self.handle.control_transfer(setup, &mut [], CTRL_TIMEOUT),
        };

        let transferred = match result {
            Ok(n) => n,
            Err(err) => {
                debug!(path = %self.info.path, %err, "control transfer failed");
                xfer.status = control_error_status(err);
                return xfer.status;
            }
        };

        if let Some(i) = blk_idx {
            let blk = &mut xfer.data[i];
            if check_uas {
                let n = transferred.min(blk.buf.len());
                clear_uas_protocol(&mut blk.buf[..n]);
            }
            blk.blen = u32::from(len).saturating_sub(transferred as u32);
            blk.bdone += transferred as u32;
            xfer.status = if blk.blen > 0 {
                XferStatus::ShortXfer
            } else {
                XferStatus::Normal
            };
        }

        debug!(
            path = %self.info.path,
            transferred,
            status = ?xfer.status,
            "control transfer done"
        );
        xfer.status
    }
}

impl Drop for PassthroughDevice {
    fn drop(&mut self) {
        if let Err(err) = toggle_kernel_drivers(&self.info, self.handle.as_ref(), true) {
            warn!(path = %self.info.path, %err, "failed to reattach interface drivers");
        }
    }
}

/// Find the data-stage block (first with a non-empty payload area) and mark
/// every live block handled.
fn prepare_ctrl_blocks(xfer: &mut Xfer) -> Option<usize> {
    let cap = xfer.max_blk_cnt();
    let mut idx = xfer.head;
    if idx >= cap {
        return None;
    }

    let mut data_stage = None;
    for _ in 0..xfer.ndata {
        let blk = &mut xfer.data[idx];
        if blk.blen > 0 && data_stage.is_none() {
            data_stage = Some(idx);
        }
        blk.stat = BlockState::Handled;
        idx = index_inc(idx, cap);
    }
    data_stage
}

/// Synchronous control-transfer error mapping.
fn control_error_status(err: TransportError) -> XferStatus {
    match err {
        TransportError::Timeout => XferStatus::Timeout,
        TransportError::Pipe => XferStatus::Stalled,
        TransportError::NoDevice => XferStatus::IoError,
        TransportError::Busy => XferStatus::InUse,
        TransportError::Overflow => XferStatus::BadBufSize,
        TransportError::Io => XferStatus::IoError,
        _ => XferStatus::IoError,
    }
}
