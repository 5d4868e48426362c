#![allow(dead_code)]

//! Scripted mock transport and front-end callbacks shared by the integration
//! tests. Completions and hotplug events are delivered only from
//! `handle_events`, matching the contract of the libusb-backed transport: the
//! port mapper's dispatcher thread is what actually runs them.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hostusb_portmap::topology::DevicePath;
use hostusb_portmap::transport::{
    Completion, CompletionFn, ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, HostDevice,
    HostHandle, HostStack, HotplugRegistration, HotplugSink, InterfaceAlt, InterfaceDescriptor,
    IsoPacket, NativeSpeed, TransferHandle, TransferKind, TransferRequest, TransferStatus,
    TransportError, TransportResult,
};
use hostusb_portmap::xfer::SetupPacket;
use hostusb_portmap::{DeviceKind, HciCallbacks, NativeDeviceInfo, Xfer, XferStatus};

pub type Job = Box<dyn FnOnce() + Send>;

const CLASS_HUB: u8 = 0x09;

/// Shared event-queue end used by device handles to post completions.
#[derive(Clone)]
pub struct JobQueue {
    tx: Arc<Mutex<Sender<Job>>>,
}

impl JobQueue {
    pub fn post(&self, job: Job) {
        let _ = self.tx.lock().unwrap().send(job);
    }
}

struct StackInner {
    jobs: JobQueue,
    jobs_rx: Mutex<Receiver<Job>>,
    devices: Mutex<Vec<Arc<MockDevice>>>,
    absent: Mutex<HashSet<DevicePath>>,
    hotplug: Mutex<Option<Arc<dyn HotplugSink>>>,
}

/// Scripted in-process host stack.
#[derive(Clone)]
pub struct MockStack {
    inner: Arc<StackInner>,
}

impl MockStack {
    pub fn new() -> Self {
        let (tx, rx) = channel();
        Self {
            inner: Arc::new(StackInner {
                jobs: JobQueue {
                    tx: Arc::new(Mutex::new(tx)),
                },
                jobs_rx: Mutex::new(rx),
                devices: Mutex::new(Vec::new()),
                absent: Mutex::new(HashSet::new()),
                hotplug: Mutex::new(None),
            }),
        }
    }

    pub fn jobs(&self) -> JobQueue {
        self.inner.jobs.clone()
    }

    pub fn add_device(&self, device: &Arc<MockDevice>) {
        self.inner.devices.lock().unwrap().push(Arc::clone(device));
    }

    /// Mark the device absent for `device_present` queries without delivering
    /// a hotplug event.
    pub fn mark_absent(&self, path: DevicePath) {
        self.inner.absent.lock().unwrap().insert(path);
    }

    /// Attach the device and deliver an arrival event from the event loop.
    pub fn plug(&self, device: &Arc<MockDevice>) {
        {
            let mut devices = self.inner.devices.lock().unwrap();
            if !devices.iter().any(|d| d.path() == device.path()) {
                devices.push(Arc::clone(device));
            }
        }
        self.inner.absent.lock().unwrap().remove(&device.path());
        let sink = self.inner.hotplug.lock().unwrap().clone();
        if let Some(sink) = sink {
            let dev: Arc<dyn HostDevice> = Arc::clone(device) as Arc<dyn HostDevice>;
            self.inner.jobs.post(Box::new(move || sink.device_arrived(dev)));
        }
    }

    /// Detach the device and deliver a departure event from the event loop.
    pub fn unplug(&self, device: &Arc<MockDevice>) {
        let path = device.path();
        self.inner
            .devices
            .lock()
            .unwrap()
            .retain(|d| d.path() != path);
        self.inner.absent.lock().unwrap().insert(path);
        let sink = self.inner.hotplug.lock().unwrap().clone();
        if let Some(sink) = sink {
            let dev: Arc<dyn HostDevice> = Arc::clone(device) as Arc<dyn HostDevice>;
            self.inner.jobs.post(Box::new(move || sink.device_left(dev)));
        }
    }

    pub fn hotplug_registered(&self) -> bool {
        self.inner.hotplug.lock().unwrap().is_some()
    }
}

impl HostStack for MockStack {
    fn devices(&self) -> TransportResult<Vec<Arc<dyn HostDevice>>> {
        Ok(self
            .inner
            .devices
            .lock()
            .unwrap()
            .iter()
            .map(|d| Arc::clone(d) as Arc<dyn HostDevice>)
            .collect())
    }

    fn device_present(&self, path: &DevicePath) -> bool {
        if self.inner.absent.lock().unwrap().contains(path) {
            return false;
        }
        self.inner
            .devices
            .lock()
            .unwrap()
            .iter()
            .any(|d| d.path() == *path)
    }

    fn register_hotplug(
        &self,
        sink: Arc<dyn HotplugSink>,
    ) -> TransportResult<Box<dyn HotplugRegistration>> {
        *self.inner.hotplug.lock().unwrap() = Some(sink);
        Ok(Box::new(MockRegistration {
            inner: Arc::clone(&self.inner),
        }))
    }

    fn handle_events(&self, timeout: Duration) -> TransportResult<()> {
        let job = {
            let rx = self.inner.jobs_rx.lock().unwrap();
            match rx.recv_timeout(timeout.min(Duration::from_millis(20))) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Ok(())
                }
            }
        };
        job();
        Ok(())
    }
}

struct MockRegistration {
    inner: Arc<StackInner>,
}

impl HotplugRegistration for MockRegistration {}

impl Drop for MockRegistration {
    fn drop(&mut self) {
        *self.inner.hotplug.lock().unwrap() = None;
    }
}

/// Construction parameters for a [`MockDevice`].
pub struct MockDeviceSpec {
    pub bus: u8,
    pub ports: Vec<u8>,
    pub speed: NativeSpeed,
    pub desc: DeviceDescriptor,
    pub config: ConfigDescriptor,
    pub hub_ports: Option<u8>,
}

impl Default for MockDeviceSpec {
    fn default() -> Self {
        Self {
            bus: 1,
            ports: vec![1],
            speed: NativeSpeed::High,
            desc: DeviceDescriptor {
                bcd_usb: 0x0200,
                class_code: 0,
                sub_class: 0,
                vendor_id: 0x1234,
                product_id: 0x5678,
            },
            config: bulk_config(),
            hub_ports: None,
        }
    }
}

pub struct MockDevice {
    spec: MockDeviceSpec,
    pub handle: Arc<HandleState>,
}

pub fn mock_device(stack: &MockStack, spec: MockDeviceSpec) -> Arc<MockDevice> {
    let handle = Arc::new(HandleState::new(stack.jobs()));
    *handle.config.lock().unwrap() = spec.config.clone();
    let device = Arc::new(MockDevice { handle, spec });
    stack.add_device(&device);
    device
}

/// An external hub with the given downstream port count.
pub fn mock_hub(stack: &MockStack, ports: &[u8], downstream: u8) -> Arc<MockDevice> {
    mock_device(
        stack,
        MockDeviceSpec {
            ports: ports.to_vec(),
            desc: DeviceDescriptor {
                bcd_usb: 0x0200,
                class_code: CLASS_HUB,
                sub_class: 0,
                vendor_id: 0x1d6b,
                product_id: 0x0101,
            },
            hub_ports: Some(downstream),
            ..Default::default()
        },
    )
}

impl MockDevice {
    pub fn path(&self) -> DevicePath {
        DevicePath::new(self.spec.bus, &self.spec.ports).expect("mock path fits")
    }

    pub fn set_config_descriptor(&self, cfg: ConfigDescriptor) {
        *self.handle.config.lock().unwrap() = cfg;
    }
}

impl HostDevice for MockDevice {
    fn bus_number(&self) -> u8 {
        self.spec.bus
    }

    fn port_path(&self) -> TransportResult<Vec<u8>> {
        Ok(self.spec.ports.clone())
    }

    fn speed(&self) -> NativeSpeed {
        self.spec.speed
    }

    fn device_descriptor(&self) -> TransportResult<DeviceDescriptor> {
        Ok(self.spec.desc)
    }

    fn active_config_descriptor(&self) -> TransportResult<ConfigDescriptor> {
        Ok(self.handle.config.lock().unwrap().clone())
    }

    fn hub_port_count(&self) -> TransportResult<u8> {
        self.spec.hub_ports.ok_or(TransportError::NotSupported)
    }

    fn open(&self) -> TransportResult<Box<dyn HostHandle>> {
        Ok(Box::new(MockHandle {
            state: Arc::clone(&self.handle),
        }))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandleOp {
    DetachDriver(u8),
    AttachDriver(u8),
    Claim(u8),
    Release(u8),
    SetConfig(u8),
    SetAlt(u8, u8),
    ClearHalt(u8),
    Reset,
    Control(u8, u8),
}

/// Scripted reply to one forwarded control transfer.
pub enum ControlReply {
    /// Data-stage bytes for an IN request.
    In(Vec<u8>),
    /// Accepted byte count for an OUT (or zero-length) request.
    Out(usize),
    Err(TransportError),
}

/// Scripted behavior of one asynchronous submission.
pub enum SubmitPlan {
    Complete(PlannedCompletion),
    /// Stay pending until cancelled.
    Hold,
    /// Fail the submission call itself.
    Reject(TransportError),
}

pub struct PlannedCompletion {
    pub status: TransferStatus,
    pub actual: usize,
    /// Bytes copied into the transfer buffer before completion (IN data).
    pub data: Vec<u8>,
    /// Per-packet results; empty means "all packets fully transferred" for
    /// isochronous submissions.
    pub iso: Vec<IsoPacket>,
}

impl PlannedCompletion {
    pub fn ok(actual: usize) -> Self {
        Self {
            status: TransferStatus::Completed,
            actual,
            data: Vec::new(),
            iso: Vec::new(),
        }
    }

    pub fn ok_with_data(data: Vec<u8>) -> Self {
        Self {
            status: TransferStatus::Completed,
            actual: data.len(),
            data,
            iso: Vec::new(),
        }
    }

    pub fn status(status: TransferStatus) -> Self {
        Self {
            status,
            actual: 0,
            data: Vec::new(),
            iso: Vec::new(),
        }
    }
}

pub struct SubmittedTransfer {
    pub kind: TransferKind,
    pub epid: u8,
    pub buffer: Vec<u8>,
    pub iso_lengths: Vec<u32>,
}

pub struct HandleState {
    jobs: JobQueue,
    pub config: Mutex<ConfigDescriptor>,
    pub ops: Mutex<Vec<HandleOp>>,
    kernel_driver: Mutex<[bool; 16]>,
    claimed: Mutex<HashSet<u8>>,
    pub control_replies: Mutex<VecDeque<ControlReply>>,
    pub submit_plan: Mutex<VecDeque<SubmitPlan>>,
    pub submitted: Mutex<Vec<SubmittedTransfer>>,
}

impl HandleState {
    fn new(jobs: JobQueue) -> Self {
        Self {
            jobs,
            config: Mutex::new(bulk_config()),
            ops: Mutex::new(Vec::new()),
            // Host kernel drivers start out bound to every interface.
            kernel_driver: Mutex::new([true; 16]),
            claimed: Mutex::new(HashSet::new()),
            control_replies: Mutex::new(VecDeque::new()),
            submit_plan: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn ops(&self) -> Vec<HandleOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    pub fn push_control_reply(&self, reply: ControlReply) {
        self.control_replies.lock().unwrap().push_back(reply);
    }

    pub fn push_submit_plan(&self, plan: SubmitPlan) {
        self.submit_plan.lock().unwrap().push_back(plan);
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

struct MockHandle {
    state: Arc<HandleState>,
}

impl HostHandle for MockHandle {
    fn kernel_driver_active(&self, iface: u8) -> TransportResult<bool> {
        Ok(self.state.kernel_driver.lock().unwrap()[usize::from(iface)])
    }

    fn detach_kernel_driver(&self, iface: u8) -> TransportResult<()> {
        self.state
            .ops
            .lock()
            .unwrap()
            .push(HandleOp::DetachDriver(iface));
        self.state.kernel_driver.lock().unwrap()[usize::from(iface)] = false;
        Ok(())
    }

    fn attach_kernel_driver(&self, iface: u8) -> TransportResult<()> {
        self.state
            .ops
            .lock()
            .unwrap()
            .push(HandleOp::AttachDriver(iface));
        self.state.kernel_driver.lock().unwrap()[usize::from(iface)] = true;
        Ok(())
    }

    fn claim_interface(&self, iface: u8) -> TransportResult<()> {
        self.state.ops.lock().unwrap().push(HandleOp::Claim(iface));
        self.state.claimed.lock().unwrap().insert(iface);
        Ok(())
    }

    fn release_interface(&self, iface: u8) -> TransportResult<()> {
        self.state.ops.lock().unwrap().push(HandleOp::Release(iface));
        if !self.state.claimed.lock().unwrap().remove(&iface) {
            return Err(TransportError::NotFound);
        }
        Ok(())
    }

    fn set_configuration(&self, value: u8) -> TransportResult<()> {
        self.state
            .ops
            .lock()
            .unwrap()
            .push(HandleOp::SetConfig(value));
        Ok(())
    }

    fn set_alt_setting(&self, iface: u8, alt: u8) -> TransportResult<()> {
        self.state
            .ops
            .lock()
            .unwrap()
            .push(HandleOp::SetAlt(iface, alt));
        Ok(())
    }

    fn clear_halt(&self, epid: u8) -> TransportResult<()> {
        self.state
            .ops
            .lock()
            .unwrap()
            .push(HandleOp::ClearHalt(epid));
        Ok(())
    }

    fn reset(&self) -> TransportResult<()> {
        self.state.ops.lock().unwrap().push(HandleOp::Reset);
        Ok(())
    }

    fn control_transfer(
        &self,
        setup: SetupPacket,
        data: &mut [u8],
        _timeout: Duration,
    ) -> TransportResult<usize> {
        self.state
            .ops
            .lock()
            .unwrap()
            .push(HandleOp::Control(setup.request_type, setup.request));
        let reply = self
            .state
            .control_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ControlReply::Out(data.len()));
        match reply {
            ControlReply::In(bytes) => {
                let n = bytes.len().min(data.len());
                data[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            ControlReply::Out(n) => Ok(n),
            ControlReply::Err(err) => Err(err),
        }
    }

    fn submit(
        &self,
        request: TransferRequest,
        on_complete: CompletionFn,
    ) -> TransportResult<Arc<dyn TransferHandle>> {
        let plan = self
            .state
            .submit_plan
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SubmitPlan::Complete(PlannedCompletion::ok(
                request.buffer.len(),
            )));

        self.state.submitted.lock().unwrap().push(SubmittedTransfer {
            kind: request.kind,
            epid: request.epid,
            buffer: request.buffer.clone(),
            iso_lengths: request.iso_packet_lengths.clone(),
        });

        match plan {
            SubmitPlan::Reject(err) => Err(err),
            SubmitPlan::Complete(planned) => {
                let mut buffer = request.buffer;
                let n = planned.data.len().min(buffer.len());
                buffer[..n].copy_from_slice(&planned.data[..n]);
                let iso_packets = if planned.iso.is_empty() {
                    request
                        .iso_packet_lengths
                        .iter()
                        .map(|&length| IsoPacket {
                            length,
                            actual: length,
                        })
                        .collect()
                } else {
                    planned.iso
                };
                let completion = Completion {
                    status: planned.status,
                    actual_length: planned.actual,
                    buffer,
                    iso_packets,
                };
                self.state
                    .jobs
                    .post(Box::new(move || on_complete(completion)));
                Ok(Arc::new(MockTransferHandle {
                    jobs: self.state.jobs.clone(),
                    pending: Mutex::new(None),
                }))
            }
            SubmitPlan::Hold => Ok(Arc::new(MockTransferHandle {
                jobs: self.state.jobs.clone(),
                pending: Mutex::new(Some((
                    request.buffer,
                    request.iso_packet_lengths,
                    on_complete,
                ))),
            })),
        }
    }
}

struct MockTransferHandle {
    jobs: JobQueue,
    pending: Mutex<Option<(Vec<u8>, Vec<u32>, CompletionFn)>>,
}

impl TransferHandle for MockTransferHandle {
    fn cancel(&self) {
        if let Some((buffer, iso_lengths, on_complete)) = self.pending.lock().unwrap().take() {
            let completion = Completion {
                status: TransferStatus::Cancelled,
                actual_length: 0,
                buffer,
                iso_packets: iso_lengths
                    .iter()
                    .map(|&length| IsoPacket { length, actual: 0 })
                    .collect(),
            };
            self.jobs.post(Box::new(move || on_complete(completion)));
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HciEvent {
    Connect(DevicePath, DeviceKind),
    Disconnect(DevicePath),
}

/// Recording front-end.
pub struct TestCallbacks {
    pub events: Mutex<Vec<HciEvent>>,
    pub infos: Mutex<Vec<NativeDeviceInfo>>,
    pub statuses: Mutex<Vec<XferStatus>>,
    pub interrupts: AtomicUsize,
    /// Return value of `on_transfer_done` (interrupt request).
    pub want_interrupt: AtomicBool,
    notify_tx: Mutex<Sender<XferStatus>>,
    notify_rx: Mutex<Receiver<XferStatus>>,
}

impl TestCallbacks {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = channel();
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            infos: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
            interrupts: AtomicUsize::new(0),
            want_interrupt: AtomicBool::new(true),
            notify_tx: Mutex::new(tx),
            notify_rx: Mutex::new(rx),
        })
    }

    /// Wait for the next transfer-done notification.
    pub fn wait_notify(&self, timeout: Duration) -> Option<XferStatus> {
        self.notify_rx.lock().unwrap().recv_timeout(timeout).ok()
    }

    pub fn events(&self) -> Vec<HciEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
        self.infos.lock().unwrap().clear();
    }

    /// Info record for the connect event at `idx`.
    pub fn info(&self, idx: usize) -> NativeDeviceInfo {
        self.infos.lock().unwrap()[idx].clone()
    }
}

impl HciCallbacks for TestCallbacks {
    fn on_connect(&self, info: &NativeDeviceInfo) {
        self.events
            .lock()
            .unwrap()
            .push(HciEvent::Connect(info.path, info.kind));
        self.infos.lock().unwrap().push(info.clone());
    }

    fn on_disconnect(&self, info: &NativeDeviceInfo) {
        self.events
            .lock()
            .unwrap()
            .push(HciEvent::Disconnect(info.path));
    }

    fn on_transfer_done(&self, xfer: &mut Xfer) -> bool {
        self.statuses.lock().unwrap().push(xfer.status);
        let _ = self.notify_tx.lock().unwrap().send(xfer.status);
        self.want_interrupt.load(Ordering::Relaxed)
    }

    fn raise_interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
    }
}

/// Single-interface configuration with bulk IN 0x81 / OUT 0x02 and an
/// interrupt IN 0x83.
pub fn bulk_config() -> ConfigDescriptor {
    ConfigDescriptor {
        value: 1,
        interfaces: vec![InterfaceDescriptor {
            number: 0,
            alt_settings: vec![InterfaceAlt {
                alt: 0,
                endpoints: vec![
                    EndpointDescriptor {
                        address: 0x81,
                        attributes: 0x02,
                        max_packet_size: 512,
                    },
                    EndpointDescriptor {
                        address: 0x02,
                        attributes: 0x02,
                        max_packet_size: 512,
                    },
                    EndpointDescriptor {
                        address: 0x83,
                        attributes: 0x03,
                        max_packet_size: 64,
                    },
                ],
            }],
        }],
    }
}

/// Single-interface configuration with isochronous IN 0x81 / OUT 0x01 of the
/// given packed `wMaxPacketSize`.
pub fn iso_config(maxp: u16) -> ConfigDescriptor {
    ConfigDescriptor {
        value: 1,
        interfaces: vec![InterfaceDescriptor {
            number: 0,
            alt_settings: vec![InterfaceAlt {
                alt: 0,
                endpoints: vec![
                    EndpointDescriptor {
                        address: 0x81,
                        attributes: 0x01,
                        max_packet_size: maxp,
                    },
                    EndpointDescriptor {
                        address: 0x01,
                        attributes: 0x01,
                        max_packet_size: maxp,
                    },
                ],
            }],
        }],
    }
}

/// Poll `cond` for up to two seconds.
pub fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);
