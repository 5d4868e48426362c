//! Block-ring transfer model shared between the emulated host controller and
//! the port-mapper core.
//!
//! The front-end owns each [`Xfer`]: it enqueues scatter/gather [`Block`]s
//! describing one transfer ring for one endpoint, then hands the ring to the
//! core for submission. The core only mutates block payload/state and the
//! parallel in-flight request slots. One `Xfer` models one endpoint's ring, so
//! the `Mutex` wrapping it doubles as the per-endpoint lock: completions for a
//! single endpoint are serialized by it, and nothing is guaranteed across
//! endpoints.

use std::fmt;
use std::sync::Arc;

use crate::transport::TransferHandle;

/// Completion status of a transfer, as observed by the front-end either on
/// return from a submission call or inside the transfer-done callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XferStatus {
    Normal,
    ShortXfer,
    Stalled,
    Timeout,
    BadBufSize,
    IoError,
    InUse,
    Invalid,
}

/// Framing role of a block within its transfer ring.
///
/// `Part` blocks continue the current frame, `Full` ends it, `Link` marks a
/// ring wrap and never carries data, `None` is a placeholder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlockKind {
    #[default]
    None,
    Part,
    Full,
    Link,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlockState {
    #[default]
    Free,
    Handling,
    Handled,
}

/// One scatter/gather unit of a transfer.
///
/// The block owns its byte storage; copying guest memory in and out of it is
/// the front-end's concern. `blen` is the number of bytes still expected,
/// `bdone` the number transferred by the most recent request touching it.
#[derive(Debug, Default)]
pub struct Block {
    pub buf: Vec<u8>,
    pub blen: u32,
    pub bdone: u32,
    pub kind: BlockKind,
    pub stat: BlockState,
}

impl Block {
    pub fn new(kind: BlockKind, buf: Vec<u8>) -> Self {
        let blen = buf.len() as u32;
        Self {
            buf,
            blen,
            bdone: 0,
            kind,
            stat: BlockState::Free,
        }
    }

    /// A data-less marker block (`None` placeholder or `Link` wrap).
    pub fn marker(kind: BlockKind) -> Self {
        Self::new(kind, Vec::new())
    }
}

/// A standard USB SETUP packet.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn parse(bytes: [u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Bit 7 of `bmRequestType`: device-to-host.
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

impl fmt::Debug for SetupPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupPacket")
            .field("request_type", &format_args!("{:#04x}", self.request_type))
            .field("request", &format_args!("{:#04x}", self.request))
            .field("value", &format_args!("{:#06x}", self.value))
            .field("index", &format_args!("{:#06x}", self.index))
            .field("length", &self.length)
            .finish()
    }
}

/// Bookkeeping for one in-flight request, stored at the request's `blk_head`
/// slot. The request itself is owned by the transport completion callback;
/// only the sequence number (slot identity) and the cancellation handle live
/// here.
pub(crate) struct InflightReq {
    pub(crate) seq: u32,
    pub(crate) handle: Option<Arc<dyn TransferHandle>>,
}

/// Advance a ring index by one, honoring wrap-around.
pub fn index_inc(idx: usize, cap: usize) -> usize {
    if idx + 1 >= cap {
        0
    } else {
        idx + 1
    }
}

/// Whether `idx` falls inside the half-open ring span `[head, tail)`.
pub fn index_valid(head: usize, tail: usize, cap: usize, idx: usize) -> bool {
    if head <= tail {
        idx >= head && idx < tail
    } else {
        (idx >= head && idx < cap) || idx < tail
    }
}

/// A transfer-control structure: a circular ring of blocks with cursors, the
/// endpoint id, a completion status, and a parallel ring of in-flight request
/// slots keyed by each request's first block index.
pub struct Xfer {
    pub data: Vec<Block>,
    /// Index of the first live block.
    pub head: usize,
    /// One past the last live block.
    pub tail: usize,
    /// Number of live blocks in `[head, tail)`, placeholders included.
    pub ndata: usize,
    /// Endpoint id in the host-controller DCI convention
    /// (`number * 2 + direction`), as assigned by the front-end.
    pub epid: u8,
    pub status: XferStatus,
    /// SETUP packet for control transfers; `None` for data endpoints.
    pub setup: Option<SetupPacket>,
    /// Opaque front-end tag (e.g. a slot id) echoed through completion
    /// logging; the core never interprets it.
    pub tag: u64,
    pub(crate) reqs: Vec<Option<InflightReq>>,
}

impl Xfer {
    /// Create an empty ring with a fixed capacity of `max_blk_cnt` blocks.
    pub fn new(max_blk_cnt: usize) -> Self {
        Self {
            data: (0..max_blk_cnt).map(|_| Block::default()).collect(),
            head: 0,
            tail: 0,
            ndata: 0,
            epid: 0,
            status: XferStatus::Normal,
            setup: None,
            tag: 0,
            reqs: (0..max_blk_cnt).map(|_| None).collect(),
        }
    }

    pub fn max_blk_cnt(&self) -> usize {
        self.data.len()
    }

    /// Append a block at the tail cursor.
    pub fn enqueue(&mut self, block: Block) {
        let cap = self.max_blk_cnt();
        self.data[self.tail] = block;
        self.tail = index_inc(self.tail, cap);
        self.ndata += 1;
    }

    /// Number of requests currently in flight on this ring.
    pub fn inflight(&self) -> usize {
        self.reqs.iter().filter(|r| r.is_some()).count()
    }

    /// Ask the transport to cancel every in-flight request of this ring.
    ///
    /// Cancellation is asynchronous: each cancelled transfer still flows
    /// through the completion callback (with a cancelled status), which
    /// releases its resources and clears its slot.
    pub fn cancel_requests(&mut self) {
        for slot in self.reqs.iter().flatten() {
            if let Some(handle) = &slot.handle {
                handle.cancel();
            }
        }
    }

    pub(crate) fn set_req(&mut self, idx: usize, req: InflightReq) {
        self.reqs[idx] = Some(req);
    }

    /// Attach the cancellation handle to the slot at `idx`, unless the
    /// request already completed (slot cleared or reused by a later seq).
    pub(crate) fn attach_handle(&mut self, idx: usize, seq: u32, handle: Arc<dyn TransferHandle>) {
        if let Some(slot) = self.reqs[idx].as_mut() {
            if slot.seq == seq {
                slot.handle = Some(handle);
            }
        }
    }

    /// Clear the slot at `idx` if it still belongs to request `seq`.
    pub(crate) fn clear_req(&mut self, idx: usize, seq: u32) {
        if let Some(slot) = &self.reqs[idx] {
            if slot.seq == seq {
                self.reqs[idx] = None;
            }
        }
    }

    pub(crate) fn req_seq(&self, idx: usize) -> Option<u32> {
        self.reqs[idx].as_ref().map(|r| r.seq)
    }
}
