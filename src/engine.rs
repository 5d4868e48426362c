//! Data transfer engine.
//!
//! Converts a block ring into one asynchronous bulk, interrupt or isochronous
//! transfer: live blocks are marked handling and their payload linearized into
//! a single request buffer, isochronous spans are framed from the `Part`/`Full`
//! block structure, and the transfer is submitted without a timeout. The
//! completion handler runs on the dispatcher thread; it scatters received
//! bytes back into the originating blocks under the endpoint lock (the ring's
//! mutex) and notifies the front-end.

use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error};

use crate::device::PassthroughDevice;
use crate::endpoint::{maxp_mult, maxp_size, Dir, EpType};
use crate::transport::{Completion, TransferKind, TransferRequest, TransferStatus};
use crate::xfer::{index_inc, index_valid, BlockKind, BlockState, InflightReq, Xfer, XferStatus};

/// One in-flight request: the linearized payload span `[blk_head, blk_tail)`
/// of its ring. Owned by the transport completion callback once submitted; the
/// device is held weakly (it outlives its requests by contract, but detach
/// during unplug must not cycle).
struct Request {
    seq: u32,
    pid: Dir,
    blk_head: usize,
    blk_tail: usize,
    buf_size: usize,
    xfer: Arc<Mutex<Xfer>>,
    device: Weak<PassthroughDevice>,
}

pub(crate) fn submit_data(
    dev: &Arc<PassthroughDevice>,
    xfer_arc: &Arc<Mutex<Xfer>>,
    dir: Dir,
    epctx: u8,
) -> XferStatus {
    let mut xfer = xfer_arc.lock().unwrap();
    xfer.status = XferStatus::Normal;

    let Some((size, head, tail)) = prepare_blocks(&mut xfer) else {
        return xfer.status;
    };

    let kind = match dev.ep_type(dir, epctx) {
        EpType::Bulk => TransferKind::Bulk,
        EpType::Interrupt => TransferKind::Interrupt,
        EpType::Isoc => TransferKind::Isochronous,
        EpType::Control => {
            xfer.status = XferStatus::Invalid;
            return xfer.status;
        }
        EpType::Invalid => {
            xfer.status = XferStatus::IoError;
            return xfer.status;
        }
    };

    let epid = match dir {
        Dir::In => 0x80 | epctx,
        Dir::Out => epctx,
    };
    let cap = xfer.max_blk_cnt();

    let mut iso_packet_lengths = Vec::new();
    if kind == TransferKind::Isochronous {
        let maxp = dev.ep_maxp(dir, epctx);
        let framelen = maxp_size(maxp) * (1 + maxp_mult(maxp));
        debug!(maxp, framelen, "isochronous framing");

        // One frame is any run of `Part` blocks closed by a single `Full`.
        let mut frame_len = 0u32;
        let mut idx = head;
        while index_valid(head, tail, cap, idx) {
            let blk = &xfer.data[idx];
            match blk.kind {
                BlockKind::None => {}
                BlockKind::Part => {
                    if blk.blen > framelen {
                        // Non-conforming devices exist; submission proceeds.
                        error!(blen = blk.blen, framelen, "oversized isochronous block");
                    }
                    frame_len += blk.blen;
                }
                BlockKind::Full => {
                    if blk.blen > framelen {
                        error!(blen = blk.blen, framelen, "oversized isochronous block");
                    }
                    iso_packet_lengths.push(frame_len + blk.blen);
                    frame_len = 0;
                }
                BlockKind::Link => {
                    error!("unexpected link block in isochronous span");
                }
            }
            idx = index_inc(idx, cap);
        }
        debug!(framecnt = iso_packet_lengths.len(), "isochronous frames");
    }

    let mut buffer = vec![0u8; size];
    if dir == Dir::Out {
        let mut off = 0usize;
        let mut idx = head;
        while index_valid(head, tail, cap, idx) {
            let blk = &xfer.data[idx];
            if matches!(blk.kind, BlockKind::Part | BlockKind::Full) {
                let n = blk.blen as usize;
                buffer[off..off + n].copy_from_slice(&blk.buf[..n]);
                off += n;
            }
            idx = index_inc(idx, cap);
        }
    }

    let seq = dev.shared().next_seq();
    xfer.set_req(head, InflightReq { seq, handle: None });
    debug!(
        path = %dev.path(),
        seq,
        epctx,
        ?dir,
        ?kind,
        size,
        blk_head = head,
        blk_tail = tail,
        ndata = xfer.ndata,
        "submit transfer"
    );

    let req = Request {
        seq,
        pid: dir,
        blk_head: head,
        blk_tail: tail,
        buf_size: size,
        xfer: Arc::clone(xfer_arc),
        device: Arc::downgrade(dev),
    };

    // The submit itself runs without the endpoint lock; a completion of an
    // earlier request on this ring may interleave here.
    drop(xfer);
    let submitted = dev.handle().submit(
        TransferRequest {
            kind,
            epid,
            buffer,
            iso_packet_lengths,
        },
        Box::new(move |completion| complete(req, completion)),
    );

    let mut xfer = xfer_arc.lock().unwrap();
    match submitted {
        Ok(handle) => {
            xfer.attach_handle(head, seq, handle);
            xfer.status
        }
        Err(err) => {
            debug!(path = %dev.path(), seq, %err, "transfer submission failed");
            // Roll back: free the slot and return the span to its pre-submit
            // state so the ring can be retried.
            xfer.clear_req(head, seq);
            let mut idx = head;
            while index_valid(head, tail, cap, idx) {
                let blk = &mut xfer.data[idx];
                if blk.stat == BlockState::Handling {
                    blk.stat = BlockState::Free;
                }
                idx = index_inc(idx, cap);
            }
            xfer.status = XferStatus::IoError;
            xfer.status
        }
    }
}

/// Walk the live span of the ring, marking data blocks handling and
/// placeholders handled. Returns the accumulated payload size, the first
/// unhandled index (the request's `blk_head`) and the ring tail, or `None`
/// when there is nothing to submit.
fn prepare_blocks(xfer: &mut Xfer) -> Option<(usize, usize, usize)> {
    let cap = xfer.max_blk_cnt();
    let mut idx = xfer.head;
    if idx >= cap {
        return None;
    }

    let mut first = None;
    let mut size = 0usize;
    for _ in 0..xfer.ndata {
        let cur = idx;
        idx = index_inc(idx, cap);

        let blk = &mut xfer.data[cur];
        if matches!(blk.stat, BlockState::Handled | BlockState::Handling) {
            continue;
        }
        if first.is_none() {
            first = Some(cur);
        }
        match blk.kind {
            BlockKind::Part | BlockKind::Full => {
                size += blk.blen as usize;
                blk.stat = BlockState::Handling;
            }
            BlockKind::None => {
                blk.stat = BlockState::Handled;
            }
            BlockKind::Link => {
                error!(kind = ?blk.kind, "unexpected block kind in transfer span");
            }
        }
    }

    let first = first?;
    if size == 0 {
        return None;
    }
    Some((size, first, xfer.tail))
}

/// Completion handler, invoked on the dispatcher thread.
fn complete(req: Request, completion: Completion) {
    let Some(dev) = req.device.upgrade() else {
        // Device already detached; just release the slot.
        let mut xfer = req.xfer.lock().unwrap();
        xfer.clear_req(req.blk_head, req.seq);
        return;
    };

    let path = dev.path();
    let mut xfer = req.xfer.lock().unwrap();
    let cap = xfer.max_blk_cnt();

    debug!(
        %path,
        seq = req.seq,
        epid = xfer.epid,
        actual = completion.actual_length,
        blk_head = req.blk_head,
        blk_tail = req.blk_tail,
        buf_size = req.buf_size,
        status = ?completion.status,
        "transfer complete"
    );

    let mut stalled = false;
    let mut scatter = false;
    let mut notify = true;
    match completion.status {
        TransferStatus::Stall => {
            xfer.status = XferStatus::Stalled;
            stalled = true;
        }
        TransferStatus::NoDevice => {
            // The device was unplugged mid-flight; the disconnect callback
            // drives the unplug path. Short-transfer avoids spurious warnings.
            xfer.status = XferStatus::ShortXfer;
        }
        TransferStatus::Error => {
            if dev.shared().stack.device_present(&path) {
                xfer.status = XferStatus::Stalled;
                stalled = true;
            } else {
                // Error caused by disconnection: treat as a cancel.
                xfer.status = XferStatus::IoError;
                notify = false;
            }
        }
        TransferStatus::Cancelled => {
            xfer.status = XferStatus::IoError;
            notify = false;
        }
        TransferStatus::TimedOut => {
            xfer.status = XferStatus::Timeout;
        }
        TransferStatus::Overflow => {
            xfer.status = XferStatus::BadBufSize;
        }
        TransferStatus::Completed => {
            xfer.status = XferStatus::Normal;
            scatter = true;
        }
    }

    if scatter {
        scatter_blocks(&mut xfer, &req, &completion);
    }
    if stalled {
        let mut idx = req.blk_head;
        while index_valid(req.blk_head, req.blk_tail, cap, idx) {
            xfer.data[idx].stat = BlockState::Handled;
            idx = index_inc(idx, cap);
        }
    }

    if notify {
        let callbacks = Arc::clone(&dev.shared().callbacks);
        if callbacks.on_transfer_done(&mut xfer) {
            callbacks.raise_interrupt();
        }
    }

    xfer.clear_req(req.blk_head, req.seq);
}

/// Scatter the received bytes back into the request's blocks.
///
/// Non-isochronous transfers consume `actual_length` linearly across the
/// span. Isochronous transfers restart at each frame boundary: the buffer
/// base and remaining count come from the current packet descriptor, and a
/// block group (a `Part` run closed by one non-`Part` block) consumes one
/// frame. `Link` blocks rewind the frame index, consuming none.
fn scatter_blocks(xfer: &mut Xfer, req: &Request, completion: &Completion) {
    let cap = xfer.max_blk_cnt();
    let is_iso = !completion.iso_packets.is_empty();

    // Byte offset of each iso packet's payload within the linear buffer.
    let mut offsets = Vec::with_capacity(completion.iso_packets.len());
    let mut off = 0usize;
    for (i, pkt) in completion.iso_packets.iter().enumerate() {
        debug!(frame = i, length = pkt.length, actual = pkt.actual, "iso frame");
        offsets.push(off);
        off += pkt.length as usize;
    }

    let mut iso_idx = 0usize;
    let mut done = completion.actual_length as u32;
    let mut base = 0usize;
    let mut buf_idx = 0usize;

    let mut idx = req.blk_head;
    while index_valid(req.blk_head, req.blk_tail, cap, idx) {
        if is_iso {
            let Some(pkt) = completion.iso_packets.get(iso_idx) else {
                break;
            };
            base = offsets[iso_idx];
            buf_idx = 0;
            done = pkt.actual;
            iso_idx += 1;
        }
        loop {
            let blk = &mut xfer.data[idx];
            if blk.stat == BlockState::Free && blk.kind != BlockKind::None {
                error!(seq = req.seq, "free block inside request span");
            }

            let d = done.min(blk.blen) as usize;
            match blk.kind {
                BlockKind::Part | BlockKind::Full => {
                    if req.pid == Dir::In {
                        let src = base + buf_idx;
                        blk.buf[..d].copy_from_slice(&completion.buffer[src..src + d]);
                        buf_idx += d;
                    }
                }
                _ => {
                    // A link block does not consume an iso frame.
                    iso_idx = iso_idx.saturating_sub(1);
                }
            }

            done -= d as u32;
            blk.blen -= d as u32;
            blk.bdone = d as u32;
            blk.stat = BlockState::Handled;

            let kind = blk.kind;
            idx = index_inc(idx, cap);
            if kind != BlockKind::Part {
                break;
            }
        }
    }
}
