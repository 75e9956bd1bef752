//! Multi-buffer reassembly
//!
//! A raw frame longer than one receive buffer arrives as a run of buffers:
//! the first carries the start flag, the last the end flag. Each buffer
//! holds its own TLV region followed by up to [`RX_BUFFER_PAYLOAD`] bytes of
//! payload. [`sg_create`] turns such a run into one logical packet: the
//! first buffer becomes the parent and the others hang off its extension
//! chain.

use super::buffer::{PacketList, RxBuffer};
use super::tlv::{RX_BUFFER_PAYLOAD, RX_PKT_TLVS_LEN};

/// Build one logical packet of `msdu_len` payload bytes starting at `head`
///
/// `head` must be the first buffer of its MSDU. Continuation buffers are
/// popped from the front of `rest` until `msdu_len` is reached. On failure
/// the partially built unit is returned in `Err` so the caller can free
/// it; a buffer that starts a new MSDU is left on `rest`.
pub fn sg_create(
    mut head: RxBuffer,
    msdu_len: usize,
    rest: &mut PacketList,
) -> Result<RxBuffer, RxBuffer> {
    if !head.cb.msdu_start {
        return Err(head);
    }

    if head.cb.chfrag_start && head.cb.chfrag_end {
        if !trim(&mut head, msdu_len) {
            return Err(head);
        }
        return Ok(head);
    }

    let first = msdu_len.min(RX_BUFFER_PAYLOAD);
    if !trim(&mut head, first) {
        return Err(head);
    }
    let mut remaining = msdu_len - first;
    let mut more = head.cb.chfrag_cont;

    while remaining > 0 {
        if !more {
            // Device ended the MSDU before the declared length was reached
            return Err(head);
        }
        let Some(mut next) = rest.pop_front() else {
            return Err(head);
        };
        if next.cb.msdu_start {
            rest.push_front(next);
            return Err(head);
        }

        let take = remaining.min(RX_BUFFER_PAYLOAD);
        if !trim(&mut next, take) {
            head.push_ext(next);
            return Err(head);
        }
        remaining -= take;
        more = next.cb.chfrag_cont;
        head.push_ext(next);
    }

    Ok(head)
}

/// Keep `payload` bytes after the TLV region and strip the TLV
fn trim(buf: &mut RxBuffer, payload: usize) -> bool {
    if payload + RX_PKT_TLVS_LEN > buf.tailroom() {
        return false;
    }
    buf.set_len(payload + RX_PKT_TLVS_LEN);
    buf.pull_head(RX_PKT_TLVS_LEN);
    true
}
