use tandem_utils::safe_assert;
use tandem_wire::{HEADER_BYTES, MsgHeader, WireEndian};

const HDR: u32 = HEADER_BYTES as u32;

/// File-backed, single-writer queue of 8-byte slots holding frame headers and
/// payloads packed contiguously.
///
/// `BLK_CNT` is the slot count (not byte count): callers choosing a buffer
/// size in bytes divide by `HEADER_BYTES` themselves. Meant to be mapped over
/// a file via [`crate::persist::MapPod`] so cursors and stored frames both
/// survive a crash and are recovered by [`PtcpQueue::sanity_check`] on the
/// next process start.
#[repr(C)]
#[derive(Default)]
pub struct PtcpQueue<const BLK_CNT: usize, const TO_LITTLE: bool> {
    blk: [MsgHeader; BLK_CNT],
    /// invariant: read_idx <= send_idx <= write_idx; send_idx may point into
    /// the middle of a frame.
    write_idx: u32,
    read_idx: u32,
    send_idx: u32,
    /// seq_num of the frame read_idx points to.
    read_seq_num: u32,
    ack_seq_num: u32,
}

impl<const BLK_CNT: usize, const TO_LITTLE: bool> PtcpQueue<BLK_CNT, TO_LITTLE> {
    /// Reserves slots for a frame carrying `payload_bytes` of payload and
    /// returns its header for the caller to fill in (at minimum `msg_type`).
    /// Returns `None` if there isn't room even after compacting.
    pub fn alloc(&mut self, payload_bytes: u16) -> Option<&mut MsgHeader> {
        let size = payload_bytes.checked_add(HEADER_BYTES as u16)?;
        let blk_sz = (u32::from(size) + HDR - 1) / HDR;
        let blk_cnt = BLK_CNT as u32;
        let avail_sz = blk_cnt - self.write_idx;
        if blk_sz > avail_sz {
            if blk_sz > avail_sz + self.read_idx {
                return None;
            }
            self.blk.copy_within(self.read_idx as usize..self.write_idx as usize, 0);
            self.write_idx -= self.read_idx;
            self.send_idx -= self.read_idx;
            self.read_idx = 0;
        }
        let header = &mut self.blk[self.write_idx as usize];
        header.size = size;
        Some(header)
    }

    /// Combines `alloc` with writing the message type and returns the
    /// payload bytes (excluding the header) for the caller to fill in.
    /// `push` still has to be called afterwards to publish the frame.
    pub fn alloc_payload(&mut self, payload_bytes: u16, msg_type: u16) -> Option<&mut [u8]> {
        let header = self.alloc(payload_bytes)?;
        header.msg_type = msg_type;
        let header_ptr: *mut u8 = (header as *mut MsgHeader).cast();
        // SAFETY: header_ptr points at the slot `alloc` just reserved inside
        // `blk`, which is a contiguous byte array (MsgHeader is repr(C) with
        // no padding); `alloc` reserved enough slots to hold HEADER_BYTES +
        // payload_bytes starting at this address.
        let payload_ptr = unsafe { header_ptr.add(HEADER_BYTES) };
        Some(unsafe { std::slice::from_raw_parts_mut(payload_ptr, payload_bytes as usize) })
    }

    /// Publishes the frame most recently returned by `alloc`, stamping the
    /// current ack and converting the header to wire byte order.
    pub fn push(&mut self) {
        let header = &mut self.blk[self.write_idx as usize];
        let blk_sz = (u32::from(header.size) + HDR - 1) / HDR;
        header.ack_seq = self.ack_seq_num;
        header.convert_byte_order::<TO_LITTLE>();
        self.write_idx += blk_sz;
    }

    /// The not-yet-transmitted byte range `[send_idx, write_idx)`, plus its
    /// length in blocks for a matching `sendout` call.
    pub fn get_sendable(&self) -> (&[u8], u32) {
        let blk_sz = self.write_idx - self.send_idx;
        let start = self.send_idx as usize * HEADER_BYTES;
        let len = blk_sz as usize * HEADER_BYTES;
        let base: *const u8 = self.blk.as_ptr().cast();
        // SAFETY: MsgHeader is repr(C) with no padding (u16+u16+u32), so
        // `blk` is a contiguous byte array of BLK_CNT * HEADER_BYTES bytes;
        // [start, start+len) falls within [send_idx, write_idx) <= BLK_CNT.
        let bytes = unsafe { std::slice::from_raw_parts(base.add(start), len) };
        (bytes, blk_sz)
    }

    /// Advances the transmission cursor after `blk_sz` blocks were actually
    /// written out. Never passes `write_idx`.
    pub fn sendout(&mut self, blk_sz: u32) {
        self.send_idx += blk_sz;
        safe_assert!(self.send_idx <= self.write_idx, "sendout overran write_idx");
    }

    /// Reconciles after a reconnect: acks up to `ack_seq`, then rewinds the
    /// send cursor so anything the peer didn't acknowledge is retransmitted.
    pub fn login_ack(&mut self, ack_seq: u32) {
        self.ack(ack_seq);
        self.send_idx = self.read_idx;
    }

    /// Pops stored frames from `read_idx` until `read_seq_num == ack_seq`.
    /// Acks not newer than what's already been acked are ignored.
    pub fn ack(&mut self, ack_seq: u32) {
        if (ack_seq.wrapping_sub(self.read_seq_num) as i32) <= 0 {
            return;
        }
        loop {
            let size = self.blk[self.read_idx as usize].size.from_wire::<TO_LITTLE>();
            self.read_idx += (u32::from(size) + HDR - 1) / HDR;
            self.read_seq_num = self.read_seq_num.wrapping_add(1);
            if self.read_seq_num == ack_seq {
                break;
            }
        }
        if self.read_idx == self.write_idx {
            self.read_idx = 0;
            self.write_idx = 0;
            self.send_idx = 0;
        }
    }

    /// The cumulative ack we'll stamp into the next outgoing frame; i.e. the
    /// next sequence number we expect from the peer.
    pub fn my_ack(&mut self) -> &mut u32 {
        &mut self.ack_seq_num
    }

    /// Walks stored frames after a reconnect, verifying each one's stamped
    /// `ack_seq` doesn't claim to have received more than we've sent, and
    /// that frames pack exactly up to `write_idx`. On success, returns the
    /// `[seq_start, seq_end)` range of sequence numbers we claim to have sent.
    pub fn sanity_check(&self) -> Result<(u32, u32), crate::error::SanityCheckError> {
        use crate::error::SanityCheckError;

        let mut end = self.read_seq_num;
        let mut idx = self.read_idx;
        while idx < self.write_idx {
            let header = self.blk[idx as usize].from_wire::<TO_LITTLE>();
            if (self.ack_seq_num.wrapping_sub(header.ack_seq) as i32) < 0 {
                return Err(SanityCheckError::AckTooNew);
            }
            idx += (u32::from(header.size) + HDR - 1) / HDR;
            end += 1;
        }
        if idx != self.write_idx {
            return Err(SanityCheckError::Misaligned);
        }
        Ok((self.read_seq_num, end))
    }

    pub fn read_idx(&self) -> u32 {
        self.read_idx
    }

    pub fn send_idx(&self) -> u32 {
        self.send_idx
    }

    pub fn write_idx(&self) -> u32 {
        self.write_idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Q = PtcpQueue<128, true>;

    fn alloc_push(q: &mut Q, payload_len: u16, msg_type: u16) {
        let header = q.alloc(payload_len).expect("room for frame");
        header.msg_type = msg_type;
        q.push();
    }

    #[test]
    fn invariant_read_le_send_le_write() {
        let mut q = Q::default();
        for i in 0..5u16 {
            alloc_push(&mut q, 56, i + 1);
        }
        assert!(q.read_idx() <= q.send_idx());
        assert!(q.send_idx() <= q.write_idx());
    }

    #[test]
    fn ack_ignores_stale_acks_and_reclaims_on_full_drain() {
        let mut q = Q::default();
        for i in 0..3u16 {
            alloc_push(&mut q, 8, i + 1);
        }
        let write_idx = q.write_idx();
        q.ack(0); // stale, no-op
        assert_eq!(q.read_idx(), 0);
        q.ack(3);
        assert_eq!(q.read_idx(), write_idx);
        // fully drained: cursors reset
        assert_eq!(q.read_idx(), 0);
        assert_eq!(q.write_idx(), 0);
        assert_eq!(q.send_idx(), 0);
    }

    #[test]
    fn alloc_payload_exposes_writable_bytes() {
        let mut q = Q::default();
        {
            let payload = q.alloc_payload(4, 7).expect("room for frame");
            payload.copy_from_slice(&42u32.to_ne_bytes());
        }
        q.push();
        let (bytes, blk_sz) = q.get_sendable();
        assert_eq!(blk_sz, 2);
        assert_eq!(&bytes[HEADER_BYTES..], &42u32.to_ne_bytes());
    }

    #[test]
    fn compaction_frees_room_for_a_new_frame() {
        // 128 slots, 9 slots/frame (64-byte payload -> 72 bytes -> 9 blocks).
        let mut q = Q::default();
        for i in 0..14u16 {
            alloc_push(&mut q, 64, i + 1);
        }
        // 14 * 9 = 126 <= 128, a 15th frame (9 more slots) doesn't fit untouched.
        assert!(q.alloc(64).is_none() || q.write_idx() + 9 > 128);

        // ack the first 8 frames, freeing 72 slots at the front.
        for seq in 1..=8u32 {
            q.ack(seq);
        }
        let before = q.write_idx() - q.read_idx();
        let header = q.alloc(64).expect("compaction frees enough room");
        header.msg_type = 99;
        q.push();
        assert_eq!(q.write_idx() - q.read_idx(), before + 9);
        assert!(q.read_idx() <= q.send_idx() && q.send_idx() <= q.write_idx());
    }

    #[test]
    fn sanity_check_accepts_freshly_pushed_frames() {
        let mut q = Q::default();
        for i in 0..4u16 {
            alloc_push(&mut q, 8, i + 1);
        }
        let (start, end) = q.sanity_check().unwrap();
        assert_eq!(start, 0);
        assert_eq!(end, 4);
    }

    #[test]
    fn sanity_check_rejects_ack_claiming_future_receipt() {
        let mut q = Q::default();
        alloc_push(&mut q, 8, 1);
        *q.my_ack() = 0;
        // forge a stored frame that claims we already acked seq 5, which we never received
        q.blk[0].ack_seq = 5;
        assert!(q.sanity_check().is_err());
    }
}
