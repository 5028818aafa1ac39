use std::sync::atomic::{AtomicU32, Ordering, fence};

use tandem_wire::{HEADER_BYTES, MsgHeader};

pub const BLOCK_BYTES: usize = 64;

#[repr(C, align(64))]
#[derive(Clone, Copy, Default)]
struct Block {
    header: MsgHeader,
    _pad: [u8; BLOCK_BYTES - HEADER_BYTES],
}

/// write_idx, the writer's cached view of read_idx, and the published
/// write_idx_atom all live on the writer's cache line.
#[repr(C, align(128))]
#[derive(Default)]
struct WriterCursor {
    write_idx: u32,
    write_idx_atom: AtomicU32,
    read_idx_cache: u32,
}

/// The reader's published index, kept 128 bytes away from the writer's
/// cursor so writer and reader never contend on the same cache line.
#[repr(C, align(128))]
#[derive(Default)]
struct ReaderCursor {
    read_idx: AtomicU32,
}

/// Lock-free variable-size SPSC queue of `BLK_CNT` 64-byte blocks (`BLK_CNT`
/// must be a power of two). One writer thread calls `alloc`/`push`; one
/// reader thread (possibly a different process, mapped over the same shared
/// memory file) calls `front`/`pop`. No other synchronisation is needed.
#[repr(C)]
#[derive(Default)]
pub struct SpscQueue<const BLK_CNT: usize> {
    blk: [Block; BLK_CNT],
    writer: WriterCursor,
    reader: ReaderCursor,
}

impl<const BLK_CNT: usize> SpscQueue<BLK_CNT> {
    #[allow(clippy::assertions_on_constants)]
    const LAYOUT_CHECK: () = assert!(
        BLK_CNT != 0 && BLK_CNT & (BLK_CNT - 1) == 0,
        "SpscQueue block count must be a power of two"
    );

    pub fn new() -> Self {
        let () = Self::LAYOUT_CHECK;
        Self::default()
    }

    /// Reserves blocks for a frame carrying `payload_bytes` of payload.
    /// Returns `None` if the reader hasn't caught up enough to free room —
    /// callers must back off and retry, not block.
    pub fn alloc(&mut self, payload_bytes: u16) -> Option<&mut MsgHeader> {
        let blk_cnt = BLK_CNT as u32;
        let size = payload_bytes.checked_add(HEADER_BYTES as u16)?;
        let blk_sz = (u32::from(size) + BLOCK_BYTES as u32 - 1) / BLOCK_BYTES as u32;
        let padding_sz = blk_cnt - (self.writer.write_idx % blk_cnt);
        let rewind = blk_sz > padding_sz;
        let min_read_idx = self
            .writer
            .write_idx
            .wrapping_add(blk_sz)
            .wrapping_add(if rewind { padding_sz } else { 0 })
            .wrapping_sub(blk_cnt);

        if (self.writer.read_idx_cache.wrapping_sub(min_read_idx) as i32) < 0 {
            self.writer.read_idx_cache = self.reader.read_idx.load(Ordering::Acquire);
            if (self.writer.read_idx_cache.wrapping_sub(min_read_idx) as i32) < 0 {
                return None;
            }
        }

        if rewind {
            self.blk[(self.writer.write_idx % blk_cnt) as usize].header.size = 0;
            fence(Ordering::Release);
            self.writer.write_idx = self.writer.write_idx.wrapping_add(padding_sz);
        }

        let idx = (self.writer.write_idx % blk_cnt) as usize;
        let header = &mut self.blk[idx].header;
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
        // SAFETY: header_ptr points at the block `alloc` just reserved; each
        // `Block` is HEADER_BYTES + padding wide and payload_bytes was
        // reserved for by `alloc`'s blk_sz computation.
        let payload_ptr = unsafe { header_ptr.add(HEADER_BYTES) };
        Some(unsafe { std::slice::from_raw_parts_mut(payload_ptr, payload_bytes as usize) })
    }

    /// Publishes the frame most recently returned by `alloc` to the reader.
    pub fn push(&mut self) {
        fence(Ordering::Release);
        let blk_cnt = BLK_CNT as u32;
        let idx = (self.writer.write_idx % blk_cnt) as usize;
        let blk_sz = (u32::from(self.blk[idx].header.size) + BLOCK_BYTES as u32 - 1)
            / BLOCK_BYTES as u32;
        self.writer.write_idx = self.writer.write_idx.wrapping_add(blk_sz);
        self.writer.write_idx_atom.store(self.writer.write_idx, Ordering::Release);
    }

    /// Returns the oldest unread frame without consuming it, skipping over
    /// rewind sentinels transparently. `None` if the queue is empty.
    pub fn front(&self) -> Option<&MsgHeader> {
        let blk_cnt = BLK_CNT as u32;
        let curr_write_idx = self.writer.write_idx_atom.load(Ordering::Acquire);
        let mut curr_read_idx = self.reader.read_idx.load(Ordering::Relaxed);
        if curr_read_idx == curr_write_idx {
            return None;
        }

        let idx = (curr_read_idx % blk_cnt) as usize;
        if self.blk[idx].header.size == 0 {
            curr_read_idx = curr_read_idx.wrapping_add(blk_cnt - (curr_read_idx % blk_cnt));
            self.reader.read_idx.store(curr_read_idx, Ordering::Relaxed);
            if curr_read_idx == curr_write_idx {
                return None;
            }
        }

        Some(&self.blk[(curr_read_idx % blk_cnt) as usize].header)
    }

    /// Like `front`, but also returns the payload bytes following the header.
    pub fn front_payload(&self) -> Option<(&MsgHeader, &[u8])> {
        let header = self.front()?;
        let payload_len = header.size as usize - HEADER_BYTES;
        let header_ptr: *const u8 = (header as *const MsgHeader).cast();
        // SAFETY: header is a live frame within `blk`; its payload occupies
        // the `payload_len` bytes immediately following the header, reserved
        // at alloc time and never mutated after push.
        let payload_ptr = unsafe { header_ptr.add(HEADER_BYTES) };
        let payload = unsafe { std::slice::from_raw_parts(payload_ptr, payload_len) };
        Some((header, payload))
    }

    /// Consumes the frame last returned by `front`.
    pub fn pop(&self) {
        let blk_cnt = BLK_CNT as u32;
        let curr_read_idx = self.reader.read_idx.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        let idx = (curr_read_idx % blk_cnt) as usize;
        let blk_sz = (u32::from(self.blk[idx].header.size) + BLOCK_BYTES as u32 - 1)
            / BLOCK_BYTES as u32;
        self.reader.read_idx.store(curr_read_idx.wrapping_add(blk_sz), Ordering::Release);
    }
}

// SAFETY: writer fields and reader fields are disjoint cache lines touched
// by exactly one side each, synchronised through the acquire/release pairs
// on `write_idx_atom`/`read_idx`.
unsafe impl<const BLK_CNT: usize> Sync for SpscQueue<BLK_CNT> {}
