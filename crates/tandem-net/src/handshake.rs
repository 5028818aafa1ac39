//! Raw frame read/write helpers used before a [`crate::connection::Connection`]
//! exists: the client's synchronous `Connect` and the server's control-thread
//! login dispatch both speak one frame (header + payload) at a time over a
//! bare socket, ahead of the PTCP/SHM machinery taking over.

use std::io::{self, Read, Write};

use tandem_wire::{HEADER_BYTES, MsgHeader, WireEndian};

/// Blocking write of one frame: `size`/`ack_seq` are computed here, the
/// caller only supplies `msg_type` and the payload bytes.
pub fn write_frame_blocking<W: Write, const TO_LITTLE: bool>(
    stream: &mut W,
    msg_type: u16,
    payload: &[u8],
) -> io::Result<()> {
    let size = (HEADER_BYTES + payload.len()) as u16;
    let header = MsgHeader { size, msg_type, ack_seq: 0 }.from_wire::<TO_LITTLE>();
    let mut header_bytes = [0u8; HEADER_BYTES];
    // SAFETY: header_bytes is HEADER_BYTES long and MsgHeader is repr(C) with
    // no padding, so it's exactly HEADER_BYTES bytes wide.
    unsafe { header.write_to(header_bytes.as_mut_ptr()) };
    stream.write_all(&header_bytes)?;
    stream.write_all(payload)
}

/// Blocking read of one frame. `max_size` bounds the payload the same way
/// `TcpRecvBufMaxSize` bounds steady-state reads.
pub fn read_frame_blocking<R: Read, const TO_LITTLE: bool>(
    stream: &mut R,
    max_size: usize,
) -> io::Result<(MsgHeader, Vec<u8>)> {
    let mut header_bytes = [0u8; HEADER_BYTES];
    stream.read_exact(&mut header_bytes)?;
    // SAFETY: header_bytes holds exactly HEADER_BYTES freshly-read bytes.
    let header = unsafe { MsgHeader::read_from(header_bytes.as_ptr()) }.from_wire::<TO_LITTLE>();
    let size = header.size as usize;
    if size < HEADER_BYTES || size > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame size {size} outside [{HEADER_BYTES}, {max_size}]"),
        ));
    }
    let mut payload = vec![0u8; size - HEADER_BYTES];
    stream.read_exact(&mut payload)?;
    Ok((header, payload))
}

/// Assembles one frame at a time from a non-blocking stream across however
/// many `try_read` calls it takes, used by the server's control thread to
/// juggle many pending logins concurrently without blocking any of them.
pub struct FrameAssembler {
    header_buf: [u8; HEADER_BYTES],
    header_have: usize,
    payload: Vec<u8>,
    payload_have: usize,
    max_size: usize,
}

impl FrameAssembler {
    pub fn new(max_size: usize) -> Self {
        Self {
            header_buf: [0; HEADER_BYTES],
            header_have: 0,
            payload: Vec::new(),
            payload_have: 0,
            max_size,
        }
    }

    /// Returns `Ok(Some(frame))` once a full frame has been read, `Ok(None)`
    /// if the read would block or more is still needed, `Err` on a fatal
    /// socket error or peer close.
    pub fn try_read<R: Read, const TO_LITTLE: bool>(
        &mut self,
        stream: &mut R,
    ) -> io::Result<Option<(MsgHeader, Vec<u8>)>> {
        if self.header_have < HEADER_BYTES {
            match stream.read(&mut self.header_buf[self.header_have..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                Ok(n) => self.header_have += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
            if self.header_have < HEADER_BYTES {
                return Ok(None);
            }
            // SAFETY: header_buf now holds exactly HEADER_BYTES bytes.
            let header =
                unsafe { MsgHeader::read_from(self.header_buf.as_ptr()) }.from_wire::<TO_LITTLE>();
            let size = header.size as usize;
            if size < HEADER_BYTES || size > self.max_size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame size {size} outside [{HEADER_BYTES}, {}]", self.max_size),
                ));
            }
            self.payload = vec![0u8; size - HEADER_BYTES];
        }

        while self.payload_have < self.payload.len() {
            match stream.read(&mut self.payload[self.payload_have..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                Ok(n) => self.payload_have += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }

        // SAFETY: header_buf still holds the header read above.
        let header =
            unsafe { MsgHeader::read_from(self.header_buf.as_ptr()) }.from_wire::<TO_LITTLE>();
        Ok(Some((header, std::mem::take(&mut self.payload))))
    }
}
