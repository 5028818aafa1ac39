use tandem_utils::ArrayStr;
use tandem_wire::WireEndian;

use crate::error::{LoginError, SeqMismatchInfo};

/// Longest endpoint name this crate stores on the stack. `Config::NAME_SIZE`
/// is the width actually put on the wire and must not exceed this.
pub const MAX_NAME_SIZE: usize = 64;

/// Runs the sequence reconciliation both client and server perform once a
/// `LoginMsg`/`LoginRspMsg` pair has been exchanged (§4.4). `my_ack`/
/// `seq_start`/`seq_end` describe this side's own PTCP queue state (from
/// `sanity_check`); `peer_last_sent`/`peer_last_received` are the other
/// side's claims from the handshake payload it just sent us.
///
/// `Ok(true)` means both sides reported a fresh (all-zero) session and no
/// retransmission is needed. `Ok(false)` means the peer's claims are
/// consistent with our own history and `login_ack(peer_last_received)`
/// should be called to rebase retransmission. `Err` carries the mismatch
/// for `OnSeqNumberMismatch`.
pub fn reconcile(
    my_ack: u32,
    seq_start: u32,
    seq_end: u32,
    peer_last_sent: u32,
    peer_last_received: u32,
) -> Result<bool, SeqMismatchInfo> {
    let fresh_both_sides = seq_start == seq_end
        && seq_end == 0
        && my_ack == 0
        && peer_last_sent == 0
        && peer_last_received == 0;
    if fresh_both_sides {
        return Ok(true);
    }

    let locally_consistent = (peer_last_sent.wrapping_sub(my_ack) as i32) >= 0
        && (peer_last_received.wrapping_sub(seq_start) as i32) >= 0
        && (peer_last_received.wrapping_sub(seq_end) as i32) <= 0;
    if !locally_consistent {
        return Err(SeqMismatchInfo {
            local_ack_seq: my_ack,
            local_seq_end: seq_end,
            remote_last_sent: peer_last_sent,
            remote_last_received: peer_last_received,
        });
    }
    Ok(false)
}

/// Writes `name` as exactly `width` null-padded bytes, truncating if needed.
fn encode_name(name: &ArrayStr<MAX_NAME_SIZE>, width: usize, out: &mut Vec<u8>) {
    let bytes = name.as_str().as_bytes();
    let take = bytes.len().min(width);
    out.extend_from_slice(&bytes[..take]);
    out.resize(out.len() + (width - take), 0);
}

/// Reads an `ArrayStr` from `width` null-padded bytes, stopping at the first
/// nul (or `width` if there is none).
fn decode_name(buf: &[u8]) -> ArrayStr<MAX_NAME_SIZE> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    ArrayStr::from_str_truncate(std::str::from_utf8(&buf[..end]).unwrap_or(""))
}

/// Client -> server handshake payload.
#[derive(Clone, Debug)]
pub struct LoginMsg {
    pub client_name: ArrayStr<MAX_NAME_SIZE>,
    pub use_shm: bool,
    pub last_seq_sent: u32,
    pub last_seq_received: u32,
    /// Opaque to the core; interpreted by the application only.
    pub user_data: Vec<u8>,
}

impl LoginMsg {
    pub fn encode<const TO_LITTLE: bool>(&self, name_size: usize, out: &mut Vec<u8>) {
        encode_name(&self.client_name, name_size, out);
        out.push(u8::from(self.use_shm));
        out.extend_from_slice(&self.last_seq_sent.to_wire::<TO_LITTLE>().to_ne_bytes());
        out.extend_from_slice(&self.last_seq_received.to_wire::<TO_LITTLE>().to_ne_bytes());
        out.extend_from_slice(&self.user_data);
    }

    pub fn decode<const TO_LITTLE: bool>(buf: &[u8], name_size: usize) -> Option<Self> {
        let mut off = 0;
        if buf.len() < name_size + 9 {
            return None;
        }
        let client_name = decode_name(&buf[off..off + name_size]);
        off += name_size;
        let use_shm = buf[off] != 0;
        off += 1;
        let last_seq_sent =
            u32::from_ne_bytes(buf[off..off + 4].try_into().ok()?).from_wire::<TO_LITTLE>();
        off += 4;
        let last_seq_received =
            u32::from_ne_bytes(buf[off..off + 4].try_into().ok()?).from_wire::<TO_LITTLE>();
        off += 4;
        let user_data = buf[off..].to_vec();
        Some(Self { client_name, use_shm, last_seq_sent, last_seq_received, user_data })
    }
}

/// Server -> client handshake reply: either an accepted session with
/// whatever `LoginRspUserData` the application wants to hand back, or a
/// rejection carrying a short error message.
#[derive(Clone, Debug)]
pub enum LoginOutcome {
    Accepted { user_data: Vec<u8> },
    Rejected { error_msg: ArrayStr<64> },
}

#[derive(Clone, Debug)]
pub struct LoginRspMsg {
    pub server_name: ArrayStr<MAX_NAME_SIZE>,
    pub last_seq_sent: u32,
    pub last_seq_received: u32,
    pub outcome: LoginOutcome,
}

impl LoginRspMsg {
    pub fn encode<const TO_LITTLE: bool>(&self, name_size: usize, out: &mut Vec<u8>) {
        encode_name(&self.server_name, name_size, out);
        out.push(u8::from(matches!(self.outcome, LoginOutcome::Accepted { .. })));
        out.extend_from_slice(&self.last_seq_sent.to_wire::<TO_LITTLE>().to_ne_bytes());
        out.extend_from_slice(&self.last_seq_received.to_wire::<TO_LITTLE>().to_ne_bytes());
        match &self.outcome {
            LoginOutcome::Accepted { user_data } => out.extend_from_slice(user_data),
            LoginOutcome::Rejected { error_msg } => encode_name(error_msg, 64, out),
        }
    }

    pub fn decode<const TO_LITTLE: bool>(
        buf: &[u8],
        name_size: usize,
    ) -> Result<Self, LoginError> {
        let mut off = 0;
        if buf.len() < name_size + 9 {
            return Err(LoginError::MalformedResponse);
        }
        let server_name = decode_name(&buf[off..off + name_size]);
        off += name_size;
        let accepted = buf[off] != 0;
        off += 1;
        let read_u32 = |off: usize| -> Result<u32, LoginError> {
            buf.get(off..off + 4)
                .and_then(|s| s.try_into().ok())
                .map(|b: [u8; 4]| u32::from_ne_bytes(b).from_wire::<TO_LITTLE>())
                .ok_or(LoginError::MalformedResponse)
        };
        let last_seq_sent = read_u32(off)?;
        off += 4;
        let last_seq_received = read_u32(off)?;
        off += 4;
        let outcome = if accepted {
            LoginOutcome::Accepted { user_data: buf[off..].to_vec() }
        } else {
            if buf.len() < off + 64 {
                return Err(LoginError::MalformedResponse);
            }
            LoginOutcome::Rejected { error_msg: decode_name(&buf[off..off + 64]) }
        };
        Ok(Self { server_name, last_seq_sent, last_seq_received, outcome })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_msg_roundtrip() {
        let msg = LoginMsg {
            client_name: ArrayStr::from_str_truncate("trader-1"),
            use_shm: true,
            last_seq_sent: 42,
            last_seq_received: 7,
            user_data: vec![1, 2, 3],
        };
        let mut bytes = Vec::new();
        msg.encode::<true>(16, &mut bytes);
        let back = LoginMsg::decode::<true>(&bytes, 16).unwrap();
        assert_eq!(back.client_name.as_str(), "trader-1");
        assert!(back.use_shm);
        assert_eq!(back.last_seq_sent, 42);
        assert_eq!(back.last_seq_received, 7);
        assert_eq!(back.user_data, vec![1, 2, 3]);
    }

    #[test]
    fn reconcile_accepts_fresh_session_on_both_sides() {
        let fresh = reconcile(0, 0, 0, 0, 0).unwrap();
        assert!(fresh);
    }

    #[test]
    fn reconcile_accepts_consistent_reconnect_and_reports_not_fresh() {
        // We'd sent seq [0, 10), the peer claims to have received up through
        // 10 and to have sent us 7 (which matches our own ack count).
        let fresh = reconcile(7, 0, 10, 7, 10).unwrap();
        assert!(!fresh);
    }

    #[test]
    fn reconcile_rejects_impossible_sequence_range() {
        // Our own ack says we've received 1000 frames, but the peer claims
        // it only ever sent up through seq 10 -- straight out of scenario 5.
        let err = reconcile(1000, 0, 10, 10, 5).unwrap_err();
        assert_eq!(err.local_ack_seq, 1000);
        assert_eq!(err.local_seq_end, 10);
        assert_eq!(err.remote_last_sent, 10);
        assert_eq!(err.remote_last_received, 5);
    }

    #[test]
    fn login_rsp_rejected_roundtrip() {
        let msg = LoginRspMsg {
            server_name: ArrayStr::from_str_truncate("md-server"),
            last_seq_sent: 0,
            last_seq_received: 0,
            outcome: LoginOutcome::Rejected { error_msg: ArrayStr::from_str_truncate("bad name") },
        };
        let mut bytes = Vec::new();
        msg.encode::<true>(16, &mut bytes);
        let back = LoginRspMsg::decode::<true>(&bytes, 16).unwrap();
        match back.outcome {
            LoginOutcome::Rejected { error_msg } => assert_eq!(error_msg.as_str(), "bad name"),
            LoginOutcome::Accepted { .. } => panic!("expected rejection"),
        }
    }
}
