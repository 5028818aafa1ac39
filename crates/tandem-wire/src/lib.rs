mod endian;
mod header;

pub use endian::WireEndian;
pub use header::{
    HEADER_BYTES, MSG_TYPE_HEARTBEAT, MSG_TYPE_INVALID, MSG_TYPE_LOGIN, MSG_TYPE_LOGIN_RSP,
    MsgHeader,
};
