mod error;
mod persist;
mod ptcp;
mod spsc;

pub use error::{PersistError, SanityCheckError};
pub use persist::MapPod;
pub use ptcp::PtcpQueue;
pub use spsc::{BLOCK_BYTES, SpscQueue};
