mod arrayvec;
mod assert;
pub mod directories;
mod thread;

pub use arrayvec::{ArrayStr, ArrayStrTooLong, ArrayVec};
pub use thread::{ThreadPriority, thread_boot};
