//! File-transfer protocol: framing, flow control, and the sender and
//! receiver state machines.

pub mod backpressure;
pub mod frame;
pub mod receiver;
pub mod sender;
pub mod sink;
