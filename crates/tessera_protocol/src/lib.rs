#![forbid(unsafe_code)]

pub mod frame;
pub mod message;

pub use frame::{EPOCH_LEN, FLAG_DELETED, Frame, FrameError, HEADER_LEN, TIMESTAMP_MAX};
pub use message::{Inbound, Outbound, ProtocolError, decode_inbound};

