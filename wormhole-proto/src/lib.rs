//! Wire protocol for wormhole host↔guest messaging.
//!
//! Packets are serialized with [`postcard`] and framed with a 2-byte magic,
//! a 4-byte big-endian length prefix and a 2-byte check of that length, so
//! many packets can share one continuous byte stream such as a virtual
//! serial port.

mod codec;
mod message;
mod packet;

pub use codec::{
    DecodeError, EncodeError, FrameReader, HEADER_LEN, MAGIC, MAX_FRAME, encode, header_check,
};
pub use message::{StatusReport, StatusRequest};
pub use packet::{Packet, PacketKind, Payload};
