#![no_std]

//! Bridges a CAN/CAN FD bus onto a UDP transport: frames picked up off
//! the bus are batched into datagrams, and received datagrams are
//! unpacked back into frames for bus transmission. Everything runs on
//! caller-provided fixed storage from a cooperative, non-blocking tick;
//! nothing here allocates or suspends.

mod bridge;
mod codec;
mod frame;
mod queue;

/// Largest payload a CAN FD frame can carry.
pub const MAX_FD_DATA_LENGTH: usize = 64;
/// Largest payload a classic CAN 2.0 frame can carry.
pub const MAX_CLASSIC_DATA_LENGTH: usize = 8;

pub use bridge::*;
pub use codec::*;
pub use frame::*;
pub use queue::*;

pub use embedded_can::{ExtendedId, Id, StandardId};
