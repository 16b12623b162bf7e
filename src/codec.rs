//! Wire codec for the bridge datagrams: a fixed five byte header
//! (version, op code, sequence number, record count) followed by a run
//! of variable-length frame records, all in network byte order.

use heapless::Vec;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::frame::{Frame, CAN_RTR_FLAG, FD_FRAME_MARKER};
use crate::queue::FrameQueue;
use crate::{MAX_CLASSIC_DATA_LENGTH, MAX_FD_DATA_LENGTH};

/// Wire protocol version produced and accepted by this implementation.
pub const PROTOCOL_VERSION: u8 = 2;
/// Fixed datagram header: version, op code, sequence number, count.
pub const DATAGRAM_HEADER_SIZE: usize = 5;
/// Fixed leading part of every frame record: raw id plus length byte.
pub const FRAME_BASE_SIZE: usize = 5;
/// Largest single record: an FD frame with flags byte and full payload.
pub const MAX_RECORD_SIZE: usize = FRAME_BASE_SIZE + 1 + MAX_FD_DATA_LENGTH;
/// Smallest MTU able to carry any single frame record.
pub const MIN_MTU: usize = DATAGRAM_HEADER_SIZE + MAX_RECORD_SIZE;

/// Datagram op codes. Only `Data` is ever produced or consumed;
/// `Ack` and `Nack` are reserved by the protocol and rejected on
/// receive like any unknown code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[num_enum(error_type(name = DecodeError, constructor = DecodeError::UnsupportedOpCode))]
#[repr(u8)]
pub enum OpCode {
    Data = 0,
    Ack = 1,
    Nack = 2,
}

/// Reasons a received datagram was discarded, entirely or partway
/// through. Frames decoded before the failure point stay enqueued; the
/// index riding in `Truncated` and `QueueFull` says how many.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    #[error("Datagram is shorter than the fixed header, carries an empty batch, or declares an impossible record length")]
    Malformed,
    #[error("Datagram has protocol version {0} (expected {PROTOCOL_VERSION})")]
    VersionMismatch(u8),
    #[error("Op code {0} is not handled")]
    UnsupportedOpCode(u8),
    #[error("Datagram ended in the middle of record {0}")]
    Truncated(u16),
    #[error("Destination queue filled up after {0} frames")]
    QueueFull(u16),
}

/// Byte cursor over a received datagram. Every read checks the
/// remaining length before advancing, so a truncated or corrupt record
/// can never index past the end of the buffer.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_u8(&mut self) -> Option<u8> {
        let byte = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn read_u16(&mut self) -> Option<u16> {
        self.read_array().map(u16::from_be_bytes)
    }

    fn read_u32(&mut self) -> Option<u32> {
        self.read_array().map(u32::from_be_bytes)
    }

    fn read_array<const LEN: usize>(&mut self) -> Option<[u8; LEN]> {
        self.read_slice(LEN).map(|bytes| bytes.try_into().unwrap())
    }

    fn read_slice(&mut self, len: usize) -> Option<&'a [u8]> {
        let slice = self.buf.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(slice)
    }
}

/// Encoder half of the codec. Owns the per-datagram sequence counter;
/// decoding is stateless, see [`decode_datagram`].
#[derive(Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DatagramEncoder {
    sequence: u8,
}

impl DatagramEncoder {
    pub const fn new() -> Self {
        Self { sequence: 0 }
    }

    /// Sequence number the next produced datagram will carry. Purely
    /// diagnostic: receivers read it off the wire and discard it.
    pub const fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Drains frames off the head of `source` into one datagram,
    /// stopping as soon as the queue is empty or the next record would
    /// no longer fit in `out`'s capacity. The header is written last,
    /// once the record count is known.
    ///
    /// Returns the number of frames consumed. Zero means no datagram
    /// was produced and `out` was left empty: an empty batch is never
    /// emitted. Call repeatedly to split a backlog larger than one
    /// datagram across several.
    pub fn encode<const N: usize, const MTU: usize>(
        &mut self,
        source: &mut FrameQueue<N>,
        out: &mut Vec<u8, MTU>,
    ) -> usize {
        out.clear();
        if out.resize(DATAGRAM_HEADER_SIZE, 0).is_err() {
            return 0;
        }

        let mut count: u16 = 0;
        loop {
            let Some(frame) = source.peek() else { break };
            if out.len() + record_size(frame) > out.capacity() {
                break;
            }

            write_record(out, frame);
            source.dequeue();
            count += 1;
        }

        if count == 0 {
            out.clear();
            return 0;
        }

        out[0] = PROTOCOL_VERSION;
        out[1] = OpCode::Data.into();
        out[2] = self.sequence;
        out[3..5].copy_from_slice(&count.to_be_bytes());
        self.sequence = self.sequence.wrapping_add(1);

        usize::from(count)
    }
}

fn record_size(frame: &Frame) -> usize {
    let mut size = FRAME_BASE_SIZE;
    if frame.is_fd() {
        size += 1;
    }
    if let Some(payload) = frame.payload() {
        size += payload.len();
    }
    size
}

fn write_record<const MTU: usize>(out: &mut Vec<u8, MTU>, frame: &Frame) {
    out.extend_from_slice(&frame.can_id.to_be_bytes()).unwrap();
    out.push(frame.len).unwrap();
    if frame.is_fd() {
        out.push(frame.flags).unwrap();
    }
    if let Some(payload) = frame.payload() {
        out.extend_from_slice(payload).unwrap();
    }
}

/// Decodes one datagram, pushing every fully validated frame record
/// into `dest`. Returns the number of frames enqueued.
///
/// Validation happens strictly before any field is consumed: header
/// length, version, op code, and nonzero record count first, then for
/// each record the five byte base, the optional FD flags byte, a
/// declared length that fits a frame slot, and the payload (skipped for
/// RTR frames). A failure aborts the rest of the datagram but keeps
/// whatever was already enqueued; there is no rollback. A full
/// destination queue likewise ends decoding early, discarding the
/// remainder of the datagram. Bytes trailing the declared record count
/// are ignored.
pub fn decode_datagram<const N: usize>(
    bytes: &[u8],
    dest: &mut FrameQueue<N>,
) -> Result<u16, DecodeError> {
    if bytes.len() < DATAGRAM_HEADER_SIZE {
        return Err(DecodeError::Malformed);
    }

    let mut cursor = Cursor::new(bytes);

    let version = cursor.read_u8().ok_or(DecodeError::Malformed)?;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::VersionMismatch(version));
    }

    let op_code: OpCode = cursor.read_u8().ok_or(DecodeError::Malformed)?.try_into()?;
    if op_code != OpCode::Data {
        return Err(DecodeError::UnsupportedOpCode(op_code.into()));
    }

    /* Sequence numbers carry no delivery semantics */
    let _sequence = cursor.read_u8().ok_or(DecodeError::Malformed)?;

    let count = cursor.read_u16().ok_or(DecodeError::Malformed)?;
    if count == 0 {
        return Err(DecodeError::Malformed);
    }

    for index in 0..count {
        let can_id = cursor.read_u32().ok_or(DecodeError::Truncated(index))?;
        let len = cursor.read_u8().ok_or(DecodeError::Truncated(index))?;

        let flags = if len & FD_FRAME_MARKER != 0 {
            cursor.read_u8().ok_or(DecodeError::Truncated(index))?
        } else {
            0
        };

        let effective = usize::from(len & !FD_FRAME_MARKER);
        let limit = if len & FD_FRAME_MARKER != 0 {
            MAX_FD_DATA_LENGTH
        } else {
            MAX_CLASSIC_DATA_LENGTH
        };
        if effective > limit {
            return Err(DecodeError::Malformed);
        }

        let payload: &[u8] = if can_id & CAN_RTR_FLAG != 0 {
            &[]
        } else {
            cursor
                .read_slice(effective)
                .ok_or(DecodeError::Truncated(index))?
        };

        let Some(slot) = dest.enqueue() else {
            return Err(DecodeError::QueueFull(index));
        };
        slot.can_id = can_id;
        slot.len = len;
        slot.flags = flags;
        slot.data[..payload.len()].copy_from_slice(payload);
    }

    Ok(count)
}
