//! Wire message format for remote dispatch (spec §6, §4.5).
//!
//! Frames are fixed-layout, network-byte-order records, grounded on the
//! teacher's `parser/primitive.rs` / `serializer` read/write idiom but
//! without XDR padding: the field layout here is exactly as spec'd, not
//! 4-byte aligned.

use std::io::{self, Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::error::{DlmError, DlmResult};
use crate::mode::Mode;

/// Message kinds (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum Kind {
    Lookup = 0,
    LookupReply = 1,
    Request = 2,
    RequestReply = 3,
    Convert = 4,
    ConvertReply = 5,
    Unlock = 6,
    UnlockReply = 7,
    Grant = 8,
    Remove = 9,
    Names = 10,
    Locks = 11,
    RecoverStart = 12,
    RecoverDone = 13,
    /// Ack for a single `Names` frame (spec §4.6 step 3 "exactly-once
    /// application"). Not named in the spec's original wire catalogue;
    /// added the same way `RequestReply` pairs with `Request`, since the
    /// resend passes need their own acks to drive `RecoveryState`'s
    /// per-peer msgid bookkeeping.
    NamesReply = 14,
    /// Ack for a single `Locks` frame (spec §4.6 step 4).
    LocksReply = 15,
}

/// Result/status codes carried in the `result` wire field (spec §6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum WireStatus {
    Ok = 0,
    NotQueued = 1,
    Cancelled = 2,
    Unlocked = 3,
    Deadlock = 4,
    NoMem = 5,
    NoSpc = 6,
    Inval = 7,
    Recovering = 8,
    NoEnt = 9,
    /// Accepted onto the convert/wait queue; not a terminal outcome. The
    /// grant (or a later deadlock resolution) arrives via a separate
    /// server-initiated `GRANT` message (spec §4.5 "queued; GRANT frame
    /// follows later").
    Queued = 10,
}

impl WireStatus {
    pub fn from_error(err: &DlmError) -> Self {
        match err {
            DlmError::NotQueued => WireStatus::NotQueued,
            DlmError::Cancelled => WireStatus::Cancelled,
            DlmError::Unlocked => WireStatus::Unlocked,
            DlmError::Deadlock => WireStatus::Deadlock,
            DlmError::NoMem => WireStatus::NoMem,
            DlmError::NoSpc => WireStatus::NoSpc,
            DlmError::Inval | DlmError::Invariant(_) => WireStatus::Inval,
            DlmError::Recovering => WireStatus::Recovering,
            DlmError::NoEnt => WireStatus::NoEnt,
        }
    }

    pub fn into_result(self) -> Result<(), DlmError> {
        match self {
            WireStatus::Ok => Ok(()),
            WireStatus::NotQueued => Err(DlmError::NotQueued),
            WireStatus::Cancelled => Err(DlmError::Cancelled),
            WireStatus::Unlocked => Err(DlmError::Unlocked),
            WireStatus::Deadlock => Err(DlmError::Deadlock),
            WireStatus::NoMem => Err(DlmError::NoMem),
            WireStatus::NoSpc => Err(DlmError::NoSpc),
            WireStatus::Inval => Err(DlmError::Inval),
            WireStatus::Recovering => Err(DlmError::Recovering),
            WireStatus::NoEnt => Err(DlmError::NoEnt),
            // Not an error; callers that care about the queued state match
            // on it before reaching here (see `dispatch::apply_reply`).
            WireStatus::Queued => Ok(()),
        }
    }
}

/// One wire frame (spec §6 "Wire messages"). `name` and `lvb` are
/// variable-length opaque byte strings, each with a `u16` length prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: Kind,
    pub flags: u8,
    pub lockspace: u32,
    pub sender_nodeid: u32,
    pub target_nodeid: u32,
    pub sender_lkid: u32,
    pub remote_lkid: u32,
    pub mode: Mode,
    pub rqmode: Mode,
    pub status: u8,
    pub result: WireStatus,
    pub range_start: u64,
    pub range_end: u64,
    pub name: Vec<u8>,
    pub lvb: Vec<u8>,
}

fn mode_from_u8(v: u8) -> DlmResult<Mode> {
    Mode::ALL.into_iter().nth(v as usize).ok_or(DlmError::Inval)
}

impl Frame {
    /// Encode into a fresh byte buffer in the exact field order spec'd in §6.
    pub fn encode(&self) -> DlmResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(32 + self.name.len() + self.lvb.len());
        self.write_to(&mut buf).map_err(|e| DlmError::Invariant(format!("frame encode: {e}")))?;
        Ok(buf)
    }

    fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        out.write_u8(self.kind.to_u8().expect("Kind fits in u8"))?;
        out.write_u8(self.flags)?;
        out.write_u16::<BigEndian>(0)?; // reserved
        out.write_u32::<BigEndian>(self.lockspace)?;
        out.write_u32::<BigEndian>(self.sender_nodeid)?;
        out.write_u32::<BigEndian>(self.target_nodeid)?;
        out.write_u32::<BigEndian>(self.sender_lkid)?;
        out.write_u32::<BigEndian>(self.remote_lkid)?;
        out.write_u8(self.mode as u8)?;
        out.write_u8(self.rqmode as u8)?;
        out.write_u8(self.status)?;
        out.write_u8(self.result.to_u8().expect("WireStatus fits in u8"))?;
        out.write_u64::<BigEndian>(self.range_start)?;
        out.write_u64::<BigEndian>(self.range_end)?;
        out.write_u16::<BigEndian>(self.name.len() as u16)?;
        out.write_all(&self.name)?;
        out.write_u16::<BigEndian>(self.lvb.len() as u16)?;
        out.write_all(&self.lvb)?;
        Ok(())
    }

    /// Decode a frame from a length-prefixed byte slice (the framing layer
    /// strips the outer length prefix before calling this).
    pub fn decode(bytes: &[u8]) -> DlmResult<Self> {
        let mut src = Cursor::new(bytes);
        let kind = Kind::from_u8(src.read_u8().map_err(io_err)?).ok_or(DlmError::Inval)?;
        let flags = src.read_u8().map_err(io_err)?;
        let _reserved = src.read_u16::<BigEndian>().map_err(io_err)?;
        let lockspace = src.read_u32::<BigEndian>().map_err(io_err)?;
        let sender_nodeid = src.read_u32::<BigEndian>().map_err(io_err)?;
        let target_nodeid = src.read_u32::<BigEndian>().map_err(io_err)?;
        let sender_lkid = src.read_u32::<BigEndian>().map_err(io_err)?;
        let remote_lkid = src.read_u32::<BigEndian>().map_err(io_err)?;
        let mode = mode_from_u8(src.read_u8().map_err(io_err)?)?;
        let rqmode = mode_from_u8(src.read_u8().map_err(io_err)?)?;
        let status = src.read_u8().map_err(io_err)?;
        let result = WireStatus::from_u8(src.read_u8().map_err(io_err)?).ok_or(DlmError::Inval)?;
        let range_start = src.read_u64::<BigEndian>().map_err(io_err)?;
        let range_end = src.read_u64::<BigEndian>().map_err(io_err)?;
        let name_len = src.read_u16::<BigEndian>().map_err(io_err)? as usize;
        let mut name = vec![0u8; name_len];
        src.read_exact(&mut name).map_err(io_err)?;
        let lvb_len = src.read_u16::<BigEndian>().map_err(io_err)? as usize;
        let mut lvb = vec![0u8; lvb_len];
        src.read_exact(&mut lvb).map_err(io_err)?;

        Ok(Frame {
            kind,
            flags,
            lockspace,
            sender_nodeid,
            target_nodeid,
            sender_lkid,
            remote_lkid,
            mode,
            rqmode,
            status,
            result,
            range_start,
            range_end,
            name,
            lvb,
        })
    }
}

fn io_err(e: io::Error) -> DlmError {
    DlmError::Invariant(format!("frame decode: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        Frame {
            kind: Kind::Request,
            flags: 0,
            lockspace: 7,
            sender_nodeid: 1,
            target_nodeid: 2,
            sender_lkid: 42,
            remote_lkid: 0,
            mode: Mode::Nl,
            rqmode: Mode::Ex,
            status: 0,
            result: WireStatus::Ok,
            range_start: 0,
            range_end: u64::MAX,
            name: b"R".to_vec(),
            lvb: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let frame = sample();
        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn rejects_truncated_frame() {
        let bytes = sample().encode().unwrap();
        assert!(Frame::decode(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn wire_status_round_trips_known_errors() {
        for err in [DlmError::NotQueued, DlmError::Deadlock, DlmError::Recovering, DlmError::NoEnt] {
            let status = WireStatus::from_error(&err);
            assert_eq!(status.into_result(), Err(err));
        }
    }
}
