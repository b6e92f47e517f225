//! Wire format of the compositor bridge.
//!
//! The bridge speaks fixed-size packets over a `SOCK_SEQPACKET` Unix
//! socket, so message boundaries come from the transport and no length
//! prefix is needed. Frame submissions additionally carry up to
//! [`MAX_PLANES`] dma-buf file descriptors as `SCM_RIGHTS` ancillary data.
//!
//! Receivers validate magic and version before interpreting anything else;
//! packets that fail that check are silently discarded so both ends
//! tolerate protocol skew.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Protocol identifier, `"WSIB"` in ASCII.
pub const BRIDGE_MAGIC: u32 = 0x5753_4942;
/// Current protocol revision. Mismatching packets are dropped, not errors.
pub const BRIDGE_VERSION: u16 = 1;
/// Upper bound on dma-buf planes per frame.
pub const MAX_PLANES: usize = 4;

/// Feedback flag: the compositor could not display the frame.
pub const FEEDBACK_FAILED: u32 = 1 << 0;
/// Feedback flag: the peer supports ack-based pacing.
pub const FEEDBACK_CAP_SYNC: u32 = 1 << 16;

/// Sentinel frame id used by the capability probe, `"HELO"` in ASCII.
/// Real frame ids are assigned from a wrapping counter that skips zero and
/// takes ~4 billion frames to collide with this value.
pub const HELLO_FRAME_ID: u32 = 0x4845_4c4f;

/// Size of every packet on the wire: a 36-byte header followed by four
/// 16-byte plane slots.
pub const PACKET_SIZE: usize = 36 + MAX_PLANES * 16;

/// Packet opcodes.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// A frame submission; carries plane fds as ancillary data.
    Frame = 1,
    /// No further frames will be sent for this window.
    Stop = 2,
    /// Capability probe sent on every fresh connection.
    Hello = 3,
    /// Asynchronous per-frame acceptance/rejection reply.
    Feedback = 4,
}

impl Opcode {
    fn from_wire(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Opcode::Frame),
            2 => Some(Opcode::Stop),
            3 => Some(Opcode::Hello),
            4 => Some(Opcode::Feedback),
            _ => None,
        }
    }
}

/// Why a received buffer could not be turned into a [`Packet`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PacketError {
    /// Wrong magic or version: a foreign or skewed packet. Skip it.
    #[error("foreign packet (bad magic or version)")]
    Foreign,
    /// Correct magic/version but an opcode this revision does not know.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    /// Shorter than a full packet.
    #[error("truncated packet ({0} bytes)")]
    Truncated(usize),
}

/// Per-plane layout description carried inline in the packet.
///
/// The 64-bit format modifier is split across two 32-bit words to keep
/// every field naturally aligned at a fixed offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneSlot {
    pub offset: u32,
    pub stride: u32,
    pub modifier_hi: u32,
    pub modifier_lo: u32,
}

impl PlaneSlot {
    pub fn new(offset: u32, stride: u32, modifier: u64) -> Self {
        Self {
            offset,
            stride,
            modifier_hi: (modifier >> 32) as u32,
            modifier_lo: (modifier & 0xffff_ffff) as u32,
        }
    }

    pub fn modifier(&self) -> u64 {
        (u64::from(self.modifier_hi) << 32) | u64::from(self.modifier_lo)
    }
}

/// One bridge packet. The `frame_id` field is echoed back verbatim in
/// `Feedback` replies, which is how replies are matched to submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub opcode: Opcode,
    /// Target window identifier.
    pub xid: u32,
    pub width: u32,
    pub height: u32,
    /// Pixel format fourcc.
    pub format: u32,
    /// Opcode-specific flags; see [`FEEDBACK_FAILED`] and
    /// [`FEEDBACK_CAP_SYNC`].
    pub flags: u32,
    pub num_planes: u32,
    pub frame_id: u32,
    pub planes: [PlaneSlot; MAX_PLANES],
}

impl Packet {
    /// A packet with no frame payload, for `Stop`/`Hello` control traffic.
    pub fn control(opcode: Opcode, xid: u32) -> Self {
        Self {
            opcode,
            xid,
            width: 0,
            height: 0,
            format: 0,
            flags: 0,
            num_planes: 0,
            frame_id: 0,
            planes: [PlaneSlot::default(); MAX_PLANES],
        }
    }

    /// Serialize to the fixed wire layout (little endian).
    pub fn encode(&self) -> [u8; PACKET_SIZE] {
        let mut raw = [0u8; PACKET_SIZE];
        let mut buf = &mut raw[..];
        buf.put_u32_le(BRIDGE_MAGIC);
        buf.put_u16_le(BRIDGE_VERSION);
        buf.put_u16_le(self.opcode as u16);
        buf.put_u32_le(self.xid);
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.height);
        buf.put_u32_le(self.format);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.num_planes);
        buf.put_u32_le(self.frame_id);
        for plane in &self.planes {
            buf.put_u32_le(plane.offset);
            buf.put_u32_le(plane.stride);
            buf.put_u32_le(plane.modifier_hi);
            buf.put_u32_le(plane.modifier_lo);
        }
        raw
    }

    /// Parse a received datagram.
    pub fn decode(mut raw: &[u8]) -> Result<Self, PacketError> {
        if raw.len() < PACKET_SIZE {
            return Err(PacketError::Truncated(raw.len()));
        }
        if raw.get_u32_le() != BRIDGE_MAGIC || raw.get_u16_le() != BRIDGE_VERSION {
            return Err(PacketError::Foreign);
        }
        let raw_opcode = raw.get_u16_le();
        let opcode = Opcode::from_wire(raw_opcode).ok_or(PacketError::UnknownOpcode(raw_opcode))?;
        let xid = raw.get_u32_le();
        let width = raw.get_u32_le();
        let height = raw.get_u32_le();
        let format = raw.get_u32_le();
        let flags = raw.get_u32_le();
        let num_planes = raw.get_u32_le();
        let frame_id = raw.get_u32_le();
        let mut planes = [PlaneSlot::default(); MAX_PLANES];
        for plane in &mut planes {
            plane.offset = raw.get_u32_le();
            plane.stride = raw.get_u32_le();
            plane.modifier_hi = raw.get_u32_le();
            plane.modifier_lo = raw.get_u32_le();
        }
        Ok(Self {
            opcode,
            xid,
            width,
            height,
            format,
            flags,
            num_planes,
            frame_id,
            planes,
        })
    }
}
