//! On-the-wire message formats.
//!
//! Every message is a fixed 8-byte header followed by a small control
//! payload and an optional data payload. Multi-byte fields are
//! little-endian. The control payloads are fixed-layout structs encoded
//! and decoded field by field; nothing on the wire is ever reinterpreted
//! in place.

use mfs_error::{MfsError, Result};
use mfs_types::{put_le_u16, put_le_u32, put_le_u64, read_le_u64, BLOCK_SIZE};

pub const MSG_HEADER_SIZE: usize = 8;
pub const MAX_CTL_SIZE: usize = 255;
pub const MAX_DATA_SIZE: usize = BLOCK_SIZE;

/// Message types; the discriminant is the wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    GetBlock = 0,
    GetBlockResult = 1,
    WriteBlock = 2,
    WriteBlockResult = 3,
    GetManifest = 4,
    GetManifestResult = 5,
}

/// Number of message types; bounds the receive dispatch table.
pub const MSG_TYPE_NR: usize = 6;

impl MsgType {
    #[must_use]
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::GetBlock),
            1 => Some(Self::GetBlockResult),
            2 => Some(Self::WriteBlock),
            3 => Some(Self::WriteBlockResult),
            4 => Some(Self::GetManifest),
            5 => Some(Self::GetManifestResult),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_wire(self) -> u8 {
        self as u8
    }
}

// Wire error codes are a closed set; anything else maps to a protocol
// error at the receiver.
pub const MSG_ERR_OK: u8 = 0;
pub const MSG_ERR_UNKNOWN: u8 = 1;
pub const MSG_ERR_EIO: u8 = 2;
pub const MSG_ERR_ENOMEM: u8 = 3;
const MSG_ERR_INVALID: u8 = 4;

/// Collapse a negative errno to its wire representation.
#[must_use]
pub fn err_to_wire(errno: i32) -> u8 {
    match -errno {
        0 => MSG_ERR_OK,
        libc::EIO => MSG_ERR_EIO,
        libc::ENOMEM => MSG_ERR_ENOMEM,
        _ => MSG_ERR_UNKNOWN,
    }
}

/// Expand a wire error code back to a negative errno.
#[must_use]
pub fn wire_to_errno(err: u8) -> i32 {
    match err {
        MSG_ERR_OK => 0,
        MSG_ERR_UNKNOWN | MSG_ERR_EIO => -libc::EIO,
        MSG_ERR_ENOMEM => -libc::ENOMEM,
        MSG_ERR_INVALID..=u8::MAX => -libc::EPROTO,
    }
}

/// Block access requested by a `GET_BLOCK`.
pub const BLOCK_ACCESS_READ: u8 = 0;
pub const BLOCK_ACCESS_WRITE: u8 = 1;
pub const BLOCK_ACCESS_NR: u8 = 2;

/// The fixed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgHeader {
    /// Reserved; not yet used.
    pub crc: u32,
    pub data_size: u16,
    pub ctl_size: u8,
    pub mtype: u8,
}

impl MsgHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; MSG_HEADER_SIZE] {
        let mut buf = [0_u8; MSG_HEADER_SIZE];
        put_le_u32(&mut buf, 0, self.crc);
        put_le_u16(&mut buf, 4, self.data_size);
        buf[6] = self.ctl_size;
        buf[7] = self.mtype;
        buf
    }

    #[must_use]
    pub fn decode(bytes: &[u8; MSG_HEADER_SIZE]) -> Self {
        Self {
            crc: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            data_size: u16::from_le_bytes([bytes[4], bytes[5]]),
            ctl_size: bytes[6],
            mtype: bytes[7],
        }
    }

    /// Check the header's internal validity.
    ///
    /// A message must carry at least one payload, stay within the size
    /// bounds, and name a known type.
    pub fn verify(&self) -> Result<MsgType> {
        if self.ctl_size == 0 && self.data_size == 0 {
            return Err(MfsError::Protocol("message carries no payload".to_owned()));
        }
        if usize::from(self.data_size) > MAX_DATA_SIZE {
            return Err(MfsError::Protocol(format!(
                "data_size {} exceeds {MAX_DATA_SIZE}",
                self.data_size
            )));
        }
        MsgType::from_wire(self.mtype)
            .ok_or_else(|| MfsError::Protocol(format!("unknown message type {}", self.mtype)))
    }
}

fn ctl_size_err(what: &'static str, got: usize, want: usize) -> MfsError {
    MfsError::Protocol(format!("{what}: ctl size {got}, want {want}"))
}

/// `GET_BLOCK`: client asks a devd for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetBlock {
    pub bnr: u64,
    pub access: u8,
}

impl GetBlock {
    pub const SIZE: usize = 16;

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0_u8; Self::SIZE];
        put_le_u64(&mut buf, 0, self.bnr);
        buf[8] = self.access;
        buf
    }

    pub fn decode(ctl: &[u8]) -> Result<Self> {
        if ctl.len() != Self::SIZE {
            return Err(ctl_size_err("GET_BLOCK", ctl.len(), Self::SIZE));
        }
        Ok(Self {
            bnr: read_le_u64(ctl, 0)?,
            access: ctl[8],
        })
    }
}

/// `GET_BLOCK_RESULT`: devd answers with the block or an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetBlockResult {
    pub bnr: u64,
    pub access: u8,
    pub err: u8,
}

impl GetBlockResult {
    pub const SIZE: usize = 16;

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0_u8; Self::SIZE];
        put_le_u64(&mut buf, 0, self.bnr);
        buf[8] = self.access;
        buf[9] = self.err;
        buf
    }

    pub fn decode(ctl: &[u8]) -> Result<Self> {
        if ctl.len() != Self::SIZE {
            return Err(ctl_size_err("GET_BLOCK_RESULT", ctl.len(), Self::SIZE));
        }
        Ok(Self {
            bnr: read_le_u64(ctl, 0)?,
            access: ctl[8],
            err: ctl[9],
        })
    }
}

/// `WRITE_BLOCK`: client sends block contents to a devd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBlock {
    pub bnr: u64,
}

impl WriteBlock {
    pub const SIZE: usize = 8;

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0_u8; Self::SIZE];
        put_le_u64(&mut buf, 0, self.bnr);
        buf
    }

    pub fn decode(ctl: &[u8]) -> Result<Self> {
        if ctl.len() != Self::SIZE {
            return Err(ctl_size_err("WRITE_BLOCK", ctl.len(), Self::SIZE));
        }
        Ok(Self {
            bnr: read_le_u64(ctl, 0)?,
        })
    }
}

/// `WRITE_BLOCK_RESULT`: devd acknowledges a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBlockResult {
    pub bnr: u64,
    pub err: u8,
}

impl WriteBlockResult {
    pub const SIZE: usize = 16;

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0_u8; Self::SIZE];
        put_le_u64(&mut buf, 0, self.bnr);
        buf[8] = self.err;
        buf
    }

    pub fn decode(ctl: &[u8]) -> Result<Self> {
        if ctl.len() != Self::SIZE {
            return Err(ctl_size_err("WRITE_BLOCK_RESULT", ctl.len(), Self::SIZE));
        }
        Ok(Self {
            bnr: read_le_u64(ctl, 0)?,
            err: ctl[8],
        })
    }
}

/// `GET_MANIFEST`: the caller's newest known sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetManifest {
    pub seq_nr: u64,
}

impl GetManifest {
    pub const SIZE: usize = 8;

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0_u8; Self::SIZE];
        put_le_u64(&mut buf, 0, self.seq_nr);
        buf
    }

    pub fn decode(ctl: &[u8]) -> Result<Self> {
        if ctl.len() != Self::SIZE {
            return Err(ctl_size_err("GET_MANIFEST", ctl.len(), Self::SIZE));
        }
        Ok(Self {
            seq_nr: read_le_u64(ctl, 0)?,
        })
    }
}

/// `GET_MANIFEST_RESULT`: manifest payload or an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetManifestResult {
    pub seq_nr: u64,
    pub err: u8,
}

impl GetManifestResult {
    pub const SIZE: usize = 16;

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0_u8; Self::SIZE];
        put_le_u64(&mut buf, 0, self.seq_nr);
        buf[8] = self.err;
        buf
    }

    pub fn decode(ctl: &[u8]) -> Result<Self> {
        if ctl.len() != Self::SIZE {
            return Err(ctl_size_err("GET_MANIFEST_RESULT", ctl.len(), Self::SIZE));
        }
        Ok(Self {
            seq_nr: read_le_u64(ctl, 0)?,
            err: ctl[8],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let hdr = MsgHeader {
            crc: 0,
            data_size: 4096,
            ctl_size: 8,
            mtype: MsgType::WriteBlock.to_wire(),
        };
        let decoded = MsgHeader::decode(&hdr.encode());
        assert_eq!(decoded, hdr);
        assert_eq!(decoded.verify().unwrap(), MsgType::WriteBlock);
    }

    #[test]
    fn header_layout_is_little_endian() {
        let hdr = MsgHeader {
            crc: 0x0403_0201,
            data_size: 0x0605,
            ctl_size: 7,
            mtype: 1,
        };
        assert_eq!(hdr.encode(), [1, 2, 3, 4, 5, 6, 7, 1]);
    }

    #[test]
    fn header_rejections() {
        let empty = MsgHeader::default();
        assert!(matches!(empty.verify(), Err(MfsError::Protocol(_))));

        let oversized = MsgHeader {
            data_size: (MAX_DATA_SIZE + 1) as u16,
            ctl_size: 1,
            ..MsgHeader::default()
        };
        assert!(matches!(oversized.verify(), Err(MfsError::Protocol(_))));

        let unknown = MsgHeader {
            ctl_size: 1,
            mtype: 99,
            ..MsgHeader::default()
        };
        assert!(matches!(unknown.verify(), Err(MfsError::Protocol(_))));
    }

    #[test]
    fn get_block_round_trip() {
        let msg = GetBlock {
            bnr: 0x0102_0304_0506_0708,
            access: BLOCK_ACCESS_READ,
        };
        let decoded = GetBlock::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        // bnr is little-endian on the wire.
        assert_eq!(msg.encode()[..8], [8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn result_round_trips() {
        let gbr = GetBlockResult {
            bnr: 77,
            access: BLOCK_ACCESS_WRITE,
            err: MSG_ERR_EIO,
        };
        assert_eq!(GetBlockResult::decode(&gbr.encode()).unwrap(), gbr);

        let wb = WriteBlock { bnr: 12 };
        assert_eq!(WriteBlock::decode(&wb.encode()).unwrap(), wb);

        let wbr = WriteBlockResult { bnr: 12, err: MSG_ERR_OK };
        assert_eq!(WriteBlockResult::decode(&wbr.encode()).unwrap(), wbr);

        let gm = GetManifest { seq_nr: 41 };
        assert_eq!(GetManifest::decode(&gm.encode()).unwrap(), gm);

        let gmr = GetManifestResult { seq_nr: 42, err: MSG_ERR_OK };
        assert_eq!(GetManifestResult::decode(&gmr.encode()).unwrap(), gmr);
    }

    #[test]
    fn short_ctl_is_rejected() {
        assert!(GetBlock::decode(&[0_u8; 8]).is_err());
        assert!(WriteBlock::decode(&[0_u8; 16]).is_err());
        assert!(GetManifestResult::decode(&[]).is_err());
    }

    #[test]
    fn wire_error_mapping() {
        assert_eq!(err_to_wire(0), MSG_ERR_OK);
        assert_eq!(err_to_wire(-libc::EIO), MSG_ERR_EIO);
        assert_eq!(err_to_wire(-libc::ENOMEM), MSG_ERR_ENOMEM);
        assert_eq!(err_to_wire(-libc::EINVAL), MSG_ERR_UNKNOWN);

        assert_eq!(wire_to_errno(MSG_ERR_OK), 0);
        assert_eq!(wire_to_errno(MSG_ERR_EIO), -libc::EIO);
        assert_eq!(wire_to_errno(MSG_ERR_UNKNOWN), -libc::EIO);
        assert_eq!(wire_to_errno(MSG_ERR_ENOMEM), -libc::ENOMEM);
        // Codes outside the closed set are protocol violations.
        assert_eq!(wire_to_errno(200), -libc::EPROTO);
    }
}
