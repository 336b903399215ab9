//! NVMe/TCP PDU encoding for the discovery responder.
//!
//! Little-endian structures, encoded and parsed explicitly. Only the
//! subset a discovery controller needs exists here: the ICReq/ICResp
//! exchange, command capsules, response capsules and C2H data.

use bytes::{Buf, BufMut, BytesMut};

/// PDU types.
pub mod pdu_type {
    /// Initialize Connection Request.
    pub const ICREQ: u8 = 0x00;
    /// Initialize Connection Response.
    pub const ICRESP: u8 = 0x01;
    /// Host-to-controller command capsule.
    pub const CAPSULE_CMD: u8 = 0x04;
    /// Controller-to-host response capsule.
    pub const CAPSULE_RESP: u8 = 0x05;
    /// Controller-to-host data.
    pub const C2H_DATA: u8 = 0x07;
}

/// Admin and fabric opcodes the responder understands.
pub mod opcode {
    /// Get Log Page.
    pub const GET_LOG_PAGE: u8 = 0x02;
    /// Identify.
    pub const IDENTIFY: u8 = 0x06;
    /// Set Features.
    pub const SET_FEATURES: u8 = 0x09;
    /// Get Features.
    pub const GET_FEATURES: u8 = 0x0a;
    /// Keep Alive.
    pub const KEEP_ALIVE: u8 = 0x18;
    /// Fabric command; the fctype selects the operation.
    pub const FABRIC: u8 = 0x7f;
}

/// Fabric command types.
pub mod fctype {
    /// Property Set.
    pub const PROPERTY_SET: u8 = 0x00;
    /// Connect.
    pub const CONNECT: u8 = 0x01;
    /// Property Get.
    pub const PROPERTY_GET: u8 = 0x04;
}

/// Discovery log page identifier.
pub const LOG_PAGE_DISCOVERY: u8 = 0x70;

/// Size of one discovery log entry.
pub const DISCOVERY_LOG_ENTRY_LEN: usize = 1024;

/// Size of the discovery log header.
pub const DISCOVERY_LOG_HEADER_LEN: usize = 1024;

/// Length of the common PDU header.
pub const CH_LEN: usize = 8;

/// Length of a submission queue entry.
pub const SQE_LEN: usize = 64;

/// Common PDU header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduHeader {
    /// PDU type.
    pub pdu_type: u8,
    /// Flags.
    pub flags: u8,
    /// Header length.
    pub header_length: u8,
    /// PDU data offset.
    pub data_offset: u8,
    /// Total PDU length, header included.
    pub packet_length: u32,
}

impl PduHeader {
    /// Parses the 8-byte common header.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < CH_LEN {
            return None;
        }
        let mut cursor = buf;
        Some(Self {
            pdu_type: cursor.get_u8(),
            flags: cursor.get_u8(),
            header_length: cursor.get_u8(),
            data_offset: cursor.get_u8(),
            packet_length: cursor.get_u32_le(),
        })
    }

    /// Writes the 8-byte common header.
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.pdu_type);
        buf.put_u8(self.flags);
        buf.put_u8(self.header_length);
        buf.put_u8(self.data_offset);
        buf.put_u32_le(self.packet_length);
    }
}

/// A parsed submission queue entry (the fields the responder reads).
#[derive(Debug, Clone)]
pub struct Sqe {
    /// Opcode.
    pub opcode: u8,
    /// Command id.
    pub cid: u16,
    /// Fabric command type (byte 4), meaningful when `opcode == FABRIC`.
    pub fctype: u8,
    /// Raw entry for command-specific fields.
    pub raw: [u8; SQE_LEN],
}

impl Sqe {
    /// Parses a 64-byte SQE.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < SQE_LEN {
            return None;
        }
        let mut raw = [0u8; SQE_LEN];
        raw.copy_from_slice(&buf[..SQE_LEN]);
        Some(Self {
            opcode: raw[0],
            cid: u16::from_le_bytes([raw[2], raw[3]]),
            fctype: raw[4],
            raw,
        })
    }

    /// Command dword 10 (bytes 40..44).
    #[must_use]
    pub fn cdw10(&self) -> u32 {
        u32::from_le_bytes([self.raw[40], self.raw[41], self.raw[42], self.raw[43]])
    }

    /// Command dword 11 (bytes 44..48).
    #[must_use]
    pub fn cdw11(&self) -> u32 {
        u32::from_le_bytes([self.raw[44], self.raw[45], self.raw[46], self.raw[47]])
    }

    /// Log/property offset from dwords 12..14 (bytes 48..56).
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from_le_bytes([
            self.raw[48], self.raw[49], self.raw[50], self.raw[51],
            self.raw[52], self.raw[53], self.raw[54], self.raw[55],
        ])
    }
}

/// Builds the ICResp PDU (128 bytes).
#[must_use]
pub fn icresp() -> BytesMut {
    let mut buf = BytesMut::with_capacity(128);
    PduHeader {
        pdu_type: pdu_type::ICRESP,
        flags: 0,
        header_length: 128,
        data_offset: 0,
        packet_length: 128,
    }
    .write(&mut buf);
    buf.put_u16_le(0); // pfv
    buf.put_u8(0); // cpda
    buf.put_u8(0); // digest
    buf.put_u32_le(128 * 1024); // maxh2cdata
    buf.resize(128, 0);
    buf
}

/// Builds a response capsule carrying a CQE whose first 8 bytes are
/// `value` (used for Connect, Property Get and generic completions).
#[must_use]
pub fn capsule_resp(cid: u16, value: u64, status: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(24);
    PduHeader {
        pdu_type: pdu_type::CAPSULE_RESP,
        flags: 0,
        header_length: 24,
        data_offset: 0,
        packet_length: 24,
    }
    .write(&mut buf);
    buf.put_u64_le(value); // dw0 + dw1
    buf.put_u16_le(0); // sqhd
    buf.put_u16_le(0); // sqid
    buf.put_u16_le(cid);
    buf.put_u16_le(status << 1); // phase bit clear, status in bits 1..
    buf
}

/// Builds a C2H data PDU carrying `data` for command `cid`.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // discovery payloads are tiny
pub fn c2h_data(cid: u16, data: &[u8]) -> BytesMut {
    let header_len = CH_LEN + 16;
    let total = header_len + data.len();
    let mut buf = BytesMut::with_capacity(total);
    PduHeader {
        pdu_type: pdu_type::C2H_DATA,
        flags: 0x0c, // LAST_PDU | SUCCESS
        header_length: 24,
        data_offset: header_len as u8,
        packet_length: total as u32,
    }
    .write(&mut buf);
    buf.put_u16_le(cid); // cccid
    buf.put_u16_le(0); // ttag
    buf.put_u32_le(0); // datao
    buf.put_u32_le(data.len() as u32); // datal
    buf.put_u32_le(0); // reserved
    buf.extend_from_slice(data);
    buf
}

/// Writes a fixed-width ASCII field, space-padded as NVMe requires.
pub fn put_ascii_field(buf: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
    for slot in buf.iter_mut().skip(n) {
        *slot = b' ';
    }
}

/// Writes a NUL-padded NQN field.
pub fn put_nqn_field(buf: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
    for slot in buf.iter_mut().skip(n) {
        *slot = 0;
    }
}
