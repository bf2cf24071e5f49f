//! PDU framing and the typed field codec.
//!
//! Wire layout: `service(u8) | opcode(u8) | length(u16 LE) | payload(length bytes)`.
//! Multi-byte integers are fixed little-endian (see design notes on
//! endianness — the source this was adapted from relied on host byte
//! order, which this implementation pins down for testability).

use crate::error::{DaemonError, DaemonResult};

pub const HEADER_LEN: usize = 4;

/// High bit set on an opcode marks it a notification; such opcodes must
/// never appear as a command-socket request.
pub const NOTIFICATION_BIT: u8 = 0x80;

pub fn is_notification_opcode(opcode: u8) -> bool {
    opcode & NOTIFICATION_BIT != 0
}

/// A fully framed, already-decoded protocol message.
#[derive(Debug, Clone)]
pub struct Pdu {
    pub service: u8,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Pdu {
    pub fn new(service: u8, opcode: u8, payload: Vec<u8>) -> Self {
        Pdu {
            service,
            opcode,
            payload,
        }
    }

    pub fn empty(service: u8, opcode: u8) -> Self {
        Pdu::new(service, opcode, Vec::new())
    }

    /// Single-byte error reply per the dispatch contract: same service,
    /// opcode `0x00`, payload = status byte.
    pub fn error_reply(service: u8, status: crate::error::Status) -> Self {
        Pdu::new(service, 0x00, vec![status.as_u8()])
    }

    pub fn reader(&self) -> PduReader<'_> {
        PduReader::new(&self.payload)
    }

    /// Serialize header + payload into a single contiguous buffer, as the
    /// write buffer expects to hand a single `sendmsg` iovec.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.service);
        buf.push(self.opcode);
        buf.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse the 4-byte header out of a buffer that has at least
    /// [`HEADER_LEN`] bytes available.
    pub fn decode_header(bytes: &[u8]) -> (u8, u8, u16) {
        debug_assert!(bytes.len() >= HEADER_LEN);
        let service = bytes[0];
        let opcode = bytes[1];
        let length = u16::from_le_bytes([bytes[2], bytes[3]]);
        (service, opcode, length)
    }

    /// Parse a full PDU (header + payload) out of an exactly-sized slice.
    pub fn decode(bytes: &[u8]) -> DaemonResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(DaemonError::Malformed("buffer shorter than pdu header"));
        }
        let (service, opcode, length) = Self::decode_header(bytes);
        let payload = &bytes[HEADER_LEN..];
        if payload.len() != length as usize {
            return Err(DaemonError::Malformed("declared length does not match payload"));
        }
        Ok(Pdu::new(service, opcode, payload.to_vec()))
    }
}

/// Bounds-checked cursor over a PDU's payload bytes.
pub struct PduReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> PduReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        PduReader { bytes, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, len: usize) -> DaemonResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(DaemonError::Malformed("read past end of pdu"));
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> DaemonResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> DaemonResult<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_u16(&mut self) -> DaemonResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_i16(&mut self) -> DaemonResult<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> DaemonResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> DaemonResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> DaemonResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_i64(&mut self) -> DaemonResult<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_mem(&mut self, len: usize) -> DaemonResult<&'a [u8]> {
        self.take(len)
    }

    pub fn read_bdaddr(&mut self) -> DaemonResult<BdAddr> {
        let b = self.take(6)?;
        let mut addr = [0u8; 6];
        addr.copy_from_slice(b);
        Ok(BdAddr(addr))
    }

    pub fn read_uuid(&mut self) -> DaemonResult<Uuid> {
        let b = self.take(16)?;
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(b);
        Ok(Uuid(uuid))
    }

    pub fn read_bdname(&mut self) -> DaemonResult<BdName> {
        let b = self.take(BdName::WIRE_LEN)?;
        Ok(BdName::from_padded(b))
    }

    pub fn read_pincode(&mut self) -> DaemonResult<PinCode> {
        let b = self.take(16)?;
        let mut pin = [0u8; 16];
        pin.copy_from_slice(b);
        Ok(PinCode(pin))
    }

    pub fn read_property(&mut self) -> DaemonResult<Property> {
        let prop_type = self.read_u8()?;
        let len = self.read_u16()? as usize;
        let value = self.read_mem(len)?.to_vec();
        Ok(Property { prop_type, value })
    }

    pub fn read_property_list(&mut self) -> DaemonResult<Vec<Property>> {
        let count = self.read_u8()?;
        (0..count).map(|_| self.read_property()).collect()
    }
}

/// Append-only byte builder used when constructing response and
/// notification payloads. Unlike `PduReader` there is no fixed capacity to
/// overflow against in this implementation: outbound payloads are built to
/// exactly the size they need, matching the "Append" write variant from the
/// wire design rather than the bounds-checked in-place `Write`.
#[derive(Debug, Default)]
pub struct PduWriter {
    buf: Vec<u8>,
}

impl PduWriter {
    pub fn new() -> Self {
        PduWriter { buf: Vec::new() }
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.buf
    }

    pub fn append_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn append_i8(&mut self, v: i8) -> &mut Self {
        self.buf.push(v as u8);
        self
    }

    pub fn append_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn append_i16(&mut self, v: i16) -> &mut Self {
        self.append_u16(v as u16)
    }

    pub fn append_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn append_i32(&mut self, v: i32) -> &mut Self {
        self.append_u32(v as u32)
    }

    pub fn append_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn append_i64(&mut self, v: i64) -> &mut Self {
        self.append_u64(v as u64)
    }

    pub fn append_mem(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn append_bdaddr(&mut self, addr: &BdAddr) -> &mut Self {
        self.append_mem(&addr.0)
    }

    pub fn append_uuid(&mut self, uuid: &Uuid) -> &mut Self {
        self.append_mem(&uuid.0)
    }

    pub fn append_bdname(&mut self, name: &BdName) -> &mut Self {
        self.append_mem(&name.to_padded())
    }

    pub fn append_pincode(&mut self, pin: &PinCode) -> &mut Self {
        self.append_mem(&pin.0)
    }

    pub fn append_property(&mut self, property: &Property) -> &mut Self {
        self.append_u8(property.prop_type);
        self.append_u16(property.value.len() as u16);
        self.append_mem(&property.value)
    }

    pub fn append_property_list(&mut self, properties: &[Property]) -> &mut Self {
        self.append_u8(properties.len() as u8);
        for p in properties {
            self.append_property(p);
        }
        self
    }
}

/// 6-byte Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BdAddr(pub [u8; 6]);

/// 16-byte UUID, opaque at this layer (no textual parsing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uuid(pub [u8; 16]);

/// 16-byte PIN code buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinCode(pub [u8; 16]);

/// 256-byte zero-padded device/service name field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BdName(pub String);

impl BdName {
    pub const WIRE_LEN: usize = 256;

    pub fn from_padded(bytes: &[u8]) -> Self {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        BdName(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    pub fn to_padded(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        let bytes = self.0.as_bytes();
        let len = bytes.len().min(Self::WIRE_LEN);
        out[..len].copy_from_slice(&bytes[..len]);
        out
    }
}

/// `{type, len, value}` domain property, the unit of adapter/device state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub prop_type: u8,
    pub value: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;

    #[test]
    fn header_encode_decode_round_trips() {
        let pdu = Pdu::new(0x01, 0x81, vec![0x01]);
        let bytes = pdu.encode();
        assert_eq!(bytes, vec![0x01, 0x81, 0x01, 0x00, 0x01]);
        let decoded = Pdu::decode(&bytes).unwrap();
        assert_eq!(decoded.service, 0x01);
        assert_eq!(decoded.opcode, 0x81);
        assert_eq!(decoded.payload, vec![0x01]);
    }

    #[test]
    fn scenario_register_core_reply() {
        // 00 01 00 00 — Core, REGISTER_MODULE, len=0
        let pdu = Pdu::empty(0x00, 0x01);
        assert_eq!(pdu.encode(), vec![0x00, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn scenario_unsupported_error_reply() {
        // 7F 00 01 00 06 — Unsupported
        let pdu = Pdu::error_reply(0x7F, Status::Unsupported);
        assert_eq!(pdu.encode(), vec![0x7F, 0x00, 0x01, 0x00, 0x06]);
    }

    #[test]
    fn scenario_adapter_state_notification() {
        // 01 81 01 00 01
        let mut w = PduWriter::new();
        w.append_u8(1);
        let pdu = Pdu::new(0x01, 0x81, w.into_payload());
        assert_eq!(pdu.encode(), vec![0x01, 0x81, 0x01, 0x00, 0x01]);
    }

    #[test]
    fn reader_rejects_reads_past_payload_end() {
        let pdu = Pdu::new(0x00, 0x00, vec![0x01]);
        let mut r = pdu.reader();
        assert!(r.read_u16().is_err());
    }

    #[test]
    fn bdaddr_round_trips() {
        let addr = BdAddr([1, 2, 3, 4, 5, 6]);
        let mut w = PduWriter::new();
        w.append_bdaddr(&addr);
        let payload = w.into_payload();
        let mut r = PduReader::new(&payload);
        assert_eq!(r.read_bdaddr().unwrap(), addr);
    }

    #[test]
    fn bdname_pads_and_truncates_at_nul() {
        let name = BdName("pixel".to_string());
        let padded = name.to_padded();
        assert_eq!(padded.len(), 256);
        let parsed = BdName::from_padded(&padded);
        assert_eq!(parsed.0, "pixel");
    }

    #[test]
    fn property_list_round_trips() {
        let props = vec![
            Property {
                prop_type: 1,
                value: vec![0xAA],
            },
            Property {
                prop_type: 2,
                value: vec![0xBB, 0xCC],
            },
        ];
        let mut w = PduWriter::new();
        w.append_property_list(&props);
        let payload = w.into_payload();
        let mut r = PduReader::new(&payload);
        let parsed = r.read_property_list().unwrap();
        assert_eq!(parsed, props);
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let bytes = vec![0x00, 0x00, 0x05, 0x00, 0x01];
        assert!(Pdu::decode(&bytes).is_err());
    }
}
